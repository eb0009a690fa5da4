// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Device handle: owns the versioned objects, the commit gate and the backend.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{info, instrument, warn};

use crate::channels::HvsState;
use crate::check::{self, GenericCheck, ModeConfigCheck};
use crate::commit::{self, CommitHandle};
use crate::config::{ConfigError, KmsConfig};
use crate::ctm::CtmState;
use crate::error::KmsError;
use crate::hw::{ClockRequestId, HardwareBackend};
use crate::ident::{OutputId, PlaneId, TxId};
use crate::load_tracker::LoadTrackerState;
use crate::state::{AtomicState, ModeObjects, OutputState, PlaneState};
use crate::sync::{CommitGate, Interrupt};

/// State shared between the device handle and background commits.
pub(crate) struct Shared<B> {
    pub(crate) objects: Arc<ModeObjects>,
    pub(crate) backend: B,
    pub(crate) gate: CommitGate,
    pub(crate) generic_check: Box<dyn GenericCheck>,
    pub(crate) load_tracker_enabled: AtomicBool,
    pub(crate) next_tx: AtomicU64,
    /// Core clock request backing the published configuration.
    pub(crate) core_req: Mutex<Option<ClockRequestId>>,
}

/// A display controller instance.
///
/// Cheap to clone; clones share the same objects and gate.
pub struct Device<B> {
    shared: Arc<Shared<B>>,
}

impl<B> Clone for Device<B> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<B: core::fmt::Debug> core::fmt::Debug for Device<B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Device")
            .field("backend", &self.shared.backend)
            .field("generation", &self.shared.objects.config.generation)
            .field(
                "load_tracker_enabled",
                &self.shared.load_tracker_enabled.load(Ordering::Relaxed),
            )
            .finish_non_exhaustive()
    }
}

impl<B: HardwareBackend> Device<B> {
    /// Registers the channel pool, colour-matrix unit and load tracker, plus
    /// one object per output and plane, using [`ModeConfigCheck`].
    ///
    /// # Errors
    /// [`ConfigError::Invalid`] if `config` fails validation.
    pub fn new(config: KmsConfig, backend: B) -> Result<Self, ConfigError> {
        Self::with_generic_check(config, backend, ModeConfigCheck)
    }

    /// Like [`Device::new`] with a custom mode-level check.
    ///
    /// # Errors
    /// [`ConfigError::Invalid`] if `config` fails validation.
    #[instrument(skip_all, fields(generation = ?config.generation))]
    pub fn with_generic_check(
        config: KmsConfig,
        backend: B,
        generic_check: impl GenericCheck,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let load_tracker_enabled = config.load_tracker_default();
        info!(
            outputs = config.outputs.len(),
            planes = config.num_planes,
            channels = config.num_channels,
            load_tracker_enabled,
            firmware_kms = config.firmware_kms,
            "device initialized"
        );
        Ok(Self {
            shared: Arc::new(Shared {
                objects: Arc::new(ModeObjects::new(config)),
                backend,
                gate: CommitGate::new(),
                generic_check: Box::new(generic_check),
                load_tracker_enabled: AtomicBool::new(load_tracker_enabled),
                next_tx: AtomicU64::new(0),
                core_req: Mutex::new(None),
            }),
        })
    }

    /// Releases the device's resources.
    ///
    /// Later commits on any clone fail with [`KmsError::DeviceClosed`]; the
    /// published state stays readable.
    ///
    /// # Errors
    /// [`KmsError::DeviceBusy`] while a commit holds the gate.
    pub fn teardown(&self) -> Result<(), KmsError> {
        let Some(permit) = self.shared.gate.try_acquire() else {
            warn!("teardown refused: commit in flight");
            return Err(KmsError::DeviceBusy);
        };
        self.shared.gate.close();
        let request = self
            .shared
            .core_req
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(request) = request {
            self.shared.backend.release_core_clock(request);
        }
        drop(permit);
        info!("device torn down");
        Ok(())
    }

    /// Starts an empty transaction.
    pub fn begin(&self) -> AtomicState {
        let previous = self
            .shared
            .next_tx
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |raw| {
                Some(TxId::from_raw(raw).next().value())
            })
            .unwrap_or_else(|raw| raw);
        AtomicState::new(
            TxId::from_raw(previous).next(),
            Arc::clone(&self.shared.objects),
        )
    }

    fn owns(&self, state: &AtomicState) -> Result<(), KmsError> {
        if Arc::ptr_eq(&state.objects, &self.shared.objects) {
            Ok(())
        } else {
            Err(KmsError::FatalInconsistency(
                "transaction belongs to another device",
            ))
        }
    }

    /// Validates `state` and resolves the resources it needs.
    ///
    /// # Errors
    /// [`KmsError::InvalidConfiguration`] or [`KmsError::ResourceExhausted`];
    /// published state is never modified.
    #[instrument(skip_all, fields(tx = %state.tx()))]
    pub fn atomic_check(&self, state: &mut AtomicState) -> Result<(), KmsError> {
        self.owns(state)?;
        check::atomic_check(
            state,
            self.shared.generic_check.as_ref(),
            self.load_tracker_enabled(),
        )
    }

    /// Commits `state`, running the check first if it has not passed one
    /// since its last edit.
    ///
    /// With `nonblock` the hardware sequence runs on a spawned task and the
    /// returned handle tracks it; otherwise it has completed on return.
    /// Waiting for the gate and, for blocking commits, for plane fences can
    /// be cut short through `interrupt`.
    ///
    /// Transactions checked concurrently serialize at the gate. One that
    /// reaches it after another commit published only re-derives its shared
    /// resources; it is stale only if an output or plane it edited changed.
    ///
    /// # Errors
    /// Any check error, [`KmsError::Interrupted`], [`KmsError::StaleState`]
    /// (rebuild the transaction and retry), [`KmsError::PrepareFailed`],
    /// [`KmsError::DeviceClosed`].
    pub async fn atomic_commit(
        &self,
        mut state: AtomicState,
        nonblock: bool,
        interrupt: &Interrupt,
    ) -> Result<CommitHandle, KmsError> {
        self.owns(&state)?;
        if !state.checked {
            self.atomic_check(&mut state)?;
        }
        let permit = commit::acquire_gate(&self.shared, &mut state, interrupt).await?;
        if state.async_update {
            commit::commit_async_update(&self.shared, state, permit)
        } else {
            commit::commit(Arc::clone(&self.shared), state, permit, nonblock, interrupt).await
        }
    }
}

impl<B> Device<B> {
    /// Turns bandwidth enforcement on or off.
    ///
    /// Loads are tracked either way; only rejection is affected.
    pub fn set_load_tracker_enabled(&self, enabled: bool) {
        info!(enabled, "load tracker enforcement");
        self.shared
            .load_tracker_enabled
            .store(enabled, Ordering::Relaxed);
    }

    /// Whether bandwidth enforcement is on.
    pub fn load_tracker_enabled(&self) -> bool {
        self.shared.load_tracker_enabled.load(Ordering::Relaxed)
    }

    /// Device configuration.
    pub fn config(&self) -> &KmsConfig {
        &self.shared.objects.config
    }

    /// Hardware backend.
    pub fn backend(&self) -> &B {
        &self.shared.backend
    }

    /// Published channel pool state.
    pub fn current_hvs_state(&self) -> Arc<HvsState> {
        self.shared.objects.hvs.current()
    }

    /// Published colour-matrix unit state.
    pub fn current_ctm_state(&self) -> Arc<CtmState> {
        self.shared.objects.ctm.current()
    }

    /// Published load tracker state.
    pub fn current_load_tracker_state(&self) -> Arc<LoadTrackerState> {
        self.shared.objects.load.current()
    }

    /// Published state of `id`.
    ///
    /// # Errors
    /// [`crate::InvalidConfig::UnknownOutput`].
    pub fn current_output_state(&self, id: OutputId) -> Result<Arc<OutputState>, KmsError> {
        Ok(self.shared.objects.output(id)?.current())
    }

    /// Published state of `id`.
    ///
    /// # Errors
    /// [`crate::InvalidConfig::UnknownPlane`].
    pub fn current_plane_state(&self, id: PlaneId) -> Result<Arc<PlaneState>, KmsError> {
        Ok(self.shared.objects.plane(id)?.current())
    }
}
