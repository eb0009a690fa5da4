// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Mode-object states and the transaction that carries their private copies.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::channels::{HvsChannel, HvsState};
use crate::config::{KmsConfig, OutputDesc};
use crate::ctm::{ColorMatrix, CtmState};
use crate::error::{InvalidConfig, KmsError};
use crate::ident::{FramebufferId, OutputId, PlaneId, TxId};
use crate::load_tracker::LoadTrackerState;
use crate::private_obj::{PrivateObj, PrivateState};
use crate::sync::Fence;

/// Active display timing, reduced to what the checks need.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DisplayMode {
    /// Horizontal active pixels.
    pub width: u32,
    /// Vertical active lines.
    pub height: u32,
}

/// Per-output state.
///
/// Clients edit the public fields; the channel assignment and mux flag are
/// owned by the checks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputState {
    /// Output requested enabled (resources reserved).
    pub enable: bool,
    /// Output requested scanning out.
    pub active: bool,
    /// Display mode, if any.
    pub mode: Option<DisplayMode>,
    /// Colour transform, if any.
    pub ctm: Option<ColorMatrix>,
    /// Contribution to the HVS FIFO load while active.
    pub hvs_load: u64,
    pub(crate) assigned_channel: Option<HvsChannel>,
    pub(crate) update_muxing: bool,
}

impl OutputState {
    /// Channel feeding this output, `None` while disabled.
    #[must_use]
    pub fn assigned_channel(&self) -> Option<HvsChannel> {
        self.assigned_channel
    }

    /// Whether this transaction must reprogram the output's mux.
    #[must_use]
    pub fn update_muxing(&self) -> bool {
        self.update_muxing
    }
}

/// Per-plane state.
#[derive(Debug, Clone, Default)]
pub struct PlaneState {
    /// Output the plane scans out on.
    pub output: Option<OutputId>,
    /// Framebuffer shown by the plane.
    pub fb: Option<FramebufferId>,
    /// Source width in pixels.
    pub src_width: u32,
    /// Source height in pixels.
    pub src_height: u32,
    /// Memory-bus load while active, in bytes per second.
    pub membus_load: u64,
    /// HVS load while active, in cycles per second.
    pub hvs_load: u64,
    /// Dependency that must signal before the framebuffer is scanned out.
    pub fence: Option<Fence>,
}

impl PlaneState {
    /// A plane with both a framebuffer and an output contributes load.
    #[must_use]
    pub fn is_active_surface(&self) -> bool {
        self.fb.is_some() && self.output.is_some()
    }
}

/// Phases a transaction goes through.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CommitPhase {
    /// Being built by the client.
    #[default]
    Idle,
    /// Running or passed the atomic check.
    Validating,
    /// Holds the commit gate and is publishing its state.
    Swapping,
    /// Past the point of no return, programming hardware.
    ApplyingHardware,
    /// Releasing stale resources before the gate is dropped.
    Cleanup,
}

impl CommitPhase {
    /// Whether `self -> next` is a legal step.
    ///
    /// `Swapping -> Cleanup` is the async-update fast path, which skips the
    /// full hardware sequence.
    #[must_use]
    pub const fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle | Self::Validating, Self::Validating)
                | (Self::Validating, Self::Swapping)
                | (Self::Swapping, Self::ApplyingHardware | Self::Cleanup)
                | (Self::ApplyingHardware, Self::Cleanup)
                | (Self::Cleanup, Self::Idle)
        )
    }
}

impl core::fmt::Display for CommitPhase {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Validating => "validating",
            Self::Swapping => "swapping",
            Self::ApplyingHardware => "applying-hardware",
            Self::Cleanup => "cleanup",
        };
        f.write_str(name)
    }
}

/// Every versioned object of a device.
#[derive(Debug)]
pub(crate) struct ModeObjects {
    pub(crate) config: KmsConfig,
    pub(crate) hvs: PrivateObj<HvsState>,
    pub(crate) ctm: PrivateObj<CtmState>,
    pub(crate) load: PrivateObj<LoadTrackerState>,
    pub(crate) outputs: Vec<PrivateObj<OutputState>>,
    pub(crate) planes: Vec<PrivateObj<PlaneState>>,
}

impl ModeObjects {
    pub(crate) fn new(config: KmsConfig) -> Self {
        let outputs = config
            .outputs
            .iter()
            .map(|_| PrivateObj::new("output", OutputState::default()))
            .collect();
        let planes = (0..config.num_planes)
            .map(|_| PrivateObj::new("plane", PlaneState::default()))
            .collect();
        Self {
            hvs: PrivateObj::new("hvs-channels", HvsState::new(config.num_channels)),
            ctm: PrivateObj::new("ctm", CtmState::default()),
            load: PrivateObj::new("load-tracker", LoadTrackerState::default()),
            outputs,
            planes,
            config,
        }
    }

    pub(crate) fn output_desc(&self, id: OutputId) -> Result<&OutputDesc, KmsError> {
        self.config
            .outputs
            .get(id.index())
            .ok_or_else(|| InvalidConfig::UnknownOutput(id).into())
    }

    pub(crate) fn output(&self, id: OutputId) -> Result<&PrivateObj<OutputState>, KmsError> {
        self.outputs
            .get(id.index())
            .ok_or_else(|| InvalidConfig::UnknownOutput(id).into())
    }

    pub(crate) fn plane(&self, id: PlaneId) -> Result<&PrivateObj<PlaneState>, KmsError> {
        self.planes
            .get(id.index())
            .ok_or_else(|| InvalidConfig::UnknownPlane(id).into())
    }
}

/// A proposed configuration change.
///
/// Holds private copies of every object it touches. Dropping it aborts the
/// transaction without side effects.
#[derive(Debug)]
pub struct AtomicState {
    pub(crate) tx: TxId,
    pub(crate) objects: Arc<ModeObjects>,
    pub(crate) outputs: BTreeMap<OutputId, PrivateState<OutputState>>,
    pub(crate) planes: BTreeMap<PlaneId, PrivateState<PlaneState>>,
    pub(crate) hvs: Option<PrivateState<HvsState>>,
    pub(crate) ctm: Option<PrivateState<CtmState>>,
    pub(crate) load: Option<PrivateState<LoadTrackerState>>,
    pub(crate) async_update: bool,
    pub(crate) phase: CommitPhase,
    pub(crate) checked: bool,
}

impl AtomicState {
    pub(crate) fn new(tx: TxId, objects: Arc<ModeObjects>) -> Self {
        Self {
            tx,
            objects,
            outputs: BTreeMap::new(),
            planes: BTreeMap::new(),
            hvs: None,
            ctm: None,
            load: None,
            async_update: false,
            phase: CommitPhase::Idle,
            checked: false,
        }
    }

    /// Transaction identifier.
    #[must_use]
    pub fn tx(&self) -> TxId {
        self.tx
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> CommitPhase {
        self.phase
    }

    /// Pulls `id` into the transaction and returns its new state for editing.
    ///
    /// # Errors
    /// [`InvalidConfig::UnknownOutput`] if the device has no such output.
    pub fn output_state(&mut self, id: OutputId) -> Result<&mut OutputState, KmsError> {
        let obj = self.objects.output(id)?;
        self.checked = false;
        let entry = self.outputs.entry(id).or_insert_with(|| {
            let mut private = obj.duplicate();
            private.new_mut().update_muxing = false;
            private
        });
        Ok(entry.new_mut())
    }

    /// Pulls `id` into the transaction and returns its new state for editing.
    ///
    /// # Errors
    /// [`InvalidConfig::UnknownPlane`] if the device has no such plane.
    pub fn plane_state(&mut self, id: PlaneId) -> Result<&mut PlaneState, KmsError> {
        let obj = self.objects.plane(id)?;
        self.checked = false;
        let entry = self.planes.entry(id).or_insert_with(|| {
            let mut private = obj.duplicate();
            private.new_mut().fence = None;
            private
        });
        Ok(entry.new_mut())
    }

    /// Flags the transaction as a minimal update (e.g. cursor move) that may
    /// bypass the full commit sequence.
    pub fn set_async_update(&mut self, async_update: bool) {
        self.checked = false;
        self.async_update = async_update;
    }

    /// Whether the transaction will take the async-update fast path.
    ///
    /// The atomic check clears the flag when the transaction is not eligible.
    #[must_use]
    pub fn async_update(&self) -> bool {
        self.async_update
    }

    /// Old and new state of every output in the transaction, in id order.
    pub fn outputs(&self) -> impl Iterator<Item = (OutputId, &OutputState, &OutputState)> {
        self.outputs
            .iter()
            .map(|(id, p)| (*id, p.old(), p.new_state()))
    }

    /// Old and new state of every plane in the transaction, in id order.
    pub fn planes(&self) -> impl Iterator<Item = (PlaneId, &PlaneState, &PlaneState)> {
        self.planes
            .iter()
            .map(|(id, p)| (*id, p.old(), p.new_state()))
    }

    /// New state of `id`, if it is part of the transaction.
    #[must_use]
    pub fn new_output_state(&self, id: OutputId) -> Option<&OutputState> {
        self.outputs.get(&id).map(PrivateState::new_state)
    }

    /// Channel pool state this transaction will publish, if it touched it.
    #[must_use]
    pub fn new_hvs_state(&self) -> Option<&HvsState> {
        self.hvs.as_ref().map(PrivateState::new_state)
    }

    /// CTM state this transaction will publish, if it touched it.
    #[must_use]
    pub fn new_ctm_state(&self) -> Option<&CtmState> {
        self.ctm.as_ref().map(PrivateState::new_state)
    }

    /// Load tracker state this transaction will publish, if it touched it.
    #[must_use]
    pub fn new_load_tracker_state(&self) -> Option<&LoadTrackerState> {
        self.load.as_ref().map(PrivateState::new_state)
    }

    pub(crate) fn advance(&mut self, next: CommitPhase) -> Result<(), KmsError> {
        if !self.phase.can_advance_to(next) {
            return Err(KmsError::PhaseOrder {
                tx: self.tx,
                from: self.phase,
                to: next,
            });
        }
        self.phase = next;
        Ok(())
    }

    /// Returns `true` if the output and plane copies the client edited were
    /// taken from the published versions.
    pub(crate) fn edits_current(&self) -> bool {
        let objects = &self.objects;
        self.outputs.iter().all(|(id, p)| {
            objects
                .outputs
                .get(id.index())
                .is_some_and(|obj| obj.is_current(p))
        }) && self.planes.iter().all(|(id, p)| {
            objects
                .planes
                .get(id.index())
                .is_some_and(|obj| obj.is_current(p))
        })
    }

    /// Returns `true` if the channel pool, CTM and load tracker copies derived
    /// by the check were taken from the published versions.
    pub(crate) fn derived_current(&self) -> bool {
        let objects = &self.objects;
        self.hvs.as_ref().is_none_or(|p| objects.hvs.is_current(p))
            && self.ctm.as_ref().is_none_or(|p| objects.ctm.is_current(p))
            && self.load.as_ref().is_none_or(|p| objects.load.is_current(p))
    }
}
