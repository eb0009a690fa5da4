// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Commit pipeline: gate, publish, and the ordered hardware sequence.
//!
//! At most one transaction is past the gate at any time. Everything before
//! the publish step can fail and leaves the published state untouched;
//! everything after it runs to completion, either on the caller's task or on
//! a spawned one for non-blocking commits. The gate permit is released only
//! after the last hardware step, so publish order equals gate order and the
//! hardware never sees two transactions interleaved.

use std::sync::atomic::Ordering;
use std::sync::{Arc, PoisonError};

use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::channels::HvsChannel;
use crate::check;
use crate::config::KmsConfig;
use crate::ctm::CtmRegisters;
use crate::device::Shared;
use crate::error::KmsError;
use crate::hw::{HardwareBackend, PlaneUpdate};
use crate::ident::{OutputId, PlaneId, TxId};
use crate::muxing::{mux_writes, MuxWrite};
use crate::state::{AtomicState, CommitPhase, ModeObjects, PlaneState};
use crate::sync::{CommitPermit, Fence, Interrupt};

/// Completion handle of a committed transaction.
///
/// Blocking commits return an already completed handle. Dropping the handle
/// of a non-blocking commit does not cancel it.
#[derive(Debug)]
#[must_use = "a non-blocking commit only reports failures through its handle"]
pub struct CommitHandle {
    tx: TxId,
    task: Option<JoinHandle<Result<(), KmsError>>>,
}

impl CommitHandle {
    /// Transaction this handle tracks.
    pub fn tx(&self) -> TxId {
        self.tx
    }

    /// Returns `true` once the hardware sequence has finished.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Waits for the hardware sequence to finish.
    ///
    /// # Errors
    /// [`KmsError::FatalInconsistency`] if the background sequence failed.
    pub async fn wait(self) -> Result<(), KmsError> {
        match self.task {
            None => Ok(()),
            Some(task) => task
                .await
                .map_err(|_| KmsError::FatalInconsistency("background commit task aborted"))?,
        }
    }
}

fn plane_update(plane: PlaneId, state: &PlaneState) -> PlaneUpdate {
    PlaneUpdate {
        plane,
        output: state.output,
        fb: state.fb,
    }
}

/// Everything the hardware sequence needs, captured before publishing.
#[derive(Debug, Default)]
struct HardwarePlan {
    underrun_channels: Vec<HvsChannel>,
    boost_clock_hz: Option<u64>,
    final_clock_hz: Option<u64>,
    fences: Vec<Fence>,
    disables: Vec<OutputId>,
    ctm: Option<CtmRegisters>,
    mux: Vec<MuxWrite>,
    new_planes: Vec<PlaneUpdate>,
    old_planes: Vec<PlaneUpdate>,
    enables: Vec<(OutputId, Option<HvsChannel>)>,
    fake_vblanks: Vec<OutputId>,
}

impl HardwarePlan {
    fn new(config: &KmsConfig, state: &AtomicState) -> Self {
        let mut plan = Self::default();

        for (id, old, new) in state.outputs() {
            if !config.firmware_kms {
                plan.underrun_channels.extend(new.assigned_channel());
            }
            if old.active && !new.active {
                plan.disables.push(id);
            }
            if !old.active && new.active {
                plan.enables.push((id, new.assigned_channel()));
            }
            let has_vblank = config
                .outputs
                .get(id.index())
                .is_none_or(|desc| desc.has_vblank);
            if new.active && !has_vblank {
                plan.fake_vblanks.push(id);
            }
        }

        for (id, old, new) in state.planes() {
            plan.old_planes.push(plane_update(id, old));
            plan.new_planes.push(plane_update(id, new));
            plan.fences.extend(new.fence.clone());
        }

        if !config.firmware_kms {
            plan.ctm = state.new_ctm_state().map(CtmRegisters::from_state);
        }
        plan.mux = mux_writes(config, state);

        if config.manages_core_clock() {
            let old_rate = state.objects.hvs.current().core_clock_rate;
            let new_rate = state
                .new_hvs_state()
                .map_or(old_rate, |hvs| hvs.core_clock_rate);
            if new_rate > old_rate {
                plan.boost_clock_hz = Some(config.min_boost_clock_hz.max(new_rate));
            }
            plan.final_clock_hz = Some(new_rate);
        }

        plan
    }
}

async fn wait_fences(fences: &[Fence]) {
    for fence in fences {
        fence.wait().await;
    }
}

fn publish_all(objects: &ModeObjects, state: &mut AtomicState) -> Result<(), KmsError> {
    for (id, private) in std::mem::take(&mut state.outputs) {
        objects.output(id)?.publish(private)?;
    }
    for (id, private) in std::mem::take(&mut state.planes) {
        objects.plane(id)?.publish(private)?;
    }
    if let Some(private) = state.hvs.take() {
        objects.hvs.publish(private)?;
    }
    if let Some(private) = state.ctm.take() {
        objects.ctm.publish(private)?;
    }
    if let Some(private) = state.load.take() {
        objects.load.publish(private)?;
    }
    Ok(())
}

/// Publishes every private copy of `state`. Past the point of no return, so
/// any failure is fatal.
fn swap_state(objects: &ModeObjects, state: &mut AtomicState) -> Result<(), KmsError> {
    publish_all(objects, state).map_err(|err| {
        error!(%err, "publishing transaction state failed");
        match err {
            KmsError::FatalInconsistency(_) => err,
            _ => KmsError::FatalInconsistency("publish failed past the point of no return"),
        }
    })
}

/// Steps 1 to 14 of the hardware sequence, then the gate release.
async fn complete_commit<B: HardwareBackend>(
    shared: &Shared<B>,
    state: &mut AtomicState,
    plan: HardwarePlan,
    permit: CommitPermit,
) -> Result<(), KmsError> {
    let backend = &shared.backend;
    let tx = state.tx;

    for channel in &plan.underrun_channels {
        backend.mask_underrun(*channel);
    }

    let boost = plan.boost_clock_hz.map(|rate| {
        debug!(%tx, rate, "raising the core clock for the modeset");
        backend.request_core_clock(rate)
    });

    wait_fences(&plan.fences).await;

    for output in &plan.disables {
        backend.disable_output(*output);
    }
    if let Some(registers) = &plan.ctm {
        backend.write_ctm(registers);
    }
    for write in &plan.mux {
        backend.write_mux(*write);
    }
    backend.commit_planes(tx, &plan.new_planes);
    for (output, channel) in &plan.enables {
        backend.enable_output(*output, *channel);
    }
    for output in &plan.fake_vblanks {
        backend.fake_vblank(*output);
    }
    backend.hw_done(tx);
    backend.wait_flip_done(tx);

    state.advance(CommitPhase::Cleanup)?;
    backend.cleanup_planes(tx, &plan.old_planes);
    backend.cleanup_done(tx);

    if let Some(rate) = plan.final_clock_hz {
        debug!(%tx, rate, "running the core clock");
        let request = backend.request_core_clock(rate);
        let previous = shared
            .core_req
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(request);
        if let Some(previous) = previous {
            backend.release_core_clock(previous);
        }
    }
    if let Some(boost) = boost {
        backend.release_core_clock(boost);
    }

    state.advance(CommitPhase::Idle)?;
    info!(%tx, "commit complete");
    drop(permit);
    Ok(())
}

/// Takes the commit gate for `state` and brings it up to date.
///
/// Output and plane copies taken from a version that has since been replaced
/// make the transaction stale. If only the channel pool, CTM or load tracker
/// moved, the derived state is rebuilt on top of the published versions.
#[instrument(skip_all, fields(tx = %state.tx))]
pub(crate) async fn acquire_gate<B: HardwareBackend>(
    shared: &Shared<B>,
    state: &mut AtomicState,
    interrupt: &Interrupt,
) -> Result<CommitPermit, KmsError> {
    let permit = shared.gate.acquire(interrupt).await?;
    state.advance(CommitPhase::Swapping)?;

    if !state.edits_current() {
        warn!("transaction edits superseded by another commit");
        return Err(KmsError::StaleState);
    }
    if !state.derived_current() {
        check::rebase(
            state,
            shared.generic_check.as_ref(),
            shared.load_tracker_enabled.load(Ordering::Relaxed),
        )?;
    }
    Ok(permit)
}

/// Full commit path, entered holding the gate.
#[instrument(skip(shared, state, permit, interrupt), fields(tx = %state.tx))]
pub(crate) async fn commit<B: HardwareBackend>(
    shared: Arc<Shared<B>>,
    mut state: AtomicState,
    permit: CommitPermit,
    nonblock: bool,
    interrupt: &Interrupt,
) -> Result<CommitHandle, KmsError> {
    let tx = state.tx;
    let plan = HardwarePlan::new(&shared.objects.config, &state);
    shared.backend.prepare_planes(tx, &plan.new_planes)?;

    if !nonblock {
        if let Err(err) = interrupt.run(wait_fences(&plan.fences)).await {
            shared.backend.cleanup_planes(tx, &plan.new_planes);
            return Err(err);
        }
    }

    swap_state(&shared.objects, &mut state)?;
    state.advance(CommitPhase::ApplyingHardware)?;
    debug!("transaction published");

    if nonblock {
        let task = tokio::spawn(async move {
            let result = complete_commit(&shared, &mut state, plan, permit).await;
            if let Err(err) = &result {
                error!(%tx, %err, "background commit failed");
            }
            result
        });
        return Ok(CommitHandle {
            tx,
            task: Some(task),
        });
    }

    complete_commit(&shared, &mut state, plan, permit).await?;
    Ok(CommitHandle { tx, task: None })
}

/// Async-update fast path, entered holding the gate: planes only, no
/// modeset sequence.
#[instrument(skip_all, fields(tx = %state.tx))]
pub(crate) fn commit_async_update<B: HardwareBackend>(
    shared: &Shared<B>,
    mut state: AtomicState,
    permit: CommitPermit,
) -> Result<CommitHandle, KmsError> {
    let tx = state.tx;
    let (old_planes, new_planes): (Vec<_>, Vec<_>) = state
        .planes()
        .map(|(id, old, new)| (plane_update(id, old), plane_update(id, new)))
        .unzip();
    shared.backend.prepare_planes(tx, &new_planes)?;
    shared.backend.async_commit_planes(tx, &new_planes);
    swap_state(&shared.objects, &mut state)?;

    state.advance(CommitPhase::Cleanup)?;
    shared.backend.cleanup_planes(tx, &old_planes);
    state.advance(CommitPhase::Idle)?;
    debug!("async update complete");
    drop(permit);
    Ok(CommitHandle { tx, task: None })
}
