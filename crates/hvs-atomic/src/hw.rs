// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Hardware collaborator contract.
//!
//! The commit pipeline never touches registers itself; every side effect goes
//! through a [`HardwareBackend`]. [`RecordingBackend`] keeps an ordered log of
//! the calls it receives and is what tests and the scenario replayer drive.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, trace};

use crate::channels::HvsChannel;
use crate::ctm::CtmRegisters;
use crate::ident::{FramebufferId, OutputId, PlaneId, TxId};
use crate::muxing::MuxWrite;

/// Failure reported by the buffer collaborator while preparing planes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("plane preparation failed: {0}")]
pub struct PrepareError(pub String);

/// Handle of an outstanding core clock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ClockRequestId(pub u64);

/// Plane binding handed to the buffer collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlaneUpdate {
    /// Plane being updated.
    pub plane: PlaneId,
    /// Output the plane scans out on.
    pub output: Option<OutputId>,
    /// Framebuffer shown by the plane.
    pub fb: Option<FramebufferId>,
}

/// Register-level and buffer-level side effects of a commit.
///
/// Implementations must be callable from a background task.
pub trait HardwareBackend: Send + Sync + 'static {
    /// Stops reporting FIFO underruns on `channel` while it is reconfigured.
    fn mask_underrun(&self, channel: HvsChannel);
    /// Requests a minimum core clock rate; the request holds until released.
    fn request_core_clock(&self, rate_hz: u64) -> ClockRequestId;
    /// Drops a request obtained from [`HardwareBackend::request_core_clock`].
    fn release_core_clock(&self, request: ClockRequestId);
    /// Turns an output off.
    fn disable_output(&self, output: OutputId);
    /// Turns an output on, fed by `channel`.
    fn enable_output(&self, output: OutputId, channel: Option<HvsChannel>);
    /// Programs the colour-matrix unit.
    fn write_ctm(&self, registers: &CtmRegisters);
    /// Programs one mux field.
    fn write_mux(&self, write: MuxWrite);
    /// Pins framebuffers before they are scanned out.
    ///
    /// # Errors
    /// [`PrepareError`] if a buffer cannot be made ready; nothing is pinned.
    fn prepare_planes(&self, tx: TxId, planes: &[PlaneUpdate]) -> Result<(), PrepareError>;
    /// Unpins framebuffers no longer scanned out.
    fn cleanup_planes(&self, tx: TxId, planes: &[PlaneUpdate]);
    /// Latches the new plane configuration.
    fn commit_planes(&self, tx: TxId, planes: &[PlaneUpdate]);
    /// Updates planes in place without waiting for vblank.
    fn async_commit_planes(&self, tx: TxId, planes: &[PlaneUpdate]);
    /// Signals completion for an output without a vblank interrupt.
    fn fake_vblank(&self, output: OutputId);
    /// Hardware programming of `tx` is complete.
    fn hw_done(&self, tx: TxId);
    /// Blocks until the flips of `tx` are visible.
    fn wait_flip_done(&self, tx: TxId);
    /// Post-commit hooks of `tx` have run.
    fn cleanup_done(&self, tx: TxId);
}

/// One call received by a [`RecordingBackend`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HwEvent {
    /// See [`HardwareBackend::mask_underrun`].
    MaskUnderrun {
        /// Channel masked.
        channel: HvsChannel,
    },
    /// See [`HardwareBackend::request_core_clock`].
    RequestCoreClock {
        /// Handle returned to the caller.
        id: ClockRequestId,
        /// Requested floor in Hz.
        rate_hz: u64,
    },
    /// See [`HardwareBackend::release_core_clock`].
    ReleaseCoreClock {
        /// Handle released.
        id: ClockRequestId,
    },
    /// See [`HardwareBackend::disable_output`].
    DisableOutput {
        /// Output turned off.
        output: OutputId,
    },
    /// See [`HardwareBackend::enable_output`].
    EnableOutput {
        /// Output turned on.
        output: OutputId,
        /// Channel feeding it.
        channel: Option<HvsChannel>,
    },
    /// See [`HardwareBackend::write_ctm`].
    WriteCtm {
        /// `OLEDCOEF0..2`, if written.
        coefficients: Option<[u32; 3]>,
        /// `OLEDOFFS`.
        oledoffs: u32,
    },
    /// See [`HardwareBackend::write_mux`].
    WriteMux(MuxWrite),
    /// See [`HardwareBackend::prepare_planes`].
    PreparePlanes {
        /// Transaction id.
        tx: u64,
        /// Planes prepared.
        planes: Vec<PlaneUpdate>,
    },
    /// See [`HardwareBackend::cleanup_planes`].
    CleanupPlanes {
        /// Transaction id.
        tx: u64,
        /// Planes released.
        planes: Vec<PlaneUpdate>,
    },
    /// See [`HardwareBackend::commit_planes`].
    CommitPlanes {
        /// Transaction id.
        tx: u64,
        /// Planes latched.
        planes: Vec<PlaneUpdate>,
    },
    /// See [`HardwareBackend::async_commit_planes`].
    AsyncCommitPlanes {
        /// Transaction id.
        tx: u64,
        /// Planes updated in place.
        planes: Vec<PlaneUpdate>,
    },
    /// See [`HardwareBackend::fake_vblank`].
    FakeVblank {
        /// Output without vblank support.
        output: OutputId,
    },
    /// See [`HardwareBackend::hw_done`].
    HwDone {
        /// Transaction id.
        tx: u64,
    },
    /// See [`HardwareBackend::wait_flip_done`].
    FlipDone {
        /// Transaction id.
        tx: u64,
    },
    /// See [`HardwareBackend::cleanup_done`].
    CleanupDone {
        /// Transaction id.
        tx: u64,
    },
}

impl HwEvent {
    /// Transaction the event belongs to, for events that carry one.
    #[must_use]
    pub fn tx(&self) -> Option<u64> {
        match self {
            Self::PreparePlanes { tx, .. }
            | Self::CleanupPlanes { tx, .. }
            | Self::CommitPlanes { tx, .. }
            | Self::AsyncCommitPlanes { tx, .. }
            | Self::HwDone { tx }
            | Self::FlipDone { tx }
            | Self::CleanupDone { tx } => Some(*tx),
            _ => None,
        }
    }
}

/// Backend that logs every call and keeps it in memory.
#[derive(Debug, Default)]
pub struct RecordingBackend {
    events: Mutex<Vec<HwEvent>>,
    next_clock_request: AtomicU64,
    fail_next_prepare: Mutex<Option<String>>,
}

impl RecordingBackend {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the calls received so far.
    #[must_use]
    pub fn events(&self) -> Vec<HwEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns and forgets the calls received so far.
    pub fn take_events(&self) -> Vec<HwEvent> {
        std::mem::take(&mut *self.events.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Makes the next [`HardwareBackend::prepare_planes`] call fail.
    pub fn fail_next_prepare(&self, reason: impl Into<String>) {
        *self
            .fail_next_prepare
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(reason.into());
    }

    fn record(&self, event: HwEvent) {
        trace!(?event, "hw");
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

impl HardwareBackend for RecordingBackend {
    fn mask_underrun(&self, channel: HvsChannel) {
        self.record(HwEvent::MaskUnderrun { channel });
    }

    fn request_core_clock(&self, rate_hz: u64) -> ClockRequestId {
        let id = ClockRequestId(self.next_clock_request.fetch_add(1, Ordering::Relaxed) + 1);
        debug!(id = id.0, rate_hz, "core clock request");
        self.record(HwEvent::RequestCoreClock { id, rate_hz });
        id
    }

    fn release_core_clock(&self, request: ClockRequestId) {
        debug!(id = request.0, "core clock release");
        self.record(HwEvent::ReleaseCoreClock { id: request });
    }

    fn disable_output(&self, output: OutputId) {
        info!(%output, "disable output");
        self.record(HwEvent::DisableOutput { output });
    }

    fn enable_output(&self, output: OutputId, channel: Option<HvsChannel>) {
        info!(%output, ?channel, "enable output");
        self.record(HwEvent::EnableOutput { output, channel });
    }

    fn write_ctm(&self, registers: &CtmRegisters) {
        self.record(HwEvent::WriteCtm {
            coefficients: registers.coefficients,
            oledoffs: registers.oledoffs,
        });
    }

    fn write_mux(&self, write: MuxWrite) {
        self.record(HwEvent::WriteMux(write));
    }

    fn prepare_planes(&self, tx: TxId, planes: &[PlaneUpdate]) -> Result<(), PrepareError> {
        let failure = self
            .fail_next_prepare
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reason) = failure {
            return Err(PrepareError(reason));
        }
        self.record(HwEvent::PreparePlanes {
            tx: tx.value(),
            planes: planes.to_vec(),
        });
        Ok(())
    }

    fn cleanup_planes(&self, tx: TxId, planes: &[PlaneUpdate]) {
        self.record(HwEvent::CleanupPlanes {
            tx: tx.value(),
            planes: planes.to_vec(),
        });
    }

    fn commit_planes(&self, tx: TxId, planes: &[PlaneUpdate]) {
        self.record(HwEvent::CommitPlanes {
            tx: tx.value(),
            planes: planes.to_vec(),
        });
    }

    fn async_commit_planes(&self, tx: TxId, planes: &[PlaneUpdate]) {
        self.record(HwEvent::AsyncCommitPlanes {
            tx: tx.value(),
            planes: planes.to_vec(),
        });
    }

    fn fake_vblank(&self, output: OutputId) {
        self.record(HwEvent::FakeVblank { output });
    }

    fn hw_done(&self, tx: TxId) {
        self.record(HwEvent::HwDone { tx: tx.value() });
    }

    fn wait_flip_done(&self, tx: TxId) {
        self.record(HwEvent::FlipDone { tx: tx.value() });
    }

    fn cleanup_done(&self, tx: TxId) {
        self.record(HwEvent::CleanupDone { tx: tx.value() });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injected_prepare_failure_fires_once() {
        let backend = RecordingBackend::new();
        backend.fail_next_prepare("no memory");
        let tx = TxId::from_raw(1);
        assert_eq!(
            backend.prepare_planes(tx, &[]),
            Err(PrepareError("no memory".into()))
        );
        assert!(backend.prepare_planes(tx, &[]).is_ok());
        assert_eq!(backend.take_events().len(), 1);
        assert!(backend.events().is_empty());
    }

    #[test]
    fn clock_requests_get_distinct_ids() {
        let backend = RecordingBackend::new();
        let a = backend.request_core_clock(1);
        let b = backend.request_core_clock(2);
        assert_ne!(a, b);
    }
}
