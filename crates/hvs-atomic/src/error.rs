// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Errors emitted by the atomic check and commit entry points.

use thiserror::Error;

use crate::hw::PrepareError;
use crate::ident::{OutputId, PlaneId};

/// Reasons a transaction is rejected as an invalid configuration.
///
/// Every variant is raised before any hardware effect; the transaction's
/// private state is discarded and the published state is untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidConfig {
    /// No free HVS channel is reachable from the output being enabled.
    #[error("no HVS channel available for {output}")]
    NoChannelAvailable {
        /// Output that could not be routed.
        output: OutputId,
    },
    /// A second output tried to claim the colour-matrix unit.
    #[error("colour matrix already driven by fifo {owner}, {output} requested fifo {requested}")]
    CtmConflict {
        /// Output whose request was refused.
        output: OutputId,
        /// Slot that already owns the unit in this transaction.
        owner: u8,
        /// Slot the refused output would have used.
        requested: u8,
    },
    /// A matrix coefficient cannot be approximated by the S0.9 hardware format.
    #[error("colour matrix coefficient {index} of {output} out of range (raw {raw:#018x})")]
    CtmOutOfRange {
        /// Output carrying the matrix.
        output: OutputId,
        /// Coefficient position, row-major.
        index: usize,
        /// Raw sign-magnitude S31.32 value.
        raw: u64,
    },
    /// The transaction referenced an output the device does not have.
    #[error("unknown {0}")]
    UnknownOutput(OutputId),
    /// The transaction referenced a plane the device does not have.
    #[error("unknown {0}")]
    UnknownPlane(PlaneId),
    /// The generic mode-config check refused the transaction.
    #[error("{0}")]
    Rejected(String),
}

/// Shared resources whose aggregate load is bounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadResource {
    /// Memory-bus bandwidth in bytes per second.
    MemoryBus,
    /// HVS pipeline cycles per second.
    Hvs,
}

impl core::fmt::Display for LoadResource {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::MemoryBus => f.write_str("memory bus"),
            Self::Hvs => f.write_str("HVS"),
        }
    }
}

/// Errors emitted by [`crate::Device`].
#[derive(Debug, Error)]
pub enum KmsError {
    /// The transaction describes a configuration the hardware cannot realize.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(#[from] InvalidConfig),
    /// An aggregate load ceiling would be exceeded.
    #[error("{resource} load {load} exceeds limit {limit}")]
    ResourceExhausted {
        /// Resource whose ceiling was hit.
        resource: LoadResource,
        /// Load the transaction would produce.
        load: u64,
        /// Configured ceiling.
        limit: u64,
    },
    /// Waiting for the commit gate or a fence was interrupted.
    #[error("interrupted while waiting")]
    Interrupted,
    /// Another transaction published first; rebuild from current state and retry.
    #[error("transaction was validated against superseded state")]
    StaleState,
    /// The buffer collaborator failed to prepare planes.
    #[error(transparent)]
    PrepareFailed(#[from] PrepareError),
    /// Teardown was requested while a commit still holds the gate.
    #[error("device busy: a commit is still in flight")]
    DeviceBusy,
    /// The device was torn down; it accepts no further commits.
    #[error("device has been torn down")]
    DeviceClosed,
    /// A commit phase was entered out of order.
    #[error("transaction {tx} cannot move from {from} to {to}")]
    PhaseOrder {
        /// Transaction id.
        tx: crate::TxId,
        /// Current phase.
        from: crate::CommitPhase,
        /// Requested phase.
        to: crate::CommitPhase,
    },
    /// Internal invariant violated; not recoverable by the caller.
    #[error("internal invariant violated: {0}")]
    FatalInconsistency(&'static str),
}

/// Coarse classification of [`KmsError`] for callers deciding how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected configuration; retrying unchanged will fail again.
    InvalidConfiguration,
    /// Bandwidth ceiling exceeded.
    ResourceExhausted,
    /// Wait interrupted; may be retried as is.
    Interrupted,
    /// Rebuild the transaction and retry, or fix the collaborator.
    Retry,
    /// The device is gone; stop submitting.
    Closed,
    /// Defect elsewhere in the system.
    Fatal,
}

impl KmsError {
    /// Returns the taxonomy bucket for this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidConfiguration(_) => ErrorKind::InvalidConfiguration,
            Self::ResourceExhausted { .. } => ErrorKind::ResourceExhausted,
            Self::Interrupted => ErrorKind::Interrupted,
            Self::StaleState | Self::PrepareFailed(_) | Self::DeviceBusy => ErrorKind::Retry,
            Self::DeviceClosed => ErrorKind::Closed,
            Self::PhaseOrder { .. } | Self::FatalInconsistency(_) => ErrorKind::Fatal,
        }
    }
}
