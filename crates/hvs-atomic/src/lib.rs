// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! hvs-atomic: all-or-nothing display reconfiguration for an HVS pipeline.
//!
//! A fixed pool of HVS channels (FIFOs) feeds several pixel valves. Clients
//! describe a whole configuration in an [`AtomicState`]; [`Device::atomic_check`]
//! assigns channels, admits colour matrices, tracks bandwidth and derives the
//! core clock on private copies of the shared state; [`Device::atomic_commit`]
//! publishes the result and drives the [`HardwareBackend`] through the fixed
//! modeset sequence, with at most one transaction touching hardware at once.
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]
#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::dbg_macro,
    clippy::print_stdout,
    clippy::print_stderr
)]
#![allow(
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::missing_const_for_fn,
    clippy::redundant_pub_crate,
    clippy::module_name_repetitions,
    clippy::use_self
)]

mod channels;
mod check;
mod commit;
mod config;
mod core_clock;
mod ctm;
mod device;
mod error;
/// Fixed-point helpers for colour-matrix coefficients.
pub mod fixed;
/// Hardware collaborator contract and the recording backend.
pub mod hw;
mod ident;
mod load_tracker;
mod muxing;
mod private_obj;
mod state;
mod sync;

/// Channel pool types.
pub use channels::{ChannelMask, HvsChannel, HvsState, HVS_NUM_CHANNELS, MAX_CHANNELS};
/// Validation hooks.
pub use check::{GenericCheck, ModeConfigCheck};
/// Commit completion.
pub use commit::CommitHandle;
/// Device configuration.
pub use config::{ConfigError, HvsGeneration, KmsConfig, OutputDesc};
/// Core clock derivation.
pub use core_clock::{
    derive_core_clock_rate, MODESET_BOOST_CLOCK_HZ, MULTI_OUTPUT_PIXEL_RATE_PERCENT,
    SINGLE_OUTPUT_PIXEL_RATE_PERCENT,
};
/// Colour-matrix unit.
pub use ctm::{ColorMatrix, CtmRegisters, CtmState};
/// Device handle.
pub use device::Device;
/// Error taxonomy.
pub use error::{ErrorKind, InvalidConfig, KmsError, LoadResource};
/// Hardware collaborator (also reachable through [`hw`]).
pub use hw::{HardwareBackend, HwEvent, RecordingBackend};
/// Transaction and mode-object identifiers.
pub use ident::{FramebufferId, OutputId, PlaneId, TxId};
/// Load tracker.
pub use load_tracker::{LoadTrackerState, HVS_LOAD_LIMIT, MEMBUS_LOAD_LIMIT};
/// Mux register values.
pub use muxing::{MuxField, MuxWrite, DSP3_MUX_PV1, DSP3_MUX_TXP, DSP_MUX_DISABLED};
/// Versioned shared objects.
pub use private_obj::{PrivateObj, PrivateState};
/// Transaction state.
pub use state::{AtomicState, CommitPhase, DisplayMode, OutputState, PlaneState};
/// Fences and interrupt tokens.
pub use sync::{Fence, FenceSignaler, Interrupt, InterruptHandle};
