// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Validation pipeline run before a transaction may be committed.
//!
//! Order matters: channel assignment first (the colour-matrix check reads the
//! assigned channels), then the colour matrix, the generic mode-config check,
//! the load tracker and finally the core clock derivation, which reads the
//! tracker's HVS load.

use tracing::debug;

use crate::channels::pv_muxing_check;
use crate::config::KmsConfig;
use crate::core_clock::core_clock_check;
use crate::ctm::ctm_check;
use crate::error::{InvalidConfig, KmsError};
use crate::ident::OutputId;
use crate::load_tracker::load_tracker_check;
use crate::state::{AtomicState, CommitPhase, OutputState};

/// Mode-level validation supplied by the embedder.
///
/// Runs after channel assignment and the colour-matrix check, before load
/// tracking. Must not mutate anything.
pub trait GenericCheck: Send + Sync + 'static {
    /// Accepts or rejects `tx`.
    ///
    /// # Errors
    /// Any [`KmsError`]; conventionally [`InvalidConfig::Rejected`].
    fn check(&self, config: &KmsConfig, tx: &AtomicState) -> Result<(), KmsError>;
}

/// Default [`GenericCheck`]: basic consistency between outputs, planes and
/// the maximum scanout size.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModeConfigCheck;

fn reject(reason: String) -> KmsError {
    debug!(%reason, "mode-config check refused transaction");
    InvalidConfig::Rejected(reason).into()
}

/// Output state as it will be after `tx`: the new state if `tx` touches the
/// output, the published one otherwise.
fn effective_output(tx: &AtomicState, id: OutputId) -> Result<OutputState, KmsError> {
    if let Some(state) = tx.new_output_state(id) {
        return Ok(state.clone());
    }
    Ok((*tx.objects.output(id)?.current()).clone())
}

impl GenericCheck for ModeConfigCheck {
    fn check(&self, config: &KmsConfig, tx: &AtomicState) -> Result<(), KmsError> {
        let (max_width, max_height) = config.max_dimensions();

        for (id, _, new) in tx.outputs() {
            if new.active && !new.enable {
                return Err(reject(format!("{id} is active but not enabled")));
            }
            if let Some(mode) = new.mode {
                if mode.width > max_width || mode.height > max_height {
                    return Err(reject(format!(
                        "{id} mode {}x{} exceeds {max_width}x{max_height}",
                        mode.width, mode.height
                    )));
                }
            }
        }

        for (id, _, new) in tx.planes() {
            if new.src_width > max_width || new.src_height > max_height {
                return Err(reject(format!(
                    "{id} source {}x{} exceeds {max_width}x{max_height}",
                    new.src_width, new.src_height
                )));
            }
            if new.fb.is_none() {
                continue;
            }
            let Some(output) = new.output else {
                return Err(reject(format!("{id} has a framebuffer but no output")));
            };
            if !effective_output(tx, output)?.enable {
                return Err(reject(format!("{id} scans out on disabled {output}")));
            }
        }

        Ok(())
    }
}

/// Whether `tx` may bypass the full commit sequence.
///
/// Only plane updates qualify: every plane must stay on the same output, that
/// output must already be active and untouched, its fence (if any) must have
/// signalled, and no output, colour-matrix or channel state may change.
fn async_update_allowed(tx: &AtomicState) -> Result<bool, KmsError> {
    for (_, old, new) in tx.outputs() {
        if old.enable != new.enable
            || old.active != new.active
            || old.mode != new.mode
            || old.ctm != new.ctm
            || old.assigned_channel != new.assigned_channel
        {
            return Ok(false);
        }
    }
    if tx.ctm.as_ref().is_some_and(|p| p.old() != p.new_state()) {
        return Ok(false);
    }
    let manages_clock = tx.objects.config.manages_core_clock();
    if tx.hvs.as_ref().is_some_and(|p| {
        p.old().unassigned_channels != p.new_state().unassigned_channels
            || (manages_clock && p.old().core_clock_rate != p.new_state().core_clock_rate)
    }) {
        return Ok(false);
    }
    for (_, old, new) in tx.planes() {
        let Some(output) = new.output else {
            return Ok(false);
        };
        if old.output != new.output || !effective_output(tx, output)?.active {
            return Ok(false);
        }
        if new.fence.as_ref().is_some_and(|f| !f.is_signaled()) {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Drops every value a previous check run derived, so checking is repeatable.
fn reset_derived(tx: &mut AtomicState) {
    tx.hvs = None;
    tx.ctm = None;
    tx.load = None;
    for entry in tx.outputs.values_mut() {
        let channel = entry.old().assigned_channel;
        let new = entry.new_mut();
        new.assigned_channel = channel;
        new.update_muxing = false;
    }
}

fn run_pipeline(
    tx: &mut AtomicState,
    generic: &dyn GenericCheck,
    enforce_load: bool,
) -> Result<(), KmsError> {
    reset_derived(tx);
    tx.checked = false;

    pv_muxing_check(tx)?;
    ctm_check(tx)?;
    generic.check(&tx.objects.config, tx)?;
    load_tracker_check(tx, enforce_load)?;
    core_clock_check(tx)?;

    if tx.async_update && !async_update_allowed(tx)? {
        debug!(tx = %tx.tx, "async update not possible, using full commit");
        tx.async_update = false;
    }

    tx.checked = true;
    Ok(())
}

/// Runs the whole validation pipeline on `tx`.
///
/// On error every private copy the transaction holds is left for the caller
/// to drop; nothing is published.
pub(crate) fn atomic_check(
    tx: &mut AtomicState,
    generic: &dyn GenericCheck,
    enforce_load: bool,
) -> Result<(), KmsError> {
    tx.advance(CommitPhase::Validating)?;
    run_pipeline(tx, generic, enforce_load)
}

/// Re-derives the channel pool, CTM and load tracker state of `tx` from the
/// currently published versions.
///
/// Called under the commit gate when another transaction published those
/// objects after `tx` was checked. The client's output and plane edits are
/// kept and must still be current; the pipeline runs again on them and only
/// a real rule violation rejects the transaction.
pub(crate) fn rebase(
    tx: &mut AtomicState,
    generic: &dyn GenericCheck,
    enforce_load: bool,
) -> Result<(), KmsError> {
    debug!(tx = %tx.tx, "shared objects moved since the check, re-deriving");
    run_pipeline(tx, generic, enforce_load)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::ident::{FramebufferId, PlaneId, TxId};
    use crate::state::{DisplayMode, ModeObjects};

    fn transaction() -> AtomicState {
        AtomicState::new(
            TxId::from_raw(1),
            Arc::new(ModeObjects::new(KmsConfig::bcm2835())),
        )
    }

    #[test]
    fn active_requires_enabled() -> Result<(), KmsError> {
        let mut tx = transaction();
        tx.output_state(OutputId(0))?.active = true;
        let err = ModeConfigCheck.check(&KmsConfig::bcm2835(), &tx);
        assert!(matches!(
            err,
            Err(KmsError::InvalidConfiguration(InvalidConfig::Rejected(_)))
        ));
        Ok(())
    }

    #[test]
    fn oversized_mode_is_refused() -> Result<(), KmsError> {
        let mut tx = transaction();
        let out = tx.output_state(OutputId(0))?;
        out.enable = true;
        out.mode = Some(DisplayMode {
            width: 4096,
            height: 2160,
        });
        assert!(ModeConfigCheck.check(&KmsConfig::bcm2835(), &tx).is_err());
        assert!(ModeConfigCheck.check(&KmsConfig::bcm2711(), &tx).is_ok());
        Ok(())
    }

    #[test]
    fn framebuffer_needs_enabled_output() -> Result<(), KmsError> {
        let mut tx = transaction();
        let plane = tx.plane_state(PlaneId(0))?;
        plane.fb = Some(FramebufferId(7));
        plane.output = Some(OutputId(1));
        assert!(ModeConfigCheck.check(&KmsConfig::bcm2835(), &tx).is_err());
        tx.output_state(OutputId(1))?.enable = true;
        assert!(ModeConfigCheck.check(&KmsConfig::bcm2835(), &tx).is_ok());
        Ok(())
    }

    #[test]
    fn check_is_repeatable() -> Result<(), KmsError> {
        let mut tx = transaction();
        tx.output_state(OutputId(0))?.enable = true;
        atomic_check(&mut tx, &ModeConfigCheck, true)?;
        atomic_check(&mut tx, &ModeConfigCheck, true)?;
        let hvs = tx.new_hvs_state().map(|h| h.unassigned_channels.bits());
        assert_eq!(hvs, Some(0b110));
        Ok(())
    }
}
