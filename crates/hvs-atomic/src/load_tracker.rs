// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Aggregate memory-bus and HVS load of all active surfaces.

use tracing::{debug, warn};

use crate::error::{KmsError, LoadResource};
use crate::state::{AtomicState, PlaneState};

/// Memory-bus ceiling in bytes per second.
///
/// The absolute limit is 2 GiB/s; the margin leaves room for other blocks
/// accessing memory.
pub const MEMBUS_LOAD_LIMIT: u64 = (1 << 30) + (1 << 29);

/// HVS ceiling in cycles per second.
///
/// The HVS clock is supposed to run at 250 MHz; 240 M cycles keeps a margin.
pub const HVS_LOAD_LIMIT: u64 = 240_000_000;

/// Running load sums over active surfaces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadTrackerState {
    /// Memory-bus load in bytes per second.
    pub membus_load: u64,
    /// HVS load in cycles per second.
    pub hvs_load: u64,
}

impl LoadTrackerState {
    fn remove(&mut self, plane: &PlaneState) {
        if plane.membus_load > self.membus_load || plane.hvs_load > self.hvs_load {
            warn!(
                membus = self.membus_load,
                hvs = self.hvs_load,
                "load tracker underflow, clamping to zero"
            );
        }
        self.membus_load = self.membus_load.saturating_sub(plane.membus_load);
        self.hvs_load = self.hvs_load.saturating_sub(plane.hvs_load);
    }

    fn add(&mut self, plane: &PlaneState) {
        self.membus_load = self.membus_load.saturating_add(plane.membus_load);
        self.hvs_load = self.hvs_load.saturating_add(plane.hvs_load);
    }
}

/// Folds the transaction's plane changes into the tracker and enforces limits.
///
/// Counters are always maintained; the ceilings only apply when `enforce` is
/// set (the administrative load-tracker switch).
///
/// # Errors
/// [`KmsError::ResourceExhausted`] when enforcement is on and a ceiling is
/// exceeded.
pub(crate) fn load_tracker_check(tx: &mut AtomicState, enforce: bool) -> Result<(), KmsError> {
    let objects = tx.objects.clone();
    let load = objects.load.get_or_duplicate(&mut tx.load);

    for entry in tx.planes.values() {
        if entry.old().is_active_surface() {
            load.remove(entry.old());
        }
        if entry.new_state().is_active_surface() {
            load.add(entry.new_state());
        }
    }

    debug!(membus = load.membus_load, hvs = load.hvs_load, enforce, "load tracker");

    if !enforce {
        return Ok(());
    }

    if load.membus_load > MEMBUS_LOAD_LIMIT {
        return Err(KmsError::ResourceExhausted {
            resource: LoadResource::MemoryBus,
            load: load.membus_load,
            limit: MEMBUS_LOAD_LIMIT,
        });
    }

    if load.hvs_load > HVS_LOAD_LIMIT {
        return Err(KmsError::ResourceExhausted {
            resource: LoadResource::Hvs,
            load: load.hvs_load,
            limit: HVS_LOAD_LIMIT,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_match_documented_margins() {
        assert_eq!(MEMBUS_LOAD_LIMIT, 1_610_612_736);
        assert_eq!(HVS_LOAD_LIMIT, 240_000_000);
    }

    #[test]
    fn remove_clamps_at_zero() {
        let mut state = LoadTrackerState {
            membus_load: 10,
            hvs_load: 5,
        };
        let plane = PlaneState {
            membus_load: 20,
            hvs_load: 1,
            ..PlaneState::default()
        };
        state.remove(&plane);
        assert_eq!(state, LoadTrackerState { membus_load: 0, hvs_load: 4 });
        state.add(&plane);
        assert_eq!(state, LoadTrackerState { membus_load: 20, hvs_load: 5 });
    }
}
