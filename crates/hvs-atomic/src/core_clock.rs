// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Minimum core clock derivation.

use tracing::debug;

use crate::error::KmsError;
use crate::state::AtomicState;

/// Share of the HVS load the core clock must cover with several outputs active.
pub const MULTI_OUTPUT_PIXEL_RATE_PERCENT: u64 = 40;

/// Share of the HVS load the core clock must cover with at most one output.
pub const SINGLE_OUTPUT_PIXEL_RATE_PERCENT: u64 = 60;

/// Core clock floor requested while a modeset is applied, in Hz.
pub const MODESET_BOOST_CLOCK_HZ: u64 = 500_000_000;

/// `max(fifo_load, hvs_load * share)` where the share depends on how many
/// outputs are active.
#[must_use]
pub const fn derive_core_clock_rate(fifo_load: u64, hvs_load: u64, num_outputs: u32) -> u64 {
    let percent = if num_outputs > 1 {
        MULTI_OUTPUT_PIXEL_RATE_PERCENT
    } else {
        SINGLE_OUTPUT_PIXEL_RATE_PERCENT
    };
    let pixel_rate = hvs_load.saturating_mul(percent) / 100;
    if fifo_load > pixel_rate {
        fifo_load
    } else {
        pixel_rate
    }
}

/// Updates output count, FIFO load and core clock rate on the channel pool.
///
/// Runs after the load tracker so the pixel-rate term sees this transaction's
/// HVS load. Advisory only: never rejects.
#[allow(clippy::unnecessary_wraps)]
pub(crate) fn core_clock_check(tx: &mut AtomicState) -> Result<(), KmsError> {
    let objects = tx.objects.clone();
    let hvs_load = objects.load.get_or_duplicate(&mut tx.load).hvs_load;
    let hvs = objects.hvs.get_or_duplicate(&mut tx.hvs);

    for entry in tx.outputs.values() {
        let old = entry.old();
        if old.active {
            hvs.num_outputs = hvs.num_outputs.saturating_sub(1);
            hvs.fifo_load = hvs.fifo_load.saturating_sub(old.hvs_load);
        }

        let new = entry.new_state();
        if new.active {
            hvs.num_outputs += 1;
            hvs.fifo_load = hvs.fifo_load.saturating_add(new.hvs_load);
        }
    }

    hvs.core_clock_rate = derive_core_clock_rate(hvs.fifo_load, hvs_load, hvs.num_outputs);
    debug!(
        num_outputs = hvs.num_outputs,
        fifo_load = hvs.fifo_load,
        hvs_load,
        core_clock_rate = hvs.core_clock_rate,
        "derived core clock"
    );
    Ok(())
}
