// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! HVS channel pool and output-to-channel assignment.
//!
//! The HVS exposes a small pool of FIFOs ("channels") that every pixel valve
//! has to be muxed onto. Each output can physically reach only some of them,
//! described by its [`ChannelMask`].

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{InvalidConfig, KmsError};
use crate::state::AtomicState;

/// Number of HVS channels on every supported SoC.
pub const HVS_NUM_CHANNELS: u8 = 3;

/// Largest pool a [`ChannelMask`] can describe.
pub const MAX_CHANNELS: u8 = 32;

/// One HVS channel (FIFO).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HvsChannel(u8);

impl HvsChannel {
    /// Returns the channel with the given index, if it fits a [`ChannelMask`].
    #[must_use]
    pub const fn new(index: u8) -> Option<Self> {
        if index < MAX_CHANNELS {
            Some(Self(index))
        } else {
            None
        }
    }

    /// Zero-based channel index.
    #[must_use]
    pub const fn index(self) -> u8 {
        self.0
    }

    /// Slot number the colour-matrix unit uses for this channel (1-based).
    #[must_use]
    pub const fn ctm_fifo(self) -> u8 {
        self.0 + 1
    }
}

impl core::fmt::Display for HvsChannel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "fifo{}", self.0)
    }
}

/// Bit set of HVS channels, bit `i` standing for channel `i`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelMask(u32);

impl ChannelMask {
    /// The empty set.
    pub const EMPTY: Self = Self(0);

    /// Every channel of a pool of `count` channels.
    #[must_use]
    pub const fn full(count: u8) -> Self {
        if count >= MAX_CHANNELS {
            Self(u32::MAX)
        } else {
            Self((1_u32 << count) - 1)
        }
    }

    /// Builds a mask from raw bits.
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw bits.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns `true` if no channel is set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Number of channels in the set.
    #[must_use]
    pub const fn len(self) -> u32 {
        self.0.count_ones()
    }

    /// Returns `true` if `channel` is in the set.
    #[must_use]
    pub const fn contains(self, channel: HvsChannel) -> bool {
        self.0 & (1 << channel.0) != 0
    }

    /// Adds `channel` to the set.
    pub fn insert(&mut self, channel: HvsChannel) {
        self.0 |= 1 << channel.0;
    }

    /// Removes `channel` from the set.
    pub fn remove(&mut self, channel: HvsChannel) {
        self.0 &= !(1 << channel.0);
    }

    /// Channels present in both sets.
    #[must_use]
    pub const fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// Channels present in either set.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Returns `true` if every channel of `self` is also in `other`.
    #[must_use]
    pub const fn is_subset(self, other: Self) -> bool {
        self.0 & !other.0 == 0
    }

    /// Lowest-numbered channel of the set.
    #[must_use]
    pub const fn lowest(self) -> Option<HvsChannel> {
        if self.0 == 0 {
            return None;
        }
        // trailing_zeros of a non-zero u32 is below 32.
        #[allow(clippy::cast_possible_truncation)]
        let index = self.0.trailing_zeros() as u8;
        Some(HvsChannel(index))
    }

    /// Channels in ascending order.
    pub fn iter(self) -> impl Iterator<Item = HvsChannel> {
        (0..MAX_CHANNELS)
            .map(HvsChannel)
            .filter(move |c| self.contains(*c))
    }
}

impl FromIterator<HvsChannel> for ChannelMask {
    fn from_iter<I: IntoIterator<Item = HvsChannel>>(iter: I) -> Self {
        let mut mask = Self::EMPTY;
        for channel in iter {
            mask.insert(channel);
        }
        mask
    }
}

/// Device-wide channel pool state.
///
/// Published once per commit; transactions mutate a private copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HvsState {
    /// Channels not assigned to any enabled output.
    pub unassigned_channels: ChannelMask,
    /// Number of active outputs.
    pub num_outputs: u32,
    /// Sum of the per-output FIFO load of active outputs.
    pub fifo_load: u64,
    /// Minimum core clock for the configuration, in Hz.
    pub core_clock_rate: u64,
}

impl HvsState {
    /// Initial state of a pool of `num_channels` channels: everything free.
    #[must_use]
    pub const fn new(num_channels: u8) -> Self {
        Self {
            unassigned_channels: ChannelMask::full(num_channels),
            num_outputs: 0,
            fifo_load: 0,
            core_clock_rate: 0,
        }
    }
}

/// Assigns HVS channels to every output whose enable state changes.
///
/// Outputs that are not part of `tx` but are enabled on the device keep their
/// channel: it is already missing from the published pool, so they are taken
/// into account without being pulled into the transaction. A channel stays
/// assigned for as long as its output is enabled, because changing it requires
/// the pixel valve to be disabled and re-enabled.
///
/// Channels are picked lowest-index-first while walking outputs in ascending
/// id order. With the routing trees of the supported SoCs this never hands an
/// earlier output with several routes the only channel a later output could
/// use. A topology without that property needs a real matching algorithm
/// here; this greedy pick then fails with
/// [`InvalidConfig::NoChannelAvailable`] instead of finding the assignment.
///
/// # Errors
/// [`InvalidConfig::NoChannelAvailable`] when an output being enabled cannot
/// reach any free channel.
pub(crate) fn pv_muxing_check(tx: &mut AtomicState) -> Result<(), KmsError> {
    let objects = tx.objects.clone();
    if objects.config.firmware_kms {
        return Ok(());
    }
    let hvs = objects.hvs.get_or_duplicate(&mut tx.hvs);

    for (id, entry) in &mut tx.outputs {
        let old = entry.old();
        let was_enabled = old.enable;
        let old_channel = old.assigned_channel;
        let new = entry.new_mut();

        if was_enabled == new.enable {
            continue;
        }

        new.update_muxing = true;

        if !new.enable {
            if let Some(channel) = old_channel {
                hvs.unassigned_channels.insert(channel);
            }
            new.assigned_channel = None;
            continue;
        }

        let allowed = objects.output_desc(*id)?.allowed_channels;
        let matching = hvs.unassigned_channels.intersection(allowed);
        let Some(channel) = matching.lowest() else {
            debug!(output = %id, allowed = allowed.bits(), free = hvs.unassigned_channels.bits(), "no channel left");
            return Err(InvalidConfig::NoChannelAvailable { output: *id }.into());
        };
        debug!(output = %id, %channel, "assigned HVS channel");
        new.assigned_channel = Some(channel);
        hvs.unassigned_channels.remove(channel);
    }

    Ok(())
}
