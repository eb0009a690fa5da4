// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Identifiers for transactions and for the mode objects they touch.

use serde::{Deserialize, Serialize};

/// Index of a display output (CRTC / pixel valve) in device order.
///
/// Outputs are processed in ascending `OutputId` order by every check; the
/// channel assignment heuristic depends on that order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutputId(pub u32);

impl OutputId {
    /// Position of the output in the device's output table.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl core::fmt::Display for OutputId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "output#{}", self.0)
    }
}

/// Index of a scanout plane in device order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlaneId(pub u32);

impl PlaneId {
    /// Position of the plane in the device's plane table.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl core::fmt::Display for PlaneId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "plane#{}", self.0)
    }
}

/// Opaque handle of a framebuffer owned by the buffer collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FramebufferId(pub u64);

impl core::fmt::Display for FramebufferId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "fb#{}", self.0)
    }
}

/// Sequence number of an [`crate::AtomicState`], assigned by
/// [`crate::Device::begin`].
///
/// Numbers start at 1 and grow by one per transaction; zero never names a
/// transaction, so the counter skips it when it wraps. Logs and
/// [`crate::HwEvent`]s carry the raw value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxId(u64);

impl TxId {
    /// Wraps a raw sequence number.
    #[must_use]
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Raw sequence number.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Number the device hands out after `self`.
    pub(crate) const fn next(self) -> Self {
        match self.0.wrapping_add(1) {
            0 => Self(1),
            next => Self(next),
        }
    }
}

impl core::fmt::Display for TxId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "tx#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tx_numbers_skip_zero_on_wrap() {
        assert_eq!(TxId::from_raw(u64::MAX).next(), TxId::from_raw(1));
        assert_eq!(TxId::from_raw(0).next(), TxId::from_raw(1));
        assert_eq!(TxId::from_raw(41).next().value(), 42);
    }

    #[test]
    fn ids_render_with_their_kind() {
        assert_eq!(OutputId(2).to_string(), "output#2");
        assert_eq!(TxId::from_raw(7).to_string(), "tx#7");
    }
}
