// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Colour transform matrix (CTM) unit.
//!
//! The HVS has a single CTM block with two peculiar limitations: it can only
//! be enabled for one output at a time, and it only supports S0.9 scalars. A
//! matrix the hardware has no hope of approximating is refused at check time.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::channels::HvsChannel;
use crate::error::{InvalidConfig, KmsError};
use crate::fixed;
use crate::ident::OutputId;
use crate::state::AtomicState;

/// 3×3 colour transform in sign-magnitude S31.32, row-major.
///
/// `out_r = m[0] * r + m[1] * g + m[2] * b`, and so on for the other rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ColorMatrix(pub [u64; 9]);

impl ColorMatrix {
    /// The identity transform.
    pub const IDENTITY: Self = Self([
        fixed::ONE_RAW,
        0,
        0,
        0,
        fixed::ONE_RAW,
        0,
        0,
        0,
        fixed::ONE_RAW,
    ]);

    /// Builds a matrix from floating-point coefficients.
    #[must_use]
    pub fn from_f32(coefficients: [f32; 9]) -> Self {
        Self(coefficients.map(fixed::from_f32))
    }

    /// First coefficient the hardware cannot represent, if any.
    #[must_use]
    pub fn first_out_of_range(&self) -> Option<(usize, u64)> {
        self.0
            .iter()
            .copied()
            .enumerate()
            .find(|(_, raw)| !fixed::fits_s0_9(*raw))
    }
}

/// Device-wide state of the CTM unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CtmState {
    /// Slot driving the unit: `0` disables it, `k` selects channel `k - 1`.
    pub fifo: u8,
    /// Coefficients loaded for the owning slot.
    pub ctm: Option<ColorMatrix>,
}

const OLEDCOEF_HIGH_SHIFT: u32 = 20;
const OLEDCOEF_MID_SHIFT: u32 = 10;
const OLEDOFFS_DISPFIFO_SHIFT: u32 = 24;
const OLEDOFFS_DISPFIFO_MASK: u32 = 0b11 << OLEDOFFS_DISPFIFO_SHIFT;

/// Register values programming the CTM unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtmRegisters {
    /// `SCALER_OLEDCOEF0..2`, written only when a slot owns the unit.
    pub coefficients: Option<[u32; 3]>,
    /// `SCALER_OLEDOFFS`, always written.
    pub oledoffs: u32,
}

fn pack_row(a: u64, b: u64, c: u64) -> u32 {
    (u32::from(fixed::to_s0_9(a)) << OLEDCOEF_HIGH_SHIFT)
        | (u32::from(fixed::to_s0_9(b)) << OLEDCOEF_MID_SHIFT)
        | u32::from(fixed::to_s0_9(c))
}

impl CtmRegisters {
    /// Computes the register image for a published CTM state.
    ///
    /// `OLEDCOEF2` carries the red input column, `OLEDCOEF1` green and
    /// `OLEDCOEF0` blue; each packs the R, G and B outputs at bits 29:20,
    /// 19:10 and 9:0.
    #[must_use]
    pub fn from_state(state: &CtmState) -> Self {
        let coefficients = match (state.fifo, state.ctm) {
            (0, _) | (_, None) => None,
            (_, Some(ColorMatrix(m))) => Some([
                pack_row(m[2], m[5], m[8]),
                pack_row(m[1], m[4], m[7]),
                pack_row(m[0], m[3], m[6]),
            ]),
        };
        Self {
            coefficients,
            oledoffs: (u32::from(state.fifo) << OLEDOFFS_DISPFIFO_SHIFT) & OLEDOFFS_DISPFIFO_MASK,
        }
    }
}

fn check_coefficients(output: OutputId, matrix: &ColorMatrix) -> Result<(), KmsError> {
    if let Some((index, raw)) = matrix.first_out_of_range() {
        debug!(%output, index, raw, "CTM coefficient out of range");
        return Err(InvalidConfig::CtmOutOfRange { output, index, raw }.into());
    }
    Ok(())
}

/// Slot an output drives from `channel`; `0` when it has none.
fn slot_of(channel: Option<HvsChannel>) -> u8 {
    channel.map_or(0, HvsChannel::ctm_fifo)
}

/// Validates and stages colour-matrix changes.
///
/// The owner of the unit releases it when it drops its matrix or loses its
/// channel. Any output whose matrix or channel changed and that carries a
/// matrix then asks for its channel's 1-based slot; a different slot holding
/// the unit in this transaction (including the published owner) is refused.
///
/// An output with no assigned channel asks for slot 0, so it may only stage a
/// matrix while nobody owns the unit. It leaves the slot as is; it claims it
/// once a later transaction gives it a channel.
///
/// # Errors
/// [`InvalidConfig::CtmConflict`] or [`InvalidConfig::CtmOutOfRange`].
pub(crate) fn ctm_check(tx: &mut AtomicState) -> Result<(), KmsError> {
    let objects = tx.objects.clone();

    for (id, entry) in &tx.outputs {
        let (old, new) = (entry.old(), entry.new_state());
        let owned = old.ctm.is_some() && old.assigned_channel.is_some();
        if !owned || (new.ctm.is_some() && new.assigned_channel == old.assigned_channel) {
            continue;
        }
        let ctm = objects.ctm.get_or_duplicate(&mut tx.ctm);
        if ctm.fifo == slot_of(old.assigned_channel) {
            debug!(output = %id, fifo = ctm.fifo, "releasing CTM");
            ctm.fifo = 0;
            ctm.ctm = None;
        }
    }

    for (id, entry) in &tx.outputs {
        let (old, new) = (entry.old(), entry.new_state());
        if new.ctm == old.ctm && new.assigned_channel == old.assigned_channel {
            continue;
        }

        let Some(matrix) = new.ctm else {
            continue;
        };
        let ctm = objects.ctm.get_or_duplicate(&mut tx.ctm);

        let fifo = slot_of(new.assigned_channel);
        if ctm.fifo != 0 && ctm.fifo != fifo {
            debug!(output = %id, owner = ctm.fifo, requested = fifo, "too many CTMs configured");
            return Err(InvalidConfig::CtmConflict {
                output: *id,
                owner: ctm.fifo,
                requested: fifo,
            }
            .into());
        }
        check_coefficients(*id, &matrix)?;

        if fifo != 0 {
            ctm.fifo = fifo;
            ctm.ctm = Some(matrix);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]

    use super::*;
    use crate::fixed::{ONE_RAW, SIGN_BIT};

    #[test]
    fn identity_packs_saturated_diagonal() {
        let regs = CtmRegisters::from_state(&CtmState {
            fifo: 2,
            ctm: Some(ColorMatrix::IDENTITY),
        });
        let [coef0, coef1, coef2] = regs.coefficients.expect("coefficients");
        // B→B in coef0 low field, G→G in coef1 middle field, R→R in coef2 high field.
        assert_eq!(coef0, 0x1ff);
        assert_eq!(coef1, 0x1ff << 10);
        assert_eq!(coef2, 0x1ff << 20);
        assert_eq!(regs.oledoffs, 2 << 24);
    }

    #[test]
    fn negative_half_sets_sign_field() {
        let mut m = [0_u64; 9];
        m[3] = SIGN_BIT | (ONE_RAW / 2);
        let regs = CtmRegisters::from_state(&CtmState {
            fifo: 1,
            ctm: Some(ColorMatrix(m)),
        });
        let coef2 = regs.coefficients.expect("coefficients")[2];
        assert_eq!((coef2 >> 10) & 0x3ff, 0x200 | 0x100);
    }

    #[test]
    fn disabled_unit_only_writes_offset() {
        let regs = CtmRegisters::from_state(&CtmState {
            fifo: 0,
            ctm: Some(ColorMatrix::IDENTITY),
        });
        assert_eq!(regs.coefficients, None);
        assert_eq!(regs.oledoffs, 0);
    }

    #[test]
    fn out_of_range_reports_first_coefficient() {
        let mut m = ColorMatrix::IDENTITY;
        m.0[4] = 2 * ONE_RAW;
        m.0[7] = 3 * ONE_RAW;
        assert_eq!(m.first_out_of_range(), Some((4, 2 * ONE_RAW)));
        assert_eq!(ColorMatrix::IDENTITY.first_out_of_range(), None);
        assert_eq!(
            ColorMatrix::from_f32([1.0, 0.0, 0.0, 0.0, -1.0, 0.0, 0.0, 0.0, 0.5]).0[4],
            SIGN_BIT | ONE_RAW
        );
    }
}
