// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Helpers for the sign-magnitude S31.32 encoding used by colour matrices.
//!
//! A raw `u64` stores the sign in bit 63 and the magnitude scaled by `2^32` in
//! bits 62..0: `real_value = (-1)^sign * (raw & !SIGN_BIT) / 2^32`.
//!
//! The HVS colour-matrix unit only accepts S0.9: one sign bit and nine
//! fractional bits, no integer bits.

/// Number of fractional bits in the S31.32 encoding.
pub const FRAC_BITS: u32 = 32;

/// Sign bit of the S31.32 encoding.
pub const SIGN_BIT: u64 = 1 << 63;

/// Raw magnitude corresponding to `1.0`.
pub const ONE_RAW: u64 = 1 << FRAC_BITS;

/// Integer bits 62..32 of the S31.32 encoding.
const INTEGER_MASK: u64 = !SIGN_BIT & !(ONE_RAW - 1);

/// Fraction field of the S0.9 hardware encoding.
pub const S0_9_FRACTION_MASK: u16 = 0x1ff;

/// Sign bit of the S0.9 hardware encoding.
pub const S0_9_SIGN: u16 = 1 << 9;

/// Magnitude of a raw S31.32 value.
#[must_use]
pub const fn magnitude(raw: u64) -> u64 {
    raw & !SIGN_BIT
}

/// Returns `true` when the hardware has any hope of approximating `raw`.
///
/// The unit has no integer bits, so anything with a magnitude above `1.0` is
/// refused. Exactly `1.0` is accepted and saturates on conversion.
#[must_use]
pub const fn fits_s0_9(raw: u64) -> bool {
    magnitude(raw) <= ONE_RAW
}

/// Converts a raw S31.32 value to the 10-bit S0.9 hardware format.
///
/// Non-zero integer bits saturate the fraction to all ones; otherwise the nine
/// most significant fractional bits are kept (truncating).
#[must_use]
pub const fn to_s0_9(raw: u64) -> u16 {
    let sign = if raw & SIGN_BIT != 0 { S0_9_SIGN } else { 0 };
    if raw & INTEGER_MASK != 0 {
        return sign | S0_9_FRACTION_MASK;
    }
    // Bits 31..23 are the nine most significant fractional bits.
    #[allow(clippy::cast_possible_truncation)]
    let fraction = ((raw >> (FRAC_BITS - 9)) as u16) & S0_9_FRACTION_MASK;
    sign | fraction
}

fn round_shift_right_u64(value: u64, shift: u32) -> u64 {
    if shift == 0 {
        return value;
    }
    if shift >= 64 {
        return 0;
    }

    let q = value >> shift;
    let mask = (1_u64 << shift) - 1;
    let r = value & mask;
    let half = 1_u64 << (shift - 1);

    if r > half || (r == half && (q & 1) == 1) {
        q + 1
    } else {
        q
    }
}

/// Converts an `f32` to a raw S31.32 value.
///
/// Semantics:
/// - `NaN` maps to `0`.
/// - Infinities and magnitudes beyond the integer range saturate to the largest
///   magnitude, keeping the sign.
/// - Rounds to nearest with ties-to-even at the 2^-32 boundary.
/// - `-0.0` maps to `0`.
#[must_use]
pub fn from_f32(value: f32) -> u64 {
    if value.is_nan() {
        return 0;
    }
    let sign = if value.is_sign_negative() { SIGN_BIT } else { 0 };
    if value.is_infinite() {
        return sign | !SIGN_BIT;
    }

    let bits = value.to_bits();
    // Masking yields a value in 0..=255.
    #[allow(clippy::cast_possible_truncation)]
    let exp = i32::from(((bits >> 23) & 0xff) as u8);
    let mant = bits & 0x007f_ffff;
    if exp == 0 && mant == 0 {
        return 0;
    }

    let mantissa = if exp == 0 {
        u64::from(mant)
    } else {
        u64::from((1_u32 << 23) | mant)
    };

    // value = mantissa * 2^(unbiased - 23); scaled by 2^32.
    let unbiased = if exp == 0 { -126 } else { exp - 127 };
    #[allow(clippy::cast_possible_wrap)]
    let shift = unbiased + (FRAC_BITS as i32 - 23);

    let abs = if shift >= 0 {
        let shift_u = shift.unsigned_abs();
        // 24-bit mantissa shifted past bit 62 overflows the magnitude field.
        if shift_u > 39 {
            !SIGN_BIT
        } else {
            (mantissa << shift_u).min(!SIGN_BIT)
        }
    } else {
        round_shift_right_u64(mantissa, shift.unsigned_abs())
    };

    if abs == 0 {
        0
    } else {
        sign | abs
    }
}
