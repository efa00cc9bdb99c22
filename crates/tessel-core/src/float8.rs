//! Float8 E4M3 ("fn" flavour) codec.
//!
//! Layout: 1 sign bit, 4 exponent bits (bias 7), 3 mantissa bits. There are
//! no infinities; `S.1111.111` is NaN, so the largest finite magnitude is
//! `1.75 * 2^8 = 448`. Encoding rounds to nearest-even and saturates to
//! ±448, which is how rowwise-quantized GEMM operands are produced.

use std::fmt;

/// Largest finite E4M3 magnitude.
pub const F8E4M3_MAX: f32 = 448.0;

const EXP_BIAS: i32 = 7;
const MANTISSA_BITS: i32 = 3;
const MIN_NORMAL_EXP: i32 = 1 - EXP_BIAS;
const NAN_BITS: u8 = 0x7F;
const MAX_BITS: u8 = 0x7E;

/// One float8 E4M3 value, stored as its raw bit pattern.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(transparent)]
pub struct F8E4M3(pub u8);

impl F8E4M3 {
    pub const ZERO: F8E4M3 = F8E4M3(0);

    /// Reinterpret raw bits.
    pub const fn from_bits(bits: u8) -> Self {
        F8E4M3(bits)
    }

    pub const fn to_bits(self) -> u8 {
        self.0
    }

    pub fn is_nan(self) -> bool {
        self.0 & 0x7F == NAN_BITS
    }

    /// Round an f32 to the nearest representable E4M3 value.
    pub fn from_f32(value: f32) -> Self {
        let sign: u8 = if value.is_sign_negative() { 0x80 } else { 0 };
        if value.is_nan() {
            return F8E4M3(sign | NAN_BITS);
        }
        let mag = value.abs();
        if mag >= F8E4M3_MAX {
            return F8E4M3(sign | MAX_BITS);
        }
        if mag == 0.0 {
            return F8E4M3(sign);
        }

        // Quantum of the binade `mag` falls in; subnormals share the
        // quantum of the smallest normal binade.
        let exp = exponent_of(mag).max(MIN_NORMAL_EXP);
        let quantum = pow2(exp - MANTISSA_BITS);
        let rounded = (mag / quantum).round_ties_even() * quantum;
        if rounded >= F8E4M3_MAX {
            return F8E4M3(sign | MAX_BITS);
        }
        F8E4M3(sign | encode_exact(rounded))
    }

    /// Decode to f32 (exact).
    pub fn to_f32(self) -> f32 {
        let bits = self.0;
        let sign = if bits & 0x80 != 0 { -1.0 } else { 1.0 };
        let exp = ((bits >> 3) & 0x0F) as i32;
        let man = (bits & 0x07) as f32;
        if exp == 0x0F && bits & 0x07 == 0x07 {
            return f32::NAN;
        }
        let mag = if exp == 0 {
            man / 8.0 * pow2(MIN_NORMAL_EXP)
        } else {
            (1.0 + man / 8.0) * pow2(exp - EXP_BIAS)
        };
        sign * mag
    }
}

/// Unbiased exponent of a positive finite f32 (normal or subnormal).
fn exponent_of(v: f32) -> i32 {
    let biased = ((v.to_bits() >> 23) & 0xFF) as i32;
    if biased == 0 {
        // f32 subnormals are far below the E4M3 range; any value here rounds
        // against the smallest-normal quantum anyway.
        -127
    } else {
        biased - 127
    }
}

fn pow2(e: i32) -> f32 {
    f32::from_bits(((e + 127) as u32) << 23)
}

/// Bits of a positive magnitude that is already exactly representable.
fn encode_exact(v: f32) -> u8 {
    if v == 0.0 {
        return 0;
    }
    let exp = exponent_of(v);
    if exp < MIN_NORMAL_EXP {
        let man = (v / pow2(MIN_NORMAL_EXP - MANTISSA_BITS)) as u8;
        return man & 0x07;
    }
    let man = ((v / pow2(exp) - 1.0) * 8.0) as u8;
    (((exp + EXP_BIAS) as u8) << 3) | (man & 0x07)
}

impl fmt::Debug for F8E4M3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "F8E4M3({:#04x} = {})", self.0, self.to_f32())
    }
}

impl fmt::Display for F8E4M3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_f32())
    }
}

impl From<F8E4M3> for f32 {
    fn from(v: F8E4M3) -> f32 {
        v.to_f32()
    }
}
