//! Bit-level float64 <-> float32 conversion for targets without a 64-bit FPU.
//!
//! The mantissa is truncated, out-of-range exponents clamp to infinity and
//! underflow flushes to a signed zero. Infinities keep their sign and NaNs stay
//! NaN (the payload is not preserved bit for bit).

const F64_EXP_BIAS: i32 = 1023;
const F32_EXP_BIAS: i32 = 127;
const F64_MANTISSA_BITS: u32 = 52;
const F32_MANTISSA_BITS: u32 = 23;
const MANTISSA_SHIFT: u32 = F64_MANTISSA_BITS - F32_MANTISSA_BITS;

const F64_EXP_MAX: u64 = 0x7ff;
const F32_EXP_MAX: u32 = 0xff;
const F32_QUIET_NAN: u32 = 1 << (F32_MANTISSA_BITS - 1);
const F64_QUIET_NAN: u64 = 1 << (F64_MANTISSA_BITS - 1);

/// Narrow the bits of an IEEE754 double to the bits of a single.
pub fn float64_to_float32(bits: u64) -> u32 {
    let sign = ((bits >> 63) as u32) << 31;
    let exponent = (bits >> F64_MANTISSA_BITS) & F64_EXP_MAX;
    let mantissa = bits & ((1 << F64_MANTISSA_BITS) - 1);

    if exponent == F64_EXP_MAX {
        if mantissa == 0 {
            return sign | (F32_EXP_MAX << F32_MANTISSA_BITS);
        }
        let payload = (mantissa >> MANTISSA_SHIFT) as u32;
        return sign | (F32_EXP_MAX << F32_MANTISSA_BITS) | payload | F32_QUIET_NAN;
    }
    if exponent == 0 {
        return sign;
    }

    let rebased = exponent as i32 - F64_EXP_BIAS + F32_EXP_BIAS;
    if rebased >= F32_EXP_MAX as i32 {
        return sign | (F32_EXP_MAX << F32_MANTISSA_BITS);
    }
    if rebased <= 0 {
        return sign;
    }
    sign | ((rebased as u32) << F32_MANTISSA_BITS) | (mantissa >> MANTISSA_SHIFT) as u32
}

/// Widen the bits of an IEEE754 single to the bits of a double.
pub fn float32_to_float64(bits: u32) -> u64 {
    let sign = u64::from(bits >> 31) << 63;
    let exponent = (bits >> F32_MANTISSA_BITS) & F32_EXP_MAX;
    let mantissa = u64::from(bits & ((1 << F32_MANTISSA_BITS) - 1));

    if exponent == F32_EXP_MAX {
        if mantissa == 0 {
            return sign | (F64_EXP_MAX << F64_MANTISSA_BITS);
        }
        return sign | (F64_EXP_MAX << F64_MANTISSA_BITS) | (mantissa << MANTISSA_SHIFT) | F64_QUIET_NAN;
    }
    if exponent == 0 {
        return sign;
    }

    let rebased = (exponent as i32 - F32_EXP_BIAS + F64_EXP_BIAS) as u64;
    sign | (rebased << F64_MANTISSA_BITS) | (mantissa << MANTISSA_SHIFT)
}
