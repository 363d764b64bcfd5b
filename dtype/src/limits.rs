//! Representable ranges of integer and floating-point types.
//!
//! Constant folding works on `i64`/`u64`/`f64` and wraps results back into the
//! value's own width with [`Type::wrap_int`] and [`Type::wrap_uint`].

use crate::{Type, TypeCode};

impl Type {
    /// Largest value of a signed integer type, `None` for other codes.
    pub fn max_int(&self) -> Option<i64> {
        match self.code() {
            TypeCode::Int if self.bits() >= 64 => Some(i64::MAX),
            TypeCode::Int => Some((1i64 << (self.bits() - 1)) - 1),
            _ => None,
        }
    }

    /// Smallest value of a signed integer type, `None` for other codes.
    pub fn min_int(&self) -> Option<i64> {
        match self.code() {
            TypeCode::Int if self.bits() >= 64 => Some(i64::MIN),
            TypeCode::Int => Some(-(1i64 << (self.bits() - 1))),
            _ => None,
        }
    }

    /// Largest value of an unsigned integer type, `None` for other codes.
    pub fn max_uint(&self) -> Option<u64> {
        match self.code() {
            TypeCode::UInt if self.bits() >= 64 => Some(u64::MAX),
            TypeCode::UInt => Some((1u64 << self.bits()) - 1),
            _ => None,
        }
    }

    /// Largest finite value of a float type, `None` for other codes.
    pub fn max_float(&self) -> Option<f64> {
        match (self.code(), self.bits()) {
            (TypeCode::Float, 16) => Some(65504.0),
            (TypeCode::Float, 32) => Some(f64::from(f32::MAX)),
            (TypeCode::Float, _) => Some(f64::MAX),
            _ => None,
        }
    }

    /// Whether `v` fits without wrapping.
    pub fn can_represent_int(&self, v: i64) -> bool {
        match self.code() {
            TypeCode::Int => self.min_int().is_some_and(|lo| v >= lo) && self.max_int().is_some_and(|hi| v <= hi),
            TypeCode::UInt => v >= 0 && self.max_uint().is_some_and(|hi| v as u64 <= hi),
            TypeCode::Float => {
                let mantissa = match self.bits() {
                    16 => 11,
                    32 => f32::MANTISSA_DIGITS,
                    _ => f64::MANTISSA_DIGITS,
                };
                let limit = 1i64 << mantissa;
                (-limit..=limit).contains(&v)
            }
            TypeCode::Handle => false,
        }
    }

    /// Two's-complement wrap of `v` into this signed width.
    pub fn wrap_int(&self, v: i64) -> i64 {
        let bits = u32::from(self.bits());
        if bits >= 64 {
            return v;
        }
        let shift = 64 - bits;
        (v << shift) >> shift
    }

    /// Modular wrap of `v` into this unsigned width.
    pub fn wrap_uint(&self, v: u64) -> u64 {
        match self.max_uint() {
            Some(mask) if self.bits() < 64 => v & mask,
            _ => v,
        }
    }
}
