//! Element types for the kiln IR.
//!
//! A [`Type`] is a scalar or SIMD vector of one numeric kind ([`TypeCode`]) with
//! a bit width and a lane count. Booleans are one-bit unsigned integers, which
//! keeps comparison results and masks inside the same arithmetic lattice.
//!
//! # Module Organization
//!
//! - [`limits`] - Representable ranges and wrapping of constants into a type
//! - `proptest_gen` - Strategies for property tests (feature `proptest`)

pub mod limits;

#[cfg(feature = "proptest")]
pub mod proptest_gen;

#[cfg(test)]
pub mod test;

use enumset::EnumSet;

/// Numeric kind of a [`Type`].
#[derive(Debug, Hash, PartialOrd, Ord)]
#[derive(strum::Display, strum::EnumCount, strum::EnumIter, strum::VariantArray)]
#[derive(enumset::EnumSetType)]
#[strum(serialize_all = "lowercase")]
#[cfg_attr(feature = "proptest", derive(proptest_derive::Arbitrary))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TypeCode {
    Int,
    UInt,
    Float,
    /// Opaque pointer-sized value (semaphores, buffers, user context).
    Handle,
}

/// Codes that support arithmetic.
pub const NUMERIC: EnumSet<TypeCode> = enumset::enum_set!(TypeCode::Int | TypeCode::UInt | TypeCode::Float);

/// Codes with exact integer semantics.
pub const INTEGRAL: EnumSet<TypeCode> = enumset::enum_set!(TypeCode::Int | TypeCode::UInt);

/// Element type of an IR value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Type {
    code: TypeCode,
    bits: u8,
    lanes: u16,
}

impl Type {
    pub const BOOL: Type = Type::new(TypeCode::UInt, 1, 1);
    pub const I8: Type = Type::new(TypeCode::Int, 8, 1);
    pub const I16: Type = Type::new(TypeCode::Int, 16, 1);
    pub const I32: Type = Type::new(TypeCode::Int, 32, 1);
    pub const I64: Type = Type::new(TypeCode::Int, 64, 1);
    pub const U8: Type = Type::new(TypeCode::UInt, 8, 1);
    pub const U16: Type = Type::new(TypeCode::UInt, 16, 1);
    pub const U32: Type = Type::new(TypeCode::UInt, 32, 1);
    pub const U64: Type = Type::new(TypeCode::UInt, 64, 1);
    pub const F16: Type = Type::new(TypeCode::Float, 16, 1);
    pub const F32: Type = Type::new(TypeCode::Float, 32, 1);
    pub const F64: Type = Type::new(TypeCode::Float, 64, 1);
    pub const HANDLE: Type = Type::new(TypeCode::Handle, 64, 1);

    pub const fn new(code: TypeCode, bits: u8, lanes: u16) -> Self {
        Self { code, bits, lanes }
    }

    pub const fn int(bits: u8) -> Self {
        Self::new(TypeCode::Int, bits, 1)
    }

    pub const fn uint(bits: u8) -> Self {
        Self::new(TypeCode::UInt, bits, 1)
    }

    pub const fn float(bits: u8) -> Self {
        Self::new(TypeCode::Float, bits, 1)
    }

    pub const fn code(&self) -> TypeCode {
        self.code
    }

    pub const fn bits(&self) -> u8 {
        self.bits
    }

    pub const fn lanes(&self) -> u16 {
        self.lanes
    }

    /// Storage size of one element in bytes.
    pub const fn bytes(&self) -> usize {
        (self.bits as usize).div_ceil(8)
    }

    // ========================================================================
    // Type Constructors
    // ========================================================================

    pub const fn with_lanes(self, lanes: u16) -> Self {
        Self { lanes, ..self }
    }

    pub const fn with_bits(self, bits: u8) -> Self {
        Self { bits, ..self }
    }

    pub const fn with_code(self, code: TypeCode) -> Self {
        Self { code, ..self }
    }

    /// Scalar type of one lane.
    pub const fn element_of(self) -> Self {
        self.with_lanes(1)
    }

    // ========================================================================
    // Classification
    // ========================================================================

    pub const fn is_bool(&self) -> bool {
        matches!(self.code, TypeCode::UInt) && self.bits == 1
    }

    pub const fn is_int(&self) -> bool {
        matches!(self.code, TypeCode::Int)
    }

    pub const fn is_uint(&self) -> bool {
        matches!(self.code, TypeCode::UInt)
    }

    pub const fn is_float(&self) -> bool {
        matches!(self.code, TypeCode::Float)
    }

    pub const fn is_handle(&self) -> bool {
        matches!(self.code, TypeCode::Handle)
    }

    pub const fn is_scalar(&self) -> bool {
        self.lanes == 1
    }

    pub const fn is_vector(&self) -> bool {
        self.lanes > 1
    }

    /// Signed or unsigned integer, booleans included.
    pub fn is_integral(&self) -> bool {
        INTEGRAL.contains(self.code)
    }

    pub fn is_one_of(&self, codes: EnumSet<TypeCode>) -> bool {
        codes.contains(self.code)
    }
}

impl Default for Type {
    fn default() -> Self {
        Self::I32
    }
}

impl std::fmt::Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_bool() {
            write!(f, "bool")?;
        } else {
            write!(f, "{}{}", self.code, self.bits)?;
        }
        if self.lanes > 1 {
            write!(f, "x{}", self.lanes)?;
        }
        Ok(())
    }
}
