//! Type definitions shared by expression and statement nodes.
//!
//! This module contains the small enums that tag IR nodes (operators, call
//! kinds, loop kinds, memory kinds) and the constant value representation.

use kiln_dtype::{Type, TypeCode};

/// Constant value stored in a `Const` node.
///
/// Booleans are `UInt` constants of a one-bit type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConstValue {
    Int(i64),
    UInt(u64),
    Float(f64),
}

impl ConstValue {
    /// Convert to the representation of `to`, wrapping integers to its width.
    pub fn cast(self, to: Type) -> Option<ConstValue> {
        Some(match (self, to.code()) {
            (Self::Int(v), TypeCode::Int) => Self::Int(to.wrap_int(v)),
            (Self::Int(v), TypeCode::UInt) if to.is_bool() => Self::UInt(u64::from(v != 0)),
            (Self::Int(v), TypeCode::UInt) => Self::UInt(to.wrap_uint(v as u64)),
            (Self::Int(v), TypeCode::Float) => Self::Float(v as f64),
            (Self::UInt(v), TypeCode::Int) => Self::Int(to.wrap_int(v as i64)),
            (Self::UInt(v), TypeCode::UInt) if to.is_bool() => Self::UInt(u64::from(v != 0)),
            (Self::UInt(v), TypeCode::UInt) => Self::UInt(to.wrap_uint(v)),
            (Self::UInt(v), TypeCode::Float) => Self::Float(v as f64),
            (Self::Float(v), TypeCode::Int) => Self::Int(to.wrap_int(v as i64)),
            (Self::Float(v), TypeCode::UInt) if to.is_bool() => Self::UInt(u64::from(v != 0.0)),
            (Self::Float(v), TypeCode::UInt) => Self::UInt(to.wrap_uint(v as u64)),
            (Self::Float(v), TypeCode::Float) if to.bits() == 32 => Self::Float(f64::from(v as f32)),
            (Self::Float(v), TypeCode::Float) => Self::Float(v),
            (_, TypeCode::Handle) => return None,
        })
    }

    /// Value as a signed integer when it is exactly one.
    pub fn as_i64(self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(v),
            Self::UInt(v) => i64::try_from(v).ok(),
            Self::Float(_) => None,
        }
    }

    pub fn as_f64(self) -> f64 {
        match self {
            Self::Int(v) => v as f64,
            Self::UInt(v) => v as f64,
            Self::Float(v) => v,
        }
    }

    pub fn is_zero(self) -> bool {
        match self {
            Self::Int(v) => v == 0,
            Self::UInt(v) => v == 0,
            Self::Float(v) => v == 0.0,
        }
    }

    pub fn is_one(self) -> bool {
        match self {
            Self::Int(v) => v == 1,
            Self::UInt(v) => v == 1,
            Self::Float(v) => v == 1.0,
        }
    }
}

/// Binary operators.
///
/// Integer `Div` and `Mod` are Euclidean (the remainder is never negative),
/// so `a == (a / b) * b + a % b` holds for any non-zero `b`. Division or
/// modulo by zero yields zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(strum::Display, strum::EnumIter)]
pub enum BinOp {
    #[strum(to_string = "+")]
    Add,
    #[strum(to_string = "-")]
    Sub,
    #[strum(to_string = "*")]
    Mul,
    #[strum(to_string = "/")]
    Div,
    #[strum(to_string = "%")]
    Mod,
    #[strum(to_string = "min")]
    Min,
    #[strum(to_string = "max")]
    Max,
    #[strum(to_string = "==")]
    Eq,
    #[strum(to_string = "!=")]
    Ne,
    #[strum(to_string = "<")]
    Lt,
    #[strum(to_string = "<=")]
    Le,
    #[strum(to_string = ">")]
    Gt,
    #[strum(to_string = ">=")]
    Ge,
    #[strum(to_string = "&&")]
    And,
    #[strum(to_string = "||")]
    Or,
}

impl BinOp {
    /// Operator yields a boolean.
    pub const fn is_comparison(self) -> bool {
        matches!(self, Self::Eq | Self::Ne | Self::Lt | Self::Le | Self::Gt | Self::Ge)
    }

    pub const fn is_logical(self) -> bool {
        matches!(self, Self::And | Self::Or)
    }

    /// `op(a, b) == op(b, a)`.
    pub const fn is_commutative(self) -> bool {
        matches!(self, Self::Add | Self::Mul | Self::Min | Self::Max | Self::Eq | Self::Ne | Self::And | Self::Or)
    }

    /// Comparison with operands swapped: `a < b` is `b > a`.
    pub const fn flipped(self) -> Self {
        match self {
            Self::Lt => Self::Gt,
            Self::Le => Self::Ge,
            Self::Gt => Self::Lt,
            Self::Ge => Self::Le,
            other => other,
        }
    }

    /// Logical negation of a comparison: `!(a < b)` is `a >= b`.
    pub const fn negated(self) -> Option<Self> {
        Some(match self {
            Self::Eq => Self::Ne,
            Self::Ne => Self::Eq,
            Self::Lt => Self::Ge,
            Self::Le => Self::Gt,
            Self::Gt => Self::Le,
            Self::Ge => Self::Lt,
            _ => return None,
        })
    }
}

/// What a `Call` node refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, strum::Display)]
pub enum CallType {
    /// Load from an input image/buffer parameter.
    Image,
    /// Opaque function with side effects.
    Extern,
    /// Opaque function without side effects (math library).
    PureExtern,
    /// Call to another pipeline function.
    Halide,
    /// Compiler intrinsic with side effects.
    Intrinsic,
    /// Compiler intrinsic without side effects.
    PureIntrinsic,
}

impl CallType {
    pub const fn is_pure(self) -> bool {
        matches!(self, Self::PureExtern | Self::PureIntrinsic | Self::Halide | Self::Image)
    }

    pub const fn is_extern(self) -> bool {
        matches!(self, Self::Extern | Self::PureExtern)
    }

    pub const fn is_intrinsic(self) -> bool {
        matches!(self, Self::Intrinsic | Self::PureIntrinsic)
    }
}

/// Compiler intrinsics with a fixed meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(strum::Display, strum::EnumString, strum::IntoStaticStr, strum::EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum Intrinsic {
    Abs,
    Lerp,
    /// Marks the branch expected to be taken.
    Likely,
    /// `likely`, but only when the enclosing loop is the innermost one.
    LikelyIfInnermost,
    ReturnSecond,
    Undef,
    BitwiseAnd,
    BitwiseOr,
    BitwiseXor,
    BitwiseNot,
    ShiftLeft,
    ShiftRight,
    GpuThreadBarrier,
    /// Marks a value as clamped to its second and third arguments.
    PromiseClamped,
    /// `require(cond, value, error)`.
    Require,
    /// Address of a stack value.
    AddressOf,
    /// Stack allocation of the given number of bytes.
    Alloca,
}

impl Intrinsic {
    pub const fn is_pure(self) -> bool {
        !matches!(self, Self::GpuThreadBarrier | Self::Require | Self::AddressOf | Self::Alloca | Self::Undef)
    }

    pub fn name(self) -> &'static str {
        self.into()
    }
}

/// Loop kind of a `For` node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ForType {
    #[default]
    Serial,
    Parallel,
    Vectorized,
    Unrolled,
    Extern,
    GpuBlock,
    GpuThread,
    GpuLane,
}

impl ForType {
    pub const fn is_gpu(self) -> bool {
        matches!(self, Self::GpuBlock | Self::GpuThread | Self::GpuLane)
    }

    /// Iterations may run concurrently.
    pub const fn is_parallel(self) -> bool {
        matches!(self, Self::Parallel | Self::GpuBlock | Self::GpuThread | Self::GpuLane)
    }

    /// Loop over threads within a block (thread or lane loop).
    pub const fn is_gpu_thread(self) -> bool {
        matches!(self, Self::GpuThread | Self::GpuLane)
    }
}

/// Device a loop runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, strum::Display)]
pub enum DeviceApi {
    #[default]
    None,
    Host,
    DefaultGpu,
    Cuda,
    OpenCl,
    Metal,
}

/// Storage class of an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum MemoryType {
    #[default]
    Auto,
    Heap,
    Stack,
    Register,
    GpuShared,
}

/// Horizontal reduction of a vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum VectorReduceOp {
    Add,
    Mul,
    Min,
    Max,
    And,
    Or,
}

/// Runtime entry points emitted as `Extern` calls by lowering passes.
pub mod runtime {
    /// `kiln_make_semaphore(initial)`: stack semaphore handle, before lowering.
    pub const MAKE_SEMAPHORE: &str = "kiln_make_semaphore";
    /// `kiln_semaphore_init(sema, count)`.
    pub const SEMAPHORE_INIT: &str = "kiln_semaphore_init";
    /// `kiln_semaphore_release(sema, count)`.
    pub const SEMAPHORE_RELEASE: &str = "kiln_semaphore_release";
}
