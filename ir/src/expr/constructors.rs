//! Expression constructors.
//!
//! Binary operator methods accept anything implementing [`IntoExpr`], so
//! literals adopt the type of the other operand:
//!
//! ```rust
//! # use kiln_ir::Expr;
//! let x = Expr::var("x");
//! let e = x.mul(3).add(&Expr::var("y"));
//! assert_eq!(e.to_string(), "((x*3) + y)");
//! ```

use std::sync::Arc;

use kiln_dtype::{Type, TypeCode};
use smallvec::SmallVec;

use super::core::{Call, Expr, ExprKind, IntoExpr, Load, VarKind, Variable};
use super::rdom::ReductionDomain;
use crate::types::{BinOp, CallType, ConstValue, Intrinsic, VectorReduceOp};

impl Expr {
    // ========================================================================
    // Constants
    // ========================================================================

    /// Constant of type `ty` (broadcast for vector types).
    pub fn const_(ty: Type, value: ConstValue) -> Arc<Self> {
        let scalar = ty.element_of();
        let value = value.cast(scalar).unwrap_or(value);
        let c = Self::new(ExprKind::Const(value), scalar);
        if ty.is_vector() { Self::broadcast(c, ty.lanes()) } else { c }
    }

    /// Integer-valued constant of any numeric type.
    pub fn make_const(ty: Type, value: i64) -> Arc<Self> {
        let value = match ty.code() {
            TypeCode::Float => ConstValue::Float(value as f64),
            _ => ConstValue::Int(value),
        };
        Self::const_(ty, value)
    }

    pub fn make_zero(ty: Type) -> Arc<Self> {
        Self::make_const(ty, 0)
    }

    pub fn make_one(ty: Type) -> Arc<Self> {
        Self::make_const(ty, 1)
    }

    /// 32-bit signed integer constant.
    pub fn int(value: i64) -> Arc<Self> {
        Self::make_const(Type::I32, value)
    }

    /// 32-bit float constant.
    pub fn float(value: f64) -> Arc<Self> {
        Self::const_(Type::F32, ConstValue::Float(value))
    }

    pub fn bool_(value: bool, lanes: u16) -> Arc<Self> {
        Self::const_(Type::BOOL.with_lanes(lanes), ConstValue::UInt(u64::from(value)))
    }

    pub fn const_true() -> Arc<Self> {
        Self::bool_(true, 1)
    }

    pub fn const_false() -> Arc<Self> {
        Self::bool_(false, 1)
    }

    pub fn string(value: impl Into<String>) -> Arc<Self> {
        Self::new(ExprKind::StringImm(value.into()), Type::HANDLE)
    }

    /// Largest value of `ty`.
    pub fn type_max(ty: Type) -> Arc<Self> {
        let scalar = ty.element_of();
        let value = match ty.code() {
            TypeCode::Int => ConstValue::Int(scalar.max_int().unwrap_or(i64::MAX)),
            TypeCode::UInt => ConstValue::UInt(scalar.max_uint().unwrap_or(u64::MAX)),
            TypeCode::Float => ConstValue::Float(f64::INFINITY),
            TypeCode::Handle => ConstValue::UInt(u64::MAX),
        };
        Self::const_(ty, value)
    }

    /// Smallest value of `ty`.
    pub fn type_min(ty: Type) -> Arc<Self> {
        let scalar = ty.element_of();
        let value = match ty.code() {
            TypeCode::Int => ConstValue::Int(scalar.min_int().unwrap_or(i64::MIN)),
            TypeCode::UInt | TypeCode::Handle => ConstValue::UInt(0),
            TypeCode::Float => ConstValue::Float(f64::NEG_INFINITY),
        };
        Self::const_(ty, value)
    }

    // ========================================================================
    // Variables
    // ========================================================================

    /// 32-bit integer variable.
    pub fn var(name: impl Into<String>) -> Arc<Self> {
        Self::typed_var(Type::I32, name)
    }

    pub fn typed_var(ty: Type, name: impl Into<String>) -> Arc<Self> {
        Self::new(ExprKind::Variable(Variable { name: name.into(), kind: VarKind::Plain }), ty)
    }

    /// Scalar pipeline parameter.
    pub fn param(ty: Type, name: impl Into<String>) -> Arc<Self> {
        Self::new(ExprKind::Variable(Variable { name: name.into(), kind: VarKind::Param }), ty)
    }

    /// Reduction variable `name` of `rdom`.
    pub fn rvar(name: impl Into<String>, rdom: &ReductionDomain) -> Arc<Self> {
        Self::new(ExprKind::Variable(Variable { name: name.into(), kind: VarKind::Reduction(rdom.clone()) }), Type::I32)
    }

    // ========================================================================
    // Conversions
    // ========================================================================

    /// Numeric conversion; a no-op when the type already matches.
    pub fn cast(self: &Arc<Self>, ty: Type) -> Arc<Self> {
        if self.ty == ty {
            return self.clone();
        }
        if self.ty.is_vector() && ty.is_scalar() {
            return Self::new(ExprKind::Cast(self.clone()), ty.with_lanes(self.ty.lanes()));
        }
        Self::new(ExprKind::Cast(self.clone()), ty)
    }

    pub fn reinterpret(self: &Arc<Self>, ty: Type) -> Arc<Self> {
        if self.ty == ty { self.clone() } else { Self::new(ExprKind::Reinterpret(self.clone()), ty) }
    }

    /// Bring two operands to a common type.
    ///
    /// Scalars are broadcast to the other side's lanes, constants adopt the
    /// type of a non-constant partner, integers widen, and mixed
    /// float/integer pairs convert to the float type.
    pub fn match_types(a: Arc<Self>, b: Arc<Self>) -> (Arc<Self>, Arc<Self>) {
        if a.ty == b.ty {
            return (a, b);
        }
        let (a, b) = match (a.ty.lanes(), b.ty.lanes()) {
            (la, lb) if la == lb => (a, b),
            (1, lb) => (Self::broadcast(a, lb), b),
            (la, 1) => {
                let b = Self::broadcast(b, la);
                (a, b)
            }
            (la, lb) => panic!("cannot match vector types with {la} and {lb} lanes"),
        };
        if a.ty == b.ty {
            return (a, b);
        }
        match (a.as_const(), b.as_const()) {
            (Some(c), None) => return (Self::const_(b.ty, c), b),
            (None, Some(c)) => return (a.clone(), Self::const_(a.ty, c)),
            _ => {}
        }
        let (ta, tb) = (a.ty, b.ty);
        let target = match (ta.is_float(), tb.is_float()) {
            (true, false) => ta,
            (false, true) => tb,
            (true, true) => {
                if ta.bits() >= tb.bits() {
                    ta
                } else {
                    tb
                }
            }
            (false, false) if ta.bits() != tb.bits() => {
                if ta.bits() > tb.bits() {
                    ta
                } else {
                    tb
                }
            }
            (false, false) => {
                if ta.is_int() {
                    ta
                } else {
                    tb
                }
            }
        };
        (a.cast(target), b.cast(target))
    }

    // ========================================================================
    // Operators
    // ========================================================================

    /// Binary node with operand types matched.
    pub fn binary(op: BinOp, a: Arc<Self>, b: Arc<Self>) -> Arc<Self> {
        let (a, b) =
            if op.is_logical() { Self::match_types(a.as_bool(), b.as_bool()) } else { Self::match_types(a, b) };
        let ty = if op.is_comparison() || op.is_logical() { Type::BOOL.with_lanes(a.ty.lanes()) } else { a.ty };
        Self::new(ExprKind::Binary(op, a, b), ty)
    }

    fn as_bool(self: Arc<Self>) -> Arc<Self> {
        if self.ty.is_bool() { self } else { self.cmp_ne(0) }
    }

    pub fn not(self: &Arc<Self>) -> Arc<Self> {
        let ty = Type::BOOL.with_lanes(self.ty.lanes());
        Self::new(ExprKind::Not(self.clone().as_bool()), ty)
    }

    /// Arithmetic negation, `0 - self`.
    pub fn neg(self: &Arc<Self>) -> Arc<Self> {
        Self::binary(BinOp::Sub, Self::make_zero(self.ty), self.clone())
    }

    pub fn select(condition: Arc<Self>, true_value: Arc<Self>, false_value: Arc<Self>) -> Arc<Self> {
        let (t, f) = Self::match_types(true_value, false_value);
        let condition = if condition.ty.lanes() != t.ty.lanes() && condition.ty.is_scalar() {
            Self::broadcast(condition, t.ty.lanes())
        } else {
            condition
        };
        let ty = t.ty;
        Self::new(ExprKind::Select(condition, t, f), ty)
    }

    /// `max(min(self, hi), lo)`.
    pub fn clamp(self: &Arc<Self>, lo: impl IntoExpr, hi: impl IntoExpr) -> Arc<Self> {
        self.min(hi).max(lo)
    }

    /// Absolute value, typed unsigned for signed integers.
    pub fn abs(self: &Arc<Self>) -> Arc<Self> {
        let ty = if self.ty.is_int() { self.ty.with_code(TypeCode::UInt) } else { self.ty };
        Self::intrinsic(Intrinsic::Abs, ty, [self.clone()])
    }

    pub fn likely(self: &Arc<Self>) -> Arc<Self> {
        Self::intrinsic(Intrinsic::Likely, self.ty, [self.clone()])
    }

    pub fn let_in(name: impl Into<String>, value: Arc<Self>, body: Arc<Self>) -> Arc<Self> {
        let ty = body.ty;
        Self::new(ExprKind::Let { name: name.into(), value, body }, ty)
    }

    // ========================================================================
    // Memory and vectors
    // ========================================================================

    pub fn load(ty: Type, name: impl Into<String>, index: Arc<Self>) -> Arc<Self> {
        let predicate = Self::bool_(true, index.ty.lanes());
        Self::load_predicated(ty, name, index, predicate)
    }

    pub fn load_predicated(ty: Type, name: impl Into<String>, index: Arc<Self>, predicate: Arc<Self>) -> Arc<Self> {
        let ty = ty.with_lanes(index.ty.lanes());
        Self::new(ExprKind::Load(Load { name: name.into(), index, predicate }), ty)
    }

    pub fn ramp(base: Arc<Self>, stride: Arc<Self>, lanes: u16) -> Arc<Self> {
        let (base, stride) = Self::match_types(base, stride);
        let ty = base.ty.with_lanes(base.ty.lanes() * lanes);
        Self::new(ExprKind::Ramp { base, stride, lanes }, ty)
    }

    pub fn broadcast(value: Arc<Self>, lanes: u16) -> Arc<Self> {
        if lanes == 1 {
            return value;
        }
        let ty = value.ty.with_lanes(value.ty.lanes() * lanes);
        Self::new(ExprKind::Broadcast { value, lanes }, ty)
    }

    pub fn shuffle(vectors: SmallVec<[Arc<Self>; 2]>, indices: Vec<u32>) -> Arc<Self> {
        let element = vectors.first().map_or(Type::I32, |v| v.ty.element_of());
        let ty = element.with_lanes(indices.len() as u16);
        Self::new(ExprKind::Shuffle { vectors, indices }, ty)
    }

    pub fn vector_reduce(op: VectorReduceOp, value: Arc<Self>, lanes: u16) -> Arc<Self> {
        let ty = value.ty.with_lanes(lanes);
        Self::new(ExprKind::VectorReduce { op, value }, ty)
    }

    // ========================================================================
    // Calls
    // ========================================================================

    pub fn call<I>(ty: Type, name: impl Into<String>, args: I, call_type: CallType, value_index: usize) -> Arc<Self>
    where
        I: IntoIterator<Item = Arc<Self>>,
    {
        let call = Call { name: name.into(), args: args.into_iter().collect(), call_type, value_index };
        Self::new(ExprKind::Call(call), ty)
    }

    /// Call to the pipeline function `name`, selecting tuple element `value_index`.
    pub fn func_call<I>(ty: Type, name: impl Into<String>, args: I, value_index: usize) -> Arc<Self>
    where
        I: IntoIterator<Item = Arc<Self>>,
    {
        Self::call(ty, name, args, CallType::Halide, value_index)
    }

    /// Read of the input buffer `name`.
    pub fn image_call<I>(ty: Type, name: impl Into<String>, args: I) -> Arc<Self>
    where
        I: IntoIterator<Item = Arc<Self>>,
    {
        Self::call(ty, name, args, CallType::Image, 0)
    }

    /// Call to a side-effect free extern (math library) function.
    pub fn extern_call<I>(ty: Type, name: impl Into<String>, args: I) -> Arc<Self>
    where
        I: IntoIterator<Item = Arc<Self>>,
    {
        Self::call(ty, name, args, CallType::PureExtern, 0)
    }

    pub fn intrinsic<I>(intrinsic: Intrinsic, ty: Type, args: I) -> Arc<Self>
    where
        I: IntoIterator<Item = Arc<Self>>,
    {
        let call_type = if intrinsic.is_pure() { CallType::PureIntrinsic } else { CallType::Intrinsic };
        Self::call(ty, intrinsic.name(), args, call_type, 0)
    }
}

/// Generates binary operator methods that accept literals or expressions.
macro_rules! binary_methods {
    ($($method:ident => $op:ident),+ $(,)?) => {
        impl Expr {
            $(
                #[doc = concat!("`", stringify!($op), "` of `self` and `rhs` with types matched.")]
                pub fn $method<T: IntoExpr>(self: &Arc<Self>, rhs: T) -> Arc<Self> {
                    let rhs = rhs.into_expr(self.ty);
                    Self::binary(BinOp::$op, self.clone(), rhs)
                }
            )+
        }
    };
}

binary_methods! {
    add => Add,
    sub => Sub,
    mul => Mul,
    div => Div,
    modulo => Mod,
    min => Min,
    max => Max,
    cmp_eq => Eq,
    cmp_ne => Ne,
    cmp_lt => Lt,
    cmp_le => Le,
    cmp_gt => Gt,
    cmp_ge => Ge,
    and => And,
    or => Or,
}
