//! Core `Expr` struct and fundamental accessors.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use kiln_dtype::Type;
use smallvec::SmallVec;

use super::rdom::ReductionDomain;
use crate::types::{BinOp, CallType, ConstValue, Intrinsic, VectorReduceOp};

// Monotonic node ids. Only uniqueness matters, so relaxed ordering is enough.
static EXPR_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

pub(crate) fn next_node_id() -> u64 {
    EXPR_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Immutable expression node.
///
/// Nodes are shared through `Arc`. Identity equality is `Arc::ptr_eq` (or
/// `id`); structural equality is [`crate::equal`]. `PartialEq` is structural.
#[derive(derive_more::Debug)]
pub struct Expr {
    /// Unique stable id of this node instance.
    #[debug(skip)]
    pub id: u64,
    pub(crate) ty: Type,
    pub(crate) kind: ExprKind,
}

/// Expression variants.
#[derive(Debug, Clone)]
pub enum ExprKind {
    Const(ConstValue),
    StringImm(String),
    Variable(Variable),
    /// Numeric conversion to the node's type.
    Cast(Arc<Expr>),
    /// Bit reinterpretation to the node's type.
    Reinterpret(Arc<Expr>),
    Binary(BinOp, Arc<Expr>, Arc<Expr>),
    Not(Arc<Expr>),
    Select(Arc<Expr>, Arc<Expr>, Arc<Expr>),
    Load(Load),
    Ramp { base: Arc<Expr>, stride: Arc<Expr>, lanes: u16 },
    Broadcast { value: Arc<Expr>, lanes: u16 },
    Shuffle { vectors: SmallVec<[Arc<Expr>; 2]>, indices: Vec<u32> },
    VectorReduce { op: VectorReduceOp, value: Arc<Expr> },
    Call(Call),
    Let { name: String, value: Arc<Expr>, body: Arc<Expr> },
}

/// Named variable reference.
#[derive(Debug, Clone)]
pub struct Variable {
    pub name: String,
    pub kind: VarKind,
}

/// What a variable is bound to, beyond its name.
#[derive(Debug, Clone, Default)]
pub enum VarKind {
    /// Loop variable, let binding or pure function argument.
    #[default]
    Plain,
    /// Reduction variable of the given domain.
    Reduction(ReductionDomain),
    /// Scalar pipeline parameter.
    Param,
}

/// Flat load from a named buffer.
#[derive(Debug, Clone)]
pub struct Load {
    pub name: String,
    pub index: Arc<Expr>,
    pub predicate: Arc<Expr>,
}

/// Call to a function, buffer, extern or intrinsic.
#[derive(Debug, Clone)]
pub struct Call {
    pub name: String,
    pub args: SmallVec<[Arc<Expr>; 4]>,
    pub call_type: CallType,
    /// Tuple element selected from a multi-valued function.
    pub value_index: usize,
}

impl Call {
    pub fn is_intrinsic(&self, intrinsic: Intrinsic) -> bool {
        self.call_type.is_intrinsic() && self.name == intrinsic.name()
    }

    pub fn intrinsic(&self) -> Option<Intrinsic> {
        if self.call_type.is_intrinsic() { self.name.parse().ok() } else { None }
    }

    /// Reads a pipeline function or an input buffer.
    pub fn is_data_access(&self) -> bool {
        matches!(self.call_type, CallType::Halide | CallType::Image)
    }
}

impl PartialEq for Expr {
    fn eq(&self, other: &Self) -> bool {
        crate::equality::equal_nodes(self, other)
    }
}

impl Expr {
    pub fn new(kind: ExprKind, ty: Type) -> Arc<Self> {
        Arc::new(Self { id: next_node_id(), ty, kind })
    }

    pub fn kind(&self) -> &ExprKind {
        &self.kind
    }

    pub fn ty(&self) -> Type {
        self.ty
    }

    // ========================================================================
    // Constant queries
    // ========================================================================

    /// Constant value, looking through broadcasts.
    pub fn as_const(&self) -> Option<ConstValue> {
        match &self.kind {
            ExprKind::Const(c) => Some(*c),
            ExprKind::Broadcast { value, .. } => value.as_const(),
            _ => None,
        }
    }

    /// Integer constant value, looking through broadcasts.
    pub fn as_int(&self) -> Option<i64> {
        self.as_const().and_then(ConstValue::as_i64)
    }

    pub fn as_float(&self) -> Option<f64> {
        match self.as_const()? {
            ConstValue::Float(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_const(&self) -> bool {
        self.as_const().is_some()
    }

    /// Constant equal to `v` (in any numeric representation).
    pub fn is_const_value(&self, v: i64) -> bool {
        match self.as_const() {
            Some(ConstValue::Float(f)) => f == v as f64,
            Some(c) => c.as_i64() == Some(v),
            None => false,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.as_const().is_some_and(ConstValue::is_zero)
    }

    pub fn is_one(&self) -> bool {
        self.as_const().is_some_and(ConstValue::is_one)
    }

    pub fn is_true(&self) -> bool {
        self.ty.is_bool() && self.is_one()
    }

    pub fn is_false(&self) -> bool {
        self.ty.is_bool() && self.is_zero()
    }

    // ========================================================================
    // Variant accessors
    // ========================================================================

    pub fn as_variable(&self) -> Option<&Variable> {
        match &self.kind {
            ExprKind::Variable(v) => Some(v),
            _ => None,
        }
    }

    pub fn var_name(&self) -> Option<&str> {
        self.as_variable().map(|v| v.name.as_str())
    }

    /// Reduction domain of a reduction variable.
    pub fn reduction_domain(&self) -> Option<&ReductionDomain> {
        match &self.kind {
            ExprKind::Variable(Variable { kind: VarKind::Reduction(rdom), .. }) => Some(rdom),
            _ => None,
        }
    }

    pub fn as_call(&self) -> Option<&Call> {
        match &self.kind {
            ExprKind::Call(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_load(&self) -> Option<&Load> {
        match &self.kind {
            ExprKind::Load(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_binary(&self) -> Option<(BinOp, &Arc<Expr>, &Arc<Expr>)> {
        match &self.kind {
            ExprKind::Binary(op, a, b) => Some((*op, a, b)),
            _ => None,
        }
    }

    /// Operands of a binary node with operator `op`.
    pub fn as_op(&self, op: BinOp) -> Option<(&Arc<Expr>, &Arc<Expr>)> {
        match &self.kind {
            ExprKind::Binary(o, a, b) if *o == op => Some((a, b)),
            _ => None,
        }
    }

    pub fn is_intrinsic(&self, intrinsic: Intrinsic) -> bool {
        self.as_call().is_some_and(|c| c.is_intrinsic(intrinsic))
    }

    /// Argument of `likely(...)` or `likely_if_innermost(...)`.
    pub fn as_likely(&self) -> Option<&Arc<Expr>> {
        let call = self.as_call()?;
        if call.is_intrinsic(Intrinsic::Likely) || call.is_intrinsic(Intrinsic::LikelyIfInnermost) {
            call.args.first()
        } else {
            None
        }
    }

    /// Direct child expressions in evaluation order.
    pub fn children(&self) -> SmallVec<[&Arc<Expr>; 4]> {
        let mut out = SmallVec::new();
        match &self.kind {
            ExprKind::Const(_) | ExprKind::StringImm(_) | ExprKind::Variable(_) => {}
            ExprKind::Cast(a) | ExprKind::Reinterpret(a) | ExprKind::Not(a) => out.push(a),
            ExprKind::Binary(_, a, b) => out.extend([a, b]),
            ExprKind::Select(c, t, f) => out.extend([c, t, f]),
            ExprKind::Load(l) => out.extend([&l.index, &l.predicate]),
            ExprKind::Ramp { base, stride, .. } => out.extend([base, stride]),
            ExprKind::Broadcast { value, .. } | ExprKind::VectorReduce { value, .. } => out.push(value),
            ExprKind::Shuffle { vectors, .. } => out.extend(vectors.iter()),
            ExprKind::Call(c) => out.extend(c.args.iter()),
            ExprKind::Let { value, body, .. } => out.extend([value, body]),
        }
        out
    }

    /// Free of loads and side-effecting calls.
    pub fn is_pure(&self) -> bool {
        match &self.kind {
            ExprKind::Load(_) => false,
            ExprKind::Call(c) if !c.call_type.is_pure() => false,
            _ => self.children().iter().all(|c| c.is_pure()),
        }
    }
}

/// Conversion into an expression of a requested type.
///
/// Rust literals become constants of `ty`; expressions are passed through.
pub trait IntoExpr {
    fn into_expr(self, ty: Type) -> Arc<Expr>;
}

impl IntoExpr for Arc<Expr> {
    fn into_expr(self, _ty: Type) -> Arc<Expr> {
        self
    }
}

impl IntoExpr for &Arc<Expr> {
    fn into_expr(self, _ty: Type) -> Arc<Expr> {
        self.clone()
    }
}

impl IntoExpr for i32 {
    fn into_expr(self, ty: Type) -> Arc<Expr> {
        Expr::make_const(ty, i64::from(self))
    }
}

impl IntoExpr for i64 {
    fn into_expr(self, ty: Type) -> Arc<Expr> {
        Expr::make_const(ty, self)
    }
}

impl IntoExpr for f64 {
    fn into_expr(self, ty: Type) -> Arc<Expr> {
        if ty.is_float() { Expr::const_(ty, ConstValue::Float(self)) } else { Expr::make_const(ty, self as i64) }
    }
}

impl IntoExpr for bool {
    fn into_expr(self, ty: Type) -> Arc<Expr> {
        Expr::bool_(self, ty.lanes())
    }
}
