//! Binary operators recognised as associative, with their identities.

use std::sync::Arc;

use kiln_ir::{BinOp, Expr, Type};

/// How an update's top-level operator maps onto an associative operator.
#[derive(Debug, Clone)]
pub struct AssociativePattern {
    /// Operator combining two partial results.
    pub op: BinOp,
    /// Value `e` with `op(e, y) == y` for every `y`.
    pub identity: Arc<Expr>,
    pub is_commutative: bool,
    /// The non-self operand enters the operator negated (`x - y` is `x + (-y)`).
    pub negate_operand: bool,
}

/// Pattern for an update whose top-level operator is `op`, at type `ty`.
pub fn lookup(op: BinOp, ty: Type) -> Option<AssociativePattern> {
    let (combine, identity, negate_operand) = match op {
        BinOp::Add => (BinOp::Add, Expr::make_zero(ty), false),
        BinOp::Sub if !ty.is_uint() => (BinOp::Add, Expr::make_zero(ty), true),
        BinOp::Mul => (BinOp::Mul, Expr::make_one(ty), false),
        BinOp::Min => (BinOp::Min, Expr::type_max(ty), false),
        BinOp::Max => (BinOp::Max, Expr::type_min(ty), false),
        BinOp::And => (BinOp::And, Expr::bool_(true, ty.lanes()), false),
        BinOp::Or => (BinOp::Or, Expr::bool_(false, ty.lanes()), false),
        _ => return None,
    };
    Some(AssociativePattern { op: combine, identity, is_commutative: combine.is_commutative(), negate_operand })
}
