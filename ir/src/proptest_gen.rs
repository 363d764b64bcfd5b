//! Expression strategies for property tests.

use std::sync::Arc;

use proptest::prelude::*;

use crate::expr::Expr;
use crate::types::BinOp;

/// Variables every generated expression may use.
pub const VARS: [&str; 2] = ["x", "y"];

/// Small integer constants.
pub fn arb_small_const() -> impl Strategy<Value = Arc<Expr>> {
    (-10i64..=10).prop_map(Expr::int)
}

pub fn arb_leaf() -> impl Strategy<Value = Arc<Expr>> {
    prop_oneof![arb_small_const(), prop::sample::select(VARS.to_vec()).prop_map(Expr::var)]
}

/// Non-zero constant divisor.
pub fn arb_divisor() -> impl Strategy<Value = i64> {
    prop_oneof![-5i64..=-1, 1i64..=8]
}

/// 32-bit integer expression over [`VARS`] built from addition, `min`,
/// `max`, multiplication, division and modulo by constants, and `select`.
///
/// Multiplication is only by small constants so values stay far from
/// overflow.
pub fn arb_int_expr() -> impl Strategy<Value = Arc<Expr>> + Clone {
    arb_leaf().prop_recursive(4, 24, 2, |inner| {
        prop_oneof![
            (prop::sample::select(vec![BinOp::Add, BinOp::Sub, BinOp::Min, BinOp::Max]), inner.clone(), inner.clone())
                .prop_map(|(op, a, b)| Expr::binary(op, a, b)),
            (inner.clone(), -4i64..=4).prop_map(|(a, c)| a.mul(c)),
            (inner.clone(), arb_divisor()).prop_map(|(a, c)| a.div(c)),
            (inner.clone(), arb_divisor()).prop_map(|(a, c)| a.modulo(c)),
            (arb_condition_from(inner.clone()), inner.clone(), inner)
                .prop_map(|(c, t, f)| Expr::select(c, t, f)),
        ]
    })
}

fn arb_condition_from(inner: impl Strategy<Value = Arc<Expr>> + Clone) -> impl Strategy<Value = Arc<Expr>> {
    (prop::sample::select(vec![BinOp::Lt, BinOp::Le, BinOp::Eq, BinOp::Ne, BinOp::Gt, BinOp::Ge]), inner.clone(), inner)
        .prop_map(|(op, a, b)| Expr::binary(op, a, b))
}

/// Boolean condition comparing two integer expressions.
pub fn arb_condition() -> impl Strategy<Value = Arc<Expr>> {
    arb_condition_from(arb_int_expr())
}
