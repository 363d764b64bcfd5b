//! Constant folding.
//!
//! Integer arithmetic wraps to the operand width. Division and modulo by
//! zero yield zero, matching the evaluation rules of the IR.

use std::sync::Arc;

use kiln_dtype::Type;

use crate::expr::Expr;
use crate::types::{BinOp, ConstValue};

fn bool_value(b: bool) -> ConstValue {
    ConstValue::UInt(u64::from(b))
}

fn compare<T: PartialOrd>(op: BinOp, a: T, b: T) -> Option<bool> {
    Some(match op {
        BinOp::Eq => a == b,
        BinOp::Ne => a != b,
        BinOp::Lt => a < b,
        BinOp::Le => a <= b,
        BinOp::Gt => a > b,
        BinOp::Ge => a >= b,
        _ => return None,
    })
}

fn fold_int(op: BinOp, a: i64, b: i64, ty: Type) -> Option<ConstValue> {
    if let Some(r) = compare(op, a, b) {
        return Some(bool_value(r));
    }
    let v = match op {
        BinOp::Add => a.wrapping_add(b),
        BinOp::Sub => a.wrapping_sub(b),
        BinOp::Mul => a.wrapping_mul(b),
        BinOp::Div => a.checked_div_euclid(b).unwrap_or(0),
        BinOp::Mod => a.checked_rem_euclid(b).unwrap_or(0),
        BinOp::Min => a.min(b),
        BinOp::Max => a.max(b),
        BinOp::And => i64::from(a != 0 && b != 0),
        BinOp::Or => i64::from(a != 0 || b != 0),
        _ => return None,
    };
    Some(ConstValue::Int(ty.wrap_int(v)))
}

fn fold_uint(op: BinOp, a: u64, b: u64, ty: Type) -> Option<ConstValue> {
    if let Some(r) = compare(op, a, b) {
        return Some(bool_value(r));
    }
    let v = match op {
        BinOp::Add => a.wrapping_add(b),
        BinOp::Sub => a.wrapping_sub(b),
        BinOp::Mul => a.wrapping_mul(b),
        BinOp::Div => a.checked_div(b).unwrap_or(0),
        BinOp::Mod => a.checked_rem(b).unwrap_or(0),
        BinOp::Min => a.min(b),
        BinOp::Max => a.max(b),
        BinOp::And => u64::from(a != 0 && b != 0),
        BinOp::Or => u64::from(a != 0 || b != 0),
        _ => return None,
    };
    Some(ConstValue::UInt(if ty.is_bool() { u64::from(v != 0) } else { ty.wrap_uint(v) }))
}

fn fold_float(op: BinOp, a: f64, b: f64, ty: Type) -> Option<ConstValue> {
    if let Some(r) = compare(op, a, b) {
        return Some(bool_value(r));
    }
    let v = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => a / b,
        BinOp::Mod => a - b * (a / b).floor(),
        BinOp::Min => a.min(b),
        BinOp::Max => a.max(b),
        _ => return None,
    };
    Some(ConstValue::Float(if ty.bits() == 32 { f64::from(v as f32) } else { v }))
}

/// `op(x, y)` evaluated at scalar type `ty`.
pub(crate) fn apply_binary(op: BinOp, x: ConstValue, y: ConstValue, ty: Type) -> Option<ConstValue> {
    match (x, y) {
        (ConstValue::Int(p), ConstValue::Int(q)) => fold_int(op, p, q, ty),
        (ConstValue::UInt(p), ConstValue::UInt(q)) => fold_uint(op, p, q, ty),
        (ConstValue::Float(p), ConstValue::Float(q)) => fold_float(op, p, q, ty),
        _ => None,
    }
}

/// Fold `op(a, b)` when both operands are constants (or broadcasts of them).
pub(crate) fn fold_binary(op: BinOp, a: &Arc<Expr>, b: &Arc<Expr>) -> Option<Arc<Expr>> {
    let (x, y) = (a.as_const()?, b.as_const()?);
    let ty = a.ty();
    let value = apply_binary(op, x, y, ty.element_of())?;
    let result_ty = if op.is_comparison() || op.is_logical() { Type::BOOL.with_lanes(ty.lanes()) } else { ty };
    Some(Expr::const_(result_ty, value))
}

/// Fold a cast of a constant.
pub(crate) fn fold_cast(value: &Arc<Expr>, to: Type) -> Option<Arc<Expr>> {
    let c = value.as_const()?;
    let converted = c.cast(to.element_of())?;
    Some(Expr::const_(to, converted))
}

pub(crate) fn fold_not(value: &Arc<Expr>) -> Option<Arc<Expr>> {
    let c = value.as_const()?;
    Some(Expr::bool_(c.is_zero(), value.ty().lanes()))
}
