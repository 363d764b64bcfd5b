//! Rewrite rules for expression nodes whose children are already simplified.

use std::sync::Arc;

use super::Simplifier;
use super::const_bounds::ConstInterval;
use super::fold::{fold_binary, fold_cast, fold_not};
use super::linear::{LinearForm, is_linear_type};
use crate::equality::{ExprKey, graph_equal};
use crate::expr::{Expr, ExprKind};
use crate::types::{BinOp, ConstValue, Intrinsic};

/// Reuse `original` when it already is `op(a, b)` with these exact operands.
fn rebuild(original: &Arc<Expr>, op: BinOp, a: &Arc<Expr>, b: &Arc<Expr>) -> Arc<Expr> {
    match original.kind() {
        ExprKind::Binary(o, x, y) if *o == op && Arc::ptr_eq(x, a) && Arc::ptr_eq(y, b) => original.clone(),
        _ => Expr::binary(op, a.clone(), b.clone()),
    }
}

fn broadcast_value(e: &Arc<Expr>) -> Option<(&Arc<Expr>, u16)> {
    match e.kind() {
        ExprKind::Broadcast { value, lanes } => Some((value, *lanes)),
        _ => None,
    }
}

fn ramp_parts(e: &Arc<Expr>) -> Option<(&Arc<Expr>, &Arc<Expr>, u16)> {
    match e.kind() {
        ExprKind::Ramp { base, stride, lanes } => Some((base, stride, *lanes)),
        _ => None,
    }
}

/// Truth value of `d op 0` when the bounds of `d` decide it.
fn decide_against_zero(op: BinOp, d: ConstInterval) -> Option<bool> {
    let (lo, hi) = (d.min, d.max);
    match op {
        BinOp::Lt if hi.is_some_and(|h| h < 0) => Some(true),
        BinOp::Lt if lo.is_some_and(|l| l >= 0) => Some(false),
        BinOp::Le if hi.is_some_and(|h| h <= 0) => Some(true),
        BinOp::Le if lo.is_some_and(|l| l > 0) => Some(false),
        BinOp::Gt if lo.is_some_and(|l| l > 0) => Some(true),
        BinOp::Gt if hi.is_some_and(|h| h <= 0) => Some(false),
        BinOp::Ge if lo.is_some_and(|l| l >= 0) => Some(true),
        BinOp::Ge if hi.is_some_and(|h| h < 0) => Some(false),
        BinOp::Eq if d.is_single() == Some(0) => Some(true),
        BinOp::Eq if lo.is_some_and(|l| l > 0) || hi.is_some_and(|h| h < 0) => Some(false),
        BinOp::Ne if d.is_single() == Some(0) => Some(false),
        BinOp::Ne if lo.is_some_and(|l| l > 0) || hi.is_some_and(|h| h < 0) => Some(true),
        _ => None,
    }
}

impl Simplifier {
    /// Simplify a node whose children are already simplified.
    pub(super) fn simplify_node(&mut self, e: &Arc<Expr>) -> Arc<Expr> {
        match e.kind() {
            ExprKind::Binary(op, a, b) => self.simplify_binary(e, *op, a, b),
            ExprKind::Cast(a) => fold_cast(a, e.ty()).unwrap_or_else(|| e.clone()),
            ExprKind::Not(a) => self.simplify_not(e, a),
            ExprKind::Select(c, t, f) => self.simplify_select(e, c, t, f),
            ExprKind::Ramp { base, stride, lanes } if stride.is_zero() => Expr::broadcast(base.clone(), *lanes),
            ExprKind::Broadcast { value, lanes } => match value.kind() {
                ExprKind::Broadcast { value: inner, lanes: l } => Expr::broadcast(inner.clone(), lanes * l),
                _ => e.clone(),
            },
            ExprKind::Call(c) => match c.intrinsic() {
                Some(Intrinsic::Likely | Intrinsic::LikelyIfInnermost)
                    if c.args.first().is_some_and(|a| a.is_const()) =>
                {
                    c.args[0].clone()
                }
                Some(Intrinsic::Abs) => match c.args.first().and_then(|a| a.as_const()) {
                    Some(v) => {
                        let magnitude = match v {
                            ConstValue::Int(i) => ConstValue::UInt(i.unsigned_abs()),
                            ConstValue::Float(f) => ConstValue::Float(f.abs()),
                            other => other,
                        };
                        Expr::const_(e.ty(), magnitude)
                    }
                    None => e.clone(),
                },
                _ => e.clone(),
            },
            _ => e.clone(),
        }
    }

    pub(super) fn simplify_binary(&mut self, e: &Arc<Expr>, op: BinOp, a: &Arc<Expr>, b: &Arc<Expr>) -> Arc<Expr> {
        if let Some(folded) = fold_binary(op, a, b) {
            return folded;
        }
        if let (Some((x, la)), Some((y, lb))) = (broadcast_value(a), broadcast_value(b))
            && la == lb
        {
            let scalar = Expr::binary(op, x.clone(), y.clone());
            let inner = self.simplify_node(&scalar);
            return Expr::broadcast(inner, la);
        }
        if let Some(r) = self.simplify_ramp_arith(op, a, b) {
            return r;
        }
        match op {
            BinOp::Add | BinOp::Sub | BinOp::Mul => self.simplify_arith(e, op, a, b),
            BinOp::Div => self.simplify_div(e, a, b),
            BinOp::Mod => self.simplify_mod(e, a, b),
            BinOp::Min | BinOp::Max => self.simplify_min_max(e, op, a, b),
            BinOp::And | BinOp::Or => self.simplify_logical(e, op, a, b),
            _ => self.simplify_comparison(e, op, a, b),
        }
    }

    fn simplify_ramp_arith(&mut self, op: BinOp, a: &Arc<Expr>, b: &Arc<Expr>) -> Option<Arc<Expr>> {
        let scalar = |s: &mut Self, op, x: &Arc<Expr>, y: &Arc<Expr>| {
            let n = Expr::binary(op, x.clone(), y.clone());
            s.simplify_node(&n)
        };
        match (op, ramp_parts(a), ramp_parts(b), broadcast_value(a), broadcast_value(b)) {
            (BinOp::Add | BinOp::Sub, Some((b1, s1, l1)), Some((b2, s2, l2)), ..) if l1 == l2 => {
                let base = scalar(self, op, b1, b2);
                let stride = scalar(self, op, s1, s2);
                Some(Expr::ramp(base, stride, l1))
            }
            (BinOp::Add | BinOp::Sub, Some((base, stride, lanes)), None, _, Some((v, _))) => {
                let base = scalar(self, op, base, v);
                Some(Expr::ramp(base, stride.clone(), lanes))
            }
            (BinOp::Add, None, Some((base, stride, lanes)), Some((v, _)), _) => {
                let base = scalar(self, op, v, base);
                Some(Expr::ramp(base, stride.clone(), lanes))
            }
            (BinOp::Mul, Some((base, stride, lanes)), None, _, Some((v, _))) => {
                let base = scalar(self, op, base, v);
                let stride = scalar(self, op, stride, v);
                Some(Expr::ramp(base, stride, lanes))
            }
            _ => None,
        }
    }

    fn simplify_arith(&mut self, e: &Arc<Expr>, op: BinOp, a: &Arc<Expr>, b: &Arc<Expr>) -> Arc<Expr> {
        let ty = a.ty();
        if is_linear_type(ty) {
            return match LinearForm::of_binary(op, a, b) {
                Some(form) => form.to_expr(),
                // Product of two non-constants; order operands canonically.
                None if ExprKey(b.clone()) < ExprKey(a.clone()) => rebuild(e, op, b, a),
                None => rebuild(e, op, a, b),
            };
        }
        let integral = !ty.is_float();
        match op {
            BinOp::Add if b.is_zero() => a.clone(),
            BinOp::Add if a.is_zero() => b.clone(),
            BinOp::Add if a.is_const() => rebuild(e, op, b, a),
            BinOp::Sub if b.is_zero() => a.clone(),
            BinOp::Sub if integral && graph_equal(a, b) => Expr::make_zero(ty),
            BinOp::Mul if b.is_one() => a.clone(),
            BinOp::Mul if a.is_one() => b.clone(),
            BinOp::Mul if integral && (a.is_zero() || b.is_zero()) => Expr::make_zero(ty),
            BinOp::Mul if a.is_const() => rebuild(e, op, b, a),
            _ => rebuild(e, op, a, b),
        }
    }

    fn simplify_div(&mut self, e: &Arc<Expr>, a: &Arc<Expr>, b: &Arc<Expr>) -> Arc<Expr> {
        let ty = a.ty();
        if b.is_one() {
            return a.clone();
        }
        if !ty.is_float() && (b.is_zero() || a.is_zero()) {
            return Expr::make_zero(ty);
        }
        if !is_linear_type(ty) {
            return rebuild(e, BinOp::Div, a, b);
        }
        // Euclidean division: a / c == 0 - a / -c for negative divisors.
        if let Some(c) = b.as_int().filter(|c| *c < 0)
            && let Some(magnitude) = c.checked_neg()
        {
            let divisor = Expr::make_const(ty, magnitude);
            let positive = Expr::binary(BinOp::Div, a.clone(), divisor.clone());
            let quotient = self.simplify_div(&positive, a, &divisor);
            let negated = Expr::binary(BinOp::Sub, Expr::make_zero(ty), quotient);
            return self.simplify_node(&negated);
        }
        let Some(c) = b.as_int().filter(|c| *c > 0) else {
            return rebuild(e, BinOp::Div, a, b);
        };
        // (x / c1) / c2 == x / (c1 * c2) for positive divisors.
        if let Some((x, inner)) = a.as_op(BinOp::Div)
            && let Some(c1) = inner.as_int().filter(|v| *v > 0)
            && let Some(product) = c1.checked_mul(c)
        {
            let divisor = Expr::make_const(ty, product);
            return self.simplify_div(e, x, &divisor);
        }
        let (mut quotient, rest) = LinearForm::of(a).split_divisible(c);
        let remainder = self.bounds_of(&rest.to_expr());
        if remainder.min.is_some_and(|lo| lo >= 0) && remainder.max.is_some_and(|hi| hi < c) {
            return quotient.to_expr();
        }
        if quotient.is_constant() && quotient.constant == 0 {
            return rebuild(e, BinOp::Div, a, b);
        }
        quotient.add_term(Expr::binary(BinOp::Div, rest.to_expr(), b.clone()), 1);
        quotient.to_expr()
    }

    fn simplify_mod(&mut self, e: &Arc<Expr>, a: &Arc<Expr>, b: &Arc<Expr>) -> Arc<Expr> {
        let ty = a.ty();
        if !ty.is_float() && (b.is_one() || b.is_zero() || a.is_zero()) {
            return Expr::make_zero(ty);
        }
        // The Euclidean remainder only depends on the divisor's magnitude.
        if let Some(c) = b.as_int().filter(|c| *c < 0 && is_linear_type(ty))
            && let Some(magnitude) = c.checked_neg()
        {
            return self.simplify_mod(e, a, &Expr::make_const(ty, magnitude));
        }
        let Some(c) = b.as_int().filter(|c| *c > 0 && is_linear_type(ty)) else {
            return rebuild(e, BinOp::Mod, a, b);
        };
        let (_, rest) = LinearForm::of(a).split_divisible(c);
        let bounds = self.bounds_of(&rest.to_expr());
        let reduced = rest.to_expr();
        if bounds.min.is_some_and(|lo| lo >= 0) && bounds.max.is_some_and(|hi| hi < c) {
            return reduced;
        }
        if graph_equal(&reduced, a) {
            rebuild(e, BinOp::Mod, a, b)
        } else {
            Expr::binary(BinOp::Mod, reduced, b.clone())
        }
    }

    fn simplify_min_max(&mut self, e: &Arc<Expr>, op: BinOp, a: &Arc<Expr>, b: &Arc<Expr>) -> Arc<Expr> {
        if graph_equal(a, b) {
            return a.clone();
        }
        if a.is_const() {
            return self.simplify_min_max(e, op, b, a);
        }
        let is_min = op == BinOp::Min;
        let ty = a.ty();
        if is_linear_type(ty) {
            let d = LinearForm::difference(a, b);
            if d.is_constant() {
                let a_smaller = d.constant <= 0;
                return if a_smaller == is_min { a.clone() } else { b.clone() };
            }
        }
        if ty.is_integral() && ty.is_scalar() {
            let (ba, bb) = (self.bounds_of(a), self.bounds_of(b));
            let a_below = ba.max.zip(bb.min).is_some_and(|(x, y)| x <= y);
            let b_below = bb.max.zip(ba.min).is_some_and(|(x, y)| x <= y);
            if a_below {
                return if is_min { a.clone() } else { b.clone() };
            }
            if b_below {
                return if is_min { b.clone() } else { a.clone() };
            }
        }
        // min(min(x, c1), c2) -> min(x, min(c1, c2))
        if b.is_const()
            && let Some((x, c1)) = a.as_op(op)
            && c1.is_const()
            && let Some(c) = fold_binary(op, c1, b)
        {
            return rebuild(e, op, x, &c);
        }
        // min(x, max(x, y)) -> x and max(x, min(x, y)) -> x
        let other = if is_min { BinOp::Max } else { BinOp::Min };
        if let Some((x, y)) = b.as_op(other)
            && (graph_equal(x, a) || graph_equal(y, a))
        {
            return a.clone();
        }
        if let Some((x, y)) = a.as_op(other)
            && (graph_equal(x, b) || graph_equal(y, b))
        {
            return b.clone();
        }
        rebuild(e, op, a, b)
    }

    fn simplify_comparison(&mut self, e: &Arc<Expr>, op: BinOp, a: &Arc<Expr>, b: &Arc<Expr>) -> Arc<Expr> {
        let ty = a.ty();
        if !ty.is_float() && graph_equal(a, b) {
            let truth = matches!(op, BinOp::Eq | BinOp::Le | BinOp::Ge);
            return Expr::bool_(truth, e.ty().lanes());
        }
        if !is_linear_type(ty) {
            if ty.is_integral()
                && ty.is_scalar()
                && !ty.is_bool()
                && let Some(truth) = self.decide_by_bounds(op, a, b)
            {
                return Expr::bool_(truth, 1);
            }
            return rebuild(e, op, a, b);
        }
        let d = LinearForm::difference(a, b);
        if d.is_constant() {
            let truth = decide_against_zero(op, ConstInterval::single(d.constant)).unwrap_or(false);
            return Expr::bool_(truth, 1);
        }
        if let Some(truth) = decide_against_zero(op, self.bounds_of(&d.to_expr())) {
            return Expr::bool_(truth, 1);
        }
        if let Some(truth) = self.decide_by_bounds(op, a, b) {
            return Expr::bool_(truth, 1);
        }
        // Move constants to the side holding only a constant.
        match (a.as_int(), b.as_int()) {
            (None, Some(c)) => {
                let lhs = LinearForm::of(a);
                if lhs.constant != 0 {
                    let rhs = Expr::make_const(ty, c.wrapping_sub(lhs.constant));
                    return Expr::binary(op, lhs.without_constant().to_expr(), rhs);
                }
            }
            (Some(c), None) => {
                let rhs = LinearForm::of(b);
                if rhs.constant != 0 {
                    let lhs = Expr::make_const(ty, c.wrapping_sub(rhs.constant));
                    return Expr::binary(op, lhs, rhs.without_constant().to_expr());
                }
            }
            _ => {}
        }
        rebuild(e, op, a, b)
    }

    fn decide_by_bounds(&self, op: BinOp, a: &Arc<Expr>, b: &Arc<Expr>) -> Option<bool> {
        let (ba, bb) = (self.bounds_of(a), self.bounds_of(b));
        let diff = ConstInterval::new(
            ba.min.zip(bb.max).and_then(|(x, y)| x.checked_sub(y)),
            ba.max.zip(bb.min).and_then(|(x, y)| x.checked_sub(y)),
        );
        decide_against_zero(op, diff)
    }

    fn simplify_logical(&mut self, e: &Arc<Expr>, op: BinOp, a: &Arc<Expr>, b: &Arc<Expr>) -> Arc<Expr> {
        let lanes = e.ty().lanes();
        let is_and = op == BinOp::And;
        for (x, y) in [(a, b), (b, a)] {
            if x.is_true() {
                return if is_and { y.clone() } else { Expr::bool_(true, lanes) };
            }
            if x.is_false() {
                return if is_and { Expr::bool_(false, lanes) } else { y.clone() };
            }
            if let ExprKind::Not(inner) = x.kind()
                && graph_equal(inner, y)
            {
                return Expr::bool_(!is_and, lanes);
            }
        }
        if graph_equal(a, b) {
            return a.clone();
        }
        rebuild(e, op, a, b)
    }

    fn simplify_not(&mut self, e: &Arc<Expr>, a: &Arc<Expr>) -> Arc<Expr> {
        if let Some(folded) = fold_not(a) {
            return folded;
        }
        match a.kind() {
            ExprKind::Not(inner) => inner.clone(),
            ExprKind::Binary(op, x, y) => match op.negated() {
                Some(neg) => {
                    let n = Expr::binary(neg, x.clone(), y.clone());
                    self.simplify_node(&n)
                }
                None => e.clone(),
            },
            _ => e.clone(),
        }
    }

    fn simplify_select(&mut self, e: &Arc<Expr>, c: &Arc<Expr>, t: &Arc<Expr>, f: &Arc<Expr>) -> Arc<Expr> {
        if c.is_true() {
            return t.clone();
        }
        if c.is_false() {
            return f.clone();
        }
        if graph_equal(t, f) {
            return t.clone();
        }
        if t.ty().is_bool() && c.ty() == t.ty() {
            if t.is_true() && f.is_false() {
                return c.clone();
            }
            if t.is_false() && f.is_true() {
                return self.simplify_not(&c.not(), c);
            }
        }
        e.clone()
    }
}
