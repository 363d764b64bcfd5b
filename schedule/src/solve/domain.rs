//! Conditions that hold over an entire domain of variables.

use std::sync::Arc;

use kiln_ir::analysis::expr_uses_var_matching;
use kiln_ir::{BinOp, Expr, ExprKind, Interval, Scope, bounds_of_expr_in_scope, expr_uses_var, simplify};
use tracing::trace;

/// Rewrites a condition into one that does not depend on the varying
/// variables. Outside a negation the result implies the original for every
/// point of the domain; under an odd number of negations it is implied by it
/// instead, so that negating it again gives back an implication.
struct AndConditionOverDomain<'a> {
    varying: &'a mut Scope<Interval>,
    flipped: bool,
}

impl AndConditionOverDomain<'_> {
    fn depends_on_domain(&self, e: &Arc<Expr>) -> bool {
        expr_uses_var_matching(e, |n| self.varying.contains(n))
    }

    /// Lower (or, when flipped, upper) bound of a boolean over the domain.
    fn widen(&self, e: &Arc<Expr>) -> Arc<Expr> {
        let bounds = bounds_of_expr_in_scope(e, self.varying);
        let bound = if self.flipped { bounds.max_expr() } else { bounds.min_expr() };
        bound.cloned().unwrap_or_else(|| Expr::bool_(self.flipped, e.ty().lanes()))
    }

    fn visit(&mut self, e: &Arc<Expr>) -> Arc<Expr> {
        if !self.depends_on_domain(e) {
            return e.clone();
        }
        match e.kind() {
            ExprKind::Binary(op @ (BinOp::And | BinOp::Or), a, b) => {
                let a = self.visit(a);
                let b = self.visit(b);
                Expr::binary(*op, a, b)
            }
            ExprKind::Not(a) => {
                self.flipped = !self.flipped;
                let a = self.visit(a);
                self.flipped = !self.flipped;
                a.not()
            }
            ExprKind::Binary(op, a, b) if op.is_comparison() && !a.ty().is_bool() => self.comparison(*op, a, b),
            ExprKind::Let { name, value, body } => {
                let bounds = bounds_of_expr_in_scope(value, self.varying);
                let varies = self.depends_on_domain(value);
                if varies {
                    self.varying.push(name.clone(), bounds);
                }
                let body = self.visit(body);
                if varies {
                    self.varying.pop(name);
                }
                if expr_uses_var(&body, name) { Expr::let_in(name.clone(), value.clone(), body) } else { body }
            }
            _ => self.widen(e),
        }
    }

    /// Replace `a op b` by a comparison of the extremes of both sides.
    fn comparison(&self, op: BinOp, a: &Arc<Expr>, b: &Arc<Expr>) -> Arc<Expr> {
        let ia = bounds_of_expr_in_scope(a, self.varying);
        let ib = bounds_of_expr_in_scope(b, self.varying);
        let lanes = a.ty().lanes();
        let unknown = || Expr::bool_(self.flipped, lanes);
        let sure = !self.flipped;

        // For a sufficient condition compare the extremes that are hardest
        // to satisfy; for a necessary one, the easiest.
        let (a_lo, a_hi, b_lo, b_hi) = (ia.min_expr(), ia.max_expr(), ib.min_expr(), ib.max_expr());
        let both_points = ia.is_single_point() && ib.is_single_point();
        let ordered = |lhs: Option<&Arc<Expr>>, rhs: Option<&Arc<Expr>>, op: BinOp| match (lhs, rhs) {
            (Some(l), Some(r)) => Expr::binary(op, l.clone(), r.clone()),
            _ => unknown(),
        };
        match (op, sure) {
            (BinOp::Lt | BinOp::Le, true) => ordered(a_hi, b_lo, op),
            (BinOp::Lt | BinOp::Le, false) => ordered(a_lo, b_hi, op),
            (BinOp::Gt | BinOp::Ge, true) => ordered(a_lo, b_hi, op),
            (BinOp::Gt | BinOp::Ge, false) => ordered(a_hi, b_lo, op),
            (BinOp::Eq, true) if both_points => ordered(a_lo, b_lo, BinOp::Eq),
            (BinOp::Eq, true) => Expr::bool_(false, lanes),
            (BinOp::Eq, false) => ordered(a_lo, b_hi, BinOp::Le).and(ordered(a_hi, b_lo, BinOp::Ge)),
            (BinOp::Ne, true) => ordered(a_hi, b_lo, BinOp::Lt).or(ordered(a_lo, b_hi, BinOp::Gt)),
            (BinOp::Ne, false) if both_points => ordered(a_lo, b_lo, BinOp::Ne),
            _ => Expr::bool_(true, lanes),
        }
    }
}

/// A condition equivalent to "`e` holds for every point of `varying`".
///
/// The result does not mention any variable of `varying` and implies `e` at
/// every point of the domain. Parts of `e` that do not depend on the domain
/// are kept as they are.
#[tracing::instrument(skip_all)]
pub fn and_condition_over_domain(e: &Arc<Expr>, varying: &Scope<Interval>) -> Arc<Expr> {
    let mut varying = varying.clone();
    let raw = AndConditionOverDomain { varying: &mut varying, flipped: false }.visit(e);
    let result = simplify(&raw);
    trace!(condition = %e, %result, "condition over domain");
    result
}
