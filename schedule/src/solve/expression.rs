//! Isolating a variable on the left-hand side of an expression.
//!
//! The solver walks the expression bottom-up and rewrites each operator so
//! that the operand mentioning the variable ends up on the left and, where
//! possible, the variable appears only once. Lets are substituted as they are
//! met; the result is re-collected with common subexpression elimination.
//!
//! Every rewrite is an identity over the integers with Euclidean division
//! and over the reals for floats, so the result always evaluates to the same
//! value as the input.

use std::collections::BTreeMap;
use std::sync::Arc;

use kiln_ir::visit::{Mutator, mutate_expr_children};
use kiln_ir::{
    BinOp, Expr, ExprKey, ExprKind, Intrinsic, Scope, Type, can_prove, common_subexpression_elimination, equal,
    expr_uses_var, simplify,
};
use tracing::trace;

use super::{SolverResult, is_negative_const, is_positive_const};

/// A solved subexpression and what solving it found out.
#[derive(Debug, Clone)]
struct Solved {
    expr: Arc<Expr>,
    uses_var: bool,
    failed: bool,
}

pub(crate) struct SolveExpression<'a> {
    var: &'a str,
    external: &'a Scope<Arc<Expr>>,
    cache: BTreeMap<ExprKey, Solved>,
    lets: Scope<Solved>,
    uses_var: bool,
    failed: bool,
}

fn bin(op: BinOp, a: &Arc<Expr>, b: &Arc<Expr>) -> Arc<Expr> {
    Expr::binary(op, a.clone(), b.clone())
}

/// `-e`, folding into a constant multiplier when there is one.
pub(crate) fn negate(e: &Arc<Expr>) -> Arc<Expr> {
    if let Some((a, k)) = e.as_op(BinOp::Mul)
        && k.is_const()
    {
        return a.mul(simplify(&Expr::make_const(k.ty(), -1).mul(k)));
    }
    e.mul(Expr::make_const(e.ty(), -1))
}

fn no_overflow_int(ty: Type) -> bool {
    ty.is_int() && ty.bits() >= 32
}

impl<'a> SolveExpression<'a> {
    pub(crate) fn new(var: &'a str, external: &'a Scope<Arc<Expr>>) -> Self {
        Self { var, external, cache: BTreeMap::new(), lets: Scope::new(), uses_var: false, failed: false }
    }

    pub(crate) fn failed(&self) -> bool {
        self.failed
    }

    fn take_flags(&mut self) -> (bool, bool) {
        let old = (self.uses_var, self.failed);
        self.uses_var = false;
        self.failed = false;
        old
    }

    fn fail(&mut self) -> Option<Arc<Expr>> {
        self.failed = true;
        None
    }

    /// Solve `e`, memoized on its structure.
    pub(crate) fn solve(&mut self, e: &Arc<Expr>) -> Arc<Expr> {
        let key = ExprKey(e.clone());
        if let Some(hit) = self.cache.get(&key) {
            self.uses_var |= hit.uses_var;
            self.failed |= hit.failed;
            return hit.expr.clone();
        }
        // Re-entering a node while it is being solved means the rewrites
        // cycle; give up on it instead of recursing.
        let in_progress = Solved { expr: e.clone(), uses_var: expr_uses_var(e, self.var), failed: true };
        self.cache.insert(key.clone(), in_progress);
        let (old_uses, old_failed) = self.take_flags();
        let expr = self.visit(e);
        let entry = Solved { expr: expr.clone(), uses_var: self.uses_var, failed: self.failed };
        self.uses_var = old_uses || entry.uses_var;
        self.failed = old_failed || entry.failed;
        self.cache.insert(key, entry);
        expr
    }

    fn isolated(&mut self, e: &Arc<Expr>) -> Solved {
        self.uses_var = false;
        self.failed = false;
        let expr = self.solve(e);
        Solved { expr, uses_var: self.uses_var, failed: self.failed }
    }

    fn operands(&mut self, a: &Arc<Expr>, b: &Arc<Expr>) -> (Solved, Solved) {
        let (old_uses, old_failed) = self.take_flags();
        let sa = self.isolated(a);
        let sb = self.isolated(b);
        self.uses_var = old_uses || sa.uses_var || sb.uses_var;
        self.failed = old_failed || sa.failed || sb.failed;
        (sa, sb)
    }

    fn visit(&mut self, e: &Arc<Expr>) -> Arc<Expr> {
        match e.kind() {
            ExprKind::Binary(op, a, b) => {
                let op = *op;
                let (sa, sb) = self.operands(a, b);
                let rewritten = match op {
                    BinOp::Add => self.visit_add(sa, sb),
                    BinOp::Sub => self.visit_sub(e.ty(), sa, sb),
                    BinOp::Mul => self.visit_mul(sa, sb),
                    BinOp::Div => self.visit_div(e.ty(), sa, sb),
                    BinOp::Min | BinOp::Max => self.visit_min_max(op, e.ty(), sa, sb),
                    BinOp::And | BinOp::Or => self.visit_and_or(op, sa, sb),
                    BinOp::Mod => Err((sa, sb)),
                    _ => self.visit_cmp(op, sa, sb),
                };
                match rewritten {
                    Ok(expr) => expr,
                    Err((sa, sb)) if Arc::ptr_eq(&sa.expr, a) && Arc::ptr_eq(&sb.expr, b) => e.clone(),
                    Err((sa, sb)) => bin(op, &sa.expr, &sb.expr),
                }
            }
            ExprKind::Call(c)
                if matches!(
                    c.intrinsic(),
                    Some(Intrinsic::Likely | Intrinsic::LikelyIfInnermost | Intrinsic::PromiseClamped)
                ) =>
            {
                self.solve(&c.args[0])
            }
            ExprKind::Variable(v) => {
                if v.name == self.var {
                    self.uses_var = true;
                    e.clone()
                } else if let Some(bound) = self.lets.get(&v.name) {
                    self.uses_var |= bound.uses_var;
                    self.failed |= bound.failed;
                    bound.expr.clone()
                } else if let Some(value) = self.external.get(&v.name) {
                    let value = value.clone();
                    self.solve(&value)
                } else {
                    e.clone()
                }
            }
            ExprKind::Let { name, value, body } => {
                let (old_uses, old_failed) = self.take_flags();
                let value = self.solve(value);
                let bound = Solved { expr: value, uses_var: self.uses_var, failed: self.failed };
                self.uses_var = old_uses;
                self.failed = old_failed;
                self.lets.push(name.clone(), bound);
                let body = self.solve(body);
                self.lets.pop(name);
                body
            }
            _ => mutate_expr_children(self, e),
        }
    }

    // ========================================================================
    // Arithmetic
    // ========================================================================

    fn visit_add(&mut self, mut a: Solved, mut b: Solved) -> Result<Arc<Expr>, (Solved, Solved)> {
        if b.uses_var && !a.uses_var {
            std::mem::swap(&mut a, &mut b);
        }
        let (x, y) = (&a.expr, &b.expr);
        let rewritten = if a.uses_var && !b.uses_var {
            if let Some((f, k)) = x.as_op(BinOp::Sub).filter(|_| !a.failed) {
                // (f(x) - a) + b -> f(x) + (b - a)
                Some(self.solve(&f.add(y.sub(k))))
            } else if let Some((f, k)) = x.as_op(BinOp::Add).filter(|_| !a.failed) {
                // (f(x) + a) + b -> f(x) + (a + b)
                Some(self.solve(&f.add(k.add(y))))
            } else {
                None
            }
        } else if a.uses_var && b.uses_var {
            let (add_a, add_b) = (x.as_op(BinOp::Add), y.as_op(BinOp::Add));
            let (sub_a, sub_b) = (x.as_op(BinOp::Sub), y.as_op(BinOp::Sub));
            let (mul_a, mul_b) = (x.as_op(BinOp::Mul), y.as_op(BinOp::Mul));
            let (div_a, div_b) = (x.as_op(BinOp::Div), y.as_op(BinOp::Div));
            if equal(x, y) {
                Some(self.solve(&x.mul(2)))
            } else if let Some((f, k)) = add_a.filter(|_| !a.failed) {
                Some(self.solve(&f.add(y).add(k)))
            } else if let Some((g, k)) = add_b.filter(|_| !b.failed) {
                Some(self.solve(&x.add(g).add(k)))
            } else if let Some((f, k)) = sub_a.filter(|_| !a.failed) {
                Some(self.solve(&f.add(y).sub(k)))
            } else if let Some((g, k)) = sub_b.filter(|_| !b.failed) {
                Some(self.solve(&x.add(g).sub(k)))
            } else if let (Some((f, p)), Some((g, q))) = (mul_a, mul_b)
                && equal(f, g)
            {
                // f(x)*a + f(x)*b -> f(x)*(a + b)
                Some(self.solve(&f.mul(p.add(q))))
            } else if let (Some((f, p)), Some((g, q))) = (mul_a, mul_b)
                && equal(p, q)
            {
                // f(x)*a + g(x)*a -> (f(x) + g(x))*a
                Some(self.solve(&f.add(g)).mul(p))
            } else if let Some((f, p)) = mul_a
                && equal(f, y)
            {
                Some(self.solve(&y.mul(p.add(1))))
            } else if let Some((g, q)) = mul_b
                && equal(g, x)
            {
                Some(self.solve(&x.mul(q.add(1))))
            } else if let Some((f, d)) = div_a.filter(|_| !a.failed) {
                // f(x)/a + g(x) -> (f(x) + g(x)*a)/a
                Some(self.solve(&f.add(y.mul(d)).div(d)))
            } else if let Some((g, d)) = div_b.filter(|_| !b.failed) {
                Some(self.solve(&x.mul(d).add(g).div(d)))
            } else {
                self.fail()
            }
        } else if x.is_const() && y.is_const() {
            Some(simplify(&x.add(y)))
        } else {
            None
        };
        rewritten.ok_or((a, b))
    }

    fn visit_sub(&mut self, ty: Type, a: Solved, b: Solved) -> Result<Arc<Expr>, (Solved, Solved)> {
        let (x, y) = (&a.expr, &b.expr);
        let (add_a, add_b) = (x.as_op(BinOp::Add), y.as_op(BinOp::Add));
        let (sub_a, sub_b) = (x.as_op(BinOp::Sub), y.as_op(BinOp::Sub));
        let (mul_a, mul_b) = (x.as_op(BinOp::Mul), y.as_op(BinOp::Mul));
        let rewritten = if a.uses_var && !b.uses_var {
            if let Some((f, k)) = sub_a.filter(|_| !a.failed) {
                // (f(x) - a) - b -> f(x) - (a + b)
                Some(self.solve(&f.sub(k.add(y))))
            } else if let Some((f, k)) = add_a.filter(|_| !a.failed) {
                // (f(x) + a) - b -> f(x) + (a - b)
                Some(self.solve(&f.add(k.sub(y))))
            } else {
                None
            }
        } else if b.uses_var && !a.uses_var {
            if ty.is_uint() {
                if let Some((k, g)) = sub_b.filter(|_| !b.failed) {
                    // a - (b - f(x)) -> f(x) + (a - b)
                    Some(self.solve(&g.add(x.sub(k))))
                } else {
                    // Negating unsigned values wraps.
                    self.fail()
                }
            } else if let Some((g, k)) = sub_b.filter(|_| !b.failed) {
                // a - (f(x) - b) -> -f(x) + (a + b)
                Some(self.solve(&negate(g).add(x.add(k))))
            } else if let Some((g, k)) = add_b.filter(|_| !b.failed) {
                // a - (f(x) + b) -> -f(x) + (a - b)
                Some(self.solve(&negate(g).add(x.sub(k))))
            } else {
                Some(self.solve(&negate(y).add(x)))
            }
        } else if a.uses_var && b.uses_var {
            if let Some((f, k)) = add_a.filter(|_| !a.failed) {
                Some(self.solve(&f.sub(y).add(k)))
            } else if let Some((g, k)) = add_b.filter(|_| !b.failed) {
                Some(self.solve(&x.sub(g).sub(k)))
            } else if let Some((f, k)) = sub_a.filter(|_| !a.failed) {
                Some(self.solve(&f.sub(y).sub(k)))
            } else if let Some((g, k)) = sub_b.filter(|_| !b.failed) {
                Some(self.solve(&x.sub(g).add(k)))
            } else if let (Some((f, p)), Some((g, q))) = (mul_a, mul_b)
                && equal(f, g)
            {
                Some(self.solve(&f.mul(p.sub(q))))
            } else if let (Some((f, p)), Some((g, q))) = (mul_a, mul_b)
                && equal(p, q)
            {
                Some(self.solve(&f.sub(g).mul(p)))
            } else if let Some((f, d)) = x.as_op(BinOp::Div).filter(|_| !a.failed) {
                // f(x)/a - g(x) -> (f(x) - g(x)*a)/a
                Some(self.solve(&f.sub(y.mul(d)).div(d)))
            } else {
                self.fail()
            }
        } else if x.is_const() && y.is_const() {
            Some(simplify(&x.sub(y)))
        } else {
            None
        };
        rewritten.ok_or((a, b))
    }

    fn visit_mul(&mut self, mut a: Solved, mut b: Solved) -> Result<Arc<Expr>, (Solved, Solved)> {
        if b.uses_var && !a.uses_var {
            std::mem::swap(&mut a, &mut b);
        }
        let (x, y) = (&a.expr, &b.expr);
        let rewritten = if a.uses_var && !b.uses_var {
            if let Some((f, k)) = x.as_op(BinOp::Add).filter(|_| !a.failed) {
                // (f(x) + a)*b -> f(x)*b + a*b
                Some(self.solve(&f.mul(y).add(k.mul(y))))
            } else if let Some((f, k)) = x.as_op(BinOp::Sub).filter(|_| !a.failed) {
                Some(self.solve(&f.mul(y).sub(k.mul(y))))
            } else if let Some((f, k)) = x.as_op(BinOp::Mul).filter(|_| !a.failed) {
                // (f(x)*a)*b -> f(x)*(a*b)
                Some(self.solve(&f.mul(k.mul(y))))
            } else {
                None
            }
        } else if a.uses_var && b.uses_var {
            // Quadratic.
            self.fail()
        } else if x.is_const() && y.is_const() {
            Some(simplify(&x.mul(y)))
        } else {
            None
        };
        rewritten.ok_or((a, b))
    }

    fn visit_div(&mut self, ty: Type, a: Solved, b: Solved) -> Result<Arc<Expr>, (Solved, Solved)> {
        let (x, y) = (&a.expr, &b.expr);
        let rewritten = if a.uses_var && !b.uses_var {
            let is_multiple_of_b = |e: &Arc<Expr>| match y.as_int() {
                Some(_) if ty.is_integral() => can_prove(&e.modulo(y).cmp_eq(Expr::make_zero(e.ty()))),
                _ => can_prove(&e.div(y).mul(y).cmp_eq(e)),
            };
            // Integer splits must simplify away the division in f(x)/b.
            let exact_quotient = |f: &Arc<Expr>| {
                Some(simplify(&f.div(y))).filter(|q| ty.is_float() || q.as_op(BinOp::Div).is_none())
            };
            if let Some((f, k)) = x.as_op(BinOp::Add).filter(|(f, _)| !a.failed && is_multiple_of_b(f))
                && let Some(q) = exact_quotient(f)
            {
                // (f(x) + a)/b -> f(x)/b + a/b
                Some(self.solve(&q.add(k.div(y))))
            } else if let Some((f, k)) = x.as_op(BinOp::Sub).filter(|(f, _)| !a.failed && is_multiple_of_b(f))
                && let Some(q) = exact_quotient(f)
            {
                if ty.is_float() {
                    Some(self.solve(&q.sub(k.div(y))))
                } else if ty.is_int() {
                    // (f(x) - a)/b -> f(x)/b + (0 - a)/b, since a/b does not
                    // negate under Euclidean division.
                    Some(self.solve(&q.add(Expr::make_zero(ty).sub(k).div(y))))
                } else {
                    None
                }
            } else if let Some((f, k)) =
                x.as_op(BinOp::Mul).filter(|(_, k)| !a.failed && no_overflow_int(ty) && is_multiple_of_b(k))
            {
                // (f(x)*a)/b -> f(x)*(a/b)
                Some(self.solve(&f.mul(k.div(y))))
            } else {
                None
            }
        } else if x.is_const() && y.is_const() {
            Some(simplify(&x.div(y)))
        } else {
            None
        };
        rewritten.ok_or((a, b))
    }

    // ========================================================================
    // Min, max and logical operators
    // ========================================================================

    fn visit_min_max(
        &mut self,
        op: BinOp,
        ty: Type,
        mut a: Solved,
        mut b: Solved,
    ) -> Result<Arc<Expr>, (Solved, Solved)> {
        if b.uses_var && !a.uses_var {
            std::mem::swap(&mut a, &mut b);
        }
        let other = if op == BinOp::Min { BinOp::Max } else { BinOp::Min };
        let zero = Expr::make_zero(ty);
        let (x, y) = (&a.expr, &b.expr);
        let rewritten = if a.uses_var && !b.uses_var {
            if let Some((f, k)) = x.as_op(op).filter(|_| !a.failed) {
                // op(op(f(x), a), b) -> op(f(x), op(a, b))
                Some(self.solve(&bin(op, f, &bin(op, k, y))))
            } else {
                None
            }
        } else if a.uses_var && b.uses_var {
            let (t_a, t_b) = (x.as_op(op), y.as_op(op));
            let (add_a, add_b) = (x.as_op(BinOp::Add), y.as_op(BinOp::Add));
            let (sub_a, sub_b) = (x.as_op(BinOp::Sub), y.as_op(BinOp::Sub));
            let (mul_a, mul_b) = (x.as_op(BinOp::Mul), y.as_op(BinOp::Mul));
            if equal(x, y) {
                Some(x.clone())
            } else if let Some((f, k)) = t_a.filter(|_| !a.failed) {
                // op(op(f(x), a), g(x)) -> op(op(f(x), g(x)), a)
                Some(self.solve(&bin(op, &bin(op, f, y), k)))
            } else if let Some((g, k)) = t_b.filter(|_| !b.failed) {
                Some(self.solve(&bin(op, &bin(op, x, g), k)))
            } else if let (Some((f, p)), Some((g, q))) = (add_a, add_b)
                && equal(f, g)
            {
                // op(f(x) + a, f(x) + b) -> f(x) + op(a, b)
                Some(self.solve(&f.add(bin(op, p, q))))
            } else if let (Some((f, p)), Some((g, q))) = (add_a, add_b)
                && equal(p, q)
            {
                // op(f(x) + a, g(x) + a) -> op(f(x), g(x)) + a
                Some(self.solve(&bin(op, f, g)).add(p))
            } else if let Some((f, p)) = add_a
                && equal(f, y)
            {
                // op(f(x) + a, f(x)) -> f(x) + op(a, 0)
                Some(self.solve(&y.add(bin(op, p, &zero))))
            } else if let Some((g, q)) = add_b
                && equal(g, x)
            {
                Some(self.solve(&x.add(bin(op, q, &zero))))
            } else if let (Some((f, p)), Some((g, q))) = (sub_a, sub_b)
                && equal(f, g)
            {
                // min(f(x) - a, f(x) - b) -> f(x) - max(a, b)
                Some(self.solve(&f.sub(bin(other, p, q))))
            } else if let (Some((f, p)), Some((g, q))) = (sub_a, add_b)
                && equal(f, g)
            {
                // min(f(x) - a, f(x) + b) -> f(x) + min(0 - a, b)
                Some(self.solve(&f.add(bin(op, &zero.sub(p), q))))
            } else if let (Some((f, p)), Some((g, q))) = (add_a, sub_b)
                && equal(f, g)
            {
                Some(self.solve(&f.add(bin(op, p, &zero.sub(q)))))
            } else if let (Some((f, p)), Some((g, q))) = (sub_a, sub_b)
                && equal(p, q)
            {
                // op(f(x) - a, g(x) - a) -> op(f(x), g(x)) - a
                Some(self.solve(&bin(op, f, g)).sub(p))
            } else if let Some((f, p)) = sub_a
                && equal(f, y)
            {
                // op(f(x) - a, f(x)) -> f(x) - other(a, 0)
                Some(self.solve(&y.sub(bin(other, p, &zero))))
            } else if let Some((g, q)) = sub_b
                && equal(g, x)
            {
                Some(self.solve(&x.sub(bin(other, q, &zero))))
            } else if let (Some((f, p)), Some((g, q))) = (mul_a, mul_b)
                && equal(p, q)
                && is_positive_const(p)
            {
                Some(self.solve(&bin(op, f, g)).mul(p))
            } else if let (Some((f, p)), Some((g, q))) = (mul_a, mul_b)
                && equal(p, q)
                && is_negative_const(p)
            {
                // min(f(x)*a, g(x)*a) -> max(f(x), g(x))*a for negative a
                Some(self.solve(&bin(other, f, g)).mul(p))
            } else {
                self.fail()
            }
        } else if x.is_const() && y.is_const() {
            Some(simplify(&bin(op, x, y)))
        } else {
            None
        };
        rewritten.ok_or((a, b))
    }

    fn visit_and_or(&mut self, op: BinOp, mut a: Solved, mut b: Solved) -> Result<Arc<Expr>, (Solved, Solved)> {
        if b.uses_var && !a.uses_var {
            std::mem::swap(&mut a, &mut b);
        }
        let (x, y) = (&a.expr, &b.expr);
        let rewritten = if a.uses_var && !b.uses_var {
            if let Some((f, k)) = x.as_op(op).filter(|_| !a.failed) {
                Some(self.solve(&bin(op, f, &bin(op, k, y))))
            } else {
                None
            }
        } else if a.uses_var && b.uses_var {
            if equal(x, y) {
                Some(x.clone())
            } else if let Some((f, k)) = x.as_op(op).filter(|_| !a.failed) {
                Some(self.solve(&bin(op, &bin(op, f, y), k)))
            } else if let Some((g, k)) = y.as_op(op).filter(|_| !b.failed) {
                Some(self.solve(&bin(op, &bin(op, x, g), k)))
            } else {
                self.fail()
            }
        } else if x.is_const() && y.is_const() {
            Some(simplify(&bin(op, x, y)))
        } else {
            None
        };
        rewritten.ok_or((a, b))
    }

    // ========================================================================
    // Comparisons
    // ========================================================================

    fn visit_cmp(&mut self, op: BinOp, a: Solved, b: Solved) -> Result<Arc<Expr>, (Solved, Solved)> {
        let opp = op.flipped();
        if b.uses_var && !a.uses_var {
            return Ok(self.solve(&bin(opp, &b.expr, &a.expr)));
        }
        let (x, y) = (&a.expr, &b.expr);
        let ty = x.ty();
        let is_equality = matches!(op, BinOp::Eq | BinOp::Ne);
        let rewritten = if a.uses_var && !b.uses_var {
            if let Some((f, k)) = x.as_op(BinOp::Add).filter(|_| !a.failed) {
                // f(x) + b < c -> f(x) < c - b
                Some(self.solve(&bin(op, f, &y.sub(k))))
            } else if let Some((f, k)) = x.as_op(BinOp::Sub).filter(|_| !a.failed) {
                // f(x) - b < c -> f(x) < c + b
                Some(self.solve(&bin(op, f, &y.add(k))))
            } else if let Some((f, k)) = x.as_op(BinOp::Mul) {
                self.unwrap_mul(op, f, k, y)
            } else if let Some((f, k)) = x.as_op(BinOp::Div) {
                if ty.is_float() {
                    if is_positive_const(k) {
                        Some(self.solve(&bin(op, f, &y.mul(k))))
                    } else if is_negative_const(k) {
                        Some(self.solve(&bin(opp, f, &y.mul(k))))
                    } else {
                        None
                    }
                } else if no_overflow_int(ty) && !is_equality {
                    if is_negative_const(k) {
                        // Euclidean division: f/(-k) == -(f/k)
                        Some(self.solve(&bin(op, &negate(&f.div(negate(k))), y)))
                    } else if is_positive_const(k) {
                        let rhs = match op {
                            // f(x)/k < c  <==>  f(x) < c*k
                            BinOp::Lt => f.cmp_lt(y.mul(k)),
                            // f(x)/k <= c  <==>  f(x) < (c + 1)*k
                            BinOp::Le => f.cmp_lt(y.add(1).mul(k)),
                            BinOp::Gt => f.cmp_ge(y.add(1).mul(k)),
                            _ => f.cmp_ge(y.mul(k)),
                        };
                        Some(self.solve(&rhs))
                    } else {
                        None
                    }
                } else {
                    None
                }
            } else {
                None
            }
        } else if a.uses_var && b.uses_var && no_overflow_int(ty) {
            // f(x) < g(x) -> f(x) - g(x) < 0
            Some(self.solve(&bin(op, &x.sub(y), &Expr::make_zero(ty))))
        } else {
            None
        };
        rewritten.ok_or((a, b))
    }

    /// `f(x)*k cmp c` with `k` free of the variable.
    fn unwrap_mul(&mut self, op: BinOp, f: &Arc<Expr>, k: &Arc<Expr>, c: &Arc<Expr>) -> Option<Arc<Expr>> {
        let opp = op.flipped();
        let is_equality = matches!(op, BinOp::Eq | BinOp::Ne);
        if f.ty().is_float() {
            // f(x)*k == c -> f(x) == c/k
            return if is_equality || is_positive_const(k) {
                Some(self.solve(&bin(op, f, &c.div(k))))
            } else if is_negative_const(k) {
                Some(self.solve(&bin(opp, f, &c.div(k))))
            } else {
                None
            };
        }
        if k.is_const_value(-1) {
            return Some(self.solve(&bin(opp, f, &Expr::make_zero(c.ty()).sub(c))));
        }
        if is_negative_const(k) {
            return Some(self.solve(&bin(opp, &f.mul(negate(k)), &negate(c))));
        }
        if k.is_zero() {
            return None;
        }
        let div = bin(BinOp::Div, c, k);
        let rem = bin(BinOp::Mod, c, k);
        let zero = Expr::make_zero(c.ty());
        let rewritten = match op {
            // f(x)*k == c -> f(x) == c/k && c%k == 0
            BinOp::Eq => f.cmp_eq(&div).and(rem.cmp_eq(&zero)),
            BinOp::Ne => f.cmp_ne(&div).or(rem.cmp_ne(&zero)),
            _ if !is_positive_const(k) => return None,
            BinOp::Le => f.cmp_le(&div),
            BinOp::Lt => f.cmp_le(c.sub(1).div(k)),
            BinOp::Gt => f.cmp_gt(&div),
            _ => f.cmp_gt(c.sub(1).div(k)),
        };
        Some(self.solve(&rewritten))
    }
}

impl Mutator for SolveExpression<'_> {
    fn mutate_expr(&mut self, e: &Arc<Expr>) -> Arc<Expr> {
        self.solve(e)
    }
}

/// Rewrite `e` so that `var` appears on the left, ideally exactly once.
///
/// Variables bound in `external` are substituted before solving. The result
/// is always equivalent to `e`; `fully_solved` reports whether every rewrite
/// that had the variable on both sides of an operator succeeded.
#[tracing::instrument(skip_all, fields(var = var))]
pub fn solve_expression(e: &Arc<Expr>, var: &str, external: &Scope<Arc<Expr>>) -> SolverResult {
    let mut solver = SolveExpression::new(var, external);
    let solved = solver.solve(e);
    let result = common_subexpression_elimination(&solved);
    trace!(input = %e, output = %result, failed = solver.failed(), "solved expression");
    SolverResult { result, fully_solved: !solver.failed() }
}

/// Like [`solve_expression`] but leaves the substituted lets expanded.
pub(crate) fn solve_expression_expanded(e: &Arc<Expr>, var: &str, external: &Scope<Arc<Expr>>) -> SolverResult {
    let mut solver = SolveExpression::new(var, external);
    let result = solver.solve(e);
    SolverResult { result, fully_solved: !solver.failed() }
}
