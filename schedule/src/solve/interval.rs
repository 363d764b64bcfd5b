//! Intervals of a variable on which a boolean condition holds.
//!
//! The *outer* interval contains every value for which the condition may be
//! true; the *inner* interval contains only values for which it is certainly
//! true. Conditions the solver cannot reason about give `everything` for the
//! outer interval and `nothing` for the inner one.

use std::collections::BTreeMap;
use std::sync::Arc;

use kiln_ir::analysis::expr_uses_var_matching;
use kiln_ir::{Bound, BinOp, Expr, ExprKey, ExprKind, Interval, Scope, can_prove, expr_uses_var, simplify, substitute};
use tracing::trace;

use super::expression::solve_expression_expanded;

// Placeholders standing in for the other operand of a min or max, so that
// solutions can be cached independently of it.
const MINMAX_OTHER: &str = "solve$b";
const MINMAX_LIMIT: &str = "solve$c";

struct SolveForInterval<'a> {
    var: &'a str,
    /// Whether we want values where the condition is true or false.
    target: bool,
    outer: bool,
    already_solved: bool,
    /// Boolean lets that mention the variable.
    lets: Scope<Arc<Expr>>,
    solved_vars: BTreeMap<(String, bool), Interval>,
    solved_minmax: BTreeMap<(ExprKey, bool), Interval>,
}

fn map_bound(bound: &Bound, f: impl FnOnce(&Arc<Expr>) -> Arc<Expr>) -> Bound {
    match bound {
        Bound::Finite(e) => Bound::Finite(f(e)),
        other => other.clone(),
    }
}

impl<'a> SolveForInterval<'a> {
    fn new(var: &'a str, outer: bool) -> Self {
        Self {
            var,
            target: true,
            outer,
            already_solved: false,
            lets: Scope::new(),
            solved_vars: BTreeMap::new(),
            solved_minmax: BTreeMap::new(),
        }
    }

    fn fail(&self) -> Interval {
        if self.outer { Interval::everything() } else { Interval::nothing() }
    }

    fn interval_union(&self, a: Interval, b: Interval) -> Interval {
        if self.outer {
            return a.union(&b);
        }
        // An inner union is only an interval if the two sides overlap.
        let overlap = a.intersect(&b);
        let overlaps = !overlap.is_empty()
            && match (overlap.min_expr(), overlap.max_expr()) {
                (Some(lo), Some(hi)) => can_prove(&lo.cmp_le(hi)),
                _ => true,
            };
        if overlaps {
            a.union(&b)
        } else if a.is_empty() {
            b
        } else {
            a
        }
    }

    fn visit(&mut self, e: &Arc<Expr>) -> Interval {
        match e.kind() {
            ExprKind::Const(_) => {
                if e.is_true() == self.target {
                    Interval::everything()
                } else {
                    Interval::nothing()
                }
            }
            ExprKind::Binary(op, a, b) => self.visit_binary(*op, a, b),
            ExprKind::Not(a) => {
                self.target = !self.target;
                let result = self.visit(a);
                self.target = !self.target;
                result
            }
            ExprKind::Let { name, value, body } => {
                let uses_var =
                    expr_uses_var(value, self.var) || expr_uses_var_matching(value, |n| self.lets.contains(n));
                if uses_var {
                    self.lets.push(name.clone(), value.clone());
                }
                let mut result = self.visit(body);
                if uses_var {
                    self.lets.pop(name);
                }
                let rewrap = |bound: &Arc<Expr>| {
                    if expr_uses_var(bound, name) {
                        Expr::let_in(name.clone(), value.clone(), bound.clone())
                    } else {
                        bound.clone()
                    }
                };
                result.min = map_bound(&result.min, rewrap);
                result.max = map_bound(&result.max, rewrap);
                result
            }
            ExprKind::Variable(v) => {
                let key = (v.name.clone(), self.target);
                if let Some(done) = self.solved_vars.get(&key) {
                    return done.clone();
                }
                let Some(value) = self.lets.get(&v.name).cloned() else {
                    return self.fail();
                };
                let result = self.visit(&value);
                self.solved_vars.insert(key, result.clone());
                result
            }
            _ => self.fail(),
        }
    }

    fn visit_binary(&mut self, op: BinOp, a: &Arc<Expr>, b: &Arc<Expr>) -> Interval {
        let operand_ty = a.ty();
        match op {
            BinOp::And | BinOp::Or => {
                let ia = self.visit(a);
                let ib = self.visit(b);
                if (op == BinOp::And) == self.target { ia.intersect(&ib) } else { self.interval_union(ia, ib) }
            }
            BinOp::Lt | BinOp::Gt if operand_ty.is_float() => self.fail(),
            BinOp::Lt => self.visit(&a.cmp_le(b.sub(1))),
            BinOp::Gt => self.visit(&a.cmp_ge(b.add(1))),
            BinOp::Le | BinOp::Ge => {
                if !self.already_solved {
                    let cond = Expr::binary(op, a.clone(), b.clone());
                    let solved = solve_expression_expanded(&cond, self.var, &self.lets);
                    if !solved.fully_solved {
                        return self.fail();
                    }
                    self.already_solved = true;
                    let result = self.visit(&solved.result);
                    self.already_solved = false;
                    return result;
                }
                if op == BinOp::Le { self.solved_le(a, b) } else { self.solved_ge(a, b) }
            }
            BinOp::Eq if operand_ty.is_bool() => self.visit(&a.and(b).or(a.not().and(b.not()))),
            BinOp::Ne if operand_ty.is_bool() => self.visit(&a.and(b.not()).or(a.not().and(b))),
            BinOp::Eq => self.visit(&a.cmp_le(b).and(a.cmp_ge(b))),
            BinOp::Ne => self.visit(&a.cmp_lt(b).or(a.cmp_gt(b))),
            _ => self.fail(),
        }
    }

    /// `a <= b` where `a` is already isolated.
    fn solved_le(&mut self, a: &Arc<Expr>, b: &Arc<Expr>) -> Interval {
        if a.var_name() == Some(self.var) {
            return if self.target {
                Interval::bounded_above(b.clone())
            } else if a.ty().is_float() {
                self.fail()
            } else {
                Interval::bounded_below(simplify(&b.add(1)))
            };
        }
        let other = Expr::typed_var(b.ty(), MINMAX_LIMIT);
        if let Some((f, g)) = a.as_op(BinOp::Max) {
            // max(f, g) <= c  <==>  f <= c && (g <= c || f >= g)
            let bvar = Expr::typed_var(g.ty(), MINMAX_OTHER);
            let cond = f.cmp_le(&other).and(bvar.cmp_le(&other).or(f.cmp_ge(&bvar)));
            return self.cached_solve(cond, g, b);
        }
        if let Some((f, g)) = a.as_op(BinOp::Min) {
            // min(f, g) <= c  <==>  f <= c || (g <= c && f >= g)
            let bvar = Expr::typed_var(g.ty(), MINMAX_OTHER);
            let cond = f.cmp_le(&other).or(bvar.cmp_le(&other).and(f.cmp_ge(&bvar)));
            return self.cached_solve(cond, g, b);
        }
        self.fail()
    }

    /// `a >= b` where `a` is already isolated.
    fn solved_ge(&mut self, a: &Arc<Expr>, b: &Arc<Expr>) -> Interval {
        if a.var_name() == Some(self.var) {
            return if self.target {
                Interval::bounded_below(b.clone())
            } else if a.ty().is_float() {
                self.fail()
            } else {
                Interval::bounded_above(simplify(&b.sub(1)))
            };
        }
        let other = Expr::typed_var(b.ty(), MINMAX_LIMIT);
        if let Some((f, g)) = a.as_op(BinOp::Max) {
            // max(f, g) >= c  <==>  f >= c || (g >= c && f <= g)
            let bvar = Expr::typed_var(g.ty(), MINMAX_OTHER);
            let cond = f.cmp_ge(&other).or(bvar.cmp_ge(&other).and(f.cmp_le(&bvar)));
            return self.cached_solve(cond, g, b);
        }
        if let Some((f, g)) = a.as_op(BinOp::Min) {
            // min(f, g) >= c  <==>  f >= c && (g >= c || f <= g)
            let bvar = Expr::typed_var(g.ty(), MINMAX_OTHER);
            let cond = f.cmp_ge(&other).and(bvar.cmp_ge(&other).or(f.cmp_le(&bvar)));
            return self.cached_solve(cond, g, b);
        }
        self.fail()
    }

    /// Solve a min/max condition written over the placeholders, then put the
    /// real operands back.
    fn cached_solve(&mut self, cond: Arc<Expr>, other: &Arc<Expr>, limit: &Arc<Expr>) -> Interval {
        let key = (ExprKey(cond.clone()), self.target);
        let abstract_result = match self.solved_minmax.get(&key) {
            Some(done) => done.clone(),
            None => {
                self.already_solved = false;
                let result = self.visit(&cond);
                self.already_solved = true;
                self.solved_minmax.insert(key, result.clone());
                result
            }
        };
        let put_back = |e: &Arc<Expr>| substitute(MINMAX_LIMIT, limit, &substitute(MINMAX_OTHER, other, e));
        Interval::new(map_bound(&abstract_result.min, put_back), map_bound(&abstract_result.max, put_back))
    }
}

fn solve_for_interval(c: &Arc<Expr>, var: &str, outer: bool) -> Interval {
    let mut solver = SolveForInterval::new(var, outer);
    let raw = solver.visit(c);
    let result = Interval::new(map_bound(&raw.min, simplify), map_bound(&raw.max, simplify));
    if let (Some(lo), Some(hi)) = (result.min_expr(), result.max_expr())
        && can_prove(&lo.cmp_gt(hi))
    {
        return Interval::nothing();
    }
    result
}

/// Largest interval of `var` on which `c` is certainly true.
#[tracing::instrument(skip_all, fields(var = var))]
pub fn solve_for_inner_interval(c: &Arc<Expr>, var: &str) -> Interval {
    let result = solve_for_interval(c, var, false);
    trace!(condition = %c, ?result, "inner interval");
    result
}

/// Smallest interval of `var` outside of which `c` is certainly false.
#[tracing::instrument(skip_all, fields(var = var))]
pub fn solve_for_outer_interval(c: &Arc<Expr>, var: &str) -> Interval {
    let result = solve_for_interval(c, var, true);
    trace!(condition = %c, ?result, "outer interval");
    result
}
