//! Statement rules: dead branches, empty loops and unused bindings.

use std::sync::Arc;

use super::const_bounds::ConstInterval;
use super::{Simplifier, is_trivial_binding};
use crate::analysis::{stmt_uses_var, substitute_in_stmt};
use crate::equality::graph_equal;
use crate::expr::{Expr, ExprKind};
use crate::stmt::{Stmt, StmtKind};
use crate::types::{BinOp, DeviceApi, ForType};
use crate::visit::{Mutator, mutate_stmt_children, rewrite_exprs_in_stmt};

impl Simplifier {
    pub(super) fn simplify_stmt_node(&mut self, s: &Arc<Stmt>) -> Arc<Stmt> {
        match s.kind() {
            StmtKind::LetStmt { name, value, body } => {
                let value = self.mutate_expr(value);
                if is_trivial_binding(&value) {
                    return self.mutate_stmt(&substitute_in_stmt(name, &value, body));
                }
                let interval = self.bounds_of(&value);
                self.bounds.push(name, interval);
                let body = self.mutate_stmt(body);
                self.bounds.pop(name);
                if !stmt_uses_var(&body, name) { body } else { Stmt::let_stmt(name.clone(), value, body) }
            }
            StmtKind::For(f) => {
                let min = self.mutate_expr(&f.min);
                let extent = self.mutate_expr(&f.extent);
                if extent.as_int().is_some_and(|e| e <= 0) {
                    return Stmt::no_op();
                }
                let inline_single = extent.is_one()
                    && f.device_api == DeviceApi::None
                    && matches!(
                        f.for_type,
                        ForType::Serial | ForType::Unrolled | ForType::Parallel | ForType::Vectorized
                    );
                if inline_single {
                    return self.mutate_stmt(&Stmt::let_stmt(f.name.clone(), min, f.body.clone()));
                }
                let (bmin, bext) = (self.bounds_of(&min), self.bounds_of(&extent));
                let last = bmin.max.zip(bext.max).and_then(|(m, e)| m.checked_add(e)).and_then(|v| v.checked_sub(1));
                self.bounds.push(&f.name, ConstInterval::new(bmin.min, last));
                let body = self.mutate_stmt(&f.body);
                self.bounds.pop(&f.name);
                if body.is_no_op() {
                    return body;
                }
                // Iterated no-op acquires become one acquire of the total count.
                if let StmtKind::Acquire { semaphore, count, body: inner } = body.kind()
                    && inner.is_no_op()
                {
                    let total = self.mutate_expr(&count.mul(&extent));
                    return Stmt::acquire(semaphore.clone(), total, inner.clone());
                }
                let unchanged =
                    Arc::ptr_eq(&min, &f.min) && Arc::ptr_eq(&extent, &f.extent) && Arc::ptr_eq(&body, &f.body);
                if unchanged {
                    s.clone()
                } else {
                    Stmt::for_loop(f.name.clone(), min, extent, f.for_type, f.device_api, body)
                }
            }
            StmtKind::IfThenElse { condition, then_case, else_case } => {
                self.simplify_if(condition, then_case, else_case.as_ref())
            }
            _ => {
                let s = mutate_stmt_children(self, s);
                self.simplify_leaf_stmt(&s)
            }
        }
    }

    fn simplify_leaf_stmt(&mut self, s: &Arc<Stmt>) -> Arc<Stmt> {
        match s.kind() {
            StmtKind::Block(a, b) if a.is_no_op() => b.clone(),
            StmtKind::Block(a, b) if b.is_no_op() => a.clone(),
            StmtKind::Fork(a, b) if a.is_no_op() => b.clone(),
            StmtKind::Fork(a, b) if b.is_no_op() => a.clone(),
            StmtKind::ProducerConsumer { body, .. } | StmtKind::Atomic { body, .. } if body.is_no_op() => body.clone(),
            StmtKind::Allocate(a) if a.body.is_no_op() => a.body.clone(),
            StmtKind::Realize(r) if r.body.is_no_op() => r.body.clone(),
            StmtKind::Prefetch { body, .. } if body.is_no_op() => body.clone(),
            StmtKind::Assert { condition, .. } if condition.is_true() => Stmt::no_op(),
            StmtKind::Evaluate(v) if !v.is_const() && v.is_pure() && v.as_call().is_none() => Stmt::no_op(),
            StmtKind::Store { name, value, index, predicate } if predicate.is_true() => match value.as_load() {
                Some(l) if l.name == *name && graph_equal(&l.index, index) => Stmt::no_op(),
                _ => s.clone(),
            },
            _ => s.clone(),
        }
    }

    fn simplify_if(
        &mut self,
        condition: &Arc<Expr>,
        then_case: &Arc<Stmt>,
        else_case: Option<&Arc<Stmt>>,
    ) -> Arc<Stmt> {
        let condition = self.mutate_expr(condition);
        let bare = condition.as_likely().unwrap_or(&condition).clone();
        if bare.is_true() {
            return self.mutate_stmt(then_case);
        }
        if bare.is_false() {
            return else_case.map_or_else(Stmt::no_op, |e| self.mutate_stmt(e));
        }

        let then_case = rewrite_exprs_in_stmt(then_case, |e| graph_equal(e, &bare).then(Expr::const_true));
        let then_case = self.with_facts(&bare, true, |s| s.mutate_stmt(&then_case));
        let else_case = else_case
            .map(|e| rewrite_exprs_in_stmt(e, |x| graph_equal(x, &bare).then(Expr::const_false)))
            .map(|e| self.with_facts(&bare, false, |s| s.mutate_stmt(&e)))
            .filter(|e| !e.is_no_op());

        match else_case {
            None if then_case.is_no_op() => then_case,
            Some(e) if then_case.is_no_op() => {
                let negated = self.mutate_expr(&condition.not());
                Stmt::if_then(negated, e)
            }
            else_case => Stmt::if_then_else(condition, then_case, else_case),
        }
    }

    /// Run `f` with the variable bounds implied by `condition == truth`.
    fn with_facts<R>(&mut self, condition: &Arc<Expr>, truth: bool, f: impl FnOnce(&mut Self) -> R) -> R {
        let mut facts = Vec::new();
        self.learn(condition, truth, &mut facts);
        for (name, interval) in &facts {
            let current = self.bounds.get(name).copied().unwrap_or_default();
            self.bounds.push(name.as_str(), current.intersect(*interval));
        }
        let result = f(self);
        for (name, _) in facts.iter().rev() {
            self.bounds.pop(name);
        }
        result
    }

    fn learn(&self, condition: &Arc<Expr>, truth: bool, facts: &mut Vec<(String, ConstInterval)>) {
        match condition.kind() {
            ExprKind::Binary(BinOp::And, a, b) if truth => {
                self.learn(a, true, facts);
                self.learn(b, true, facts);
            }
            ExprKind::Binary(BinOp::Or, a, b) if !truth => {
                self.learn(a, false, facts);
                self.learn(b, false, facts);
            }
            ExprKind::Not(a) => self.learn(a, !truth, facts),
            ExprKind::Binary(op, a, b) if op.is_comparison() && a.ty().is_int() && a.ty().is_scalar() => {
                let op = if truth { Some(*op) } else { op.negated() };
                let Some(op) = op else { return };
                if let Some(name) = a.var_name() {
                    facts.push((name.to_string(), implied(op, self.bounds_of(b))));
                } else if let Some(name) = b.var_name() {
                    facts.push((name.to_string(), implied(op.flipped(), self.bounds_of(a))));
                }
            }
            _ => {}
        }
    }
}

/// Interval of `v` implied by `v op e` where `e` lies in `bound`.
fn implied(op: BinOp, bound: ConstInterval) -> ConstInterval {
    let (lo, hi) = (bound.min, bound.max);
    match op {
        BinOp::Lt => ConstInterval::new(None, hi.and_then(|h| h.checked_sub(1))),
        BinOp::Le => ConstInterval::new(None, hi),
        BinOp::Gt => ConstInterval::new(lo.and_then(|l| l.checked_add(1)), None),
        BinOp::Ge => ConstInterval::new(lo, None),
        BinOp::Eq => bound,
        _ => ConstInterval::EVERYTHING,
    }
}
