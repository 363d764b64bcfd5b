//! Tree traversal traits.
//!
//! Passes implement [`Visitor`] (read-only) or [`Mutator`] (rebuilding) and
//! override the hook for the node kinds they care about, matching on the
//! variant. Whatever a pass does not handle goes through [`walk_expr`] /
//! [`mutate_expr_children`], which recurse into children and rebuild a node
//! only when a child actually changed. Passes that must reject unknown node
//! kinds match exhaustively instead of delegating.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::expr::{Call, Expr, ExprKind, Load};
use crate::stmt::{Allocate, For, Range, Realize, Stmt, StmtKind};

// ============================================================================
// Visitor
// ============================================================================

pub trait Visitor {
    fn visit_expr(&mut self, e: &Arc<Expr>) {
        walk_expr(self, e);
    }

    fn visit_stmt(&mut self, s: &Arc<Stmt>) {
        walk_stmt(self, s);
    }
}

/// Visit every direct child expression of `e`.
pub fn walk_expr<V: Visitor + ?Sized>(v: &mut V, e: &Arc<Expr>) {
    for child in e.children() {
        v.visit_expr(child);
    }
}

/// Visit every direct child expression, then every child statement of `s`.
pub fn walk_stmt<V: Visitor + ?Sized>(v: &mut V, s: &Arc<Stmt>) {
    for e in s.exprs() {
        v.visit_expr(e);
    }
    for child in s.stmts() {
        v.visit_stmt(child);
    }
}

// ============================================================================
// Mutator
// ============================================================================

pub trait Mutator {
    fn mutate_expr(&mut self, e: &Arc<Expr>) -> Arc<Expr> {
        mutate_expr_children(self, e)
    }

    fn mutate_stmt(&mut self, s: &Arc<Stmt>) -> Arc<Stmt> {
        mutate_stmt_children(self, s)
    }
}

fn same<T>(a: &Arc<T>, b: &Arc<T>) -> bool {
    Arc::ptr_eq(a, b)
}

fn mutate_all<M: Mutator + ?Sized>(m: &mut M, exprs: &[Arc<Expr>]) -> (Vec<Arc<Expr>>, bool) {
    let mut changed = false;
    let out = exprs
        .iter()
        .map(|e| {
            let n = m.mutate_expr(e);
            changed |= !same(&n, e);
            n
        })
        .collect();
    (out, changed)
}

/// Rebuild `e` with mutated children, reusing `e` when nothing changed.
pub fn mutate_expr_children<M: Mutator + ?Sized>(m: &mut M, e: &Arc<Expr>) -> Arc<Expr> {
    let ty = e.ty();
    match e.kind() {
        ExprKind::Const(_) | ExprKind::StringImm(_) | ExprKind::Variable(_) => e.clone(),
        ExprKind::Cast(a) => {
            let na = m.mutate_expr(a);
            if same(&na, a) { e.clone() } else { Expr::new(ExprKind::Cast(na), ty) }
        }
        ExprKind::Reinterpret(a) => {
            let na = m.mutate_expr(a);
            if same(&na, a) { e.clone() } else { Expr::new(ExprKind::Reinterpret(na), ty) }
        }
        ExprKind::Not(a) => {
            let na = m.mutate_expr(a);
            if same(&na, a) { e.clone() } else { Expr::new(ExprKind::Not(na), ty) }
        }
        ExprKind::Binary(op, a, b) => {
            let (na, nb) = (m.mutate_expr(a), m.mutate_expr(b));
            if same(&na, a) && same(&nb, b) { e.clone() } else { Expr::binary(*op, na, nb) }
        }
        ExprKind::Select(c, t, f) => {
            let (nc, nt, nf) = (m.mutate_expr(c), m.mutate_expr(t), m.mutate_expr(f));
            if same(&nc, c) && same(&nt, t) && same(&nf, f) { e.clone() } else { Expr::select(nc, nt, nf) }
        }
        ExprKind::Load(l) => {
            let (ni, np) = (m.mutate_expr(&l.index), m.mutate_expr(&l.predicate));
            if same(&ni, &l.index) && same(&np, &l.predicate) {
                e.clone()
            } else {
                Expr::new(ExprKind::Load(Load { name: l.name.clone(), index: ni, predicate: np }), ty)
            }
        }
        ExprKind::Ramp { base, stride, lanes } => {
            let (nb, ns) = (m.mutate_expr(base), m.mutate_expr(stride));
            if same(&nb, base) && same(&ns, stride) { e.clone() } else { Expr::ramp(nb, ns, *lanes) }
        }
        ExprKind::Broadcast { value, lanes } => {
            let nv = m.mutate_expr(value);
            if same(&nv, value) { e.clone() } else { Expr::broadcast(nv, *lanes) }
        }
        ExprKind::Shuffle { vectors, indices } => {
            let (nv, changed) = mutate_all(m, vectors);
            if changed { Expr::shuffle(SmallVec::from_vec(nv), indices.clone()) } else { e.clone() }
        }
        ExprKind::VectorReduce { op, value } => {
            let nv = m.mutate_expr(value);
            if same(&nv, value) { e.clone() } else { Expr::new(ExprKind::VectorReduce { op: *op, value: nv }, ty) }
        }
        ExprKind::Call(c) => {
            let (args, changed) = mutate_all(m, &c.args);
            if changed {
                let call = Call {
                    name: c.name.clone(),
                    args: args.into(),
                    call_type: c.call_type,
                    value_index: c.value_index,
                };
                Expr::new(ExprKind::Call(call), ty)
            } else {
                e.clone()
            }
        }
        ExprKind::Let { name, value, body } => {
            let (nv, nb) = (m.mutate_expr(value), m.mutate_expr(body));
            if same(&nv, value) && same(&nb, body) { e.clone() } else { Expr::let_in(name.clone(), nv, nb) }
        }
    }
}

/// Rebuild `s` with mutated expressions and child statements, reusing `s`
/// when nothing changed.
pub fn mutate_stmt_children<M: Mutator + ?Sized>(m: &mut M, s: &Arc<Stmt>) -> Arc<Stmt> {
    match s.kind() {
        StmtKind::LetStmt { name, value, body } => {
            let (nv, nb) = (m.mutate_expr(value), m.mutate_stmt(body));
            if same(&nv, value) && same(&nb, body) { s.clone() } else { Stmt::let_stmt(name.clone(), nv, nb) }
        }
        StmtKind::Assert { condition, message } => {
            let (nc, nm) = (m.mutate_expr(condition), m.mutate_expr(message));
            if same(&nc, condition) && same(&nm, message) { s.clone() } else { Stmt::assert(nc, nm) }
        }
        StmtKind::ProducerConsumer { name, is_producer, body } => {
            let nb = m.mutate_stmt(body);
            if same(&nb, body) {
                s.clone()
            } else {
                Stmt::new(StmtKind::ProducerConsumer { name: name.clone(), is_producer: *is_producer, body: nb })
            }
        }
        StmtKind::For(f) => {
            let (nmin, next) = (m.mutate_expr(&f.min), m.mutate_expr(&f.extent));
            let nb = m.mutate_stmt(&f.body);
            if same(&nmin, &f.min) && same(&next, &f.extent) && same(&nb, &f.body) {
                s.clone()
            } else {
                Stmt::new(StmtKind::For(For { min: nmin, extent: next, body: nb, ..f.clone() }))
            }
        }
        StmtKind::Acquire { semaphore, count, body } => {
            let (ns, nc, nb) = (m.mutate_expr(semaphore), m.mutate_expr(count), m.mutate_stmt(body));
            if same(&ns, semaphore) && same(&nc, count) && same(&nb, body) {
                s.clone()
            } else {
                Stmt::acquire(ns, nc, nb)
            }
        }
        StmtKind::Store { name, value, index, predicate } => {
            let (nv, ni, np) = (m.mutate_expr(value), m.mutate_expr(index), m.mutate_expr(predicate));
            if same(&nv, value) && same(&ni, index) && same(&np, predicate) {
                s.clone()
            } else {
                Stmt::store_predicated(name.clone(), nv, ni, np)
            }
        }
        StmtKind::Provide { name, values, args, predicate } => {
            let (nv, cv) = mutate_all(m, values);
            let (na, ca) = mutate_all(m, args);
            let np = m.mutate_expr(predicate);
            if !cv && !ca && same(&np, predicate) {
                s.clone()
            } else {
                Stmt::new(StmtKind::Provide { name: name.clone(), values: nv, args: na, predicate: np })
            }
        }
        StmtKind::Allocate(a) => {
            let (extents, ce) = mutate_all(m, &a.extents);
            let condition = m.mutate_expr(&a.condition);
            let new_expr = a.new_expr.as_ref().map(|e| m.mutate_expr(e));
            let body = m.mutate_stmt(&a.body);
            let new_same = match (&new_expr, &a.new_expr) {
                (Some(x), Some(y)) => same(x, y),
                _ => true,
            };
            if !ce && same(&condition, &a.condition) && new_same && same(&body, &a.body) {
                s.clone()
            } else {
                Stmt::new(StmtKind::Allocate(Allocate { extents, condition, new_expr, body, ..a.clone() }))
            }
        }
        StmtKind::Free { .. } => s.clone(),
        StmtKind::Realize(r) => {
            let (bounds, cb) = mutate_ranges(m, &r.bounds);
            let condition = m.mutate_expr(&r.condition);
            let body = m.mutate_stmt(&r.body);
            if !cb && same(&condition, &r.condition) && same(&body, &r.body) {
                s.clone()
            } else {
                Stmt::new(StmtKind::Realize(Realize { bounds, condition, body, ..r.clone() }))
            }
        }
        StmtKind::Prefetch { name, types, bounds, condition, body } => {
            let (nbounds, cb) = mutate_ranges(m, bounds);
            let nc = m.mutate_expr(condition);
            let nb = m.mutate_stmt(body);
            if !cb && same(&nc, condition) && same(&nb, body) {
                s.clone()
            } else {
                Stmt::new(StmtKind::Prefetch {
                    name: name.clone(),
                    types: types.clone(),
                    bounds: nbounds,
                    condition: nc,
                    body: nb,
                })
            }
        }
        StmtKind::Block(a, b) => {
            let (na, nb) = (m.mutate_stmt(a), m.mutate_stmt(b));
            if same(&na, a) && same(&nb, b) { s.clone() } else { Stmt::block(na, nb) }
        }
        StmtKind::Fork(a, b) => {
            let (na, nb) = (m.mutate_stmt(a), m.mutate_stmt(b));
            if same(&na, a) && same(&nb, b) { s.clone() } else { Stmt::fork(na, nb) }
        }
        StmtKind::IfThenElse { condition, then_case, else_case } => {
            let nc = m.mutate_expr(condition);
            let nt = m.mutate_stmt(then_case);
            let ne = else_case.as_ref().map(|e| m.mutate_stmt(e));
            let else_same = match (&ne, else_case) {
                (Some(x), Some(y)) => same(x, y),
                _ => true,
            };
            if same(&nc, condition) && same(&nt, then_case) && else_same {
                s.clone()
            } else {
                Stmt::if_then_else(nc, nt, ne)
            }
        }
        StmtKind::Evaluate(e) => {
            let ne = m.mutate_expr(e);
            if same(&ne, e) { s.clone() } else { Stmt::evaluate(ne) }
        }
        StmtKind::Atomic { producer_name, mutex_name, body } => {
            let nb = m.mutate_stmt(body);
            if same(&nb, body) { s.clone() } else { Stmt::atomic(producer_name.clone(), mutex_name.clone(), nb) }
        }
    }
}

fn mutate_ranges<M: Mutator + ?Sized>(m: &mut M, ranges: &[Range]) -> (Vec<Range>, bool) {
    let mut changed = false;
    let out = ranges
        .iter()
        .map(|r| {
            let (min, extent) = (m.mutate_expr(&r.min), m.mutate_expr(&r.extent));
            changed |= !same(&min, &r.min) || !same(&extent, &r.extent);
            Range { min, extent }
        })
        .collect();
    (out, changed)
}

// ============================================================================
// Closure adapters
// ============================================================================

/// Visitor from a closure called on every expression in pre-order.
///
/// Returning `false` stops descent below that node.
pub struct ExprWalker<F>(pub F);

impl<F: FnMut(&Arc<Expr>) -> bool> Visitor for ExprWalker<F> {
    fn visit_expr(&mut self, e: &Arc<Expr>) {
        if (self.0)(e) {
            walk_expr(self, e);
        }
    }
}

/// Call `f` on every expression reachable from `e` (pre-order).
pub fn for_each_expr(e: &Arc<Expr>, f: impl FnMut(&Arc<Expr>) -> bool) {
    ExprWalker(f).visit_expr(e);
}

/// Call `f` on every expression reachable from `s` (pre-order).
pub fn for_each_expr_in_stmt(s: &Arc<Stmt>, f: impl FnMut(&Arc<Expr>) -> bool) {
    ExprWalker(f).visit_stmt(s);
}

/// Mutator from a closure tried on every expression before descending.
///
/// The closure returns `Some(replacement)` to replace a node (without
/// descending into it) or `None` to keep recursing.
pub struct ExprRewriter<F>(pub F);

impl<F: FnMut(&Arc<Expr>) -> Option<Arc<Expr>>> Mutator for ExprRewriter<F> {
    fn mutate_expr(&mut self, e: &Arc<Expr>) -> Arc<Expr> {
        match (self.0)(e) {
            Some(r) => r,
            None => mutate_expr_children(self, e),
        }
    }
}

/// Rewrite `e` top-down with `f`.
pub fn rewrite_expr(e: &Arc<Expr>, f: impl FnMut(&Arc<Expr>) -> Option<Arc<Expr>>) -> Arc<Expr> {
    ExprRewriter(f).mutate_expr(e)
}

/// Rewrite every expression in `s` top-down with `f`.
pub fn rewrite_exprs_in_stmt(s: &Arc<Stmt>, f: impl FnMut(&Arc<Expr>) -> Option<Arc<Expr>>) -> Arc<Stmt> {
    ExprRewriter(f).mutate_stmt(s)
}
