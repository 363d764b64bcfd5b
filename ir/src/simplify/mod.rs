//! Algebraic simplification of expressions and statements.
//!
//! The simplifier works bottom-up: children are simplified first, then the
//! node itself is folded or rewritten into a canonical form. It tracks
//! constant bounds of loop and let variables so comparisons and `min`/`max`
//! can be decided from ranges.
//!
//! # Module Organization
//!
//! - [`const_bounds`] - Constant interval analysis used for range reasoning
//! - `fold` - Constant folding
//! - `linear` - Canonical sums of integer terms
//! - `rules` - Rewrite rules for expression nodes
//! - `stmt` - Rewrite rules for statement nodes

pub mod const_bounds;
pub(crate) mod fold;
mod linear;
mod rules;
mod stmt;

use std::sync::Arc;

pub use const_bounds::{ConstInterval, const_bounds};

use crate::analysis::{expr_uses_var, substitute};
use crate::expr::{Expr, ExprKind};
use crate::scope::Scope;
use crate::stmt::Stmt;
use crate::visit::{Mutator, mutate_expr_children};

/// Bounds-aware expression and statement simplifier.
#[derive(Debug, Default)]
pub struct Simplifier {
    pub(crate) bounds: Scope<ConstInterval>,
}

impl Simplifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simplifier that assumes the given constant bounds for variables.
    pub fn with_bounds(bounds: Scope<ConstInterval>) -> Self {
        Self { bounds }
    }

    pub fn push_bounds(&mut self, name: &str, interval: ConstInterval) {
        self.bounds.push(name, interval);
    }

    pub fn pop_bounds(&mut self, name: &str) {
        self.bounds.pop(name);
    }

    pub(crate) fn bounds_of(&self, e: &Arc<Expr>) -> ConstInterval {
        const_bounds(e, &self.bounds)
    }

    fn simplify_let(&mut self, e: &Arc<Expr>, name: &str, value: &Arc<Expr>, body: &Arc<Expr>) -> Arc<Expr> {
        let value = self.mutate_expr(value);
        if is_trivial_binding(&value) {
            return self.mutate_expr(&substitute(name, &value, body));
        }
        let interval = self.bounds_of(&value);
        self.bounds.push(name, interval);
        let new_body = self.mutate_expr(body);
        self.bounds.pop(name);
        if !expr_uses_var(&new_body, name) {
            return new_body;
        }
        match e.kind() {
            ExprKind::Let { value: v, body: b, .. } if Arc::ptr_eq(v, &value) && Arc::ptr_eq(b, &new_body) => e.clone(),
            _ => Expr::let_in(name, value, new_body),
        }
    }
}

/// Values cheap enough to substitute into every use.
pub(crate) fn is_trivial_binding(value: &Arc<Expr>) -> bool {
    match value.kind() {
        ExprKind::Const(_) | ExprKind::Variable(_) => true,
        ExprKind::Broadcast { value, .. } => is_trivial_binding(value),
        ExprKind::Ramp { base, stride, .. } => is_trivial_binding(base) && stride.is_const(),
        _ => false,
    }
}

impl Mutator for Simplifier {
    fn mutate_expr(&mut self, e: &Arc<Expr>) -> Arc<Expr> {
        match e.kind() {
            ExprKind::Let { name, value, body } => self.simplify_let(e, name, value, body),
            _ => {
                let e = mutate_expr_children(self, e);
                self.simplify_node(&e)
            }
        }
    }

    fn mutate_stmt(&mut self, s: &Arc<Stmt>) -> Arc<Stmt> {
        self.simplify_stmt_node(s)
    }
}

// ============================================================================
// Entry points
// ============================================================================

pub fn simplify(e: &Arc<Expr>) -> Arc<Expr> {
    Simplifier::new().mutate_expr(e)
}

/// Simplify `e` assuming the variables in `bounds` lie in their intervals.
pub fn simplify_in_scope(e: &Arc<Expr>, bounds: &Scope<ConstInterval>) -> Arc<Expr> {
    Simplifier::with_bounds(bounds.clone()).mutate_expr(e)
}

pub fn simplify_stmt(s: &Arc<Stmt>) -> Arc<Stmt> {
    Simplifier::new().mutate_stmt(s)
}

/// `e` simplifies to `true`. A `false` answer means "unknown".
pub fn can_prove(e: &Arc<Expr>) -> bool {
    simplify(e).is_true()
}

pub fn can_prove_in_scope(e: &Arc<Expr>, bounds: &Scope<ConstInterval>) -> bool {
    simplify_in_scope(e, bounds).is_true()
}
