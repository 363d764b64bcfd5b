//! Loop-invariant code motion.
//!
//! Pure subexpressions of a serial or parallel loop body that depend on
//! nothing the body binds are computed once, in lets placed just outside
//! the loop:
//!
//! ```text
//! for x in [0, 100):                  let x.licm$0 = n * m + 3
//!   out[x] = in[x] * (n * m + 3)  =>  for x in [0, 100):
//!                                       out[x] = in[x] * x.licm$0
//! ```
//!
//! GPU loops are walked into but nothing is lifted out of them. Cheap
//! expressions (constants, variables, a variable offset or scaled by a
//! constant) stay where they are.

use std::collections::BTreeSet;
use std::sync::Arc;

use kiln_ir::analysis::free_variables;
use kiln_ir::stmt::For;
use kiln_ir::visit::{
    Mutator, Visitor, for_each_expr, mutate_expr_children, mutate_stmt_children, walk_expr, walk_stmt,
};
use kiln_ir::{BinOp, Expr, ExprKind, NameGen, Stmt, StmtKind, equal};
use tracing::debug;

/// Every name a statement binds: loop variables and lets.
#[derive(Default)]
struct BoundNames {
    names: BTreeSet<String>,
}

impl Visitor for BoundNames {
    fn visit_expr(&mut self, e: &Arc<Expr>) {
        if let ExprKind::Let { name, .. } = e.kind() {
            self.names.insert(name.clone());
        }
        walk_expr(self, e);
    }

    fn visit_stmt(&mut self, s: &Arc<Stmt>) {
        match s.kind() {
            StmtKind::LetStmt { name, .. } => {
                self.names.insert(name.clone());
            }
            StmtKind::For(f) => {
                self.names.insert(f.name.clone());
            }
            _ => {}
        }
        walk_stmt(self, s);
    }
}

/// Loop variables and let names bound anywhere inside `s`.
pub(crate) fn bound_names(s: &Arc<Stmt>) -> BTreeSet<String> {
    let mut bound = BoundNames::default();
    bound.visit_stmt(s);
    bound.names
}

fn is_cheap(e: &Arc<Expr>) -> bool {
    match e.kind() {
        ExprKind::Const(_) | ExprKind::StringImm(_) | ExprKind::Variable(_) => true,
        ExprKind::Broadcast { value, .. } | ExprKind::Cast(value) => is_cheap(value),
        ExprKind::Binary(BinOp::Add | BinOp::Sub | BinOp::Mul, a, b) => {
            (a.as_variable().is_some() && b.is_const()) || (a.is_const() && b.as_variable().is_some())
        }
        _ => false,
    }
}

fn is_liftable(e: &Arc<Expr>, bound: &BTreeSet<String>) -> bool {
    if e.ty().is_handle() || !e.is_pure() {
        return false;
    }
    let mut reads_data = false;
    for_each_expr(e, |node| {
        reads_data |= node.as_call().is_some_and(|c| c.is_data_access());
        !reads_data
    });
    !reads_data && free_variables(e).is_disjoint(bound)
}

/// Replaces the largest invariant subexpressions of one loop body.
struct LiftInvariants<'a> {
    bound: BTreeSet<String>,
    prefix: String,
    names: &'a NameGen,
    lifted: Vec<(String, Arc<Expr>)>,
}

impl Mutator for LiftInvariants<'_> {
    fn mutate_expr(&mut self, e: &Arc<Expr>) -> Arc<Expr> {
        if is_cheap(e) || !is_liftable(e, &self.bound) {
            return mutate_expr_children(self, e);
        }
        let name = match self.lifted.iter().find(|(_, value)| equal(value, e)) {
            Some((name, _)) => name.clone(),
            None => {
                let name = self.names.unique(&self.prefix);
                self.lifted.push((name.clone(), e.clone()));
                name
            }
        };
        Expr::typed_var(e.ty(), name)
    }
}

struct HoistLoopInvariants {
    names: NameGen,
}

impl Mutator for HoistLoopInvariants {
    fn mutate_stmt(&mut self, s: &Arc<Stmt>) -> Arc<Stmt> {
        let StmtKind::For(f) = s.kind() else {
            return mutate_stmt_children(self, s);
        };
        if f.for_type.is_gpu() {
            return mutate_stmt_children(self, s);
        }

        let mut bound = bound_names(&f.body);
        bound.insert(f.name.clone());
        let prefix = format!("{}.licm", f.name);
        let mut lifter = LiftInvariants { bound, prefix, names: &self.names, lifted: vec![] };
        let body = lifter.mutate_stmt(&f.body);
        let lifted = lifter.lifted;
        let body = self.mutate_stmt(&body);

        if lifted.is_empty() && Arc::ptr_eq(&body, &f.body) {
            return s.clone();
        }
        if !lifted.is_empty() {
            debug!(loop_var = %f.name, count = lifted.len(), "hoisted loop invariants");
        }
        let result = Stmt::new(StmtKind::For(For { body, ..f.clone() }));
        lifted.into_iter().rev().fold(result, |inner, (name, value)| Stmt::let_stmt(name, value, inner))
    }
}

/// Lift pure loop-invariant subexpressions out of non-GPU loops.
#[tracing::instrument(skip_all)]
pub fn hoist_loop_invariant_values(s: &Arc<Stmt>) -> Arc<Stmt> {
    HoistLoopInvariants { names: NameGen::new() }.mutate_stmt(s)
}
