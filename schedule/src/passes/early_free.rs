//! Freeing allocations right after their last use.
//!
//! ```text
//! allocate tmp[f32 * 16]            allocate tmp[f32 * 16]
//!   for x: tmp[x] = ...               for x: tmp[x] = ...
//!   for x: out[x] = tmp[x]    =>      for x: out[x] = tmp[x]
//!   for x: other[x] = 0               free tmp
//!                                     for x: other[x] = 0
//! ```
//!
//! A use inside a loop (or a fork) counts as a use by the whole outermost
//! loop, so the free never lands inside an iteration.

use std::sync::Arc;

use kiln_ir::stmt::Allocate;
use kiln_ir::visit::{Mutator, Visitor, mutate_stmt_children, walk_expr, walk_stmt};
use kiln_ir::{Expr, ExprKind, Stmt, StmtKind};
use tracing::trace;

/// Finds the statement holding the last use of a buffer, in program order.
struct FindLastUse<'a> {
    buffer: &'a str,
    in_loop: bool,
    containing: Option<Arc<Stmt>>,
    last_use: Option<Arc<Stmt>>,
}

impl FindLastUse<'_> {
    fn touch(&mut self) {
        self.last_use.clone_from(&self.containing);
    }
}

impl Visitor for FindLastUse<'_> {
    fn visit_expr(&mut self, e: &Arc<Expr>) {
        let used = match e.kind() {
            ExprKind::Load(l) => l.name == self.buffer,
            ExprKind::Call(c) => c.is_data_access() && c.name == self.buffer,
            ExprKind::Variable(v) => v.name.strip_suffix(".buffer") == Some(self.buffer),
            _ => false,
        };
        if used {
            self.touch();
        }
        walk_expr(self, e);
    }

    fn visit_stmt(&mut self, s: &Arc<Stmt>) {
        if self.in_loop {
            if matches!(s.kind(), StmtKind::Store { name, .. } if name == self.buffer) {
                self.touch();
            }
            walk_stmt(self, s);
            return;
        }
        self.containing = Some(s.clone());
        if matches!(s.kind(), StmtKind::Store { name, .. } if name == self.buffer) {
            self.touch();
        }
        if matches!(s.kind(), StmtKind::For(_) | StmtKind::Fork(..)) {
            self.in_loop = true;
            walk_stmt(self, s);
            self.in_loop = false;
        } else {
            walk_stmt(self, s);
        }
    }
}

/// Appends the free after the marked statement, searching back to front.
struct InjectMarker<'a> {
    buffer: &'a str,
    last_use: Arc<Stmt>,
    injected: bool,
}

impl Mutator for InjectMarker<'_> {
    fn mutate_stmt(&mut self, s: &Arc<Stmt>) -> Arc<Stmt> {
        if self.injected {
            return s.clone();
        }
        if Arc::ptr_eq(s, &self.last_use) {
            self.injected = true;
            return Stmt::block(s.clone(), Stmt::free(self.buffer));
        }
        match s.kind() {
            StmtKind::Block(first, rest) => {
                let new_rest = self.mutate_stmt(rest);
                let new_first = self.mutate_stmt(first);
                if Arc::ptr_eq(&new_first, first) && Arc::ptr_eq(&new_rest, rest) {
                    s.clone()
                } else {
                    Stmt::block(new_first, new_rest)
                }
            }
            _ => mutate_stmt_children(self, s),
        }
    }
}

struct InjectEarlyFrees;

impl Mutator for InjectEarlyFrees {
    fn mutate_stmt(&mut self, s: &Arc<Stmt>) -> Arc<Stmt> {
        let s = mutate_stmt_children(self, s);
        let StmtKind::Allocate(a) = s.kind() else {
            return s.clone();
        };

        let mut finder = FindLastUse { buffer: &a.name, in_loop: false, containing: None, last_use: None };
        finder.visit_stmt(&a.body);
        let Some(last_use) = finder.last_use else {
            return s.clone();
        };
        trace!(buffer = %a.name, "injecting early free");
        let mut marker = InjectMarker { buffer: &a.name, last_use, injected: false };
        let body = marker.mutate_stmt(&a.body);
        Stmt::new(StmtKind::Allocate(Allocate { body, ..a.clone() }))
    }
}

/// Free each allocation as soon as nothing later reads or writes it.
#[tracing::instrument(skip_all)]
pub fn inject_early_frees(s: &Arc<Stmt>) -> Arc<Stmt> {
    InjectEarlyFrees.mutate_stmt(s)
}
