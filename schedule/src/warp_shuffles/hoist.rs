//! Moving warp shuffles out of conditionals.
//!
//! A shuffle reads a register of another lane. When that lane is masked off
//! by an enclosing `if`, the value read is undefined, so every shuffle must
//! execute with the whole warp active. Shuffles are lifted above the `if`
//! into lets; when that is impossible (the shuffle depends on a loop inside
//! the `if`), the condition is pushed down onto the stores instead.

use std::collections::BTreeSet;
use std::sync::Arc;

use kiln_ir::analysis::loads_from_buffer;
use kiln_ir::visit::{Mutator, mutate_expr_children, mutate_stmt_children};
use kiln_ir::{Expr, ExprKind, NameGen, Stmt, StmtKind, expr_uses_var};
use tracing::debug;

use super::SHUFFLE_PREFIX;

/// Lifts the shuffles of one branch of an `if` into lets.
struct HoistFromSingleIf<'a> {
    names: &'a NameGen,
    stored_to: BTreeSet<String>,
    /// Lifted bindings in the order they were found. Bindings a shuffle
    /// depends on are found after it.
    lifted: Vec<(String, Arc<Expr>)>,
    success: bool,
}

impl<'a> HoistFromSingleIf<'a> {
    fn new(names: &'a NameGen) -> Self {
        Self { names, stored_to: BTreeSet::new(), lifted: Vec::new(), success: true }
    }

    fn lifted_use(&self, name: &str) -> bool {
        self.lifted.iter().any(|(_, v)| expr_uses_var(v, name))
    }

    /// Wrap `s` in every lifted binding, dependencies outermost.
    fn rewrap(&mut self, mut s: Arc<Stmt>) -> Arc<Stmt> {
        for (name, value) in self.lifted.drain(..) {
            s = Stmt::let_stmt(name, value, s);
        }
        s
    }
}

impl Mutator for HoistFromSingleIf<'_> {
    fn mutate_expr(&mut self, e: &Arc<Expr>) -> Arc<Expr> {
        match e.kind() {
            ExprKind::Call(c)
                if c.name.starts_with(SHUFFLE_PREFIX) && !self.stored_to.iter().any(|b| loads_from_buffer(e, b)) =>
            {
                let name = self.names.unique("shuffle");
                self.lifted.push((name.clone(), e.clone()));
                Expr::typed_var(e.ty(), name)
            }
            ExprKind::Let { name, value, body } => {
                let value = self.mutate_expr(value);
                let body = self.mutate_expr(body);
                if self.lifted_use(name) {
                    self.lifted.push((name.clone(), value));
                    body
                } else {
                    Expr::let_in(name.clone(), value, body)
                }
            }
            _ => mutate_expr_children(self, e),
        }
    }

    fn mutate_stmt(&mut self, s: &Arc<Stmt>) -> Arc<Stmt> {
        match s.kind() {
            StmtKind::LetStmt { name, value, body } => {
                let value = self.mutate_expr(value);
                let body = self.mutate_stmt(body);
                if self.lifted_use(name) {
                    self.lifted.push((name.clone(), value));
                    body
                } else {
                    Stmt::let_stmt(name.clone(), value, body)
                }
            }
            StmtKind::For(f) => {
                let mut body = self.mutate_stmt(&f.body);
                if self.lifted_use(&f.name) {
                    // The shuffle varies with this loop; it cannot leave it.
                    body = self.rewrap(body);
                    self.success = false;
                }
                Stmt::for_loop(f.name.clone(), f.min.clone(), f.extent.clone(), f.for_type, f.device_api, body)
            }
            StmtKind::Store { name, .. } => {
                self.stored_to.insert(name.clone());
                mutate_stmt_children(self, s)
            }
            _ => mutate_stmt_children(self, s),
        }
    }
}

/// Guards every store below it with `condition`.
struct MoveIfInwards {
    condition: Arc<Expr>,
}

impl Mutator for MoveIfInwards {
    fn mutate_stmt(&mut self, s: &Arc<Stmt>) -> Arc<Stmt> {
        match s.kind() {
            StmtKind::Store { .. } | StmtKind::Provide { .. } => Stmt::if_then(self.condition.clone(), s.clone()),
            _ => mutate_stmt_children(self, s),
        }
    }
}

pub(crate) struct HoistWarpShuffles<'a> {
    pub(crate) names: &'a NameGen,
}

impl Mutator for HoistWarpShuffles<'_> {
    fn mutate_stmt(&mut self, s: &Arc<Stmt>) -> Arc<Stmt> {
        let StmtKind::IfThenElse { condition, then_case, else_case } = s.kind() else {
            return mutate_stmt_children(self, s);
        };
        let then_case = self.mutate_stmt(then_case);
        let else_case = else_case.as_ref().map(|e| self.mutate_stmt(e));

        let mut hoister = HoistFromSingleIf::new(self.names);
        let then_case = hoister.mutate_stmt(&then_case);
        let else_case = else_case.map(|e| hoister.mutate_stmt(&e));
        if hoister.success {
            if !hoister.lifted.is_empty() {
                debug!(condition = %condition, count = hoister.lifted.len(), "hoisted warp shuffles out of if");
            }
            let s = Stmt::if_then_else(condition.clone(), then_case, else_case);
            return hoister.rewrap(s);
        }

        assert!(else_case.is_none(), "cannot hoist warp shuffle out of if with an else branch: {s}");
        debug!(condition = %condition, "moving if inwards around stores");
        let predicate = self.names.unique("lane_active");
        let guard = Expr::typed_var(condition.ty(), predicate.clone());
        let body = MoveIfInwards { condition: guard }.mutate_stmt(&then_case);
        // Shuffles lifted independently of any inner loop run unconditionally.
        let body = hoister.rewrap(body);
        Stmt::let_stmt(predicate, condition.clone(), body)
    }
}
