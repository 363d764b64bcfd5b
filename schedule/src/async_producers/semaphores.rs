//! Lowering `make_semaphore` into a stack slot plus an explicit init call.

use std::sync::Arc;

use kiln_ir::types::runtime;
use kiln_ir::visit::{Mutator, mutate_expr_children, mutate_stmt_children};
use kiln_ir::{CallType, Expr, ExprKind, Intrinsic, Stmt, StmtKind, Type};

/// Bytes reserved for one semaphore.
const SEMAPHORE_SIZE: i64 = 16;

/// Peel `let` wrappers off an expression.
fn peel_lets(e: &Arc<Expr>) -> (Vec<(String, Arc<Expr>)>, Arc<Expr>) {
    let mut lets = Vec::new();
    let mut inner = e.clone();
    loop {
        let next = match inner.kind() {
            ExprKind::Let { name, value, body } => {
                lets.push((name.clone(), value.clone()));
                body.clone()
            }
            _ => break,
        };
        inner = next;
    }
    (lets, inner)
}

struct InitializeSemaphores;

impl Mutator for InitializeSemaphores {
    fn mutate_expr(&mut self, e: &Arc<Expr>) -> Arc<Expr> {
        if let Some(call) = e.as_call() {
            assert!(
                call.name != runtime::MAKE_SEMAPHORE,
                "semaphore created outside a let binding: {e}"
            );
        }
        mutate_expr_children(self, e)
    }

    fn mutate_stmt(&mut self, s: &Arc<Stmt>) -> Arc<Stmt> {
        let StmtKind::LetStmt { name, value, body } = s.kind() else {
            return mutate_stmt_children(self, s);
        };
        if value.ty() != Type::HANDLE {
            return mutate_stmt_children(self, s);
        }
        let (lets, inner) = peel_lets(value);
        let initial = match inner.as_call() {
            Some(call) if call.name == runtime::MAKE_SEMAPHORE && call.args.len() == 1 => call.args[0].clone(),
            _ => return mutate_stmt_children(self, s),
        };

        let body = self.mutate_stmt(body);
        let semaphore = Expr::typed_var(Type::HANDLE, name.clone());
        let init = Expr::call(Type::I32, runtime::SEMAPHORE_INIT, [semaphore, initial], CallType::Extern, 0);
        let storage = Expr::intrinsic(Intrinsic::Alloca, Type::HANDLE, [Expr::int(SEMAPHORE_SIZE)]);
        let mut result = Stmt::let_stmt(name.clone(), storage, Stmt::block(Stmt::evaluate(init), body));
        for (name, value) in lets.into_iter().rev() {
            result = Stmt::let_stmt(name, value, result);
        }
        result
    }
}

/// Replace every `let s = make_semaphore(n)` with a stack allocation of the
/// semaphore followed by `semaphore_init(s, n)`.
///
/// # Panics
///
/// If a semaphore is created anywhere but directly as a let value.
pub fn initialize_semaphores(s: &Arc<Stmt>) -> Arc<Stmt> {
    InitializeSemaphores.mutate_stmt(s)
}
