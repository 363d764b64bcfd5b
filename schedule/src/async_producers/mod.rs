//! Lowering of asynchronous producers into task-parallel forks.
//!
//! A function scheduled `async` is computed by a task running concurrently
//! with its consumers. For every `Realize` of such a function the body is
//! copied twice: the producer copy keeps only the `produce` work and
//! releases one semaphore per `consume` node when it finishes, the consumer
//! copy drops the `produce` work and blocks on the matching semaphore before
//! each `consume` node. The two copies run under a [`Fork`].
//!
//! ```text
//! realize f {                     realize f {
//!   produce f { A }                 let f.semaphore_0 = make_semaphore(0)
//!   consume f { B }       =>        fork {
//! }                                   produce f { A; release(f.semaphore_0, 1) }
//!                                   } fork {
//!                                     acquire (f.semaphore_0, 1) { consume f { B } }
//!                                   }
//!                                 }
//! ```
//!
//! The pass runs in five steps:
//!
//! 1. `consume` nodes are tightened around the statements that actually read
//!    the function, so unrelated work does not wait.
//! 2. Async realizations are forked (outermost first).
//! 3. Acquires are widened over trailing sequential work and pulled outside
//!    lets and realizations, deferring allocation until the data is ready.
//! 4. Lets and realizations shared by both branches of a fork are hoisted
//!    above it; ones a branch no longer uses are dropped.
//! 5. Semaphore creation is lowered to a stack allocation plus a runtime
//!    initialisation call.
//!
//! Acquires and releases are the only synchronisation between branches.
//! A failed branch is left to the task runtime to propagate; nothing here
//! adds flags or polling.
//!
//! [`Fork`]: kiln_ir::StmtKind::Fork
//!
//! # Module Organization
//!
//! - [`fork`] - Producer/consumer body generation and the fork itself
//! - [`tighten`] - Consume-node tightening, acquire expansion, fork tightening
//! - [`semaphores`] - Lowering of semaphore creation

use std::sync::Arc;

use kiln_ir::analysis::{calls_function, loads_from_buffer};
use kiln_ir::visit::{Mutator, Visitor, walk_stmt};
use kiln_ir::{Env, Expr, Stmt, StmtKind, expr_uses_var};

pub mod fork;
pub mod semaphores;
pub mod tighten;

pub use fork::ForkAsyncProducers;
pub use semaphores::initialize_semaphores;
pub use tighten::{expand_acquire_nodes, tighten_fork_nodes, tighten_producer_consumer_nodes};

/// Rewrite every realization of an async function into a producer task and
/// a consumer task synchronised by semaphores.
#[tracing::instrument(skip_all)]
pub fn fork_async_producers(s: &Arc<Stmt>, env: &Env) -> Arc<Stmt> {
    let s = tighten_producer_consumer_nodes(s);
    let s = ForkAsyncProducers::new(env).mutate_stmt(&s);
    let s = expand_acquire_nodes(&s);
    let s = tighten_fork_nodes(&s);
    initialize_semaphores(&s)
}

/// Prefix of storage-folding semaphore names belonging to `func`.
pub(crate) fn folding_semaphore_prefix(func: &str) -> String {
    format!("{func}.folding_semaphore.")
}

/// Storage-folding head counter kept by the producer of `func`.
pub(crate) fn is_folding_head(func: &str, name: &str) -> bool {
    name.starts_with(&folding_semaphore_prefix(func)) && name.ends_with(".head")
}

/// `e` reads function `func`, its buffer, or a handle to it.
pub(crate) fn expr_uses_func(e: &Arc<Expr>, func: &str) -> bool {
    calls_function(e, func)
        || loads_from_buffer(e, func)
        || expr_uses_var(e, func)
        || expr_uses_var(e, &format!("{func}.buffer"))
}

/// `s` reads or writes function `func`.
pub(crate) fn stmt_uses_func(s: &Arc<Stmt>, func: &str) -> bool {
    struct Uses<'a> {
        func: &'a str,
        found: bool,
    }
    impl Visitor for Uses<'_> {
        fn visit_expr(&mut self, e: &Arc<Expr>) {
            self.found |= expr_uses_func(e, self.func);
        }

        fn visit_stmt(&mut self, s: &Arc<Stmt>) {
            if self.found {
                return;
            }
            if let StmtKind::Provide { name, .. } | StmtKind::Store { name, .. } = s.kind()
                && name == self.func
            {
                self.found = true;
                return;
            }
            walk_stmt(self, s);
        }
    }
    let mut v = Uses { func, found: false };
    v.visit_stmt(s);
    v.found
}
