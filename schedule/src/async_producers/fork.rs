//! Splitting an async realization into a producer task and a consumer task.

use std::collections::BTreeMap;
use std::sync::Arc;

use kiln_ir::stmt::{Allocate, Realize};
use kiln_ir::types::runtime;
use kiln_ir::visit::{Mutator, Visitor, mutate_stmt_children, walk_stmt};
use kiln_ir::{CallType, Env, Expr, NameGen, Stmt, StmtKind, Type};
use tracing::debug;

use super::{folding_semaphore_prefix, is_folding_head};

// ============================================================================
// Runtime calls
// ============================================================================

pub(crate) fn semaphore_var(name: &str) -> Arc<Expr> {
    Expr::typed_var(Type::HANDLE, name)
}

pub(crate) fn make_semaphore(initial: i64) -> Arc<Expr> {
    Expr::call(Type::HANDLE, runtime::MAKE_SEMAPHORE, [Expr::int(initial)], CallType::Extern, 0)
}

pub(crate) fn release(semaphore: Arc<Expr>, count: i64) -> Arc<Stmt> {
    let args = [semaphore, Expr::int(count)];
    Stmt::evaluate(Expr::call(Type::I32, runtime::SEMAPHORE_RELEASE, args, CallType::Extern, 0))
}

/// Name of the semaphore variable a `release` or `init` statement targets.
pub(crate) fn semaphore_call(s: &Stmt) -> Option<&str> {
    let StmtKind::Evaluate(e) = s.kind() else {
        return None;
    };
    let call = e.as_call()?;
    if call.name != runtime::SEMAPHORE_RELEASE && call.name != runtime::SEMAPHORE_INIT {
        return None;
    }
    call.args.first()?.var_name()
}

// ============================================================================
// No-op collapsing
// ============================================================================

/// Rebuild a structural node from its mutated children, dropping it when its
/// body became a no-op. Leaves and markers go through `mutate_stmt_children`.
fn collapse_no_ops<M: Mutator + ?Sized>(m: &mut M, s: &Arc<Stmt>) -> Arc<Stmt> {
    match s.kind() {
        StmtKind::LetStmt { name, value, body } => {
            let body = m.mutate_stmt(body);
            if body.is_no_op() { body } else { Stmt::let_stmt(name.clone(), value.clone(), body) }
        }
        StmtKind::For(f) => {
            let body = m.mutate_stmt(&f.body);
            if body.is_no_op() {
                body
            } else {
                Stmt::for_loop(f.name.clone(), f.min.clone(), f.extent.clone(), f.for_type, f.device_api, body)
            }
        }
        StmtKind::Block(a, b) | StmtKind::Fork(a, b) => {
            let (a, b) = (m.mutate_stmt(a), m.mutate_stmt(b));
            match (a.is_no_op(), b.is_no_op()) {
                (true, _) => b,
                (false, true) => a,
                _ if matches!(s.kind(), StmtKind::Fork(..)) => Stmt::fork(a, b),
                _ => Stmt::block(a, b),
            }
        }
        StmtKind::Realize(r) => {
            let body = m.mutate_stmt(&r.body);
            if body.is_no_op() { body } else { Stmt::new(StmtKind::Realize(Realize { body, ..r.clone() })) }
        }
        StmtKind::Allocate(a) => {
            let body = m.mutate_stmt(&a.body);
            if body.is_no_op() {
                body
            } else {
                Stmt::new(StmtKind::Allocate(Allocate { body, ..a.clone() }))
            }
        }
        StmtKind::IfThenElse { condition, then_case, else_case } => {
            let then_case = m.mutate_stmt(then_case);
            let else_case = else_case.as_ref().map(|e| m.mutate_stmt(e)).filter(|e| !e.is_no_op());
            if then_case.is_no_op() && else_case.is_none() {
                then_case
            } else {
                Stmt::if_then_else(condition.clone(), then_case, else_case)
            }
        }
        StmtKind::Atomic { producer_name, mutex_name, body } => {
            let body = m.mutate_stmt(body);
            if body.is_no_op() { body } else { Stmt::atomic(producer_name.clone(), mutex_name.clone(), body) }
        }
        _ => mutate_stmt_children(m, s),
    }
}

// ============================================================================
// Producer side
// ============================================================================

/// Keeps the `produce` work of one function and drops everything else.
///
/// Each remaining semaphore is released once at the end of the `produce`
/// node. Acquires the producer still sits inside are re-targeted to fresh
/// semaphores recorded in `cloned_acquires`, since the consumer copy keeps
/// the original acquire.
struct ProducerBody<'a> {
    func: &'a str,
    semaphores: Vec<Arc<Expr>>,
    cloned_acquires: &'a mut BTreeMap<String, Vec<String>>,
    names: &'a NameGen,
}

impl Mutator for ProducerBody<'_> {
    fn mutate_expr(&mut self, e: &Arc<Expr>) -> Arc<Expr> {
        e.clone()
    }

    fn mutate_stmt(&mut self, s: &Arc<Stmt>) -> Arc<Stmt> {
        match s.kind() {
            StmtKind::ProducerConsumer { name, is_producer: true, body } if name == self.func => {
                let mut body = body.clone();
                while let Some(semaphore) = self.semaphores.pop() {
                    body = Stmt::block(body, release(semaphore, 1));
                }
                Stmt::producer(name.clone(), body)
            }
            StmtKind::ProducerConsumer { name, is_producer, body } => {
                let body = self.mutate_stmt(body);
                if body.is_no_op() || *is_producer { body } else { Stmt::consumer(name.clone(), body) }
            }
            StmtKind::Store { name, .. } if is_folding_head(self.func, name) => s.clone(),
            StmtKind::Evaluate(_)
            | StmtKind::Provide { .. }
            | StmtKind::Store { .. }
            | StmtKind::Assert { .. }
            | StmtKind::Prefetch { .. }
            | StmtKind::Atomic { .. } => Stmt::no_op(),
            StmtKind::Acquire { semaphore, count, body } => {
                let body = self.mutate_stmt(body);
                if body.is_no_op() {
                    return body;
                }
                let Some(old) = semaphore.var_name() else {
                    return Stmt::acquire(semaphore.clone(), count.clone(), body);
                };
                if old.starts_with(&folding_semaphore_prefix(self.func)) {
                    return Stmt::acquire(semaphore.clone(), count.clone(), body);
                }
                let clone = self.names.unique(&format!("{old}.clone"));
                self.cloned_acquires.entry(old.to_string()).or_default().push(clone.clone());
                Stmt::acquire(semaphore_var(&clone), count.clone(), body)
            }
            _ => collapse_no_ops(self, s),
        }
    }
}

// ============================================================================
// Consumer side
// ============================================================================

/// Drops the `produce` work of one function and guards each of its `consume`
/// nodes with an acquire of its own semaphore.
struct ConsumerBody<'a> {
    func: &'a str,
    semaphores: Vec<Arc<Expr>>,
}

impl Mutator for ConsumerBody<'_> {
    fn mutate_expr(&mut self, e: &Arc<Expr>) -> Arc<Expr> {
        e.clone()
    }

    fn mutate_stmt(&mut self, s: &Arc<Stmt>) -> Arc<Stmt> {
        match s.kind() {
            StmtKind::ProducerConsumer { name, is_producer: true, .. } if name == self.func => Stmt::no_op(),
            StmtKind::ProducerConsumer { name, is_producer: false, body } if name == self.func => {
                let body = self.mutate_stmt(body);
                let consume = Stmt::consumer(name.clone(), body);
                match self.semaphores.pop() {
                    Some(semaphore) => Stmt::acquire(semaphore, Expr::int(1), consume),
                    None => consume,
                }
            }
            StmtKind::Allocate(a) if a.name.starts_with(&folding_semaphore_prefix(self.func)) => {
                self.mutate_stmt(&a.body)
            }
            StmtKind::Store { name, .. } if name.starts_with(&folding_semaphore_prefix(self.func)) => Stmt::no_op(),
            StmtKind::Acquire { semaphore, body, .. }
                if semaphore.var_name().is_some_and(|n| n.starts_with(&folding_semaphore_prefix(self.func))) =>
            {
                self.mutate_stmt(body)
            }
            _ => collapse_no_ops(self, s),
        }
    }
}

// ============================================================================
// Acquire cloning
// ============================================================================

/// Duplicates every `release`/`init` of semaphore `old` onto `new`, so a
/// cloned acquire is fed exactly like the original.
struct CloneAcquire<'a> {
    old: &'a str,
    new: Arc<Expr>,
}

impl Mutator for CloneAcquire<'_> {
    fn mutate_expr(&mut self, e: &Arc<Expr>) -> Arc<Expr> {
        e.clone()
    }

    fn mutate_stmt(&mut self, s: &Arc<Stmt>) -> Arc<Stmt> {
        match (s.kind(), semaphore_call(s)) {
            (StmtKind::Evaluate(e), Some(semaphore)) if semaphore == self.old => {
                let Some(call) = e.as_call() else {
                    return s.clone();
                };
                let mut args = call.args.clone();
                args[0] = self.new.clone();
                let cloned = Expr::call(e.ty(), call.name.clone(), args, call.call_type, call.value_index);
                Stmt::block(s.clone(), Stmt::evaluate(cloned))
            }
            _ => mutate_stmt_children(self, s),
        }
    }
}

// ============================================================================
// Forking
// ============================================================================

fn count_consume_nodes(s: &Arc<Stmt>, func: &str) -> usize {
    struct Count<'a> {
        func: &'a str,
        count: usize,
    }
    impl Visitor for Count<'_> {
        fn visit_expr(&mut self, _: &Arc<Expr>) {}

        fn visit_stmt(&mut self, s: &Arc<Stmt>) {
            if let StmtKind::ProducerConsumer { name, is_producer: false, .. } = s.kind()
                && name == self.func
            {
                self.count += 1;
            }
            walk_stmt(self, s);
        }
    }
    let mut v = Count { func, count: 0 };
    v.visit_stmt(s);
    v.count
}

/// Forks every realization of an async function, outermost first.
pub struct ForkAsyncProducers<'a> {
    env: &'a Env,
    names: NameGen,
    /// Clones of each semaphore created by inner forks, keyed by the
    /// semaphore they duplicate.
    cloned_acquires: BTreeMap<String, Vec<String>>,
}

impl<'a> ForkAsyncProducers<'a> {
    pub fn new(env: &'a Env) -> Self {
        Self { env, names: NameGen::new(), cloned_acquires: BTreeMap::new() }
    }

    fn is_async(&self, func: &str) -> bool {
        self.env.lookup(func).is_some_and(|f| f.schedule().is_async)
    }

    fn fork_realization(&mut self, r: &Realize) -> Arc<Stmt> {
        let count = count_consume_nodes(&r.body, &r.name);
        let sema_names: Vec<String> = (0..count).map(|i| format!("{}.semaphore_{i}", r.name)).collect();
        let semaphores: Vec<Arc<Expr>> = sema_names.iter().map(|n| semaphore_var(n)).collect();
        debug!(func = %r.name, semaphores = count, "forking async producer");

        let producer = ProducerBody {
            func: &r.name,
            semaphores: semaphores.clone(),
            cloned_acquires: &mut self.cloned_acquires,
            names: &self.names,
        }
        .mutate_stmt(&r.body);
        let consumer = ConsumerBody { func: &r.name, semaphores }.mutate_stmt(&r.body);

        let producer = self.mutate_stmt(&producer);
        let consumer = self.mutate_stmt(&consumer);

        let mut body = Stmt::fork(producer, consumer);
        for name in &sema_names {
            for clone in self.cloned_acquires.remove(name).unwrap_or_default() {
                body = CloneAcquire { old: name, new: semaphore_var(&clone) }.mutate_stmt(&body);
                body = Stmt::let_stmt(clone, make_semaphore(0), body);
            }
            body = Stmt::let_stmt(name.clone(), make_semaphore(0), body);
        }
        Stmt::new(StmtKind::Realize(Realize { body, ..r.clone() }))
    }
}

impl Mutator for ForkAsyncProducers<'_> {
    fn mutate_expr(&mut self, e: &Arc<Expr>) -> Arc<Expr> {
        e.clone()
    }

    fn mutate_stmt(&mut self, s: &Arc<Stmt>) -> Arc<Stmt> {
        match s.kind() {
            StmtKind::Realize(r) if self.is_async(&r.name) => self.fork_realization(r),
            _ => mutate_stmt_children(self, s),
        }
    }
}
