//! Moving `consume` markers, acquires and fork-local bindings to where they
//! constrain the least.

use std::sync::Arc;

use kiln_ir::stmt::Realize;
use kiln_ir::visit::{Mutator, mutate_stmt_children};
use kiln_ir::{Expr, Stmt, StmtKind, equal, expr_uses_var, graph_equal, stmt_uses_var};

use super::{expr_uses_func, stmt_uses_func};

fn with_body(r: &Realize, body: Arc<Stmt>) -> Arc<Stmt> {
    Stmt::new(StmtKind::Realize(Realize { body, ..r.clone() }))
}

fn marker(name: &str, is_producer: bool, body: Arc<Stmt>) -> Arc<Stmt> {
    Stmt::new(StmtKind::ProducerConsumer { name: name.to_string(), is_producer, body })
}

// ============================================================================
// Producer/consumer tightening
// ============================================================================

/// Push the `produce`/`consume` marker of `func` down through lets that do
/// not read it and, for consumers, into just the block parts that do.
fn tighten_marker(func: &str, is_producer: bool, s: &Arc<Stmt>) -> Arc<Stmt> {
    match s.kind() {
        StmtKind::LetStmt { .. } => {
            let mut lets = Vec::new();
            let mut inner = s.clone();
            loop {
                let next = match inner.kind() {
                    StmtKind::LetStmt { name, value, body } if !expr_uses_func(value, func) => {
                        lets.push((name.clone(), value.clone()));
                        body.clone()
                    }
                    _ => break,
                };
                inner = next;
            }
            let mut result = if matches!(inner.kind(), StmtKind::LetStmt { .. }) {
                marker(func, is_producer, inner)
            } else {
                tighten_marker(func, is_producer, &inner)
            };
            for (name, value) in lets.into_iter().rev() {
                result = Stmt::let_stmt(name, value, result);
            }
            result
        }
        StmtKind::Block(..) if !is_producer => Stmt::block_of(s.block_to_vec().into_iter().map(|part| {
            if stmt_uses_func(&part, func) { tighten_marker(func, is_producer, &part) } else { part }
        })),
        StmtKind::ProducerConsumer { name, is_producer: inner_is_producer, body } => {
            marker(name, *inner_is_producer, tighten_marker(func, is_producer, body))
        }
        StmtKind::Realize(r) => with_body(r, tighten_marker(func, is_producer, &r.body)),
        _ => marker(func, is_producer, s.clone()),
    }
}

struct TightenMarkers;

impl Mutator for TightenMarkers {
    fn mutate_expr(&mut self, e: &Arc<Expr>) -> Arc<Expr> {
        e.clone()
    }

    fn mutate_stmt(&mut self, s: &Arc<Stmt>) -> Arc<Stmt> {
        match s.kind() {
            StmtKind::ProducerConsumer { name, is_producer, body } => {
                let body = self.mutate_stmt(body);
                tighten_marker(name, *is_producer, &body)
            }
            _ => mutate_stmt_children(self, s),
        }
    }
}

/// Shrink every `produce`/`consume` region to the statements that touch its
/// function. A consume region split across a block becomes several consume
/// nodes, each of which later waits on its own semaphore.
pub fn tighten_producer_consumer_nodes(s: &Arc<Stmt>) -> Arc<Stmt> {
    TightenMarkers.mutate_stmt(s)
}

// ============================================================================
// Acquire expansion
// ============================================================================

/// Split a chain of directly nested acquires off `s`.
fn peel_acquires(s: &Arc<Stmt>) -> (Vec<(Arc<Expr>, Arc<Expr>)>, Arc<Stmt>) {
    let mut acquires = Vec::new();
    let mut inner = s.clone();
    loop {
        let next = match inner.kind() {
            StmtKind::Acquire { semaphore, count, body } => {
                acquires.push((semaphore.clone(), count.clone()));
                body.clone()
            }
            _ => break,
        };
        inner = next;
    }
    (acquires, inner)
}

fn wrap_acquires(acquires: &[(Arc<Expr>, Arc<Expr>)], body: Arc<Stmt>) -> Arc<Stmt> {
    acquires.iter().rev().fold(body, |body, (semaphore, count)| Stmt::acquire(semaphore.clone(), count.clone(), body))
}

struct ExpandAcquires;

impl Mutator for ExpandAcquires {
    fn mutate_expr(&mut self, e: &Arc<Expr>) -> Arc<Expr> {
        e.clone()
    }

    fn mutate_stmt(&mut self, s: &Arc<Stmt>) -> Arc<Stmt> {
        match s.kind() {
            // Work after an acquire in the same sequence can also wait.
            StmtKind::Block(..) => {
                let mut result: Option<Arc<Stmt>> = None;
                for part in s.block_to_vec().iter().rev() {
                    let part = self.mutate_stmt(part);
                    result = Some(match result {
                        None => part,
                        Some(rest) => {
                            let (acquires, inner) = peel_acquires(&part);
                            wrap_acquires(&acquires, Stmt::block(inner, rest))
                        }
                    });
                }
                result.unwrap_or_else(Stmt::no_op)
            }
            StmtKind::Realize(r) => {
                let body = self.mutate_stmt(&r.body);
                match body.kind() {
                    StmtKind::Acquire { semaphore, count, body } => {
                        Stmt::acquire(semaphore.clone(), count.clone(), self.mutate_stmt(&with_body(r, body.clone())))
                    }
                    _ => with_body(r, body),
                }
            }
            StmtKind::ProducerConsumer { name, is_producer, body } => {
                let body = self.mutate_stmt(body);
                match body.kind() {
                    StmtKind::Acquire { semaphore, count, body } => {
                        let inner = marker(name, *is_producer, body.clone());
                        Stmt::acquire(semaphore.clone(), count.clone(), self.mutate_stmt(&inner))
                    }
                    _ => marker(name, *is_producer, body),
                }
            }
            StmtKind::LetStmt { .. } => {
                let mut frames = Vec::new();
                let mut inner = s.clone();
                loop {
                    let next = match inner.kind() {
                        StmtKind::LetStmt { name, value, body } => {
                            frames.push((name.clone(), value.clone()));
                            body.clone()
                        }
                        _ => break,
                    };
                    inner = next;
                }
                let (acquires, mut result) = peel_acquires(&self.mutate_stmt(&inner));
                let mut lifting = !acquires.is_empty();
                for (name, value) in frames.into_iter().rev() {
                    let pinned =
                        acquires.iter().any(|(sem, count)| expr_uses_var(sem, &name) || expr_uses_var(count, &name));
                    if lifting && pinned {
                        result = wrap_acquires(&acquires, result);
                        lifting = false;
                    }
                    result = Stmt::let_stmt(name, value, result);
                }
                if lifting { wrap_acquires(&acquires, result) } else { result }
            }
            _ => mutate_stmt_children(self, s),
        }
    }
}

/// Widen acquires over the statements that follow them and lift them out of
/// realizations, markers and lets their semaphore does not depend on.
pub fn expand_acquire_nodes(s: &Arc<Stmt>) -> Arc<Stmt> {
    ExpandAcquires.mutate_stmt(s)
}

// ============================================================================
// Fork tightening
// ============================================================================

fn same_realization(a: &Realize, b: &Realize) -> bool {
    a.name == b.name
        && a.bounds.len() == b.bounds.len()
        && a.bounds.iter().zip(&b.bounds).all(|(x, y)| graph_equal(&x.min, &y.min) && graph_equal(&x.extent, &y.extent))
        && graph_equal(&a.condition, &b.condition)
}

/// `fork(first, rest)` with bindings needed by only one side, or identical
/// on both, hoisted above the fork.
fn make_fork(first: &Arc<Stmt>, rest: &Arc<Stmt>) -> Arc<Stmt> {
    match (first.kind(), rest.kind()) {
        (
            StmtKind::LetStmt { name, value, body: first_body },
            StmtKind::LetStmt { name: rest_name, value: rest_value, body: rest_body },
        ) if name == rest_name && equal(value, rest_value) => {
            Stmt::let_stmt(name.clone(), value.clone(), make_fork(first_body, rest_body))
        }
        (StmtKind::LetStmt { name, value, body }, _) if !stmt_uses_var(rest, name) => {
            Stmt::let_stmt(name.clone(), value.clone(), make_fork(body, rest))
        }
        (_, StmtKind::LetStmt { name, value, body }) if !stmt_uses_var(first, name) => {
            Stmt::let_stmt(name.clone(), value.clone(), make_fork(first, body))
        }
        (StmtKind::Realize(a), StmtKind::Realize(b)) if same_realization(a, b) => {
            with_body(a, make_fork(&a.body, &b.body))
        }
        (StmtKind::Realize(r), _) if !stmt_uses_func(rest, &r.name) => with_body(r, make_fork(&r.body, rest)),
        (_, StmtKind::Realize(r)) if !stmt_uses_func(first, &r.name) => with_body(r, make_fork(first, &r.body)),
        _ => Stmt::fork(first.clone(), rest.clone()),
    }
}

#[derive(Default)]
struct TightenForks {
    in_fork: bool,
}

impl Mutator for TightenForks {
    fn mutate_expr(&mut self, e: &Arc<Expr>) -> Arc<Expr> {
        e.clone()
    }

    fn mutate_stmt(&mut self, s: &Arc<Stmt>) -> Arc<Stmt> {
        match s.kind() {
            StmtKind::Fork(first, rest) => {
                let outer = std::mem::replace(&mut self.in_fork, true);
                let first = self.mutate_stmt(first);
                let rest = self.mutate_stmt(rest);
                self.in_fork = outer;
                match (first.is_no_op(), rest.is_no_op()) {
                    (true, _) => rest,
                    (false, true) => first,
                    _ => make_fork(&first, &rest),
                }
            }
            StmtKind::Realize(r) if self.in_fork && !stmt_uses_func(&r.body, &r.name) => self.mutate_stmt(&r.body),
            StmtKind::LetStmt { name, body, .. } if self.in_fork && !stmt_uses_var(body, name) => {
                self.mutate_stmt(body)
            }
            _ => mutate_stmt_children(self, s),
        }
    }
}

/// Hoist lets and realizations out of forks and drop the ones a branch no
/// longer uses.
pub fn tighten_fork_nodes(s: &Arc<Stmt>) -> Arc<Stmt> {
    TightenForks::default().mutate_stmt(s)
}
