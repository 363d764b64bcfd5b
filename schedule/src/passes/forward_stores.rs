//! Store-to-load forwarding in straight-line code.
//!
//! A load of `buf[i]` that follows a store to `buf[i]` in the same block,
//! with no store to `buf` in between, reads the value just stored. The
//! stored value is bound to a let and the load replaced by it:
//!
//! ```text
//! a[0] = x * 2 + 1;              let a.forwarded$0 = x * 2 + 1
//! b[0] = a[0] + 1;       =>      a[0] = a.forwarded$0;
//!                                b[0] = a.forwarded$0 + 1;
//! ```
//!
//! Loops, branches and other compound statements end the straight line:
//! every buffer they store to is forgotten, and their bodies are forwarded
//! on their own.

use std::sync::Arc;

use kiln_ir::analysis::{loads_from_buffer, stored_buffers};
use kiln_ir::visit::{Mutator, for_each_expr, for_each_expr_in_stmt, mutate_stmt_children, rewrite_expr};
use kiln_ir::{Expr, ExprKind, NameGen, Stmt, StmtKind, Type, equal, expr_uses_var};
use tracing::trace;

/// A store whose value later loads may reuse.
#[derive(Clone)]
struct Forwarded {
    buffer: String,
    index: Arc<Expr>,
    ty: Type,
    /// What a matching load becomes: the stored value itself when it is
    /// trivial, otherwise a variable bound by `binding`.
    value: Arc<Expr>,
    binding: Option<usize>,
}

/// A let introduced for a stored value, emitted only if some load used it.
struct Binding {
    name: String,
    value: Arc<Expr>,
    used: bool,
}

/// One element of a rewritten block.
enum Piece {
    Stmt(Arc<Stmt>),
    Store { name: String, value: Arc<Expr>, index: Arc<Expr>, predicate: Arc<Expr>, binding: Option<usize> },
}

fn has_impure_call(e: &Arc<Expr>) -> bool {
    let mut found = false;
    for_each_expr(e, |node| {
        found |= node.as_call().is_some_and(|c| !c.call_type.is_pure());
        !found
    });
    found
}

fn stmt_has_impure_call(s: &Arc<Stmt>) -> bool {
    let mut found = false;
    for_each_expr_in_stmt(s, |node| {
        found |= node.as_call().is_some_and(|c| !c.call_type.is_pure());
        !found
    });
    found
}

struct ForwardStores {
    names: NameGen,
    bindings: Vec<Binding>,
}

impl ForwardStores {
    fn replace_loads(&mut self, e: &Arc<Expr>, known: &[Forwarded]) -> Arc<Expr> {
        if known.is_empty() {
            return e.clone();
        }
        let mut used = Vec::new();
        let result = rewrite_expr(e, |node| {
            let load = node.as_load()?;
            if !load.predicate.is_true() {
                return None;
            }
            let hit = known
                .iter()
                .rev()
                .find(|k| k.buffer == load.name && k.ty == node.ty() && equal(&k.index, &load.index))?;
            trace!(buffer = %load.name, index = %load.index, "forwarded store to load");
            used.extend(hit.binding);
            Some(hit.value.clone())
        });
        for i in used {
            self.bindings[i].used = true;
        }
        result
    }

    /// Forget everything a store to `buffer` invalidates.
    fn kill(known: &mut Vec<Forwarded>, buffer: &str) {
        known.retain(|k| k.buffer != buffer && !loads_from_buffer(&k.index, buffer));
    }

    /// Forget everything `s` may have overwritten.
    fn kill_stored(known: &mut Vec<Forwarded>, s: &Arc<Stmt>) {
        if stmt_has_impure_call(s) {
            known.clear();
        }
        for buffer in stored_buffers(s) {
            Self::kill(known, &buffer);
        }
    }

    fn forward_store(&mut self, s: &Arc<Stmt>, known: &mut Vec<Forwarded>) -> Option<Piece> {
        let StmtKind::Store { name, value, index, predicate } = s.kind() else {
            return None;
        };
        let value = self.replace_loads(value, known);
        let index = self.replace_loads(index, known);
        let predicate = self.replace_loads(predicate, known);
        let impure = has_impure_call(&value) || has_impure_call(&index);
        if impure {
            known.clear();
        } else {
            Self::kill(known, name);
        }
        if impure || !predicate.is_true() {
            return Some(Piece::Store { name: name.clone(), value, index, predicate, binding: None });
        }

        let trivial = matches!(value.kind(), ExprKind::Const(_) | ExprKind::Variable(_));
        let (forwarded, binding) = if trivial {
            (value.clone(), None)
        } else {
            let var = self.names.unique(&format!("{name}.forwarded"));
            self.bindings.push(Binding { name: var.clone(), value: value.clone(), used: false });
            (Expr::typed_var(value.ty(), var), Some(self.bindings.len() - 1))
        };
        known.push(Forwarded { buffer: name.clone(), index: index.clone(), ty: value.ty(), value: forwarded, binding });
        Some(Piece::Store { name: name.clone(), value, index, predicate, binding })
    }

    fn forward(&mut self, s: &Arc<Stmt>, known: &mut Vec<Forwarded>) -> Arc<Stmt> {
        match s.kind() {
            StmtKind::Block(..) => {
                let mut pieces = Vec::new();
                for stmt in s.block_to_vec() {
                    let piece = match self.forward_store(&stmt, known) {
                        Some(piece) => piece,
                        None => Piece::Stmt(self.forward(&stmt, known)),
                    };
                    pieces.push(piece);
                }
                self.assemble(pieces)
            }
            StmtKind::Store { .. } => {
                let piece = self.forward_store(s, known);
                self.assemble(piece.into_iter().collect())
            }
            StmtKind::LetStmt { name, value, body } => {
                let value = self.replace_loads(value, known);
                // Forwarded values bound inside the body go out of scope with it.
                let mut inner: Vec<Forwarded> = known
                    .iter()
                    .filter(|k| !expr_uses_var(&k.index, name) && !expr_uses_var(&k.value, name))
                    .cloned()
                    .collect();
                let body = self.forward(body, &mut inner);
                Self::kill_stored(known, &body);
                Stmt::let_stmt(name.clone(), value, body)
            }
            StmtKind::Evaluate(e) => {
                let e = self.replace_loads(e, known);
                if has_impure_call(&e) {
                    known.clear();
                }
                Stmt::evaluate(e)
            }
            StmtKind::Free { name } => {
                Self::kill(known, name);
                s.clone()
            }
            _ => {
                let result = mutate_stmt_children(self, s);
                Self::kill_stored(known, s);
                if let StmtKind::Allocate(a) = s.kind() {
                    Self::kill(known, &a.name);
                }
                result
            }
        }
    }

    /// Rebuild a block, wrapping everything after a store whose forwarded
    /// value was used in the let that binds it.
    fn assemble(&self, pieces: Vec<Piece>) -> Arc<Stmt> {
        let mut tail: Vec<Arc<Stmt>> = Vec::new();
        for piece in pieces.into_iter().rev() {
            match piece {
                Piece::Stmt(s) => tail.push(s),
                Piece::Store { name, value, index, predicate, binding } => {
                    match binding.map(|i| &self.bindings[i]).filter(|b| b.used) {
                        Some(b) => {
                            let var = Expr::typed_var(value.ty(), b.name.clone());
                            tail.push(Stmt::store_predicated(name, var, index, predicate));
                            let rest = Stmt::block_of(tail.drain(..).rev());
                            tail.push(Stmt::let_stmt(b.name.clone(), b.value.clone(), rest));
                        }
                        None => tail.push(Stmt::store_predicated(name, value, index, predicate)),
                    }
                }
            }
        }
        Stmt::block_of(tail.into_iter().rev())
    }
}

impl Mutator for ForwardStores {
    fn mutate_stmt(&mut self, s: &Arc<Stmt>) -> Arc<Stmt> {
        self.forward(s, &mut Vec::new())
    }
}

/// Replace loads that read back a value stored earlier in the same block
/// with that value.
#[tracing::instrument(skip_all)]
pub fn forward_stores(s: &Arc<Stmt>) -> Arc<Stmt> {
    ForwardStores { names: NameGen::new(), bindings: Vec::new() }.mutate_stmt(s)
}
