//! Free-variable queries, substitution and call discovery.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::equality::graph_equal;
use crate::expr::{Call, Expr, ExprKind};
use crate::stmt::{Stmt, StmtKind};
use crate::visit::{Mutator, Visitor, mutate_expr_children, mutate_stmt_children, walk_expr, walk_stmt};

// ============================================================================
// Variable usage
// ============================================================================

struct UsesVars<'a, F: Fn(&str) -> bool> {
    matches: &'a F,
    shadowed: Vec<String>,
    found: bool,
}

impl<F: Fn(&str) -> bool> UsesVars<'_, F> {
    fn is_live(&self, name: &str) -> bool {
        (self.matches)(name) && !self.shadowed.iter().any(|s| s == name)
    }
}

impl<F: Fn(&str) -> bool> Visitor for UsesVars<'_, F> {
    fn visit_expr(&mut self, e: &Arc<Expr>) {
        if self.found {
            return;
        }
        match e.kind() {
            ExprKind::Variable(v) => self.found |= self.is_live(&v.name),
            ExprKind::Let { name, value, body } => {
                self.visit_expr(value);
                self.shadowed.push(name.clone());
                self.visit_expr(body);
                self.shadowed.pop();
            }
            _ => walk_expr(self, e),
        }
    }

    fn visit_stmt(&mut self, s: &Arc<Stmt>) {
        if self.found {
            return;
        }
        match s.kind() {
            StmtKind::LetStmt { name, value, body } => {
                self.visit_expr(value);
                self.shadowed.push(name.clone());
                self.visit_stmt(body);
                self.shadowed.pop();
            }
            StmtKind::For(f) => {
                self.visit_expr(&f.min);
                self.visit_expr(&f.extent);
                self.shadowed.push(f.name.clone());
                self.visit_stmt(&f.body);
                self.shadowed.pop();
            }
            _ => walk_stmt(self, s),
        }
    }
}

/// `e` refers to a free variable named `name`.
pub fn expr_uses_var(e: &Arc<Expr>, name: &str) -> bool {
    let matches = |n: &str| n == name;
    let mut v = UsesVars { matches: &matches, shadowed: vec![], found: false };
    v.visit_expr(e);
    v.found
}

/// `e` refers to any free variable in `names`.
pub fn expr_uses_vars<S: AsRef<str> + Ord>(e: &Arc<Expr>, names: &BTreeSet<S>) -> bool {
    let matches = |n: &str| names.iter().any(|s| s.as_ref() == n);
    let mut v = UsesVars { matches: &matches, shadowed: vec![], found: false };
    v.visit_expr(e);
    v.found
}

/// `e` refers to a free variable accepted by `pred`.
pub fn expr_uses_var_matching(e: &Arc<Expr>, pred: impl Fn(&str) -> bool) -> bool {
    let mut v = UsesVars { matches: &pred, shadowed: vec![], found: false };
    v.visit_expr(e);
    v.found
}

/// `s` refers to a free variable named `name`.
pub fn stmt_uses_var(s: &Arc<Stmt>, name: &str) -> bool {
    let matches = |n: &str| n == name;
    let mut v = UsesVars { matches: &matches, shadowed: vec![], found: false };
    v.visit_stmt(s);
    v.found
}

/// `s` refers to a free variable accepted by `pred`.
pub fn stmt_uses_var_matching(s: &Arc<Stmt>, pred: impl Fn(&str) -> bool) -> bool {
    let mut v = UsesVars { matches: &pred, shadowed: vec![], found: false };
    v.visit_stmt(s);
    v.found
}

/// Names of all free variables of `e`, in sorted order.
pub fn free_variables(e: &Arc<Expr>) -> BTreeSet<String> {
    struct Gather {
        bound: Vec<String>,
        out: BTreeSet<String>,
    }
    impl Visitor for Gather {
        fn visit_expr(&mut self, e: &Arc<Expr>) {
            match e.kind() {
                ExprKind::Variable(v) if !self.bound.contains(&v.name) => {
                    self.out.insert(v.name.clone());
                }
                ExprKind::Let { name, value, body } => {
                    self.visit_expr(value);
                    self.bound.push(name.clone());
                    self.visit_expr(body);
                    self.bound.pop();
                }
                _ => walk_expr(self, e),
            }
        }
    }
    let mut g = Gather { bound: vec![], out: BTreeSet::new() };
    g.visit_expr(e);
    g.out
}

// ============================================================================
// Substitution
// ============================================================================

struct Substitute<'a> {
    replacements: &'a HashMap<String, Arc<Expr>>,
    shadowed: Vec<String>,
}

impl Substitute<'_> {
    fn find(&self, name: &str) -> Option<&Arc<Expr>> {
        if self.shadowed.iter().any(|s| s == name) { None } else { self.replacements.get(name) }
    }
}

impl Mutator for Substitute<'_> {
    fn mutate_expr(&mut self, e: &Arc<Expr>) -> Arc<Expr> {
        match e.kind() {
            ExprKind::Variable(v) => self.find(&v.name).cloned().unwrap_or_else(|| e.clone()),
            ExprKind::Let { name, value, body } => {
                let nv = self.mutate_expr(value);
                self.shadowed.push(name.clone());
                let nb = self.mutate_expr(body);
                self.shadowed.pop();
                if Arc::ptr_eq(&nv, value) && Arc::ptr_eq(&nb, body) {
                    e.clone()
                } else {
                    Expr::let_in(name.clone(), nv, nb)
                }
            }
            _ => mutate_expr_children(self, e),
        }
    }

    fn mutate_stmt(&mut self, s: &Arc<Stmt>) -> Arc<Stmt> {
        match s.kind() {
            StmtKind::LetStmt { name, value, body } => {
                let nv = self.mutate_expr(value);
                self.shadowed.push(name.clone());
                let nb = self.mutate_stmt(body);
                self.shadowed.pop();
                if Arc::ptr_eq(&nv, value) && Arc::ptr_eq(&nb, body) {
                    s.clone()
                } else {
                    Stmt::let_stmt(name.clone(), nv, nb)
                }
            }
            StmtKind::For(f) => {
                self.shadowed.push(f.name.clone());
                let result = mutate_stmt_children(self, s);
                self.shadowed.pop();
                // Bounds are evaluated outside the loop's own scope.
                let (min, extent) = (self.mutate_expr(&f.min), self.mutate_expr(&f.extent));
                match result.kind() {
                    StmtKind::For(nf) if !Arc::ptr_eq(&min, &f.min) || !Arc::ptr_eq(&extent, &f.extent) => {
                        Stmt::for_loop(nf.name.clone(), min, extent, nf.for_type, nf.device_api, nf.body.clone())
                    }
                    _ => result,
                }
            }
            _ => mutate_stmt_children(self, s),
        }
    }
}

/// Replace free occurrences of variable `name` in `e` with `replacement`.
pub fn substitute(name: &str, replacement: &Arc<Expr>, e: &Arc<Expr>) -> Arc<Expr> {
    let map = HashMap::from([(name.to_string(), replacement.clone())]);
    substitute_map(&map, e)
}

/// Replace free occurrences of every variable in `map`.
pub fn substitute_map(map: &HashMap<String, Arc<Expr>>, e: &Arc<Expr>) -> Arc<Expr> {
    if map.is_empty() {
        return e.clone();
    }
    Substitute { replacements: map, shadowed: vec![] }.mutate_expr(e)
}

/// Replace free occurrences of variable `name` in `s`.
pub fn substitute_in_stmt(name: &str, replacement: &Arc<Expr>, s: &Arc<Stmt>) -> Arc<Stmt> {
    let map = HashMap::from([(name.to_string(), replacement.clone())]);
    substitute_map_in_stmt(&map, s)
}

pub fn substitute_map_in_stmt(map: &HashMap<String, Arc<Expr>>, s: &Arc<Stmt>) -> Arc<Stmt> {
    if map.is_empty() {
        return s.clone();
    }
    Substitute { replacements: map, shadowed: vec![] }.mutate_stmt(s)
}

/// Replace every subexpression structurally equal to `find` with `replacement`.
pub fn substitute_expr(find: &Arc<Expr>, replacement: &Arc<Expr>, e: &Arc<Expr>) -> Arc<Expr> {
    crate::visit::rewrite_expr(e, |node| graph_equal(node, find).then(|| replacement.clone()))
}

/// Replace every subexpression equal to a key of `map` (structural match).
pub fn substitute_exprs(map: &[(Arc<Expr>, Arc<Expr>)], e: &Arc<Expr>) -> Arc<Expr> {
    crate::visit::rewrite_expr(e, |node| map.iter().find(|(k, _)| graph_equal(node, k)).map(|(_, v)| v.clone()))
}

/// Wrap `e` in the given lets, innermost last.
pub fn wrap_lets(e: Arc<Expr>, lets: &[(String, Arc<Expr>)]) -> Arc<Expr> {
    lets.iter().rev().fold(e, |body, (name, value)| Expr::let_in(name.clone(), value.clone(), body))
}

// ============================================================================
// Calls
// ============================================================================

/// All `Call` nodes reachable from `e`, in pre-order.
pub fn find_calls(e: &Arc<Expr>) -> Vec<Call> {
    let mut out = Vec::new();
    crate::visit::for_each_expr(e, |node| {
        if let Some(c) = node.as_call() {
            out.push(c.clone());
        }
        true
    });
    out
}

/// Names of pipeline functions and buffers read by `e`, with the first call
/// found for each.
pub fn find_data_accesses(e: &Arc<Expr>) -> BTreeMap<String, Call> {
    let mut out = BTreeMap::new();
    for call in find_calls(e) {
        if call.is_data_access() {
            out.entry(call.name.clone()).or_insert(call);
        }
    }
    out
}

/// `e` calls the pipeline function (or buffer) `name`.
pub fn calls_function(e: &Arc<Expr>, name: &str) -> bool {
    let mut found = false;
    crate::visit::for_each_expr(e, |node| {
        if let Some(c) = node.as_call()
            && c.is_data_access()
            && c.name == name
        {
            found = true;
        }
        !found
    });
    found
}

/// `e` contains a load from buffer `name`.
pub fn loads_from_buffer(e: &Arc<Expr>, name: &str) -> bool {
    let mut found = false;
    crate::visit::for_each_expr(e, |node| {
        if let Some(l) = node.as_load()
            && l.name == name
        {
            found = true;
        }
        !found
    });
    found
}

/// Names of all buffers stored to within `s`.
pub fn stored_buffers(s: &Arc<Stmt>) -> BTreeSet<String> {
    struct Stores(BTreeSet<String>);
    impl Visitor for Stores {
        fn visit_stmt(&mut self, s: &Arc<Stmt>) {
            if let StmtKind::Store { name, .. } | StmtKind::Provide { name, .. } = s.kind() {
                self.0.insert(name.clone());
            }
            walk_stmt(self, s);
        }
    }
    let mut v = Stores(BTreeSet::new());
    v.visit_stmt(s);
    v.0
}

/// Names of all buffers loaded from within `s`.
pub fn loaded_buffers(s: &Arc<Stmt>) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    crate::visit::for_each_expr_in_stmt(s, |e| {
        if let Some(l) = e.as_load() {
            out.insert(l.name.clone());
        }
        true
    });
    out
}
