//! Common subexpression elimination.
//!
//! Passes that substitute lets (the solver, the differentiator) produce
//! DAGs where one subexpression is shared by many parents. Printing or
//! simplifying such a tree as a tree is exponential, so the sharing is made
//! explicit again by lifting every repeated non-trivial subexpression into a
//! `Let`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::analysis::{free_variables, wrap_lets};
use crate::equality::ExprKey;
use crate::expr::{Expr, ExprKind};
use crate::visit::{Mutator, mutate_expr_children};

// ============================================================================
// Let expansion
// ============================================================================

/// Substitutes every `Let` into its body, keeping sharing intact.
struct ExpandLets {
    bindings: HashMap<String, Arc<Expr>>,
    memo: HashMap<*const Expr, Arc<Expr>>,
}

impl Mutator for ExpandLets {
    fn mutate_expr(&mut self, e: &Arc<Expr>) -> Arc<Expr> {
        if let Some(done) = self.memo.get(&Arc::as_ptr(e)) {
            return done.clone();
        }
        let result = match e.kind() {
            ExprKind::Variable(v) => self.bindings.get(&v.name).cloned().unwrap_or_else(|| e.clone()),
            ExprKind::Let { name, value, body } => {
                let value = self.mutate_expr(value);
                let shadowed = self.bindings.insert(name.clone(), value);
                // Bodies see a different binding set, so results cached
                // outside them do not apply inside.
                let outer_memo = std::mem::take(&mut self.memo);
                let body = self.mutate_expr(body);
                self.memo = outer_memo;
                match shadowed {
                    Some(prev) => self.bindings.insert(name.clone(), prev),
                    None => self.bindings.remove(name),
                };
                body
            }
            _ => mutate_expr_children(self, e),
        };
        self.memo.insert(Arc::as_ptr(e), result.clone());
        result
    }
}

// ============================================================================
// Value numbering
// ============================================================================

struct Node {
    expr: Arc<Expr>,
    children: Vec<usize>,
}

#[derive(Default)]
struct Numbering {
    by_ptr: HashMap<*const Expr, usize>,
    by_key: BTreeMap<ExprKey, usize>,
    nodes: Vec<Node>,
}

impl Numbering {
    /// Number `e` and its children; children always get smaller numbers.
    fn number(&mut self, e: &Arc<Expr>) -> usize {
        if let Some(&id) = self.by_ptr.get(&Arc::as_ptr(e)) {
            return id;
        }
        let children: Vec<usize> = e.children().into_iter().map(|c| self.number(c)).collect();
        let id = match self.by_key.get(&ExprKey(e.clone())) {
            Some(&id) => id,
            None => {
                let id = self.nodes.len();
                self.nodes.push(Node { expr: e.clone(), children });
                self.by_key.insert(ExprKey(e.clone()), id);
                id
            }
        };
        self.by_ptr.insert(Arc::as_ptr(e), id);
        id
    }
}

fn should_lift(e: &Arc<Expr>) -> bool {
    match e.kind() {
        ExprKind::Const(_) | ExprKind::StringImm(_) | ExprKind::Variable(_) => false,
        ExprKind::Broadcast { value, .. } => should_lift(value),
        ExprKind::Call(c) => c.call_type.is_pure(),
        _ => true,
    }
}

/// Replaces the direct children of a node by their already-rebuilt forms.
struct ReplaceChildren<'a> {
    numbering: &'a Numbering,
    replacement: &'a [Option<Arc<Expr>>],
}

impl Mutator for ReplaceChildren<'_> {
    fn mutate_expr(&mut self, e: &Arc<Expr>) -> Arc<Expr> {
        self.numbering
            .by_ptr
            .get(&Arc::as_ptr(e))
            .and_then(|&id| self.replacement[id].clone())
            .unwrap_or_else(|| panic!("child {e} was not numbered before its parent"))
    }
}

/// Substitute every `Let` into its body.
///
/// Shared subtrees stay shared, so the result is a DAG no larger than `e`.
pub fn substitute_in_all_lets(e: &Arc<Expr>) -> Arc<Expr> {
    ExpandLets { bindings: HashMap::new(), memo: HashMap::new() }.mutate_expr(e)
}

/// Lift every non-trivial subexpression used more than once into a `Let`.
///
/// Existing lets are substituted first, so the result only contains the
/// lets introduced here, outermost first in dependency order.
pub fn common_subexpression_elimination(e: &Arc<Expr>) -> Arc<Expr> {
    let expanded = substitute_in_all_lets(e);

    let mut numbering = Numbering::default();
    let root = numbering.number(&expanded);

    let mut uses = vec![0usize; numbering.nodes.len()];
    uses[root] += 1;
    for node in &numbering.nodes {
        for &c in &node.children {
            uses[c] += 1;
        }
    }

    let taken: BTreeSet<String> = free_variables(&expanded);
    let mut next_name = 0usize;
    let mut fresh = || loop {
        let name = format!("t{next_name}");
        next_name += 1;
        if !taken.contains(&name) {
            return name;
        }
    };

    let mut replacement: Vec<Option<Arc<Expr>>> = vec![None; numbering.nodes.len()];
    let mut lets: Vec<(String, Arc<Expr>)> = Vec::new();
    for id in 0..numbering.nodes.len() {
        let original = numbering.nodes[id].expr.clone();
        let mut children = ReplaceChildren { numbering: &numbering, replacement: &replacement };
        let rebuilt = mutate_expr_children(&mut children, &original);
        if id != root && uses[id] > 1 && should_lift(&rebuilt) {
            let name = fresh();
            replacement[id] = Some(Expr::typed_var(rebuilt.ty(), name.as_str()));
            lets.push((name, rebuilt));
        } else {
            replacement[id] = Some(rebuilt);
        }
    }

    let body = replacement[root].clone().unwrap_or(expanded);
    tracing::trace!(lifted = lets.len(), "common subexpression elimination");
    wrap_lets(body, &lets)
}
