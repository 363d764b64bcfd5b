//! Reduction domains.
//!
//! A reduction domain is an ordered list of reduction variables (each with a
//! min and extent) plus a predicate restricting the iteration space. Reduction
//! variables refer back to their domain; domains compare by identity.

use std::sync::Arc;

use kiln_dtype::Type;

use super::core::{Expr, ExprKind, VarKind, Variable, next_node_id};

#[derive(Debug, Clone)]
pub struct ReductionVariable {
    pub var: String,
    pub min: Arc<Expr>,
    pub extent: Arc<Expr>,
}

struct Contents {
    id: u64,
    vars: Vec<ReductionVariable>,
    predicate: Arc<Expr>,
}

/// Shared handle to a reduction domain.
#[derive(Clone)]
pub struct ReductionDomain(Arc<Contents>);

impl std::fmt::Debug for ReductionDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.0.vars.iter().map(|v| v.var.as_str()).collect();
        write!(f, "ReductionDomain(id={}, vars={names:?})", self.0.id)
    }
}

impl PartialEq for ReductionDomain {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for ReductionDomain {}

impl ReductionDomain {
    pub fn new(vars: Vec<ReductionVariable>) -> Self {
        Self(Arc::new(Contents { id: next_node_id(), vars, predicate: Expr::bool_(true, 1) }))
    }

    /// Same domain restricted by `predicate`. The identity is kept so that
    /// existing reduction variables still refer to it.
    pub fn with_predicate(&self, predicate: Arc<Expr>) -> Self {
        Self(Arc::new(Contents { id: self.0.id, vars: self.0.vars.clone(), predicate }))
    }

    /// Conjunction of the current predicate and `predicate`.
    pub fn and_predicate(&self, predicate: Arc<Expr>) -> Self {
        let combined = if self.0.predicate.is_true() { predicate } else { self.0.predicate.and(predicate) };
        self.with_predicate(combined)
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn vars(&self) -> &[ReductionVariable] {
        &self.0.vars
    }

    pub fn predicate(&self) -> &Arc<Expr> {
        &self.0.predicate
    }

    pub fn dimensions(&self) -> usize {
        self.0.vars.len()
    }

    /// Variable expression for dimension `i`.
    pub fn var(&self, i: usize) -> Arc<Expr> {
        let name = self.0.vars[i].var.clone();
        Expr::new(ExprKind::Variable(Variable { name, kind: VarKind::Reduction(self.clone()) }), Type::I32)
    }

    /// Variable expressions of all dimensions.
    pub fn var_exprs(&self) -> Vec<Arc<Expr>> {
        (0..self.dimensions()).map(|i| self.var(i)).collect()
    }
}
