//! A single stage of a function: left-hand side, values and loop nest.

use std::sync::Arc;

use super::schedule::StageSchedule;
use crate::expr::{Expr, ReductionDomain};

#[derive(Debug, Clone)]
pub struct Definition {
    /// Coordinates written; plain variables for the pure definition.
    pub args: Vec<Arc<Expr>>,
    /// One value per tuple element.
    pub values: Vec<Arc<Expr>>,
    pub rdom: Option<ReductionDomain>,
    pub schedule: StageSchedule,
    pub is_init: bool,
}

impl Definition {
    /// Iteration predicate, `true` without a reduction domain.
    pub fn predicate(&self) -> Arc<Expr> {
        self.rdom.as_ref().map_or_else(Expr::const_true, |r| r.predicate().clone())
    }

    pub fn is_update(&self) -> bool {
        !self.is_init
    }

    /// Every expression of the stage: arguments first, then values.
    pub fn exprs(&self) -> impl Iterator<Item = &Arc<Expr>> {
        self.args.iter().chain(self.values.iter())
    }

    /// Apply `f` to every argument and value.
    pub fn mutate(&mut self, mut f: impl FnMut(&Arc<Expr>) -> Arc<Expr>) {
        for a in &mut self.args {
            *a = f(a);
        }
        for v in &mut self.values {
            *v = f(v);
        }
    }
}
