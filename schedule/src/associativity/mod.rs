//! Proving that an update definition is an associative reduction.
//!
//! An update `f(args) = e` is associative when `e` can be written as
//! `op(f(args), y)` for an associative binary `op` with an identity, where
//! `y` does not read `f`. Such updates may be evaluated in any grouping over
//! their reduction domain, which is what factoring a reduction relies on.
//!
//! Each tuple element is proven on its own. Elements that read another
//! element of the same tuple are rejected.
//!
//! # Module Organization
//!
//! - [`table`] - Recognised operators and their identities

use std::sync::Arc;

use kiln_ir::visit::{Mutator, mutate_expr_children};
use kiln_ir::{
    Expr, ExprKind, Scope, common_subexpression_elimination, expr_uses_var, graph_equal, simplify,
    substitute_in_all_lets,
};
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::solve::solve_expression;

pub mod table;

pub use table::{AssociativePattern, lookup};

/// A fresh variable standing for a sub-expression of the update.
#[derive(Debug, Clone)]
pub struct Replacement {
    pub var: String,
    pub expr: Arc<Expr>,
}

/// Result of [`prove_associativity`].
///
/// When `associative` is set, tuple element `i` of the update equals
/// `ops[i]` with `xs[i].var` bound to the self-reference and `ys[i].var`
/// bound to the rest of the update.
#[derive(Debug, Clone, Default)]
pub struct AssociativeOp {
    pub associative: bool,
    pub is_commutative: bool,
    pub ops: SmallVec<[Arc<Expr>; 2]>,
    pub identities: SmallVec<[Arc<Expr>; 2]>,
    pub xs: SmallVec<[Replacement; 2]>,
    pub ys: SmallVec<[Replacement; 2]>,
}

impl AssociativeOp {
    pub fn size(&self) -> usize {
        self.ops.len()
    }
}

/// Replaces calls to `func` at `args` with a variable, giving up on calls the
/// operator cannot be extracted around.
struct ConvertSelfRef<'a> {
    func: &'a str,
    args: &'a [Arc<Expr>],
    value_index: usize,
    x_name: &'a str,
    in_condition: bool,
    solvable: bool,
    x_part: Option<Arc<Expr>>,
}

impl Mutator for ConvertSelfRef<'_> {
    fn mutate_expr(&mut self, e: &Arc<Expr>) -> Arc<Expr> {
        if !self.solvable {
            return e.clone();
        }
        match e.kind() {
            ExprKind::Select(c, t, f) => {
                let saved = std::mem::replace(&mut self.in_condition, true);
                let c = self.mutate_expr(c);
                self.in_condition = saved;
                let (t, f) = (self.mutate_expr(t), self.mutate_expr(f));
                Expr::select(c, t, f)
            }
            ExprKind::Call(c) if c.is_data_access() && c.name == self.func => {
                assert_eq!(
                    c.args.len(),
                    self.args.len(),
                    "self-reference to {} should have as many arguments as the left-hand side",
                    self.func
                );
                if self.in_condition {
                    trace!(func = self.func, "self-reference inside a select condition");
                    self.solvable = false;
                } else if c.value_index != self.value_index {
                    trace!(func = self.func, value_index = c.value_index, "reads another tuple element");
                    self.solvable = false;
                } else if !c.args.iter().zip(self.args).all(|(a, b)| graph_equal(a, b)) {
                    trace!(func = self.func, "self-reference at different coordinates than the left-hand side");
                    self.solvable = false;
                } else {
                    self.x_part = Some(e.clone());
                    return Expr::typed_var(e.ty(), self.x_name);
                }
                e.clone()
            }
            _ => mutate_expr_children(self, e),
        }
    }
}

/// Match a solved update element against the operator table.
fn extract_op(e: &Arc<Expr>, x_name: &str) -> Option<(AssociativePattern, Arc<Expr>)> {
    let (op, a, b) = e.as_binary()?;
    let is_x = |v: &Arc<Expr>| v.var_name() == Some(x_name);
    let pattern = lookup(op, a.ty())?;
    let y_part = if is_x(a) {
        b
    } else if is_x(b) && op.is_commutative() {
        a
    } else {
        return None;
    };
    if expr_uses_var(y_part, x_name) {
        return None;
    }
    let y_part = if pattern.negate_operand { simplify(&y_part.neg()) } else { y_part.clone() };
    trace!(%op, y = %y_part, "operator matched");
    Some((pattern, y_part))
}

/// Prove that the update `func(args) = exprs` is associative.
///
/// Gives up (returning a non-associative result) when a self-reference sits
/// in a select condition, reads a different tuple element, or uses
/// coordinates other than `args`. An update without any self-reference, or
/// one that only copies the old value (`f(x) = f(x)`), is not associative
/// either: it has no meaningful identity.
#[tracing::instrument(skip_all, fields(func = func))]
pub fn prove_associativity(func: &str, args: &[Arc<Expr>], exprs: &[Arc<Expr>]) -> AssociativeOp {
    let args: Vec<Arc<Expr>> = args.iter().map(substitute_in_all_lets).collect();
    let mut result = AssociativeOp { associative: true, is_commutative: true, ..AssociativeOp::default() };

    for (idx, value) in exprs.iter().enumerate() {
        let x_name = format!("{func}$x{idx}");
        let y_name = format!("{func}$y{idx}");
        let mut convert = ConvertSelfRef {
            func,
            args: &args,
            value_index: idx,
            x_name: &x_name,
            in_condition: false,
            solvable: true,
            x_part: None,
        };
        let converted = convert.mutate_expr(&substitute_in_all_lets(value));
        if !convert.solvable {
            debug!(idx, "not associative: unsupported self-reference");
            return AssociativeOp::default();
        }
        let Some(x_part) = convert.x_part else {
            debug!(idx, "not associative: no self-reference");
            return AssociativeOp::default();
        };

        let simplified = simplify(&common_subexpression_elimination(&converted));
        let solved = substitute_in_all_lets(&solve_expression(&simplified, &x_name, &Scope::new()).result);
        if solved.var_name() == Some(x_name.as_str()) {
            debug!(idx, "not associative: update copies the old value");
            return AssociativeOp::default();
        }
        let Some((pattern, y_part)) = extract_op(&solved, &x_name) else {
            debug!(idx, solved = %solved, "not associative: no matching operator");
            return AssociativeOp::default();
        };

        let ty = value.ty();
        let x = Expr::typed_var(ty, x_name.as_str());
        let y = Expr::typed_var(ty, y_name.as_str());
        result.ops.push(Expr::binary(pattern.op, x, y));
        result.identities.push(pattern.identity);
        result.is_commutative &= pattern.is_commutative;
        result.xs.push(Replacement { var: x_name, expr: x_part });
        result.ys.push(Replacement { var: y_name, expr: y_part });
    }

    debug!(elements = exprs.len(), commutative = result.is_commutative, "associative");
    result
}
