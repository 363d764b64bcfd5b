//! Shrinking loops to the iterations that do something.
//!
//! For every loop a sufficient condition for one iteration of its body to
//! be a no-op is built: stores that write back the value already in memory,
//! branches not taken, inner loops whose whole domain is a no-op. Solving
//! the negation for the loop variable gives the range of iterations that
//! may have an effect, and the loop is clamped to it:
//!
//! ```text
//! for x in [0, 100) {                let x.old_max = 100
//!   if x < 10 { out[x] = 1 }   =>    let x.new_min = 0
//! }                                  let x.new_max = clamp(10, x.new_min, x.old_max)
//!                                    for x in [x.new_min, x.new_max - x.new_min) { out[x] = 1 }
//! ```
//!
//! The trimmed body is then simplified knowing the smaller range, which
//! usually removes the condition that made the trim possible.

use std::sync::Arc;

use kiln_ir::analysis::loads_from_buffer;
use kiln_ir::stmt::For;
use kiln_ir::visit::{Mutator, Visitor, mutate_expr_children, mutate_stmt_children, rewrite_expr, walk_expr, walk_stmt};
use kiln_ir::{
    BinOp, Expr, ExprKind, Interval, Intrinsic, NameGen, Scope, Stmt, StmtKind, Type, can_prove,
    common_subexpression_elimination, expr_uses_var, simplify, simplify_stmt,
};
use tracing::{debug, trace};

use crate::solve::{and_condition_over_domain, solve_expression, solve_for_outer_interval};

// ============================================================================
// No-op conditions
// ============================================================================

/// Drop tags and `return_second` wrappers, keeping the tagged value.
fn strip_identities(e: &Arc<Expr>) -> Arc<Expr> {
    rewrite_expr(e, |node| match node.as_call()?.intrinsic()? {
        Intrinsic::Likely | Intrinsic::LikelyIfInnermost | Intrinsic::PromiseClamped => {
            node.as_call()?.args.first().map(strip_identities)
        }
        Intrinsic::ReturnSecond => node.as_call()?.args.last().map(strip_identities),
        _ => None,
    })
}

fn make_and(a: Arc<Expr>, b: Arc<Expr>) -> Arc<Expr> {
    if a.is_false() || b.is_true() {
        a
    } else if b.is_false() || a.is_true() {
        b
    } else {
        a.and(b)
    }
}

fn make_or(a: Arc<Expr>, b: Arc<Expr>) -> Arc<Expr> {
    if a.is_false() || b.is_true() {
        b
    } else if b.is_false() || a.is_true() {
        a
    } else {
        a.or(b)
    }
}

/// Condition under which `value` equals `load`.
///
/// Selects are split so that `select(c, load, v)` gives `c || v == load`.
fn equals_load(value: &Arc<Expr>, load: &Arc<Expr>) -> Arc<Expr> {
    if kiln_ir::equal(value, load) {
        return Expr::const_true();
    }
    match value.kind() {
        ExprKind::Select(c, t, f) => {
            let (when_true, when_false) = (equals_load(t, load), equals_load(f, load));
            make_or(make_and(c.clone(), when_true), make_and(c.not(), when_false))
        }
        _ => load.cmp_eq(value),
    }
}

/// Builds a sufficient condition for the visited statement to have no
/// effect.
struct IsNoOp {
    condition: Arc<Expr>,
}

impl IsNoOp {
    fn new() -> Self {
        Self { condition: Expr::const_true() }
    }

    fn store(&mut self, name: &str, value: &Arc<Expr>, index: &Arc<Expr>, predicate: &Arc<Expr>) {
        if value.ty().is_handle() || predicate.is_false() {
            self.condition = Expr::const_false();
            return;
        }
        if self.condition.is_false() {
            return;
        }
        // Nothing else can write back what is already there.
        if !loads_from_buffer(value, name) {
            self.condition = Expr::const_false();
            return;
        }
        let load = Expr::load_predicated(value.ty(), name, index.clone(), predicate.clone());
        let same = equals_load(&strip_identities(value), &load);
        let same = simplify(&common_subexpression_elimination(&same));
        let same = and_condition_over_domain(&same, &Scope::new());
        trace!(buffer = name, condition = %same, "store no-op condition");
        self.condition = make_and(self.condition.clone(), same);
    }
}

impl Visitor for IsNoOp {
    fn visit_expr(&mut self, e: &Arc<Expr>) {
        match e.kind() {
            ExprKind::Call(c) if !c.call_type.is_pure() => self.condition = Expr::const_false(),
            ExprKind::Let { name, value, .. } => {
                walk_expr(self, e);
                if expr_uses_var(&self.condition, name) {
                    self.condition = Expr::let_in(name.clone(), value.clone(), self.condition.clone());
                }
            }
            _ => walk_expr(self, e),
        }
    }

    fn visit_stmt(&mut self, s: &Arc<Stmt>) {
        match s.kind() {
            StmtKind::Store { name, value, index, predicate } => {
                walk_stmt(self, s);
                self.store(name, value, index, predicate);
            }
            StmtKind::Provide { .. } | StmtKind::Acquire { .. } | StmtKind::Assert { .. } => {
                self.condition = Expr::const_false();
            }
            StmtKind::For(f) => {
                if self.condition.is_false() {
                    return;
                }
                let outer = std::mem::replace(&mut self.condition, Expr::const_true());
                self.visit_stmt(&f.body);
                let mut varying = Scope::new();
                varying.push(f.name.clone(), Interval::bounded(f.min.clone(), f.min.add(&f.extent).sub(1)));
                let body = simplify(&common_subexpression_elimination(&self.condition));
                let relaxed = and_condition_over_domain(&body, &varying);
                let empty = simplify(&f.extent.cmp_le(0));
                self.condition = make_and(outer, make_or(relaxed, empty));
            }
            StmtKind::IfThenElse { condition, then_case, else_case } => {
                if self.condition.is_false() {
                    return;
                }
                self.visit_expr(condition);
                let mut total = std::mem::replace(&mut self.condition, Expr::const_true());
                self.visit_stmt(then_case);
                let then_noop = std::mem::replace(&mut self.condition, Expr::const_true());
                total = make_and(total, make_or(condition.not(), then_noop));
                if let Some(e) = else_case {
                    self.visit_stmt(e);
                    let else_noop = std::mem::replace(&mut self.condition, Expr::const_true());
                    total = make_and(total, make_or(condition.clone(), else_noop));
                }
                self.condition = total;
            }
            StmtKind::LetStmt { name, value, .. } => {
                walk_stmt(self, s);
                if expr_uses_var(&self.condition, name) {
                    self.condition = Expr::let_in(name.clone(), value.clone(), self.condition.clone());
                }
            }
            _ => walk_stmt(self, s),
        }
    }
}

// ============================================================================
// Simplification over a loop domain
// ============================================================================

/// Simplifies comparisons, mins and maxes that are decided over the
/// (possibly non-rectangular) domain of the enclosing loops.
struct SimplifyUsingBounds {
    containing_loops: Vec<(String, Interval)>,
}

impl SimplifyUsingBounds {
    fn new(var: &str, interval: Interval) -> Self {
        Self { containing_loops: vec![(var.to_string(), interval)] }
    }

    /// Loops are eliminated one at a time, innermost first, simplifying in
    /// between so inner bounds can cancel against outer loop variables.
    fn provably_true_over_domain(&self, test: &Arc<Expr>) -> bool {
        let mut test = test.clone();
        for (var, interval) in self.containing_loops.iter().rev() {
            if test.is_const() {
                break;
            }
            if !expr_uses_var(&test, var) {
                continue;
            }
            let ends = interval.min_expr().zip(interval.max_expr());
            test = match ends {
                Some((min, max)) if can_prove(&min.cmp_eq(max)) => {
                    common_subexpression_elimination(&Expr::let_in(var.clone(), min.clone(), test))
                }
                // Either a single point or an empty domain, on which anything holds.
                Some((min, max)) if can_prove(&min.cmp_ge(max)) => common_subexpression_elimination(
                    &Expr::let_in(var.clone(), min.clone(), test.clone())
                        .or(Expr::let_in(var.clone(), max.clone(), test)),
                ),
                _ => {
                    let solved = solve_expression(&test, var, &Scope::new());
                    let test = if solved.fully_solved { solved.result } else { test };
                    let mut domain = Scope::new();
                    domain.push(var.clone(), interval.clone());
                    and_condition_over_domain(&test, &domain)
                }
            };
            test = simplify(&test);
        }
        test.is_true()
    }

    fn with_loop<R>(&mut self, var: &str, interval: Interval, f: impl FnOnce(&mut Self) -> R) -> R {
        self.containing_loops.push((var.to_string(), interval));
        let result = f(self);
        self.containing_loops.pop();
        result
    }

    /// A let of a pure 32-bit integer acts as a single-point loop.
    fn let_interval(value: &Arc<Expr>) -> Option<Interval> {
        (value.ty() == Type::I32 && value.is_pure()).then(|| Interval::single_point(value.clone()))
    }
}

impl Mutator for SimplifyUsingBounds {
    fn mutate_expr(&mut self, e: &Arc<Expr>) -> Arc<Expr> {
        match e.kind() {
            ExprKind::Binary(op @ (BinOp::Min | BinOp::Max), a, b) if e.ty().is_int() && e.ty().bits() >= 32 => {
                let (a, b) = (self.mutate_expr(a), self.mutate_expr(b));
                let first_wins = |x: &Arc<Expr>, y: &Arc<Expr>| match op {
                    BinOp::Min => x.cmp_le(y),
                    _ => x.cmp_ge(y),
                };
                if self.provably_true_over_domain(&first_wins(&a, &b)) {
                    a
                } else if self.provably_true_over_domain(&first_wins(&b, &a)) {
                    b
                } else {
                    Expr::binary(*op, a, b)
                }
            }
            ExprKind::Binary(op, ..) if op.is_comparison() => {
                let e = mutate_expr_children(self, e);
                if self.provably_true_over_domain(&e) {
                    Expr::make_one(e.ty())
                } else if self.provably_true_over_domain(&e.not()) {
                    Expr::make_zero(e.ty())
                } else {
                    e
                }
            }
            ExprKind::Let { name, value, body } => {
                let value = self.mutate_expr(value);
                let body = match Self::let_interval(&value) {
                    Some(i) => self.with_loop(name, i, |m| m.mutate_expr(body)),
                    None => self.mutate_expr(body),
                };
                Expr::let_in(name.clone(), value, body)
            }
            _ => mutate_expr_children(self, e),
        }
    }

    fn mutate_stmt(&mut self, s: &Arc<Stmt>) -> Arc<Stmt> {
        match s.kind() {
            StmtKind::LetStmt { name, value, body } => {
                let value = self.mutate_expr(value);
                let body = match Self::let_interval(&value) {
                    Some(i) => self.with_loop(name, i, |m| m.mutate_stmt(body)),
                    None => self.mutate_stmt(body),
                };
                Stmt::let_stmt(name.clone(), value, body)
            }
            StmtKind::For(f) => {
                let min = self.mutate_expr(&f.min);
                let extent = self.mutate_expr(&f.extent);
                let domain = Interval::bounded(min.clone(), min.add(&extent).sub(1));
                let body = self.with_loop(&f.name, domain, |m| m.mutate_stmt(&f.body));
                Stmt::new(StmtKind::For(For { min, extent, body, ..f.clone() }))
            }
            _ => mutate_stmt_children(self, s),
        }
    }
}

// ============================================================================
// Loop trimming
// ============================================================================

struct TrimNoOps {
    names: NameGen,
}

impl TrimNoOps {
    fn trim_loop(&mut self, f: &For) -> Arc<Stmt> {
        let body = self.mutate_stmt(&f.body);
        let with_body = |body: Arc<Stmt>| Stmt::new(StmtKind::For(For { body, ..f.clone() }));

        let mut is_no_op = IsNoOp::new();
        is_no_op.visit_stmt(&body);
        let condition = simplify(&common_subexpression_elimination(&is_no_op.condition));
        trace!(var = %f.name, %condition, "loop no-op condition");

        if condition.is_true() {
            debug!(var = %f.name, "removed loop without effect");
            return Stmt::no_op();
        }
        if condition.is_false() {
            return with_body(body);
        }

        let interval = solve_for_outer_interval(&condition.not(), &f.name);
        if interval.is_everything() {
            return with_body(body);
        }
        if interval.is_empty() {
            debug!(var = %f.name, "removed loop without effect");
            return Stmt::no_op();
        }

        let body = simplify_stmt(&SimplifyUsingBounds::new(&f.name, interval.clone()).mutate_stmt(&body));

        let new_min_name = self.names.unique(&format!("{}.new_min", f.name));
        let new_max_name = self.names.unique(&format!("{}.new_max", f.name));
        let old_max_name = self.names.unique(&format!("{}.old_max", f.name));
        let new_min_var = Expr::var(new_min_name.clone());
        let new_max_var = Expr::var(new_max_name.clone());
        let old_max_var = Expr::var(old_max_name.clone());

        let old_max = f.min.add(&f.extent);
        let new_min = match interval.min_expr() {
            Some(lo) => lo.clamp(&f.min, &old_max_var),
            None => f.min.clone(),
        };
        // Intervals are closed; loop ends are one past the last iteration.
        let new_max = match interval.max_expr() {
            Some(hi) => hi.add(1).clamp(&new_min_var, &old_max_var),
            None => old_max.clone(),
        };
        debug!(var = %f.name, %new_min, %new_max, "trimmed loop");

        let s = Stmt::new(StmtKind::For(For {
            min: new_min_var.clone(),
            extent: new_max_var.sub(&new_min_var),
            body,
            ..f.clone()
        }));
        let s = Stmt::let_stmt(new_max_name, new_max, s);
        let s = Stmt::let_stmt(new_min_name, new_min, s);
        let s = Stmt::let_stmt(old_max_name, old_max, s);
        simplify_stmt(&s)
    }
}

impl Mutator for TrimNoOps {
    fn mutate_stmt(&mut self, s: &Arc<Stmt>) -> Arc<Stmt> {
        match s.kind() {
            // GPU loop bounds may not depend on enclosing GPU loop variables.
            StmtKind::For(f) if !f.for_type.is_gpu() => self.trim_loop(f),
            _ => mutate_stmt_children(self, s),
        }
    }
}

/// Shrink every non-GPU loop to the iterations whose body may have an
/// effect, and drop loops that provably have none.
#[tracing::instrument(skip_all)]
pub fn trim_no_ops(s: &Arc<Stmt>) -> Arc<Stmt> {
    TrimNoOps { names: NameGen::new() }.mutate_stmt(s)
}
