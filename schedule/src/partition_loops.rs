//! Splitting loops into prologue, steady state and epilogue.
//!
//! A `likely` tag on one branch of a select, min or max, or on the
//! condition of an `if` or a store/load predicate, marks the branch the
//! loop takes for most of its iterations. The condition for taking it is
//! solved for the loop variable; on the resulting interval the branch is
//! taken unconditionally:
//!
//! ```text
//! for x in [0, 100):                                    for x in [0, 10):   a[x] = g(x)
//!   a[x] = select(10 <= x && x < 90, likely(f(x)), g(x))  =>  for x in [10, 90): a[x] = f(x)
//!                                                         for x in [90, 100): a[x] = g(x)
//! ```
//!
//! Parallel loops are not split. Their body branches between the steady
//! state and the original body instead.
//!
//! Only one loop level of a nest is partitioned: once an inner loop has
//! been split, enclosing loops are left alone. Remaining `likely` tags are
//! removed at the end.

use std::sync::Arc;

use kiln_ir::stmt::For;
use kiln_ir::visit::{Mutator, Visitor, mutate_expr_children, mutate_stmt_children, walk_expr, walk_stmt};
use kiln_ir::{
    BinOp, Expr, ExprKind, ForType, Interval, Intrinsic, Scope, Stmt, StmtKind, Type, can_prove, expr_uses_var,
    expr_uses_vars, graph_equal, graph_less_than, simplify, simplify_stmt, substitute,
};
use tracing::{debug, trace};

use crate::config::PartitionOptions;
use crate::passes::licm::bound_names;
use crate::solve::{and_condition_over_domain, solve_for_inner_interval, solve_for_outer_interval};

// ============================================================================
// LIKELY TAGS
// ============================================================================

fn is_likely_tag(e: &Arc<Expr>, innermost: bool) -> bool {
    match e.as_call().and_then(|c| c.intrinsic()) {
        Some(Intrinsic::Likely) => true,
        Some(Intrinsic::LikelyIfInnermost) => innermost,
        _ => false,
    }
}

/// A `likely` tag in `e` not already claimed by a select, min or max
/// nested inside it.
fn has_uncaptured_likely_tag(e: &Arc<Expr>, innermost: bool) -> bool {
    struct Finder {
        innermost: bool,
        found: bool,
    }
    impl Visitor for Finder {
        fn visit_expr(&mut self, e: &Arc<Expr>) {
            if self.found {
                return;
            }
            match e.kind() {
                ExprKind::Select(..) | ExprKind::Binary(BinOp::Min | BinOp::Max, ..) => {}
                _ if is_likely_tag(e, self.innermost) => self.found = true,
                _ => walk_expr(self, e),
            }
        }
    }
    let mut finder = Finder { innermost, found: false };
    finder.visit_expr(e);
    finder.found
}

fn strip_likely_tags(e: &Arc<Expr>) -> Arc<Expr> {
    RemoveLikelyTags.mutate_expr(e)
}

struct RemoveLikelyTags;

impl Mutator for RemoveLikelyTags {
    fn mutate_expr(&mut self, e: &Arc<Expr>) -> Arc<Expr> {
        if let Some(c) = e.as_call()
            && matches!(c.intrinsic(), Some(Intrinsic::Likely | Intrinsic::LikelyIfInnermost))
            && let Some(arg) = c.args.first()
        {
            return self.mutate_expr(arg);
        }
        mutate_expr_children(self, e)
    }
}

// ============================================================================
// FINDING SIMPLIFICATIONS
// ============================================================================

/// Replacing `old` by `likely` is valid wherever `condition` holds, and
/// replacing it by `unlikely` wherever it does not.
#[derive(Debug, Clone)]
struct Simplification {
    condition: Arc<Expr>,
    old: Arc<Expr>,
    likely: Arc<Expr>,
    unlikely: Arc<Expr>,
    /// The condition is false everywhere outside `interval`.
    tight: bool,
    interval: Interval,
}

/// Smallest (`max == false`) or largest lane of a vector, when known.
fn lane_extreme(e: &Arc<Expr>, max: bool) -> Option<Arc<Expr>> {
    if e.ty().is_scalar() {
        return Some(e.clone());
    }
    match e.kind() {
        ExprKind::Broadcast { value, .. } => Some(value.clone()),
        ExprKind::Ramp { base, stride, lanes } => {
            let last = base.add(stride.mul(i64::from(*lanes) - 1));
            match stride.as_int() {
                Some(s) if (s > 0) == max => Some(last),
                Some(_) => Some(base.clone()),
                None => None,
            }
        }
        ExprKind::Call(c) if is_likely_tag(e, true) => c.args.first().and_then(|a| lane_extreme(a, max)),
        _ => None,
    }
}

/// A scalar condition implying `a <= b` on every lane.
fn all_lanes_le(a: &Arc<Expr>, b: &Arc<Expr>) -> Option<Arc<Expr>> {
    Some(lane_extreme(a, true)?.cmp_le(lane_extreme(b, false)?))
}

struct FindSimplifications<'a> {
    loop_var: &'a str,
    innermost: bool,
    found: Vec<Simplification>,
}

impl FindSimplifications<'_> {
    fn push(&mut self, condition: Arc<Expr>, old: &Arc<Expr>, likely: Arc<Expr>, unlikely: Arc<Expr>) {
        let (condition, tight) = match condition.kind() {
            _ if condition.ty().is_scalar() => (condition, true),
            ExprKind::Broadcast { value, .. } => (value.clone(), true),
            _ => return,
        };
        let condition = strip_likely_tags(&condition);
        if !expr_uses_var(&condition, self.loop_var) {
            return;
        }
        trace!(%condition, "candidate simplification");
        self.found.push(Simplification {
            condition,
            old: old.clone(),
            likely,
            unlikely,
            tight,
            interval: Interval::everything(),
        });
    }

    fn min_or_max(&mut self, e: &Arc<Expr>, op: BinOp, a: &Arc<Expr>, b: &Arc<Expr>) {
        // Clamped ramps are treated as likely to stay inside the clamp.
        let ramp = |x: &Arc<Expr>| e.ty().element_of() == Type::I32 && matches!(x.kind(), ExprKind::Ramp { .. });
        let a_likely = has_uncaptured_likely_tag(a, self.innermost) || ramp(a);
        let b_likely = has_uncaptured_likely_tag(b, self.innermost) || ramp(b);
        let (likely, other) = match (a_likely, b_likely) {
            (true, false) => (a, b),
            (false, true) => (b, a),
            _ => return,
        };
        let condition = match op {
            BinOp::Min => all_lanes_le(likely, other),
            _ => all_lanes_le(other, likely),
        };
        if let Some(condition) = condition {
            let tight = e.ty().is_scalar();
            self.push(condition, e, likely.clone(), other.clone());
            if !tight && let Some(s) = self.found.last_mut() {
                s.tight = false;
            }
        }
    }

    fn predicate(&mut self, predicate: &Arc<Expr>) {
        if has_uncaptured_likely_tag(predicate, self.innermost) {
            let lanes = predicate.ty().lanes();
            self.push(predicate.clone(), predicate, Expr::bool_(true, lanes), Expr::bool_(false, lanes));
        }
    }

    /// Simplifications found while `f` runs; the ones it adds are passed
    /// to `fix` afterwards.
    fn scoped(&mut self, f: impl FnOnce(&mut Self), mut fix: impl FnMut(&mut Simplification)) {
        let start = self.found.len();
        f(self);
        for s in &mut self.found[start..] {
            fix(s);
        }
    }
}

impl Visitor for FindSimplifications<'_> {
    fn visit_expr(&mut self, e: &Arc<Expr>) {
        match e.kind() {
            ExprKind::Select(c, t, f) => {
                walk_expr(self, e);
                let likely_t = has_uncaptured_likely_tag(t, self.innermost);
                let likely_f = has_uncaptured_likely_tag(f, self.innermost);
                match (likely_t, likely_f) {
                    (true, false) => self.push(c.clone(), e, t.clone(), f.clone()),
                    (false, true) => self.push(c.not(), e, f.clone(), t.clone()),
                    _ => {}
                }
            }
            ExprKind::Binary(op @ (BinOp::Min | BinOp::Max), a, b) => {
                walk_expr(self, e);
                self.min_or_max(e, *op, a, b);
            }
            ExprKind::Load(l) => {
                walk_expr(self, e);
                self.predicate(&l.predicate);
            }
            ExprKind::Let { name, value, body } => {
                self.visit_expr(value);
                self.scoped(|v| v.visit_expr(body), |s| s.condition = substitute(name, value, &s.condition));
            }
            _ => walk_expr(self, e),
        }
    }

    fn visit_stmt(&mut self, s: &Arc<Stmt>) {
        match s.kind() {
            StmtKind::IfThenElse { condition, .. } => {
                walk_stmt(self, s);
                if has_uncaptured_likely_tag(condition, self.innermost) {
                    self.push(condition.clone(), condition, Expr::const_true(), Expr::const_false());
                }
            }
            StmtKind::Store { predicate, .. } => {
                walk_stmt(self, s);
                self.predicate(predicate);
            }
            StmtKind::LetStmt { name, value, body } => {
                self.visit_expr(value);
                self.scoped(|v| v.visit_stmt(body), |s| s.condition = substitute(name, value, &s.condition));
            }
            StmtKind::For(f) => {
                self.visit_expr(&f.min);
                self.visit_expr(&f.extent);
                let mut domain = Scope::new();
                domain.push(f.name.clone(), Interval::bounded(f.min.clone(), f.min.add(&f.extent).sub(1)));
                self.scoped(
                    |v| v.visit_stmt(&f.body),
                    |s| {
                        if expr_uses_var(&s.condition, &f.name) {
                            s.condition = and_condition_over_domain(&s.condition, &domain);
                            s.tight = false;
                        }
                    },
                );
            }
            _ => walk_stmt(self, s),
        }
    }
}

// ============================================================================
// APPLYING SIMPLIFICATIONS
// ============================================================================

/// Replaces tagged nodes, identified by address, in one copy of a body.
struct ApplySimplifications {
    replacements: Vec<(Arc<Expr>, Arc<Expr>)>,
}

impl Mutator for ApplySimplifications {
    fn mutate_expr(&mut self, e: &Arc<Expr>) -> Arc<Expr> {
        let replacement = self.replacements.iter().find(|(old, _)| Arc::ptr_eq(old, e)).map(|(_, new)| new.clone());
        match replacement {
            Some(new) => self.mutate_expr(&new),
            None => mutate_expr_children(self, e),
        }
    }
}

fn apply(body: &Arc<Stmt>, replacements: Vec<(Arc<Expr>, Arc<Expr>)>) -> Arc<Stmt> {
    if replacements.is_empty() {
        return body.clone();
    }
    ApplySimplifications { replacements }.mutate_stmt(body)
}

/// `vals` combined by `op`, sorted so equal sets give equal expressions.
fn combine(mut vals: Vec<Arc<Expr>>, op: BinOp) -> Option<Arc<Expr>> {
    vals.sort_by(|a, b| {
        if graph_less_than(a, b) {
            std::cmp::Ordering::Less
        } else if graph_less_than(b, a) {
            std::cmp::Ordering::Greater
        } else {
            std::cmp::Ordering::Equal
        }
    });
    vals.dedup_by(|a, b| graph_equal(a, b));
    let mut iter = vals.into_iter();
    let first = iter.next()?;
    Some(iter.fold(first, |acc, v| Expr::binary(op, acc, v)))
}

fn same_bounds(a: &Interval, b: &Interval) -> bool {
    let same = |x: Option<&Arc<Expr>>, y: Option<&Arc<Expr>>| match (x, y) {
        (Some(x), Some(y)) => graph_equal(x, y),
        (None, None) => true,
        _ => false,
    };
    same(a.min_expr(), b.min_expr()) && same(a.max_expr(), b.max_expr())
}

// ============================================================================
// PARTITIONING
// ============================================================================

struct PartitionLoops;

impl PartitionLoops {
    fn partition(&mut self, s: &Arc<Stmt>, f: &For) -> Arc<Stmt> {
        let body = self.mutate_stmt(&f.body);
        if !Arc::ptr_eq(&body, &f.body) {
            return Stmt::new(StmtKind::For(For { body, ..f.clone() }));
        }
        if !matches!(f.for_type, ForType::Serial | ForType::Parallel) {
            return s.clone();
        }

        let innermost = !contains_loop(&body);
        let mut finder = FindSimplifications { loop_var: &f.name, innermost, found: Vec::new() };
        finder.visit_stmt(&body);
        let mut simplifications = finder.found;
        if simplifications.is_empty() {
            return s.clone();
        }

        // Bounds must be computable before the loop starts.
        let inside = bound_names(&body);
        for sim in &mut simplifications {
            sim.interval = solve_for_inner_interval(&sim.condition, &f.name);
            let escapes = [sim.interval.min_expr(), sim.interval.max_expr()]
                .into_iter()
                .flatten()
                .any(|e| expr_uses_var(e, &f.name) || expr_uses_vars(e, &inside));
            if escapes {
                sim.interval = Interval::nothing();
            }
            if sim.tight && !sim.interval.is_empty() {
                let outer = solve_for_outer_interval(&sim.condition, &f.name);
                sim.tight = same_bounds(&outer, &sim.interval);
            }
            debug!(loop_var = %f.name, condition = %sim.condition, interval = ?sim.interval, tight = sim.tight,
                "steady state condition");
        }
        simplifications.retain(|sim| !sim.interval.is_empty());
        if simplifications.is_empty() {
            return s.clone();
        }

        let mut min_vals = Vec::new();
        let mut max_vals = Vec::new();
        let (mut lower_tight, mut upper_tight) = (true, true);
        for sim in &simplifications {
            if let Some(lo) = sim.interval.min_expr() {
                min_vals.push(lo.clone());
                lower_tight &= sim.tight;
            }
            if let Some(hi) = sim.interval.max_expr() {
                max_vals.push(hi.add(1));
                upper_tight &= sim.tight;
            }
        }
        let min_steady = combine(min_vals.clone(), BinOp::Max);
        let max_steady = combine(max_vals.clone(), BinOp::Min);
        let ordered = match (&min_steady, &max_steady) {
            (Some(lo), Some(hi)) => {
                if can_prove(&lo.cmp_ge(hi)) {
                    debug!(loop_var = %f.name, "steady state is empty");
                    return s.clone();
                }
                can_prove(&lo.cmp_le(hi))
            }
            _ => true,
        };

        let steady_body =
            apply(&body, simplifications.iter().map(|sim| (sim.old.clone(), sim.likely.clone())).collect());
        let mut prologue = Vec::new();
        let mut epilogue = Vec::new();
        for sim in &simplifications {
            let lower = sim.interval.has_lower_bound();
            let upper = sim.interval.has_upper_bound();
            if !lower && ordered {
                prologue.push((sim.old.clone(), sim.likely.clone()));
            } else if lower && min_vals.len() == 1 && lower_tight {
                prologue.push((sim.old.clone(), sim.unlikely.clone()));
            }
            if !upper && ordered {
                epilogue.push((sim.old.clone(), sim.likely.clone()));
            } else if upper && max_vals.len() == 1 && upper_tight {
                epilogue.push((sim.old.clone(), sim.unlikely.clone()));
            }
        }

        let loop_end = f.min.add(&f.extent);
        let mut lets = Vec::new();
        let min_steady = match min_steady {
            Some(lo) => {
                let name = format!("{}.prologue", f.name);
                lets.push((name.clone(), lo.clamp(&f.min, &loop_end)));
                Some(Expr::var(name))
            }
            None => None,
        };
        let max_steady = match max_steady {
            Some(hi) => {
                let name = format!("{}.epilogue", f.name);
                lets.push((name.clone(), hi.clamp(min_steady.as_ref().unwrap_or(&f.min), &loop_end)));
                Some(Expr::var(name))
            }
            None => None,
        };
        debug!(loop_var = %f.name, simplifications = simplifications.len(), for_type = ?f.for_type, "partitioned loop");

        let loop_var = Expr::var(f.name.clone());
        let make_loop = |min: Arc<Expr>, extent: Arc<Expr>, body: Arc<Stmt>| {
            Stmt::new(StmtKind::For(For { min, extent, body, ..f.clone() }))
        };
        let mut result = match f.for_type {
            ForType::Parallel => {
                let in_steady = match (&min_steady, &max_steady) {
                    (Some(lo), Some(hi)) => loop_var.cmp_ge(lo).and(loop_var.cmp_lt(hi)),
                    (Some(lo), None) => loop_var.cmp_ge(lo),
                    (None, Some(hi)) => loop_var.cmp_lt(hi),
                    (None, None) => Expr::const_true(),
                };
                let body = if in_steady.is_true() {
                    steady_body
                } else {
                    Stmt::if_then_else(in_steady, steady_body, Some(body.clone()))
                };
                make_loop(f.min.clone(), f.extent.clone(), body)
            }
            _ => {
                let steady_min = min_steady.clone().unwrap_or_else(|| f.min.clone());
                let steady_max = max_steady.clone().unwrap_or_else(|| loop_end.clone());
                let mut pieces = Vec::new();
                if let Some(lo) = &min_steady {
                    pieces.push(make_loop(f.min.clone(), lo.sub(&f.min), apply(&body, prologue)));
                }
                pieces.push(make_loop(steady_min.clone(), steady_max.sub(&steady_min), steady_body));
                if let Some(hi) = &max_steady {
                    pieces.push(make_loop(hi.clone(), loop_end.sub(hi), apply(&body, epilogue)));
                }
                Stmt::block_of(pieces)
            }
        };
        for (name, value) in lets.into_iter().rev() {
            result = Stmt::let_stmt(name, value, result);
        }
        simplify_stmt(&result)
    }
}

fn contains_loop(s: &Arc<Stmt>) -> bool {
    struct Finder(bool);
    impl Visitor for Finder {
        fn visit_expr(&mut self, _: &Arc<Expr>) {}

        fn visit_stmt(&mut self, s: &Arc<Stmt>) {
            self.0 |= matches!(s.kind(), StmtKind::For(_));
            if !self.0 {
                walk_stmt(self, s);
            }
        }
    }
    let mut finder = Finder(false);
    finder.visit_stmt(s);
    finder.0
}

impl Mutator for PartitionLoops {
    fn mutate_stmt(&mut self, s: &Arc<Stmt>) -> Arc<Stmt> {
        match s.kind() {
            // No code may be injected between GPU loops.
            StmtKind::For(f) if f.for_type.is_gpu() => mutate_stmt_children(self, s),
            StmtKind::For(f) => self.partition(s, f),
            _ => mutate_stmt_children(self, s),
        }
    }
}

/// Partition loops with `likely`-tagged branches into a prologue, a
/// branch-free steady state and an epilogue, then strip the tags.
#[tracing::instrument(skip_all)]
pub fn partition_loops(s: &Arc<Stmt>, options: &PartitionOptions) -> Arc<Stmt> {
    let s = if options.enabled { PartitionLoops.mutate_stmt(s) } else { s.clone() };
    RemoveLikelyTags.mutate_stmt(&s)
}

/// Steady-state bounds of `var` for a condition, as used by the partitioner:
/// the inner interval, and whether it is also the outer one.
pub fn steady_state_interval(condition: &Arc<Expr>, var: &str) -> (Interval, bool) {
    let condition = simplify(&strip_likely_tags(condition));
    let inner = solve_for_inner_interval(&condition, var);
    let tight = !inner.is_empty() && same_bounds(&inner, &solve_for_outer_interval(&condition, var));
    (inner, tight)
}
