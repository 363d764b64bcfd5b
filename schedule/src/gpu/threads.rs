//! Thread-nest shape: block size, dimensionality and loop-to-guard rewrite.

use std::sync::Arc;

use kiln_ir::stmt::For;
use kiln_ir::visit::{Mutator, Visitor, mutate_stmt_children, walk_stmt};
use kiln_ir::{
    Bound, DeviceApi, Expr, ForType, Interval, Scope, Stmt, StmtKind, bounds_of_expr_in_scope, can_prove, simplify,
    substitute_in_stmt,
};
use tracing::warn;

use super::{WARP_SIZE, is_thread_loop, thread_dim, thread_var, thread_var_name};

/// Interval a loop variable ranges over, bounded in `scope`.
pub(crate) fn loop_interval(f: &For, scope: &Scope<Interval>) -> Interval {
    let min = bounds_of_expr_in_scope(&f.min, scope);
    let max = bounds_of_expr_in_scope(&f.min.add(&f.extent).sub(1), scope);
    Interval::new(min.min, max.max)
}

// ============================================================================
// BLOCK SIZE
// ============================================================================

struct ExtractBlockSize {
    scope: Scope<Interval>,
    extents: [Option<Arc<Expr>>; 4],
}

impl ExtractBlockSize {
    fn found_thread_loop(&mut self, f: &For) {
        let dim = thread_dim(&f.name);
        let extent = match bounds_of_expr_in_scope(&f.extent, &self.scope).max {
            Bound::Finite(e) => e,
            _ => {
                warn!(thread_loop = %f.name, extent = %f.extent, "thread loop extent has no upper bound in its block");
                f.extent.clone()
            }
        };
        self.extents[dim] = Some(match self.extents[dim].take() {
            Some(old) => simplify(&old.max(&extent)),
            None => extent,
        });
    }
}

impl Visitor for ExtractBlockSize {
    fn visit_stmt(&mut self, s: &Arc<Stmt>) {
        match s.kind() {
            StmtKind::For(f) => {
                if is_thread_loop(f) {
                    self.found_thread_loop(f);
                }
                let interval = loop_interval(f, &self.scope);
                self.scope.push(f.name.clone(), interval);
                walk_stmt(self, s);
                self.scope.pop(&f.name);
            }
            StmtKind::LetStmt { name, value, .. } => {
                let interval = bounds_of_expr_in_scope(value, &self.scope);
                self.scope.push(name.clone(), interval);
                walk_stmt(self, s);
                self.scope.pop(name);
            }
            _ => walk_stmt(self, s),
        }
    }
}

/// Extent of each thread dimension of the fused nest: the largest extent of
/// any thread loop over that dimension, maximised over the block loops.
///
/// Dimensions below the highest one used get extent 1. The x extent is
/// rounded up to a multiple of the warp size when it is a constant.
pub(crate) fn block_size(body: &Arc<Stmt>, block_scope: &Scope<Interval>) -> Vec<Arc<Expr>> {
    let mut extract = ExtractBlockSize { scope: block_scope.clone(), extents: Default::default() };
    extract.visit_stmt(body);

    let dims = extract.extents.iter().rposition(Option::is_some).map_or(0, |d| d + 1);
    let mut extents: Vec<Arc<Expr>> =
        extract.extents.into_iter().take(dims).map(|e| e.unwrap_or_else(|| Expr::int(1))).collect();
    if let Some(x) = extents.first_mut()
        && let Some(n) = x.as_int()
    {
        *x = Expr::int((n / WARP_SIZE + i64::from(n % WARP_SIZE > 0)) * WARP_SIZE);
    }
    extents
}

// ============================================================================
// DIMENSIONALITY
// ============================================================================

/// Wraps every block-level statement in extent-1 loops over the thread
/// dimensions it does not already iterate, so that every statement runs
/// inside a full thread nest once loops become guards.
struct NormalizeDimensionality {
    dims: usize,
    depth: usize,
    /// Bit `d` is set once a loop over thread dimension `d` is seen.
    used: u8,
}

impl NormalizeDimensionality {
    fn wrap(&mut self, s: &Arc<Stmt>) -> Arc<Stmt> {
        let saved = std::mem::take(&mut self.used);
        let mut s = self.mutate_stmt(s);
        if !s.is_no_op() {
            for dim in (0..self.dims).filter(|d| self.used & (1 << d) == 0) {
                let one = Expr::int(1);
                s = Stmt::for_loop(thread_var_name(dim), Expr::int(0), one, ForType::GpuThread, DeviceApi::None, s);
            }
            // A wrapped statement is a full nest to whatever encloses it.
            self.used = (1 << self.dims) - 1;
        }
        self.used |= saved;
        s
    }
}

impl Mutator for NormalizeDimensionality {
    fn mutate_stmt(&mut self, s: &Arc<Stmt>) -> Arc<Stmt> {
        match s.kind() {
            StmtKind::For(f) if is_thread_loop(f) => {
                self.depth += 1;
                self.used |= 1 << thread_dim(&f.name);
                let s = mutate_stmt_children(self, s);
                self.depth -= 1;
                s
            }
            StmtKind::Block(first, rest) if self.depth == 0 => {
                let first = self.wrap(first);
                let rest = self.wrap(rest);
                Stmt::block(first, rest)
            }
            _ => mutate_stmt_children(self, s),
        }
    }
}

pub(crate) fn normalize_dimensionality(body: &Arc<Stmt>, dims: usize) -> Arc<Stmt> {
    NormalizeDimensionality { dims, depth: 0, used: 0 }.mutate_stmt(body)
}

// ============================================================================
// LOOPS TO GUARDS
// ============================================================================

/// Replaces each thread loop by its body, reindexed by the fused thread id
/// and guarded when the loop is shorter than the fused nest.
struct ReplaceForWithIf<'a> {
    extents: &'a [Arc<Expr>],
}

impl Mutator for ReplaceForWithIf<'_> {
    fn mutate_stmt(&mut self, s: &Arc<Stmt>) -> Arc<Stmt> {
        let Some(f) = s.as_for().filter(|f| is_thread_loop(f)) else {
            return mutate_stmt_children(self, s);
        };
        let dim = thread_dim(&f.name);
        let var = thread_var(dim);
        let body = self.mutate_stmt(&f.body);
        let body = if f.name == thread_var_name(dim) { body } else { substitute_in_stmt(&f.name, &var, &body) };
        let covers_nest = self.extents.get(dim).is_some_and(|extent| can_prove(&f.extent.cmp_ge(extent)));
        if covers_nest { body } else { Stmt::if_then(var.cmp_lt(&f.extent), body) }
    }
}

pub(crate) fn replace_for_with_if(body: &Arc<Stmt>, extents: &[Arc<Expr>]) -> Arc<Stmt> {
    ReplaceForWithIf { extents }.mutate_stmt(body)
}
