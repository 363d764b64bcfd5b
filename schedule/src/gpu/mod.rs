//! Fusing the GPU thread loops of each kernel into one thread nest.
//!
//! After lowering, a kernel body is a sequence of statements at block level,
//! some of them loops over GPU threads. A GPU executes the whole body once
//! per thread, so the separate thread loops are merged into a single nest
//! whose extents are the maxima over the body, with each original loop
//! replaced by a guard on the thread id and a barrier between stages:
//!
//! ```text
//! for blk.__block_id_x:                 for blk.__block_id_x:
//!   allocate s[100] shared                allocate __shared[100] shared
//!   for t.__thread_id_x in [0, 37):       for .__thread_id_x in [0, 64):
//!     s[t] = ...                   =>       if .__thread_id_x < 37: s[..] = ...
//!   for t.__thread_id_x in [0, 37):         gpu_thread_barrier(2)
//!     out[t] = s[t]                         if .__thread_id_x < 37: out[..] = __shared[..]
//! ```
//!
//! Block-level allocations are packed into one shared pool (or one heap
//! pool for `Heap` memory) by liveness, per-thread allocations are hoisted
//! to just inside the fused nest, and barriers carry a fence mask naming
//! the memory each stage boundary must order.
//!
//! # Module Organization
//!
//! - [`threads`] - Block size extraction, dimensionality normalisation, loop-to-guard rewrite
//! - [`allocations`] - Allocation extraction and liveness-based pooling
//! - [`barriers`] - Barrier injection with fence masks

use std::sync::Arc;

use kiln_ir::stmt::For;
use kiln_ir::visit::{Mutator, mutate_stmt_children};
use kiln_ir::{
    DeviceApi, Expr, ForType, Interval, Scope, Stmt, bounds_of_expr_in_scope, simplify, substitute_in_stmt,
};
use tracing::debug;

use crate::error::{Error, Result};

pub mod allocations;
pub mod barriers;
pub mod threads;

/// Threads per warp; the x extent of a fused nest is padded to a multiple.
pub const WARP_SIZE: i64 = 32;

pub(crate) const THREAD_NAMES: [&str; 4] = ["__thread_id_x", "__thread_id_y", "__thread_id_z", "__thread_id_w"];

/// Name of the fused loop over thread dimension `dim`.
pub(crate) fn thread_var_name(dim: usize) -> String {
    format!(".{}", THREAD_NAMES[dim])
}

pub(crate) fn thread_var(dim: usize) -> Arc<Expr> {
    Expr::var(thread_var_name(dim))
}

/// Thread dimension a loop iterates over, from the suffix of its name.
pub(crate) fn thread_dim(name: &str) -> usize {
    THREAD_NAMES.iter().position(|t| name.ends_with(t)).unwrap_or(0)
}

pub(crate) fn is_thread_loop(f: &For) -> bool {
    f.for_type.is_gpu_thread()
}

pub(crate) fn is_block_loop(f: &For) -> bool {
    f.for_type == ForType::GpuBlock
}

// ============================================================================
// ENTRY POINT
// ============================================================================

/// Fuse the thread loops of every GPU kernel in `s`.
///
/// # Errors
///
/// [`Error::ThreadLoopOutsideBlock`] when a thread loop is not nested inside
/// a block loop.
#[tracing::instrument(skip_all)]
pub fn fuse_gpu_thread_loops(s: &Arc<Stmt>) -> Result<Arc<Stmt>> {
    let s = ZeroGpuLoopMins.mutate_stmt(s);
    let mut fuse = FuseKernels { error: None };
    let s = fuse.mutate_stmt(&s);
    match fuse.error {
        Some(e) => Err(e),
        None => Ok(s),
    }
}

/// Rebase GPU loops to start at zero.
struct ZeroGpuLoopMins;

impl Mutator for ZeroGpuLoopMins {
    fn mutate_stmt(&mut self, s: &Arc<Stmt>) -> Arc<Stmt> {
        let s = mutate_stmt_children(self, s);
        let Some(f) = s.as_for() else { return s };
        if !f.for_type.is_gpu() || f.min.is_zero() {
            return s;
        }
        let rebased = Expr::var(&f.name).add(&f.min);
        let body = substitute_in_stmt(&f.name, &rebased, &f.body);
        Stmt::for_loop(f.name.clone(), Expr::int(0), f.extent.clone(), f.for_type, f.device_api, body)
    }
}

struct FuseKernels {
    error: Option<Error>,
}

impl FuseKernels {
    fn fuse_kernel(&mut self, outer: &For) -> Arc<Stmt> {
        // Peel the block loop nest; the fused body is what sits inside.
        let mut nest = vec![outer.clone()];
        while let Some(inner) = nest.last().and_then(|f| f.body.as_for()).filter(|f| is_block_loop(f)) {
            nest.push(inner.clone());
        }
        let mut scope = Scope::new();
        for f in &nest {
            let min = bounds_of_expr_in_scope(&f.min, &scope);
            let end = bounds_of_expr_in_scope(&f.min.add(&f.extent).sub(1), &scope);
            scope.push(f.name.clone(), Interval::new(min.min, end.max));
        }
        let innermost = nest.last().map(|f| f.body.clone()).unwrap_or_else(Stmt::no_op);

        let kernel = fuse_block_body(&innermost, &scope, outer);

        let mut body = kernel.body;
        for f in nest.iter().rev() {
            body = Stmt::for_loop(f.name.clone(), f.min.clone(), f.extent.clone(), f.for_type, f.device_api, body);
        }
        match kernel.heap {
            Some(heap) => heap.wrap(body),
            None => body,
        }
    }
}

impl Mutator for FuseKernels {
    fn mutate_stmt(&mut self, s: &Arc<Stmt>) -> Arc<Stmt> {
        if self.error.is_some() {
            return s.clone();
        }
        let Some(f) = s.as_for() else { return mutate_stmt_children(self, s) };
        if is_thread_loop(f) {
            self.error = Some(Error::ThreadLoopOutsideBlock { thread_loop: f.name.clone() });
            return s.clone();
        }
        if !is_block_loop(f) {
            return mutate_stmt_children(self, s);
        }
        self.fuse_kernel(f)
    }
}

struct FusedKernel {
    body: Arc<Stmt>,
    heap: Option<allocations::HeapPool>,
}

/// Fuse the body of the innermost block loop.
fn fuse_block_body(body: &Arc<Stmt>, block_scope: &Scope<Interval>, outer: &For) -> FusedKernel {
    let extents = threads::block_size(body, block_scope);
    debug!(kernel = %outer.name, extents = ?extents.iter().map(|e| e.to_string()).collect::<Vec<_>>(), "block size");

    let body = threads::normalize_dimensionality(body, extents.len());
    let extracted = allocations::extract(&body, block_scope);
    let body = barriers::inject(&extracted.body, &extracted.register_names());
    let body = threads::replace_for_with_if(&body, &extents);
    let mut fused = extracted.wrap_registers(body);

    if extents.is_empty() {
        fused = thread_loop(0, Expr::int(1), outer.device_api, fused);
    }
    for (dim, extent) in extents.iter().enumerate() {
        fused = thread_loop(dim, simplify(extent), outer.device_api, fused);
    }
    let body = extracted.wrap_shared(fused);
    FusedKernel { body, heap: extracted.heap }
}

fn thread_loop(dim: usize, extent: Arc<Expr>, device_api: DeviceApi, body: Arc<Stmt>) -> Arc<Stmt> {
    Stmt::for_loop(thread_var_name(dim), Expr::int(0), extent, ForType::GpuThread, device_api, body)
}
