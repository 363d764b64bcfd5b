//! Barrier injection between the stages of a fused kernel.

use std::collections::BTreeSet;
use std::sync::Arc;

use kiln_ir::analysis::{loaded_buffers, stored_buffers};
use kiln_ir::visit::{Mutator, for_each_expr_in_stmt, mutate_stmt_children};
use kiln_ir::{Expr, ForType, Intrinsic, Stmt, StmtKind, Type};

use super::allocations::SHARED_POOL;
use super::is_thread_loop;

/// Fence bit ordering global (device) memory.
pub const DEVICE_FENCE: i64 = 1;
/// Fence bit ordering shared memory.
pub const SHARED_FENCE: i64 = 2;

pub fn barrier(mask: i64) -> Arc<Stmt> {
    Stmt::evaluate(Expr::intrinsic(Intrinsic::GpuThreadBarrier, Type::I32, [Expr::int(mask)]))
}

pub(crate) fn contains_barrier(s: &Arc<Stmt>) -> bool {
    let mut found = false;
    for_each_expr_in_stmt(s, |e| {
        found |= e.is_intrinsic(Intrinsic::GpuThreadBarrier);
        !found
    });
    found
}

/// Memory a barrier between `before` and `after` must fence: any buffer
/// written on one side and accessed on the other. Per-thread storage never
/// needs a fence.
fn fence_mask(before: &Arc<Stmt>, after: &Arc<Stmt>, registers: &BTreeSet<String>) -> i64 {
    let (stored_before, loaded_before) = (stored_buffers(before), loaded_buffers(before));
    let (stored_after, loaded_after) = (stored_buffers(after), loaded_buffers(after));
    let write_then_access = stored_before.iter().filter(|b| stored_after.contains(*b) || loaded_after.contains(*b));
    let read_then_write = loaded_before.iter().filter(|b| stored_after.contains(*b));
    write_then_access
        .chain(read_then_write)
        .filter(|b| !registers.contains(*b))
        .fold(0, |mask, b| mask | if b == SHARED_POOL { SHARED_FENCE } else { DEVICE_FENCE })
}

struct InjectBarriers<'a> {
    registers: &'a BTreeSet<String>,
    in_threads: bool,
}

impl Mutator for InjectBarriers<'_> {
    fn mutate_stmt(&mut self, s: &Arc<Stmt>) -> Arc<Stmt> {
        match s.kind() {
            StmtKind::For(f) if is_thread_loop(f) => {
                let was_in_threads = std::mem::replace(&mut self.in_threads, true);
                let s = mutate_stmt_children(self, s);
                self.in_threads = was_in_threads;
                s
            }
            StmtKind::For(f) if !self.in_threads && f.for_type == ForType::Serial => {
                let body = self.mutate_stmt(&f.body);
                // The next iteration's first stage must wait for this one's last.
                let body = if contains_barrier(&body) {
                    let mask = fence_mask(&body, &body, self.registers);
                    Stmt::block(body, barrier(mask))
                } else {
                    body
                };
                Stmt::for_loop(f.name.clone(), f.min.clone(), f.extent.clone(), f.for_type, f.device_api, body)
            }
            StmtKind::Block(first, rest) if !self.in_threads => {
                let first = self.mutate_stmt(first);
                let rest = self.mutate_stmt(rest);
                let mask = fence_mask(&first, &rest, self.registers);
                Stmt::block(Stmt::block(first, barrier(mask)), rest)
            }
            _ => mutate_stmt_children(self, s),
        }
    }
}

/// Put a barrier at every stage boundary of a kernel body.
pub(crate) fn inject(body: &Arc<Stmt>, registers: &BTreeSet<String>) -> Arc<Stmt> {
    InjectBarriers { registers, in_threads: false }.mutate_stmt(body)
}
