//! Allocation extraction and liveness-based pooling for fused kernels.
//!
//! Block-level allocations are removed from the body and laid out in one
//! pool per memory kind. Two allocations share pool space when no barrier
//! stage uses both; each stage boundary is a barrier, so disjoint stage
//! ranges never see each other's data. Accesses are redirected to the pool
//! through a per-allocation offset variable.

use std::cmp::Reverse;
use std::collections::BTreeSet;
use std::sync::Arc;

use kiln_ir::stmt::Allocate;
use kiln_ir::visit::{Mutator, mutate_expr_children, mutate_stmt_children};
use kiln_ir::{
    Bound, Expr, ExprKind, Interval, MemoryType, Scope, Stmt, StmtKind, Type, bounds_of_expr_in_scope, simplify,
};
use tracing::{debug, warn};

use super::is_thread_loop;
use super::threads::loop_interval;

/// Name of the pooled block-level shared allocation.
pub const SHARED_POOL: &str = "__shared";
/// Name of the pooled heap allocation, sized for every block.
pub const HEAP_POOL: &str = "__heap";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolKind {
    Shared,
    Heap,
}

impl PoolKind {
    fn pool_name(self) -> &'static str {
        match self {
            PoolKind::Shared => SHARED_POOL,
            PoolKind::Heap => HEAP_POOL,
        }
    }

    fn offset_name(self, alloc: &str) -> String {
        match self {
            PoolKind::Shared => format!("{alloc}.shared_offset"),
            PoolKind::Heap => format!("{alloc}.heap_offset"),
        }
    }
}

/// A block-level allocation moved into a pool.
#[derive(Debug, Clone)]
struct BlockAllocation {
    name: String,
    ty: Type,
    /// Elements, bounded over the block.
    size: Arc<Expr>,
    kind: PoolKind,
    /// First and last barrier stage that touch the allocation.
    liveness: Option<(usize, usize)>,
    /// Stage of the allocation itself, for allocations nothing touches.
    declared: usize,
}

impl BlockAllocation {
    fn live_range(&self) -> (usize, usize) {
        self.liveness.unwrap_or((self.declared, self.declared))
    }

    fn extend(&mut self, first: usize, last: usize) {
        self.liveness = Some(match self.liveness {
            Some((lo, hi)) => (lo.min(first), hi.max(last)),
            None => (first, last),
        });
    }
}

/// A per-thread allocation hoisted to just inside the fused thread nest.
#[derive(Debug, Clone)]
struct RegisterAllocation {
    name: String,
    ty: Type,
    memory_type: MemoryType,
    size: Arc<Expr>,
}

// ============================================================================
// EXTRACTION
// ============================================================================

struct ExtractAllocations {
    scope: Scope<Interval>,
    in_threads: bool,
    stage: usize,
    allocations: Vec<BlockAllocation>,
    /// Pooled allocations in scope, by index into `allocations`.
    live: Scope<usize>,
    registers: Vec<RegisterAllocation>,
    /// Serial loops outside the thread nest: (stage at entry, allocations
    /// declared before the loop that it touches).
    loops: Vec<(usize, usize, BTreeSet<usize>)>,
}

impl ExtractAllocations {
    fn touch(&mut self, name: &str) -> Option<(PoolKind, String)> {
        let &i = self.live.get(name)?;
        let stage = self.stage;
        let alloc = &mut self.allocations[i];
        alloc.extend(stage, stage);
        for (_, declared_before, touched) in &mut self.loops {
            if i < *declared_before {
                touched.insert(i);
            }
        }
        Some((alloc.kind, alloc.kind.offset_name(name)))
    }

    fn pooled_index(offset_name: String, index: &Arc<Expr>) -> Arc<Expr> {
        let offset = Expr::var(offset_name);
        match index.ty().lanes() {
            1 => offset.add(index),
            lanes => Expr::broadcast(offset, lanes).add(index),
        }
    }

    fn extract_allocate(&mut self, s: &Arc<Stmt>, a: &Allocate) -> Arc<Stmt> {
        enum Target {
            Pool(PoolKind),
            Register,
        }
        let target = match (self.in_threads, a.memory_type) {
            (false, MemoryType::Heap) => Target::Pool(PoolKind::Heap),
            (false, MemoryType::Register | MemoryType::Stack) => Target::Register,
            (false, _) => Target::Pool(PoolKind::Shared),
            (true, MemoryType::Heap | MemoryType::GpuShared) => return mutate_stmt_children(self, s),
            (true, _) => Target::Register,
        };
        if a.new_expr.is_some() {
            return mutate_stmt_children(self, s);
        }

        let elements = a.extents.iter().fold(Expr::int(1), |acc, e| acc.mul(e));
        let size = match bounds_of_expr_in_scope(&elements, &self.scope).max {
            Bound::Finite(size) => size,
            _ => {
                warn!(allocation = %a.name, size = %elements, "unbounded allocation size in kernel; left in place");
                return mutate_stmt_children(self, s);
            }
        };

        match target {
            Target::Register => {
                self.registers.push(RegisterAllocation {
                    name: a.name.clone(),
                    ty: a.ty,
                    memory_type: a.memory_type,
                    size,
                });
                self.mutate_stmt(&a.body)
            }
            Target::Pool(kind) => {
                let index = self.allocations.len();
                self.allocations.push(BlockAllocation {
                    name: a.name.clone(),
                    ty: a.ty,
                    size,
                    kind,
                    liveness: None,
                    declared: self.stage,
                });
                self.live.push(a.name.clone(), index);
                let body = self.mutate_stmt(&a.body);
                self.live.pop(&a.name);
                body
            }
        }
    }
}

impl Mutator for ExtractAllocations {
    fn mutate_expr(&mut self, e: &Arc<Expr>) -> Arc<Expr> {
        let ExprKind::Load(load) = e.kind() else { return mutate_expr_children(self, e) };
        let Some((kind, offset_name)) = self.touch(&load.name) else { return mutate_expr_children(self, e) };
        let index = self.mutate_expr(&load.index);
        let predicate = self.mutate_expr(&load.predicate);
        Expr::load_predicated(e.ty(), kind.pool_name(), Self::pooled_index(offset_name, &index), predicate)
    }

    fn mutate_stmt(&mut self, s: &Arc<Stmt>) -> Arc<Stmt> {
        match s.kind() {
            StmtKind::For(f) => {
                let outside_threads = !self.in_threads && !is_thread_loop(f);
                if outside_threads {
                    self.loops.push((self.stage, self.allocations.len(), BTreeSet::new()));
                }
                let was_in_threads = self.in_threads;
                self.in_threads |= is_thread_loop(f);
                let interval = loop_interval(f, &self.scope);
                self.scope.push(f.name.clone(), interval);
                let s = mutate_stmt_children(self, s);
                self.scope.pop(&f.name);
                self.in_threads = was_in_threads;

                // Data used by a later stage of one iteration is live through
                // the earlier stages of the next.
                if outside_threads && let Some((entry, _, touched)) = self.loops.pop() {
                    for i in touched {
                        self.allocations[i].extend(entry, self.stage);
                    }
                }
                s
            }
            StmtKind::LetStmt { name, value, .. } => {
                let interval = bounds_of_expr_in_scope(value, &self.scope);
                self.scope.push(name.clone(), interval);
                let s = mutate_stmt_children(self, s);
                self.scope.pop(name);
                s
            }
            StmtKind::Block(first, rest) if !self.in_threads => {
                let first = self.mutate_stmt(first);
                self.stage += 1;
                let rest = self.mutate_stmt(rest);
                Stmt::block(first, rest)
            }
            StmtKind::Allocate(a) => self.extract_allocate(s, a),
            StmtKind::Free { name } if self.live.contains(name) => Stmt::no_op(),
            StmtKind::Store { name, value, index, predicate } => {
                let value = self.mutate_expr(value);
                let index = self.mutate_expr(index);
                let predicate = self.mutate_expr(predicate);
                match self.touch(name) {
                    Some((kind, offset_name)) => Stmt::store_predicated(
                        kind.pool_name(),
                        value,
                        Self::pooled_index(offset_name, &index),
                        predicate,
                    ),
                    None => Stmt::store_predicated(name.clone(), value, index, predicate),
                }
            }
            _ => mutate_stmt_children(self, s),
        }
    }
}

// ============================================================================
// POOLING
// ============================================================================

/// Allocations sharing one region of a pool.
#[derive(Debug)]
struct Group {
    members: Vec<(String, Type)>,
    widest: Type,
    bytes: Arc<Expr>,
    last_use: usize,
}

impl Group {
    fn constant_bytes(&self) -> Option<i64> {
        self.bytes.as_int()
    }
}

/// Placement of a set of allocations inside one flat pool.
#[derive(Debug, Clone)]
pub(crate) struct PoolLayout {
    /// Element type of the pool: the widest member type.
    pub ty: Type,
    /// Pool size in elements of `ty`.
    pub size: Arc<Expr>,
    /// Offset of each member, in elements of the member's own type.
    pub offsets: Vec<(String, Arc<Expr>)>,
}

/// Pack allocations into groups whose stage ranges are disjoint, then lay
/// the groups out widest type first so every offset stays aligned.
///
/// A constant-sized allocation joins the free constant-sized group closest
/// in size; a dynamically sized one joins the most recently freed dynamic
/// group. Ties go to the group freed last.
fn pack(allocations: &[&BlockAllocation]) -> Option<PoolLayout> {
    let mut order: Vec<&BlockAllocation> = allocations.to_vec();
    order.sort_by_key(|a| a.live_range().0);

    let mut groups: Vec<Group> = Vec::new();
    for a in order {
        let (first_use, last_use) = a.live_range();
        let bytes = simplify(&a.size.mul(a.ty.bytes() as i64));
        let constant = bytes.as_int();
        let free = groups
            .iter()
            .enumerate()
            .filter(|(_, g)| g.last_use < first_use && g.constant_bytes().is_some() == constant.is_some());
        let choice = match constant {
            Some(c) => free
                .min_by_key(|(_, g)| (g.constant_bytes().map_or(i64::MAX, |b| (b - c).abs()), Reverse(g.last_use)))
                .map(|(i, _)| i),
            None => free.max_by_key(|(_, g)| g.last_use).map(|(i, _)| i),
        };
        match choice {
            Some(i) => {
                let g = &mut groups[i];
                debug!(allocation = %a.name, shares_with = %g.members[0].0, "pooled allocations share space");
                g.members.push((a.name.clone(), a.ty));
                g.bytes = simplify(&g.bytes.max(&bytes));
                g.last_use = last_use;
                if a.ty.bytes() > g.widest.bytes() {
                    g.widest = a.ty;
                }
            }
            None => groups.push(Group {
                members: vec![(a.name.clone(), a.ty)],
                widest: a.ty,
                bytes,
                last_use,
            }),
        }
    }

    groups.sort_by_key(|g| Reverse(g.widest.bytes()));
    let ty = groups.first()?.widest;
    let unit = ty.bytes().max(1) as i64;
    let mut offset = Expr::int(0);
    let mut offsets = Vec::new();
    for g in &groups {
        for (name, member_ty) in &g.members {
            let scale = unit / member_ty.bytes().max(1) as i64;
            offsets.push((name.clone(), simplify(&offset.mul(scale))));
        }
        let units = g.bytes.add(unit - 1).div(unit);
        offset = simplify(&offset.add(units));
    }
    Some(PoolLayout { ty, size: offset, offsets })
}

// ============================================================================
// RESULT
// ============================================================================

/// The heap pool, allocated outside the block loops with one slice per block.
#[derive(Debug, Clone)]
pub(crate) struct HeapPool {
    ty: Type,
    size: Arc<Expr>,
}

impl HeapPool {
    pub(crate) fn wrap(&self, body: Arc<Stmt>) -> Arc<Stmt> {
        Stmt::allocate(HEAP_POOL, self.ty, MemoryType::Heap, vec![self.size.clone()], Expr::const_true(), body)
    }
}

/// A kernel body with its allocations pulled out.
pub(crate) struct Extracted {
    pub body: Arc<Stmt>,
    shared: Option<PoolLayout>,
    /// Heap layout for one block, with the block's linear index and the block count.
    heap_layout: Option<(PoolLayout, Arc<Expr>)>,
    pub heap: Option<HeapPool>,
    registers: Vec<RegisterAllocation>,
}

impl Extracted {
    pub(crate) fn register_names(&self) -> BTreeSet<String> {
        self.registers.iter().map(|r| r.name.clone()).collect()
    }

    /// Allocate the hoisted per-thread storage around the fused body, one
    /// allocation per name at the largest size seen.
    pub(crate) fn wrap_registers(&self, body: Arc<Stmt>) -> Arc<Stmt> {
        let mut merged: Vec<RegisterAllocation> = Vec::new();
        for r in &self.registers {
            match merged.iter_mut().find(|m| m.name == r.name) {
                Some(m) => m.size = simplify(&m.size.max(&r.size)),
                None => merged.push(r.clone()),
            }
        }
        merged.into_iter().rev().fold(body, |body, r| {
            Stmt::allocate(r.name, r.ty, r.memory_type, vec![r.size], Expr::const_true(), body)
        })
    }

    /// Define the pool offsets and allocate the shared pool around the
    /// fused thread nest.
    pub(crate) fn wrap_shared(&self, fused: Arc<Stmt>) -> Arc<Stmt> {
        let mut body = fused;
        if let Some((layout, block_index)) = &self.heap_layout {
            for (name, offset) in layout.offsets.iter().rev() {
                let in_block = simplify(&block_index.mul(&layout.size).add(offset));
                body = Stmt::let_stmt(PoolKind::Heap.offset_name(name), in_block, body);
            }
        }
        if let Some(layout) = &self.shared {
            for (name, offset) in layout.offsets.iter().rev() {
                body = Stmt::let_stmt(PoolKind::Shared.offset_name(name), offset.clone(), body);
            }
            body = Stmt::allocate(
                SHARED_POOL,
                layout.ty,
                MemoryType::GpuShared,
                vec![layout.size.clone()],
                Expr::const_true(),
                body,
            );
        }
        body
    }
}

/// Linear index of the current block and the number of blocks, from the
/// block loop intervals.
fn block_linearization(block_scope: &Scope<Interval>) -> (Arc<Expr>, Arc<Expr>) {
    let mut dims: Vec<(&str, &Interval)> = block_scope.iter().collect();
    dims.sort_by_key(|(name, _)| *name);
    let mut index = Expr::int(0);
    let mut count = Expr::int(1);
    for (name, interval) in dims {
        let (Some(min), Some(max)) = (interval.min_expr(), interval.max_expr()) else {
            warn!(block_loop = name, "block loop has unbounded extent; heap pool slices may alias");
            continue;
        };
        index = index.add(Expr::var(name).sub(min).mul(&count));
        count = count.mul(max.sub(min).add(1));
    }
    (simplify(&index), simplify(&count))
}

/// Pull block-level and per-thread allocations out of a kernel body.
pub(crate) fn extract(body: &Arc<Stmt>, block_scope: &Scope<Interval>) -> Extracted {
    let mut extract = ExtractAllocations {
        scope: block_scope.clone(),
        in_threads: false,
        stage: 0,
        allocations: Vec::new(),
        live: Scope::new(),
        registers: Vec::new(),
        loops: Vec::new(),
    };
    let body = extract.mutate_stmt(body);

    let of_kind = |kind| extract.allocations.iter().filter(|a| a.kind == kind).collect::<Vec<_>>();
    let shared = pack(&of_kind(PoolKind::Shared));
    let heap_layout = pack(&of_kind(PoolKind::Heap));
    if let Some(layout) = &shared {
        debug!(members = layout.offsets.len(), size = %layout.size, ty = %layout.ty, "shared pool");
    }

    let (heap_layout, heap) = match heap_layout {
        Some(layout) => {
            let (index, count) = block_linearization(block_scope);
            let heap = HeapPool { ty: layout.ty, size: simplify(&layout.size.mul(&count)) };
            (Some((layout, index)), Some(heap))
        }
        None => (None, None),
    };
    Extracted { body, shared, heap_layout, heap, registers: extract.registers }
}
