//! Lowering lane-striped allocations to warp shuffles.
//!
//! A register allocation placed inside a loop over GPU threads but outside
//! the loop over warp lanes is shared by the lanes of a warp. Registers are
//! private to a lane, so the allocation is moved inside the lane loop at a
//! fraction of its size and striped across the warp: each lane keeps the
//! elements it stores, and a load of another lane's element becomes a warp
//! shuffle.
//!
//! ```text
//! allocate a[i32 * 32]                  for lane in [0, 32):
//! for lane in [0, 32):                    allocate a[i32 * 1]
//!   a[lane] = ...                 =>        a[0] = ...
//!   out[lane] = a[(lane + 1) % 32]          out[lane] = select(lane >= 31, shfl.up(a[0], 31, 0),
//!                                                                          shfl.down(a[0], 1, 31))
//! ```
//!
//! Lane loops shorter than a power of two run at the next power of two
//! with the extra lanes masked off, since shuffles address lanes in
//! power-of-two groups.
//!
//! # Module Organization
//!
//! - [`stride`] - Striping stride of an allocation and index reduction
//! - [`hoist`] - Lifting shuffles out of conditionals

use std::sync::Arc;

use kiln_dtype::TypeCode;
use kiln_ir::simplify::{ConstInterval, const_bounds, simplify_in_scope};
use kiln_ir::stmt::{Allocate, For};
use kiln_ir::visit::{Mutator, Visitor, mutate_expr_children, mutate_stmt_children, walk_stmt};
use kiln_ir::{
    BinOp, Expr, ExprKind, ForType, NameGen, Scope, Stmt, StmtKind, Type, expr_uses_var, simplify_stmt,
    substitute_in_stmt,
};
use tracing::debug;

use crate::config::WarpShuffleOptions;
use crate::error::{Error, Result};
use crate::gpu::WARP_SIZE;
use crate::passes::hoist_loop_invariant_values;
use crate::solve::solve_expression;

pub mod hoist;
pub mod stride;

use hoist::HoistWarpShuffles;
use stride::{DetermineAllocStride, reduce_expr};

/// Name prefix shared by every shuffle intrinsic this pass emits.
pub const SHUFFLE_PREFIX: &str = "llvm.nvvm.shfl.";

/// Lower the warp-level allocations of every GPU kernel in `s` that has a
/// loop over lanes.
///
/// # Errors
///
/// - [`Error::LaneLoopExtent`] for a lane loop without a constant extent of at most 32.
/// - [`Error::WarpAllocationSize`] for an allocation with no constant per-lane size.
/// - [`Error::BadWarpStride`] when stores do not stripe an allocation across the warp.
/// - [`Error::WarpShuffleType`] when a 64-bit value would need a shuffle.
#[tracing::instrument(skip_all)]
pub fn lower_warp_shuffles(s: &Arc<Stmt>, options: &WarpShuffleOptions) -> Result<Arc<Stmt>> {
    let s = hoist_loop_invariant_values(s);
    let s = SubstituteInLaneVar { lane: None }.mutate_stmt(&s);
    let s = simplify_stmt(&s);
    let names = NameGen::new();
    let mut kernels = LowerKernels { options, names: &names, error: None };
    let s = kernels.mutate_stmt(&s);
    match kernels.error {
        Some(e) => Err(e),
        None => Ok(s),
    }
}

// ============================================================================
// LANE VARIABLE SUBSTITUTION
// ============================================================================

/// Inlines lets whose value is a function of the lane, once solved for it,
/// so later passes see lane arithmetic directly.
struct SubstituteInLaneVar {
    lane: Option<String>,
}

impl SubstituteInLaneVar {
    fn solved_lane_value(&self, value: &Arc<Expr>) -> Option<Arc<Expr>> {
        let lane = self.lane.as_deref()?;
        if !expr_uses_var(value, lane) || !value.is_pure() {
            return None;
        }
        let solved = solve_expression(&kiln_ir::simplify(value), lane, &Scope::new());
        solved.fully_solved.then_some(solved.result)
    }
}

impl Mutator for SubstituteInLaneVar {
    fn mutate_expr(&mut self, e: &Arc<Expr>) -> Arc<Expr> {
        if let ExprKind::Let { name, value, body } = e.kind()
            && let Some(solved) = self.solved_lane_value(value)
        {
            return self.mutate_expr(&kiln_ir::substitute(name, &solved, body));
        }
        mutate_expr_children(self, e)
    }

    fn mutate_stmt(&mut self, s: &Arc<Stmt>) -> Arc<Stmt> {
        match s.kind() {
            StmtKind::LetStmt { name, value, body } => match self.solved_lane_value(value) {
                Some(solved) => self.mutate_stmt(&substitute_in_stmt(name, &solved, body)),
                None => mutate_stmt_children(self, s),
            },
            StmtKind::For(f) if f.for_type == ForType::GpuLane => {
                let outer = self.lane.replace(f.name.clone());
                let s = mutate_stmt_children(self, s);
                self.lane = outer;
                s
            }
            _ => mutate_stmt_children(self, s),
        }
    }
}

// ============================================================================
// KERNELS
// ============================================================================

fn has_lane_loop(s: &Arc<Stmt>) -> bool {
    struct HasLaneLoop(bool);
    impl Visitor for HasLaneLoop {
        fn visit_stmt(&mut self, s: &Arc<Stmt>) {
            if let Some(f) = s.as_for() {
                self.0 |= f.for_type == ForType::GpuLane;
            }
            if !self.0 {
                walk_stmt(self, s);
            }
        }
    }
    let mut v = HasLaneLoop(false);
    v.visit_stmt(s);
    v.0
}

struct LowerKernels<'a> {
    options: &'a WarpShuffleOptions,
    names: &'a NameGen,
    error: Option<Error>,
}

impl Mutator for LowerKernels<'_> {
    fn mutate_stmt(&mut self, s: &Arc<Stmt>) -> Arc<Stmt> {
        if self.error.is_some() {
            return s.clone();
        }
        let is_kernel = s.as_for().is_some_and(|f| f.for_type.is_gpu()) && has_lane_loop(s);
        if !is_kernel {
            return mutate_stmt_children(self, s);
        }
        let mut lower = LowerWarpShuffles::new(self.options);
        let mut lowered = lower.mutate_stmt(s);
        if let Some(e) = lower.error {
            self.error = Some(e);
            return s.clone();
        }
        // Allocations picked up with no lane loop below them go back around the kernel.
        for alloc in lower.allocations.drain(..).rev() {
            lowered = Stmt::new(StmtKind::Allocate(Allocate { body: lowered, ..alloc }));
        }
        let hoisted = HoistWarpShuffles { names: self.names }.mutate_stmt(&lowered);
        simplify_stmt(&hoisted)
    }
}

// ============================================================================
// LOWERING
// ============================================================================

struct AllocInfo {
    /// Elements each lane keeps.
    size: i64,
    stride: Arc<Expr>,
}

struct LaneLoop {
    name: String,
    warp_size: i64,
}

struct LowerWarpShuffles<'a> {
    options: &'a WarpShuffleOptions,
    lane: Option<LaneLoop>,
    /// Warp-level allocations waiting for the lane loop below them.
    allocations: Vec<Allocate>,
    info: Scope<AllocInfo>,
    bounds: Scope<ConstInterval>,
    error: Option<Error>,
}

impl<'a> LowerWarpShuffles<'a> {
    fn new(options: &'a WarpShuffleOptions) -> Self {
        Self { options, lane: None, allocations: Vec::new(), info: Scope::new(), bounds: Scope::new(), error: None }
    }

    fn lane_name(&self) -> &str {
        self.lane.as_ref().map_or("", |l| l.name.as_str())
    }

    fn warp_size(&self) -> Arc<Expr> {
        Expr::int(self.lane.as_ref().map_or(WARP_SIZE, |l| l.warp_size))
    }

    fn simplify(&self, e: &Arc<Expr>) -> Arc<Expr> {
        simplify_in_scope(e, &self.bounds)
    }

    fn lower_lane_loop(&mut self, f: &For) -> Result<Arc<Stmt>> {
        let extent = f.extent.as_int().filter(|n| (1..=WARP_SIZE).contains(n));
        let Some(extent) = extent else {
            return Err(Error::LaneLoopExtent { lane: f.name.clone(), extent: f.extent.to_string() });
        };
        // Smallest power of two holding the loop.
        let warp_size = (extent as u64).next_power_of_two() as i64;
        debug!(lane = %f.name, extent, warp_size, "lowering lane loop");
        self.lane = Some(LaneLoop { name: f.name.clone(), warp_size });

        let allocations = std::mem::take(&mut self.allocations);
        for alloc in &allocations {
            let size = alloc.extents.iter().fold(Expr::int(1), |acc, e| acc.mul(e));
            // Storage is striped across the lanes, so each keeps its share.
            let per_lane = self.simplify(&size.add(extent - 1).div(extent));
            let Some(per_lane) = const_bounds(&per_lane, &self.bounds).max else {
                return Err(Error::WarpAllocationSize {
                    alloc: alloc.name.clone(),
                    size: size.to_string(),
                    warp_size,
                });
            };
            let stride =
                DetermineAllocStride::new(&alloc.name, &f.name, warp_size, self.bounds.clone()).run(&f.body)?;
            debug!(alloc = %alloc.name, per_lane, stride = %stride, "striping allocation across warp");
            self.info.push(alloc.name.clone(), AllocInfo { size: per_lane, stride });
        }

        let mut body = self.mutate_stmt(&f.body);
        if let Some(e) = self.error.take() {
            return Err(e);
        }
        if warp_size != extent {
            body = Stmt::if_then(Expr::var(&f.name).cmp_lt(extent), body);
        }
        for alloc in allocations {
            let AllocInfo { size, .. } = self.info.pop(&alloc.name);
            body = Stmt::new(StmtKind::Allocate(Allocate { extents: vec![Expr::int(size)], body, ..alloc }));
        }
        self.lane = None;
        Ok(Stmt::for_loop(f.name.clone(), f.min.clone(), Expr::int(warp_size), f.for_type, f.device_api, body))
    }

    /// Index within the calling lane's stripe: the lane component of the
    /// flat index is removed and the high part shifted down over it.
    fn stripe_index(&self, index: &Arc<Expr>, stride: &Arc<Expr>) -> Arc<Expr> {
        let stripe = index.div(self.warp_size().mul(stride)).mul(stride);
        self.simplify(&stripe.add(reduce_expr(index, stride, &self.bounds)))
    }

    fn lower_load(&mut self, ty: Type, name: &str, index: &Arc<Expr>) -> Result<Arc<Expr>> {
        let index = self.mutate_expr(index);
        let stride = match self.info.get(name) {
            Some(info) => info.stride.clone(),
            None => return Ok(Expr::load(ty, name, index)),
        };
        let lane = self.simplify(&reduce_expr(&index.div(&stride), &self.warp_size(), &self.bounds));
        let local = self.stripe_index(&index, &stride);
        // The element index must not depend on the lane.
        let local = self.simplify(&solve_expression(&local, self.lane_name(), &Scope::new()).result);
        self.make_warp_load(ty, name, &local, &lane)
    }

    /// Read element `index` of the stripe held by lane `lane`.
    fn make_warp_load(&self, ty: Type, name: &str, index: &Arc<Expr>, lane: &Arc<Expr>) -> Result<Arc<Expr>> {
        let this_lane = self.lane_name();
        if expr_uses_var(index, this_lane) {
            // Mux over every element a lane holds.
            let elems = self.info.get(name).map_or(1, |info| info.size);
            let mut equiv = self.make_warp_load(ty, name, &Expr::make_zero(index.ty()), lane)?;
            for i in 1..elems {
                let element = self.make_warp_load(ty, name, &Expr::make_const(index.ty(), i), lane)?;
                equiv = Expr::select(index.cmp_ge(i), element, equiv);
            }
            return Ok(self.simplify(&equiv));
        }

        let base = Expr::load(ty, name, index.clone());
        let scalar_lane = match lane.kind() {
            ExprKind::Broadcast { value, .. } => value,
            _ => lane,
        };
        if scalar_lane.var_name() == Some(this_lane) {
            return Ok(base);
        }

        let (shuffle_ty, base) = match ty.bits() {
            bits if bits < 32 => {
                let wide = Type::U32.with_lanes(ty.lanes());
                (wide, base.reinterpret(ty.with_code(TypeCode::UInt)).cast(wide))
            }
            32 => (ty, base),
            _ => return Err(Error::WarpShuffleType { alloc: name.to_string(), ty }),
        };

        let lane = solve_expression(lane, this_lane, &Scope::new()).result;
        let shuffle =
            |direction: &str, delta: Arc<Expr>, clamp: i64| self.shuffle(shuffle_ty, direction, &base, delta, clamp);
        let shuffled = if let Some(offset) = lane_offset(&lane, this_lane) {
            // 0 <= this_lane + offset < warp size by construction.
            shuffle("down", offset.clone(), WARP_SIZE - 1)
        } else if let Some((offset, bits)) = lane_rotation(&lane, this_lane) {
            let group = 1i64 << bits;
            let offset = self.simplify(&offset.modulo(group));
            let down = shuffle("down", offset.clone(), group - 1);
            let up = shuffle("up", Expr::int(group).sub(&offset), 0);
            let wrapped = Expr::var(this_lane).cmp_ge(Expr::int(group).sub(&offset));
            self.simplify(&Expr::select(wrapped, up, down))
        } else {
            // High byte: lanes per shuffle group. Low byte: clamp on the source lane.
            let group_mask = (WARP_SIZE - 1) & !(self.lane.as_ref().map_or(WARP_SIZE, |l| l.warp_size) - 1);
            shuffle("idx", lane.clone(), (group_mask << 8) | (WARP_SIZE - 1))
        };

        if shuffled.ty() == ty {
            Ok(shuffled)
        } else {
            Ok(shuffled.cast(ty.with_code(TypeCode::UInt)).reinterpret(ty))
        }
    }

    fn shuffle(&self, ty: Type, direction: &str, value: &Arc<Expr>, delta: Arc<Expr>, clamp: i64) -> Arc<Expr> {
        let kind = if ty.is_float() { "f32" } else { "i32" };
        if self.options.use_sync_intrinsics() {
            let name = format!("{SHUFFLE_PREFIX}sync.{direction}.{kind}");
            let member_mask = Expr::int(-1);
            Expr::extern_call(ty, name, [member_mask, value.clone(), delta, Expr::int(clamp)])
        } else {
            let name = format!("{SHUFFLE_PREFIX}{direction}.{kind}");
            Expr::extern_call(ty, name, [value.clone(), delta, Expr::int(clamp)])
        }
    }

    /// Tighten the lane bound under `if (lane < c)` and `if (lane <= c)`.
    fn narrowed_lane_bound(&self, condition: &Arc<Expr>) -> Option<ConstInterval> {
        let lane = self.lane.as_ref()?;
        let (op, a, b) = condition.as_binary()?;
        if a.var_name() != Some(lane.name.as_str()) {
            return None;
        }
        let c = b.as_int()?;
        let max = match op {
            BinOp::Lt => c - 1,
            BinOp::Le => c,
            _ => return None,
        };
        let current = self.bounds.get(&lane.name).copied().unwrap_or_default();
        Some(ConstInterval::new(current.min, Some(max)))
    }
}

/// `k` when `lane` is `this_lane + k`.
fn lane_offset<'e>(lane: &'e Arc<Expr>, this_lane: &str) -> Option<&'e Arc<Expr>> {
    let (a, b) = lane.as_op(BinOp::Add)?;
    match (a.var_name(), b.var_name()) {
        (Some(n), _) if n == this_lane && !expr_uses_var(b, this_lane) => Some(b),
        (_, Some(n)) if n == this_lane && !expr_uses_var(a, this_lane) => Some(a),
        _ => None,
    }
}

/// `(k, b)` when `lane` is `(this_lane + k) % 2^b` with `b <= 5`.
fn lane_rotation<'e>(lane: &'e Arc<Expr>, this_lane: &str) -> Option<(&'e Arc<Expr>, u32)> {
    let (inner, modulus) = lane.as_op(BinOp::Mod)?;
    let m = modulus.as_int().filter(|m| *m > 0 && (*m as u64).is_power_of_two())?;
    let bits = m.trailing_zeros();
    if bits > 5 {
        return None;
    }
    Some((lane_offset(inner, this_lane)?, bits))
}

impl Mutator for LowerWarpShuffles<'_> {
    fn mutate_expr(&mut self, e: &Arc<Expr>) -> Arc<Expr> {
        if self.error.is_some() {
            return e.clone();
        }
        match e.kind() {
            ExprKind::Load(load) if self.info.contains(&load.name) => {
                match self.lower_load(e.ty(), &load.name, &load.index) {
                    Ok(lowered) => lowered,
                    Err(err) => {
                        self.error = Some(err);
                        e.clone()
                    }
                }
            }
            _ => mutate_expr_children(self, e),
        }
    }

    fn mutate_stmt(&mut self, s: &Arc<Stmt>) -> Arc<Stmt> {
        if self.error.is_some() {
            return s.clone();
        }
        match s.kind() {
            StmtKind::For(f) => {
                let constant = f.min.as_int().zip(f.extent.as_int());
                if let Some((min, extent)) = constant {
                    self.bounds.push(f.name.clone(), ConstInterval::bounded(min, min + extent - 1));
                }
                let result = if self.lane.is_none() && f.for_type == ForType::GpuLane {
                    self.lower_lane_loop(f).unwrap_or_else(|err| {
                        self.error = Some(err);
                        s.clone()
                    })
                } else {
                    mutate_stmt_children(self, s)
                };
                if constant.is_some() {
                    self.bounds.pop(&f.name);
                }
                result
            }
            StmtKind::IfThenElse { condition, then_case, else_case } => {
                let Some(interval) = self.narrowed_lane_bound(condition) else {
                    return mutate_stmt_children(self, s);
                };
                let lane = self.lane_name().to_string();
                let condition = self.mutate_expr(condition);
                self.bounds.push(lane.clone(), interval);
                let then_case = self.mutate_stmt(then_case);
                let else_case = else_case.as_ref().map(|e| self.mutate_stmt(e));
                self.bounds.pop(&lane);
                Stmt::if_then_else(condition, then_case, else_case)
            }
            StmtKind::Store { name, value, index, predicate } if self.info.contains(name) => {
                let index = self.mutate_expr(index);
                let value = self.mutate_expr(value);
                let predicate = self.mutate_expr(predicate);
                let stride = self.info.get(name).map_or_else(|| Expr::int(1), |info| info.stride.clone());
                let local = self.stripe_index(&index, &stride);
                Stmt::store_predicated(name.clone(), value, local, predicate)
            }
            StmtKind::Allocate(a) if self.lane.is_none() && a.memory_type != kiln_ir::MemoryType::GpuShared => {
                // Re-placed inside the lane loop at its per-lane size.
                self.allocations.push(a.clone());
                self.mutate_stmt(&a.body)
            }
            _ => mutate_stmt_children(self, s),
        }
    }
}
