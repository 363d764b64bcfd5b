//! Cost model: arithmetic operations and bytes moved per point, scaled to
//! regions, plus working-set sizes.
//!
//! Unknown costs are `None` and propagate through every sum. Extern stages
//! always cost `None`, which keeps them out of any fused group.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::{Add, AddAssign};
use std::sync::Arc;

use kiln_ir::analysis::find_data_accesses;
use kiln_ir::func::{find_direct_calls, inline_function, realization_order};
use kiln_ir::visit::{Visitor, for_each_expr, walk_expr};
use kiln_ir::{CallType, Env, Expr, ExprKind, Function, Intrinsic, Region, Type, simplify};
use tracing::warn;

use super::{DimBounds, Regions, box_size, num_stages, stage_dims};

/// Arithmetic cost charged for a call into opaque code.
pub const EXTERN_CALL_COST: i64 = 999;

/// Arithmetic operations and bytes moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cost {
    pub arith: i64,
    pub memory: i64,
}

impl Cost {
    pub const ZERO: Self = Self { arith: 0, memory: 0 };

    pub fn new(arith: i64, memory: i64) -> Self {
        Self { arith, memory }
    }

    pub fn scaled(self, points: i64) -> Self {
        Self { arith: self.arith.saturating_mul(points), memory: self.memory.saturating_mul(points) }
    }
}

impl Add for Cost {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self { arith: self.arith.saturating_add(rhs.arith), memory: self.memory.saturating_add(rhs.memory) }
    }
}

impl AddAssign for Cost {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

/// Bytes loaded from each function or buffer; `None` where the count is unknown.
pub type LoadCosts = BTreeMap<String, Option<i64>>;

/// Add `from` into `into`; an unknown count on either side stays unknown.
pub fn combine_load_costs(into: &mut LoadCosts, from: &LoadCosts) {
    for (name, load) in from {
        let entry = into.entry(name.clone()).or_insert(Some(0));
        *entry = match (*entry, *load) {
            (Some(a), Some(b)) => Some(a.saturating_add(b)),
            _ => None,
        };
    }
}

// ============================================================================
// Expression costs
// ============================================================================

#[derive(Default)]
struct ExprCost {
    cost: Cost,
    loads: BTreeMap<String, i64>,
}

impl Visitor for ExprCost {
    fn visit_expr(&mut self, e: &Arc<Expr>) {
        match e.kind() {
            ExprKind::Const(_) | ExprKind::StringImm(_) | ExprKind::Variable(_) | ExprKind::Let { .. } => {}
            ExprKind::Cast(_)
            | ExprKind::Reinterpret(_)
            | ExprKind::Binary(..)
            | ExprKind::Not(_)
            | ExprKind::Select(..) => self.cost.arith += 1,
            ExprKind::Call(call) => match call.call_type {
                CallType::Halide | CallType::Image => {
                    let bytes = e.ty().bytes() as i64;
                    self.cost += Cost::new(1, bytes);
                    *self.loads.entry(call.name.clone()).or_default() += bytes;
                }
                CallType::Extern => self.cost.arith += EXTERN_CALL_COST,
                CallType::PureExtern => self.cost.arith += pure_extern_cost(&call.name),
                CallType::Intrinsic | CallType::PureIntrinsic => self.cost.arith += intrinsic_cost(call.intrinsic()),
            },
            ExprKind::Load(_)
            | ExprKind::Ramp { .. }
            | ExprKind::Broadcast { .. }
            | ExprKind::Shuffle { .. }
            | ExprKind::VectorReduce { .. } => {
                panic!("unexpected {e} in a function definition while costing")
            }
        }
        walk_expr(self, e);
    }
}

/// Math library calls by precision; anything else is opaque.
fn pure_extern_cost(name: &str) -> i64 {
    if name.ends_with("_f64") {
        20
    } else if name.ends_with("_f32") {
        10
    } else if name.ends_with("_f16") {
        5
    } else {
        warn!(name, cost = EXTERN_CALL_COST, "unknown extern function; assuming a large cost");
        EXTERN_CALL_COST
    }
}

fn intrinsic_cost(intrinsic: Option<Intrinsic>) -> i64 {
    match intrinsic {
        Some(Intrinsic::Likely | Intrinsic::LikelyIfInnermost | Intrinsic::PromiseClamped) => 0,
        Some(Intrinsic::Abs | Intrinsic::Lerp) => 5,
        Some(
            Intrinsic::BitwiseAnd
            | Intrinsic::BitwiseOr
            | Intrinsic::BitwiseXor
            | Intrinsic::BitwiseNot
            | Intrinsic::ShiftLeft
            | Intrinsic::ShiftRight
            | Intrinsic::Undef
            | Intrinsic::ReturnSecond
            | Intrinsic::Require,
        ) => 1,
        Some(i @ (Intrinsic::GpuThreadBarrier | Intrinsic::AddressOf | Intrinsic::Alloca)) => {
            panic!("intrinsic {i:?} cannot appear in a function definition")
        }
        None => 1,
    }
}

/// Cost of evaluating `e` once, with the bytes it loads per callee.
pub fn expr_cost(e: &Arc<Expr>) -> (Cost, BTreeMap<String, i64>) {
    let mut v = ExprCost::default();
    v.visit_expr(e);
    (v.cost, v.loads)
}

/// Inline every call in `e` to a function in `inlines`, until none is left.
///
/// Consumers are inlined before their producers so each pass exposes the
/// producers' calls.
pub fn perform_inline(e: &Arc<Expr>, env: &Env, inlines: &BTreeSet<String>, order: &[String]) -> Arc<Expr> {
    if inlines.is_empty() {
        return e.clone();
    }
    let mut e = e.clone();
    loop {
        let calls = find_data_accesses(&e);
        let next = order
            .iter()
            .rev()
            .filter(|name| inlines.contains(*name) && calls.contains_key(*name))
            .find_map(|name| env.lookup(name));
        match next {
            Some(f) => e = inline_function(&e, f),
            None => return e,
        }
    }
}

// ============================================================================
// Region costs
// ============================================================================

/// Costs of the functions of one pipeline, with per-function results cached.
pub struct RegionCosts<'a> {
    env: &'a Env,
    order: &'a [String],
    inputs: BTreeMap<String, Type>,
    func_costs: BTreeMap<String, Option<Vec<Cost>>>,
}

impl<'a> RegionCosts<'a> {
    pub fn new(env: &'a Env, order: &'a [String]) -> Self {
        let mut inputs = BTreeMap::new();
        for f in env.iter() {
            let extern_args = f.extern_definition().into_iter().flat_map(|x| &x.args);
            let exprs = f.stages().flat_map(|d| d.exprs()).chain(extern_args);
            for e in exprs {
                for_each_expr(e, |node| {
                    if let Some(c) = node.as_call()
                        && c.is_data_access()
                        && (c.call_type == CallType::Image || !env.contains(&c.name))
                    {
                        inputs.insert(c.name.clone(), node.ty());
                    }
                    true
                });
            }
        }

        let mut costs = Self { env, order, inputs, func_costs: BTreeMap::new() };
        let no_inlines = BTreeSet::new();
        costs.func_costs = env.iter().map(|f| (f.name().to_string(), costs.func_cost(f, &no_inlines))).collect();
        costs
    }

    pub fn env(&self) -> &'a Env {
        self.env
    }

    pub fn order(&self) -> &'a [String] {
        self.order
    }

    /// Element type of an input buffer.
    pub fn input_type(&self, name: &str) -> Option<Type> {
        self.inputs.get(name).copied()
    }

    pub fn inline(&self, e: &Arc<Expr>, inlines: &BTreeSet<String>) -> Arc<Expr> {
        perform_inline(e, self.env, inlines, self.order)
    }

    /// Cost of computing one point of each stage of `f`.
    ///
    /// Each point pays for its values and one store per value; updates also
    /// pay for their left-hand sides. `None` for extern functions.
    pub fn func_cost(&self, f: &Function, inlines: &BTreeSet<String>) -> Option<Vec<Cost>> {
        if f.has_extern_definition() {
            return None;
        }
        let mut costs = Vec::with_capacity(f.num_stages());
        for def in f.stages() {
            let mut cost = Cost::ZERO;
            for value in &def.values {
                let (c, _) = expr_cost(&simplify(&self.inline(value, inlines)));
                cost += c + Cost::new(1, value.ty().bytes() as i64);
            }
            if def.is_update() {
                for arg in &def.args {
                    cost += expr_cost(&simplify(&self.inline(arg, inlines))).0;
                }
            }
            costs.push(cost);
        }
        Some(costs)
    }

    fn stage_point_cost(&self, func: &str, stage: usize, inlines: &BTreeSet<String>) -> Option<Cost> {
        let f = self.env.lookup(func)?;
        let costs = if inlines.is_empty() {
            self.func_costs.get(func).cloned().flatten()
        } else {
            self.func_cost(f, inlines)
        };
        costs?.get(stage).copied()
    }

    /// Cost of computing `stage` of `func` over the loop bounds `bounds`.
    pub fn stage_region_cost(
        &self,
        func: &str,
        stage: usize,
        bounds: &DimBounds,
        inlines: &BTreeSet<String>,
    ) -> Option<Cost> {
        let f = self.env.lookup(func)?;
        let region: Region = stage_dims(f, stage).iter().map(|d| bounds.get(&d.var).cloned()).collect::<Option<_>>()?;
        let size = box_size(&region)?;
        Some(self.stage_point_cost(func, stage, inlines)?.scaled(size))
    }

    /// Cost of computing `stage` of `func` over a box of its pure arguments.
    pub fn stage_region_cost_of_box(
        &self,
        func: &str,
        stage: usize,
        region: &Region,
        inlines: &BTreeSet<String>,
    ) -> Option<Cost> {
        let f = self.env.lookup(func)?;
        let pure: DimBounds = f.args().iter().cloned().zip(region.iter().cloned()).collect();
        self.stage_region_cost(func, stage, &super::stage_bounds(f, stage, &pure), inlines)
    }

    /// Cost of computing every stage of `func` over `region`.
    pub fn region_cost(&self, func: &str, region: &Region, inlines: &BTreeSet<String>) -> Option<Cost> {
        let f = self.env.lookup(func)?;
        let mut total = Cost::ZERO;
        for stage in 0..num_stages(f) {
            total += self.stage_region_cost_of_box(func, stage, region, inlines)?;
        }
        Some(total)
    }

    /// Cost of computing every function of `regions` that is not inlined.
    pub fn regions_cost(&self, regions: &Regions, inlines: &BTreeSet<String>) -> Option<Cost> {
        let mut total = Cost::ZERO;
        for (name, region) in regions {
            if inlines.contains(name) {
                continue;
            }
            total += self.region_cost(name, region, inlines)?;
        }
        Some(total)
    }

    // ------------------------------------------------------------------------
    // Loads
    // ------------------------------------------------------------------------

    /// Bytes loaded per callee by one point of a stage, including the store
    /// of the stage itself.
    pub fn stage_load_costs(&self, func: &str, stage: usize, inlines: &BTreeSet<String>) -> LoadCosts {
        let mut loads = LoadCosts::new();
        let Some(f) = self.env.lookup(func) else { return loads };
        let Some(def) = f.stage(stage) else {
            loads.insert(func.to_string(), None);
            return loads;
        };
        for value in &def.values {
            let (_, per_callee) = expr_cost(&simplify(&self.inline(value, inlines)));
            combine_load_costs(&mut loads, &per_callee.into_iter().map(|(n, b)| (n, Some(b))).collect());
            combine_load_costs(&mut loads, &[(func.to_string(), Some(value.ty().bytes() as i64))].into());
        }
        loads
    }

    /// Bytes loaded per callee by `stage` of `func` over `bounds`.
    pub fn stage_detailed_load_costs(
        &self,
        func: &str,
        stage: usize,
        bounds: &DimBounds,
        inlines: &BTreeSet<String>,
    ) -> LoadCosts {
        let size = self.env.lookup(func).and_then(|f| {
            let region: Option<Region> = stage_dims(f, stage).iter().map(|d| bounds.get(&d.var).cloned()).collect();
            box_size(&region?)
        });
        self.stage_load_costs(func, stage, inlines)
            .into_iter()
            .map(|(name, load)| (name, load.zip(size).map(|(l, s)| l.saturating_mul(s))))
            .collect()
    }

    /// Bytes loaded per callee by every stage of `func` over `region`.
    pub fn detailed_load_costs(&self, func: &str, region: &Region, inlines: &BTreeSet<String>) -> LoadCosts {
        let mut loads = LoadCosts::new();
        let Some(f) = self.env.lookup(func) else { return loads };
        let pure: DimBounds = f.args().iter().cloned().zip(region.iter().cloned()).collect();
        for stage in 0..num_stages(f) {
            let bounds = super::stage_bounds(f, stage, &pure);
            combine_load_costs(&mut loads, &self.stage_detailed_load_costs(func, stage, &bounds, inlines));
        }
        loads
    }

    /// Bytes loaded per callee by every function of `regions` not inlined.
    pub fn regions_detailed_load_costs(&self, regions: &Regions, inlines: &BTreeSet<String>) -> LoadCosts {
        let mut loads = LoadCosts::new();
        for (name, region) in regions {
            if !inlines.contains(name) {
                combine_load_costs(&mut loads, &self.detailed_load_costs(name, region, inlines));
            }
        }
        loads
    }

    // ------------------------------------------------------------------------
    // Sizes
    // ------------------------------------------------------------------------

    /// Bytes of `region` of `func`, over all its tuple elements.
    pub fn region_size(&self, func: &str, region: &Region) -> Option<i64> {
        let f = self.env.lookup(func)?;
        let bytes: i64 = f.output_types().iter().map(|t| t.bytes() as i64).sum();
        Some(box_size(region)?.saturating_mul(bytes))
    }

    /// Bytes of `region` of an input buffer.
    pub fn input_region_size(&self, input: &str, region: &Region) -> Option<i64> {
        let bytes = self.input_type(input)?.bytes() as i64;
        Some(box_size(region)?.saturating_mul(bytes))
    }

    /// Peak bytes live while realizing every function of `regions` in order.
    ///
    /// A function's box becomes live when it is computed and dies once its
    /// last consumer within `regions` has run. Inlined functions take no
    /// space. Names that are not functions are ignored.
    pub fn region_footprint(&self, regions: &Regions, inlined: &BTreeSet<String>) -> Option<i64> {
        let mut consumers: BTreeMap<&str, usize> =
            regions.keys().filter(|n| self.env.contains(n)).map(|n| (n.as_str(), 0)).collect();
        let names: Vec<&str> = consumers.keys().copied().collect();
        for name in &names {
            let Some(f) = self.env.lookup(name) else { continue };
            for callee in find_direct_calls(f) {
                if let Some(count) = consumers.get_mut(callee.as_str()) {
                    *count += 1;
                }
            }
        }

        let outs: Vec<&str> = consumers.iter().filter(|(_, c)| **c == 0).map(|(n, _)| *n).collect();
        let order = realization_order(&outs, self.env).ok()?;

        let mut sizes = BTreeMap::new();
        for name in &names {
            let size = if inlined.contains(*name) { 0 } else { self.region_size(name, &regions[*name])? };
            sizes.insert(*name, size);
        }

        let (mut live, mut peak) = (0i64, 0i64);
        for name in &order {
            let Some(size) = sizes.get(name.as_str()) else { continue };
            live = live.saturating_add(*size);
            peak = peak.max(live);
            let Some(f) = self.env.lookup(name) else { continue };
            for callee in find_direct_calls(f) {
                if let Some(count) = consumers.get_mut(callee.as_str()) {
                    *count -= 1;
                    if *count == 0 {
                        live -= sizes[callee.as_str()];
                    }
                }
            }
        }
        Some(peak)
    }
}
