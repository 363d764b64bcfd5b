//! Regions of producers needed to compute regions of consumers.
//!
//! [`DependenceAnalysis::regions_required`] walks the call graph from a stage
//! towards its producers. Each visited stage binds its loop variables to
//! intervals, asks the bounds engine which boxes of each called function its
//! values and left-hand sides touch, and queues every stage of those callees
//! with their new pure-argument bounds. Boxes only ever grow.
//!
//! Results are memoized per `(stage, producers, only_computed)` and bounds.

use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use kiln_ir::bounds::merge_regions;
use kiln_ir::{
    Bound, Env, Expr, Function, Interval, Region, Scope, bounds_of_expr_in_scope, boxes_required, merge_boxes,
    simplify,
};
use tracing::{trace, warn};

use super::{DimBounds, FStage, Regions, num_stages, simplify_interval, stage_bounds};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RegionsQuery {
    func: String,
    stage: usize,
    prods: BTreeSet<String>,
    only_computed: bool,
}

/// Producer-region analysis over a fixed environment.
pub struct DependenceAnalysis<'a> {
    env: &'a Env,
    order: &'a [String],
    cache: RefCell<HashMap<RegionsQuery, Vec<(DimBounds, Regions)>>>,
}

impl<'a> DependenceAnalysis<'a> {
    /// `order` is a realization order of `env`: producers before consumers.
    pub fn new(env: &'a Env, order: &'a [String]) -> Self {
        Self { env, order, cache: RefCell::new(HashMap::new()) }
    }

    pub fn env(&self) -> &'a Env {
        self.env
    }

    pub fn order(&self) -> &'a [String] {
        self.order
    }

    /// Boxes of every function and buffer read to compute `stage` of `f`
    /// over `bounds`, following calls only into functions in `prods`.
    ///
    /// With `only_computed`, the box of `f` itself is left out: it is what
    /// the stage writes, not what it computes. Bounds that stay symbolic fall
    /// back to the callee's estimates where it has them.
    pub fn regions_required(
        &self,
        f: &Function,
        stage: usize,
        bounds: &DimBounds,
        prods: &BTreeSet<String>,
        only_computed: bool,
    ) -> Regions {
        let query = RegionsQuery { func: f.name().to_string(), stage, prods: prods.clone(), only_computed };
        if let Some(entries) = self.cache.borrow().get(&query)
            && let Some((_, regions)) = entries.iter().find(|(b, _)| b == bounds)
        {
            return regions.clone();
        }

        let rank: HashMap<&str, usize> = self.order.iter().enumerate().map(|(i, n)| (n.as_str(), i)).collect();
        let mut regions = Regions::new();
        let mut queue: BTreeMap<FStage, DimBounds> = [(FStage::new(f.name(), stage), bounds.clone())].into();
        let mut visited: Vec<(FStage, DimBounds)> = Vec::new();
        let priority = |s: &FStage| (rank.get(s.func.as_str()).copied().unwrap_or(usize::MAX), Reverse(s.stage));

        // Consumers first, so a producer is visited once with all its consumers' demands merged.
        while let Some(next) = queue.keys().max_by_key(|s| priority(s)).cloned() {
            let Some(curr) = queue.remove(&next) else { unreachable!("queued stage {next} vanished") };
            visited.push((next.clone(), curr.clone()));
            let Some(func) = self.env.lookup(&next.func) else { continue };

            for found in self.stage_regions(func, next.stage, &curr) {
                self.merge_and_queue(&mut queue, &mut regions, &found, prods, only_computed, func.name(), &visited);
            }
        }

        let regions = self.concretize(regions);
        self.cache.borrow_mut().entry(query).or_default().push((bounds.clone(), regions.clone()));
        regions
    }

    /// Boxes touched by each value (or extern argument) of one stage.
    fn stage_regions(&self, func: &Function, stage: usize, bounds: &DimBounds) -> Vec<Regions> {
        if let Some(ext) = func.extern_definition() {
            let mut out = Vec::new();
            for arg in &ext.args {
                match whole_function(arg) {
                    Some(name) => match self.env.lookup(name) {
                        Some(prod) => {
                            let everything = Region::new(vec![Interval::everything(); prod.dimensions()]);
                            out.push([(name.to_string(), everything)].into());
                        }
                        None => trace!(func = func.name(), buffer = name, "extern reads a whole buffer"),
                    },
                    None => out.push(boxes_required(arg, &Scope::new())),
                }
            }
            return out;
        }

        let Some(def) = func.stage(stage) else { return Vec::new() };
        let scope: Scope<Interval> =
            def.schedule.dims.iter().filter_map(|d| bounds.get(&d.var).map(|b| (d.var.clone(), b.clone()))).collect();

        def.values
            .iter()
            .map(|value| {
                let mut found = boxes_required(value, &scope);
                let mut lhs = Region::default();
                for arg in &def.args {
                    merge_regions(&mut found, &boxes_required(arg, &scope));
                    lhs.bounds.push(bounds_of_expr_in_scope(arg, &scope));
                }
                merge_boxes(found.entry(func.name().to_string()).or_default(), &lhs);
                found
            })
            .collect()
    }

    #[allow(clippy::too_many_arguments)]
    fn merge_and_queue(
        &self,
        queue: &mut BTreeMap<FStage, DimBounds>,
        regions: &mut Regions,
        found: &Regions,
        prods: &BTreeSet<String>,
        only_computed: bool,
        current: &str,
        visited: &[(FStage, DimBounds)],
    ) {
        for (name, region) in found {
            if !only_computed || name != current {
                merge_boxes(regions.entry(name.clone()).or_default(), region);
            }
            if name == current || !prods.contains(name) {
                continue;
            }
            let Some(prod) = self.env.lookup(name) else { continue };
            let pure: DimBounds = prod.args().iter().cloned().zip(region.iter().cloned()).collect();
            for s in 0..num_stages(prod) {
                let key = FStage::new(name, s);
                let bounds = stage_bounds(prod, s, &pure);
                if visited.iter().any(|(k, b)| *k == key && *b == bounds) {
                    continue;
                }
                match queue.entry(key) {
                    Entry::Vacant(v) => {
                        v.insert(bounds);
                    }
                    Entry::Occupied(mut o) => widen(o.get_mut(), &bounds),
                }
            }
        }
    }

    /// Simplify every box; symbolic ends fall back to the function's estimates.
    fn concretize(&self, regions: Regions) -> Regions {
        regions
            .into_iter()
            .map(|(name, region)| {
                let f = self.env.lookup(&name);
                let bounds = region
                    .iter()
                    .enumerate()
                    .map(|(i, b)| {
                        let mut b = simplify_interval(b);
                        let estimate = f.and_then(|f| {
                            let arg = f.args().get(i)?;
                            f.schedule().estimates.iter().rev().find(|e| e.var == *arg)
                        });
                        if let Some(e) = estimate {
                            if !is_constant(&b.min) {
                                b.min = Bound::Finite(e.min.clone());
                            }
                            if !is_constant(&b.max)
                                && let (Some(min), Some(extent)) = (e.min.as_int(), e.extent.as_int())
                            {
                                b.max = Bound::Finite(Expr::int(min + extent - 1));
                            }
                        }
                        b
                    })
                    .collect();
                (name, bounds)
            })
            .collect()
    }

    /// [`regions_required`](Self::regions_required) merged over every stage
    /// of `f`, given its pure argument bounds.
    pub fn regions_required_all_stages(
        &self,
        f: &Function,
        pure_bounds: &DimBounds,
        prods: &BTreeSet<String>,
        only_computed: bool,
    ) -> Regions {
        let mut regions = Regions::new();
        for s in 0..num_stages(f) {
            let bounds = stage_bounds(f, s, pure_bounds);
            merge_regions(&mut regions, &self.regions_required(f, s, &bounds, prods, only_computed));
        }
        regions
    }

    /// Part of each required box also needed by the next iteration of `var`.
    ///
    /// Computes the regions at `bounds` and at `bounds` with `var` shifted by
    /// its own extent, then intersects them per name.
    pub fn redundant_regions(
        &self,
        f: &Function,
        stage: usize,
        var: &str,
        bounds: &DimBounds,
        prods: &BTreeSet<String>,
        only_computed: bool,
    ) -> Regions {
        let regions = self.regions_required(f, stage, bounds, prods, only_computed);

        let shifted: DimBounds = bounds
            .iter()
            .map(|(v, b)| match (b.min_expr(), b.max_expr()) {
                (Some(min), Some(max)) if v == var => {
                    let len = max.sub(min).add(1);
                    (v.clone(), Interval::bounded(simplify(&min.add(&len)), simplify(&max.add(&len))))
                }
                _ => (v.clone(), b.clone()),
            })
            .collect();
        let shifted_regions = self.regions_required(f, stage, &shifted, prods, only_computed);

        let mut overlaps = Regions::new();
        for (name, region) in &regions {
            let Some(moved) = shifted_regions.get(name) else {
                // TODO: find which pipelines drop a producer from the regions of a shifted tile.
                warn!(func = f.name(), var, producer = %name, "producer missing from the shifted regions; skipped");
                continue;
            };
            assert_eq!(region.dimensions(), moved.dimensions(), "shifted box of {name} changed dimensionality");
            let overlap = region.iter().zip(moved.iter()).map(|(a, b)| simplify_interval(&a.intersect(b))).collect();
            overlaps.insert(name.clone(), overlap);
        }
        overlaps
    }

    /// [`redundant_regions`](Self::redundant_regions) for every loop dimension
    /// of the stage, innermost first.
    pub fn overlap_regions(
        &self,
        f: &Function,
        stage: usize,
        bounds: &DimBounds,
        prods: &BTreeSet<String>,
        only_computed: bool,
    ) -> Vec<Regions> {
        super::stage_dims(f, stage)
            .iter()
            .map(|d| self.redundant_regions(f, stage, &d.var, bounds, prods, only_computed))
            .collect()
    }
}

/// A zero-argument data access: the extern consumes the whole function.
fn whole_function(arg: &Arc<Expr>) -> Option<&str> {
    let call = arg.as_call()?;
    (call.is_data_access() && call.args.is_empty()).then_some(call.name.as_str())
}

fn is_constant(b: &Bound) -> bool {
    b.as_expr().is_some_and(|e| e.as_int().is_some())
}

/// Grow `into` to cover `from`; an unbounded side on either stays unbounded.
fn widen(into: &mut DimBounds, from: &DimBounds) {
    for (var, b) in from {
        let Some(cur) = into.get_mut(var) else {
            into.insert(var.clone(), b.clone());
            continue;
        };
        let min = match (cur.min_expr(), b.min_expr()) {
            (Some(x), Some(y)) => Bound::Finite(simplify(&x.min(y))),
            _ => Bound::NegInf,
        };
        let max = match (cur.max_expr(), b.max_expr()) {
            (Some(x), Some(y)) => Bound::Finite(simplify(&x.max(y))),
            _ => Bound::PosInf,
        };
        *cur = Interval::new(min, max);
    }
}

/// Box of every function reachable from `outputs`, from the outputs' estimates.
pub fn get_pipeline_bounds<S: AsRef<str>>(analysis: &DependenceAnalysis<'_>, outputs: &[S]) -> Regions {
    let env = analysis.env();
    let prods: BTreeSet<String> = env.names().map(str::to_string).collect();
    let mut pipeline = Regions::new();

    for out in outputs {
        let Some(f) = env.lookup(out.as_ref()) else { continue };
        let mut out_box = Region::default();
        let mut pure = DimBounds::new();
        for arg in f.args() {
            let interval = match f.schedule().estimates.iter().rev().find(|e| e.var == *arg) {
                Some(e) => Interval::bounded(e.min.clone(), simplify(&e.min.add(&e.extent).sub(1))),
                None => Interval::everything(),
            };
            out_box.bounds.push(interval.clone());
            pure.insert(arg.clone(), interval);
        }
        merge_regions(&mut pipeline, &analysis.regions_required_all_stages(f, &pure, &prods, false));
        merge_regions(&mut pipeline, &[(f.name().to_string(), out_box)].into());
    }
    pipeline
}
