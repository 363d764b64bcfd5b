//! Greedy grouping of stages.
//!
//! Every stage starts in a group of its own. [`Partitioner::group`] then
//! repeatedly fuses the producer whose fusion into all of its consumers
//! lowers the estimated pipeline cost the most, until no fusion helps:
//!
//! 1. Candidates are groups whose output is the last stage of a function that
//!    is not a pipeline output. `Inline` needs a pure producer; `FastMem`
//!    needs exactly one consuming function.
//! 2. Each (producer, consumer) choice is evaluated once and cached: inlined
//!    with unit tiles, or computed per tile with the best tiling found.
//! 3. A candidate is dropped if fusing into any single consumer is a loss.
//! 4. The best candidate is committed. Cache entries involving its consumers
//!    are evicted, the producer's groups are removed and its producers now
//!    feed the consumers' groups.
//!
//! Each commit removes at least one group, so the search terminates.

use std::collections::{BTreeMap, BTreeSet};

use kiln_ir::func::{Dim, DimKind};
use kiln_ir::visit::for_each_expr;
use kiln_ir::{Expr, Function, Interval};
use tracing::{debug, trace};

use super::cost::{Cost, RegionCosts, combine_load_costs};
use super::dependence::DependenceAnalysis;
use super::{
    DimBounds, FStage, Regions, box_size, ceil_div, interval_extent, num_stages, pure_bounds_of, stage_bounds,
    stage_dims,
};
use crate::config::{AutoScheduleOptions, MachineParams};

/// Tile extent per loop variable.
pub type TileSizes = BTreeMap<String, i64>;

/// Candidate tile extents, before the innermost floor is applied.
const TILE_SIZES: [i64; 8] = [1, 4, 8, 16, 32, 64, 128, 256];

/// Kind of fusion a grouping pass performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Level {
    /// Producers are inlined into their consumers.
    Inline,
    /// Producers are computed per tile of their consumer.
    FastMem,
}

/// Stages computed together, in the loop nest of `output`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub output: FStage,
    pub members: Vec<FStage>,
    pub inlined: BTreeSet<String>,
    pub tile_sizes: TileSizes,
}

impl Group {
    pub fn new(output: FStage, members: Vec<FStage>) -> Self {
        Self { output, members, inlined: BTreeSet::new(), tile_sizes: TileSizes::new() }
    }

    fn member_names(&self) -> BTreeSet<String> {
        self.members.iter().map(|m| m.func.clone()).collect()
    }
}

/// Estimated cost and parallelism of a group; `None` when unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GroupAnalysis {
    pub cost: Option<Cost>,
    pub parallelism: Option<i64>,
}

impl GroupAnalysis {
    pub fn is_defined(&self) -> bool {
        self.cost.is_some() && self.parallelism.is_some()
    }
}

/// Fusing every stage of `prod` into the group of `cons`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct GroupingChoice {
    pub prod: String,
    pub cons: FStage,
}

/// Best tiling found for a choice, with the fused group's analysis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupConfig {
    pub tile_sizes: TileSizes,
    pub analysis: GroupAnalysis,
}

/// Stages read directly by one stage of `f`.
pub(crate) fn stage_parents(f: &Function, stage: usize) -> BTreeSet<String> {
    let mut parents = BTreeSet::new();
    let exprs: Vec<_> = match (f.extern_definition(), f.stage(stage)) {
        (Some(ext), _) => ext.args.iter().collect(),
        (None, Some(def)) => def.exprs().collect(),
        (None, None) => Vec::new(),
    };
    for e in exprs {
        for_each_expr(e, |node| {
            if let Some(c) = node.as_call()
                && c.is_data_access()
            {
                parents.insert(c.name.clone());
            }
            true
        });
    }
    parents
}

/// Loops whose iterations may run concurrently.
pub(crate) fn is_parallelizable(d: &Dim) -> bool {
    d.kind != DimKind::ImpureRVar
}

/// Groups and the search state over one pipeline.
pub struct Partitioner<'a> {
    pub(crate) pipeline_bounds: Regions,
    pub(crate) params: MachineParams,
    pub(crate) options: AutoScheduleOptions,
    pub(crate) outputs: Vec<String>,
    pub(crate) analysis: DependenceAnalysis<'a>,
    pub(crate) costs: RegionCosts<'a>,
    pub(crate) groups: BTreeMap<FStage, Group>,
    group_costs: BTreeMap<FStage, GroupAnalysis>,
    children: BTreeMap<FStage, BTreeSet<FStage>>,
    grouping_cache: BTreeMap<GroupingChoice, GroupConfig>,
}

impl<'a> Partitioner<'a> {
    /// One group per stage of every function with pipeline bounds.
    pub fn new<S: AsRef<str>>(
        pipeline_bounds: Regions,
        params: MachineParams,
        options: AutoScheduleOptions,
        outputs: &[S],
        analysis: DependenceAnalysis<'a>,
        costs: RegionCosts<'a>,
    ) -> Self {
        let env = analysis.env();
        let mut groups = BTreeMap::new();
        for f in env.iter().filter(|f| pipeline_bounds.contains_key(f.name())) {
            for s in 0..num_stages(f) {
                let stage = FStage::new(f.name(), s);
                groups.insert(stage.clone(), Group::new(stage.clone(), vec![stage]));
            }
        }

        let mut children: BTreeMap<FStage, BTreeSet<FStage>> = BTreeMap::new();
        for cons in groups.keys() {
            let Some(f) = env.lookup(&cons.func) else { continue };
            for parent in stage_parents(f, cons.stage) {
                if parent == cons.func {
                    continue;
                }
                let Some(prod) = env.lookup(&parent) else { continue };
                let prod_stage = FStage::new(&parent, num_stages(prod) - 1);
                if groups.contains_key(&prod_stage) {
                    children.entry(prod_stage).or_default().insert(cons.clone());
                }
            }
            if cons.stage > 0 {
                children.entry(FStage::new(&cons.func, cons.stage - 1)).or_default().insert(cons.clone());
            }
        }

        Self {
            pipeline_bounds,
            params,
            options,
            outputs: outputs.iter().map(|o| o.as_ref().to_string()).collect(),
            analysis,
            costs,
            groups,
            group_costs: BTreeMap::new(),
            children,
            grouping_cache: BTreeMap::new(),
        }
    }

    pub fn groups(&self) -> &BTreeMap<FStage, Group> {
        &self.groups
    }

    pub fn group_costs(&self) -> &BTreeMap<FStage, GroupAnalysis> {
        &self.group_costs
    }

    pub fn children(&self) -> &BTreeMap<FStage, BTreeSet<FStage>> {
        &self.children
    }

    pub fn grouping_cache(&self) -> &BTreeMap<GroupingChoice, GroupConfig> {
        &self.grouping_cache
    }

    pub fn pipeline_bounds(&self) -> &Regions {
        &self.pipeline_bounds
    }

    pub fn clear_grouping_cache(&mut self) {
        self.grouping_cache.clear();
    }

    pub(crate) fn func(&self, name: &str) -> &'a Function {
        match self.analysis.env().lookup(name) {
            Some(f) => f,
            None => panic!("{name} is not a function of the pipeline"),
        }
    }

    /// Sum of every group's cost; `None` if any is unknown.
    pub fn pipeline_cost(&self) -> Option<Cost> {
        let mut total = Cost::ZERO;
        for analysis in self.group_costs.values() {
            total += analysis.cost?;
        }
        Some(total)
    }

    /// Pick the best tiling of every singleton group.
    pub fn initialize_groups(&mut self) {
        let keys: Vec<FStage> = self.groups.keys().cloned().collect();
        for key in keys {
            let (tile_sizes, analysis) = self.find_best_tile_config(&self.groups[&key]);
            trace!(stage = %key, ?tile_sizes, ?analysis, "initial tiling");
            if let Some(g) = self.groups.get_mut(&key) {
                g.tile_sizes = tile_sizes;
            }
            self.group_costs.insert(key, analysis);
        }
        self.grouping_cache.clear();
    }

    // ========================================================================
    // Bounds
    // ========================================================================

    /// Loop bounds of a stage over the whole pipeline.
    pub fn get_bounds(&self, s: &FStage) -> DimBounds {
        let f = self.func(&s.func);
        stage_bounds(f, s.stage, &pure_bounds_of(f, &self.pipeline_bounds))
    }

    /// Loop bounds of one tile: `[0, size - 1]` for dimensions at least two
    /// tiles long, the full bounds otherwise.
    pub fn get_bounds_from_tile_sizes(&self, s: &FStage, tile_sizes: &TileSizes) -> DimBounds {
        let full = self.get_bounds(s);
        let mut bounds = DimBounds::new();
        for d in stage_dims(self.func(&s.func), s.stage) {
            let Some(b) = full.get(&d.var) else { continue };
            let tiled = tile_sizes.get(&d.var).filter(|size| interval_extent(b).is_some_and(|e| e >= 2 * **size));
            let tile = match tiled {
                Some(&size) => Interval::bounded(Expr::int(0), Expr::int(size - 1)),
                None => b.clone(),
            };
            bounds.insert(d.var.clone(), tile);
        }
        bounds
    }

    /// Bytes of each producer a single iteration of `s` shares with the next,
    /// per loop dimension.
    pub fn evaluate_reuse(&self, s: &FStage, prods: &BTreeSet<String>) -> BTreeMap<String, Option<i64>> {
        let f = self.func(&s.func);
        let dims = stage_dims(f, s.stage);
        let unit: TileSizes = dims.iter().map(|d| (d.var.clone(), 1)).collect();
        let bounds = self.get_bounds_from_tile_sizes(s, &unit);
        let overlaps = self.analysis.overlap_regions(f, s.stage, &bounds, prods, false);

        dims.iter()
            .zip(overlaps)
            .map(|(d, regions)| {
                let mut total = Some(0i64);
                for (name, region) in &regions {
                    let size = if self.analysis.env().contains(name) {
                        self.costs.region_size(name, region)
                    } else {
                        self.costs.input_region_size(name, region)
                    };
                    total = total.zip(size).map(|(t, s)| t.saturating_add(s));
                }
                (d.var.clone(), total)
            })
            .collect()
    }

    // ========================================================================
    // Group analysis
    // ========================================================================

    /// Estimated cost of computing `g` tile by tile, and the number of tiles
    /// that can run in parallel.
    ///
    /// Arithmetic covers every non-inlined member over the region one tile
    /// needs. Each byte loaded is weighted by the footprint of what it is
    /// loaded from, between 1 and `balance`.
    pub fn analyze_group(&self, g: &Group) -> GroupAnalysis {
        let undefined = GroupAnalysis::default();
        let members = g.member_names();
        let out_f = self.func(&g.output.func);
        let stage = g.output.stage;

        let full = self.get_bounds(&g.output);
        let (mut tiles, mut parallelism) = (1i64, 1i64);
        for d in stage_dims(out_f, stage) {
            let Some(&size) = g.tile_sizes.get(&d.var) else { continue };
            let Some(extent) = full.get(&d.var).and_then(interval_extent) else { return undefined };
            let dim_tiles = ceil_div(extent, size);
            tiles = tiles.saturating_mul(dim_tiles);
            if is_parallelizable(d) {
                parallelism = parallelism.saturating_mul(dim_tiles);
            }
        }

        let tile_bounds = self.get_bounds_from_tile_sizes(&g.output, &g.tile_sizes);
        let alloc = self.analysis.regions_required(out_f, stage, &tile_bounds, &members, false);
        let compute = self.analysis.regions_required(out_f, stage, &tile_bounds, &members, true);

        let group_regions: Regions = compute
            .iter()
            .filter(|(name, _)| members.contains(*name) && **name != g.output.func)
            .map(|(name, region)| (name.clone(), region.clone()))
            .collect();

        let Some(tile_cost) = self.costs.regions_cost(&group_regions, &g.inlined) else { return undefined };
        let Some(out_cost) = self.costs.stage_region_cost(&g.output.func, stage, &tile_bounds, &g.inlined) else {
            return undefined;
        };
        if alloc.values().any(|r| box_size(r).is_none()) {
            return undefined;
        }

        let mut loads = self.costs.regions_detailed_load_costs(&group_regions, &g.inlined);
        combine_load_costs(
            &mut loads,
            &self.costs.stage_detailed_load_costs(&g.output.func, stage, &tile_bounds, &g.inlined),
        );

        let balance = self.params.balance as f64;
        let slope = balance / self.params.last_level_cache_size as f64;
        let mut memory = 0i64;
        for (name, load) in &loads {
            assert!(!g.inlined.contains(name), "loads of inlined {name} survived inlining");
            let Some(load) = *load else { return undefined };
            let footprint = if members.contains(name) && *name != g.output.func {
                alloc.get(name).and_then(|r| self.costs.region_size(name, r))
            } else if !self.analysis.env().contains(name) {
                self.pipeline_bounds.get(name).and_then(|r| self.costs.input_region_size(name, r))
            } else {
                self.pipeline_bounds.get(name).and_then(|r| self.costs.region_size(name, r))
            };
            let Some(footprint) = footprint else { return undefined };
            let factor = (1.0 + footprint as f64 * slope).min(balance) as i64;
            memory = memory.saturating_add(factor.saturating_mul(load));
        }

        let per_tile = Cost::new((tile_cost + out_cost).arith, memory);
        GroupAnalysis { cost: Some(per_tile.scaled(tiles)), parallelism: Some(parallelism) }
    }

    /// Net saving of going from `old` to `new`; `None` if either is unknown
    /// or, with `ensure_parallelism`, if `new` has too little parallelism.
    pub fn estimate_benefit(&self, old: &GroupAnalysis, new: &GroupAnalysis, ensure_parallelism: bool) -> Option<i64> {
        if ensure_parallelism && !new.parallelism.is_some_and(|p| p >= self.params.parallelism) {
            return None;
        }
        let (old, new) = (old.cost?, new.cost?);
        Some((old.arith - new.arith).saturating_add(old.memory - new.memory))
    }

    /// Benefit of committing all `grouping` choices together.
    ///
    /// The old cost covers the producer's groups and each consumer's group;
    /// the new cost covers the fused groups.
    pub fn estimate_grouping_benefit(&self, grouping: &[(GroupingChoice, GroupConfig)]) -> Option<i64> {
        let mut old_groups = BTreeSet::new();
        let mut new = GroupAnalysis { cost: Some(Cost::ZERO), parallelism: Some(i64::MAX) };
        for (choice, config) in grouping {
            let prod = self.func(&choice.prod);
            old_groups.extend((0..num_stages(prod)).map(|s| FStage::new(&choice.prod, s)));
            old_groups.insert(choice.cons.clone());
            new.cost = new.cost.zip(config.analysis.cost).map(|(a, b)| a + b);
            new.parallelism = new.parallelism.zip(config.analysis.parallelism).map(|(a, b)| a.min(b));
        }

        let mut old = GroupAnalysis { cost: Some(Cost::ZERO), parallelism: None };
        for g in &old_groups {
            let Some(analysis) = self.group_costs.get(g) else { panic!("no cost for group {g}") };
            old.cost = old.cost.zip(analysis.cost).map(|(a, b)| a + b);
        }
        self.estimate_benefit(&old, &new, self.options.ensure_parallelism)
    }

    // ========================================================================
    // Tiling
    // ========================================================================

    /// Tilings tried for a stage: skewed, square, and unit tilings that keep
    /// a few inner dimensions whole.
    pub fn generate_tile_configs(&self, s: &FStage) -> Vec<TileSizes> {
        let vars: Vec<&str> =
            stage_dims(self.func(&s.func), s.stage).iter().filter(|d| !d.is_rvar()).map(|d| d.var.as_str()).collect();
        let min_inner = self.options.min_inner_dim;
        let mut configs: Vec<TileSizes> = Vec::new();
        let mut push = |config: TileSizes| {
            if !config.is_empty() && !configs.contains(&config) {
                configs.push(config);
            }
        };

        // Skewed: one dimension sweeps the sizes, inner ones wide, outer ones unit.
        for i in 0..vars.len() {
            for size in TILE_SIZES {
                let config = vars
                    .iter()
                    .enumerate()
                    .map(|(j, v)| {
                        let extent = match j.cmp(&i) {
                            std::cmp::Ordering::Equal if j == 0 => size.max(min_inner),
                            std::cmp::Ordering::Equal => size,
                            std::cmp::Ordering::Less => 256,
                            std::cmp::Ordering::Greater => 1,
                        };
                        (v.to_string(), extent)
                    })
                    .collect();
                push(config);
            }
        }

        // Square.
        for size in TILE_SIZES {
            let config = vars.iter().enumerate().map(|(j, v)| {
                let extent = if j == 0 { size.max(min_inner) } else { size };
                (v.to_string(), extent)
            });
            push(config.collect());
        }

        // Reorder: a subset of dimensions stays inside the tile, the rest becomes outer loops.
        if vars.len() <= 10 {
            for mask in 1u32..(1 << vars.len()) {
                let config = vars
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| mask & (1 << j) != 0)
                    .map(|(j, v)| (v.to_string(), if j == 0 { min_inner } else { 1 }))
                    .collect();
                push(config);
            }
        }
        configs
    }

    /// Best tiling of `g`, starting from no tiling at all.
    pub fn find_best_tile_config(&self, g: &Group) -> (TileSizes, GroupAnalysis) {
        let untiled = Group { tile_sizes: TileSizes::new(), ..g.clone() };
        let mut best = (TileSizes::new(), self.analyze_group(&untiled));
        if !best.1.is_defined() {
            return best;
        }
        for config in self.generate_tile_configs(&g.output) {
            let candidate = Group { tile_sizes: config.clone(), ..g.clone() };
            let analysis = self.analyze_group(&candidate);
            if self.estimate_benefit(&best.1, &analysis, self.options.ensure_parallelism).is_some_and(|b| b > 0) {
                best = (config, analysis);
            }
        }
        best
    }

    // ========================================================================
    // Grouping
    // ========================================================================

    fn merged_group(&self, prod: &str, cons: &Group) -> (Group, Vec<&Group>) {
        let prod_groups: Vec<&Group> = (0..num_stages(self.func(prod)))
            .map(|s| match self.groups.get(&FStage::new(prod, s)) {
                Some(g) => g,
                None => panic!("no group for stage {s} of {prod}"),
            })
            .collect();
        let mut members: Vec<FStage> = prod_groups.iter().flat_map(|g| g.members.iter().cloned()).collect();
        members.extend(cons.members.iter().cloned());
        let mut merged = Group::new(cons.output.clone(), members);
        merged.inlined = prod_groups.iter().flat_map(|g| g.inlined.iter().cloned()).collect();
        merged.inlined.extend(cons.inlined.iter().cloned());
        (merged, prod_groups)
    }

    /// Fused group for `choice`, with its tiling and analysis.
    pub fn evaluate_choice(&self, choice: &GroupingChoice, level: Level) -> GroupConfig {
        let Some(cons) = self.groups.get(&choice.cons) else { panic!("no group for {}", choice.cons) };
        let (mut group, prod_groups) = self.merged_group(&choice.prod, cons);
        match level {
            Level::Inline => {
                let tile_sizes: TileSizes = stage_dims(self.func(&cons.output.func), cons.output.stage)
                    .iter()
                    .map(|d| (d.var.clone(), 1))
                    .collect();
                group.tile_sizes = tile_sizes.clone();
                group.inlined.extend(prod_groups.iter().flat_map(|g| g.members.iter().map(|m| m.func.clone())));
                GroupConfig { tile_sizes, analysis: self.analyze_group(&group) }
            }
            Level::FastMem => {
                let (tile_sizes, analysis) = self.find_best_tile_config(&group);
                GroupConfig { tile_sizes, analysis }
            }
        }
    }

    fn candidates(&self, level: Level) -> Vec<String> {
        let mut out = Vec::new();
        for (stage, g) in &self.groups {
            let f = self.func(&stage.func);
            if self.outputs.contains(&stage.func) || stage.stage + 1 != num_stages(f) {
                continue;
            }
            let Some(kids) = self.children.get(&g.output) else { continue };
            let consumers: BTreeSet<&str> = kids.iter().map(|k| k.func.as_str()).collect();
            let eligible = match level {
                Level::Inline => f.can_be_inlined() && !consumers.is_empty(),
                Level::FastMem => consumers.len() == 1,
            };
            if eligible {
                out.push(stage.func.clone());
            }
        }
        out
    }

    fn choose_candidate_grouping(&mut self, candidates: &[String], level: Level) -> Vec<(GroupingChoice, GroupConfig)> {
        let mut best = Vec::new();
        let mut best_benefit = 0;
        for prod in candidates {
            let final_stage = FStage::new(prod, num_stages(self.func(prod)) - 1);
            let Some(kids) = self.children.get(&final_stage).cloned() else { continue };

            let mut grouping = Vec::with_capacity(kids.len());
            for cons in kids {
                let choice = GroupingChoice { prod: prod.clone(), cons };
                let config = match self.grouping_cache.get(&choice) {
                    Some(config) => config.clone(),
                    None => {
                        let config = self.evaluate_choice(&choice, level);
                        self.grouping_cache.insert(choice.clone(), config.clone());
                        config
                    }
                };
                grouping.push((choice, config));
            }

            let loses = grouping
                .iter()
                .any(|g| self.estimate_grouping_benefit(std::slice::from_ref(g)).is_some_and(|b| b < 0));
            if loses {
                trace!(prod = %prod, %level, "fusion hurts a consumer; skipped");
                continue;
            }
            let benefit = self.estimate_grouping_benefit(&grouping);
            trace!(prod = %prod, %level, ?benefit, "candidate");
            if let Some(b) = benefit
                && b > best_benefit
            {
                best_benefit = b;
                best = grouping;
            }
        }
        best
    }

    fn merge_groups(&mut self, choice: &GroupingChoice, config: &GroupConfig, level: Level) {
        let Some(cons) = self.groups.get(&choice.cons) else { panic!("no group for {}", choice.cons) };
        let (merged, prod_groups) = self.merged_group(&choice.prod, cons);
        let mut inlined = merged.inlined;
        if level == Level::Inline {
            inlined.extend(prod_groups.iter().flat_map(|g| g.members.iter().map(|m| m.func.clone())));
        }
        let members = merged.members;

        if let Some(child) = self.groups.get_mut(&choice.cons) {
            child.members = members;
            child.inlined = inlined;
            child.tile_sizes = config.tile_sizes.clone();
        }
        self.group_costs.insert(choice.cons.clone(), config.analysis);
    }

    /// Fuse groups at `level` until no fusion lowers the estimated cost.
    #[tracing::instrument(skip(self))]
    pub fn group(&mut self, level: Level) {
        loop {
            let candidates = self.candidates(level);
            let best = self.choose_candidate_grouping(&candidates, level);
            let Some((first, _)) = best.first() else { break };
            let prod = first.prod.clone();
            debug!(prod = %prod, consumers = best.len(), %level, "fusing");

            let n = num_stages(self.func(&prod));
            let prod_children = self.children.get(&FStage::new(&prod, n - 1)).cloned().unwrap_or_default();
            self.grouping_cache
                .retain(|k, _| !prod_children.iter().any(|c| k.prod == c.func || k.cons == *c));

            for (choice, config) in &best {
                self.merge_groups(choice, config, level);
            }

            for s in 0..n {
                let key = FStage::new(&prod, s);
                self.groups.remove(&key);
                self.group_costs.remove(&key);
                self.children.remove(&key);
                for consumers in self.children.values_mut() {
                    if consumers.remove(&key) {
                        consumers.extend(prod_children.iter().cloned());
                    }
                }
            }
        }
    }

    // ========================================================================
    // Bounds of scheduled groups
    // ========================================================================

    /// Box each non-inlined member must be allocated over, per group.
    pub fn group_storage_bounds(&self) -> BTreeMap<FStage, Regions> {
        self.groups
            .iter()
            .map(|(key, g)| {
                let out_f = self.func(&g.output.func);
                let members = g.member_names();
                let bounds = self.get_bounds_from_tile_sizes(&g.output, &g.tile_sizes);
                let alloc = self.analysis.regions_required(out_f, g.output.stage, &bounds, &members, false);
                let storage = alloc.into_iter().filter(|(name, _)| members.contains(name)).collect();
                (key.clone(), storage)
            })
            .collect()
    }

    /// Loop bounds of every non-inlined member stage, per group.
    pub fn group_loop_bounds(&self) -> BTreeMap<FStage, BTreeMap<FStage, DimBounds>> {
        self.groups
            .iter()
            .map(|(key, g)| {
                let out_f = self.func(&g.output.func);
                let members = g.member_names();
                let bounds = self.get_bounds_from_tile_sizes(&g.output, &g.tile_sizes);
                let computed = self.analysis.regions_required(out_f, g.output.stage, &bounds, &members, true);

                let mut loops = BTreeMap::new();
                for m in &g.members {
                    if g.inlined.contains(&m.func) {
                        continue;
                    }
                    let stage_bounds = if *m == g.output {
                        bounds.clone()
                    } else {
                        let f = self.func(&m.func);
                        let Some(region) = computed.get(&m.func) else { continue };
                        let pure: DimBounds = f.args().iter().cloned().zip(region.iter().cloned()).collect();
                        stage_bounds(f, m.stage, &pure)
                    };
                    loops.insert(m.clone(), stage_bounds);
                }
                (key.clone(), loops)
            })
            .collect()
    }
}
