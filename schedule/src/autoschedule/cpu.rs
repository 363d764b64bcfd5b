//! CPU schedules for partitioned groups.
//!
//! For each group:
//!
//! 1. The output stage is computed at root and its loops are reordered so
//!    the dimension with the smallest access stride is innermost.
//! 2. Tiled dimensions are split into inner and outer loops; the outer
//!    loops are moved outside all inner ones.
//! 3. The innermost dimension long enough for a vector is vectorized.
//! 4. Outer loops are parallelized until the target parallelism is reached.
//! 5. Every other non-inlined member is computed at the innermost tile loop,
//!    reordered and vectorized in turn.
//!
//! The loop nest of each stage is tracked locally as directives reshape it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use kiln_ir::func::{Definition, DimKind, TailStrategy};
use kiln_ir::visit::for_each_expr;
use kiln_ir::{Expr, ExprKind, Region, expr_uses_vars};
use tracing::warn;

use super::partitioner::{Group, Partitioner};
use super::text::{ScheduleText, sanitized_name};
use super::{DimBounds, FStage, Regions, bounds_to_estimates, ceil_div, interval_extent};

/// Constant extent of each loop, where known.
type Estimates = BTreeMap<String, Option<i64>>;

#[derive(Debug, Clone)]
struct LoopDim {
    var: String,
    kind: DimKind,
    vectorized: bool,
}

impl LoopDim {
    fn is_pure(&self) -> bool {
        self.kind != DimKind::ImpureRVar
    }

    fn is_rvar(&self) -> bool {
        self.kind != DimKind::PureVar
    }
}

/// Loop nest of one stage, innermost first.
#[derive(Debug, Clone)]
struct LoopNest {
    dims: Vec<LoopDim>,
}

impl LoopNest {
    fn of(def: &Definition) -> Self {
        let dims =
            def.schedule.dims.iter().map(|d| LoopDim { var: d.var.clone(), kind: d.kind, vectorized: false }).collect();
        Self { dims }
    }

    fn len(&self) -> usize {
        self.dims.len()
    }

    fn vars(&self) -> Vec<String> {
        self.dims.iter().map(|d| d.var.clone()).collect()
    }

    fn position(&self, var: &str) -> Option<usize> {
        self.dims.iter().position(|d| d.var == var)
    }

    fn dim(&self, var: &str) -> &LoopDim {
        match self.position(var) {
            Some(i) => &self.dims[i],
            None => panic!("{var} is not a loop of this stage"),
        }
    }

    /// Replace `var` with `inner`, and `outer` just outside it.
    fn split(&mut self, var: &str, outer: &str, inner: &str) {
        let Some(i) = self.position(var) else { panic!("cannot split {var}: not a loop of this stage") };
        let dim = self.dims[i].clone();
        self.dims[i] = LoopDim { var: inner.to_string(), ..dim.clone() };
        self.dims.insert(i + 1, LoopDim { var: outer.to_string(), ..dim });
    }

    /// Put `order` (innermost first) into the slots those loops occupy.
    fn reorder(&mut self, order: &[String]) {
        let mut slots: Vec<usize> = order.iter().filter_map(|v| self.position(v)).collect();
        slots.sort_unstable();
        let moved: Vec<LoopDim> = order.iter().filter_map(|v| self.position(v).map(|i| self.dims[i].clone())).collect();
        for (slot, dim) in slots.into_iter().zip(moved) {
            self.dims[slot] = dim;
        }
    }

    fn matches(&self, order: &[String]) -> bool {
        self.dims.len() == order.len() && self.dims.iter().zip(order).all(|(d, v)| d.var == *v)
    }
}

fn var_list(vars: &[String]) -> String {
    vars.iter().map(|v| sanitized_name(v)).collect::<Vec<_>>().join(", ")
}

impl Partitioner<'_> {
    /// Directives for every group, into `text`.
    #[tracing::instrument(skip_all)]
    pub fn generate_cpu_schedule(&self, text: &mut ScheduleText<'_>) {
        let loop_bounds = self.group_loop_bounds();
        let storage_bounds = self.group_storage_bounds();
        let inlines: BTreeSet<String> = self.groups.values().flat_map(|g| g.inlined.iter().cloned()).collect();

        for (key, g) in &self.groups {
            let empty_loops = BTreeMap::new();
            let empty_storage = Regions::new();
            let loops = loop_bounds.get(key).unwrap_or(&empty_loops);
            let storage = storage_bounds.get(key).unwrap_or(&empty_storage);
            self.generate_group_cpu_schedule(g, loops, storage, &inlines, text);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn split_dim(
        &self,
        func: &str,
        stage: usize,
        nest: &mut LoopNest,
        var: &str,
        factor: i64,
        suffixes: (&str, &str),
        estimates: &mut Estimates,
        text: &mut ScheduleText<'_>,
    ) -> (String, String) {
        let is_rvar = nest.dim(var).is_rvar();
        let inner = format!("{var}{}", suffixes.0);
        let outer = format!("{var}{}", suffixes.1);
        text.declare_var(&inner, is_rvar);
        text.declare_var(&outer, is_rvar);
        nest.split(var, &outer, &inner);

        let tail = if stage > 0 && !is_rvar { TailStrategy::GuardWithIf } else { TailStrategy::Auto };
        let (v, o, i) = (sanitized_name(var), sanitized_name(&outer), sanitized_name(&inner));
        let directive = match tail {
            TailStrategy::Auto => format!("split({v}, {o}, {i}, {factor})"),
            tail => format!("split({v}, {o}, {i}, {factor}, TailStrategy::{tail})"),
        };
        text.push(func, stage, directive, [var.to_string(), outer.clone(), inner.clone()]);

        let extent = estimates.remove(var).flatten();
        estimates.insert(inner.clone(), Some(factor));
        estimates.insert(outer.clone(), extent.map(|e| ceil_div(e, factor)));
        (inner, outer)
    }

    /// Vectorize the innermost dimension at least one vector long.
    fn vectorize_stage(
        &self,
        func: &str,
        stage: usize,
        nest: &mut LoopNest,
        estimates: &mut Estimates,
        text: &mut ScheduleText<'_>,
    ) {
        let vec_len = self.params.vec_len;
        let candidate = nest
            .dims
            .iter()
            .position(|d| d.is_pure() && estimates.get(&d.var).copied().flatten().is_some_and(|e| e >= vec_len));
        let Some(index) = candidate else { return };

        let var = nest.dims[index].var.clone();
        let (inner, _) = self.split_dim(func, stage, nest, &var, vec_len, ("_vi", "_vo"), estimates, text);
        if let Some(i) = nest.position(&inner) {
            nest.dims[i].vectorized = true;
        }
        text.push(func, stage, format!("vectorize({})", sanitized_name(&inner)), [inner]);
        if index > 0 {
            warn!(func, stage, var = %var, "outer dimension vectorized; inner dimensions are too short");
        }
    }

    /// Order loops by access stride, smallest stride innermost.
    ///
    /// A reduction loop that must run in order goes innermost only if its
    /// stride beats every remaining pure loop.
    fn reorder_dims(
        &self,
        func: &str,
        stage: usize,
        nest: &mut LoopNest,
        mut strides: BTreeMap<String, i64>,
        text: &mut ScheduleText<'_>,
    ) {
        let mut order = Vec::with_capacity(strides.len());
        while !strides.is_empty() {
            let pure = nest
                .dims
                .iter()
                .filter(|d| d.is_pure())
                .filter_map(|d| strides.get(&d.var).map(|s| (*s, d.var.clone())))
                .min_by_key(|(s, _)| *s);
            let impure = nest
                .dims
                .iter()
                .find(|d| !d.is_pure() && strides.contains_key(&d.var))
                .map(|d| (strides[&d.var], d.var.clone()));
            let pick = match (pure, impure) {
                (Some(p), Some(i)) if i.0 < p.0 => i,
                (Some(p), _) => p,
                (None, Some(i)) => i,
                (None, None) => break,
            };
            strides.remove(&pick.1);
            order.push(pick.1);
        }

        if !nest.matches(&order) {
            nest.reorder(&order);
            text.push(func, stage, format!("reorder({})", var_list(&order)), order);
        }
    }

    /// Stride in bytes of the widest step each loop of `s` takes through
    /// any buffer it reads or writes. Empty if some stride is unknown.
    fn analyze_spatial_locality(
        &self,
        s: &FStage,
        storage: &Regions,
        inlines: &BTreeSet<String>,
    ) -> BTreeMap<String, i64> {
        let f = self.func(&s.func);
        let Some(def) = f.stage(s.stage) else { return BTreeMap::new() };
        let values: Vec<Arc<Expr>> = def.values.iter().map(|e| self.costs.inline(e, inlines)).collect();
        let args: Vec<Arc<Expr>> = def.args.iter().map(|e| self.costs.inline(e, inlines)).collect();

        let mut accesses: Vec<(String, Vec<Arc<Expr>>)> = Vec::new();
        for e in values.iter().chain(&args) {
            for_each_expr(e, |node| {
                if let Some(c) = node.as_call()
                    && c.is_data_access()
                {
                    accesses.push((c.name.clone(), c.args.to_vec()));
                }
                true
            });
        }
        accesses.push((f.name().to_string(), args.clone()));

        let mut strides = BTreeMap::new();
        for d in &def.schedule.dims {
            let vars = vars_depending_on(&d.var, values.iter().chain(&args));
            let mut total = 0i64;
            for (name, call_args) in &accesses {
                let region = storage.get(name).or_else(|| self.pipeline_bounds.get(name));
                let Some(stride) = region.and_then(|r| self.max_access_stride(&vars, name, call_args, r)) else {
                    return BTreeMap::new();
                };
                total = total.saturating_add(stride);
            }
            strides.insert(d.var.clone(), total);
        }
        strides
    }

    fn max_access_stride(
        &self,
        vars: &BTreeSet<String>,
        name: &str,
        args: &[Arc<Expr>],
        region: &Region,
    ) -> Option<i64> {
        let (bytes, dims) = match self.analysis.env().lookup(name) {
            Some(f) => (f.output_types().iter().map(|t| t.bytes() as i64).sum::<i64>(), f.dimensions()),
            None => (self.costs.input_type(name)?.bytes() as i64, region.dimensions()),
        };
        let (mut step, mut stride) = (bytes, 0i64);
        for (dim, arg) in args.iter().take(dims).enumerate() {
            if expr_uses_vars(arg, vars) {
                stride = stride.max(step);
            }
            step = step.saturating_mul(interval_extent(region.bounds.get(dim)?)?);
        }
        Some(stride)
    }

    fn generate_group_cpu_schedule(
        &self,
        g: &Group,
        loop_bounds: &BTreeMap<FStage, DimBounds>,
        storage: &Regions,
        inlines: &BTreeSet<String>,
        text: &mut ScheduleText<'_>,
    ) {
        let out = self.func(&g.output.func);
        let (name, stage) = (out.name(), g.output.stage);

        if out.has_extern_definition() {
            assert_eq!(g.members.len(), 1, "extern {name} fused with other stages");
            text.push(name, stage, "compute_root()", [] as [String; 0]);
            return;
        }
        let Some(def) = out.stage(stage) else { return };

        let mut estimates = bounds_to_estimates(&self.get_bounds(&g.output));
        if stage == 0 {
            text.push(name, stage, "compute_root()", [] as [String; 0]);
        }

        let mut nest = LoopNest::of(def);
        if self.options.reorder && nest.len() > 1 {
            let strides = self.analyze_spatial_locality(&g.output, storage, inlines);
            if !strides.is_empty() {
                self.reorder_dims(name, stage, &mut nest, strides, text);
            }
        }

        // Tile.
        let (mut inner, mut outer) = (Vec::new(), Vec::new());
        for var in nest.vars() {
            match (g.tile_sizes.get(&var), estimates.get(&var).copied().flatten()) {
                (Some(&1), Some(extent)) if extent > 1 => outer.push(var),
                (Some(&size), Some(extent)) if extent > size => {
                    let (i, o) =
                        self.split_dim(name, stage, &mut nest, &var, size, ("_i", "_o"), &mut estimates, text);
                    inner.push(i);
                    outer.push(o);
                }
                _ => inner.push(var),
            }
        }
        if !outer.is_empty() {
            let ordering: Vec<String> = inner.iter().chain(&outer).cloned().collect();
            if !nest.matches(&ordering) {
                nest.reorder(&ordering);
                text.push(name, stage, format!("reorder({})", var_list(&ordering)), ordering);
            }
        }

        self.vectorize_stage(name, stage, &mut nest, &mut estimates, text);

        // Parallelize from the outermost loop.
        let mut parallelism = 1i64;
        let mut sequential: Option<String> = None;
        for d in nest.dims.clone().iter().rev() {
            if d.vectorized || parallelism >= self.params.parallelism {
                break;
            }
            if !d.is_pure() {
                sequential.get_or_insert_with(|| d.var.clone());
                continue;
            }
            let Some(extent) = estimates.get(&d.var).copied().flatten() else { break };
            if let Some(seq) = &sequential {
                let order = [seq.clone(), d.var.clone()];
                nest.reorder(&order);
                text.push(name, stage, format!("reorder({})", var_list(&order)), order);
            }
            text.push(name, stage, format!("parallel({})", sanitized_name(&d.var)), [d.var.clone()]);
            parallelism = parallelism.saturating_mul(extent);
        }
        if parallelism < self.params.parallelism {
            warn!(
                func = name,
                stage,
                parallelism,
                target = self.params.parallelism,
                "insufficient parallelism"
            );
        }

        // Members run inside the innermost tile loop.
        let tile_var = (!outer.is_empty()).then(|| nest.dims[nest.len() - outer.len()].var.clone());
        for m in &g.members {
            if g.inlined.contains(&m.func) || m.func == name {
                continue;
            }
            let mf = self.func(&m.func);
            let Some(mdef) = mf.stage(m.stage) else { continue };
            if m.stage == 0 {
                match &tile_var {
                    Some(var) => {
                        let group_func = sanitized_name(name);
                        let directive = format!("compute_at({group_func}, {})", sanitized_name(var));
                        text.push(&m.func, 0, directive, [var.clone()]);
                    }
                    None => {
                        warn!(func = %m.func, group = name, "degenerate tiling: no loop is tiled; computing at root");
                        text.push(&m.func, 0, "compute_root()", [] as [String; 0]);
                    }
                }
            }

            let mut mem_estimates = loop_bounds.get(m).map(bounds_to_estimates).unwrap_or_default();
            let mut mnest = LoopNest::of(mdef);
            if self.options.reorder && mnest.len() > 1 {
                let strides = self.analyze_spatial_locality(m, storage, inlines);
                if !strides.is_empty() {
                    self.reorder_dims(&m.func, m.stage, &mut mnest, strides, text);
                }
            }
            self.vectorize_stage(&m.func, m.stage, &mut mnest, &mut mem_estimates, text);
        }
    }
}

/// `var` and every let-bound name whose value depends on it.
fn vars_depending_on<'e>(var: &str, exprs: impl Iterator<Item = &'e Arc<Expr>>) -> BTreeSet<String> {
    let mut vars = BTreeSet::from([var.to_string()]);
    for e in exprs {
        for_each_expr(e, |node| {
            if let ExprKind::Let { name, value, .. } = node.kind()
                && expr_uses_vars(value, &vars)
            {
                vars.insert(name.clone());
            }
            true
        });
    }
    vars
}
