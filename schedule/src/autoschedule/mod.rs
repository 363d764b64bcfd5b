//! Cost-model driven auto-scheduler.
//!
//! Given a pipeline whose outputs carry constant estimates on every pure
//! dimension, [`generate_schedules`] decides which functions to inline, which
//! to compute per tile of a consumer, and how each resulting group's loops are
//! split, reordered, vectorized and parallelized. The decisions come back as
//! schedule source text.
//!
//! ```text
//! outputs + estimates
//!        │
//!        ▼
//!  pipeline bounds ◄── DependenceAnalysis (producer regions per consumer region)
//!        │
//!        ▼
//!  Partitioner ◄────── RegionCosts (arithmetic, bytes loaded, footprints)
//!        │  one group per stage, best tiling each
//!        │  group(Inline)   fold pure producers into all their consumers
//!        │  group(FastMem)  compute single-consumer producers per tile
//!        ▼
//!  ScheduleText ◄───── split / reorder / vectorize / parallel / compute_at
//! ```
//!
//! # Module Organization
//!
//! - [`dependence`] - Regions required, redundant regions, pipeline bounds
//! - [`cost`] - Per-point costs, region costs, footprints
//! - [`partitioner`] - Groups, tile search and greedy fusion
//! - [`cpu`] - Lowering groups to CPU schedule directives
//! - [`text`] - Schedule source with variable declarations
//! - [`validate`] - Preconditions on user schedules and output estimates

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use kiln_ir::func::{Dim, Function, find_transitive_calls, realization_order};
use kiln_ir::{Bound, Env, Interval, Region, simplify};
use snafu::ResultExt;
use tracing::{debug, warn};

use crate::config::{AutoScheduleOptions, MachineParams};
use crate::error::*;

pub mod cost;
pub mod cpu;
pub mod dependence;
pub mod partitioner;
pub mod text;
pub mod validate;

pub use cost::{Cost, RegionCosts};
pub use dependence::{DependenceAnalysis, get_pipeline_bounds};
pub use partitioner::{Group, GroupAnalysis, Level, Partitioner};
pub use text::ScheduleText;
pub use validate::{check_estimates_on_outputs, validate_no_partial_schedules};

/// Interval of every loop variable of a stage.
pub type DimBounds = BTreeMap<String, Interval>;

/// Region of each function or buffer, by name.
pub type Regions = BTreeMap<String, Region>;

/// One stage of a function: 0 is the pure definition, `i > 0` is update `i - 1`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FStage {
    pub func: String,
    pub stage: usize,
}

impl FStage {
    pub fn new(func: impl Into<String>, stage: usize) -> Self {
        Self { func: func.into(), stage }
    }
}

impl fmt::Display for FStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.stage {
            0 => write!(f, "{}", self.func),
            s => write!(f, "{}.update({})", self.func, s - 1),
        }
    }
}

/// Result of a scheduling request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutoScheduleOutcome {
    /// Schedule source for every function the outputs depend on.
    Scheduled(String),
    /// An output dimension has no constant estimate; nothing was scheduled.
    MissingEstimates { func: String, var: String },
}

// ============================================================================
// Bounds helpers
// ============================================================================

/// Stages of `f`, counting an extern definition as one stage.
pub fn num_stages(f: &Function) -> usize {
    f.num_stages().max(1)
}

/// Loop dimensions of a stage, innermost first. Extern stages have none.
pub fn stage_dims(f: &Function, stage: usize) -> &[Dim] {
    f.stage(stage).map(|d| d.schedule.dims.as_slice()).unwrap_or(&[])
}

/// Number of points in `i`, if both ends simplify to constants.
pub fn interval_extent(i: &Interval) -> Option<i64> {
    let (min, max) = (i.min_expr()?, i.max_expr()?);
    let extent = simplify(&max.sub(min).add(1)).as_int()?;
    Some(extent.max(0))
}

/// Number of points in a box; `None` if any dimension is not constant.
pub fn box_size(region: &Region) -> Option<i64> {
    let mut size = 1i64;
    for interval in region.iter() {
        let extent = interval_extent(interval)?;
        if extent == 0 {
            return Some(0);
        }
        size = size.saturating_mul(extent);
    }
    Some(size)
}

pub(crate) fn simplify_interval(i: &Interval) -> Interval {
    let side = |b: &Bound| match b {
        Bound::Finite(e) => Bound::Finite(simplify(e)),
        other => other.clone(),
    };
    Interval::new(side(&i.min), side(&i.max))
}

pub(crate) fn ceil_div(a: i64, b: i64) -> i64 {
    (a + b - 1).div_euclid(b)
}

/// Bounds of every loop variable of a stage, given the pure argument bounds.
///
/// Reduction variables span their domain; pure variables are assumed to
/// cover the same range in every stage.
pub fn stage_bounds(f: &Function, stage: usize, pure_bounds: &DimBounds) -> DimBounds {
    let mut bounds: DimBounds =
        f.args().iter().filter_map(|a| pure_bounds.get(a).map(|b| (a.clone(), b.clone()))).collect();
    if stage > 0
        && let Some(def) = f.stage(stage)
    {
        for rv in &def.schedule.rvars {
            let max = simplify(&rv.min.add(&rv.extent).sub(1));
            bounds.insert(rv.var.clone(), Interval::bounded(simplify(&rv.min), max));
        }
    }
    bounds
}

/// Pure argument bounds of `f` from its box in `regions`.
pub(crate) fn pure_bounds_of(f: &Function, regions: &Regions) -> DimBounds {
    let Some(region) = regions.get(f.name()) else { return DimBounds::new() };
    f.args().iter().cloned().zip(region.iter().cloned()).collect()
}

/// Constant extent of each loop variable, where known.
pub(crate) fn bounds_to_estimates(bounds: &DimBounds) -> BTreeMap<String, Option<i64>> {
    bounds.iter().map(|(var, b)| (var.clone(), interval_extent(b))).collect()
}

// ============================================================================
// Entry point
// ============================================================================

/// Generate a schedule for every function `outputs` depend on.
///
/// The pipeline must be unscheduled: a function with any directive already
/// applied fails with [`Error::PartialSchedule`]. An output dimension without
/// a constant estimate is a soft failure reported as
/// [`AutoScheduleOutcome::MissingEstimates`].
#[tracing::instrument(skip_all)]
pub fn generate_schedules<S: AsRef<str>>(
    outputs: &[S],
    env: &Env,
    params: &MachineParams,
    options: &AutoScheduleOptions,
) -> Result<AutoScheduleOutcome> {
    let outputs: Vec<String> = outputs.iter().map(|o| o.as_ref().to_string()).collect();

    let mut reachable = BTreeSet::new();
    for out in &outputs {
        env.require(out).context(IrSnafu)?;
        reachable.extend(find_transitive_calls(out, env));
    }
    let env: Env = env.iter().filter(|f| reachable.contains(f.name())).cloned().collect();
    let order = realization_order(&outputs, &env).context(IrSnafu)?;

    for name in &order {
        let f = env.require(name).context(IrSnafu)?;
        validate_no_partial_schedules(f, outputs.contains(name))?;
    }

    if let Some((func, var)) = check_estimates_on_outputs(&outputs, &env) {
        warn!(func = %func, var = %var, "output has no constant estimate; skipping auto-scheduling");
        return Ok(AutoScheduleOutcome::MissingEstimates { func, var });
    }

    let analysis = DependenceAnalysis::new(&env, &order);
    let pipeline_bounds = get_pipeline_bounds(&analysis, &outputs);
    let costs = RegionCosts::new(&env, &order);

    let mut part = Partitioner::new(pipeline_bounds, *params, *options, &outputs, analysis, costs);
    part.initialize_groups();
    debug!(groups = part.groups().len(), cost = ?part.pipeline_cost(), "initial grouping");

    part.group(Level::Inline);
    part.clear_grouping_cache();
    part.group(Level::FastMem);
    debug!(groups = part.groups().len(), cost = ?part.pipeline_cost(), "final grouping");

    let mut text = ScheduleText::new(&env, &order);
    part.generate_cpu_schedule(&mut text);
    Ok(AutoScheduleOutcome::Scheduled(text.to_string()))
}
