//! Automatic differentiation of pipelines.
//!
//! [`propagate_adjoints`] builds, for every stage of every function an
//! output depends on, an adjoint function holding the derivative of the
//! output with respect to that stage's values. Input buffers and scalar
//! parameters get one adjoint function each.
//!
//! The pass runs in three steps:
//!
//! 1. Every update reading its own function is checked for in-place
//!    overwrites. Updates whose self-reference has a non-constant local
//!    derivative must write each point once (a scan); anything else is an
//!    error, since the overwritten intermediates are gone.
//! 2. Zero accumulators are created for every stage, the output's last stage
//!    seeded with the caller's adjoint.
//! 3. Functions are visited consumers first and stages last to first. Each
//!    stage pushes its adjoint through its expression, node by node, and
//!    adds the result to the accumulators of whatever it reads. Coordinates
//!    are rewritten into the callee's own variables by inverting the call
//!    arguments; what cannot be inverted becomes a scatter over a
//!    reduction domain.
//!
//! [`propagate_tangents`] is the forward-mode counterpart.
//!
//! # Module Organization
//!
//! - [`reverse`] - Per-node rules and propagation into callees
//! - [`forward`] - Forward-mode tangents
//! - [`utils`] - Variable gathering, bounds inference, inversion helpers

use std::collections::BTreeMap;
use std::sync::Arc;

use kiln_ir::func::realization_order;
use kiln_ir::{Env, Expr, Function, Region};
use snafu::ResultExt;
use tracing::debug;

use crate::error::*;

pub mod forward;
pub(crate) mod reverse;
pub mod utils;

pub use forward::{forward_accumulation, propagate_tangents};
use reverse::ReverseAccumulation;
pub use utils::inference_bounds;

/// Stage of a function, or an input buffer or parameter (stage 0).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FuncKey {
    pub func: String,
    /// 0 is the pure definition, `i > 0` is update `i - 1`.
    pub stage: usize,
}

impl FuncKey {
    pub fn stage(func: impl Into<String>, stage: usize) -> Self {
        Self { func: func.into(), stage }
    }

    pub fn buffer(name: impl Into<String>) -> Self {
        Self { func: name.into(), stage: 0 }
    }
}

/// Argument names of the adjoint of an input buffer.
pub(crate) fn buffer_arg_names(dims: usize) -> Vec<String> {
    const NAMES: [&str; 4] = ["x", "y", "z", "w"];
    (0..dims).map(|i| NAMES.get(i).map_or_else(|| format!("v{i}"), |n| n.to_string())).collect()
}

/// Adjoint functions of a pipeline with respect to one output.
#[derive(Debug, Clone)]
pub struct Derivative {
    output: String,
    adjoints: BTreeMap<FuncKey, String>,
    bounds: BTreeMap<String, Region>,
    regions: BTreeMap<String, Region>,
    env: Env,
}

impl Derivative {
    pub fn output(&self) -> &str {
        &self.output
    }

    /// Adjoint of `func`'s pure definition (`update == None`) or of one of
    /// its updates.
    pub fn get(&self, func: &str, update: Option<usize>) -> Option<&Function> {
        let stage = update.map_or(0, |u| u + 1);
        self.adjoints.get(&FuncKey::stage(func, stage)).and_then(|name| self.env.lookup(name))
    }

    /// Adjoint of an input buffer or scalar parameter.
    pub fn get_buffer(&self, name: &str) -> Option<&Function> {
        if self.env.lookup(name).is_some_and(|f| f.has_pure_definition()) {
            return None;
        }
        self.adjoints.get(&FuncKey::buffer(name)).and_then(|n| self.env.lookup(n))
    }

    /// Original functions, the seed and every adjoint function.
    pub fn env(&self) -> &Env {
        &self.env
    }

    /// Region over which `func` or an input is needed to compute the output.
    pub fn bounds(&self, name: &str) -> Option<&Region> {
        self.bounds.get(name)
    }

    /// Region over which the adjoint function `name` should be computed.
    pub fn adjoint_region(&self, name: &str) -> Option<&Region> {
        self.regions.get(name)
    }

    /// Names of every adjoint function, in no particular order.
    pub fn adjoint_names(&self) -> impl Iterator<Item = &str> {
        self.regions.keys().map(String::as_str)
    }
}

/// Differentiate `output` with respect to everything it reads.
///
/// `adjoint` is the derivative of the final loss with respect to `output`
/// and must have as many dimensions and values as `output`.
/// `output_bounds` gives the inclusive `(min, max)` of each dimension of
/// `output` the loss depends on.
#[tracing::instrument(skip_all, fields(output = output))]
pub fn propagate_adjoints(
    env: &Env,
    output: &str,
    adjoint: &Function,
    output_bounds: &[(Arc<Expr>, Arc<Expr>)],
) -> Result<Derivative> {
    let out = env.require(output).context(IrSnafu)?;
    assert_eq!(adjoint.dimensions(), out.dimensions(), "adjoint of {output} has the wrong dimensionality");
    assert_eq!(adjoint.outputs(), out.outputs(), "adjoint of {output} has the wrong number of values");

    let order = realization_order(&[output], env).context(IrSnafu)?;
    let bounds = inference_bounds(env, &order, output, output_bounds)?;
    let mut acc = ReverseAccumulation::new(env, output, bounds);

    for name in &order {
        let func = env.require(name).context(IrSnafu)?;
        acc.detect_overwrites(func)?;
    }
    for name in &order {
        acc.create_stubs(env.require(name).context(IrSnafu)?, adjoint)?;
    }

    for name in order.iter().rev() {
        let func = env.require(name).context(IrSnafu)?;
        if !func.has_pure_definition() {
            continue;
        }
        for stage in (0..func.num_stages()).rev() {
            if stage + 1 == func.num_stages() {
                acc.bound_last_stage(func)?;
            }
            if stage > 0 {
                acc.mask_previous_stage(func, stage)?;
            }
            acc.propagate_stage(func, stage)?;
        }
        debug!(func = %name, stages = func.num_stages(), "propagated");
    }

    let mut regions = BTreeMap::new();
    for (key, name) in acc.adjoints.iter().chain(acc.raw.iter()) {
        let region = acc.bounds.get(&key.func).cloned().unwrap_or_default();
        regions.insert(name.clone(), region);
    }
    let mut full = env.clone();
    full.insert(adjoint.clone());
    for f in acc.funcs.into_values() {
        full.insert(f);
    }
    Ok(Derivative { output: output.to_string(), adjoints: acc.adjoints, bounds: acc.bounds, regions, env: full })
}

/// Differentiate a scalar output, seeding it with 1.
pub fn propagate_adjoints_scalar(env: &Env, output: &str) -> Result<Derivative> {
    let out = env.require(output).context(IrSnafu)?;
    let ones = out.output_types().iter().map(|t| Expr::make_one(*t)).collect();
    let seed = Function::pure(format!("{output}_seed"), out.args(), ones).context(IrSnafu)?;
    let bounds: Vec<(Arc<Expr>, Arc<Expr>)> = (0..out.dimensions()).map(|_| (Expr::int(0), Expr::int(0))).collect();
    propagate_adjoints(env, output, &seed, &bounds)
}
