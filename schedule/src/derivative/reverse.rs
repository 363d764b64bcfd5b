//! Reverse accumulation: per-node rules and propagation into callees.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use kiln_ir::{
    BinOp, Call, CallType, Env, Expr, ExprKind, Function, Intrinsic, Interval, NameGen, ReductionDomain,
    ReductionVariable, Region, VarKind, can_prove, graph_equal, simplify, substitute, substitute_in_all_lets,
    substitute_map,
};
use itertools::Itertools;
use snafu::ResultExt;
use tracing::{debug, trace, warn};

use super::utils::{
    RVarInfo, add_let_expression, find_buffer_param_calls, find_implicit_variables, gather_rvariables,
    gather_variables, has_variable, is_calling_function, is_float_extern, let_bindings, solve_inverse,
    sort_expressions, substitute_rdom_predicate,
};
use super::{FuncKey, buffer_arg_names};
use crate::error::*;

/// Which calls a back-propagation pass sends adjoints to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    /// Collect the local adjoint of self-references without writing anything.
    Probe,
    /// Only self-references of the current function.
    SelfRefs,
    /// Everything except self-references.
    Others,
}

/// State of one differentiation run.
pub(crate) struct ReverseAccumulation<'a> {
    pub(crate) env: &'a Env,
    pub(crate) output: &'a str,
    pub(crate) names: NameGen,
    pub(crate) bounds: BTreeMap<String, Region>,
    /// Adjoint functions by name.
    pub(crate) funcs: BTreeMap<String, Function>,
    /// Name of the adjoint function read and written for each stage.
    pub(crate) adjoints: BTreeMap<FuncKey, String>,
    /// Accumulator behind a bounds-checking wrapper.
    pub(crate) raw: BTreeMap<FuncKey, String>,
    /// Updates that never overwrite a value another iteration reads.
    pub(crate) scans: BTreeSet<FuncKey>,

    // Current stage.
    func: String,
    stage: usize,
    func_args: Vec<String>,
    expr_adjoints: HashMap<u64, Arc<Expr>>,
    lets: HashMap<String, Arc<Expr>>,
    let_order: Vec<String>,
    probe: Option<Arc<Expr>>,
}

/// Sibling of the extern `op_name` (whose base name is `base`) with the same
/// type suffix.
fn sibling(op_name: &str, base: &str, other: &str, ty: kiln_ir::Type, args: Vec<Arc<Expr>>) -> Arc<Expr> {
    let suffix = op_name.strip_prefix(base).unwrap_or("");
    Expr::extern_call(ty, format!("{other}{suffix}"), args)
}

const MATH_EXTERNS: [&str; 18] = [
    "exp", "log", "sqrt", "sin", "asin", "cos", "acos", "tan", "atan", "atan2", "sinh", "cosh", "tanh", "floor",
    "ceil", "round", "trunc", "pow",
];

impl<'a> ReverseAccumulation<'a> {
    pub(crate) fn new(env: &'a Env, output: &'a str, bounds: BTreeMap<String, Region>) -> Self {
        Self {
            env,
            output,
            names: NameGen::new(),
            bounds,
            funcs: BTreeMap::new(),
            adjoints: BTreeMap::new(),
            raw: BTreeMap::new(),
            scans: BTreeSet::new(),
            func: String::new(),
            stage: 0,
            func_args: Vec::new(),
            expr_adjoints: HashMap::new(),
            lets: HashMap::new(),
            let_order: Vec::new(),
            probe: None,
        }
    }

    // ========================================================================
    // Overwrite detection
    // ========================================================================

    /// Classify every self-referencing update of `func`: either its
    /// self-reference contributes a constant local adjoint, or it is a scan
    /// writing each point once, or it overwrites values other stages need.
    pub(crate) fn detect_overwrites(&mut self, func: &Function) -> Result<()> {
        for s in 1..func.num_stages() {
            let Some(stage) = func.stage(s) else { continue };
            if !stage.values.iter().any(|v| is_calling_function(func.name(), v, &HashMap::new())) {
                continue;
            }
            self.enter(func, s);
            let ones: Vec<Arc<Expr>> = stage.values.iter().map(|v| Expr::make_one(v.ty())).collect();
            self.probe = None;
            self.backprop(&stage.values, &ones, Mode::Probe)?;
            let Some(local) = self.probe.take().map(|p| simplify(&p)) else { continue };
            if local.is_zero() || local.is_one() {
                continue;
            }
            let Some(rdom) = &stage.rdom else { continue };

            let args: Vec<Arc<Expr>> = stage.args.iter().map(substitute_in_all_lets).collect();
            let writes_once = rdom.vars().iter().all(|rv| {
                args.iter().any(|arg| {
                    let used: Vec<String> = gather_rvariables(arg).into_keys().collect();
                    if used != [rv.var.clone()] {
                        return false;
                    }
                    let u = Expr::var(self.names.unique("u"));
                    solve_inverse(&u.cmp_eq(arg), &rv.var, &self.names)
                        .is_some_and(|sol| gather_rvariables(&sol).is_empty())
                })
            });
            if !writes_once {
                let consumer = stage
                    .values
                    .iter()
                    .flat_map(kiln_ir::analysis::find_data_accesses)
                    .map(|(name, _)| name)
                    .find(|n| n != func.name())
                    .unwrap_or_else(|| func.name().to_string());
                return OverwriteDependsOnIntermediatesSnafu { func: func.name(), update: s - 1, consumer }.fail();
            }
            debug!(func = func.name(), update = s - 1, local_adjoint = %local, "non-overwriting scan");
            self.scans.insert(FuncKey::stage(func.name(), s));
        }
        Ok(())
    }

    // ========================================================================
    // Accumulators
    // ========================================================================

    fn adjoint_name(func: &str, stage: usize) -> String {
        format!("d_{func}_{stage}")
    }

    /// Zero-initialized accumulators for every stage of `func`, the last
    /// stage of the output seeded from `seed`, plus one accumulator per input
    /// buffer or parameter `func` reads.
    pub(crate) fn create_stubs(&mut self, func: &Function, seed: &Function) -> Result<()> {
        let zeros: Vec<Arc<Expr>> = func.output_types().iter().map(|t| Expr::make_zero(*t)).collect();
        let last = func.num_stages().saturating_sub(1);
        for s in 0..func.num_stages() {
            let name = Self::adjoint_name(func.name(), s);
            let values = if func.name() == self.output && s == last {
                let args: Vec<Arc<Expr>> = func.args().iter().map(|a| Expr::var(a.as_str())).collect();
                (0..seed.outputs()).map(|i| seed.call_value(i, args.clone())).collect()
            } else {
                zeros.clone()
            };
            let stub = Function::pure(name.as_str(), func.args(), values).context(IrSnafu)?;
            self.funcs.insert(name.clone(), stub);
            self.adjoints.insert(FuncKey::stage(func.name(), s), name);
        }

        for (buffer, info) in find_buffer_param_calls(func) {
            if self.env.contains(&buffer) {
                return DerivativeNameConflictSnafu { output: self.output, name: buffer }.fail();
            }
            let key = FuncKey::buffer(&buffer);
            if self.adjoints.contains_key(&key) {
                continue;
            }
            let name = format!("d_{buffer}");
            let args = buffer_arg_names(info.dimensions);
            let stub = Function::pure(name.as_str(), &args, vec![Expr::make_zero(info.ty)]).context(IrSnafu)?;
            trace!(buffer, is_param = info.is_param, "buffer accumulator");
            self.funcs.insert(name.clone(), stub);
            self.adjoints.insert(key, name);
        }
        Ok(())
    }

    /// Replace the last stage's accumulator by a wrapper that is zero
    /// outside the bounds of `func`, so reads past the computed region see
    /// no gradient.
    pub(crate) fn bound_last_stage(&mut self, func: &Function) -> Result<()> {
        let last = func.num_stages() - 1;
        let key = FuncKey::stage(func.name(), last);
        let (Some(raw), Some(region)) = (self.adjoints.get(&key).cloned(), self.bounds.get(func.name())) else {
            return Ok(());
        };
        if func.dimensions() == 0 {
            return Ok(());
        }
        let args: Vec<Arc<Expr>> = func.args().iter().map(|a| Expr::var(a.as_str())).collect();
        let mut inside = Expr::const_true();
        for (arg, interval) in args.iter().zip(region.iter()) {
            if let (Some(min), Some(max)) = (interval.min_expr(), interval.max_expr()) {
                inside = inside.and(arg.cmp_ge(min)).and(arg.cmp_le(max));
            }
        }
        let inside = simplify(&inside);
        let values = func
            .output_types()
            .iter()
            .enumerate()
            .map(|(i, ty)| {
                let read = Expr::func_call(*ty, raw.as_str(), args.clone(), i);
                Expr::select(inside.clone(), read, Expr::make_zero(*ty))
            })
            .collect();
        let name = format!("{raw}_ce");
        let wrapper = Function::pure(name.as_str(), func.args(), values).context(IrSnafu)?;
        self.funcs.insert(name.clone(), wrapper);
        self.raw.insert(key.clone(), raw);
        self.adjoints.insert(key, name);
        Ok(())
    }

    /// Rebuild the accumulator of the stage before update `stage`: it sees
    /// the adjoint of `stage` everywhere except at the points `stage`
    /// overwrites, which contribute only through self-references.
    pub(crate) fn mask_previous_stage(&mut self, func: &Function, stage: usize) -> Result<()> {
        let Some(update) = func.stage(stage) else { return Ok(()) };
        let (Some(current), Some(previous)) = (
            self.adjoints.get(&FuncKey::stage(func.name(), stage)).cloned(),
            self.adjoints.get(&FuncKey::stage(func.name(), stage - 1)).cloned(),
        ) else {
            return Ok(());
        };
        let update_args: Vec<Arc<Expr>> = update.args.iter().map(substitute_in_all_lets).collect();
        let covers_everything = update_args.len() == func.dimensions()
            && update_args
                .iter()
                .zip(func.args())
                .all(|(a, p)| a.var_name() == Some(p.as_str()) && a.reduction_domain().is_none());
        let zeros: Vec<Arc<Expr>> = func.output_types().iter().map(|t| Expr::make_zero(*t)).collect();

        let mut masked = Function::new(previous.as_str());
        if covers_everything {
            masked.define(func.args(), zeros).context(IrSnafu)?;
        } else {
            let args: Vec<Arc<Expr>> = func.args().iter().map(|a| Expr::var(a.as_str())).collect();
            let copy = func
                .output_types()
                .iter()
                .enumerate()
                .map(|(i, ty)| Expr::func_call(*ty, current.as_str(), args.clone(), i))
                .collect();
            masked.define(func.args(), copy).context(IrSnafu)?;
            masked.define_update(update_args, zeros).context(IrSnafu)?;
        }
        trace!(func = func.name(), stage, covers_everything, "masked previous stage");
        self.funcs.insert(previous, masked);
        Ok(())
    }

    // ========================================================================
    // Expression-level back-propagation
    // ========================================================================

    fn enter(&mut self, func: &Function, stage: usize) {
        self.func = func.name().to_string();
        self.stage = stage;
        self.func_args = func.args().to_vec();
    }

    /// Back-propagate the adjoints of one stage of `func`.
    pub(crate) fn propagate_stage(&mut self, func: &Function, stage: usize) -> Result<()> {
        let Some(definition) = func.stage(stage) else { return Ok(()) };
        self.enter(func, stage);
        let key = FuncKey::stage(func.name(), stage);
        let update_args: Vec<Arc<Expr>> = definition.args.iter().map(substitute_in_all_lets).collect();
        let seeds_from = |name: &str| -> Vec<Arc<Expr>> {
            func.output_types()
                .iter()
                .enumerate()
                .map(|(i, ty)| Expr::func_call(*ty, name, update_args.clone(), i))
                .collect()
        };
        let Some(adjoint) = self.adjoints.get(&key).cloned() else { return Ok(()) };

        let self_referencing = definition.values.iter().any(|v| is_calling_function(func.name(), v, &HashMap::new()));
        if self_referencing {
            let read = if self.scans.contains(&key) {
                self.raw.get(&key).cloned().unwrap_or(adjoint.clone())
            } else {
                adjoint.clone()
            };
            self.backprop(&definition.values, &seeds_from(&read), Mode::SelfRefs)?;
        }
        self.backprop(&definition.values, &seeds_from(&adjoint), Mode::Others)
    }

    fn backprop(&mut self, values: &[Arc<Expr>], seeds: &[Arc<Expr>], mode: Mode) -> Result<()> {
        self.expr_adjoints.clear();
        let (lets, order) = let_bindings(values);
        self.lets = lets;
        self.let_order = order;
        for (value, seed) in values.iter().zip(seeds) {
            self.accumulate(value, seed.clone());
        }
        for e in sort_expressions(values).iter().rev() {
            let Some(adjoint) = self.expr_adjoints.get(&e.id).cloned() else { continue };
            self.visit(e, &adjoint, mode)?;
        }
        Ok(())
    }

    fn accumulate(&mut self, e: &Arc<Expr>, adjoint: Arc<Expr>) {
        let entry = self.expr_adjoints.entry(e.id);
        entry.and_modify(|acc| *acc = acc.add(&adjoint)).or_insert(adjoint);
    }

    fn visit(&mut self, e: &Arc<Expr>, adjoint: &Arc<Expr>, mode: Mode) -> Result<()> {
        let zero = || Expr::make_zero(adjoint.ty());
        match e.kind() {
            ExprKind::Const(_) | ExprKind::StringImm(_) | ExprKind::Reinterpret(_) | ExprKind::Not(_) => {}
            ExprKind::Variable(v) => {
                if let Some(value) = self.lets.get(&v.name).cloned() {
                    self.accumulate(&value, adjoint.clone());
                } else if matches!(v.kind, VarKind::Param) && mode == Mode::Others {
                    self.propagate_to(&v.name, 0, &[], adjoint)?;
                }
            }
            ExprKind::Cast(a) => {
                if e.ty().is_float() && a.ty().is_float() {
                    self.accumulate(a, adjoint.cast(a.ty()));
                }
            }
            ExprKind::Binary(op, a, b) => {
                match op {
                    BinOp::Add => {
                        self.accumulate(a, adjoint.clone());
                        self.accumulate(b, adjoint.clone());
                    }
                    BinOp::Sub => {
                        self.accumulate(a, adjoint.clone());
                        self.accumulate(b, adjoint.neg());
                    }
                    BinOp::Mul => {
                        self.accumulate(a, adjoint.mul(b));
                        self.accumulate(b, adjoint.mul(a));
                    }
                    BinOp::Div => {
                        self.accumulate(a, adjoint.div(b));
                        self.accumulate(b, adjoint.neg().mul(a).div(b.mul(b)));
                    }
                    BinOp::Min => {
                        let first = a.cmp_le(b);
                        self.accumulate(a, Expr::select(first.clone(), adjoint.clone(), zero()));
                        self.accumulate(b, Expr::select(first, zero(), adjoint.clone()));
                    }
                    BinOp::Max => {
                        let first = a.cmp_ge(b);
                        self.accumulate(a, Expr::select(first.clone(), adjoint.clone(), zero()));
                        self.accumulate(b, Expr::select(first, zero(), adjoint.clone()));
                    }
                    // Discrete results carry no gradient.
                    _ => {}
                }
            }
            ExprKind::Select(c, t, f) => {
                self.accumulate(t, Expr::select(c.clone(), adjoint.clone(), zero()));
                self.accumulate(f, Expr::select(c.clone(), zero(), adjoint.clone()));
            }
            ExprKind::Let { body, .. } => self.accumulate(body, adjoint.clone()),
            ExprKind::Call(c) => self.visit_call(e, c, adjoint, mode)?,
            ExprKind::Load(_)
            | ExprKind::Ramp { .. }
            | ExprKind::Broadcast { .. }
            | ExprKind::Shuffle { .. }
            | ExprKind::VectorReduce { .. } => {
                panic!("unexpected {e} in a function definition being differentiated")
            }
        }
        Ok(())
    }

    fn visit_call(&mut self, e: &Arc<Expr>, c: &Call, adjoint: &Arc<Expr>, mode: Mode) -> Result<()> {
        match c.call_type {
            CallType::Halide | CallType::Image => {
                let is_self = c.call_type == CallType::Halide && c.name == self.func;
                match mode {
                    Mode::Probe if is_self => {
                        self.probe = Some(match self.probe.take() {
                            Some(p) => p.add(adjoint),
                            None => adjoint.clone(),
                        });
                    }
                    Mode::SelfRefs if is_self => self.propagate_to(&c.name, c.value_index, &c.args, adjoint)?,
                    Mode::Others if !is_self => self.propagate_to(&c.name, c.value_index, &c.args, adjoint)?,
                    _ => {}
                }
            }
            CallType::Extern | CallType::PureExtern => self.visit_math(e, c, adjoint)?,
            CallType::Intrinsic | CallType::PureIntrinsic => self.visit_intrinsic(c, adjoint),
        }
        Ok(())
    }

    fn visit_math(&mut self, e: &Arc<Expr>, c: &Call, adjoint: &Arc<Expr>) -> Result<()> {
        let Some(base) = MATH_EXTERNS.iter().copied().find(|b| is_float_extern(&c.name, b)) else {
            return UnknownExternDerivativeSnafu { name: c.name.clone() }.fail();
        };
        let ty = e.ty();
        let x = &c.args[0];
        let call = |other: &str, args: Vec<Arc<Expr>>| sibling(&c.name, base, other, ty, args);
        let one = Expr::make_one(ty);
        match base {
            "exp" => self.accumulate(x, adjoint.mul(e)),
            "log" => self.accumulate(x, adjoint.div(x)),
            "sqrt" => self.accumulate(x, adjoint.div(e.mul(2.0))),
            "sin" => self.accumulate(x, adjoint.mul(call("cos", vec![x.clone()]))),
            "cos" => self.accumulate(x, adjoint.neg().mul(call("sin", vec![x.clone()]))),
            "tan" => {
                let cos = call("cos", vec![x.clone()]);
                self.accumulate(x, adjoint.div(cos.mul(&cos)));
            }
            "asin" => self.accumulate(x, adjoint.div(call("sqrt", vec![one.sub(x.mul(x))]))),
            "acos" => self.accumulate(x, adjoint.neg().div(call("sqrt", vec![one.sub(x.mul(x))]))),
            "atan" => self.accumulate(x, adjoint.div(one.add(x.mul(x)))),
            "atan2" => {
                let (y, x) = (&c.args[0], &c.args[1]);
                let norm = x.mul(x).add(y.mul(y));
                self.accumulate(y, adjoint.mul(x).div(&norm));
                self.accumulate(x, adjoint.neg().mul(y).div(&norm));
            }
            "sinh" => self.accumulate(x, adjoint.mul(call("cosh", vec![x.clone()]))),
            "cosh" => self.accumulate(x, adjoint.mul(call("sinh", vec![x.clone()]))),
            "tanh" => {
                let cosh = call("cosh", vec![x.clone()]);
                self.accumulate(x, adjoint.div(cosh.mul(&cosh)));
            }
            "pow" => {
                let y = &c.args[1];
                let dx = adjoint.mul(y).mul(call("pow", vec![x.clone(), y.sub(1.0)]));
                let dy = adjoint.mul(e).mul(call("log", vec![x.clone()]));
                self.accumulate(x, dx);
                self.accumulate(y, Expr::select(x.cmp_eq(0.0), Expr::make_zero(ty), dy));
            }
            // Piecewise constant.
            _ => {}
        }
        Ok(())
    }

    fn visit_intrinsic(&mut self, c: &Call, adjoint: &Arc<Expr>) {
        match c.intrinsic() {
            Some(Intrinsic::Abs) => {
                let x = &c.args[0];
                let sign = Expr::select(x.cmp_gt(0), Expr::make_one(x.ty()), Expr::make_const(x.ty(), -1));
                self.accumulate(x, adjoint.cast(x.ty()).mul(sign));
            }
            Some(Intrinsic::Lerp) => {
                let (a, b, w) = (&c.args[0], &c.args[1], &c.args[2]);
                let w = w.cast(adjoint.ty());
                self.accumulate(a, adjoint.mul(Expr::make_one(adjoint.ty()).sub(&w)));
                self.accumulate(b, adjoint.mul(&w));
                self.accumulate(&c.args[2], adjoint.mul(b.sub(a)).cast(c.args[2].ty()));
            }
            Some(Intrinsic::Likely | Intrinsic::LikelyIfInnermost | Intrinsic::PromiseClamped) => {
                self.accumulate(&c.args[0], adjoint.clone());
            }
            Some(Intrinsic::ReturnSecond) => self.accumulate(&c.args[1], adjoint.clone()),
            Some(Intrinsic::Undef) => {}
            _ => warn!(intrinsic = %c.name, "no derivative known; dropping its gradient"),
        }
    }

    // ========================================================================
    // Propagation into a callee
    // ========================================================================

    /// Target accumulator of a call to `name` from the current stage.
    fn target(&self, name: &str) -> (FuncKey, String, bool) {
        let (key, reads_raw) = if name == self.func {
            let scan = self.scans.contains(&FuncKey::stage(&self.func, self.stage));
            let stage = if scan { self.stage } else { self.stage - 1 };
            (FuncKey::stage(name, stage), scan)
        } else if let Some(f) = self.env.lookup(name) {
            (FuncKey::stage(name, f.num_stages() - 1), false)
        } else {
            (FuncKey::buffer(name), false)
        };
        let accumulator =
            if reads_raw { self.raw.get(&key).or_else(|| self.adjoints.get(&key)) } else { self.adjoints.get(&key) };
        let accumulator = accumulator.unwrap_or_else(|| panic!("no accumulator for {name}")).clone();
        (key, accumulator, reads_raw)
    }

    /// Add `adjoint` to the accumulator of `name` at `call_args`.
    ///
    /// The call's arguments are rewritten into the accumulator's own
    /// coordinates: each argument depending on a single pure variable is
    /// inverted; other pure variables become reduction variables over the
    /// current function's bounds. All reduction variables involved are
    /// merged into one domain.
    fn propagate_to(
        &mut self,
        name: &str,
        value_index: usize,
        call_args: &[Arc<Expr>],
        adjoint: &Arc<Expr>,
    ) -> Result<()> {
        let (key, accumulator, scan) = self.target(name);
        let mut adjoint = add_let_expression(adjoint, &self.lets, &self.let_order);
        let mut lhs: Vec<Arc<Expr>> = call_args
            .iter()
            .map(|a| substitute_in_all_lets(&add_let_expression(a, &self.lets, &self.let_order)))
            .collect();
        let old_domains: HashSet<u64> = lhs
            .iter()
            .chain(std::iter::once(&adjoint))
            .flat_map(gather_rvariables)
            .map(|(_, i)| i.domain.id())
            .collect();

        // Bounds of every variable that may be replaced by a reduction.
        let target_bounds = self.bounds.get(&key.func).cloned().unwrap_or_default();
        let current_bounds = self.bounds.get(&self.func).cloned().unwrap_or_default();
        let mut var_bounds: BTreeMap<String, Interval> =
            self.func_args.iter().cloned().zip(current_bounds.bounds.iter().cloned()).collect();
        for implicit in lhs.iter().flat_map(find_implicit_variables) {
            if let Some(pos) = lhs.iter().position(|a| a.var_name() == Some(implicit.as_str()))
                && let Some(interval) = target_bounds.bounds.get(pos)
            {
                var_bounds.insert(implicit, interval.clone());
            }
        }
        let pure_vars: Vec<String> = var_bounds.keys().cloned().collect();

        let new_args: Vec<String> = (0..lhs.len()).map(|_| self.names.unique("u")).collect();
        let mut canonical = vec![false; lhs.len()];
        for i in 0..lhs.len() {
            let vars = gather_variables(&lhs[i], &pure_vars);
            let [var] = vars.as_slice() else { continue };
            let equation = Expr::var(new_args[i].as_str()).cmp_eq(&lhs[i]);
            let Some(solution) = solve_inverse(&equation, var, &self.names) else { continue };
            adjoint = substitute_rdom_predicate(var, &solution, &adjoint);
            for j in (0..lhs.len()).filter(|&j| j != i && !canonical[j]) {
                lhs[j] = substitute_rdom_predicate(var, &solution, &lhs[j]);
            }
            lhs[i] = Expr::var(new_args[i].as_str());
            canonical[i] = true;
        }

        // Pure variables left anywhere range over the current bounds.
        let remaining: Vec<String> = pure_vars
            .iter()
            .filter(|v| has_variable(&adjoint, v) || lhs.iter().any(|a| has_variable(a, v)))
            .cloned()
            .collect();
        if !remaining.is_empty() {
            let vars = remaining
                .iter()
                .map(|v| {
                    let interval = &var_bounds[v];
                    let (Some(min), Some(max)) = (interval.min_expr(), interval.max_expr()) else {
                        panic!("bounds of {v} were checked when they were inferred");
                    };
                    ReductionVariable {
                        var: self.names.unique(&format!("{v}_r")),
                        min: min.clone(),
                        extent: simplify(&max.sub(min).add(1)),
                    }
                })
                .collect();
            let rdom = ReductionDomain::new(vars);
            let map: HashMap<String, Arc<Expr>> =
                remaining.iter().enumerate().map(|(k, v)| (v.clone(), rdom.var(k))).collect();
            adjoint = substitute_map(&map, &adjoint);
            for arg in lhs.iter_mut() {
                *arg = substitute_map(&map, arg);
            }
            trace!(vars = ?remaining, "scattering over current bounds");
        }

        if !scan {
            self.gather_scatters(&mut lhs, &mut adjoint, &canonical, &new_args, &target_bounds);
        }
        self.merge_domains(&mut lhs, &mut adjoint, &old_domains, scan);

        let target_args: Vec<String> = match self.env.lookup(&key.func) {
            Some(f) => f.args().to_vec(),
            None => buffer_arg_names(lhs.len()),
        };
        for (u, arg) in new_args.iter().zip(&target_args) {
            let replacement = Expr::var(arg.as_str());
            adjoint = substitute_rdom_predicate(u, &replacement, &adjoint);
            for a in lhs.iter_mut() {
                *a = substitute_rdom_predicate(u, &replacement, a);
            }
        }
        let adjoint = simplify(&adjoint);
        let lhs: Vec<Arc<Expr>> = lhs.iter().map(simplify).collect();
        let shown: Vec<String> = lhs.iter().map(ToString::to_string).collect();
        trace!(%accumulator, lhs = ?shown, adjoint = %adjoint, "propagate");
        self.add_to(&accumulator, &target_args, value_index, lhs, adjoint)
    }

    /// Turn reduction variables that merely enumerate the target's bounds
    /// back into pure variables.
    fn gather_scatters(
        &self,
        lhs: &mut [Arc<Expr>],
        adjoint: &mut Arc<Expr>,
        canonical: &[bool],
        new_args: &[String],
        target_bounds: &Region,
    ) {
        for i in 0..lhs.len() {
            if canonical[i] {
                continue;
            }
            let Some(target) = target_bounds.bounds.get(i) else { continue };
            let (Some(tmin), Some(tmax)) = (target.min_expr(), target.max_expr()) else { continue };
            let rvars = gather_rvariables(&lhs[i]);
            let used_elsewhere = |name: &str| lhs.iter().enumerate().any(|(j, a)| j != i && has_variable(a, name));
            let free_of_predicate = |info: &RVarInfo| !has_variable(info.domain.predicate(), &info.name);
            let u = Expr::var(new_args[i].as_str());

            // f(r) with r covering the target's bounds.
            if let Some(name) = lhs[i].var_name().map(str::to_string)
                && let Some(info) = rvars.get(&name)
                && !used_elsewhere(&name)
                && free_of_predicate(info)
            {
                let covers = info.min.cmp_le(tmin).and(info.min.add(&info.extent).sub(1).cmp_ge(tmax));
                if can_prove(&covers) {
                    *adjoint = substitute(&name, &u, adjoint);
                    lhs[i] = u;
                    debug!(rvar = %name, "scatter over the whole target becomes a pure update");
                }
                continue;
            }

            // f(s*r.x + r.y) with r.y in [0, s): downsampling.
            if rvars.len() != 2 {
                continue;
            }
            let Some((outer, inner, factor)) = Self::match_downsample(&lhs[i], &rvars) else { continue };
            if used_elsewhere(&outer.name) || used_elsewhere(&inner.name) {
                continue;
            }
            if !free_of_predicate(&outer) || !free_of_predicate(&inner) {
                continue;
            }
            let covers = outer
                .min
                .mul(factor)
                .cmp_le(tmin)
                .and(outer.min.add(&outer.extent).mul(factor).sub(1).cmp_ge(tmax));
            if !can_prove(&covers) {
                continue;
            }
            *adjoint = substitute(&outer.name, &u.div(factor), adjoint);
            *adjoint = substitute(&inner.name, &u.modulo(factor), adjoint);
            lhs[i] = u;
            debug!(factor, "downsampling scatter becomes a pure update");
        }
    }

    /// Match `s*outer + inner` (in either order) where `inner` spans `[0, s)`.
    fn match_downsample(e: &Arc<Expr>, rvars: &BTreeMap<String, RVarInfo>) -> Option<(RVarInfo, RVarInfo, i64)> {
        let (a, b) = e.as_op(kiln_ir::BinOp::Add)?;
        let scaled = |x: &Arc<Expr>| -> Option<(String, i64)> {
            let (p, q) = x.as_op(kiln_ir::BinOp::Mul)?;
            match (p.var_name(), q.as_int(), q.var_name(), p.as_int()) {
                (Some(v), Some(s), _, _) | (_, _, Some(v), Some(s)) => Some((v.to_string(), s)),
                _ => None,
            }
        };
        let ((outer, factor), inner) = match (scaled(a), scaled(b)) {
            (Some(s), None) => (s, b.var_name()?),
            (None, Some(s)) => (s, a.var_name()?),
            _ => return None,
        };
        let (outer, inner) = (rvars.get(&outer)?.clone(), rvars.get(inner)?.clone());
        (inner.min.is_zero() && inner.extent.as_int() == Some(factor)).then_some((outer, inner, factor))
    }

    /// Replace every reduction variable of `lhs` and `adjoint` by a variable
    /// of one fresh domain. New variables come first, then carried-over
    /// ones. A scan iterates its domain backwards.
    fn merge_domains(&self, lhs: &mut [Arc<Expr>], adjoint: &mut Arc<Expr>, old: &HashSet<u64>, reverse: bool) {
        let infos: Vec<RVarInfo> = lhs
            .iter()
            .chain(std::iter::once(&*adjoint))
            .flat_map(gather_rvariables)
            .map(|(_, i)| i)
            .sorted_by_key(|i| (old.contains(&i.domain.id()), i.domain.id(), i.index))
            .dedup_by(|a, b| a.name == b.name)
            .collect();
        if infos.is_empty() {
            return;
        }

        let merged = ReductionDomain::new(
            infos
                .iter()
                .map(|i| ReductionVariable {
                    var: self.names.unique("r"),
                    min: i.min.clone(),
                    extent: i.extent.clone(),
                })
                .collect(),
        );
        let replacements = |domain: &ReductionDomain| -> HashMap<String, Arc<Expr>> {
            infos
                .iter()
                .enumerate()
                .map(|(k, info)| {
                    let var = domain.var(k);
                    let value = if reverse { info.min.mul(2).add(&info.extent).sub(1).sub(&var) } else { var };
                    (info.name.clone(), value)
                })
                .collect()
        };

        let mut seen = HashSet::new();
        let mut predicate = Expr::const_true();
        for info in &infos {
            if seen.insert(info.domain.id()) && !info.domain.predicate().is_true() {
                predicate = predicate.and(info.domain.predicate());
            }
        }
        let merged = if predicate.is_true() {
            merged
        } else {
            merged.with_predicate(simplify(&substitute_map(&replacements(&merged), &predicate)))
        };
        let map = replacements(&merged);
        *adjoint = substitute_map(&map, adjoint);
        for a in lhs.iter_mut() {
            *a = substitute_map(&map, a);
        }
        trace!(vars = infos.len(), reverse, "merged reduction domains");
    }

    /// Add `adjoint` to tuple element `value_index` of `accumulator` at
    /// `lhs`, folding it into the last definition when that writes the same
    /// points.
    fn add_to(
        &mut self,
        accumulator: &str,
        target_args: &[String],
        value_index: usize,
        lhs: Vec<Arc<Expr>>,
        adjoint: Arc<Expr>,
    ) -> Result<()> {
        let Some(func) = self.funcs.get_mut(accumulator) else {
            panic!("accumulator {accumulator} was never created");
        };
        let adjoint_rvars = gather_rvariables(&adjoint);
        let lhs_rvars: BTreeSet<String> = lhs.iter().flat_map(gather_rvariables).map(|(n, _)| n).collect();
        let is_pure_lhs = lhs.len() == target_args.len()
            && lhs.iter().zip(target_args).all(|(a, p)| a.var_name() == Some(p.as_str()));
        let calls_itself = is_calling_function(accumulator, &adjoint, &HashMap::new());

        let overwrites = is_pure_lhs && adjoint_rvars.is_empty() && lhs_rvars.is_empty() && !calls_itself;
        if !func.has_update_definition() && overwrites {
            if let Some(def) = func.definition_mut() {
                let value = &mut def.values[value_index];
                *value = simplify(&value.add(&adjoint));
                return Ok(());
            }
        }

        let last = func.updates().len();
        if last > 0
            && let Some(update) = func.update_mut(last - 1)
            && is_calling_function(accumulator, &update.values[value_index], &HashMap::new())
            && let Some(renamed) = Self::rename_into(update, &adjoint, &lhs)
        {
            let value = &mut update.values[value_index];
            *value = simplify(&value.add(&renamed));
            return Ok(());
        }

        let values: Vec<Arc<Expr>> = (0..func.outputs())
            .map(|j| {
                let current = func.call_value(j, lhs.clone());
                if j == value_index { current.add(&adjoint) } else { current }
            })
            .collect();
        func.define_update(lhs, values).context(IrSnafu)?;
        Ok(())
    }

    /// `adjoint` rewritten over the reduction domain of `update`, when
    /// `update` writes exactly the points `lhs` does.
    fn rename_into(update: &kiln_ir::Definition, adjoint: &Arc<Expr>, lhs: &[Arc<Expr>]) -> Option<Arc<Expr>> {
        let mine: Vec<RVarInfo> = lhs
            .iter()
            .chain(std::iter::once(adjoint))
            .flat_map(gather_rvariables)
            .map(|(_, i)| i)
            .sorted_by_key(|i| i.index)
            .dedup_by(|a, b| a.name == b.name)
            .collect();
        let (map, domain_matches) = match (&update.rdom, mine.first()) {
            (None, None) => (HashMap::new(), true),
            (Some(theirs), Some(first)) => {
                let ours = &first.domain;
                let same_shape = theirs.dimensions() == ours.dimensions()
                    && theirs.predicate().is_true()
                    && ours.predicate().is_true()
                    && theirs.vars().iter().zip(ours.vars()).all(|(a, b)| {
                        graph_equal(&a.min, &b.min) && graph_equal(&a.extent, &b.extent)
                    });
                let map: HashMap<String, Arc<Expr>> =
                    ours.vars().iter().enumerate().map(|(k, v)| (v.var.clone(), theirs.var(k))).collect();
                (map, same_shape)
            }
            _ => return None,
        };
        if !domain_matches {
            return None;
        }
        let same_lhs = update.args.len() == lhs.len()
            && update.args.iter().zip(lhs).all(|(a, b)| graph_equal(a, &substitute_map(&map, b)));
        same_lhs.then(|| substitute_map(&map, adjoint))
    }
}
