//! Helpers shared by reverse and forward differentiation.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use kiln_ir::visit::{Visitor, for_each_expr, rewrite_expr, walk_expr};
use kiln_ir::{
    CallType, Env, Expr, ExprKind, Interval, NameGen, ReductionDomain, ReductionVariable, Region, Scope, Type,
    VarKind, box_union, boxes_required, common_subexpression_elimination, expr_uses_var, simplify, substitute,
};
use tracing::trace;

use crate::error::*;
use crate::solve::solve_for_outer_interval;

/// `e` mentions a free variable called `name`.
pub fn has_variable(e: &Arc<Expr>, name: &str) -> bool {
    expr_uses_var(e, name)
}

/// Variables of `e` that appear in `filter`, in order of first occurrence.
pub fn gather_variables<S: AsRef<str>>(e: &Arc<Expr>, filter: &[S]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for_each_expr(e, |node| {
        if let Some(name) = node.var_name()
            && filter.iter().any(|f| f.as_ref() == name)
            && !out.iter().any(|o| o == name)
        {
            out.push(name.to_string());
        }
        true
    });
    out
}

/// Position of a reduction variable inside its domain.
#[derive(Debug, Clone)]
pub struct RVarInfo {
    pub name: String,
    pub min: Arc<Expr>,
    pub extent: Arc<Expr>,
    pub index: usize,
    pub domain: ReductionDomain,
}

/// Every reduction variable referenced by `e`, keyed by name.
pub fn gather_rvariables(e: &Arc<Expr>) -> BTreeMap<String, RVarInfo> {
    let mut out = BTreeMap::new();
    for_each_expr(e, |node| {
        if let Some(rdom) = node.reduction_domain()
            && let Some(name) = node.var_name()
            && let Some(index) = rdom.vars().iter().position(|v| v.var == name)
        {
            let rv = &rdom.vars()[index];
            out.entry(name.to_string()).or_insert_with(|| RVarInfo {
                name: name.to_string(),
                min: rv.min.clone(),
                extent: rv.extent.clone(),
                index,
                domain: rdom.clone(),
            });
        }
        true
    });
    out
}

/// Wrap `e` in the lets from `lets` it needs, looking through lets whose
/// values use other lets. `order` lists let names outermost first.
pub fn add_let_expression(e: &Arc<Expr>, lets: &HashMap<String, Arc<Expr>>, order: &[String]) -> Arc<Expr> {
    let mut out = e.clone();
    for name in order.iter().rev() {
        if let Some(value) = lets.get(name)
            && expr_uses_var(&out, name)
        {
            out = Expr::let_in(name.clone(), value.clone(), out);
        }
    }
    out
}

/// Nodes of `exprs` ordered so every node comes after its operands.
///
/// Each node instance appears once. A variable bound by a `Let` comes after
/// the let's value, so reverse traversal reaches all uses of a let-bound
/// value before the value itself.
pub fn sort_expressions(exprs: &[Arc<Expr>]) -> Vec<Arc<Expr>> {
    struct Sorter {
        seen: HashSet<u64>,
        order: Vec<Arc<Expr>>,
    }
    impl Visitor for Sorter {
        fn visit_expr(&mut self, e: &Arc<Expr>) {
            if self.seen.contains(&e.id) {
                return;
            }
            walk_expr(self, e);
            self.seen.insert(e.id);
            self.order.push(e.clone());
        }
    }
    let mut sorter = Sorter { seen: HashSet::new(), order: Vec::new() };
    for e in exprs {
        sorter.visit_expr(e);
    }
    sorter.order
}

/// Let bindings of `exprs` by name, and their names outermost first.
pub fn let_bindings(exprs: &[Arc<Expr>]) -> (HashMap<String, Arc<Expr>>, Vec<String>) {
    let mut map = HashMap::new();
    let mut order = Vec::new();
    for e in exprs {
        for_each_expr(e, |node| {
            if let ExprKind::Let { name, value, .. } = node.kind()
                && map.insert(name.clone(), value.clone()).is_none()
            {
                order.push(name.clone());
            }
            true
        });
    }
    (map, order)
}

/// Regions of every function and input buffer needed to compute `output`
/// over `output_bounds`, given as inclusive `(min, max)` per dimension.
///
/// `order` is the realization order of the pipeline (producers first).
/// Fails when some access cannot be bounded.
pub fn inference_bounds(
    env: &Env,
    order: &[String],
    output: &str,
    output_bounds: &[(Arc<Expr>, Arc<Expr>)],
) -> Result<BTreeMap<String, Region>> {
    let mut bounds: BTreeMap<String, Region> = BTreeMap::new();
    bounds.insert(
        output.to_string(),
        output_bounds.iter().map(|(min, max)| Interval::bounded(min.clone(), max.clone())).collect(),
    );

    for name in order.iter().rev() {
        let Some(func) = env.lookup(name) else { continue };
        let Some(region) = bounds.get(name).cloned() else { continue };
        let mut scope: Scope<Interval> = Scope::new();
        for (arg, interval) in func.args().iter().zip(region.iter()) {
            scope.push(arg.as_str(), interval.clone());
        }
        for stage in func.stages() {
            let mut stage_scope = scope.clone();
            if let Some(rdom) = &stage.rdom {
                for rv in rdom.vars() {
                    let max = simplify(&rv.min.add(&rv.extent).sub(1));
                    stage_scope.push(rv.var.as_str(), Interval::bounded(rv.min.clone(), max));
                }
            }
            for e in stage.exprs() {
                for (callee, required) in boxes_required(e, &stage_scope) {
                    if callee == *name {
                        continue;
                    }
                    let merged = match bounds.get(&callee) {
                        Some(existing) => box_union(existing, &required),
                        None => required,
                    };
                    bounds.insert(callee, merged);
                }
            }
        }
    }

    for (name, region) in &mut bounds {
        for (dim, interval) in region.bounds.iter_mut().enumerate() {
            let (Some(min), Some(max)) = (interval.min_expr(), interval.max_expr()) else {
                return UnboundedAccessSnafu { output, name: name.clone(), dim }.fail();
            };
            let min = simplify(&common_subexpression_elimination(min));
            let max = simplify(&common_subexpression_elimination(max));
            *interval = Interval::bounded(min, max);
        }
        trace!(func = %name, ?region, "inferred bounds");
    }
    Ok(bounds)
}

/// Inclusive `(min, max)` pairs of a bounded region.
pub fn box_to_vector(region: &Region) -> Option<Vec<(Arc<Expr>, Arc<Expr>)>> {
    region.iter().map(|i| Some((i.min_expr()?.clone(), i.max_expr()?.clone()))).collect()
}

/// Solve `equation` (of the form `new_var == e(var)`) for `var`.
///
/// When several values of `var` satisfy the equation, the result ranges
/// over a fresh reduction variable whose predicate keeps only the solutions.
/// Returns `None` when the solution set is unbounded or of non-constant size.
pub fn solve_inverse(equation: &Arc<Expr>, var: &str, names: &NameGen) -> Option<Arc<Expr>> {
    let interval = solve_for_outer_interval(equation, var);
    let (min, max) = (interval.min_expr()?, interval.max_expr()?);
    let rmin = simplify(min);
    let extent = simplify(&max.sub(&rmin).add(1)).as_int()?;
    if extent == 1 {
        return Some(rmin);
    }
    if extent < 1 {
        return None;
    }
    let rdom = ReductionDomain::new(vec![ReductionVariable {
        var: names.unique(&format!("{var}_inv")),
        min: Expr::int(0),
        extent: Expr::int(extent),
    }]);
    let candidate = rmin.add(rdom.var(0));
    let rdom = rdom.with_predicate(simplify(&substitute(var, &candidate, equation)));
    trace!(var, extent, "solution is a set; iterating over it");
    Some(rmin.add(rdom.var(0)))
}

/// Input buffer or scalar parameter read by a function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferInfo {
    pub dimensions: usize,
    pub ty: Type,
    pub is_param: bool,
}

/// Input buffers and scalar parameters read by any stage of `func`.
pub fn find_buffer_param_calls(func: &kiln_ir::Function) -> BTreeMap<String, BufferInfo> {
    let mut out = BTreeMap::new();
    for stage in func.stages() {
        for e in stage.exprs() {
            for_each_expr(e, |node| {
                match node.kind() {
                    ExprKind::Call(c) if c.call_type == CallType::Image => {
                        out.entry(c.name.clone()).or_insert(BufferInfo {
                            dimensions: c.args.len(),
                            ty: node.ty(),
                            is_param: false,
                        });
                    }
                    ExprKind::Variable(v) if matches!(v.kind, VarKind::Param) => {
                        let info = BufferInfo { dimensions: 0, ty: node.ty(), is_param: true };
                        out.entry(v.name.clone()).or_insert(info);
                    }
                    _ => {}
                }
                true
            });
        }
    }
    out
}

/// `_0`, `_1`, ... stand for arguments left implicit at a call site.
fn is_implicit_name(name: &str) -> bool {
    name.strip_prefix('_').is_some_and(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
}

/// Implicit argument variables used by `e`.
pub fn find_implicit_variables(e: &Arc<Expr>) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    for_each_expr(e, |node| {
        if let Some(name) = node.var_name()
            && is_implicit_name(name)
        {
            out.insert(name.to_string());
        }
        true
    });
    out
}

/// Replace `name` in `e` and in the predicates of the reduction domains
/// `e` iterates over.
pub fn substitute_rdom_predicate(name: &str, replacement: &Arc<Expr>, e: &Arc<Expr>) -> Arc<Expr> {
    let substituted = substitute(name, replacement, e);
    let mut domains: HashMap<u64, ReductionDomain> = HashMap::new();
    for info in gather_rvariables(&substituted).into_values() {
        let domain = info.domain;
        if domains.contains_key(&domain.id()) || !expr_uses_var(domain.predicate(), name) {
            continue;
        }
        let predicate = simplify(&substitute(name, replacement, domain.predicate()));
        domains.insert(domain.id(), domain.with_predicate(predicate));
    }
    rebind_domains(&substituted, &domains)
}

/// Point every reduction variable of a domain in `domains` at the new
/// handle, so later readers see the updated predicate.
pub fn rebind_domains(e: &Arc<Expr>, domains: &HashMap<u64, ReductionDomain>) -> Arc<Expr> {
    if domains.is_empty() {
        return e.clone();
    }
    rewrite_expr(e, |node| {
        let rdom = node.reduction_domain()?;
        let replacement = domains.get(&rdom.id())?;
        Some(Expr::rvar(node.var_name()?, replacement))
    })
}

/// `e` calls `func_name`, directly or through a let-bound variable.
pub fn is_calling_function(func_name: &str, e: &Arc<Expr>, lets: &HashMap<String, Arc<Expr>>) -> bool {
    let mut found = false;
    let mut pending: Vec<Arc<Expr>> = vec![e.clone()];
    let mut visited: HashSet<String> = HashSet::new();
    while let Some(expr) = pending.pop() {
        for_each_expr(&expr, |node| {
            match node.kind() {
                ExprKind::Call(c) if c.is_data_access() && c.name == func_name => found = true,
                ExprKind::Variable(v) => {
                    if let Some(value) = lets.get(&v.name)
                        && visited.insert(v.name.clone())
                    {
                        pending.push(value.clone());
                    }
                }
                _ => {}
            }
            !found
        });
        if found {
            return true;
        }
    }
    false
}

/// `op_name` is the extern `func_name` or one of its typed variants.
pub fn is_float_extern(op_name: &str, func_name: &str) -> bool {
    op_name == func_name
        || op_name.strip_prefix(func_name).is_some_and(|suffix| matches!(suffix, "_f16" | "_f32" | "_f64"))
}
