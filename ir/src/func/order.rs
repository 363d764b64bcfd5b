//! Call-graph queries, realization order and inlining.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use super::env::Env;
use super::function::Function;
use crate::analysis::substitute_map;
use crate::error::*;
use crate::expr::{Expr, ExprKind};
use crate::visit::{for_each_expr, rewrite_expr};

/// Names of pipeline functions and buffers called by any stage of `f`,
/// excluding `f` itself.
pub fn find_direct_calls(f: &Function) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    for stage in f.stages() {
        for e in stage.exprs() {
            for_each_expr(e, |node| {
                if let Some(c) = node.as_call()
                    && c.is_data_access()
                    && c.name != f.name()
                {
                    out.insert(c.name.clone());
                }
                true
            });
        }
        if let Some(rdom) = &stage.rdom {
            for rv in rdom.vars() {
                for e in [&rv.min, &rv.extent] {
                    for_each_expr(e, |node| {
                        if let Some(c) = node.as_call()
                            && c.is_data_access()
                        {
                            out.insert(c.name.clone());
                        }
                        true
                    });
                }
            }
        }
    }
    if let Some(ext) = f.extern_definition() {
        for a in &ext.args {
            for_each_expr(a, |node| {
                if let Some(c) = node.as_call()
                    && c.is_data_access()
                {
                    out.insert(c.name.clone());
                }
                true
            });
        }
    }
    out
}

/// Functions of `env` reachable from `name` through calls, including `name`.
pub fn find_transitive_calls(name: &str, env: &Env) -> BTreeSet<String> {
    let mut seen = BTreeSet::new();
    let mut work = vec![name.to_string()];
    while let Some(n) = work.pop() {
        if !seen.insert(n.clone()) {
            continue;
        }
        if let Some(f) = env.lookup(&n) {
            work.extend(find_direct_calls(f).into_iter().filter(|c| env.contains(c)));
        }
    }
    seen
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Order in which the functions needed by `outputs` must be computed:
/// every producer precedes its consumers.
///
/// Calls to names outside `env` are input buffers and are skipped.
pub fn realization_order<S: AsRef<str>>(outputs: &[S], env: &Env) -> Result<Vec<String>> {
    fn visit(name: &str, env: &Env, marks: &mut HashMap<String, Mark>, order: &mut Vec<String>) -> Result<()> {
        match marks.get(name) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => return CyclicPipelineSnafu { name }.fail(),
            None => {}
        }
        let f = env.require(name)?;
        marks.insert(name.to_string(), Mark::Visiting);
        for callee in find_direct_calls(f) {
            if env.contains(&callee) {
                visit(&callee, env, marks, order)?;
            }
        }
        marks.insert(name.to_string(), Mark::Done);
        order.push(name.to_string());
        Ok(())
    }

    let mut marks = HashMap::new();
    let mut order = Vec::new();
    for out in outputs {
        visit(out.as_ref(), env, &mut marks, &mut order)?;
    }
    tracing::trace!(?order, "realization order");
    Ok(order)
}

/// Replace every call to `f` in `e` with its pure definition.
///
/// Panics if `f` has updates or an extern definition; only functions with a
/// pure definition alone can be inlined.
pub fn inline_function(e: &Arc<Expr>, f: &Function) -> Arc<Expr> {
    assert!(f.can_be_inlined(), "cannot inline {}: it has updates or is extern", f.name());
    rewrite_expr(e, |node| {
        let ExprKind::Call(c) = node.kind() else { return None };
        if !c.is_data_access() || c.name != f.name() {
            return None;
        }
        assert_eq!(c.args.len(), f.dimensions(), "call to {} has the wrong number of arguments", f.name());
        let args: Vec<_> = c.args.iter().map(|a| inline_function(a, f)).collect();
        let map: HashMap<String, Arc<Expr>> = f.args().iter().cloned().zip(args).collect();
        let value = f.values().get(c.value_index)?;
        Some(substitute_map(&map, value))
    })
}
