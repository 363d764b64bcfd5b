//! Test utilities shared by the unit and property suites.
//!
//! Pipelines are small functions over float input images. They are checked
//! by running them, and whatever a pass produced from them, through the
//! reference interpreter.

use std::collections::BTreeMap;
use std::sync::Arc;

use kiln_ir::eval::{Machine, Samples};
use kiln_ir::func::realization_order;
use kiln_ir::visit::{Visitor, walk_stmt};
use kiln_ir::{ConstValue, Env, Expr, Function, MemoryType, Range, Region, Stmt, StmtKind, Type};

use crate::derivative::Derivative;

/// Element type of the differentiated test pipelines.
pub const FLOAT: Type = Type::F64;

pub fn var(name: &str) -> Arc<Expr> {
    Expr::var(name)
}

/// Read of the one-dimensional float image `name`.
pub fn image(name: &str, arg: Arc<Expr>) -> Arc<Expr> {
    Expr::image_call(FLOAT, name, [arg])
}

/// Read of the float function `name`.
pub fn call(name: &str, args: impl IntoIterator<Item = Arc<Expr>>) -> Arc<Expr> {
    Expr::func_call(FLOAT, name, args, 0)
}

pub fn math(name: &str, args: impl IntoIterator<Item = Arc<Expr>>) -> Arc<Expr> {
    Expr::extern_call(FLOAT, name, args)
}

pub fn func(name: &str, args: &[&str], value: Arc<Expr>) -> Function {
    Function::pure(name, args, vec![value]).expect("valid pure definition")
}

pub fn env_of(funcs: impl IntoIterator<Item = Function>) -> Env {
    let mut env = Env::new();
    for f in funcs {
        env.insert(f);
    }
    env
}

/// Samples of a one-dimensional image starting at `min`.
pub fn samples_1d(min: i64, values: &[f64]) -> Samples {
    values.iter().enumerate().map(|(i, v)| (vec![min + i as i64], ConstValue::Float(*v))).collect()
}

/// `(min, extent)` of every dimension of a region with constant bounds.
pub fn constant_region(region: &Region) -> Vec<(i64, i64)> {
    region
        .iter()
        .map(|i| {
            let min = i.min_expr().and_then(|e| e.as_int()).expect("constant min");
            let max = i.max_expr().and_then(|e| e.as_int()).expect("constant max");
            (min, max - min + 1)
        })
        .collect()
}

/// Interpreter over `d`'s environment with every function that has updates
/// realized over its region, producers first. Pure functions are computed
/// inline when read.
pub fn realize_derivative<'a>(d: &'a Derivative, images: &[(&str, Samples)]) -> Machine<'a> {
    let env = d.env();
    let mut m = Machine::new(env);
    for (name, samples) in images {
        m.set_image(name, samples.clone());
    }
    let mut regions: BTreeMap<String, Vec<(i64, i64)>> = BTreeMap::new();
    for name in env.names().filter(|n| env.lookup(n).is_some_and(Function::has_update_definition)) {
        let region = d.adjoint_region(name).or_else(|| d.bounds(name));
        if let Some(region) = region {
            regions.insert(name.to_string(), constant_region(region));
        }
    }
    let names: Vec<&String> = regions.keys().collect();
    let order = realization_order(&names, env).expect("acyclic pipeline");
    for name in order {
        if let Some(region) = regions.get(&name) {
            m.realize(&name, region);
        }
    }
    m
}

/// Value of float function `name` at `point`, realized or computed inline.
pub fn read(m: &mut Machine<'_>, name: &str, point: &[i64]) -> f64 {
    let args: Vec<Arc<Expr>> = point.iter().map(|p| Expr::int(*p)).collect();
    m.eval(&call(name, args)).as_f64()
}

/// Value of the adjoint of input `buffer` at `point`.
pub fn buffer_adjoint(d: &Derivative, m: &mut Machine<'_>, buffer: &str, point: &[i64]) -> f64 {
    let adjoint = d.get_buffer(buffer).unwrap_or_else(|| panic!("no adjoint for {buffer}"));
    let name = adjoint.name().to_string();
    read(m, &name, point)
}

/// Sum of `output` over `region` with `images` as inputs.
pub fn loss(env: &Env, output: &str, region: &[(i64, i64)], images: &[(&str, Samples)]) -> f64 {
    let mut m = Machine::new(env);
    for (name, samples) in images {
        m.set_image(name, samples.clone());
    }
    let order = realization_order(&[output], env).expect("acyclic pipeline");
    for name in order.iter().filter(|n| env.lookup(n).is_some_and(Function::has_update_definition)) {
        if name == output {
            continue;
        }
        let dims = env.lookup(name).map_or(0, Function::dimensions);
        m.realize(name, &vec![(-16, 48); dims]);
    }
    m.realize(output, region);
    m.realization(output, 0).expect("output realized").values().map(|v| v.as_f64()).sum()
}

/// Central finite difference of [`loss`] with respect to one sample of an
/// input image.
pub fn finite_difference(
    env: &Env,
    output: &str,
    region: &[(i64, i64)],
    images: &[(&str, Samples)],
    buffer: &str,
    point: &[i64],
    h: f64,
) -> f64 {
    let shifted = |delta: f64| {
        let images: Vec<(&str, Samples)> = images
            .iter()
            .map(|(name, samples)| {
                let mut samples = samples.clone();
                if *name == buffer {
                    let v = samples.get(point).map_or(0.0, |v| v.as_f64());
                    samples.insert(point.to_vec(), ConstValue::Float(v + delta));
                }
                (*name, samples)
            })
            .collect();
        loss(env, output, region, &images)
    };
    (shifted(h) - shifted(-h)) / (2.0 * h)
}

pub fn fconst(value: f64) -> Arc<Expr> {
    Expr::const_(FLOAT, ConstValue::Float(value))
}

// ============================================================================
// Statements
// ============================================================================

/// Integer realization of `name` over `[0, extent)`.
pub fn realize_1d(name: &str, extent: i64, body: Arc<Stmt>) -> Arc<Stmt> {
    let bounds = vec![Range::new(Expr::int(0), Expr::int(extent))];
    Stmt::realize(name, vec![Type::I32], MemoryType::Auto, bounds, Expr::const_true(), body)
}

/// Number of statement nodes in `s` whose kind satisfies `pred`.
pub fn count_stmts(s: &Arc<Stmt>, pred: impl Fn(&StmtKind) -> bool) -> usize {
    struct Count<F> {
        pred: F,
        count: usize,
    }
    impl<F: Fn(&StmtKind) -> bool> Visitor for Count<F> {
        fn visit_expr(&mut self, _: &Arc<Expr>) {}

        fn visit_stmt(&mut self, s: &Arc<Stmt>) {
            if (self.pred)(s.kind()) {
                self.count += 1;
            }
            walk_stmt(self, s);
        }
    }
    let mut v = Count { pred, count: 0 };
    v.visit_stmt(s);
    v.count
}

/// Statement nodes in `s` (pre-order) whose kind satisfies `pred`.
pub fn find_stmts(s: &Arc<Stmt>, pred: impl Fn(&StmtKind) -> bool) -> Vec<Arc<Stmt>> {
    let mut found = Vec::new();
    let mut stack = vec![s.clone()];
    while let Some(s) = stack.pop() {
        if pred(s.kind()) {
            found.push(s.clone());
        }
        stack.extend(s.stmts().into_iter().rev().cloned());
    }
    found
}

/// Contents of buffer `buffer` after executing `s` with `bindings` bound.
pub fn run_stmt(env: &Env, s: &Arc<Stmt>, bindings: &[(&str, i64)], buffer: &str) -> BTreeMap<i64, ConstValue> {
    let mut m = Machine::new(env);
    for (name, value) in bindings {
        m.bind_int(name, *value);
    }
    m.exec(s);
    m.buffer(buffer).cloned().unwrap_or_default()
}
