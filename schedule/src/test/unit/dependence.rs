use std::collections::BTreeSet;
use std::sync::Arc;

use kiln_ir::func::Estimate;
use kiln_ir::{Env, Expr, Interval, Type};
use test_case::test_case;

use crate::autoschedule::dependence::{DependenceAnalysis, get_pipeline_bounds};
use crate::autoschedule::{DimBounds, stage_bounds};
use crate::test::helpers::*;

fn input(x: Arc<Expr>, y: Arc<Expr>) -> Arc<Expr> {
    Expr::image_call(FLOAT, "input", [x, y])
}

/// Separable 3x3 box blur: `bx` blurs `input` along x, `by` blurs `bx` along y.
fn blur() -> Env {
    let (x, y) = (var("x"), var("y"));
    let bx = input(x.sub(1), y.clone()).add(input(x.clone(), y.clone())).add(input(x.add(1), y.clone()));
    let by = call("bx", [x.clone(), y.sub(1)]).add(call("bx", [x.clone(), y.clone()])).add(call("bx", [x, y.add(1)]));
    env_of([func("bx", &["x", "y"], bx), func("by", &["x", "y"], by)])
}

fn order(env: &Env) -> Vec<String> {
    kiln_ir::func::realization_order(&["by"], env).expect("acyclic")
}

fn box_bounds(ranges: &[(&str, i64, i64)]) -> DimBounds {
    ranges.iter().map(|(v, lo, hi)| (v.to_string(), Interval::bounded(Expr::int(*lo), Expr::int(*hi)))).collect()
}

fn prods(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|n| n.to_string()).collect()
}

#[test]
fn test_stencil_grows_producer_regions() {
    let env = blur();
    let order = order(&env);
    let analysis = DependenceAnalysis::new(&env, &order);
    let by = env.lookup("by").unwrap();

    let bounds = box_bounds(&[("x", 0, 99), ("y", 0, 49)]);
    let regions = analysis.regions_required(by, 0, &bounds, &prods(&["bx", "by"]), false);

    assert_eq!(constant_region(&regions["by"]), vec![(0, 100), (0, 50)]);
    assert_eq!(constant_region(&regions["bx"]), vec![(0, 100), (-1, 52)]);
    assert_eq!(constant_region(&regions["input"]), vec![(-1, 102), (-1, 52)]);
}

#[test]
fn test_only_computed_leaves_out_the_stage_itself() {
    let env = blur();
    let order = order(&env);
    let analysis = DependenceAnalysis::new(&env, &order);
    let by = env.lookup("by").unwrap();

    let bounds = box_bounds(&[("x", 0, 9), ("y", 0, 9)]);
    let regions = analysis.regions_required(by, 0, &bounds, &prods(&["bx", "by"]), true);
    assert!(!regions.contains_key("by"));
    assert!(regions.contains_key("bx"));
}

#[test]
fn test_producers_outside_the_set_are_not_followed() {
    let env = blur();
    let order = order(&env);
    let analysis = DependenceAnalysis::new(&env, &order);
    let by = env.lookup("by").unwrap();

    let bounds = box_bounds(&[("x", 0, 9), ("y", 0, 9)]);
    let regions = analysis.regions_required(by, 0, &bounds, &prods(&["by"]), false);
    assert!(regions.contains_key("bx"));
    assert!(!regions.contains_key("input"));
}

#[test]
fn test_repeated_queries_agree() {
    let env = blur();
    let order = order(&env);
    let analysis = DependenceAnalysis::new(&env, &order);
    let by = env.lookup("by").unwrap();
    let bounds = box_bounds(&[("x", 0, 9), ("y", 0, 9)]);
    let all = prods(&["bx", "by"]);

    let first = analysis.regions_required(by, 0, &bounds, &all, false);
    let second = analysis.regions_required(by, 0, &bounds, &all, false);
    assert_eq!(first, second);
}

#[test]
fn test_symbolic_bounds_fall_back_to_estimates() {
    // g(x) = f(idx(x)): the index is data dependent, so f's box is unbounded.
    let x = var("x");
    let mut f = func("f", &["x"], x.clone().add(1));
    f.schedule_mut().set_estimate(Estimate::new("x", 0, 10));
    let g = func("g", &["x"], Expr::func_call(Type::I32, "f", [Expr::image_call(Type::I32, "idx", [x])], 0));
    let env = env_of([f, g]);
    let order = kiln_ir::func::realization_order(&["g"], &env).unwrap();
    let analysis = DependenceAnalysis::new(&env, &order);

    let bounds = box_bounds(&[("x", 0, 99)]);
    let regions = analysis.regions_required(env.lookup("g").unwrap(), 0, &bounds, &prods(&["f", "g"]), false);
    assert_eq!(constant_region(&regions["f"]), vec![(0, 10)]);
}

#[test]
fn test_update_stage_covers_its_reduction_domain() {
    let x = var("x");
    let r = kiln_ir::ReductionDomain::new(vec![kiln_ir::ReductionVariable {
        var: "r".into(),
        min: Expr::int(0),
        extent: Expr::int(5),
    }]);
    let mut h = func("h", &["x"], image("a", x.clone()));
    h.define_update(vec![x.clone()], vec![call("h", [x.clone()]).add(image("a", x.add(r.var(0))))]).unwrap();
    let env = env_of([h]);
    let order = kiln_ir::func::realization_order(&["h"], &env).unwrap();
    let analysis = DependenceAnalysis::new(&env, &order);
    let h = env.lookup("h").unwrap();

    let bounds = stage_bounds(h, 1, &box_bounds(&[("x", 0, 9)]));
    assert_eq!(bounds.len(), 2);
    let regions = analysis.regions_required(h, 1, &bounds, &prods(&["h"]), false);
    assert_eq!(constant_region(&regions["a"]), vec![(0, 14)]);
}

// ============================================================================
// Redundant regions
// ============================================================================

#[test_case("y", vec![(0, 10), (9, 2)]; "along y shares two rows")]
#[test_case("x", vec![(10, 0), (-1, 12)]; "along x shares nothing")]
fn test_redundant_regions_of_a_tile(var: &str, expected: Vec<(i64, i64)>) {
    let env = blur();
    let order = order(&env);
    let analysis = DependenceAnalysis::new(&env, &order);
    let by = env.lookup("by").unwrap();

    let bounds = box_bounds(&[("x", 0, 9), ("y", 0, 9)]);
    let overlap = analysis.redundant_regions(by, 0, var, &bounds, &prods(&["bx", "by"]), false);
    assert_eq!(constant_region(&overlap["bx"]), expected);
}

#[test]
fn test_overlap_regions_has_one_entry_per_loop() {
    let env = blur();
    let order = order(&env);
    let analysis = DependenceAnalysis::new(&env, &order);
    let by = env.lookup("by").unwrap();

    let bounds = box_bounds(&[("x", 0, 9), ("y", 0, 9)]);
    let overlaps = analysis.overlap_regions(by, 0, &bounds, &prods(&["bx", "by"]), false);
    assert_eq!(overlaps.len(), 2);
}

// ============================================================================
// Pipeline bounds
// ============================================================================

#[test]
fn test_pipeline_bounds_from_output_estimates() {
    let mut env = blur();
    let by = env.lookup_mut("by").unwrap();
    by.schedule_mut().set_estimate(Estimate::new("x", 0, 64));
    by.schedule_mut().set_estimate(Estimate::new("y", 0, 32));
    let order = order(&env);
    let analysis = DependenceAnalysis::new(&env, &order);

    let bounds = get_pipeline_bounds(&analysis, &["by"]);
    assert_eq!(constant_region(&bounds["by"]), vec![(0, 64), (0, 32)]);
    assert_eq!(constant_region(&bounds["bx"]), vec![(0, 64), (-1, 34)]);
    assert_eq!(constant_region(&bounds["input"]), vec![(-1, 66), (-1, 34)]);
}
