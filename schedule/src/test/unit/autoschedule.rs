use std::collections::BTreeSet;

use kiln_ir::func::{Estimate, LoopLevel, Split, TailStrategy, realization_order};
use kiln_ir::{Env, Expr, ForType, Function, ReductionDomain, ReductionVariable};
use test_case::test_case;

use crate::autoschedule::partitioner::{GroupAnalysis, Level, Partitioner};
use crate::autoschedule::text::{ScheduleText, sanitized_name};
use crate::autoschedule::{
    AutoScheduleOutcome, Cost, DependenceAnalysis, FStage, RegionCosts, check_estimates_on_outputs,
    generate_schedules, get_pipeline_bounds, interval_extent, validate_no_partial_schedules,
};
use crate::config::{AutoScheduleOptions, MachineParams};
use crate::error::Error;
use crate::test::helpers::*;

fn input(x: &str, y: &str) -> std::sync::Arc<Expr> {
    Expr::image_call(FLOAT, "in", [var(x), var(y)])
}

fn estimate_2d(f: &mut Function, x: i64, y: i64) {
    f.schedule_mut().set_estimate(Estimate::new("x", 0, x));
    f.schedule_mut().set_estimate(Estimate::new("y", 0, y));
}

/// `f(x, y) = in(x, y) * 2`, `g(x, y) = f(x, y) + 1` over 1024 x 1024.
fn pointwise() -> Env {
    let f = func("f", &["x", "y"], input("x", "y").mul(2.0));
    let mut g = func("g", &["x", "y"], call("f", [var("x"), var("y")]).add(1.0));
    estimate_2d(&mut g, 1024, 1024);
    env_of([f, g])
}

/// Horizontal then vertical 3-tap blur over 1024 x 1024.
fn blur() -> Env {
    let (x, y) = (var("x"), var("y"));
    let in_at = |dx: i64| Expr::image_call(FLOAT, "in", [x.add(dx), y.clone()]);
    let bx = func("bx", &["x", "y"], in_at(-1).add(in_at(0)).add(in_at(1)));
    let at = |dy: i64| call("bx", [x.clone(), y.add(dy)]);
    let mut by = func("by", &["x", "y"], at(-1).add(at(0)).add(at(1)));
    estimate_2d(&mut by, 1024, 1024);
    env_of([bx, by])
}

fn run(env: &Env, outputs: &[&str]) -> String {
    let outcome = generate_schedules(outputs, env, &MachineParams::default(), &AutoScheduleOptions::default()).unwrap();
    match outcome {
        AutoScheduleOutcome::Scheduled(text) => text,
        other => panic!("expected a schedule, got {other:?}"),
    }
}

/// Run `body` against a fresh partitioner over `outputs` of `env`.
fn with_partitioner<R>(env: &Env, outputs: &[&str], body: impl FnOnce(&mut Partitioner<'_>) -> R) -> R {
    let order = realization_order(outputs, env).unwrap();
    let analysis = DependenceAnalysis::new(env, &order);
    let bounds = get_pipeline_bounds(&analysis, outputs);
    let costs = RegionCosts::new(env, &order);
    let params = MachineParams::default();
    let mut part = Partitioner::new(bounds, params, AutoScheduleOptions::default(), outputs, analysis, costs);
    body(&mut part)
}

fn group_members(part: &Partitioner<'_>) -> Vec<FStage> {
    let mut all: Vec<FStage> = part.groups().values().flat_map(|g| g.members.iter().cloned()).collect();
    all.sort();
    all
}

// ============================================================================
// Schedule text
// ============================================================================

#[test_case("blur", "blur"; "plain")]
#[test_case("f.0", "f_0"; "dot")]
#[test_case("3d", "_3d"; "leading digit")]
#[test_case("in$1", "in_1"; "dollar")]
fn test_sanitized_name(name: &str, expected: &str) {
    assert_eq!(sanitized_name(name), expected);
}

#[test]
fn test_stage_display() {
    assert_eq!(FStage::new("f", 0).to_string(), "f");
    assert_eq!(FStage::new("f", 2).to_string(), "f.update(1)");
}

#[test]
fn test_schedule_text_layout() {
    let env = env_of([func("blur", &["x"], image("in", var("x")))]);
    let order = vec!["blur".to_string()];
    let mut text = ScheduleText::new(&env, &order);
    text.declare_var("x_i", false);
    text.declare_var("x_o", false);
    text.push("blur", 0, "compute_root()", [] as [String; 0]);
    text.push("blur", 0, "split(x, x_o, x_i, 64)", ["x", "x_o", "x_i"]);
    text.push("blur", 0, "parallel(x_o)", ["x_o"]);
    text.push("blur", 0, "parallel(x_o)", ["x_o"]);

    let expected = "\
Var x_i(\"x_i\");
Var x_o(\"x_o\");

Func blur = pipeline.get_func(0);

{
    Var x = blur.args()[0];
    blur
        .compute_root()
        .split(x, x_o, x_i, 64)
        .parallel(x_o);
}

";
    assert_eq!(text.to_string(), expected);
    assert_eq!(text.directives("blur", 0).len(), 3);
}

#[test]
fn test_schedule_text_binds_update_rvars() {
    let x = var("x");
    let r = ReductionDomain::new(vec![ReductionVariable { var: "r".into(), min: Expr::int(0), extent: Expr::int(8) }]);
    let mut h = func("h", &["x"], image("in", x.clone()));
    h.define_update(vec![x.clone()], vec![call("h", [x.clone()]).add(image("in", x.add(r.var(0))))]).unwrap();
    let env = env_of([h]);
    let order = vec!["h".to_string()];

    let mut text = ScheduleText::new(&env, &order);
    text.push("h", 1, "reorder(x, r)", ["x", "r"]);
    let out = text.to_string();
    assert!(out.contains("    RVar r(h.update(0).get_schedule().rvars()[0].var);\n"), "{out}");
    assert!(out.contains("    h.update(0)\n        .reorder(x, r);\n"), "{out}");
    assert!(!out.starts_with("Var"), "no split variables were declared:\n{out}");
}

#[test]
fn test_first_declaration_of_a_variable_wins() {
    let env = Env::new();
    let order = Vec::new();
    let mut text = ScheduleText::new(&env, &order);
    text.declare_var("r_i", true);
    text.declare_var("r_i", false);
    assert!(text.to_string().starts_with("RVar r_i(\"r_i\");"));
}

// ============================================================================
// Preconditions
// ============================================================================

#[test]
fn test_missing_output_estimate_is_reported() {
    let mut env = pointwise();
    env.lookup_mut("g").unwrap().schedule_mut().estimates.retain(|e| e.var != "y");

    let outcome = generate_schedules(&["g"], &env, &MachineParams::default(), &AutoScheduleOptions::default());
    assert_eq!(outcome.unwrap(), AutoScheduleOutcome::MissingEstimates { func: "g".into(), var: "y".into() });
    assert_eq!(check_estimates_on_outputs(&["g"], &env), Some(("g".to_string(), "y".to_string())));
}

#[test]
fn test_scheduled_producer_is_rejected() {
    let mut env = pointwise();
    env.lookup_mut("f").unwrap().schedule_mut().compute_level = LoopLevel::Root;

    let err = generate_schedules(&["g"], &env, &MachineParams::default(), &AutoScheduleOptions::default());
    assert!(matches!(err, Err(Error::PartialSchedule { ref func, .. }) if func == "f"), "{err:?}");
}

#[test]
fn test_output_may_be_computed_at_root() {
    let mut env = pointwise();
    env.lookup_mut("g").unwrap().schedule_mut().compute_level = LoopLevel::Root;
    assert!(validate_no_partial_schedules(env.lookup("g").unwrap(), true).is_ok());
    assert!(validate_no_partial_schedules(env.lookup("g").unwrap(), false).is_err());
}

#[test]
fn test_split_stage_is_rejected() {
    let mut f = func("f", &["x"], image("in", var("x")));
    f.stage_mut(0).unwrap().schedule.splits.push(Split {
        old_var: "x".into(),
        outer: "xo".into(),
        inner: "xi".into(),
        factor: Expr::int(8),
        tail: TailStrategy::Auto,
    });
    let err = validate_no_partial_schedules(&f, false).unwrap_err();
    assert!(err.to_string().contains("splits"), "{err}");
}

#[test]
fn test_parallel_loop_is_rejected() {
    let mut f = func("f", &["x", "y"], input("x", "y"));
    f.stage_mut(0).unwrap().schedule.dims[1].for_type = ForType::Parallel;
    let err = validate_no_partial_schedules(&f, false).unwrap_err();
    assert!(err.to_string().contains("parallel"), "{err}");
}

#[test]
fn test_reordered_loops_are_rejected() {
    let mut f = func("f", &["x", "y"], input("x", "y"));
    f.stage_mut(0).unwrap().schedule.dims.swap(0, 1);
    assert!(validate_no_partial_schedules(&f, false).is_err());

    let mut h = func("h", &["x", "y"], input("x", "y"));
    h.define_update(vec![var("x"), var("y")], vec![call("h", [var("x"), var("y")]).mul(2.0)]).unwrap();
    assert!(validate_no_partial_schedules(&h, true).is_ok());
    h.stage_mut(1).unwrap().schedule.dims.swap(0, 1);
    assert!(validate_no_partial_schedules(&h, true).is_err());
}

#[test]
fn test_extern_functions_are_not_validated() {
    let mut ext = Function::new("ext");
    ext.define_extern("impl", vec![], vec![FLOAT], &["x"]).unwrap();
    ext.schedule_mut().compute_level = LoopLevel::Root;
    assert!(validate_no_partial_schedules(&ext, false).is_ok());
}

// ============================================================================
// Partitioner
// ============================================================================

#[test]
fn test_every_stage_starts_in_its_own_group() {
    let mut env = pointwise();
    let g = env.lookup_mut("g").unwrap();
    g.define_update(vec![var("x"), var("y")], vec![call("g", [var("x"), var("y")]).mul(2.0)]).unwrap();

    with_partitioner(&env, &["g"], |part| {
        part.initialize_groups();
        let keys: Vec<FStage> = part.groups().keys().cloned().collect();
        assert_eq!(keys, vec![FStage::new("f", 0), FStage::new("g", 0), FStage::new("g", 1)]);
        assert!(part.group_costs().values().all(GroupAnalysis::is_defined));
        assert!(part.children()[&FStage::new("g", 0)].contains(&FStage::new("g", 1)));
        assert!(part.children()[&FStage::new("f", 0)].contains(&FStage::new("g", 0)));
    });
}

#[test]
fn test_pointwise_producer_is_inlined() {
    let env = pointwise();
    with_partitioner(&env, &["g"], |part| {
        part.initialize_groups();
        let before = part.pipeline_cost().unwrap();
        part.group(Level::Inline);

        assert_eq!(part.groups().len(), 1);
        let g = &part.groups()[&FStage::new("g", 0)];
        assert!(g.inlined.contains("f"));
        assert_eq!(group_members(part), vec![FStage::new("f", 0), FStage::new("g", 0)]);

        let after = part.pipeline_cost().unwrap();
        assert!(after.arith + after.memory < before.arith + before.memory);
        // Entries naming the fused consumer are gone.
        assert!(part.grouping_cache().keys().all(|k| k.cons != FStage::new("g", 0)));
    });
}

#[test]
fn test_grouping_never_loses_a_stage() {
    let env = blur();
    with_partitioner(&env, &["by"], |part| {
        part.initialize_groups();
        let stages = group_members(part);
        part.group(Level::Inline);
        part.clear_grouping_cache();
        part.group(Level::FastMem);

        assert_eq!(group_members(part), stages);
        assert!(part.groups().contains_key(&FStage::new("by", 0)));
    });
}

#[test]
fn test_outputs_are_never_fused() {
    let mut env = pointwise();
    estimate_2d(env.lookup_mut("f").unwrap(), 1024, 1024);
    with_partitioner(&env, &["f", "g"], |part| {
        part.initialize_groups();
        part.group(Level::Inline);
        part.clear_grouping_cache();
        part.group(Level::FastMem);
        assert!(part.groups().contains_key(&FStage::new("f", 0)));
        assert!(part.groups().contains_key(&FStage::new("g", 0)));
    });
}

#[test]
fn test_tile_configs_skip_reduction_loops() {
    let mut env = pointwise();
    let r = ReductionDomain::new(vec![ReductionVariable { var: "r".into(), min: Expr::int(0), extent: Expr::int(3) }]);
    let (x, y) = (var("x"), var("y"));
    let g = env.lookup_mut("g").unwrap();
    let value = call("g", [x.clone(), y.clone()]).add(call("f", [x.add(r.var(0)), y.clone()]));
    g.define_update(vec![x, y], vec![value]).unwrap();

    with_partitioner(&env, &["g"], |part| {
        let configs = part.generate_tile_configs(&FStage::new("g", 1));
        assert!(!configs.is_empty());
        let vars: BTreeSet<&str> = ["x", "y"].into();
        for config in &configs {
            assert!(!config.is_empty());
            assert!(config.keys().all(|k| vars.contains(k.as_str())), "{config:?}");
            if let Some(&x) = config.get("x") {
                assert!(x >= AutoScheduleOptions::default().min_inner_dim, "{config:?}");
            }
        }
        let unique: BTreeSet<_> = configs.iter().collect();
        assert_eq!(unique.len(), configs.len());
    });
}

#[test_case(64, 0, 63; "short tile")]
#[test_case(1000, 0, 1023; "tile covers the dimension")]
fn test_tile_bounds(size: i64, min: i64, max: i64) {
    let env = pointwise();
    with_partitioner(&env, &["g"], |part| {
        let tiles = [("x".to_string(), size)].into();
        let bounds = part.get_bounds_from_tile_sizes(&FStage::new("g", 0), &tiles);
        let x = &bounds["x"];
        assert_eq!(x.min_expr().and_then(|e| e.as_int()), Some(min));
        assert_eq!(x.max_expr().and_then(|e| e.as_int()), Some(max));
        assert_eq!(interval_extent(&bounds["y"]), Some(1024));
    });
}

#[test]
fn test_benefit_requires_parallelism() {
    let env = pointwise();
    with_partitioner(&env, &["g"], |part| {
        let old = GroupAnalysis { cost: Some(Cost::new(100, 100)), parallelism: Some(64) };
        let serial = GroupAnalysis { cost: Some(Cost::new(10, 10)), parallelism: Some(1) };
        assert_eq!(part.estimate_benefit(&old, &serial, true), None);
        assert_eq!(part.estimate_benefit(&old, &serial, false), Some(180));
        let unknown = GroupAnalysis { cost: None, parallelism: Some(64) };
        assert_eq!(part.estimate_benefit(&old, &unknown, false), None);
    });
}

#[test]
fn test_untiled_group_runs_as_one_tile() {
    let env = pointwise();
    with_partitioner(&env, &["g"], |part| {
        let g = part.groups()[&FStage::new("g", 0)].clone();
        let analysis = part.analyze_group(&g);
        assert_eq!(analysis.parallelism, Some(1));
        assert!(analysis.cost.is_some());

        let storage = part.group_storage_bounds();
        assert!(storage[&FStage::new("g", 0)].contains_key("g"));
    });
}

// ============================================================================
// End to end
// ============================================================================

#[test]
fn test_pointwise_pipeline_schedule() {
    let text = run(&pointwise(), &["g"]);

    assert!(text.contains("Func g = pipeline.get_func(1);"), "{text}");
    assert!(!text.contains("Func f ="), "f should be inlined:\n{text}");
    assert!(text.contains("Var x_vi(\"x_vi\");"), "{text}");
    assert!(text.contains("    g\n        .compute_root()\n"), "{text}");
    assert!(text.contains(".split(x, x_vo, x_vi, 8)"), "{text}");
    assert!(text.contains(".vectorize(x_vi)"), "{text}");
    assert!(text.contains(".parallel(y)"), "{text}");
}

#[test]
fn test_update_splits_guard_their_tails() {
    let mut h = func("h", &["x", "y"], input("x", "y"));
    h.define_update(vec![var("x"), var("y")], vec![call("h", [var("x"), var("y")]).mul(2.0)]).unwrap();
    estimate_2d(&mut h, 1024, 1024);
    let text = run(&env_of([h]), &["h"]);

    let update = text.split("h.update(0)").nth(1).unwrap_or_else(|| panic!("no update block:\n{text}"));
    let update = update.split('}').next().unwrap_or_default();
    assert!(update.contains(".split("), "{text}");
    for line in update.lines().filter(|l| l.contains(".split(")) {
        assert!(line.contains("TailStrategy::GuardWithIf"), "{line}");
    }
    let pure = text.split("h.update(0)").next().unwrap_or_default();
    assert!(!pure.contains("GuardWithIf"), "{text}");
}

#[test]
fn test_unknown_output_is_an_error() {
    let env = pointwise();
    let err = generate_schedules(&["nope"], &env, &MachineParams::default(), &AutoScheduleOptions::default());
    assert!(matches!(err, Err(Error::Ir { .. })), "{err:?}");
}
