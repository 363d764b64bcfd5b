//! Region bounds grow with the consumer box, region costs add up over
//! disjoint sets of functions, and grouping keeps every stage while never
//! adding groups, on random stencil chains.

use std::collections::BTreeSet;
use std::sync::Arc;

use kiln_ir::func::{Estimate, realization_order};
use kiln_ir::{Env, Expr, Interval, Region};
use proptest::prelude::*;

use crate::autoschedule::partitioner::{Level, Partitioner};
use crate::autoschedule::{DependenceAnalysis, DimBounds, FStage, RegionCosts, Regions, get_pipeline_bounds};
use crate::config::{AutoScheduleOptions, MachineParams};
use crate::test::helpers::*;

/// One stage of a chain: reads of the previous stage at `(dx, dy)` offsets.
#[derive(Debug, Clone)]
struct Stencil {
    taps: Vec<(i64, i64)>,
    scale: bool,
}

fn arb_stencil() -> impl Strategy<Value = Stencil> {
    (prop::collection::vec((-2i64..=2, -2i64..=2), 1..4), any::<bool>())
        .prop_map(|(taps, scale)| Stencil { taps, scale })
}

fn stage_name(i: usize) -> String {
    format!("s{i}")
}

/// `s0` reads the input image; every later stage reads the one before it.
fn chain(stencils: &[Stencil], width: i64, height: i64) -> Env {
    let (x, y) = (var("x"), var("y"));
    let mut funcs = Vec::new();
    for (i, stencil) in stencils.iter().enumerate() {
        let read = |dx: i64, dy: i64| -> Arc<Expr> {
            let args = [x.add(dx), y.add(dy)];
            if i == 0 { Expr::image_call(FLOAT, "in", args) } else { call(&stage_name(i - 1), args) }
        };
        let mut value = stencil.taps.iter().map(|&(dx, dy)| read(dx, dy)).reduce(|a, b| a.add(b));
        if stencil.scale {
            value = value.map(|v| v.mul(0.5));
        }
        let Some(value) = value else { unreachable!("stencils have at least one tap") };
        funcs.push(func(&stage_name(i), &["x", "y"], value));
    }
    if let Some(last) = funcs.last_mut() {
        last.schedule_mut().set_estimate(Estimate::new("x", 0, width));
        last.schedule_mut().set_estimate(Estimate::new("y", 0, height));
    }
    env_of(funcs)
}

fn span(min: i64, extent: i64) -> Interval {
    Interval::bounded(Expr::int(min), Expr::int(min + extent - 1))
}

fn contains(outer: &Region, inner: &Region) -> bool {
    let outer = constant_region(outer);
    let inner = constant_region(inner);
    outer.len() == inner.len()
        && outer.iter().zip(&inner).all(|(&(om, oe), &(im, ie))| om <= im && im + ie <= om + oe)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// A box that contains another needs at least as much of every producer.
    #[test]
    fn regions_grow_with_the_consumer_box(
        stencils in prop::collection::vec(arb_stencil(), 1..4),
        min in -8i64..8,
        extent in 1i64..16,
        grow in (0i64..4, 0i64..4),
    ) {
        let env = chain(&stencils, 64, 64);
        let out = stage_name(stencils.len() - 1);
        let order = realization_order(&[out.as_str()], &env).unwrap();
        let analysis = DependenceAnalysis::new(&env, &order);
        let prods: BTreeSet<String> = env.names().map(str::to_string).collect();
        let f = env.lookup(&out).unwrap();

        let small: DimBounds = [("x".to_string(), span(min, extent)), ("y".to_string(), span(0, extent))].into();
        let large: DimBounds = [
            ("x".to_string(), span(min - grow.0, extent + grow.0 + grow.1)),
            ("y".to_string(), span(-grow.1, extent + grow.1 + grow.0)),
        ]
        .into();
        let small = analysis.regions_required(f, 0, &small, &prods, false);
        let large = analysis.regions_required(f, 0, &large, &prods, false);

        prop_assert_eq!(small.keys().collect::<Vec<_>>(), large.keys().collect::<Vec<_>>());
        for (name, region) in &small {
            prop_assert!(contains(&large[name], region), "{} shrank", name);
        }
    }

    /// Costing two disjoint sets of functions separately adds up to costing
    /// them together.
    #[test]
    fn region_costs_add_over_disjoint_sets(
        stencils in prop::collection::vec(arb_stencil(), 2..5),
        extents in prop::collection::vec(1i64..32, 4),
        split in 1usize..4,
    ) {
        let env = chain(&stencils, 64, 64);
        let out = stage_name(stencils.len() - 1);
        let order = realization_order(&[out.as_str()], &env).unwrap();
        let costs = RegionCosts::new(&env, &order);
        let none = BTreeSet::new();

        let regions: Regions = (0..stencils.len())
            .map(|i| {
                let extent = extents[i % extents.len()];
                (stage_name(i), Region { bounds: vec![span(0, extent), span(-1, extent)] })
            })
            .collect();
        let split = split.min(stencils.len() - 1);
        let (left, right): (Regions, Regions) =
            regions.clone().into_iter().partition(|(name, _)| name[1..].parse::<usize>().is_ok_and(|i| i < split));

        let whole = costs.regions_cost(&regions, &none).unwrap();
        let parts = costs.regions_cost(&left, &none).unwrap() + costs.regions_cost(&right, &none).unwrap();
        prop_assert_eq!(whole, parts);
    }

    /// Both grouping passes finish, never add groups, and keep every stage in
    /// exactly one group.
    #[test]
    fn grouping_terminates_and_keeps_every_stage(
        stencils in prop::collection::vec(arb_stencil(), 1..5),
        width in 16i64..256,
        height in 16i64..256,
    ) {
        let env = chain(&stencils, width, height);
        let out = stage_name(stencils.len() - 1);
        let outputs = [out.as_str()];
        let order = realization_order(&outputs, &env).unwrap();
        let analysis = DependenceAnalysis::new(&env, &order);
        let bounds = get_pipeline_bounds(&analysis, &outputs);
        let costs = RegionCosts::new(&env, &order);
        let params = MachineParams::default();
        let mut part = Partitioner::new(bounds, params, AutoScheduleOptions::default(), &outputs, analysis, costs);

        part.initialize_groups();
        let initial = part.groups().len();
        prop_assert_eq!(initial, stencils.len());

        part.group(Level::Inline);
        let after_inline = part.groups().len();
        prop_assert!(after_inline <= initial);
        part.clear_grouping_cache();
        part.group(Level::FastMem);
        prop_assert!(part.groups().len() <= after_inline);

        let mut members: Vec<FStage> = part.groups().values().flat_map(|g| g.members.iter().cloned()).collect();
        members.sort();
        let expected: Vec<FStage> = (0..stencils.len()).map(|i| FStage::new(stage_name(i), 0)).collect();
        prop_assert_eq!(members, expected);
        prop_assert!(part.groups().contains_key(&FStage::new(&out, 0)));
    }
}
