//! Round-trip and soundness properties of the solver.

use std::sync::Arc;

use kiln_ir::eval::eval_with;
use kiln_ir::proptest_gen::*;
use kiln_ir::{Bound, Expr, Interval, Scope};
use proptest::prelude::*;

use crate::solve::{and_condition_over_domain, solve_expression, solve_for_inner_interval, solve_for_outer_interval};

const SAMPLES: std::ops::RangeInclusive<i64> = -12..=12;

fn holds(c: &Arc<Expr>, x: i64, y: i64) -> bool {
    !eval_with(c, &[("x", x), ("y", y)]).is_zero()
}

fn bound_value(b: &Bound, y: i64, infinite: i64) -> i64 {
    match b {
        Bound::Finite(e) => eval_with(e, &[("y", y)]).as_i64().expect("integer bound"),
        _ => infinite,
    }
}

/// Concrete `[lo, hi]` of an interval whose bounds may mention `y`.
fn concrete(i: &Interval, y: i64) -> (i64, i64) {
    (bound_value(&i.min, y, i64::MIN), bound_value(&i.max, y, i64::MAX))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    /// Solving never changes the value of an expression.
    #[test]
    fn solved_expression_evaluates_the_same(e in arb_int_expr()) {
        let solved = solve_expression(&e, "x", &Scope::new());
        for x in SAMPLES.step_by(3) {
            for y in SAMPLES.step_by(4) {
                let env = [("x", x), ("y", y)];
                prop_assert_eq!(eval_with(&e, &env), eval_with(&solved.result, &env),
                    "{} vs {} at x={}, y={}", e, solved.result, x, y);
            }
        }
    }

    /// Solving never changes the value of a condition.
    #[test]
    fn solved_condition_evaluates_the_same(c in arb_condition()) {
        let solved = solve_expression(&c, "x", &Scope::new());
        for x in SAMPLES.step_by(2) {
            for y in SAMPLES.step_by(4) {
                prop_assert_eq!(holds(&c, x, y), holds(&solved.result, x, y),
                    "{} vs {} at x={}, y={}", c, solved.result, x, y);
            }
        }
    }

    /// The condition is true everywhere in the inner interval.
    #[test]
    fn inner_interval_is_sufficient(c in arb_condition()) {
        let inner = solve_for_inner_interval(&c, "x");
        prop_assume!(!inner.is_empty());
        for y in SAMPLES.step_by(4) {
            let (lo, hi) = concrete(&inner, y);
            for x in SAMPLES.filter(|x| (lo..=hi).contains(x)) {
                prop_assert!(holds(&c, x, y), "{} false at x={}, y={} inside {:?}", c, x, y, inner);
            }
        }
    }

    /// The condition is false everywhere outside the outer interval.
    #[test]
    fn outer_interval_is_necessary(c in arb_condition()) {
        let outer = solve_for_outer_interval(&c, "x");
        prop_assume!(!outer.is_everything());
        for y in SAMPLES.step_by(4) {
            let (lo, hi) = concrete(&outer, y);
            for x in SAMPLES.filter(|x| !(lo..=hi).contains(x)) {
                prop_assert!(!holds(&c, x, y), "{} true at x={}, y={} outside {:?}", c, x, y, outer);
            }
        }
    }

    /// Whenever the domain-free condition holds, the original holds on the
    /// whole domain.
    #[test]
    fn condition_over_domain_is_sound(c in arb_condition(), lo in -8i64..=8, width in 0i64..=6) {
        let mut scope = Scope::new();
        scope.push("x", Interval::bounded(Expr::int(lo), Expr::int(lo + width)));
        let over_domain = and_condition_over_domain(&c, &scope);
        for y in SAMPLES.step_by(3) {
            if holds(&over_domain, 0, y) {
                for x in lo..=lo + width {
                    prop_assert!(holds(&c, x, y), "{} implied by {} but false at x={}, y={}", c, over_domain, x, y);
                }
            }
        }
    }
}
