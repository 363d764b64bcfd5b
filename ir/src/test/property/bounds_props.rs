//! Property tests for interval bounds.

use proptest::prelude::*;

use crate::bounds::{Interval, bounds_of_expr_in_scope};
use crate::eval::eval_with;
use crate::expr::Expr;
use crate::scope::Scope;

use crate::proptest_gen::*;

fn scope_for(lo: i64, extent: i64) -> Scope<Interval> {
    let mut scope = Scope::new();
    scope.push("x", Interval::bounded(Expr::int(lo), Expr::int(lo + extent - 1)));
    scope.push("y", Interval::bounded(Expr::int(-3), Expr::int(3)));
    scope
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    /// Every value an expression takes over the domain lies in its bounds.
    #[test]
    fn bounds_contain_values(e in arb_int_expr(), lo in -10i64..=10, extent in 1i64..=12) {
        let interval = bounds_of_expr_in_scope(&e, &scope_for(lo, extent));
        let min = interval.min_expr().and_then(|m| m.as_int());
        let max = interval.max_expr().and_then(|m| m.as_int());
        for x in lo..lo + extent {
            for y in -3..=3 {
                let v = eval_with(&e, &[("x", x), ("y", y)]).as_i64().unwrap();
                if let Some(min) = min {
                    prop_assert!(v >= min, "{} = {} at x={}, y={} is below {}", e, v, x, y, min);
                }
                if let Some(max) = max {
                    prop_assert!(v <= max, "{} = {} at x={}, y={} is above {}", e, v, x, y, max);
                }
            }
        }
    }
}
