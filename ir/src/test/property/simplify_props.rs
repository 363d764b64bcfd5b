//! Property tests for the simplifier.

use proptest::prelude::*;

use crate::eval::eval_with;
use crate::simplify::simplify;

use crate::proptest_gen::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    /// Simplification never changes the value of an expression.
    #[test]
    fn simplify_preserves_value(e in arb_int_expr(), x in -20i64..=20, y in -20i64..=20) {
        let s = simplify(&e);
        let before = eval_with(&e, &[("x", x), ("y", y)]);
        let after = eval_with(&s, &[("x", x), ("y", y)]);
        prop_assert_eq!(before, after, "{} simplified to {}", e, s);
    }

    /// Conditions keep their truth value.
    #[test]
    fn simplify_preserves_conditions(c in arb_condition(), x in -20i64..=20, y in -20i64..=20) {
        let s = simplify(&c);
        let before = eval_with(&c, &[("x", x), ("y", y)]);
        let after = eval_with(&s, &[("x", x), ("y", y)]);
        prop_assert_eq!(before.is_zero(), after.is_zero(), "{} simplified to {}", c, s);
    }

    /// Simplifying twice gives the same value as simplifying once.
    #[test]
    fn simplify_is_stable(e in arb_int_expr(), x in -20i64..=20, y in -20i64..=20) {
        let once = simplify(&e);
        let twice = simplify(&once);
        prop_assert_eq!(eval_with(&once, &[("x", x), ("y", y)]), eval_with(&twice, &[("x", x), ("y", y)]));
    }
}
