use proptest::prelude::*;

use super::generators::arb_int_type;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(512))]

    /// Wrapping always lands inside the representable range.
    #[test]
    fn wrap_is_representable(ty in arb_int_type(), v in any::<i64>()) {
        if ty.is_int() {
            prop_assert!(ty.can_represent_int(ty.wrap_int(v)));
        } else {
            let w = ty.wrap_uint(v as u64);
            prop_assert!(ty.max_uint().is_some_and(|m| w <= m));
        }
    }

    /// Representable values are fixed points of wrapping.
    #[test]
    fn wrap_is_identity_on_range(ty in arb_int_type(), v in -100i64..100) {
        if ty.is_int() && ty.can_represent_int(v) {
            prop_assert_eq!(ty.wrap_int(v), v);
        }
    }
}
