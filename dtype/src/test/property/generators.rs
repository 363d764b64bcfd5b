use proptest::prelude::*;

use crate::Type;

#[rustfmt::skip]
pub fn arb_int_type() -> impl Strategy<Value = Type> {
    prop_oneof![
        Just(Type::I8), Just(Type::I16), Just(Type::I32), Just(Type::I64),
        Just(Type::U8), Just(Type::U16), Just(Type::U32), Just(Type::U64)
    ]
}

proptest! {
    #[test]
    fn bytes_cover_bits(ty in arb_int_type(), lanes in 1u16..=16) {
        let v = ty.with_lanes(lanes);
        prop_assert!(v.bytes() * 8 >= usize::from(v.bits()));
        prop_assert_eq!(v.bytes(), ty.bytes());
    }
}
