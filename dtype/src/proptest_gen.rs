use crate::*;
use proptest::prelude::*;

#[rustfmt::skip]
impl Type {
    pub fn int_generator() -> impl Strategy<Value = Self> {
        prop_oneof![
            Just(Type::I8), Just(Type::I16), Just(Type::I32), Just(Type::I64),
            Just(Type::U8), Just(Type::U16), Just(Type::U32), Just(Type::U64)
        ]
    }

    pub fn float_generator() -> impl Strategy<Value = Self> {
        prop_oneof![Just(Type::F16), Just(Type::F32), Just(Type::F64)]
    }

    pub fn scalar_generator() -> impl Strategy<Value = Self> {
        prop_oneof![Just(Type::BOOL), Self::int_generator(), Self::float_generator()]
    }

    pub fn vector_generator() -> impl Strategy<Value = Self> {
        (Self::scalar_generator(), prop_oneof![Just(2u16), Just(4), Just(8), Just(16)])
            .prop_map(|(t, lanes)| t.with_lanes(lanes))
    }
}
