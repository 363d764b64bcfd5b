use test_case::test_case;

use crate::{NUMERIC, Type, TypeCode};

#[test_case(Type::BOOL, 1; "bool")]
#[test_case(Type::I8, 1; "int8")]
#[test_case(Type::U16, 2; "uint16")]
#[test_case(Type::I32, 4; "int32")]
#[test_case(Type::F64, 8; "float64")]
#[test_case(Type::F32.with_lanes(4), 4; "vector element size")]
fn test_bytes(ty: Type, expected: usize) {
    assert_eq!(ty.bytes(), expected);
}

#[test_case(Type::BOOL, "bool"; "bool")]
#[test_case(Type::I32, "int32"; "int32")]
#[test_case(Type::U8.with_lanes(16), "uint8x16"; "vector")]
#[test_case(Type::F32, "float32"; "float")]
fn test_display(ty: Type, expected: &str) {
    assert_eq!(ty.to_string(), expected);
}

/// Test: Booleans are one-bit unsigned integers.
#[test]
fn test_bool_is_uint1() {
    assert!(Type::BOOL.is_uint());
    assert!(Type::BOOL.is_bool());
    assert!(!Type::U8.is_bool());
    assert_eq!(Type::uint(1), Type::BOOL);
}

#[test]
fn test_lanes_roundtrip() {
    let v = Type::I16.with_lanes(8);
    assert!(v.is_vector());
    assert_eq!(v.element_of(), Type::I16);
    assert!(v.element_of().is_scalar());
}

#[test]
fn test_code_sets() {
    assert!(Type::F32.is_one_of(NUMERIC));
    assert!(!Type::HANDLE.is_one_of(NUMERIC));
    assert!(Type::U32.is_integral());
    assert!(!Type::F16.is_integral());
    assert_eq!(Type::HANDLE.code(), TypeCode::Handle);
}
