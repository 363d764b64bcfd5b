use test_case::test_case;

use crate::Type;

#[test_case(Type::I8, 127, -128; "int8")]
#[test_case(Type::I16, 32767, -32768; "int16")]
#[test_case(Type::I32, i32::MAX as i64, i32::MIN as i64; "int32")]
#[test_case(Type::I64, i64::MAX, i64::MIN; "int64")]
fn test_signed_limits(ty: Type, max: i64, min: i64) {
    assert_eq!(ty.max_int(), Some(max));
    assert_eq!(ty.min_int(), Some(min));
}

#[test]
fn test_unsigned_limits() {
    assert_eq!(Type::U8.max_uint(), Some(255));
    assert_eq!(Type::BOOL.max_uint(), Some(1));
    assert_eq!(Type::U64.max_uint(), Some(u64::MAX));
    assert_eq!(Type::I32.max_uint(), None);
}

#[test]
fn test_wrap() {
    assert_eq!(Type::I8.wrap_int(128), -128);
    assert_eq!(Type::I8.wrap_int(-129), 127);
    assert_eq!(Type::I32.wrap_int(5), 5);
    assert_eq!(Type::U8.wrap_uint(256 + 7), 7);
}

#[test]
fn test_can_represent() {
    assert!(Type::U8.can_represent_int(255));
    assert!(!Type::U8.can_represent_int(-1));
    assert!(!Type::I8.can_represent_int(200));
    assert!(Type::F32.can_represent_int(1 << 20));
}
