use std::sync::Arc;

use test_case::test_case;

use crate::expr::Expr;
use crate::scope::Scope;
use crate::simplify::{ConstInterval, can_prove, can_prove_in_scope, simplify, simplify_in_scope};
use crate::types::ConstValue;
use crate::Type;

fn x() -> Arc<Expr> {
    Expr::var("x")
}

fn y() -> Arc<Expr> {
    Expr::var("y")
}

#[test_case(x().add(0), "x" ; "add zero")]
#[test_case(x().add(3).add(4), "(x + 7)" ; "fold constants")]
#[test_case(y().add(x()), "(x + y)" ; "sort terms")]
#[test_case(x().mul(3).add(y()), "((x*3) + y)" ; "scaled term first")]
#[test_case(x().add(y()).sub(y()), "x" ; "cancel terms")]
#[test_case(x().sub(x()), "0" ; "self difference")]
#[test_case(Expr::int(5).sub(x()), "(5 - x)" ; "constant minus term")]
#[test_case(x().mul(4).add(2).div(4), "x" ; "div drops small remainder")]
#[test_case(x().mul(4).add(6).div(4), "(x + 1)" ; "div splits constant")]
#[test_case(x().mul(4).add(3).modulo(4), "3" ; "mod of aligned sum")]
#[test_case(x().div(2).div(3), "(x/6)" ; "nested division")]
#[test_case(x().modulo(1), "0" ; "mod one")]
#[test_case(x().div(0), "0" ; "div by zero")]
#[test_case(x().div(-1), "(0 - x)" ; "div by minus one negates")]
#[test_case(x().mul(-1).div(-1), "x" ; "negation cancels")]
#[test_case(x().mul(-3).div(-3), "x" ; "negative scale cancels")]
#[test_case(x().mul(4).add(3).modulo(-4), "3" ; "mod by negative divisor")]
fn test_simplify_arith(e: Arc<Expr>, expected: &str) {
    assert_eq!(simplify(&e).to_string(), expected);
}

#[test_case(x().min(x().add(1)), "x" ; "min by difference")]
#[test_case(x().max(x().add(1)), "(x + 1)" ; "max by difference")]
#[test_case(x().min(5).min(3), "min(x, 3)" ; "nested constant min")]
#[test_case(Expr::int(3).max(x()), "max(x, 3)" ; "constant moves right")]
#[test_case(x().min(x().max(y())), "x" ; "absorb max")]
#[test_case(x().min(x()), "x" ; "idempotent")]
fn test_simplify_min_max(e: Arc<Expr>, expected: &str) {
    assert_eq!(simplify(&e).to_string(), expected);
}

#[test_case(x().add(4).cmp_lt(27), "(x < 23)" ; "move constant right")]
#[test_case(x().add(1).cmp_gt(x()), "true" ; "decided by difference")]
#[test_case(x().cmp_le(x()), "true" ; "reflexive")]
#[test_case(x().cmp_lt(y()).not(), "(x >= y)" ; "negated comparison")]
#[test_case(x().cmp_lt(y()).and(true), "(x < y)" ; "and true")]
#[test_case(x().cmp_lt(y()).or(false), "(x < y)" ; "or false")]
#[test_case(Expr::select(Expr::const_true(), x(), y()), "x" ; "select true")]
#[test_case(Expr::select(x().cmp_lt(y()), x(), x()), "x" ; "select same branches")]
fn test_simplify_boolean(e: Arc<Expr>, expected: &str) {
    assert_eq!(simplify(&e).to_string(), expected);
}

#[test]
fn test_simplify_let_substitutes_constants() {
    let e = Expr::let_in("t", Expr::int(4), x().add(Expr::var("t")));
    assert_eq!(simplify(&e).to_string(), "(x + 4)");
}

#[test]
fn test_simplify_let_drops_unused() {
    let e = Expr::let_in("t", x().mul(y()), y().add(1));
    assert_eq!(simplify(&e).to_string(), "(y + 1)");
}

#[test]
fn test_simplify_narrow_types_keep_wrapping() {
    let a = Expr::typed_var(Type::I16, "a");
    let e = a.add(Expr::make_const(Type::I16, 1)).sub(Expr::make_const(Type::I16, 1));
    // No regrouping below 32 bits.
    assert!(simplify(&e).as_binary().is_some());
}

#[test]
fn test_simplify_constant_fold_types() {
    let e = Expr::make_const(Type::U8, 200).add(Expr::make_const(Type::U8, 100));
    assert_eq!(simplify(&e).as_const(), Some(ConstValue::UInt(44)));
}

#[test]
fn test_simplify_with_bounds() {
    let mut scope = Scope::new();
    scope.push("x", ConstInterval::new(Some(0), Some(5)));
    assert_eq!(simplify_in_scope(&x().cmp_lt(10), &scope).to_string(), "true");
    assert_eq!(simplify_in_scope(&x().min(8), &scope).to_string(), "x");
    assert_eq!(simplify_in_scope(&x().modulo(8), &scope).to_string(), "x");
    assert_eq!(simplify_in_scope(&x().div(8), &scope).to_string(), "0");
    assert!(can_prove_in_scope(&x().cmp_ge(0), &scope));
    assert!(!can_prove_in_scope(&x().cmp_ge(1), &scope));
}

#[test]
fn test_can_prove() {
    assert!(can_prove(&x().add(1).cmp_gt(x())));
    assert!(can_prove(&x().mul(2).cmp_eq(x().add(x()))));
    assert!(!can_prove(&x().cmp_lt(y())));
    assert!(can_prove(&x().div(-1).add(x()).cmp_eq(0)));
    assert!(can_prove(&x().mul(-5).modulo(-5).cmp_eq(0)));
}
