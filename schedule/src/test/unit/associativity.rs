use std::sync::Arc;

use kiln_ir::eval::eval_with;
use kiln_ir::{Expr, Type};

use crate::associativity::prove_associativity;

fn x() -> Arc<Expr> {
    Expr::var("x")
}

fn f_at(ty: Type, value_index: usize, arg: Arc<Expr>) -> Arc<Expr> {
    Expr::func_call(ty, "f", [arg], value_index)
}

fn f(ty: Type) -> Arc<Expr> {
    f_at(ty, 0, x())
}

fn g() -> Arc<Expr> {
    Expr::func_call(Type::I32, "g", [x()], 0)
}

#[test]
fn test_min_with_narrow_type() {
    let y = Expr::typed_var(Type::I16, "y");
    let update = f(Type::I16).min(y.add(Expr::var("z").cast(Type::I16)));
    let op = prove_associativity("f", &[x()], &[update]);

    assert!(op.associative);
    assert!(op.is_commutative);
    assert_eq!(op.ops[0].to_string(), "min(f$x0, f$y0)");
    assert_eq!(op.identities[0].ty(), Type::I16);
    assert_eq!(op.identities[0].as_int(), Some(i64::from(i16::MAX)));
    assert_eq!(op.xs[0].var, "f$x0");
    assert_eq!(op.xs[0].expr.to_string(), "f(x)");
    assert_eq!(op.ys[0].var, "f$y0");
    assert_eq!(op.ys[0].expr.to_string(), "(y + int16(z))");
}

#[test]
fn test_self_reference_added_to_other_term_is_rejected() {
    let update = f(Type::I32).add(g()).max(g());
    assert!(!prove_associativity("f", &[x()], &[update]).associative);
}

#[test]
fn test_sum() {
    let op = prove_associativity("f", &[x()], &[f(Type::I32).add(g())]);
    assert!(op.associative);
    assert_eq!(op.ops[0].to_string(), "(f$x0 + f$y0)");
    assert!(op.identities[0].is_zero());
    assert_eq!(op.ys[0].expr.to_string(), "g(x)");
}

#[test]
fn test_self_reference_on_the_right() {
    let op = prove_associativity("f", &[x()], &[g().mul(f(Type::I32))]);
    assert!(op.associative);
    assert_eq!(op.ops[0].to_string(), "(f$x0*f$y0)");
    assert!(op.identities[0].is_one());
    assert_eq!(op.ys[0].expr.to_string(), "g(x)");
}

#[test]
fn test_constant_added_first() {
    let op = prove_associativity("f", &[x()], &[Expr::int(2).add(f(Type::I32))]);
    assert!(op.associative);
    assert_eq!(op.ys[0].expr.as_int(), Some(2));
}

#[test]
fn test_difference_becomes_sum_of_negation() {
    let op = prove_associativity("f", &[x()], &[f(Type::I32).sub(Expr::var("y"))]);
    assert!(op.associative);
    assert_eq!(op.ops[0].to_string(), "(f$x0 + f$y0)");
    assert_eq!(eval_with(&op.ys[0].expr, &[("y", 5)]).as_i64(), Some(-5));
}

#[test]
fn test_max_identity_is_type_min() {
    let op = prove_associativity("f", &[x()], &[f(Type::U8).max(Expr::typed_var(Type::U8, "v"))]);
    assert!(op.associative);
    assert!(op.identities[0].is_zero());
}

#[test]
fn test_logical_reductions() {
    let c = Expr::var("y").cmp_gt(0);
    let op = prove_associativity("f", &[x()], &[f(Type::BOOL).and(&c)]);
    assert!(op.associative);
    assert!(op.identities[0].is_true());

    let op = prove_associativity("f", &[x()], &[f(Type::BOOL).or(&c)]);
    assert!(op.associative);
    assert!(op.identities[0].is_false());
}

#[test]
fn test_tuple_elements_are_proven_separately() {
    let update = [f_at(Type::I32, 0, x()).add(g()), f_at(Type::I32, 1, x()).max(Expr::var("y"))];
    let op = prove_associativity("f", &[x()], &update);
    assert!(op.associative);
    assert_eq!(op.size(), 2);
    assert_eq!(op.ops[1].to_string(), "max(f$x1, f$y1)");
    assert_eq!(op.ys[1].expr.to_string(), "y");
}

#[test]
fn test_constant_update_is_not_associative() {
    assert!(!prove_associativity("f", &[x()], &[Expr::int(3)]).associative);
}

#[test]
fn test_self_assignment_is_not_associative() {
    assert!(!prove_associativity("f", &[x()], &[f(Type::I32)]).associative);
}

#[test]
fn test_shifted_self_reference_is_not_associative() {
    let update = f_at(Type::I32, 0, x().sub(1)).add(1);
    assert!(!prove_associativity("f", &[x()], &[update]).associative);
}

#[test]
fn test_self_reference_in_select_condition() {
    let update = Expr::select(f(Type::I32).cmp_gt(0), f(Type::I32), Expr::int(0));
    assert!(!prove_associativity("f", &[x()], &[update]).associative);
}

#[test]
fn test_cross_tuple_dependency_is_rejected() {
    let update = [f_at(Type::I32, 1, x()).add(1), f_at(Type::I32, 1, x()).add(2)];
    assert!(!prove_associativity("f", &[x()], &update).associative);
}

#[test]
fn test_nonlinear_self_reference_is_rejected() {
    assert!(!prove_associativity("f", &[x()], &[f(Type::I32).mul(f(Type::I32))]).associative);
}

#[test]
fn test_lets_in_update_are_seen_through() {
    let update = Expr::let_in("t", g().mul(2), f(Type::I32).add(Expr::var("t")));
    let op = prove_associativity("f", &[x()], &[update]);
    assert!(op.associative);
    assert_eq!(op.ys[0].expr.to_string(), "(g(x)*2)");
}
