use std::sync::Arc;

use test_case::test_case;

use crate::bounds::{Interval, Region, bounds_of_expr_in_scope, box_intersection, box_union, boxes_required};
use crate::expr::Expr;
use crate::scope::Scope;
use crate::Type;

fn x() -> Arc<Expr> {
    Expr::var("x")
}

fn scope() -> Scope<Interval> {
    let mut scope = Scope::new();
    scope.push("x", Interval::bounded(Expr::int(0), Expr::int(9)));
    scope.push("y", Interval::bounded(Expr::int(0), Expr::int(3)));
    scope
}

fn constant_range(i: &Interval) -> (i64, i64) {
    let lo = i.min_expr().and_then(|e| e.as_int()).expect("constant lower bound");
    let hi = i.max_expr().and_then(|e| e.as_int()).expect("constant upper bound");
    (lo, hi)
}

#[test_case(x().mul(2).add(1), (1, 19) ; "affine")]
#[test_case(x().sub(Expr::var("y")), (-3, 9) ; "difference")]
#[test_case(x().mul(-1), (-9, 0) ; "negative scale")]
#[test_case(x().div(2), (0, 4) ; "division")]
#[test_case(x().modulo(4), (0, 3) ; "modulo")]
#[test_case(Expr::var("y").modulo(8), (0, 3) ; "modulo in range")]
#[test_case(x().min(5), (0, 5) ; "min")]
#[test_case(x().max(Expr::var("y")), (0, 9) ; "max")]
#[test_case(x().mul(Expr::var("y")), (0, 27) ; "product")]
#[test_case(Expr::select(x().cmp_lt(5), x(), Expr::int(10)), (0, 10) ; "select")]
#[test_case(Expr::let_in("t", x().add(1), Expr::var("t").mul(2)), (2, 20) ; "let")]
fn test_constant_bounds(e: Arc<Expr>, expected: (i64, i64)) {
    let interval = bounds_of_expr_in_scope(&e, &scope());
    assert_eq!(constant_range(&interval), expected);
}

#[test]
fn test_comparison_decided_by_bounds() {
    let interval = bounds_of_expr_in_scope(&x().cmp_lt(10), &scope());
    assert!(interval.is_single_point());
    assert!(interval.min_expr().is_some_and(|e| e.is_true()));
}

#[test]
fn test_symbolic_bounds() {
    let mut scope = Scope::new();
    scope.push("x", Interval::bounded(Expr::int(0), Expr::var("n").sub(1)));
    let interval = bounds_of_expr_in_scope(&x().add(1), &scope);
    assert_eq!(interval.min_expr().map(|e| e.to_string()), Some("1".to_string()));
    assert_eq!(interval.max_expr().map(|e| e.to_string()), Some("n".to_string()));
}

#[test]
fn test_free_variable_is_single_point() {
    let interval = bounds_of_expr_in_scope(&Expr::var("z").add(1), &Scope::new());
    assert!(interval.is_single_point());
    assert_eq!(interval.min_expr().map(|e| e.to_string()), Some("(z + 1)".to_string()));
}

#[test]
fn test_unbounded_load() {
    let e = Expr::load(Type::I32, "buf", x());
    let interval = bounds_of_expr_in_scope(&e, &scope());
    assert!(!interval.is_bounded());
}

#[test]
fn test_boxes_required() {
    let f = |a: Arc<Expr>, b: Arc<Expr>| Expr::func_call(Type::I32, "f", [a, b], 0);
    let e = f(x(), x().add(1)).add(f(x().add(2), Expr::int(0)));
    let boxes = boxes_required(&e, &scope());
    let region = &boxes["f"];
    assert_eq!(region.dimensions(), 2);
    assert_eq!(constant_range(&region[0]), (0, 11));
    assert_eq!(constant_range(&region[1]), (0, 10));
}

#[test]
fn test_boxes_required_through_let() {
    let e = Expr::let_in("t", x().mul(2), Expr::image_call(Type::U8, "input", [Expr::var("t")]));
    let boxes = boxes_required(&e, &scope());
    assert_eq!(constant_range(&boxes["input"][0]), (0, 18));
}

#[test]
fn test_box_union_and_intersection() {
    let span = |lo: i64, hi: i64| Interval::bounded(Expr::int(lo), Expr::int(hi));
    let a = Region::new(vec![span(0, 4), span(0, 9)]);
    let b = Region::new(vec![span(2, 8), span(5, 6)]);
    let u = box_union(&a, &b);
    assert_eq!(constant_range(&u[0]), (0, 8));
    assert_eq!(constant_range(&u[1]), (0, 9));
    let i = box_intersection(&a, &b);
    assert_eq!(constant_range(&i[0]), (2, 4));
    assert_eq!(constant_range(&i[1]), (5, 6));
}

#[test]
fn test_interval_union_with_infinite() {
    let a = Interval::bounded(Expr::int(0), Expr::int(4));
    let u = a.union(&Interval::bounded_below(Expr::int(2)));
    assert_eq!(u.min_expr().and_then(|e| e.as_int()), Some(0));
    assert!(!u.has_upper_bound());
    assert!(Interval::nothing().union(&a) == a);
}
