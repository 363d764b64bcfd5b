use crate::cse::common_subexpression_elimination;
use crate::eval::eval_with;
use crate::expr::Expr;

#[test]
fn test_repeated_subexpression_is_lifted() {
    let x1 = Expr::var("x").add(1);
    let e = x1.mul(&x1);
    let c = common_subexpression_elimination(&e);
    assert_eq!(c.to_string(), "(let t0 = (x + 1) in (t0*t0))");
}

#[test]
fn test_single_use_is_not_lifted() {
    let e = Expr::var("x").add(1).mul(Expr::var("y"));
    assert_eq!(common_subexpression_elimination(&e).to_string(), "((x + 1)*y)");
}

#[test]
fn test_lifted_name_avoids_free_variables() {
    let t = Expr::var("t0").add(2);
    let e = t.mul(&t);
    let c = common_subexpression_elimination(&e);
    assert_eq!(c.to_string(), "(let t1 = (t0 + 2) in (t1*t1))");
}

#[test]
fn test_existing_lets_are_reintroduced_by_use_count() {
    let e = Expr::let_in("a", Expr::var("x").mul(3), Expr::var("a").add(Expr::var("a")));
    let c = common_subexpression_elimination(&e);
    assert_eq!(c.to_string(), "(let t0 = (x*3) in (t0 + t0))");
}

#[test]
fn test_shared_dag_keeps_value() {
    let mut e = Expr::var("x");
    for _ in 0..12 {
        e = e.add(&e).sub(1);
    }
    let c = common_subexpression_elimination(&e);
    for x in [-3, 0, 5] {
        assert_eq!(eval_with(&e, &[("x", x)]), eval_with(&c, &[("x", x)]));
    }
}
