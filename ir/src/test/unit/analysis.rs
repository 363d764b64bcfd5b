use std::collections::BTreeSet;

use crate::analysis::{
    calls_function, expr_uses_var, find_data_accesses, free_variables, loaded_buffers, stored_buffers, substitute,
    substitute_expr,
};
use crate::expr::Expr;
use crate::stmt::Stmt;
use crate::Type;

#[test]
fn test_free_variables_skip_let_bound() {
    let e = Expr::let_in("t", Expr::var("x").add(1), Expr::var("t").mul(Expr::var("y")));
    let vars = free_variables(&e);
    assert_eq!(vars, BTreeSet::from(["x".to_string(), "y".to_string()]));
    assert!(!expr_uses_var(&e, "t"));
    assert!(expr_uses_var(&e, "y"));
}

#[test]
fn test_substitute_respects_shadowing() {
    let e = Expr::var("x").add(Expr::let_in("x", Expr::int(1), Expr::var("x")));
    let s = substitute("x", &Expr::var("z"), &e);
    assert_eq!(s.to_string(), "(z + (let x = 1 in x))");
}

#[test]
fn test_substitute_expr_matches_structure() {
    let e = Expr::var("x").add(1).mul(Expr::var("x").add(1));
    let s = substitute_expr(&Expr::var("x").add(1), &Expr::var("t"), &e);
    assert_eq!(s.to_string(), "(t*t)");
}

#[test]
fn test_find_data_accesses() {
    let e = Expr::func_call(Type::I32, "f", [Expr::var("x")], 0)
        .add(Expr::image_call(Type::I32, "in", [Expr::var("x")]))
        .add(Expr::extern_call(Type::F32, "sqrt_f32", [Expr::float(2.0)]).cast(Type::I32));
    let names: Vec<String> = find_data_accesses(&e).into_keys().collect();
    assert_eq!(names, vec!["f".to_string(), "in".to_string()]);
    assert!(calls_function(&e, "f"));
    assert!(!calls_function(&e, "sqrt_f32"));
}

#[test]
fn test_buffers_touched_by_stmt() {
    let s = Stmt::block(
        Stmt::store("a", Expr::load(Type::I32, "b", Expr::var("i")), Expr::var("i")),
        Stmt::store("c", Expr::load(Type::I32, "a", Expr::int(0)), Expr::int(0)),
    );
    assert_eq!(stored_buffers(&s), BTreeSet::from(["a".to_string(), "c".to_string()]));
    assert_eq!(loaded_buffers(&s), BTreeSet::from(["a".to_string(), "b".to_string()]));
}
