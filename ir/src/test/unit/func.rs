use std::sync::Arc;

use crate::error::Error;
use crate::expr::{Expr, ReductionDomain, ReductionVariable};
use crate::func::{Env, Function, find_direct_calls, inline_function, realization_order};
use crate::Type;

fn call(name: &str, args: Vec<Arc<Expr>>) -> Arc<Expr> {
    Expr::func_call(Type::I32, name, args, 0)
}

fn rdom(min: i64, extent: i64) -> ReductionDomain {
    ReductionDomain::new(vec![ReductionVariable { var: "r".into(), min: Expr::int(min), extent: Expr::int(extent) }])
}

#[test]
fn test_define_pure() {
    let f = Function::pure("f", &["x", "y"], vec![Expr::var("x").add(Expr::var("y"))]).unwrap();
    assert_eq!(f.dimensions(), 2);
    assert_eq!(f.outputs(), 1);
    assert_eq!(f.output_types(), &[Type::I32]);
    assert!(f.can_be_inlined());
    assert_eq!(f.num_stages(), 1);
}

#[test]
fn test_define_twice_fails() {
    let mut f = Function::pure("f", &["x"], vec![Expr::var("x")]).unwrap();
    let err = f.define(&["x"], vec![Expr::int(0)]).unwrap_err();
    assert_eq!(err, Error::AlreadyDefined { name: "f".into() });
}

#[test]
fn test_duplicate_argument() {
    let err = Function::pure("f", &["x", "x"], vec![Expr::var("x")]).unwrap_err();
    assert!(matches!(err, Error::DuplicateArgument { arg, .. } if arg == "x"));
}

#[test]
fn test_pure_self_reference() {
    let err = Function::pure("f", &["x"], vec![call("f", vec![Expr::var("x")]).add(1)]).unwrap_err();
    assert!(matches!(err, Error::PureSelfReference { .. }));
}

#[test]
fn test_update_before_definition() {
    let mut f = Function::new("f");
    let err = f.define_update(vec![Expr::int(0)], vec![Expr::int(1)]).unwrap_err();
    assert!(matches!(err, Error::UpdateBeforeDefinition { .. }));
}

#[test]
fn test_update_arity_checks() {
    let mut f = Function::pure("f", &["x"], vec![Expr::int(0)]).unwrap();
    let err = f.define_update(vec![Expr::int(0), Expr::int(1)], vec![Expr::int(1)]).unwrap_err();
    assert!(matches!(err, Error::ArgCountMismatch { expected: 1, actual: 2, .. }));
    let err = f.define_update(vec![Expr::int(0)], vec![Expr::int(1), Expr::int(2)]).unwrap_err();
    assert!(matches!(err, Error::TupleSizeMismatch { expected: 1, actual: 2, .. }));
    let bad_self_call = call("f", vec![Expr::int(0), Expr::int(1)]);
    let err = f.define_update(vec![Expr::int(0)], vec![bad_self_call]).unwrap_err();
    assert!(matches!(err, Error::ArgCountMismatch { expected: 1, actual: 2, .. }));
}

#[test]
fn test_reduction_update_dims() {
    let r = rdom(0, 10);
    let mut f = Function::pure("f", &["x"], vec![Expr::int(0)]).unwrap();
    let value = call("f", vec![Expr::var("x")]).add(Expr::rvar("r", &r));
    f.define_update(vec![Expr::var("x")], vec![value]).unwrap();

    let update = f.update(0).unwrap();
    assert!(update.is_update());
    assert_eq!(update.rdom.as_ref(), Some(&r));
    let dims: Vec<&str> = update.schedule.dims.iter().map(|d| d.var.as_str()).collect();
    assert_eq!(dims, vec!["r", "x"]);
    assert!(!f.can_be_inlined());
}

#[test]
fn test_realization_order_is_topological() {
    let a = Function::pure("a", &["x"], vec![Expr::var("x")]).unwrap();
    let b = Function::pure("b", &["x"], vec![call("a", vec![Expr::var("x")])]).unwrap();
    let c = Function::pure("c", &["x"], vec![call("a", vec![Expr::var("x")]).add(call("b", vec![Expr::var("x")]))])
        .unwrap();
    let env: Env = [c, b, a].into_iter().collect();
    assert_eq!(realization_order(&["c"], &env).unwrap(), vec!["a", "b", "c"]);
    assert_eq!(find_direct_calls(env.lookup("c").unwrap()).len(), 2);
}

#[test]
fn test_realization_order_detects_cycles() {
    let f = Function::pure("f", &["x"], vec![call("g", vec![Expr::var("x")])]).unwrap();
    let g = Function::pure("g", &["x"], vec![call("f", vec![Expr::var("x")])]).unwrap();
    let env: Env = [f, g].into_iter().collect();
    assert!(matches!(realization_order(&["f"], &env), Err(Error::CyclicPipeline { .. })));
}

#[test]
fn test_undefined_output() {
    let env = Env::new();
    assert!(matches!(realization_order(&["missing"], &env), Err(Error::UndefinedFunction { .. })));
}

#[test]
fn test_inline_function() {
    let f = Function::pure("f", &["x"], vec![Expr::var("x").mul(2)]).unwrap();
    let e = call("f", vec![call("f", vec![Expr::var("y")]).add(1)]);
    assert_eq!(inline_function(&e, &f).to_string(), "(((y*2) + 1)*2)");
}

#[test]
fn test_env_insert_replaces_by_name() {
    let mut env = Env::new();
    let first = env.insert(Function::pure("f", &["x"], vec![Expr::int(1)]).unwrap());
    let second = env.insert(Function::pure("f", &["x"], vec![Expr::int(2)]).unwrap());
    assert_eq!(first, second);
    assert_eq!(env.len(), 1);
    assert_eq!(env.get(first).values()[0].as_int(), Some(2));
}
