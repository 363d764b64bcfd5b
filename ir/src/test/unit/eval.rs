use std::sync::Arc;

use test_case::test_case;

use crate::eval::{Machine, eval_with, points};
use crate::expr::{Expr, ReductionDomain, ReductionVariable};
use crate::func::{Env, Function};
use crate::stmt::Stmt;
use crate::types::{ConstValue, Intrinsic, runtime};
use crate::Type;

fn x() -> Arc<Expr> {
    Expr::var("x")
}

#[test_case(x().div(2), -4 ; "euclidean div")]
#[test_case(x().modulo(2), 1 ; "euclidean mod")]
#[test_case(x().div(0), 0 ; "div by zero")]
#[test_case(x().modulo(0), 0 ; "mod by zero")]
#[test_case(x().mul(3).add(1), -20 ; "affine")]
#[test_case(Expr::select(x().cmp_lt(0), Expr::int(1), Expr::int(2)), 1 ; "select")]
#[test_case(Expr::let_in("t", x().neg(), Expr::var("t").add(1)), 8 ; "let")]
fn test_eval_int(e: Arc<Expr>, expected: i64) {
    assert_eq!(eval_with(&e, &[("x", -7)]), ConstValue::Int(expected));
}

#[test]
fn test_eval_wraps_narrow_types() {
    let a = Expr::make_const(Type::U8, 250).add(Expr::make_const(Type::U8, 10));
    assert_eq!(eval_with(&a, &[]), ConstValue::UInt(4));
}

#[test]
fn test_eval_extern_math() {
    let e = Expr::extern_call(Type::F32, "sqrt_f32", [Expr::float(16.0)]);
    assert_eq!(eval_with(&e, &[]), ConstValue::Float(4.0));
}

#[test]
fn test_points_first_dimension_fastest() {
    assert_eq!(points(&[(0, 2), (5, 2)]), vec![vec![0, 5], vec![1, 5], vec![0, 6], vec![1, 6]]);
    assert_eq!(points(&[]), vec![Vec::<i64>::new()]);
}

#[test]
fn test_exec_loop_and_buffers() {
    let env = Env::new();
    let mut m = Machine::new(&env);
    let body = Stmt::store("out", Expr::load(Type::I32, "in", x()).mul(2), x());
    m.set_buffer("in", (0..4).map(|i| (i, ConstValue::Int(i + 10))));
    m.exec(&Stmt::serial("x", Expr::int(0), Expr::int(4), body));
    let out: Vec<_> = m.buffer("out").unwrap().values().copied().collect();
    assert_eq!(out, vec![ConstValue::Int(20), ConstValue::Int(22), ConstValue::Int(24), ConstValue::Int(26)]);
}

#[test]
fn test_exec_allocation_is_scoped() {
    let env = Env::new();
    let mut m = Machine::new(&env);
    let body = Stmt::block(
        Stmt::store("tmp", Expr::int(5), Expr::int(0)),
        Stmt::store("out", Expr::load(Type::I32, "tmp", Expr::int(0)).add(1), Expr::int(0)),
    );
    let s = Stmt::allocate("tmp", Type::I32, Default::default(), vec![Expr::int(1)], Expr::const_true(), body);
    m.exec(&s);
    assert_eq!(m.buffer("out").unwrap()[&0], ConstValue::Int(6));
    assert!(m.buffer("tmp").is_none());
}

#[test]
#[should_panic(expected = "deadlock")]
fn test_acquire_without_permits_deadlocks() {
    let env = Env::new();
    let mut m = Machine::new(&env);
    let sema = Expr::intrinsic(Intrinsic::Alloca, Type::HANDLE, [Expr::int(16)]);
    let s = Stmt::let_stmt("sema", sema, Stmt::acquire(Expr::var("sema"), Expr::int(1), Stmt::no_op()));
    m.exec(&s);
}

#[test]
fn test_release_then_acquire() {
    let env = Env::new();
    let mut m = Machine::new(&env);
    let sema = Expr::typed_var(Type::HANDLE, "sema");
    let release_call = Expr::extern_call(Type::I32, runtime::SEMAPHORE_RELEASE, [sema.clone(), Expr::int(1)]);
    let release = Stmt::evaluate(release_call);
    let consume = Stmt::acquire(sema, Expr::int(1), Stmt::store("out", Expr::int(1), Expr::int(0)));
    let make = Expr::extern_call(Type::HANDLE, runtime::MAKE_SEMAPHORE, [Expr::int(0)]);
    m.exec(&Stmt::let_stmt("sema", make, Stmt::fork(release, consume)));
    assert_eq!(m.buffer("out").unwrap()[&0], ConstValue::Int(1));
}

#[test]
fn test_call_pure_function() {
    let f = Function::pure("f", &["x", "y"], vec![x().mul(10).add(Expr::var("y"))]).unwrap();
    let env: Env = [f].into_iter().collect();
    let mut m = Machine::new(&env);
    let call = Expr::func_call(Type::I32, "f", [Expr::int(3), Expr::int(4)], 0);
    assert_eq!(m.eval(&call), ConstValue::Int(34));
}

#[test]
fn test_realize_prefix_sum() {
    let r = ReductionDomain::new(vec![ReductionVariable { var: "r".into(), min: Expr::int(1), extent: Expr::int(4) }]);
    let rv = Expr::rvar("r", &r);
    let mut f = Function::pure("f", &["x"], vec![x()]).unwrap();
    let prev = Expr::func_call(Type::I32, "f", [rv.sub(1)], 0);
    let cur = Expr::func_call(Type::I32, "f", [rv.clone()], 0);
    f.define_update(vec![rv], vec![prev.add(cur)]).unwrap();
    let env: Env = [f].into_iter().collect();

    let mut m = Machine::new(&env);
    m.realize("f", &[(0, 5)]);
    let values: Vec<_> = m.realization("f", 0).unwrap().values().copied().collect();
    let expected: Vec<_> = [0, 1, 3, 6, 10].into_iter().map(ConstValue::Int).collect();
    assert_eq!(values, expected);
}

#[test]
fn test_realize_skips_false_predicate() {
    let r = ReductionDomain::new(vec![ReductionVariable { var: "r".into(), min: Expr::int(0), extent: Expr::int(6) }]);
    let rv = Expr::rvar("r", &r);
    let r = r.with_predicate(rv.modulo(2).cmp_eq(0));
    let rv = Expr::rvar("r", &r);
    let mut f = Function::pure("f", &["x"], vec![Expr::int(0)]).unwrap();
    f.define_update(vec![rv.clone()], vec![rv]).unwrap();
    let env: Env = [f].into_iter().collect();

    let mut m = Machine::new(&env);
    m.realize("f", &[(0, 6)]);
    let values: Vec<_> = m.realization("f", 0).unwrap().values().copied().collect();
    let expected: Vec<_> = [0, 0, 2, 0, 4, 0].into_iter().map(ConstValue::Int).collect();
    assert_eq!(values, expected);
}
