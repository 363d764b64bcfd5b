use std::collections::BTreeMap;
use std::sync::Arc;

use kiln_ir::eval::Machine;
use kiln_ir::{Expr, ReductionDomain, ReductionVariable};

use crate::derivative::{forward_accumulation, propagate_tangents};
use crate::error::Error;
use crate::test::helpers::*;

fn tangent_of_a() -> BTreeMap<String, String> {
    [("a".to_string(), "da".to_string())].into_iter().collect()
}

/// Direction in which `a` varies: `da(x) = x + 1`.
fn direction() -> kiln_ir::Function {
    func("da", &["x"], var("x").add(1).cast(FLOAT))
}

fn eval_at(m: &mut Machine<'_>, e: &Arc<Expr>, x: i64) -> f64 {
    m.eval(&Expr::let_in("x", Expr::int(x), e.clone())).as_f64()
}

#[test]
fn test_product_tangent() {
    let x = var("x");
    let e = image("a", x.clone()).mul(image("a", x));
    let tangent = forward_accumulation(&e, &tangent_of_a()).unwrap();

    let env = env_of([direction()]);
    let mut m = Machine::new(&env);
    m.set_image("a", samples_1d(0, &[0.5, 1.5, -2.0]));
    for (i, a) in [0.5, 1.5, -2.0].into_iter().enumerate() {
        let expected = 2.0 * a * (i as f64 + 1.0);
        assert_eq!(eval_at(&mut m, &tangent, i as i64), expected);
    }
}

#[test]
fn test_reads_without_tangent_are_constant() {
    let e = image("b", var("x")).mul(3.0);
    let tangent = forward_accumulation(&e, &tangent_of_a()).unwrap();
    let env = env_of([direction()]);
    let mut m = Machine::new(&env);
    m.set_image("b", samples_1d(0, &[0.5, 1.5]));
    assert_eq!(eval_at(&mut m, &tangent, 1), 0.0);
}

#[test]
fn test_let_binds_its_tangent() {
    // let t = a(x)*2 in t*t
    let t = Expr::typed_var(FLOAT, "t");
    let e = Expr::let_in("t", image("a", var("x")).mul(2.0), t.mul(&t));
    let tangent = forward_accumulation(&e, &tangent_of_a()).unwrap();
    assert!(tangent.to_string().contains("let t.fwd = "), "{tangent}");

    let env = env_of([direction()]);
    let mut m = Machine::new(&env);
    m.set_image("a", samples_1d(0, &[0.5, 1.5]));
    // d/ds (2a)^2 = 8 a da
    assert_eq!(eval_at(&mut m, &tangent, 1), 8.0 * 1.5 * 2.0);
}

#[test]
fn test_math_tangent_uses_the_chain_rule() {
    let e = math("sin", [image("a", var("x"))]);
    let tangent = forward_accumulation(&e, &tangent_of_a()).unwrap();
    let env = env_of([direction()]);
    let mut m = Machine::new(&env);
    m.set_image("a", samples_1d(0, &[0.3]));
    let got = eval_at(&mut m, &tangent, 0);
    assert!((got - 0.3_f64.cos()).abs() < 1e-12, "{got}");
}

#[test]
fn test_unknown_extern_has_no_tangent() {
    let e = math("erf", [image("a", var("x"))]);
    let err = forward_accumulation(&e, &tangent_of_a()).unwrap_err();
    assert!(matches!(err, Error::UnknownExternDerivative { .. }));
}

#[test]
fn test_propagate_tangents_through_a_pipeline() {
    // f(x) = 3*a(x); g(x) = f(x) + f(x + 1)
    let x = var("x");
    let f = func("f", &["x"], image("a", x.clone()).mul(3.0));
    let g = func("g", &["x"], call("f", [x.clone()]).add(call("f", [x.add(1)])));
    let env = env_of([f, g]);
    let tangents = propagate_tangents(&env, "g", &tangent_of_a()).unwrap();
    let names: Vec<&str> = tangents.iter().map(|t| t.name()).collect();
    assert_eq!(names, vec!["f_fwd", "g_fwd"]);

    let mut full = env.clone();
    full.insert(direction());
    for t in tangents {
        full.insert(t);
    }
    let mut m = Machine::new(&full);
    m.set_image("a", samples_1d(0, &[0.0; 4]));
    for x in 0..3 {
        // 3*da(x) + 3*da(x + 1)
        assert_eq!(read(&mut m, "g_fwd", &[x]), 3.0 * (x as f64 + 1.0) + 3.0 * (x as f64 + 2.0));
    }
}

#[test]
fn test_propagate_tangents_carries_updates() {
    // h(x) = a(x); h(x) = h(x) * 2 + a(r) for r in [0, 2)
    let r = ReductionDomain::new(vec![ReductionVariable { var: "r".into(), min: Expr::int(0), extent: Expr::int(2) }]);
    let x = var("x");
    let mut h = func("h", &["x"], image("a", x.clone()));
    h.define_update(vec![x.clone()], vec![call("h", [x]).mul(2.0).add(image("a", r.var(0)))]).unwrap();
    let env = env_of([h]);
    let tangents = propagate_tangents(&env, "h", &tangent_of_a()).unwrap();
    let h_fwd = tangents.into_iter().next().expect("tangent of h");
    assert_eq!(h_fwd.updates().len(), 1);

    let mut full = env.clone();
    full.insert(direction());
    full.insert(h_fwd);
    let mut m = Machine::new(&full);
    m.set_image("a", samples_1d(0, &[0.0; 4]));
    m.realize("h", &[(0, 2)]);
    m.realize("h_fwd", &[(0, 2)]);
    // Tangent recurrence: dh <- 2*dh + da(r), starting from da(x).
    // x = 0: 1 -> 2 + 1 = 3 -> 6 + 2 = 8.
    assert_eq!(read(&mut m, "h_fwd", &[0]), 8.0);
}
