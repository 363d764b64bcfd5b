use std::collections::HashMap;
use std::sync::Arc;

use kiln_ir::eval::eval_with;
use kiln_ir::{Expr, Interval, NameGen, ReductionDomain, ReductionVariable, Region, Type};
use test_case::test_case;

use crate::derivative::utils::*;
use crate::error::Error;
use crate::test::helpers::*;

fn rdom(vars: &[(&str, i64, i64)]) -> ReductionDomain {
    ReductionDomain::new(
        vars.iter()
            .map(|(v, min, extent)| ReductionVariable {
                var: v.to_string(),
                min: Expr::int(*min),
                extent: Expr::int(*extent),
            })
            .collect(),
    )
}

#[test]
fn test_gather_variables_keeps_first_occurrence_order() {
    let e = var("y").add(var("x")).mul(var("y")).add(var("z"));
    assert_eq!(gather_variables(&e, &["x", "y"]), vec!["y".to_string(), "x".to_string()]);
    assert!(gather_variables(&e, &["w"]).is_empty());
}

#[test]
fn test_gather_rvariables_reports_position_in_domain() {
    let r = rdom(&[("r0", 0, 4), ("r1", 2, 3)]);
    let e = r.var(1).add(var("x")).mul(r.var(0));
    let found = gather_rvariables(&e);
    assert_eq!(found.len(), 2);
    let r1 = &found["r1"];
    assert_eq!(r1.index, 1);
    assert_eq!(r1.min.as_int(), Some(2));
    assert_eq!(r1.extent.as_int(), Some(3));
    assert_eq!(r1.domain, r);
    assert!(!found.contains_key("x"));
}

#[test]
fn test_add_let_expression_wraps_only_needed_lets() {
    let lets: HashMap<String, Arc<Expr>> = [("t", var("x").add(1)), ("u", var("t").mul(2)), ("w", var("y"))]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
    let order = vec!["t".to_string(), "u".to_string(), "w".to_string()];
    let wrapped = add_let_expression(&var("u").add(3), &lets, &order);
    assert_eq!(wrapped.to_string(), "(let t = (x + 1) in (let u = (t*2) in (u + 3)))");
    assert_eq!(eval_with(&wrapped, &[("x", 4)]).as_i64(), Some(13));
}

#[test]
fn test_sort_expressions_puts_operands_first() {
    let x = var("x");
    let sum = x.add(&x);
    let e = sum.mul(&x);
    let sorted = sort_expressions(&[e.clone()]);
    let position = |n: &Arc<Expr>| sorted.iter().position(|s| s.id == n.id).expect("node present");
    assert!(position(&x) < position(&sum));
    assert!(position(&sum) < position(&e));
    // Shared nodes appear once.
    assert_eq!(sorted.iter().filter(|s| s.id == x.id).count(), 1);
}

#[test]
fn test_let_bindings_in_order() {
    let e = Expr::let_in("a", var("x"), Expr::let_in("b", var("a").add(1), var("b")));
    let (map, order) = let_bindings(&[e]);
    assert_eq!(order, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(map["b"].to_string(), "(a + 1)");
}

#[test]
fn test_inference_bounds_of_a_stencil() {
    let x = var("x");
    let f = func("f", &["x"], image("a", x.sub(1)).add(image("a", x.add(2))));
    let g = func("g", &["x"], call("f", [x.mul(2)]));
    let env = env_of([f, g]);
    let order = vec!["f".to_string(), "g".to_string()];
    let bounds = inference_bounds(&env, &order, "g", &[(Expr::int(0), Expr::int(9))]).unwrap();

    let constant = |name: &str| constant_region(&bounds[name]);
    assert_eq!(constant("g"), vec![(0, 10)]);
    assert_eq!(constant("f"), vec![(0, 19)]);
    assert_eq!(constant("a"), vec![(-1, 22)]);
}

#[test]
fn test_inference_bounds_covers_reduction_domains() {
    let r = rdom(&[("r", 0, 5)]);
    let mut h = func("h", &["x"], Expr::make_zero(FLOAT));
    h.define_update(vec![var("x")], vec![call("h", [var("x")]).add(image("a", var("x").add(r.var(0))))]).unwrap();
    let env = env_of([h]);
    let bounds = inference_bounds(&env, &["h".to_string()], "h", &[(Expr::int(0), Expr::int(3))]).unwrap();
    assert_eq!(constant_region(&bounds["a"]), vec![(0, 8)]);
}

#[test]
fn test_inference_bounds_rejects_unbounded_reads() {
    let index = Expr::image_call(Type::I32, "idx", [var("x")]);
    let env = env_of([func("f", &["x"], image("a", index))]);
    let err = inference_bounds(&env, &["f".to_string()], "f", &[(Expr::int(0), Expr::int(3))]).unwrap_err();
    assert!(matches!(err, Error::UnboundedAccess { ref name, .. } if name == "a"), "{err}");
}

#[test]
fn test_box_to_vector() {
    let region: Region = [Interval::bounded(Expr::int(0), Expr::int(7)), Interval::bounded(Expr::int(-1), Expr::int(1))]
        .into_iter()
        .collect();
    let pairs = box_to_vector(&region).expect("bounded");
    assert_eq!(pairs.len(), 2);
    assert_eq!(pairs[1].0.as_int(), Some(-1));
    assert_eq!(pairs[0].1.as_int(), Some(7));

    let open: Region = [Interval::everything()].into_iter().collect();
    assert!(box_to_vector(&open).is_none());
}

#[test]
fn test_solve_inverse_of_a_shift_is_a_single_point() {
    let names = NameGen::new();
    let solution = solve_inverse(&var("u").cmp_eq(var("x").add(3)), "x", &names).expect("invertible");
    assert!(gather_rvariables(&solution).is_empty());
    assert_eq!(eval_with(&solution, &[("u", 10)]).as_i64(), Some(7));
}

#[test]
fn test_solve_inverse_of_a_division_iterates_the_preimage() {
    let names = NameGen::new();
    let solution = solve_inverse(&var("u").cmp_eq(var("x").div(2)), "x", &names).expect("invertible");
    let rvars = gather_rvariables(&solution);
    assert_eq!(rvars.len(), 1);
    let info = rvars.values().next().expect("one reduction variable");
    assert_eq!(info.extent.as_int(), Some(2));
    assert!(info.name.starts_with("x_inv"));
    for (r, expected) in [(0, 6), (1, 7)] {
        assert_eq!(eval_with(&solution, &[("u", 3), (info.name.as_str(), r)]).as_i64(), Some(expected));
    }
}

#[test]
fn test_solve_inverse_gives_up_on_unbounded_solutions() {
    let names = NameGen::new();
    assert!(solve_inverse(&var("u").cmp_eq(var("x").modulo(4)), "x", &names).is_none());
}

#[test]
fn test_find_buffer_param_calls() {
    let x = var("x");
    let two_d = Expr::image_call(FLOAT, "b", [x.clone(), x.add(1)]);
    let value = image("a", x).add(two_d).mul(Expr::param(FLOAT, "p"));
    let f = func("f", &["x"], value);
    let found = find_buffer_param_calls(&f);
    assert_eq!(found.len(), 3);
    assert_eq!(found["a"].dimensions, 1);
    assert_eq!(found["b"].dimensions, 2);
    assert!(found["p"].is_param);
    assert_eq!(found["p"].ty, FLOAT);
}

#[test]
fn test_find_implicit_variables() {
    let e = var("_0").add(var("_12")).add(var("x_0")).add(var("_"));
    let found: Vec<String> = find_implicit_variables(&e).into_iter().collect();
    assert_eq!(found, vec!["_0".to_string(), "_12".to_string()]);
}

#[test]
fn test_substitute_rdom_predicate_rewrites_the_domain() {
    let r = rdom(&[("r", 0, 4)]).with_predicate(var("r").cmp_lt(var("u")));
    let e = r.var(0).add(var("u"));
    let replaced = substitute_rdom_predicate("u", &Expr::int(2), &e);
    let info = gather_rvariables(&replaced).remove("r").expect("r survives");
    assert_eq!(info.domain.id(), r.id());
    assert_eq!(info.domain.predicate().to_string(), "(r < 2)");
    assert!(!has_variable(&replaced, "u"));
}

#[test]
fn test_is_calling_function_through_lets() {
    let lets: HashMap<String, Arc<Expr>> = [("t".to_string(), call("f", [var("x")]))].into_iter().collect();
    assert!(is_calling_function("f", &var("t").add(1.0), &lets));
    assert!(is_calling_function("f", &call("f", [var("y")]), &HashMap::new()));
    assert!(!is_calling_function("g", &var("t").add(1.0), &lets));
}

#[test_case("sin", "sin", true; "exact")]
#[test_case("sin_f32", "sin", true; "f32")]
#[test_case("sin_f64", "sin", true; "f64")]
#[test_case("sin_f16", "sin", true; "f16")]
#[test_case("sinh", "sin", false; "longer name")]
#[test_case("asin", "sin", false; "prefixed name")]
#[test_case("sin_i32", "sin", false; "integer suffix")]
fn test_is_float_extern(op: &str, base: &str, expected: bool) {
    assert_eq!(is_float_extern(op, base), expected);
}
