//! Laws that every operator found by `prove_associativity` must satisfy.

use std::sync::Arc;

use kiln_ir::eval::{Machine, eval_with};
use kiln_ir::proptest_gen::arb_int_expr;
use kiln_ir::{BinOp, Env, Expr, Function, simplify, substitute};
use proptest::prelude::*;

use crate::associativity::prove_associativity;

const VALUES: [i64; 6] = [-7, -2, 0, 1, 3, 11];

fn apply(op: &Arc<Expr>, a: i64, b: i64) -> i64 {
    eval_with(op, &[("f$x0", a), ("f$y0", b)]).as_i64().expect("integer result")
}

fn arb_update() -> impl Strategy<Value = Arc<Expr>> {
    let self_ref = Expr::func_call(kiln_ir::Type::I32, "f", [Expr::var("x")], 0);
    let ops = vec![BinOp::Add, BinOp::Sub, BinOp::Mul, BinOp::Min, BinOp::Max];
    (prop::sample::select(ops), arb_int_expr(), any::<bool>()).prop_map(move |(op, y, self_first)| {
        if self_first || op == BinOp::Sub {
            Expr::binary(op, self_ref.clone(), y)
        } else {
            Expr::binary(op, y, self_ref.clone())
        }
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Binding the identity to the self-reference yields the other operand.
    #[test]
    fn identity_is_neutral(update in arb_update()) {
        let op = prove_associativity("f", &[Expr::var("x")], std::slice::from_ref(&update));
        prop_assume!(op.associative);
        let with_identity = simplify(&substitute("f$x0", &op.identities[0], &op.ops[0]));
        for v in VALUES {
            prop_assert_eq!(eval_with(&with_identity, &[("f$y0", v)]).as_i64(), Some(v), "{}", with_identity);
        }
    }

    /// Any grouping of three operands gives the same result, and so does any
    /// order when the operator is commutative.
    #[test]
    fn operator_is_associative(update in arb_update()) {
        let op = prove_associativity("f", &[Expr::var("x")], std::slice::from_ref(&update));
        prop_assume!(op.associative);
        let commutative = op.is_commutative;
        let op = &op.ops[0];
        for a in VALUES {
            for b in VALUES {
                if commutative {
                    prop_assert_eq!(apply(op, a, b), apply(op, b, a), "{} not commutative", op);
                }
                for c in VALUES {
                    prop_assert_eq!(apply(op, apply(op, a, b), c), apply(op, a, apply(op, b, c)), "{}", op);
                }
            }
        }
    }

    /// Rebuilding the update from the operator and its bindings gives back
    /// the original value.
    #[test]
    fn bindings_reproduce_update(update in arb_update()) {
        let op = prove_associativity("f", &[Expr::var("x")], std::slice::from_ref(&update));
        prop_assume!(op.associative);
        let rebuilt = substitute(&op.xs[0].var, &op.xs[0].expr, &op.ops[0]);
        let rebuilt = substitute(&op.ys[0].var, &op.ys[0].expr, &rebuilt);

        let f = Function::pure("f", &["x"], vec![Expr::var("x").mul(3).sub(7)]).expect("valid function");
        let env: Env = [f].into_iter().collect();
        let mut machine = Machine::new(&env);
        for x in -6..=6 {
            for y in [-9, -1, 0, 4] {
                machine.bind_int("x", x);
                machine.bind_int("y", y);
                prop_assert_eq!(
                    machine.eval(&update),
                    machine.eval(&rebuilt),
                    "{} vs {} at x={}, y={}",
                    update,
                    rebuilt,
                    x,
                    y
                );
            }
        }
    }
}
