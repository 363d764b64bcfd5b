use std::sync::Arc;

use kiln_ir::types::runtime;
use kiln_ir::{Env, Expr, Function, Stmt, StmtKind, Type};

use crate::async_producers::{
    expand_acquire_nodes, fork_async_producers, initialize_semaphores, tighten_fork_nodes,
    tighten_producer_consumer_nodes,
};
use crate::test::helpers::{count_stmts, realize_1d, run_stmt};

const N: i64 = 6;

/// Functions whose env definition is a sentinel, so any read the lowered
/// code serves from the definition instead of the realization shows up.
fn env_with(funcs: &[(&str, bool)]) -> Env {
    funcs
        .iter()
        .map(|(name, is_async)| {
            let mut f = Function::pure(*name, &["x"], vec![Expr::int(-1000)]).expect("valid definition");
            f.schedule_mut().is_async = *is_async;
            f
        })
        .collect()
}

fn x() -> Arc<Expr> {
    Expr::var("x")
}

fn read(func: &str, arg: Arc<Expr>) -> Arc<Expr> {
    Expr::func_call(Type::I32, func, [arg], 0)
}

fn over_x(body: Arc<Stmt>) -> Arc<Stmt> {
    Stmt::serial("x", Expr::int(0), Expr::int(N), body)
}

fn produce(func: &str, value: Arc<Expr>) -> Arc<Stmt> {
    Stmt::producer(func, over_x(Stmt::provide(func, vec![value], vec![x()])))
}

fn store_out(offset: i64, value: Arc<Expr>) -> Arc<Stmt> {
    over_x(Stmt::store("out", value, x().add(offset)))
}

/// `realize f { produce f { f(x) = 2x }; consume f { out[x] = f(x) + 1 } }`
fn simple_pipeline() -> Arc<Stmt> {
    realize_1d(
        "f",
        N,
        Stmt::block(produce("f", x().mul(2)), Stmt::consumer("f", store_out(0, read("f", x()).add(1)))),
    )
}

fn is_acquire(k: &StmtKind) -> bool {
    matches!(k, StmtKind::Acquire { .. })
}

fn is_fork(k: &StmtKind) -> bool {
    matches!(k, StmtKind::Fork(..))
}

#[test]
fn test_async_realization_is_forked() {
    let env = env_with(&[("f", true)]);
    let s = simple_pipeline();
    let lowered = fork_async_producers(&s, &env);

    assert_eq!(count_stmts(&lowered, is_fork), 1);
    assert_eq!(count_stmts(&lowered, is_acquire), 1);
    let text = lowered.to_string();
    assert!(text.contains(runtime::SEMAPHORE_RELEASE), "{text}");
    assert!(text.contains(runtime::SEMAPHORE_INIT), "{text}");
    assert!(!text.contains(runtime::MAKE_SEMAPHORE), "{text}");

    let expected = run_stmt(&env, &s, &[], "out");
    assert_eq!(expected.len(), N as usize);
    assert_eq!(run_stmt(&env, &lowered, &[], "out"), expected);
}

#[test]
fn test_sync_realization_is_untouched() {
    let env = env_with(&[("f", false)]);
    let s = simple_pipeline();
    let lowered = fork_async_producers(&s, &env);
    assert_eq!(count_stmts(&lowered, is_fork), 0);
    assert_eq!(lowered.to_string(), s.to_string());
}

#[test]
fn test_each_consume_node_gets_its_own_semaphore() {
    // The middle store does not read f, so the consume region splits in two.
    let consume = Stmt::consumer(
        "f",
        Stmt::block_of([
            store_out(0, read("f", x())),
            store_out(N, x().mul(3)),
            store_out(2 * N, read("f", x()).sub(1)),
        ]),
    );
    let s = realize_1d("f", N, Stmt::block(produce("f", x().add(5)), consume));
    let env = env_with(&[("f", true)]);
    let lowered = fork_async_producers(&s, &env);

    assert_eq!(count_stmts(&lowered, is_acquire), 2);
    let text = lowered.to_string();
    assert!(text.contains("f.semaphore_0") && text.contains("f.semaphore_1"), "{text}");
    assert_eq!(run_stmt(&env, &lowered, &[], "out"), run_stmt(&env, &s, &[], "out"));
}

#[test]
fn test_realization_inside_a_loop() {
    let y = Expr::var("y");
    let body = realize_1d(
        "f",
        N,
        Stmt::block(
            produce("f", x().mul(y.clone())),
            Stmt::consumer("f", over_x(Stmt::store("out", read("f", x()), y.mul(N).add(x())))),
        ),
    );
    let s = Stmt::serial("y", Expr::int(0), Expr::int(3), body);
    let env = env_with(&[("f", true)]);
    let lowered = fork_async_producers(&s, &env);
    assert_eq!(count_stmts(&lowered, is_fork), 1);
    assert_eq!(run_stmt(&env, &lowered, &[], "out"), run_stmt(&env, &s, &[], "out"));
}

/// Async `f` produced and consumed inside the consumer of async `g`.
///
/// The producer of `f` sits under the acquire guarding `g`, so that acquire
/// is duplicated onto a cloned semaphore the producer of `g` also releases.
#[test]
fn test_nested_async_clones_outer_acquire() {
    let t = Expr::var("t");
    let inner = Stmt::let_stmt(
        "t",
        read("g", Expr::int(0)),
        Stmt::block(
            produce("f", read("g", x()).add(t)),
            Stmt::consumer("f", store_out(0, read("f", x()).mul(2))),
        ),
    );
    let s = realize_1d(
        "g",
        N,
        Stmt::block(produce("g", x().add(100)), realize_1d("f", N, Stmt::consumer("g", inner))),
    );
    let env = env_with(&[("g", true), ("f", true)]);
    let lowered = fork_async_producers(&s, &env);

    assert_eq!(count_stmts(&lowered, is_fork), 2);
    assert_eq!(count_stmts(&lowered, is_acquire), 3);
    let text = lowered.to_string();
    assert!(text.contains("g.semaphore_0.clone"), "{text}");

    let expected = run_stmt(&env, &s, &[], "out");
    assert_eq!(expected.get(&1).and_then(|v| v.as_i64()), Some((101 + 100) * 2));
    assert_eq!(run_stmt(&env, &lowered, &[], "out"), expected);
}

// ============================================================================
// Individual steps
// ============================================================================

#[test]
fn test_tighten_moves_consume_past_unrelated_lets_and_stores() {
    let s = Stmt::consumer(
        "f",
        Stmt::let_stmt("k", Expr::int(3), Stmt::block(store_out(0, read("f", x())), store_out(N, Expr::var("k")))),
    );
    let tightened = tighten_producer_consumer_nodes(&s);
    let StmtKind::LetStmt { name, body, .. } = tightened.kind() else {
        panic!("expected the let outermost: {tightened}");
    };
    assert_eq!(name, "k");
    let parts = body.block_to_vec();
    assert_eq!(parts.len(), 2);
    assert!(matches!(parts[0].kind(), StmtKind::ProducerConsumer { is_producer: false, .. }));
    assert!(matches!(parts[1].kind(), StmtKind::For(_)));
}

#[test]
fn test_tighten_stops_at_a_let_reading_the_function() {
    let s = Stmt::consumer("f", Stmt::let_stmt("t", read("f", Expr::int(0)), store_out(0, Expr::var("t"))));
    let tightened = tighten_producer_consumer_nodes(&s);
    assert!(matches!(tightened.kind(), StmtKind::ProducerConsumer { .. }), "{tightened}");
}

#[test]
fn test_expand_acquire_covers_the_rest_of_the_block() {
    let sema = Expr::typed_var(Type::HANDLE, "s");
    let s = Stmt::block(
        Stmt::acquire(sema.clone(), Expr::int(1), store_out(0, x())),
        store_out(N, x()),
    );
    let expanded = expand_acquire_nodes(&s);
    let StmtKind::Acquire { body, .. } = expanded.kind() else {
        panic!("expected an acquire at the top: {expanded}");
    };
    assert_eq!(body.block_to_vec().len(), 2);
}

#[test]
fn test_expand_acquire_is_pinned_by_lets_it_reads() {
    let count = Expr::var("n");
    let s = Stmt::let_stmt(
        "n",
        Expr::int(1),
        Stmt::let_stmt(
            "k",
            Expr::int(2),
            Stmt::acquire(Expr::typed_var(Type::HANDLE, "s"), count, store_out(0, Expr::var("k"))),
        ),
    );
    let expanded = expand_acquire_nodes(&s);
    // n stays outside; k moves inside the acquire.
    let StmtKind::LetStmt { name, body, .. } = expanded.kind() else {
        panic!("expected let n outermost: {expanded}");
    };
    assert_eq!(name, "n");
    let StmtKind::Acquire { body, .. } = body.kind() else {
        panic!("expected the acquire under n: {expanded}");
    };
    assert!(matches!(body.kind(), StmtKind::LetStmt { name, .. } if name == "k"));
}

#[test]
fn test_tighten_fork_hoists_shared_lets_and_drops_unused_ones() {
    let k = Expr::var("k");
    let s = Stmt::fork(
        Stmt::let_stmt("k", Expr::int(4), store_out(0, k.clone())),
        Stmt::let_stmt("k", Expr::int(4), Stmt::let_stmt("unused", Expr::int(9), store_out(N, k))),
    );
    let tightened = tighten_fork_nodes(&s);
    let StmtKind::LetStmt { name, body, .. } = tightened.kind() else {
        panic!("expected the shared let above the fork: {tightened}");
    };
    assert_eq!(name, "k");
    assert!(matches!(body.kind(), StmtKind::Fork(..)));
    assert!(!tightened.to_string().contains("unused"));
}

#[test]
fn test_semaphores_become_stack_slots() {
    let make = Expr::call(Type::HANDLE, runtime::MAKE_SEMAPHORE, [Expr::int(2)], kiln_ir::CallType::Extern, 0);
    let sema = Expr::typed_var(Type::HANDLE, "s");
    let s = Stmt::let_stmt("s", make, Stmt::acquire(sema, Expr::int(2), store_out(0, x())));
    let lowered = initialize_semaphores(&s);
    let text = lowered.to_string();
    assert!(text.contains("alloca(16)"), "{text}");
    assert!(text.contains(&format!("{}(s, 2)", runtime::SEMAPHORE_INIT)), "{text}");
    // Two permits from the init satisfy the acquire.
    assert_eq!(run_stmt(&Env::new(), &lowered, &[], "out").len(), N as usize);
}

#[test]
#[should_panic(expected = "semaphore created outside a let binding")]
fn test_semaphore_outside_a_let_is_rejected() {
    let make = Expr::call(Type::HANDLE, runtime::MAKE_SEMAPHORE, [Expr::int(0)], kiln_ir::CallType::Extern, 0);
    initialize_semaphores(&Stmt::evaluate(make));
}
