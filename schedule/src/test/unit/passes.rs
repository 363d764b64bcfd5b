use std::collections::BTreeMap;
use std::sync::Arc;

use kiln_ir::analysis::loads_from_buffer;
use kiln_ir::eval::Machine;
use kiln_ir::visit::for_each_expr_in_stmt;
use kiln_ir::{CallType, ConstValue, DeviceApi, Env, Expr, ForType, MemoryType, Stmt, StmtKind, Type};
use test_case::test_case;

use crate::config::LoopCarryOptions;
use crate::passes::{forward_stores, hoist_loop_invariant_values, inject_early_frees, promote_registers, trim_no_ops};
use crate::test::helpers::{count_stmts, find_stmts};

fn x() -> Arc<Expr> {
    Expr::var("x")
}

fn over_x(extent: Arc<Expr>, body: Arc<Stmt>) -> Arc<Stmt> {
    Stmt::serial("x", Expr::int(0), extent, body)
}

/// A call the passes must treat as having side effects.
fn impure(name: &str, args: Vec<Arc<Expr>>) -> Arc<Expr> {
    Expr::call(Type::I32, name, args, CallType::Extern, 0)
}

fn load(buffer: &str, index: Arc<Expr>) -> Arc<Expr> {
    Expr::load(Type::I32, buffer, index)
}

/// Buffer `out` after running `s` with `input[i] = i * i` and `out[i] = 0`
/// for `i` in `[0, 64)`.
fn run(s: &Arc<Stmt>, bindings: &[(&str, i64)], out: &str) -> BTreeMap<i64, ConstValue> {
    let env = Env::new();
    let mut m = Machine::new(&env);
    m.set_buffer("input", (0..64).map(|i| (i, ConstValue::Int(i * i))));
    m.set_buffer("out", (0..64).map(|i| (i, ConstValue::Int(0))));
    for (name, value) in bindings {
        m.bind_int(name, *value);
    }
    m.exec(s);
    m.buffer(out).cloned().unwrap_or_default()
}

fn is_if(k: &StmtKind) -> bool {
    matches!(k, StmtKind::IfThenElse { .. })
}

fn is_for(k: &StmtKind) -> bool {
    matches!(k, StmtKind::For(_))
}

fn is_let(k: &StmtKind) -> bool {
    matches!(k, StmtKind::LetStmt { .. })
}

/// Loads of `buffer` anywhere in `s`.
fn count_loads(s: &Arc<Stmt>, buffer: &str) -> usize {
    let mut count = 0;
    for_each_expr_in_stmt(s, |e| {
        if e.as_load().is_some_and(|l| l.name == buffer) {
            count += 1;
        }
        true
    });
    count
}

// ============================================================================
// Trimming
// ============================================================================

#[test]
fn test_trim_removes_guard_and_shrinks_loop() {
    let s = over_x(Expr::int(100), Stmt::if_then(x().cmp_lt(10), Stmt::store("out", Expr::int(1), x())));
    let trimmed = trim_no_ops(&s);

    assert_eq!(count_stmts(&trimmed, is_if), 0, "{trimmed}");
    let loops = find_stmts(&trimmed, is_for);
    assert_eq!(loops.len(), 1, "{trimmed}");
    assert_eq!(loops[0].as_for().and_then(|f| f.extent.as_int()), Some(10), "{trimmed}");
    assert_eq!(run(&trimmed, &[], "out"), run(&s, &[], "out"));
}

#[test]
fn test_trim_lower_bound() {
    let s = over_x(Expr::var("n"), Stmt::if_then(x().cmp_ge(5), Stmt::store("out", x(), x())));
    let trimmed = trim_no_ops(&s);
    assert_eq!(count_stmts(&trimmed, is_if), 0, "{trimmed}");
    for n in [0, 3, 5, 12] {
        assert_eq!(run(&trimmed, &[("n", n)], "out"), run(&s, &[("n", n)], "out"), "n = {n}");
    }
}

#[test]
fn test_conditional_write_back_is_trimmed() {
    let current = load("out", x());
    let value = Expr::select(x().cmp_lt(10), current.add(1), current.clone());
    let s = over_x(Expr::int(50), Stmt::store("out", value, x()));
    let trimmed = trim_no_ops(&s);
    assert_eq!(run(&trimmed, &[], "out"), run(&s, &[], "out"));
}

#[test]
fn test_loop_without_effect_is_removed() {
    let s = over_x(Expr::int(100), Stmt::store("out", load("out", x()), x()));
    let trimmed = trim_no_ops(&s);
    assert_eq!(count_stmts(&trimmed, is_for), 0, "{trimmed}");
}

#[test]
fn test_side_effects_keep_the_loop() {
    let s = over_x(Expr::int(100), Stmt::evaluate(impure("report", vec![x()])));
    assert_eq!(trim_no_ops(&s).to_string(), s.to_string());
}

#[test]
fn test_gpu_loops_are_not_trimmed() {
    let body = Stmt::if_then(x().cmp_lt(10), Stmt::store("out", Expr::int(1), x()));
    let s = Stmt::for_loop("x", Expr::int(0), Expr::int(100), ForType::GpuBlock, DeviceApi::Cuda, body);
    assert_eq!(trim_no_ops(&s).to_string(), s.to_string());
}

// ============================================================================
// Store forwarding
// ============================================================================

#[test]
fn test_stored_value_is_forwarded_through_a_let() {
    let s = Stmt::block(
        Stmt::store("a", Expr::var("y").mul(2).add(1), Expr::int(0)),
        Stmt::store("b", load("a", Expr::int(0)).add(1), Expr::int(0)),
    );
    let forwarded = forward_stores(&s);

    assert_eq!(count_stmts(&forwarded, is_let), 1, "{forwarded}");
    assert_eq!(count_loads(&forwarded, "a"), 0, "{forwarded}");
    assert_eq!(run(&forwarded, &[("y", 5)], "b"), run(&s, &[("y", 5)], "b"));
    assert_eq!(run(&forwarded, &[("y", 5)], "a"), run(&s, &[("y", 5)], "a"));
}

#[test]
fn test_trivial_values_are_substituted() {
    let s = Stmt::block(
        Stmt::store("a", Expr::var("y"), Expr::int(3)),
        Stmt::store("b", load("a", Expr::int(3)), Expr::int(0)),
    );
    let forwarded = forward_stores(&s);
    assert_eq!(count_stmts(&forwarded, is_let), 0, "{forwarded}");
    assert_eq!(count_loads(&forwarded, "a"), 0, "{forwarded}");
}

#[test_case(Stmt::store("a", Expr::int(0), Expr::var("i")); "store to the same buffer")]
#[test_case(over_x(Expr::int(4), Stmt::store("a", x(), x())); "loop storing to the buffer")]
#[test_case(Stmt::evaluate(impure("clobber", vec![])); "impure call")]
fn test_intervening_write_blocks_forwarding(between: Arc<Stmt>) {
    let s = Stmt::block_of([
        Stmt::store("a", Expr::var("y").mul(2).add(1), Expr::int(0)),
        between,
        Stmt::store("b", load("a", Expr::int(0)), Expr::int(0)),
    ]);
    let forwarded = forward_stores(&s);
    assert_eq!(count_loads(&forwarded, "a"), 1, "{forwarded}");
}

#[test]
fn test_forwarding_inside_loop_bodies() {
    let body = Stmt::block(
        Stmt::store("tmp", load("input", x()).mul(3), Expr::int(0)),
        Stmt::store("out", load("tmp", Expr::int(0)).add(x()), x()),
    );
    let s = over_x(Expr::int(16), body);
    let forwarded = forward_stores(&s);
    let direct = find_stmts(&forwarded, |k| {
        matches!(k, StmtKind::Store { name, value, .. } if name == "out" && !loads_from_buffer(value, "tmp"))
    });
    assert_eq!(direct.len(), 1, "{forwarded}");
    assert_eq!(run(&forwarded, &[], "out"), run(&s, &[], "out"));
}

// ============================================================================
// Register promotion
// ============================================================================

/// `out[x] = input[x] + input[x + 1]` over `[0, n)`.
fn stencil() -> Arc<Stmt> {
    over_x(Expr::var("n"), Stmt::store("out", load("input", x()).add(load("input", x().add(1))), x()))
}

#[test]
fn test_neighbouring_loads_are_carried() {
    let s = stencil();
    let promoted = promote_registers(&s, &LoopCarryOptions::default());

    let allocs = find_stmts(&promoted, |k| matches!(k, StmtKind::Allocate(a) if a.memory_type == MemoryType::Stack));
    assert_eq!(allocs.len(), 1, "{promoted}");
    let loops = find_stmts(&promoted, is_for);
    assert_eq!(loops.len(), 1, "{promoted}");
    assert_eq!(count_loads(&loops[0], "input"), 1, "{promoted}");

    for n in [0, 1, 7, 20] {
        assert_eq!(run(&promoted, &[("n", n)], "out"), run(&s, &[("n", n)], "out"), "n = {n}");
    }
}

#[test]
fn test_longer_chains_share_one_scratch_buffer() {
    let value = load("input", x()).add(load("input", x().add(1))).add(load("input", x().add(2)));
    let s = over_x(Expr::int(20), Stmt::store("out", value, x()));
    let promoted = promote_registers(&s, &LoopCarryOptions::default());
    let sizes: Vec<Option<i64>> = find_stmts(&promoted, |k| matches!(k, StmtKind::Allocate(_)))
        .iter()
        .filter_map(|s| s.as_allocate())
        .map(|a| a.extents[0].as_int())
        .collect();
    assert_eq!(sizes, vec![Some(3)], "{promoted}");
    assert_eq!(run(&promoted, &[], "out"), run(&s, &[], "out"));
}

#[test_case(0; "disabled")]
#[test_case(1; "too small to carry")]
fn test_carry_budget_below_two_leaves_loops_alone(max: usize) {
    let s = stencil();
    let options = LoopCarryOptions::builder().max_carried_values(max).build();
    assert_eq!(promote_registers(&s, &options).to_string(), s.to_string());
}

#[test]
fn test_stored_buffers_are_not_carried() {
    let value = load("f", x()).add(load("f", x().add(1)));
    let s = over_x(Expr::int(10), Stmt::store("f", value, x()));
    let promoted = promote_registers(&s, &LoopCarryOptions::default());
    assert_eq!(count_stmts(&promoted, |k| matches!(k, StmtKind::Allocate(_))), 0, "{promoted}");
}

#[test]
fn test_parallel_loops_are_not_carried() {
    let body = Stmt::store("out", load("input", x()).add(load("input", x().add(1))), x());
    let s = Stmt::for_loop("x", Expr::int(0), Expr::int(10), ForType::Parallel, DeviceApi::None, body);
    assert_eq!(promote_registers(&s, &LoopCarryOptions::default()).to_string(), s.to_string());
}

// ============================================================================
// Loop-invariant hoisting
// ============================================================================

#[test]
fn test_invariant_product_is_hoisted() {
    let scale = Expr::var("n").mul(Expr::var("m")).add(3);
    let s = over_x(Expr::int(10), Stmt::store("out", load("input", x()).mul(scale), x()));
    let hoisted = hoist_loop_invariant_values(&s);

    let lets = find_stmts(&hoisted, is_let);
    assert_eq!(lets.len(), 1, "{hoisted}");
    assert!(matches!(lets[0].kind(), StmtKind::LetStmt { body, .. } if matches!(body.kind(), StmtKind::For(_))));
    let bindings = [("n", 3), ("m", 4)];
    assert_eq!(run(&hoisted, &bindings, "out"), run(&s, &bindings, "out"));
}

#[test]
fn test_repeated_invariants_share_one_let() {
    let scale = Expr::var("n").mul(Expr::var("m"));
    let s = over_x(
        Expr::int(10),
        Stmt::block(
            Stmt::store("out", x().add(&scale), x()),
            Stmt::store("other", x().sub(&scale), x()),
        ),
    );
    assert_eq!(count_stmts(&hoist_loop_invariant_values(&s), is_let), 1);
}

#[test_case(x().mul(x()).mul(Expr::var("n")); "depends on the loop variable")]
#[test_case(load("input", Expr::var("n")).mul(2).add(1); "loads memory")]
#[test_case(Expr::var("n").add(1); "cheap")]
fn test_expression_stays_in_the_loop(value: Arc<Expr>) {
    let s = over_x(Expr::int(10), Stmt::store("out", value, x()));
    assert_eq!(hoist_loop_invariant_values(&s).to_string(), s.to_string());
}

#[test]
fn test_values_bound_inside_the_loop_stay_inside() {
    let body = Stmt::let_stmt("t", x().mul(2), Stmt::store("out", Expr::var("t").mul(Expr::var("t")), x()));
    let s = over_x(Expr::int(10), body);
    let hoisted = hoist_loop_invariant_values(&s);
    assert_eq!(count_stmts(&hoisted, is_let), 1, "{hoisted}");
    assert_eq!(run(&hoisted, &[], "out"), run(&s, &[], "out"));
}

#[test]
fn test_nothing_is_lifted_out_of_gpu_loops() {
    let body = Stmt::store("out", Expr::var("n").mul(Expr::var("m")), x());
    let s = Stmt::for_loop("x", Expr::int(0), Expr::int(32), ForType::GpuThread, DeviceApi::Cuda, body);
    assert_eq!(hoist_loop_invariant_values(&s).to_string(), s.to_string());
}

// ============================================================================
// Early frees
// ============================================================================

fn tmp_pipeline() -> Arc<Stmt> {
    Stmt::allocate(
        "tmp",
        Type::I32,
        MemoryType::Heap,
        vec![Expr::int(8)],
        Expr::const_true(),
        Stmt::block_of([
            over_x(Expr::int(8), Stmt::store("tmp", load("input", x()).add(1), x())),
            over_x(Expr::int(8), Stmt::store("out", load("tmp", x()).mul(2), x())),
            over_x(Expr::int(8), Stmt::store("other", x(), x())),
        ]),
    )
}

#[test]
fn test_free_follows_last_use() {
    let s = tmp_pipeline();
    let freed = inject_early_frees(&s);

    assert_eq!(count_stmts(&freed, |k| matches!(k, StmtKind::Free { name } if name == "tmp")), 1, "{freed}");
    let text = freed.to_string();
    let free_at = text.find("free tmp").expect("free emitted");
    assert!(free_at > text.find("out[").expect("consumer printed"), "{text}");
    assert!(free_at < text.find("other[").expect("unrelated loop printed"), "{text}");

    assert_eq!(run(&freed, &[], "out"), run(&s, &[], "out"));
    assert_eq!(run(&freed, &[], "other"), run(&s, &[], "other"));
}

#[test]
fn test_free_is_not_placed_inside_a_loop() {
    let body = over_x(
        Expr::int(4),
        Stmt::block(
            Stmt::store("tmp", x(), Expr::int(0)),
            Stmt::store("out", load("tmp", Expr::int(0)), x()),
        ),
    );
    let s = Stmt::allocate("tmp", Type::I32, MemoryType::Heap, vec![Expr::int(1)], Expr::const_true(), body);
    let freed = inject_early_frees(&s);

    let loops = find_stmts(&freed, is_for);
    assert_eq!(count_stmts(&loops[0], |k| matches!(k, StmtKind::Free { .. })), 0, "{freed}");
    assert_eq!(count_stmts(&freed, |k| matches!(k, StmtKind::Free { .. })), 1, "{freed}");
    assert_eq!(run(&freed, &[], "out"), run(&s, &[], "out"));
}

#[test]
fn test_unused_allocation_gets_no_free() {
    let s = Stmt::allocate(
        "tmp",
        Type::I32,
        MemoryType::Heap,
        vec![Expr::int(8)],
        Expr::const_true(),
        over_x(Expr::int(8), Stmt::store("out", x(), x())),
    );
    assert_eq!(inject_early_frees(&s).to_string(), s.to_string());
}
