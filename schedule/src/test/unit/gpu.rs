use std::sync::Arc;

use kiln_ir::{BinOp, DeviceApi, Env, Expr, ForType, Intrinsic, MemoryType, Stmt, StmtKind, Type};
use test_case::test_case;

use crate::error::Error;
use crate::gpu::allocations::{HEAP_POOL, SHARED_POOL};
use crate::gpu::barriers::contains_barrier;
use crate::gpu::fuse_gpu_thread_loops;
use crate::test::helpers::{count_stmts, find_stmts, run_stmt};

fn gpu_loop(name: &str, extent: i64, for_type: ForType, body: Arc<Stmt>) -> Arc<Stmt> {
    Stmt::for_loop(name, Expr::int(0), Expr::int(extent), for_type, DeviceApi::Cuda, body)
}

fn blocks(extent: i64, body: Arc<Stmt>) -> Arc<Stmt> {
    gpu_loop("b.__block_id_x", extent, ForType::GpuBlock, body)
}

fn threads_x(extent: i64, body: Arc<Stmt>) -> Arc<Stmt> {
    gpu_loop("t.__thread_id_x", extent, ForType::GpuThread, body)
}

fn t() -> Arc<Expr> {
    Expr::var("t.__thread_id_x")
}

fn b() -> Arc<Expr> {
    Expr::var("b.__block_id_x")
}

fn shared(name: &str, ty: Type, size: i64, body: Arc<Stmt>) -> Arc<Stmt> {
    Stmt::allocate(name, ty, MemoryType::GpuShared, vec![Expr::int(size)], Expr::const_true(), body)
}

fn load(name: &str, index: Arc<Expr>) -> Arc<Expr> {
    Expr::load(Type::I32, name, index)
}

fn allocations_in(s: &Arc<Stmt>, memory_type: MemoryType) -> Vec<(String, Type, Option<i64>)> {
    find_stmts(s, |k| matches!(k, StmtKind::Allocate(a) if a.memory_type == memory_type))
        .iter()
        .filter_map(|s| s.as_allocate())
        .map(|a| (a.name.clone(), a.ty, a.extents[0].as_int()))
        .collect()
}

fn fused_thread_loops(s: &Arc<Stmt>) -> Vec<(String, Option<i64>)> {
    find_stmts(s, |k| matches!(k, StmtKind::For(f) if f.for_type == ForType::GpuThread))
        .iter()
        .filter_map(|s| s.as_for())
        .map(|f| (f.name.clone(), f.extent.as_int()))
        .collect()
}

/// `if (.__thread_id_x < n)` guards in the fused body.
fn lane_guards(s: &Arc<Stmt>) -> Vec<i64> {
    find_stmts(s, |k| matches!(k, StmtKind::IfThenElse { .. }))
        .iter()
        .filter_map(|s| match s.kind() {
            StmtKind::IfThenElse { condition, .. } => condition.as_op(BinOp::Lt).and_then(|(lhs, rhs)| {
                (lhs.var_name() == Some(".__thread_id_x")).then(|| rhs.as_int()).flatten()
            }),
            _ => None,
        })
        .collect()
}

fn barrier_count(s: &Arc<Stmt>) -> usize {
    count_stmts(s, |k| matches!(k, StmtKind::Evaluate(e) if e.is_intrinsic(Intrinsic::GpuThreadBarrier)))
}

/// Three stages over 37 threads; the shared buffer is written in stage 0
/// and read back in stage 2 by the thread that wrote it.
fn three_stage_kernel() -> Arc<Stmt> {
    let stage0 = threads_x(37, Stmt::store("buf", t().mul(3).add(b()), t()));
    let stage1 = threads_x(37, Stmt::store("out", t(), b().mul(100).add(t())));
    let stage2 = threads_x(37, Stmt::store("out", load("buf", t()).add(1), b().mul(100).add(t()).add(50)));
    blocks(4, shared("buf", Type::I32, 100, Stmt::block_of([stage0, stage1, stage2])))
}

#[test]
fn test_shared_allocation_is_pooled_and_threads_padded() {
    let s = three_stage_kernel();
    let fused = fuse_gpu_thread_loops(&s).expect("thread loops inside a block loop");

    let pools = allocations_in(&fused, MemoryType::GpuShared);
    assert_eq!(pools, vec![(SHARED_POOL.to_string(), Type::I32, Some(100))], "{fused}");
    assert_eq!(fused_thread_loops(&fused), vec![(".__thread_id_x".to_string(), Some(64))], "{fused}");
    assert_eq!(lane_guards(&fused), vec![37, 37, 37], "{fused}");
    assert_eq!(barrier_count(&fused), 2, "{fused}");

    let expected = run_stmt(&Env::new(), &s, &[], "out");
    assert_eq!(expected.len(), 4 * 37 * 2);
    assert_eq!(run_stmt(&Env::new(), &fused, &[], "out"), expected);
}

#[test]
fn test_thread_loop_outside_block_is_rejected() {
    let s = threads_x(8, Stmt::store("out", t(), t()));
    let err = fuse_gpu_thread_loops(&s).expect_err("no enclosing block loop");
    assert!(matches!(err, Error::ThreadLoopOutsideBlock { ref thread_loop } if thread_loop == "t.__thread_id_x"));
}

#[test]
fn test_non_gpu_code_is_untouched() {
    let s = Stmt::serial("x", Expr::int(0), Expr::int(4), Stmt::store("out", Expr::var("x"), Expr::var("x")));
    let fused = fuse_gpu_thread_loops(&s).expect("nothing to fuse");
    assert_eq!(fused.to_string(), s.to_string());
}

// ============================================================================
// Pooling
// ============================================================================

/// `first` lives in stages 0..=1 and `second` in stages 2..=3, or both
/// through every stage when `overlap` is set.
fn two_buffer_kernel(overlap: bool) -> Arc<Stmt> {
    let write = |buf: &str| threads_x(32, Stmt::store(buf, t().add(b()), t()));
    let read = |buf: &str, at: i64| threads_x(32, Stmt::store("out", load(buf, t()), b().mul(200).add(t()).add(at)));
    let stages = if overlap {
        vec![write("first"), write("second"), read("first", 0), read("second", 32)]
    } else {
        vec![write("first"), read("first", 0), write("second"), read("second", 32)]
    };
    blocks(2, shared("first", Type::I32, 100, shared("second", Type::I32, 60, Stmt::block_of(stages))))
}

#[test_case(false, 100; "disjoint lifetimes share space")]
#[test_case(true, 160; "overlapping lifetimes are stacked")]
fn test_pool_size(overlap: bool, size: i64) {
    let s = two_buffer_kernel(overlap);
    let fused = fuse_gpu_thread_loops(&s).expect("fusable");
    let pools = allocations_in(&fused, MemoryType::GpuShared);
    assert_eq!(pools, vec![(SHARED_POOL.to_string(), Type::I32, Some(size))], "{fused}");
    assert_eq!(run_stmt(&Env::new(), &fused, &[], "out"), run_stmt(&Env::new(), &s, &[], "out"));
}

#[test]
fn test_pool_uses_the_widest_type_first() {
    let wide = threads_x(10, Stmt::store("wide", t(), t()));
    let narrow = threads_x(10, Stmt::store("narrow", t().cast(Type::I16), t()));
    let read = threads_x(
        10,
        Stmt::store("out", load("wide", t()).add(Expr::load(Type::I16, "narrow", t()).cast(Type::I32)), t()),
    );
    let body = Stmt::allocate(
        "narrow",
        Type::I16,
        MemoryType::GpuShared,
        vec![Expr::int(10)],
        Expr::const_true(),
        shared("wide", Type::I32, 10, Stmt::block_of([wide, narrow, read])),
    );
    let s = blocks(1, body);
    let fused = fuse_gpu_thread_loops(&s).expect("fusable");

    // Ten i32 slots, then ten i16 values packed into five more.
    let pools = allocations_in(&fused, MemoryType::GpuShared);
    assert_eq!(pools, vec![(SHARED_POOL.to_string(), Type::I32, Some(15))], "{fused}");
    assert!(fused.to_string().contains("let narrow.shared_offset = 20"), "{fused}");
    assert_eq!(run_stmt(&Env::new(), &fused, &[], "out"), run_stmt(&Env::new(), &s, &[], "out"));
}

#[test]
fn test_heap_allocation_gets_a_slice_per_block() {
    let body = Stmt::allocate(
        "scratch",
        Type::I32,
        MemoryType::Heap,
        vec![Expr::int(10)],
        Expr::const_true(),
        Stmt::block(
            threads_x(10, Stmt::store("scratch", t().mul(b()), t())),
            threads_x(10, Stmt::store("out", load("scratch", t()), b().mul(10).add(t()))),
        ),
    );
    let s = blocks(3, body);
    let fused = fuse_gpu_thread_loops(&s).expect("fusable");

    let StmtKind::Allocate(heap) = fused.kind() else { panic!("expected the heap pool outermost: {fused}") };
    assert_eq!(heap.name, HEAP_POOL);
    assert_eq!(heap.extents[0].as_int(), Some(30));
    assert_eq!(run_stmt(&Env::new(), &fused, &[], "out"), run_stmt(&Env::new(), &s, &[], "out"));
}

#[test]
fn test_register_allocations_move_inside_the_thread_nest() {
    let per_thread = Stmt::allocate(
        "tmp",
        Type::I32,
        MemoryType::Register,
        vec![Expr::int(2)],
        Expr::const_true(),
        Stmt::block(
            Stmt::store("tmp", t(), Expr::int(0)),
            Stmt::store("out", load("tmp", Expr::int(0)).mul(2), b().mul(16).add(t())),
        ),
    );
    let s = blocks(2, Stmt::block(threads_x(16, per_thread), threads_x(16, Stmt::store("out2", t(), t()))));
    let fused = fuse_gpu_thread_loops(&s).expect("fusable");

    let thread_loop = find_stmts(&fused, |k| matches!(k, StmtKind::For(f) if f.for_type == ForType::GpuThread));
    let body = &thread_loop[0].as_for().expect("a loop").body;
    assert!(matches!(body.as_allocate(), Some(a) if a.name == "tmp"), "{fused}");
    assert_eq!(run_stmt(&Env::new(), &fused, &[], "out"), run_stmt(&Env::new(), &s, &[], "out"));
}

// ============================================================================
// Shape
// ============================================================================

#[test]
fn test_block_level_statements_run_on_one_thread() {
    let y_loop = |body| gpu_loop("t.__thread_id_y", 4, ForType::GpuThread, body);
    let nest = y_loop(threads_x(32, Stmt::store("out", t(), Expr::var("t.__thread_id_y").mul(32).add(t()))));
    let s = blocks(1, Stmt::block(Stmt::store("flag", Expr::int(7), Expr::int(0)), nest));
    let fused = fuse_gpu_thread_loops(&s).expect("fusable");

    let loops = fused_thread_loops(&fused);
    assert_eq!(loops, vec![(".__thread_id_y".to_string(), Some(4)), (".__thread_id_x".to_string(), Some(32))]);
    assert_eq!(lane_guards(&fused), vec![1], "{fused}");
    assert_eq!(run_stmt(&Env::new(), &fused, &[], "out"), run_stmt(&Env::new(), &s, &[], "out"));
    assert_eq!(run_stmt(&Env::new(), &fused, &[], "flag"), run_stmt(&Env::new(), &s, &[], "flag"));
}

#[test]
fn test_gpu_loop_mins_are_rebased() {
    let thread = Stmt::for_loop(
        "t.__thread_id_x",
        Expr::int(5),
        Expr::int(32),
        ForType::GpuThread,
        DeviceApi::Cuda,
        Stmt::store("out", t(), t()),
    );
    let s = blocks(1, thread);
    let fused = fuse_gpu_thread_loops(&s).expect("fusable");
    assert!(lane_guards(&fused).is_empty(), "{fused}");
    assert_eq!(run_stmt(&Env::new(), &fused, &[], "out"), run_stmt(&Env::new(), &s, &[], "out"));
}

#[test]
fn test_serial_loop_with_stages_ends_in_a_barrier() {
    let stage = |buf: &str| threads_x(32, Stmt::store(buf, t().add(Expr::var("i")), t()));
    let serial = Stmt::serial("i", Expr::int(0), Expr::int(3), Stmt::block(stage("a"), stage("c")));
    let fused = fuse_gpu_thread_loops(&blocks(1, serial)).expect("fusable");

    let serial = find_stmts(&fused, |k| matches!(k, StmtKind::For(f) if f.name == "i"));
    let body = serial[0].as_for().expect("a loop").body.block_to_vec();
    assert!(body.last().is_some_and(contains_barrier), "{fused}");
    assert_eq!(barrier_count(&fused), 2);
}
