use std::sync::Arc;

use kiln_ir::visit::for_each_expr_in_stmt;
use kiln_ir::{BinOp, DeviceApi, Expr, ForType, MemoryType, Stmt, StmtKind, Type};
use test_case::test_case;

use crate::config::WarpShuffleOptions;
use crate::error::Error;
use crate::test::helpers::find_stmts;
use crate::warp_shuffles::{SHUFFLE_PREFIX, lower_warp_shuffles};

fn lane() -> Arc<Expr> {
    Expr::var("lane")
}

fn lanes(extent: Arc<Expr>, body: Arc<Stmt>) -> Arc<Stmt> {
    Stmt::for_loop("lane", Expr::int(0), extent, ForType::GpuLane, DeviceApi::Cuda, body)
}

fn kernel(body: Arc<Stmt>) -> Arc<Stmt> {
    Stmt::for_loop("b.__block_id_x", Expr::int(0), Expr::int(4), ForType::GpuBlock, DeviceApi::Cuda, body)
}

fn registers(ty: Type, size: i64, body: Arc<Stmt>) -> Arc<Stmt> {
    Stmt::allocate("vals", ty, MemoryType::Register, vec![Expr::int(size)], Expr::const_true(), body)
}

/// `vals[lane] = input[lane]`, then `body`, over a warp of `extent` lanes.
fn striped(ty: Type, extent: i64, body: Arc<Stmt>) -> Arc<Stmt> {
    let fill = Stmt::store("vals", Expr::load(ty, "input", lane()), lane());
    kernel(registers(ty, extent, lanes(Expr::int(extent), Stmt::block(fill, body))))
}

fn read(index: Arc<Expr>) -> Arc<Stmt> {
    Stmt::store("out", Expr::load(Type::I32, "vals", index), lane())
}

fn lower(s: &Arc<Stmt>) -> Arc<Stmt> {
    lower_warp_shuffles(s, &WarpShuffleOptions::default()).expect("lowerable")
}

/// Every shuffle call in `s`, as `(name, args, type)`.
fn shuffles(s: &Arc<Stmt>) -> Vec<(String, Vec<Arc<Expr>>, Type)> {
    let mut found = Vec::new();
    for_each_expr_in_stmt(s, |e| {
        if let Some(c) = e.as_call().filter(|c| c.name.starts_with(SHUFFLE_PREFIX)) {
            found.push((c.name.clone(), c.args.to_vec(), e.ty()));
        }
        true
    });
    found
}

/// Shuffles evaluated under some `if`.
fn shuffles_under_ifs(s: &Arc<Stmt>) -> usize {
    find_stmts(s, |k| matches!(k, StmtKind::IfThenElse { .. }))
        .iter()
        .map(|s| match s.kind() {
            StmtKind::IfThenElse { then_case, else_case, .. } => {
                shuffles(then_case).len() + else_case.as_ref().map_or(0, |e| shuffles(e).len())
            }
            _ => 0,
        })
        .sum()
}

fn register_sizes(s: &Arc<Stmt>) -> Vec<Option<i64>> {
    find_stmts(s, |k| matches!(k, StmtKind::Allocate(a) if a.name == "vals"))
        .iter()
        .filter_map(|s| s.as_allocate())
        .map(|a| a.extents[0].as_int())
        .collect()
}

fn lane_loop_extents(s: &Arc<Stmt>) -> Vec<Option<i64>> {
    find_stmts(s, |k| matches!(k, StmtKind::For(f) if f.for_type == ForType::GpuLane))
        .iter()
        .filter_map(|s| s.as_for())
        .map(|f| f.extent.as_int())
        .collect()
}

// ============================================================================
// Shuffle forms
// ============================================================================

#[test]
fn test_neighbour_read_becomes_hoisted_shuffle_down() {
    let body = Stmt::if_then(lane().cmp_lt(31), read(lane().add(1)));
    let lowered = lower(&striped(Type::I32, 32, body));

    let found = shuffles(&lowered);
    assert_eq!(found.len(), 1, "{lowered}");
    let (name, args, _) = &found[0];
    assert_eq!(name, "llvm.nvvm.shfl.down.i32");
    assert_eq!(args[1].as_int(), Some(1), "{lowered}");
    assert_eq!(args[2].as_int(), Some(31), "{lowered}");
    assert_eq!(shuffles_under_ifs(&lowered), 0, "{lowered}");

    // The allocation moved inside the lane loop at one element per lane.
    assert_eq!(register_sizes(&lowered), vec![Some(1)], "{lowered}");
    let lane_loop = find_stmts(&lowered, |k| matches!(k, StmtKind::For(f) if f.for_type == ForType::GpuLane));
    assert!(matches!(lane_loop[0].as_for().map(|f| f.body.kind()), Some(StmtKind::Allocate(_))), "{lowered}");
}

#[test]
fn test_sync_intrinsics_take_a_member_mask() {
    let body = Stmt::if_then(lane().cmp_lt(31), read(lane().add(1)));
    let options = WarpShuffleOptions::builder().cuda_capability(75).build();
    let lowered = lower_warp_shuffles(&striped(Type::I32, 32, body), &options).expect("lowerable");

    let found = shuffles(&lowered);
    let (name, args, _) = &found[0];
    assert_eq!(name, "llvm.nvvm.shfl.sync.down.i32");
    assert_eq!(args.len(), 4);
    assert_eq!(args[0].as_int(), Some(-1));
}

#[test]
fn test_rotation_muxes_up_and_down() {
    let lowered = lower(&striped(Type::I32, 32, read(lane().add(1).modulo(32))));
    let mut names: Vec<String> = shuffles(&lowered).into_iter().map(|(n, ..)| n).collect();
    names.sort();
    assert_eq!(names, vec!["llvm.nvvm.shfl.down.i32".to_string(), "llvm.nvvm.shfl.up.i32".to_string()]);
}

#[test]
fn test_reversal_uses_general_gather() {
    let lowered = lower(&striped(Type::I32, 32, read(Expr::int(31).sub(lane()))));
    let found = shuffles(&lowered);
    assert_eq!(found.len(), 1, "{lowered}");
    assert_eq!(found[0].0, "llvm.nvvm.shfl.idx.i32");
    assert_eq!(found[0].1[2].as_int(), Some(31), "{lowered}");
}

#[test]
fn test_own_lane_read_is_a_plain_load() {
    let lowered = lower(&striped(Type::I32, 32, read(lane())));
    assert!(shuffles(&lowered).is_empty(), "{lowered}");
    assert_eq!(register_sizes(&lowered), vec![Some(1)]);
}

#[test]
fn test_narrow_types_shuffle_as_32_bits() {
    let body = Stmt::if_then(
        lane().cmp_lt(31),
        Stmt::store("out", Expr::load(Type::I16, "vals", lane().add(1)), lane()),
    );
    let lowered = lower(&striped(Type::I16, 32, body));
    let found = shuffles(&lowered);
    assert_eq!(found.len(), 1, "{lowered}");
    assert_eq!(found[0].0, "llvm.nvvm.shfl.down.i32");
    assert_eq!(found[0].2, Type::U32);
}

// ============================================================================
// Lane loop shape
// ============================================================================

#[test]
fn test_short_lane_loops_are_masked() {
    let lowered = lower(&striped(Type::I32, 24, read(lane())));
    assert_eq!(lane_loop_extents(&lowered), vec![Some(32)], "{lowered}");
    let masks = find_stmts(&lowered, |k| {
        matches!(k, StmtKind::IfThenElse { condition, .. }
            if condition.as_op(BinOp::Lt).is_some_and(|(a, b)| a.var_name() == Some("lane") && b.as_int() == Some(24)))
    });
    assert_eq!(masks.len(), 1, "{lowered}");
}

#[test]
fn test_two_stripes_per_lane() {
    let fill = Stmt::store("vals", Expr::load(Type::I32, "input", lane()), lane());
    let fill_high = Stmt::store("vals", Expr::load(Type::I32, "input", lane().add(32)), lane().add(32));
    let body = Stmt::block_of([fill, fill_high, read(lane().add(32))]);
    let lowered = lower(&kernel(registers(Type::I32, 64, lanes(Expr::int(32), body))));
    assert_eq!(register_sizes(&lowered), vec![Some(2)], "{lowered}");
    assert!(shuffles(&lowered).is_empty(), "{lowered}");
}

#[test]
fn test_shuffle_varying_with_inner_loop_moves_if_inwards() {
    let inner = Stmt::serial(
        "k",
        Expr::int(0),
        Expr::int(2),
        Stmt::store(
            "out",
            Expr::load(Type::I32, "vals", lane().add(1).add(Expr::var("k").mul(32))),
            lane().mul(2).add(Expr::var("k")),
        ),
    );
    let fill = Stmt::block(
        Stmt::store("vals", Expr::load(Type::I32, "input", lane()), lane()),
        Stmt::store("vals", Expr::load(Type::I32, "input", lane().add(32)), lane().add(32)),
    );
    let body = Stmt::block(fill, Stmt::if_then(lane().cmp_lt(31), inner));
    let s = kernel(registers(Type::I32, 64, lanes(Expr::int(32), body)));
    let lowered = lower(&s);

    assert_eq!(shuffles(&lowered).len(), 1, "{lowered}");
    assert_eq!(shuffles_under_ifs(&lowered), 0, "{lowered}");
    assert!(lowered.to_string().contains("let lane_active$"), "{lowered}");
}

#[test]
fn test_lane_lets_are_substituted() {
    let body = Stmt::let_stmt(
        "next",
        lane().add(1),
        Stmt::if_then(lane().cmp_lt(31), read(Expr::var("next"))),
    );
    let lowered = lower(&striped(Type::I32, 32, body));
    let found = shuffles(&lowered);
    assert_eq!(found.len(), 1, "{lowered}");
    assert_eq!(found[0].0, "llvm.nvvm.shfl.down.i32");
}

#[test]
fn test_code_without_lane_loops_is_untouched() {
    let s = kernel(Stmt::store("out", Expr::int(1), Expr::var("b.__block_id_x")));
    assert_eq!(lower(&s).to_string(), s.to_string());
}

// ============================================================================
// Errors
// ============================================================================

#[test_case(Expr::var("n"); "symbolic extent")]
#[test_case(Expr::int(64); "wider than a warp")]
fn test_lane_loop_extent_is_checked(extent: Arc<Expr>) {
    let s = kernel(lanes(extent, Stmt::store("out", lane(), lane())));
    let err = lower_warp_shuffles(&s, &WarpShuffleOptions::default()).expect_err("bad lane loop");
    assert!(matches!(err, Error::LaneLoopExtent { ref lane, .. } if lane == "lane"), "{err}");
}

#[test]
fn test_non_affine_store_is_rejected() {
    let s = kernel(registers(
        Type::I32,
        32,
        lanes(Expr::int(32), Stmt::store("vals", lane(), lane().mul(lane()))),
    ));
    let err = lower_warp_shuffles(&s, &WarpShuffleOptions::default()).expect_err("bad stride");
    assert!(matches!(err, Error::BadWarpStride { ref alloc, .. } if alloc == "vals"), "{err}");
}

#[test]
fn test_64_bit_shuffles_are_rejected() {
    let body = Stmt::if_then(
        lane().cmp_lt(31),
        Stmt::store("out", Expr::load(Type::I64, "vals", lane().add(1)), lane()),
    );
    let err = lower_warp_shuffles(&striped(Type::I64, 32, body), &WarpShuffleOptions::default())
        .expect_err("64-bit shuffle");
    assert!(matches!(err, Error::WarpShuffleType { ty, .. } if ty == Type::I64), "{err}");
}
