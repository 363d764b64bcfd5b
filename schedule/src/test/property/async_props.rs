//! Forking async producers preserves what a pipeline computes.

use std::sync::Arc;

use kiln_ir::types::runtime;
use kiln_ir::{Env, Expr, Function, Stmt, StmtKind, Type};
use proptest::prelude::*;

use crate::async_producers::fork_async_producers;
use crate::test::helpers::{count_stmts, realize_1d, run_stmt};

/// `for y { realize f { produce f { f(x) = x*scale + y }; consume f { parts } } }`.
///
/// Each part stores one row of `out`, reading `f` when its flag is set.
#[derive(Debug, Clone)]
struct Pipeline {
    extent: i64,
    scale: i64,
    rows: i64,
    parts: Vec<(bool, i64)>,
    is_async: bool,
}

impl Pipeline {
    fn env(&self) -> Env {
        let mut f = Function::pure("f", &["x"], vec![Expr::int(-1000)]).expect("valid definition");
        f.schedule_mut().is_async = self.is_async;
        [f].into_iter().collect()
    }

    fn reads(&self) -> usize {
        self.parts.iter().filter(|(reads, _)| *reads).count()
    }

    /// Consume regions left after tightening: a lone part is not a block,
    /// so its region stays whole whether or not it reads `f`.
    fn consume_regions(&self) -> usize {
        if self.parts.len() == 1 { 1 } else { self.reads() }
    }

    fn stmt(&self) -> Arc<Stmt> {
        let (x, y) = (Expr::var("x"), Expr::var("y"));
        let over_x = |body| Stmt::serial("x", Expr::int(0), Expr::int(self.extent), body);
        let row_len = self.extent * self.parts.len() as i64;
        let parts = self.parts.iter().enumerate().map(|(i, (reads, offset))| {
            let value = if *reads { Expr::func_call(Type::I32, "f", [x.clone()], 0) } else { x.clone() };
            let index = y.mul(row_len).add(i as i64 * self.extent).add(&x);
            over_x(Stmt::store("out", value.add(*offset), index))
        });
        let produce = Stmt::producer("f", over_x(Stmt::provide("f", vec![x.mul(self.scale).add(&y)], vec![x.clone()])));
        let body = realize_1d("f", self.extent, Stmt::block(produce, Stmt::consumer("f", Stmt::block_of(parts))));
        Stmt::serial("y", Expr::int(0), Expr::int(self.rows), body)
    }
}

fn arb_pipeline() -> impl Strategy<Value = Pipeline> {
    (1i64..6, -3i64..4, 1i64..4, prop::collection::vec((any::<bool>(), -5i64..5), 1..4), any::<bool>()).prop_map(
        |(extent, scale, rows, parts, is_async)| Pipeline { extent, scale, rows, parts, is_async },
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// Lowered and original pipelines store the same values.
    #[test]
    fn forking_preserves_outputs(p in arb_pipeline()) {
        let env = p.env();
        let s = p.stmt();
        let lowered = fork_async_producers(&s, &env);
        prop_assert_eq!(run_stmt(&env, &lowered, &[], "out"), run_stmt(&env, &s, &[], "out"));
    }

    /// One acquire per tightened consume region, and no unlowered semaphore
    /// creation.
    #[test]
    fn one_acquire_per_consume_region(p in arb_pipeline()) {
        let lowered = fork_async_producers(&p.stmt(), &p.env());
        let acquires = count_stmts(&lowered, |k| matches!(k, StmtKind::Acquire { .. }));
        let forks = count_stmts(&lowered, |k| matches!(k, StmtKind::Fork(..)));
        if p.is_async {
            prop_assert_eq!(acquires, p.consume_regions());
            prop_assert!(forks <= 1);
        } else {
            prop_assert_eq!(acquires, 0);
            prop_assert_eq!(forks, 0);
        }
        prop_assert!(!lowered.to_string().contains(runtime::MAKE_SEMAPHORE));
    }
}
