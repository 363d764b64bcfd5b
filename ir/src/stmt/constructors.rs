//! Statement constructors.

use std::sync::Arc;

use kiln_dtype::Type;

use super::core::{Allocate, For, Range, Realize, Stmt, StmtKind};
use crate::expr::Expr;
use crate::types::{DeviceApi, ForType, MemoryType};

impl Stmt {
    pub fn let_stmt(name: impl Into<String>, value: Arc<Expr>, body: Arc<Stmt>) -> Arc<Self> {
        Self::new(StmtKind::LetStmt { name: name.into(), value, body })
    }

    pub fn assert(condition: Arc<Expr>, message: Arc<Expr>) -> Arc<Self> {
        Self::new(StmtKind::Assert { condition, message })
    }

    pub fn producer(name: impl Into<String>, body: Arc<Stmt>) -> Arc<Self> {
        Self::new(StmtKind::ProducerConsumer { name: name.into(), is_producer: true, body })
    }

    pub fn consumer(name: impl Into<String>, body: Arc<Stmt>) -> Arc<Self> {
        Self::new(StmtKind::ProducerConsumer { name: name.into(), is_producer: false, body })
    }

    pub fn for_loop(
        name: impl Into<String>,
        min: Arc<Expr>,
        extent: Arc<Expr>,
        for_type: ForType,
        device_api: DeviceApi,
        body: Arc<Stmt>,
    ) -> Arc<Self> {
        Self::new(StmtKind::For(For { name: name.into(), min, extent, for_type, device_api, body }))
    }

    /// Serial host loop.
    pub fn serial(name: impl Into<String>, min: Arc<Expr>, extent: Arc<Expr>, body: Arc<Stmt>) -> Arc<Self> {
        Self::for_loop(name, min, extent, ForType::Serial, DeviceApi::None, body)
    }

    pub fn acquire(semaphore: Arc<Expr>, count: Arc<Expr>, body: Arc<Stmt>) -> Arc<Self> {
        Self::new(StmtKind::Acquire { semaphore, count, body })
    }

    pub fn store(name: impl Into<String>, value: Arc<Expr>, index: Arc<Expr>) -> Arc<Self> {
        let predicate = Expr::bool_(true, index.ty().lanes());
        Self::store_predicated(name, value, index, predicate)
    }

    pub fn store_predicated(
        name: impl Into<String>,
        value: Arc<Expr>,
        index: Arc<Expr>,
        predicate: Arc<Expr>,
    ) -> Arc<Self> {
        Self::new(StmtKind::Store { name: name.into(), value, index, predicate })
    }

    pub fn provide(name: impl Into<String>, values: Vec<Arc<Expr>>, args: Vec<Arc<Expr>>) -> Arc<Self> {
        Self::new(StmtKind::Provide { name: name.into(), values, args, predicate: Expr::const_true() })
    }

    pub fn allocate(
        name: impl Into<String>,
        ty: Type,
        memory_type: MemoryType,
        extents: Vec<Arc<Expr>>,
        condition: Arc<Expr>,
        body: Arc<Stmt>,
    ) -> Arc<Self> {
        Self::new(StmtKind::Allocate(Allocate {
            name: name.into(),
            ty,
            memory_type,
            extents,
            condition,
            new_expr: None,
            free_function: None,
            body,
        }))
    }

    pub fn free(name: impl Into<String>) -> Arc<Self> {
        Self::new(StmtKind::Free { name: name.into() })
    }

    pub fn realize(
        name: impl Into<String>,
        types: Vec<Type>,
        memory_type: MemoryType,
        bounds: Vec<Range>,
        condition: Arc<Expr>,
        body: Arc<Stmt>,
    ) -> Arc<Self> {
        Self::new(StmtKind::Realize(Realize { name: name.into(), types, memory_type, bounds, condition, body }))
    }

    pub fn block(first: Arc<Stmt>, rest: Arc<Stmt>) -> Arc<Self> {
        Self::new(StmtKind::Block(first, rest))
    }

    /// Right-nested block of `stmts`, a no-op when empty.
    pub fn block_of(stmts: impl IntoIterator<Item = Arc<Stmt>>) -> Arc<Self> {
        let stmts: Vec<_> = stmts.into_iter().collect();
        let mut iter = stmts.into_iter().rev();
        let Some(mut result) = iter.next() else {
            return Self::no_op();
        };
        for s in iter {
            result = Self::block(s, result);
        }
        result
    }

    pub fn fork(first: Arc<Stmt>, rest: Arc<Stmt>) -> Arc<Self> {
        Self::new(StmtKind::Fork(first, rest))
    }

    pub fn if_then_else(condition: Arc<Expr>, then_case: Arc<Stmt>, else_case: Option<Arc<Stmt>>) -> Arc<Self> {
        Self::new(StmtKind::IfThenElse { condition, then_case, else_case })
    }

    pub fn if_then(condition: Arc<Expr>, then_case: Arc<Stmt>) -> Arc<Self> {
        Self::if_then_else(condition, then_case, None)
    }

    pub fn evaluate(value: Arc<Expr>) -> Arc<Self> {
        Self::new(StmtKind::Evaluate(value))
    }

    /// `Evaluate(0)`.
    pub fn no_op() -> Arc<Self> {
        Self::evaluate(Expr::int(0))
    }

    pub fn atomic(producer_name: impl Into<String>, mutex_name: impl Into<String>, body: Arc<Stmt>) -> Arc<Self> {
        Self::new(StmtKind::Atomic { producer_name: producer_name.into(), mutex_name: mutex_name.into(), body })
    }

    /// Flatten nested blocks into a sequence.
    pub fn block_to_vec(self: &Arc<Self>) -> Vec<Arc<Stmt>> {
        let mut out = Vec::new();
        let mut stack = vec![self.clone()];
        while let Some(s) = stack.pop() {
            match &s.kind {
                StmtKind::Block(a, b) => {
                    stack.push(b.clone());
                    stack.push(a.clone());
                }
                _ => out.push(s),
            }
        }
        out
    }
}

impl Range {
    pub fn new(min: Arc<Expr>, extent: Arc<Expr>) -> Self {
        Self { min, extent }
    }
}
