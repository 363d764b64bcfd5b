//! Core `Stmt` struct.

use std::sync::Arc;

use kiln_dtype::Type;

use crate::expr::Expr;
use crate::expr::core::next_node_id;
use crate::types::{DeviceApi, ForType, MemoryType};

/// Immutable statement node, shared through `Arc`.
#[derive(derive_more::Debug)]
pub struct Stmt {
    #[debug(skip)]
    pub id: u64,
    pub(crate) kind: StmtKind,
}

/// Statement variants.
#[derive(Debug, Clone)]
pub enum StmtKind {
    LetStmt { name: String, value: Arc<Expr>, body: Arc<Stmt> },
    Assert { condition: Arc<Expr>, message: Arc<Expr> },
    /// Marks the region producing (`is_producer`) or consuming the function `name`.
    ProducerConsumer { name: String, is_producer: bool, body: Arc<Stmt> },
    For(For),
    /// Blocks until `semaphore` holds `count` permits, takes them, runs `body`.
    Acquire { semaphore: Arc<Expr>, count: Arc<Expr>, body: Arc<Stmt> },
    Store { name: String, value: Arc<Expr>, index: Arc<Expr>, predicate: Arc<Expr> },
    /// Multi-dimensional store to a function's realization.
    Provide { name: String, values: Vec<Arc<Expr>>, args: Vec<Arc<Expr>>, predicate: Arc<Expr> },
    Allocate(Allocate),
    Free { name: String },
    Realize(Realize),
    Prefetch { name: String, types: Vec<Type>, bounds: Vec<Range>, condition: Arc<Expr>, body: Arc<Stmt> },
    /// Sequential composition.
    Block(Arc<Stmt>, Arc<Stmt>),
    /// Unordered, possibly concurrent composition.
    Fork(Arc<Stmt>, Arc<Stmt>),
    IfThenElse { condition: Arc<Expr>, then_case: Arc<Stmt>, else_case: Option<Arc<Stmt>> },
    Evaluate(Arc<Expr>),
    /// Critical section; lock-free when `mutex_name` is empty.
    Atomic { producer_name: String, mutex_name: String, body: Arc<Stmt> },
}

#[derive(Debug, Clone)]
pub struct For {
    pub name: String,
    pub min: Arc<Expr>,
    pub extent: Arc<Expr>,
    pub for_type: ForType,
    pub device_api: DeviceApi,
    pub body: Arc<Stmt>,
}

#[derive(Debug, Clone)]
pub struct Allocate {
    pub name: String,
    pub ty: Type,
    pub memory_type: MemoryType,
    pub extents: Vec<Arc<Expr>>,
    pub condition: Arc<Expr>,
    /// Custom allocator expression.
    pub new_expr: Option<Arc<Expr>>,
    pub free_function: Option<String>,
    pub body: Arc<Stmt>,
}

/// Half-open range `[min, min + extent)`.
#[derive(Debug, Clone)]
pub struct Range {
    pub min: Arc<Expr>,
    pub extent: Arc<Expr>,
}

#[derive(Debug, Clone)]
pub struct Realize {
    pub name: String,
    pub types: Vec<Type>,
    pub memory_type: MemoryType,
    pub bounds: Vec<Range>,
    pub condition: Arc<Expr>,
    pub body: Arc<Stmt>,
}

impl PartialEq for Stmt {
    fn eq(&self, other: &Self) -> bool {
        crate::equality::equal_stmt(self, other)
    }
}

impl Stmt {
    pub fn new(kind: StmtKind) -> Arc<Self> {
        Arc::new(Self { id: next_node_id(), kind })
    }

    pub fn kind(&self) -> &StmtKind {
        &self.kind
    }

    pub fn as_for(&self) -> Option<&For> {
        match &self.kind {
            StmtKind::For(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_allocate(&self) -> Option<&Allocate> {
        match &self.kind {
            StmtKind::Allocate(a) => Some(a),
            _ => None,
        }
    }

    /// `Evaluate` of a constant.
    pub fn is_no_op(&self) -> bool {
        matches!(&self.kind, StmtKind::Evaluate(e) if e.is_const())
    }

    /// Expressions held directly by this node.
    pub fn exprs(&self) -> Vec<&Arc<Expr>> {
        match &self.kind {
            StmtKind::LetStmt { value, .. } => vec![value],
            StmtKind::Assert { condition, message } => vec![condition, message],
            StmtKind::ProducerConsumer { .. } | StmtKind::Free { .. } => vec![],
            StmtKind::Block(..) | StmtKind::Fork(..) | StmtKind::Atomic { .. } => vec![],
            StmtKind::For(f) => vec![&f.min, &f.extent],
            StmtKind::Acquire { semaphore, count, .. } => vec![semaphore, count],
            StmtKind::Store { value, index, predicate, .. } => vec![value, index, predicate],
            StmtKind::Provide { values, args, predicate, .. } => {
                values.iter().chain(args.iter()).chain(std::iter::once(predicate)).collect()
            }
            StmtKind::Allocate(a) => {
                a.extents.iter().chain(std::iter::once(&a.condition)).chain(a.new_expr.iter()).collect()
            }
            StmtKind::Realize(r) => {
                r.bounds.iter().flat_map(|b| [&b.min, &b.extent]).chain(std::iter::once(&r.condition)).collect()
            }
            StmtKind::Prefetch { bounds, condition, .. } => {
                bounds.iter().flat_map(|b| [&b.min, &b.extent]).chain(std::iter::once(condition)).collect()
            }
            StmtKind::IfThenElse { condition, .. } => vec![condition],
            StmtKind::Evaluate(e) => vec![e],
        }
    }

    /// Direct child statements.
    pub fn stmts(&self) -> Vec<&Arc<Stmt>> {
        match &self.kind {
            StmtKind::LetStmt { body, .. }
            | StmtKind::ProducerConsumer { body, .. }
            | StmtKind::Acquire { body, .. }
            | StmtKind::Prefetch { body, .. }
            | StmtKind::Atomic { body, .. } => vec![body],
            StmtKind::For(f) => vec![&f.body],
            StmtKind::Allocate(a) => vec![&a.body],
            StmtKind::Realize(r) => vec![&r.body],
            StmtKind::Block(a, b) | StmtKind::Fork(a, b) => vec![a, b],
            StmtKind::IfThenElse { then_case, else_case, .. } => {
                std::iter::once(then_case).chain(else_case.iter()).collect()
            }
            StmtKind::Assert { .. }
            | StmtKind::Store { .. }
            | StmtKind::Provide { .. }
            | StmtKind::Free { .. }
            | StmtKind::Evaluate(_) => vec![],
        }
    }
}
