//! Structural equality and total ordering of expressions.
//!
//! Two families are provided:
//!
//! - [`equal`] / [`less_than`] recurse naively and assume common
//!   subexpressions have already been shared, so trees are small.
//! - [`graph_equal`] / [`graph_less_than`] walk an explicit stack and skip
//!   node pairs already compared, so enormous DAGs with heavy sharing cost
//!   time linear in the number of distinct pairs and never overflow the stack.
//!
//! [`ExprKey`] wraps an expression with the graph-safe order so structurally
//! identical trees hit the same entry in ordered caches.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use itertools::Itertools;

use crate::expr::{Expr, ExprKind, VarKind};
use crate::stmt::{Stmt, StmtKind};
use crate::types::ConstValue;

fn rank(kind: &ExprKind) -> u8 {
    match kind {
        ExprKind::Const(_) => 0,
        ExprKind::StringImm(_) => 1,
        ExprKind::Variable(_) => 2,
        ExprKind::Cast(_) => 3,
        ExprKind::Reinterpret(_) => 4,
        ExprKind::Binary(..) => 5,
        ExprKind::Not(_) => 6,
        ExprKind::Select(..) => 7,
        ExprKind::Load(_) => 8,
        ExprKind::Ramp { .. } => 9,
        ExprKind::Broadcast { .. } => 10,
        ExprKind::Shuffle { .. } => 11,
        ExprKind::VectorReduce { .. } => 12,
        ExprKind::Call(_) => 13,
        ExprKind::Let { .. } => 14,
    }
}

fn const_cmp(a: &ConstValue, b: &ConstValue) -> Ordering {
    match (a, b) {
        (ConstValue::Int(x), ConstValue::Int(y)) => x.cmp(y),
        (ConstValue::UInt(x), ConstValue::UInt(y)) => x.cmp(y),
        (ConstValue::Float(x), ConstValue::Float(y)) => x.total_cmp(y),
        (ConstValue::Int(_), _) => Ordering::Less,
        (_, ConstValue::Int(_)) => Ordering::Greater,
        (ConstValue::UInt(_), _) => Ordering::Less,
        (_, ConstValue::UInt(_)) => Ordering::Greater,
    }
}

fn var_kind_cmp(a: &VarKind, b: &VarKind) -> Ordering {
    let key = |k: &VarKind| match k {
        VarKind::Plain => (0, 0),
        VarKind::Param => (1, 0),
        VarKind::Reduction(rdom) => (2, rdom.id()),
    };
    key(a).cmp(&key(b))
}

/// Compare everything except child expressions.
fn shallow_cmp(a: &Expr, b: &Expr) -> Ordering {
    rank(&a.kind).cmp(&rank(&b.kind)).then_with(|| a.ty.cmp(&b.ty)).then_with(|| match (&a.kind, &b.kind) {
        (ExprKind::Const(x), ExprKind::Const(y)) => const_cmp(x, y),
        (ExprKind::StringImm(x), ExprKind::StringImm(y)) => x.cmp(y),
        (ExprKind::Variable(x), ExprKind::Variable(y)) => {
            x.name.cmp(&y.name).then_with(|| var_kind_cmp(&x.kind, &y.kind))
        }
        (ExprKind::Binary(x, ..), ExprKind::Binary(y, ..)) => x.cmp(y),
        (ExprKind::Load(x), ExprKind::Load(y)) => x.name.cmp(&y.name),
        (ExprKind::Ramp { lanes: x, .. }, ExprKind::Ramp { lanes: y, .. }) => x.cmp(y),
        (ExprKind::Broadcast { lanes: x, .. }, ExprKind::Broadcast { lanes: y, .. }) => x.cmp(y),
        (ExprKind::Shuffle { vectors: vx, indices: x }, ExprKind::Shuffle { vectors: vy, indices: y }) => {
            vx.len().cmp(&vy.len()).then_with(|| x.cmp(y))
        }
        (ExprKind::VectorReduce { op: x, .. }, ExprKind::VectorReduce { op: y, .. }) => x.cmp(y),
        (ExprKind::Call(x), ExprKind::Call(y)) => x
            .name
            .cmp(&y.name)
            .then_with(|| x.call_type.cmp(&y.call_type))
            .then_with(|| x.value_index.cmp(&y.value_index))
            .then_with(|| x.args.len().cmp(&y.args.len())),
        (ExprKind::Let { name: x, .. }, ExprKind::Let { name: y, .. }) => x.cmp(y),
        _ => Ordering::Equal,
    })
}

/// Deep structural comparison by naive recursion.
pub fn compare(a: &Expr, b: &Expr) -> Ordering {
    if std::ptr::eq(a, b) {
        return Ordering::Equal;
    }
    shallow_cmp(a, b).then_with(|| {
        a.children()
            .iter()
            .zip_eq(b.children().iter())
            .map(|(x, y)| compare(x, y))
            .find(|o| o.is_ne())
            .unwrap_or(Ordering::Equal)
    })
}

pub fn equal(a: &Arc<Expr>, b: &Arc<Expr>) -> bool {
    compare(a, b).is_eq()
}

pub fn less_than(a: &Arc<Expr>, b: &Arc<Expr>) -> bool {
    compare(a, b).is_lt()
}

/// Deep structural comparison that tolerates heavily shared DAGs.
///
/// Visits node pairs in pre-order with an explicit stack, so the first
/// difference found is the same one [`compare`] would report. Pairs already
/// visited are skipped: their subtree either matched or the walk has ended.
pub fn graph_compare(a: &Expr, b: &Expr) -> Ordering {
    let mut seen: HashSet<(u64, u64)> = HashSet::new();
    let mut stack: Vec<(&Expr, &Expr)> = vec![(a, b)];
    while let Some((x, y)) = stack.pop() {
        if std::ptr::eq(x, y) || !seen.insert((x.id, y.id)) {
            continue;
        }
        let order = shallow_cmp(x, y);
        if order.is_ne() {
            return order;
        }
        for (p, q) in x.children().into_iter().zip(y.children()).rev() {
            stack.push((p.as_ref(), q.as_ref()));
        }
    }
    Ordering::Equal
}

pub fn graph_equal(a: &Arc<Expr>, b: &Arc<Expr>) -> bool {
    graph_compare(a, b).is_eq()
}

pub fn graph_less_than(a: &Arc<Expr>, b: &Arc<Expr>) -> bool {
    graph_compare(a, b).is_lt()
}

pub(crate) fn equal_nodes(a: &Expr, b: &Expr) -> bool {
    graph_compare(a, b).is_eq()
}

// ============================================================================
// Statements
// ============================================================================

fn stmt_header_eq(a: &StmtKind, b: &StmtKind) -> bool {
    match (a, b) {
        (StmtKind::LetStmt { name: x, .. }, StmtKind::LetStmt { name: y, .. }) => x == y,
        (StmtKind::Assert { .. }, StmtKind::Assert { .. }) => true,
        (
            StmtKind::ProducerConsumer { name: x, is_producer: px, .. },
            StmtKind::ProducerConsumer { name: y, is_producer: py, .. },
        ) => x == y && px == py,
        (StmtKind::For(x), StmtKind::For(y)) => {
            x.name == y.name && x.for_type == y.for_type && x.device_api == y.device_api
        }
        (StmtKind::Acquire { .. }, StmtKind::Acquire { .. }) => true,
        (StmtKind::Store { name: x, .. }, StmtKind::Store { name: y, .. }) => x == y,
        (StmtKind::Provide { name: x, values: vx, .. }, StmtKind::Provide { name: y, values: vy, .. }) => {
            x == y && vx.len() == vy.len()
        }
        (StmtKind::Allocate(x), StmtKind::Allocate(y)) => {
            x.name == y.name
                && x.ty == y.ty
                && x.memory_type == y.memory_type
                && x.extents.len() == y.extents.len()
                && x.new_expr.is_some() == y.new_expr.is_some()
                && x.free_function == y.free_function
        }
        (StmtKind::Free { name: x }, StmtKind::Free { name: y }) => x == y,
        (StmtKind::Realize(x), StmtKind::Realize(y)) => {
            x.name == y.name && x.types == y.types && x.memory_type == y.memory_type && x.bounds.len() == y.bounds.len()
        }
        (StmtKind::Prefetch { name: x, types: tx, .. }, StmtKind::Prefetch { name: y, types: ty, .. }) => {
            x == y && tx == ty
        }
        (StmtKind::Block(..), StmtKind::Block(..)) | (StmtKind::Fork(..), StmtKind::Fork(..)) => true,
        (StmtKind::IfThenElse { else_case: x, .. }, StmtKind::IfThenElse { else_case: y, .. }) => {
            x.is_some() == y.is_some()
        }
        (StmtKind::Evaluate(_), StmtKind::Evaluate(_)) => true,
        (
            StmtKind::Atomic { producer_name: px, mutex_name: mx, .. },
            StmtKind::Atomic { producer_name: py, mutex_name: my, .. },
        ) => px == py && mx == my,
        _ => false,
    }
}

/// Deep structural equality of statements.
pub fn equal_stmt(a: &Stmt, b: &Stmt) -> bool {
    if std::ptr::eq(a, b) {
        return true;
    }
    if !stmt_header_eq(&a.kind, &b.kind) {
        return false;
    }
    let (ea, eb) = (a.exprs(), b.exprs());
    let (sa, sb) = (a.stmts(), b.stmts());
    ea.len() == eb.len()
        && sa.len() == sb.len()
        && ea.iter().zip(eb.iter()).all(|(x, y)| graph_equal(x, y))
        && sa.iter().zip(sb.iter()).all(|(x, y)| equal_stmt(x, y))
}

// ============================================================================
// Ordered keys
// ============================================================================

/// Expression ordered structurally, for use as a `BTreeMap` key.
#[derive(Clone, Debug)]
pub struct ExprKey(pub Arc<Expr>);

impl PartialEq for ExprKey {
    fn eq(&self, other: &Self) -> bool {
        graph_compare(&self.0, &other.0).is_eq()
    }
}

impl Eq for ExprKey {}

impl PartialOrd for ExprKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ExprKey {
    fn cmp(&self, other: &Self) -> Ordering {
        graph_compare(&self.0, &other.0)
    }
}
