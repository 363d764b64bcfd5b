//! Striping stride of a lane-distributed allocation.
//!
//! An allocation that lives outside a lane loop is spread across the lanes
//! of a warp: lane `l` owns the elements whose index `i` satisfies
//! `(i / stride) % warp_size == l`. The stride is the rate of change of the
//! store indices with respect to the lane variable.

use std::sync::Arc;

use kiln_ir::analysis::expr_uses_var_matching;
use kiln_ir::simplify::{ConstInterval, can_prove_in_scope, simplify_in_scope};
use kiln_ir::visit::{Visitor, walk_expr, walk_stmt};
use kiln_ir::{BinOp, Expr, ExprKind, Scope, Stmt, StmtKind, substitute};

use crate::error::{Error, Result};

/// `e` reduced modulo `modulus` term by term, keeping it in canonical form.
fn reduce_expr_helper(e: &Arc<Expr>, modulus: &Arc<Expr>) -> Arc<Expr> {
    if modulus.is_one() {
        return Expr::make_zero(e.ty());
    }
    if e.is_const() {
        return kiln_ir::simplify(&e.modulo(modulus));
    }
    match e.kind() {
        ExprKind::Binary(BinOp::Add, a, b) => {
            reduce_expr_helper(a, modulus).add(reduce_expr_helper(b, modulus))
        }
        ExprKind::Binary(BinOp::Sub, a, b) => {
            reduce_expr_helper(a, modulus).sub(reduce_expr_helper(b, modulus))
        }
        ExprKind::Binary(BinOp::Mul, a, b) => {
            let divides = b.as_int().is_some_and(|c| c != 0) && kiln_ir::can_prove(&modulus.modulo(b).cmp_eq(0));
            if divides {
                let inner = kiln_ir::simplify(&modulus.div(b));
                reduce_expr_helper(a, &inner).mul(b)
            } else {
                reduce_expr_helper(a, modulus).mul(reduce_expr_helper(b, modulus))
            }
        }
        ExprKind::Ramp { base, stride, lanes } => {
            Expr::ramp(reduce_expr_helper(base, modulus), reduce_expr_helper(stride, modulus), *lanes)
        }
        ExprKind::Broadcast { value, lanes } => Expr::broadcast(reduce_expr_helper(value, modulus), *lanes),
        _ => e.clone(),
    }
}

/// `e % modulus`, with the modulo dropped when `e` provably lies in
/// `[0, modulus)` already.
pub(crate) fn reduce_expr(e: &Arc<Expr>, modulus: &Arc<Expr>, bounds: &Scope<ConstInterval>) -> Arc<Expr> {
    let e = reduce_expr_helper(&simplify_in_scope(e, bounds), modulus);
    if can_prove_in_scope(&e.cmp_ge(0).and(e.cmp_lt(modulus)), bounds) { e } else { e.modulo(modulus) }
}

/// Collects every access to one allocation below a lane loop and derives
/// the stride its stores stripe across the warp with.
pub(crate) struct DetermineAllocStride<'a> {
    alloc: &'a str,
    lane: &'a str,
    warp_size: i64,
    single_thread: bool,
    loads: Vec<Arc<Expr>>,
    stores: Vec<Arc<Expr>>,
    /// Stores made while only lanes 0 and 1 can be active.
    single_stores: Vec<Arc<Expr>>,
    /// Derivative with respect to the lane of every variable that depends
    /// on it; `None` when the dependence is not affine.
    dependent: Scope<Option<Arc<Expr>>>,
    bounds: Scope<ConstInterval>,
}

impl<'a> DetermineAllocStride<'a> {
    /// `bounds` holds the constant ranges of the loops around the lane loop.
    pub(crate) fn new(alloc: &'a str, lane: &'a str, warp_size: i64, bounds: Scope<ConstInterval>) -> Self {
        let mut dependent = Scope::new();
        dependent.push(lane, Some(Expr::int(1)));
        Self {
            alloc,
            lane,
            warp_size,
            single_thread: false,
            loads: Vec::new(),
            stores: Vec::new(),
            single_stores: Vec::new(),
            dependent,
            bounds,
        }
    }

    fn can_prove(&self, e: &Arc<Expr>) -> bool {
        can_prove_in_scope(e, &self.bounds)
    }

    fn uses_dependent(&self, e: &Arc<Expr>) -> bool {
        expr_uses_var_matching(e, |n| self.dependent.contains(n))
    }

    /// Derivative of an integer expression with respect to the lane, or
    /// `None` when it is not affine in the lane.
    fn warp_stride(&mut self, e: &Arc<Expr>) -> Option<Arc<Expr>> {
        if e.is_const() {
            return Some(Expr::int(0));
        }
        match e.kind() {
            ExprKind::Variable(v) => match self.dependent.get(&v.name) {
                Some(d) => d.clone(),
                None => Some(Expr::int(0)),
            },
            ExprKind::Binary(BinOp::Add, a, b) => {
                let (sa, sb) = (self.warp_stride(a)?, self.warp_stride(b)?);
                Some(sa.add(sb))
            }
            ExprKind::Binary(BinOp::Sub, a, b) => {
                let (sa, sb) = (self.warp_stride(a)?, self.warp_stride(b)?);
                Some(sa.sub(sb))
            }
            ExprKind::Binary(BinOp::Mul, a, b) => {
                let (sa, sb) = (self.warp_stride(a)?, self.warp_stride(b)?);
                if kiln_ir::simplify(&sb).is_zero() {
                    Some(sa.mul(b))
                } else if kiln_ir::simplify(&sa).is_zero() {
                    Some(sb.mul(a))
                } else {
                    None
                }
            }
            ExprKind::Broadcast { value, .. } => self.warp_stride(value),
            ExprKind::Ramp { base, stride, .. } => {
                let ss = self.warp_stride(stride)?;
                if kiln_ir::simplify(&ss).is_zero() { self.warp_stride(base) } else { None }
            }
            ExprKind::Let { name, value, body } => {
                let d = self.warp_stride(value);
                self.dependent.push(name.clone(), d);
                let result = self.warp_stride(body);
                self.dependent.pop(name);
                result
            }
            _ if !self.uses_dependent(e) => Some(Expr::int(0)),
            _ => None,
        }
    }

    /// Walk `body` and derive the stride.
    ///
    /// # Errors
    ///
    /// [`Error::BadWarpStride`] when stores disagree on the stride or do not
    /// put every element in the stripe of the lane storing it.
    pub(crate) fn run(mut self, body: &Arc<Stmt>) -> Result<Arc<Expr>> {
        self.visit_stmt(body);
        self.get_stride()
    }

    fn get_stride(&mut self) -> Result<Arc<Expr>> {
        let lane = Expr::var(self.lane);
        let warp_size = Expr::int(self.warp_size);
        let mut stride: Option<Arc<Expr>> = None;
        let mut bad = Vec::new();

        for e in self.stores.clone() {
            let s = self.warp_stride(&e).map(|s| kiln_ir::simplify(&s));
            if stride.is_none() {
                stride = s.clone();
            }
            let ok = match (&s, &stride) {
                (Some(s), Some(stride)) => {
                    self.can_prove(&stride.cmp_eq(s))
                        && self.can_prove(&reduce_expr(&e.div(stride).sub(&lane), &warp_size, &self.bounds).cmp_eq(0))
                }
                _ => false,
            };
            if !ok {
                bad.push(e);
            }
        }

        // Loads work with any stride; a matching one keeps them lane-local.
        for e in self.loads.clone() {
            if stride.is_none() {
                stride = self.warp_stride(&e).map(|s| kiln_ir::simplify(&s));
            }
        }

        if let Some(stride) = &stride {
            for e in &self.single_stores {
                let simpler = substitute(self.lane, &Expr::int(0), e);
                if !self.can_prove(&reduce_expr(&simpler.div(stride), &warp_size, &self.bounds).cmp_eq(0)) {
                    bad.push(e.clone());
                }
            }
        }

        if !bad.is_empty() {
            return Err(Error::BadWarpStride {
                alloc: self.alloc.to_string(),
                lane: self.lane.to_string(),
                stores: self.describe(&bad),
            });
        }
        // Only ever touched by single-lane stores.
        Ok(stride.unwrap_or_else(|| Expr::int(1)))
    }

    fn describe(&self, bad: &[Arc<Expr>]) -> String {
        let mut out = String::new();
        let mut section = |title: String, indices: &[Arc<Expr>]| {
            if !indices.is_empty() {
                out.push_str(&title);
                for e in indices {
                    out.push_str(&format!("  {e}\n"));
                }
            }
        };
        section(format!("{} is stored to at the following indices by multiple lanes:\n", self.alloc), &self.stores);
        section("And the following indices by lane zero:\n".to_string(), &self.single_stores);
        section("And loaded from at the following indices:\n".to_string(), &self.loads);
        section("The problematic indices are:\n".to_string(), bad);
        out
    }
}

impl Visitor for DetermineAllocStride<'_> {
    fn visit_expr(&mut self, e: &Arc<Expr>) {
        match e.kind() {
            ExprKind::Let { name, value, body } => {
                self.visit_expr(value);
                let d = self.warp_stride(value);
                self.dependent.push(name.clone(), d);
                self.visit_expr(body);
                self.dependent.pop(name);
            }
            ExprKind::Load(load) => {
                if load.name == self.alloc {
                    self.loads.push(load.index.clone());
                }
                walk_expr(self, e);
            }
            _ => walk_expr(self, e),
        }
    }

    fn visit_stmt(&mut self, s: &Arc<Stmt>) {
        match s.kind() {
            StmtKind::LetStmt { name, value, body } => {
                self.visit_expr(value);
                let d = self.warp_stride(value);
                self.dependent.push(name.clone(), d);
                self.visit_stmt(body);
                self.dependent.pop(name);
            }
            StmtKind::Store { name, index, .. } => {
                if name == self.alloc {
                    if self.single_thread {
                        self.single_stores.push(index.clone());
                    } else {
                        self.stores.push(index.clone());
                    }
                }
                walk_stmt(self, s);
            }
            StmtKind::IfThenElse { condition, then_case, else_case } => {
                self.visit_expr(condition);
                let lane = Expr::var(self.lane);
                let at_most_one = self.can_prove(&condition.not().or(lane.cmp_le(1)));
                let single = self.single_thread || at_most_one;
                let was_single = std::mem::replace(&mut self.single_thread, single);
                self.visit_stmt(then_case);
                self.single_thread = was_single;
                if let Some(e) = else_case {
                    self.visit_stmt(e);
                }
            }
            StmtKind::For(f) => {
                let constant = f.min.as_int().zip(f.extent.as_int());
                if let Some((min, extent)) = constant {
                    self.bounds.push(f.name.clone(), ConstInterval::bounded(min, min + extent - 1));
                }
                let dependent = self.uses_dependent(&f.min) || self.uses_dependent(&f.extent);
                if dependent {
                    self.dependent.push(f.name.clone(), None);
                }
                walk_stmt(self, s);
                if dependent {
                    self.dependent.pop(&f.name);
                }
                if constant.is_some() {
                    self.bounds.pop(&f.name);
                }
            }
            _ => walk_stmt(self, s),
        }
    }
}
