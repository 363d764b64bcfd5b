//! Symbolic interval analysis.
//!
//! [`bounds_of_expr_in_scope`] computes an [`Interval`] containing every value
//! an expression may take when the variables in scope range over their
//! intervals. [`boxes_required`] collects, per called function or buffer,
//! the [`Region`] of coordinates an expression reads.
//!
//! Results are conservative: an unbounded side is always a sound answer.

use std::collections::BTreeMap;
use std::sync::Arc;

use kiln_dtype::Type;

use crate::expr::{Expr, ExprKind};
use crate::scope::Scope;
use crate::simplify::{can_prove, simplify};
use crate::types::{BinOp, Intrinsic, VectorReduceOp};
use crate::visit::{Visitor, walk_expr};

// ============================================================================
// Interval
// ============================================================================

/// One end of an interval.
#[derive(Debug, Clone)]
pub enum Bound {
    NegInf,
    PosInf,
    Finite(Arc<Expr>),
}

impl Bound {
    pub fn as_expr(&self) -> Option<&Arc<Expr>> {
        match self {
            Self::Finite(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_finite(&self) -> bool {
        matches!(self, Self::Finite(_))
    }

    fn map(&self, f: impl FnOnce(&Arc<Expr>) -> Arc<Expr>) -> Self {
        match self {
            Self::Finite(e) => Self::Finite(f(e)),
            other => other.clone(),
        }
    }

    fn same(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::NegInf, Self::NegInf) | (Self::PosInf, Self::PosInf) => true,
            (Self::Finite(a), Self::Finite(b)) => crate::equality::graph_equal(a, b),
            _ => false,
        }
    }
}

/// Closed interval `[min, max]`; either side may be infinite.
///
/// `[-inf, +inf]` is "everything" and `[+inf, -inf]` is "nothing".
#[derive(Debug, Clone)]
pub struct Interval {
    pub min: Bound,
    pub max: Bound,
}

impl Interval {
    pub fn new(min: Bound, max: Bound) -> Self {
        Self { min, max }
    }

    pub fn bounded(min: Arc<Expr>, max: Arc<Expr>) -> Self {
        Self { min: Bound::Finite(min), max: Bound::Finite(max) }
    }

    pub fn single_point(e: Arc<Expr>) -> Self {
        Self::bounded(e.clone(), e)
    }

    pub fn everything() -> Self {
        Self { min: Bound::NegInf, max: Bound::PosInf }
    }

    pub fn nothing() -> Self {
        Self { min: Bound::PosInf, max: Bound::NegInf }
    }

    pub fn bounded_below(min: Arc<Expr>) -> Self {
        Self { min: Bound::Finite(min), max: Bound::PosInf }
    }

    pub fn bounded_above(max: Arc<Expr>) -> Self {
        Self { min: Bound::NegInf, max: Bound::Finite(max) }
    }

    pub fn is_everything(&self) -> bool {
        matches!((&self.min, &self.max), (Bound::NegInf, Bound::PosInf))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.min, Bound::PosInf) || matches!(self.max, Bound::NegInf)
    }

    pub fn has_lower_bound(&self) -> bool {
        self.min.is_finite()
    }

    pub fn has_upper_bound(&self) -> bool {
        self.max.is_finite()
    }

    pub fn is_bounded(&self) -> bool {
        self.has_lower_bound() && self.has_upper_bound()
    }

    pub fn is_single_point(&self) -> bool {
        self.min.same(&self.max) && self.min.is_finite()
    }

    pub fn min_expr(&self) -> Option<&Arc<Expr>> {
        self.min.as_expr()
    }

    pub fn max_expr(&self) -> Option<&Arc<Expr>> {
        self.max.as_expr()
    }

    /// Smallest interval containing both.
    pub fn union(&self, other: &Self) -> Self {
        if self.is_empty() {
            return other.clone();
        }
        if other.is_empty() {
            return self.clone();
        }
        let min = match (&self.min, &other.min) {
            (Bound::NegInf, _) | (_, Bound::NegInf) => Bound::NegInf,
            (Bound::Finite(a), Bound::Finite(b)) => Bound::Finite(simplify(&a.min(b))),
            (Bound::PosInf, b) => b.clone(),
            (a, Bound::PosInf) => a.clone(),
        };
        let max = match (&self.max, &other.max) {
            (Bound::PosInf, _) | (_, Bound::PosInf) => Bound::PosInf,
            (Bound::Finite(a), Bound::Finite(b)) => Bound::Finite(simplify(&a.max(b))),
            (Bound::NegInf, b) => b.clone(),
            (a, Bound::NegInf) => a.clone(),
        };
        Self { min, max }
    }

    /// Largest interval contained in both.
    pub fn intersect(&self, other: &Self) -> Self {
        let min = match (&self.min, &other.min) {
            (Bound::PosInf, _) | (_, Bound::PosInf) => Bound::PosInf,
            (Bound::Finite(a), Bound::Finite(b)) => Bound::Finite(simplify(&a.max(b))),
            (Bound::NegInf, b) => b.clone(),
            (a, Bound::NegInf) => a.clone(),
        };
        let max = match (&self.max, &other.max) {
            (Bound::NegInf, _) | (_, Bound::NegInf) => Bound::NegInf,
            (Bound::Finite(a), Bound::Finite(b)) => Bound::Finite(simplify(&a.min(b))),
            (Bound::PosInf, b) => b.clone(),
            (a, Bound::PosInf) => a.clone(),
        };
        Self { min, max }
    }

    /// Grow to contain the point `e`.
    pub fn include(&mut self, e: &Arc<Expr>) {
        *self = self.union(&Self::single_point(e.clone()));
    }

    fn simplified(self) -> Self {
        Self { min: self.min.map(simplify), max: self.max.map(simplify) }
    }
}

impl PartialEq for Interval {
    fn eq(&self, other: &Self) -> bool {
        self.min.same(&other.min) && self.max.same(&other.max)
    }
}

// ============================================================================
// Regions
// ============================================================================

/// Hyper-rectangular region: one interval per dimension.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Region {
    pub bounds: Vec<Interval>,
}

impl Region {
    pub fn new(bounds: Vec<Interval>) -> Self {
        Self { bounds }
    }

    pub fn dimensions(&self) -> usize {
        self.bounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bounds.iter().any(Interval::is_empty)
    }

    pub fn is_bounded(&self) -> bool {
        self.bounds.iter().all(Interval::is_bounded)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Interval> {
        self.bounds.iter()
    }
}

impl std::ops::Index<usize> for Region {
    type Output = Interval;

    fn index(&self, i: usize) -> &Interval {
        &self.bounds[i]
    }
}

impl std::ops::IndexMut<usize> for Region {
    fn index_mut(&mut self, i: usize) -> &mut Interval {
        &mut self.bounds[i]
    }
}

impl FromIterator<Interval> for Region {
    fn from_iter<I: IntoIterator<Item = Interval>>(iter: I) -> Self {
        Self { bounds: iter.into_iter().collect() }
    }
}

/// Grow `a` to also cover `b`. An empty `a` (no dimensions) becomes `b`.
pub fn merge_boxes(a: &mut Region, b: &Region) {
    if a.bounds.is_empty() {
        *a = b.clone();
        return;
    }
    if b.bounds.is_empty() {
        return;
    }
    assert_eq!(a.dimensions(), b.dimensions(), "merging regions of different dimensionality");
    for (x, y) in a.bounds.iter_mut().zip(&b.bounds) {
        *x = x.union(y);
    }
}

pub fn box_union(a: &Region, b: &Region) -> Region {
    let mut out = a.clone();
    merge_boxes(&mut out, b);
    out
}

pub fn box_intersection(a: &Region, b: &Region) -> Region {
    assert_eq!(a.dimensions(), b.dimensions(), "intersecting regions of different dimensionality");
    a.bounds.iter().zip(&b.bounds).map(|(x, y)| x.intersect(y)).collect()
}

/// Per-dimension union of every region in `regions` keyed by name.
pub fn merge_regions(into: &mut BTreeMap<String, Region>, from: &BTreeMap<String, Region>) {
    for (name, region) in from {
        merge_boxes(into.entry(name.clone()).or_default(), region);
    }
}

// ============================================================================
// Expression bounds
// ============================================================================

fn type_interval(ty: Type) -> Interval {
    if ty.is_bool() {
        return Interval::bounded(Expr::const_false(), Expr::const_true());
    }
    if ty.is_integral() && ty.bits() <= 16 {
        return Interval::bounded(Expr::type_min(ty.element_of()), Expr::type_max(ty.element_of()));
    }
    Interval::everything()
}

fn add_bounds(a: &Bound, b: &Bound, op: BinOp) -> Bound {
    match (a, b) {
        (Bound::Finite(x), Bound::Finite(y)) => Bound::Finite(Expr::binary(op, x.clone(), y.clone())),
        (Bound::Finite(_), inf) if op == BinOp::Add => inf.clone(),
        (Bound::Finite(_), Bound::NegInf) => Bound::PosInf,
        (Bound::Finite(_), Bound::PosInf) => Bound::NegInf,
        (inf, _) => inf.clone(),
    }
}

struct Bounds<'a> {
    scope: &'a mut Scope<Interval>,
}

impl Bounds<'_> {
    fn bounds(&mut self, e: &Arc<Expr>) -> Interval {
        let ty = e.ty();
        match e.kind() {
            ExprKind::Const(_) => Interval::single_point(e.clone()),
            ExprKind::StringImm(_) => Interval::everything(),
            ExprKind::Variable(v) => match self.scope.get(&v.name) {
                Some(i) => i.clone(),
                None => Interval::single_point(e.clone()),
            },
            ExprKind::Cast(a) => {
                let from = a.ty();
                let inner = self.bounds(a);
                let widening = (from.is_int() && ty.is_int() && ty.bits() >= from.bits())
                    || (from.is_uint() && ty.is_integral() && ty.bits() > from.bits())
                    || (from.is_integral() && ty.is_float())
                    || (from.is_float() && ty.is_float() && ty.bits() >= from.bits());
                if widening {
                    Interval::new(inner.min.map(|m| m.cast(ty)), inner.max.map(|m| m.cast(ty)))
                } else if inner.is_bounded() && ty.is_integral() {
                    // Narrowing is exact when the values provably fit.
                    let (lo, hi) = (Expr::type_min(ty), Expr::type_max(ty));
                    let (Some(mn), Some(mx)) = (inner.min_expr(), inner.max_expr()) else {
                        return type_interval(ty);
                    };
                    let fits = !from.is_float()
                        && can_prove(&mn.cmp_ge(&lo.cast(from)).and(&mx.cmp_le(&hi.cast(from))));
                    if fits { Interval::bounded(mn.cast(ty), mx.cast(ty)) } else { type_interval(ty) }
                } else {
                    type_interval(ty)
                }
            }
            ExprKind::Reinterpret(_) => type_interval(ty),
            ExprKind::Binary(op, a, b) => self.binary(e, *op, a, b).simplified(),
            ExprKind::Not(a) => {
                let i = self.bounds(a);
                match (i.min_expr(), i.max_expr()) {
                    (Some(lo), Some(hi)) => Interval::bounded(hi.not(), lo.not()),
                    _ => type_interval(ty),
                }
            }
            ExprKind::Select(c, t, f) => {
                let cond = self.bounds(c);
                if cond.min_expr().is_some_and(|m| simplify(m).is_true()) {
                    return self.bounds(t);
                }
                if cond.max_expr().is_some_and(|m| simplify(m).is_false()) {
                    return self.bounds(f);
                }
                self.bounds(t).union(&self.bounds(f))
            }
            ExprKind::Load(_) => type_interval(ty),
            ExprKind::Ramp { base, stride, lanes } => {
                let last = base.add(&stride.mul(i64::from(*lanes) - 1));
                let b = self.bounds(base);
                b.union(&self.bounds(&last))
            }
            ExprKind::Broadcast { value, .. } => self.bounds(value),
            ExprKind::Shuffle { vectors, .. } => {
                vectors.iter().fold(Interval::nothing(), |acc, v| acc.union(&self.bounds(v)))
            }
            ExprKind::VectorReduce { op, value } => {
                let inner = self.bounds(value);
                let factor = i64::from(value.ty().lanes() / ty.lanes().max(1));
                match op {
                    VectorReduceOp::Add => Interval::new(
                        inner.min.map(|m| m.mul(factor)),
                        inner.max.map(|m| m.mul(factor)),
                    ),
                    VectorReduceOp::Min | VectorReduceOp::Max | VectorReduceOp::And | VectorReduceOp::Or => inner,
                    VectorReduceOp::Mul => type_interval(ty),
                }
            }
            ExprKind::Call(c) => match c.intrinsic() {
                Some(Intrinsic::Likely | Intrinsic::LikelyIfInnermost | Intrinsic::ReturnSecond) => {
                    c.args.last().map_or_else(|| type_interval(ty), |a| self.bounds(a))
                }
                Some(Intrinsic::PromiseClamped) if c.args.len() == 3 => {
                    let v = self.bounds(&c.args[0]);
                    let clamp = Interval::new(self.bounds(&c.args[1]).min, self.bounds(&c.args[2]).max);
                    v.intersect(&clamp)
                }
                Some(Intrinsic::Abs) => {
                    let Some(a) = c.args.first() else { return type_interval(ty) };
                    let i = self.bounds(a);
                    match (i.min_expr(), i.max_expr()) {
                        (Some(lo), _) if can_prove(&lo.cmp_ge(0)) => {
                            Interval::new(i.min.map(|m| m.cast(ty)), i.max.map(|m| m.cast(ty)))
                        }
                        (Some(lo), Some(hi)) => {
                            Interval::bounded(Expr::make_zero(ty), lo.neg().max(hi).cast(ty))
                        }
                        _ => Interval::bounded_below(Expr::make_zero(ty)),
                    }
                }
                _ => type_interval(ty),
            },
            ExprKind::Let { name, value, body } => {
                let v = self.bounds(value);
                self.scope.push(name.clone(), v);
                let result = self.bounds(body);
                self.scope.pop(name);
                result
            }
        }
    }

    fn binary(&mut self, e: &Arc<Expr>, op: BinOp, a: &Arc<Expr>, b: &Arc<Expr>) -> Interval {
        let ty = e.ty();
        let (ia, ib) = (self.bounds(a), self.bounds(b));
        if ia.is_empty() || ib.is_empty() {
            return Interval::nothing();
        }
        match op {
            BinOp::Add => Interval::new(add_bounds(&ia.min, &ib.min, op), add_bounds(&ia.max, &ib.max, op)),
            BinOp::Sub => Interval::new(add_bounds(&ia.min, &ib.max, op), add_bounds(&ia.max, &ib.min, op)),
            BinOp::Mul => {
                let point = ib.is_single_point().then(|| ib.min_expr().and_then(|m| m.as_int())).flatten();
                if let Some(c) = b.as_int().or(point) {
                    return scale(&ia, c, |x| x.mul(c));
                }
                if let Some(c) = a.as_int() {
                    return scale(&ib, c, |x| x.mul(c));
                }
                if ty.is_float() && b.as_float().is_some() {
                    let c = b.as_float().unwrap_or(1.0);
                    return scale(&ia, if c < 0.0 { -1 } else { 1 }, |x| x.mul(b));
                }
                corners(&ia, &ib, |x, y| x.mul(y))
            }
            BinOp::Div => {
                if let Some(c) = b.as_int().filter(|c| *c != 0) {
                    return scale(&ia, c, |x| x.div(c));
                }
                if ty.is_float()
                    && let Some(c) = b.as_float().filter(|c| *c != 0.0)
                {
                    return scale(&ia, if c < 0.0 { -1 } else { 1 }, |x| x.div(b));
                }
                // A divisor of known sign keeps the quotient monotonic.
                match (ib.min_expr(), ib.max_expr()) {
                    (Some(lo), Some(_)) if can_prove(&lo.cmp_gt(0)) => corners(&ia, &ib, |x, y| x.div(y)),
                    _ => type_interval(ty),
                }
            }
            BinOp::Mod => {
                if ty.is_float() {
                    return Interval::everything();
                }
                let zero = Expr::make_zero(ty);
                if let Some(c) = b.as_int().filter(|c| *c != 0) {
                    let limit = Expr::make_const(ty, c.abs() - 1);
                    if let (Some(lo), Some(hi)) = (ia.min_expr(), ia.max_expr())
                        && can_prove(&lo.cmp_ge(0).and(&hi.cmp_le(&limit)))
                    {
                        return ia;
                    }
                    return Interval::bounded(zero, limit);
                }
                match ib.max_expr() {
                    Some(hi) => Interval::bounded(zero, simplify(&hi.abs().cast(ty).sub(1).max(0))),
                    None => Interval::bounded_below(zero),
                }
            }
            BinOp::Min => Interval::new(
                match (&ia.min, &ib.min) {
                    (Bound::Finite(x), Bound::Finite(y)) => Bound::Finite(x.min(y)),
                    _ => Bound::NegInf,
                },
                match (&ia.max, &ib.max) {
                    (Bound::Finite(x), Bound::Finite(y)) => Bound::Finite(x.min(y)),
                    (Bound::Finite(x), _) | (_, Bound::Finite(x)) => Bound::Finite(x.clone()),
                    _ => Bound::PosInf,
                },
            ),
            BinOp::Max => Interval::new(
                match (&ia.min, &ib.min) {
                    (Bound::Finite(x), Bound::Finite(y)) => Bound::Finite(x.max(y)),
                    (Bound::Finite(x), _) | (_, Bound::Finite(x)) => Bound::Finite(x.clone()),
                    _ => Bound::NegInf,
                },
                match (&ia.max, &ib.max) {
                    (Bound::Finite(x), Bound::Finite(y)) => Bound::Finite(x.max(y)),
                    _ => Bound::PosInf,
                },
            ),
            _ => self.boolean(op, &ia, &ib, ty.lanes()),
        }
    }

    /// Bounds of a comparison or logical operation: a single value when
    /// decidable, otherwise `[false, true]`.
    fn boolean(&self, op: BinOp, a: &Interval, b: &Interval, lanes: u16) -> Interval {
        let both = Interval::bounded(Expr::bool_(false, lanes), Expr::bool_(true, lanes));
        let point = |v: bool| Interval::single_point(Expr::bool_(v, lanes));
        if op.is_logical() {
            let (Some(a0), Some(a1), Some(b0), Some(b1)) = (a.min_expr(), a.max_expr(), b.min_expr(), b.max_expr())
            else {
                return both;
            };
            let lo = simplify(&Expr::binary(op, a0.clone(), b0.clone()));
            let hi = simplify(&Expr::binary(op, a1.clone(), b1.clone()));
            return Interval::bounded(lo, hi);
        }
        let (Some(amin), Some(amax), Some(bmin), Some(bmax)) = (a.min_expr(), a.max_expr(), b.min_expr(), b.max_expr())
        else {
            return both;
        };
        if a.is_single_point() && b.is_single_point() {
            return Interval::single_point(simplify(&Expr::binary(op, amin.clone(), bmin.clone())));
        }
        let (always, never) = match op {
            BinOp::Lt => (amax.cmp_lt(bmin), amin.cmp_ge(bmax)),
            BinOp::Le => (amax.cmp_le(bmin), amin.cmp_gt(bmax)),
            BinOp::Gt => (amin.cmp_gt(bmax), amax.cmp_le(bmin)),
            BinOp::Ge => (amin.cmp_ge(bmax), amax.cmp_lt(bmin)),
            BinOp::Eq => (Expr::const_false(), amax.cmp_lt(bmin).or(&amin.cmp_gt(bmax))),
            BinOp::Ne => (amax.cmp_lt(bmin).or(&amin.cmp_gt(bmax)), Expr::const_false()),
            _ => return both,
        };
        if can_prove(&always) {
            point(true)
        } else if can_prove(&never) {
            point(false)
        } else {
            both
        }
    }
}

/// `f` applied to both ends, swapping them when `sign` is negative.
fn scale(i: &Interval, sign: i64, f: impl Fn(&Arc<Expr>) -> Arc<Expr>) -> Interval {
    let (lo, hi) = (i.min.map(&f), i.max.map(&f));
    if sign < 0 {
        let flip = |b: Bound| match b {
            Bound::NegInf => Bound::PosInf,
            Bound::PosInf => Bound::NegInf,
            finite => finite,
        };
        Interval::new(flip(hi), flip(lo))
    } else {
        Interval::new(lo, hi)
    }
}

/// Min and max of `f` over the four corners of two bounded intervals.
fn corners(a: &Interval, b: &Interval, f: impl Fn(&Arc<Expr>, &Arc<Expr>) -> Arc<Expr>) -> Interval {
    let (Some(a0), Some(a1), Some(b0), Some(b1)) = (a.min_expr(), a.max_expr(), b.min_expr(), b.max_expr()) else {
        return Interval::everything();
    };
    let c = [f(a0, b0), f(a0, b1), f(a1, b0), f(a1, b1)];
    let lo = c[0].min(&c[1]).min(&c[2]).min(&c[3]);
    let hi = c[0].max(&c[1]).max(&c[2]).max(&c[3]);
    Interval::bounded(lo, hi)
}

/// Interval of values `e` may take when the variables in `scope` range over
/// their intervals. Variables not in scope are treated as symbolic constants.
pub fn bounds_of_expr_in_scope(e: &Arc<Expr>, scope: &Scope<Interval>) -> Interval {
    let mut scope = scope.clone();
    Bounds { scope: &mut scope }.bounds(e).simplified()
}

// ============================================================================
// Regions required
// ============================================================================

struct BoxesRequired<'a> {
    scope: Scope<Interval>,
    regions: &'a mut BTreeMap<String, Region>,
}

impl Visitor for BoxesRequired<'_> {
    fn visit_expr(&mut self, e: &Arc<Expr>) {
        match e.kind() {
            ExprKind::Let { name, value, body } => {
                self.visit_expr(value);
                let v = bounds_of_expr_in_scope(value, &self.scope);
                self.scope.push(name.clone(), v);
                self.visit_expr(body);
                self.scope.pop(name);
            }
            ExprKind::Call(c) if c.is_data_access() => {
                walk_expr(self, e);
                let region: Region = c.args.iter().map(|a| bounds_of_expr_in_scope(a, &self.scope)).collect();
                merge_boxes(self.regions.entry(c.name.clone()).or_default(), &region);
            }
            _ => walk_expr(self, e),
        }
    }
}

/// Regions of every function and input buffer read by `e`.
pub fn boxes_required(e: &Arc<Expr>, scope: &Scope<Interval>) -> BTreeMap<String, Region> {
    let mut regions = BTreeMap::new();
    BoxesRequired { scope: scope.clone(), regions: &mut regions }.visit_expr(e);
    regions
}
