//! Constant range analysis of integer expressions.
//!
//! The analysis is conservative: when in doubt a side is left unbounded.

use std::sync::Arc;

use crate::expr::{Expr, ExprKind};
use crate::scope::Scope;
use crate::types::{BinOp, Intrinsic};

/// Integer interval with optional ends (`None` is unbounded).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConstInterval {
    pub min: Option<i64>,
    pub max: Option<i64>,
}

impl ConstInterval {
    pub const EVERYTHING: Self = Self { min: None, max: None };

    pub const fn new(min: Option<i64>, max: Option<i64>) -> Self {
        Self { min, max }
    }

    pub const fn single(v: i64) -> Self {
        Self { min: Some(v), max: Some(v) }
    }

    pub const fn bounded(min: i64, max: i64) -> Self {
        Self { min: Some(min), max: Some(max) }
    }

    pub fn is_single(&self) -> Option<i64> {
        match (self.min, self.max) {
            (Some(a), Some(b)) if a == b => Some(a),
            _ => None,
        }
    }

    pub fn union(self, other: Self) -> Self {
        Self {
            min: self.min.zip(other.min).map(|(a, b)| a.min(b)),
            max: self.max.zip(other.max).map(|(a, b)| a.max(b)),
        }
    }

    pub fn intersect(self, other: Self) -> Self {
        let pick = |a: Option<i64>, b: Option<i64>, f: fn(i64, i64) -> i64| match (a, b) {
            (Some(x), Some(y)) => Some(f(x, y)),
            (x, None) => x,
            (None, y) => y,
        };
        Self { min: pick(self.min, other.min, i64::max), max: pick(self.max, other.max, i64::min) }
    }

    pub fn add(self, o: Self) -> Self {
        Self {
            min: self.min.zip(o.min).and_then(|(a, b)| a.checked_add(b)),
            max: self.max.zip(o.max).and_then(|(a, b)| a.checked_add(b)),
        }
    }

    pub fn neg(self) -> Self {
        Self { min: self.max.and_then(i64::checked_neg), max: self.min.and_then(i64::checked_neg) }
    }

    pub fn mul(self, o: Self) -> Self {
        if let Some(c) = o.is_single() {
            return self.scale(c);
        }
        if let Some(c) = self.is_single() {
            return o.scale(c);
        }
        match (self.min, self.max, o.min, o.max) {
            (Some(a), Some(b), Some(c), Some(d)) => {
                let products = [a.checked_mul(c), a.checked_mul(d), b.checked_mul(c), b.checked_mul(d)];
                if products.iter().any(Option::is_none) {
                    return Self::EVERYTHING;
                }
                let p = products.map(|p| p.unwrap_or_default());
                Self::new(p.iter().min().copied(), p.iter().max().copied())
            }
            _ => Self::EVERYTHING,
        }
    }

    pub fn scale(self, c: i64) -> Self {
        let lo = self.min.and_then(|v| v.checked_mul(c));
        let hi = self.max.and_then(|v| v.checked_mul(c));
        match c.signum() {
            0 => Self::single(0),
            1 => Self::new(lo, hi),
            _ => Self::new(hi, lo),
        }
    }

    pub fn div(self, o: Self) -> Self {
        match o.is_single() {
            Some(c) if c > 0 => Self::new(self.min.map(|v| v.div_euclid(c)), self.max.map(|v| v.div_euclid(c))),
            Some(c) if c < 0 => {
                // Quotient decreases as the numerator grows.
                let f = |v: i64| v.div_euclid(c);
                Self::new(self.max.map(f), self.min.map(f))
            }
            _ => match (self.min, o.min, o.max) {
                // Non-negative numerator and positive divisor stay non-negative.
                (Some(a), Some(c), _) if a >= 0 && c > 0 => Self::new(Some(0), self.max),
                _ => Self::EVERYTHING,
            },
        }
    }

    pub fn modulo(self, o: Self) -> Self {
        let limit = match (o.min, o.max) {
            (Some(lo), Some(hi)) if lo > 0 => hi - 1,
            (Some(lo), Some(hi)) if hi < 0 => -lo - 1,
            _ => return Self::new(Some(0), None),
        };
        if let (Some(a), Some(b), Some(c)) = (self.min, self.max, o.is_single())
            && a >= 0
            && b < c.abs()
        {
            return self;
        }
        Self::bounded(0, limit)
    }
}

/// Bounds of the integer expression `e`, using `scope` for variables.
pub fn const_bounds(e: &Arc<Expr>, scope: &Scope<ConstInterval>) -> ConstInterval {
    let ty = e.ty();
    let type_bounds = if ty.is_bool() {
        ConstInterval::bounded(0, 1)
    } else if ty.is_int() && ty.bits() < 64 {
        ConstInterval::new(ty.element_of().min_int(), ty.element_of().max_int())
    } else if ty.is_uint() {
        let max = ty.element_of().max_uint().and_then(|m| i64::try_from(m).ok());
        ConstInterval::new(Some(0), max)
    } else {
        ConstInterval::EVERYTHING
    };
    if ty.is_float() || ty.is_handle() {
        return ConstInterval::EVERYTHING;
    }
    let result = match e.kind() {
        ExprKind::Const(c) => match c.as_i64() {
            Some(v) => ConstInterval::single(v),
            None => ConstInterval::EVERYTHING,
        },
        ExprKind::Variable(v) => scope.get(&v.name).copied().unwrap_or(ConstInterval::EVERYTHING),
        ExprKind::Cast(a) => {
            let inner = if a.ty().is_float() { ConstInterval::EVERYTHING } else { const_bounds(a, scope) };
            let fits = inner.min.zip(type_bounds.min).is_none_or(|(x, t)| x >= t)
                && inner.max.zip(type_bounds.max).is_none_or(|(x, t)| x <= t)
                && (inner.min.is_some() || type_bounds.min.is_none())
                && (inner.max.is_some() || type_bounds.max.is_none());
            if fits { inner } else { type_bounds }
        }
        ExprKind::Binary(op, a, b) if !op.is_comparison() && !op.is_logical() => {
            let (x, y) = (const_bounds(a, scope), const_bounds(b, scope));
            match op {
                BinOp::Add => x.add(y),
                BinOp::Sub => x.add(y.neg()),
                BinOp::Mul => x.mul(y),
                BinOp::Div => x.div(y),
                BinOp::Mod => x.modulo(y),
                BinOp::Min => ConstInterval::new(
                    match (x.min, y.min) {
                        (Some(p), Some(q)) => Some(p.min(q)),
                        _ => None,
                    },
                    match (x.max, y.max) {
                        (Some(p), Some(q)) => Some(p.min(q)),
                        (p, None) => p,
                        (None, q) => q,
                    },
                ),
                BinOp::Max => ConstInterval::new(
                    match (x.min, y.min) {
                        (Some(p), Some(q)) => Some(p.max(q)),
                        (p, None) => p,
                        (None, q) => q,
                    },
                    match (x.max, y.max) {
                        (Some(p), Some(q)) => Some(p.max(q)),
                        _ => None,
                    },
                ),
                _ => ConstInterval::EVERYTHING,
            }
        }
        ExprKind::Binary(..) | ExprKind::Not(_) => ConstInterval::bounded(0, 1),
        ExprKind::Select(_, t, f) => const_bounds(t, scope).union(const_bounds(f, scope)),
        ExprKind::Broadcast { value, .. } => const_bounds(value, scope),
        ExprKind::Ramp { base, stride, lanes } => {
            let b = const_bounds(base, scope);
            let s = const_bounds(stride, scope).scale(i64::from(*lanes) - 1);
            b.union(b.add(s))
        }
        ExprKind::Let { name, value, body } => {
            let v = const_bounds(value, scope);
            let mut inner = scope.clone();
            inner.push(name.clone(), v);
            const_bounds(body, &inner)
        }
        ExprKind::Call(c) => match c.intrinsic() {
            Some(Intrinsic::Likely | Intrinsic::LikelyIfInnermost | Intrinsic::PromiseClamped) => {
                c.args.first().map_or(ConstInterval::EVERYTHING, |a| const_bounds(a, scope))
            }
            Some(Intrinsic::Abs) => {
                let a = c.args.first().map_or(ConstInterval::EVERYTHING, |a| const_bounds(a, scope));
                match (a.min, a.max) {
                    (Some(lo), Some(hi)) if lo >= 0 => ConstInterval::bounded(lo, hi),
                    (Some(lo), Some(hi)) if hi <= 0 => ConstInterval::new(hi.checked_neg(), lo.checked_neg()),
                    (Some(lo), Some(hi)) => ConstInterval::new(Some(0), lo.checked_neg().map(|l| l.max(hi))),
                    _ => ConstInterval::new(Some(0), None),
                }
            }
            _ => ConstInterval::EVERYTHING,
        },
        _ => ConstInterval::EVERYTHING,
    };
    result.intersect(type_bounds)
}
