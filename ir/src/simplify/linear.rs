//! Sums of integer terms with constant coefficients.
//!
//! Signed integers of 32 bits or more are assumed not to overflow, so
//! `Add`, `Sub` and multiplication by a constant can be regrouped freely.
//! Terms are kept in [`ExprKey`] order so equal sums print identically.

use std::collections::BTreeMap;
use std::sync::Arc;

use kiln_dtype::Type;

use crate::equality::ExprKey;
use crate::expr::{Expr, ExprKind};
use crate::types::BinOp;

/// Types on which linear regrouping is sound.
pub(crate) fn is_linear_type(ty: Type) -> bool {
    ty.is_int() && ty.is_scalar() && ty.bits() >= 32
}

#[derive(Debug, Clone)]
pub(crate) struct LinearForm {
    ty: Type,
    terms: BTreeMap<ExprKey, i64>,
    pub constant: i64,
}

impl LinearForm {
    pub fn zero(ty: Type) -> Self {
        Self { ty, terms: BTreeMap::new(), constant: 0 }
    }

    pub fn of(e: &Arc<Expr>) -> Self {
        let mut form = Self::zero(e.ty());
        form.accumulate(e, 1);
        form
    }

    /// `op(a, b)` for `Add`, `Sub` or `Mul`; `None` for a product of two
    /// non-constant operands.
    pub fn of_binary(op: BinOp, a: &Arc<Expr>, b: &Arc<Expr>) -> Option<Self> {
        let mut form = Self::zero(a.ty());
        match op {
            BinOp::Add => {
                form.accumulate(a, 1);
                form.accumulate(b, 1);
            }
            BinOp::Sub => {
                form.accumulate(a, 1);
                form.accumulate(b, -1);
            }
            BinOp::Mul => match (a.as_int(), b.as_int()) {
                (_, Some(c)) => form.accumulate(a, c),
                (Some(c), None) => form.accumulate(b, c),
                (None, None) => return None,
            },
            _ => return None,
        }
        Some(form)
    }

    /// `a - b`.
    pub fn difference(a: &Arc<Expr>, b: &Arc<Expr>) -> Self {
        let mut form = Self::zero(a.ty());
        form.accumulate(a, 1);
        form.accumulate(b, -1);
        form
    }

    fn accumulate(&mut self, e: &Arc<Expr>, scale: i64) {
        if scale == 0 {
            return;
        }
        match e.kind() {
            ExprKind::Const(_) => {
                if let Some(v) = e.as_int() {
                    self.constant = self.constant.wrapping_add(v.wrapping_mul(scale));
                } else {
                    self.add_term(e.clone(), scale);
                }
            }
            ExprKind::Binary(BinOp::Add, a, b) => {
                self.accumulate(a, scale);
                self.accumulate(b, scale);
            }
            ExprKind::Binary(BinOp::Sub, a, b) => {
                self.accumulate(a, scale);
                self.accumulate(b, scale.wrapping_neg());
            }
            ExprKind::Binary(BinOp::Mul, a, b) if b.as_int().is_some() => {
                let c = b.as_int().unwrap_or(1);
                self.accumulate(a, scale.wrapping_mul(c));
            }
            ExprKind::Binary(BinOp::Mul, a, b) if a.as_int().is_some() => {
                let c = a.as_int().unwrap_or(1);
                self.accumulate(b, scale.wrapping_mul(c));
            }
            _ => self.add_term(e.clone(), scale),
        }
    }

    pub fn add_term(&mut self, e: Arc<Expr>, coefficient: i64) {
        let key = ExprKey(e);
        let c = self.terms.entry(key.clone()).or_default();
        *c = c.wrapping_add(coefficient);
        if *c == 0 {
            self.terms.remove(&key);
        }
    }

    pub fn is_constant(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn terms(&self) -> impl Iterator<Item = (&Arc<Expr>, i64)> {
        self.terms.iter().map(|(k, c)| (&k.0, *c))
    }

    /// Split into the terms whose coefficients are multiples of `d` (divided
    /// by `d`) and the rest.
    pub fn split_divisible(&self, d: i64) -> (Self, Self) {
        let mut quotient = Self::zero(self.ty);
        let mut rest = Self::zero(self.ty);
        for (t, c) in self.terms() {
            if c % d == 0 {
                quotient.add_term(t.clone(), c / d);
            } else {
                rest.add_term(t.clone(), c);
            }
        }
        quotient.constant = self.constant.div_euclid(d);
        rest.constant = self.constant.rem_euclid(d);
        (quotient, rest)
    }

    pub fn without_constant(&self) -> Self {
        Self { constant: 0, ..self.clone() }
    }

    fn scaled(&self, t: &Arc<Expr>, c: i64) -> Arc<Expr> {
        if c == 1 { t.clone() } else { Expr::binary(BinOp::Mul, t.clone(), Expr::make_const(self.ty, c)) }
    }

    /// Rebuild as `t0*c0 + t1*c1 ... + k`, positive terms first.
    pub fn to_expr(&self) -> Arc<Expr> {
        let mut acc: Option<Arc<Expr>> = None;
        for (t, c) in self.terms().filter(|(_, c)| *c > 0) {
            let term = self.scaled(t, c);
            acc = Some(match acc {
                None => term,
                Some(a) => Expr::binary(BinOp::Add, a, term),
            });
        }
        let mut constant_used = false;
        for (t, c) in self.terms().filter(|(_, c)| *c < 0) {
            let term = self.scaled(t, c.wrapping_neg());
            acc = Some(match acc {
                None => {
                    constant_used = true;
                    Expr::binary(BinOp::Sub, Expr::make_const(self.ty, self.constant), term)
                }
                Some(a) => Expr::binary(BinOp::Sub, a, term),
            });
        }
        match acc {
            None => Expr::make_const(self.ty, self.constant),
            Some(a) if constant_used || self.constant == 0 => a,
            Some(a) => Expr::binary(BinOp::Add, a, Expr::make_const(self.ty, self.constant)),
        }
    }
}
