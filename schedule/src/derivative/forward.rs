//! Forward-mode differentiation.
//!
//! The tangent of an expression is its directional derivative given the
//! tangents of the functions and buffers it reads. Tangents of let-bound
//! values are bound next to them under `<name>.fwd`.

use std::collections::BTreeMap;
use std::sync::Arc;

use kiln_ir::func::realization_order;
use kiln_ir::{BinOp, CallType, Env, Expr, ExprKind, Function, Intrinsic, Scope};
use snafu::ResultExt;
use tracing::{debug, warn};

use super::utils::is_float_extern;
use crate::error::*;

fn tangent_name(name: &str) -> String {
    format!("{name}.fwd")
}

struct Forward<'a> {
    /// Tangent function of each function or buffer with a known tangent.
    tangents: &'a BTreeMap<String, String>,
    lets: Scope<()>,
}

impl Forward<'_> {
    fn tangent(&mut self, e: &Arc<Expr>) -> Result<Arc<Expr>> {
        let ty = e.ty();
        let zero = || Expr::make_zero(ty);
        Ok(match e.kind() {
            ExprKind::Const(_) | ExprKind::StringImm(_) | ExprKind::Reinterpret(_) | ExprKind::Not(_) => zero(),
            ExprKind::Variable(v) => {
                if self.lets.contains(&v.name) {
                    Expr::typed_var(ty, tangent_name(&v.name))
                } else {
                    zero()
                }
            }
            ExprKind::Cast(a) => {
                if ty.is_float() && a.ty().is_float() {
                    self.tangent(a)?.cast(ty)
                } else {
                    zero()
                }
            }
            ExprKind::Binary(op, a, b) => {
                let (da, db) = (self.tangent(a)?, self.tangent(b)?);
                match op {
                    BinOp::Add => da.add(&db),
                    BinOp::Sub => da.sub(&db),
                    BinOp::Mul => da.mul(b).add(a.mul(&db)),
                    BinOp::Div => da.mul(b).sub(a.mul(&db)).div(b.mul(b)),
                    BinOp::Min => Expr::select(a.cmp_lt(b), da, db),
                    BinOp::Max => Expr::select(a.cmp_gt(b), da, db),
                    _ => zero(),
                }
            }
            ExprKind::Select(c, t, f) => Expr::select(c.clone(), self.tangent(t)?, self.tangent(f)?),
            ExprKind::Let { name, value, body } => {
                let dvalue = self.tangent(value)?;
                self.lets.push(name.as_str(), ());
                let dbody = self.tangent(body);
                self.lets.pop(name);
                Expr::let_in(name.clone(), value.clone(), Expr::let_in(tangent_name(name), dvalue, dbody?))
            }
            ExprKind::Call(c) => match c.call_type {
                CallType::Halide | CallType::Image => match self.tangents.get(&c.name) {
                    Some(t) => Expr::func_call(ty, t.as_str(), c.args.iter().cloned(), c.value_index),
                    None => zero(),
                },
                CallType::Extern | CallType::PureExtern => self.math(e, &c.name, &c.args)?,
                CallType::Intrinsic | CallType::PureIntrinsic => match c.intrinsic() {
                    Some(Intrinsic::Abs) => {
                        let dx = self.tangent(&c.args[0])?;
                        Expr::select(c.args[0].cmp_gt(0), dx.clone(), dx.neg()).cast(ty)
                    }
                    Some(Intrinsic::Lerp) => {
                        let (a, b, w) = (&c.args[0], &c.args[1], c.args[2].cast(ty));
                        let (da, db, dw) = (self.tangent(a)?, self.tangent(b)?, self.tangent(&c.args[2])?.cast(ty));
                        da.mul(Expr::make_one(ty).sub(&w)).add(db.mul(&w)).add(dw.mul(b.sub(a)))
                    }
                    Some(Intrinsic::Likely | Intrinsic::LikelyIfInnermost | Intrinsic::PromiseClamped) => {
                        self.tangent(&c.args[0])?
                    }
                    Some(Intrinsic::ReturnSecond) => self.tangent(&c.args[1])?,
                    _ => {
                        warn!(intrinsic = %c.name, "no derivative known; tangent is zero");
                        zero()
                    }
                },
            },
            ExprKind::Load(_)
            | ExprKind::Ramp { .. }
            | ExprKind::Broadcast { .. }
            | ExprKind::Shuffle { .. }
            | ExprKind::VectorReduce { .. } => panic!("unexpected {e} in a function definition being differentiated"),
        })
    }

    fn math(&mut self, e: &Arc<Expr>, name: &str, args: &[Arc<Expr>]) -> Result<Arc<Expr>> {
        let ty = e.ty();
        let x = &args[0];
        let dx = self.tangent(x)?;
        let with_suffix = |base: &str, other: &str, args: Vec<Arc<Expr>>| {
            let suffix = name.strip_prefix(base).unwrap_or("");
            Expr::extern_call(ty, format!("{other}{suffix}"), args)
        };
        let is = |base: &str| is_float_extern(name, base);
        Ok(if is("exp") {
            dx.mul(e)
        } else if is("log") {
            dx.div(x)
        } else if is("sqrt") {
            dx.div(e.mul(2.0))
        } else if is("sin") {
            dx.mul(with_suffix("sin", "cos", vec![x.clone()]))
        } else if is("cos") {
            dx.neg().mul(with_suffix("cos", "sin", vec![x.clone()]))
        } else if is("tan") {
            let cos = with_suffix("tan", "cos", vec![x.clone()]);
            dx.div(cos.mul(&cos))
        } else if is("tanh") {
            let cosh = with_suffix("tanh", "cosh", vec![x.clone()]);
            dx.div(cosh.mul(&cosh))
        } else if is("sinh") {
            dx.mul(with_suffix("sinh", "cosh", vec![x.clone()]))
        } else if is("cosh") {
            dx.mul(with_suffix("cosh", "sinh", vec![x.clone()]))
        } else if is("atan") {
            dx.div(Expr::make_one(ty).add(x.mul(x)))
        } else if is("asin") {
            dx.div(with_suffix("asin", "sqrt", vec![Expr::make_one(ty).sub(x.mul(x))]))
        } else if is("acos") {
            dx.neg().div(with_suffix("acos", "sqrt", vec![Expr::make_one(ty).sub(x.mul(x))]))
        } else if is("atan2") {
            // atan2(y, x)
            let (y, x) = (&args[0], &args[1]);
            let (dy, dx) = (self.tangent(y)?, self.tangent(x)?);
            x.mul(&dy).sub(y.mul(&dx)).div(x.mul(x).add(y.mul(y)))
        } else if is("pow") {
            let y = &args[1];
            let dy = self.tangent(y)?;
            let from_base = dx.mul(y).mul(with_suffix("pow", "pow", vec![x.clone(), y.sub(1.0)]));
            let from_exponent = Expr::select(
                x.cmp_eq(0.0),
                Expr::make_zero(ty),
                dy.mul(e).mul(with_suffix("pow", "log", vec![x.clone()])),
            );
            from_base.add(from_exponent)
        } else if ["floor", "ceil", "round", "trunc"].iter().any(|b| is(b)) {
            Expr::make_zero(ty)
        } else {
            return UnknownExternDerivativeSnafu { name }.fail();
        })
    }
}

/// Tangent of `e`, given the tangent function of each function or buffer
/// it reads. Reads of anything without a tangent contribute zero.
pub fn forward_accumulation(e: &Arc<Expr>, tangents: &BTreeMap<String, String>) -> Result<Arc<Expr>> {
    Forward { tangents, lets: Scope::new() }.tangent(e)
}

/// Tangent functions `<name>_fwd` of every function `output` depends on,
/// producers first.
///
/// `tangents` names the tangent of each input that varies. Update stages
/// carry over, with self-references reading the tangent function itself.
#[tracing::instrument(skip_all, fields(output = output))]
pub fn propagate_tangents(env: &Env, output: &str, tangents: &BTreeMap<String, String>) -> Result<Vec<Function>> {
    let order = realization_order(&[output], env).context(IrSnafu)?;
    let mut known = tangents.clone();
    let mut out = Vec::with_capacity(order.len());
    for name in &order {
        let func = env.require(name).context(IrSnafu)?;
        let fwd_name = format!("{name}_fwd");
        let values = func.values().iter().map(|v| forward_accumulation(v, &known)).collect::<Result<Vec<_>>>()?;
        let mut fwd = Function::pure(fwd_name.as_str(), func.args(), values).context(IrSnafu)?;
        known.insert(name.clone(), fwd_name.clone());
        for update in func.updates() {
            let values =
                update.values.iter().map(|v| forward_accumulation(v, &known)).collect::<Result<Vec<_>>>()?;
            fwd.define_update(update.args.clone(), values).context(IrSnafu)?;
        }
        debug!(func = %name, tangent = %fwd_name, "tangent function");
        out.push(fwd);
    }
    Ok(out)
}
