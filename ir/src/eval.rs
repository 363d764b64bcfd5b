//! Reference interpreter for scalar programs.
//!
//! [`Machine`] executes expressions and statements directly over constant
//! values. It exists so transformations can be checked by running a program
//! before and after a pass and comparing the buffers it writes.
//!
//! Fork branches run one after the other, first branch first. Acquiring a
//! semaphore that does not hold enough permits is reported as a deadlock,
//! which is what a sequential run of a correctly ordered fork never hits.
//! Vector nodes other than broadcasts are not supported.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use kiln_dtype::Type;

use crate::expr::{Call, Expr, ExprKind};
use crate::func::Env;
use crate::scope::Scope;
use crate::simplify::fold::apply_binary;
use crate::stmt::{Stmt, StmtKind};
use crate::types::{BinOp, CallType, ConstValue, Intrinsic, runtime};

/// Sparse multi-dimensional storage of one tuple element.
pub type Samples = BTreeMap<Vec<i64>, ConstValue>;

/// Interpreter state: variable bindings, buffers, realizations, semaphores.
#[derive(Debug)]
pub struct Machine<'a> {
    env: &'a Env,
    vars: Scope<ConstValue>,
    buffers: HashMap<String, BTreeMap<i64, ConstValue>>,
    freed: HashSet<String>,
    images: HashMap<String, Samples>,
    realizations: HashMap<String, Vec<Samples>>,
    semaphores: Vec<i64>,
}

fn as_bool(v: ConstValue) -> bool {
    !v.is_zero()
}

fn bool_value(b: bool) -> ConstValue {
    ConstValue::UInt(u64::from(b))
}

fn as_i64(v: ConstValue) -> i64 {
    match v {
        ConstValue::Float(f) => f as i64,
        other => other.as_i64().unwrap_or_else(|| panic!("value {other:?} does not fit in i64")),
    }
}

fn convert(v: ConstValue, ty: Type) -> ConstValue {
    v.cast(ty.element_of()).unwrap_or(v)
}

fn binary(op: BinOp, x: ConstValue, y: ConstValue, operand_ty: Type) -> ConstValue {
    let (x, y, ty) = if op.is_logical() {
        (bool_value(as_bool(x)), bool_value(as_bool(y)), Type::BOOL)
    } else {
        (x, y, operand_ty.element_of())
    };
    apply_binary(op, x, y, ty).unwrap_or_else(|| panic!("cannot apply {op} to {x:?} and {y:?}"))
}

/// Libm-style extern math, named with an optional `_f32`/`_f64` suffix.
fn eval_math(name: &str, args: &[f64]) -> Option<f64> {
    let base = name.strip_suffix("_f32").or_else(|| name.strip_suffix("_f64")).unwrap_or(name);
    let x = args.first().copied()?;
    Some(match base {
        "exp" => x.exp(),
        "log" => x.ln(),
        "sqrt" => x.sqrt(),
        "sin" => x.sin(),
        "cos" => x.cos(),
        "tan" => x.tan(),
        "asin" => x.asin(),
        "acos" => x.acos(),
        "atan" => x.atan(),
        "sinh" => x.sinh(),
        "cosh" => x.cosh(),
        "tanh" => x.tanh(),
        "floor" => x.floor(),
        "ceil" => x.ceil(),
        "round" => x.round_ties_even(),
        "trunc" => x.trunc(),
        "atan2" => x.atan2(*args.get(1)?),
        "pow" => x.powf(*args.get(1)?),
        _ => return None,
    })
}

impl<'a> Machine<'a> {
    pub fn new(env: &'a Env) -> Self {
        Self {
            env,
            vars: Scope::new(),
            buffers: HashMap::new(),
            freed: HashSet::new(),
            images: HashMap::new(),
            realizations: HashMap::new(),
            semaphores: Vec::new(),
        }
    }

    // ========================================================================
    // Setup and inspection
    // ========================================================================

    pub fn bind(&mut self, name: &str, value: ConstValue) {
        self.vars.push(name, value);
    }

    pub fn bind_int(&mut self, name: &str, value: i64) {
        self.bind(name, ConstValue::Int(value));
    }

    /// Fill the flat buffer `name`.
    pub fn set_buffer(&mut self, name: &str, values: impl IntoIterator<Item = (i64, ConstValue)>) {
        self.buffers.insert(name.to_string(), values.into_iter().collect());
    }

    /// Fill the input image `name`, read through `Image` calls.
    pub fn set_image(&mut self, name: &str, samples: Samples) {
        self.images.insert(name.to_string(), samples);
    }

    pub fn buffer(&self, name: &str) -> Option<&BTreeMap<i64, ConstValue>> {
        self.buffers.get(name)
    }

    /// Stored values of tuple element `value_index` of function `name`.
    pub fn realization(&self, name: &str, value_index: usize) -> Option<&Samples> {
        self.realizations.get(name).and_then(|r| r.get(value_index))
    }

    // ========================================================================
    // Expressions
    // ========================================================================

    pub fn eval(&mut self, e: &Arc<Expr>) -> ConstValue {
        match e.kind() {
            ExprKind::Const(c) => *c,
            ExprKind::StringImm(_) => ConstValue::UInt(0),
            ExprKind::Variable(v) => *self.vars.get(&v.name).unwrap_or_else(|| panic!("unbound variable {}", v.name)),
            ExprKind::Cast(a) => {
                let v = self.eval(a);
                convert(v, e.ty())
            }
            ExprKind::Reinterpret(a) => {
                let v = self.eval(a);
                let to = e.ty();
                match (v, to.is_float()) {
                    (ConstValue::Float(f), false) if a.ty().bits() == 32 => {
                        convert(ConstValue::UInt(u64::from((f as f32).to_bits())), to)
                    }
                    (ConstValue::Float(f), false) => convert(ConstValue::UInt(f.to_bits()), to),
                    (ConstValue::Float(_), true) => v,
                    (other, true) if to.bits() == 32 => {
                        ConstValue::Float(f64::from(f32::from_bits(as_i64(other) as u32)))
                    }
                    (other, true) => ConstValue::Float(f64::from_bits(as_i64(other) as u64)),
                    (other, false) => convert(other, to),
                }
            }
            ExprKind::Binary(op, a, b) => {
                let (x, y) = (self.eval(a), self.eval(b));
                binary(*op, x, y, a.ty())
            }
            ExprKind::Not(a) => {
                let v = self.eval(a);
                bool_value(!as_bool(v))
            }
            ExprKind::Select(c, t, f) => {
                if as_bool(self.eval(c)) {
                    self.eval(t)
                } else {
                    self.eval(f)
                }
            }
            ExprKind::Load(l) => {
                if !as_bool(self.eval(&l.predicate)) {
                    return convert(ConstValue::Int(0), e.ty());
                }
                let index = as_i64(self.eval(&l.index));
                assert!(!self.freed.contains(&l.name), "load from {} after it was freed", l.name);
                self.buffers
                    .get(&l.name)
                    .and_then(|b| b.get(&index))
                    .copied()
                    .unwrap_or_else(|| convert(ConstValue::Int(0), e.ty()))
            }
            ExprKind::Broadcast { value, .. } => self.eval(value),
            ExprKind::Ramp { .. } | ExprKind::Shuffle { .. } | ExprKind::VectorReduce { .. } => {
                panic!("cannot evaluate vector expression {e}")
            }
            ExprKind::Call(c) => self.call(c, e.ty()),
            ExprKind::Let { name, value, body } => {
                let v = self.eval(value);
                self.vars.push(name.as_str(), v);
                let result = self.eval(body);
                self.vars.pop(name);
                result
            }
        }
    }

    /// Integer value of `e`.
    pub fn eval_int(&mut self, e: &Arc<Expr>) -> i64 {
        let v = self.eval(e);
        as_i64(v)
    }

    fn call(&mut self, c: &Call, ty: Type) -> ConstValue {
        match c.call_type {
            CallType::Halide => {
                let args: Vec<i64> = c.args.iter().map(|a| self.eval_int(a)).collect();
                self.call_function(&c.name, c.value_index, &args)
            }
            CallType::Image => {
                let args: Vec<i64> = c.args.iter().map(|a| self.eval_int(a)).collect();
                let image = self.images.get(&c.name).unwrap_or_else(|| panic!("no input image {}", c.name));
                image.get(&args).copied().unwrap_or_else(|| convert(ConstValue::Int(0), ty))
            }
            CallType::Intrinsic | CallType::PureIntrinsic => self.intrinsic(c, ty),
            CallType::Extern | CallType::PureExtern => self.extern_call(c, ty),
        }
    }

    fn call_function(&mut self, name: &str, value_index: usize, args: &[i64]) -> ConstValue {
        if let Some(v) = self.realizations.get(name).and_then(|r| r.get(value_index)).and_then(|s| s.get(args)) {
            return *v;
        }
        let env = self.env;
        let f = env.lookup(name).unwrap_or_else(|| panic!("call to unknown function {name}"));
        assert!(
            !f.has_update_definition(),
            "{name}{args:?} is outside its realization and {name} has updates"
        );
        let value = f.values().get(value_index).unwrap_or_else(|| panic!("{name} has no value {value_index}"));
        let saved = std::mem::take(&mut self.vars);
        for (arg, v) in f.args().iter().zip(args) {
            self.vars.push(arg.as_str(), ConstValue::Int(*v));
        }
        let result = self.eval(value);
        self.vars = saved;
        result
    }

    fn intrinsic(&mut self, c: &Call, ty: Type) -> ConstValue {
        let intrinsic = c.intrinsic().unwrap_or_else(|| panic!("unknown intrinsic {}", c.name));
        let arg = |m: &mut Self, i: usize| m.eval(&c.args[i]);
        match intrinsic {
            Intrinsic::Likely | Intrinsic::LikelyIfInnermost | Intrinsic::PromiseClamped => arg(self, 0),
            Intrinsic::ReturnSecond => {
                arg(self, 0);
                arg(self, 1)
            }
            Intrinsic::Abs => match arg(self, 0) {
                ConstValue::Int(v) => convert(ConstValue::Int(v.wrapping_abs()), ty),
                ConstValue::Float(v) => ConstValue::Float(v.abs()),
                other => other,
            },
            Intrinsic::Lerp => {
                let (a, b, w) = (arg(self, 0).as_f64(), arg(self, 1).as_f64(), arg(self, 2).as_f64());
                convert(ConstValue::Float(a + (b - a) * w), ty)
            }
            Intrinsic::BitwiseAnd
            | Intrinsic::BitwiseOr
            | Intrinsic::BitwiseXor
            | Intrinsic::ShiftLeft
            | Intrinsic::ShiftRight => {
                let (a, b) = (as_i64(arg(self, 0)), as_i64(arg(self, 1)));
                let v = match intrinsic {
                    Intrinsic::BitwiseAnd => a & b,
                    Intrinsic::BitwiseOr => a | b,
                    Intrinsic::BitwiseXor => a ^ b,
                    Intrinsic::ShiftLeft => a.wrapping_shl(b as u32),
                    _ => a.wrapping_shr(b as u32),
                };
                convert(ConstValue::Int(v), ty)
            }
            Intrinsic::BitwiseNot => convert(ConstValue::Int(!as_i64(arg(self, 0))), ty),
            Intrinsic::Require => {
                let ok = as_bool(arg(self, 0));
                assert!(ok, "requirement {} failed", c.args[0]);
                arg(self, 1)
            }
            Intrinsic::Alloca => {
                self.semaphores.push(0);
                ConstValue::UInt((self.semaphores.len() - 1) as u64)
            }
            Intrinsic::GpuThreadBarrier | Intrinsic::Undef | Intrinsic::AddressOf => convert(ConstValue::Int(0), ty),
        }
    }

    fn semaphore(&mut self, handle: ConstValue) -> &mut i64 {
        let h = as_i64(handle) as usize;
        self.semaphores.get_mut(h).unwrap_or_else(|| panic!("invalid semaphore handle {h}"))
    }

    fn extern_call(&mut self, c: &Call, ty: Type) -> ConstValue {
        let args: Vec<ConstValue> = c.args.iter().map(|a| self.eval(a)).collect();
        match c.name.as_str() {
            runtime::MAKE_SEMAPHORE => {
                self.semaphores.push(as_i64(args[0]));
                ConstValue::UInt((self.semaphores.len() - 1) as u64)
            }
            runtime::SEMAPHORE_INIT => {
                *self.semaphore(args[0]) = as_i64(args[1]);
                ConstValue::Int(0)
            }
            runtime::SEMAPHORE_RELEASE => {
                *self.semaphore(args[0]) += as_i64(args[1]);
                ConstValue::Int(0)
            }
            name => {
                let floats: Vec<f64> = args.iter().map(|a| a.as_f64()).collect();
                let v = eval_math(name, &floats).unwrap_or_else(|| panic!("unknown extern function {name}"));
                convert(ConstValue::Float(v), ty)
            }
        }
    }

    // ========================================================================
    // Statements
    // ========================================================================

    pub fn exec(&mut self, s: &Arc<Stmt>) {
        match s.kind() {
            StmtKind::LetStmt { name, value, body } => {
                let v = self.eval(value);
                self.vars.push(name.as_str(), v);
                self.exec(body);
                self.vars.pop(name);
            }
            StmtKind::Assert { condition, message } => {
                assert!(as_bool(self.eval(condition)), "assertion failed: {condition} ({message})");
            }
            StmtKind::ProducerConsumer { body, .. }
            | StmtKind::Atomic { body, .. }
            | StmtKind::Prefetch { body, .. } => {
                self.exec(body);
            }
            StmtKind::For(f) => {
                let min = self.eval_int(&f.min);
                let extent = self.eval_int(&f.extent);
                for i in min..min + extent {
                    self.vars.push(f.name.as_str(), ConstValue::Int(i));
                    self.exec(&f.body);
                    self.vars.pop(&f.name);
                }
            }
            StmtKind::Acquire { semaphore, count, body } => {
                let handle = self.eval(semaphore);
                let count = self.eval_int(count);
                let permits = self.semaphore(handle);
                assert!(*permits >= count, "deadlock: acquiring {count} from a semaphore holding {permits}");
                *permits -= count;
                self.exec(body);
            }
            StmtKind::Store { name, value, index, predicate } => {
                if as_bool(self.eval(predicate)) {
                    let v = self.eval(value);
                    let i = self.eval_int(index);
                    self.freed.remove(name);
                    self.buffers.entry(name.clone()).or_default().insert(i, v);
                }
            }
            StmtKind::Provide { name, values, args, predicate } => {
                if as_bool(self.eval(predicate)) {
                    let vs: Vec<ConstValue> = values.iter().map(|v| self.eval(v)).collect();
                    let coords: Vec<i64> = args.iter().map(|a| self.eval_int(a)).collect();
                    let storage = self.realizations.entry(name.clone()).or_default();
                    storage.resize_with(storage.len().max(vs.len()), Samples::new);
                    for (slot, v) in storage.iter_mut().zip(vs) {
                        slot.insert(coords.clone(), v);
                    }
                }
            }
            StmtKind::Allocate(a) => {
                let saved = self.buffers.insert(a.name.clone(), BTreeMap::new());
                let was_freed = self.freed.remove(&a.name);
                self.exec(&a.body);
                match saved {
                    Some(b) => self.buffers.insert(a.name.clone(), b),
                    None => self.buffers.remove(&a.name),
                };
                if was_freed {
                    self.freed.insert(a.name.clone());
                } else {
                    self.freed.remove(&a.name);
                }
            }
            StmtKind::Free { name } => {
                self.freed.insert(name.clone());
            }
            StmtKind::Realize(r) => {
                let saved = self.realizations.insert(r.name.clone(), vec![Samples::new(); r.types.len()]);
                self.exec(&r.body);
                match saved {
                    Some(old) => self.realizations.insert(r.name.clone(), old),
                    None => self.realizations.remove(&r.name),
                };
            }
            StmtKind::Block(a, b) | StmtKind::Fork(a, b) => {
                self.exec(a);
                self.exec(b);
            }
            StmtKind::IfThenElse { condition, then_case, else_case } => {
                if as_bool(self.eval(condition)) {
                    self.exec(then_case);
                } else if let Some(e) = else_case {
                    self.exec(e);
                }
            }
            StmtKind::Evaluate(e) => {
                self.eval(e);
            }
        }
    }

    // ========================================================================
    // Functions
    // ========================================================================

    /// Compute every stage of function `name` over `region` (one `(min,
    /// extent)` per dimension) and keep the result as its realization.
    ///
    /// Update stages iterate their pure dimensions over `region` and their
    /// reduction variables over the reduction domain, innermost dimension
    /// fastest, skipping points where the domain predicate is false.
    pub fn realize(&mut self, name: &str, region: &[(i64, i64)]) {
        let env = self.env;
        let f = env.lookup(name).unwrap_or_else(|| panic!("cannot realize unknown function {name}"));
        assert_eq!(region.len(), f.dimensions(), "region for {name} has the wrong dimensionality");
        let saved = std::mem::take(&mut self.vars);

        let mut storage = vec![Samples::new(); f.outputs()];
        let pure_values = f.values();
        for point in points(region) {
            for (arg, v) in f.args().iter().zip(&point) {
                self.vars.push(arg.as_str(), ConstValue::Int(*v));
            }
            for (slot, value) in storage.iter_mut().zip(pure_values) {
                let v = self.eval(value);
                slot.insert(point.clone(), v);
            }
            for arg in f.args() {
                self.vars.pop(arg);
            }
        }
        self.realizations.insert(name.to_string(), storage);

        for update in f.updates() {
            // Loop nest, outermost first.
            let mut loops: Vec<(String, i64, i64)> = Vec::new();
            for dim in update.schedule.dims.iter().rev() {
                if let Some(pos) = f.args().iter().position(|a| *a == dim.var) {
                    loops.push((dim.var.clone(), region[pos].0, region[pos].1));
                } else if let Some(rv) = update.rdom.as_ref().and_then(|r| r.vars().iter().find(|v| v.var == dim.var)) {
                    let (min, extent) = (self.eval_int(&rv.min), self.eval_int(&rv.extent));
                    loops.push((dim.var.clone(), min, extent));
                }
            }
            let predicate = update.predicate();
            self.run_update(name, update, &loops, &predicate);
        }
        self.vars = saved;
    }

    fn run_update(
        &mut self,
        name: &str,
        update: &crate::func::Definition,
        loops: &[(String, i64, i64)],
        predicate: &Arc<Expr>,
    ) {
        let Some(((var, min, extent), inner)) = loops.split_first() else {
            if !as_bool(self.eval(predicate)) {
                return;
            }
            let values: Vec<ConstValue> = update.values.iter().map(|v| self.eval(v)).collect();
            let coords: Vec<i64> = update.args.iter().map(|a| self.eval_int(a)).collect();
            if let Some(storage) = self.realizations.get_mut(name) {
                for (slot, v) in storage.iter_mut().zip(values) {
                    slot.insert(coords.clone(), v);
                }
            }
            return;
        };
        for i in *min..*min + *extent {
            self.vars.push(var.as_str(), ConstValue::Int(i));
            self.run_update(name, update, inner, predicate);
            self.vars.pop(var);
        }
    }
}

/// Every point of a box given as `(min, extent)` per dimension, first
/// dimension fastest.
pub fn points(region: &[(i64, i64)]) -> Vec<Vec<i64>> {
    let mut out: Vec<Vec<i64>> = vec![Vec::new()];
    for &(min, extent) in region {
        out = (min..min + extent)
            .flat_map(|i| {
                out.iter().map(move |p| {
                    let mut q = p.clone();
                    q.push(i);
                    q
                })
            })
            .collect();
    }
    out
}

/// Evaluate `e` with integer variables bound by `bindings` and no functions.
pub fn eval_with(e: &Arc<Expr>, bindings: &[(&str, i64)]) -> ConstValue {
    let env = Env::new();
    let mut m = Machine::new(&env);
    for (name, v) in bindings {
        m.bind_int(name, *v);
    }
    m.eval(e)
}
