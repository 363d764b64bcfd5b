//! Human-readable rendering of expressions and statements.

use std::fmt::{self, Display, Formatter, Write};

use itertools::Itertools;

use crate::expr::{Expr, ExprKind};
use crate::stmt::{Stmt, StmtKind};
use crate::types::{BinOp, ConstValue, ForType};

impl Display for Expr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.kind() {
            ExprKind::Const(c) => match c {
                _ if self.ty().is_bool() => write!(f, "{}", !c.is_zero()),
                ConstValue::Int(v) if self.ty().bits() == 32 => write!(f, "{v}"),
                ConstValue::Int(v) => write!(f, "({}){v}", self.ty()),
                ConstValue::UInt(v) => write!(f, "({}){v}", self.ty()),
                ConstValue::Float(v) => write!(f, "{v:?}f"),
            },
            ExprKind::StringImm(s) => write!(f, "{s:?}"),
            ExprKind::Variable(v) => f.write_str(&v.name),
            ExprKind::Cast(a) => write!(f, "{}({a})", self.ty()),
            ExprKind::Reinterpret(a) => write!(f, "reinterpret<{}>({a})", self.ty()),
            ExprKind::Binary(op @ (BinOp::Min | BinOp::Max), a, b) => write!(f, "{op}({a}, {b})"),
            ExprKind::Binary(op @ (BinOp::Mul | BinOp::Div), a, b) => write!(f, "({a}{op}{b})"),
            ExprKind::Binary(op, a, b) => write!(f, "({a} {op} {b})"),
            ExprKind::Not(a) => write!(f, "!{a}"),
            ExprKind::Select(c, t, e) => write!(f, "select({c}, {t}, {e})"),
            ExprKind::Load(l) if l.predicate.is_true() => write!(f, "{}[{}]", l.name, l.index),
            ExprKind::Load(l) => write!(f, "({}[{}] if {})", l.name, l.index, l.predicate),
            ExprKind::Ramp { base, stride, lanes } => write!(f, "ramp({base}, {stride}, {lanes})"),
            ExprKind::Broadcast { value, lanes } => write!(f, "x{lanes}({value})"),
            ExprKind::Shuffle { vectors, indices } => {
                write!(f, "shuffle({}, [{}])", vectors.iter().join(", "), indices.iter().join(", "))
            }
            ExprKind::VectorReduce { op, value } => write!(f, "({}){op}({value})", self.ty()),
            ExprKind::Call(c) => {
                write!(f, "{}(", c.name)?;
                write!(f, "{}", c.args.iter().join(", "))?;
                if c.value_index > 0 {
                    write!(f, ")[{}]", c.value_index)
                } else {
                    f.write_char(')')
                }
            }
            ExprKind::Let { name, value, body } => write!(f, "(let {name} = {value} in {body})"),
        }
    }
}

struct StmtPrinter<'a, 'b> {
    f: &'a mut Formatter<'b>,
    indent: usize,
}

impl StmtPrinter<'_, '_> {
    fn line(&mut self, args: fmt::Arguments<'_>) -> fmt::Result {
        writeln!(self.f, "{:width$}{args}", "", width = self.indent)
    }

    fn nested(&mut self, header: fmt::Arguments<'_>, body: &Stmt) -> fmt::Result {
        self.line(format_args!("{header} {{"))?;
        self.indent += 2;
        self.print(body)?;
        self.indent -= 2;
        self.line(format_args!("}}"))
    }

    fn print(&mut self, s: &Stmt) -> fmt::Result {
        match s.kind() {
            StmtKind::LetStmt { name, value, body } => {
                self.line(format_args!("let {name} = {value}"))?;
                self.print(body)
            }
            StmtKind::Assert { condition, message } => self.line(format_args!("assert({condition}, {message})")),
            StmtKind::ProducerConsumer { name, is_producer, body } => {
                let verb = if *is_producer { "produce" } else { "consume" };
                self.nested(format_args!("{verb} {name}"), body)
            }
            StmtKind::For(l) => {
                let kind = match l.for_type {
                    ForType::Serial => "for".to_string(),
                    other => other.to_string(),
                };
                self.nested(format_args!("{kind} ({}, {}, {})", l.name, l.min, l.extent), &l.body)
            }
            StmtKind::Acquire { semaphore, count, body } => {
                self.nested(format_args!("acquire ({semaphore}, {count})"), body)
            }
            StmtKind::Store { name, value, index, predicate } if predicate.is_true() => {
                self.line(format_args!("{name}[{index}] = {value}"))
            }
            StmtKind::Store { name, value, index, predicate } => {
                self.line(format_args!("predicate ({predicate}) {name}[{index}] = {value}"))
            }
            StmtKind::Provide { name, values, args, .. } => {
                let args = args.iter().join(", ");
                match values.as_slice() {
                    [v] => self.line(format_args!("{name}({args}) = {v}")),
                    vs => self.line(format_args!("{name}({args}) = {{{}}}", vs.iter().join(", "))),
                }
            }
            StmtKind::Allocate(a) => {
                let extents = a.extents.iter().map(|e| format!(" * {e}")).join("");
                let cond = if a.condition.is_true() { String::new() } else { format!(" if {}", a.condition) };
                self.line(format_args!("allocate {}[{}{extents}] in {}{cond}", a.name, a.ty, a.memory_type))?;
                self.print(&a.body)
            }
            StmtKind::Free { name } => self.line(format_args!("free {name}")),
            StmtKind::Realize(r) => {
                let bounds = r.bounds.iter().map(|b| format!("[{}, {}]", b.min, b.extent)).join(", ");
                self.nested(format_args!("realize {}({bounds})", r.name), &r.body)
            }
            StmtKind::Prefetch { name, bounds, body, .. } => {
                let bounds = bounds.iter().map(|b| format!("[{}, {}]", b.min, b.extent)).join(", ");
                self.line(format_args!("prefetch {name}({bounds})"))?;
                self.print(body)
            }
            StmtKind::Block(a, b) => {
                self.print(a)?;
                self.print(b)
            }
            StmtKind::Fork(a, b) => {
                self.line(format_args!("fork {{"))?;
                self.indent += 2;
                self.print(a)?;
                self.indent -= 2;
                self.nested(format_args!("}} fork"), b)
            }
            StmtKind::IfThenElse { condition, then_case, else_case } => {
                self.line(format_args!("if ({condition}) {{"))?;
                self.indent += 2;
                self.print(then_case)?;
                self.indent -= 2;
                match else_case {
                    Some(e) => self.nested(format_args!("}} else"), e),
                    None => self.line(format_args!("}}")),
                }
            }
            StmtKind::Evaluate(v) => self.line(format_args!("{v}")),
            StmtKind::Atomic { producer_name, mutex_name, body } if mutex_name.is_empty() => {
                self.nested(format_args!("atomic ({producer_name})"), body)
            }
            StmtKind::Atomic { producer_name, mutex_name, body } => {
                self.nested(format_args!("atomic ({producer_name}, {mutex_name})"), body)
            }
        }
    }
}

impl Display for Stmt {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        StmtPrinter { f, indent: 0 }.print(self)
    }
}
