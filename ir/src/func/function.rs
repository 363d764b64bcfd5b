//! Pipeline functions.
//!
//! A function has one pure definition over its argument variables and any
//! number of update definitions. Updates may call the function itself; such
//! calls are plain `Call` nodes resolved by name through an [`super::Env`],
//! so no ownership cycle is formed.

use std::collections::BTreeSet;
use std::sync::Arc;

use kiln_dtype::Type;
use snafu::ensure;

use super::definition::Definition;
use super::schedule::{Dim, DimKind, FuncSchedule, StageSchedule};
use crate::error::*;
use crate::expr::{Expr, ReductionDomain};
use crate::visit::for_each_expr;

/// Function computed by an opaque external routine.
#[derive(Debug, Clone)]
pub struct ExternDefinition {
    pub name: String,
    pub args: Vec<Arc<Expr>>,
}

#[derive(Debug, Clone)]
pub struct Function {
    name: String,
    args: Vec<String>,
    output_types: Vec<Type>,
    init: Option<Definition>,
    updates: Vec<Definition>,
    schedule: FuncSchedule,
    extern_definition: Option<ExternDefinition>,
}

/// Count calls to `name` across `exprs`, checking their arity.
fn self_references<'a>(
    name: &str,
    dims: usize,
    exprs: impl Iterator<Item = &'a Arc<Expr>>,
) -> Result<usize> {
    let mut count = 0;
    let mut bad_arity = None;
    for e in exprs {
        for_each_expr(e, |node| {
            if let Some(c) = node.as_call()
                && c.is_data_access()
                && c.name == name
            {
                count += 1;
                if c.args.len() != dims {
                    bad_arity = Some(c.args.len());
                }
            }
            true
        });
    }
    if let Some(actual) = bad_arity {
        return ArgCountMismatchSnafu { name, expected: dims, actual }.fail();
    }
    Ok(count)
}

/// The single reduction domain referenced by `exprs`, if any.
fn find_rdom<'a>(
    name: &str,
    exprs: impl Iterator<Item = &'a Arc<Expr>>,
) -> Result<Option<ReductionDomain>> {
    let mut found: Option<ReductionDomain> = None;
    let mut conflict = false;
    for e in exprs {
        for_each_expr(e, |node| {
            if let Some(rdom) = node.reduction_domain() {
                match &found {
                    Some(existing) if existing != rdom => conflict = true,
                    Some(_) => {}
                    None => found = Some(rdom.clone()),
                }
            }
            true
        });
    }
    ensure!(!conflict, MultipleReductionDomainsSnafu { name });
    Ok(found)
}

impl Function {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
            output_types: Vec::new(),
            init: None,
            updates: Vec::new(),
            schedule: FuncSchedule::default(),
            extern_definition: None,
        }
    }

    /// Function with a pure definition `name(args) = values`.
    pub fn pure<S: AsRef<str>>(name: impl Into<String>, args: &[S], values: Vec<Arc<Expr>>) -> Result<Self> {
        let mut f = Self::new(name);
        f.define(args, values)?;
        Ok(f)
    }

    pub fn define<S: AsRef<str>>(&mut self, args: &[S], values: Vec<Arc<Expr>>) -> Result<()> {
        ensure!(self.init.is_none() && self.extern_definition.is_none(), AlreadyDefinedSnafu { name: &self.name });
        let args: Vec<String> = args.iter().map(|a| a.as_ref().to_string()).collect();
        let mut seen = BTreeSet::new();
        for a in &args {
            ensure!(seen.insert(a.as_str()), DuplicateArgumentSnafu { name: &self.name, arg: a });
        }
        let calls = self_references(&self.name, args.len(), values.iter())?;
        ensure!(calls == 0, PureSelfReferenceSnafu { name: &self.name });

        tracing::trace!(func = %self.name, dims = args.len(), "pure definition");
        self.output_types = values.iter().map(|v| v.ty()).collect();
        self.init = Some(Definition {
            args: args.iter().map(|a| Expr::var(a.as_str())).collect(),
            values,
            rdom: None,
            schedule: StageSchedule::for_pure_args(&args),
            is_init: true,
        });
        self.args = args;
        Ok(())
    }

    /// Add an update `name(args) = values`.
    ///
    /// Self-references must use as many arguments as the function has
    /// dimensions. Loop dimensions are the reduction variables (innermost)
    /// followed by the pure variables used on the left-hand side.
    pub fn define_update(&mut self, args: Vec<Arc<Expr>>, values: Vec<Arc<Expr>>) -> Result<()> {
        ensure!(self.init.is_some(), UpdateBeforeDefinitionSnafu { name: &self.name });
        let dims = self.args.len();
        ensure!(args.len() == dims, ArgCountMismatchSnafu { name: &self.name, expected: dims, actual: args.len() });
        ensure!(
            values.len() == self.output_types.len(),
            TupleSizeMismatchSnafu { name: &self.name, expected: self.output_types.len(), actual: values.len() }
        );
        let self_calls = self_references(&self.name, dims, args.iter().chain(values.iter()))?;
        let rdom = find_rdom(&self.name, args.iter().chain(values.iter()))?;

        let pure_lhs: Vec<&str> =
            args.iter().filter_map(|a| a.var_name()).filter(|v| self.args.iter().any(|p| p == v)).collect();
        if self_calls == 0 && pure_lhs.len() == dims && rdom.is_none() {
            let update = self.updates.len();
            tracing::warn!(func = %self.name, update, "update completely hides earlier definitions");
        }

        let mut schedule = StageSchedule::default();
        if let Some(r) = &rdom {
            schedule.rvars = r.vars().to_vec();
            schedule.dims.extend(r.vars().iter().map(|v| Dim::rvar(v.var.as_str(), DimKind::ImpureRVar)));
        }
        schedule.dims.extend(self.args.iter().filter(|a| pure_lhs.contains(&a.as_str())).map(Dim::pure));

        tracing::trace!(func = %self.name, self_calls, "update definition");
        self.updates.push(Definition { args, values, rdom, schedule, is_init: false });
        Ok(())
    }

    /// Define as the output of an external routine.
    pub fn define_extern<S: AsRef<str>>(
        &mut self,
        extern_name: impl Into<String>,
        extern_args: Vec<Arc<Expr>>,
        types: Vec<Type>,
        args: &[S],
    ) -> Result<()> {
        ensure!(self.init.is_none() && self.extern_definition.is_none(), AlreadyDefinedSnafu { name: &self.name });
        self.args = args.iter().map(|a| a.as_ref().to_string()).collect();
        self.output_types = types;
        self.extern_definition = Some(ExternDefinition { name: extern_name.into(), args: extern_args });
        Ok(())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pure argument names.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn dimensions(&self) -> usize {
        self.args.len()
    }

    pub fn outputs(&self) -> usize {
        self.output_types.len()
    }

    pub fn output_types(&self) -> &[Type] {
        &self.output_types
    }

    pub fn definition(&self) -> Option<&Definition> {
        self.init.as_ref()
    }

    pub fn definition_mut(&mut self) -> Option<&mut Definition> {
        self.init.as_mut()
    }

    /// Values of the pure definition.
    pub fn values(&self) -> &[Arc<Expr>] {
        self.init.as_ref().map_or(&[], |d| d.values.as_slice())
    }

    pub fn updates(&self) -> &[Definition] {
        &self.updates
    }

    pub fn update(&self, i: usize) -> Option<&Definition> {
        self.updates.get(i)
    }

    pub fn update_mut(&mut self, i: usize) -> Option<&mut Definition> {
        self.updates.get_mut(i)
    }

    /// Stage `i`: 0 is the pure definition, `i > 0` is update `i - 1`.
    pub fn stage(&self, i: usize) -> Option<&Definition> {
        if i == 0 { self.init.as_ref() } else { self.updates.get(i - 1) }
    }

    pub fn stage_mut(&mut self, i: usize) -> Option<&mut Definition> {
        if i == 0 { self.init.as_mut() } else { self.updates.get_mut(i - 1) }
    }

    /// Number of stages (pure definition plus updates).
    pub fn num_stages(&self) -> usize {
        usize::from(self.init.is_some()) + self.updates.len()
    }

    pub fn stages(&self) -> impl Iterator<Item = &Definition> {
        self.init.iter().chain(self.updates.iter())
    }

    pub fn stages_mut(&mut self) -> impl Iterator<Item = &mut Definition> {
        self.init.iter_mut().chain(self.updates.iter_mut())
    }

    pub fn has_pure_definition(&self) -> bool {
        self.init.is_some()
    }

    pub fn has_update_definition(&self) -> bool {
        !self.updates.is_empty()
    }

    pub fn has_extern_definition(&self) -> bool {
        self.extern_definition.is_some()
    }

    pub fn extern_definition(&self) -> Option<&ExternDefinition> {
        self.extern_definition.as_ref()
    }

    /// Only a pure definition, so calls can be replaced by its value.
    pub fn can_be_inlined(&self) -> bool {
        self.init.is_some() && self.updates.is_empty() && self.extern_definition.is_none()
    }

    pub fn schedule(&self) -> &FuncSchedule {
        &self.schedule
    }

    pub fn schedule_mut(&mut self) -> &mut FuncSchedule {
        &mut self.schedule
    }

    // ========================================================================
    // Calls
    // ========================================================================

    /// Call to tuple element `value_index` at `args`.
    pub fn call_value(&self, value_index: usize, args: Vec<Arc<Expr>>) -> Arc<Expr> {
        let ty = self.output_types.get(value_index).copied().unwrap_or(Type::I32);
        Expr::func_call(ty, self.name.clone(), args, value_index)
    }

    pub fn call(&self, args: Vec<Arc<Expr>>) -> Arc<Expr> {
        self.call_value(0, args)
    }

    /// Call at the pure argument variables.
    pub fn call_pure(&self) -> Vec<Arc<Expr>> {
        let args: Vec<_> = self.args.iter().map(|a| Expr::var(a.as_str())).collect();
        (0..self.outputs()).map(|i| self.call_value(i, args.clone())).collect()
    }
}
