//! Schedule source text.
//!
//! The text declares every variable introduced by splits, binds each
//! scheduled function from the pipeline, then gives each function a block
//! that binds the variables it uses and lists its directives:
//!
//! ```text
//! Var x_i("x_i");
//! Var x_o("x_o");
//!
//! Func blur = pipeline.get_func(1);
//!
//! {
//!     Var x = blur.args()[0];
//!     blur
//!         .compute_root()
//!         .split(x, x_o, x_i, 64)
//!         .parallel(x_o);
//! }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use kiln_ir::Env;

/// Name usable as an identifier in schedule source.
pub fn sanitized_name(name: &str) -> String {
    let mut out: String = name.chars().map(|c| if c.is_ascii_alphanumeric() { c } else { '_' }).collect();
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

#[derive(Debug, Clone, Default)]
struct FuncText {
    /// Directives per stage, in order.
    stages: BTreeMap<usize, Vec<String>>,
    /// Variables each stage's directives mention.
    used: BTreeMap<usize, BTreeSet<String>>,
}

/// Directives collected for a pipeline, printed as schedule source.
pub struct ScheduleText<'a> {
    env: &'a Env,
    index: BTreeMap<String, usize>,
    /// Variables introduced by splits, and whether each is a reduction variable.
    internal_vars: BTreeMap<String, bool>,
    funcs: BTreeMap<String, FuncText>,
}

impl<'a> ScheduleText<'a> {
    /// `order` gives each function's index in the pipeline.
    pub fn new(env: &'a Env, order: &[String]) -> Self {
        let index = order.iter().enumerate().map(|(i, n)| (n.clone(), i)).collect();
        Self { env, index, internal_vars: BTreeMap::new(), funcs: BTreeMap::new() }
    }

    /// Declare a variable created by a split. The first declaration wins.
    pub fn declare_var(&mut self, name: &str, is_rvar: bool) {
        self.internal_vars.entry(name.to_string()).or_insert(is_rvar);
    }

    /// Append a directive to a stage, unless it repeats the previous one.
    pub fn push<I, S>(&mut self, func: &str, stage: usize, directive: impl Into<String>, vars: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let directive = directive.into();
        let text = self.funcs.entry(func.to_string()).or_default();
        let directives = text.stages.entry(stage).or_default();
        if directives.last() == Some(&directive) {
            return;
        }
        directives.push(directive);
        text.used.entry(stage).or_default().extend(vars.into_iter().map(Into::into));
    }

    /// Directives recorded for one stage.
    pub fn directives(&self, func: &str, stage: usize) -> &[String] {
        self.funcs.get(func).and_then(|t| t.stages.get(&stage)).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.funcs.is_empty()
    }

    fn write_block(&self, f: &mut fmt::Formatter<'_>, name: &str, text: &FuncText) -> fmt::Result {
        let fname = sanitized_name(name);
        let func = self.env.lookup(name);
        writeln!(f, "{{")?;

        let used: BTreeSet<&str> = text.used.values().flatten().map(String::as_str).collect();
        if let Some(func) = func {
            for (i, arg) in func.args().iter().enumerate() {
                if used.contains(arg.as_str()) && !self.internal_vars.contains_key(arg) {
                    writeln!(f, "    Var {} = {fname}.args()[{i}];", sanitized_name(arg))?;
                }
            }
            for (u, def) in func.updates().iter().enumerate() {
                for (j, rv) in def.schedule.rvars.iter().enumerate() {
                    if used.contains(rv.var.as_str()) && !self.internal_vars.contains_key(&rv.var) {
                        let var = sanitized_name(&rv.var);
                        writeln!(f, "    RVar {var}({fname}.update({u}).get_schedule().rvars()[{j}].var);")?;
                    }
                }
            }
        }

        for (stage, directives) in &text.stages {
            if directives.is_empty() {
                continue;
            }
            match stage {
                0 => writeln!(f, "    {fname}")?,
                s => writeln!(f, "    {fname}.update({})", s - 1)?,
            }
            for (k, d) in directives.iter().enumerate() {
                let end = if k + 1 == directives.len() { ";" } else { "" };
                writeln!(f, "        .{d}{end}")?;
            }
        }
        writeln!(f, "}}")
    }
}

impl fmt::Display for ScheduleText<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, is_rvar) in &self.internal_vars {
            let kind = if *is_rvar { "RVar" } else { "Var" };
            writeln!(f, "{kind} {}(\"{name}\");", sanitized_name(name))?;
        }
        if !self.internal_vars.is_empty() {
            writeln!(f)?;
        }

        for name in self.funcs.keys() {
            let index = self.index.get(name).copied().unwrap_or_default();
            writeln!(f, "Func {} = pipeline.get_func({index});", sanitized_name(name))?;
        }
        if !self.funcs.is_empty() {
            writeln!(f)?;
        }

        for (name, text) in &self.funcs {
            self.write_block(f, name, text)?;
        }
        writeln!(f)
    }
}
