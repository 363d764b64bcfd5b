//! Arena of pipeline functions.

use std::collections::HashMap;

use snafu::OptionExt;

use super::function::Function;
use crate::error::*;

/// Index of a function in an [`Env`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncId(pub usize);

/// Functions of a pipeline, addressed by [`FuncId`] or by name.
///
/// Calls between functions are resolved through this table, so functions
/// never hold references to each other.
#[derive(Debug, Clone, Default)]
pub struct Env {
    funcs: Vec<Function>,
    index: HashMap<String, FuncId>,
}

impl Env {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `f`, replacing any function with the same name.
    pub fn insert(&mut self, f: Function) -> FuncId {
        if let Some(&id) = self.index.get(f.name()) {
            self.funcs[id.0] = f;
            return id;
        }
        let id = FuncId(self.funcs.len());
        self.index.insert(f.name().to_string(), id);
        self.funcs.push(f);
        id
    }

    pub fn id(&self, name: &str) -> Option<FuncId> {
        self.index.get(name).copied()
    }

    pub fn get(&self, id: FuncId) -> &Function {
        &self.funcs[id.0]
    }

    pub fn get_mut(&mut self, id: FuncId) -> &mut Function {
        &mut self.funcs[id.0]
    }

    pub fn lookup(&self, name: &str) -> Option<&Function> {
        self.id(name).map(|id| self.get(id))
    }

    pub fn lookup_mut(&mut self, name: &str) -> Option<&mut Function> {
        self.id(name).map(|id| &mut self.funcs[id.0])
    }

    /// Function `name`, or [`Error::UndefinedFunction`].
    pub fn require(&self, name: &str) -> Result<&Function> {
        self.lookup(name).context(UndefinedFunctionSnafu { name })
    }

    pub fn require_mut(&mut self, name: &str) -> Result<&mut Function> {
        self.lookup_mut(name).context(UndefinedFunctionSnafu { name })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.funcs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.funcs.is_empty()
    }

    /// Functions in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Function> {
        self.funcs.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.funcs.iter().map(Function::name)
    }
}

impl FromIterator<Function> for Env {
    fn from_iter<I: IntoIterator<Item = Function>>(iter: I) -> Self {
        let mut env = Self::new();
        for f in iter {
            env.insert(f);
        }
        env
    }
}
