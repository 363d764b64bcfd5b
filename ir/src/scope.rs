//! Lexically scoped name bindings.

use std::collections::HashMap;

/// Map from names to a stack of values; inner bindings shadow outer ones.
#[derive(Debug, Clone)]
pub struct Scope<T> {
    table: HashMap<String, Vec<T>>,
}

impl<T> Default for Scope<T> {
    fn default() -> Self {
        Self { table: HashMap::new() }
    }
}

impl<T> Scope<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: T) {
        self.table.entry(name.into()).or_default().push(value);
    }

    /// Remove the innermost binding of `name`.
    ///
    /// Panics when `name` is not bound, which means pushes and pops are
    /// unbalanced.
    pub fn pop(&mut self, name: &str) -> T {
        let stack = self.table.get_mut(name).unwrap_or_else(|| panic!("name {name} not in scope"));
        let value = stack.pop().unwrap_or_else(|| panic!("name {name} not in scope"));
        if stack.is_empty() {
            self.table.remove(name);
        }
        value
    }

    pub fn get(&self, name: &str) -> Option<&T> {
        self.table.get(name).and_then(|s| s.last())
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut T> {
        self.table.get_mut(name).and_then(|s| s.last_mut())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.table.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Innermost binding of every name.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.table.iter().filter_map(|(k, v)| v.last().map(|t| (k.as_str(), t)))
    }

    /// Run `f` with `name` bound to `value`.
    pub fn with<R>(&mut self, name: &str, value: T, f: impl FnOnce(&mut Self) -> R) -> R {
        self.push(name, value);
        let result = f(self);
        self.pop(name);
        result
    }
}

impl<T> FromIterator<(String, T)> for Scope<T> {
    fn from_iter<I: IntoIterator<Item = (String, T)>>(iter: I) -> Self {
        let mut scope = Self::new();
        for (k, v) in iter {
            scope.push(k, v);
        }
        scope
    }
}
