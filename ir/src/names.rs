//! Unique name generation.

use std::sync::atomic::{AtomicU64, Ordering};

/// Per-session source of fresh names.
///
/// Each compilation owns its own generator, so independent compilations in
/// one process never share counters.
#[derive(Debug, Default)]
pub struct NameGen {
    next: AtomicU64,
}

impl NameGen {
    pub fn new() -> Self {
        Self::default()
    }

    /// `prefix$N` with `N` never handed out before by this generator.
    pub fn unique(&self, prefix: &str) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{prefix}${n}")
    }

    /// Several fresh names sharing `prefix`.
    pub fn unique_many(&self, prefix: &str, count: usize) -> Vec<String> {
        (0..count).map(|_| self.unique(prefix)).collect()
    }
}
