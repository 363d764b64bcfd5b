//! Pipeline function model.
//!
//! # Module Organization
//!
//! - [`function`] - `Function`: pure definition, updates and extern stages
//! - [`definition`] - `Definition`: one stage of a function
//! - [`schedule`] - Per-stage loop nests and per-function placement
//! - [`env`] - Arena of functions addressed by id or name
//! - [`order`] - Call graph, realization order and inlining

pub mod definition;
pub mod env;
pub mod function;
pub mod order;
pub mod schedule;

pub use definition::Definition;
pub use env::{Env, FuncId};
pub use function::{ExternDefinition, Function};
pub use order::{find_direct_calls, find_transitive_calls, inline_function, realization_order};
pub use schedule::{Dim, DimKind, Estimate, FuncSchedule, LoopLevel, Split, StageSchedule, TailStrategy};
