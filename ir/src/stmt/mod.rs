//! Statement nodes.
//!
//! # Module Organization
//!
//! - [`core`] - `Stmt` struct and node variants
//! - [`constructors`] - Statement constructors and block helpers

pub mod constructors;
pub mod core;

pub use core::{Allocate, For, Range, Realize, Stmt, StmtKind};
