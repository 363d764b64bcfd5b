//! Expression nodes.
//!
//! # Module Organization
//!
//! - [`core`] - `Expr` struct, node variants and accessors
//! - [`constructors`] - Typed constructors and operator methods
//! - [`rdom`] - Reduction domains carried by reduction variables

pub mod constructors;
pub mod core;
pub mod rdom;

pub use core::{Call, Expr, ExprKind, IntoExpr, Load, VarKind, Variable};
pub use rdom::{ReductionDomain, ReductionVariable};
