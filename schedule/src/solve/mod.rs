//! Solving expressions and conditions for a single variable.
//!
//! # Module Organization
//!
//! - [`expression`] - Isolating a variable on the left of an expression
//! - [`interval`] - Inner and outer intervals on which a condition holds
//! - [`domain`] - Conditions that hold over a whole domain of variables
//!
//! # Example
//!
//! ```ignore
//! use kiln_ir::{Expr, Scope};
//! use kiln_schedule::solve::solve_expression;
//!
//! let x = Expr::var("x");
//! let e = Expr::int(3).sub(x.mul(4));
//! let solved = solve_expression(&e, "x", &Scope::new());
//! assert!(solved.fully_solved);
//! assert_eq!(solved.result.to_string(), "((x*-4) + 3)");
//! ```

use std::cmp::Ordering;
use std::sync::Arc;

use kiln_ir::{ConstValue, Expr};

pub mod domain;
pub mod expression;
pub mod interval;

pub use domain::and_condition_over_domain;
pub use expression::solve_expression;
pub use interval::{solve_for_inner_interval, solve_for_outer_interval};

/// Outcome of [`solve_expression`].
#[derive(Debug, Clone)]
pub struct SolverResult {
    /// Rewritten expression, equivalent to the input.
    pub result: Arc<Expr>,
    /// `false` when some rewrite needed to pull the variable out of both
    /// sides of an operator and no rule applied.
    pub fully_solved: bool,
}

fn const_sign(e: &Expr) -> Option<Ordering> {
    match e.as_const()? {
        ConstValue::Int(v) => Some(v.cmp(&0)),
        ConstValue::UInt(v) => Some(v.cmp(&0)),
        ConstValue::Float(v) => v.partial_cmp(&0.0),
    }
}

pub(crate) fn is_positive_const(e: &Expr) -> bool {
    const_sign(e) == Some(Ordering::Greater)
}

pub(crate) fn is_negative_const(e: &Expr) -> bool {
    const_sign(e) == Some(Ordering::Less)
}
