//! Statement-level cleanup and optimization passes.
//!
//! These run on lowered loop nests, after scheduling decisions are fixed.
//! Each pass is a function from statement to statement and preserves what
//! the statement computes.
//!
//! # Module Organization
//!
//! - [`trim_no_ops`] - Shrink loops to the iterations with an effect
//! - [`forward_stores`] - Replace loads of just-stored values with the values
//! - [`loop_carry`] - Keep loads shared by consecutive iterations in registers
//! - [`licm`] - Lift loop-invariant expressions out of loops
//! - [`early_free`] - Free allocations after their last use

pub mod early_free;
pub mod forward_stores;
pub mod licm;
pub mod loop_carry;
pub mod trim_no_ops;

pub use early_free::inject_early_frees;
pub use forward_stores::forward_stores;
pub use licm::hoist_loop_invariant_values;
pub use loop_carry::promote_registers;
pub use trim_no_ops::trim_no_ops;
