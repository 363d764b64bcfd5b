//! Property-based tests for the simplifier and bounds inference.
//!
//! Random integer expressions are evaluated with the reference interpreter
//! before and after each analysis.

mod bounds_props;
mod simplify_props;
