//! Property-based tests for the solver, associativity, bounds, the cost
//! model, the partitioner and async lowering.
//!
//! Uses proptest over small generated expressions and pipelines, checking
//! results by evaluation with the reference interpreter.

mod associativity_props;
mod async_props;
mod autoschedule_props;
mod solve_props;
