//! Lowering passes and the auto-scheduler for the kiln compiler.
//!
//! Every pass here is a synchronous rewrite of a `kiln_ir` statement or
//! expression tree. The passes fall into three groups: analyses other
//! passes build on (the solver, associativity), whole-pipeline transforms
//! (differentiation, auto-scheduling), and statement lowerings that run
//! after a pipeline has been turned into loops.
//!
//! # Module Organization
//!
//! - [`solve`] - Isolating a variable, inner/outer intervals, domain conditions
//! - [`associativity`] - Recognising associative update definitions
//! - [`derivative`] - Reverse-mode adjoints and forward-mode tangents
//! - [`autoschedule`] - Dependence analysis, cost model, partitioner, schedule text
//! - [`async_producers`] - Forking async producers into semaphore-synchronised tasks
//! - [`gpu`] - Fusing GPU thread loops into one kernel body with barriers
//! - [`warp_shuffles`] - Lowering lane-striped register allocations to warp shuffles
//! - [`partition_loops`] - Splitting loops into prologue, steady state and epilogue
//! - [`passes`] - Smaller lowering passes (trimming, forwarding, carrying, hoisting, early frees)
//! - [`config`] - Machine parameters and pass options
//! - [`error`] - Error types and result handling

pub mod associativity;
pub mod async_producers;
pub mod autoschedule;
pub mod config;
pub mod derivative;
pub mod error;
pub mod gpu;
pub mod partition_loops;
pub mod passes;
pub mod solve;
pub mod warp_shuffles;


pub use associativity::{AssociativeOp, prove_associativity};
pub use async_producers::fork_async_producers;
pub use autoschedule::{AutoScheduleOutcome, generate_schedules};
pub use config::{AutoScheduleOptions, LoopCarryOptions, MachineParams, PartitionOptions, WarpShuffleOptions};
pub use derivative::{Derivative, propagate_adjoints, propagate_adjoints_scalar, propagate_tangents};
pub use error::{Error, Result};
pub use gpu::fuse_gpu_thread_loops;
pub use partition_loops::partition_loops;
pub use passes::{forward_stores, hoist_loop_invariant_values, inject_early_frees, promote_registers, trim_no_ops};
pub use solve::{
    SolverResult, and_condition_over_domain, solve_expression, solve_for_inner_interval, solve_for_outer_interval,
};
pub use warp_shuffles::lower_warp_shuffles;
