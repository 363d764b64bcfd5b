pub mod associativity;
pub mod async_producers;
pub mod autoschedule;
pub mod dependence;
pub mod derivative_utils;
pub mod gpu;
pub mod passes;
pub mod tangents;
pub mod warp_shuffles;
