use snafu::Snafu;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// User-facing errors raised by lowering passes and the auto-scheduler.
///
/// Internal consistency failures are panics, not variants of this enum.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("{source}"))]
    Ir { source: kiln_ir::Error },

    // ------------------------------------------------------------------------
    // GPU lowering
    // ------------------------------------------------------------------------
    /// Stores to a lane-striped allocation disagree on the stride or do not
    /// tile the allocation.
    #[snafu(display(
        "Access pattern for {alloc} does not meet the requirements for its store_at location.\n\
         All access to an allocation scheduled inside a loop over GPU threads and outside a loop \
         over GPU lanes must obey the following constraint:\n\
         The index must be affine in {lane} with a consistent linear coefficient across all stores, \
         and the coefficient must be non-zero.\n\
         The following stores violate this:\n{stores}"
    ))]
    BadWarpStride { alloc: String, lane: String, stores: String },

    /// Lane loops must have a constant extent of at most the warp size.
    #[snafu(display("Loop over GPU lane variable {lane} has extent {extent}; it must be a constant of at most 32"))]
    LaneLoopExtent { lane: String, extent: String },

    /// Lane-striped allocation size is not a constant multiple of the warp size.
    #[snafu(display("Allocation {alloc} of size {size} cannot be striped across a warp of {warp_size} lanes"))]
    WarpAllocationSize { alloc: String, size: String, warp_size: i64 },

    /// Shuffles move at most 32 bits per lane.
    #[snafu(display("Warp shuffles of type {ty} are not supported (loading {alloc})"))]
    WarpShuffleType { alloc: String, ty: kiln_ir::Type },

    /// A GPU thread loop must be nested inside a GPU block loop.
    #[snafu(display("Loop over {thread_loop} is a loop over GPU threads but is not inside a loop over GPU blocks"))]
    ThreadLoopOutsideBlock { thread_loop: String },

    // ------------------------------------------------------------------------
    // Differentiation
    // ------------------------------------------------------------------------
    /// Differentiation needs every access bounded.
    #[snafu(display(
        "Unbounded access to {name} in dimension {dim} while differentiating {output}.\n\
         Differentiation requires every function and buffer access to be bounded; \
         clamp the access or bound the reduction domain."
    ))]
    UnboundedAccess { output: String, name: String, dim: usize },

    /// An update overwrites values that another stage reads.
    #[snafu(display(
        "Update {update} of {func} overwrites values that {consumer} depends on.\n\
         The gradient cannot be computed when a later stage depends on intermediate values \
         of an in-place update; use a scan (write every step to a new location) instead."
    ))]
    OverwriteDependsOnIntermediates { func: String, update: usize, consumer: String },

    /// A function and a buffer or parameter share a name.
    #[snafu(display("Cannot differentiate {output}: {name} names both a function and an input"))]
    DerivativeNameConflict { output: String, name: String },

    #[snafu(display("Unknown extern function {name} while differentiating"))]
    UnknownExternDerivative { name: String },

    // ------------------------------------------------------------------------
    // Auto-scheduling
    // ------------------------------------------------------------------------
    /// The auto-scheduler only runs on pipelines with no user schedule.
    #[snafu(display("Function {func} is already (partially) scheduled: {detail}"))]
    PartialSchedule { func: String, detail: String },
}

impl From<kiln_ir::Error> for Error {
    fn from(source: kiln_ir::Error) -> Self {
        Self::Ir { source }
    }
}
