use snafu::Snafu;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// A call or lookup names a function missing from the environment.
    #[snafu(display("undefined function {name}"))]
    UndefinedFunction { name: String },

    /// Pure definition given twice.
    #[snafu(display("function {name} already has a pure definition"))]
    AlreadyDefined { name: String },

    /// Update given before the pure definition.
    #[snafu(display("function {name} must have a pure definition before an update"))]
    UpdateBeforeDefinition { name: String },

    /// Pure definition argument is not a distinct variable.
    #[snafu(display("pure definition of {name} has a repeated argument {arg}"))]
    DuplicateArgument { name: String, arg: String },

    /// Pure definition refers to the function being defined.
    #[snafu(display("pure definition of {name} calls itself"))]
    PureSelfReference { name: String },

    /// Self-reference or update with the wrong number of arguments.
    #[snafu(display("{name} has {expected} dimensions but is referenced with {actual} arguments"))]
    ArgCountMismatch { name: String, expected: usize, actual: usize },

    /// Update produces a different number of values than the pure definition.
    #[snafu(display("update of {name} has {actual} values, expected {expected}"))]
    TupleSizeMismatch { name: String, expected: usize, actual: usize },

    /// Update values use more than one reduction domain.
    #[snafu(display("update of {name} uses more than one reduction domain"))]
    MultipleReductionDomains { name: String },

    /// The call graph has a cycle through `name`.
    #[snafu(display("pipeline has a cycle through function {name}"))]
    CyclicPipeline { name: String },
}
