//! Intermediate Representation (IR) for the kiln compiler.
//!
//! This crate defines the expression and statement trees every lowering pass
//! works on, together with the analyses passes share: simplification,
//! interval bounds, substitution and the pipeline function model.
//!
//! # Module Organization
//!
//! - [`types`] - Operator, call, loop and memory tags, constant values
//! - [`expr`] - Expression nodes and constructors
//! - [`stmt`] - Statement nodes and constructors
//! - [`visit`] - Visitor and mutator traits
//! - [`equality`] - Structural and graph-safe equality and ordering
//! - [`analysis`] - Free variables, substitution, call discovery
//! - [`cse`] - Common subexpression elimination
//! - [`scope`] - Lexically scoped name bindings
//! - [`simplify`] - Algebraic simplifier and `can_prove`
//! - [`bounds`] - Symbolic intervals, regions and bounds inference
//! - [`func`] - Functions, definitions, schedules and the function arena
//! - [`names`] - Unique name generation
//! - [`eval`] - Reference interpreter
//! - [`printer`] - Human-readable rendering
//! - `proptest_gen` - Expression strategies for property tests (feature `proptest`)
//! - [`error`] - Error types and result handling

pub mod analysis;
pub mod bounds;
pub mod cse;
pub mod equality;
pub mod error;
pub mod eval;
pub mod expr;
pub mod func;
pub mod names;
pub mod printer;
#[cfg(any(test, feature = "proptest"))]
pub mod proptest_gen;
pub mod scope;
pub mod simplify;
pub mod stmt;
pub mod types;
pub mod visit;

#[cfg(test)]
pub mod test;

pub use analysis::{
    expr_uses_var, expr_uses_vars, free_variables, stmt_uses_var, substitute, substitute_in_stmt, substitute_map,
};
pub use bounds::{
    Bound, Interval, Region, bounds_of_expr_in_scope, box_intersection, box_union, boxes_required, merge_boxes,
};
pub use cse::{common_subexpression_elimination, substitute_in_all_lets};
pub use equality::{ExprKey, equal, graph_equal, graph_less_than, less_than};
pub use error::{Error, Result};
pub use expr::{Call, Expr, ExprKind, IntoExpr, ReductionDomain, ReductionVariable, VarKind};
pub use func::{Definition, Env, FuncId, Function};
pub use names::NameGen;
pub use scope::Scope;
pub use simplify::{can_prove, simplify, simplify_stmt};
pub use stmt::{Range, Stmt, StmtKind};
pub use types::{BinOp, CallType, ConstValue, DeviceApi, ForType, Intrinsic, MemoryType, VectorReduceOp};

pub use kiln_dtype::Type;
