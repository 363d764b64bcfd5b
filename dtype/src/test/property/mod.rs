//! Property-based tests for element types.

mod generators;
mod wrapping;
