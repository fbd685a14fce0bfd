//! Typed failures surfaced by the graph engine.

use thiserror::Error;

/// Engine error surfaced to layers, losses, and models.
#[derive(Debug, Error)]
pub enum GraphError {
    /// An operation was invoked with the wrong operand count.
    #[error("operation `{op}` expected {expected} operand(s), got {got}")]
    Arity {
        op: &'static str,
        expected: usize,
        got: usize,
    },

    /// A gradient was routed into an output that does not admit one.
    #[error("output {index} of `{op}` is not differentiable")]
    NotDifferentiable { op: &'static str, index: usize },

    /// A requested gradient source has no path from the target.
    #[error("gradient requested for `{name}`, which is unreachable from the target")]
    InvalidSource { name: String },

    /// A scoped contract was violated by re-entering it.
    #[error("reentrancy violation: {context}")]
    Reentrancy { context: &'static str },

    /// Operand shapes are incompatible under broadcasting rules.
    #[error("shape mismatch in `{op}`: {lhs:?} vs {rhs:?}")]
    ShapeMismatch {
        op: &'static str,
        lhs: Vec<usize>,
        rhs: Vec<usize>,
    },

    /// A value was used in a state that does not support the request.
    #[error("invalid state: {what}")]
    InvalidState { what: String },
}

impl GraphError {
    pub fn arity(op: &'static str, expected: usize, got: usize) -> Self {
        GraphError::Arity { op, expected, got }
    }

    pub fn not_differentiable(op: &'static str, index: usize) -> Self {
        GraphError::NotDifferentiable { op, index }
    }

    pub fn invalid_source(name: impl Into<String>) -> Self {
        GraphError::InvalidSource { name: name.into() }
    }

    pub fn reentrancy(context: &'static str) -> Self {
        GraphError::Reentrancy { context }
    }

    pub fn shape_mismatch(op: &'static str, lhs: &[usize], rhs: &[usize]) -> Self {
        GraphError::ShapeMismatch {
            op,
            lhs: lhs.to_vec(),
            rhs: rhs.to_vec(),
        }
    }

    pub fn invalid_state(what: impl Into<String>) -> Self {
        GraphError::InvalidState { what: what.into() }
    }
}

/// Convenience alias for results returned by engine routines.
pub type Result<T> = std::result::Result<T, GraphError>;
