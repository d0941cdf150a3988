//! Error types surfaced by tracing, transformation, and replay.

use std::error::Error;
use std::fmt::{self, Display};

/// Errors produced while tracing a function or replaying a [`Program`].
///
/// Internal bookkeeping violations (unbalanced trace stacks, recipes that
/// reference dead equations) are bugs and panic instead of returning a
/// variant here.
///
/// [`Program`]: crate::program::Program
#[derive(Clone, Debug, PartialEq)]
pub enum TraceError {
    /// An operation was applied to values whose shapes or kinds do not fit.
    Type { detail: String },
    /// Two abstract values have no least upper bound in the shape lattice.
    NoJoin { left: String, right: String },
    /// A program or operation received the wrong number of values.
    Arity { expected: usize, actual: usize },
    /// A tracer outlived the trace that created it.
    Escaped { detail: String },
    /// A collective named an axis that no enclosing mapped trace binds.
    UnboundAxis { name: String },
    /// The operation is valid but not expressible under the current trace.
    Unsupported { detail: String },
}

impl Display for TraceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceError::Type { detail } => write!(f, "type error: {detail}"),
            TraceError::NoJoin { left, right } => {
                write!(f, "no join of abstract values {left} and {right}")
            }
            TraceError::Arity { expected, actual } => {
                write!(f, "arity mismatch: expected {expected} values, got {actual}")
            }
            TraceError::Escaped { detail } => write!(f, "escaped tracer: {detail}"),
            TraceError::UnboundAxis { name } => {
                write!(f, "unbound axis name: {name:?} is not bound by any enclosing map")
            }
            TraceError::Unsupported { detail } => write!(f, "unsupported: {detail}"),
        }
    }
}

impl Error for TraceError {}

impl TraceError {
    /// Shorthand for a [`TraceError::Type`] with a formatted message.
    pub fn type_error(detail: impl Into<String>) -> Self {
        TraceError::Type {
            detail: detail.into(),
        }
    }
}
