pub mod api;
pub mod aval;
pub mod batch;
pub mod engine;
pub mod error;
pub mod eval;
pub mod float;
pub mod jvp;
pub mod linearize;
pub mod partial_eval;
pub mod primitive;
pub mod program;
pub mod pval;
pub mod registry;
pub mod tracer;
pub mod value;

// the function `jvp` and the module `jvp` live in different namespaces
pub use api::{grad, jit, jvp, make_program, pmap, value_and_grad, vjp, vmap, Pullback};
pub use aval::AbstractValue;
pub use engine::{Engine, Fun};
pub use error::TraceError;
pub use float::Float;
pub use primitive::{Params, Primitive};
pub use program::{Program, Var};
pub use pval::PartialValue;
pub use tracer::TracedValue;
pub use value::{Shape, Tensor, Value};
