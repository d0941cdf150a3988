//! Traced values and construction recipes.
//!
//! # How it works
//!
//! A [`TracedValue`] is either a concrete [`Value`] or a tracer belonging to
//! one live trace frame on the engine's stack. Each tracer kind records what
//! its frame needs to reconstruct the computation later:
//!
//! - [`ProgramTracer`] (partial evaluation) carries a partial value and a
//!   [`Recipe`] saying where it came from — a lambda binder, a captured
//!   constant, a free variable from an enclosing trace, or an equation.
//! - [`JvpTracer`] (forward mode) carries a primal/tangent pair.
//! - [`BatchTracer`] (vectorization) carries the full batched value and the
//!   position of its batch axis (`None` once an operation collapses it).
//!
//! Tracers are shared by `Rc` and identified by engine-minted ids, so graph
//! construction keys on stable integers rather than addresses.

use std::fmt::{self, Display};
use std::rc::Rc;

use crate::aval::AbstractValue;
use crate::error::TraceError;
use crate::float::Float;
use crate::primitive::{Params, Primitive};
use crate::program::Program;
use crate::pval::PartialValue;
use crate::value::Value;

/// A value flowing through user code: concrete, or owned by a trace.
#[derive(Clone, Debug)]
pub enum TracedValue<F: Float> {
    Concrete(Value<F>),
    Program(Rc<ProgramTracer<F>>),
    Jvp(Rc<JvpTracer<F>>),
    Batch(Rc<BatchTracer<F>>),
}

/// Tracer of the partial-evaluation trace.
#[derive(Debug)]
pub struct ProgramTracer<F: Float> {
    pub id: u64,
    pub level: usize,
    pub frame_id: u64,
    pub pval: PartialValue<F>,
    pub recipe: Recipe<F>,
}

/// Tracer of the forward-mode trace: a primal/tangent pair.
#[derive(Debug)]
pub struct JvpTracer<F: Float> {
    pub id: u64,
    pub level: usize,
    pub frame_id: u64,
    pub primal: TracedValue<F>,
    pub tangent: TracedValue<F>,
}

/// Tracer of the vectorizing trace.
#[derive(Debug)]
pub struct BatchTracer<F: Float> {
    pub id: u64,
    pub level: usize,
    pub frame_id: u64,
    /// The full value, batch axis included.
    pub val: TracedValue<F>,
    /// Position of the batch axis, or `None` if this value is unbatched.
    pub dim: Option<usize>,
}

/// How a [`ProgramTracer`] came to exist.
#[derive(Debug)]
pub enum Recipe<F: Float> {
    /// A lambda binder of the trace being built.
    LambdaBinding,
    /// A variable owned by an enclosing trace; resolved by the caller.
    FreeVar(TracedValue<F>),
    /// A constant captured into the program.
    ConstVar(TracedValue<F>),
    /// Output of an equation.
    Eqn(Rc<EqnRecipe<F>>),
    /// Component `index` of a destructured equation output. Children of the
    /// same destructuring share the equation and deduplicate through it.
    Destructure { index: usize, eqn: Rc<EqnRecipe<F>> },
    /// A fully-known constant; names the unit sentinel in the program.
    Unit,
}

/// A staged equation shared by the tracers it produced.
#[derive(Debug)]
pub struct EqnRecipe<F: Float> {
    pub eqn_id: u64,
    pub prim: Primitive,
    pub inputs: Vec<TracedValue<F>>,
    pub subprograms: Vec<BoundProgram<F>>,
    pub n_out: usize,
    pub params: Params,
}

/// A finalized sub-program together with the live values feeding its
/// constants and free variables.
#[derive(Debug)]
pub struct BoundProgram<F: Float> {
    pub program: Rc<Program>,
    pub consts: Vec<TracedValue<F>>,
    pub freevars: Vec<TracedValue<F>>,
}

impl<F: Float> TracedValue<F> {
    pub fn unit() -> Self {
        TracedValue::Concrete(Value::unit())
    }

    pub fn scalar(v: F) -> Self {
        TracedValue::Concrete(Value::scalar(v))
    }

    /// The trace level owning this value, or `None` for concrete values.
    pub fn level(&self) -> Option<usize> {
        match self {
            TracedValue::Concrete(_) => None,
            TracedValue::Program(t) => Some(t.level),
            TracedValue::Jvp(t) => Some(t.level),
            TracedValue::Batch(t) => Some(t.level),
        }
    }

    /// Id of the frame owning this value, paired with [`level`](Self::level).
    pub fn frame_id(&self) -> Option<u64> {
        match self {
            TracedValue::Concrete(_) => None,
            TracedValue::Program(t) => Some(t.frame_id),
            TracedValue::Jvp(t) => Some(t.frame_id),
            TracedValue::Batch(t) => Some(t.frame_id),
        }
    }

    /// Stable tracer id, or `None` for concrete values.
    pub fn id(&self) -> Option<u64> {
        match self {
            TracedValue::Concrete(_) => None,
            TracedValue::Program(t) => Some(t.id),
            TracedValue::Jvp(t) => Some(t.id),
            TracedValue::Batch(t) => Some(t.id),
        }
    }

    /// What is statically known about this value.
    pub fn aval(&self) -> AbstractValue<F> {
        match self {
            TracedValue::Concrete(v) => AbstractValue::of(v),
            TracedValue::Program(t) => t.pval.aval(),
            TracedValue::Jvp(t) => t.primal.aval(),
            TracedValue::Batch(t) => match t.dim {
                None => t.val.aval(),
                Some(_) => t
                    .val
                    .aval()
                    .to_shaped()
                    .remove_axis()
                    .unwrap_or_else(|_| panic!("batched value lost its batch axis")),
            },
        }
    }

    /// Unwrap tracers that carry no residual trace information: a known
    /// program tracer lowers to its payload, an unbatched batch tracer to
    /// its value. Applied to every `bind` result so tracer nesting never
    /// grows deeper than necessary.
    pub fn full_lower(self) -> Self {
        match self {
            TracedValue::Program(t) => match &t.pval {
                PartialValue::Known(v) => v.clone().full_lower(),
                _ => TracedValue::Program(t),
            },
            TracedValue::Batch(t) => match t.dim {
                None => t.val.clone().full_lower(),
                Some(_) => TracedValue::Batch(t),
            },
            other => other,
        }
    }

    pub fn as_concrete(&self) -> Option<&Value<F>> {
        match self {
            TracedValue::Concrete(v) => Some(v),
            _ => None,
        }
    }

    /// Extract the concrete value, failing if a tracer survived to a point
    /// where only plain data is meaningful.
    pub fn into_concrete(self) -> Result<Value<F>, TraceError> {
        match self.full_lower() {
            TracedValue::Concrete(v) => Ok(v),
            t => Err(TraceError::Escaped {
                detail: format!("expected a concrete value, found live tracer {t}"),
            }),
        }
    }

    pub fn as_program(&self) -> Option<&Rc<ProgramTracer<F>>> {
        match self {
            TracedValue::Program(t) => Some(t),
            _ => None,
        }
    }
}

impl<F: Float> From<Value<F>> for TracedValue<F> {
    fn from(v: Value<F>) -> Self {
        TracedValue::Concrete(v)
    }
}

impl<F: Float> Display for TracedValue<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TracedValue::Concrete(v) => write!(f, "{v}"),
            TracedValue::Program(t) => write!(f, "Traced<{}:{}>", t.pval.aval(), t.level),
            TracedValue::Jvp(t) => write!(f, "Jvp<{}:{}>", t.primal.aval(), t.level),
            TracedValue::Batch(t) => write!(f, "Batch<{}:{}>", self.aval(), t.level),
        }
    }
}

impl<F: Float> EqnRecipe<F> {
    /// Tracers this equation depends on, including the live values feeding
    /// any bound sub-program.
    pub fn parents(&self) -> impl Iterator<Item = &TracedValue<F>> {
        self.inputs.iter().chain(
            self.subprograms
                .iter()
                .flat_map(|b| b.consts.iter().chain(b.freevars.iter())),
        )
    }
}
