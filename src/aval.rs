//! Abstract values: the shape/type lattice tracers carry.
//!
//! An abstract value describes what is statically known about a runtime
//! value. `Shaped` knows only the shape; `Concrete` is the refinement that
//! pins the exact value (used when a trace is seeded with real arguments);
//! `Tuple` mirrors tuple structure pointwise. `Concrete ⊑ Shaped` in the
//! lattice, and joining two different concretes forgets down to `Shaped`.

use std::fmt::{self, Display};

use crate::error::TraceError;
use crate::float::Float;
use crate::value::{Shape, Value};

#[derive(Clone, Debug, PartialEq)]
pub enum AbstractValue<F: Float> {
    /// Shape is known, value is not.
    Shaped(Shape),
    /// The exact value is known (refinement of `Shaped`).
    Concrete(Value<F>),
    /// Pointwise abstraction of a tuple.
    Tuple(Vec<AbstractValue<F>>),
}

impl<F: Float> AbstractValue<F> {
    /// Abstract a concrete value, keeping full precision.
    pub fn of(val: &Value<F>) -> Self {
        match val {
            Value::Tensor(_) => AbstractValue::Concrete(val.clone()),
            Value::Tuple(vs) => AbstractValue::Tuple(vs.iter().map(AbstractValue::of).collect()),
        }
    }

    /// Forget concreteness, keeping only shapes.
    pub fn to_shaped(&self) -> Self {
        match self {
            AbstractValue::Shaped(s) => AbstractValue::Shaped(s.clone()),
            AbstractValue::Concrete(v) => match v.shape() {
                Ok(s) => AbstractValue::Shaped(s.clone()),
                // a concrete tuple; recurse per component
                Err(_) => AbstractValue::of(v).to_shaped(),
            },
            AbstractValue::Tuple(parts) => {
                AbstractValue::Tuple(parts.iter().map(|p| p.to_shaped()).collect())
            }
        }
    }

    /// The shape of a non-tuple abstract value.
    pub fn shape(&self) -> Result<Shape, TraceError> {
        match self {
            AbstractValue::Shaped(s) => Ok(s.clone()),
            AbstractValue::Concrete(v) => Ok(v.shape()?.clone()),
            AbstractValue::Tuple(_) => Err(TraceError::type_error(
                "expected an array abstraction, got a tuple".to_string(),
            )),
        }
    }

    /// Tuple component abstractions, or an error for array abstractions.
    pub fn components(&self) -> Result<Vec<AbstractValue<F>>, TraceError> {
        match self {
            AbstractValue::Tuple(parts) => Ok(parts.clone()),
            AbstractValue::Concrete(Value::Tuple(vs)) => {
                Ok(vs.iter().map(AbstractValue::of).collect())
            }
            other => Err(TraceError::type_error(format!(
                "expected a tuple abstraction, got {other}"
            ))),
        }
    }

    /// Prepend a mapped axis of the given size.
    pub fn add_axis(&self, size: usize) -> Result<Self, TraceError> {
        match self {
            AbstractValue::Tuple(parts) => Ok(AbstractValue::Tuple(
                parts
                    .iter()
                    .map(|p| p.add_axis(size))
                    .collect::<Result<_, _>>()?,
            )),
            other => {
                let mut shape = vec![size];
                shape.extend(other.shape()?);
                Ok(AbstractValue::Shaped(shape))
            }
        }
    }

    /// Strip the leading mapped axis. Concrete values are raised to `Shaped`
    /// in the process, since a single slice of them is no longer pinned.
    pub fn remove_axis(&self) -> Result<Self, TraceError> {
        match self {
            AbstractValue::Tuple(parts) => Ok(AbstractValue::Tuple(
                parts
                    .iter()
                    .map(|p| p.remove_axis())
                    .collect::<Result<_, _>>()?,
            )),
            other => {
                let shape = other.shape()?;
                if shape.is_empty() {
                    return Err(TraceError::type_error(
                        "cannot strip the mapped axis of a scalar".to_string(),
                    ));
                }
                Ok(AbstractValue::Shaped(shape[1..].to_vec()))
            }
        }
    }
}

/// A zero-filled value inhabiting the given abstraction. Forward-mode uses
/// this for the tangents of lifted constants; reverse-mode for unseeded
/// cotangents.
pub fn zeros_like<F: Float>(a: &AbstractValue<F>) -> Result<Value<F>, TraceError> {
    match a {
        AbstractValue::Shaped(s) => Ok(Value::zeros(s)),
        AbstractValue::Concrete(v) => match v {
            Value::Tensor(t) => Ok(Value::zeros(t.shape())),
            Value::Tuple(_) => zeros_like(&AbstractValue::of(v)),
        },
        AbstractValue::Tuple(parts) => Ok(Value::Tuple(
            parts.iter().map(zeros_like).collect::<Result<_, _>>()?,
        )),
    }
}

/// Least upper bound of two abstract values.
///
/// Equal concretes stay concrete; different concretes of the same shape
/// join to `Shaped`; mismatched shapes have no join.
pub fn lattice_join<F: Float>(
    a: &AbstractValue<F>,
    b: &AbstractValue<F>,
) -> Result<AbstractValue<F>, TraceError> {
    use AbstractValue::*;
    match (a, b) {
        (Concrete(x), Concrete(y)) if x == y => Ok(a.clone()),
        (Tuple(xs), Tuple(ys)) => {
            if xs.len() != ys.len() {
                return Err(no_join(a, b));
            }
            Ok(Tuple(
                xs.iter()
                    .zip(ys)
                    .map(|(x, y)| lattice_join(x, y))
                    .collect::<Result<_, _>>()?,
            ))
        }
        (Tuple(_), _) | (_, Tuple(_)) => Err(no_join(a, b)),
        _ => {
            let (sa, sb) = (a.shape()?, b.shape()?);
            if sa == sb {
                Ok(Shaped(sa))
            } else {
                Err(no_join(a, b))
            }
        }
    }
}

fn no_join<F: Float>(a: &AbstractValue<F>, b: &AbstractValue<F>) -> TraceError {
    TraceError::NoJoin {
        left: a.to_string(),
        right: b.to_string(),
    }
}

impl<F: Float> Display for AbstractValue<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbstractValue::Shaped(s) => write!(f, "Shaped{s:?}"),
            AbstractValue::Concrete(v) => write!(f, "Concrete({v})"),
            AbstractValue::Tuple(parts) => {
                write!(f, "(")?;
                for (i, p) in parts.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{p}")?;
                }
                write!(f, ")")
            }
        }
    }
}
