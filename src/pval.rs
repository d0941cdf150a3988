//! Partial values: the known/abstract lattice driving partial evaluation.
//!
//! A partial value says, for one traced value, how much of it is already
//! determined. `Known` carries the payload itself (which may be a tracer of
//! an *enclosing* trace — lower levels treat it as an opaque constant).
//! `Abstract` carries only an abstract value. `Tuple` mixes the two
//! pointwise and only exists for genuinely mixed tuples: packing all-known
//! components yields `Known`, packing all-abstract components collapses to
//! `Abstract` of a tuple abstraction.

use crate::aval::{lattice_join, AbstractValue};
use crate::engine::Engine;
use crate::error::TraceError;
use crate::float::Float;
use crate::tracer::TracedValue;

#[derive(Clone, Debug)]
pub enum PartialValue<F: Float> {
    /// Fully determined; the payload stands in for the traced value.
    Known(TracedValue<F>),
    /// Only the abstraction is determined.
    Abstract(AbstractValue<F>),
    /// A tuple with a mix of known and abstract components.
    Tuple(Vec<PartialValue<F>>),
}

impl<F: Float> PartialValue<F> {
    pub fn known(val: TracedValue<F>) -> Self {
        PartialValue::Known(val)
    }

    pub fn is_known(&self) -> bool {
        matches!(self, PartialValue::Known(_))
    }

    /// The known payload, if fully determined.
    pub fn known_payload(&self) -> Option<&TracedValue<F>> {
        match self {
            PartialValue::Known(v) => Some(v),
            _ => None,
        }
    }

    /// The abstraction this partial value determines.
    pub fn aval(&self) -> AbstractValue<F> {
        match self {
            PartialValue::Known(v) => v.aval(),
            PartialValue::Abstract(a) => a.clone(),
            PartialValue::Tuple(parts) => {
                AbstractValue::Tuple(parts.iter().map(|p| p.aval()).collect())
            }
        }
    }

    /// The abstraction, requiring nothing to be known.
    pub fn as_abstract(&self) -> Result<AbstractValue<F>, TraceError> {
        match self {
            PartialValue::Known(_) => Err(TraceError::type_error(
                "partial value is known, not abstract".to_string(),
            )),
            PartialValue::Abstract(a) => Ok(a.clone()),
            PartialValue::Tuple(parts) => Ok(AbstractValue::Tuple(
                parts
                    .iter()
                    .map(|p| p.as_abstract())
                    .collect::<Result<_, _>>()?,
            )),
        }
    }

    /// Strip the leading mapped axis from the abstract side. Known values
    /// pass through untouched: the mapped call owns their slicing.
    pub fn remove_axis(&self) -> Result<Self, TraceError> {
        match self {
            PartialValue::Known(v) => Ok(PartialValue::Known(v.clone())),
            PartialValue::Abstract(a) => Ok(PartialValue::Abstract(a.remove_axis()?)),
            PartialValue::Tuple(parts) => Ok(PartialValue::Tuple(
                parts
                    .iter()
                    .map(|p| p.remove_axis())
                    .collect::<Result<_, _>>()?,
            )),
        }
    }

    /// Re-add the mapped axis stripped by [`remove_axis`](Self::remove_axis).
    pub fn add_axis(&self, size: usize) -> Result<Self, TraceError> {
        match self {
            PartialValue::Known(v) => Ok(PartialValue::Known(v.clone())),
            PartialValue::Abstract(a) => Ok(PartialValue::Abstract(a.add_axis(size)?)),
            PartialValue::Tuple(parts) => Ok(PartialValue::Tuple(
                parts
                    .iter()
                    .map(|p| p.add_axis(size))
                    .collect::<Result<_, _>>()?,
            )),
        }
    }
}

/// Least upper bound of two partial values.
///
/// Case analysis: equal knowns stay known; different knowns demote to the
/// join of their abstractions; known against abstract yields the abstract
/// side; two abstracts join in the abstraction lattice; tuples recurse
/// pointwise, collapsing to `Abstract` when every component does.
pub fn join_pvals<F: Float>(
    a: &PartialValue<F>,
    b: &PartialValue<F>,
) -> Result<PartialValue<F>, TraceError> {
    use PartialValue::*;
    match (a, b) {
        (Known(x), Known(y)) => {
            let (ax, ay) = (x.aval(), y.aval());
            if ax == ay {
                Ok(a.clone())
            } else {
                Ok(Abstract(lattice_join(&ax, &ay)?))
            }
        }
        (Known(x), Abstract(av)) | (Abstract(av), Known(x)) => {
            // the abstraction must cover the known value
            lattice_join(&x.aval(), av)?;
            Ok(Abstract(av.clone()))
        }
        (Abstract(x), Abstract(y)) => Ok(Abstract(lattice_join(x, y)?)),
        (Tuple(_), _) | (_, Tuple(_)) => {
            let xs = tuple_parts(a)?;
            let ys = tuple_parts(b)?;
            if xs.len() != ys.len() {
                return Err(TraceError::NoJoin {
                    left: a.aval().to_string(),
                    right: b.aval().to_string(),
                });
            }
            let joined: Vec<PartialValue<F>> = xs
                .iter()
                .zip(&ys)
                .map(|(x, y)| join_pvals(x, y))
                .collect::<Result<_, _>>()?;
            if joined.iter().all(|p| !p.is_known()) {
                Ok(Abstract(AbstractValue::Tuple(
                    joined
                        .iter()
                        .map(|p| p.as_abstract())
                        .collect::<Result<_, _>>()?,
                )))
            } else {
                Ok(Tuple(joined))
            }
        }
    }
}

fn tuple_parts<F: Float>(p: &PartialValue<F>) -> Result<Vec<PartialValue<F>>, TraceError> {
    match p {
        PartialValue::Tuple(parts) => Ok(parts.clone()),
        PartialValue::Known(v) => match v.as_concrete() {
            Some(crate::value::Value::Tuple(vs)) => Ok(vs
                .iter()
                .map(|x| PartialValue::Known(TracedValue::Concrete(x.clone())))
                .collect()),
            _ => Err(TraceError::type_error(format!(
                "cannot join tuple against non-tuple {}",
                p.aval()
            ))),
        },
        PartialValue::Abstract(a) => Ok(a
            .components()?
            .into_iter()
            .map(PartialValue::Abstract)
            .collect()),
    }
}

/// Combine the partial values of packed components into the partial value
/// of the pack.
pub fn pack_pvals<F: Float>(
    engine: &Engine<F>,
    pvals: &[PartialValue<F>],
) -> Result<PartialValue<F>, TraceError> {
    if pvals.iter().all(|p| p.is_known()) {
        let payloads: Vec<TracedValue<F>> = pvals
            .iter()
            .map(|p| p.known_payload().cloned().expect("known"))
            .collect();
        Ok(PartialValue::Known(engine.pack(&payloads)?))
    } else if pvals.iter().all(|p| !p.is_known()) {
        Ok(PartialValue::Abstract(AbstractValue::Tuple(
            pvals
                .iter()
                .map(|p| p.as_abstract())
                .collect::<Result<_, _>>()?,
        )))
    } else {
        Ok(PartialValue::Tuple(pvals.to_vec()))
    }
}

/// Reconcile a replayed value with the partial value recorded at trace
/// time: where the partial value is known, substitute the recorded payload;
/// where it is abstract, keep the replayed value.
pub fn merge_pvals<F: Float>(
    engine: &Engine<F>,
    val: TracedValue<F>,
    pval: &PartialValue<F>,
) -> Result<TracedValue<F>, TraceError> {
    match pval {
        PartialValue::Known(payload) => Ok(payload.clone()),
        PartialValue::Abstract(_) => Ok(val),
        PartialValue::Tuple(parts) => {
            let vals = engine.unpack(&val)?;
            if vals.len() != parts.len() {
                return Err(TraceError::Arity {
                    expected: parts.len(),
                    actual: vals.len(),
                });
            }
            let merged: Vec<TracedValue<F>> = vals
                .into_iter()
                .zip(parts)
                .map(|(v, p)| merge_pvals(engine, v, p))
                .collect::<Result<_, _>>()?;
            engine.pack(&merged)
        }
    }
}
