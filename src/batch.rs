//! Vectorization: the batching trace behind `vmap` and the serial mapped
//! call behind `pmap`.
//!
//! A batch tracer holds the *full* batched value and the position of its
//! batch axis (always the leading axis here). Elementwise primitives ride on
//! suffix broadcasting: a batched operand has one extra leading axis and
//! still lines up against unbatched partners. Reductions shift their kept
//! axes by one. A collective (`psum`, `pmax`) naming this frame's axis
//! collapses the batch axis; any other axis name passes through to the
//! frames below.

use std::rc::Rc;

use crate::engine::{mapped_axis_size, Engine, Fun, TraceKind};
use crate::error::TraceError;
use crate::float::Float;
use crate::primitive::{Params, Primitive};
use crate::tracer::{BatchTracer, TracedValue};
use crate::value::{self, Value};

pub(crate) fn tracer<F: Float>(
    engine: &Engine<F>,
    level: usize,
    frame_id: u64,
    val: TracedValue<F>,
    dim: Option<usize>,
) -> TracedValue<F> {
    TracedValue::Batch(Rc::new(BatchTracer {
        id: engine.fresh_id(),
        level,
        frame_id,
        val,
        dim,
    }))
}

/// Lift a constant into the trace: it has no batch axis.
pub(crate) fn lift<F: Float>(
    engine: &Engine<F>,
    level: usize,
    frame_id: u64,
    val: TracedValue<F>,
) -> TracedValue<F> {
    tracer(engine, level, frame_id, val, None)
}

/// Vectorize `f` over the leading axis of every argument.
pub fn vmap<F: Float>(
    engine: &Engine<F>,
    f: &Fun<'_, F>,
    args: &[TracedValue<F>],
) -> Result<TracedValue<F>, TraceError> {
    let axis_size = mapped_axis_size(args)?;
    batch_call(engine, f, args, &vec![Some(0); args.len()], axis_size, None)
}

/// Run `f` under a fresh batching frame.
///
/// `dims` says, per argument, where its batch axis sits (`None` for
/// unmapped arguments). When `axis_name` is given, `psum` collectives
/// naming that axis resolve against this frame.
pub(crate) fn batch_call<F: Float>(
    engine: &Engine<F>,
    f: &Fun<'_, F>,
    args: &[TracedValue<F>],
    dims: &[Option<usize>],
    axis_size: usize,
    axis_name: Option<String>,
) -> Result<TracedValue<F>, TraceError> {
    if args.len() != dims.len() {
        return Err(TraceError::Arity {
            expected: args.len(),
            actual: dims.len(),
        });
    }
    let guard = engine.push_frame(TraceKind::Batch {
        axis_size,
        axis_name,
    });
    let (level, frame_id) = (guard.level, guard.frame_id());
    let in_tracers: Vec<TracedValue<F>> = args
        .iter()
        .zip(dims)
        .map(|(a, d)| tracer(engine, level, frame_id, a.clone(), *d))
        .collect();
    let out = f(engine, &in_tracers)?;
    let frame = engine
        .frame_at(level)
        .unwrap_or_else(|| panic!("batching frame vanished mid-trace"));
    let out = engine.full_raise(level, &frame, &out)?;
    let (val, dim) = match out {
        TracedValue::Batch(t) => (t.val.clone(), t.dim),
        other => panic!("full_raise into a batching frame returned {other}"),
    };
    drop(guard);
    match dim {
        Some(0) => Ok(val),
        Some(d) => Err(TraceError::Unsupported {
            detail: format!("batched output with axis at position {d}"),
        }),
        // the output never touched the batch axis; replicate it
        None => replicate_leading(engine, &val, axis_size),
    }
}

/// Replicate an unbatched value across the mapped axis. Concrete values are
/// copied directly; traced values ride suffix broadcasting against a zero
/// tensor that carries the new leading axis, so the replication stages
/// through whatever frame owns them.
fn replicate_leading<F: Float>(
    engine: &Engine<F>,
    val: &TracedValue<F>,
    axis_size: usize,
) -> Result<TracedValue<F>, TraceError> {
    if let Some(v) = val.as_concrete() {
        return Ok(TracedValue::Concrete(value::broadcast_leading(
            v, axis_size,
        )?));
    }
    let mut shape = vec![axis_size];
    shape.extend(val.aval().shape()?);
    engine.add(&TracedValue::Concrete(Value::zeros(&shape)), val)
}

/// Batching rules. Args arrive raised to this frame.
#[allow(clippy::too_many_arguments)]
pub(crate) fn process_primitive<F: Float>(
    engine: &Engine<F>,
    level: usize,
    frame_id: u64,
    axis_size: usize,
    axis_name: Option<&str>,
    prim: Primitive,
    args: &[TracedValue<F>],
    params: &Params,
) -> Result<TracedValue<F>, TraceError> {
    let pairs: Vec<(TracedValue<F>, Option<usize>)> = args
        .iter()
        .map(|a| match a {
            TracedValue::Batch(t) if t.level == level && t.frame_id == frame_id => {
                (t.val.clone(), t.dim)
            }
            other => panic!("value {other} was not raised into the batching frame"),
        })
        .collect();
    let vals: Vec<TracedValue<F>> = pairs.iter().map(|(v, _)| v.clone()).collect();

    // nothing batched: rebind below and stay unbatched
    if pairs.iter().all(|(_, d)| d.is_none()) && !prim.is_collective() {
        let out = engine.bind(prim, &vals, params)?;
        return Ok(tracer(engine, level, frame_id, out, None));
    }

    match prim {
        Primitive::Psum | Primitive::Pmax => {
            let (val, dim) = pairs
                .first()
                .cloned()
                .ok_or(TraceError::Arity {
                    expected: 1,
                    actual: 0,
                })?;
            let Params::Collective { axis_name: target } = params else {
                return Err(TraceError::type_error(format!(
                    "{} without an axis name",
                    prim.name()
                )));
            };
            if Some(target.as_str()) != axis_name {
                // someone else's axis; keep our batch axis and pass it down
                let out = engine.bind(prim, &[val], params)?;
                return Ok(tracer(engine, level, frame_id, out, dim));
            }
            let reduced = match dim {
                // an unbatched value is replicated along this axis: its sum
                // scales with the axis size and its maximum is itself
                None => match prim {
                    Primitive::Psum => {
                        let n = F::from_usize(axis_size).ok_or_else(|| {
                            TraceError::type_error(format!(
                                "axis size {axis_size} does not fit the scalar type"
                            ))
                        })?;
                        engine.mul(&engine.scalar(n), &val)?
                    }
                    _ => val,
                },
                Some(0) => match val.as_concrete() {
                    Some(v) => TracedValue::Concrete(match prim {
                        Primitive::Psum => value::sum_axis0(v)?,
                        _ => value::max_axis0(v)?,
                    }),
                    None => {
                        return Err(TraceError::Unsupported {
                            detail: format!("{} over a traced batch axis", prim.name()),
                        })
                    }
                },
                Some(d) => {
                    return Err(TraceError::Unsupported {
                        detail: format!("{} over a batch axis at position {d}", prim.name()),
                    })
                }
            };
            Ok(tracer(engine, level, frame_id, reduced, None))
        }
        Primitive::Sum => {
            let (val, _) = batched_unary(&pairs)?;
            let Params::Sum { keep, .. } = params else {
                return Err(TraceError::type_error(
                    "sum without reduction parameters".to_string(),
                ));
            };
            // the batch axis is leading, so the kept prefix grows by one
            let input_shape = val.aval().shape()?;
            let out = engine.bind(
                Primitive::Sum,
                &[val.clone()],
                &Params::Sum {
                    input_shape,
                    keep: keep + 1,
                },
            )?;
            Ok(tracer(engine, level, frame_id, out, Some(0)))
        }
        Primitive::Broadcast => {
            // trailing replication commutes with a leading batch axis
            let (val, _) = batched_unary(&pairs)?;
            let out = engine.bind(prim, &[val.clone()], params)?;
            Ok(tracer(engine, level, frame_id, out, Some(0)))
        }
        Primitive::Pack => {
            let components: Vec<TracedValue<F>> = pairs
                .iter()
                .map(|(v, d)| match d {
                    Some(0) => Ok(v.clone()),
                    Some(d) => Err(TraceError::Unsupported {
                        detail: format!("packed component batched at position {d}"),
                    }),
                    None => replicate_leading(engine, v, axis_size),
                })
                .collect::<Result<_, _>>()?;
            let out = engine.pack(&components)?;
            Ok(tracer(engine, level, frame_id, out, Some(0)))
        }
        Primitive::Add
        | Primitive::Sub
        | Primitive::Mul
        | Primitive::Div
        | Primitive::Neg
        | Primitive::Sin
        | Primitive::Cos
        | Primitive::Exp
        | Primitive::Log
        | Primitive::Sqrt => {
            check_elementwise_ranks(&pairs)?;
            let out = engine.bind(prim, &vals, params)?;
            Ok(tracer(engine, level, frame_id, out, Some(0)))
        }
        Primitive::Unpack | Primitive::Call | Primitive::Map => Err(TraceError::Unsupported {
            detail: format!(
                "primitive {} has no batching rule; it is handled structurally",
                prim.name()
            ),
        }),
    }
}

fn batched_unary<F: Float>(
    pairs: &[(TracedValue<F>, Option<usize>)],
) -> Result<(&TracedValue<F>, usize), TraceError> {
    match pairs {
        [(v, Some(d))] => Ok((v, *d)),
        [(_, None)] => Err(TraceError::type_error(
            "expected a batched operand".to_string(),
        )),
        _ => Err(TraceError::Arity {
            expected: 1,
            actual: pairs.len(),
        }),
    }
}

/// Suffix broadcasting aligns a batched operand with an unbatched one only
/// when every unbatched operand's rank fits strictly under the batched
/// rank. Anything else would silently cycle the wrong operand.
fn check_elementwise_ranks<F: Float>(
    pairs: &[(TracedValue<F>, Option<usize>)],
) -> Result<(), TraceError> {
    let mut min_batched_rank = usize::MAX;
    for (v, d) in pairs {
        if d.is_some() {
            min_batched_rank = min_batched_rank.min(v.aval().shape()?.len());
        }
    }
    for (v, d) in pairs {
        if d.is_none() && v.aval().shape()?.len() >= min_batched_rank {
            return Err(TraceError::Unsupported {
                detail: "unbatched operand rank conflicts with the batch axis".to_string(),
            });
        }
    }
    Ok(())
}
