//! Forward-mode differentiation: the jacobian-vector-product trace.
//!
//! Each tracer carries a primal/tangent pair, and every rule below computes
//! both sides through [`Engine::bind`], so the pair can itself be staged,
//! differentiated again, or vectorized by enclosing frames.

use std::rc::Rc;

use crate::aval::zeros_like;
use crate::engine::{Engine, Fun, TraceKind};
use crate::error::TraceError;
use crate::float::Float;
use crate::primitive::{Params, Primitive};
use crate::tracer::{JvpTracer, TracedValue};

pub(crate) fn tracer<F: Float>(
    engine: &Engine<F>,
    level: usize,
    frame_id: u64,
    primal: TracedValue<F>,
    tangent: TracedValue<F>,
) -> TracedValue<F> {
    TracedValue::Jvp(Rc::new(JvpTracer {
        id: engine.fresh_id(),
        level,
        frame_id,
        primal,
        tangent,
    }))
}

/// Lift a constant into the trace: its tangent is zero.
pub(crate) fn lift<F: Float>(
    engine: &Engine<F>,
    level: usize,
    frame_id: u64,
    val: TracedValue<F>,
) -> Result<TracedValue<F>, TraceError> {
    let tangent = TracedValue::Concrete(zeros_like(&val.aval().to_shaped())?);
    Ok(tracer(engine, level, frame_id, val, tangent))
}

/// Run `f` at `primals` and push the `tangents` through its linearization,
/// returning the primal output and the tangent output.
pub fn jvp<F: Float>(
    engine: &Engine<F>,
    f: &Fun<'_, F>,
    primals: &[TracedValue<F>],
    tangents: &[TracedValue<F>],
) -> Result<(TracedValue<F>, TracedValue<F>), TraceError> {
    if primals.len() != tangents.len() {
        return Err(TraceError::Arity {
            expected: primals.len(),
            actual: tangents.len(),
        });
    }
    let guard = engine.push_frame(TraceKind::Jvp);
    let (level, frame_id) = (guard.level, guard.frame_id());
    let args: Vec<TracedValue<F>> = primals
        .iter()
        .zip(tangents)
        .map(|(p, t)| tracer(engine, level, frame_id, p.clone(), t.clone()))
        .collect();
    let out = f(engine, &args)?;
    let frame = engine
        .frame_at(level)
        .unwrap_or_else(|| panic!("forward-mode frame vanished mid-trace"));
    let out = engine.full_raise(level, &frame, &out)?;
    match out {
        TracedValue::Jvp(t) => Ok((t.primal.clone(), t.tangent.clone())),
        other => panic!("full_raise into a forward-mode frame returned {other}"),
    }
    // guard pops the frame here
}

/// Differentiation rules. Args arrive raised to this frame.
pub(crate) fn process_primitive<F: Float>(
    engine: &Engine<F>,
    level: usize,
    frame_id: u64,
    prim: Primitive,
    args: &[TracedValue<F>],
    params: &Params,
) -> Result<TracedValue<F>, TraceError> {
    let pairs: Vec<(TracedValue<F>, TracedValue<F>)> = args
        .iter()
        .map(|a| match a {
            TracedValue::Jvp(t) if t.level == level && t.frame_id == frame_id => {
                (t.primal.clone(), t.tangent.clone())
            }
            other => panic!("value {other} was not raised into the forward-mode frame"),
        })
        .collect();

    let (p_out, t_out) = match prim {
        Primitive::Add => {
            let ((px, tx), (py, ty)) = two(&pairs)?;
            (engine.add(px, py)?, engine.add(tx, ty)?)
        }
        Primitive::Sub => {
            let ((px, tx), (py, ty)) = two(&pairs)?;
            (engine.sub(px, py)?, engine.sub(tx, ty)?)
        }
        Primitive::Mul => {
            let ((px, tx), (py, ty)) = two(&pairs)?;
            let t = engine.add(&engine.mul(tx, py)?, &engine.mul(px, ty)?)?;
            (engine.mul(px, py)?, t)
        }
        Primitive::Div => {
            // d(x/y) = (dx - (x/y) dy) / y
            let ((px, tx), (py, ty)) = two(&pairs)?;
            let q = engine.div(px, py)?;
            let t = engine.div(&engine.sub(tx, &engine.mul(&q, ty)?)?, py)?;
            (q, t)
        }
        Primitive::Neg => {
            let (p, t) = one(&pairs)?;
            (engine.neg(p)?, engine.neg(t)?)
        }
        Primitive::Sin => {
            let (p, t) = one(&pairs)?;
            (engine.sin(p)?, engine.mul(t, &engine.cos(p)?)?)
        }
        Primitive::Cos => {
            let (p, t) = one(&pairs)?;
            (engine.cos(p)?, engine.neg(&engine.mul(t, &engine.sin(p)?)?)?)
        }
        Primitive::Exp => {
            let (p, t) = one(&pairs)?;
            let e = engine.exp(p)?;
            let t = engine.mul(t, &e)?;
            (e, t)
        }
        Primitive::Log => {
            let (p, t) = one(&pairs)?;
            (engine.log(p)?, engine.div(t, p)?)
        }
        Primitive::Sqrt => {
            let (p, t) = one(&pairs)?;
            let s = engine.sqrt(p)?;
            let two_s = engine.mul(&engine.scalar(F::one() + F::one()), &s)?;
            let t = engine.div(t, &two_s)?;
            (s, t)
        }
        // structural and linear primitives apply unchanged to both sides
        Primitive::Sum | Primitive::Broadcast | Primitive::Psum => {
            let (p, t) = one(&pairs)?;
            (
                engine.bind(prim, &[p.clone()], params)?,
                engine.bind(prim, &[t.clone()], params)?,
            )
        }
        Primitive::Pack => {
            let primals: Vec<TracedValue<F>> = pairs.iter().map(|(p, _)| p.clone()).collect();
            let tangents: Vec<TracedValue<F>> = pairs.iter().map(|(_, t)| t.clone()).collect();
            (engine.pack(&primals)?, engine.pack(&tangents)?)
        }
        Primitive::Pmax => {
            return Err(TraceError::Unsupported {
                detail: "pmax has no forward-mode rule".to_string(),
            })
        }
        Primitive::Unpack | Primitive::Call | Primitive::Map => {
            return Err(TraceError::Unsupported {
                detail: format!(
                    "primitive {} has no forward-mode rule; it is handled structurally",
                    prim.name()
                ),
            })
        }
    };
    Ok(tracer(engine, level, frame_id, p_out, t_out))
}

fn one<F: Float>(
    pairs: &[(TracedValue<F>, TracedValue<F>)],
) -> Result<(&TracedValue<F>, &TracedValue<F>), TraceError> {
    match pairs {
        [(p, t)] => Ok((p, t)),
        _ => Err(TraceError::Arity {
            expected: 1,
            actual: pairs.len(),
        }),
    }
}

type Pair<'a, F> = ((&'a TracedValue<F>, &'a TracedValue<F>), (&'a TracedValue<F>, &'a TracedValue<F>));

fn two<F: Float>(pairs: &[(TracedValue<F>, TracedValue<F>)]) -> Result<Pair<'_, F>, TraceError> {
    match pairs {
        [(px, tx), (py, ty)] => Ok(((px, tx), (py, ty))),
        _ => Err(TraceError::Arity {
            expected: 2,
            actual: pairs.len(),
        }),
    }
}
