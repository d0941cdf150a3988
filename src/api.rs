//! User-facing entry points over concrete values.
//!
//! Each function spins up a fresh [`Engine`], wraps the inputs, runs the
//! transformation, and extracts concrete results. For composing
//! transformations inside a traced function, use the engine-level
//! counterparts ([`crate::linearize`], [`crate::jvp`], [`crate::batch`])
//! directly.

use crate::aval::AbstractValue;
use crate::batch;
use crate::engine::Engine;
use crate::error::TraceError;
use crate::float::Float;
use crate::jvp as jvp_mod;
use crate::linearize;
use crate::partial_eval::{compiled_call, trace_to_program};
use crate::program::Program;
use crate::pval::PartialValue;
use crate::tracer::TracedValue;
use crate::value::Value;

/// The closure shape all entry points accept.
pub trait Traceable<F: Float>:
    Fn(&Engine<F>, &[TracedValue<F>]) -> Result<TracedValue<F>, TraceError>
{
}

impl<F: Float, T> Traceable<F> for T where
    T: Fn(&Engine<F>, &[TracedValue<F>]) -> Result<TracedValue<F>, TraceError>
{
}

/// Gradient of a scalar-valued function at `at`.
pub fn grad<F: Float>(
    f: impl Traceable<F>,
    at: &[Value<F>],
) -> Result<Vec<Value<F>>, TraceError> {
    Ok(value_and_grad(f, at)?.1)
}

/// Value and gradient of a scalar-valued function at `at`.
pub fn value_and_grad<F: Float>(
    f: impl Traceable<F>,
    at: &[Value<F>],
) -> Result<(Value<F>, Vec<Value<F>>), TraceError> {
    let engine = Engine::default();
    let primals = wrap(at);
    let (out, grads) = linearize::value_and_grad(&engine, &f, &primals)?;
    Ok((out.into_concrete()?, unwrap(grads)?))
}

/// Forward-mode derivative: the value of `f` at `primals` and the
/// directional derivative along `tangents`.
pub fn jvp<F: Float>(
    f: impl Traceable<F>,
    primals: &[Value<F>],
    tangents: &[Value<F>],
) -> Result<(Value<F>, Value<F>), TraceError> {
    let engine = Engine::default();
    let (p, t) = jvp_mod::jvp(&engine, &f, &wrap(primals), &wrap(tangents))?;
    Ok((p.into_concrete()?, t.into_concrete()?))
}

/// Reverse-mode linearization: the value of `f` at `primals` and a reusable
/// pullback from output cotangents to input cotangents.
pub fn vjp<F: Float>(
    f: impl Traceable<F>,
    primals: &[Value<F>],
) -> Result<(Value<F>, Pullback<F>), TraceError> {
    let engine = Engine::default();
    let (out, pullback) = linearize::vjp(&engine, &f, &wrap(primals))?;
    Ok((
        out.into_concrete()?,
        Pullback {
            engine,
            vjp: pullback,
        },
    ))
}

/// A pullback bound to its own engine, applicable to any number of
/// cotangents.
pub struct Pullback<F: Float> {
    engine: Engine<F>,
    vjp: linearize::Vjp<F>,
}

impl<F: Float> Pullback<F> {
    pub fn apply(&self, ct: &Value<F>) -> Result<Vec<Value<F>>, TraceError> {
        let cts = self
            .vjp
            .apply(&self.engine, &TracedValue::Concrete(ct.clone()))?;
        unwrap(cts)
    }
}

/// Vectorize `f` over the leading axis of every argument.
pub fn vmap<F: Float>(f: impl Traceable<F>, args: &[Value<F>]) -> Result<Value<F>, TraceError> {
    let engine = Engine::default();
    batch::vmap(&engine, &f, &wrap(args))?.into_concrete()
}

/// Map `f` over the leading axis of every argument, binding `axis_name`
/// for `psum` collectives inside the body.
pub fn pmap<F: Float>(
    f: impl Traceable<F>,
    args: &[Value<F>],
    axis_name: &str,
) -> Result<Value<F>, TraceError> {
    let engine = Engine::default();
    engine.map(&f, &wrap(args), axis_name)?.into_concrete()
}

/// Stage `f` once and replay the staged program.
pub fn jit<F: Float>(f: impl Traceable<F>, args: &[Value<F>]) -> Result<Value<F>, TraceError> {
    let engine = Engine::default();
    compiled_call(&engine, &f, &wrap(args))?.into_concrete()
}

/// Trace `f` against abstract inputs and return the reconstructed program
/// with its captured constants.
pub fn make_program<F: Float>(
    f: impl Traceable<F>,
    avals: &[AbstractValue<F>],
) -> Result<(Program, Vec<Value<F>>), TraceError> {
    let engine = Engine::default();
    let pvals: Vec<PartialValue<F>> = avals
        .iter()
        .map(|a| PartialValue::Abstract(a.clone()))
        .collect();
    let outcome = trace_to_program(&engine, &f, &pvals)?;
    if !outcome.env.is_empty() {
        return Err(TraceError::Escaped {
            detail: "traced function captured tracers from an enclosing trace".to_string(),
        });
    }
    let consts = unwrap(outcome.consts)?;
    Ok((outcome.program, consts))
}

fn wrap<F: Float>(vals: &[Value<F>]) -> Vec<TracedValue<F>> {
    vals.iter().cloned().map(TracedValue::Concrete).collect()
}

fn unwrap<F: Float>(vals: Vec<TracedValue<F>>) -> Result<Vec<Value<F>>, TraceError> {
    vals.into_iter().map(|v| v.into_concrete()).collect()
}
