//! Linearization and reverse-mode differentiation.
//!
//! # How it works
//!
//! `linearize` runs forward-mode *through* partial evaluation: primals enter
//! the trace known, tangents abstract, so everything the tangents touch is
//! staged into a program and everything else is baked in as constants. The
//! staged program computes the (primal, tangent) pair; applying it to new
//! tangents replays it, and the primal slots of its parameter list are
//! ignored because the known primals were captured as constants.
//!
//! `vjp` transposes that program: a forward sweep replays the parts whose
//! inputs are all known, then a reverse sweep walks the equations backwards
//! and accumulates cotangents through the linear operations only. `grad` is
//! `vjp` at a scalar output, seeded with one.
//!
//! Cotangent arithmetic goes through [`Engine::bind`], so gradients can be
//! vectorized, differentiated again, or staged by enclosing frames.

use std::collections::HashMap;

use crate::aval::{zeros_like, AbstractValue};
use crate::engine::{Engine, Fun};
use crate::error::TraceError;
use crate::eval::eval_program;
use crate::float::Float;
use crate::jvp::jvp;
use crate::partial_eval::trace_to_program;
use crate::primitive::{Params, Primitive};
use crate::program::{Eqn, Program, Var};
use crate::pval::{merge_pvals, PartialValue};
use crate::tracer::TracedValue;

/// The linear map produced by [`linearize`]: a staged program from tangents
/// to the (primal, tangent) output pair.
pub struct Linear<F: Float> {
    program: Program,
    consts: Vec<TracedValue<F>>,
    env: Vec<TracedValue<F>>,
    out_pval: PartialValue<F>,
    n_in: usize,
    tangent_avals: Vec<AbstractValue<F>>,
}

/// Linearize `f` at `primals`: the primal output plus the best linear
/// approximation of `f` around that point.
pub fn linearize<F: Float>(
    engine: &Engine<F>,
    f: &Fun<'_, F>,
    primals: &[TracedValue<F>],
) -> Result<(TracedValue<F>, Linear<F>), TraceError> {
    let n = primals.len();
    let tangent_avals: Vec<AbstractValue<F>> =
        primals.iter().map(|p| p.aval().to_shaped()).collect();
    let mut pvals: Vec<PartialValue<F>> = primals
        .iter()
        .map(|p| PartialValue::Known(p.clone()))
        .collect();
    pvals.extend(
        tangent_avals
            .iter()
            .map(|a| PartialValue::Abstract(a.clone())),
    );

    let wrapper = |e: &Engine<F>, args: &[TracedValue<F>]| {
        let (ps, ts) = args.split_at(n);
        let (p_out, t_out) = jvp(e, f, ps, ts)?;
        e.pack(&[p_out, t_out])
    };
    let outcome = trace_to_program(engine, &wrapper, &pvals)?;

    let lin = Linear {
        program: outcome.program,
        consts: outcome.consts,
        env: outcome.env,
        out_pval: outcome.out_pval,
        n_in: n,
        tangent_avals,
    };
    // one replay with zero tangents recovers the primal output
    let zeros: Vec<TracedValue<F>> = lin
        .tangent_avals
        .iter()
        .map(|a| Ok(TracedValue::Concrete(zeros_like(a)?)))
        .collect::<Result<_, TraceError>>()?;
    let pair = lin.replay(engine, &zeros)?;
    let parts = engine.unpack(&pair)?;
    let primal_out = expect_pair(parts)?.0;
    Ok((primal_out, lin))
}

impl<F: Float> Linear<F> {
    /// Push `tangents` through the linear map.
    pub fn apply(
        &self,
        engine: &Engine<F>,
        tangents: &[TracedValue<F>],
    ) -> Result<TracedValue<F>, TraceError> {
        let pair = self.replay(engine, tangents)?;
        let parts = engine.unpack(&pair)?;
        Ok(expect_pair(parts)?.1)
    }

    /// Replay the staged program. The primal parameter slots are dummies —
    /// their values were captured as constants at trace time — so the
    /// tangents stand in for them, shapes matching by construction.
    fn replay(
        &self,
        engine: &Engine<F>,
        tangents: &[TracedValue<F>],
    ) -> Result<TracedValue<F>, TraceError> {
        if tangents.len() != self.n_in {
            return Err(TraceError::Arity {
                expected: self.n_in,
                actual: tangents.len(),
            });
        }
        let mut args = tangents.to_vec();
        args.extend(tangents.iter().cloned());
        let out = eval_program(engine, &self.program, &self.consts, &self.env, &args)?;
        merge_pvals(engine, out, &self.out_pval)
    }
}

fn expect_pair<F: Float>(
    mut parts: Vec<TracedValue<F>>,
) -> Result<(TracedValue<F>, TracedValue<F>), TraceError> {
    if parts.len() != 2 {
        return Err(TraceError::Arity {
            expected: 2,
            actual: parts.len(),
        });
    }
    let t = parts.pop().unwrap_or_else(|| unreachable!());
    let p = parts.pop().unwrap_or_else(|| unreachable!());
    Ok((p, t))
}

/// The pullback produced by [`vjp`].
pub struct Vjp<F: Float> {
    lin: Linear<F>,
}

/// Reverse-mode linearization: the primal output plus a pullback mapping an
/// output cotangent to input cotangents.
pub fn vjp<F: Float>(
    engine: &Engine<F>,
    f: &Fun<'_, F>,
    primals: &[TracedValue<F>],
) -> Result<(TracedValue<F>, Vjp<F>), TraceError> {
    let (primal_out, lin) = linearize(engine, f, primals)?;
    Ok((primal_out, Vjp { lin }))
}

impl<F: Float> Vjp<F> {
    /// Pull an output cotangent back to one cotangent per input.
    pub fn apply(
        &self,
        engine: &Engine<F>,
        ct: &TracedValue<F>,
    ) -> Result<Vec<TracedValue<F>>, TraceError> {
        backward_pass(engine, &self.lin, ct)
    }
}

/// Gradient of a scalar-valued function.
pub fn grad<F: Float>(
    engine: &Engine<F>,
    f: &Fun<'_, F>,
    primals: &[TracedValue<F>],
) -> Result<Vec<TracedValue<F>>, TraceError> {
    Ok(value_and_grad(engine, f, primals)?.1)
}

/// Gradient of a scalar-valued function, together with its value.
pub fn value_and_grad<F: Float>(
    engine: &Engine<F>,
    f: &Fun<'_, F>,
    primals: &[TracedValue<F>],
) -> Result<(TracedValue<F>, Vec<TracedValue<F>>), TraceError> {
    let (out, pullback) = vjp(engine, f, primals)?;
    let shape = out.aval().shape()?;
    if !shape.is_empty() {
        return Err(TraceError::type_error(format!(
            "grad requires a scalar output, got shape {shape:?}"
        )));
    }
    let grads = pullback.apply(engine, &TracedValue::scalar(F::one()))?;
    Ok((out, grads))
}

/// Transpose the linearized program.
///
/// The forward sweep replays every equation whose inputs are all known
/// (constants, captured values, and anything derived from them); the
/// reverse sweep transposes the remaining equations, which are linear in
/// the tangent inputs by construction, accumulating cotangents per
/// variable.
fn backward_pass<F: Float>(
    engine: &Engine<F>,
    lin: &Linear<F>,
    ct: &TracedValue<F>,
) -> Result<Vec<TracedValue<F>>, TraceError> {
    let program = &lin.program;

    let mut primal_env: HashMap<Var, TracedValue<F>> = HashMap::new();
    primal_env.insert(Var::UNIT, TracedValue::unit());
    for (v, val) in program.constvars.iter().zip(&lin.consts) {
        primal_env.insert(*v, val.clone());
    }
    for (v, val) in program.freevars.iter().zip(&lin.env) {
        primal_env.insert(*v, val.clone());
    }
    // the tangent input slots stay unbound: they are the linear variables

    // forward sweep
    for eqn in &program.eqns {
        if !eqn.subprograms.is_empty() {
            continue;
        }
        if !eqn.invars.iter().all(|v| primal_env.contains_key(v)) {
            continue;
        }
        let in_vals: Vec<TracedValue<F>> = eqn
            .invars
            .iter()
            .map(|v| primal_env[v].clone())
            .collect();
        if eqn.prim == Primitive::Unpack {
            let parts = engine.unpack(&in_vals[0])?;
            for (v, part) in eqn.outvars.iter().zip(parts) {
                primal_env.insert(*v, part);
            }
        } else {
            let out = engine.bind(eqn.prim, &in_vals, &eqn.params)?;
            primal_env.insert(eqn.outvars[0], out);
        }
    }

    // the output is a (primal, tangent) pair; only the tangent side is
    // seeded, the primal side gets a zero cotangent
    let out_components = lin.out_pval.aval().components()?;
    if out_components.len() != 2 {
        return Err(TraceError::Arity {
            expected: 2,
            actual: out_components.len(),
        });
    }
    let primal_zero = TracedValue::Concrete(zeros_like(&out_components[0])?);
    let seed = engine.pack(&[primal_zero, ct.clone()])?;
    let mut ct_env: HashMap<Var, TracedValue<F>> = HashMap::new();
    ct_env.insert(program.outvar, seed);

    // reverse sweep
    for eqn in program.eqns.iter().rev() {
        let is_linear: Vec<bool> = eqn
            .invars
            .iter()
            .map(|v| *v != Var::UNIT && !primal_env.contains_key(v))
            .collect();
        if !is_linear.iter().any(|&b| b) {
            continue;
        }
        if !eqn.subprograms.is_empty() {
            return Err(TraceError::Unsupported {
                detail: "transpose of call and mapped equations".to_string(),
            });
        }
        let in_cts: Vec<Option<TracedValue<F>>> = if eqn.prim == Primitive::Unpack {
            let out_cts: Vec<Option<TracedValue<F>>> = eqn
                .outvars
                .iter()
                .map(|v| ct_env.get(v).cloned())
                .collect();
            if out_cts.iter().all(|c| c.is_none()) {
                continue;
            }
            let all: Vec<TracedValue<F>> = out_cts
                .into_iter()
                .collect::<Option<_>>()
                .ok_or(TraceError::Unsupported {
                    detail: "destructured value with partially seeded cotangents".to_string(),
                })?;
            vec![Some(engine.pack(&all)?)]
        } else {
            match ct_env.get(&eqn.outvars[0]) {
                None => continue,
                Some(ct_out) => transpose_eqn(engine, eqn, ct_out, &is_linear, &primal_env)?,
            }
        };
        for ((v, linear), c) in eqn.invars.iter().zip(&is_linear).zip(in_cts) {
            let (true, Some(c)) = (*linear, c) else { continue };
            let acc = match ct_env.get(v) {
                Some(prev) => engine.add(prev, &c)?,
                None => c,
            };
            ct_env.insert(*v, acc);
        }
    }

    // cotangents of the tangent parameter slots, zero where unseeded
    program.invars[lin.n_in..]
        .iter()
        .zip(&lin.tangent_avals)
        .map(|(v, aval)| match ct_env.remove(v) {
            Some(c) => Ok(c),
            None => Ok(TracedValue::Concrete(zeros_like(aval)?)),
        })
        .collect()
}

/// Per-primitive transpose: cotangents for each input slot, `None` for the
/// known (non-linear) slots.
fn transpose_eqn<F: Float>(
    engine: &Engine<F>,
    eqn: &Eqn,
    ct: &TracedValue<F>,
    is_linear: &[bool],
    primal_env: &HashMap<Var, TracedValue<F>>,
) -> Result<Vec<Option<TracedValue<F>>>, TraceError> {
    let known = |i: usize| -> Result<TracedValue<F>, TraceError> {
        primal_env
            .get(&eqn.invars[i])
            .cloned()
            .ok_or_else(|| nonlinear(eqn.prim))
    };
    match eqn.prim {
        Primitive::Add => Ok(vec![
            is_linear[0].then(|| ct.clone()),
            is_linear[1].then(|| ct.clone()),
        ]),
        Primitive::Sub => Ok(vec![
            is_linear[0].then(|| ct.clone()),
            if is_linear[1] {
                Some(engine.neg(ct)?)
            } else {
                None
            },
        ]),
        Primitive::Neg => Ok(vec![Some(engine.neg(ct)?)]),
        Primitive::Mul => match (is_linear[0], is_linear[1]) {
            (true, false) => Ok(vec![Some(engine.mul(ct, &known(1)?)?), None]),
            (false, true) => Ok(vec![None, Some(engine.mul(&known(0)?, ct)?)]),
            _ => Err(nonlinear(eqn.prim)),
        },
        Primitive::Div => {
            // only linear in the numerator
            if is_linear[0] && !is_linear[1] {
                Ok(vec![Some(engine.div(ct, &known(1)?)?), None])
            } else {
                Err(nonlinear(eqn.prim))
            }
        }
        Primitive::Sum => {
            let Params::Sum { input_shape, keep } = &eqn.params else {
                return Err(TraceError::type_error(
                    "sum without reduction parameters".to_string(),
                ));
            };
            Ok(vec![Some(engine.broadcast(ct, &input_shape[*keep..])?)])
        }
        Primitive::Broadcast => {
            let Params::Broadcast { trailing } = &eqn.params else {
                return Err(TraceError::type_error(
                    "broadcast without replication parameters".to_string(),
                ));
            };
            let keep = ct.aval().shape()?.len() - trailing.len();
            Ok(vec![Some(engine.sum(ct, keep)?)])
        }
        Primitive::Pack => {
            let parts = engine.unpack(ct)?;
            if parts.len() != is_linear.len() {
                return Err(TraceError::Arity {
                    expected: is_linear.len(),
                    actual: parts.len(),
                });
            }
            Ok(parts
                .into_iter()
                .zip(is_linear)
                .map(|(c, &l)| l.then_some(c))
                .collect())
        }
        prim => Err(TraceError::Unsupported {
            detail: format!("no transpose rule for primitive {}", prim.name()),
        }),
    }
}

fn nonlinear(prim: Primitive) -> TraceError {
    TraceError::Unsupported {
        detail: format!(
            "primitive {} applied to linear values in a non-linear position",
            prim.name()
        ),
    }
}
