//! Program replay: run a reconstructed [`Program`] against fresh inputs.
//!
//! Every equation goes back through [`Engine::bind`], so replay composes
//! with live traces — replaying under an open forward-mode or vectorizing
//! frame re-stages the whole program through that frame. Mapped equations
//! replay under a fresh vectorizing frame that binds their axis name.

use std::collections::HashMap;

use crate::batch;
use crate::engine::Engine;
use crate::error::TraceError;
use crate::float::Float;
use crate::primitive::{Params, Primitive};
use crate::program::{Program, Var};
use crate::tracer::TracedValue;

/// Evaluate `program` with the given constants, free-variable values, and
/// arguments, aligned with `program.constvars`, `program.freevars`, and
/// `program.invars` respectively.
pub fn eval_program<F: Float>(
    engine: &Engine<F>,
    program: &Program,
    consts: &[TracedValue<F>],
    freevar_vals: &[TracedValue<F>],
    args: &[TracedValue<F>],
) -> Result<TracedValue<F>, TraceError> {
    check_aligned(&program.constvars, consts)?;
    check_aligned(&program.freevars, freevar_vals)?;
    check_aligned(&program.invars, args)?;

    let mut env: HashMap<Var, TracedValue<F>> = HashMap::new();
    env.insert(Var::UNIT, TracedValue::unit());
    for (v, val) in program.constvars.iter().zip(consts) {
        env.insert(*v, val.clone());
    }
    for (v, val) in program.freevars.iter().zip(freevar_vals) {
        env.insert(*v, val.clone());
    }
    for (v, val) in program.invars.iter().zip(args) {
        env.insert(*v, val.clone());
    }

    for eqn in &program.eqns {
        let in_vals: Vec<TracedValue<F>> = eqn
            .invars
            .iter()
            .map(|v| read(&env, *v))
            .collect::<Result<_, _>>()?;
        match eqn.prim {
            Primitive::Call => {
                let sub = expect_subprogram(eqn.subprograms.first())?;
                let sub_consts = read_all(&env, &sub.consts)?;
                let sub_free = read_all(&env, &sub.freevars)?;
                let out = eval_program(engine, &sub.program, &sub_consts, &sub_free, &in_vals)?;
                env.insert(eqn.outvars[0], out);
            }
            Primitive::Map => {
                let Params::Map {
                    axis_name,
                    axis_size,
                    num_consts,
                } = &eqn.params
                else {
                    return Err(TraceError::type_error(
                        "mapped equation without map parameters".to_string(),
                    ));
                };
                let sub = expect_subprogram(eqn.subprograms.first())?;
                let sub_free = read_all(&env, &sub.freevars)?;
                let body = |e: &Engine<F>, xs: &[TracedValue<F>]| {
                    eval_program(e, &sub.program, &[], &sub_free, xs)
                };
                // hoisted constants stay unmapped; the rest carry the axis
                let mut dims = vec![None; *num_consts];
                dims.extend(vec![Some(0); in_vals.len() - num_consts]);
                let out = batch::batch_call(
                    engine,
                    &body,
                    &in_vals,
                    &dims,
                    *axis_size,
                    Some(axis_name.clone()),
                )?;
                env.insert(eqn.outvars[0], out);
            }
            Primitive::Unpack => {
                let parts = engine.unpack(&in_vals[0])?;
                if parts.len() != eqn.outvars.len() {
                    return Err(TraceError::Arity {
                        expected: eqn.outvars.len(),
                        actual: parts.len(),
                    });
                }
                for (v, part) in eqn.outvars.iter().zip(parts) {
                    env.insert(*v, part);
                }
            }
            prim => {
                let out = engine.bind(prim, &in_vals, &eqn.params)?;
                env.insert(eqn.outvars[0], out);
            }
        }
    }
    read(&env, program.outvar)
}

fn read<F: Float>(
    env: &HashMap<Var, TracedValue<F>>,
    v: Var,
) -> Result<TracedValue<F>, TraceError> {
    env.get(&v).cloned().ok_or_else(|| {
        TraceError::type_error(format!("program reads unbound variable {v}"))
    })
}

fn read_all<F: Float>(
    env: &HashMap<Var, TracedValue<F>>,
    vars: &[Var],
) -> Result<Vec<TracedValue<F>>, TraceError> {
    vars.iter().map(|v| read(env, *v)).collect()
}

fn expect_subprogram(
    sub: Option<&crate::program::SubProgram>,
) -> Result<&crate::program::SubProgram, TraceError> {
    sub.ok_or_else(|| {
        TraceError::type_error("call equation is missing its sub-program".to_string())
    })
}

fn check_aligned<F: Float>(vars: &[Var], vals: &[TracedValue<F>]) -> Result<(), TraceError> {
    if vars.len() == vals.len() {
        Ok(())
    } else {
        Err(TraceError::Arity {
            expected: vars.len(),
            actual: vals.len(),
        })
    }
}
