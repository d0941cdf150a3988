//! Tracing functions into programs and replaying them.

use quoll::engine::Engine;
use quoll::eval::eval_program;
use quoll::partial_eval::trace_to_program;
use quoll::program::check_program;
use quoll::pval::PartialValue;
use quoll::{jit, make_program, AbstractValue, Primitive, TraceError, TracedValue, Value};

fn scalar_aval() -> AbstractValue<f64> {
    AbstractValue::Shaped(vec![])
}

// ══════════════════════════════════════════════
//  Program reconstruction
// ══════════════════════════════════════════════

/// f(x, y) = x*y + y stages exactly two equations.
#[test]
fn product_plus_arg_stages_two_equations() {
    let (program, consts) = make_program(
        |e: &Engine<f64>, xs: &[TracedValue<f64>]| {
            let p = e.mul(&xs[0], &xs[1])?;
            e.add(&p, &xs[1])
        },
        &[scalar_aval(), scalar_aval()],
    )
    .unwrap();

    assert!(consts.is_empty());
    assert_eq!(program.invars.len(), 2);
    let prims: Vec<Primitive> = program.eqns.iter().map(|e| e.prim).collect();
    assert_eq!(prims, vec![Primitive::Mul, Primitive::Add]);
    check_program(&program).unwrap();
}

#[test]
fn captured_constants_land_in_constvars() {
    let c = Value::scalar(10.0);
    let (program, consts) = make_program(
        move |e: &Engine<f64>, xs: &[TracedValue<f64>]| {
            e.add(&xs[0], &e.constant(c.clone()))
        },
        &[scalar_aval()],
    )
    .unwrap();
    assert_eq!(consts, vec![Value::scalar(10.0)]);
    assert_eq!(program.constvars.len(), 1);
}

/// Destructuring the same tuple twice shares one unpack equation.
#[test]
fn destructuring_deduplicates_by_equation() {
    let (program, _) = make_program(
        |e: &Engine<f64>, xs: &[TracedValue<f64>]| {
            let pair = e.pack(&[xs[0].clone(), xs[1].clone()])?;
            let parts = e.unpack(&pair)?;
            // both components feed further equations; the destructuring
            // must still appear exactly once
            let a = e.add(&parts[0], &parts[1])?;
            e.mul(&a, &parts[0])
        },
        &[scalar_aval(), scalar_aval()],
    )
    .unwrap();

    let unpacks: Vec<_> = program
        .eqns
        .iter()
        .filter(|e| e.prim == Primitive::Unpack)
        .collect();
    assert_eq!(unpacks.len(), 1);
    assert_eq!(unpacks[0].outvars.len(), 2);
    check_program(&program).unwrap();
}

#[test]
fn program_prints_in_lambda_form() {
    let (program, _) = make_program(
        |e: &Engine<f64>, xs: &[TracedValue<f64>]| e.mul(&xs[0], &xs[0]),
        &[scalar_aval()],
    )
    .unwrap();
    let text = program.to_string();
    assert!(text.starts_with("{ lambda"));
    assert!(text.contains("mul a a"));
    assert!(text.contains("in b }"));
}

// ══════════════════════════════════════════════
//  Replay
// ══════════════════════════════════════════════

#[test]
fn replay_matches_direct_evaluation() {
    let f = |e: &Engine<f64>, xs: &[TracedValue<f64>]| {
        let p = e.mul(&xs[0], &xs[1])?;
        e.add(&p, &xs[1])
    };
    let (program, consts) = make_program(f, &[scalar_aval(), scalar_aval()]).unwrap();

    let engine = Engine::<f64>::default();
    let const_vals: Vec<TracedValue<f64>> =
        consts.into_iter().map(TracedValue::Concrete).collect();
    let out = eval_program(
        &engine,
        &program,
        &const_vals,
        &[],
        &[
            TracedValue::Concrete(Value::scalar(2.0)),
            TracedValue::Concrete(Value::scalar(3.0)),
        ],
    )
    .unwrap();
    assert_eq!(out.into_concrete().unwrap(), Value::scalar(9.0));
}

#[test]
fn jit_agrees_with_plain_evaluation() {
    let f = |e: &Engine<f64>, xs: &[TracedValue<f64>]| {
        let s = e.sin(&xs[0])?;
        e.mul(&s, &e.exp(&xs[0])?)
    };
    let x = 0.7_f64;
    let out = jit(f, &[Value::scalar(x)]).unwrap();
    approx::assert_relative_eq!(
        out.item().unwrap(),
        x.sin() * x.exp(),
        max_relative = 1e-12
    );
}

// ══════════════════════════════════════════════
//  Frame discipline
// ══════════════════════════════════════════════

/// A failing traced function must not leave its frame on the stack.
#[test]
fn failed_trace_unwinds_the_frame_stack() {
    let engine = Engine::<f64>::default();
    let result = trace_to_program(
        &engine,
        &|_: &Engine<f64>, _: &[TracedValue<f64>]| {
            Err(TraceError::Unsupported {
                detail: "deliberate mid-body failure".to_string(),
            })
        },
        &[PartialValue::Abstract(scalar_aval())],
    );
    assert!(result.is_err());
    assert_eq!(engine.trace_depth(), 0);
}

#[test]
fn scalar_trace_has_balanced_frames_afterwards() {
    let engine = Engine::<f64>::default();
    let outcome = trace_to_program(
        &engine,
        &|e: &Engine<f64>, xs: &[TracedValue<f64>]| e.neg(&xs[0]),
        &[PartialValue::Abstract(scalar_aval())],
    )
    .unwrap();
    assert_eq!(engine.trace_depth(), 0);
    assert_eq!(outcome.program.eqns.len(), 1);
}
