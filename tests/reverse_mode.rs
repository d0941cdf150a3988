//! Reverse-mode gradients and pullbacks against closed forms.

use approx::assert_relative_eq;
use quoll::engine::Engine;
use quoll::{grad, value_and_grad, vjp, TraceError, TracedValue, Value};

fn scalar(v: f64) -> Value<f64> {
    Value::scalar(v)
}

fn item(v: &Value<f64>) -> f64 {
    v.item().unwrap()
}

// ══════════════════════════════════════════════
//  Gradients
// ══════════════════════════════════════════════

/// f(x, y) = x·y + y → ∇f = (y, x + 1)
#[test]
fn product_plus_arg_gradient() {
    let g = grad(
        |e: &Engine<f64>, xs: &[TracedValue<f64>]| {
            let p = e.mul(&xs[0], &xs[1])?;
            e.add(&p, &xs[1])
        },
        &[scalar(2.0), scalar(3.0)],
    )
    .unwrap();
    assert_relative_eq!(item(&g[0]), 3.0, max_relative = 1e-12);
    assert_relative_eq!(item(&g[1]), 3.0, max_relative = 1e-12);
}

/// f(x) = sin(eˣ) → f'(x) = cos(eˣ)·eˣ
#[test]
fn sin_of_exp_chain() {
    let x = 0.4_f64;
    let g = grad(
        |e: &Engine<f64>, xs: &[TracedValue<f64>]| e.sin(&e.exp(&xs[0])?),
        &[scalar(x)],
    )
    .unwrap();
    assert_relative_eq!(item(&g[0]), x.exp().cos() * x.exp(), max_relative = 1e-12);
}

/// f(x) = ln(x)·√x → f'(x) = 1/√x + ln(x)/(2√x)
#[test]
fn log_times_sqrt() {
    let x = 2.5_f64;
    let g = grad(
        |e: &Engine<f64>, xs: &[TracedValue<f64>]| {
            e.mul(&e.log(&xs[0])?, &e.sqrt(&xs[0])?)
        },
        &[scalar(x)],
    )
    .unwrap();
    let expected = 1.0 / x.sqrt() + x.ln() / (2.0 * x.sqrt());
    assert_relative_eq!(item(&g[0]), expected, max_relative = 1e-12);
}

/// f(x, y) = x/y is linear in x only; both partials still come out.
#[test]
fn quotient_gradient() {
    let (x, y) = (3.0_f64, 2.0_f64);
    let g = grad(
        |e: &Engine<f64>, xs: &[TracedValue<f64>]| e.div(&xs[0], &xs[1]),
        &[scalar(x), scalar(y)],
    )
    .unwrap();
    assert_relative_eq!(item(&g[0]), 1.0 / y, max_relative = 1e-12);
    assert_relative_eq!(item(&g[1]), -x / (y * y), max_relative = 1e-12);
}

/// f(v) = Σ v² → ∇f = 2v, through a reduction and its broadcast transpose.
#[test]
fn sum_of_squares_gradient() {
    let g = grad(
        |e: &Engine<f64>, xs: &[TracedValue<f64>]| e.sum_all(&e.mul(&xs[0], &xs[0])?),
        &[Value::vector(&[1.0, 2.0, 3.0])],
    )
    .unwrap();
    assert_eq!(g[0], Value::vector(&[2.0, 4.0, 6.0]));
}

/// An argument the output never touches gets a zero cotangent.
#[test]
fn untouched_argument_gets_zero_gradient() {
    let g = grad(
        |e: &Engine<f64>, xs: &[TracedValue<f64>]| e.mul(&xs[0], &xs[0]),
        &[scalar(2.0), scalar(7.0)],
    )
    .unwrap();
    assert_relative_eq!(item(&g[0]), 4.0, max_relative = 1e-12);
    assert_eq!(g[1], Value::scalar(0.0));
}

#[test]
fn value_and_grad_returns_both() {
    let (v, g) = value_and_grad(
        |e: &Engine<f64>, xs: &[TracedValue<f64>]| {
            let sq = e.mul(&xs[0], &xs[0])?;
            e.add(&sq, &e.scalar(3.0))
        },
        &[scalar(2.0)],
    )
    .unwrap();
    assert_relative_eq!(item(&v), 7.0, max_relative = 1e-12);
    assert_relative_eq!(item(&g[0]), 4.0, max_relative = 1e-12);
}

#[test]
fn grad_rejects_non_scalar_outputs() {
    let err = grad(
        |e: &Engine<f64>, xs: &[TracedValue<f64>]| e.mul(&xs[0], &xs[0]),
        &[Value::vector(&[1.0, 2.0])],
    )
    .unwrap_err();
    assert!(matches!(err, TraceError::Type { .. }));
}

// ══════════════════════════════════════════════
//  Pullbacks
// ══════════════════════════════════════════════

/// One linearization, many cotangents.
#[test]
fn pullback_is_reusable() {
    let x = 1.3_f64;
    let (out, pullback) = vjp(
        |e: &Engine<f64>, xs: &[TracedValue<f64>]| e.exp(&xs[0]),
        &[scalar(x)],
    )
    .unwrap();
    assert_relative_eq!(item(&out), x.exp(), max_relative = 1e-12);

    let g1 = pullback.apply(&Value::scalar(1.0)).unwrap();
    assert_relative_eq!(item(&g1[0]), x.exp(), max_relative = 1e-12);

    let g2 = pullback.apply(&Value::scalar(-2.0)).unwrap();
    assert_relative_eq!(item(&g2[0]), -2.0 * x.exp(), max_relative = 1e-12);
}

/// Pulling back a vector cotangent through an elementwise map weights
/// each component.
#[test]
fn vector_cotangent_pullback() {
    let v = [1.0_f64, 2.0, 3.0];
    let (_, pullback) = vjp(
        |e: &Engine<f64>, xs: &[TracedValue<f64>]| e.mul(&xs[0], &xs[0]),
        &[Value::vector(&v)],
    )
    .unwrap();
    let ct = [1.0_f64, 0.0, -1.0];
    let g = pullback.apply(&Value::vector(&ct)).unwrap();
    assert_eq!(g[0], Value::vector(&[2.0, 0.0, -6.0]));
}
