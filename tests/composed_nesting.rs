//! Transformation composition: differentiation, vectorization, and staging
//! nest in any order because every rule routes back through `bind`.

use approx::assert_relative_eq;
use quoll::engine::Engine;
use quoll::{batch, grad, jvp, linearize, vmap, TracedValue, Value};

type E = Engine<f64>;
type Tv = TracedValue<f64>;

/// f(x) = x² + 3
fn square_plus_three(e: &E, xs: &[Tv]) -> Result<Tv, quoll::TraceError> {
    let sq = e.mul(&xs[0], &xs[0])?;
    e.add(&sq, &e.scalar(3.0))
}

// ══════════════════════════════════════════════
//  Vectorized gradients
// ══════════════════════════════════════════════

/// vmap(grad(f)) computes per-example gradients in one pass.
#[test]
fn vmap_of_grad() {
    let per_example_grad = |e: &E, xs: &[Tv]| {
        let mut grads = linearize::grad(e, &square_plus_three, xs)?;
        Ok(grads.remove(0))
    };
    let out = vmap(per_example_grad, &[Value::vector(&[1.0, 2.0, 3.0])]).unwrap();
    assert_eq!(out, Value::vector(&[2.0, 4.0, 6.0]));
}

/// grad(sum ∘ vmap(f)) recovers the same per-example gradients.
#[test]
fn grad_of_vmap() {
    let summed = |e: &E, xs: &[Tv]| {
        let mapped = batch::vmap(
            e,
            &|e2: &E, ys: &[Tv]| square_plus_three(e2, ys),
            &[xs[0].clone()],
        )?;
        e.sum_all(&mapped)
    };
    let g = grad(summed, &[Value::vector(&[1.0, 2.0, 3.0])]).unwrap();
    assert_eq!(g[0], Value::vector(&[2.0, 4.0, 6.0]));
}

/// The two orders agree.
#[test]
fn vectorized_gradient_orders_agree() {
    let xs = Value::vector(&[0.5, -1.0, 2.0]);

    let per_example_grad = |e: &E, args: &[Tv]| {
        let mut grads = linearize::grad(e, &square_plus_three, args)?;
        Ok(grads.remove(0))
    };
    let forward = vmap(per_example_grad, &[xs.clone()]).unwrap();

    let summed = |e: &E, args: &[Tv]| {
        let mapped = batch::vmap(
            e,
            &|e2: &E, ys: &[Tv]| square_plus_three(e2, ys),
            &[args[0].clone()],
        )?;
        e.sum_all(&mapped)
    };
    let reverse = grad(summed, &[xs]).unwrap();

    assert_eq!(forward, reverse[0]);
}

// ══════════════════════════════════════════════
//  Higher-order derivatives
// ══════════════════════════════════════════════

/// Forward over reverse: d/dx [f'(x)] for f(x) = x³ is 6x.
#[test]
fn jvp_of_grad_is_second_derivative() {
    let cube = |e: &E, xs: &[Tv]| {
        let sq = e.mul(&xs[0], &xs[0])?;
        e.mul(&sq, &xs[0])
    };
    let first = |e: &E, xs: &[Tv]| {
        let mut grads = linearize::grad(e, &cube, xs)?;
        Ok(grads.remove(0))
    };
    let x = 2.0_f64;
    let (fprime, fsecond) = jvp(first, &[Value::scalar(x)], &[Value::scalar(1.0)]).unwrap();
    assert_relative_eq!(fprime.item().unwrap(), 3.0 * x * x, max_relative = 1e-12);
    assert_relative_eq!(fsecond.item().unwrap(), 6.0 * x, max_relative = 1e-12);
}

/// Reverse over reverse: grad(grad(f)) for f(x) = x³ is also 6x.
#[test]
fn grad_of_grad_is_second_derivative() {
    let cube = |e: &E, xs: &[Tv]| {
        let sq = e.mul(&xs[0], &xs[0])?;
        e.mul(&sq, &xs[0])
    };
    let first = |e: &E, xs: &[Tv]| {
        let mut grads = linearize::grad(e, &cube, xs)?;
        Ok(grads.remove(0))
    };
    let x = 2.0_f64;
    let g = grad(first, &[Value::scalar(x)]).unwrap();
    assert_relative_eq!(g[0].item().unwrap(), 6.0 * x, max_relative = 1e-12);
}

// ══════════════════════════════════════════════
//  Linearization reuse
// ══════════════════════════════════════════════

/// One linearization evaluated along several tangents.
#[test]
fn linear_map_applies_to_many_tangents() {
    let engine = E::default();
    let f = |e: &E, xs: &[Tv]| e.mul(&e.sin(&xs[0])?, &xs[0]);
    let x = 1.1_f64;
    let (primal, lin) =
        linearize::linearize(&engine, &f, &[TracedValue::Concrete(Value::scalar(x))]).unwrap();
    assert_relative_eq!(
        primal.into_concrete().unwrap().item().unwrap(),
        x.sin() * x,
        max_relative = 1e-12
    );

    let dfdx = x.cos() * x + x.sin();
    for tangent in [1.0, -0.5, 3.0] {
        let t = lin
            .apply(&engine, &[TracedValue::Concrete(Value::scalar(tangent))])
            .unwrap();
        assert_relative_eq!(
            t.into_concrete().unwrap().item().unwrap(),
            dfdx * tangent,
            max_relative = 1e-12
        );
    }
}
