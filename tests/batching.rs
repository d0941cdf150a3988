//! Vectorization and mapped calls with named-axis collectives.

use approx::assert_relative_eq;
use quoll::engine::Engine;
use quoll::{make_program, pmap, vmap, AbstractValue, Primitive, TraceError, TracedValue, Value};

// ══════════════════════════════════════════════
//  vmap
// ══════════════════════════════════════════════

/// Elementwise body applied across the leading axis.
#[test]
fn vmap_elementwise_body() {
    let out = vmap(
        |e: &Engine<f64>, xs: &[TracedValue<f64>]| {
            let sq = e.mul(&xs[0], &xs[0])?;
            e.add(&sq, &e.scalar(1.0))
        },
        &[Value::vector(&[1.0, 2.0, 3.0])],
    )
    .unwrap();
    assert_eq!(out, Value::vector(&[2.0, 5.0, 10.0]));
}

/// Two mapped arguments zip along the axis.
#[test]
fn vmap_zips_two_arguments() {
    let out = vmap(
        |e: &Engine<f64>, xs: &[TracedValue<f64>]| e.mul(&xs[0], &xs[1]),
        &[Value::vector(&[1.0, 2.0, 3.0]), Value::vector(&[4.0, 5.0, 6.0])],
    )
    .unwrap();
    assert_eq!(out, Value::vector(&[4.0, 10.0, 18.0]));
}

#[test]
fn vmap_rejects_mismatched_leading_axes() {
    let err = vmap(
        |e: &Engine<f64>, xs: &[TracedValue<f64>]| e.add(&xs[0], &xs[1]),
        &[Value::vector(&[1.0, 2.0]), Value::vector(&[1.0, 2.0, 3.0])],
    )
    .unwrap_err();
    assert!(matches!(err, TraceError::Type { .. }));
}

/// The per-example view inside the body is a scalar even though the value
/// underneath is the whole batch.
#[test]
fn vmap_body_sees_per_example_shapes() {
    let out = vmap(
        |e: &Engine<f64>, xs: &[TracedValue<f64>]| {
            assert_eq!(xs[0].aval().shape().unwrap(), Vec::<usize>::new());
            e.neg(&xs[0])
        },
        &[Value::vector(&[1.0, -2.0])],
    )
    .unwrap();
    assert_eq!(out, Value::vector(&[-1.0, 2.0]));
}

// ══════════════════════════════════════════════
//  pmap and psum
// ══════════════════════════════════════════════

/// Normalize across the mapped axis: xᵢ / Σⱼ xⱼ.
#[test]
fn pmap_psum_normalizes() {
    let out = pmap(
        |e: &Engine<f64>, xs: &[TracedValue<f64>]| {
            let total = e.psum(&xs[0], "i")?;
            e.div(&xs[0], &total)
        },
        &[Value::vector(&[1.0, 2.0, 3.0])],
        "i",
    )
    .unwrap();
    let total = 6.0;
    assert_eq!(
        out,
        Value::vector(&[1.0 / total, 2.0 / total, 3.0 / total])
    );
}

/// A psum collapses the mapped axis; its result is replicated back across
/// every position.
#[test]
fn pmap_psum_result_is_replicated() {
    let out = pmap(
        |e: &Engine<f64>, xs: &[TracedValue<f64>]| e.psum(&xs[0], "i"),
        &[Value::vector(&[1.0, 2.0, 3.0])],
        "i",
    )
    .unwrap();
    assert_eq!(out, Value::vector(&[6.0, 6.0, 6.0]));
}

/// maxⱼ xⱼ replicated to every position along the mapped axis.
#[test]
fn pmap_pmax_selects_the_axis_maximum() {
    let out = pmap(
        |e: &Engine<f64>, xs: &[TracedValue<f64>]| e.pmax(&xs[0], "i"),
        &[Value::vector(&[1.0, 5.0, 3.0])],
        "i",
    )
    .unwrap();
    assert_eq!(out, Value::vector(&[5.0, 5.0, 5.0]));
}

/// Normalize by the axis maximum: xᵢ / maxⱼ xⱼ.
#[test]
fn pmap_pmax_normalizes_by_the_maximum() {
    let out = pmap(
        |e: &Engine<f64>, xs: &[TracedValue<f64>]| {
            let m = e.pmax(&xs[0], "i")?;
            e.div(&xs[0], &m)
        },
        &[Value::vector(&[2.0, 8.0, 4.0])],
        "i",
    )
    .unwrap();
    assert_eq!(out, Value::vector(&[0.25, 1.0, 0.5]));
}

/// A collective naming an axis no mapped trace binds is an error.
#[test]
fn psum_without_a_binding_map_fails() {
    let err = vmap(
        |e: &Engine<f64>, xs: &[TracedValue<f64>]| e.psum(&xs[0], "ghost"),
        &[Value::vector(&[1.0, 2.0])],
    )
    .unwrap_err();
    assert!(matches!(err, TraceError::UnboundAxis { name } if name == "ghost"));
}

/// An output that ignores the mapped axis is replicated across it, even
/// when that output is a tracer of an enclosing staged trace.
#[test]
fn vmap_replicates_staged_unbatched_outputs() {
    let out = quoll::jit(
        |e: &Engine<f64>, xs: &[TracedValue<f64>]| {
            quoll::batch::vmap(
                e,
                &|e2: &Engine<f64>, _ys: &[TracedValue<f64>]| e2.mul(&xs[0], &xs[0]),
                &[e.constant(Value::vector(&[1.0, 2.0, 3.0]))],
            )
        },
        &[Value::scalar(2.0)],
    )
    .unwrap();
    assert_eq!(out, Value::vector(&[4.0, 4.0, 4.0]));
}

// ══════════════════════════════════════════════
//  Mapped calls under staging
// ══════════════════════════════════════════════

/// `map` inside an abstract trace stages one `Map` equation whose
/// sub-program works on per-example shapes; replay recovers the mapped
/// semantics.
#[test]
fn staged_map_replays_correctly() {
    let (program, consts) = make_program(
        |e: &Engine<f64>, xs: &[TracedValue<f64>]| {
            e.map(
                &|e2: &Engine<f64>, ys: &[TracedValue<f64>]| e2.mul(&ys[0], &ys[0]),
                &[xs[0].clone()],
                "i",
            )
        },
        &[AbstractValue::Shaped(vec![3])],
    )
    .unwrap();

    let map_eqns: Vec<_> = program
        .eqns
        .iter()
        .filter(|e| e.prim == Primitive::Map)
        .collect();
    assert_eq!(map_eqns.len(), 1);
    let sub = &map_eqns[0].subprograms[0];
    // the sub-program is traced at per-example rank
    assert_eq!(sub.program.eqns.len(), 1);
    assert_eq!(sub.program.eqns[0].prim, Primitive::Mul);

    let engine = Engine::<f64>::default();
    let const_vals: Vec<TracedValue<f64>> =
        consts.into_iter().map(TracedValue::Concrete).collect();
    let out = quoll::eval::eval_program(
        &engine,
        &program,
        &const_vals,
        &[],
        &[TracedValue::Concrete(Value::vector(&[1.0, 2.0, 3.0]))],
    )
    .unwrap();
    assert_eq!(
        out.into_concrete().unwrap(),
        Value::vector(&[1.0, 4.0, 9.0])
    );
}

/// Collectives survive staging: the mean over the mapped axis.
#[test]
fn staged_map_with_psum_replays_collectives() {
    let f = |e: &Engine<f64>, xs: &[TracedValue<f64>]| {
        e.map(
            &|e2: &Engine<f64>, ys: &[TracedValue<f64>]| {
                let total = e2.psum(&ys[0], "rows")?;
                e2.div(&ys[0], &total)
            },
            &[xs[0].clone()],
            "rows",
        )
    };
    let out = quoll::jit(f, &[Value::vector(&[2.0, 6.0])]).unwrap();
    assert_relative_eq!(
        out.as_tensor().unwrap().data()[0],
        0.25,
        max_relative = 1e-12
    );
    assert_relative_eq!(
        out.as_tensor().unwrap().data()[1],
        0.75,
        max_relative = 1e-12
    );
}
