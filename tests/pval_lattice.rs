//! Lattice properties of partial values and abstract values, and the
//! raise/lower round trip tracers make through live frames.

use quoll::aval::lattice_join;
use quoll::engine::{Engine, TraceKind};
use quoll::pval::{join_pvals, PartialValue};
use quoll::{AbstractValue, TraceError, TracedValue, Value};

type Pv = PartialValue<f64>;
type Av = AbstractValue<f64>;

fn known(v: f64) -> Pv {
    PartialValue::Known(TracedValue::Concrete(Value::scalar(v)))
}

fn shaped(shape: &[usize]) -> Pv {
    PartialValue::Abstract(AbstractValue::Shaped(shape.to_vec()))
}

/// Partial values have no structural equality (known payloads may be live
/// tracers), so compare the abstraction and the knownness pointwise.
fn assert_same_partiality(a: &Pv, b: &Pv) {
    assert_eq!(a.aval(), b.aval());
    match (a, b) {
        (PartialValue::Tuple(xs), PartialValue::Tuple(ys)) => {
            assert_eq!(xs.len(), ys.len());
            for (x, y) in xs.iter().zip(ys) {
                assert_same_partiality(x, y);
            }
        }
        _ => assert_eq!(a.is_known(), b.is_known()),
    }
}

// ══════════════════════════════════════════════
//  Abstract value joins
// ══════════════════════════════════════════════

#[test]
fn equal_concretes_stay_concrete() {
    let a: Av = AbstractValue::Concrete(Value::scalar(2.0));
    let j = lattice_join(&a, &a).unwrap();
    assert_eq!(j, a);
}

#[test]
fn different_concretes_forget_to_shaped() {
    let a: Av = AbstractValue::Concrete(Value::scalar(2.0));
    let b: Av = AbstractValue::Concrete(Value::scalar(3.0));
    assert_eq!(lattice_join(&a, &b).unwrap(), AbstractValue::Shaped(vec![]));
}

#[test]
fn mismatched_shapes_have_no_join() {
    let a: Av = AbstractValue::Shaped(vec![2]);
    let b: Av = AbstractValue::Shaped(vec![3]);
    assert!(matches!(
        lattice_join(&a, &b),
        Err(TraceError::NoJoin { .. })
    ));
}

// ══════════════════════════════════════════════
//  Partial value joins
// ══════════════════════════════════════════════

#[test]
fn join_of_equal_knowns_is_known() {
    let j = join_pvals(&known(1.0), &known(1.0)).unwrap();
    assert!(j.is_known());
}

#[test]
fn join_of_different_knowns_demotes_to_abstract() {
    let j = join_pvals(&known(1.0), &known(2.0)).unwrap();
    assert!(!j.is_known());
    assert_eq!(j.aval(), AbstractValue::Shaped(vec![]));
}

#[test]
fn known_against_abstract_yields_the_abstract_side() {
    let j = join_pvals(&known(1.0), &shaped(&[])).unwrap();
    assert!(!j.is_known());
    let j = join_pvals(&shaped(&[]), &known(1.0)).unwrap();
    assert!(!j.is_known());
}

#[test]
fn join_is_commutative_on_mixed_tuples() {
    let a = PartialValue::Tuple(vec![known(1.0), shaped(&[2])]);
    let b = PartialValue::Tuple(vec![known(1.0), shaped(&[2])]);
    let j1 = join_pvals(&a, &b).unwrap();
    let j2 = join_pvals(&b, &a).unwrap();
    assert_eq!(j1.aval(), j2.aval());
    // the shared known component survives the join
    match j1 {
        PartialValue::Tuple(parts) => {
            assert!(parts[0].is_known());
            assert!(!parts[1].is_known());
        }
        other => panic!("expected a mixed tuple, got {}", other.aval()),
    }
}

#[test]
fn all_abstract_tuple_join_collapses() {
    let a = PartialValue::Tuple(vec![known(1.0), shaped(&[])]);
    let b = PartialValue::Tuple(vec![known(2.0), shaped(&[])]);
    // the knowns differ, so every component demotes and the tuple collapses
    let j = join_pvals(&a, &b).unwrap();
    assert!(matches!(j, PartialValue::Abstract(AbstractValue::Tuple(_))));
}

#[test]
fn tuple_length_mismatch_has_no_join() {
    let a = PartialValue::Tuple(vec![shaped(&[]), shaped(&[])]);
    let b = PartialValue::Tuple(vec![shaped(&[]), shaped(&[]), shaped(&[])]);
    assert!(matches!(join_pvals(&a, &b), Err(TraceError::NoJoin { .. })));
}

/// (a ⊔ b) ⊔ c = a ⊔ (b ⊔ c) over known, abstract, and tuple operands.
#[test]
fn join_is_associative() {
    let triples: Vec<[Pv; 3]> = vec![
        [known(1.0), known(1.0), known(2.0)],
        [known(1.0), shaped(&[]), known(2.0)],
        [
            PartialValue::Tuple(vec![known(1.0), shaped(&[2])]),
            PartialValue::Tuple(vec![known(1.0), shaped(&[2])]),
            PartialValue::Tuple(vec![known(2.0), shaped(&[2])]),
        ],
    ];
    for [a, b, c] in &triples {
        let left = join_pvals(&join_pvals(a, b).unwrap(), c).unwrap();
        let right = join_pvals(a, &join_pvals(b, c).unwrap()).unwrap();
        assert_same_partiality(&left, &right);
    }
}

/// Joining a value with itself changes nothing.
#[test]
fn self_join_is_a_no_op() {
    let pvals = vec![
        known(1.5),
        shaped(&[3]),
        PartialValue::Tuple(vec![known(2.0), shaped(&[])]),
    ];
    for p in &pvals {
        assert_same_partiality(&join_pvals(p, p).unwrap(), p);
    }

    let avals = vec![
        AbstractValue::Concrete(Value::vector(&[1.0, 2.0])),
        Av::Shaped(vec![2, 2]),
        AbstractValue::Tuple(vec![Av::Shaped(vec![]), Av::Shaped(vec![3])]),
    ];
    for a in &avals {
        assert_eq!(&lattice_join(a, a).unwrap(), a);
    }
}

// ══════════════════════════════════════════════
//  Raising and lowering
// ══════════════════════════════════════════════

/// Lifting a concrete value into a staging frame and lowering it back is
/// the identity; raising a tracer its frame already owns is a no-op.
#[test]
fn raise_then_lower_through_a_staging_frame_is_identity() {
    let engine = Engine::<f64>::default();
    let guard = engine.push_frame(TraceKind::PartialEval);
    let frame = engine.frame_at(guard.level()).unwrap();

    let x = TracedValue::Concrete(Value::scalar(4.0));
    let raised = engine.full_raise(guard.level(), &frame, &x).unwrap();
    assert!(matches!(raised, TracedValue::Program(_)));
    assert_eq!(
        raised.clone().full_lower().into_concrete().unwrap(),
        Value::scalar(4.0)
    );

    let again = engine.full_raise(guard.level(), &frame, &raised).unwrap();
    assert_eq!(again.id(), raised.id());
}

#[test]
fn raise_then_lower_through_a_batching_frame_is_identity() {
    let engine = Engine::<f64>::default();
    let guard = engine.push_frame(TraceKind::Batch {
        axis_size: 3,
        axis_name: None,
    });
    let frame = engine.frame_at(guard.level()).unwrap();

    let x = TracedValue::Concrete(Value::vector(&[1.0, 2.0]));
    let raised = engine.full_raise(guard.level(), &frame, &x).unwrap();
    assert_eq!(
        raised.full_lower().into_concrete().unwrap(),
        Value::vector(&[1.0, 2.0])
    );

    drop(guard);
    assert_eq!(engine.trace_depth(), 0);
}
