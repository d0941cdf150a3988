//! Rule tables for primitive operations.
//!
//! The engine owns a [`Registry`] and consults it for everything it does
//! not know structurally: concrete evaluation (`impl`), output typing
//! (`abstract_eval`), and the optional custom partial-evaluation hooks that
//! let a primitive bypass equation staging. `Call`, `Map`, and `Unpack`
//! have no table entries — the engine handles them structurally.

use std::collections::HashMap;

use crate::aval::AbstractValue;
use crate::error::TraceError;
use crate::float::Float;
use crate::partial_eval::ProgramTrace;
use crate::primitive::{Params, Primitive};
use crate::tracer::TracedValue;
use crate::value::{self, Value};

/// Concrete evaluation rule.
pub type ImplFn<F> = fn(&[Value<F>], &Params) -> Result<Value<F>, TraceError>;

/// Output abstraction rule.
pub type AbstractFn<F> = fn(&[AbstractValue<F>], &Params) -> Result<AbstractValue<F>, TraceError>;

/// Custom partial-evaluation rule; may stage its own equation shape or
/// execute eagerly and return a fully-known tracer.
pub type PartialEvalFn<F> =
    fn(&ProgramTrace<'_, F>, &[TracedValue<F>], &Params) -> Result<TracedValue<F>, TraceError>;

pub struct PrimitiveRules<F: Float> {
    pub impl_rule: ImplFn<F>,
    pub abstract_eval: AbstractFn<F>,
}

pub struct Registry<F: Float> {
    rules: HashMap<Primitive, PrimitiveRules<F>>,
    partial_eval: HashMap<Primitive, PartialEvalFn<F>>,
}

impl<F: Float> Registry<F> {
    pub fn empty() -> Self {
        Registry {
            rules: HashMap::new(),
            partial_eval: HashMap::new(),
        }
    }

    /// Install or replace the rules for a primitive.
    pub fn register(&mut self, prim: Primitive, rules: PrimitiveRules<F>) {
        self.rules.insert(prim, rules);
    }

    /// Install or replace a custom partial-evaluation rule.
    pub fn register_partial_eval(&mut self, prim: Primitive, rule: PartialEvalFn<F>) {
        self.partial_eval.insert(prim, rule);
    }

    pub fn impl_rule(&self, prim: Primitive) -> Result<ImplFn<F>, TraceError> {
        self.rules
            .get(&prim)
            .map(|r| r.impl_rule)
            .ok_or_else(|| TraceError::Unsupported {
                detail: format!("no concrete rule for primitive {}", prim.name()),
            })
    }

    pub fn abstract_eval(&self, prim: Primitive) -> Result<AbstractFn<F>, TraceError> {
        self.rules
            .get(&prim)
            .map(|r| r.abstract_eval)
            .ok_or_else(|| TraceError::Unsupported {
                detail: format!("no abstract rule for primitive {}", prim.name()),
            })
    }

    pub fn partial_eval_rule(&self, prim: Primitive) -> Option<PartialEvalFn<F>> {
        self.partial_eval.get(&prim).copied()
    }
}

impl<F: Float> Default for Registry<F> {
    fn default() -> Self {
        let mut r = Registry::empty();
        r.register(
            Primitive::Add,
            PrimitiveRules {
                impl_rule: |args, _| {
                    check_arity(args, 2)?;
                    value::binop(&args[0], &args[1], "add", |x, y| x + y)
                },
                abstract_eval: binary_aval,
            },
        );
        r.register(
            Primitive::Sub,
            PrimitiveRules {
                impl_rule: |args, _| {
                    check_arity(args, 2)?;
                    value::binop(&args[0], &args[1], "sub", |x, y| x - y)
                },
                abstract_eval: binary_aval,
            },
        );
        r.register(
            Primitive::Mul,
            PrimitiveRules {
                impl_rule: |args, _| {
                    check_arity(args, 2)?;
                    value::binop(&args[0], &args[1], "mul", |x, y| x * y)
                },
                abstract_eval: binary_aval,
            },
        );
        r.register(
            Primitive::Div,
            PrimitiveRules {
                impl_rule: |args, _| {
                    check_arity(args, 2)?;
                    value::binop(&args[0], &args[1], "div", |x, y| x / y)
                },
                abstract_eval: binary_aval,
            },
        );
        r.register(
            Primitive::Neg,
            PrimitiveRules {
                impl_rule: |args: &[Value<F>], _| {
                    check_arity(args, 1)?;
                    value::unop(&args[0], |x| -x)
                },
                abstract_eval: unary_aval,
            },
        );
        r.register(
            Primitive::Sin,
            PrimitiveRules {
                impl_rule: |args, _| {
                    check_arity(args, 1)?;
                    value::unop(&args[0], |x| x.sin())
                },
                abstract_eval: unary_aval,
            },
        );
        r.register(
            Primitive::Cos,
            PrimitiveRules {
                impl_rule: |args, _| {
                    check_arity(args, 1)?;
                    value::unop(&args[0], |x| x.cos())
                },
                abstract_eval: unary_aval,
            },
        );
        r.register(
            Primitive::Exp,
            PrimitiveRules {
                impl_rule: |args, _| {
                    check_arity(args, 1)?;
                    value::unop(&args[0], |x| x.exp())
                },
                abstract_eval: unary_aval,
            },
        );
        r.register(
            Primitive::Log,
            PrimitiveRules {
                impl_rule: |args, _| {
                    check_arity(args, 1)?;
                    value::unop(&args[0], |x| x.ln())
                },
                abstract_eval: unary_aval,
            },
        );
        r.register(
            Primitive::Sqrt,
            PrimitiveRules {
                impl_rule: |args, _| {
                    check_arity(args, 1)?;
                    value::unop(&args[0], |x| x.sqrt())
                },
                abstract_eval: unary_aval,
            },
        );
        r.register(
            Primitive::Sum,
            PrimitiveRules {
                impl_rule: |args, params| {
                    check_arity(args, 1)?;
                    match params {
                        Params::Sum { keep, .. } => value::sum_trailing(&args[0], *keep),
                        _ => Err(bad_params("sum")),
                    }
                },
                abstract_eval: |avals, params| {
                    check_arity(avals, 1)?;
                    match params {
                        Params::Sum { input_shape, keep } => {
                            let shape = avals[0].shape()?;
                            if &shape != input_shape {
                                return Err(TraceError::type_error(format!(
                                    "sum: input shape {shape:?} does not match recorded {input_shape:?}"
                                )));
                            }
                            if *keep > shape.len() {
                                return Err(TraceError::type_error(format!(
                                    "sum: cannot keep {keep} axes of shape {shape:?}"
                                )));
                            }
                            Ok(AbstractValue::Shaped(shape[..*keep].to_vec()))
                        }
                        _ => Err(bad_params("sum")),
                    }
                },
            },
        );
        r.register(
            Primitive::Broadcast,
            PrimitiveRules {
                impl_rule: |args, params| {
                    check_arity(args, 1)?;
                    match params {
                        Params::Broadcast { trailing } => {
                            value::broadcast_trailing(&args[0], trailing)
                        }
                        _ => Err(bad_params("broadcast")),
                    }
                },
                abstract_eval: |avals, params| {
                    check_arity(avals, 1)?;
                    match params {
                        Params::Broadcast { trailing } => {
                            let mut shape = avals[0].shape()?;
                            shape.extend_from_slice(trailing);
                            Ok(AbstractValue::Shaped(shape))
                        }
                        _ => Err(bad_params("broadcast")),
                    }
                },
            },
        );
        r.register(
            Primitive::Pack,
            PrimitiveRules {
                impl_rule: |args, _| Ok(Value::Tuple(args.to_vec())),
                abstract_eval: |avals, _| Ok(AbstractValue::Tuple(avals.to_vec())),
            },
        );
        // a collective that reaches concrete evaluation escaped every
        // mapped trace that could have bound its axis
        r.register(
            Primitive::Psum,
            PrimitiveRules {
                impl_rule: |_, params| Err(unbound_collective("psum", params)),
                abstract_eval: |avals, _| {
                    check_arity(avals, 1)?;
                    Ok(avals[0].to_shaped())
                },
            },
        );
        r.register(
            Primitive::Pmax,
            PrimitiveRules {
                impl_rule: |_, params| Err(unbound_collective("pmax", params)),
                abstract_eval: |avals, _| {
                    check_arity(avals, 1)?;
                    Ok(avals[0].to_shaped())
                },
            },
        );
        // Pack has a custom partial-evaluation rule so fully-known packs
        // stay known instead of staging an equation.
        r.register_partial_eval(Primitive::Pack, |trace, args, _| trace.pack(args));
        r
    }
}

fn check_arity<T>(args: &[T], expected: usize) -> Result<(), TraceError> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(TraceError::Arity {
            expected,
            actual: args.len(),
        })
    }
}

fn bad_params(name: &str) -> TraceError {
    TraceError::type_error(format!("wrong static parameters for {name}"))
}

fn unbound_collective(name: &str, params: &Params) -> TraceError {
    match params {
        Params::Collective { axis_name } => TraceError::UnboundAxis {
            name: axis_name.clone(),
        },
        _ => bad_params(name),
    }
}

/// Suffix-broadcasting shape rule shared by the elementwise binaries.
fn binary_aval<F: Float>(
    avals: &[AbstractValue<F>],
    _: &Params,
) -> Result<AbstractValue<F>, TraceError> {
    check_arity(avals, 2)?;
    let (a, b) = (avals[0].shape()?, avals[1].shape()?);
    let (hi, lo) = if a.len() >= b.len() { (&a, &b) } else { (&b, &a) };
    if hi[hi.len() - lo.len()..] != lo[..] {
        return Err(TraceError::type_error(format!(
            "shapes {a:?} and {b:?} do not broadcast"
        )));
    }
    Ok(AbstractValue::Shaped(hi.to_vec()))
}

fn unary_aval<F: Float>(
    avals: &[AbstractValue<F>],
    _: &Params,
) -> Result<AbstractValue<F>, TraceError> {
    check_arity(avals, 1)?;
    Ok(avals[0].to_shaped())
}
