//! The trace engine: an explicit stack of interpreter frames plus the rule
//! registry, with `bind` as the single dispatch point every primitive
//! application funnels through.
//!
//! # How it works
//!
//! Transformations push a frame onto the stack for the duration of a traced
//! call; the returned [`FrameGuard`] pops it on drop, so the stack stays
//! balanced even when a traced function fails mid-body. Frames are strictly
//! LIFO and popping out of order is a bug, not an error.
//!
//! `bind` does not dispatch to the top of the stack. It finds the
//! highest-level tracer among the *arguments*, raises every other argument
//! to that frame, and hands the operation to that frame's interpreter.
//! Fully concrete arguments short-circuit to the registry's concrete rule.
//! The result is full-lowered on the way out so tracer nesting never grows
//! deeper than the information it carries.

use std::cell::{Cell, RefCell};

use crate::batch;
use crate::error::TraceError;
use crate::float::Float;
use crate::jvp;
use crate::partial_eval::ProgramTrace;
use crate::primitive::{Params, Primitive};
use crate::registry::Registry;
use crate::tracer::TracedValue;
use crate::value::Value;

/// A traceable function: the shape every transformation accepts.
pub type Fun<'f, F> =
    dyn Fn(&Engine<F>, &[TracedValue<F>]) -> Result<TracedValue<F>, TraceError> + 'f;

/// What kind of interpreter a frame runs.
#[derive(Clone, Debug)]
pub enum TraceKind {
    PartialEval,
    Jvp,
    Batch {
        axis_size: usize,
        axis_name: Option<String>,
    },
}

/// One live interpreter frame.
#[derive(Clone, Debug)]
pub struct Frame {
    pub id: u64,
    pub kind: TraceKind,
}

/// The trace engine. Owns the rule registry, the frame stack, and the id
/// counter that names tracers and equations.
pub struct Engine<F: Float> {
    registry: Registry<F>,
    frames: RefCell<Vec<Frame>>,
    next_id: Cell<u64>,
}

impl<F: Float> Default for Engine<F> {
    fn default() -> Self {
        Engine::new(Registry::default())
    }
}

impl<F: Float> Engine<F> {
    pub fn new(registry: Registry<F>) -> Self {
        Engine {
            registry,
            frames: RefCell::new(Vec::new()),
            next_id: Cell::new(0),
        }
    }

    pub fn registry(&self) -> &Registry<F> {
        &self.registry
    }

    /// Current depth of the frame stack.
    pub fn trace_depth(&self) -> usize {
        self.frames.borrow().len()
    }

    pub(crate) fn fresh_id(&self) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }

    /// Watermark for distinguishing tracers created before a sub-trace
    /// began from those it created itself.
    pub(crate) fn id_watermark(&self) -> u64 {
        self.next_id.get()
    }

    /// Push an interpreter frame. The frame lives until the guard drops.
    pub fn push_frame(&self, kind: TraceKind) -> FrameGuard<'_, F> {
        let id = self.fresh_id();
        let mut frames = self.frames.borrow_mut();
        frames.push(Frame { id, kind });
        FrameGuard {
            engine: self,
            id,
            level: frames.len(),
        }
    }

    /// The live frame at `level` (1-based), if any.
    pub fn frame_at(&self, level: usize) -> Option<Frame> {
        self.frames.borrow().get(level.checked_sub(1)?).cloned()
    }

    /// The highest-level frame among the argument tracers, validated
    /// against the live stack.
    fn top_frame_of(&self, args: &[TracedValue<F>]) -> Result<Option<(usize, Frame)>, TraceError> {
        let mut top: Option<usize> = None;
        for arg in args {
            let (level, frame_id) = match (arg.level(), arg.frame_id()) {
                (Some(l), Some(fid)) => (l, fid),
                _ => continue,
            };
            match self.frame_at(level) {
                Some(frame) if frame.id == frame_id => {}
                _ => {
                    return Err(TraceError::Escaped {
                        detail: format!("tracer {arg} outlived its trace (level {level})"),
                    })
                }
            }
            top = Some(top.map_or(level, |t| t.max(level)));
        }
        match top {
            None => Ok(None),
            Some(level) => {
                let frame = self
                    .frame_at(level)
                    .unwrap_or_else(|| panic!("validated frame vanished"));
                Ok(Some((level, frame)))
            }
        }
    }

    /// Produce a tracer belonging exactly to the frame at `level` from a
    /// value at or below that level. Raising a tracer the frame already
    /// owns returns it unchanged, so raising is idempotent; full-lowering
    /// a freshly raised constant gives the constant back.
    pub fn full_raise(
        &self,
        level: usize,
        frame: &Frame,
        val: &TracedValue<F>,
    ) -> Result<TracedValue<F>, TraceError> {
        match val.level() {
            Some(l) if l == level => {
                if val.frame_id() == Some(frame.id) {
                    Ok(val.clone())
                } else {
                    Err(TraceError::Escaped {
                        detail: format!("tracer {val} belongs to a dead frame at level {level}"),
                    })
                }
            }
            Some(l) if l > level => Err(TraceError::Escaped {
                detail: format!("tracer {val} from level {l} cannot enter a trace at level {level}"),
            }),
            // concrete values and tracers from enclosing traces lift in
            _ => match &frame.kind {
                TraceKind::PartialEval => {
                    ProgramTrace::new(self, level, frame.id).lift(val.clone())
                }
                TraceKind::Jvp => jvp::lift(self, level, frame.id, val.clone()),
                TraceKind::Batch { .. } => Ok(batch::lift(self, level, frame.id, val.clone())),
            },
        }
    }

    /// Apply a primitive. The single entry point all operations go through.
    pub fn bind(
        &self,
        prim: Primitive,
        args: &[TracedValue<F>],
        params: &Params,
    ) -> Result<TracedValue<F>, TraceError> {
        match self.top_frame_of(args)? {
            None => {
                let vals: Vec<Value<F>> = args
                    .iter()
                    .map(|a| {
                        a.as_concrete()
                            .cloned()
                            .unwrap_or_else(|| panic!("level-less tracer"))
                    })
                    .collect();
                let rule = self.registry.impl_rule(prim)?;
                Ok(TracedValue::Concrete(rule(&vals, params)?))
            }
            Some((level, frame)) => {
                let raised: Vec<TracedValue<F>> = args
                    .iter()
                    .map(|a| self.full_raise(level, &frame, a))
                    .collect::<Result<_, _>>()?;
                let out = match &frame.kind {
                    TraceKind::PartialEval => ProgramTrace::new(self, level, frame.id)
                        .process_primitive(prim, &raised, params)?,
                    TraceKind::Jvp => {
                        jvp::process_primitive(self, level, frame.id, prim, &raised, params)?
                    }
                    TraceKind::Batch {
                        axis_size,
                        axis_name,
                    } => batch::process_primitive(
                        self,
                        level,
                        frame.id,
                        *axis_size,
                        axis_name.as_deref(),
                        prim,
                        &raised,
                        params,
                    )?,
                };
                Ok(out.full_lower())
            }
        }
    }

    /// Apply a function as a first-class call.
    ///
    /// Concrete arguments run the function directly; a partial-evaluation
    /// trace stages a `Call` equation with a bound sub-program; forward-mode
    /// and vectorized traces inline the call.
    pub fn call(&self, f: &Fun<'_, F>, args: &[TracedValue<F>]) -> Result<TracedValue<F>, TraceError> {
        let out = match self.top_frame_of(args)? {
            None => f(self, args)?,
            Some((level, frame)) => match &frame.kind {
                TraceKind::PartialEval => {
                    let raised: Vec<TracedValue<F>> = args
                        .iter()
                        .map(|a| self.full_raise(level, &frame, a))
                        .collect::<Result<_, _>>()?;
                    ProgramTrace::new(self, level, frame.id).process_call(f, &raised)?
                }
                TraceKind::Jvp | TraceKind::Batch { .. } => f(self, args)?,
            },
        };
        Ok(out.full_lower())
    }

    /// Apply a function mapped over the leading axis of every argument,
    /// binding `axis_name` for collectives inside the body.
    pub fn map(
        &self,
        f: &Fun<'_, F>,
        args: &[TracedValue<F>],
        axis_name: &str,
    ) -> Result<TracedValue<F>, TraceError> {
        let axis_size = mapped_axis_size(args)?;
        let out = match self.top_frame_of(args)? {
            None => batch::batch_call(
                self,
                f,
                args,
                &vec![Some(0); args.len()],
                axis_size,
                Some(axis_name.to_string()),
            )?,
            Some((level, frame)) => match &frame.kind {
                TraceKind::PartialEval => {
                    let raised: Vec<TracedValue<F>> = args
                        .iter()
                        .map(|a| self.full_raise(level, &frame, a))
                        .collect::<Result<_, _>>()?;
                    ProgramTrace::new(self, level, frame.id)
                        .process_map(f, &raised, axis_name, axis_size)?
                }
                TraceKind::Jvp | TraceKind::Batch { .. } => {
                    return Err(TraceError::Unsupported {
                        detail: "mapped calls cannot be traced through forward-mode or \
                                 vectorized interpreters"
                            .to_string(),
                    })
                }
            },
        };
        Ok(out.full_lower())
    }

    /// Destructure a tuple-valued traced value into its components.
    pub fn unpack(&self, val: &TracedValue<F>) -> Result<Vec<TracedValue<F>>, TraceError> {
        match val {
            TracedValue::Concrete(Value::Tuple(vs)) => {
                Ok(vs.iter().cloned().map(TracedValue::Concrete).collect())
            }
            TracedValue::Concrete(v) => Err(TraceError::type_error(format!(
                "cannot unpack non-tuple value {v}"
            ))),
            TracedValue::Program(t) => {
                ProgramTrace::new(self, t.level, t.frame_id).unpack_tracer(t)
            }
            TracedValue::Jvp(t) => {
                let primals = self.unpack(&t.primal)?;
                let tangents = self.unpack(&t.tangent)?;
                if primals.len() != tangents.len() {
                    return Err(TraceError::Arity {
                        expected: primals.len(),
                        actual: tangents.len(),
                    });
                }
                Ok(primals
                    .into_iter()
                    .zip(tangents)
                    .map(|(p, tg)| jvp::tracer(self, t.level, t.frame_id, p, tg))
                    .collect())
            }
            TracedValue::Batch(t) => {
                let parts = self.unpack(&t.val)?;
                Ok(parts
                    .into_iter()
                    .map(|p| batch::tracer(self, t.level, t.frame_id, p, t.dim))
                    .collect())
            }
        }
    }

    // ── Convenience operations ──

    pub fn constant(&self, v: Value<F>) -> TracedValue<F> {
        TracedValue::Concrete(v)
    }

    pub fn scalar(&self, v: F) -> TracedValue<F> {
        TracedValue::scalar(v)
    }

    pub fn add(&self, a: &TracedValue<F>, b: &TracedValue<F>) -> Result<TracedValue<F>, TraceError> {
        self.bind(Primitive::Add, &[a.clone(), b.clone()], &Params::None)
    }

    pub fn sub(&self, a: &TracedValue<F>, b: &TracedValue<F>) -> Result<TracedValue<F>, TraceError> {
        self.bind(Primitive::Sub, &[a.clone(), b.clone()], &Params::None)
    }

    pub fn mul(&self, a: &TracedValue<F>, b: &TracedValue<F>) -> Result<TracedValue<F>, TraceError> {
        self.bind(Primitive::Mul, &[a.clone(), b.clone()], &Params::None)
    }

    pub fn div(&self, a: &TracedValue<F>, b: &TracedValue<F>) -> Result<TracedValue<F>, TraceError> {
        self.bind(Primitive::Div, &[a.clone(), b.clone()], &Params::None)
    }

    pub fn neg(&self, a: &TracedValue<F>) -> Result<TracedValue<F>, TraceError> {
        self.bind(Primitive::Neg, &[a.clone()], &Params::None)
    }

    pub fn sin(&self, a: &TracedValue<F>) -> Result<TracedValue<F>, TraceError> {
        self.bind(Primitive::Sin, &[a.clone()], &Params::None)
    }

    pub fn cos(&self, a: &TracedValue<F>) -> Result<TracedValue<F>, TraceError> {
        self.bind(Primitive::Cos, &[a.clone()], &Params::None)
    }

    pub fn exp(&self, a: &TracedValue<F>) -> Result<TracedValue<F>, TraceError> {
        self.bind(Primitive::Exp, &[a.clone()], &Params::None)
    }

    pub fn log(&self, a: &TracedValue<F>) -> Result<TracedValue<F>, TraceError> {
        self.bind(Primitive::Log, &[a.clone()], &Params::None)
    }

    pub fn sqrt(&self, a: &TracedValue<F>) -> Result<TracedValue<F>, TraceError> {
        self.bind(Primitive::Sqrt, &[a.clone()], &Params::None)
    }

    /// Sum over all trailing axes, keeping the first `keep` dimensions.
    pub fn sum(&self, a: &TracedValue<F>, keep: usize) -> Result<TracedValue<F>, TraceError> {
        let input_shape = a.aval().shape()?;
        self.bind(
            Primitive::Sum,
            &[a.clone()],
            &Params::Sum { input_shape, keep },
        )
    }

    /// Sum every element down to a scalar.
    pub fn sum_all(&self, a: &TracedValue<F>) -> Result<TracedValue<F>, TraceError> {
        self.sum(a, 0)
    }

    /// Replicate across new trailing axes.
    pub fn broadcast(
        &self,
        a: &TracedValue<F>,
        trailing: &[usize],
    ) -> Result<TracedValue<F>, TraceError> {
        self.bind(
            Primitive::Broadcast,
            &[a.clone()],
            &Params::Broadcast {
                trailing: trailing.to_vec(),
            },
        )
    }

    pub fn pack(&self, vals: &[TracedValue<F>]) -> Result<TracedValue<F>, TraceError> {
        self.bind(Primitive::Pack, vals, &Params::None)
    }

    /// Sum over the mapped axis bound to `axis_name` by an enclosing map.
    pub fn psum(&self, a: &TracedValue<F>, axis_name: &str) -> Result<TracedValue<F>, TraceError> {
        self.bind(
            Primitive::Psum,
            &[a.clone()],
            &Params::Collective {
                axis_name: axis_name.to_string(),
            },
        )
    }

    /// Maximum over the mapped axis bound to `axis_name` by an enclosing map.
    pub fn pmax(&self, a: &TracedValue<F>, axis_name: &str) -> Result<TracedValue<F>, TraceError> {
        self.bind(
            Primitive::Pmax,
            &[a.clone()],
            &Params::Collective {
                axis_name: axis_name.to_string(),
            },
        )
    }
}

/// The common leading-axis size of mapped arguments.
pub(crate) fn mapped_axis_size<F: Float>(args: &[TracedValue<F>]) -> Result<usize, TraceError> {
    let mut size = None;
    for arg in args {
        let shape = arg.aval().shape()?;
        let n = *shape.first().ok_or_else(|| {
            TraceError::type_error("mapped arguments need a leading axis".to_string())
        })?;
        match size {
            None => size = Some(n),
            Some(m) if m == n => {}
            Some(m) => {
                return Err(TraceError::type_error(format!(
                    "mapped arguments disagree on leading axis: {m} vs {n}"
                )))
            }
        }
    }
    size.ok_or_else(|| TraceError::type_error("map of zero arguments".to_string()))
}

/// RAII guard keeping one interpreter frame alive. Pops the frame on drop
/// and panics if frames were popped out of order.
pub struct FrameGuard<'e, F: Float> {
    engine: &'e Engine<F>,
    id: u64,
    pub(crate) level: usize,
}

impl<F: Float> FrameGuard<'_, F> {
    pub(crate) fn frame_id(&self) -> u64 {
        self.id
    }

    /// Stack level of the guarded frame (1-based).
    pub fn level(&self) -> usize {
        self.level
    }
}

impl<F: Float> Drop for FrameGuard<'_, F> {
    fn drop(&mut self) {
        let popped = self.engine.frames.borrow_mut().pop();
        match popped {
            Some(frame) if frame.id == self.id => {}
            _ => panic!("trace frames popped out of order"),
        }
    }
}
