//! The partial-evaluation trace: stages primitive applications into
//! equation recipes and reconstructs a straight-line [`Program`] from the
//! tracer dependency graph.
//!
//! # How it works
//!
//! Each argument enters the trace with a [`PartialValue`]: known (the
//! payload rides along, opaque to this level) or abstract (shape only).
//! `process_primitive` instantiates fully-known arguments as explicit
//! constants, types the output with the primitive's abstract rule, and
//! returns a tracer whose recipe points at the staged equation. Calls and
//! mapped calls trace their callee into a bound sub-program; mapped calls
//! strip the leading axis from every input abstraction and re-add it to the
//! output.
//!
//! `tracers_to_program` walks backwards from the output tracer, topological
//! sorts by tracer id, and emits one equation per recipe — destructured
//! siblings share their equation through its id. Tracers created *before* a
//! sub-trace began (detected by an id watermark) belong to the enclosing
//! trace and surface as free variables for the caller to resolve.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use crate::aval::AbstractValue;
use crate::engine::{Engine, Fun, TraceKind};
use crate::error::TraceError;
use crate::eval::eval_program;
use crate::float::Float;
use crate::primitive::{Params, Primitive};
use crate::program::{check_program, Eqn, Program, SubProgram, Var};
use crate::pval::{merge_pvals, pack_pvals, PartialValue};
use crate::tracer::{BoundProgram, EqnRecipe, ProgramTracer, Recipe, TracedValue};

/// Everything a completed trace produces: the program, the constants it
/// captured, the free variables the caller must resolve, and the partial
/// value of the output.
pub struct TraceOutcome<F: Float> {
    pub program: Program,
    pub consts: Vec<TracedValue<F>>,
    pub env: Vec<TracedValue<F>>,
    pub out_pval: PartialValue<F>,
}

/// Trace `f` against the given input partial values and reconstruct the
/// program it stages. The partial-evaluation frame lives exactly for the
/// duration of the call; it is popped even when `f` fails.
pub fn trace_to_program<F: Float>(
    engine: &Engine<F>,
    f: &Fun<'_, F>,
    pvals: &[PartialValue<F>],
) -> Result<TraceOutcome<F>, TraceError> {
    let guard = engine.push_frame(TraceKind::PartialEval);
    let trace = ProgramTrace::new(engine, guard.level, guard.frame_id());
    trace.trace_subfun(f, pvals, false)
    // guard pops the frame here, on success and on error alike
}

/// Staged execution of `f` on concrete arguments: abstract the inputs with
/// full concrete refinement, trace, replay the program, and merge any
/// deferred parts back with the recorded partial value. Arguments that are
/// live tracers fall back to a first-class call.
pub fn compiled_call<F: Float>(
    engine: &Engine<F>,
    f: &Fun<'_, F>,
    args: &[TracedValue<F>],
) -> Result<TracedValue<F>, TraceError> {
    if args.iter().any(|a| a.level().is_some()) {
        return engine.call(f, args);
    }
    let pvals: Vec<PartialValue<F>> = args
        .iter()
        .map(|a| PartialValue::Abstract(a.aval()))
        .collect();
    let outcome = trace_to_program(engine, f, &pvals)?;
    if !outcome.env.is_empty() {
        return Err(TraceError::Escaped {
            detail: "staged function captured tracers from an enclosing trace".to_string(),
        });
    }
    let out = eval_program(engine, &outcome.program, &outcome.consts, &[], args)?;
    merge_pvals(engine, out, &outcome.out_pval)
}

/// Handle to one live partial-evaluation frame.
pub struct ProgramTrace<'e, F: Float> {
    engine: &'e Engine<F>,
    level: usize,
    frame_id: u64,
}

impl<'e, F: Float> ProgramTrace<'e, F> {
    pub(crate) fn new(engine: &'e Engine<F>, level: usize, frame_id: u64) -> Self {
        ProgramTrace {
            engine,
            level,
            frame_id,
        }
    }

    pub fn engine(&self) -> &'e Engine<F> {
        self.engine
    }

    fn tracer(&self, pval: PartialValue<F>, recipe: Recipe<F>) -> TracedValue<F> {
        if let Some(payload) = pval.known_payload() {
            debug_assert!(
                payload.level().map_or(true, |l| l < self.level),
                "known payload must live below its tracer's level"
            );
        }
        TracedValue::Program(Rc::new(ProgramTracer {
            id: self.engine.fresh_id(),
            level: self.level,
            frame_id: self.frame_id,
            pval,
            recipe,
        }))
    }

    /// Raise a value into this trace.
    fn raise(&self, val: &TracedValue<F>) -> Result<TracedValue<F>, TraceError> {
        let frame = self
            .engine
            .frame_at(self.level)
            .filter(|f| f.id == self.frame_id)
            .ok_or_else(|| TraceError::Escaped {
                detail: "partial-evaluation frame is no longer live".to_string(),
            })?;
        self.engine.full_raise(self.level, &frame, val)
    }

    /// Lift a value from below this trace: tracers of an enclosing
    /// partial-evaluation trace become free variables, everything else
    /// becomes a fully-known constant.
    pub(crate) fn lift(&self, val: TracedValue<F>) -> Result<TracedValue<F>, TraceError> {
        match &val {
            TracedValue::Program(t) if t.level < self.level => {
                Ok(self.tracer(t.pval.clone(), Recipe::FreeVar(val.clone())))
            }
            _ => Ok(self.new_const(val)),
        }
    }

    /// Wrap a value as a fully-known tracer at this level.
    pub fn new_const(&self, val: TracedValue<F>) -> TracedValue<F> {
        assert!(
            val.level().map_or(true, |l| l < self.level),
            "new_const of a tracer at or above this trace"
        );
        self.tracer(PartialValue::Known(val), Recipe::Unit)
    }

    /// Materialize a value as an explicit constant binding of the program.
    pub fn new_instantiated_const(&self, val: TracedValue<F>) -> TracedValue<F> {
        let aval = val.aval();
        self.tracer(PartialValue::Abstract(aval), Recipe::ConstVar(val))
    }

    /// A lambda binder of the program being built.
    pub fn new_arg(&self, pval: PartialValue<F>) -> TracedValue<F> {
        self.tracer(pval, Recipe::LambdaBinding)
    }

    /// Force a tracer into instantiated form: abstract tracers pass
    /// through, known tracers materialize as constant bindings, mixed
    /// tuples instantiate pointwise and re-pack.
    pub fn instantiate_const(&self, t: &TracedValue<F>) -> Result<TracedValue<F>, TraceError> {
        let pt = self.expect_own(t);
        match &pt.pval {
            PartialValue::Abstract(_) => Ok(t.clone()),
            PartialValue::Known(payload) => Ok(self.new_instantiated_const(payload.clone())),
            PartialValue::Tuple(_) => {
                let parts = self.engine.unpack(t)?;
                let inst: Vec<TracedValue<F>> = parts
                    .iter()
                    .map(|p| self.instantiate_const(&self.raise(p)?))
                    .collect::<Result<_, _>>()?;
                self.pack(&inst)
            }
        }
    }

    /// Central dispatch: consult the custom rule table, otherwise stage an
    /// equation with instantiated inputs and an abstractly-typed output.
    pub fn process_primitive(
        &self,
        prim: Primitive,
        args: &[TracedValue<F>],
        params: &Params,
    ) -> Result<TracedValue<F>, TraceError> {
        if let Some(rule) = self.engine.registry().partial_eval_rule(prim) {
            return rule(self, args, params);
        }
        let inst: Vec<TracedValue<F>> = args
            .iter()
            .map(|a| self.instantiate_const(a))
            .collect::<Result<_, _>>()?;
        let avals: Vec<AbstractValue<F>> = inst.iter().map(|t| t.aval()).collect();
        let out_aval = (self.engine.registry().abstract_eval(prim)?)(&avals, params)?;
        let eqn = Rc::new(EqnRecipe {
            eqn_id: self.engine.fresh_id(),
            prim,
            inputs: inst,
            subprograms: vec![],
            n_out: 1,
            params: params.clone(),
        });
        Ok(self.tracer(PartialValue::Abstract(out_aval), Recipe::Eqn(eqn)))
    }

    /// Stage a tuple without instantiating known components: the pack's
    /// partial value keeps them known, so a fully-known pack never costs an
    /// abstract equation at replay.
    pub fn pack(&self, args: &[TracedValue<F>]) -> Result<TracedValue<F>, TraceError> {
        let pvals: Vec<PartialValue<F>> = args.iter().map(|a| self.expect_own(a).pval.clone()).collect();
        let pval = pack_pvals(self.engine, &pvals)?;
        let eqn = Rc::new(EqnRecipe {
            eqn_id: self.engine.fresh_id(),
            prim: Primitive::Pack,
            inputs: args.to_vec(),
            subprograms: vec![],
            n_out: 1,
            params: Params::None,
        });
        Ok(self.tracer(pval, Recipe::Eqn(eqn)))
    }

    /// Destructure a tuple tracer. Children of one destructuring share a
    /// single equation and are full-lowered, so known components come back
    /// as their payloads.
    pub(crate) fn unpack_tracer(
        &self,
        t: &Rc<ProgramTracer<F>>,
    ) -> Result<Vec<TracedValue<F>>, TraceError> {
        let part_pvals: Vec<PartialValue<F>> = match &t.pval {
            PartialValue::Known(payload) => return self.engine.unpack(payload),
            PartialValue::Abstract(a) => a
                .components()?
                .into_iter()
                .map(PartialValue::Abstract)
                .collect(),
            PartialValue::Tuple(parts) => parts.clone(),
        };
        let eqn = Rc::new(EqnRecipe {
            eqn_id: self.engine.fresh_id(),
            prim: Primitive::Unpack,
            inputs: vec![TracedValue::Program(t.clone())],
            subprograms: vec![],
            n_out: part_pvals.len(),
            params: Params::None,
        });
        Ok(part_pvals
            .into_iter()
            .enumerate()
            .map(|(index, pval)| {
                self.tracer(
                    pval,
                    Recipe::Destructure {
                        index,
                        eqn: eqn.clone(),
                    },
                )
                .full_lower()
            })
            .collect())
    }

    /// Stage a first-class call: trace the callee at this same level and
    /// bind the resulting sub-program into one `Call` equation.
    pub(crate) fn process_call(
        &self,
        f: &Fun<'_, F>,
        tracers: &[TracedValue<F>],
    ) -> Result<TracedValue<F>, TraceError> {
        let in_pvals: Vec<PartialValue<F>> = tracers
            .iter()
            .map(|t| self.expect_own(t).pval.clone())
            .collect();
        let sub = self.trace_subfun(f, &in_pvals, false)?;
        let const_tracers: Vec<TracedValue<F>> = sub
            .consts
            .iter()
            .map(|c| self.new_instantiated_const(c.clone()))
            .collect();
        let env_tracers: Vec<TracedValue<F>> = sub
            .env
            .iter()
            .map(|e| self.raise(e))
            .collect::<Result<_, _>>()?;
        let eqn = Rc::new(EqnRecipe {
            eqn_id: self.engine.fresh_id(),
            prim: Primitive::Call,
            inputs: tracers.to_vec(),
            subprograms: vec![BoundProgram {
                program: Rc::new(sub.program),
                consts: const_tracers,
                freevars: env_tracers,
            }],
            n_out: 1,
            params: Params::None,
        });
        Ok(self.tracer(sub.out_pval, Recipe::Eqn(eqn)))
    }

    /// Stage a mapped call. Inputs are instantiated, their abstractions
    /// stripped of the leading axis for the callee trace, and the output
    /// abstraction gets the axis back. Captured constants hoist into the
    /// sub-program's leading (unmapped) parameters.
    pub(crate) fn process_map(
        &self,
        f: &Fun<'_, F>,
        tracers: &[TracedValue<F>],
        axis_name: &str,
        axis_size: usize,
    ) -> Result<TracedValue<F>, TraceError> {
        let inst: Vec<TracedValue<F>> = tracers
            .iter()
            .map(|t| self.instantiate_const(t))
            .collect::<Result<_, _>>()?;
        let reduced_pvals: Vec<PartialValue<F>> = inst
            .iter()
            .map(|t| {
                Ok(PartialValue::Abstract(
                    self.expect_own(t).pval.as_abstract()?.to_shaped().remove_axis()?,
                ))
            })
            .collect::<Result<_, _>>()?;
        let sub = self.trace_subfun(f, &reduced_pvals, true)?;
        let const_tracers: Vec<TracedValue<F>> = sub
            .consts
            .iter()
            .map(|c| self.new_instantiated_const(c.clone()))
            .collect();
        let env_tracers: Vec<TracedValue<F>> = sub
            .env
            .iter()
            .map(|e| self.raise(e))
            .collect::<Result<_, _>>()?;

        // hoist constants into leading unmapped parameters
        let mut program = sub.program;
        let mut invars = std::mem::take(&mut program.constvars);
        invars.extend(program.invars.drain(..));
        program.invars = invars;

        let num_consts = const_tracers.len();
        let mut inputs = const_tracers;
        inputs.extend(inst);
        let out_pval = sub.out_pval.add_axis(axis_size)?;
        let eqn = Rc::new(EqnRecipe {
            eqn_id: self.engine.fresh_id(),
            prim: Primitive::Map,
            inputs,
            subprograms: vec![BoundProgram {
                program: Rc::new(program),
                consts: vec![],
                freevars: env_tracers,
            }],
            n_out: 1,
            params: Params::Map {
                axis_name: axis_name.to_string(),
                axis_size,
                num_consts,
            },
        });
        Ok(self.tracer(out_pval, Recipe::Eqn(eqn)))
    }

    /// Trace `f` at this level against fresh lambda binders and finalize
    /// the program it stages. `instantiate_out` forces a known output to
    /// materialize (mapped calls need every output to carry the axis).
    pub(crate) fn trace_subfun(
        &self,
        f: &Fun<'_, F>,
        pvals: &[PartialValue<F>],
        instantiate_out: bool,
    ) -> Result<TraceOutcome<F>, TraceError> {
        let watermark = self.engine.id_watermark();
        let in_tracers: Vec<TracedValue<F>> =
            pvals.iter().map(|pv| self.new_arg(pv.clone())).collect();
        let out = f(self.engine, &in_tracers)?;
        let mut out_t = self.raise(&out)?;
        if instantiate_out {
            out_t = self.instantiate_const(&out_t)?;
        }
        let out_pval = self.expect_own(&out_t).pval.clone();
        let (program, consts, env) = tracers_to_program(&in_tracers, &out_t, watermark)?;
        Ok(TraceOutcome {
            program,
            consts,
            env,
            out_pval,
        })
    }

    fn expect_own(&self, t: &TracedValue<F>) -> Rc<ProgramTracer<F>> {
        match t {
            TracedValue::Program(pt) if pt.level == self.level && pt.frame_id == self.frame_id => {
                pt.clone()
            }
            other => panic!("value {other} was not raised into this trace"),
        }
    }
}

// ── Program reconstruction ──

mod partial_eval_program {
    use super::*;

    struct Namer {
        names: HashMap<u64, Var>,
        next: u32,
    }

    impl Namer {
        fn new() -> Self {
            Namer {
                names: HashMap::new(),
                next: 0,
            }
        }

        fn fresh(&mut self) -> Var {
            let v = Var(self.next);
            self.next += 1;
            v
        }

        fn var(&mut self, id: u64) -> Var {
            if let Some(&v) = self.names.get(&id) {
                return v;
            }
            let v = self.fresh();
            self.names.insert(id, v);
            v
        }

        fn alias(&mut self, id: u64, v: Var) {
            self.names.insert(id, v);
        }
    }

    /// Reconstruct a [`Program`] from the recipe graph hanging off
    /// `out_tracer`. Returns the program together with the captured
    /// constant values and the free-variable values, aligned with
    /// `program.constvars` and `program.freevars`.
    pub(crate) fn tracers_to_program<F: Float>(
        in_tracers: &[TracedValue<F>],
        out_tracer: &TracedValue<F>,
        watermark: u64,
    ) -> Result<(Program, Vec<TracedValue<F>>, Vec<TracedValue<F>>), TraceError> {
        let in_set: HashSet<u64> = in_tracers.iter().filter_map(|t| t.id()).collect();
        let out = expect_program(out_tracer);

        let mut order: Vec<Rc<ProgramTracer<F>>> = Vec::new();
        let mut seen: HashSet<u64> = HashSet::new();
        visit(&out, &in_set, watermark, &mut seen, &mut order);

        let mut namer = Namer::new();
        for t in in_tracers {
            namer.var(expect_program(t).id);
        }

        let mut eqns: Vec<Eqn> = Vec::new();
        let mut consts: Vec<(Var, TracedValue<F>)> = Vec::new();
        let mut env: Vec<(Var, TracedValue<F>)> = Vec::new();
        let mut destructured: HashMap<u64, Vec<Var>> = HashMap::new();

        for t in &order {
            // tracers minted before this trace began belong to the caller
            if t.id < watermark && !in_set.contains(&t.id) {
                let v = namer.var(t.id);
                env.push((v, TracedValue::Program(t.clone())));
                continue;
            }
            match &t.recipe {
                Recipe::Eqn(e) => {
                    let outv = namer.var(t.id);
                    eqns.push(convert_eqn(e, vec![outv], &mut namer));
                }
                Recipe::LambdaBinding => {
                    if !in_set.contains(&t.id) {
                        return Err(TraceError::Escaped {
                            detail: "lambda binder reached from a different trace".to_string(),
                        });
                    }
                }
                Recipe::FreeVar(val) => env.push((namer.var(t.id), val.clone())),
                Recipe::ConstVar(val) => consts.push((namer.var(t.id), val.clone())),
                Recipe::Destructure { index, eqn } => {
                    let outvars = match destructured.get(&eqn.eqn_id) {
                        Some(vs) => vs.clone(),
                        None => {
                            let vs: Vec<Var> = (0..eqn.n_out).map(|_| namer.fresh()).collect();
                            eqns.push(convert_eqn(eqn, vs.clone(), &mut namer));
                            destructured.insert(eqn.eqn_id, vs.clone());
                            vs
                        }
                    };
                    namer.alias(t.id, outvars[*index]);
                }
                Recipe::Unit => namer.alias(t.id, Var::UNIT),
            }
        }

        let program = Program {
            constvars: consts.iter().map(|(v, _)| *v).collect(),
            freevars: env.iter().map(|(v, _)| *v).collect(),
            invars: in_tracers
                .iter()
                .map(|t| namer.var(expect_program(t).id))
                .collect(),
            outvar: namer.var(out.id),
            eqns,
        };
        check_program(&program)?;
        Ok((
            program,
            consts.into_iter().map(|(_, v)| v).collect(),
            env.into_iter().map(|(_, v)| v).collect(),
        ))
    }

    /// Depth-first postorder over recipe parents: parents land before their
    /// dependents, giving a topological order. Traversal stops at trace
    /// boundaries (tracers older than the watermark).
    fn visit<F: Float>(
        t: &Rc<ProgramTracer<F>>,
        in_set: &HashSet<u64>,
        watermark: u64,
        seen: &mut HashSet<u64>,
        order: &mut Vec<Rc<ProgramTracer<F>>>,
    ) {
        if !seen.insert(t.id) {
            return;
        }
        let boundary = t.id < watermark && !in_set.contains(&t.id);
        if !boundary {
            let eqn = match &t.recipe {
                Recipe::Eqn(e) => Some(e),
                Recipe::Destructure { eqn, .. } => Some(eqn),
                _ => None,
            };
            if let Some(e) = eqn {
                for parent in e.parents() {
                    if let TracedValue::Program(pt) = parent {
                        visit(pt, in_set, watermark, seen, order);
                    }
                }
            }
        }
        order.push(t.clone());
    }

    fn convert_eqn<F: Float>(e: &EqnRecipe<F>, outvars: Vec<Var>, namer: &mut Namer) -> Eqn {
        let var_of = |t: &TracedValue<F>, namer: &mut Namer| namer.var(expect_program(t).id);
        let invars = e
            .inputs
            .iter()
            .map(|t| var_of(t, namer))
            .collect::<Vec<_>>();
        let subprograms = e
            .subprograms
            .iter()
            .map(|b| SubProgram {
                program: Box::new((*b.program).clone()),
                consts: b.consts.iter().map(|t| var_of(t, namer)).collect(),
                freevars: b.freevars.iter().map(|t| var_of(t, namer)).collect(),
            })
            .collect();
        Eqn {
            prim: e.prim,
            invars,
            outvars,
            subprograms,
            params: e.params.clone(),
        }
    }

    fn expect_program<F: Float>(t: &TracedValue<F>) -> Rc<ProgramTracer<F>> {
        match t {
            TracedValue::Program(pt) => pt.clone(),
            other => panic!("expected a partial-evaluation tracer, got {other}"),
        }
    }
}

pub(crate) use partial_eval_program::tracers_to_program;
