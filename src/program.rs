//! Finalized straight-line programs: the output of a partial-evaluation
//! trace, replayable by [`eval_program`](crate::eval::eval_program).
//!
//! A program binds four kinds of variables:
//!
//! - `constvars` — values captured from the trace (closure constants,
//!   instantiated known inputs),
//! - `freevars`  — values owned by an *enclosing* trace, resolved by the
//!   caller at replay time,
//! - `invars`    — the lambda binders,
//! - equation outputs, in topological order.
//!
//! Variables print in base-26 (`a`, `b`, …, `aa`), in creation order.

use std::collections::HashSet;
use std::fmt::{self, Display};

use crate::error::TraceError;
use crate::primitive::{Params, Primitive};

/// A program variable. The reserved [`Var::UNIT`] names the unit sentinel
/// and is implicitly bound in every program.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Var(pub u32);

impl Var {
    pub const UNIT: Var = Var(u32::MAX);
}

impl Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Var::UNIT {
            return write!(f, "*");
        }
        let mut rem = self.0;
        let mut s = Vec::new();
        loop {
            s.push(b'a' + (rem % 26) as u8);
            rem /= 26;
            if rem == 0 {
                break;
            }
        }
        s.reverse();
        write!(f, "{}", std::str::from_utf8(&s).expect("base-26 name"))
    }
}

/// A sub-program bound inside a `Call` or `Map` equation, with the outer
/// variables that feed its constants and free variables.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SubProgram {
    pub program: Box<Program>,
    pub consts: Vec<Var>,
    pub freevars: Vec<Var>,
}

/// One primitive application. `outvars` has one entry except for
/// [`Primitive::Unpack`], which destructures into several.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Eqn {
    pub prim: Primitive,
    pub invars: Vec<Var>,
    pub outvars: Vec<Var>,
    pub subprograms: Vec<SubProgram>,
    pub params: Params,
}

/// A topologically ordered straight-line program.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Program {
    pub constvars: Vec<Var>,
    pub freevars: Vec<Var>,
    pub invars: Vec<Var>,
    pub outvar: Var,
    pub eqns: Vec<Eqn>,
}

/// Validate that every variable is bound before it is read and that no
/// variable is bound twice.
pub fn check_program(program: &Program) -> Result<(), TraceError> {
    let mut bound: HashSet<Var> = HashSet::new();
    bound.insert(Var::UNIT);

    let mut bind = |v: Var, bound: &mut HashSet<Var>| -> Result<(), TraceError> {
        if !bound.insert(v) {
            return Err(TraceError::type_error(format!(
                "variable {v} bound more than once"
            )));
        }
        Ok(())
    };

    for &v in program
        .constvars
        .iter()
        .chain(&program.freevars)
        .chain(&program.invars)
    {
        bind(v, &mut bound)?;
    }

    for eqn in &program.eqns {
        for v in eqn
            .invars
            .iter()
            .chain(eqn.subprograms.iter().flat_map(|s| &s.consts))
            .chain(eqn.subprograms.iter().flat_map(|s| &s.freevars))
        {
            if !bound.contains(v) {
                return Err(TraceError::type_error(format!(
                    "variable {v} read before it is bound"
                )));
            }
        }
        for sub in &eqn.subprograms {
            check_program(&sub.program)?;
        }
        for &v in &eqn.outvars {
            bind(v, &mut bound)?;
        }
    }

    if !bound.contains(&program.outvar) {
        return Err(TraceError::type_error(format!(
            "output variable {} is never bound",
            program.outvar
        )));
    }
    Ok(())
}

impl Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = |vs: &[Var]| {
            vs.iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(" ")
        };
        writeln!(
            f,
            "{{ lambda {} ; {} ; {} .",
            names(&self.constvars),
            names(&self.freevars),
            names(&self.invars)
        )?;
        for (i, eqn) in self.eqns.iter().enumerate() {
            let lead = if i == 0 { "  let " } else { "      " };
            writeln!(
                f,
                "{lead}{} = {} {}",
                names(&eqn.outvars),
                eqn.prim.name(),
                names(&eqn.invars)
            )?;
        }
        write!(f, "  in {} }}", self.outvar)
    }
}
