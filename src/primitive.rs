//! The closed set of primitive operations the engine understands.

use crate::value::Shape;

/// Primitive operations.
///
/// Every traced computation bottoms out in these. `Call` and `Map` carry a
/// bound sub-program instead of rule-table entries; `Unpack` is the
/// destructuring primitive and is the only one with multiple outputs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Primitive {
    // ── Elementwise arithmetic ──
    Add,
    Sub,
    Mul,
    Div,
    Neg,

    // ── Elementwise transcendentals ──
    Sin,
    Cos,
    Exp,
    Log,
    Sqrt,

    // ── Shape movement ──
    Sum,
    Broadcast,

    // ── Structure ──
    Pack,
    Unpack,

    // ── Calls and collectives ──
    Call,
    Map,
    Psum,
    Pmax,
}

impl Primitive {
    /// Lowercase name used by the program pretty-printer.
    pub fn name(&self) -> &'static str {
        match self {
            Primitive::Add => "add",
            Primitive::Sub => "sub",
            Primitive::Mul => "mul",
            Primitive::Div => "div",
            Primitive::Neg => "neg",
            Primitive::Sin => "sin",
            Primitive::Cos => "cos",
            Primitive::Exp => "exp",
            Primitive::Log => "log",
            Primitive::Sqrt => "sqrt",
            Primitive::Sum => "sum",
            Primitive::Broadcast => "broadcast",
            Primitive::Pack => "pack",
            Primitive::Unpack => "unpack",
            Primitive::Call => "call",
            Primitive::Map => "map",
            Primitive::Psum => "psum",
            Primitive::Pmax => "pmax",
        }
    }

    /// Collectives reduce over a named mapped axis rather than their
    /// operand's own axes.
    pub fn is_collective(&self) -> bool {
        matches!(self, Primitive::Psum | Primitive::Pmax)
    }
}

/// Static parameters attached to an equation alongside its primitive.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Params {
    None,
    /// Sum over all trailing axes, keeping the first `keep`.
    /// `input_shape` is recorded so the transpose knows what to rebuild.
    Sum { input_shape: Shape, keep: usize },
    /// Replicate across new trailing axes of shape `trailing`.
    Broadcast { trailing: Shape },
    /// Reduce over the named mapped axis (`Psum`, `Pmax`).
    Collective { axis_name: String },
    /// A mapped call. The first `num_consts` inputs are unmapped constants
    /// hoisted out of the sub-program; the rest carry the mapped axis.
    Map {
        axis_name: String,
        axis_size: usize,
        num_consts: usize,
    },
}
