//! Concrete values: dense tensors and tuples, plus the reference kernels
//! the interpreter executes when no trace intercepts an operation.
//!
//! # Design
//!
//! Shapes are row-major and broadcasting is *suffix* broadcasting: a
//! lower-rank operand must match the trailing dimensions of the higher-rank
//! one and is cycled across the leading axes. This is exactly the shape
//! algebra the vectorizing trace relies on — a batched operand gains one
//! leading axis and still lines up against its unbatched partner.

use std::fmt::{self, Display};

use crate::error::TraceError;
use crate::float::Float;

/// Row-major tensor shape. A scalar has the empty shape.
pub type Shape = Vec<usize>;

/// Number of elements in a shape.
pub fn size_of_shape(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Dense row-major tensor over a base float.
#[derive(Clone, Debug, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Tensor<F: Float> {
    shape: Shape,
    data: Vec<F>,
}

impl<F: Float> Tensor<F> {
    /// Build a tensor, checking that `data` fills `shape` exactly.
    pub fn new(shape: Shape, data: Vec<F>) -> Result<Self, TraceError> {
        let want = size_of_shape(&shape);
        if data.len() != want {
            return Err(TraceError::Arity {
                expected: want,
                actual: data.len(),
            });
        }
        Ok(Tensor { shape, data })
    }

    pub fn scalar(v: F) -> Self {
        Tensor {
            shape: vec![],
            data: vec![v],
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn data(&self) -> &[F] {
        &self.data
    }

    /// Extract the sole element of a rank-0 tensor.
    pub fn item(&self) -> Result<F, TraceError> {
        if self.shape.is_empty() {
            Ok(self.data[0])
        } else {
            Err(TraceError::type_error(format!(
                "expected a scalar, got shape {:?}",
                self.shape
            )))
        }
    }
}

/// A concrete runtime value: a tensor or a (possibly nested) tuple.
///
/// The empty tuple doubles as the `unit` sentinel that fills slots whose
/// payload lives elsewhere (e.g. the known side of an abstract partial
/// value).
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Value<F: Float> {
    Tensor(Tensor<F>),
    Tuple(Vec<Value<F>>),
}

impl<F: Float> Value<F> {
    /// The `unit` sentinel: the empty tuple.
    pub fn unit() -> Self {
        Value::Tuple(vec![])
    }

    pub fn scalar(v: F) -> Self {
        Value::Tensor(Tensor::scalar(v))
    }

    /// Rank-1 tensor from a slice.
    pub fn vector(vs: &[F]) -> Self {
        Value::Tensor(Tensor {
            shape: vec![vs.len()],
            data: vs.to_vec(),
        })
    }

    pub fn from_tensor(shape: Shape, data: Vec<F>) -> Result<Self, TraceError> {
        Ok(Value::Tensor(Tensor::new(shape, data)?))
    }

    /// All-zero tensor of the given shape.
    pub fn zeros(shape: &[usize]) -> Self {
        Value::Tensor(Tensor {
            shape: shape.to_vec(),
            data: vec![F::zero(); size_of_shape(shape)],
        })
    }

    /// All-one tensor of the given shape.
    pub fn ones(shape: &[usize]) -> Self {
        Value::Tensor(Tensor {
            shape: shape.to_vec(),
            data: vec![F::one(); size_of_shape(shape)],
        })
    }

    pub fn as_tensor(&self) -> Result<&Tensor<F>, TraceError> {
        match self {
            Value::Tensor(t) => Ok(t),
            Value::Tuple(_) => Err(TraceError::type_error(
                "expected a tensor, got a tuple".to_string(),
            )),
        }
    }

    pub fn shape(&self) -> Result<&Shape, TraceError> {
        Ok(self.as_tensor()?.shape())
    }

    pub fn item(&self) -> Result<F, TraceError> {
        self.as_tensor()?.item()
    }

    pub fn is_unit(&self) -> bool {
        matches!(self, Value::Tuple(vs) if vs.is_empty())
    }
}

impl<F: Float> Display for Value<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Tensor(t) => {
                if t.shape.is_empty() {
                    write!(f, "{}", t.data[0])
                } else {
                    write!(f, "tensor{:?} {:?}", t.shape, t.data)
                }
            }
            Value::Tuple(vs) => {
                write!(f, "(")?;
                for (i, v) in vs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, ")")
            }
        }
    }
}

// ── Reference kernels ──

/// Elementwise binary operation with suffix broadcasting.
///
/// The lower-rank operand's shape must equal the trailing dimensions of the
/// higher-rank operand's shape; it is cycled across the leading axes.
pub fn binop<F: Float>(
    a: &Value<F>,
    b: &Value<F>,
    name: &str,
    op: impl Fn(F, F) -> F,
) -> Result<Value<F>, TraceError> {
    let (ta, tb) = (a.as_tensor()?, b.as_tensor()?);
    let (hi, lo, flip) = if ta.rank() >= tb.rank() {
        (ta, tb, false)
    } else {
        (tb, ta, true)
    };
    let offset = hi.rank() - lo.rank();
    if hi.shape()[offset..] != lo.shape()[..] {
        return Err(TraceError::type_error(format!(
            "{name}: shapes {:?} and {:?} do not broadcast",
            ta.shape(),
            tb.shape()
        )));
    }
    let cycle = lo.data().len().max(1);
    let data = hi
        .data()
        .iter()
        .enumerate()
        .map(|(i, &x)| {
            let y = lo.data()[i % cycle];
            if flip {
                op(y, x)
            } else {
                op(x, y)
            }
        })
        .collect();
    Value::from_tensor(hi.shape().clone(), data)
}

/// Elementwise unary operation.
pub fn unop<F: Float>(a: &Value<F>, op: impl Fn(F) -> F) -> Result<Value<F>, TraceError> {
    let t = a.as_tensor()?;
    Value::from_tensor(t.shape().clone(), t.data().iter().map(|&x| op(x)).collect())
}

/// Sum over all trailing axes, keeping the first `keep` dimensions.
///
/// `keep == 0` reduces to a scalar.
pub fn sum_trailing<F: Float>(a: &Value<F>, keep: usize) -> Result<Value<F>, TraceError> {
    let t = a.as_tensor()?;
    if keep > t.rank() {
        return Err(TraceError::type_error(format!(
            "sum: cannot keep {keep} axes of a rank-{} tensor",
            t.rank()
        )));
    }
    let out_shape: Shape = t.shape()[..keep].to_vec();
    let block = size_of_shape(&t.shape()[keep..]);
    let data = t
        .data()
        .chunks(block.max(1))
        .map(|c| c.iter().fold(F::zero(), |acc, &x| acc + x))
        .collect();
    Value::from_tensor(out_shape, data)
}

/// Replicate each element across new trailing axes of shape `trailing`.
///
/// The result shape is the input shape followed by `trailing`. Inverse of
/// [`sum_trailing`] in the transpose sense.
pub fn broadcast_trailing<F: Float>(
    a: &Value<F>,
    trailing: &[usize],
) -> Result<Value<F>, TraceError> {
    let t = a.as_tensor()?;
    let reps = size_of_shape(trailing);
    let mut shape = t.shape().clone();
    shape.extend_from_slice(trailing);
    let mut data = Vec::with_capacity(t.data().len() * reps);
    for &x in t.data() {
        data.extend(std::iter::repeat(x).take(reps));
    }
    Value::from_tensor(shape, data)
}

/// Slice out index `i` along the leading axis.
pub fn slice_axis0<F: Float>(a: &Value<F>, i: usize) -> Result<Value<F>, TraceError> {
    let t = a.as_tensor()?;
    if t.rank() == 0 {
        return Err(TraceError::type_error("cannot slice a scalar".to_string()));
    }
    let n = t.shape()[0];
    if i >= n {
        return Err(TraceError::type_error(format!(
            "slice index {i} out of range for leading axis of size {n}"
        )));
    }
    let block = size_of_shape(&t.shape()[1..]);
    Value::from_tensor(
        t.shape()[1..].to_vec(),
        t.data()[i * block..(i + 1) * block].to_vec(),
    )
}

/// Stack equally-shaped values along a new leading axis.
pub fn stack_axis0<F: Float>(slices: &[Value<F>]) -> Result<Value<F>, TraceError> {
    let first = slices
        .first()
        .ok_or_else(|| TraceError::type_error("cannot stack zero values".to_string()))?
        .as_tensor()?;
    let mut shape = vec![slices.len()];
    shape.extend_from_slice(first.shape());
    let mut data = Vec::with_capacity(size_of_shape(&shape));
    for s in slices {
        let t = s.as_tensor()?;
        if t.shape() != first.shape() {
            return Err(TraceError::type_error(format!(
                "stack: mismatched slice shapes {:?} and {:?}",
                first.shape(),
                t.shape()
            )));
        }
        data.extend_from_slice(t.data());
    }
    Value::from_tensor(shape, data)
}

/// Sum over the leading axis, dropping it.
pub fn sum_axis0<F: Float>(a: &Value<F>) -> Result<Value<F>, TraceError> {
    let t = a.as_tensor()?;
    if t.rank() == 0 {
        return Err(TraceError::type_error(
            "cannot reduce the leading axis of a scalar".to_string(),
        ));
    }
    let n = t.shape()[0];
    let block = size_of_shape(&t.shape()[1..]);
    let mut data = vec![F::zero(); block];
    for i in 0..n {
        for j in 0..block {
            data[j] = data[j] + t.data()[i * block + j];
        }
    }
    Value::from_tensor(t.shape()[1..].to_vec(), data)
}

/// Maximum over the leading axis, dropping it.
pub fn max_axis0<F: Float>(a: &Value<F>) -> Result<Value<F>, TraceError> {
    let t = a.as_tensor()?;
    if t.rank() == 0 {
        return Err(TraceError::type_error(
            "cannot reduce the leading axis of a scalar".to_string(),
        ));
    }
    let n = t.shape()[0];
    if n == 0 {
        return Err(TraceError::type_error(
            "maximum over an empty leading axis".to_string(),
        ));
    }
    let block = size_of_shape(&t.shape()[1..]);
    let mut data = t.data()[..block].to_vec();
    for i in 1..n {
        for j in 0..block {
            data[j] = data[j].max(t.data()[i * block + j]);
        }
    }
    Value::from_tensor(t.shape()[1..].to_vec(), data)
}

/// Replicate a value `n` times along a new leading axis.
pub fn broadcast_leading<F: Float>(a: &Value<F>, n: usize) -> Result<Value<F>, TraceError> {
    let t = a.as_tensor()?;
    let mut shape = vec![n];
    shape.extend_from_slice(t.shape());
    let mut data = Vec::with_capacity(n * t.data().len());
    for _ in 0..n {
        data.extend_from_slice(t.data());
    }
    Value::from_tensor(shape, data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffix_broadcast_cycles_the_smaller_operand() {
        let a = Value::from_tensor(vec![2, 2], vec![1.0_f64, 2.0, 3.0, 4.0]).unwrap();
        let b = Value::vector(&[10.0_f64, 20.0]);
        let out = binop(&a, &b, "add", |x, y| x + y).unwrap();
        assert_eq!(
            out,
            Value::from_tensor(vec![2, 2], vec![11.0, 22.0, 13.0, 24.0]).unwrap()
        );
    }

    #[test]
    fn sum_and_broadcast_round_trip_shapes() {
        let a = Value::from_tensor(vec![2, 3], vec![1.0_f64; 6]).unwrap();
        let s = sum_trailing(&a, 1).unwrap();
        assert_eq!(s.shape().unwrap(), &vec![2]);
        let b = broadcast_trailing(&s, &[3]).unwrap();
        assert_eq!(b.shape().unwrap(), &vec![2, 3]);
    }

    #[test]
    fn slice_then_stack_is_identity() {
        let a = Value::from_tensor(vec![2, 2], vec![1.0_f64, 2.0, 3.0, 4.0]).unwrap();
        let rows = vec![slice_axis0(&a, 0).unwrap(), slice_axis0(&a, 1).unwrap()];
        assert_eq!(stack_axis0(&rows).unwrap(), a);
    }
}
