//! Concrete values and the abstract types that describe them.
//!
//! The engine treats the numeric library as external: the only structure it
//! relies on is "an array has a shape and a dtype" and "values nest into
//! tuples". [`ArrayValue`] is the minimal host-side array carrier used by
//! impl rules, and [`Aval`] is the shape/dtype metadata that abstract
//! evaluation manipulates.

use std::fmt;
use std::sync::Arc;

use crate::{DType, Error, Result};

/// Abstract type of a value: shape and dtype without contents.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Aval {
    /// An array of a fixed shape and element type.
    Shaped { shape: Vec<usize>, dtype: DType },
    /// A (possibly empty) tuple of abstract types.
    Tuple(Vec<Aval>),
}

impl Aval {
    /// A rank-0 array of the given dtype.
    pub fn scalar(dtype: DType) -> Self {
        Aval::Shaped {
            shape: Vec::new(),
            dtype,
        }
    }

    /// The empty tuple, used as the type of "nothing of interest".
    pub fn unit() -> Self {
        Aval::Tuple(Vec::new())
    }

    pub fn is_tuple(&self) -> bool {
        matches!(self, Aval::Tuple(_))
    }

    /// Least upper bound of two abstract types.
    ///
    /// Arrays of equal shape join by dtype promotion; there is no meaningful
    /// join across different shapes or across array/tuple kinds, so those
    /// disagreements surface as a [`Error::ShapeMismatch`].
    pub fn join(&self, other: &Aval) -> Result<Aval> {
        match (self, other) {
            (
                Aval::Shaped { shape: s1, dtype: d1 },
                Aval::Shaped { shape: s2, dtype: d2 },
            ) => {
                if s1 != s2 {
                    return Err(Error::ShapeMismatch {
                        op: "join",
                        lhs: self.to_string(),
                        rhs: other.to_string(),
                    });
                }
                Ok(Aval::Shaped {
                    shape: s1.clone(),
                    dtype: d1.join(*d2),
                })
            }
            (Aval::Tuple(a), Aval::Tuple(b)) if a.len() == b.len() => {
                let parts = a
                    .iter()
                    .zip(b.iter())
                    .map(|(x, y)| x.join(y))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Aval::Tuple(parts))
            }
            _ => Err(Error::ShapeMismatch {
                op: "join",
                lhs: self.to_string(),
                rhs: other.to_string(),
            }),
        }
    }

    /// Remove the leading axis, as mapped-call bodies see their inputs.
    pub fn strip_leading_axis(&self) -> Result<Aval> {
        match self {
            Aval::Shaped { shape, dtype } => {
                if shape.is_empty() {
                    return Err(Error::ShapeMismatch {
                        op: "strip_leading_axis",
                        lhs: self.to_string(),
                        rhs: "rank >= 1".to_string(),
                    });
                }
                Ok(Aval::Shaped {
                    shape: shape[1..].to_vec(),
                    dtype: *dtype,
                })
            }
            Aval::Tuple(parts) => Ok(Aval::Tuple(
                parts
                    .iter()
                    .map(|a| a.strip_leading_axis())
                    .collect::<Result<Vec<_>>>()?,
            )),
        }
    }

    /// Prepend an axis of the given size, the inverse of
    /// [`Aval::strip_leading_axis`].
    pub fn with_leading_axis(&self, size: usize) -> Aval {
        match self {
            Aval::Shaped { shape, dtype } => {
                let mut s = Vec::with_capacity(shape.len() + 1);
                s.push(size);
                s.extend_from_slice(shape);
                Aval::Shaped {
                    shape: s,
                    dtype: *dtype,
                }
            }
            Aval::Tuple(parts) => Aval::Tuple(
                parts.iter().map(|a| a.with_leading_axis(size)).collect(),
            ),
        }
    }
}

impl fmt::Display for Aval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Aval::Shaped { shape, dtype } => {
                write!(f, "{dtype}[")?;
                for (i, d) in shape.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{d}")?;
                }
                write!(f, "]")
            }
            Aval::Tuple(parts) => {
                write!(f, "(")?;
                for (i, a) in parts.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{a}")?;
                }
                write!(f, ")")
            }
        }
    }
}

/// An immutable host array with shared storage.
///
/// Contents are held as `f64` regardless of the dtype tag; impl rules in the
/// primitive catalog interpret the buffer however they see fit. Cloning is
/// cheap.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayValue {
    dtype: DType,
    shape: Vec<usize>,
    data: Arc<Vec<f64>>,
}

impl ArrayValue {
    /// Build an array, checking that the buffer length matches the shape.
    pub fn new(dtype: DType, shape: Vec<usize>, data: Vec<f64>) -> Result<Self> {
        let want: usize = shape.iter().product();
        if data.len() != want {
            return Err(Error::msg(format!(
                "array of shape {shape:?} needs {want} elements, got {}",
                data.len()
            )));
        }
        Ok(Self {
            dtype,
            shape,
            data: Arc::new(data),
        })
    }

    /// A rank-0 array holding one element.
    pub fn scalar(x: f64, dtype: DType) -> Self {
        Self {
            dtype,
            shape: Vec::new(),
            data: Arc::new(vec![x]),
        }
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn aval(&self) -> Aval {
        Aval::Shaped {
            shape: self.shape.clone(),
            dtype: self.dtype,
        }
    }

    /// The single element of a rank-0 array.
    pub fn as_scalar(&self) -> Result<f64> {
        if !self.shape.is_empty() {
            return Err(Error::msg(format!(
                "expected a scalar, got shape {:?}",
                self.shape
            )));
        }
        Ok(self.data[0])
    }
}

/// A concrete value: an array, or a tuple of values.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Array(ArrayValue),
    Tuple(Vec<Value>),
}

impl Value {
    /// The empty tuple.
    pub fn unit() -> Self {
        Value::Tuple(Vec::new())
    }

    pub fn is_unit(&self) -> bool {
        matches!(self, Value::Tuple(parts) if parts.is_empty())
    }

    /// Convenience constructor for a scalar `f64`.
    pub fn scalar_f64(x: f64) -> Self {
        Value::Array(ArrayValue::scalar(x, DType::F64))
    }

    /// Project this value to its abstract type.
    pub fn aval(&self) -> Aval {
        match self {
            Value::Array(a) => a.aval(),
            Value::Tuple(parts) => {
                Aval::Tuple(parts.iter().map(Value::aval).collect())
            }
        }
    }

    pub fn as_array(&self) -> Result<&ArrayValue> {
        match self {
            Value::Array(a) => Ok(a),
            Value::Tuple(_) => {
                Err(Error::msg(format!("expected an array, got {self}")))
            }
        }
    }

    pub fn as_tuple(&self) -> Result<&[Value]> {
        match self {
            Value::Tuple(parts) => Ok(parts),
            Value::Array(_) => {
                Err(Error::msg(format!("expected a tuple, got {self}")))
            }
        }
    }

    /// The single element of a rank-0 array value.
    pub fn as_scalar(&self) -> Result<f64> {
        self.as_array()?.as_scalar()
    }
}

impl From<ArrayValue> for Value {
    fn from(a: ArrayValue) -> Self {
        Value::Array(a)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Array(a) => {
                if a.shape().is_empty() {
                    write!(f, "{}", a.data()[0])
                } else {
                    write!(f, "{}{:?}", a.aval(), a.data())
                }
            }
            Value::Tuple(parts) => {
                write!(f, "(")?;
                for (i, v) in parts.iter().enumerate() {
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
