//! The known/unknown lattice tracked for every traced value.
//!
//! A [`PartialValue`] says how much of a value is statically known: the whole
//! thing (carried directly), nothing but its abstract type, or — for tuples —
//! some mixture, component by component.

use crate::trace::TraceValue;
use crate::value::{Aval, Value};
use crate::{Error, Result};

/// How much of a traced value is statically known.
#[derive(Debug, Clone, PartialEq)]
pub enum PartialValue {
    /// The value is fully known. The payload is usually a concrete [`Value`],
    /// but inside nested traces it may be a tracer belonging to an
    /// *enclosing* trace — "known here, staged out there".
    Known(TraceValue),
    /// Only the abstract type is known.
    Unknown(Aval),
    /// A tuple whose components are independently known or unknown.
    Tuple(Vec<PartialValue>),
}

impl PartialValue {
    /// Wrap a concrete value as fully known, its abstract type implied.
    pub fn known(value: Value) -> Self {
        PartialValue::Known(TraceValue::Concrete(value))
    }

    /// A placeholder of the given abstract type.
    pub fn unknown(aval: Aval) -> Self {
        PartialValue::Unknown(aval)
    }

    /// Combine component partial values into a tuple, canonicalizing the
    /// all-unknown and all-concrete cases so that a tuple of placeholders is
    /// the same thing as a placeholder of tuple type.
    pub fn tuple(parts: Vec<PartialValue>) -> Self {
        if parts.iter().all(|p| matches!(p, PartialValue::Unknown(_))) {
            let avals = parts
                .into_iter()
                .map(|p| match p {
                    PartialValue::Unknown(a) => a,
                    _ => unreachable!(),
                })
                .collect();
            return PartialValue::Unknown(Aval::Tuple(avals));
        }
        let all_concrete = parts.iter().all(|p| {
            matches!(p, PartialValue::Known(TraceValue::Concrete(_)))
        });
        if all_concrete {
            let vals = parts
                .into_iter()
                .map(|p| match p {
                    PartialValue::Known(TraceValue::Concrete(v)) => v,
                    _ => unreachable!(),
                })
                .collect();
            return PartialValue::known(Value::Tuple(vals));
        }
        PartialValue::Tuple(parts)
    }

    /// Whether every leaf of this partial value is known.
    pub fn is_known(&self) -> bool {
        match self {
            PartialValue::Known(_) => true,
            PartialValue::Unknown(_) => false,
            PartialValue::Tuple(parts) => parts.iter().all(|p| p.is_known()),
        }
    }

    /// The abstract type of this partial value.
    ///
    /// Known payloads must be concrete here; resolving tracer payloads needs
    /// the owning trace, see `Trace::pval_aval`.
    pub fn aval(&self) -> Aval {
        match self {
            PartialValue::Known(TraceValue::Concrete(v)) => v.aval(),
            PartialValue::Known(TraceValue::Tracer(_)) => panic!(
                "partial value holds a tracer payload; \
                 its abstract type must be resolved through the trace"
            ),
            PartialValue::Unknown(a) => a.clone(),
            PartialValue::Tuple(parts) => {
                Aval::Tuple(parts.iter().map(|p| p.aval()).collect())
            }
        }
    }

    /// The abstract type, failing on fully-known inputs: a known value with
    /// no descriptor cannot answer for "what would this be if unknown".
    pub fn as_aval(&self) -> Result<Aval> {
        match self {
            PartialValue::Known(v) => Err(Error::NotAbstract(format!("{v:?}"))),
            PartialValue::Unknown(a) => Ok(a.clone()),
            PartialValue::Tuple(parts) => Ok(Aval::Tuple(
                parts
                    .iter()
                    .map(|p| p.as_aval())
                    .collect::<Result<Vec<_>>>()?,
            )),
        }
    }

    /// Least-informative combination of two partial values, as needed when
    /// merging divergent control paths.
    ///
    /// Two fully-known values of equal abstract type stay known, keeping the
    /// left operand. A known value against a placeholder, or two values whose
    /// abstract types differ (but still join), degrade to a placeholder at
    /// the joined type. Payloads must be concrete.
    pub fn join(&self, other: &PartialValue) -> Result<PartialValue> {
        use PartialValue::*;
        match (self, other) {
            (Known(_), Known(_)) => {
                let (a1, a2) = (self.aval(), other.aval());
                if a1 == a2 {
                    Ok(self.clone())
                } else {
                    Ok(Unknown(a1.join(&a2)?))
                }
            }
            (Known(_), Unknown(a2)) => Ok(Unknown(self.aval().join(a2)?)),
            (Unknown(a1), Known(_)) => Ok(Unknown(a1.join(&other.aval())?)),
            (Unknown(a1), Unknown(a2)) => Ok(Unknown(a1.join(a2)?)),
            (Tuple(_), _) | (_, Tuple(_)) => {
                let p1 = self.clone().into_tuple_parts()?;
                let p2 = other.clone().into_tuple_parts()?;
                if p1.len() != p2.len() {
                    return Err(Error::ShapeMismatch {
                        op: "join",
                        lhs: format!("tuple of {}", p1.len()),
                        rhs: format!("tuple of {}", p2.len()),
                    });
                }
                let parts = p1
                    .iter()
                    .zip(p2.iter())
                    .map(|(x, y)| x.join(y))
                    .collect::<Result<Vec<_>>>()?;
                Ok(PartialValue::tuple(parts))
            }
        }
    }

    // View any tuple-typed partial value as its components.
    fn into_tuple_parts(self) -> Result<Vec<PartialValue>> {
        match self {
            PartialValue::Tuple(parts) => Ok(parts),
            PartialValue::Unknown(Aval::Tuple(avals)) => {
                Ok(avals.into_iter().map(PartialValue::Unknown).collect())
            }
            PartialValue::Known(TraceValue::Concrete(Value::Tuple(vals))) => {
                Ok(vals.into_iter().map(PartialValue::known).collect())
            }
            other => Err(Error::ShapeMismatch {
                op: "join",
                lhs: format!("{other:?}"),
                rhs: "tuple".to_string(),
            }),
        }
    }

    /// Reconstruct a full concrete value: known components come from this
    /// partial value, unknown components from `computed`.
    ///
    /// `computed` is whatever the staged half of a computation produced; its
    /// structure must line up with the unknown slots, which is the caller's
    /// bookkeeping and therefore a panic when violated.
    pub fn merge(&self, computed: Value) -> Value {
        match self {
            PartialValue::Known(TraceValue::Concrete(v)) => v.clone(),
            PartialValue::Known(TraceValue::Tracer(_)) => {
                panic!("cannot merge through a tracer payload")
            }
            PartialValue::Unknown(_) => computed,
            PartialValue::Tuple(parts) => {
                let vals = match computed {
                    Value::Tuple(vals) => vals,
                    other => panic!(
                        "merge expected a tuple of {} values, got {other}",
                        parts.len()
                    ),
                };
                assert_eq!(
                    parts.len(),
                    vals.len(),
                    "merge arity mismatch: {} partial components, {} values",
                    parts.len(),
                    vals.len()
                );
                Value::Tuple(
                    parts
                        .iter()
                        .zip(vals)
                        .map(|(p, v)| p.merge(v))
                        .collect(),
                )
            }
        }
    }
}
