//! The externally supplied catalog of primitive operations.
//!
//! The engine owns no numeric semantics. Every primitive it can intercept is
//! described by a [`PrimitiveDef`]: an abstract-evaluation rule over
//! shape/dtype metadata, an optional concrete implementation, an optional
//! custom partial-evaluation rule, and a kind flag telling the dispatcher
//! whether the primitive invokes a bound sub-graph (and whether it broadcasts
//! it over a leading axis).
//!
//! The catalog is immutable once handed to a [`crate::Trace`]; registration
//! happens up front, not in the hot tracing path.

use std::collections::BTreeMap;

use crate::graph::Params;
use crate::trace::{self, TraceValue, TracerId};
use crate::value::{Aval, Value};
use crate::{Error, Result, Trace};

/// Abstract evaluation: predict output types from input types.
pub type AbstractEvalFn = fn(&[Aval], &Params) -> Result<Aval>;

/// Concrete implementation on host values.
pub type ImplFn = fn(&[Value], &Params) -> Result<Value>;

/// A custom partial-evaluation rule, for primitives whose interaction with
/// the known/unknown split is non-default (notably control flow). Receives
/// the trace, the level the primitive was bound at, and the raised input
/// tracers.
pub type PartialEvalFn =
    fn(&mut Trace<'_>, usize, &[TracerId], &Params) -> Result<TraceValue>;

/// How the dispatcher treats a primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveKind {
    /// An ordinary first-order operation.
    Simple,
    /// Invokes a bound sub-graph once (a staged call).
    Call,
    /// Invokes a bound sub-graph broadcast over a leading axis.
    Map,
}

/// The description of one primitive operation.
#[derive(Debug, Clone)]
pub struct PrimitiveDef {
    pub name: String,
    pub kind: PrimitiveKind,
    pub abstract_eval: AbstractEvalFn,
    pub impl_rule: Option<ImplFn>,
    pub partial_eval: Option<PartialEvalFn>,
}

impl PrimitiveDef {
    pub fn new(name: impl Into<String>, abstract_eval: AbstractEvalFn) -> Self {
        PrimitiveDef {
            name: name.into(),
            kind: PrimitiveKind::Simple,
            abstract_eval,
            impl_rule: None,
            partial_eval: None,
        }
    }

    #[must_use]
    pub fn with_impl(mut self, impl_rule: ImplFn) -> Self {
        self.impl_rule = Some(impl_rule);
        self
    }

    #[must_use]
    pub fn with_partial_eval(mut self, rule: PartialEvalFn) -> Self {
        self.partial_eval = Some(rule);
        self
    }

    #[must_use]
    pub fn with_kind(mut self, kind: PrimitiveKind) -> Self {
        self.kind = kind;
        self
    }
}

/// An immutable registry of primitives, injected into the engine.
pub struct Catalog {
    prims: BTreeMap<String, PrimitiveDef>,
}

impl Catalog {
    /// An empty catalog apart from the two structural primitives the engine
    /// itself relies on: `pack` (tuple construction) and `unpack` (tuple
    /// destructuring).
    pub fn new() -> Self {
        let mut cat = Catalog {
            prims: BTreeMap::new(),
        };
        cat.register(
            PrimitiveDef::new("pack", pack_abstract_eval)
                .with_impl(pack_impl)
                .with_partial_eval(trace::pack_partial_eval),
        );
        cat.register(
            PrimitiveDef::new("unpack", unpack_abstract_eval)
                .with_impl(unpack_impl),
        );
        cat
    }

    /// Add a primitive. Double registration is a configuration bug.
    pub fn register(&mut self, def: PrimitiveDef) {
        let name = def.name.clone();
        let prev = self.prims.insert(name.clone(), def);
        assert!(prev.is_none(), "primitive '{name}' registered twice");
    }

    pub fn get(&self, name: &str) -> Result<&PrimitiveDef> {
        self.prims
            .get(name)
            .ok_or_else(|| Error::UnknownPrimitive(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.prims.contains_key(name)
    }

    /// The concrete implementation of a primitive, or the user-facing
    /// "unsupported" error if it was registered without one.
    pub(crate) fn impl_rule(&self, name: &str) -> Result<ImplFn> {
        self.get(name)?
            .impl_rule
            .ok_or_else(|| Error::UnsupportedPrimitive {
                name: name.to_string(),
                rule: "impl",
            })
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

fn pack_abstract_eval(avals: &[Aval], _params: &Params) -> Result<Aval> {
    Ok(Aval::Tuple(avals.to_vec()))
}

fn pack_impl(vals: &[Value], _params: &Params) -> Result<Value> {
    Ok(Value::Tuple(vals.to_vec()))
}

fn unpack_abstract_eval(avals: &[Aval], _params: &Params) -> Result<Aval> {
    match avals {
        [aval @ Aval::Tuple(_)] => Ok(aval.clone()),
        _ => Err(Error::msg("unpack expects a single tuple-typed input")),
    }
}

fn unpack_impl(vals: &[Value], _params: &Params) -> Result<Value> {
    Ok(vals[0].clone())
}
