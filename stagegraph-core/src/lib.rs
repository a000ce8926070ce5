//! Stagegraph is a tracing and partial-evaluation engine for staged numeric
//! programs.
//!
//! Ordinary Rust closures run with placeholder values ("tracers") instead of
//! arrays; every primitive application goes through [`Trace::bind`], which
//! either evaluates eagerly (when all inputs are statically known) or records
//! an equation into a closed dataflow [`Graph`]. Graphs can be executed,
//! re-traced under other interpretations, or split into a known half and an
//! unknown half connected by an explicit residual channel — the building
//! block for transforms like linearization and staged compilation.
//!
//! The numeric operations themselves live outside the engine, in a
//! [`Catalog`] of primitives supplied at construction time. Each primitive
//! declares an abstract-evaluation rule over shape/dtype metadata, an
//! optional concrete implementation, and an optional custom
//! partial-evaluation rule.
//!
//! ## A quick guide
//! - Build a [`Catalog`] and register your [`PrimitiveDef`]s.
//! - Make a [`Trace`] and call [`Trace::trace_to_graph`] with a function
//!   body and one [`PartialValue`] per argument: `unknown` for placeholders,
//!   `known` for values to specialize on.
//! - Execute the resulting [`Graph`] with [`Graph::eval`], or decompose it
//!   with [`partial_eval_graph`].
//!
//! ```
//! use stagegraph_core::{
//!     ArrayValue, Aval, Catalog, DType, Params, PartialValue, PrimitiveDef,
//!     Result, Trace, TraceValue, Value,
//! };
//!
//! fn add_abstract(avals: &[Aval], _: &Params) -> Result<Aval> {
//!     avals[0].join(&avals[1])
//! }
//!
//! fn add_impl(vals: &[Value], _: &Params) -> Result<Value> {
//!     let (a, b) = (vals[0].as_array()?, vals[1].as_array()?);
//!     let data = a.data().iter().zip(b.data()).map(|(x, y)| x + y).collect();
//!     Ok(Value::Array(ArrayValue::new(a.dtype(), a.shape().to_vec(), data)?))
//! }
//!
//! let mut catalog = Catalog::new();
//! catalog.register(PrimitiveDef::new("add", add_abstract).with_impl(add_impl));
//!
//! // Trace x -> x + x with a placeholder argument.
//! let f = |tr: &mut Trace<'_>, args: &[TraceValue]| {
//!     tr.bind("add", &[args[0].clone(), args[0].clone()], &Params::new())
//! };
//! let mut trace = Trace::new(&catalog);
//! let (graph, _, consts) = trace
//!     .trace_to_graph(
//!         &f,
//!         vec![PartialValue::unknown(Aval::scalar(DType::F64))],
//!         true,
//!     )
//!     .unwrap();
//! assert_eq!(graph.eqns.len(), 1);
//! assert!(consts.is_empty());
//!
//! // And run it concretely.
//! let out = graph.eval(&catalog, &[], &[Value::scalar_f64(3.0)]).unwrap();
//! assert_eq!(out.as_scalar().unwrap(), 6.0);
//! ```

mod dtype;
mod error;
mod graph;
mod primitive;
mod pval;
mod split;
mod trace;
mod value;

pub use dtype::DType;
pub use error::{Context, Error, Result};
pub use graph::{BoundGraph, Equation, Graph, InRef, ParamVal, Params, Var};
pub use primitive::{
    AbstractEvalFn, Catalog, ImplFn, PartialEvalFn, PrimitiveDef, PrimitiveKind,
};
pub use pval::PartialValue;
pub use split::{
    closure_convert, dce_graph, partial_eval_graph, partial_eval_graph_carry,
    CarrySplitGraphs, KnownMask, SplitGraphs,
};
pub use trace::{GraphFn, Trace, TraceValue, Traceable, TracerId};
pub use value::{ArrayValue, Aval, Value};
