//! Splitting a traced graph into known and unknown halves.
//!
//! Given a closed graph and a per-input known/unknown marking,
//! [`partial_eval_graph`] produces two chained graphs: the known half
//! consumes the known inputs and yields the fully-known outputs together
//! with a tuple of residual values; the unknown half consumes that residual
//! tuple as a synthesized leading input (closure conversion) plus the
//! original unknown inputs, and reproduces the remaining outputs.
//!
//! The split works by re-tracing: an inner trace interprets the graph body
//! with the known inputs bound to tracers of an *outer* trace. Everything
//! derivable from known inputs evaluates "eagerly" — which records it in
//! the outer trace — while everything else is recorded by the inner trace.
//! The inner trace's captured constants are exactly the residuals, and they
//! surface as outputs of the outer graph because the outer trace saw them
//! flow into a pack.

use std::cell::RefCell;
use std::collections::HashSet;

use log::debug;

use crate::graph::{Equation, Graph, Var, VarGen};
use crate::primitive::Catalog;
use crate::pval::PartialValue;
use crate::trace::{GraphFn, Trace, TraceValue};
use crate::value::{Aval, Value};
use crate::{bail, Result};

/// Which positions of a (possibly tuple-shaped) output are statically known.
#[derive(Debug, Clone, PartialEq)]
pub enum KnownMask {
    Leaf(bool),
    Tuple(Vec<KnownMask>),
}

impl KnownMask {
    pub(crate) fn from_pval(pv: &PartialValue) -> Self {
        match pv {
            PartialValue::Known(_) => KnownMask::Leaf(true),
            PartialValue::Unknown(_) => KnownMask::Leaf(false),
            PartialValue::Tuple(parts) => KnownMask::Tuple(
                parts.iter().map(KnownMask::from_pval).collect(),
            ),
        }
    }

    pub fn is_fully_known(&self) -> bool {
        match self {
            KnownMask::Leaf(k) => *k,
            KnownMask::Tuple(parts) => parts.iter().all(|m| m.is_fully_known()),
        }
    }

    pub fn is_fully_unknown(&self) -> bool {
        match self {
            KnownMask::Leaf(k) => !*k,
            KnownMask::Tuple(parts) => {
                parts.iter().all(|m| m.is_fully_unknown())
            }
        }
    }
}

/// The two halves produced by [`partial_eval_graph`].
#[derive(Debug)]
pub struct SplitGraphs {
    /// Consumes every original input (unknown slots are dead unit
    /// placeholders) and produces `(known_output, residual_tuple)`.
    pub known: Graph,
    /// Constant values for `known.const_vars`.
    pub known_consts: Vec<Value>,
    /// Closure-converted: consumes `(residual_tuple, unknown_inputs...)` and
    /// produces the unknown portion of the original output.
    pub unknown: Graph,
    /// Abstract types of the residual values, in tuple order.
    pub residual_avals: Vec<Aval>,
    /// Which parts of the original output came out known.
    pub out_known: KnownMask,
}

/// Decompose `graph` into a known half and an unknown half.
///
/// `knowns[i]` marks input `i` as statically known. Running the known graph
/// on the known inputs and feeding its residual output (the second component
/// of its output pair) plus the unknown inputs into the unknown graph
/// reproduces the original graph's results exactly.
pub fn partial_eval_graph(
    catalog: &Catalog,
    graph: &Graph,
    consts: &[Value],
    in_avals: &[Aval],
    knowns: &[bool],
) -> Result<SplitGraphs> {
    if in_avals.len() != graph.in_vars.len()
        || knowns.len() != graph.in_vars.len()
    {
        bail!(
            "graph declares {} inputs but got {} avals and {} known flags",
            graph.in_vars.len(),
            in_avals.len(),
            knowns.len()
        );
    }
    let body_consts = consts
        .iter()
        .cloned()
        .map(TraceValue::Concrete)
        .collect::<Vec<_>>();
    let body = GraphFn::new(graph, body_consts);
    let body_fn = |tr: &mut Trace<'_>, a: &[TraceValue]| body.call(tr, a);

    let cell: RefCell<Option<(Graph, PartialValue, Vec<Aval>)>> =
        RefCell::new(None);
    let fun = |tr: &mut Trace<'_>, vals: &[TraceValue]| -> Result<TraceValue> {
        let pvals = in_avals
            .iter()
            .zip(knowns)
            .zip(vals)
            .map(|((aval, known), val)| {
                if *known {
                    PartialValue::Known(val.clone())
                } else {
                    PartialValue::Unknown(aval.clone())
                }
            })
            .collect::<Vec<_>>();
        let (g2, out_pval, residuals) =
            tr.trace_to_graph(&body_fn, pvals, false)?;
        let res_avals = residuals
            .iter()
            .map(|v| tr.aval_of(v))
            .collect::<Vec<_>>();
        let known_out = tr.known_value(&out_pval)?;
        cell.borrow_mut().replace((g2, out_pval, res_avals));
        let packed_res = tr.pack(&residuals)?;
        tr.pack(&[known_out, packed_res])
    };

    // Every outer input is staged: the known ones at their real types, the
    // unknown ones as unit placeholders that the inner trace never touches.
    let outer_pvals = in_avals
        .iter()
        .zip(knowns)
        .map(|(aval, known)| {
            if *known {
                PartialValue::Unknown(aval.clone())
            } else {
                PartialValue::Unknown(Aval::unit())
            }
        })
        .collect::<Vec<_>>();

    let mut tr = Trace::new(catalog);
    let (g1, _, consts1) = tr.trace_to_graph(&fun, outer_pvals, true)?;
    let (g2, out_pval, residual_avals) = cell
        .into_inner()
        .expect("the known-side trace never ran the graph body");
    let known_consts = consts1
        .into_iter()
        .map(|v| match v {
            TraceValue::Concrete(val) => val,
            TraceValue::Tracer(_) => {
                unreachable!("toplevel trace captured a tracer constant")
            }
        })
        .collect::<Vec<_>>();

    let out_known = KnownMask::from_pval(&out_pval);
    let g2 = drop_known_in_vars(g2, knowns);
    let unknown = closure_convert(&g2);
    debug!(
        "split: known half {} eqns, unknown half {} eqns, {} residuals",
        g1.eqns.len(),
        unknown.eqns.len(),
        residual_avals.len()
    );
    Ok(SplitGraphs {
        known: g1,
        known_consts,
        unknown,
        residual_avals,
        out_known,
    })
}

/// The two halves produced by [`partial_eval_graph_carry`].
#[derive(Debug)]
pub struct CarrySplitGraphs {
    /// Consumes `(d, c, a)` (unknown slots dead) and produces
    /// `(c_known, (b_known, residual_tuple))`.
    pub known: Graph,
    pub known_consts: Vec<Value>,
    /// Consumes `(d, c, (a, residual_tuple))` and produces the unknown
    /// portions of `(c, b)`.
    pub unknown: Graph,
    pub residual_avals: Vec<Aval>,
    /// Knownness of the carry output `c`.
    pub carry_known: KnownMask,
    /// Knownness of the per-step output `b`.
    pub out_known: KnownMask,
}

/// The carry-threading variant of [`partial_eval_graph`], for graphs with a
/// `(d, c, a) -> (c, b)` signature as loop-like constructs use them.
///
/// Both the carry and the per-step output are bifurcated, the two residual
/// channels are combined into one tuple, and the unknown half keeps the
/// carry shape: its residual argument is paired with the per-step input
/// rather than prepended, so the chained graph still looks like a step
/// function.
pub fn partial_eval_graph_carry(
    catalog: &Catalog,
    graph: &Graph,
    consts: &[Value],
    in_avals: &[Aval],
    knowns: &[bool],
) -> Result<CarrySplitGraphs> {
    if graph.in_vars.len() != 3 {
        bail!(
            "carry split expects a (d, c, a) -> (c, b) graph, got {} inputs",
            graph.in_vars.len()
        );
    }
    if in_avals.len() != 3 || knowns.len() != 3 {
        bail!(
            "carry split got {} avals and {} known flags for 3 inputs",
            in_avals.len(),
            knowns.len()
        );
    }
    let body_consts = consts
        .iter()
        .cloned()
        .map(TraceValue::Concrete)
        .collect::<Vec<_>>();
    let body = GraphFn::new(graph, body_consts);
    let body_fn = |tr: &mut Trace<'_>, a: &[TraceValue]| body.call(tr, a);

    type CarryCell = (Graph, PartialValue, PartialValue, Vec<Aval>);
    let cell: RefCell<Option<CarryCell>> = RefCell::new(None);
    let fun = |tr: &mut Trace<'_>, vals: &[TraceValue]| -> Result<TraceValue> {
        let pvals = in_avals
            .iter()
            .zip(knowns)
            .zip(vals)
            .map(|((aval, known), val)| {
                if *known {
                    PartialValue::Known(val.clone())
                } else {
                    PartialValue::Unknown(aval.clone())
                }
            })
            .collect::<Vec<_>>();
        let (g2, out_pval, residuals) =
            tr.trace_to_graph(&body_fn, pvals, false)?;
        let (pv_carry, pv_out) = split_pair_pval(tr, &out_pval)?;
        let res_avals = residuals
            .iter()
            .map(|v| tr.aval_of(v))
            .collect::<Vec<_>>();
        let carry_known = tr.known_value(&pv_carry)?;
        let out_known = tr.known_value(&pv_out)?;
        cell.borrow_mut()
            .replace((g2, pv_carry, pv_out, res_avals));
        let packed_res = tr.pack(&residuals)?;
        let inner = tr.pack(&[out_known, packed_res])?;
        tr.pack(&[carry_known, inner])
    };

    let outer_pvals = in_avals
        .iter()
        .zip(knowns)
        .map(|(aval, known)| {
            if *known {
                PartialValue::Unknown(aval.clone())
            } else {
                PartialValue::Unknown(Aval::unit())
            }
        })
        .collect::<Vec<_>>();

    let mut tr = Trace::new(catalog);
    let (g1, _, consts1) = tr.trace_to_graph(&fun, outer_pvals, true)?;
    let (g2, pv_carry, pv_out, residual_avals) = cell
        .into_inner()
        .expect("the known-side trace never ran the graph body");
    let known_consts = consts1
        .into_iter()
        .map(|v| match v {
            TraceValue::Concrete(val) => val,
            TraceValue::Tracer(_) => {
                unreachable!("toplevel trace captured a tracer constant")
            }
        })
        .collect::<Vec<_>>();

    // Keep all three inputs: the pairing below is positional.
    let lifted = closure_convert(&g2);
    let unknown = move_and_pair_arg(&lifted);
    Ok(CarrySplitGraphs {
        known: g1,
        known_consts,
        unknown,
        residual_avals,
        carry_known: KnownMask::from_pval(&pv_carry),
        out_known: KnownMask::from_pval(&pv_out),
    })
}

// View a pair-shaped partial value as its two halves.
fn split_pair_pval(
    tr: &mut Trace<'_>,
    pv: &PartialValue,
) -> Result<(PartialValue, PartialValue)> {
    match pv {
        PartialValue::Tuple(parts) if parts.len() == 2 => {
            Ok((parts[0].clone(), parts[1].clone()))
        }
        PartialValue::Unknown(Aval::Tuple(avals)) if avals.len() == 2 => Ok((
            PartialValue::Unknown(avals[0].clone()),
            PartialValue::Unknown(avals[1].clone()),
        )),
        PartialValue::Known(v) => {
            let parts = tr.unpack(v)?;
            if parts.len() != 2 {
                bail!("carry body must return a pair, got {} values", parts.len());
            }
            Ok((
                PartialValue::Known(parts[0].clone()),
                PartialValue::Known(parts[1].clone()),
            ))
        }
        other => bail!("carry body must return a pair, got {other:?}"),
    }
}

/// Rewrite a graph so its captured constants become an explicit leading
/// input: the constant-variable list is emptied and a synthesized first
/// argument is destructured into the original constants at the head of the
/// equation list. The result is input-complete and composable without an
/// implicit environment.
pub fn closure_convert(graph: &Graph) -> Graph {
    let mut gen = VarGen::starting_after(graph);
    let res_var = gen.fresh();
    let mut eqns = Vec::with_capacity(graph.eqns.len() + 1);
    eqns.push(Equation::unpack(res_var, graph.const_vars.clone()));
    eqns.extend(graph.eqns.iter().cloned());
    let mut in_vars = Vec::with_capacity(graph.in_vars.len() + 1);
    in_vars.push(res_var);
    in_vars.extend(graph.in_vars.iter().copied());
    let converted = Graph::new(
        Vec::new(),
        graph.free_vars.clone(),
        in_vars,
        graph.out_var,
        eqns,
    );
    converted.check();
    converted
}

// [res, d, c, a] -> [d, c, pair] with pair destructured into (a, res).
fn move_and_pair_arg(graph: &Graph) -> Graph {
    assert_eq!(
        graph.in_vars.len(),
        4,
        "move_and_pair expects [res, d, c, a] inputs"
    );
    let (res, d, c, a) = (
        graph.in_vars[0],
        graph.in_vars[1],
        graph.in_vars[2],
        graph.in_vars[3],
    );
    let mut gen = VarGen::starting_after(graph);
    let pair = gen.fresh();
    let mut eqns = Vec::with_capacity(graph.eqns.len() + 1);
    eqns.push(Equation::unpack(pair, vec![a, res]));
    eqns.extend(graph.eqns.iter().cloned());
    let moved = Graph::new(
        Vec::new(),
        graph.free_vars.clone(),
        vec![d, c, pair],
        graph.out_var,
        eqns,
    );
    moved.check();
    moved
}

// Drop input variables whose slots were marked known; nothing in the
// unknown half can reference them, which the final check re-verifies.
fn drop_known_in_vars(mut graph: Graph, knowns: &[bool]) -> Graph {
    graph.in_vars = graph
        .in_vars
        .iter()
        .zip(knowns)
        .filter(|(_, known)| !**known)
        .map(|(v, _)| *v)
        .collect();
    graph.check();
    graph
}

/// Dead-code elimination: drop equations that contribute nothing to the
/// graph's output. Returns the pruned graph and a mask of which inputs are
/// still read.
pub fn dce_graph(graph: &Graph) -> (Graph, Vec<bool>) {
    let mut needed: HashSet<Var> = HashSet::new();
    if let Some(v) = graph.out_var {
        needed.insert(v);
    }
    let mut keep = vec![false; graph.eqns.len()];
    for (i, eqn) in graph.eqns.iter().enumerate().rev() {
        let used = eqn.outputs.iter().flatten().any(|v| needed.contains(v));
        if used {
            keep[i] = true;
            for v in eqn.input_vars() {
                needed.insert(v);
            }
            for sub in &eqn.subgraphs {
                needed.extend(sub.const_vars.iter().copied());
                needed.extend(sub.env_vars.iter().copied());
            }
        }
    }
    let eqns = graph
        .eqns
        .iter()
        .zip(&keep)
        .filter(|(_, keep)| **keep)
        .map(|(eqn, _)| eqn.clone())
        .collect::<Vec<_>>();
    let used_inputs = graph
        .in_vars
        .iter()
        .map(|v| needed.contains(v))
        .collect::<Vec<_>>();
    let pruned = Graph::new(
        graph.const_vars.clone(),
        graph.free_vars.clone(),
        graph.in_vars.clone(),
        graph.out_var,
        eqns,
    );
    (pruned, used_inputs)
}
