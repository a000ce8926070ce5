//! The trace engine: abstract interpretation over primitive applications.
//!
//! A [`Trace`] owns an explicit stack of tracing levels. Running a function
//! body with [`Trace::trace_to_graph`] pushes a level, feeds the body
//! placeholder arguments ([`TracerId`]s wrapped as [`TraceValue`]s), and
//! intercepts every primitive the body applies through [`Trace::bind`]. Each
//! interception either evaluates eagerly — when all inputs are statically
//! known — or records an equation; at completion the reachable records are
//! sunk into a closed [`Graph`].
//!
//! Levels nest: a staged call ([`Trace::bind_call`]) runs its callee under a
//! fresh sub-scope of the current level, and an entire nested trace (as used
//! by the partial-evaluation split) runs under a fresh level. A tracer is
//! only ever consumed at the level and scope that created it; the narrow
//! lift/sublift protocol in [`Trace::full_raise`] is the sole legal way
//! across, and any other crossing panics.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;

use crate::graph::{BoundGraph, Equation, Graph, InRef, Params, Var, VarGen};
use crate::primitive::{Catalog, PrimitiveKind};
use crate::pval::PartialValue;
use crate::value::{Aval, Value};
use crate::{Error, Result};

// Process-wide ids for tracing levels, never reused.
static NEXT_MASTER_ID: AtomicU64 = AtomicU64::new(0);

/// A value flowing through traced code: a concrete host value, or a
/// placeholder owned by some tracing level.
#[derive(Debug, Clone, PartialEq)]
pub enum TraceValue {
    Concrete(Value),
    Tracer(TracerId),
}

impl TraceValue {
    /// The concrete empty tuple.
    pub fn unit() -> Self {
        TraceValue::Concrete(Value::unit())
    }

    pub fn is_tracer(&self) -> bool {
        matches!(self, TraceValue::Tracer(_))
    }

    /// Unwrap a concrete value, failing on placeholders.
    pub fn concrete(self) -> Result<Value> {
        match self {
            TraceValue::Concrete(v) => Ok(v),
            TraceValue::Tracer(t) => Err(Error::msg(format!(
                "expected a concrete value, got tracer {t:?}"
            ))),
        }
    }
}

impl From<Value> for TraceValue {
    fn from(v: Value) -> Self {
        TraceValue::Concrete(v)
    }
}

/// Stable handle to a tracer: the level that owns it and its slot in that
/// level's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TracerId {
    pub(crate) level: u32,
    pub(crate) index: u32,
}

pub(crate) type EqnId = u64;

// A recorded primitive application, shared by its output tracers.
#[derive(Debug)]
pub(crate) struct EqnRecipe {
    id: EqnId,
    prim: String,
    inputs: Vec<TracerId>,
    subgraphs: Vec<BoundRecipe>,
    destructure: bool,
    params: Params,
}

#[derive(Debug)]
pub(crate) struct BoundRecipe {
    graph: Graph,
    const_tracers: Vec<TracerId>,
    env_tracers: Vec<TracerId>,
}

/// How a tracer came to be. Immutable once assigned.
#[derive(Debug, Clone)]
pub(crate) enum Recipe {
    /// A bound argument of the traced function.
    LambdaBinding,
    /// A reference to a tracer of an enclosing scope of the same level.
    FreeVar(TracerId),
    /// A lifted constant: a concrete value, or a tracer of a lower level.
    ConstVar(TraceValue),
    /// An output of a recorded equation.
    Eqn(Rc<EqnRecipe>),
    /// Component `index` of a destructured multi-output equation. All
    /// siblings share the underlying equation; `eqn.id` is the dedup key
    /// that keeps extraction from emitting it twice.
    Destructure {
        index: usize,
        arity: usize,
        eqn: Rc<EqnRecipe>,
    },
    /// A known constant that has not been materialized into the graph.
    PureConst,
}

struct TracerData {
    sublevel: u32,
    pval: PartialValue,
    recipe: Recipe,
}

struct MasterFrame {
    id: u64,
    sublevel: u32,
    tracers: Vec<TracerData>,
    next_eqn: EqnId,
}

impl MasterFrame {
    fn new(id: u64) -> Self {
        MasterFrame {
            id,
            sublevel: 0,
            tracers: Vec::new(),
            next_eqn: 0,
        }
    }
}

/// A function body the engine can interpret with tracer arguments.
///
/// Implemented for every closure of the matching shape; [`GraphFn::call`]
/// re-traces an already extracted graph through the same interface.
pub trait Traceable {
    fn call(&self, trace: &mut Trace<'_>, args: &[TraceValue]) -> Result<TraceValue>;
}

impl<F> Traceable for F
where
    F: Fn(&mut Trace<'_>, &[TraceValue]) -> Result<TraceValue>,
{
    fn call(&self, trace: &mut Trace<'_>, args: &[TraceValue]) -> Result<TraceValue> {
        self(trace, args)
    }
}

/// The tracing engine. See the module docs.
pub struct Trace<'c> {
    catalog: &'c Catalog,
    masters: Vec<MasterFrame>,
}

impl<'c> Trace<'c> {
    pub fn new(catalog: &'c Catalog) -> Self {
        Trace {
            catalog,
            masters: Vec::new(),
        }
    }

    pub fn catalog(&self) -> &'c Catalog {
        self.catalog
    }

    /// The innermost active level, if any trace is running.
    pub fn current_level(&self) -> Option<usize> {
        self.masters.len().checked_sub(1)
    }

    fn data(&self, t: TracerId) -> &TracerData {
        let frame = self
            .masters
            .get(t.level as usize)
            .unwrap_or_else(|| panic!("tracer {t:?} outlived its trace level"));
        &frame.tracers[t.index as usize]
    }

    /// The partial value carried by a tracer.
    pub fn pval(&self, t: TracerId) -> &PartialValue {
        &self.data(t).pval
    }

    fn is_known(&self, t: TracerId) -> bool {
        matches!(self.data(t).pval, PartialValue::Known(_))
    }

    fn new_tracer(
        &mut self,
        level: usize,
        pval: PartialValue,
        recipe: Recipe,
    ) -> TracerId {
        if let PartialValue::Known(TraceValue::Tracer(p)) = &pval {
            assert!(
                (p.level as usize) < level,
                "a known payload must belong to an enclosing trace \
                 (payload level {}, owner level {level})",
                p.level
            );
        }
        let frame = &mut self.masters[level];
        let index = frame.tracers.len() as u32;
        frame.tracers.push(TracerData {
            sublevel: frame.sublevel,
            pval,
            recipe,
        });
        TracerId {
            level: level as u32,
            index,
        }
    }

    fn new_eqn(
        &mut self,
        level: usize,
        prim: &str,
        inputs: Vec<TracerId>,
        subgraphs: Vec<BoundRecipe>,
        destructure: bool,
        params: Params,
    ) -> Rc<EqnRecipe> {
        let frame = &mut self.masters[level];
        let id = frame.next_eqn;
        frame.next_eqn += 1;
        Rc::new(EqnRecipe {
            id,
            prim: prim.to_string(),
            inputs,
            subgraphs,
            destructure,
            params,
        })
    }

    // ---- aval resolution -------------------------------------------------

    /// Abstract type of a trace value, resolving placeholder payloads
    /// through the arenas.
    pub fn aval_of(&self, v: &TraceValue) -> Aval {
        match v {
            TraceValue::Concrete(val) => val.aval(),
            TraceValue::Tracer(t) => self.tracer_aval(*t),
        }
    }

    pub fn tracer_aval(&self, t: TracerId) -> Aval {
        self.pval_aval(self.pval(t))
    }

    pub fn pval_aval(&self, pv: &PartialValue) -> Aval {
        match pv {
            PartialValue::Known(v) => self.aval_of(v),
            PartialValue::Unknown(a) => a.clone(),
            PartialValue::Tuple(parts) => {
                Aval::Tuple(parts.iter().map(|p| self.pval_aval(p)).collect())
            }
        }
    }

    // ---- constants and lifting -------------------------------------------

    /// Wrap a constant as a known tracer at `level`, without materializing it
    /// into the graph.
    pub fn new_const(&mut self, level: usize, val: TraceValue) -> TracerId {
        self.new_tracer(level, PartialValue::Known(val), Recipe::PureConst)
    }

    /// Wrap a literal that appears inside traced code.
    pub fn pure(&mut self, level: usize, val: TraceValue) -> TracerId {
        self.new_const(level, val)
    }

    /// Wrap a value coming from an enclosing (lower) trace level.
    pub fn lift(&mut self, level: usize, val: TraceValue) -> TracerId {
        self.new_const(level, val)
    }

    /// Re-wrap a tracer from an enclosing scope of the same level as a
    /// free-variable reference here.
    pub fn sublift(&mut self, level: usize, t: TracerId) -> TracerId {
        let pval = self.data(t).pval.clone();
        self.new_tracer(level, pval, Recipe::FreeVar(t))
    }

    /// Materialize a value as a constant-producing entry in the graph.
    pub fn new_instantiated_const(
        &mut self,
        level: usize,
        val: TraceValue,
    ) -> TracerId {
        let aval = self.aval_of(&val);
        self.new_tracer(
            level,
            PartialValue::Unknown(aval),
            Recipe::ConstVar(val),
        )
    }

    /// Introduce a bound argument tracer.
    pub fn new_arg(&mut self, level: usize, pval: PartialValue) -> TracerId {
        self.new_tracer(level, pval, Recipe::LambdaBinding)
    }

    /// Force a tracer into the structurally uniform, graph-resident form:
    /// known tracers become explicit constants, tuples are rebuilt from
    /// instantiated components, unknown tracers pass through.
    pub fn instantiate_const(
        &mut self,
        level: usize,
        t: TracerId,
    ) -> Result<TracerId> {
        match self.data(t).pval.clone() {
            PartialValue::Unknown(_) => Ok(t),
            PartialValue::Known(val) => {
                Ok(self.new_instantiated_const(level, val))
            }
            PartialValue::Tuple(_) => {
                let parts = self.unpack(&TraceValue::Tracer(t))?;
                let mut inst = Vec::with_capacity(parts.len());
                for p in parts {
                    let raised = self.full_raise(level, p);
                    inst.push(TraceValue::Tracer(
                        self.instantiate_const(level, raised)?,
                    ));
                }
                match self.pack(&inst)? {
                    TraceValue::Tracer(t) => Ok(t),
                    TraceValue::Concrete(_) => unreachable!(
                        "packing instantiated components produced a constant"
                    ),
                }
            }
        }
    }

    /// Bring a value to the given level, through the only legal channels:
    /// constants are lifted, same-scope tracers pass through, tracers from an
    /// enclosing scope of the same level become free variables, and tracers
    /// from enclosing levels are wrapped as known payloads. A tracer from an
    /// *inner* level or scope has escaped its extent, which is fatal.
    pub fn full_raise(&mut self, level: usize, v: TraceValue) -> TracerId {
        match v {
            TraceValue::Concrete(_) => self.pure(level, v),
            TraceValue::Tracer(t) => {
                let tl = t.level as usize;
                if tl == level {
                    let sub = self.data(t).sublevel;
                    let cur = self.masters[level].sublevel;
                    match sub.cmp(&cur) {
                        std::cmp::Ordering::Equal => t,
                        std::cmp::Ordering::Less => self.sublift(level, t),
                        std::cmp::Ordering::Greater => panic!(
                            "tracer {t:?} escaped its call scope \
                             (scope {sub} consumed at scope {cur}, \
                             master {})",
                            self.masters[level].id
                        ),
                    }
                } else if tl < level {
                    self.lift(level, TraceValue::Tracer(t))
                } else {
                    panic!(
                        "tracer {t:?} from inner level {tl} leaked into \
                         level {level}"
                    )
                }
            }
        }
    }

    /// Strip a known tracer down to its payload, recursively.
    pub fn full_lower(&self, t: TracerId) -> TraceValue {
        match &self.data(t).pval {
            PartialValue::Known(v) => self.full_lower_value(v.clone()),
            _ => TraceValue::Tracer(t),
        }
    }

    fn full_lower_value(&self, v: TraceValue) -> TraceValue {
        match v {
            TraceValue::Tracer(t) => self.full_lower(t),
            c => c,
        }
    }

    // ---- dispatch --------------------------------------------------------

    /// Apply a primitive to traced or concrete values.
    ///
    /// With no placeholders among the arguments the primitive's impl rule
    /// runs directly. Otherwise the arguments are raised to the highest level
    /// that owns one of them and dispatched through that level's
    /// [`Trace::process_primitive`].
    pub fn bind(
        &mut self,
        prim: &str,
        args: &[TraceValue],
        params: &Params,
    ) -> Result<TraceValue> {
        let top = args
            .iter()
            .filter_map(|v| match v {
                TraceValue::Tracer(t) => Some(t.level as usize),
                TraceValue::Concrete(_) => None,
            })
            .max();
        match top {
            None => {
                let rule = self.catalog.impl_rule(prim)?;
                let vals = args
                    .iter()
                    .cloned()
                    .map(TraceValue::concrete)
                    .collect::<Result<Vec<_>>>()?;
                Ok(TraceValue::Concrete(rule(&vals, params)?))
            }
            Some(level) => {
                assert!(
                    level < self.masters.len(),
                    "tracer from a finished trace reached '{prim}'"
                );
                let tracers = args
                    .iter()
                    .map(|v| self.full_raise(level, v.clone()))
                    .collect::<Vec<_>>();
                let out = self.process_primitive(level, prim, &tracers, params)?;
                Ok(self.full_lower_value(out))
            }
        }
    }

    /// The default interception: delegate to a custom partial-evaluation
    /// rule when one is registered; evaluate eagerly when every input is
    /// known; otherwise instantiate the inputs, predict the output type, and
    /// record an equation.
    pub fn process_primitive(
        &mut self,
        level: usize,
        prim: &str,
        tracers: &[TracerId],
        params: &Params,
    ) -> Result<TraceValue> {
        let def = self.catalog.get(prim)?;
        if let Some(rule) = def.partial_eval {
            return rule(self, level, tracers, params);
        }
        if tracers.iter().all(|t| self.is_known(*t)) {
            // Known computation happens below this level: the payloads
            // belong to enclosing traces or are concrete.
            let vals = tracers
                .iter()
                .map(|t| self.full_lower(*t))
                .collect::<Vec<_>>();
            return self.bind(prim, &vals, params);
        }
        let abstract_eval = def.abstract_eval;
        let mut inst = Vec::with_capacity(tracers.len());
        for t in tracers {
            inst.push(self.instantiate_const(level, *t)?);
        }
        let avals = inst
            .iter()
            .map(|t| self.tracer_aval(*t))
            .collect::<Vec<_>>();
        let out_aval = abstract_eval(&avals, params)?;
        let eqn = self.new_eqn(level, prim, inst, Vec::new(), false, params.clone());
        Ok(TraceValue::Tracer(self.new_tracer(
            level,
            PartialValue::Unknown(out_aval),
            Recipe::Eqn(eqn),
        )))
    }

    // ---- tuples ----------------------------------------------------------

    /// Build a tuple value, staging a `pack` equation if any component is a
    /// placeholder.
    pub fn pack(&mut self, values: &[TraceValue]) -> Result<TraceValue> {
        self.bind("pack", values, &Params::new())
    }

    /// Destructure a tuple value into its components.
    ///
    /// Concrete tuples and known tracers destructure directly. An unknown
    /// tuple tracer yields one child tracer per component, all sharing the
    /// producing equation, so that extraction emits that equation exactly
    /// once no matter how many components are used.
    pub fn unpack(&mut self, v: &TraceValue) -> Result<Vec<TraceValue>> {
        match v {
            TraceValue::Concrete(Value::Tuple(vs)) => {
                Ok(vs.iter().cloned().map(TraceValue::Concrete).collect())
            }
            TraceValue::Concrete(other) => Err(Error::msg(format!(
                "cannot destructure non-tuple value {other}"
            ))),
            TraceValue::Tracer(t) => match self.data(*t).pval.clone() {
                PartialValue::Known(payload) => self.unpack(&payload),
                PartialValue::Tuple(parts) => self.unpack_tracer(*t, parts),
                PartialValue::Unknown(Aval::Tuple(avals)) => {
                    let parts = avals
                        .into_iter()
                        .map(PartialValue::Unknown)
                        .collect();
                    self.unpack_tracer(*t, parts)
                }
                PartialValue::Unknown(a) => Err(Error::msg(format!(
                    "cannot destructure non-tuple tracer of type {a}"
                ))),
            },
        }
    }

    fn unpack_tracer(
        &mut self,
        t: TracerId,
        parts: Vec<PartialValue>,
    ) -> Result<Vec<TraceValue>> {
        let level = t.level as usize;
        let arity = parts.len();
        // Destructure the producing equation directly when there is one;
        // otherwise synthesize an unpack equation over the tuple tracer.
        let recipe = self.data(t).recipe.clone();
        let eqn = match recipe {
            Recipe::Eqn(e) => e,
            _ => self.new_eqn(
                level,
                "unpack",
                vec![t],
                Vec::new(),
                true,
                Params::new(),
            ),
        };
        Ok(parts
            .into_iter()
            .enumerate()
            .map(|(index, pval)| {
                let child = self.new_tracer(
                    level,
                    pval,
                    Recipe::Destructure {
                        index,
                        arity,
                        eqn: eqn.clone(),
                    },
                );
                self.full_lower(child)
            })
            .collect())
    }

    // ---- staged calls ----------------------------------------------------

    /// Apply a call-like or map-like primitive to a function body.
    ///
    /// With no placeholders among the arguments the body simply runs — any
    /// captured tracers inside it are still intercepted at their own levels.
    pub fn bind_call(
        &mut self,
        prim: &str,
        body: &dyn Traceable,
        args: &[TraceValue],
        params: &Params,
    ) -> Result<TraceValue> {
        let kind = self.catalog.get(prim)?.kind;
        let top = args
            .iter()
            .filter_map(|v| match v {
                TraceValue::Tracer(t) => Some(t.level as usize),
                TraceValue::Concrete(_) => None,
            })
            .max();
        let Some(level) = top else {
            return body.call(self, args);
        };
        assert!(
            level < self.masters.len(),
            "tracer from a finished trace reached '{prim}'"
        );
        let tracers = args
            .iter()
            .map(|v| self.full_raise(level, v.clone()))
            .collect::<Vec<_>>();
        let out = match kind {
            PrimitiveKind::Call => {
                self.process_call(level, prim, body, &tracers, params)?
            }
            PrimitiveKind::Map => {
                self.process_map(level, prim, body, &tracers, params)?
            }
            PrimitiveKind::Simple => {
                return Err(Error::UnsupportedPrimitive {
                    name: prim.to_string(),
                    rule: "call or map",
                })
            }
        };
        Ok(self.full_lower_value(out))
    }

    /// Stage an invocation of `body`: trace it under a fresh sub-scope with
    /// the arguments' partial values, lift the captured constants and free
    /// variables into this scope, and record one equation binding the
    /// extracted sub-graph.
    pub fn process_call(
        &mut self,
        level: usize,
        prim: &str,
        body: &dyn Traceable,
        tracers: &[TracerId],
        params: &Params,
    ) -> Result<TraceValue> {
        let in_pvals = tracers
            .iter()
            .map(|t| self.data(*t).pval.clone())
            .collect::<Vec<_>>();
        let (graph, out_pval, consts, env) = self.trace_to_subgraph(
            level,
            body,
            in_pvals,
            false,
            PrimitiveKind::Call,
        )?;
        let const_tracers = consts
            .into_iter()
            .map(|v| self.new_instantiated_const(level, v))
            .collect::<Vec<_>>();
        let env_tracers = env
            .into_iter()
            .map(|t| self.full_raise(level, TraceValue::Tracer(t)))
            .collect::<Vec<_>>();
        let mut inputs = Vec::with_capacity(tracers.len());
        for t in tracers {
            inputs.push(self.instantiate_const(level, *t)?);
        }
        let bound = BoundRecipe {
            graph,
            const_tracers,
            env_tracers,
        };
        let eqn =
            self.new_eqn(level, prim, inputs, vec![bound], false, params.clone());
        Ok(TraceValue::Tracer(self.new_tracer(
            level,
            out_pval,
            Recipe::Eqn(eqn),
        )))
    }

    /// Stage a mapped invocation of `body` over a leading axis of size
    /// `axis_size`.
    ///
    /// The body is traced against input types with the mapped axis stripped;
    /// the axis is restored on the output type. The sub-graph's constants
    /// are rewritten into ordinary leading inputs — under a mapped axis a
    /// captured constant must be supplied per element rather than shared —
    /// and the lifted constant tracers are prepended to the equation's
    /// inputs.
    pub fn process_map(
        &mut self,
        level: usize,
        prim: &str,
        body: &dyn Traceable,
        tracers: &[TracerId],
        params: &Params,
    ) -> Result<TraceValue> {
        let axis_size = params
            .get("axis_size")
            .ok_or_else(|| {
                Error::msg(format!("map primitive '{prim}' needs axis_size"))
            })?
            .as_size()?;
        let in_pvals = tracers
            .iter()
            .map(|t| strip_axis_pval(&self.data(*t).pval))
            .collect::<Result<Vec<_>>>()?;
        let (graph, out_pval_reduced, consts, env) = self.trace_to_subgraph(
            level,
            body,
            in_pvals,
            false,
            PrimitiveKind::Map,
        )?;
        let out_pval = add_axis_pval(axis_size, &out_pval_reduced);

        let const_tracers = consts
            .into_iter()
            .map(|v| self.new_instantiated_const(level, v))
            .collect::<Vec<_>>();
        let env_tracers = env
            .into_iter()
            .map(|t| self.full_raise(level, TraceValue::Tracer(t)))
            .collect::<Vec<_>>();

        let mut in_vars = graph.const_vars.clone();
        in_vars.extend(graph.in_vars.iter().copied());
        let converted = Graph::new(
            Vec::new(),
            graph.free_vars.clone(),
            in_vars,
            graph.out_var,
            graph.eqns,
        );

        let mut inputs = const_tracers;
        for t in tracers {
            inputs.push(self.instantiate_const(level, *t)?);
        }
        let bound = BoundRecipe {
            graph: converted,
            const_tracers: Vec::new(),
            env_tracers,
        };
        let eqn =
            self.new_eqn(level, prim, inputs, vec![bound], false, params.clone());
        Ok(TraceValue::Tracer(self.new_tracer(
            level,
            out_pval,
            Recipe::Eqn(eqn),
        )))
    }

    /// Re-home a call body's output into the calling scope. This is where a
    /// closed-over tracer returned from a nested call is turned into a
    /// free-variable reference, so that extraction can still reach its
    /// producing equations through the call equation's environment.
    pub fn post_process_call(&mut self, level: usize, out: TraceValue) -> TracerId {
        if let TraceValue::Tracer(t) = &out {
            let same_scope = t.level as usize == level
                && self.data(*t).sublevel == self.masters[level].sublevel;
            if !same_scope {
                debug!(
                    "call output {t:?} escaped its scope; re-homing at \
                     level {level}"
                );
            }
        }
        self.full_raise(level, out)
    }

    /// The mapped-call variant of [`Trace::post_process_call`].
    pub fn post_process_map(&mut self, level: usize, out: TraceValue) -> TracerId {
        self.post_process_call(level, out)
    }

    // ---- trace entry and extraction --------------------------------------

    /// Trace `body` under a fresh level and extract the closed graph.
    ///
    /// Returns the graph, the output's partial value, and the captured
    /// constants in graph order. With `instantiate` set, a fully known
    /// output is materialized as a constant equation instead of leaving the
    /// graph without a staged output.
    pub fn trace_to_graph(
        &mut self,
        body: &dyn Traceable,
        in_pvals: Vec<PartialValue>,
        instantiate: bool,
    ) -> Result<(Graph, PartialValue, Vec<TraceValue>)> {
        let level = self.masters.len();
        let master_id = NEXT_MASTER_ID.fetch_add(1, Ordering::Relaxed);
        debug!("entering trace level {level} (master {master_id})");
        self.masters.push(MasterFrame::new(master_id));
        let result =
            self.trace_body(level, body, in_pvals, instantiate, PrimitiveKind::Call);
        self.masters.pop();
        let (graph, out_pval, consts, env) = result?;
        assert!(
            env.is_empty(),
            "free variables escaped a toplevel trace at level {level}"
        );
        debug!(
            "extracted graph at level {level}: {} equations, {} constants",
            graph.eqns.len(),
            consts.len()
        );
        Ok((graph, out_pval, consts))
    }

    fn trace_to_subgraph(
        &mut self,
        level: usize,
        body: &dyn Traceable,
        in_pvals: Vec<PartialValue>,
        instantiate: bool,
        kind: PrimitiveKind,
    ) -> Result<(Graph, PartialValue, Vec<TraceValue>, Vec<TracerId>)> {
        self.masters[level].sublevel += 1;
        let result = self.trace_body(level, body, in_pvals, instantiate, kind);
        self.masters[level].sublevel -= 1;
        result
    }

    fn trace_body(
        &mut self,
        level: usize,
        body: &dyn Traceable,
        in_pvals: Vec<PartialValue>,
        instantiate: bool,
        kind: PrimitiveKind,
    ) -> Result<(Graph, PartialValue, Vec<TraceValue>, Vec<TracerId>)> {
        let in_tracers = in_pvals
            .into_iter()
            .map(|pv| self.new_arg(level, pv))
            .collect::<Vec<_>>();
        let args = in_tracers
            .iter()
            .map(|t| TraceValue::Tracer(*t))
            .collect::<Vec<_>>();
        let out = body.call(self, &args)?;
        let mut out_tracer = match kind {
            PrimitiveKind::Map => self.post_process_map(level, out),
            _ => self.post_process_call(level, out),
        };
        if instantiate {
            out_tracer = self.instantiate_const(level, out_tracer)?;
        }
        let out_pval = self.data(out_tracer).pval.clone();
        let (graph, consts, env) =
            self.tracers_to_graph(level, &in_tracers, out_tracer);
        Ok((graph, out_pval, consts, env))
    }

    /// Compute the output abstract type of a traceable body by running it
    /// with all-unknown inputs and discarding the recorded graph.
    pub fn abstract_eval_fun(
        &mut self,
        body: &dyn Traceable,
        avals: &[Aval],
    ) -> Result<Aval> {
        let pvals = avals
            .iter()
            .cloned()
            .map(PartialValue::Unknown)
            .collect::<Vec<_>>();
        let (_, out_pval, _) = self.trace_to_graph(body, pvals, false)?;
        Ok(self.pval_aval(&out_pval))
    }

    /// The known portion of a partial value as a trace value, with unknown
    /// slots replaced by the unit value.
    pub fn known_value(&mut self, pv: &PartialValue) -> Result<TraceValue> {
        match pv {
            PartialValue::Known(v) => Ok(v.clone()),
            PartialValue::Unknown(_) => Ok(TraceValue::unit()),
            PartialValue::Tuple(parts) => {
                let mut vals = Vec::with_capacity(parts.len());
                for p in parts {
                    vals.push(self.known_value(p)?);
                }
                self.pack(&vals)
            }
        }
    }

    // Parent edges for the dependency walk: an equation's recorded inputs
    // plus the captured constant and free-variable tracers of its bound
    // sub-graphs.
    fn parents(&self, t: TracerId) -> Vec<TracerId> {
        match &self.data(t).recipe {
            Recipe::Eqn(e) | Recipe::Destructure { eqn: e, .. } => {
                let mut ps = e.inputs.clone();
                for sub in &e.subgraphs {
                    ps.extend_from_slice(&sub.const_tracers);
                    ps.extend_from_slice(&sub.env_tracers);
                }
                ps
            }
            _ => Vec::new(),
        }
    }

    // Iterative depth-first postorder: every tracer appears after all of its
    // parents.
    fn toposort(&self, root: TracerId) -> Vec<TracerId> {
        let mut order = Vec::new();
        let mut visited: HashSet<TracerId> = HashSet::new();
        let mut stack = vec![(root, false)];
        while let Some((t, expanded)) = stack.pop() {
            if expanded {
                order.push(t);
                continue;
            }
            if !visited.insert(t) {
                continue;
            }
            stack.push((t, true));
            for p in self.parents(t) {
                if !visited.contains(&p) {
                    stack.push((p, false));
                }
            }
        }
        order
    }

    /// Sink the tracers reachable from `out_tracer` into a closed graph.
    ///
    /// Returns the graph, the captured constant values (matching
    /// `graph.const_vars`), and the free-variable targets (matching
    /// `graph.free_vars`).
    fn tracers_to_graph(
        &self,
        level: usize,
        in_tracers: &[TracerId],
        out_tracer: TracerId,
    ) -> (Graph, Vec<TraceValue>, Vec<TracerId>) {
        let sorted = self.toposort(out_tracer);

        // Collect, per equation, which destructured components are in use
        // and whether the whole tuple is also used, before any emission.
        let mut dest_children: HashMap<EqnId, Vec<(usize, TracerId)>> =
            HashMap::new();
        let mut arity: HashMap<EqnId, usize> = HashMap::new();
        let mut tuple_use: HashMap<EqnId, TracerId> = HashMap::new();
        for &t in &sorted {
            match &self.data(t).recipe {
                Recipe::Eqn(e) => {
                    let prev = tuple_use.insert(e.id, t);
                    assert!(prev.is_none(), "equation {} has two output tracers", e.id);
                }
                Recipe::Destructure {
                    index,
                    arity: n,
                    eqn,
                } => {
                    dest_children.entry(eqn.id).or_default().push((*index, t));
                    arity.insert(eqn.id, *n);
                }
                _ => {}
            }
        }

        let mut ex = Extractor {
            gen: VarGen::new(),
            t_to_var: HashMap::new(),
        };
        let in_vars = in_tracers.iter().map(|t| ex.var(*t)).collect::<Vec<_>>();
        let in_set: HashSet<TracerId> = in_tracers.iter().copied().collect();

        let mut eqns: Vec<Equation> = Vec::new();
        let mut consts: Vec<(Var, TraceValue)> = Vec::new();
        let mut env: Vec<(Var, TracerId)> = Vec::new();
        let mut emitted: HashSet<EqnId> = HashSet::new();

        for &t in &sorted {
            match self.data(t).recipe.clone() {
                Recipe::Eqn(e) | Recipe::Destructure { eqn: e, .. } => {
                    if !emitted.insert(e.id) {
                        continue;
                    }
                    let children = dest_children.get(&e.id);
                    let whole = tuple_use.get(&e.id).copied();
                    match (children, whole) {
                        (None, Some(out)) => {
                            let v = ex.var(out);
                            let eqn =
                                ex.translate(&e, vec![Some(v)], e.destructure);
                            eqns.push(eqn);
                        }
                        (Some(children), whole) => {
                            let n = arity[&e.id];
                            let mut outs: Vec<Option<Var>> = vec![None; n];
                            for (i, child) in children {
                                match outs[*i] {
                                    None => outs[*i] = Some(ex.var(*child)),
                                    // repeated destructuring of the same
                                    // component: alias the variable
                                    Some(v) => {
                                        ex.t_to_var.insert(*child, v);
                                    }
                                }
                            }
                            if whole.is_some() {
                                // Both the tuple and its components are in
                                // use: materialize every slot and re-pack.
                                for slot in outs.iter_mut() {
                                    if slot.is_none() {
                                        *slot = Some(ex.gen.fresh());
                                    }
                                }
                            }
                            let eqn = ex.translate(&e, outs.clone(), true);
                            eqns.push(eqn);
                            if let Some(out) = whole {
                                let v = ex.var(out);
                                let inputs = outs
                                    .iter()
                                    .map(|s| InRef::Var(s.unwrap()))
                                    .collect();
                                eqns.push(Equation {
                                    inputs,
                                    outputs: vec![Some(v)],
                                    prim: "pack".to_string(),
                                    subgraphs: Vec::new(),
                                    restructure: false,
                                    destructure: false,
                                    params: Params::new(),
                                });
                            }
                        }
                        (None, None) => unreachable!(
                            "equation {} reached without any output tracer",
                            e.id
                        ),
                    }
                }
                Recipe::LambdaBinding => {
                    assert!(
                        in_set.contains(&t),
                        "argument tracer {t:?} from another scope reached \
                         extraction at level {level}"
                    );
                }
                Recipe::FreeVar(target) => {
                    env.push((ex.var(t), target));
                }
                Recipe::ConstVar(val) => {
                    consts.push((ex.var(t), val));
                }
                Recipe::PureConst => {
                    assert!(
                        t == out_tracer,
                        "un-materialized constant tracer {t:?} reached \
                         extraction"
                    );
                }
            }
        }

        let out_var = match self.data(out_tracer).recipe {
            Recipe::PureConst => None,
            _ => Some(ex.var(out_tracer)),
        };

        let (const_vars, const_vals): (Vec<_>, Vec<_>) =
            consts.into_iter().unzip();
        let (env_vars, env_targets): (Vec<_>, Vec<_>) = env.into_iter().unzip();

        let graph = Graph::new(const_vars, env_vars, in_vars, out_var, eqns);
        graph.check();
        (graph, const_vals, env_targets)
    }
}

// The per-extraction variable allocator, memoized by tracer handle.
struct Extractor {
    gen: VarGen,
    t_to_var: HashMap<TracerId, Var>,
}

impl Extractor {
    fn var(&mut self, t: TracerId) -> Var {
        let gen = &mut self.gen;
        *self.t_to_var.entry(t).or_insert_with(|| gen.fresh())
    }

    fn translate(
        &mut self,
        e: &EqnRecipe,
        outputs: Vec<Option<Var>>,
        destructure: bool,
    ) -> Equation {
        Equation {
            inputs: e
                .inputs
                .iter()
                .map(|t| InRef::Var(self.var(*t)))
                .collect(),
            outputs,
            prim: e.prim.clone(),
            subgraphs: e
                .subgraphs
                .iter()
                .map(|b| BoundGraph {
                    graph: b.graph.clone(),
                    const_vars: b
                        .const_tracers
                        .iter()
                        .map(|t| self.var(*t))
                        .collect(),
                    env_vars: b
                        .env_tracers
                        .iter()
                        .map(|t| self.var(*t))
                        .collect(),
                })
                .collect(),
            restructure: false,
            destructure,
            params: e.params.clone(),
        }
    }
}

// The engine-owned partial-evaluation rule for `pack`: keep per-component
// knownness instead of collapsing the tuple to fully unknown.
pub(crate) fn pack_partial_eval(
    trace: &mut Trace<'_>,
    level: usize,
    tracers: &[TracerId],
    params: &Params,
) -> Result<TraceValue> {
    if tracers.iter().all(|t| trace.is_known(*t)) {
        let vals = tracers
            .iter()
            .map(|t| trace.full_lower(*t))
            .collect::<Vec<_>>();
        return trace.bind("pack", &vals, params);
    }
    let pvals = tracers
        .iter()
        .map(|t| trace.pval(*t).clone())
        .collect::<Vec<_>>();
    let mut inst = Vec::with_capacity(tracers.len());
    for t in tracers {
        inst.push(trace.instantiate_const(level, *t)?);
    }
    let eqn = trace.new_eqn(level, "pack", inst, Vec::new(), false, params.clone());
    Ok(TraceValue::Tracer(trace.new_tracer(
        level,
        PartialValue::tuple(pvals),
        Recipe::Eqn(eqn),
    )))
}

fn strip_axis_pval(pv: &PartialValue) -> Result<PartialValue> {
    match pv {
        PartialValue::Known(_) => Ok(pv.clone()),
        PartialValue::Unknown(a) => {
            Ok(PartialValue::Unknown(a.strip_leading_axis()?))
        }
        PartialValue::Tuple(parts) => Ok(PartialValue::Tuple(
            parts
                .iter()
                .map(strip_axis_pval)
                .collect::<Result<Vec<_>>>()?,
        )),
    }
}

fn add_axis_pval(size: usize, pv: &PartialValue) -> PartialValue {
    match pv {
        PartialValue::Known(_) => pv.clone(),
        PartialValue::Unknown(a) => {
            PartialValue::Unknown(a.with_leading_axis(size))
        }
        PartialValue::Tuple(parts) => PartialValue::Tuple(
            parts.iter().map(|p| add_axis_pval(size, p)).collect(),
        ),
    }
}

/// Re-interprets a closed graph's body, equation by equation, through the
/// trace's dispatch. With no active levels this is direct concrete
/// evaluation; under a trace it re-stages the graph, which is how the
/// partial-evaluation split re-runs a program under a different
/// interpretation.
pub struct GraphFn<'g> {
    graph: &'g Graph,
    consts: Vec<TraceValue>,
    env: Vec<TraceValue>,
}

impl<'g> GraphFn<'g> {
    /// A callable over a closed graph and its captured constants.
    pub fn new(graph: &'g Graph, consts: Vec<TraceValue>) -> Self {
        assert!(
            graph.is_closed(),
            "GraphFn requires a closed graph; this one has {} free variables",
            graph.free_vars.len()
        );
        Self::with_env(graph, consts, Vec::new())
    }

    pub(crate) fn with_env(
        graph: &'g Graph,
        consts: Vec<TraceValue>,
        env: Vec<TraceValue>,
    ) -> Self {
        GraphFn { graph, consts, env }
    }
}

fn lookup(scope: &HashMap<Var, TraceValue>, v: Var, who: &str) -> TraceValue {
    scope
        .get(&v)
        .unwrap_or_else(|| panic!("'{who}' reads unbound variable {v}"))
        .clone()
}

impl GraphFn<'_> {
    /// Interpret the graph body on the given arguments.
    ///
    /// `GraphFn` cannot implement [`Traceable`] directly (the blanket
    /// closure impl forbids it); pass `&|tr, a| f.call(tr, a)` where a
    /// `&dyn Traceable` is needed.
    pub fn call(
        &self,
        trace: &mut Trace<'_>,
        args: &[TraceValue],
    ) -> Result<TraceValue> {
        let g = self.graph;
        assert_eq!(
            args.len(),
            g.in_vars.len(),
            "graph applied to {} values but declares {} inputs",
            args.len(),
            g.in_vars.len()
        );
        assert_eq!(
            self.consts.len(),
            g.const_vars.len(),
            "graph given {} constants but declares {}",
            self.consts.len(),
            g.const_vars.len()
        );
        assert_eq!(
            self.env.len(),
            g.free_vars.len(),
            "graph given {} environment values but declares {}",
            self.env.len(),
            g.free_vars.len()
        );

        let mut scope: HashMap<Var, TraceValue> = HashMap::new();
        for (v, val) in g.const_vars.iter().zip(&self.consts) {
            scope.insert(*v, val.clone());
        }
        for (v, val) in g.free_vars.iter().zip(&self.env) {
            scope.insert(*v, val.clone());
        }
        for (v, val) in g.in_vars.iter().zip(args) {
            scope.insert(*v, val.clone());
        }

        for eqn in &g.eqns {
            let mut ins = Vec::with_capacity(eqn.inputs.len());
            for r in &eqn.inputs {
                match r {
                    InRef::Var(v) => ins.push(lookup(&scope, *v, &eqn.prim)),
                    InRef::Tuple(vs) => {
                        let vals = vs
                            .iter()
                            .map(|v| lookup(&scope, *v, &eqn.prim))
                            .collect::<Vec<_>>();
                        ins.push(trace.pack(&vals)?);
                    }
                }
            }
            let result = if !eqn.subgraphs.is_empty() {
                let b = &eqn.subgraphs[0];
                let sub_consts = b
                    .const_vars
                    .iter()
                    .map(|v| lookup(&scope, *v, &eqn.prim))
                    .collect::<Vec<_>>();
                let sub_env = b
                    .env_vars
                    .iter()
                    .map(|v| lookup(&scope, *v, &eqn.prim))
                    .collect::<Vec<_>>();
                let f = GraphFn::with_env(&b.graph, sub_consts, sub_env);
                let body = |tr: &mut Trace<'_>, a: &[TraceValue]| f.call(tr, a);
                trace.bind_call(&eqn.prim, &body, &ins, &eqn.params)?
            } else if eqn.prim == "unpack" {
                ins[0].clone()
            } else {
                trace.bind(&eqn.prim, &ins, &eqn.params)?
            };
            if eqn.destructure {
                let parts = trace.unpack(&result)?;
                assert_eq!(
                    parts.len(),
                    eqn.outputs.len(),
                    "equation '{}' declares {} outputs but produced {}",
                    eqn.prim,
                    eqn.outputs.len(),
                    parts.len()
                );
                for (slot, part) in eqn.outputs.iter().zip(parts) {
                    if let Some(v) = slot {
                        scope.insert(*v, part);
                    }
                }
            } else {
                assert_eq!(
                    eqn.outputs.len(),
                    1,
                    "equation '{}' declares {} outputs without destructuring",
                    eqn.prim,
                    eqn.outputs.len()
                );
                if let Some(v) = eqn.outputs[0] {
                    scope.insert(v, result);
                }
            }
        }

        Ok(match g.out_var {
            Some(v) => lookup(&scope, v, "output"),
            None => TraceValue::unit(),
        })
    }
}
