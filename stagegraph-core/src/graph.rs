//! Closed graph representation of a staged computation.
//!
//! A [`Graph`] is the engine's sole product: an acyclic, single-assignment
//! list of [`Equation`]s over [`Var`]s, closed over explicit constants, free
//! variables, and inputs. Downstream consumers walk `eqns` in order, resolve
//! each equation's inputs by variable identity, and either execute or lower
//! them.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::Path;

use petgraph::dot::{Config, Dot};
use petgraph::graph::NodeIndex;
use petgraph::Graph as PetGraph;

use crate::primitive::Catalog;
use crate::trace::{GraphFn, Trace, TraceValue};
use crate::value::Value;
use crate::{bail, Result};

/// A variable, unique within one extracted graph.
///
/// Variables are allocated from a counter during graph extraction and
/// rendered as short alphabetic names (`a`, `b`, …, `z`, `aa`, `ab`, …) for
/// debugging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Var(pub(crate) u32);

impl Var {
    /// Build a variable with an explicit index, for constructing graphs by
    /// hand.
    pub fn new(index: u32) -> Self {
        Var(index)
    }
}

impl fmt::Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut n = self.0 as u64;
        let mut s = Vec::new();
        loop {
            s.push(b'a' + (n % 26) as u8);
            if n < 26 {
                break;
            }
            n = n / 26 - 1;
        }
        s.reverse();
        write!(f, "{}", std::str::from_utf8(&s).unwrap())
    }
}

/// Allocator of fresh variables for one extraction pass.
#[derive(Debug, Default)]
pub(crate) struct VarGen {
    next: u32,
}

impl VarGen {
    pub(crate) fn new() -> Self {
        Self { next: 0 }
    }

    /// Start above every variable already present in `graph`, so freshly
    /// synthesized variables cannot collide with it.
    pub(crate) fn starting_after(graph: &Graph) -> Self {
        Self {
            next: graph.max_var().map_or(0, |v| v + 1),
        }
    }

    pub(crate) fn fresh(&mut self) -> Var {
        let v = Var(self.next);
        self.next += 1;
        v
    }
}

/// A static parameter attached to an equation.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamVal {
    Bool(bool),
    I64(i64),
    F64(f64),
    Str(String),
    Size(usize),
    SizeVec(Vec<usize>),
}

impl ParamVal {
    pub fn as_size(&self) -> Result<usize> {
        match self {
            ParamVal::Size(n) => Ok(*n),
            ParamVal::I64(n) if *n >= 0 => Ok(*n as usize),
            other => bail!("parameter {other:?} is not a size"),
        }
    }
}

/// Primitive-specific static parameters, in deterministic order.
pub type Params = BTreeMap<String, ParamVal>;

/// An equation input: one variable, or a flat tuple of variables that must be
/// restructured into a tuple value before use.
#[derive(Debug, Clone, PartialEq)]
pub enum InRef {
    Var(Var),
    Tuple(Vec<Var>),
}

impl InRef {
    fn vars(&self) -> impl Iterator<Item = Var> + '_ {
        match self {
            InRef::Var(v) => std::slice::from_ref(v).iter().copied(),
            InRef::Tuple(vs) => vs.as_slice().iter().copied(),
        }
    }
}

/// A sub-graph bound by a higher-order (call-like or map-like) equation,
/// together with the caller-side variables that feed its constants and free
/// variables.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundGraph {
    pub graph: Graph,
    pub const_vars: Vec<Var>,
    pub env_vars: Vec<Var>,
}

/// One recorded primitive application.
///
/// `outputs` declares every result of the primitive; a `None` entry is a
/// discarded output that downstream code never names. `destructure` marks
/// equations whose (tuple-valued) result is split across several output
/// variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Equation {
    pub inputs: Vec<InRef>,
    pub outputs: Vec<Option<Var>>,
    pub prim: String,
    pub subgraphs: Vec<BoundGraph>,
    pub restructure: bool,
    pub destructure: bool,
    pub params: Params,
}

impl Equation {
    /// A plain single-output equation with no bound sub-graphs.
    pub fn simple(
        prim: impl Into<String>,
        inputs: Vec<Var>,
        output: Var,
        params: Params,
    ) -> Self {
        Equation {
            inputs: inputs.into_iter().map(InRef::Var).collect(),
            outputs: vec![Some(output)],
            prim: prim.into(),
            subgraphs: Vec::new(),
            restructure: false,
            destructure: false,
            params,
        }
    }

    /// The destructuring equation synthesized by closure conversion: split
    /// `input` into `outputs`, one variable per tuple component.
    pub(crate) fn unpack(input: Var, outputs: Vec<Var>) -> Self {
        Equation {
            inputs: vec![InRef::Var(input)],
            outputs: outputs.into_iter().map(Some).collect(),
            prim: "unpack".to_string(),
            subgraphs: Vec::new(),
            restructure: false,
            destructure: true,
            params: Params::new(),
        }
    }

    pub(crate) fn input_vars(&self) -> impl Iterator<Item = Var> + '_ {
        self.inputs.iter().flat_map(|r| r.vars())
    }
}

/// A closed description of a staged computation.
///
/// Every variable an equation references is bound earlier: as a constant, a
/// free variable, an input, or the output of a preceding equation. A graph
/// with no free variables is self-contained given its constants.
#[derive(Debug, Clone, PartialEq)]
pub struct Graph {
    /// Variables bound to captured constants, in the order the matching
    /// constant values are supplied.
    pub const_vars: Vec<Var>,
    /// Variables bound to an external environment; empty for closed graphs.
    pub free_vars: Vec<Var>,
    /// The explicit inputs, in argument order.
    pub in_vars: Vec<Var>,
    /// The output. `None` means the traced output was fully known and nothing
    /// was staged.
    pub out_var: Option<Var>,
    /// The recorded equations, in execution order.
    pub eqns: Vec<Equation>,
}

impl Graph {
    pub fn new(
        const_vars: Vec<Var>,
        free_vars: Vec<Var>,
        in_vars: Vec<Var>,
        out_var: Option<Var>,
        eqns: Vec<Equation>,
    ) -> Self {
        Graph {
            const_vars,
            free_vars,
            in_vars,
            out_var,
            eqns,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.free_vars.is_empty()
    }

    /// Validate the single-assignment discipline: no variable bound twice,
    /// none referenced before it is bound.
    ///
    /// Violations are internal consistency errors, so this panics naming the
    /// offending equation rather than returning an error.
    pub fn check(&self) {
        let mut bound: HashSet<Var> = HashSet::new();
        for v in self
            .const_vars
            .iter()
            .chain(&self.free_vars)
            .chain(&self.in_vars)
        {
            assert!(bound.insert(*v), "variable {v} bound twice in graph header");
        }
        for (i, eqn) in self.eqns.iter().enumerate() {
            for v in eqn.input_vars() {
                assert!(
                    bound.contains(&v),
                    "equation #{i} '{}' reads unbound variable {v}",
                    eqn.prim
                );
            }
            for sub in &eqn.subgraphs {
                for v in sub.const_vars.iter().chain(&sub.env_vars) {
                    assert!(
                        bound.contains(v),
                        "equation #{i} '{}' captures unbound variable {v}",
                        eqn.prim
                    );
                }
                sub.graph.check();
            }
            for v in eqn.outputs.iter().flatten() {
                assert!(
                    bound.insert(*v),
                    "equation #{i} '{}' rebinds variable {v}",
                    eqn.prim
                );
            }
        }
        if let Some(v) = self.out_var {
            assert!(bound.contains(&v), "graph output {v} is unbound");
        }
    }

    /// Evaluate this closed graph on concrete constants and arguments.
    ///
    /// Evaluation is re-tracing under an empty trace: with no placeholders in
    /// scope, every primitive application runs its impl rule eagerly. Value
    /// counts that disagree with the declared variables are a programming
    /// error and panic.
    pub fn eval(
        &self,
        catalog: &Catalog,
        consts: &[Value],
        args: &[Value],
    ) -> Result<Value> {
        assert!(
            self.is_closed(),
            "cannot evaluate a graph with free variables; use eval_with_env"
        );
        self.eval_with_env(catalog, consts, &[], args)
    }

    /// Evaluate with an explicit environment for the free variables.
    pub fn eval_with_env(
        &self,
        catalog: &Catalog,
        consts: &[Value],
        env: &[Value],
        args: &[Value],
    ) -> Result<Value> {
        let mut trace = Trace::new(catalog);
        let consts: Vec<TraceValue> =
            consts.iter().cloned().map(TraceValue::Concrete).collect();
        let env: Vec<TraceValue> =
            env.iter().cloned().map(TraceValue::Concrete).collect();
        let args: Vec<TraceValue> =
            args.iter().cloned().map(TraceValue::Concrete).collect();
        let f = GraphFn::with_env(self, consts, env);
        match f.call(&mut trace, &args)? {
            TraceValue::Concrete(v) => Ok(v),
            TraceValue::Tracer(_) => {
                unreachable!("concrete evaluation produced a tracer")
            }
        }
    }

    /// Largest variable id appearing in this graph's own scope, if any.
    pub(crate) fn max_var(&self) -> Option<u32> {
        self.const_vars
            .iter()
            .chain(&self.free_vars)
            .chain(&self.in_vars)
            .map(|v| v.0)
            .chain(self.out_var.iter().map(|v| v.0))
            .chain(
                self.eqns
                    .iter()
                    .flat_map(|e| e.outputs.iter().flatten().map(|v| v.0)),
            )
            .max()
    }

    /// Project the dataflow into a `petgraph` graph for inspection.
    pub fn to_petgraph(&self) -> PetGraph<String, ()> {
        let mut g = PetGraph::<String, ()>::new();
        // producer of each variable
        let mut producer: HashMap<Var, NodeIndex> = HashMap::new();

        for v in &self.const_vars {
            producer.insert(*v, g.add_node(format!("const {v}")));
        }
        for v in &self.free_vars {
            producer.insert(*v, g.add_node(format!("free {v}")));
        }
        for v in &self.in_vars {
            producer.insert(*v, g.add_node(format!("in {v}")));
        }
        for eqn in &self.eqns {
            let label = if eqn.subgraphs.is_empty() {
                eqn.prim.clone()
            } else {
                format!("{}[{} subgraph]", eqn.prim, eqn.subgraphs.len())
            };
            let node = g.add_node(label);
            for v in eqn.input_vars() {
                if let Some(src) = producer.get(&v) {
                    g.add_edge(*src, node, ());
                }
            }
            for sub in &eqn.subgraphs {
                for v in sub.const_vars.iter().chain(&sub.env_vars) {
                    if let Some(src) = producer.get(v) {
                        g.add_edge(*src, node, ());
                    }
                }
            }
            for v in eqn.outputs.iter().flatten() {
                producer.insert(*v, node);
            }
        }
        g
    }

    /// Produce a DOT format string of this graph.
    pub fn to_dot(&self) -> String {
        let g = self.to_petgraph();
        format!("{:?}", Dot::with_config(&g, &[Config::EdgeNoLabel]))
    }

    /// Render the graph to a PNG via graphviz.
    ///
    /// Install graphviz:
    /// - brew install graphviz
    /// - apt install graphviz
    pub fn visualize<P: AsRef<Path>>(&self, filename: P) -> Result<()> {
        let path = filename.as_ref();
        let tmp_dir = std::env::temp_dir();
        let dot_path = tmp_dir.join("graph.dot");

        std::fs::write(&dot_path, self.to_dot())?;
        let status = std::process::Command::new("dot")
            .args([
                "-Tpng",
                &dot_path.display().to_string(),
                "-o",
                &path.display().to_string(),
            ])
            .status()?;
        if !status.success() {
            bail!("graphviz failed on {}", dot_path.display());
        }
        Ok(())
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ lambda ")?;
        for v in &self.const_vars {
            write!(f, "{v} ")?;
        }
        write!(f, "; ")?;
        for v in &self.free_vars {
            write!(f, "{v} ")?;
        }
        write!(f, "; ")?;
        for v in &self.in_vars {
            write!(f, "{v} ")?;
        }
        writeln!(f, ".")?;
        for eqn in &self.eqns {
            write!(f, "  let ")?;
            for (i, out) in eqn.outputs.iter().enumerate() {
                if i > 0 {
                    write!(f, " ")?;
                }
                match out {
                    Some(v) => write!(f, "{v}")?,
                    None => write!(f, "_")?,
                }
            }
            write!(f, " = {}", eqn.prim)?;
            for r in &eqn.inputs {
                match r {
                    InRef::Var(v) => write!(f, " {v}")?,
                    InRef::Tuple(vs) => {
                        write!(f, " (")?;
                        for (i, v) in vs.iter().enumerate() {
                            if i > 0 {
                                write!(f, " ")?;
                            }
                            write!(f, "{v}")?;
                        }
                        write!(f, ")")?;
                    }
                }
            }
            for sub in &eqn.subgraphs {
                write!(f, " {{consts")?;
                for v in &sub.const_vars {
                    write!(f, " {v}")?;
                }
                write!(f, "; env")?;
                for v in &sub.env_vars {
                    write!(f, " {v}")?;
                }
                write!(f, "; {} eqns}}", sub.graph.eqns.len())?;
            }
            if !eqn.params.is_empty() {
                write!(f, " {:?}", eqn.params)?;
            }
            writeln!(f)?;
        }
        match self.out_var {
            Some(v) => write!(f, "  in {v} }}"),
            None => write!(f, "  in () }}"),
        }
    }
}
