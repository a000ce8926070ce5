mod common;

use std::cell::RefCell;

use common::{catalog, sc, vec1};
use stagegraph_core::{
    Aval, Catalog, DType, Error, ParamVal, Params, PartialValue, PrimitiveDef,
    Result, Trace, TraceValue,
};

fn unknown_scalar() -> PartialValue {
    PartialValue::unknown(Aval::scalar(DType::F64))
}

fn no_params() -> Params {
    Params::new()
}

#[test]
fn trace_records_and_graph_evaluates() {
    let cat = catalog();
    let mut tr = Trace::new(&cat);
    let f = |tr: &mut Trace<'_>, args: &[TraceValue]| {
        tr.bind("add", &[args[0].clone(), args[1].clone()], &no_params())
    };
    let (graph, out_pval, consts) = tr
        .trace_to_graph(&f, vec![unknown_scalar(), unknown_scalar()], false)
        .unwrap();

    assert_eq!(graph.eqns.len(), 1);
    assert_eq!(graph.eqns[0].prim, "add");
    assert_eq!(graph.in_vars.len(), 2);
    assert!(graph.out_var.is_some());
    assert!(graph.is_closed());
    assert!(consts.is_empty());
    assert!(!out_pval.is_known());

    let out = graph.eval(&cat, &[], &[sc(2.0), sc(3.0)]).unwrap();
    assert_eq!(out.as_scalar().unwrap(), 5.0);
}

#[test]
fn literal_constants_are_lifted() {
    let cat = catalog();
    let mut tr = Trace::new(&cat);
    let f = |tr: &mut Trace<'_>, args: &[TraceValue]| {
        tr.bind(
            "mul",
            &[args[0].clone(), TraceValue::Concrete(sc(4.0))],
            &no_params(),
        )
    };
    let (graph, _, consts) = tr
        .trace_to_graph(&f, vec![unknown_scalar()], false)
        .unwrap();

    assert_eq!(graph.const_vars.len(), 1);
    assert_eq!(consts, vec![TraceValue::Concrete(sc(4.0))]);

    let out = graph.eval(&cat, &[sc(4.0)], &[sc(2.5)]).unwrap();
    assert_eq!(out.as_scalar().unwrap(), 10.0);
}

#[test]
fn known_inputs_evaluate_eagerly() {
    let cat = catalog();
    let mut tr = Trace::new(&cat);
    // (x * x) + y with x known: the square folds away at trace time.
    let f = |tr: &mut Trace<'_>, args: &[TraceValue]| {
        let xx =
            tr.bind("mul", &[args[0].clone(), args[0].clone()], &no_params())?;
        tr.bind("add", &[xx, args[1].clone()], &no_params())
    };
    let pvals = vec![PartialValue::known(sc(3.0)), unknown_scalar()];
    let (graph, _, consts) = tr.trace_to_graph(&f, pvals, false).unwrap();

    assert_eq!(graph.eqns.len(), 1);
    assert_eq!(graph.eqns[0].prim, "add");
    assert_eq!(consts, vec![TraceValue::Concrete(sc(9.0))]);

    // The known slot is a dead input; only y feeds the staged half.
    let out = graph
        .eval(&cat, &[sc(9.0)], &[sc(3.0), sc(5.0)])
        .unwrap();
    assert_eq!(out.as_scalar().unwrap(), 14.0);
}

#[test]
fn destructuring_emits_one_equation_with_placeholders() {
    let cat = catalog();
    let mut tr = Trace::new(&cat);
    // Only the square is used; the cube output stays a placeholder.
    let f = |tr: &mut Trace<'_>, args: &[TraceValue]| {
        let both = tr.bind("split_pow", &[args[0].clone()], &no_params())?;
        let parts = tr.unpack(&both)?;
        tr.bind(
            "add",
            &[parts[0].clone(), TraceValue::Concrete(sc(1.0))],
            &no_params(),
        )
    };
    let (graph, _, _) = tr
        .trace_to_graph(&f, vec![unknown_scalar()], false)
        .unwrap();

    let split_eqns: Vec<_> = graph
        .eqns
        .iter()
        .filter(|e| e.prim == "split_pow")
        .collect();
    assert_eq!(split_eqns.len(), 1);
    let eqn = split_eqns[0];
    assert_eq!(eqn.outputs.len(), 2);
    assert!(eqn.outputs[0].is_some());
    assert!(eqn.outputs[1].is_none());
    assert!(eqn.destructure);
    assert_eq!(graph.eqns.len(), 2);

    let out = graph.eval(&cat, &[sc(1.0)], &[sc(3.0)]).unwrap();
    assert_eq!(out.as_scalar().unwrap(), 10.0);
}

#[test]
fn destructuring_with_all_outputs_used() {
    let cat = catalog();
    let mut tr = Trace::new(&cat);
    let f = |tr: &mut Trace<'_>, args: &[TraceValue]| {
        let both = tr.bind("split_pow", &[args[0].clone()], &no_params())?;
        let parts = tr.unpack(&both)?;
        tr.bind("add", &[parts[0].clone(), parts[1].clone()], &no_params())
    };
    let (graph, _, _) = tr
        .trace_to_graph(&f, vec![unknown_scalar()], false)
        .unwrap();

    let eqn = &graph.eqns[0];
    assert_eq!(eqn.prim, "split_pow");
    assert!(eqn.outputs.iter().all(|o| o.is_some()));
    assert_eq!(graph.eqns.len(), 2);

    let out = graph.eval(&cat, &[], &[sc(2.0)]).unwrap();
    assert_eq!(out.as_scalar().unwrap(), 12.0);
}

fn sin_times_self(
    tr: &mut Trace<'_>,
    args: &[TraceValue],
) -> Result<TraceValue> {
    let s = tr.bind("sin", &[args[0].clone()], &Params::new())?;
    tr.bind("mul", &[s, args[0].clone()], &Params::new())
}

#[test]
fn staged_call_binds_the_callee_as_a_subgraph() {
    let cat = catalog();
    let mut tr = Trace::new(&cat);
    let f = |tr: &mut Trace<'_>, args: &[TraceValue]| {
        tr.bind_call(
            "compiled_call",
            &sin_times_self,
            &[args[0].clone()],
            &no_params(),
        )
    };
    let (graph, _, _) = tr
        .trace_to_graph(&f, vec![unknown_scalar()], false)
        .unwrap();

    assert_eq!(graph.eqns.len(), 1);
    let eqn = &graph.eqns[0];
    assert_eq!(eqn.prim, "compiled_call");
    assert_eq!(eqn.subgraphs.len(), 1);
    let sub = &eqn.subgraphs[0].graph;

    // The bound body matches a direct trace of the callee, up to renaming.
    let mut tr2 = Trace::new(&cat);
    let (direct, _, _) = tr2
        .trace_to_graph(&sin_times_self, vec![unknown_scalar()], false)
        .unwrap();
    let sub_prims: Vec<_> = sub.eqns.iter().map(|e| e.prim.clone()).collect();
    let direct_prims: Vec<_> =
        direct.eqns.iter().map(|e| e.prim.clone()).collect();
    assert_eq!(sub_prims, direct_prims);
    assert_eq!(sub.in_vars.len(), direct.in_vars.len());
    assert_eq!(sub.const_vars.len(), direct.const_vars.len());

    let out = graph.eval(&cat, &[], &[sc(3.0)]).unwrap();
    assert_eq!(out.as_scalar().unwrap(), 3.0_f64.sin() * 3.0);
}

#[test]
fn closed_over_argument_becomes_a_free_variable() {
    let cat = catalog();
    let mut tr = Trace::new(&cat);
    let f = |tr: &mut Trace<'_>, args: &[TraceValue]| {
        let x = args[0].clone();
        let g = move |tr: &mut Trace<'_>, inner: &[TraceValue]| {
            tr.bind("mul", &[x.clone(), inner[0].clone()], &Params::new())
        };
        tr.bind_call("compiled_call", &g, &[args[1].clone()], &no_params())
    };
    let (graph, _, _) = tr
        .trace_to_graph(&f, vec![unknown_scalar(), unknown_scalar()], false)
        .unwrap();

    assert_eq!(graph.eqns.len(), 1);
    let bound = &graph.eqns[0].subgraphs[0];
    assert_eq!(bound.graph.free_vars.len(), 1);
    assert_eq!(bound.env_vars.len(), 1);

    let out = graph.eval(&cat, &[], &[sc(3.0), sc(4.0)]).unwrap();
    assert_eq!(out.as_scalar().unwrap(), 12.0);
}

#[test]
fn closed_over_value_returned_from_call_is_rehomed() {
    let cat = catalog();
    let mut tr = Trace::new(&cat);
    let f = |tr: &mut Trace<'_>, args: &[TraceValue]| {
        let x = args[0].clone();
        let g = move |_tr: &mut Trace<'_>,
                      _inner: &[TraceValue]|
              -> Result<TraceValue> { Ok(x.clone()) };
        tr.bind_call("compiled_call", &g, &[args[0].clone()], &no_params())
    };
    let (graph, _, _) = tr
        .trace_to_graph(&f, vec![unknown_scalar()], false)
        .unwrap();

    assert_eq!(graph.eqns.len(), 1);
    let bound = &graph.eqns[0].subgraphs[0];
    assert!(bound.graph.eqns.is_empty());
    assert_eq!(bound.graph.free_vars.len(), 1);

    let out = graph.eval(&cat, &[], &[sc(5.0)]).unwrap();
    assert_eq!(out.as_scalar().unwrap(), 5.0);
}

#[test]
fn call_without_traced_arguments_dissolves() {
    let cat = catalog();
    let mut tr = Trace::new(&cat);
    // The callee takes no traced arguments but closes over one; the call is
    // transparent and the captured operation records at the outer level.
    let f = |tr: &mut Trace<'_>, args: &[TraceValue]| {
        let x = args[0].clone();
        let g = move |tr: &mut Trace<'_>, _inner: &[TraceValue]| {
            tr.bind("neg", &[x.clone()], &Params::new())
        };
        tr.bind_call("compiled_call", &g, &[], &no_params())
    };
    let (graph, _, _) = tr
        .trace_to_graph(&f, vec![unknown_scalar()], false)
        .unwrap();

    assert_eq!(graph.eqns.len(), 1);
    assert_eq!(graph.eqns[0].prim, "neg");
}

#[test]
fn mapped_call_strips_and_restores_the_axis() {
    let cat = catalog();
    let mut tr = Trace::new(&cat);
    let add_one = |tr: &mut Trace<'_>, args: &[TraceValue]| {
        tr.bind(
            "add",
            &[args[0].clone(), TraceValue::Concrete(sc(1.0))],
            &Params::new(),
        )
    };
    let f = |tr: &mut Trace<'_>, args: &[TraceValue]| {
        let mut params = Params::new();
        params.insert("axis_size".to_string(), ParamVal::Size(3));
        tr.bind_call("batched_call", &add_one, &[args[0].clone()], &params)
    };
    let batched = PartialValue::unknown(Aval::Shaped {
        shape: vec![3],
        dtype: DType::F64,
    });
    let (graph, out_pval, consts) =
        tr.trace_to_graph(&f, vec![batched], false).unwrap();

    assert_eq!(graph.eqns.len(), 1);
    let eqn = &graph.eqns[0];
    assert_eq!(eqn.prim, "batched_call");
    // The body constant was rewritten into a leading input.
    assert_eq!(eqn.inputs.len(), 2);
    let bound = &eqn.subgraphs[0];
    assert!(bound.graph.const_vars.is_empty());
    assert!(bound.const_vars.is_empty());
    assert_eq!(bound.graph.in_vars.len(), 2);
    assert_eq!(consts.len(), 1);

    // The output type regained the mapped axis.
    assert_eq!(
        out_pval.as_aval().unwrap(),
        Aval::Shaped {
            shape: vec![3],
            dtype: DType::F64
        }
    );

    let out = graph
        .eval(&cat, &[sc(1.0)], &[vec1(&[1.0, 2.0, 3.0])])
        .unwrap();
    assert_eq!(out, vec1(&[2.0, 3.0, 4.0]));
}

#[test]
fn known_output_stays_out_of_the_graph() {
    let cat = catalog();
    let mut tr = Trace::new(&cat);
    let f = |_tr: &mut Trace<'_>, _args: &[TraceValue]| -> Result<TraceValue> {
        Ok(TraceValue::Concrete(sc(7.0)))
    };

    let (graph, out_pval, consts) = tr
        .trace_to_graph(&f, vec![unknown_scalar()], false)
        .unwrap();
    assert!(out_pval.is_known());
    assert!(graph.out_var.is_none());
    assert!(graph.eqns.is_empty());
    assert!(consts.is_empty());

    // Instantiation materializes it as a constant instead.
    let (graph, _, consts) = tr
        .trace_to_graph(&f, vec![unknown_scalar()], true)
        .unwrap();
    assert!(graph.out_var.is_some());
    assert_eq!(consts, vec![TraceValue::Concrete(sc(7.0))]);
    let out = graph.eval(&cat, &[sc(7.0)], &[sc(0.0)]).unwrap();
    assert_eq!(out.as_scalar().unwrap(), 7.0);
}

#[test]
fn abstract_eval_fun_predicts_output_types() {
    let cat = catalog();
    let mut tr = Trace::new(&cat);
    let aval = tr
        .abstract_eval_fun(
            &sin_times_self,
            &[Aval::scalar(DType::F64)],
        )
        .unwrap();
    assert_eq!(aval, Aval::scalar(DType::F64));
}

#[test]
fn graph_debug_output_names_primitives() {
    let cat = catalog();
    let mut tr = Trace::new(&cat);
    let f = |tr: &mut Trace<'_>, args: &[TraceValue]| {
        tr.bind("add", &[args[0].clone(), args[1].clone()], &no_params())
    };
    let (graph, _, _) = tr
        .trace_to_graph(&f, vec![unknown_scalar(), unknown_scalar()], false)
        .unwrap();
    assert!(graph.to_dot().contains("add"));
    assert!(format!("{graph}").contains("add"));
}

#[test]
#[should_panic(expected = "escaped its call scope")]
fn tracer_escaping_its_call_scope_panics() {
    let cat = catalog();
    let mut tr = Trace::new(&cat);
    let cell: RefCell<Option<TraceValue>> = RefCell::new(None);
    let f = |tr: &mut Trace<'_>, args: &[TraceValue]| {
        let g = |tr: &mut Trace<'_>, inner: &[TraceValue]| {
            cell.borrow_mut().replace(inner[0].clone());
            tr.bind("neg", &[inner[0].clone()], &Params::new())
        };
        let _ = tr.bind_call(
            "compiled_call",
            &g,
            &[args[0].clone()],
            &Params::new(),
        )?;
        let leaked = cell.borrow().clone().unwrap();
        tr.bind("neg", &[leaked], &Params::new())
    };
    let _ = tr.trace_to_graph(&f, vec![unknown_scalar()], false);
}

#[test]
#[should_panic(expected = "finished trace")]
fn tracer_outliving_its_trace_panics() {
    let cat = catalog();
    let mut tr = Trace::new(&cat);
    let cell: RefCell<Option<TraceValue>> = RefCell::new(None);
    let f = |tr: &mut Trace<'_>, args: &[TraceValue]| {
        cell.borrow_mut().replace(args[0].clone());
        tr.bind("neg", &[args[0].clone()], &Params::new())
    };
    tr.trace_to_graph(&f, vec![unknown_scalar()], false).unwrap();
    let leaked = cell.borrow().clone().unwrap();
    let _ = tr.bind("neg", &[leaked], &Params::new());
}

#[test]
#[should_panic(expected = "declares")]
fn applying_a_graph_with_wrong_arity_panics() {
    let cat = catalog();
    let mut tr = Trace::new(&cat);
    let f = |tr: &mut Trace<'_>, args: &[TraceValue]| {
        tr.bind("neg", &[args[0].clone()], &no_params())
    };
    let (graph, _, _) = tr
        .trace_to_graph(&f, vec![unknown_scalar()], false)
        .unwrap();
    let _ = graph.eval(&cat, &[], &[]);
}

#[test]
fn unknown_primitive_is_a_user_error() {
    let cat = catalog();
    let mut tr = Trace::new(&cat);
    let err = tr
        .bind("bogus", &[TraceValue::Concrete(sc(1.0))], &no_params())
        .unwrap_err();
    assert!(matches!(err, Error::UnknownPrimitive(_)));
}

#[test]
fn missing_impl_rule_is_a_user_error() {
    fn mystery_abstract(
        avals: &[Aval],
        _params: &Params,
    ) -> Result<Aval> {
        Ok(avals[0].clone())
    }
    let mut cat = Catalog::new();
    cat.register(PrimitiveDef::new("mystery", mystery_abstract));
    let mut tr = Trace::new(&cat);
    let err = tr
        .bind("mystery", &[TraceValue::Concrete(sc(1.0))], &no_params())
        .unwrap_err();
    assert!(matches!(err, Error::UnsupportedPrimitive { .. }));
}
