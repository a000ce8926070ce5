use criterion::{criterion_group, criterion_main, Criterion};
use stagegraph_core::{
    ArrayValue, Aval, Catalog, DType, Params, PartialValue, PrimitiveDef,
    Result, Trace, TraceValue, Value,
};

fn add_abstract(avals: &[Aval], _params: &Params) -> Result<Aval> {
    avals[0].join(&avals[1])
}

fn add_impl(vals: &[Value], _params: &Params) -> Result<Value> {
    let (a, b) = (vals[0].as_array()?, vals[1].as_array()?);
    let data = a.data().iter().zip(b.data()).map(|(x, y)| x + y).collect();
    Ok(Value::Array(ArrayValue::new(
        a.dtype(),
        a.shape().to_vec(),
        data,
    )?))
}

fn catalog() -> Catalog {
    let mut cat = Catalog::new();
    cat.register(PrimitiveDef::new("add", add_abstract).with_impl(add_impl));
    cat
}

fn add_chain(
    tr: &mut Trace<'_>,
    args: &[TraceValue],
) -> Result<TraceValue> {
    let mut x = args[0].clone();
    for _ in 0..64 {
        x = tr.bind("add", &[x.clone(), x.clone()], &Params::new())?;
    }
    Ok(x)
}

fn bench_trace_add_chain(c: &mut Criterion) {
    let cat = catalog();
    c.bench_function("trace_add_chain_64", |b| {
        b.iter(|| {
            let mut tr = Trace::new(&cat);
            tr.trace_to_graph(
                &add_chain,
                vec![PartialValue::unknown(Aval::scalar(DType::F64))],
                false,
            )
            .unwrap()
        });
    });
}

fn bench_eval_add_chain(c: &mut Criterion) {
    let cat = catalog();
    let mut tr = Trace::new(&cat);
    let (graph, _, _) = tr
        .trace_to_graph(
            &add_chain,
            vec![PartialValue::unknown(Aval::scalar(DType::F64))],
            false,
        )
        .unwrap();
    c.bench_function("eval_add_chain_64", |b| {
        b.iter(|| graph.eval(&cat, &[], &[Value::scalar_f64(1.0)]).unwrap());
    });
}

criterion_group!(bench_trace_add_chain_group, bench_trace_add_chain);
criterion_group!(bench_eval_add_chain_group, bench_eval_add_chain);
criterion_main!(bench_trace_add_chain_group, bench_eval_add_chain_group);
