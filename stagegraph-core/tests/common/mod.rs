//! A small catalog of primitives shared by the integration tests.
//!
//! Binary operations broadcast a scalar against any shape, which is enough
//! for mapped-call bodies to be executable on full arrays.

#![allow(dead_code)]

use stagegraph_core::{
    ArrayValue, Aval, Catalog, DType, Error, Params, PrimitiveDef,
    PrimitiveKind, Result, Value,
};

pub fn sc(x: f64) -> Value {
    Value::scalar_f64(x)
}

pub fn vec1(xs: &[f64]) -> Value {
    Value::Array(
        ArrayValue::new(DType::F64, vec![xs.len()], xs.to_vec()).unwrap(),
    )
}

fn broadcast_aval(a: &Aval, b: &Aval) -> Result<Aval> {
    match (a, b) {
        (
            Aval::Shaped { shape: s1, dtype: d1 },
            Aval::Shaped { shape: s2, dtype: d2 },
        ) => {
            let shape = if s1 == s2 {
                s1.clone()
            } else if s1.is_empty() {
                s2.clone()
            } else if s2.is_empty() {
                s1.clone()
            } else {
                return Err(Error::ShapeMismatch {
                    op: "broadcast",
                    lhs: a.to_string(),
                    rhs: b.to_string(),
                });
            };
            Ok(Aval::Shaped {
                shape,
                dtype: d1.join(*d2),
            })
        }
        _ => Err(Error::ShapeMismatch {
            op: "broadcast",
            lhs: a.to_string(),
            rhs: b.to_string(),
        }),
    }
}

fn binary_abstract(avals: &[Aval], _params: &Params) -> Result<Aval> {
    if avals.len() != 2 {
        return Err(Error::msg("binary primitive expects two inputs"));
    }
    broadcast_aval(&avals[0], &avals[1])
}

fn unary_abstract(avals: &[Aval], _params: &Params) -> Result<Aval> {
    if avals.len() != 1 {
        return Err(Error::msg("unary primitive expects one input"));
    }
    Ok(avals[0].clone())
}

fn split_pow_abstract(avals: &[Aval], _params: &Params) -> Result<Aval> {
    if avals.len() != 1 {
        return Err(Error::msg("split_pow expects one input"));
    }
    Ok(Aval::Tuple(vec![avals[0].clone(), avals[0].clone()]))
}

fn call_abstract(_avals: &[Aval], _params: &Params) -> Result<Aval> {
    Err(Error::msg("staged calls have no abstract-eval rule"))
}

fn elementwise2(vals: &[Value], f: fn(f64, f64) -> f64) -> Result<Value> {
    let (a, b) = (vals[0].as_array()?, vals[1].as_array()?);
    let dtype = a.dtype().join(b.dtype());
    let (shape, data): (Vec<usize>, Vec<f64>) = if a.shape() == b.shape() {
        (
            a.shape().to_vec(),
            a.data()
                .iter()
                .zip(b.data())
                .map(|(x, y)| f(*x, *y))
                .collect(),
        )
    } else if a.shape().is_empty() {
        let x = a.data()[0];
        (b.shape().to_vec(), b.data().iter().map(|y| f(x, *y)).collect())
    } else if b.shape().is_empty() {
        let y = b.data()[0];
        (a.shape().to_vec(), a.data().iter().map(|x| f(*x, y)).collect())
    } else {
        return Err(Error::ShapeMismatch {
            op: "broadcast",
            lhs: a.aval().to_string(),
            rhs: b.aval().to_string(),
        });
    };
    Ok(Value::Array(ArrayValue::new(dtype, shape, data)?))
}

fn elementwise1(vals: &[Value], f: fn(f64) -> f64) -> Result<Value> {
    let a = vals[0].as_array()?;
    let data = a.data().iter().map(|x| f(*x)).collect();
    Ok(Value::Array(ArrayValue::new(
        a.dtype(),
        a.shape().to_vec(),
        data,
    )?))
}

fn add_impl(vals: &[Value], _params: &Params) -> Result<Value> {
    elementwise2(vals, |x, y| x + y)
}

fn mul_impl(vals: &[Value], _params: &Params) -> Result<Value> {
    elementwise2(vals, |x, y| x * y)
}

fn neg_impl(vals: &[Value], _params: &Params) -> Result<Value> {
    elementwise1(vals, |x| -x)
}

fn sin_impl(vals: &[Value], _params: &Params) -> Result<Value> {
    elementwise1(vals, f64::sin)
}

fn split_pow_impl(vals: &[Value], _params: &Params) -> Result<Value> {
    let a = vals[0].as_array()?;
    let sq: Vec<f64> = a.data().iter().map(|x| x * x).collect();
    let cube: Vec<f64> = a.data().iter().map(|x| x * x * x).collect();
    Ok(Value::Tuple(vec![
        Value::Array(ArrayValue::new(a.dtype(), a.shape().to_vec(), sq)?),
        Value::Array(ArrayValue::new(a.dtype(), a.shape().to_vec(), cube)?),
    ]))
}

pub fn catalog() -> Catalog {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut cat = Catalog::new();
    cat.register(PrimitiveDef::new("add", binary_abstract).with_impl(add_impl));
    cat.register(PrimitiveDef::new("mul", binary_abstract).with_impl(mul_impl));
    cat.register(PrimitiveDef::new("neg", unary_abstract).with_impl(neg_impl));
    cat.register(PrimitiveDef::new("sin", unary_abstract).with_impl(sin_impl));
    cat.register(
        PrimitiveDef::new("split_pow", split_pow_abstract)
            .with_impl(split_pow_impl),
    );
    cat.register(
        PrimitiveDef::new("compiled_call", call_abstract)
            .with_kind(PrimitiveKind::Call),
    );
    cat.register(
        PrimitiveDef::new("batched_call", call_abstract)
            .with_kind(PrimitiveKind::Map),
    );
    cat
}
