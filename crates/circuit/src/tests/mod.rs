mod incremental;
mod lateness;
mod scenarios;

use crate::{
    circuit::{Circuit, ColumnMetadata, OperatorKind},
    eval::{CircuitRunner, Value, ZSet},
    ir::{Closure, Expr, Literal, Type},
    OperatorId,
};
use std::collections::BTreeMap;

pub(crate) fn test_logger() {
    use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_env("CIRCUIT_LOG")
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_test_writer())
        .try_init();
}

/// Rows of `(ts, value)`
fn row() -> Type {
    Type::tuple([Type::i64(), Type::i64()])
}

fn columns(lateness: Option<i64>) -> Vec<ColumnMetadata> {
    let ts = ColumnMetadata::new("ts", Type::i64());
    let ts = match lateness {
        Some(lateness) => ts.with_lateness(Literal::Int(Some(lateness))),
        None => ts,
    };
    vec![ts, ColumnMetadata::new("value", Type::i64())]
}

fn source(circuit: &mut Circuit, name: &str, lateness: Option<i64>) -> OperatorId {
    circuit
        .add(
            OperatorKind::Source {
                name: name.to_owned(),
                row: row(),
                columns: columns(lateness),
            },
            &[],
        )
        .unwrap()
}

/// Indexes `(ts, value)` rows by their timestamp
fn index(circuit: &mut Circuit, input: OperatorId) -> OperatorId {
    circuit
        .add(
            OperatorKind::MapIndex {
                function: Closure::unary("t", row().reference(), |t| {
                    Expr::raw_tuple(vec![t.deref().field(0), t.deref().field(1)])
                }),
            },
            &[input],
        )
        .unwrap()
}

fn sink(circuit: &mut Circuit, name: &str, input: OperatorId) -> OperatorId {
    circuit
        .add(
            OperatorKind::Sink {
                name: name.to_owned(),
            },
            &[input],
        )
        .unwrap()
}

fn rows(rows: &[(i64, i64, i64)]) -> ZSet {
    rows.iter()
        .map(|&(ts, value, weight)| (Value::tuple([Value::Int(ts), Value::Int(value)]), weight))
        .collect()
}

fn inputs<'a, I>(inputs: I) -> BTreeMap<String, ZSet>
where
    I: IntoIterator<Item = (&'a str, ZSet)>,
{
    inputs
        .into_iter()
        .map(|(name, rows)| (name.to_owned(), rows))
        .collect()
}

/// Steps both circuits through the same inputs, returning the first step
/// at which their outputs differ
fn first_difference(
    original: &Circuit,
    compiled: &Circuit,
    steps: &[BTreeMap<String, ZSet>],
) -> Option<(usize, BTreeMap<String, ZSet>, BTreeMap<String, ZSet>)> {
    let mut original = CircuitRunner::new(original);
    let mut compiled = CircuitRunner::new(compiled);
    steps.iter().enumerate().find_map(|(step, inputs)| {
        let expected = original.step(inputs).unwrap();
        let actual = compiled.step(inputs).unwrap();
        (expected != actual).then_some((step, expected, actual))
    })
}

/// Steps `compiled` through `steps`, returning the first step at which its
/// accumulated outputs differ from `query` evaluated once over the
/// accumulated inputs
fn first_batch_difference(
    query: &Circuit,
    compiled: &Circuit,
    steps: &[BTreeMap<String, ZSet>],
) -> Option<(usize, BTreeMap<String, ZSet>, BTreeMap<String, ZSet>)> {
    let mut runner = CircuitRunner::new(compiled);
    let mut accumulated_inputs: BTreeMap<String, ZSet> = BTreeMap::new();
    let mut accumulated_outputs: BTreeMap<String, ZSet> = BTreeMap::new();

    steps.iter().enumerate().find_map(|(step, inputs)| {
        for (name, changes) in inputs {
            accumulated_inputs
                .entry(name.clone())
                .or_default()
                .add_assign(changes);
        }
        for (name, changes) in runner.step(inputs).unwrap() {
            accumulated_outputs.entry(name).or_default().add_assign(&changes);
        }

        let expected = CircuitRunner::new(query).step(&accumulated_inputs).unwrap();
        (expected != accumulated_outputs).then(|| (step, expected, accumulated_outputs.clone()))
    })
}
