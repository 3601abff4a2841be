use super::{first_difference, index, inputs, rows, sink, source};
use crate::{
    circuit::{Circuit, OperatorKind},
    config::CompilerConfig,
    eval::{CircuitRunner, Value, ZSet},
    ir::{Aggregate, AggregateFunction, AggregateKind, Closure, Expr, Type},
    Compiler,
};
use proptest::prelude::*;
use std::collections::BTreeMap;

const LATENESS: i64 = 2;

/// Turns offsets into timestamps no older than the lateness allows
fn on_time(steps: &[Vec<(i64, i64)>]) -> Vec<ZSet> {
    let mut newest = 10;
    steps
        .iter()
        .map(|step| {
            let floor = newest - LATENESS;
            let changes: Vec<_> = step
                .iter()
                .map(|&(offset, value)| (floor + offset, value, 1))
                .collect();
            newest = changes.iter().map(|&(ts, ..)| ts).fold(newest, i64::max);
            rows(&changes)
        })
        .collect()
}

fn offsets() -> impl Strategy<Value = Vec<Vec<(i64, i64)>>> {
    prop::collection::vec(prop::collection::vec((0i64..6, 0i64..4), 0..4), 1..8)
}

fn pruned_circuit() -> Circuit {
    let mut circuit = Circuit::new();
    let a = source(&mut circuit, "a", Some(LATENESS));
    let b = source(&mut circuit, "b", Some(LATENESS));
    let left = index(&mut circuit, a);
    let right = index(&mut circuit, b);
    let join = circuit
        .add(
            OperatorKind::Join {
                function: Closure::ternary(
                    ["k", "l", "r"],
                    [Type::i64().reference(), Type::i64().reference(), Type::i64().reference()],
                    |k, l, r| Expr::tuple(vec![k.deref(), l.deref(), r.deref()]),
                ),
            },
            &[left, right],
        )
        .unwrap();

    let grouped = index(&mut circuit, b);
    let maxima = circuit
        .add(
            OperatorKind::Aggregate {
                aggregate: Aggregate::new(vec![AggregateFunction::new(
                    AggregateKind::Max,
                    Closure::unary("v", Type::i64().reference(), |v| v.deref()),
                )]),
            },
            &[grouped],
        )
        .unwrap();

    sink(&mut circuit, "joined", join);
    sink(&mut circuit, "maxima", maxima);
    circuit
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn waterlines_never_decrease(steps in prop::collection::vec(prop::collection::vec(0i64..100, 1..4), 1..8)) {
        let mut circuit = Circuit::new();
        let input = source(&mut circuit, "t", Some(LATENESS));
        sink(&mut circuit, "out", input);

        let compiled = Compiler::new().compile(&circuit).unwrap();
        let waterline = compiled
            .circuit()
            .operators()
            .find(|operator| operator.kind().is_waterline())
            .unwrap()
            .id();

        let mut runner = CircuitRunner::new(compiled.circuit());
        let mut expected: Option<i64> = None;
        for step in steps {
            let changes: Vec<_> = step
                .iter()
                .enumerate()
                .map(|(idx, &ts)| (ts, idx as i64, 1))
                .collect();
            runner.step(&inputs([("t", rows(&changes))])).unwrap();

            let oldest = step.iter().copied().min().unwrap() - LATENESS;
            let bound = expected.map_or(oldest, |previous| previous.max(oldest));
            prop_assert!(expected.map_or(true, |previous| previous <= bound));
            expected = Some(bound);

            let actual = runner.value(waterline).and_then(|value| value.as_scalar());
            prop_assert_eq!(actual, Some(&Value::tuple([Value::Int(bound)])));
        }
    }

    #[test]
    fn limiters_never_drop_rows_still_needed(a in offsets(), b in offsets()) {
        let circuit = pruned_circuit();
        let limited = Compiler::new().compile(&circuit).unwrap();
        let unlimited = Compiler::with_config(CompilerConfig::new().with_insert_limiters(false))
            .compile(&circuit)
            .unwrap();
        prop_assert!(limited
            .circuit()
            .operators()
            .any(|operator| operator.kind().is_integrate_trace_retain_keys()));

        let (a, b) = (on_time(&a), on_time(&b));
        let steps: Vec<BTreeMap<String, ZSet>> = a
            .into_iter()
            .zip(b)
            .map(|(a, b)| inputs([("a", a), ("b", b)]))
            .collect();

        prop_assert_eq!(first_difference(&circuit, limited.circuit(), &steps), None);
        prop_assert_eq!(first_difference(&circuit, unlimited.circuit(), &steps), None);
    }
}
