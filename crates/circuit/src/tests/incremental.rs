//! Compiled circuits compute the changes of their batch queries
//!
//! Besides stepping both circuits side by side, the accumulated outputs of
//! the compiled circuit are compared with the query evaluated in a single
//! step over the accumulated inputs

use super::{first_batch_difference, first_difference, index, inputs, rows, sink, source};
use crate::{
    circuit::{Circuit, OperatorKind},
    config::CompilerConfig,
    eval::ZSet,
    ir::{Aggregate, AggregateFunction, AggregateKind, Closure, Expr, Type},
    Compiler,
};
use proptest::prelude::*;
use std::collections::BTreeMap;

fn changes(weights: impl Strategy<Value = i64>) -> impl Strategy<Value = ZSet> {
    prop::collection::vec((0i64..4, 0i64..6, weights), 0..5).prop_map(|changes| rows(&changes))
}

fn steps(weights: impl Strategy<Value = i64> + Clone) -> impl Strategy<Value = Vec<BTreeMap<String, ZSet>>> {
    prop::collection::vec((changes(weights.clone()), changes(weights)), 1..6).prop_map(|steps| {
        steps
            .into_iter()
            .map(|(a, b)| inputs([("a", a), ("b", b)]))
            .collect()
    })
}

fn signed() -> impl Strategy<Value = i64> + Clone {
    prop_oneof![Just(1i64), Just(-1), Just(2)]
}

fn positive() -> impl Strategy<Value = i64> + Clone {
    prop_oneof![Just(1i64), Just(2)]
}

fn join_circuit() -> Circuit {
    let mut circuit = Circuit::new();
    let a = source(&mut circuit, "a", None);
    let b = source(&mut circuit, "b", None);
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
    let antijoin = circuit.add(OperatorKind::AntiJoin, &[left, right]).unwrap();
    sink(&mut circuit, "joined", join);
    sink(&mut circuit, "unmatched", antijoin);
    circuit
}

fn aggregate_circuit() -> Circuit {
    let value = || Closure::unary("v", Type::i64().reference(), |v| v.deref());

    let mut circuit = Circuit::new();
    let a = source(&mut circuit, "a", None);
    let b = source(&mut circuit, "b", None);
    let both = circuit.add(OperatorKind::Sum, &[a, b]).unwrap();
    let indexed = index(&mut circuit, both);
    let aggregate = circuit
        .add(
            OperatorKind::Aggregate {
                aggregate: Aggregate::new(vec![
                    AggregateFunction::new(AggregateKind::Min, value()),
                    AggregateFunction::new(AggregateKind::Sum, value()),
                    AggregateFunction::new(AggregateKind::Count, value()),
                ]),
            },
            &[indexed],
        )
        .unwrap();
    let distinct = circuit.add(OperatorKind::Distinct, &[both]).unwrap();
    sink(&mut circuit, "aggregate", aggregate);
    sink(&mut circuit, "distinct", distinct);
    circuit
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn joins_match_their_batch_semantics(steps in steps(signed())) {
        let circuit = join_circuit();
        for config in [CompilerConfig::new(), CompilerConfig::unoptimized()] {
            let compiled = Compiler::with_config(config).compile(&circuit).unwrap();
            prop_assert_eq!(first_difference(&circuit, compiled.circuit(), &steps), None);
            prop_assert_eq!(first_batch_difference(&circuit, compiled.circuit(), &steps), None);
        }
    }

    #[test]
    fn aggregates_match_their_batch_semantics(steps in steps(positive())) {
        let circuit = aggregate_circuit();
        for config in [CompilerConfig::new(), CompilerConfig::unoptimized()] {
            let compiled = Compiler::with_config(config).compile(&circuit).unwrap();
            prop_assert_eq!(first_difference(&circuit, compiled.circuit(), &steps), None);
            prop_assert_eq!(first_batch_difference(&circuit, compiled.circuit(), &steps), None);
        }
    }
}
