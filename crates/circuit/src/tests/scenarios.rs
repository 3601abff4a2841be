use super::{index, inputs, row, rows, sink, source, test_logger};
use crate::{
    circuit::{Circuit, OperatorKind},
    config::CompilerConfig,
    eval::{call, CircuitRunner, EvalError, Value},
    ir::{
        Aggregate, AggregateFunction, AggregateKind, BinaryOp, Closure, Expr, ExprKind, Type,
    },
    passes::Expansion,
    Compiler,
};
use pretty_assertions::assert_eq;

fn contains_cast(expr: &Expr) -> bool {
    let mut found = matches!(expr.kind(), ExprKind::Cast(_));
    expr.for_each_child(|child| found |= contains_cast(child));
    found
}

#[test]
fn chained_maps_compile_into_one() {
    test_logger();

    let f = Closure::unary("t", row().reference(), |t| {
        Expr::tuple(vec![
            Expr::binary(BinaryOp::Add, &t.deref().field(0), &Expr::i64(1)),
            Expr::binary(BinaryOp::Mul, &t.deref().field(1), &Expr::i64(2)),
        ])
    });
    let g = Closure::unary("t", row().reference(), |t| {
        Expr::tuple(vec![t.deref().field(1), t.deref().field(0)])
    });

    let mut circuit = Circuit::new();
    let input = source(&mut circuit, "t", None);
    let first = circuit
        .add(OperatorKind::Map { function: f.clone() }, &[input])
        .unwrap();
    let second = circuit
        .add(OperatorKind::Map { function: g.clone() }, &[first])
        .unwrap();
    sink(&mut circuit, "out", second);

    let compiled = Compiler::new().compile(&circuit).unwrap();
    let maps: Vec<_> = compiled
        .circuit()
        .operators()
        .filter_map(|operator| match operator.kind() {
            OperatorKind::Map { function } => Some(function.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(maps.len(), 1);

    let pair = Value::tuple([Value::Int(1), Value::Int(2)]);
    let sequential = call(&g, &[call(&f, &[pair.clone()]).unwrap()]).unwrap();
    assert_eq!(call(&maps[0], &[pair]).unwrap(), sequential);
    assert_eq!(sequential, Value::tuple([Value::Int(4), Value::Int(2)]));
}

#[test]
fn out_of_range_casts_are_left_for_the_runtime() {
    test_logger();

    let mut circuit = Circuit::new();
    let input = source(&mut circuit, "t", None);
    let map = circuit
        .add(
            OperatorKind::Map {
                function: Closure::unary("t", row().reference(), |t| {
                    Expr::tuple(vec![t.deref().field(0), Expr::string("256").cast(Type::i8())])
                }),
            },
            &[input],
        )
        .unwrap();
    sink(&mut circuit, "out", map);

    let compiled = Compiler::new().compile(&circuit).unwrap();
    let warnings: Vec<_> = compiled.diagnostics().warnings().collect();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].title, "Out of range");

    let function = compiled
        .circuit()
        .operators()
        .find_map(|operator| match operator.kind() {
            OperatorKind::Map { function } => Some(function.clone()),
            _ => None,
        })
        .unwrap();
    assert!(contains_cast(function.body()));

    let mut runner = CircuitRunner::new(compiled.circuit());
    let result = runner.step(&inputs([("t", rows(&[(1, 1, 1)]))]));
    assert!(matches!(result, Err(EvalError::OutOfRange { .. })));
}

#[test]
fn waterlines_trail_the_lateness_column() {
    test_logger();

    let mut circuit = Circuit::new();
    let input = source(&mut circuit, "t", Some(1));
    sink(&mut circuit, "out", input);

    let compiled = Compiler::new().compile(&circuit).unwrap();
    let waterline = compiled
        .circuit()
        .operators()
        .find(|operator| operator.kind().is_waterline())
        .unwrap()
        .id();

    let mut runner = CircuitRunner::new(compiled.circuit());
    let mut step = |changes: &[(i64, i64, i64)]| {
        let mut outputs = runner.step(&inputs([("t", rows(changes))])).unwrap();
        let waterline = runner
            .value(waterline)
            .and_then(|value| value.as_scalar())
            .cloned()
            .unwrap();
        (outputs.remove("out").unwrap(), waterline)
    };
    let bound = |ts| Value::tuple([Value::Int(ts)]);

    assert_eq!(step(&[(5, 1, 1)]), (rows(&[(5, 1, 1)]), bound(4)));
    assert_eq!(step(&[(5, 2, 1)]), (rows(&[(5, 2, 1)]), bound(4)));
    assert_eq!(step(&[(7, 3, 1)]), (rows(&[(7, 3, 1)]), bound(6)));
    // Rows below the waterline of the previous step are discarded
    assert_eq!(
        step(&[(3, 4, 1), (6, 5, 1)]),
        (rows(&[(6, 5, 1)]), bound(6)),
    );
}

#[test]
fn mismatched_antijoin_keys_fail_to_build() {
    let mut circuit = Circuit::new();
    let left_input = source(&mut circuit, "a", None);
    let left = index(&mut circuit, left_input);
    let right_input = circuit
        .add(
            OperatorKind::Source {
                name: "b".to_owned(),
                row: Type::tuple([Type::string(), Type::i64()]),
                columns: Vec::new(),
            },
            &[],
        )
        .unwrap();
    let right = circuit
        .add(
            OperatorKind::MapIndex {
                function: Closure::unary(
                    "t",
                    Type::tuple([Type::string(), Type::i64()]).reference(),
                    |t| Expr::raw_tuple(vec![t.deref().field(0), t.deref().field(1)]),
                ),
            },
            &[right_input],
        )
        .unwrap();

    let error = circuit
        .add(OperatorKind::AntiJoin, &[left, right])
        .unwrap_err();
    assert!(error.is_internal());
}

#[test]
fn compiled_queries_match_their_batch_semantics() {
    test_logger();

    let mut circuit = Circuit::new();
    let a = source(&mut circuit, "a", Some(2));
    let b = source(&mut circuit, "b", Some(2));
    let left = index(&mut circuit, a);
    let right = index(&mut circuit, b);
    let join = circuit
        .add(
            OperatorKind::Join {
                function: Closure::ternary(
                    ["k", "l", "r"],
                    [Type::i64().reference(), Type::i64().reference(), Type::i64().reference()],
                    |k, l, r| {
                        Expr::tuple(vec![
                            k.deref(),
                            Expr::binary(BinaryOp::Add, &l.deref(), &r.deref()),
                        ])
                    },
                ),
            },
            &[left, right],
        )
        .unwrap();
    let indexed = index(&mut circuit, join);
    let totals = circuit
        .add(
            OperatorKind::Aggregate {
                aggregate: Aggregate::new(vec![AggregateFunction::new(
                    AggregateKind::Sum,
                    Closure::unary("v", Type::i64().reference(), |v| v.deref()),
                )]),
            },
            &[indexed],
        )
        .unwrap();
    sink(&mut circuit, "joined", join);
    sink(&mut circuit, "totals", totals);

    let compiled = Compiler::new().compile(&circuit).unwrap();
    compiled.circuit().check_primitive().unwrap();
    assert!(compiled.diagnostics().is_empty());
    assert!(compiled
        .expansion()
        .iter()
        .any(|(_, expansion)| matches!(expansion, Expansion::Join { .. })));
    assert_eq!(
        compiled
            .circuit()
            .operators()
            .filter(|operator| operator.kind().is_integrate_trace_retain_keys())
            .count(),
        2,
    );

    let steps = [
        inputs([("a", rows(&[(10, 1, 1), (11, 2, 1)])), ("b", rows(&[(10, 5, 1)]))]),
        inputs([("a", rows(&[(12, 3, 1)])), ("b", rows(&[(11, 6, 1), (12, 7, 1)]))]),
        inputs([("a", rows(&[(10, 1, -1)])), ("b", rows(&[(13, 8, 1)]))]),
        inputs([("a", rows(&[(13, 4, 1)])), ("b", rows(&[]))]),
    ];
    assert_eq!(super::first_difference(&circuit, compiled.circuit(), &steps), None);

    let unoptimized = Compiler::with_config(CompilerConfig::unoptimized())
        .compile(&circuit)
        .unwrap();
    assert_eq!(
        super::first_difference(&circuit, unoptimized.circuit(), &steps),
        None,
    );
    assert!(unoptimized
        .circuit()
        .operators()
        .all(|operator| !operator.kind().is_waterline()));

    let json = serde_json::to_string(&compiled).unwrap();
    let deserialized: crate::CompiledCircuit = serde_json::from_str(&json).unwrap();
    assert_eq!(deserialized, compiled);
}
