use crate::{
    circuit::{Circuit, ColumnMetadata, Operator, OperatorKind, OperatorVisitor, VisitFlow},
    ids::OperatorId,
    ir::{Closure, Expr, Type},
};
use std::sync::Arc;

fn row() -> Type {
    Type::tuple([Type::i32(), Type::i32()])
}

fn source(circuit: &mut Circuit, name: &str, row: Type) -> OperatorId {
    circuit
        .add(
            OperatorKind::Source {
                name: name.to_owned(),
                row,
                columns: Vec::new(),
            },
            &[],
        )
        .unwrap()
}

/// Indexes a two-column row by its first column
fn index_by_first(circuit: &mut Circuit, input: OperatorId, row: Type) -> OperatorId {
    let function = Closure::unary("t", row.reference(), |t| {
        Expr::raw_tuple(vec![t.deref().field(0), t.deref().clone_value()])
    });
    circuit
        .add(OperatorKind::MapIndex { function }, &[input])
        .unwrap()
}

fn swap() -> Closure {
    Closure::unary("t", row().reference(), |t| {
        Expr::tuple(vec![t.deref().field(1), t.deref().field(0)])
    })
}

#[test]
fn unchanged_rebuilds_preserve_identity() {
    let mut circuit = Circuit::new();
    let input = source(&mut circuit, "t", row());
    let map = circuit
        .add(OperatorKind::Map { function: swap() }, &[input])
        .unwrap();

    let ids = circuit.id_gen();
    let operator = circuit.operator(map).unwrap();
    let inputs = circuit.inputs_of(operator).unwrap();

    let same = operator.with_inputs(&inputs, &ids).unwrap();
    assert!(Arc::ptr_eq(operator, &same));

    let same = operator
        .with_function(|closure| Ok(closure.clone()), &inputs, &ids)
        .unwrap();
    assert!(Arc::ptr_eq(operator, &same));

    // A structurally identical closure is still the same kind
    let same = operator
        .rebuild(OperatorKind::Map { function: swap() }, &inputs, &ids)
        .unwrap();
    assert!(Arc::ptr_eq(operator, &same));
}

#[test]
fn rebuilt_operators_are_equivalent() {
    let mut circuit = Circuit::new();
    let input = source(&mut circuit, "t", row());
    let map = circuit
        .add(OperatorKind::Map { function: swap() }, &[input])
        .unwrap();

    let operator = circuit.operator(map).unwrap();
    let inputs = circuit.inputs_of(operator).unwrap();

    let renamed = Closure::unary("row", row().reference(), |t| {
        Expr::tuple(vec![t.deref().field(1), t.deref().field(0)])
    });
    let rebuilt = Operator::new(
        OperatorId::new(100),
        OperatorKind::Map { function: renamed },
        &inputs,
    )
    .unwrap();
    assert!(rebuilt.equivalent(operator));
    assert_ne!(rebuilt.id(), operator.id());

    let different = Operator::new(
        OperatorId::new(101),
        OperatorKind::Map {
            function: Closure::unary("t", row().reference(), |t| t.deref().clone_value()),
        },
        &inputs,
    )
    .unwrap();
    assert!(!different.equivalent(operator));
}

#[test]
fn antijoin_rejects_mismatched_keys() {
    let mut circuit = Circuit::new();
    let ints = source(&mut circuit, "ints", row());
    let strings = source(
        &mut circuit,
        "strings",
        Type::tuple([Type::string(), Type::i32()]),
    );

    let left = index_by_first(&mut circuit, ints, row());
    let right = index_by_first(
        &mut circuit,
        strings,
        Type::tuple([Type::string(), Type::i32()]),
    );

    let error = circuit
        .add(OperatorKind::AntiJoin, &[left, right])
        .unwrap_err();
    assert!(error.is_internal());
    assert!(error.to_string().contains("mismatched key types"));
}

#[test]
fn join_closures_must_match_inputs() {
    let mut circuit = Circuit::new();
    let input = source(&mut circuit, "t", row());
    let indexed = index_by_first(&mut circuit, input, row());

    let function = Closure::ternary(
        ["k", "l", "r"],
        [Type::i32().reference(), row().reference(), row().reference()],
        |k, _, r| Expr::tuple(vec![k.deref(), r.deref().field(1)]),
    );
    let join = circuit
        .add(OperatorKind::Join { function }, &[indexed, indexed])
        .unwrap();
    assert_eq!(
        circuit.operator(join).unwrap().output_type(),
        &Type::zset(row()),
    );

    // The key parameter has the wrong type
    let function = Closure::ternary(
        ["k", "l", "r"],
        [Type::i64().reference(), row().reference(), row().reference()],
        |_, l, _| l.deref().clone_value(),
    );
    assert!(circuit
        .add(OperatorKind::Join { function }, &[indexed, indexed])
        .unwrap_err()
        .is_internal());
}

#[test]
fn arity_is_checked() {
    let mut circuit = Circuit::new();
    let input = source(&mut circuit, "t", row());
    let error = circuit
        .add(OperatorKind::Subtract, &[input])
        .unwrap_err();
    assert!(error.is_internal());
}

#[test]
fn delay_outputs_must_be_paired() {
    let mut circuit = Circuit::new();
    let input = source(&mut circuit, "t", row());
    let feedback = circuit
        .add(
            OperatorKind::DelayOutput {
                ty: Type::zset(row()),
            },
            &[],
        )
        .unwrap();
    let sum = circuit.add(OperatorKind::Sum, &[input, feedback]).unwrap();
    circuit
        .add(
            OperatorKind::Sink {
                name: "out".to_owned(),
            },
            &[sum],
        )
        .unwrap();
    assert!(circuit.validate().is_err());

    let delay = circuit.connect_delay(feedback, sum).unwrap();
    circuit.validate().unwrap();
    assert_eq!(circuit.delay_for(feedback), Some(delay));
    assert_eq!(circuit.delay_output_for(delay), Some(feedback));

    // The feedback edge doesn't form a cycle within the graph
    assert!(!petgraph::algo::is_cyclic_directed(&circuit.graph()));
}

#[test]
fn fanout_counts_every_read() {
    let mut circuit = Circuit::new();
    let input = source(&mut circuit, "t", row());
    let indexed = index_by_first(&mut circuit, input, row());
    let function = Closure::ternary(
        ["k", "l", "r"],
        [Type::i32().reference(), row().reference(), row().reference()],
        |_, l, _| l.deref().clone_value(),
    );
    circuit
        .add(OperatorKind::Join { function }, &[indexed, indexed])
        .unwrap();

    let fanouts = circuit.fanouts();
    assert_eq!(fanouts[&input], 1);
    assert_eq!(fanouts[&indexed], 2);
}

#[test]
fn circuits_serialize() {
    let mut circuit = Circuit::new();
    let input = circuit
        .add(
            OperatorKind::Source {
                name: "t".to_owned(),
                row: row(),
                columns: vec![ColumnMetadata::new("a", Type::i32())
                    .with_lateness(crate::ir::Literal::Int(Some(1)))],
            },
            &[],
        )
        .unwrap();
    let map = circuit
        .add(OperatorKind::Map { function: swap() }, &[input])
        .unwrap();
    circuit
        .add(
            OperatorKind::Sink {
                name: "out".to_owned(),
            },
            &[map],
        )
        .unwrap();

    let json = circuit.to_json().unwrap();
    let parsed = Circuit::from_json(&json).unwrap();
    pretty_assertions::assert_eq!(parsed, circuit);

    let error = Circuit::from_json(r#"{ "operators": [] }"#).unwrap_err();
    assert!(error.is_internal());
}

#[derive(Default)]
struct Trace {
    events: Vec<String>,
}

impl OperatorVisitor for Trace {
    fn preorder(&mut self, operator: &Operator) -> VisitFlow {
        self.events.push(format!("pre {}", operator.kind().name()));
        if operator.kind().is_sink() {
            VisitFlow::Skip
        } else {
            VisitFlow::Descend
        }
    }

    fn postorder(&mut self, operator: &Operator) {
        self.events.push(format!("post {}", operator.kind().name()));
    }

    fn visit_closure(&mut self, _operator: &Operator, _closure: &Closure) {
        self.events.push("closure".to_owned());
    }

    fn visit_source(&mut self, _operator: &Operator, name: &str, _columns: &[ColumnMetadata]) {
        self.events.push(format!("source {name}"));
    }

    fn visit_map(&mut self, _operator: &Operator, _function: &Closure) {
        self.events.push("map".to_owned());
    }

    fn visit_sink(&mut self, _operator: &Operator, name: &str) {
        self.events.push(format!("sink {name}"));
    }
}

#[test]
fn visitors_walk_operators_in_order() {
    let mut circuit = Circuit::new();
    let input = source(&mut circuit, "t", row());
    let map = circuit
        .add(OperatorKind::Map { function: swap() }, &[input])
        .unwrap();
    circuit
        .add(
            OperatorKind::Sink {
                name: "out".to_owned(),
            },
            &[map],
        )
        .unwrap();

    let source_name = circuit.operator(input).unwrap().kind().name();
    let map_name = circuit.operator(map).unwrap().kind().name();
    let sink_name = circuit.sink("out").unwrap().kind().name();

    let mut trace = Trace::default();
    circuit.accept(&mut trace);
    pretty_assertions::assert_eq!(
        trace.events,
        vec![
            format!("pre {source_name}"),
            "source t".to_owned(),
            format!("post {source_name}"),
            format!("pre {map_name}"),
            "map".to_owned(),
            "closure".to_owned(),
            format!("post {map_name}"),
            format!("pre {sink_name}"),
            format!("post {sink_name}"),
        ],
    );
}
