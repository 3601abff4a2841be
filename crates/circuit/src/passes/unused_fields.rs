//! Finds the fields of closure parameters which are never read and narrows
//! the rows flowing into joins to the fields they actually use

use crate::{
    circuit::{Circuit, CircuitRewriter, Operator, OperatorKind},
    error::{internal_error, CompilerResult},
    ir::{Closure, Expr, ExprKind, Param, Type},
};
use std::sync::Arc;

/// Tracks which parts of a value are read, mirroring the nesting of the
/// value's type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldUseMap {
    /// A value that's either read as a whole or not at all
    Leaf(bool),
    /// A tuple whose fields are tracked individually
    Tuple(Vec<FieldUseMap>),
    Ref(Box<FieldUseMap>),
}

impl FieldUseMap {
    /// An empty map for a value of type `ty`
    pub fn new(ty: &Type) -> Self {
        match ty {
            Type::Tuple(fields) | Type::RawTuple(fields) => {
                Self::Tuple(fields.iter().map(Self::new).collect())
            }
            Type::Ref(inner) => Self::Ref(Box::new(Self::new(inner))),
            _ => Self::Leaf(false),
        }
    }

    /// Returns true if any part of the value is read
    pub fn is_used(&self) -> bool {
        match self {
            Self::Leaf(used) => *used,
            Self::Tuple(fields) => fields.iter().any(Self::is_used),
            Self::Ref(inner) => inner.is_used(),
        }
    }

    /// Returns true if every part of the value is read
    pub fn is_fully_used(&self) -> bool {
        match self {
            Self::Leaf(used) => *used,
            Self::Tuple(fields) => fields.iter().all(Self::is_fully_used),
            Self::Ref(inner) => inner.is_fully_used(),
        }
    }

    /// The map of the `idx`th field, looking through references
    pub fn field(&self, idx: usize) -> Option<&Self> {
        match self {
            Self::Tuple(fields) => fields.get(idx),
            Self::Ref(inner) => inner.field(idx),
            Self::Leaf(_) => None,
        }
    }

    pub(crate) fn mark_all(&mut self) {
        match self {
            Self::Leaf(used) => *used = true,
            Self::Tuple(fields) => fields.iter_mut().for_each(Self::mark_all),
            Self::Ref(inner) => inner.mark_all(),
        }
    }

    /// Marks the value reached by following `path` through the nested
    /// tuples as read, references are looked through
    fn mark(&mut self, path: &[usize]) -> CompilerResult<()> {
        match (self, path) {
            (Self::Ref(inner), path) => inner.mark(path),
            (map, []) => {
                map.mark_all();
                Ok(())
            }
            (Self::Tuple(fields), [idx, rest @ ..]) => match fields.get_mut(*idx) {
                Some(field) => field.mark(rest),
                None => internal_error!("accessed field {idx} of a tuple with {} fields", fields.len()),
            },
            (Self::Leaf(_), [idx, ..]) => internal_error!("accessed field {idx} of a non-tuple"),
        }
    }

    /// The type holding only the used fields of `ty`, tuples nested deeper
    /// than `depth` are kept whole
    pub fn narrow_type(&self, ty: &Type, depth: usize) -> Type {
        match (self, ty) {
            (Self::Ref(inner), Type::Ref(ty)) => inner.narrow_type(ty, depth).reference(),
            (Self::Tuple(maps), Type::Tuple(fields) | Type::RawTuple(fields)) if depth > 0 => {
                let fields = maps
                    .iter()
                    .zip(fields)
                    .filter(|(map, _)| map.is_used())
                    .map(|(map, field)| map.narrow_type(field, depth - 1));

                if ty.is_tuple() {
                    Type::tuple(fields)
                } else {
                    Type::raw_tuple(fields)
                }
            }
            _ => ty.clone(),
        }
    }

    /// Builds the narrowed value from `expr`, a value of type `ty`
    fn project(&self, expr: &Expr, depth: usize) -> Expr {
        match (self, expr.ty()) {
            (Self::Tuple(maps), Type::Tuple(_) | Type::RawTuple(_)) if depth > 0 => {
                let fields = maps
                    .iter()
                    .enumerate()
                    .filter(|(_, map)| map.is_used())
                    .map(|(idx, map)| map.project(&expr.field(idx), depth - 1))
                    .collect();

                if expr.ty().is_tuple() {
                    Expr::tuple(fields)
                } else {
                    Expr::raw_tuple(fields)
                }
            }
            _ => expr.clone_value(),
        }
    }

    /// The index a field has once the unused fields before it are dropped
    fn narrowed_index(&self, idx: usize) -> usize {
        match self {
            Self::Tuple(fields) => fields[..idx.min(fields.len())]
                .iter()
                .filter(|field| field.is_used())
                .count(),
            Self::Ref(inner) => inner.narrowed_index(idx),
            Self::Leaf(_) => idx,
        }
    }
}

/// Follows field accesses and reference wrappers down to the variable they
/// start from, returning the variable and the fields accessed in order
fn access_path(expr: &Expr) -> Option<(&str, Vec<usize>)> {
    match expr.kind() {
        ExprKind::Var(name) => Some((name, Vec::new())),
        ExprKind::Deref(inner) | ExprKind::Borrow(inner) | ExprKind::Clone(inner) => {
            access_path(inner)
        }
        ExprKind::Field(inner, idx) => {
            let (name, mut path) = access_path(inner)?;
            path.push(*idx);
            Some((name, path))
        }
        _ => None,
    }
}

/// Substitutes let bindings of plain field accesses into their uses so that
/// accesses through them are attributed to the parameter they read
fn inline_aliases(expr: &Expr) -> Expr {
    expr.rewrite_bottom_up(&mut |expr| match expr.kind() {
        ExprKind::Let { name, init, body } if access_path(init).is_some() => {
            body.substitute(name, init)
        }
        _ => expr,
    })
}

struct UseAnalysis<'a> {
    params: &'a [Param],
    maps: Vec<FieldUseMap>,
}

impl UseAnalysis<'_> {
    fn visit<'e>(&mut self, expr: &'e Expr, shadowed: &mut Vec<&'e str>) -> CompilerResult<()> {
        if let Some((name, path)) = access_path(expr) {
            if !shadowed.contains(&name) {
                if let Some(idx) = self.params.iter().position(|param| param.name() == name) {
                    self.maps[idx].mark(&path)?;
                }
            }
            return Ok(());
        }

        match expr.kind() {
            ExprKind::Let { name, init, body } => {
                self.visit(init, shadowed)?;
                shadowed.push(name);
                let result = self.visit(body, shadowed);
                shadowed.pop();
                result
            }

            ExprKind::Literal(_)
            | ExprKind::Var(_)
            | ExprKind::Field(..)
            | ExprKind::Deref(_)
            | ExprKind::Borrow(_)
            | ExprKind::Clone(_)
            | ExprKind::Cast(_)
            | ExprKind::Unary(..)
            | ExprKind::Binary(..)
            | ExprKind::IsNull(_)
            | ExprKind::If { .. }
            | ExprKind::Tuple(_)
            | ExprKind::RawTuple(_)
            | ExprKind::Call { .. } => {
                let mut result = Ok(());
                expr.for_each_child(|child| {
                    if result.is_ok() {
                        result = self.visit(child, shadowed);
                    }
                });
                result
            }
        }
    }
}

/// Computes which parts of each parameter the closure reads
pub fn analyze_closure(closure: &Closure) -> CompilerResult<Vec<FieldUseMap>> {
    let mut analysis = UseAnalysis {
        params: closure.params(),
        maps: closure.param_types().map(FieldUseMap::new).collect(),
    };
    let body = inline_aliases(closure.body());
    analysis.visit(&body, &mut Vec::new())?;
    Ok(analysis.maps)
}

/// Rewrites a closure so that its `param`th parameter receives the value
/// narrowed by `usage`
pub fn narrow_closure(
    closure: &Closure,
    param: usize,
    usage: &FieldUseMap,
    depth: usize,
) -> CompilerResult<Closure> {
    let Some(target) = closure.params().get(param) else {
        internal_error!("narrowed parameter {param} of {closure}");
    };
    let narrowed = usage.narrow_type(target.ty(), depth);
    if &narrowed == target.ty() {
        return Ok(closure.clone());
    }

    let rewriter = Narrow {
        name: target.name(),
        ty: &narrowed,
        usage,
        depth,
    };
    let body = rewriter.rewrite(&inline_aliases(closure.body()), &mut Vec::new());

    let mut params = closure.params().to_vec();
    params[param] = Param::new(target.name(), narrowed.clone());
    Ok(Closure::new(params, body))
}

struct Narrow<'a> {
    name: &'a str,
    ty: &'a Type,
    usage: &'a FieldUseMap,
    depth: usize,
}

impl Narrow<'_> {
    fn rewrite<'e>(&self, expr: &'e Expr, shadowed: &mut Vec<&'e str>) -> Expr {
        if let Some((name, _)) = access_path(expr) {
            if name == self.name && !shadowed.contains(&name) {
                return self.rewrite_access(expr).0;
            }
            return expr.clone();
        }

        match expr.kind() {
            ExprKind::Let { name, init, body } => {
                let init = self.rewrite(init, shadowed);
                shadowed.push(name);
                let body = self.rewrite(body, shadowed);
                shadowed.pop();
                Expr::let_in(name.clone(), &init, &body)
            }
            _ => expr.map_children(|child| self.rewrite(child, shadowed)),
        }
    }

    /// Rebuilds an access path over the narrowed parameter, returning the
    /// rebuilt expression along with the use map and remaining depth of
    /// the value it produces
    fn rewrite_access(&self, expr: &Expr) -> (Expr, &FieldUseMap, usize) {
        match expr.kind() {
            ExprKind::Deref(inner) => {
                let (inner, usage, depth) = self.rewrite_access(inner);
                let usage = match usage {
                    FieldUseMap::Ref(inner) => &**inner,
                    usage => usage,
                };
                (inner.deref(), usage, depth)
            }
            ExprKind::Borrow(inner) => {
                let (inner, usage, depth) = self.rewrite_access(inner);
                (inner.borrow(), usage, depth)
            }
            ExprKind::Clone(inner) => {
                let (inner, usage, depth) = self.rewrite_access(inner);
                (inner.clone_value(), usage, depth)
            }
            ExprKind::Field(inner, idx) => {
                let (inner, usage, depth) = self.rewrite_access(inner);
                let field = usage.field(*idx).unwrap_or(usage);
                if depth > 0 {
                    (inner.field(usage.narrowed_index(*idx)), field, depth - 1)
                } else {
                    (inner.field(*idx), field, 0)
                }
            }
            _ => (
                Expr::var(self.name.to_owned(), self.ty.clone()),
                self.usage,
                self.depth,
            ),
        }
    }
}

/// Builds the `MapIndex` closure narrowing the values of an indexed
/// collection to the fields `usage` marks as read
pub fn projection(key: &Type, value: &Type, usage: &FieldUseMap, depth: usize) -> Closure {
    let usage = match usage {
        FieldUseMap::Ref(inner) => &**inner,
        usage => usage,
    };

    Closure::unary(
        "kv",
        Type::raw_tuple([key.reference(), value.reference()]),
        |kv| {
            Expr::raw_tuple(vec![
                kv.field(0).deref().clone_value(),
                usage.project(&kv.field(1).deref(), depth),
            ])
        },
    )
}

/// Narrows the values flowing into each join to the fields its closure
/// reads by inserting a projection in front of the join
#[tracing::instrument(skip_all)]
pub fn trim_unused_fields(circuit: &Circuit, depth: usize) -> CompilerResult<Circuit> {
    let mut rewriter = CircuitRewriter::new(circuit);

    for operator in circuit.operators() {
        let function = match operator.kind() {
            OperatorKind::Join { function }
            | OperatorKind::JoinIndex { function }
            | OperatorKind::JoinFilterMap { function, .. }
            | OperatorKind::StreamJoin { function }
            | OperatorKind::StreamJoinIndex { function }
            | OperatorKind::StreamJoinFilterMap { function, .. } => function,
            _ => {
                rewriter.keep(operator)?;
                continue;
            }
        };

        narrow_join(&mut rewriter, operator, function, depth)?;
    }

    rewriter.finish()
}

fn narrow_join(
    rewriter: &mut CircuitRewriter<'_>,
    operator: &Arc<Operator>,
    function: &Closure,
    depth: usize,
) -> CompilerResult<()> {
    let usage = analyze_closure(function)?;
    let mut inputs = rewriter.remapped_inputs(operator)?;
    let mut narrowed = function.clone();

    // Parameters 1 and 2 are the values of the left and right inputs
    for (side, input) in inputs.iter_mut().enumerate() {
        let param = side + 1;
        let param_ty = function.params()[param].ty();
        let narrow = usage[param].narrow_type(param_ty, depth);
        if &narrow == param_ty {
            continue;
        }

        let key = function.params()[0].ty().strip_ref();
        let value = param_ty.strip_ref();
        let project = projection(key, value, &usage[param], depth);
        let projected = rewriter.add_derived(
            OperatorKind::MapIndex { function: project },
            &[*input],
            operator.id(),
        )?;
        tracing::debug!(
            "narrowed input {side} of {} from {value} to {} through {projected}",
            operator.id(),
            narrow.strip_ref(),
        );

        narrowed = narrow_closure(&narrowed, param, &usage[param], depth)?;
        *input = projected;
    }

    let kind = match operator.kind() {
        OperatorKind::Join { .. } => OperatorKind::Join { function: narrowed },
        OperatorKind::JoinIndex { .. } => OperatorKind::JoinIndex { function: narrowed },
        OperatorKind::JoinFilterMap { filter, map, .. } => OperatorKind::JoinFilterMap {
            function: narrowed,
            filter: filter.clone(),
            map: map.clone(),
        },
        OperatorKind::StreamJoin { .. } => OperatorKind::StreamJoin { function: narrowed },
        OperatorKind::StreamJoinIndex { .. } => OperatorKind::StreamJoinIndex { function: narrowed },
        OperatorKind::StreamJoinFilterMap { filter, map, .. } => {
            OperatorKind::StreamJoinFilterMap {
                function: narrowed,
                filter: filter.clone(),
                map: map.clone(),
            }
        }
        kind => internal_error!("narrowed the inputs of non-join {}", kind.name()),
    };

    rewriter.rebuild_with_inputs(operator, kind, &inputs)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{analyze_closure, narrow_closure, projection, trim_unused_fields, FieldUseMap};
    use crate::{
        circuit::{Circuit, OperatorKind},
        eval::{call, CircuitRunner, Value, ZSet},
        ir::{BinaryOp, Closure, Expr, Type},
    };
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn row() -> Type {
        Type::tuple([Type::i32(), Type::i32(), Type::i32()])
    }

    #[test]
    fn marks_read_fields() {
        let closure = Closure::unary("t", row().reference(), |t| {
            Expr::binary(BinaryOp::Add, &t.deref().field(0), &t.deref().field(2))
        });
        let usage = analyze_closure(&closure).unwrap();
        assert_eq!(
            usage[0],
            FieldUseMap::Ref(Box::new(FieldUseMap::Tuple(vec![
                FieldUseMap::Leaf(true),
                FieldUseMap::Leaf(false),
                FieldUseMap::Leaf(true),
            ]))),
        );
        assert_eq!(
            usage[0].narrow_type(&row().reference(), 1),
            Type::tuple([Type::i32(), Type::i32()]).reference(),
        );

        let whole = Closure::identity(&row());
        assert!(analyze_closure(&whole).unwrap()[0].is_fully_used());
    }

    #[test]
    fn aliases_and_shadowing() {
        // let x = (*t).1; x + x
        let closure = Closure::unary("t", row().reference(), |t| {
            let x = Expr::var("x", Type::i32());
            Expr::let_in(
                "x",
                &t.deref().field(1),
                &Expr::binary(BinaryOp::Add, &x, &x),
            )
        });
        let usage = analyze_closure(&closure).unwrap();
        assert_eq!(usage[0].field(1), Some(&FieldUseMap::Leaf(true)));
        assert_eq!(usage[0].field(0), Some(&FieldUseMap::Leaf(false)));

        // A let shadowing the parameter hides it
        let closure = Closure::unary("t", row().reference(), |t| {
            let shadow = Expr::var("t", Type::i32());
            Expr::let_in(
                "t",
                &Expr::binary(BinaryOp::Add, &t.deref().field(0), &Expr::i32(1)),
                &Expr::binary(BinaryOp::Mul, &shadow, &shadow),
            )
        });
        let usage = analyze_closure(&closure).unwrap();
        assert_eq!(usage[0].field(0), Some(&FieldUseMap::Leaf(true)));
        assert!(!usage[0].field(1).unwrap().is_used());
    }

    #[test]
    fn nested_depth() {
        let nested = Type::tuple([Type::i32(), Type::tuple([Type::i32(), Type::i32()])]);
        let closure = Closure::unary("t", nested.reference(), |t| t.deref().field(1).field(0));
        let usage = analyze_closure(&closure).unwrap();

        assert_eq!(
            usage[0].narrow_type(&nested.reference(), 1),
            Type::tuple([Type::tuple([Type::i32(), Type::i32()])]).reference(),
        );
        assert_eq!(
            usage[0].narrow_type(&nested.reference(), 2),
            Type::tuple([Type::tuple([Type::i32()])]).reference(),
        );

        let narrowed = narrow_closure(&closure, 0, &usage[0], 2).unwrap();
        assert_eq!(narrowed.body().to_string(), "(*t).0.0");
    }

    fn join_closure() -> Closure {
        Closure::ternary(
            ["k", "l", "r"],
            [Type::i32().reference(), row().reference(), row().reference()],
            |k, l, r| {
                Expr::tuple(vec![
                    k.deref(),
                    Expr::binary(BinaryOp::Sub, &l.deref().field(2), &r.deref().field(1)),
                ])
            },
        )
    }

    proptest! {
        #[test]
        fn narrowed_closures_compute_the_same(
            key in -10i64..10,
            left in prop::array::uniform3(-100i64..100),
            right in prop::array::uniform3(-100i64..100),
            depth in 1usize..3,
        ) {
            let closure = join_closure();
            let usage = analyze_closure(&closure).unwrap();
            let tuple = |fields: [i64; 3]| Value::tuple(fields.map(Value::Int));

            let expected = call(&closure, &[Value::Int(key), tuple(left), tuple(right)]);

            let mut narrowed = closure.clone();
            let mut args = vec![Value::Int(key), tuple(left), tuple(right)];
            for param in [1, 2] {
                narrowed = narrow_closure(&narrowed, param, &usage[param], depth).unwrap();
                let project = projection(&Type::i32(), &row(), &usage[param], depth);
                let projected = call(&project, &[Value::pair(Value::Int(key), args[param].clone())]).unwrap();
                args[param] = projected.as_pair().unwrap().1.clone();
            }

            prop_assert_eq!(call(&narrowed, &args), expected);
        }
    }

    #[test]
    fn joins_read_narrowed_inputs() {
        let mut circuit = Circuit::new();
        let mut indexed = Vec::new();
        for name in ["a", "b"] {
            let source = circuit
                .add(
                    OperatorKind::Source {
                        name: name.to_owned(),
                        row: row(),
                        columns: Vec::new(),
                    },
                    &[],
                )
                .unwrap();
            let index = circuit
                .add(
                    OperatorKind::MapIndex {
                        function: Closure::unary("t", row().reference(), |t| {
                            Expr::raw_tuple(vec![t.deref().field(0), t.deref().clone_value()])
                        }),
                    },
                    &[source],
                )
                .unwrap();
            indexed.push(index);
        }
        let join = circuit
            .add(OperatorKind::Join { function: join_closure() }, &indexed)
            .unwrap();
        circuit
            .add(
                OperatorKind::Sink {
                    name: "out".to_owned(),
                },
                &[join],
            )
            .unwrap();

        let trimmed = trim_unused_fields(&circuit, 1).unwrap();
        assert_eq!(trimmed.len(), circuit.len() + 2);

        let join = trimmed
            .operators()
            .find(|operator| operator.kind().is_join())
            .unwrap();
        let narrow = Type::tuple([Type::i32()]);
        assert_eq!(
            trimmed.operator(join.input(0)).unwrap().output_type(),
            &Type::indexed_zset(Type::i32(), narrow.clone()),
        );
        assert_eq!(
            trimmed.operator(join.input(1)).unwrap().output_type(),
            &Type::indexed_zset(Type::i32(), narrow),
        );

        let rows = |rows: &[[i64; 3]]| -> ZSet {
            rows.iter()
                .map(|fields| (Value::tuple(fields.map(Value::Int)), 1))
                .collect()
        };
        let inputs = BTreeMap::from([
            ("a".to_owned(), rows(&[[1, 2, 3], [2, 0, 0]])),
            ("b".to_owned(), rows(&[[1, 5, 6], [1, 7, 8]])),
        ]);

        let mut original = CircuitRunner::new(&circuit);
        let mut narrowed = CircuitRunner::new(&trimmed);
        assert_eq!(original.step(&inputs).unwrap(), narrowed.step(&inputs).unwrap());
    }
}
