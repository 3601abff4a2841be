//! Tracks which fields of each operator's output can only grow over time
//!
//! A field is monotone when every row an operator emits at step `t` has a
//! value of at least `bound(t - 1)` for that field, where the bound is a
//! running scalar computed from the lateness declarations of its sources.
//! Monotone closures are additionally reduced to functions over the bound
//! alone, which the limiter uses to derive the bounds of downstream
//! operators

use crate::{
    circuit::{
        lateness_columns, watermark_columns, Circuit, ColumnMetadata, Operator, OperatorKind,
    },
    error::{internal_error, CompilerResult},
    ids::OperatorId,
    ir::{expr::is_lossless_cast, BinaryOp, Closure, Expr, ExprKind, Param, Type},
    passes::expand::{Expansion, ExpansionMap},
};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt::{self, Display},
};

/// The shape of the monotone parts of a value
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MonotoneType {
    NonMonotone,
    /// A scalar which is at least the bound
    Monotone,
    Tuple(Vec<MonotoneType>),
    RawTuple(Vec<MonotoneType>),
}

impl MonotoneType {
    /// Returns true if any part of the value is monotone
    pub fn is_monotone(&self) -> bool {
        match self {
            Self::NonMonotone => false,
            Self::Monotone => true,
            Self::Tuple(fields) | Self::RawTuple(fields) => fields.iter().any(Self::is_monotone),
        }
    }

    pub fn field(&self, idx: usize) -> Self {
        match self {
            Self::Tuple(fields) | Self::RawTuple(fields) => {
                fields.get(idx).cloned().unwrap_or(Self::NonMonotone)
            }
            Self::NonMonotone | Self::Monotone => Self::NonMonotone,
        }
    }

    /// The position of the `idx`th field within the reduced value, which
    /// only holds the monotone fields
    pub fn reduced_index(&self, idx: usize) -> usize {
        match self {
            Self::Tuple(fields) | Self::RawTuple(fields) => fields
                .iter()
                .take(idx)
                .filter(|field| field.is_monotone())
                .count(),
            Self::NonMonotone | Self::Monotone => 0,
        }
    }

    /// The type of the reduced value holding only the monotone parts of a
    /// value of type `ty`, references are dropped along the way
    pub fn reduced_type(&self, ty: &Type) -> Option<Type> {
        let ty = strip_refs(ty);
        match self {
            Self::NonMonotone => None,
            Self::Monotone => Some(ty.clone()),
            Self::Tuple(fields) | Self::RawTuple(fields) => {
                let types = ty.tuple_fields()?;
                let reduced: Vec<Type> = fields
                    .iter()
                    .zip(types)
                    .filter_map(|(field, ty)| field.reduced_type(ty))
                    .collect();

                if reduced.is_empty() {
                    None
                } else if self.is_tuple() {
                    Some(Type::tuple(reduced))
                } else {
                    Some(Type::raw_tuple(reduced))
                }
            }
        }
    }

    /// The parts which are monotone in both values
    pub fn meet(&self, other: &Self) -> Self {
        match (self, other) {
            (Self::Monotone, Self::Monotone) => Self::Monotone,
            (Self::Tuple(left), Self::Tuple(right)) if left.len() == right.len() => {
                Self::Tuple(left.iter().zip(right).map(|(l, r)| l.meet(r)).collect())
            }
            (Self::RawTuple(left), Self::RawTuple(right)) if left.len() == right.len() => {
                Self::RawTuple(left.iter().zip(right).map(|(l, r)| l.meet(r)).collect())
            }
            _ => Self::NonMonotone,
        }
    }

    const fn is_tuple(&self) -> bool {
        matches!(self, Self::Tuple(_))
    }
}

impl Display for MonotoneType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (open, close, fields) = match self {
            Self::NonMonotone => return f.write_str("_"),
            Self::Monotone => return f.write_str("M"),
            Self::Tuple(fields) => ("Tup(", ")", fields),
            Self::RawTuple(fields) => ("(", ")", fields),
        };

        write!(f, "{open}{}{close}", fields.iter().format(", "))
    }
}

fn strip_refs(mut ty: &Type) -> &Type {
    while let Type::Ref(inner) = ty {
        ty = inner;
    }
    ty
}

/// The monotone parts of a closure's result along with the closure
/// computing them from the reduced values of its parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonotoneClosure {
    pub monotone: MonotoneType,
    /// Takes a reference to the reduced value of every parameter with
    /// monotone parts, `None` when the result has no monotone parts
    pub reduced: Option<Closure>,
}

/// Analyzes a closure given the monotone parts of its arguments
pub fn monotone_closure(closure: &Closure, params: &[MonotoneType]) -> MonotoneClosure {
    let mut reduced_params = Vec::new();
    let mut scope = Vec::with_capacity(params.len());
    for (idx, (param, monotone)) in closure.params().iter().zip(params).enumerate() {
        let reduced = monotone.reduced_type(param.ty()).map(|ty| {
            let param = Param::new(format!("b{idx}"), ty.reference());
            let value = param.var().deref();
            reduced_params.push(param);
            value
        });
        scope.push((
            param.name(),
            Reduction {
                monotone: if reduced.is_some() {
                    monotone.clone()
                } else {
                    MonotoneType::NonMonotone
                },
                expr: reduced,
            },
        ));
    }

    let body = reduce(closure.body(), &mut scope);
    MonotoneClosure {
        reduced: body
            .expr
            .map(|expr| Closure::new(reduced_params, expr)),
        monotone: body.monotone,
    }
}

/// The monotone parts of an expression and the expression computing them
/// from the reduced values in scope
#[derive(Debug, Clone)]
struct Reduction {
    monotone: MonotoneType,
    expr: Option<Expr>,
}

impl Reduction {
    const fn non_monotone() -> Self {
        Self {
            monotone: MonotoneType::NonMonotone,
            expr: None,
        }
    }
}

fn reduce<'e>(expr: &'e Expr, scope: &mut Vec<(&'e str, Reduction)>) -> Reduction {
    match expr.kind() {
        ExprKind::Literal(literal) if !literal.is_null_value() => Reduction {
            monotone: MonotoneType::Monotone,
            expr: Some(expr.clone()),
        },

        ExprKind::Var(name) => scope
            .iter()
            .rev()
            .find(|(bound, _)| *bound == name.as_str())
            .map_or_else(Reduction::non_monotone, |(_, reduction)| reduction.clone()),

        ExprKind::Field(tuple, idx) => {
            let tuple = reduce(tuple, scope);
            let monotone = tuple.monotone.field(*idx);
            match tuple.expr {
                Some(reduced) if monotone.is_monotone() => Reduction {
                    expr: Some(reduced.field(tuple.monotone.reduced_index(*idx))),
                    monotone,
                },
                _ => Reduction::non_monotone(),
            }
        }

        // References and clones hold the same value
        ExprKind::Deref(inner) | ExprKind::Borrow(inner) | ExprKind::Clone(inner) => {
            reduce(inner, scope)
        }

        ExprKind::Cast(source) => {
            let source_reduction = reduce(source, scope);
            match source_reduction.expr {
                Some(reduced)
                    if source_reduction.monotone == MonotoneType::Monotone
                        && is_lossless_cast(source.ty(), expr.ty()) =>
                {
                    Reduction {
                        monotone: MonotoneType::Monotone,
                        expr: Some(reduced.cast(expr.ty().clone())),
                    }
                }
                _ => Reduction::non_monotone(),
            }
        }

        ExprKind::Binary(op @ (BinaryOp::Max | BinaryOp::Min), lhs, rhs) => {
            let (lhs, rhs) = (reduce(lhs, scope), reduce(rhs, scope));
            match (lhs.expr, rhs.expr) {
                (Some(lhs_expr), Some(rhs_expr))
                    if lhs.monotone == MonotoneType::Monotone
                        && rhs.monotone == MonotoneType::Monotone =>
                {
                    Reduction {
                        monotone: MonotoneType::Monotone,
                        expr: Some(Expr::binary(*op, &lhs_expr, &rhs_expr)),
                    }
                }
                _ => Reduction::non_monotone(),
            }
        }

        ExprKind::Tuple(fields) | ExprKind::RawTuple(fields) => {
            let mut monotone = Vec::with_capacity(fields.len());
            let mut reduced = Vec::new();
            for field in fields {
                let field = reduce(field, scope);
                if let (true, Some(expr)) = (field.monotone.is_monotone(), field.expr) {
                    reduced.push(expr);
                }
                monotone.push(field.monotone);
            }

            let raw = matches!(expr.kind(), ExprKind::RawTuple(_));
            Reduction {
                expr: (!reduced.is_empty()).then(|| {
                    if raw {
                        Expr::raw_tuple(reduced)
                    } else {
                        Expr::tuple(reduced)
                    }
                }),
                monotone: if raw {
                    MonotoneType::RawTuple(monotone)
                } else {
                    MonotoneType::Tuple(monotone)
                },
            }
        }

        ExprKind::Let { name, init, body } => {
            let init = reduce(init, scope);
            scope.push((name.as_str(), init));
            let body = reduce(body, scope);
            scope.pop();
            body
        }

        // Arithmetic may overflow on the bound's initial minimum and every
        // other construct may reorder values
        ExprKind::Literal(_)
        | ExprKind::Binary(..)
        | ExprKind::Unary(..)
        | ExprKind::IsNull(_)
        | ExprKind::If { .. }
        | ExprKind::Call { .. } => Reduction::non_monotone(),
    }
}

/// Builds the condition under which `value` is at least `bound` in each of
/// its monotone fields, `None` if it has none
///
/// `bound` holds the reduced value, `NULL` fields always pass
pub fn bound_predicate(value: &Expr, monotone: &MonotoneType, bound: &Expr) -> Option<Expr> {
    match monotone {
        MonotoneType::NonMonotone => None,
        MonotoneType::Monotone => Some(Expr::binary(
            BinaryOp::Or,
            &value.test_null(),
            &Expr::binary(BinaryOp::Gte, value, bound),
        )),
        MonotoneType::Tuple(fields) | MonotoneType::RawTuple(fields) => fields
            .iter()
            .enumerate()
            .filter(|(_, field)| field.is_monotone())
            .filter_map(|(idx, field)| {
                bound_predicate(
                    &value.field(idx),
                    field,
                    &bound.field(monotone.reduced_index(idx)),
                )
            })
            .reduce(|acc, predicate| Expr::binary(BinaryOp::And, &acc, &predicate)),
    }
}

/// The monotone parts of every operator's output
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Monotonicity {
    types: BTreeMap<OperatorId, MonotoneType>,
}

impl Monotonicity {
    pub fn get(&self, id: OperatorId) -> &MonotoneType {
        self.types.get(&id).unwrap_or(&MonotoneType::NonMonotone)
    }

    /// The operators with monotone outputs
    pub fn monotone_operators(&self) -> impl Iterator<Item = (OperatorId, &MonotoneType)> + '_ {
        self.types
            .iter()
            .filter(|(_, monotone)| monotone.is_monotone())
            .map(|(&id, monotone)| (id, monotone))
    }
}

/// Computes the monotone parts of each operator of an expanded circuit
///
/// The operators produced by expanding a join or an integrated operator
/// are analyzed as the original operator would be, the deltas flowing into
/// them carry the same bounds as their inputs
#[tracing::instrument(skip_all)]
pub fn analyze(circuit: &Circuit, expansions: &ExpansionMap) -> CompilerResult<Monotonicity> {
    let mut analysis = Monotonicity::default();

    for operator in circuit.operators() {
        let monotone = match expansions.producing(operator.id()) {
            Some((_, Expansion::Join { both_deltas, .. })) => {
                let primitive = circuit.operator(*both_deltas)?;
                operator_monotone(primitive, &analysis)?
            }

            Some((
                _,
                Expansion::Integrated {
                    integrals,
                    primitive,
                    ..
                },
            )) => {
                let inputs = integrals
                    .iter()
                    .map(|&integral| {
                        Ok(analysis.get(circuit.operator(integral)?.input(0)).clone())
                    })
                    .collect::<CompilerResult<Vec<_>>>()?;
                let primitive = circuit.operator(*primitive)?;
                kind_monotone(primitive, &inputs.iter().collect::<Vec<_>>())?
            }

            _ => operator_monotone(operator, &analysis)?,
        };

        if monotone.is_monotone() {
            tracing::debug!("{} has monotone output {monotone}", operator.id());
        }
        analysis.types.insert(operator.id(), monotone);
    }

    Ok(analysis)
}

fn operator_monotone(operator: &Operator, analysis: &Monotonicity) -> CompilerResult<MonotoneType> {
    let inputs: Vec<&MonotoneType> = operator
        .inputs()
        .iter()
        .map(|&input| analysis.get(input))
        .collect();
    kind_monotone(operator, &inputs)
}

/// The monotone parts of a collection's rows given declared lateness
pub fn lateness_monotone(row: &Type, columns: &[ColumnMetadata]) -> MonotoneType {
    let lateness: Vec<usize> = lateness_columns(columns).map(|(idx, _)| idx).collect();
    if lateness.is_empty() {
        return MonotoneType::NonMonotone;
    }

    MonotoneType::Tuple(
        (0..row.field_count())
            .map(|idx| {
                if lateness.contains(&idx) {
                    MonotoneType::Monotone
                } else {
                    MonotoneType::NonMonotone
                }
            })
            .collect(),
    )
}

/// The monotone parts of a join's output, keys are monotone when both sides
/// agree while values may be joined against arbitrarily old rows
fn join_monotone(kind: &OperatorKind, left: &MonotoneType, right: &MonotoneType) -> MonotoneType {
    let key = left.field(0).meet(&right.field(0));
    let params = [key, MonotoneType::NonMonotone, MonotoneType::NonMonotone];

    match kind {
        OperatorKind::Join { function }
        | OperatorKind::JoinIndex { function }
        | OperatorKind::StreamJoin { function }
        | OperatorKind::StreamJoinIndex { function } => {
            monotone_closure(function, &params).monotone
        }

        OperatorKind::JoinFilterMap { function, map, .. }
        | OperatorKind::StreamJoinFilterMap { function, map, .. } => {
            let joined = monotone_closure(function, &params).monotone;
            monotone_closure(map, &[joined]).monotone
        }

        _ => MonotoneType::NonMonotone,
    }
}

fn kind_monotone(operator: &Operator, inputs: &[&MonotoneType]) -> CompilerResult<MonotoneType> {
    let input = |idx: usize| -> CompilerResult<&MonotoneType> {
        match inputs.get(idx) {
            Some(&input) => Ok(input),
            None => internal_error!("{} is missing input {idx}", operator.id()),
        }
    };

    Ok(match operator.kind() {
        OperatorKind::Source { row, columns, .. } => {
            // Watermarked sources release rows out of order through their window
            if watermark_columns(columns).next().is_some() {
                MonotoneType::NonMonotone
            } else {
                lateness_monotone(row, columns)
            }
        }

        OperatorKind::View { columns, .. } => {
            let row = operator.output_type().element_type().unwrap_or_else(Type::unit);
            if watermark_columns(columns).next().is_some() {
                MonotoneType::NonMonotone
            } else if lateness_columns(columns).next().is_some() {
                lateness_monotone(&row, columns)
            } else {
                input(0)?.clone()
            }
        }

        OperatorKind::Sink { .. }
        | OperatorKind::Filter { .. }
        | OperatorKind::Negate
        | OperatorKind::Noop
        | OperatorKind::Distinct
        | OperatorKind::StreamDistinct
        | OperatorKind::ControlledFilter { .. }
        | OperatorKind::Window => input(0)?.clone(),

        OperatorKind::Map { function } | OperatorKind::MapIndex { function } => {
            monotone_closure(function, &[input(0)?.clone()]).monotone
        }

        OperatorKind::Deindex => input(0)?.field(1),

        OperatorKind::Sum | OperatorKind::Subtract => {
            let mut inputs = inputs.iter();
            match inputs.next() {
                Some(&first) => inputs.fold(first.clone(), |acc, &input| acc.meet(input)),
                None => MonotoneType::NonMonotone,
            }
        }

        kind @ (OperatorKind::Join { .. }
        | OperatorKind::JoinIndex { .. }
        | OperatorKind::JoinFilterMap { .. }
        | OperatorKind::StreamJoin { .. }
        | OperatorKind::StreamJoinIndex { .. }
        | OperatorKind::StreamJoinFilterMap { .. }) => join_monotone(kind, input(0)?, input(1)?),

        // Rows of the left input are dropped or restored whenever a key of
        // either input changes
        OperatorKind::AntiJoin | OperatorKind::StreamAntiJoin => MonotoneType::RawTuple(vec![
            input(0)?.field(0).meet(&input(1)?.field(0)),
            MonotoneType::NonMonotone,
        ]),

        // Only the groups whose keys changed are emitted
        OperatorKind::Aggregate { .. }
        | OperatorKind::StreamAggregate { .. }
        | OperatorKind::DeltaAggregate { .. } => {
            MonotoneType::RawTuple(vec![input(0)?.field(0), MonotoneType::NonMonotone])
        }

        OperatorKind::Constant { .. }
        | OperatorKind::DelayOutput { .. }
        | OperatorKind::Integrate
        | OperatorKind::Differentiate
        | OperatorKind::DelayedIntegral
        | OperatorKind::Delay { .. }
        | OperatorKind::PartitionedRollingAggregate { .. }
        | OperatorKind::StreamPartitionedRollingAggregate { .. }
        | OperatorKind::Waterline { .. }
        | OperatorKind::Apply { .. }
        | OperatorKind::IntegrateTraceRetainKeys { .. } => MonotoneType::NonMonotone,
    })
}
