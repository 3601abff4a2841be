use crate::{
    circuit::metadata::ColumnMetadata,
    error::{CompilerError, CompilerResult},
    ids::{OperatorId, OperatorIdGen},
    ir::{Aggregate, Closure, Expr, Type},
};
use derive_more::IsVariant;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Display},
    sync::Arc,
};

/// The number of inputs an operator kind takes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exactly(usize),
    AtLeast(usize),
}

impl Arity {
    pub const fn accepts(self, inputs: usize) -> bool {
        match self {
            Self::Exactly(arity) => inputs == arity,
            Self::AtLeast(arity) => inputs >= arity,
        }
    }
}

impl Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exactly(arity) => write!(f, "{arity}"),
            Self::AtLeast(arity) => write!(f, "at least {arity}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, IsVariant)]
pub enum OperatorKind {
    /// An input table producing a change stream of `row`s
    Source {
        name: String,
        row: Type,
        columns: Vec<ColumnMetadata>,
    },
    /// A named pass-through, the columns may carry lateness declarations
    View {
        name: String,
        columns: Vec<ColumnMetadata>,
    },
    Sink {
        name: String,
    },
    /// A constant collection, emitted as a single change at the first step
    Constant {
        row: Type,
        rows: Vec<(Expr, i64)>,
    },
    /// Produces the previous step's input of the [`OperatorKind::Delay`] it's
    /// paired with, closing a feedback loop
    DelayOutput {
        ty: Type,
    },

    Map {
        function: Closure,
    },
    /// A map producing `(key, value)` pairs
    MapIndex {
        function: Closure,
    },
    Filter {
        predicate: Closure,
    },
    /// Drops the keys of an indexed collection
    Deindex,
    Sum,
    Subtract,
    Negate,
    Noop,
    Integrate,
    Differentiate,
    /// The integral of the input as of the previous step
    DelayedIntegral,
    /// Outputs the previous step's input, or `initial` at the first step
    Delay {
        initial: Option<Expr>,
    },

    Join {
        function: Closure,
    },
    JoinIndex {
        function: Closure,
    },
    /// A join whose output rows are filtered and then mapped
    JoinFilterMap {
        function: Closure,
        filter: Closure,
        map: Closure,
    },
    AntiJoin,
    Distinct,
    Aggregate {
        aggregate: Aggregate,
    },
    /// Aggregates each row's partition over the rows whose `order` lies
    /// within `preceding` of its own
    PartitionedRollingAggregate {
        order: Closure,
        preceding: i64,
        aggregate: Aggregate,
    },

    StreamJoin {
        function: Closure,
    },
    StreamJoinIndex {
        function: Closure,
    },
    StreamJoinFilterMap {
        function: Closure,
        filter: Closure,
        map: Closure,
    },
    StreamAntiJoin,
    StreamDistinct,
    StreamAggregate {
        aggregate: Aggregate,
    },
    /// Given a change and the delayed integral of a collection, computes the
    /// change of the aggregate of every key the change touches
    DeltaAggregate {
        aggregate: Aggregate,
    },
    StreamPartitionedRollingAggregate {
        order: Closure,
        preceding: i64,
        aggregate: Aggregate,
    },

    /// A running lower bound over the values `extract` produces, starting
    /// from `init`
    Waterline {
        init: Expr,
        extract: Closure,
    },
    /// Applies a function to a scalar stream
    Apply {
        function: Closure,
    },
    /// Keeps the rows which satisfy `predicate(row, bound)`
    ControlledFilter {
        predicate: Closure,
    },
    /// Drops every entry of the input's integrals whose key fails
    /// `predicate(key, bound)`
    IntegrateTraceRetainKeys {
        predicate: Closure,
    },
    /// Restricts an indexed collection to the keys within `[lower, upper)`
    Window,
}

impl OperatorKind {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Source { .. } => "source",
            Self::View { .. } => "view",
            Self::Sink { .. } => "sink",
            Self::Constant { .. } => "constant",
            Self::DelayOutput { .. } => "delay_output",
            Self::Map { .. } => "map",
            Self::MapIndex { .. } => "map_index",
            Self::Filter { .. } => "filter",
            Self::Deindex => "deindex",
            Self::Sum => "sum",
            Self::Subtract => "subtract",
            Self::Negate => "negate",
            Self::Noop => "noop",
            Self::Integrate => "integrate",
            Self::Differentiate => "differentiate",
            Self::DelayedIntegral => "delayed_integral",
            Self::Delay { .. } => "delay",
            Self::Join { .. } => "join",
            Self::JoinIndex { .. } => "join_index",
            Self::JoinFilterMap { .. } => "join_filter_map",
            Self::AntiJoin => "antijoin",
            Self::Distinct => "distinct",
            Self::Aggregate { .. } => "aggregate",
            Self::PartitionedRollingAggregate { .. } => "partitioned_rolling_aggregate",
            Self::StreamJoin { .. } => "stream_join",
            Self::StreamJoinIndex { .. } => "stream_join_index",
            Self::StreamJoinFilterMap { .. } => "stream_join_filter_map",
            Self::StreamAntiJoin => "stream_antijoin",
            Self::StreamDistinct => "stream_distinct",
            Self::StreamAggregate { .. } => "stream_aggregate",
            Self::DeltaAggregate { .. } => "delta_aggregate",
            Self::StreamPartitionedRollingAggregate { .. } => {
                "stream_partitioned_rolling_aggregate"
            }
            Self::Waterline { .. } => "waterline",
            Self::Apply { .. } => "apply",
            Self::ControlledFilter { .. } => "controlled_filter",
            Self::IntegrateTraceRetainKeys { .. } => "integrate_trace_retain_keys",
            Self::Window => "window",
        }
    }

    pub const fn arity(&self) -> Arity {
        match self {
            Self::Source { .. } | Self::Constant { .. } | Self::DelayOutput { .. } => {
                Arity::Exactly(0)
            }

            Self::Sum => Arity::AtLeast(1),

            Self::Subtract
            | Self::Join { .. }
            | Self::JoinIndex { .. }
            | Self::JoinFilterMap { .. }
            | Self::AntiJoin
            | Self::StreamJoin { .. }
            | Self::StreamJoinIndex { .. }
            | Self::StreamJoinFilterMap { .. }
            | Self::StreamAntiJoin
            | Self::DeltaAggregate { .. }
            | Self::ControlledFilter { .. }
            | Self::IntegrateTraceRetainKeys { .. }
            | Self::Window => Arity::Exactly(2),

            Self::View { .. }
            | Self::Sink { .. }
            | Self::Map { .. }
            | Self::MapIndex { .. }
            | Self::Filter { .. }
            | Self::Deindex
            | Self::Negate
            | Self::Noop
            | Self::Integrate
            | Self::Differentiate
            | Self::DelayedIntegral
            | Self::Delay { .. }
            | Self::Distinct
            | Self::Aggregate { .. }
            | Self::PartitionedRollingAggregate { .. }
            | Self::StreamDistinct
            | Self::StreamAggregate { .. }
            | Self::StreamPartitionedRollingAggregate { .. }
            | Self::Waterline { .. }
            | Self::Apply { .. } => Arity::Exactly(1),
        }
    }

    /// Returns true for operators with incremental semantics which must be
    /// expanded into stream primitives before reaching the runtime
    pub const fn is_high_level(&self) -> bool {
        matches!(
            self,
            Self::Join { .. }
                | Self::JoinIndex { .. }
                | Self::JoinFilterMap { .. }
                | Self::AntiJoin
                | Self::Distinct
                | Self::Aggregate { .. }
                | Self::PartitionedRollingAggregate { .. },
        )
    }

    /// Returns true for the join family of both the high-level and stream
    /// flavors
    pub const fn is_join_family(&self) -> bool {
        matches!(
            self,
            Self::Join { .. }
                | Self::JoinIndex { .. }
                | Self::JoinFilterMap { .. }
                | Self::StreamJoin { .. }
                | Self::StreamJoinIndex { .. }
                | Self::StreamJoinFilterMap { .. },
        )
    }

    /// Returns true for operators that commute with any row-wise function,
    /// `f(op(x)) = op(f(x))`
    pub const fn commutes_with_maps(&self) -> bool {
        matches!(
            self,
            Self::Integrate
                | Self::Differentiate
                | Self::DelayedIntegral
                | Self::Delay { initial: None }
                | Self::Negate
                | Self::Noop
                | Self::Sum
                | Self::Subtract,
        )
    }

    /// Every closure held by the operator
    pub fn closures(&self) -> Vec<&Closure> {
        match self {
            Self::Map { function }
            | Self::MapIndex { function }
            | Self::Join { function }
            | Self::JoinIndex { function }
            | Self::StreamJoin { function }
            | Self::StreamJoinIndex { function }
            | Self::Apply { function } => vec![function],

            Self::Filter { predicate }
            | Self::ControlledFilter { predicate }
            | Self::IntegrateTraceRetainKeys { predicate } => vec![predicate],

            Self::Waterline { extract, .. } => vec![extract],

            Self::JoinFilterMap {
                function,
                filter,
                map,
            }
            | Self::StreamJoinFilterMap {
                function,
                filter,
                map,
            } => vec![function, filter, map],

            Self::Aggregate { aggregate }
            | Self::StreamAggregate { aggregate }
            | Self::DeltaAggregate { aggregate } => aggregate.closures().collect(),

            Self::PartitionedRollingAggregate {
                order, aggregate, ..
            }
            | Self::StreamPartitionedRollingAggregate {
                order, aggregate, ..
            } => std::iter::once(order).chain(aggregate.closures()).collect(),

            Self::Source { .. }
            | Self::View { .. }
            | Self::Sink { .. }
            | Self::Constant { .. }
            | Self::DelayOutput { .. }
            | Self::Deindex
            | Self::Sum
            | Self::Subtract
            | Self::Negate
            | Self::Noop
            | Self::Integrate
            | Self::Differentiate
            | Self::DelayedIntegral
            | Self::Delay { .. }
            | Self::AntiJoin
            | Self::Distinct
            | Self::StreamAntiJoin
            | Self::StreamDistinct
            | Self::Window => Vec::new(),
        }
    }

    /// Rebuilds the kind with every closure replaced by `map(closure)`
    pub fn try_map_closures<F>(&self, mut map: F) -> CompilerResult<Self>
    where
        F: FnMut(&Closure) -> CompilerResult<Closure>,
    {
        Ok(match self {
            Self::Map { function } => Self::Map {
                function: map(function)?,
            },
            Self::MapIndex { function } => Self::MapIndex {
                function: map(function)?,
            },
            Self::Join { function } => Self::Join {
                function: map(function)?,
            },
            Self::JoinIndex { function } => Self::JoinIndex {
                function: map(function)?,
            },
            Self::StreamJoin { function } => Self::StreamJoin {
                function: map(function)?,
            },
            Self::StreamJoinIndex { function } => Self::StreamJoinIndex {
                function: map(function)?,
            },
            Self::Apply { function } => Self::Apply {
                function: map(function)?,
            },
            Self::Filter { predicate } => Self::Filter {
                predicate: map(predicate)?,
            },
            Self::ControlledFilter { predicate } => Self::ControlledFilter {
                predicate: map(predicate)?,
            },
            Self::IntegrateTraceRetainKeys { predicate } => Self::IntegrateTraceRetainKeys {
                predicate: map(predicate)?,
            },
            Self::Waterline { init, extract } => Self::Waterline {
                init: init.clone(),
                extract: map(extract)?,
            },
            Self::JoinFilterMap {
                function,
                filter,
                map: project,
            } => Self::JoinFilterMap {
                function: map(function)?,
                filter: map(filter)?,
                map: map(project)?,
            },
            Self::StreamJoinFilterMap {
                function,
                filter,
                map: project,
            } => Self::StreamJoinFilterMap {
                function: map(function)?,
                filter: map(filter)?,
                map: map(project)?,
            },
            Self::Aggregate { aggregate } => Self::Aggregate {
                aggregate: aggregate.map_closures(&mut map)?,
            },
            Self::StreamAggregate { aggregate } => Self::StreamAggregate {
                aggregate: aggregate.map_closures(&mut map)?,
            },
            Self::DeltaAggregate { aggregate } => Self::DeltaAggregate {
                aggregate: aggregate.map_closures(&mut map)?,
            },
            Self::PartitionedRollingAggregate {
                order,
                preceding,
                aggregate,
            } => Self::PartitionedRollingAggregate {
                order: map(order)?,
                preceding: *preceding,
                aggregate: aggregate.map_closures(&mut map)?,
            },
            Self::StreamPartitionedRollingAggregate {
                order,
                preceding,
                aggregate,
            } => Self::StreamPartitionedRollingAggregate {
                order: map(order)?,
                preceding: *preceding,
                aggregate: aggregate.map_closures(&mut map)?,
            },

            Self::Source { .. }
            | Self::View { .. }
            | Self::Sink { .. }
            | Self::Constant { .. }
            | Self::DelayOutput { .. }
            | Self::Deindex
            | Self::Sum
            | Self::Subtract
            | Self::Negate
            | Self::Noop
            | Self::Integrate
            | Self::Differentiate
            | Self::DelayedIntegral
            | Self::Delay { .. }
            | Self::AntiJoin
            | Self::Distinct
            | Self::StreamAntiJoin
            | Self::StreamDistinct
            | Self::Window => self.clone(),
        })
    }

    /// The kind with every closure in canonical form, two kinds are
    /// equivalent exactly when their canonical forms are equal
    pub fn canonical(&self) -> CompilerResult<Self> {
        self.try_map_closures(|closure| Ok(closure.canonical()))
    }

    pub fn equivalent(&self, other: &Self) -> bool {
        if std::mem::discriminant(self) != std::mem::discriminant(other) {
            return false;
        }
        match (self.canonical(), other.canonical()) {
            (Ok(canonical), Ok(other)) => canonical == other,
            _ => false,
        }
    }

    /// The column metadata of sources and views
    pub fn columns(&self) -> Option<&[ColumnMetadata]> {
        match self {
            Self::Source { columns, .. } | Self::View { columns, .. } => Some(columns),
            _ => None,
        }
    }

    /// The stream primitive a high-level operator applies to its
    /// integrated inputs
    pub fn stream_primitive(&self) -> Option<Self> {
        Some(match self {
            Self::Join { function } => Self::StreamJoin {
                function: function.clone(),
            },
            Self::JoinIndex { function } => Self::StreamJoinIndex {
                function: function.clone(),
            },
            Self::JoinFilterMap {
                function,
                filter,
                map,
            } => Self::StreamJoinFilterMap {
                function: function.clone(),
                filter: filter.clone(),
                map: map.clone(),
            },
            Self::AntiJoin => Self::StreamAntiJoin,
            Self::Distinct => Self::StreamDistinct,
            Self::Aggregate { aggregate } => Self::StreamAggregate {
                aggregate: aggregate.clone(),
            },
            Self::PartitionedRollingAggregate {
                order,
                preceding,
                aggregate,
            } => Self::StreamPartitionedRollingAggregate {
                order: order.clone(),
                preceding: *preceding,
                aggregate: aggregate.clone(),
            },
            _ => return None,
        })
    }
}

/// Advisory information attached to operators
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct Annotations {
    /// Set when the operator's closure is a pure projection producing a
    /// tuple of the given size
    pub projection: Option<usize>,
    /// The operator this one was generated from by a lowering pass
    pub derived_from: Option<OperatorId>,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operator {
    id: OperatorId,
    kind: OperatorKind,
    inputs: Vec<OperatorId>,
    output_type: Type,
    multiset: bool,
    annotations: Annotations,
}

impl Operator {
    /// Creates an operator, checking the kind's constraints against the
    /// types of `inputs`
    pub fn new(id: OperatorId, kind: OperatorKind, inputs: &[&Self]) -> CompilerResult<Self> {
        if !kind.arity().accepts(inputs.len()) {
            return Err(CompilerError::internal(format!(
                "{} takes {} inputs but was given {}",
                kind.name(),
                kind.arity(),
                inputs.len(),
            ))
            .at(id));
        }

        let input_types: Vec<&Type> = inputs.iter().map(|input| &input.output_type).collect();
        let output_type = output_type(&kind, &input_types).map_err(|error| error.at(id))?;

        let multiset = match kind {
            OperatorKind::Distinct | OperatorKind::StreamDistinct => false,
            OperatorKind::View { .. }
            | OperatorKind::Sink { .. }
            | OperatorKind::Filter { .. }
            | OperatorKind::Noop
            | OperatorKind::ControlledFilter { .. }
            | OperatorKind::Window => inputs[0].multiset,
            _ => true,
        };

        let projection = match &kind {
            OperatorKind::Map { function } | OperatorKind::MapIndex { function }
                if function.is_projection() =>
            {
                Some(function.result_type().field_count())
            }
            _ => None,
        };

        Ok(Self {
            id,
            kind,
            inputs: inputs.iter().map(|input| input.id).collect(),
            output_type,
            multiset,
            annotations: Annotations {
                projection,
                ..Annotations::default()
            },
        })
    }

    pub const fn id(&self) -> OperatorId {
        self.id
    }

    pub const fn kind(&self) -> &OperatorKind {
        &self.kind
    }

    pub fn inputs(&self) -> &[OperatorId] {
        &self.inputs
    }

    /// # Panics
    ///
    /// Panics if the operator has no `idx`th input
    pub fn input(&self, idx: usize) -> OperatorId {
        self.inputs[idx]
    }

    pub const fn output_type(&self) -> &Type {
        &self.output_type
    }

    pub const fn is_multiset(&self) -> bool {
        self.multiset
    }

    pub const fn annotations(&self) -> &Annotations {
        &self.annotations
    }

    /// Returns the size of the tuple the operator's projection produces, if
    /// its closure is a pure projection
    pub const fn projection_size(&self) -> Option<usize> {
        self.annotations.projection
    }

    pub fn with_derived_from(mut self, original: OperatorId) -> Self {
        self.annotations.derived_from = Some(original);
        self
    }

    pub fn with_comment<C>(mut self, comment: C) -> Self
    where
        C: Into<String>,
    {
        self.annotations.comment = Some(comment.into());
        self
    }

    /// Returns an operator of the given kind reading from `inputs`, or the
    /// same instance if neither differs from the current ones
    ///
    /// Rebuilt operators receive a fresh id and keep their annotations
    pub fn rebuild(
        self: &Arc<Self>,
        kind: OperatorKind,
        inputs: &[&Self],
        ids: &OperatorIdGen,
    ) -> CompilerResult<Arc<Self>> {
        if kind == self.kind && self.same_inputs(inputs) {
            return Ok(Arc::clone(self));
        }

        let mut operator = Self::new(ids.next(), kind, inputs)?;
        operator.annotations.derived_from = self.annotations.derived_from;
        operator.annotations.comment.clone_from(&self.annotations.comment);
        Ok(Arc::new(operator))
    }

    /// Returns the operator reading from `inputs`, or the same instance when
    /// the inputs are unchanged
    pub fn with_inputs(
        self: &Arc<Self>,
        inputs: &[&Self],
        ids: &OperatorIdGen,
    ) -> CompilerResult<Arc<Self>> {
        if self.same_inputs(inputs) {
            return Ok(Arc::clone(self));
        }
        self.rebuild(self.kind.clone(), inputs, ids)
    }

    /// Replaces the operator's closures with `map(closure)`, returning the
    /// same instance when no closure and no input changed
    pub fn with_function<F>(
        self: &Arc<Self>,
        map: F,
        inputs: &[&Self],
        ids: &OperatorIdGen,
    ) -> CompilerResult<Arc<Self>>
    where
        F: FnMut(&Closure) -> CompilerResult<Closure>,
    {
        let kind = self.kind.try_map_closures(map)?;
        self.rebuild(kind, inputs, ids)
    }

    fn same_inputs(&self, inputs: &[&Self]) -> bool {
        self.inputs.len() == inputs.len()
            && self
                .inputs
                .iter()
                .zip(inputs)
                .all(|(&id, input)| id == input.id)
    }

    /// Returns true if both operators compute the same output from the same
    /// inputs
    pub fn equivalent(&self, other: &Self) -> bool {
        self.inputs == other.inputs
            && self.output_type == other.output_type
            && self.multiset == other.multiset
            && self.kind.equivalent(&other.kind)
    }
}

impl Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} = {}({})",
            self.id,
            self.kind.name(),
            self.inputs.iter().format(", "),
        )?;

        match &self.kind {
            OperatorKind::Source { name, .. }
            | OperatorKind::View { name, .. }
            | OperatorKind::Sink { name } => write!(f, " {name}")?,
            OperatorKind::Aggregate { aggregate }
            | OperatorKind::StreamAggregate { aggregate }
            | OperatorKind::DeltaAggregate { aggregate } => write!(f, " {aggregate}")?,
            OperatorKind::Delay {
                initial: Some(initial),
            } => write!(f, " initial {initial}")?,
            OperatorKind::Waterline { init, .. } => write!(f, " init {init}")?,
            _ => {}
        }
        for closure in self.kind.closures() {
            write!(f, " {closure}")?;
        }

        write!(f, " -> {}", self.output_type)
    }
}

fn internal<T>(message: String) -> CompilerResult<T> {
    Err(CompilerError::internal(message))
}

fn collection<'a>(kind: &OperatorKind, ty: &'a Type) -> CompilerResult<&'a Type> {
    if ty.is_collection() {
        Ok(ty)
    } else {
        internal(format!("{} expects a collection, got {ty}", kind.name()))
    }
}

fn indexed<'a>(kind: &OperatorKind, ty: &'a Type) -> CompilerResult<(&'a Type, &'a Type)> {
    match ty {
        Type::IndexedZSet(key, value) => Ok((key, value)),
        ty => internal(format!("{} expects an indexed collection, got {ty}", kind.name())),
    }
}

fn scalar<'a>(kind: &OperatorKind, ty: &'a Type) -> CompilerResult<&'a Type> {
    if ty.is_collection() {
        internal(format!("{} expects a scalar stream, got {ty}", kind.name()))
    } else {
        Ok(ty)
    }
}

fn closure_argument(kind: &OperatorKind, ty: &Type) -> CompilerResult<Type> {
    match ty.closure_argument() {
        Some(arg) => Ok(arg),
        None => internal(format!("{} expects a collection, got {ty}", kind.name())),
    }
}

/// Checks that `closure` takes `params` and, if given, returns `result`
fn check_closure(
    kind: &OperatorKind,
    closure: &Closure,
    params: &[Type],
    result: Option<&Type>,
) -> CompilerResult<()> {
    let param_types: Vec<&Type> = closure.param_types().collect();
    if param_types.len() != params.len()
        || param_types.iter().zip(params).any(|(&actual, expected)| actual != expected)
    {
        return internal(format!(
            "{} closure {closure} doesn't take ({})",
            kind.name(),
            params.iter().format(", "),
        ));
    }

    if let Some(result) = result {
        if closure.result_type() != result {
            return internal(format!(
                "{} closure {closure} returns {} instead of {result}",
                kind.name(),
                closure.result_type(),
            ));
        }
    }

    Ok(())
}

fn check_predicate(kind: &OperatorKind, closure: &Closure, params: &[Type]) -> CompilerResult<()> {
    check_closure(kind, closure, params, None)?;
    if closure.result_type().is_bool() {
        Ok(())
    } else {
        internal(format!(
            "{} predicate {closure} returns non-boolean {}",
            kind.name(),
            closure.result_type(),
        ))
    }
}

fn same_types(kind: &OperatorKind, inputs: &[&Type]) -> CompilerResult<Type> {
    let first = collection(kind, inputs[0])?;
    if let Some(mismatch) = inputs.iter().find(|&&ty| ty != first) {
        return internal(format!(
            "{} inputs have mismatched types {first} and {mismatch}",
            kind.name(),
        ));
    }
    Ok(first.clone())
}

fn join_inputs<'a>(
    kind: &OperatorKind,
    inputs: &[&'a Type],
) -> CompilerResult<(&'a Type, &'a Type, &'a Type)> {
    let (left_key, left) = indexed(kind, inputs[0])?;
    let (right_key, right) = indexed(kind, inputs[1])?;
    if left_key != right_key {
        return internal(format!(
            "{} inputs have mismatched key types {left_key} and {right_key}",
            kind.name(),
        ));
    }
    Ok((left_key, left, right))
}

fn key_value(kind: &OperatorKind, closure: &Closure) -> CompilerResult<Type> {
    match closure.result_type() {
        Type::RawTuple(fields) if fields.len() == 2 => {
            Ok(Type::indexed_zset(fields[0].clone(), fields[1].clone()))
        }
        ty => internal(format!(
            "{} closure must return a (key, value) pair, not {ty}",
            kind.name(),
        )),
    }
}

fn check_aggregate(kind: &OperatorKind, aggregate: &Aggregate, value: &Type) -> CompilerResult<()> {
    let params = [value.reference()];
    aggregate
        .closures()
        .try_for_each(|closure| check_closure(kind, closure, &params, None))
}

fn output_type(kind: &OperatorKind, inputs: &[&Type]) -> CompilerResult<Type> {
    match kind {
        OperatorKind::Source { row, .. } => Ok(Type::zset(row.clone())),

        OperatorKind::Constant { row, rows } => {
            if let Some((expr, _)) = rows.iter().find(|(expr, _)| expr.ty() != row) {
                return internal(format!(
                    "constant row {expr} doesn't have the declared type {row}",
                ));
            }
            Ok(Type::zset(row.clone()))
        }

        OperatorKind::DelayOutput { ty } => Ok(ty.clone()),

        OperatorKind::View { .. }
        | OperatorKind::Negate
        | OperatorKind::Integrate
        | OperatorKind::Differentiate
        | OperatorKind::DelayedIntegral
        | OperatorKind::Distinct
        | OperatorKind::StreamDistinct => Ok(collection(kind, inputs[0])?.clone()),

        // Sinks and noops also accept scalar streams
        OperatorKind::Sink { .. } | OperatorKind::Noop => Ok(inputs[0].clone()),

        OperatorKind::Delay { initial } => {
            if let Some(initial) = initial {
                if scalar(kind, inputs[0])? != initial.ty() {
                    return internal(format!(
                        "delay of {} has an initial value of type {}",
                        inputs[0],
                        initial.ty(),
                    ));
                }
            }
            Ok(inputs[0].clone())
        }

        OperatorKind::Sum | OperatorKind::Subtract => same_types(kind, inputs),

        OperatorKind::Map { function } => {
            let arg = closure_argument(kind, inputs[0])?;
            check_closure(kind, function, &[arg], None)?;
            Ok(Type::zset(function.result_type().clone()))
        }

        OperatorKind::MapIndex { function } => {
            let arg = closure_argument(kind, inputs[0])?;
            check_closure(kind, function, &[arg], None)?;
            key_value(kind, function)
        }

        OperatorKind::Filter { predicate } => {
            let arg = closure_argument(kind, inputs[0])?;
            check_predicate(kind, predicate, &[arg])?;
            Ok(inputs[0].clone())
        }

        OperatorKind::Deindex => {
            let (_, value) = indexed(kind, inputs[0])?;
            Ok(Type::zset(value.clone()))
        }

        OperatorKind::Join { function } | OperatorKind::StreamJoin { function } => {
            let (key, left, right) = join_inputs(kind, inputs)?;
            check_closure(
                kind,
                function,
                &[key.reference(), left.reference(), right.reference()],
                None,
            )?;
            Ok(Type::zset(function.result_type().clone()))
        }

        OperatorKind::JoinIndex { function } | OperatorKind::StreamJoinIndex { function } => {
            let (key, left, right) = join_inputs(kind, inputs)?;
            check_closure(
                kind,
                function,
                &[key.reference(), left.reference(), right.reference()],
                None,
            )?;
            key_value(kind, function)
        }

        OperatorKind::JoinFilterMap {
            function,
            filter,
            map,
        }
        | OperatorKind::StreamJoinFilterMap {
            function,
            filter,
            map,
        } => {
            let (key, left, right) = join_inputs(kind, inputs)?;
            check_closure(
                kind,
                function,
                &[key.reference(), left.reference(), right.reference()],
                None,
            )?;
            let joined = function.result_type().reference();
            check_predicate(kind, filter, &[joined.clone()])?;
            check_closure(kind, map, &[joined], None)?;
            Ok(Type::zset(map.result_type().clone()))
        }

        OperatorKind::AntiJoin | OperatorKind::StreamAntiJoin => {
            let (left_key, _) = indexed(kind, inputs[0])?;
            let (right_key, _) = indexed(kind, inputs[1])?;
            if left_key != right_key {
                return internal(format!(
                    "{} inputs have mismatched key types {left_key} and {right_key}",
                    kind.name(),
                ));
            }
            Ok(inputs[0].clone())
        }

        OperatorKind::Aggregate { aggregate } | OperatorKind::StreamAggregate { aggregate } => {
            let (key, value) = indexed(kind, inputs[0])?;
            check_aggregate(kind, aggregate, value)?;
            Ok(Type::indexed_zset(key.clone(), aggregate.result_type()))
        }

        OperatorKind::DeltaAggregate { aggregate } => {
            let ty = same_types(kind, inputs)?;
            let (key, value) = indexed(kind, &ty)?;
            check_aggregate(kind, aggregate, value)?;
            Ok(Type::indexed_zset(key.clone(), aggregate.result_type()))
        }

        OperatorKind::PartitionedRollingAggregate {
            order,
            preceding,
            aggregate,
        }
        | OperatorKind::StreamPartitionedRollingAggregate {
            order,
            preceding,
            aggregate,
        } => {
            if *preceding < 0 {
                return internal(format!("rolling aggregate has negative range {preceding}"));
            }
            let (partition, value) = indexed(kind, inputs[0])?;
            check_closure(kind, order, &[value.reference()], Some(&Type::i64()))?;
            check_aggregate(kind, aggregate, value)?;
            Ok(Type::indexed_zset(
                partition.clone(),
                Type::raw_tuple([Type::i64(), aggregate.result_type()]),
            ))
        }

        OperatorKind::Waterline { init, extract } => {
            let arg = closure_argument(kind, inputs[0])?;
            check_closure(kind, extract, &[arg], Some(init.ty()))?;
            Ok(scalar(kind, init.ty())?.clone())
        }

        OperatorKind::Apply { function } => {
            let input = scalar(kind, inputs[0])?;
            check_closure(kind, function, &[input.reference()], None)?;
            Ok(scalar(kind, function.result_type())?.clone())
        }

        OperatorKind::ControlledFilter { predicate } => {
            let arg = closure_argument(kind, inputs[0])?;
            let bound = scalar(kind, inputs[1])?;
            check_predicate(kind, predicate, &[arg, bound.reference()])?;
            Ok(inputs[0].clone())
        }

        OperatorKind::IntegrateTraceRetainKeys { predicate } => {
            let key = match inputs[0] {
                Type::IndexedZSet(key, _) | Type::ZSet(key) => key,
                ty => return internal(format!("{} expects a collection, got {ty}", kind.name())),
            };
            let bound = scalar(kind, inputs[1])?;
            check_predicate(kind, predicate, &[key.reference(), bound.reference()])?;
            Ok(Type::unit())
        }

        OperatorKind::Window => {
            let (key, _) = indexed(kind, inputs[0])?;
            let bounds = Type::raw_tuple([key.clone(), key.clone()]);
            if inputs[1] != &bounds {
                return internal(format!(
                    "window bounds have type {} instead of {bounds}",
                    inputs[1],
                ));
            }
            Ok(inputs[0].clone())
        }
    }
}
