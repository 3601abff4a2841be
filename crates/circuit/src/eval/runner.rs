use crate::{
    circuit::{Circuit, Operator, OperatorKind},
    eval::{call, evaluate_constant, EvalError, EvalResult, Value, ZSet},
    ids::OperatorId,
    ir::{Aggregate, AggregateKind, BinaryOp, Closure},
};
use std::{
    cmp::Ordering,
    collections::{BTreeMap, BTreeSet},
};

/// The value an operator produces at a single step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamValue {
    ZSet(ZSet),
    Scalar(Value),
    /// Produced by operators without a dataflow output
    Unit,
}

impl StreamValue {
    pub const fn as_zset(&self) -> Option<&ZSet> {
        match self {
            Self::ZSet(zset) => Some(zset),
            _ => None,
        }
    }

    pub const fn as_scalar(&self) -> Option<&Value> {
        match self {
            Self::Scalar(value) => Some(value),
            _ => None,
        }
    }
}

/// The state an operator carries between steps
#[derive(Debug, Clone)]
enum State {
    /// The running sum of the operator's input
    Integral(ZSet),
    /// The operator's input at the previous step
    Previous(ZSet),
    /// The running sums of each input along with the previous output of the
    /// function over them
    Accumulated { inputs: Vec<ZSet>, output: ZSet },
    Waterline(Value),
}

/// Steps a circuit over a sequence of input changes
///
/// Each step feeds one change per source and produces the change observed
/// by each sink. High-level operators are evaluated from their definition,
/// the change of their stream primitive applied to the integrals of their
/// inputs, so they serve as the reference for their expansions
pub struct CircuitRunner<'a> {
    circuit: &'a Circuit,
    step: usize,
    values: BTreeMap<OperatorId, StreamValue>,
    state: BTreeMap<OperatorId, State>,
    /// The last input of each delay
    delayed: BTreeMap<OperatorId, StreamValue>,
    consumers: BTreeMap<OperatorId, Vec<OperatorId>>,
}

impl<'a> CircuitRunner<'a> {
    pub fn new(circuit: &'a Circuit) -> Self {
        Self {
            circuit,
            step: 0,
            values: BTreeMap::new(),
            state: BTreeMap::new(),
            delayed: BTreeMap::new(),
            consumers: circuit.consumers(),
        }
    }

    /// The number of steps taken so far
    pub const fn steps(&self) -> usize {
        self.step
    }

    /// The value an operator produced during the last step
    pub fn value(&self, id: OperatorId) -> Option<&StreamValue> {
        self.values.get(&id)
    }

    /// The number of entries an operator keeps between steps
    pub fn trace_len(&self, id: OperatorId) -> usize {
        match self.state.get(&id) {
            Some(State::Integral(zset) | State::Previous(zset)) => zset.len(),
            Some(State::Accumulated { inputs, output }) => {
                inputs.iter().map(ZSet::len).sum::<usize>() + output.len()
            }
            Some(State::Waterline(_)) => 1,
            None => 0,
        }
    }

    /// Runs a single step, sources missing from `inputs` receive an empty
    /// change
    pub fn step(&mut self, inputs: &BTreeMap<String, ZSet>) -> EvalResult<BTreeMap<String, ZSet>> {
        self.values.clear();

        let mut outputs = BTreeMap::new();
        let mut delayed = Vec::new();
        let mut retain = Vec::new();

        let circuit = self.circuit;
        for operator in circuit.operators() {
            let value = self.evaluate(operator, inputs)?;

            match operator.kind() {
                OperatorKind::Sink { name } => {
                    let output = match &value {
                        StreamValue::ZSet(zset) => zset.clone(),
                        StreamValue::Scalar(scalar) => ZSet::from_iter([(scalar.clone(), 1)]),
                        StreamValue::Unit => ZSet::new(),
                    };
                    outputs.insert(name.clone(), output);
                }
                OperatorKind::Delay { .. } => {
                    delayed.push((operator.id(), self.input(operator, 0)?.clone()));
                }
                OperatorKind::IntegrateTraceRetainKeys { predicate } => {
                    let bound = self.scalar(operator, 1)?.clone();
                    retain.push((operator.input(0), predicate, bound));
                }
                _ => {}
            }

            self.values.insert(operator.id(), value);
        }

        // Delays and pruning only take effect once every operator has seen
        // this step's values
        self.delayed.extend(delayed);
        for (data, predicate, bound) in retain {
            self.retain_keys(data, predicate, &bound)?;
        }

        self.step += 1;
        Ok(outputs)
    }

    fn input(&self, operator: &Operator, idx: usize) -> EvalResult<&StreamValue> {
        let input = operator.input(idx);
        self.values.get(&input).ok_or_else(|| {
            EvalError::Malformed(format!("{} read {input} before it ran", operator.id()))
        })
    }

    fn zset(&self, operator: &Operator, idx: usize) -> EvalResult<&ZSet> {
        match self.input(operator, idx)? {
            StreamValue::ZSet(zset) => Ok(zset),
            other => Err(EvalError::Malformed(format!(
                "{} expected a collection from input {idx}, got {other:?}",
                operator.id(),
            ))),
        }
    }

    fn scalar(&self, operator: &Operator, idx: usize) -> EvalResult<&Value> {
        match self.input(operator, idx)? {
            StreamValue::Scalar(value) => Ok(value),
            other => Err(EvalError::Malformed(format!(
                "{} expected a scalar from input {idx}, got {other:?}",
                operator.id(),
            ))),
        }
    }

    fn integral(&mut self, id: OperatorId) -> EvalResult<&mut ZSet> {
        match self
            .state
            .entry(id)
            .or_insert_with(|| State::Integral(ZSet::new()))
        {
            State::Integral(integral) => Ok(integral),
            other => Err(EvalError::Malformed(format!(
                "{id} should hold an integral, holds {other:?}",
            ))),
        }
    }

    fn evaluate(
        &mut self,
        operator: &Operator,
        inputs: &BTreeMap<String, ZSet>,
    ) -> EvalResult<StreamValue> {
        let id = operator.id();
        let zset = match operator.kind() {
            OperatorKind::Source { name, .. } => inputs.get(name).cloned().unwrap_or_default(),

            OperatorKind::View { .. } | OperatorKind::Sink { .. } | OperatorKind::Noop => {
                return self.input(operator, 0).cloned();
            }

            OperatorKind::Constant { rows, .. } => {
                if self.step == 0 {
                    let mut zset = ZSet::new();
                    for (row, weight) in rows {
                        zset.insert(evaluate_constant(row)?, *weight);
                    }
                    zset
                } else {
                    ZSet::new()
                }
            }

            OperatorKind::DelayOutput { ty } => {
                let delay = self.circuit.delay_for(id).ok_or_else(|| {
                    EvalError::Malformed(format!("delay output {id} isn't paired"))
                })?;
                let initial = match self.circuit.get(delay).map(|delay| delay.kind()) {
                    Some(OperatorKind::Delay {
                        initial: Some(initial),
                    }) => Some(evaluate_constant(initial)?),
                    _ => None,
                };
                return Ok(self.delayed_value(delay, ty.is_collection(), initial));
            }

            OperatorKind::Delay { initial } => {
                let initial = initial.as_ref().map(evaluate_constant).transpose()?;
                let collection = operator.output_type().is_collection();
                return Ok(self.delayed_value(id, collection, initial));
            }

            OperatorKind::Map { function } | OperatorKind::MapIndex { function } => self
                .zset(operator, 0)?
                .try_map(|row| call(function, std::slice::from_ref(row)))?,

            OperatorKind::Filter { predicate } => self
                .zset(operator, 0)?
                .try_filter(|row| Ok(call(predicate, std::slice::from_ref(row))?.is_true()))?,

            OperatorKind::Deindex => self.zset(operator, 0)?.try_map(|entry| {
                entry
                    .as_pair()
                    .map(|(_, value)| value.clone())
                    .ok_or_else(|| EvalError::Malformed(format!("deindexed {entry}")))
            })?,

            OperatorKind::Sum => {
                let mut sum = ZSet::new();
                for idx in 0..operator.inputs().len() {
                    sum.add_assign(self.zset(operator, idx)?);
                }
                sum
            }
            OperatorKind::Subtract => self.zset(operator, 0)?.minus(self.zset(operator, 1)?),
            OperatorKind::Negate => self.zset(operator, 0)?.negate(),

            OperatorKind::Integrate => {
                let delta = self.zset(operator, 0)?.clone();
                let integral = self.integral(id)?;
                integral.add_assign(&delta);
                integral.clone()
            }

            OperatorKind::DelayedIntegral => {
                let delta = self.zset(operator, 0)?.clone();
                let integral = self.integral(id)?;
                let previous = integral.clone();
                integral.add_assign(&delta);
                previous
            }

            OperatorKind::Differentiate => {
                let current = self.zset(operator, 0)?.clone();
                let previous = match self.state.insert(id, State::Previous(current.clone())) {
                    Some(State::Previous(previous)) => previous,
                    _ => ZSet::new(),
                };
                current.minus(&previous)
            }

            OperatorKind::Join { .. }
            | OperatorKind::JoinIndex { .. }
            | OperatorKind::JoinFilterMap { .. }
            | OperatorKind::AntiJoin
            | OperatorKind::Distinct
            | OperatorKind::Aggregate { .. }
            | OperatorKind::PartitionedRollingAggregate { .. } => self.accumulated(operator)?,

            OperatorKind::StreamJoin { .. }
            | OperatorKind::StreamJoinIndex { .. }
            | OperatorKind::StreamJoinFilterMap { .. }
            | OperatorKind::StreamAntiJoin
            | OperatorKind::StreamDistinct
            | OperatorKind::StreamAggregate { .. }
            | OperatorKind::StreamPartitionedRollingAggregate { .. } => {
                let inputs = (0..operator.inputs().len())
                    .map(|idx| self.zset(operator, idx))
                    .collect::<EvalResult<Vec<_>>>()?;
                apply_primitive(operator.kind(), &inputs)?
            }

            OperatorKind::DeltaAggregate { aggregate } => {
                delta_aggregate(aggregate, self.zset(operator, 0)?, self.zset(operator, 1)?)?
            }

            OperatorKind::Waterline { init, extract } => {
                let previous = match self.state.get(&id) {
                    Some(State::Waterline(previous)) => previous.clone(),
                    _ => evaluate_constant(init)?,
                };

                let mut lowest: Option<Value> = None;
                for (row, weight) in self.zset(operator, 0)?.iter() {
                    if weight > 0 {
                        let value = call(extract, std::slice::from_ref(row))?;
                        lowest = Some(match lowest {
                            Some(lowest) => combine(&lowest, &value, Ordering::Less),
                            None => value,
                        });
                    }
                }

                let current = match lowest {
                    Some(lowest) => combine(&previous, &lowest, Ordering::Greater),
                    None => previous,
                };
                self.state.insert(id, State::Waterline(current.clone()));
                return Ok(StreamValue::Scalar(current));
            }

            OperatorKind::Apply { function } => {
                let bound = self.scalar(operator, 0)?;
                return Ok(StreamValue::Scalar(call(
                    function,
                    std::slice::from_ref(bound),
                )?));
            }

            OperatorKind::ControlledFilter { predicate } => {
                let bound = self.scalar(operator, 1)?.clone();
                self.zset(operator, 0)?.try_filter(|row| {
                    Ok(call(predicate, &[row.clone(), bound.clone()])?.is_true())
                })?
            }

            OperatorKind::IntegrateTraceRetainKeys { .. } => return Ok(StreamValue::Unit),

            OperatorKind::Window => {
                let delta = self.zset(operator, 0)?.clone();
                let bounds = self.scalar(operator, 1)?.clone();
                let (lower, upper) = bounds.as_pair().ok_or_else(|| {
                    EvalError::Malformed(format!("window bounds {bounds} aren't a pair"))
                })?;

                let (mut integral, previous) = match self.state.remove(&id) {
                    Some(State::Accumulated {
                        mut inputs,
                        output,
                    }) if inputs.len() == 1 => (inputs.remove(0), output),
                    _ => (ZSet::new(), ZSet::new()),
                };
                integral.add_assign(&delta);

                let mut window = integral.clone();
                window.retain(|entry| {
                    entry
                        .as_pair()
                        .map_or(false, |(key, _)| key >= lower && key < upper)
                });
                let output = window.minus(&previous);

                self.state.insert(
                    id,
                    State::Accumulated {
                        inputs: vec![integral],
                        output: window,
                    },
                );
                output
            }
        };

        Ok(StreamValue::ZSet(zset))
    }

    fn delayed_value(
        &self,
        delay: OperatorId,
        collection: bool,
        initial: Option<Value>,
    ) -> StreamValue {
        match self.delayed.get(&delay) {
            Some(value) => value.clone(),
            None if collection => StreamValue::ZSet(ZSet::new()),
            None => StreamValue::Scalar(initial.unwrap_or(Value::Null)),
        }
    }

    /// Evaluates an operator as the change of its stream primitive applied
    /// to the integrals of its inputs
    fn accumulated(&mut self, operator: &Operator) -> EvalResult<ZSet> {
        let id = operator.id();
        let kind = operator
            .kind()
            .stream_primitive()
            .ok_or_else(|| EvalError::Malformed(format!("{id} has no stream primitive")))?;

        let deltas = (0..operator.inputs().len())
            .map(|idx| self.zset(operator, idx).cloned())
            .collect::<EvalResult<Vec<_>>>()?;
        let (mut inputs, previous) = self.take_accumulated(id, deltas.len());
        for (integral, delta) in inputs.iter_mut().zip(&deltas) {
            integral.add_assign(delta);
        }

        let current = apply_primitive(&kind, &inputs.iter().collect::<Vec<_>>())?;
        let output = current.minus(&previous);
        self.state.insert(
            id,
            State::Accumulated {
                inputs,
                output: current,
            },
        );
        Ok(output)
    }

    fn take_accumulated(&mut self, id: OperatorId, arity: usize) -> (Vec<ZSet>, ZSet) {
        match self.state.remove(&id) {
            Some(State::Accumulated { inputs, output }) => (inputs, output),
            _ => (vec![ZSet::new(); arity], ZSet::new()),
        }
    }

    /// Drops the entries failing `predicate(key, bound)` from every integral
    /// maintained over `data` and from the results `data` itself keeps
    ///
    /// Operators whose integrals were pruned recompute their result, the
    /// dropped entries are forgotten rather than retracted
    fn retain_keys(&mut self, data: OperatorId, predicate: &Closure, bound: &Value) -> EvalResult<()> {
        let consumers: BTreeSet<OperatorId> = self
            .consumers
            .get(&data)
            .into_iter()
            .flatten()
            .copied()
            .collect();

        let mut keep = |entry: &Value| -> EvalResult<bool> {
            let key = entry.as_pair().map_or(entry, |(key, _)| key);
            Ok(call(predicate, &[key.clone(), bound.clone()])?.is_true())
        };

        for consumer in consumers {
            let Some(operator) = self.circuit.get(consumer) else {
                continue;
            };
            let Some(state) = self.state.get_mut(&consumer) else {
                continue;
            };

            match (operator.kind(), state) {
                (
                    OperatorKind::Integrate | OperatorKind::DelayedIntegral,
                    State::Integral(integral),
                ) => *integral = integral.try_filter(&mut keep)?,

                (kind, State::Accumulated { inputs, output }) if kind.is_high_level() => {
                    for (idx, integral) in inputs.iter_mut().enumerate() {
                        if operator.input(idx) == data {
                            *integral = integral.try_filter(&mut keep)?;
                        }
                    }
                    if let Some(primitive) = kind.stream_primitive() {
                        *output = apply_primitive(&primitive, &inputs.iter().collect::<Vec<_>>())?;
                    }
                }

                _ => {}
            }
        }

        let producer = self.circuit.get(data).map(|operator| operator.kind());
        if let (Some(OperatorKind::Aggregate { .. }), Some(State::Accumulated { output, .. })) =
            (producer, self.state.get_mut(&data))
        {
            *output = output.try_filter(&mut keep)?;
        }

        Ok(())
    }
}

/// Combines two bounds field by field, keeping the lesser or greater of
/// each. `NULL`s never replace a value
fn combine(lhs: &Value, rhs: &Value, keep: Ordering) -> Value {
    match (lhs, rhs) {
        (Value::Tuple(lhs), Value::Tuple(rhs)) if lhs.len() == rhs.len() => Value::Tuple(
            lhs.iter()
                .zip(rhs)
                .map(|(lhs, rhs)| combine(lhs, rhs, keep))
                .collect(),
        ),
        (Value::RawTuple(lhs), Value::RawTuple(rhs)) if lhs.len() == rhs.len() => Value::RawTuple(
            lhs.iter()
                .zip(rhs)
                .map(|(lhs, rhs)| combine(lhs, rhs, keep))
                .collect(),
        ),
        (Value::Null, value) | (value, Value::Null) => value.clone(),
        (lhs, rhs) if rhs.cmp(lhs) == keep => rhs.clone(),
        (lhs, _) => lhs.clone(),
    }
}

/// Applies a stream primitive to a single step's inputs
fn apply_primitive(kind: &OperatorKind, inputs: &[&ZSet]) -> EvalResult<ZSet> {
    match kind {
        OperatorKind::StreamJoin { function } | OperatorKind::StreamJoinIndex { function } => {
            join(inputs[0], inputs[1], |key, left, right| {
                call(function, &[key.clone(), left.clone(), right.clone()]).map(Some)
            })
        }

        OperatorKind::StreamJoinFilterMap {
            function,
            filter,
            map,
        } => join(inputs[0], inputs[1], |key, left, right| {
            let joined = call(function, &[key.clone(), left.clone(), right.clone()])?;
            if call(filter, std::slice::from_ref(&joined))?.is_true() {
                call(map, &[joined]).map(Some)
            } else {
                Ok(None)
            }
        }),

        OperatorKind::StreamAntiJoin => {
            let mut weights: BTreeMap<&Value, i64> = BTreeMap::new();
            for (entry, weight) in inputs[1].iter() {
                if let Some((key, _)) = entry.as_pair() {
                    *weights.entry(key).or_insert(0) += weight;
                }
            }

            let mut output = inputs[0].clone();
            output.retain(|entry| {
                entry
                    .as_pair()
                    .map_or(true, |(key, _)| weights.get(key).map_or(true, |&w| w <= 0))
            });
            Ok(output)
        }

        OperatorKind::StreamDistinct => Ok(inputs[0].distinct()),

        OperatorKind::StreamAggregate { aggregate } => {
            let mut output = ZSet::new();
            for (key, group) in inputs[0].groups() {
                output.insert(
                    Value::pair(key.clone(), aggregate_group(aggregate, &group)?),
                    1,
                );
            }
            Ok(output)
        }

        OperatorKind::StreamPartitionedRollingAggregate {
            order,
            preceding,
            aggregate,
        } => {
            let mut output = ZSet::new();
            for (partition, group) in inputs[0].groups() {
                let ordered = group
                    .iter()
                    .map(|&(value, weight)| {
                        match call(order, std::slice::from_ref(value))? {
                            Value::Int(position) => Ok((position, value, weight)),
                            other => Err(EvalError::Malformed(format!(
                                "rolling aggregate ordered by {other}",
                            ))),
                        }
                    })
                    .collect::<EvalResult<Vec<_>>>()?;

                let positions: BTreeSet<i64> =
                    ordered.iter().map(|&(position, ..)| position).collect();
                for position in positions {
                    let lower = position.saturating_sub(*preceding);
                    let window: Vec<(&Value, i64)> = ordered
                        .iter()
                        .filter(|&&(other, ..)| other >= lower && other <= position)
                        .map(|&(_, value, weight)| (value, weight))
                        .collect();
                    let result = Value::RawTuple(vec![
                        Value::Int(position),
                        aggregate_group(aggregate, &window)?,
                    ]);
                    output.insert(Value::pair(partition.clone(), result), 1);
                }
            }
            Ok(output)
        }

        kind => Err(EvalError::Malformed(format!(
            "{} isn't a stream primitive",
            kind.name(),
        ))),
    }
}

fn join<F>(left: &ZSet, right: &ZSet, mut function: F) -> EvalResult<ZSet>
where
    F: FnMut(&Value, &Value, &Value) -> EvalResult<Option<Value>>,
{
    let right = right.groups();
    let mut output = ZSet::new();
    for (key, left_group) in left.groups() {
        let Some(right_group) = right.get(key) else {
            continue;
        };
        for &(left_value, left_weight) in &left_group {
            for &(right_value, right_weight) in right_group {
                if let Some(row) = function(key, left_value, right_value)? {
                    output.insert(row, left_weight * right_weight);
                }
            }
        }
    }
    Ok(output)
}

/// The change of every aggregate `delta` touches, given the collection's
/// contents as of the previous step
fn delta_aggregate(aggregate: &Aggregate, delta: &ZSet, previous: &ZSet) -> EvalResult<ZSet> {
    let previous_groups = previous.groups();
    let mut output = ZSet::new();

    for (key, delta_group) in delta.groups() {
        let old: Vec<(&Value, i64)> = previous_groups.get(key).cloned().unwrap_or_default();
        let new: ZSet = old
            .iter()
            .chain(&delta_group)
            .map(|&(value, weight)| (value.clone(), weight))
            .collect();

        if !old.is_empty() {
            output.insert(
                Value::pair(key.clone(), aggregate_group(aggregate, &old)?),
                -1,
            );
        }
        if !new.is_empty() {
            let new: Vec<(&Value, i64)> = new.iter().collect();
            output.insert(
                Value::pair(key.clone(), aggregate_group(aggregate, &new)?),
                1,
            );
        }
    }

    Ok(output)
}

/// Computes every function of an aggregate over a weighted group
fn aggregate_group(aggregate: &Aggregate, group: &[(&Value, i64)]) -> EvalResult<Value> {
    let mut results = Vec::with_capacity(aggregate.functions().len());

    for function in aggregate.functions() {
        let mut arguments = Vec::with_capacity(group.len());
        for &(value, weight) in group {
            let argument = call(function.argument(), std::slice::from_ref(value))?;
            if !argument.is_null() {
                arguments.push((argument, weight));
            }
        }

        let result = match function.kind() {
            AggregateKind::Count => Value::Int(arguments.iter().map(|&(_, weight)| weight).sum()),

            AggregateKind::Sum => {
                let mut sum: Option<Value> = None;
                for (argument, weight) in arguments {
                    let term = scale(argument, weight)?;
                    sum = Some(match sum {
                        Some(sum) => add(sum, term)?,
                        None => term,
                    });
                }
                sum.unwrap_or(Value::Null)
            }

            AggregateKind::Min => arguments
                .into_iter()
                .filter(|&(_, weight)| weight > 0)
                .map(|(argument, _)| argument)
                .min()
                .unwrap_or(Value::Null),

            AggregateKind::Max => arguments
                .into_iter()
                .filter(|&(_, weight)| weight > 0)
                .map(|(argument, _)| argument)
                .max()
                .unwrap_or(Value::Null),
        };
        results.push(result);
    }

    Ok(Value::Tuple(results))
}

fn scale(value: Value, weight: i64) -> EvalResult<Value> {
    match value {
        Value::Int(value) => value
            .checked_mul(weight)
            .map(Value::Int)
            .ok_or(EvalError::Overflow { op: BinaryOp::Mul }),
        Value::Decimal(value) => value
            .checked_mul(weight.into())
            .map(Value::Decimal)
            .ok_or(EvalError::Overflow { op: BinaryOp::Mul }),
        other => Err(EvalError::Malformed(format!("summed {other}"))),
    }
}

fn add(lhs: Value, rhs: Value) -> EvalResult<Value> {
    match (lhs, rhs) {
        (Value::Int(lhs), Value::Int(rhs)) => lhs
            .checked_add(rhs)
            .map(Value::Int)
            .ok_or(EvalError::Overflow { op: BinaryOp::Add }),
        (Value::Decimal(lhs), Value::Decimal(rhs)) => lhs
            .checked_add(rhs)
            .map(Value::Decimal)
            .ok_or(EvalError::Overflow { op: BinaryOp::Add }),
        (lhs, rhs) => Err(EvalError::Malformed(format!("summed {lhs} and {rhs}"))),
    }
}
