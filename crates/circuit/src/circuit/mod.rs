//! The operator graph passes consume and produce

mod metadata;
mod operator;
mod rewrite;
mod visit;

#[cfg(test)]
mod tests;

pub use metadata::{lateness_columns, watermark_columns, ColumnMetadata};
pub use operator::{Annotations, Arity, Operator, OperatorKind};
pub use rewrite::CircuitRewriter;
pub use visit::{OperatorVisitor, VisitFlow};

use crate::{
    error::{internal_error, CompilerError, CompilerResult},
    ids::{OperatorId, OperatorIdGen},
};
use petgraph::{algo, graphmap::DiGraphMap};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::{self, Display},
    sync::Arc,
};

/// An acyclic graph of operators held in topological order
///
/// Feedback edges are represented by [`OperatorKind::DelayOutput`]
/// operators, which have no inputs and are paired with the
/// [`OperatorKind::Delay`] producing their values through a side table
/// instead of a graph edge
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Circuit {
    operators: BTreeMap<OperatorId, Arc<Operator>>,
    order: Vec<OperatorId>,
    /// Maps each delay output to its delay
    delays: BTreeMap<OperatorId, OperatorId>,
}

impl Circuit {
    pub const fn new() -> Self {
        Self {
            operators: BTreeMap::new(),
            order: Vec::new(),
            delays: BTreeMap::new(),
        }
    }

    /// Parses a circuit serialized by the frontend, rejecting circuits
    /// whose operators don't type check
    pub fn from_json(json: &str) -> CompilerResult<Self> {
        let circuit: Self = serde_json::from_str(json)
            .map_err(|error| CompilerError::internal(format!("malformed circuit: {error}")))?;
        circuit.validate()?;
        Ok(circuit)
    }

    pub fn to_json(&self) -> CompilerResult<String> {
        serde_json::to_string(self)
            .map_err(|error| CompilerError::internal(format!("failed to serialize circuit: {error}")))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, id: OperatorId) -> bool {
        self.operators.contains_key(&id)
    }

    /// The largest id used within the circuit
    pub fn max_id(&self) -> Option<OperatorId> {
        self.operators.keys().next_back().copied()
    }

    /// Creates an id generator producing ids unused by this circuit
    pub fn id_gen(&self) -> OperatorIdGen {
        self.max_id().map_or_else(OperatorIdGen::new, OperatorIdGen::after_id)
    }

    /// Iterates over the operators in topological order
    pub fn operators(&self) -> impl DoubleEndedIterator<Item = &Arc<Operator>> + '_ {
        self.order.iter().map(|id| &self.operators[id])
    }

    pub fn get(&self, id: OperatorId) -> Option<&Arc<Operator>> {
        self.operators.get(&id)
    }

    pub fn operator(&self, id: OperatorId) -> CompilerResult<&Arc<Operator>> {
        match self.operators.get(&id) {
            Some(operator) => Ok(operator),
            None => internal_error!("referenced {id} which isn't part of the circuit"),
        }
    }

    pub fn lookup(&self, ids: &[OperatorId]) -> CompilerResult<Vec<&Operator>> {
        ids.iter()
            .map(|&id| self.operator(id).map(|operator| &**operator))
            .collect()
    }

    pub fn inputs_of(&self, operator: &Operator) -> CompilerResult<Vec<&Operator>> {
        self.lookup(operator.inputs())
    }

    /// Creates an operator and appends it to the circuit
    pub fn add(&mut self, kind: OperatorKind, inputs: &[OperatorId]) -> CompilerResult<OperatorId> {
        let id = self.id_gen().next();
        let operator = Operator::new(id, kind, &self.lookup(inputs)?)?;
        self.insert(Arc::new(operator))?;
        Ok(id)
    }

    /// Appends an operator, its inputs must already be part of the circuit
    pub fn insert(&mut self, operator: Arc<Operator>) -> CompilerResult<()> {
        let id = operator.id();
        if self.operators.contains_key(&id) {
            internal_error!("{id} was added to the circuit twice");
        }
        if let Some(input) = operator.inputs().iter().find(|&&input| !self.contains(input)) {
            return Err(CompilerError::internal(format!(
                "{} reads from {input} which isn't part of the circuit",
                operator.kind().name(),
            ))
            .at(id));
        }

        self.order.push(id);
        self.operators.insert(id, operator);
        Ok(())
    }

    /// Feeds `input` into a new delay whose previous values `output`
    /// produces, returning the delay
    pub fn connect_delay(
        &mut self,
        output: OperatorId,
        input: OperatorId,
    ) -> CompilerResult<OperatorId> {
        let delay = self.add(OperatorKind::Delay { initial: None }, &[input])?;
        self.pair_delay(output, delay)?;
        Ok(delay)
    }

    /// Records that `output` produces the values of `delay`
    pub fn pair_delay(&mut self, output: OperatorId, delay: OperatorId) -> CompilerResult<()> {
        let delay_output = self.operator(output)?;
        let delay_op = self.operator(delay)?;
        if !delay_output.kind().is_delay_output() || !delay_op.kind().is_delay() {
            internal_error!("paired {output} with {delay} which aren't a delay output and a delay");
        }
        if delay_output.output_type() != delay_op.output_type() {
            internal_error!(
                "delay {delay} of type {} paired with delay output {output} of type {}",
                delay_op.output_type(),
                delay_output.output_type(),
            );
        }

        if let Some(previous) = self.delays.insert(output, delay) {
            internal_error!("{output} was already paired with {previous}");
        }
        Ok(())
    }

    /// Iterates over `(delay output, delay)` pairs
    pub fn delay_pairs(&self) -> impl Iterator<Item = (OperatorId, OperatorId)> + '_ {
        self.delays.iter().map(|(&output, &delay)| (output, delay))
    }

    pub fn delay_for(&self, output: OperatorId) -> Option<OperatorId> {
        self.delays.get(&output).copied()
    }

    pub fn delay_output_for(&self, delay: OperatorId) -> Option<OperatorId> {
        self.delays
            .iter()
            .find_map(|(&output, &paired)| (paired == delay).then_some(output))
    }

    /// Maps every operator to the operators reading from it, in order
    pub fn consumers(&self) -> BTreeMap<OperatorId, Vec<OperatorId>> {
        let mut consumers: BTreeMap<OperatorId, Vec<OperatorId>> =
            self.order.iter().map(|&id| (id, Vec::new())).collect();
        for operator in self.operators() {
            for &input in operator.inputs() {
                if let Some(consumers) = consumers.get_mut(&input) {
                    consumers.push(operator.id());
                }
            }
        }
        consumers
    }

    /// The number of times each operator's output is read
    pub fn fanouts(&self) -> BTreeMap<OperatorId, usize> {
        self.consumers()
            .into_iter()
            .map(|(id, consumers)| (id, consumers.len()))
            .collect()
    }

    pub fn sinks(&self) -> impl Iterator<Item = &Arc<Operator>> + '_ {
        self.operators()
            .filter(|operator| operator.kind().is_sink())
    }

    pub fn sources(&self) -> impl Iterator<Item = &Arc<Operator>> + '_ {
        self.operators()
            .filter(|operator| operator.kind().is_source())
    }

    /// Finds a sink by name
    pub fn sink(&self, name: &str) -> Option<&Arc<Operator>> {
        self.sinks().find(|operator| {
            matches!(operator.kind(), OperatorKind::Sink { name: sink } if sink == name)
        })
    }

    /// Finds a source by name
    pub fn source(&self, name: &str) -> Option<&Arc<Operator>> {
        self.sources().find(|operator| {
            matches!(operator.kind(), OperatorKind::Source { name: source, .. } if source == name)
        })
    }

    /// The graph formed by the circuit's dataflow edges, delay pairs aren't
    /// part of it
    pub fn graph(&self) -> DiGraphMap<OperatorId, ()> {
        let mut graph = DiGraphMap::with_capacity(self.len(), self.len());
        for operator in self.operators() {
            graph.add_node(operator.id());
            for &input in operator.inputs() {
                graph.add_edge(input, operator.id(), ());
            }
        }
        graph
    }

    /// Returns the operators which (transitively) feed into `roots`,
    /// including the roots themselves and the delays behind any reachable
    /// delay output
    pub fn reachable_from<I>(&self, roots: I) -> BTreeSet<OperatorId>
    where
        I: IntoIterator<Item = OperatorId>,
    {
        let mut reachable = BTreeSet::new();
        let mut stack: Vec<OperatorId> = roots.into_iter().collect();
        while let Some(id) = stack.pop() {
            if !reachable.insert(id) {
                continue;
            }
            if let Some(operator) = self.operators.get(&id) {
                stack.extend(operator.inputs().iter().copied());
            }
            if let Some(delay) = self.delay_for(id) {
                stack.push(delay);
            }
        }
        reachable
    }

    /// Checks the structural invariants of the circuit
    #[tracing::instrument(skip_all)]
    pub fn validate(&self) -> CompilerResult<()> {
        if self.order.len() != self.operators.len() {
            internal_error!(
                "circuit orders {} operators but holds {}",
                self.order.len(),
                self.operators.len(),
            );
        }

        let mut defined = BTreeSet::new();
        for &id in &self.order {
            let operator = self.operator(id)?;
            if operator.id() != id {
                internal_error!("{} is stored as {id}", operator.id());
            }

            for &input in operator.inputs() {
                if !defined.contains(&input) {
                    return Err(CompilerError::internal(format!(
                        "reads from {input} before it is defined",
                    ))
                    .at(id));
                }
            }

            // Re-derive the output type to catch operators whose inputs changed
            // underneath them
            let rebuilt = Operator::new(id, operator.kind().clone(), &self.inputs_of(operator)?)?;
            if rebuilt.output_type() != operator.output_type() {
                return Err(CompilerError::internal(format!(
                    "output type {} doesn't match its inputs, expected {}",
                    operator.output_type(),
                    rebuilt.output_type(),
                ))
                .at(id));
            }

            defined.insert(id);
        }

        if algo::is_cyclic_directed(&self.graph()) {
            internal_error!("circuit contains a cycle");
        }

        let mut paired_delays = BTreeSet::new();
        for operator in self.operators() {
            if operator.kind().is_delay_output() && !self.delays.contains_key(&operator.id()) {
                return Err(
                    CompilerError::internal("delay output isn't paired with a delay")
                        .at(operator.id()),
                );
            }
        }
        for (&output, &delay) in &self.delays {
            let delay_output = self.operator(output)?;
            let delay_op = self.operator(delay)?;
            if !delay_output.kind().is_delay_output() || !delay_op.kind().is_delay() {
                internal_error!("{output} and {delay} are paired but aren't a delay output and a delay");
            }
            if !paired_delays.insert(delay) {
                return Err(
                    CompilerError::internal("delay is paired with multiple delay outputs")
                        .at(delay),
                );
            }
            if delay_output.output_type() != delay_op.output_type() {
                return Err(CompilerError::internal(format!(
                    "paired delay output {output} has type {}, not {}",
                    delay_output.output_type(),
                    delay_op.output_type(),
                ))
                .at(delay));
            }
        }

        Ok(())
    }

    /// Returns an error naming the first operator which isn't a primitive
    /// the runtime understands
    pub fn check_primitive(&self) -> CompilerResult<()> {
        match self.operators().find(|operator| operator.kind().is_high_level()) {
            Some(operator) => Err(CompilerError::internal(format!(
                "{} wasn't expanded into stream primitives",
                operator.kind().name(),
            ))
            .at(operator.id())),
            None => Ok(()),
        }
    }
}

impl Display for Circuit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for operator in self.operators() {
            writeln!(f, "{operator}")?;
        }
        for (output, delay) in self.delay_pairs() {
            writeln!(f, "{output} <- {delay}")?;
        }
        Ok(())
    }
}
