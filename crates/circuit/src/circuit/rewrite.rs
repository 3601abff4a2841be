use crate::{
    circuit::{Circuit, Operator, OperatorKind},
    error::{internal_error, CompilerResult},
    ids::{OperatorId, OperatorIdGen},
};
use std::{collections::BTreeMap, sync::Arc};

/// Builds a new circuit from an existing one
///
/// Passes walk the source circuit in topological order and either keep,
/// rebuild or replace each operator. Kept operators whose inputs didn't
/// change are shared with the source circuit and retain their ids, every
/// other operator gets a fresh id that's unused by the source circuit
pub struct CircuitRewriter<'a> {
    source: &'a Circuit,
    output: Circuit,
    ids: OperatorIdGen,
    remap: BTreeMap<OperatorId, OperatorId>,
}

impl<'a> CircuitRewriter<'a> {
    pub fn new(source: &'a Circuit) -> Self {
        Self {
            source,
            output: Circuit::new(),
            ids: source.id_gen(),
            remap: BTreeMap::new(),
        }
    }

    pub const fn source(&self) -> &'a Circuit {
        self.source
    }

    pub const fn output(&self) -> &Circuit {
        &self.output
    }

    pub const fn ids(&self) -> &OperatorIdGen {
        &self.ids
    }

    /// The output operator a source operator was mapped to
    pub fn remapped(&self, id: OperatorId) -> CompilerResult<OperatorId> {
        match self.remap.get(&id) {
            Some(&id) => Ok(id),
            None => internal_error!("{id} was used before being rewritten"),
        }
    }

    /// The output operators the inputs of a source operator were mapped to
    pub fn remapped_inputs(&self, operator: &Operator) -> CompilerResult<Vec<OperatorId>> {
        operator
            .inputs()
            .iter()
            .map(|&input| self.remapped(input))
            .collect()
    }

    pub fn output_operator(&self, id: OperatorId) -> CompilerResult<&Arc<Operator>> {
        self.output.operator(id)
    }

    /// Records that `source` was rewritten into the output operator `output`
    pub fn replace(&mut self, source: OperatorId, output: OperatorId) {
        self.remap.insert(source, output);
    }

    /// Adds a new operator reading from output operators
    pub fn add(&mut self, kind: OperatorKind, inputs: &[OperatorId]) -> CompilerResult<OperatorId> {
        let operator = Operator::new(self.ids.next(), kind, &self.output.lookup(inputs)?)?;
        self.insert(operator)
    }

    /// Adds a new operator annotated as generated from `original`
    pub fn add_derived(
        &mut self,
        kind: OperatorKind,
        inputs: &[OperatorId],
        original: OperatorId,
    ) -> CompilerResult<OperatorId> {
        let operator = Operator::new(self.ids.next(), kind, &self.output.lookup(inputs)?)?
            .with_derived_from(original);
        self.insert(operator)
    }

    fn insert(&mut self, operator: Operator) -> CompilerResult<OperatorId> {
        let id = operator.id();
        self.output.insert(Arc::new(operator))?;
        Ok(id)
    }

    /// Copies a source operator reading from the remapped inputs, the source
    /// instance itself is reused when its inputs are unchanged
    pub fn keep(&mut self, operator: &Arc<Operator>) -> CompilerResult<OperatorId> {
        let inputs = self.remapped_inputs(operator)?;
        let kept = operator.with_inputs(&self.output.lookup(&inputs)?, &self.ids)?;
        self.finish_rebuild(operator.id(), kept)
    }

    /// Rebuilds a source operator with a new kind, reading from the remapped
    /// inputs
    pub fn rebuild(
        &mut self,
        operator: &Arc<Operator>,
        kind: OperatorKind,
    ) -> CompilerResult<OperatorId> {
        let inputs = self.remapped_inputs(operator)?;
        self.rebuild_with_inputs(operator, kind, &inputs)
    }

    /// Rebuilds a source operator with a new kind and explicit output inputs
    pub fn rebuild_with_inputs(
        &mut self,
        operator: &Arc<Operator>,
        kind: OperatorKind,
        inputs: &[OperatorId],
    ) -> CompilerResult<OperatorId> {
        let rebuilt = operator.rebuild(kind, &self.output.lookup(inputs)?, &self.ids)?;
        self.finish_rebuild(operator.id(), rebuilt)
    }

    fn finish_rebuild(
        &mut self,
        source: OperatorId,
        rebuilt: Arc<Operator>,
    ) -> CompilerResult<OperatorId> {
        let id = rebuilt.id();
        if !self.output.contains(id) {
            self.output.insert(rebuilt)?;
        }
        self.remap.insert(source, id);
        Ok(id)
    }

    /// Re-establishes the delay pairs of every pair whose both halves
    /// survived and validates the result
    pub fn finish(mut self) -> CompilerResult<Circuit> {
        for (output, delay) in self.source.delay_pairs() {
            if let (Some(&output), Some(&delay)) = (self.remap.get(&output), self.remap.get(&delay))
            {
                if self.output.delay_for(output).is_none() {
                    self.output.pair_delay(output, delay)?;
                }
            }
        }

        self.output.validate()?;
        Ok(self.output)
    }

    /// Finishes the rewrite along with the mapping from source to output
    /// operators
    pub fn finish_with_mapping(self) -> CompilerResult<(Circuit, BTreeMap<OperatorId, OperatorId>)> {
        let remap = self.remap.clone();
        Ok((self.finish()?, remap))
    }
}
