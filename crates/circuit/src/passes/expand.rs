//! Lowers operators with incremental semantics into stream primitives

use crate::{
    circuit::{Circuit, CircuitRewriter, Operator, OperatorKind},
    error::{internal_error, CompilerResult},
    ids::OperatorId,
};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::Arc};

/// The operators a single operator of the original circuit was lowered into
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Expansion {
    /// The operator was already a primitive
    Identity(OperatorId),
    /// `Δa ⋈ b' + a' ⋈ Δb + Δa ⋈ Δb` where `a'` and `b'` are the delayed
    /// integrals of each input
    Join {
        left_integral: OperatorId,
        right_integral: OperatorId,
        /// `Δa ⋈ b'`
        left_delta: OperatorId,
        /// `a' ⋈ Δb`
        right_delta: OperatorId,
        /// `Δa ⋈ Δb`
        both_deltas: OperatorId,
        sum: OperatorId,
    },
    Aggregate {
        integrator: OperatorId,
        aggregator: OperatorId,
    },
    /// The stream primitive applied to the integrals of every input and
    /// differentiated afterwards
    Integrated {
        integrals: Vec<OperatorId>,
        primitive: OperatorId,
        differentiate: OperatorId,
    },
}

impl Expansion {
    /// The operator producing the expanded operator's output
    pub const fn output(&self) -> OperatorId {
        match *self {
            Self::Identity(output) => output,
            Self::Join { sum, .. } => sum,
            Self::Aggregate { aggregator, .. } => aggregator,
            Self::Integrated { differentiate, .. } => differentiate,
        }
    }

    /// Every operator the expansion created
    pub fn operators(&self) -> Vec<OperatorId> {
        match self {
            &Self::Identity(output) => vec![output],
            &Self::Join {
                left_integral,
                right_integral,
                left_delta,
                right_delta,
                both_deltas,
                sum,
            } => vec![
                left_integral,
                right_integral,
                left_delta,
                right_delta,
                both_deltas,
                sum,
            ],
            &Self::Aggregate {
                integrator,
                aggregator,
            } => vec![integrator, aggregator],
            Self::Integrated {
                integrals,
                primitive,
                differentiate,
            } => {
                let mut operators = integrals.clone();
                operators.extend([*primitive, *differentiate]);
                operators
            }
        }
    }
}

/// Maps every operator of a circuit to the operators of its expansion
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpansionMap {
    expansions: BTreeMap<OperatorId, Expansion>,
}

impl ExpansionMap {
    pub const fn new() -> Self {
        Self {
            expansions: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.expansions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.expansions.is_empty()
    }

    pub fn get(&self, original: OperatorId) -> Option<&Expansion> {
        self.expansions.get(&original)
    }

    /// The operator of the expanded circuit producing the output of
    /// `original`
    pub fn output_of(&self, original: OperatorId) -> CompilerResult<OperatorId> {
        match self.expansions.get(&original) {
            Some(expansion) => Ok(expansion.output()),
            None => internal_error!("{original} has no recorded expansion"),
        }
    }

    /// Finds the expansion whose output is the given expanded operator
    pub fn producing(&self, expanded: OperatorId) -> Option<(OperatorId, &Expansion)> {
        self.expansions
            .iter()
            .find(|(_, expansion)| expansion.output() == expanded)
            .map(|(&original, expansion)| (original, expansion))
    }

    pub fn iter(&self) -> impl Iterator<Item = (OperatorId, &Expansion)> + '_ {
        self.expansions
            .iter()
            .map(|(&original, expansion)| (original, expansion))
    }

    fn insert(&mut self, original: OperatorId, expansion: Expansion) -> CompilerResult<()> {
        if self.expansions.insert(original, expansion).is_some() {
            internal_error!("{original} was expanded twice");
        }
        Ok(())
    }
}

/// Replaces every high-level operator with the stream primitives realizing
/// its incremental semantics
#[tracing::instrument(skip_all)]
pub fn expand(circuit: &Circuit) -> CompilerResult<(Circuit, ExpansionMap)> {
    let mut rewriter = CircuitRewriter::new(circuit);
    let mut expansions = ExpansionMap::new();

    for operator in circuit.operators() {
        let expansion = match operator.kind() {
            OperatorKind::Join { .. }
            | OperatorKind::JoinIndex { .. }
            | OperatorKind::JoinFilterMap { .. } => expand_join(&mut rewriter, operator)?,

            OperatorKind::Aggregate { aggregate } => {
                let [input] = remapped::<1>(&rewriter, operator)?;
                let integrator =
                    rewriter.add_derived(OperatorKind::DelayedIntegral, &[input], operator.id())?;
                let aggregator = rewriter.add_derived(
                    OperatorKind::DeltaAggregate {
                        aggregate: aggregate.clone(),
                    },
                    &[input, integrator],
                    operator.id(),
                )?;
                Expansion::Aggregate {
                    integrator,
                    aggregator,
                }
            }

            OperatorKind::AntiJoin
            | OperatorKind::Distinct
            | OperatorKind::PartitionedRollingAggregate { .. } => {
                expand_integrated(&mut rewriter, operator)?
            }

            OperatorKind::Source { .. }
            | OperatorKind::View { .. }
            | OperatorKind::Sink { .. }
            | OperatorKind::Constant { .. }
            | OperatorKind::DelayOutput { .. }
            | OperatorKind::Map { .. }
            | OperatorKind::MapIndex { .. }
            | OperatorKind::Filter { .. }
            | OperatorKind::Deindex
            | OperatorKind::Sum
            | OperatorKind::Subtract
            | OperatorKind::Negate
            | OperatorKind::Noop
            | OperatorKind::Integrate
            | OperatorKind::Differentiate
            | OperatorKind::DelayedIntegral
            | OperatorKind::Delay { .. }
            | OperatorKind::StreamJoin { .. }
            | OperatorKind::StreamJoinIndex { .. }
            | OperatorKind::StreamJoinFilterMap { .. }
            | OperatorKind::StreamAntiJoin
            | OperatorKind::StreamDistinct
            | OperatorKind::StreamAggregate { .. }
            | OperatorKind::DeltaAggregate { .. }
            | OperatorKind::StreamPartitionedRollingAggregate { .. }
            | OperatorKind::Waterline { .. }
            | OperatorKind::Apply { .. }
            | OperatorKind::ControlledFilter { .. }
            | OperatorKind::IntegrateTraceRetainKeys { .. }
            | OperatorKind::Window => {
                expansions.insert(operator.id(), Expansion::Identity(rewriter.keep(operator)?))?;
                continue;
            }
        };

        tracing::debug!(
            "expanded {} {} into {:?}",
            operator.kind().name(),
            operator.id(),
            expansion.operators(),
        );
        rewriter.replace(operator.id(), expansion.output());
        expansions.insert(operator.id(), expansion)?;
    }

    let circuit = rewriter.finish()?;
    circuit.check_primitive()?;
    Ok((circuit, expansions))
}

fn remapped<const N: usize>(
    rewriter: &CircuitRewriter<'_>,
    operator: &Operator,
) -> CompilerResult<[OperatorId; N]> {
    let inputs = rewriter.remapped_inputs(operator)?;
    match <[OperatorId; N]>::try_from(inputs) {
        Ok(inputs) => Ok(inputs),
        Err(inputs) => internal_error!(
            "{} {} has {} inputs instead of {N}",
            operator.kind().name(),
            operator.id(),
            inputs.len(),
        ),
    }
}

fn stream_primitive(operator: &Operator) -> CompilerResult<OperatorKind> {
    match operator.kind().stream_primitive() {
        Some(kind) => Ok(kind),
        None => internal_error!("{} has no stream primitive", operator.kind().name()),
    }
}

fn expand_join(
    rewriter: &mut CircuitRewriter<'_>,
    operator: &Arc<Operator>,
) -> CompilerResult<Expansion> {
    let [left, right] = remapped::<2>(rewriter, operator)?;
    let primitive = stream_primitive(operator)?;
    let original = operator.id();

    let left_integral = rewriter.add_derived(OperatorKind::DelayedIntegral, &[left], original)?;
    let right_integral = rewriter.add_derived(OperatorKind::DelayedIntegral, &[right], original)?;
    let left_delta = rewriter.add_derived(primitive.clone(), &[left, right_integral], original)?;
    let right_delta = rewriter.add_derived(primitive.clone(), &[left_integral, right], original)?;
    let both_deltas = rewriter.add_derived(primitive, &[left, right], original)?;
    let sum = rewriter.add_derived(
        OperatorKind::Sum,
        &[left_delta, right_delta, both_deltas],
        original,
    )?;

    Ok(Expansion::Join {
        left_integral,
        right_integral,
        left_delta,
        right_delta,
        both_deltas,
        sum,
    })
}

fn expand_integrated(
    rewriter: &mut CircuitRewriter<'_>,
    operator: &Arc<Operator>,
) -> CompilerResult<Expansion> {
    let inputs = rewriter.remapped_inputs(operator)?;
    let primitive = stream_primitive(operator)?;
    let original = operator.id();

    let integrals = inputs
        .iter()
        .map(|&input| rewriter.add_derived(OperatorKind::Integrate, &[input], original))
        .collect::<CompilerResult<Vec<_>>>()?;
    let primitive = rewriter.add_derived(primitive, &integrals, original)?;
    let differentiate =
        rewriter.add_derived(OperatorKind::Differentiate, &[primitive], original)?;

    Ok(Expansion::Integrated {
        integrals,
        primitive,
        differentiate,
    })
}
