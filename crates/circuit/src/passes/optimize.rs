//! Local rewrites applied to the expanded circuit
//!
//! Each sweep fuses adjacent operators, merges operators computing the same
//! thing and drops everything no sink or trace limiter depends on. Sweeps
//! repeat until the circuit stops changing or the configured budget runs
//! out.

use crate::{
    circuit::{Circuit, CircuitRewriter, Operator, OperatorKind},
    config::CompilerConfig,
    error::{internal_error, CompilerResult, ErrorReporter},
    ids::OperatorId,
    ir::{expr::fresh_name, BinaryOp, Closure, Expr, ExprKind, Type},
    passes::{
        simplify::Simplifier,
        unused_fields::{analyze_closure, narrow_closure, projection, FieldUseMap},
    },
};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

/// Applies the local rewrite rules until a fixed point is reached
#[tracing::instrument(skip_all)]
pub fn optimize<R>(
    circuit: &Circuit,
    config: &CompilerConfig,
    reporter: &mut R,
) -> CompilerResult<Circuit>
where
    R: ErrorReporter + ?Sized,
{
    let mut circuit = circuit.clone();

    for sweep in 0..config.optimizer_pass_budget {
        let (fused, fusions) = fuse_operators(&circuit, config, &mut *reporter)?;
        let (merged, merges) = merge_common_operators(&fused)?;
        let (pruned, removals) = remove_dead_operators(&merged)?;
        circuit = pruned;

        tracing::debug!(
            "sweep {sweep}: {fusions} fusions, {merges} merges, {removals} removals",
        );
        if fusions + merges + removals == 0 {
            break;
        }
    }

    Ok(circuit)
}

fn fuse_operators<R>(
    circuit: &Circuit,
    config: &CompilerConfig,
    reporter: &mut R,
) -> CompilerResult<(Circuit, usize)>
where
    R: ErrorReporter + ?Sized,
{
    let mut fusion = Fusion {
        rewriter: CircuitRewriter::new(circuit),
        config,
        reporter,
        fanouts: circuit.fanouts(),
        shared: BTreeSet::new(),
    };

    let mut fusions = 0;
    for operator in circuit.operators() {
        if fusion
            .fuse(operator)
            .map_err(|error| error.at(operator.id()))?
        {
            fusions += 1;
        } else {
            fusion.rewriter.keep(operator)?;
        }
    }

    Ok((fusion.rewriter.finish()?, fusions))
}

struct Fusion<'a, R: ?Sized> {
    rewriter: CircuitRewriter<'a>,
    config: &'a CompilerConfig,
    reporter: &'a mut R,
    /// The fanout of every operator in the source circuit
    fanouts: BTreeMap<OperatorId, usize>,
    /// Output operators that more than one source operator was mapped to
    shared: BTreeSet<OperatorId>,
}

impl<R> Fusion<'_, R>
where
    R: ErrorReporter + ?Sized,
{
    /// Rewrites `operator` together with its inputs, returns false if no
    /// rule applies
    fn fuse(&mut self, operator: &Arc<Operator>) -> CompilerResult<bool> {
        match operator.kind() {
            OperatorKind::Map { function } | OperatorKind::MapIndex { function } => {
                self.fuse_map(operator, function)
            }
            OperatorKind::Filter { predicate } => self.fuse_filter(operator, predicate),
            OperatorKind::Apply { function } => self.fuse_apply(operator, function),
            OperatorKind::Deindex => self.skip_index(operator),
            _ => Ok(false),
        }
    }

    /// The output operator behind `operator`'s `idx`th input when
    /// `operator` is its only reader
    fn exclusive_input(
        &self,
        operator: &Operator,
        idx: usize,
    ) -> CompilerResult<Option<Arc<Operator>>> {
        let Some(&input) = operator.inputs().get(idx) else {
            return Ok(None);
        };
        // Delays closing a loop have to stay paired with their output
        if self.fanouts.get(&input) != Some(&1)
            || self.rewriter.source().delay_output_for(input).is_some()
        {
            return Ok(None);
        }

        let remapped = self.rewriter.remapped(input)?;
        if self.shared.contains(&remapped) {
            return Ok(None);
        }
        Ok(Some(Arc::clone(self.rewriter.output_operator(remapped)?)))
    }

    fn input(&self, operator: &Operator, idx: usize) -> CompilerResult<Arc<Operator>> {
        let input = self.rewriter.remapped(operator.input(idx))?;
        Ok(Arc::clone(self.rewriter.output_operator(input)?))
    }

    fn fuses_into_joins(&self, function: &Closure) -> bool {
        !self.config.only_projections || function.is_projection()
    }

    /// Replaces `operator` by an operator of `kind` reading from the given
    /// output operators
    fn rebuild(
        &mut self,
        operator: &Arc<Operator>,
        kind: OperatorKind,
        inputs: &[OperatorId],
    ) -> CompilerResult<bool> {
        let kind = if self.config.simplify {
            let mut simplifier =
                Simplifier::new(&mut *self.reporter).with_operator(operator.id());
            kind.try_map_closures(|closure| Ok(simplifier.simplify_closure(closure)))?
        } else {
            kind
        };

        let id = self.rewriter.rebuild_with_inputs(operator, kind, inputs)?;
        tracing::debug!("fused {} into {id}", operator.id());
        Ok(true)
    }

    /// Points every reader of `operator` to the output operator `target`
    fn forward(&mut self, operator: &Operator, target: OperatorId) -> bool {
        tracing::debug!("forwarded {} to {target}", operator.id());
        self.rewriter.replace(operator.id(), target);
        self.shared.insert(target);
        true
    }

    fn fuse_map(&mut self, operator: &Arc<Operator>, function: &Closure) -> CompilerResult<bool> {
        let indexed = operator.kind().is_map_index();
        if indexed && self.skip_reindex(operator, function)? {
            return Ok(true);
        }

        let Some(input) = self.exclusive_input(operator, 0)? else {
            return Ok(false);
        };
        let map = |function| {
            if indexed {
                OperatorKind::MapIndex { function }
            } else {
                OperatorKind::Map { function }
            }
        };

        let kind = match input.kind() {
            OperatorKind::Map { function: inner } | OperatorKind::MapIndex { function: inner } => {
                map(compose(function, inner)?)
            }

            OperatorKind::Join { function: inner } | OperatorKind::JoinIndex { function: inner }
                if self.fuses_into_joins(function) =>
            {
                let function = compose(function, inner)?;
                if indexed {
                    OperatorKind::JoinIndex { function }
                } else {
                    OperatorKind::Join { function }
                }
            }
            OperatorKind::StreamJoin { function: inner }
            | OperatorKind::StreamJoinIndex { function: inner }
                if self.fuses_into_joins(function) =>
            {
                let function = compose(function, inner)?;
                if indexed {
                    OperatorKind::StreamJoinIndex { function }
                } else {
                    OperatorKind::StreamJoin { function }
                }
            }

            OperatorKind::JoinFilterMap {
                function: join,
                filter,
                map: inner,
            } if !indexed && self.fuses_into_joins(function) => OperatorKind::JoinFilterMap {
                function: join.clone(),
                filter: filter.clone(),
                map: compose(function, inner)?,
            },
            OperatorKind::StreamJoinFilterMap {
                function: join,
                filter,
                map: inner,
            } if !indexed && self.fuses_into_joins(function) => OperatorKind::StreamJoinFilterMap {
                function: join.clone(),
                filter: filter.clone(),
                map: compose(function, inner)?,
            },

            OperatorKind::AntiJoin | OperatorKind::StreamAntiJoin => {
                return self.narrow_antijoin(operator, function, &input);
            }

            kind if kind.commutes_with_maps() && !function.may_fault() => {
                return self.commute(operator, &input);
            }

            _ => return Ok(false),
        };

        self.rebuild(operator, kind, input.inputs())
    }

    /// Moves a map in front of the linear operator it reads from
    fn commute(&mut self, operator: &Arc<Operator>, linear: &Operator) -> CompilerResult<bool> {
        let mut mapped = Vec::with_capacity(linear.inputs().len());
        for &input in linear.inputs() {
            mapped.push(
                self.rewriter
                    .add_derived(operator.kind().clone(), &[input], operator.id())?,
            );
        }

        let id = self
            .rewriter
            .rebuild_with_inputs(operator, linear.kind().clone(), &mapped)?;
        tracing::debug!("moved {} in front of {id}", operator.id());
        Ok(true)
    }

    /// Projects away the values of an antijoin's left input which the map
    /// reading the antijoin never looks at
    fn narrow_antijoin(
        &mut self,
        operator: &Arc<Operator>,
        function: &Closure,
        antijoin: &Operator,
    ) -> CompilerResult<bool> {
        let depth = self.config.unused_field_depth;
        let (Some(key), Some(value)) = (
            antijoin.output_type().key_type(),
            antijoin.output_type().value_type(),
        ) else {
            internal_error!("antijoin {} produces {}", antijoin.id(), antijoin.output_type());
        };
        if depth == 0 {
            return Ok(false);
        }

        let mut usage = analyze_closure(function)?;
        let Some(FieldUseMap::Tuple(mut fields)) = usage.pop() else {
            return Ok(false);
        };
        let [key_usage, value_usage] = fields.as_mut_slice() else {
            return Ok(false);
        };
        key_usage.mark_all();
        let value_usage = value_usage.clone();
        if value_usage.narrow_type(&value.reference(), depth) == value.reference() {
            return Ok(false);
        }

        let project = projection(key, value, &value_usage, depth);
        let left = self.rewriter.add_derived(
            OperatorKind::MapIndex { function: project },
            &[antijoin.input(0)],
            operator.id(),
        )?;
        let narrowed = self.rewriter.add_derived(
            antijoin.kind().clone(),
            &[left, antijoin.input(1)],
            operator.id(),
        )?;

        let function = narrow_closure(function, 0, &FieldUseMap::Tuple(fields), depth + 1)?;
        let kind = match operator.kind() {
            OperatorKind::MapIndex { .. } => OperatorKind::MapIndex { function },
            _ => OperatorKind::Map { function },
        };
        self.rebuild(operator, kind, &[narrowed])
    }

    /// `MapIndex f (Deindex (MapIndex f x))` recomputes the inner index
    fn skip_reindex(&mut self, operator: &Operator, function: &Closure) -> CompilerResult<bool> {
        let deindex = self.input(operator, 0)?;
        if !deindex.kind().is_deindex() {
            return Ok(false);
        }

        let indexed = Arc::clone(self.rewriter.output_operator(deindex.input(0))?);
        match indexed.kind() {
            OperatorKind::MapIndex { function: inner }
                if forwards_rows(inner) && inner.equivalent(function) =>
            {
                Ok(self.forward(operator, indexed.id()))
            }
            _ => Ok(false),
        }
    }

    /// Dropping the keys of an index that keeps whole rows gives back the
    /// indexed rows
    fn skip_index(&mut self, operator: &Operator) -> CompilerResult<bool> {
        let indexed = self.input(operator, 0)?;
        match indexed.kind() {
            OperatorKind::MapIndex { function } if forwards_rows(function) => {
                Ok(self.forward(operator, indexed.input(0)))
            }
            _ => Ok(false),
        }
    }

    fn fuse_filter(
        &mut self,
        operator: &Arc<Operator>,
        predicate: &Closure,
    ) -> CompilerResult<bool> {
        let Some(input) = self.exclusive_input(operator, 0)? else {
            return Ok(false);
        };

        let kind = match input.kind() {
            OperatorKind::Filter { predicate: first } => OperatorKind::Filter {
                predicate: conjunction(first, predicate)?,
            },
            OperatorKind::Join { function } => OperatorKind::JoinFilterMap {
                function: function.clone(),
                filter: predicate.clone(),
                map: Closure::identity(function.result_type()),
            },
            OperatorKind::StreamJoin { function } => OperatorKind::StreamJoinFilterMap {
                function: function.clone(),
                filter: predicate.clone(),
                map: Closure::identity(function.result_type()),
            },
            _ => return Ok(false),
        };

        self.rebuild(operator, kind, input.inputs())
    }

    fn fuse_apply(&mut self, operator: &Arc<Operator>, function: &Closure) -> CompilerResult<bool> {
        let Some(input) = self.exclusive_input(operator, 0)? else {
            return Ok(false);
        };
        let OperatorKind::Apply { function: inner } = input.kind() else {
            return Ok(false);
        };

        let function = function.apply_after(inner)?;
        self.rebuild(operator, OperatorKind::Apply { function }, input.inputs())
    }
}

/// Composes `outer` after `inner`, the composition takes `inner`'s
/// parameters
///
/// Closures over indexed collections take their key and value by reference
/// while indexing closures produce them by value, each half is borrowed
/// separately
fn compose(outer: &Closure, inner: &Closure) -> CompilerResult<Closure> {
    let [param] = outer.params() else {
        internal_error!("composed {outer} which isn't unary");
    };

    let result = inner.body();
    let body = match (param.ty(), result.ty()) {
        (Type::RawTuple(refs), Type::RawTuple(values))
            if refs.len() == values.len() && refs.iter().all(Type::is_ref) =>
        {
            match result.kind() {
                ExprKind::RawTuple(fields) => {
                    outer.inline(&[Expr::raw_tuple(fields.iter().map(Expr::borrow).collect())])?
                }
                _ => {
                    let mut taken = outer.body().names();
                    taken.extend(result.names());
                    taken.extend(inner.params().iter().map(|param| param.name().to_owned()));
                    let name = fresh_name("kv", &taken);

                    let pair = Expr::var(name.clone(), result.ty().clone());
                    let halves = (0..values.len()).map(|idx| pair.field(idx).borrow()).collect();
                    Expr::let_in(name, result, &outer.inline(&[Expr::raw_tuple(halves)])?)
                }
            }
        }
        _ => return outer.apply_after(inner),
    };

    Ok(Closure::new(inner.params().to_vec(), body))
}

/// A predicate holding when both `first` and `second` hold, `second` is
/// only evaluated for values passing `first` when it can fail
fn conjunction(first: &Closure, second: &Closure) -> CompilerResult<Closure> {
    let [param] = first.params() else {
        internal_error!("filter predicate {first} isn't unary");
    };

    let second_body = second.inline(&[param.var()])?;
    let body = if second_body.may_fault() {
        Expr::if_then_else(first.body(), &second_body, &Expr::bool(false))
    } else {
        Expr::binary(BinaryOp::And, first.body(), &second_body)
    };
    Ok(Closure::new(first.params().to_vec(), body))
}

/// Returns true for indexing closures whose value is the whole row and
/// whose key can't fail
fn forwards_rows(function: &Closure) -> bool {
    let [param] = function.params() else {
        return false;
    };
    let ExprKind::RawTuple(fields) = function.body().kind() else {
        return false;
    };
    let [key, value] = fields.as_slice() else {
        return false;
    };

    let value = match value.kind() {
        ExprKind::Clone(inner) => inner,
        _ => value,
    };
    let whole_row =
        matches!(value.kind(), ExprKind::Deref(row) if row.as_var() == Some(param.name()));
    whole_row && !key.may_fault()
}

/// Merges operators computing the same function of the same inputs
fn merge_common_operators(circuit: &Circuit) -> CompilerResult<(Circuit, usize)> {
    // Limiters prune the integrals of everything reading their input, the
    // inputs mustn't gain readers
    let pruned: BTreeSet<OperatorId> = circuit
        .operators()
        .filter(|operator| operator.kind().is_integrate_trace_retain_keys())
        .map(|operator| operator.input(0))
        .collect();

    let mut rewriter = CircuitRewriter::new(circuit);
    let mut pruned_outputs = BTreeSet::new();
    let mut merges = 0;

    for operator in circuit.operators() {
        if is_mergeable(operator.kind()) && !pruned.contains(&operator.id()) {
            let inputs = rewriter.remapped_inputs(operator)?;
            let existing = rewriter
                .output()
                .operators()
                .find(|candidate| {
                    candidate.inputs() == inputs.as_slice()
                        && !pruned_outputs.contains(&candidate.id())
                        && candidate.kind().equivalent(operator.kind())
                })
                .map(|candidate| candidate.id());

            if let Some(existing) = existing {
                tracing::debug!("merged {} into {existing}", operator.id());
                rewriter.replace(operator.id(), existing);
                merges += 1;
                continue;
            }
        }

        let id = rewriter.keep(operator)?;
        if pruned.contains(&operator.id()) {
            pruned_outputs.insert(id);
        }
    }

    Ok((rewriter.finish()?, merges))
}

const fn is_mergeable(kind: &OperatorKind) -> bool {
    !matches!(
        kind,
        OperatorKind::Sink { .. }
            | OperatorKind::Delay { .. }
            | OperatorKind::DelayOutput { .. }
            | OperatorKind::IntegrateTraceRetainKeys { .. },
    )
}

/// Drops every operator that neither a sink nor a trace limiter depends on
fn remove_dead_operators(circuit: &Circuit) -> CompilerResult<(Circuit, usize)> {
    let roots = circuit
        .operators()
        .filter(|operator| {
            operator.kind().is_sink() || operator.kind().is_integrate_trace_retain_keys()
        })
        .map(|operator| operator.id());
    let live = circuit.reachable_from(roots);
    if live.len() == circuit.len() {
        return Ok((circuit.clone(), 0));
    }

    let mut rewriter = CircuitRewriter::new(circuit);
    for operator in circuit.operators() {
        if live.contains(&operator.id()) {
            rewriter.keep(operator)?;
        } else {
            tracing::trace!("removed dead operator {}", operator.id());
        }
    }

    Ok((rewriter.finish()?, circuit.len() - live.len()))
}

#[cfg(test)]
mod tests {
    use super::optimize;
    use crate::{
        circuit::{Circuit, OperatorKind},
        config::CompilerConfig,
        error::Diagnostics,
        eval::{CircuitRunner, Value, ZSet},
        ir::{BinaryOp, Closure, Expr, Type},
        passes::expand::expand,
        OperatorId,
    };
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    fn row() -> Type {
        Type::tuple([Type::i64(), Type::i64()])
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

    fn indexed_source(circuit: &mut Circuit, name: &str) -> OperatorId {
        let source = source(circuit, name, row());
        circuit
            .add(
                OperatorKind::MapIndex {
                    function: Closure::unary("t", row().reference(), |t| {
                        Expr::raw_tuple(vec![t.deref().field(0), t.deref().field(1)])
                    }),
                },
                &[source],
            )
            .unwrap()
    }

    fn sink(circuit: &mut Circuit, input: OperatorId) -> OperatorId {
        circuit
            .add(
                OperatorKind::Sink {
                    name: "out".to_owned(),
                },
                &[input],
            )
            .unwrap()
    }

    fn optimized(circuit: &Circuit) -> Circuit {
        let optimized = optimize(circuit, &CompilerConfig::new(), &mut Diagnostics::new()).unwrap();
        optimized.validate().unwrap();
        optimized
    }

    fn rows(rows: &[(i64, i64, i64)]) -> ZSet {
        rows.iter()
            .map(|&(x, y, weight)| (Value::tuple([Value::Int(x), Value::Int(y)]), weight))
            .collect()
    }

    fn assert_same_changes(original: &Circuit, optimized: &Circuit, steps: &[&[(&str, ZSet)]]) {
        let mut original = CircuitRunner::new(original);
        let mut optimized = CircuitRunner::new(optimized);
        for step in steps {
            let inputs: BTreeMap<String, ZSet> = step
                .iter()
                .map(|(name, rows)| ((*name).to_owned(), rows.clone()))
                .collect();
            assert_eq!(original.step(&inputs).unwrap(), optimized.step(&inputs).unwrap());
        }
    }

    fn count(circuit: &Circuit, predicate: impl Fn(&OperatorKind) -> bool) -> usize {
        circuit
            .operators()
            .filter(|operator| predicate(operator.kind()))
            .count()
    }

    #[test]
    fn chained_maps_fuse() {
        let mut circuit = Circuit::new();
        let input = source(&mut circuit, "a", row());
        let first = circuit
            .add(
                OperatorKind::Map {
                    function: Closure::unary("t", row().reference(), |t| {
                        Expr::tuple(vec![
                            Expr::binary(BinaryOp::Add, &t.deref().field(0), &Expr::i64(1)),
                            t.deref().field(1),
                        ])
                    }),
                },
                &[input],
            )
            .unwrap();
        let second = circuit
            .add(
                OperatorKind::Map {
                    function: Closure::unary("t", row().reference(), |t| {
                        Expr::tuple(vec![t.deref().field(1), t.deref().field(0)])
                    }),
                },
                &[first],
            )
            .unwrap();
        sink(&mut circuit, second);

        let optimized = optimized(&circuit);
        assert_eq!(count(&optimized, OperatorKind::is_map), 1);
        assert_eq!(optimized.len(), 3);
        assert_same_changes(
            &circuit,
            &optimized,
            &[
                &[("a", rows(&[(1, 2, 1), (5, 5, 2)]))],
                &[("a", rows(&[(1, 2, -1)]))],
            ],
        );
    }

    #[test]
    fn maps_fuse_into_expanded_joins() {
        let mut circuit = Circuit::new();
        let left = indexed_source(&mut circuit, "a");
        let right = indexed_source(&mut circuit, "b");
        let joined = Type::tuple([Type::i64(), Type::i64(), Type::i64()]);
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
        let map = circuit
            .add(
                OperatorKind::Map {
                    function: Closure::unary("t", joined.reference(), |t| {
                        Expr::tuple(vec![t.deref().field(0), t.deref().field(2)])
                    }),
                },
                &[join],
            )
            .unwrap();
        sink(&mut circuit, map);

        let (expanded, _) = expand(&circuit).unwrap();
        let optimized = optimized(&expanded);
        assert_eq!(count(&optimized, OperatorKind::is_map), 0);
        assert_eq!(count(&optimized, OperatorKind::is_stream_join), 3);
        optimized.check_primitive().unwrap();

        assert_same_changes(
            &circuit,
            &optimized,
            &[
                &[("a", rows(&[(1, 10, 1), (2, 20, 1)])), ("b", rows(&[(1, 100, 1)]))],
                &[("a", rows(&[])), ("b", rows(&[(2, 200, 1), (1, 101, 1)]))],
                &[("a", rows(&[(1, 10, -1)])), ("b", rows(&[]))],
            ],
        );
    }

    #[test]
    fn faulting_maps_stay_behind_linear_operators() {
        let mut circuit = Circuit::new();
        let input = source(&mut circuit, "a", row());
        let negated = circuit.add(OperatorKind::Negate, &[input]).unwrap();
        let map = circuit
            .add(
                OperatorKind::Map {
                    function: Closure::unary("t", row().reference(), |t| {
                        Expr::binary(BinaryOp::Div, &Expr::i64(10), &t.deref().field(0))
                    }),
                },
                &[negated],
            )
            .unwrap();
        sink(&mut circuit, map);

        let optimized = optimized(&circuit);
        assert_eq!(optimized.operator(map).unwrap().inputs(), &[negated]);
    }

    #[test]
    fn filters_fuse_without_evaluating_faulting_predicates_early() {
        let mut circuit = Circuit::new();
        let input = source(&mut circuit, "a", row());
        let nonzero = circuit
            .add(
                OperatorKind::Filter {
                    predicate: Closure::unary("t", row().reference(), |t| {
                        Expr::binary(BinaryOp::Neq, &t.deref().field(1), &Expr::i64(0))
                    }),
                },
                &[input],
            )
            .unwrap();
        let quotient = circuit
            .add(
                OperatorKind::Filter {
                    predicate: Closure::unary("t", row().reference(), |t| {
                        Expr::binary(
                            BinaryOp::Gt,
                            &Expr::binary(BinaryOp::Div, &Expr::i64(10), &t.deref().field(1)),
                            &Expr::i64(2),
                        )
                    }),
                },
                &[nonzero],
            )
            .unwrap();
        sink(&mut circuit, quotient);

        let optimized = optimized(&circuit);
        assert_eq!(count(&optimized, OperatorKind::is_filter), 1);
        assert_same_changes(
            &circuit,
            &optimized,
            &[&[("a", rows(&[(5, 0, 1), (1, 2, 1), (3, 4, 1)]))]],
        );
    }

    #[test]
    fn filters_after_joins_become_join_filter_maps() {
        let mut circuit = Circuit::new();
        let left = indexed_source(&mut circuit, "a");
        let right = indexed_source(&mut circuit, "b");
        let joined = Type::tuple([Type::i64(), Type::i64()]);
        let join = circuit
            .add(
                OperatorKind::Join {
                    function: Closure::ternary(
                        ["k", "l", "r"],
                        [Type::i64().reference(), Type::i64().reference(), Type::i64().reference()],
                        |_, l, r| Expr::tuple(vec![l.deref(), r.deref()]),
                    ),
                },
                &[left, right],
            )
            .unwrap();
        let filter = circuit
            .add(
                OperatorKind::Filter {
                    predicate: Closure::unary("t", joined.reference(), |t| {
                        Expr::binary(BinaryOp::Lt, &t.deref().field(0), &t.deref().field(1))
                    }),
                },
                &[join],
            )
            .unwrap();
        sink(&mut circuit, filter);

        let optimized = optimized(&circuit);
        assert_eq!(count(&optimized, OperatorKind::is_join_filter_map), 1);
        assert_eq!(count(&optimized, OperatorKind::is_filter), 0);
        assert_same_changes(
            &circuit,
            &optimized,
            &[
                &[("a", rows(&[(1, 5, 1), (2, 9, 1)])), ("b", rows(&[(1, 7, 1), (2, 3, 1)]))],
                &[("a", rows(&[(1, 6, 1)])), ("b", rows(&[(1, 2, 1)]))],
            ],
        );
    }

    #[test]
    fn antijoin_values_are_narrowed_to_the_fields_read() {
        let wide = Type::tuple([Type::i64(), Type::i64(), Type::i64()]);
        let value = Type::tuple([Type::i64(), Type::i64()]);

        let mut circuit = Circuit::new();
        let a = source(&mut circuit, "a", wide.clone());
        let left = circuit
            .add(
                OperatorKind::MapIndex {
                    function: Closure::unary("t", wide.reference(), |t| {
                        Expr::raw_tuple(vec![
                            t.deref().field(0),
                            Expr::tuple(vec![t.deref().field(1), t.deref().field(2)]),
                        ])
                    }),
                },
                &[a],
            )
            .unwrap();
        let right = indexed_source(&mut circuit, "b");
        let antijoin = circuit.add(OperatorKind::AntiJoin, &[left, right]).unwrap();
        let map = circuit
            .add(
                OperatorKind::Map {
                    function: Closure::unary(
                        "kv",
                        Type::raw_tuple([Type::i64().reference(), value.reference()]),
                        |kv| Expr::tuple(vec![kv.field(0).deref(), kv.field(1).deref().field(1)]),
                    ),
                },
                &[antijoin],
            )
            .unwrap();
        sink(&mut circuit, map);

        let optimized = optimized(&circuit);
        let narrowed = optimized
            .operators()
            .find(|operator| operator.kind().is_anti_join())
            .unwrap();
        let left = optimized.operator(narrowed.input(0)).unwrap();
        assert_eq!(
            left.output_type(),
            &Type::indexed_zset(Type::i64(), Type::tuple([Type::i64()])),
        );
        assert_eq!(optimized.len(), circuit.len());
        // The sink is rebuilt under a fresh id and reads the narrowed map
        let out = optimized.sink("out").unwrap();
        let reader = optimized.operator(out.input(0)).unwrap();
        assert!(reader.kind().is_map());
        assert_eq!(reader.input(0), narrowed.id());

        let triples = |rows: &[(i64, i64, i64)]| -> ZSet {
            rows.iter()
                .map(|&(x, y, z)| (Value::tuple([Value::Int(x), Value::Int(y), Value::Int(z)]), 1))
                .collect()
        };
        assert_same_changes(
            &circuit,
            &optimized,
            &[
                &[("a", triples(&[(1, 2, 3), (4, 5, 6)])), ("b", rows(&[(4, 0, 1)]))],
                &[("a", triples(&[(7, 8, 9)])), ("b", rows(&[(4, 0, -1)]))],
            ],
        );
    }

    #[test]
    fn dropping_the_keys_of_a_row_index_gives_back_the_rows() {
        let mut circuit = Circuit::new();
        let input = source(&mut circuit, "a", row());
        let indexed = circuit
            .add(
                OperatorKind::MapIndex {
                    function: Closure::unary("t", row().reference(), |t| {
                        Expr::raw_tuple(vec![t.deref().field(1), t.deref().clone_value()])
                    }),
                },
                &[input],
            )
            .unwrap();
        let deindexed = circuit.add(OperatorKind::Deindex, &[indexed]).unwrap();
        sink(&mut circuit, deindexed);

        let optimized = optimized(&circuit);
        assert_eq!(optimized.len(), 2);
        assert_eq!(optimized.sink("out").unwrap().inputs(), &[input]);
    }

    #[test]
    fn identical_operators_merge() {
        let mut circuit = Circuit::new();
        let input = source(&mut circuit, "a", row());
        let swap = || OperatorKind::Map {
            function: Closure::unary("t", row().reference(), |t| {
                Expr::tuple(vec![t.deref().field(1), t.deref().field(0)])
            }),
        };
        let first = circuit.add(swap(), &[input]).unwrap();
        let second = circuit.add(swap(), &[input]).unwrap();
        let sum = circuit.add(OperatorKind::Sum, &[first, second]).unwrap();
        sink(&mut circuit, sum);

        let optimized = optimized(&circuit);
        assert_eq!(count(&optimized, OperatorKind::is_map), 1);
        assert_same_changes(&circuit, &optimized, &[&[("a", rows(&[(1, 2, 1)]))]]);
    }

    #[test]
    fn chained_applies_fuse() {
        let mut circuit = Circuit::new();
        let input = source(&mut circuit, "a", row());
        let waterline = circuit
            .add(
                OperatorKind::Waterline {
                    init: Expr::i64(0),
                    extract: Closure::unary("t", row().reference(), |t| t.deref().field(0)),
                },
                &[input],
            )
            .unwrap();
        let increment = || OperatorKind::Apply {
            function: Closure::unary("b", Type::i64().reference(), |b| {
                Expr::binary(BinaryOp::Add, &b.deref(), &Expr::i64(1))
            }),
        };
        let first = circuit.add(increment(), &[waterline]).unwrap();
        let second = circuit.add(increment(), &[first]).unwrap();
        sink(&mut circuit, second);

        let optimized = optimized(&circuit);
        assert_eq!(count(&optimized, OperatorKind::is_apply), 1);
        assert_same_changes(
            &circuit,
            &optimized,
            &[&[("a", rows(&[(3, 1, 1)]))], &[("a", rows(&[(8, 1, 1)]))]],
        );
    }

    #[test]
    fn unread_operators_are_removed() {
        let mut circuit = Circuit::new();
        let input = source(&mut circuit, "a", row());
        circuit.add(OperatorKind::Negate, &[input]).unwrap();
        let out = sink(&mut circuit, input);

        let optimized = optimized(&circuit);
        assert_eq!(optimized.len(), 2);
        assert!(optimized.contains(out));
    }
}
