//! Bounds the state kept by joins and aggregates
//!
//! Every source or view declaring a lateness gets a waterline, a running
//! lower bound of its lateness columns. Late rows are dropped by a
//! controlled filter and the bound is carried downstream through the
//! reduced closures of monotone maps. Joins and aggregates whose keys are
//! bounded then discard the integral entries no future change can match.
//! Watermark declarations additionally hold rows back within a window
//! until the watermark passes them

use crate::{
    circuit::{
        lateness_columns, watermark_columns, Circuit, CircuitRewriter, ColumnMetadata, Operator,
        OperatorKind, OperatorVisitor, VisitFlow,
    },
    error::{internal_error, CompilerError, CompilerResult},
    ids::OperatorId,
    ir::{BinaryOp, Closure, Expr, Literal, Param, Type},
    passes::{
        expand::ExpansionMap,
        monotone::{bound_predicate, lateness_monotone, monotone_closure, MonotoneType, Monotonicity},
    },
};
use std::{collections::BTreeMap, sync::Arc};

/// Inserts the operators bounding the state of `circuit`
///
/// `analysis` describes the expansion of `circuit` recorded in
/// `expansions`, the returned circuit still has to be expanded
#[tracing::instrument(skip_all)]
pub fn insert_limiters(
    circuit: &Circuit,
    expansions: &ExpansionMap,
    analysis: &Monotonicity,
) -> CompilerResult<Circuit> {
    if annotated_tables(circuit).is_empty() {
        return Ok(circuit.clone());
    }

    let mut limiter = Limiter {
        rewriter: CircuitRewriter::new(circuit),
        expansions,
        analysis,
        consumers: circuit.consumers(),
        bounds: BTreeMap::new(),
    };

    for operator in circuit.operators() {
        limiter
            .limit(operator)
            .map_err(|error| error.at(operator.id()))?;
    }

    limiter.rewriter.finish()
}

/// The sources and views declaring a lateness or a watermark
pub fn annotated_tables(circuit: &Circuit) -> Vec<OperatorId> {
    let mut tables = AnnotatedTables::default();
    circuit.accept(&mut tables);
    tables.0
}

#[derive(Default)]
struct AnnotatedTables(Vec<OperatorId>);

impl AnnotatedTables {
    fn visit_table(&mut self, operator: &Operator, columns: &[ColumnMetadata]) {
        if lateness_columns(columns).next().is_some() || watermark_columns(columns).next().is_some()
        {
            self.0.push(operator.id());
        }
    }
}

impl OperatorVisitor for AnnotatedTables {
    fn preorder(&mut self, operator: &Operator) -> VisitFlow {
        if operator.kind().is_source() || operator.kind().is_view() {
            VisitFlow::Descend
        } else {
            VisitFlow::Skip
        }
    }

    fn visit_source(&mut self, operator: &Operator, _name: &str, columns: &[ColumnMetadata]) {
        self.visit_table(operator, columns);
    }

    fn visit_view(&mut self, operator: &Operator, _name: &str, columns: &[ColumnMetadata]) {
        self.visit_table(operator, columns);
    }
}

struct Limiter<'a> {
    rewriter: CircuitRewriter<'a>,
    expansions: &'a ExpansionMap,
    analysis: &'a Monotonicity,
    consumers: BTreeMap<OperatorId, Vec<OperatorId>>,
    /// Maps operators of the source circuit to the output operator producing
    /// the lower bound of their monotone fields
    bounds: BTreeMap<OperatorId, OperatorId>,
}

impl Limiter<'_> {
    fn monotone(&self, original: OperatorId) -> CompilerResult<&MonotoneType> {
        Ok(self.analysis.get(self.expansions.output_of(original)?))
    }

    /// Returns true if `operator` is the only consumer of `input`
    fn sole_consumer(&self, input: OperatorId, operator: OperatorId) -> bool {
        self.consumers
            .get(&input)
            .is_some_and(|consumers| consumers.as_slice() == [operator])
    }

    fn limit(&mut self, operator: &Arc<Operator>) -> CompilerResult<()> {
        match operator.kind() {
            OperatorKind::Source { row, columns, .. } => self.limit_input(operator, row, columns),

            OperatorKind::View { columns, .. } => {
                let has_annotations = lateness_columns(columns).next().is_some()
                    || watermark_columns(columns).next().is_some();
                if has_annotations {
                    let row = match operator.output_type() {
                        Type::ZSet(row) => (**row).clone(),
                        ty => {
                            return Err(CompilerError::unimplemented(format!(
                                "lateness on a view of {ty}"
                            )))
                        }
                    };
                    self.limit_input(operator, &row, columns)
                } else {
                    self.rewriter.keep(operator)?;
                    self.alias_bound(operator);
                    Ok(())
                }
            }

            OperatorKind::Map { function } | OperatorKind::MapIndex { function } => {
                self.rewriter.keep(operator)?;
                self.apply_bound(operator, function)
            }

            OperatorKind::Deindex => {
                self.rewriter.keep(operator)?;
                let input = self.rewriter.source().operator(operator.input(0))?;
                let Some(argument) = input.output_type().closure_argument() else {
                    internal_error!("deindex of {}", input.output_type());
                };
                let value = Closure::unary("kv", argument, |kv| kv.field(1).deref().clone_value());
                self.apply_bound(operator, &value)
            }

            OperatorKind::Filter { .. }
            | OperatorKind::Noop
            | OperatorKind::Negate
            | OperatorKind::Distinct => {
                self.rewriter.keep(operator)?;
                self.alias_bound(operator);
                Ok(())
            }

            OperatorKind::Join { .. }
            | OperatorKind::JoinIndex { .. }
            | OperatorKind::JoinFilterMap { .. } => {
                self.rewriter.keep(operator)?;
                let (left, right) = (operator.input(0), operator.input(1));
                self.retain_keys(operator, left, right)?;
                self.retain_keys(operator, right, left)?;
                Ok(())
            }

            OperatorKind::Aggregate { .. } => {
                self.rewriter.keep(operator)?;
                let input = operator.input(0);
                let pruned = self.retain_keys(operator, input, input)?;
                self.aggregate_bound(operator)?;
                if pruned {
                    self.retain_results(operator)?;
                }
                Ok(())
            }

            _ => {
                self.rewriter.keep(operator)?;
                Ok(())
            }
        }
    }

    /// Bounds a source or view carrying lateness or watermark declarations
    fn limit_input(
        &mut self,
        operator: &Arc<Operator>,
        row: &Type,
        columns: &[ColumnMetadata],
    ) -> CompilerResult<()> {
        let data = self.rewriter.keep(operator)?;
        let mut replacement = data;

        if lateness_columns(columns).next().is_some() {
            let monotone = lateness_monotone(row, columns);
            let lateness: Vec<_> = lateness_columns(columns)
                .map(|(idx, column)| (idx, column.lateness().cloned()))
                .collect();
            let waterline = self.waterline(operator.id(), data, row, &lateness)?;

            let init = waterline_init(row, &lateness)?;
            let delay = self.rewriter.add_derived(
                OperatorKind::Delay {
                    initial: Some(init.clone()),
                },
                &[waterline],
                operator.id(),
            )?;

            let Some(predicate) = bound_predicate(
                &Expr::var("t", row.reference()).deref(),
                &monotone,
                &Expr::var("b", init.ty().reference()).deref(),
            ) else {
                internal_error!("lateness declarations without monotone columns");
            };
            let predicate = Closure::new(
                vec![Param::new("t", row.reference()), Param::new("b", init.ty().reference())],
                predicate,
            );
            replacement = self.rewriter.add_derived(
                OperatorKind::ControlledFilter { predicate },
                &[data, delay],
                operator.id(),
            )?;

            tracing::debug!(
                "bounded {} with waterline {waterline} through {replacement}",
                operator.id(),
            );
            if self.monotone(operator.id())?.is_monotone() {
                self.bounds.insert(operator.id(), waterline);
            }
        }

        let watermarks: Vec<_> = watermark_columns(columns).collect();
        match watermarks.as_slice() {
            [] => {}
            &[(idx, column)] => {
                replacement = self.window(operator.id(), data, replacement, row, idx, column)?;
            }
            _ => {
                return Err(CompilerError::unimplemented(
                    "more than 1 watermark per table",
                ))
            }
        }

        self.rewriter.replace(operator.id(), replacement);
        Ok(())
    }

    /// Adds a waterline over `(column - delta, ..)` for the given columns
    fn waterline(
        &mut self,
        original: OperatorId,
        data: OperatorId,
        row: &Type,
        deltas: &[(usize, Option<Literal>)],
    ) -> CompilerResult<OperatorId> {
        let init = waterline_init(row, deltas)?;
        let fields = row_fields(row)?;
        let mut extracted = Vec::with_capacity(deltas.len());
        for (idx, delta) in deltas {
            let field = &fields[*idx];
            let delta = match delta {
                Some(delta) => bound_delta(delta, field)?,
                None => internal_error!("column {idx} has no lateness"),
            };
            extracted.push((*idx, delta));
        }

        let extract = Closure::unary("t", row.reference(), |t| {
            Expr::tuple(
                extracted
                    .iter()
                    .map(|(idx, delta)| delta.apply(&t.deref().field(*idx)))
                    .collect(),
            )
        });

        self.rewriter
            .add_derived(OperatorKind::Waterline { init, extract }, &[data], original)
    }

    /// Releases the rows of `input` once the watermark passed their
    /// watermark column
    fn window(
        &mut self,
        original: OperatorId,
        data: OperatorId,
        input: OperatorId,
        row: &Type,
        idx: usize,
        column: &ColumnMetadata,
    ) -> CompilerResult<OperatorId> {
        let deltas = [(idx, column.watermark().cloned())];
        let waterline = self.waterline(original, data, row, &deltas)?;

        let key = row_fields(row)?[idx].clone();
        let Some(minimum) = Literal::min_value(&key) else {
            return Err(CompilerError::unimplemented(format!(
                "watermark on a column of type {key}"
            )));
        };
        let bounds = Closure::unary(
            "w",
            Type::tuple([key.clone()]).reference(),
            |w| Expr::raw_tuple(vec![Expr::literal(minimum, key.clone()), w.deref().field(0)]),
        );
        let bounds = self
            .rewriter
            .add_derived(OperatorKind::Apply { function: bounds }, &[waterline], original)?;

        let index = Closure::unary("t", row.reference(), |t| {
            Expr::raw_tuple(vec![t.deref().field(idx), t.deref().clone_value()])
        });
        let index = self
            .rewriter
            .add_derived(OperatorKind::MapIndex { function: index }, &[input], original)?;
        let window = self
            .rewriter
            .add_derived(OperatorKind::Window, &[index, bounds], original)?;

        tracing::debug!("windowed {original} by column {} through {window}", column.name());
        self.rewriter
            .add_derived(OperatorKind::Deindex, &[window], original)
    }

    fn alias_bound(&mut self, operator: &Operator) {
        if let Some(&bound) = self.bounds.get(&operator.input(0)) {
            self.bounds.insert(operator.id(), bound);
        }
    }

    /// Derives the bound of a unary operator by applying its closure,
    /// reduced to the monotone fields, to the bound of its input
    fn apply_bound(&mut self, operator: &Operator, function: &Closure) -> CompilerResult<()> {
        let input = operator.input(0);
        let Some(&bound) = self.bounds.get(&input) else {
            return Ok(());
        };

        let monotone = self.monotone(input)?.clone();
        let reduced = monotone_closure(function, &[monotone]);
        if let Some(reduced) = reduced.reduced.filter(|reduced| reduced.arity() == 1) {
            let apply = self.rewriter.add_derived(
                OperatorKind::Apply { function: reduced },
                &[bound],
                operator.id(),
            )?;
            tracing::debug!("bounded {} by {apply}", operator.id());
            self.bounds.insert(operator.id(), apply);
        }

        Ok(())
    }

    /// The changes of an aggregate only touch keys at least as large as its
    /// input's bound
    fn aggregate_bound(&mut self, operator: &Operator) -> CompilerResult<()> {
        let input = operator.input(0);
        let Some(&bound) = self.bounds.get(&input) else {
            return Ok(());
        };

        let monotone = self.monotone(input)?.clone();
        let key = monotone.field(0);
        if !key.is_monotone() {
            return Ok(());
        }

        let bound_type = self.rewriter.output_operator(bound)?.output_type().clone();
        let position = monotone.reduced_index(0);
        let function = Closure::unary("b", bound_type.reference(), |b| {
            Expr::raw_tuple(vec![b.deref().field(position)])
        });
        let apply = self
            .rewriter
            .add_derived(OperatorKind::Apply { function }, &[bound], operator.id())?;
        self.bounds.insert(operator.id(), apply);
        Ok(())
    }

    /// Prunes the integrals of `data` by the key bound of `bounded`,
    /// returns false if nothing could be pruned
    ///
    /// Future changes of `bounded` carry keys of at least its bound, so the
    /// entries of `data` below it can't produce output anymore
    fn retain_keys(
        &mut self,
        operator: &Operator,
        bounded: OperatorId,
        data: OperatorId,
    ) -> CompilerResult<bool> {
        let Some(&bound) = self.bounds.get(&bounded) else {
            return Ok(false);
        };
        if !self.sole_consumer(data, operator.id()) {
            tracing::debug!(
                "not pruning {data} which is shared by other operators than {}",
                operator.id(),
            );
            return Ok(false);
        }

        let monotone = self.monotone(bounded)?;
        let key_monotone = monotone.field(0);
        let position = monotone.reduced_index(0);
        let output = self.rewriter.remapped(data)?;
        self.insert_retain_keys(operator, output, bound, &key_monotone, position)
    }

    /// Prunes the results of an aggregate whose input is pruned
    ///
    /// Later changes only touch groups at or above the aggregate's bound, so
    /// results below it are final. Only the aggregate's own results and the
    /// integrals of aggregates reading them are pruned, anything else
    /// consuming the results may still combine them with older keys
    fn retain_results(&mut self, operator: &Operator) -> CompilerResult<bool> {
        let Some(&bound) = self.bounds.get(&operator.id()) else {
            return Ok(false);
        };
        let only_aggregated = self.consumers.get(&operator.id()).map_or(true, |consumers| {
            consumers.iter().all(|&consumer| {
                self.rewriter
                    .source()
                    .get(consumer)
                    .is_some_and(|consumer| {
                        matches!(
                            consumer.kind(),
                            OperatorKind::Sink { .. } | OperatorKind::Aggregate { .. }
                        )
                    })
            })
        });
        if !only_aggregated {
            tracing::debug!("not pruning the results of {} read by joins", operator.id());
            return Ok(false);
        }

        let key_monotone = self.monotone(operator.input(0))?.field(0);
        let output = self.rewriter.remapped(operator.id())?;
        self.insert_retain_keys(operator, output, bound, &key_monotone, 0)
    }

    /// Adds a limiter dropping the entries of `output` whose key falls
    /// below the `position`th field of `bound`
    fn insert_retain_keys(
        &mut self,
        operator: &Operator,
        output: OperatorId,
        bound: OperatorId,
        key_monotone: &MonotoneType,
        position: usize,
    ) -> CompilerResult<bool> {
        let Some(key) = self.rewriter.output_operator(output)?.output_type().key_type().cloned()
        else {
            return Ok(false);
        };
        let bound_type = self.rewriter.output_operator(bound)?.output_type().clone();

        let key_var = Expr::var("k", key.reference());
        let bound_var = Expr::var("b", bound_type.reference());
        let Some(predicate) = bound_predicate(
            &key_var.deref(),
            key_monotone,
            &bound_var.deref().field(position),
        ) else {
            return Ok(false);
        };

        let predicate = Closure::new(
            vec![Param::new("k", key.reference()), Param::new("b", bound_type.reference())],
            predicate,
        );
        let retain = self.rewriter.add_derived(
            OperatorKind::IntegrateTraceRetainKeys { predicate },
            &[output, bound],
            operator.id(),
        )?;
        tracing::debug!(
            "pruning {output} for {} with {retain} bounded by {bound}",
            operator.id(),
        );
        Ok(true)
    }
}

fn row_fields(row: &Type) -> CompilerResult<&[Type]> {
    match row {
        Type::Tuple(fields) => Ok(fields),
        ty => Err(CompilerError::unimplemented(format!(
            "lateness on rows of type {ty}"
        ))),
    }
}

/// The initial waterline, the minimum of every bounded column's type
fn waterline_init(row: &Type, columns: &[(usize, Option<Literal>)]) -> CompilerResult<Expr> {
    let fields = row_fields(row)?;
    columns
        .iter()
        .map(|&(idx, _)| {
            let ty = match fields.get(idx) {
                Some(ty) => ty,
                None => internal_error!("column {idx} is out of bounds for {row}"),
            };
            match Literal::min_value(ty) {
                Some(minimum) if ty.is_numeric() => Ok(Expr::literal(minimum, ty.clone())),
                _ => Err(CompilerError::unimplemented(format!(
                    "lateness on a column of type {ty}"
                ))),
            }
        })
        .collect::<CompilerResult<Vec<_>>>()
        .map(Expr::tuple)
}

/// A lateness or watermark delta subtracted from a column
///
/// Columns within `delta` of their type's range saturate at that end of
/// the range instead of overflowing, so the bound `column - delta` never
/// faults
struct BoundDelta {
    delta: Expr,
    limit: Expr,
    saturated: Expr,
    below: bool,
}

impl BoundDelta {
    /// `if column < limit then saturated else column - delta`, with the
    /// comparison flipped for negative deltas
    fn apply(&self, column: &Expr) -> Expr {
        let op = if self.below { BinaryOp::Lt } else { BinaryOp::Gt };
        Expr::if_then_else(
            &Expr::binary(op, column, &self.limit),
            &self.saturated,
            &Expr::binary(BinaryOp::Sub, column, &self.delta),
        )
    }
}

fn bound_delta(delta: &Literal, column: &Type) -> CompilerResult<BoundDelta> {
    let ty = column.with_nullable(false);
    let unsupported = || {
        CompilerError::unimplemented(format!(
            "lateness {delta} on a column of type {column}"
        ))
    };

    // The end of the range a subtraction of `delta` can run past, and the
    // value `column - delta` first fails to represent past it
    let (saturated, limit, below) = match (delta, &ty) {
        (Literal::Int(Some(delta)), Type::Int { width, .. }) if width.contains(*delta) => {
            if *delta >= 0 {
                let limit = width.min_value() + delta;
                (Literal::Int(Some(width.min_value())), Literal::Int(Some(limit)), true)
            } else {
                let limit = width.max_value() + delta;
                (Literal::Int(Some(width.max_value())), Literal::Int(Some(limit)), false)
            }
        }
        (Literal::Decimal(Some(delta)), Type::Decimal { .. }) => {
            let Some(Literal::Decimal(Some(minimum))) = Literal::min_value(&ty) else {
                return Err(unsupported());
            };
            let (saturated, limit) = if delta.is_sign_negative() {
                (-minimum, (-minimum).checked_add(*delta))
            } else {
                (minimum, minimum.checked_add(*delta))
            };
            let limit = limit.ok_or_else(unsupported)?;
            (
                Literal::Decimal(Some(saturated)),
                Literal::Decimal(Some(limit)),
                !delta.is_sign_negative(),
            )
        }
        _ => return Err(unsupported()),
    };

    Ok(BoundDelta {
        delta: Expr::literal(delta.clone(), ty.clone()),
        limit: Expr::literal(limit, ty.clone()),
        saturated: Expr::literal(saturated, ty),
        below,
    })
}
