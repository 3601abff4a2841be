use crate::{
    circuit::{metadata::ColumnMetadata, Circuit, Operator, OperatorKind},
    ir::{Aggregate, Closure},
};

/// Whether a visitor descends into an operator's payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitFlow {
    Descend,
    Skip,
}

/// Walks the operators of a circuit in topological order
///
/// For each operator `preorder` is called first; unless it returns
/// [`VisitFlow::Skip`] the hook matching the operator's kind runs followed
/// by `visit_closure` for each of its closures. `postorder` always runs last
pub trait OperatorVisitor {
    fn preorder(&mut self, _operator: &Operator) -> VisitFlow {
        VisitFlow::Descend
    }

    fn postorder(&mut self, _operator: &Operator) {}

    fn visit_closure(&mut self, _operator: &Operator, _closure: &Closure) {}

    fn visit_source(&mut self, _operator: &Operator, _name: &str, _columns: &[ColumnMetadata]) {}
    fn visit_view(&mut self, _operator: &Operator, _name: &str, _columns: &[ColumnMetadata]) {}
    fn visit_sink(&mut self, _operator: &Operator, _name: &str) {}
    fn visit_constant(&mut self, _operator: &Operator) {}
    fn visit_delay(&mut self, _operator: &Operator) {}
    fn visit_delay_output(&mut self, _operator: &Operator) {}
    fn visit_map(&mut self, _operator: &Operator, _function: &Closure) {}
    fn visit_filter(&mut self, _operator: &Operator, _predicate: &Closure) {}
    fn visit_linear(&mut self, _operator: &Operator) {}
    fn visit_join(&mut self, _operator: &Operator) {}
    fn visit_antijoin(&mut self, _operator: &Operator) {}
    fn visit_distinct(&mut self, _operator: &Operator) {}
    fn visit_aggregate(&mut self, _operator: &Operator, _aggregate: &Aggregate) {}
    fn visit_waterline(&mut self, _operator: &Operator) {}
    fn visit_apply(&mut self, _operator: &Operator, _function: &Closure) {}
    fn visit_limiter(&mut self, _operator: &Operator) {}
}

impl Operator {
    pub fn accept<V>(&self, visitor: &mut V)
    where
        V: OperatorVisitor + ?Sized,
    {
        if visitor.preorder(self) == VisitFlow::Descend {
            match self.kind() {
                OperatorKind::Source { name, columns, .. } => {
                    visitor.visit_source(self, name, columns);
                }
                OperatorKind::View { name, columns } => visitor.visit_view(self, name, columns),
                OperatorKind::Sink { name } => visitor.visit_sink(self, name),
                OperatorKind::Constant { .. } => visitor.visit_constant(self),
                OperatorKind::Delay { .. } => visitor.visit_delay(self),
                OperatorKind::DelayOutput { .. } => visitor.visit_delay_output(self),

                OperatorKind::Map { function } | OperatorKind::MapIndex { function } => {
                    visitor.visit_map(self, function);
                }
                OperatorKind::Filter { predicate } => visitor.visit_filter(self, predicate),

                OperatorKind::Deindex
                | OperatorKind::Sum
                | OperatorKind::Subtract
                | OperatorKind::Negate
                | OperatorKind::Noop
                | OperatorKind::Integrate
                | OperatorKind::Differentiate
                | OperatorKind::DelayedIntegral => visitor.visit_linear(self),

                OperatorKind::Join { .. }
                | OperatorKind::JoinIndex { .. }
                | OperatorKind::JoinFilterMap { .. }
                | OperatorKind::StreamJoin { .. }
                | OperatorKind::StreamJoinIndex { .. }
                | OperatorKind::StreamJoinFilterMap { .. } => visitor.visit_join(self),

                OperatorKind::AntiJoin | OperatorKind::StreamAntiJoin => {
                    visitor.visit_antijoin(self);
                }
                OperatorKind::Distinct | OperatorKind::StreamDistinct => {
                    visitor.visit_distinct(self);
                }

                OperatorKind::Aggregate { aggregate }
                | OperatorKind::StreamAggregate { aggregate }
                | OperatorKind::DeltaAggregate { aggregate }
                | OperatorKind::PartitionedRollingAggregate { aggregate, .. }
                | OperatorKind::StreamPartitionedRollingAggregate { aggregate, .. } => {
                    visitor.visit_aggregate(self, aggregate);
                }

                OperatorKind::Waterline { .. } => visitor.visit_waterline(self),
                OperatorKind::Apply { function } => visitor.visit_apply(self, function),
                OperatorKind::ControlledFilter { .. }
                | OperatorKind::IntegrateTraceRetainKeys { .. }
                | OperatorKind::Window => visitor.visit_limiter(self),
            }

            for closure in self.kind().closures() {
                visitor.visit_closure(self, closure);
            }
        }

        visitor.postorder(self);
    }
}

impl Circuit {
    pub fn accept<V>(&self, visitor: &mut V)
    where
        V: OperatorVisitor + ?Sized,
    {
        for operator in self.operators() {
            operator.accept(visitor);
        }
    }
}
