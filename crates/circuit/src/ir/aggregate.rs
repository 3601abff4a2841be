use crate::ir::{
    closure::Closure,
    types::{write_list, Type},
};
use derive_more::IsVariant;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, IsVariant,
)]
pub enum AggregateKind {
    /// Counts the non-null arguments
    Count,
    Sum,
    Min,
    Max,
}

impl AggregateKind {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::Sum => "sum",
            Self::Min => "min",
            Self::Max => "max",
        }
    }

    /// Returns true if the aggregate can be maintained from weighted deltas
    /// alone, without looking at the group's current contents
    pub const fn is_linear(self) -> bool {
        matches!(self, Self::Count | Self::Sum)
    }
}

/// A single aggregate function applied to a value derived from each row
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AggregateFunction {
    kind: AggregateKind,
    /// Computes the aggregated value from a `&V`
    argument: Closure,
}

impl AggregateFunction {
    pub const fn new(kind: AggregateKind, argument: Closure) -> Self {
        Self { kind, argument }
    }

    pub const fn kind(&self) -> AggregateKind {
        self.kind
    }

    pub const fn argument(&self) -> &Closure {
        &self.argument
    }

    pub fn with_argument(&self, argument: Closure) -> Self {
        Self {
            kind: self.kind,
            argument,
        }
    }

    /// The type the aggregate produces, every aggregate except `count` is
    /// `NULL` over a group with no non-null values
    pub fn result_type(&self) -> Type {
        match self.kind {
            AggregateKind::Count => Type::i64(),
            AggregateKind::Sum | AggregateKind::Min | AggregateKind::Max => {
                self.argument.result_type().with_nullable(true)
            }
        }
    }

    pub fn equivalent(&self, other: &Self) -> bool {
        self.kind == other.kind && self.argument.equivalent(&other.argument)
    }
}

/// A list of aggregate functions computed over each group, producing a
/// tuple with one field per function
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Aggregate {
    functions: Vec<AggregateFunction>,
}

impl Aggregate {
    pub const fn new(functions: Vec<AggregateFunction>) -> Self {
        Self { functions }
    }

    pub fn functions(&self) -> &[AggregateFunction] {
        &self.functions
    }

    pub fn closures(&self) -> impl Iterator<Item = &Closure> + '_ {
        self.functions.iter().map(AggregateFunction::argument)
    }

    /// Rebuilds the aggregate with every argument closure replaced by
    /// `map(closure)`
    pub fn map_closures<F, E>(&self, mut map: F) -> Result<Self, E>
    where
        F: FnMut(&Closure) -> Result<Closure, E>,
    {
        let functions = self
            .functions
            .iter()
            .map(|function| Ok(function.with_argument(map(function.argument())?)))
            .collect::<Result<_, E>>()?;
        Ok(Self { functions })
    }

    pub fn result_type(&self) -> Type {
        Type::tuple(self.functions.iter().map(AggregateFunction::result_type))
    }

    pub fn equivalent(&self, other: &Self) -> bool {
        self.functions.len() == other.functions.len()
            && self
                .functions
                .iter()
                .zip(&other.functions)
                .all(|(a, b)| a.equivalent(b))
    }
}

impl Display for AggregateFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind.name(), self.argument)
    }
}

impl Display for Aggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        write_list(f, &self.functions)?;
        f.write_str("]")
    }
}
