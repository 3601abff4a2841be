use crate::ir::{Literal, Type};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// Per-column information declared on sources and views
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ColumnMetadata {
    name: String,
    ty: Type,
    /// No row will ever arrive whose value for this column is below the
    /// largest value observed so far minus the lateness
    lateness: Option<Literal>,
    /// Rows are only released once the column's waterline passes them
    watermark: Option<Literal>,
}

impl ColumnMetadata {
    pub fn new<N>(name: N, ty: Type) -> Self
    where
        N: Into<String>,
    {
        Self {
            name: name.into(),
            ty,
            lateness: None,
            watermark: None,
        }
    }

    pub fn with_lateness(mut self, lateness: Literal) -> Self {
        self.lateness = Some(lateness);
        self
    }

    pub fn with_watermark(mut self, watermark: Literal) -> Self {
        self.watermark = Some(watermark);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn ty(&self) -> &Type {
        &self.ty
    }

    pub const fn lateness(&self) -> Option<&Literal> {
        self.lateness.as_ref()
    }

    pub const fn watermark(&self) -> Option<&Literal> {
        self.watermark.as_ref()
    }
}

impl Display for ColumnMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.ty)?;
        if let Some(lateness) = &self.lateness {
            write!(f, " LATENESS {lateness}")?;
        }
        if let Some(watermark) = &self.watermark {
            write!(f, " WATERMARK {watermark}")?;
        }
        Ok(())
    }
}

/// The indices of every column with a lateness declaration
pub fn lateness_columns(columns: &[ColumnMetadata]) -> impl Iterator<Item = (usize, &ColumnMetadata)> + '_ {
    columns
        .iter()
        .enumerate()
        .filter(|(_, column)| column.lateness.is_some())
}

/// The indices of every column with a watermark declaration
pub fn watermark_columns(columns: &[ColumnMetadata]) -> impl Iterator<Item = (usize, &ColumnMetadata)> + '_ {
    columns
        .iter()
        .enumerate()
        .filter(|(_, column)| column.watermark.is_some())
}
