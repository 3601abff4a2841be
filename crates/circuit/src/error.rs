use crate::ids::OperatorId;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use thiserror::Error;

pub type CompilerResult<T> = Result<T, CompilerError>;

/// Errors that abort a compilation
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum CompilerError {
    /// A defect in an earlier stage of the pipeline, e.g. an operator whose
    /// inputs violate its type constraints
    #[error("internal compiler error{}: {message}", format_operator(*.operator))]
    Internal {
        message: String,
        operator: Option<OperatorId>,
    },

    /// A recognized construct that is not supported yet
    #[error("not yet supported{}: {construct}", format_operator(*.operator))]
    Unimplemented {
        construct: String,
        operator: Option<OperatorId>,
    },
}

fn format_operator(operator: Option<OperatorId>) -> String {
    operator.map_or_else(String::new, |operator| format!(" in {operator}"))
}

impl CompilerError {
    pub fn internal<M>(message: M) -> Self
    where
        M: Into<String>,
    {
        Self::Internal {
            message: message.into(),
            operator: None,
        }
    }

    pub fn unimplemented<C>(construct: C) -> Self
    where
        C: Into<String>,
    {
        Self::Unimplemented {
            construct: construct.into(),
            operator: None,
        }
    }

    /// Attaches the operator the error was raised for
    pub fn at(mut self, id: OperatorId) -> Self {
        match &mut self {
            Self::Internal { operator, .. } | Self::Unimplemented { operator, .. } => {
                operator.get_or_insert(id);
            }
        }
        self
    }

    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }

    pub const fn is_unimplemented(&self) -> bool {
        matches!(self, Self::Unimplemented { .. })
    }
}

/// Bails out of the current function with an internal compiler error
macro_rules! internal_error {
    ($($arg:tt)*) => {
        return Err($crate::error::CompilerError::internal(format!($($arg)*)))
    };
}

pub(crate) use internal_error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Warning,
    Error,
}

/// A message reported by a pass that doesn't necessarily stop compilation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub operator: Option<OperatorId>,
}

impl Diagnostic {
    pub fn warning<T, M>(title: T, message: M) -> Self
    where
        T: Into<String>,
        M: Into<String>,
    {
        Self {
            severity: Severity::Warning,
            title: title.into(),
            message: message.into(),
            operator: None,
        }
    }

    pub fn with_operator(mut self, operator: Option<OperatorId>) -> Self {
        self.operator = operator;
        self
    }

    pub fn is_warning(&self) -> bool {
        self.severity == Severity::Warning
    }
}

impl Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let severity = match self.severity {
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        write!(f, "{severity}: {}", self.title)?;
        if let Some(operator) = self.operator {
            write!(f, " ({operator})")?;
        }
        write!(f, ": {}", self.message)
    }
}

/// The channel passes report warnings through
pub trait ErrorReporter {
    fn report(&mut self, diagnostic: Diagnostic);

    fn report_warning(&mut self, title: &str, message: &str) {
        self.report(Diagnostic::warning(title, message));
    }
}

/// Collects every reported diagnostic, logging each of them
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostics {
    diagnostics: Vec<Diagnostic>,
}

impl Diagnostics {
    pub const fn new() -> Self {
        Self {
            diagnostics: Vec::new(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> + '_ {
        self.diagnostics.iter()
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Diagnostic> + '_ {
        self.diagnostics.iter().filter(|diag| diag.is_warning())
    }

    pub fn len(&self) -> usize {
        self.diagnostics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.diagnostics.is_empty()
    }

    pub fn extend(&mut self, other: Self) {
        self.diagnostics.extend(other.diagnostics);
    }

    /// Drops diagnostics repeating the title and message of an earlier one
    pub fn dedup(&mut self) {
        let mut seen = std::collections::BTreeSet::new();
        self.diagnostics
            .retain(|diag| seen.insert((diag.title.clone(), diag.message.clone())));
    }
}

impl ErrorReporter for Diagnostics {
    fn report(&mut self, diagnostic: Diagnostic) {
        match diagnostic.severity {
            Severity::Warning => tracing::warn!("{diagnostic}"),
            Severity::Error => tracing::error!("{diagnostic}"),
        }
        self.diagnostics.push(diagnostic);
    }
}

#[cfg(test)]
mod tests {
    use super::{CompilerError, Diagnostic, Diagnostics, ErrorReporter};
    use crate::ids::OperatorId;

    #[test]
    fn error_messages() {
        let error = CompilerError::internal("mismatched key types").at(OperatorId::new(3));
        assert_eq!(
            error.to_string(),
            "internal compiler error in op3: mismatched key types",
        );

        let error = CompilerError::unimplemented("more than 1 watermark per table");
        assert_eq!(
            error.to_string(),
            "not yet supported: more than 1 watermark per table",
        );
    }

    #[test]
    fn collects_warnings() {
        let mut diagnostics = Diagnostics::new();
        diagnostics.report_warning("Division by zero", "division by constant zero value");
        diagnostics.report(
            Diagnostic::warning("Not a number", "'x' is not a number")
                .with_operator(Some(OperatorId::new(1))),
        );

        assert_eq!(diagnostics.warnings().count(), 2);
        assert_eq!(
            diagnostics.iter().nth(1).unwrap().to_string(),
            "warning: Not a number (op1): 'x' is not a number",
        );
    }
}
