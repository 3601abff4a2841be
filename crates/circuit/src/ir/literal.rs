use crate::ir::types::Type;
use derive_more::IsVariant;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// A constant value embedded within an expression
///
/// A literal's type lives on the expression holding it, `None` payloads are
/// the `NULL` value of a nullable type while [`Literal::Null`] is the
/// untyped `NULL` literal
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, IsVariant,
)]
pub enum Literal {
    Null,
    Bool(Option<bool>),
    Int(Option<i64>),
    Decimal(Option<Decimal>),
    String(Option<String>),
}

impl Literal {
    /// Returns true if the literal is any kind of `NULL`
    pub const fn is_null_value(&self) -> bool {
        matches!(
            self,
            Self::Null
                | Self::Bool(None)
                | Self::Int(None)
                | Self::Decimal(None)
                | Self::String(None),
        )
    }

    pub const fn as_bool(&self) -> Option<bool> {
        if let Self::Bool(value) = *self {
            value
        } else {
            None
        }
    }

    pub const fn as_int(&self) -> Option<i64> {
        if let Self::Int(value) = *self {
            value
        } else {
            None
        }
    }

    pub const fn as_decimal(&self) -> Option<Decimal> {
        if let Self::Decimal(value) = *self {
            value
        } else {
            None
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        if let Self::String(Some(value)) = self {
            Some(value)
        } else {
            None
        }
    }

    /// The `NULL` literal of the given type
    pub fn null_of(ty: &Type) -> Self {
        match ty {
            Type::Bool { .. } => Self::Bool(None),
            Type::Int { .. } => Self::Int(None),
            Type::Decimal { .. } => Self::Decimal(None),
            Type::String { .. } => Self::String(None),
            _ => Self::Null,
        }
    }

    /// Returns true if the literal is a non-null zero
    pub fn is_zero(&self) -> bool {
        match self {
            Self::Int(Some(value)) => *value == 0,
            Self::Decimal(Some(value)) => value.is_zero(),
            _ => false,
        }
    }

    /// Returns true if the literal is a non-null one
    pub fn is_one(&self) -> bool {
        match self {
            Self::Int(Some(value)) => *value == 1,
            Self::Decimal(Some(value)) => *value == Decimal::ONE,
            _ => false,
        }
    }

    /// The smallest value of a bounded type, used as the initial value of
    /// running lower bounds
    pub fn min_value(ty: &Type) -> Option<Self> {
        match *ty {
            Type::Bool { .. } => Some(Self::Bool(Some(false))),
            Type::Int { width, .. } => Some(Self::Int(Some(width.min_value()))),
            Type::Decimal {
                precision, scale, ..
            } => {
                let digits = 10i128.checked_pow(precision.min(28))?;
                Decimal::try_from_i128_with_scale(-(digits - 1), scale)
                    .ok()
                    .map(|value| Self::Decimal(Some(value)))
            }
            _ => None,
        }
    }
}

impl Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(Some(value)) => write!(f, "{value}"),
            Self::Int(Some(value)) => write!(f, "{value}"),
            Self::Decimal(Some(value)) => write!(f, "{value}"),
            Self::String(Some(value)) => write!(f, "{value:?}"),
            Self::Null
            | Self::Bool(None)
            | Self::Int(None)
            | Self::Decimal(None)
            | Self::String(None) => f.write_str("null"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Literal;
    use crate::ir::types::Type;
    use rust_decimal::Decimal;

    #[test]
    fn minimum_values() {
        assert_eq!(Literal::min_value(&Type::i8()), Some(Literal::Int(Some(-128))));
        assert_eq!(
            Literal::min_value(&Type::decimal(4, 2)),
            Some(Literal::Decimal(Some(Decimal::new(-9999, 2)))),
        );
        assert_eq!(Literal::min_value(&Type::string()), None);
    }

    #[test]
    fn nulls() {
        assert!(Literal::null_of(&Type::i32()).is_null_value());
        assert!(Literal::Null.is_null_value());
        assert!(!Literal::Int(Some(0)).is_null_value());
        assert!(Literal::Int(Some(0)).is_zero());
        assert!(!Literal::Int(None).is_zero());
    }
}
