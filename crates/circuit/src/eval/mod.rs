//! A reference interpreter for circuits and their expressions
//!
//! The interpreter defines the runtime semantics the passes must preserve:
//! the simplifier folds constants through it and the tests use it as an
//! oracle comparing circuits before and after each rewrite

mod runner;
mod zset;

pub use runner::{CircuitRunner, StreamValue};
pub use zset::ZSet;

use crate::ir::{types::write_list, BinaryOp, Closure, Expr, ExprKind, Literal, Type, UnaryOp};
use derive_more::{IsVariant, Unwrap};
use rust_decimal::{prelude::ToPrimitive, Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::{
    cmp::Ordering,
    fmt::{self, Display},
    str::FromStr,
};
use thiserror::Error;

/// A runtime value, references are transparent
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    IsVariant,
    Unwrap,
)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Decimal(Decimal),
    String(String),
    Tuple(Vec<Value>),
    RawTuple(Vec<Value>),
}

impl Value {
    pub fn tuple<I>(fields: I) -> Self
    where
        I: IntoIterator<Item = Value>,
    {
        Self::Tuple(fields.into_iter().collect())
    }

    /// Creates the `(key, value)` pair indexed collections hold
    pub fn pair(key: Self, value: Self) -> Self {
        Self::RawTuple(vec![key, value])
    }

    /// Splits an indexed collection's entry into its key and value
    pub fn as_pair(&self) -> Option<(&Self, &Self)> {
        match self {
            Self::RawTuple(fields) if fields.len() == 2 => Some((&fields[0], &fields[1])),
            _ => None,
        }
    }

    pub fn fields(&self) -> Option<&[Self]> {
        match self {
            Self::Tuple(fields) | Self::RawTuple(fields) => Some(fields),
            _ => None,
        }
    }

    pub fn from_literal(literal: &Literal) -> Self {
        match literal {
            Literal::Bool(Some(value)) => Self::Bool(*value),
            Literal::Int(Some(value)) => Self::Int(*value),
            Literal::Decimal(Some(value)) => Self::Decimal(*value),
            Literal::String(Some(value)) => Self::String(value.clone()),
            Literal::Null
            | Literal::Bool(None)
            | Literal::Int(None)
            | Literal::Decimal(None)
            | Literal::String(None) => Self::Null,
        }
    }

    /// Converts a scalar value back into a literal of type `ty`
    pub fn to_literal(&self, ty: &Type) -> Option<Literal> {
        Some(match (self, ty) {
            (Self::Null, Type::Null) => Literal::Null,
            (Self::Null, ty) if ty.is_nullable() => Literal::null_of(ty),
            (Self::Bool(value), Type::Bool { .. }) => Literal::Bool(Some(*value)),
            (Self::Int(value), Type::Int { width, .. }) if width.contains(*value) => {
                Literal::Int(Some(*value))
            }
            (Self::Decimal(value), Type::Decimal { .. }) => Literal::Decimal(Some(*value)),
            (Self::String(value), Type::String { .. }) => Literal::String(Some(value.clone())),
            _ => return None,
        })
    }

    /// Returns true if the value is `true`, `NULL` counts as false
    pub const fn is_true(&self) -> bool {
        matches!(self, Self::Bool(true))
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Bool(value) => write!(f, "{value}"),
            Self::Int(value) => write!(f, "{value}"),
            Self::Decimal(value) => write!(f, "{value}"),
            Self::String(value) => write!(f, "{value:?}"),
            Self::Tuple(fields) => {
                f.write_str("Tup(")?;
                write_list(f, fields)?;
                f.write_str(")")
            }
            Self::RawTuple(fields) => {
                f.write_str("(")?;
                write_list(f, fields)?;
                f.write_str(")")
            }
        }
    }
}

/// Faults raised while evaluating an expression or running a circuit
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvalError {
    #[error("value {value} is out of range for {ty}")]
    OutOfRange { value: String, ty: Type },
    #[error("'{value}' is not a number")]
    NotANumber { value: String },
    #[error("'{value}' is not a boolean")]
    NotABoolean { value: String },
    #[error("division by zero")]
    DivisionByZero,
    #[error("arithmetic overflow in {op:?}")]
    Overflow { op: BinaryOp },
    #[error("cast a NULL value to non-nullable {ty}")]
    NullCast { ty: Type },
    #[error("unknown function {0}")]
    UnknownFunction(String),
    #[error("read unbound variable {0}")]
    UnboundVariable(String),
    #[error("{0}")]
    Malformed(String),
}

impl EvalError {
    fn malformed<M>(message: M) -> Self
    where
        M: Into<String>,
    {
        Self::Malformed(message.into())
    }
}

pub type EvalResult<T> = Result<T, EvalError>;

/// Applies a closure to its arguments
pub fn call(closure: &Closure, args: &[Value]) -> EvalResult<Value> {
    if closure.arity() != args.len() {
        return Err(EvalError::malformed(format!(
            "called closure with {} parameters with {} arguments",
            closure.arity(),
            args.len(),
        )));
    }

    let mut env: Vec<(&str, Value)> = closure
        .params()
        .iter()
        .map(|param| param.name())
        .zip(args.iter().cloned())
        .collect();
    evaluate(closure.body(), &mut env)
}

/// Evaluates an expression within the given variable bindings, later
/// bindings shadow earlier ones
pub fn evaluate<'a>(expr: &'a Expr, env: &mut Vec<(&'a str, Value)>) -> EvalResult<Value> {
    match expr.kind() {
        ExprKind::Literal(literal) => Ok(Value::from_literal(literal)),

        ExprKind::Var(name) => env
            .iter()
            .rev()
            .find(|(bound, _)| *bound == name.as_str())
            .map(|(_, value)| value.clone())
            .ok_or_else(|| EvalError::UnboundVariable(name.clone())),

        ExprKind::Field(tuple, idx) => match evaluate(tuple, env)? {
            Value::Tuple(mut fields) | Value::RawTuple(mut fields) if *idx < fields.len() => {
                Ok(fields.swap_remove(*idx))
            }
            value => Err(EvalError::malformed(format!(
                "accessed field {idx} of {value}"
            ))),
        },

        ExprKind::Deref(inner) | ExprKind::Borrow(inner) | ExprKind::Clone(inner) => {
            evaluate(inner, env)
        }

        ExprKind::Cast(inner) => {
            let value = evaluate(inner, env)?;
            cast_value(value, inner.ty(), expr.ty())
        }

        ExprKind::Unary(op, inner) => {
            let value = evaluate(inner, env)?;
            unary(*op, value, expr.ty())
        }

        ExprKind::Binary(op, lhs, rhs) => {
            let lhs = evaluate(lhs, env)?;
            let rhs = evaluate(rhs, env)?;
            binary(*op, lhs, rhs, expr.ty())
        }

        ExprKind::IsNull(inner) => Ok(Value::Bool(evaluate(inner, env)?.is_null())),

        ExprKind::If {
            condition,
            positive,
            negative,
        } => {
            if evaluate(condition, env)?.is_true() {
                evaluate(positive, env)
            } else {
                evaluate(negative, env)
            }
        }

        ExprKind::Tuple(fields) => Ok(Value::Tuple(
            fields
                .iter()
                .map(|field| evaluate(field, env))
                .collect::<EvalResult<_>>()?,
        )),
        ExprKind::RawTuple(fields) => Ok(Value::RawTuple(
            fields
                .iter()
                .map(|field| evaluate(field, env))
                .collect::<EvalResult<_>>()?,
        )),

        ExprKind::Let { name, init, body } => {
            let value = evaluate(init, env)?;
            env.push((name.as_str(), value));
            let result = evaluate(body, env);
            env.pop();
            result
        }

        ExprKind::Call { function, args } => {
            let args = args
                .iter()
                .map(|arg| evaluate(arg, env))
                .collect::<EvalResult<Vec<_>>>()?;
            call_function(function, args, expr.ty())
        }
    }
}

/// Evaluates an expression without free variables
pub fn evaluate_constant(expr: &Expr) -> EvalResult<Value> {
    evaluate(expr, &mut Vec::new())
}

fn check_int(value: i64, ty: &Type) -> EvalResult<Value> {
    match ty {
        Type::Int { width, .. } if !width.contains(value) => Err(EvalError::OutOfRange {
            value: value.to_string(),
            ty: ty.clone(),
        }),
        _ => Ok(Value::Int(value)),
    }
}

fn unary(op: UnaryOp, value: Value, ty: &Type) -> EvalResult<Value> {
    match (op, value) {
        (_, Value::Null) => Ok(Value::Null),
        (UnaryOp::Not, Value::Bool(value)) => Ok(Value::Bool(!value)),
        (UnaryOp::Neg, Value::Int(value)) => match value.checked_neg() {
            Some(value) => check_int(value, ty),
            None => Err(EvalError::OutOfRange {
                value: format!("-({value})"),
                ty: ty.clone(),
            }),
        },
        (UnaryOp::Neg, Value::Decimal(value)) => Ok(Value::Decimal(-value)),
        (op, value) => Err(EvalError::malformed(format!(
            "applied {} to {value}",
            op.symbol(),
        ))),
    }
}

fn binary(op: BinaryOp, lhs: Value, rhs: Value, ty: &Type) -> EvalResult<Value> {
    match op {
        BinaryOp::And => {
            return Ok(match (lhs, rhs) {
                (Value::Bool(false), _) | (_, Value::Bool(false)) => Value::Bool(false),
                (Value::Bool(true), Value::Bool(true)) => Value::Bool(true),
                _ => Value::Null,
            });
        }
        BinaryOp::Or => {
            return Ok(match (lhs, rhs) {
                (Value::Bool(true), _) | (_, Value::Bool(true)) => Value::Bool(true),
                (Value::Bool(false), Value::Bool(false)) => Value::Bool(false),
                _ => Value::Null,
            });
        }
        _ => {}
    }

    if lhs.is_null() || rhs.is_null() {
        return Ok(Value::Null);
    }

    if op.is_comparison() {
        let ordering = compare(&lhs, &rhs)?;
        return Ok(Value::Bool(match op {
            BinaryOp::Eq => ordering == Ordering::Equal,
            BinaryOp::Neq => ordering != Ordering::Equal,
            BinaryOp::Lt => ordering == Ordering::Less,
            BinaryOp::Lte => ordering != Ordering::Greater,
            BinaryOp::Gt => ordering == Ordering::Greater,
            BinaryOp::Gte => ordering != Ordering::Less,
            _ => unreachable!(),
        }));
    }

    match op {
        BinaryOp::Max | BinaryOp::Min => {
            let ordering = compare(&lhs, &rhs)?;
            let take_lhs = (op == BinaryOp::Max) == (ordering != Ordering::Less);
            return Ok(if take_lhs { lhs } else { rhs });
        }
        _ => {}
    }

    match (lhs, rhs) {
        (Value::Int(lhs), Value::Int(rhs)) => {
            let result = match op {
                BinaryOp::Add => lhs.checked_add(rhs),
                BinaryOp::Sub => lhs.checked_sub(rhs),
                BinaryOp::Mul => lhs.checked_mul(rhs),
                BinaryOp::Div | BinaryOp::Mod if rhs == 0 => {
                    return Err(EvalError::DivisionByZero)
                }
                BinaryOp::Div => lhs.checked_div(rhs),
                BinaryOp::Mod => lhs.checked_rem(rhs),
                _ => unreachable!(),
            };

            match result {
                Some(result) => check_int(result, ty).map_err(|_| EvalError::Overflow { op }),
                None => Err(EvalError::Overflow { op }),
            }
        }

        (Value::Decimal(lhs), Value::Decimal(rhs)) => {
            let result = match op {
                BinaryOp::Add => lhs.checked_add(rhs),
                BinaryOp::Sub => lhs.checked_sub(rhs),
                BinaryOp::Mul => lhs.checked_mul(rhs),
                BinaryOp::Div | BinaryOp::Mod if rhs.is_zero() => {
                    return Err(EvalError::DivisionByZero)
                }
                BinaryOp::Div => lhs.checked_div(rhs),
                BinaryOp::Mod => lhs.checked_rem(rhs),
                _ => unreachable!(),
            };
            result
                .map(Value::Decimal)
                .ok_or(EvalError::Overflow { op })
        }

        (lhs, rhs) => Err(EvalError::malformed(format!(
            "applied {} to {lhs} and {rhs}",
            op.symbol(),
        ))),
    }
}

fn compare(lhs: &Value, rhs: &Value) -> EvalResult<Ordering> {
    match (lhs, rhs) {
        (Value::Bool(a), Value::Bool(b)) => Ok(a.cmp(b)),
        (Value::Int(a), Value::Int(b)) => Ok(a.cmp(b)),
        (Value::Decimal(a), Value::Decimal(b)) => Ok(a.cmp(b)),
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        (Value::Tuple(a), Value::Tuple(b)) | (Value::RawTuple(a), Value::RawTuple(b)) => {
            Ok(a.cmp(b))
        }
        (lhs, rhs) => Err(EvalError::malformed(format!("compared {lhs} with {rhs}"))),
    }
}

fn call_function(function: &str, args: Vec<Value>, ty: &Type) -> EvalResult<Value> {
    if args.iter().any(Value::is_null) {
        return Ok(Value::Null);
    }

    match (function, args.as_slice()) {
        ("abs", [Value::Int(value)]) => match value.checked_abs() {
            Some(value) => check_int(value, ty),
            None => Err(EvalError::OutOfRange {
                value: value.to_string(),
                ty: ty.clone(),
            }),
        },
        ("abs", [Value::Decimal(value)]) => Ok(Value::Decimal(value.abs())),
        ("concat", args) => {
            let mut result = String::new();
            for arg in args {
                match arg {
                    Value::String(value) => result.push_str(value),
                    other => result.push_str(&other.to_string()),
                }
            }
            Ok(Value::String(result))
        }
        ("char_length", [Value::String(value)]) => check_int(
            i64::try_from(value.chars().count()).unwrap_or(i64::MAX),
            ty,
        ),
        (function, _) => Err(EvalError::UnknownFunction(function.to_owned())),
    }
}

/// The exclusive upper bound on the magnitude of a `DECIMAL(precision, scale)`
fn decimal_limit(precision: u32, scale: u32) -> Option<Decimal> {
    let digits = precision.checked_sub(scale)?;
    if digits > 28 {
        return None;
    }
    Some(Decimal::from_i128_with_scale(10i128.pow(digits), 0))
}

fn fit_decimal(value: Decimal, ty: &Type) -> EvalResult<Value> {
    if let Type::Decimal {
        precision, scale, ..
    } = *ty
    {
        let in_range = decimal_limit(precision, scale).map_or(true, |limit| value.abs() < limit);
        if !in_range {
            return Err(EvalError::OutOfRange {
                value: value.to_string(),
                ty: ty.clone(),
            });
        }
    }
    Ok(Value::Decimal(value))
}

/// Rounds a decimal to the scale of `ty`, values parsed from strings round
/// half to even while decimal conversions truncate
pub fn round_decimal(value: Decimal, ty: &Type, from_string: bool) -> Decimal {
    match *ty {
        Type::Decimal { scale, .. } if value.scale() > scale => {
            let strategy = if from_string {
                RoundingStrategy::MidpointNearestEven
            } else {
                RoundingStrategy::ToZero
            };
            value.round_dp_with_strategy(scale, strategy)
        }
        _ => value,
    }
}

/// Adjusts a string to the width of a `CHAR(n)` or `VARCHAR(n)`
fn fit_string(mut value: String, from: &Type, to: &Type) -> String {
    if let Type::String {
        precision, fixed, ..
    } = *to
    {
        if !fixed && matches!(from, Type::String { fixed: true, .. }) {
            value.truncate(value.trim_end_matches(' ').len());
        }

        if let Some(precision) = precision.and_then(|precision| usize::try_from(precision).ok()) {
            let len = value.chars().count();
            if len > precision {
                value = value.chars().take(precision).collect();
            } else if fixed && len < precision {
                value.extend(std::iter::repeat(' ').take(precision - len));
            }
        }
    }
    value
}

/// Converts a value of type `from` into a value of type `to`
pub fn cast_value(value: Value, from: &Type, to: &Type) -> EvalResult<Value> {
    if value.is_null() {
        return if to.is_nullable() {
            Ok(Value::Null)
        } else {
            Err(EvalError::NullCast { ty: to.clone() })
        };
    }

    match (value, to) {
        (Value::Bool(value), Type::Bool { .. }) => Ok(Value::Bool(value)),
        (Value::Int(value), Type::Bool { .. }) => Ok(Value::Bool(value != 0)),
        (Value::String(value), Type::Bool { .. }) => {
            match value.trim().to_ascii_lowercase().as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err(EvalError::NotABoolean { value }),
            }
        }

        (Value::Bool(value), Type::Int { .. }) => Ok(Value::Int(i64::from(value))),
        (Value::Int(value), Type::Int { .. }) => check_int(value, to),
        (Value::Decimal(value), Type::Int { .. }) => match value.trunc().to_i64() {
            Some(value) => check_int(value, to),
            None => Err(EvalError::OutOfRange {
                value: value.to_string(),
                ty: to.clone(),
            }),
        },
        (Value::String(value), Type::Int { .. }) => match value.trim().parse::<i64>() {
            Ok(parsed) => check_int(parsed, to).map_err(|_| EvalError::OutOfRange {
                value,
                ty: to.clone(),
            }),
            Err(_) => Err(EvalError::NotANumber { value }),
        },

        (Value::Int(value), Type::Decimal { .. }) => fit_decimal(Decimal::from(value), to),
        (Value::Decimal(value), Type::Decimal { .. }) => {
            fit_decimal(round_decimal(value, to, false), to)
        }
        (Value::String(value), Type::Decimal { .. }) => match Decimal::from_str(value.trim()) {
            Ok(parsed) => fit_decimal(round_decimal(parsed, to, true), to),
            Err(_) => Err(EvalError::NotANumber { value }),
        },

        (Value::String(value), Type::String { .. }) => {
            Ok(Value::String(fit_string(value, from, to)))
        }
        (Value::Bool(value), Type::String { .. }) => {
            Ok(Value::String(fit_string(value.to_string(), from, to)))
        }
        (Value::Int(value), Type::String { .. }) => {
            Ok(Value::String(fit_string(value.to_string(), from, to)))
        }
        (Value::Decimal(value), Type::String { .. }) => {
            Ok(Value::String(fit_string(value.to_string(), from, to)))
        }

        (value, to) => Err(EvalError::malformed(format!("cannot cast {value} to {to}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::{call, cast_value, evaluate_constant, EvalError, Value};
    use crate::ir::{BinaryOp, Closure, Expr, Type};
    use rust_decimal::Decimal;

    #[test]
    fn string_to_tinyint_out_of_range() {
        let expr = Expr::string("256").cast(Type::i8());
        assert!(matches!(
            evaluate_constant(&expr),
            Err(EvalError::OutOfRange { .. }),
        ));

        let expr = Expr::string("12").cast(Type::i8());
        assert_eq!(evaluate_constant(&expr), Ok(Value::Int(12)));
    }

    #[test]
    fn not_a_number() {
        let result = cast_value(Value::String("x1".to_owned()), &Type::string(), &Type::i32());
        assert_eq!(
            result,
            Err(EvalError::NotANumber {
                value: "x1".to_owned()
            }),
        );
    }

    #[test]
    fn decimal_rounding() {
        // Strings round half to even
        let from_string = cast_value(
            Value::String("1.125".to_owned()),
            &Type::string(),
            &Type::decimal(5, 2),
        );
        assert_eq!(from_string, Ok(Value::Decimal(Decimal::new(112, 2))));

        // Decimals truncate
        let from_decimal = cast_value(
            Value::Decimal(Decimal::new(1129, 3)),
            &Type::decimal(5, 3),
            &Type::decimal(5, 2),
        );
        assert_eq!(from_decimal, Ok(Value::Decimal(Decimal::new(112, 2))));

        let overflow = cast_value(
            Value::Decimal(Decimal::new(1000, 0)),
            &Type::decimal(6, 0),
            &Type::decimal(4, 2),
        );
        assert!(matches!(overflow, Err(EvalError::OutOfRange { .. })));
    }

    #[test]
    fn string_widths() {
        let padded = cast_value(Value::String("ab".to_owned()), &Type::string(), &Type::char(4));
        assert_eq!(padded, Ok(Value::String("ab  ".to_owned())));

        let truncated = cast_value(
            Value::String("abcdef".to_owned()),
            &Type::string(),
            &Type::varchar(3),
        );
        assert_eq!(truncated, Ok(Value::String("abc".to_owned())));

        let trimmed = cast_value(
            Value::String("ab  ".to_owned()),
            &Type::char(4),
            &Type::varchar(10),
        );
        assert_eq!(trimmed, Ok(Value::String("ab".to_owned())));
    }

    #[test]
    fn three_valued_logic() {
        let null = Expr::null(&Type::bool());
        let and = Expr::binary(BinaryOp::And, &null, &Expr::bool(false));
        assert_eq!(evaluate_constant(&and), Ok(Value::Bool(false)));

        let and = Expr::binary(BinaryOp::And, &null, &Expr::bool(true));
        assert_eq!(evaluate_constant(&and), Ok(Value::Null));

        let or = Expr::binary(BinaryOp::Or, &null, &Expr::bool(true));
        assert_eq!(evaluate_constant(&or), Ok(Value::Bool(true)));
    }

    #[test]
    fn closures() {
        let row = Type::tuple([Type::i32(), Type::i32()]);
        let closure = Closure::unary("t", row.reference(), |t| {
            Expr::binary(BinaryOp::Div, &t.deref().field(0), &t.deref().field(1))
        });

        let args = [Value::tuple([Value::Int(7), Value::Int(2)])];
        assert_eq!(call(&closure, &args), Ok(Value::Int(3)));

        let args = [Value::tuple([Value::Int(7), Value::Int(0)])];
        assert_eq!(call(&closure, &args), Err(EvalError::DivisionByZero));
    }
}
