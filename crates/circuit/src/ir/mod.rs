//! The expression language embedded within circuit operators

pub mod aggregate;
pub mod closure;
pub mod expr;
pub mod literal;
pub mod types;

pub use aggregate::{Aggregate, AggregateFunction, AggregateKind};
pub use closure::{Closure, Param};
pub use expr::{BinaryOp, Expr, ExprKind, UnaryOp};
pub use literal::Literal;
pub use types::{IntWidth, Type};
