//! Lowers typed relational plans into incremental dataflow circuits
//!
//! A [`Circuit`] handed over by the SQL frontend describes queries with
//! batch semantics. [`Compiler::compile`] simplifies the embedded
//! expressions, narrows rows to the fields joins actually read, expands
//! non-linear operators into delta/integral form, bounds the state kept by
//! joins and aggregates using declared lateness and watermarks and finally
//! fuses adjacent operators. The result only contains primitives the DBSP
//! runtime understands.

pub mod circuit;
pub mod config;
pub mod error;
pub mod eval;
pub mod ids;
pub mod ir;
pub mod passes;

#[cfg(test)]
mod tests;

pub use circuit::{Circuit, Operator, OperatorKind};
pub use config::CompilerConfig;
pub use error::{CompilerError, CompilerResult, Diagnostic, Diagnostics, ErrorReporter};
pub use ids::{OperatorId, OperatorIdGen};
pub use passes::{CompiledCircuit, Compiler};
