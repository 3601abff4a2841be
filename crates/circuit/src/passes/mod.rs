pub mod expand;
pub mod limiter;
pub mod monotone;
pub mod optimize;
pub mod simplify;
pub mod unused_fields;

pub use expand::{expand, Expansion, ExpansionMap};
pub use limiter::{annotated_tables, insert_limiters};
pub use monotone::{analyze, MonotoneType, Monotonicity};
pub use optimize::optimize;
pub use simplify::{simplify_circuit, Simplifier};
pub use unused_fields::{trim_unused_fields, FieldUseMap};

use crate::{
    circuit::Circuit,
    config::CompilerConfig,
    error::{CompilerResult, Diagnostics},
};
use serde::{Deserialize, Serialize};

/// Runs the whole pipeline over circuits handed over by the frontend
#[derive(Debug, Clone, Default)]
pub struct Compiler {
    config: CompilerConfig,
}

impl Compiler {
    pub const fn new() -> Self {
        Self {
            config: CompilerConfig::new(),
        }
    }

    pub const fn with_config(config: CompilerConfig) -> Self {
        Self { config }
    }

    pub const fn config(&self) -> &CompilerConfig {
        &self.config
    }

    /// Lowers `circuit` into a circuit of stream primitives
    ///
    /// Warnings raised along the way are collected into the result, any
    /// error aborts the compilation
    #[tracing::instrument(skip_all)]
    pub fn compile(&self, circuit: &Circuit) -> CompilerResult<CompiledCircuit> {
        circuit.validate()?;
        let mut diagnostics = Diagnostics::new();

        let mut circuit = if self.config.simplify {
            simplify_circuit(circuit, &mut diagnostics)?
        } else {
            circuit.clone()
        };

        if self.config.trim_unused_fields {
            circuit = trim_unused_fields(&circuit, self.config.unused_field_depth)?;
        }

        if self.config.insert_limiters && !annotated_tables(&circuit).is_empty() {
            // The analysis runs over an expanded copy, the limiters are
            // inserted into the batch circuit and expanded along with it
            let (expanded, expansions) = expand(&circuit)?;
            let analysis = analyze(&expanded, &expansions)?;
            circuit = insert_limiters(&circuit, &expansions, &analysis)?;
        }

        let (expanded, expansion) = expand(&circuit)?;
        let circuit = optimize(&expanded, &self.config, &mut diagnostics)?;
        circuit.validate()?;
        circuit.check_primitive()?;

        diagnostics.dedup();
        tracing::debug!(
            "compiled circuit with {} operators and {} diagnostics",
            circuit.len(),
            diagnostics.len(),
        );

        Ok(CompiledCircuit {
            circuit,
            expansion,
            diagnostics,
        })
    }
}

/// The result of a successful compilation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledCircuit {
    circuit: Circuit,
    expansion: ExpansionMap,
    diagnostics: Diagnostics,
}

impl CompiledCircuit {
    pub const fn circuit(&self) -> &Circuit {
        &self.circuit
    }

    /// Where every operator of the limited batch circuit went during
    /// expansion, operators removed by the optimizer are still listed
    pub const fn expansion(&self) -> &ExpansionMap {
        &self.expansion
    }

    pub const fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn into_circuit(self) -> Circuit {
        self.circuit
    }
}
