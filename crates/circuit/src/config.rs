use serde::{Deserialize, Serialize};

/// Knobs controlling which passes run and how hard the optimizer works
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    /// Whether or not embedded expressions are simplified
    pub simplify: bool,
    /// Whether or not join inputs are narrowed to the fields their closures
    /// actually read
    pub trim_unused_fields: bool,
    /// The nesting depth up to which unused fields are eliminated
    pub unused_field_depth: usize,
    /// Whether or not waterlines and trace limiters are inserted for
    /// sources declaring lateness or watermarks
    pub insert_limiters: bool,
    /// The maximum number of times the local rewrite rules are applied
    /// to the whole circuit while looking for a fixed point
    pub optimizer_pass_budget: usize,
    /// When set, maps are only fused into joins when they are pure
    /// projections
    pub only_projections: bool,
}

impl CompilerConfig {
    pub const fn new() -> Self {
        Self {
            simplify: true,
            trim_unused_fields: true,
            unused_field_depth: 1,
            insert_limiters: true,
            optimizer_pass_budget: 16,
            only_projections: false,
        }
    }

    pub const fn with_simplify(mut self, simplify: bool) -> Self {
        self.simplify = simplify;
        self
    }

    pub const fn with_trim_unused_fields(mut self, trim_unused_fields: bool) -> Self {
        self.trim_unused_fields = trim_unused_fields;
        self
    }

    pub const fn with_unused_field_depth(mut self, unused_field_depth: usize) -> Self {
        self.unused_field_depth = unused_field_depth;
        self
    }

    pub const fn with_insert_limiters(mut self, insert_limiters: bool) -> Self {
        self.insert_limiters = insert_limiters;
        self
    }

    pub const fn with_optimizer_pass_budget(mut self, optimizer_pass_budget: usize) -> Self {
        self.optimizer_pass_budget = optimizer_pass_budget;
        self
    }

    pub const fn with_only_projections(mut self, only_projections: bool) -> Self {
        self.only_projections = only_projections;
        self
    }

    /// Runs the expansion and nothing else, useful for checking that the
    /// incremental circuit alone is correct
    pub const fn unoptimized() -> Self {
        Self {
            simplify: false,
            trim_unused_fields: false,
            unused_field_depth: 1,
            insert_limiters: false,
            optimizer_pass_budget: 0,
            only_projections: false,
        }
    }
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::CompilerConfig;

    #[test]
    fn missing_fields_use_defaults() {
        let config: CompilerConfig =
            serde_json::from_str(r#"{ "optimizer_pass_budget": 3 }"#).unwrap();
        assert_eq!(config, CompilerConfig::new().with_optimizer_pass_budget(3));
    }
}
