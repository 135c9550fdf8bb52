use std::collections::HashMap;
use switchboard_core::{HandoffConfig, Strictness};

/// Handoff type to strictness lookup. Unknown types resolve to
/// [`Strictness::Strict`].
#[derive(Debug, Clone, Default)]
pub struct StrictnessTable {
    table: HashMap<String, Strictness>,
}

impl StrictnessTable {
    /// Table with explicit entries.
    pub fn new(table: HashMap<String, Strictness>) -> Self {
        Self { table }
    }

    /// Table from `[handoff.strictness]`.
    pub fn from_config(config: &HandoffConfig) -> Self {
        Self::new(config.strictness.clone())
    }

    /// Strictness for a handoff type; unlisted types are strict.
    pub fn resolve(&self, handoff_type: &str) -> Strictness {
        self.table
            .get(handoff_type)
            .copied()
            .unwrap_or(Strictness::Strict)
    }

    /// Override one type.
    pub fn set(&mut self, handoff_type: impl Into<String>, strictness: Strictness) {
        self.table.insert(handoff_type.into(), strictness);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_config() {
        let table = StrictnessTable::from_config(&HandoffConfig::default());
        assert_eq!(table.resolve("critical_business_data"), Strictness::Strict);
        assert_eq!(table.resolve("status_update"), Strictness::Lenient);
    }

    #[test]
    fn test_unknown_type_is_strict() {
        let mut table = StrictnessTable::default();
        for t in ["", "status", "STATUS_UPDATE", "anything_else"] {
            assert_eq!(table.resolve(t), Strictness::Strict);
        }
        table.set("heartbeat", Strictness::Lenient);
        assert_eq!(table.resolve("heartbeat"), Strictness::Lenient);
    }
}
