use serde::{Deserialize, Serialize};

/// How a routing decision was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingMethod {
    /// The task named its target worker.
    Explicit,
    /// A deterministic rule matched.
    Rule,
    /// The model picked from the registry catalog.
    Model,
}

impl std::fmt::Display for RoutingMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoutingMethod::Explicit => write!(f, "explicit"),
            RoutingMethod::Rule => write!(f, "rule"),
            RoutingMethod::Model => write!(f, "model"),
        }
    }
}

/// Where a task goes, and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    /// Selected worker.
    pub worker_id: String,
    /// Human-readable explanation.
    pub reasoning: String,
    /// Confidence in `[0, 1]`; 1.0 for explicit and rule routes.
    pub confidence: f32,
    /// Which stage decided.
    pub method: RoutingMethod,
}
