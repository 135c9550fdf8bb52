//! Completion service for Switchboard.
//!
//! Two model tiers ([`ModelTier::Fast`] and [`ModelTier::Reasoning`]), each
//! an ordered fallback chain of HTTP backends ([`TieredCompletion`]), behind
//! process-wide and per-tenant admission control ([`AdmittedCompletion`]).
//! Everything else in the workspace talks to the [`CompletionService`] trait.

/// Tenant-fair admission control.
pub mod admission;
/// Provider HTTP backends.
pub mod backends;
/// The completion service trait and JSON helpers.
pub mod service;
/// Tiered fallback chains.
pub mod tiered;
/// Request and reply types.
pub mod types;

use std::sync::Arc;
use switchboard_core::LlmConfig;

pub use admission::{AdmissionController, AdmissionPermit, AdmittedCompletion};
pub use backends::{backend_for, AnthropicBackend, ChatBackend, OpenAiCompatibleBackend};
pub use service::{complete_json, extract_json, CompletionService};
pub use tiered::TieredCompletion;
pub use types::{ChatMessage, ChatRole, Completion, CompletionRequest, ModelTier};

/// Build the configured completion service, or `None` when the LLM layer is
/// disabled (model-assisted paths then degrade as if the service were down).
pub fn completion_from_config(config: &LlmConfig) -> Option<Arc<dyn CompletionService>> {
    if !config.enabled {
        return None;
    }
    let tiered: Arc<dyn CompletionService> = Arc::new(TieredCompletion::from_config(config));
    let admission = Arc::new(AdmissionController::new(&config.admission));
    Some(Arc::new(AdmittedCompletion::new(tiered, admission)))
}
