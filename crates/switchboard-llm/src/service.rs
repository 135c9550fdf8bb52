use crate::types::{Completion, CompletionRequest};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use switchboard_core::{SwitchboardError, SwitchboardResult};

/// LLM provider abstraction used by the router, the supervisor and the
/// handoff validator.
///
/// Calls are asynchronous and cancel-safe: dropping the future abandons the
/// request without affecting other in-flight calls.
#[async_trait]
pub trait CompletionService: Send + Sync {
    /// Run one completion.
    async fn complete(&self, request: CompletionRequest) -> SwitchboardResult<Completion>;
}

/// Locate the JSON object in a model reply. Tolerates code fences and
/// surrounding prose.
pub fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Run a completion and parse its reply as `T`.
pub async fn complete_json<T: DeserializeOwned>(
    service: &dyn CompletionService,
    request: CompletionRequest,
) -> SwitchboardResult<T> {
    let completion = service.complete(request).await?;
    let raw = extract_json(&completion.text).ok_or_else(|| {
        SwitchboardError::Completion(format!(
            "model '{}' returned no JSON object",
            completion.model
        ))
    })?;
    serde_json::from_str(raw).map_err(|e| {
        SwitchboardError::Completion(format!(
            "model '{}' returned malformed JSON: {e}",
            completion.model
        ))
    })
}
