/// Anthropic Messages API.
pub mod anthropic;
/// OpenAI-compatible chat completions.
pub mod openai;

use crate::types::{ChatMessage, Completion};
use async_trait::async_trait;
use switchboard_core::{LlmProvider, ModelConfig, SwitchboardError, SwitchboardResult};

pub use anthropic::AnthropicBackend;
pub use openai::OpenAiCompatibleBackend;

/// One concrete model endpoint.
///
/// To add a provider: implement this trait in a new module, add the variant
/// to `LlmProvider` and wire it in [`backend_for`].
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Configured model id.
    fn model_id(&self) -> &str;

    /// Send one chat call.
    async fn chat(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: Option<u32>,
    ) -> SwitchboardResult<Completion>;
}

/// Build the backend for a configured model.
pub fn backend_for(config: ModelConfig) -> Box<dyn ChatBackend> {
    match config.provider {
        LlmProvider::Claude => Box::new(AnthropicBackend::new(config)),
        LlmProvider::OpenAi | LlmProvider::OpenRouter | LlmProvider::Groq => {
            Box::new(OpenAiCompatibleBackend::new(config))
        }
    }
}

/// Map a transport-level reqwest failure onto the error taxonomy so that
/// timeouts and connection failures count as transient.
pub(crate) fn map_reqwest_error(e: reqwest::Error) -> SwitchboardError {
    if e.is_timeout() {
        SwitchboardError::Timeout(e.to_string())
    } else if e.is_connect() {
        SwitchboardError::Transport(format!("connection failed: {e}"))
    } else {
        SwitchboardError::Http(e.to_string())
    }
}

/// Read a provider reply. Non-success statuses are checked before the body
/// is parsed, so an HTML error page from a gateway still surfaces as an
/// [`SwitchboardError::Http`] carrying the status code.
pub(crate) async fn read_reply(
    resp: reqwest::Response,
    api: &str,
) -> SwitchboardResult<serde_json::Value> {
    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        let snippet: String = text.chars().take(200).collect();
        return Err(SwitchboardError::Http(format!("{api} API error {status}: {snippet}")));
    }
    resp.json()
        .await
        .map_err(|e| SwitchboardError::Completion(format!("{api} reply is not JSON: {e}")))
}
