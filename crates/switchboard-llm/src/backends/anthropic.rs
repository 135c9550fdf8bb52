use super::{map_reqwest_error, read_reply, ChatBackend};
use crate::types::{ChatMessage, ChatRole, Completion};
use async_trait::async_trait;
use switchboard_core::{ModelConfig, SwitchboardError, SwitchboardResult};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic Messages API backend.
pub struct AnthropicBackend {
    config: ModelConfig,
    http: reqwest::Client,
}

impl AnthropicBackend {
    /// Backend for one configured model.
    pub fn new(config: ModelConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }
}

/// Split out system messages: the Messages API takes them as a top-level field.
fn split_system(messages: &[ChatMessage]) -> (Option<String>, Vec<serde_json::Value>) {
    let system: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == ChatRole::System)
        .map(|m| m.content.as_str())
        .collect();
    let turns = messages
        .iter()
        .filter(|m| m.role != ChatRole::System)
        .map(|m| {
            serde_json::json!({
                "role": if m.role == ChatRole::Assistant { "assistant" } else { "user" },
                "content": m.content,
            })
        })
        .collect();
    let system = (!system.is_empty()).then(|| system.join("\n\n"));
    (system, turns)
}

#[async_trait]
impl ChatBackend for AnthropicBackend {
    fn model_id(&self) -> &str {
        &self.config.model_id
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: Option<u32>,
    ) -> SwitchboardResult<Completion> {
        let url = format!("{}/v1/messages", self.config.base_url());
        let (system, turns) = split_system(messages);

        let mut body = serde_json::json!({
            "model": self.config.model_id,
            "max_tokens": max_tokens.unwrap_or(self.config.max_tokens),
            "temperature": temperature,
            "messages": turns,
        });
        if let Some(sys) = system {
            body["system"] = serde_json::json!(sys);
        }

        let resp = self
            .http
            .post(&url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let resp_body = read_reply(resp, "Anthropic").await?;
        parse_anthropic_response(&resp_body, &self.config.model_id)
    }
}

/// Join the text blocks of a Messages API body.
pub fn parse_anthropic_response(
    body: &serde_json::Value,
    fallback_model: &str,
) -> SwitchboardResult<Completion> {
    let content = body["content"].as_array().ok_or_else(|| {
        SwitchboardError::Completion("missing content in Anthropic response".into())
    })?;
    let text: Vec<&str> = content
        .iter()
        .filter(|block| block["type"].as_str() == Some("text"))
        .filter_map(|block| block["text"].as_str())
        .collect();
    Ok(Completion {
        text: text.join("\n"),
        model: body["model"]
            .as_str()
            .unwrap_or(fallback_model)
            .to_string(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use switchboard_core::LlmProvider;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_split_system() {
        let (system, turns) = split_system(&[
            ChatMessage::system("rules"),
            ChatMessage::user("q"),
            ChatMessage::assistant("a"),
        ]);
        assert_eq!(system.as_deref(), Some("rules"));
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[1]["role"], "assistant");
    }

    #[test]
    fn test_parse_joins_text_blocks() {
        let body = serde_json::json!({
            "content": [
                {"type": "text", "text": "one"},
                {"type": "tool_use", "id": "x", "name": "n", "input": {}},
                {"type": "text", "text": "two"}
            ]
        });
        let c = parse_anthropic_response(&body, "claude").unwrap();
        assert_eq!(c.text, "one\ntwo");
        assert_eq!(c.model, "claude");
    }

    #[tokio::test]
    async fn test_chat_sends_headers_and_system() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "ak-test"))
            .and(header("anthropic-version", ANTHROPIC_VERSION))
            .and(body_partial_json(serde_json::json!({"system": "be exact"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "model": "claude-sonnet",
                "content": [{"type": "text", "text": "merged"}],
                "stop_reason": "end_turn"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let backend = AnthropicBackend::new(ModelConfig {
            provider: LlmProvider::Claude,
            model_id: "claude-sonnet".into(),
            api_key: "ak-test".into(),
            api_base_url: Some(server.uri()),
            max_tokens: 512,
        });
        let c = backend
            .chat(&[ChatMessage::system("be exact"), ChatMessage::user("merge")], 0.0, None)
            .await
            .unwrap();
        assert_eq!(c.text, "merged");
    }

    #[tokio::test]
    async fn test_overloaded_html_error_is_transient_http() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_raw("<h1>Service Unavailable</h1>", "text/html"))
            .mount(&server)
            .await;
        let backend = AnthropicBackend::new(ModelConfig {
            provider: LlmProvider::Claude,
            model_id: "claude-sonnet".into(),
            api_key: "ak-test".into(),
            api_base_url: Some(server.uri()),
            max_tokens: 512,
        });
        let err = backend.chat(&[ChatMessage::user("merge")], 0.0, None).await.unwrap_err();
        assert!(matches!(err, SwitchboardError::Http(ref m) if m.contains("503")));
        assert!(err.is_transient());
    }
}
