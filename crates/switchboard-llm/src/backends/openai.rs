use super::{map_reqwest_error, read_reply, ChatBackend};
use crate::types::{ChatMessage, ChatRole, Completion};
use async_trait::async_trait;
use switchboard_core::{LlmProvider, ModelConfig, SwitchboardError, SwitchboardResult};

/// OpenAI-compatible chat completions backend.
///
/// Works with OpenAI, OpenRouter, Groq and any other provider exposing
/// `/v1/chat/completions`.
pub struct OpenAiCompatibleBackend {
    config: ModelConfig,
    http: reqwest::Client,
}

impl OpenAiCompatibleBackend {
    /// Backend for one configured model.
    pub fn new(config: ModelConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    fn build_messages(&self, messages: &[ChatMessage]) -> Vec<serde_json::Value> {
        messages
            .iter()
            .map(|m| {
                serde_json::json!({
                    "role": match m.role {
                        ChatRole::System => "system",
                        ChatRole::User => "user",
                        ChatRole::Assistant => "assistant",
                    },
                    "content": m.content,
                })
            })
            .collect()
    }

    fn add_provider_headers(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let request = request
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("Content-Type", "application/json");

        // OpenRouter requires attribution headers
        if matches!(self.config.provider, LlmProvider::OpenRouter) {
            request.header("X-Title", "Switchboard")
        } else {
            request
        }
    }
}

#[async_trait]
impl ChatBackend for OpenAiCompatibleBackend {
    fn model_id(&self) -> &str {
        &self.config.model_id
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: Option<u32>,
    ) -> SwitchboardResult<Completion> {
        let url = format!("{}/v1/chat/completions", self.config.base_url());
        let body = serde_json::json!({
            "model": self.config.model_id,
            "max_tokens": max_tokens.unwrap_or(self.config.max_tokens),
            "temperature": temperature,
            "messages": self.build_messages(messages),
        });

        let resp = self
            .add_provider_headers(self.http.post(&url))
            .json(&body)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let resp_body = read_reply(resp, "OpenAI-compatible").await?;
        parse_openai_response(&resp_body, &self.config.model_id)
    }
}

/// Extract the reply text and model from a chat-completions body.
pub fn parse_openai_response(
    body: &serde_json::Value,
    fallback_model: &str,
) -> SwitchboardResult<Completion> {
    let text = body["choices"][0]["message"]["content"]
        .as_str()
        .ok_or_else(|| {
            SwitchboardError::Completion("missing choices[0].message.content in response".into())
        })?;
    Ok(Completion {
        text: text.to_string(),
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
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(base: &str) -> ModelConfig {
        ModelConfig {
            provider: LlmProvider::OpenAi,
            model_id: "gpt-4o-mini".into(),
            api_key: "sk-test".into(),
            api_base_url: Some(base.to_string()),
            max_tokens: 256,
        }
    }

    #[test]
    fn test_parse_response() {
        let body = serde_json::json!({
            "model": "gpt-4o-mini-2024",
            "choices": [{"message": {"role": "assistant", "content": "hi"}, "finish_reason": "stop"}]
        });
        let c = parse_openai_response(&body, "x").unwrap();
        assert_eq!(c.text, "hi");
        assert_eq!(c.model, "gpt-4o-mini-2024");
        assert!(parse_openai_response(&serde_json::json!({}), "x").is_err());
    }

    #[tokio::test]
    async fn test_chat_against_mock_server() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("Authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "{\"worker_id\":\"mailer\"}"}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let backend = OpenAiCompatibleBackend::new(config(&server.uri()));
        let c = backend
            .chat(&[ChatMessage::system("route"), ChatMessage::user("email")], 0.0, None)
            .await
            .unwrap();
        assert_eq!(c.text, "{\"worker_id\":\"mailer\"}");
        assert_eq!(c.model, "gpt-4o-mini");
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_json(serde_json::json!({"error": "overloaded"})))
            .mount(&server)
            .await;
        let backend = OpenAiCompatibleBackend::new(config(&server.uri()));
        let err = backend.chat(&[ChatMessage::user("x")], 0.0, None).await.unwrap_err();
        assert!(err.is_transient());

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({"error": "bad"})))
            .mount(&server)
            .await;
        let backend = OpenAiCompatibleBackend::new(config(&server.uri()));
        let err = backend.chat(&[ChatMessage::user("x")], 0.0, None).await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_gateway_html_error_is_transient_http() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(502)
                    .set_body_raw("<html><body>Bad Gateway</body></html>", "text/html"),
            )
            .mount(&server)
            .await;
        let backend = OpenAiCompatibleBackend::new(config(&server.uri()));
        let err = backend.chat(&[ChatMessage::user("x")], 0.0, None).await.unwrap_err();
        match &err {
            SwitchboardError::Http(msg) => {
                assert!(msg.contains("502"));
                assert!(msg.contains("Bad Gateway"));
            }
            other => panic!("expected an HTTP error, got {other:?}"),
        }
        assert!(err.is_transient());
    }
}
