use serde::{Deserialize, Serialize};
use switchboard_core::TenantId;

/// Model tier. The fast tier serves routing and fact checks; the reasoning
/// tier serves decomposition and synthesis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    /// Cheap, low-latency models for routing and checks.
    Fast,
    /// Stronger models for planning and synthesis.
    Reasoning,
}

impl std::fmt::Display for ModelTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelTier::Fast => write!(f, "fast"),
            ModelTier::Reasoning => write!(f, "reasoning"),
        }
    }
}

/// Role of a chat message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    /// Instructions.
    System,
    /// Caller input.
    User,
    /// Model output.
    Assistant,
}

/// One chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Author role.
    pub role: ChatRole,
    /// Message text.
    pub content: String,
}

impl ChatMessage {
    /// System message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    /// User message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    /// Assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// One completion call.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    /// Conversation, system message first when present.
    pub messages: Vec<ChatMessage>,
    /// Tier whose chain serves the call.
    pub tier: ModelTier,
    /// Sampling temperature.
    pub temperature: f32,
    /// Overrides the model's configured output limit.
    pub max_tokens: Option<u32>,
    /// Tenant charged for admission control. `None` uses only the global limit.
    pub tenant_id: Option<TenantId>,
}

impl CompletionRequest {
    /// Request with temperature 0.2 and no token override.
    pub fn new(tier: ModelTier, messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            tier,
            temperature: 0.2,
            max_tokens: None,
            tenant_id: None,
        }
    }

    /// Set the temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Cap the output tokens.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Charge the call to `tenant`.
    pub fn for_tenant(mut self, tenant: &TenantId) -> Self {
        self.tenant_id = Some(tenant.clone());
        self
    }

    /// System prompt, if the first message is one.
    pub fn system_prompt(&self) -> Option<&str> {
        self.messages
            .iter()
            .find(|m| m.role == ChatRole::System)
            .map(|m| m.content.as_str())
    }
}

/// Text returned by a completion call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    /// Reply text.
    pub text: String,
    /// Model that actually answered (after any fallback).
    pub model: String,
}
