//! TOML configuration for every component of the orchestration core.
//!
//! Every field has a serde default, so an empty file is a valid config.

use crate::error::{SwitchboardError, SwitchboardResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SwitchboardConfig {
    /// Event bus streams, retries and dead letters.
    #[serde(default)]
    pub bus: BusConfig,
    /// Working-context budgeting.
    #[serde(default)]
    pub context: ContextConfig,
    /// Handoff strictness table.
    #[serde(default)]
    pub handoff: HandoffConfig,
    /// Routing rules and decomposition.
    #[serde(default)]
    pub router: RouterConfig,
    /// Supervisor timeouts, synthesis and event stream.
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    /// Completion backends; disabled by default.
    #[serde(default)]
    pub llm: LlmConfig,
    /// Logging output.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl SwitchboardConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(raw: &str) -> SwitchboardResult<Self> {
        let config: SwitchboardConfig =
            toml::from_str(raw).map_err(|e| SwitchboardError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> SwitchboardResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            SwitchboardError::Config(format!(
                "failed to read {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Reject internally inconsistent values.
    pub fn validate(&self) -> SwitchboardResult<()> {
        self.context.validate()?;
        if self.bus.batch_size == 0 {
            return Err(SwitchboardError::Config("bus.batch_size must be > 0".into()));
        }
        if self.bus.retry.multiplier == 0 {
            return Err(SwitchboardError::Config(
                "bus.retry.multiplier must be > 0".into(),
            ));
        }
        if self.llm.enabled && self.llm.fast.is_empty() && self.llm.reasoning.is_empty() {
            return Err(SwitchboardError::Config(
                "llm is enabled but no model tier is configured".into(),
            ));
        }
        if self.llm.admission.max_concurrent == 0 || self.llm.admission.per_tenant == 0 {
            return Err(SwitchboardError::Config(
                "llm.admission limits must be > 0".into(),
            ));
        }
        Ok(())
    }
}

// --- Event bus ---

/// Retry / dead-letter policy for bus message handlers.
///
/// Delay for attempt `n` (0-based) is `base_delay_ms * multiplier^n`,
/// capped at `max_delay_ms`: 1s, 4s, 16s with the defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusRetryPolicy {
    /// Retries before a message is dead-lettered.
    #[serde(default = "default_bus_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry.
    #[serde(default = "default_bus_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Growth factor between consecutive retry delays.
    #[serde(default = "default_bus_multiplier")]
    pub multiplier: u64,
    /// Upper bound on any single retry delay.
    #[serde(default = "default_bus_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl BusRetryPolicy {
    /// Backoff before re-publishing after the given (0-based) failed attempt.
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        self.base_delay_ms
            .saturating_mul(self.multiplier.saturating_pow(attempt))
            .min(self.max_delay_ms)
    }
}

impl Default for BusRetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_bus_max_retries(),
            base_delay_ms: default_bus_base_delay_ms(),
            multiplier: default_bus_multiplier(),
            max_delay_ms: default_bus_max_delay_ms(),
        }
    }
}

fn default_bus_max_retries() -> u32 {
    3
}
fn default_bus_base_delay_ms() -> u64 {
    1_000
}
fn default_bus_multiplier() -> u64 {
    4
}
fn default_bus_max_delay_ms() -> u64 {
    60_000
}

/// Event bus settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Handler failure policy.
    #[serde(default)]
    pub retry: BusRetryPolicy,
    /// Approximate cap on hot stream length; `None` disables trimming.
    #[serde(default = "default_stream_max_len")]
    pub stream_max_len: Option<usize>,
    /// How long a subscribe call waits for new messages.
    #[serde(default = "default_block_timeout_ms")]
    pub block_timeout_ms: u64,
    /// Maximum messages returned by one subscribe call.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Pending messages idle longer than this are reclaimed by live consumers.
    #[serde(default = "default_reclaim_idle_ms")]
    pub reclaim_idle_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            retry: BusRetryPolicy::default(),
            stream_max_len: default_stream_max_len(),
            block_timeout_ms: default_block_timeout_ms(),
            batch_size: default_batch_size(),
            reclaim_idle_ms: default_reclaim_idle_ms(),
        }
    }
}

fn default_stream_max_len() -> Option<usize> {
    Some(10_000)
}
fn default_block_timeout_ms() -> u64 {
    5_000
}
fn default_batch_size() -> usize {
    10
}
fn default_reclaim_idle_ms() -> u64 {
    60_000
}

// --- Context manager ---

/// Tokenizer used for budget accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenEncoding {
    /// OpenAI `cl100k_base`, also a fair estimate for Claude models.
    Cl100kBase,
    /// OpenAI `o200k_base` (GPT-4o family).
    O200kBase,
    /// `chars / 4` approximation; for tests and unknown model families.
    Heuristic,
}

/// Fractions of the token ceiling given to each context section.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BudgetSplit {
    /// System instructions.
    #[serde(default = "default_split_system")]
    pub system: f32,
    /// Recent session turns.
    #[serde(default = "default_split_history")]
    pub history: f32,
    /// Long-term memory hits.
    #[serde(default = "default_split_memory")]
    pub memory: f32,
    /// Task text plus response headroom.
    #[serde(default = "default_split_headroom")]
    pub headroom: f32,
}

impl Default for BudgetSplit {
    fn default() -> Self {
        Self {
            system: default_split_system(),
            history: default_split_history(),
            memory: default_split_memory(),
            headroom: default_split_headroom(),
        }
    }
}

fn default_split_system() -> f32 {
    0.15
}
fn default_split_history() -> f32 {
    0.35
}
fn default_split_memory() -> f32 {
    0.35
}
fn default_split_headroom() -> f32 {
    0.15
}

/// Working-context compilation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Hard ceiling on the compiled working context.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    /// How the ceiling is divided between sections.
    #[serde(default)]
    pub split: BudgetSplit,
    /// Tokenizer used for counting.
    #[serde(default = "default_encoding")]
    pub encoding: TokenEncoding,
    /// How many recent turns to fetch before budgeting.
    #[serde(default = "default_recent_turns")]
    pub recent_turns: usize,
    /// How many memory hits to fetch before budgeting.
    #[serde(default = "default_memory_top_k")]
    pub memory_top_k: usize,
    /// Hits below this similarity are ignored.
    #[serde(default)]
    pub min_relevance: f32,
    /// Preamble placed at the top of every working context.
    #[serde(default = "default_system_instructions")]
    pub system_instructions: String,
}

impl ContextConfig {
    /// Reject a zero ceiling and split fractions outside `[0, 1]` or summing past 1.
    pub fn validate(&self) -> SwitchboardResult<()> {
        if self.max_tokens == 0 {
            return Err(SwitchboardError::Config("context.max_tokens must be > 0".into()));
        }
        let s = self.split;
        for (name, v) in [
            ("system", s.system),
            ("history", s.history),
            ("memory", s.memory),
            ("headroom", s.headroom),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(SwitchboardError::Config(format!(
                    "context.split.{name} must be within [0, 1], got {v}"
                )));
            }
        }
        let total = s.system + s.history + s.memory + s.headroom;
        if (total - 1.0).abs() > 0.001 {
            return Err(SwitchboardError::Config(format!(
                "context.split must sum to 1.0, got {total}"
            )));
        }
        Ok(())
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            split: BudgetSplit::default(),
            encoding: default_encoding(),
            recent_turns: default_recent_turns(),
            memory_top_k: default_memory_top_k(),
            min_relevance: 0.0,
            system_instructions: default_system_instructions(),
        }
    }
}

fn default_max_tokens() -> usize {
    8_000
}
fn default_encoding() -> TokenEncoding {
    TokenEncoding::Cl100kBase
}
fn default_recent_turns() -> usize {
    50
}
fn default_memory_top_k() -> usize {
    20
}
fn default_system_instructions() -> String {
    "You are one worker in a coordinated team. Only state facts that are present \
     in the conversation, the known facts, or the task. Say so when information is missing."
        .to_string()
}

// --- Handoff protocol ---

/// Validation rigor applied to a handoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strictness {
    /// Structural plus semantic (model-assisted fact check).
    Strict,
    /// Structural only.
    Lenient,
}

impl std::fmt::Display for Strictness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strictness::Strict => write!(f, "strict"),
            Strictness::Lenient => write!(f, "lenient"),
        }
    }
}

/// Handoff validation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffConfig {
    /// Handoff type -> strictness. Unlisted types resolve to strict.
    #[serde(default = "default_strictness_table")]
    pub strictness: HashMap<String, Strictness>,
    /// Upper bound on one fact-check call.
    #[serde(default = "default_semantic_timeout_ms")]
    pub semantic_timeout_ms: u64,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            strictness: default_strictness_table(),
            semantic_timeout_ms: default_semantic_timeout_ms(),
        }
    }
}

fn default_strictness_table() -> HashMap<String, Strictness> {
    HashMap::from([
        ("critical_business_data".to_string(), Strictness::Strict),
        ("status_update".to_string(), Strictness::Lenient),
    ])
}
fn default_semantic_timeout_ms() -> u64 {
    15_000
}

// --- Router ---

/// A deterministic routing rule expressed in config.
///
/// A rule matches when every condition that is set matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Label used in logs and routing decisions.
    #[serde(default)]
    pub name: Option<String>,
    /// Exact task type to match.
    #[serde(default)]
    pub task_type: Option<String>,
    /// Task parameter to compare against `equals`.
    #[serde(default)]
    pub param: Option<String>,
    /// Value the parameter must equal; any value when unset.
    #[serde(default)]
    pub equals: Option<serde_json::Value>,
    /// Worker chosen when the rule matches.
    pub worker_id: String,
}

/// Router and decomposer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Checked in order; the first match wins.
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
    /// Upper bound on one model-assisted routing or split call.
    #[serde(default = "default_model_timeout_ms")]
    pub model_timeout_ms: u64,
    /// Verbs that mark an independent action clause in free text.
    #[serde(default = "default_action_verbs")]
    pub action_verbs: Vec<String>,
    /// Ask the reasoning tier to split free text once signals fire.
    #[serde(default)]
    pub model_assisted_decomposition: bool,
    /// Larger splits are not decomposed.
    #[serde(default = "default_max_subtasks")]
    pub max_subtasks: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            model_timeout_ms: default_model_timeout_ms(),
            action_verbs: default_action_verbs(),
            model_assisted_decomposition: false,
            max_subtasks: default_max_subtasks(),
        }
    }
}

fn default_model_timeout_ms() -> u64 {
    10_000
}
fn default_max_subtasks() -> usize {
    8
}
fn default_action_verbs() -> Vec<String> {
    [
        "send", "email", "schedule", "book", "draft", "write", "create", "update", "log",
        "notify", "call", "research", "summarize", "prepare", "generate", "analyze", "review",
        "follow", "remind", "share",
    ]
    .iter()
    .map(|s| (*s).to_string())
    .collect()
}

// --- Supervisor ---

/// Supervisor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Per-attempt limit on a worker execution.
    #[serde(default = "default_worker_timeout_ms")]
    pub worker_timeout_ms: u64,
    /// Merge multi-subtask results with the reasoning tier.
    #[serde(default = "default_true")]
    pub model_synthesis: bool,
    /// Task type -> handoff type used when validating worker results.
    /// Task types not listed hand off under their own name.
    #[serde(default)]
    pub result_handoff_types: HashMap<String, String>,
    /// Logical stream for lifecycle events (tenant-prefixed at publish).
    #[serde(default = "default_events_stream")]
    pub events_stream: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            worker_timeout_ms: default_worker_timeout_ms(),
            model_synthesis: true,
            result_handoff_types: HashMap::new(),
            events_stream: default_events_stream(),
        }
    }
}

fn default_worker_timeout_ms() -> u64 {
    120_000
}
fn default_true() -> bool {
    true
}
fn default_events_stream() -> String {
    "handoffs".to_string()
}

// --- Completion service ---

/// Supported completion providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    /// Anthropic Messages API.
    Claude,
    /// OpenAI chat completions.
    OpenAi,
    /// OpenRouter, OpenAI-compatible API.
    OpenRouter,
    /// Groq cloud inference, OpenAI-compatible API.
    Groq,
}

/// One model endpoint in a tier's fallback chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Which API dialect to speak.
    pub provider: LlmProvider,
    /// Provider model name sent with every request.
    pub model_id: String,
    /// Credential sent in the provider's auth header.
    #[serde(default)]
    pub api_key: String,
    /// Overrides the provider's default endpoint.
    #[serde(default)]
    pub api_base_url: Option<String>,
    /// Default response limit when a request sets none.
    #[serde(default = "default_model_max_tokens")]
    pub max_tokens: u32,
}

fn default_model_max_tokens() -> u32 {
    2048
}

impl ModelConfig {
    /// Configured base URL, or the provider default.
    pub fn base_url(&self) -> &str {
        if let Some(url) = &self.api_base_url {
            url
        } else {
            match self.provider {
                LlmProvider::Claude => "https://api.anthropic.com",
                LlmProvider::OpenAi => "https://api.openai.com",
                LlmProvider::OpenRouter => "https://openrouter.ai/api",
                LlmProvider::Groq => "https://api.groq.com/openai",
            }
        }
    }
}

/// Retry behaviour for transient completion errors, per backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries per backend before moving to the next one.
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub backoff_base_ms: u64,
    /// Maximum delay in milliseconds (cap for exponential backoff).
    pub backoff_max_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_base_ms: 500,
            backoff_max_ms: 10_000,
        }
    }
}

/// Limits on in-flight completion calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Process-wide cap shared by all tenants.
    #[serde(default = "default_admission_global")]
    pub max_concurrent: usize,
    /// Cap for any single tenant.
    #[serde(default = "default_admission_tenant")]
    pub per_tenant: usize,
    /// How long a call may wait for admission before failing.
    #[serde(default = "default_admission_wait_ms")]
    pub max_wait_ms: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_admission_global(),
            per_tenant: default_admission_tenant(),
            max_wait_ms: default_admission_wait_ms(),
        }
    }
}

fn default_admission_global() -> usize {
    16
}
fn default_admission_tenant() -> usize {
    4
}
fn default_admission_wait_ms() -> u64 {
    30_000
}

/// Completion service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Build the completion service at all.
    #[serde(default)]
    pub enabled: bool,
    /// Fallback chain for the fast tier, tried in order.
    #[serde(default)]
    pub fast: Vec<ModelConfig>,
    /// Fallback chain for the reasoning tier, tried in order.
    #[serde(default)]
    pub reasoning: Vec<ModelConfig>,
    /// Transient-error retries per backend.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Per-call timeout for a single backend attempt.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Per-tenant and global concurrency caps.
    #[serde(default)]
    pub admission: AdmissionConfig,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            fast: Vec::new(),
            reasoning: Vec::new(),
            retry: RetryPolicy::default(),
            request_timeout_ms: default_request_timeout_ms(),
            admission: AdmissionConfig::default(),
        }
    }
}

fn default_request_timeout_ms() -> u64 {
    60_000
}

// --- Telemetry ---

/// Tracing subscriber settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// `EnvFilter` directive; `RUST_LOG` takes precedence when set.
    #[serde(default = "default_filter")]
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            json: false,
        }
    }
}

fn default_filter() -> String {
    "info".to_string()
}
