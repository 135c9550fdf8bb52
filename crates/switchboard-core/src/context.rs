use crate::tenant::TenantId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Author of a session turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    /// The requesting human or system.
    User,
    /// The supervisor's final response.
    Assistant,
    /// Output attributed to a specific worker.
    Worker,
    /// Instructions injected by the host.
    System,
}

impl std::fmt::Display for TurnRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TurnRole::User => write!(f, "user"),
            TurnRole::Assistant => write!(f, "assistant"),
            TurnRole::Worker => write!(f, "worker"),
            TurnRole::System => write!(f, "system"),
        }
    }
}

/// One turn of conversation history held in session state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionTurn {
    /// Unique turn id.
    pub id: Uuid,
    /// Who produced the turn.
    pub role: TurnRole,
    /// Turn text.
    pub content: String,
    /// Producing worker, for [`TurnRole::Worker`] turns.
    #[serde(default)]
    pub worker_id: Option<String>,
    /// When the turn was recorded.
    pub timestamp: DateTime<Utc>,
}

impl SessionTurn {
    /// A turn stamped with the current time.
    pub fn new(role: TurnRole, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content: content.into(),
            worker_id: None,
            timestamp: Utc::now(),
        }
    }

    /// A user turn.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(TurnRole::User, content)
    }

    /// An assistant turn.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(TurnRole::Assistant, content)
    }

    /// A turn attributed to a worker.
    pub fn from_worker(worker_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut turn = Self::new(TurnRole::Worker, content);
        turn.worker_id = Some(worker_id.into());
        turn
    }

    /// Render as a single history line.
    pub fn render(&self) -> String {
        match &self.worker_id {
            Some(w) => format!("[{}:{}] {}", self.role, w, self.content),
            None => format!("[{}] {}", self.role, self.content),
        }
    }
}

/// A long-term memory entry selected for a working context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryHit {
    /// Id of the stored memory entry.
    pub id: Uuid,
    /// What the fact is about.
    pub subject: String,
    /// The fact itself.
    pub content: String,
    /// Cosine similarity against the task query.
    pub relevance: f32,
}

impl MemoryHit {
    /// Render as a bullet line.
    pub fn render(&self) -> String {
        format!("- ({}) {}", self.subject, self.content)
    }
}

/// Token accounting for one section of a compiled context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionUsage {
    /// Tokens the section was allowed.
    pub allocated: usize,
    /// Tokens the section actually took.
    pub used: usize,
}

/// Per-section token usage of a compiled context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextBudgetReport {
    /// System instructions.
    pub system: SectionUsage,
    /// Session history.
    pub history: SectionUsage,
    /// Memory hits.
    pub memory: SectionUsage,
    /// Task text.
    pub task: SectionUsage,
    /// Fetched turns left out to fit the budget.
    pub dropped_turns: usize,
    /// Fetched memories left out to fit the budget.
    pub dropped_memories: usize,
}

/// The ephemeral, token-budgeted context compiled for one invocation.
///
/// Never persisted. `token_count` is the count of [`WorkingContext::render`]
/// and never exceeds `max_tokens`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkingContext {
    /// Tenant the context was compiled for.
    pub tenant_id: TenantId,
    /// Session the history came from, if any.
    pub session_id: Option<String>,
    /// Possibly truncated system preamble.
    pub system_instructions: String,
    /// Session history, oldest first.
    pub history: Vec<SessionTurn>,
    /// Memory hits, most relevant first.
    pub memories: Vec<MemoryHit>,
    /// The task as the worker should read it.
    pub task_text: String,
    /// Token count of the rendered context.
    pub token_count: usize,
    /// The ceiling it was compiled under.
    pub max_tokens: usize,
    /// Per-section accounting.
    pub report: ContextBudgetReport,
}

impl WorkingContext {
    /// An empty context for a tenant (used when a caller has nothing to compile).
    pub fn empty(tenant_id: TenantId, max_tokens: usize) -> Self {
        Self {
            tenant_id,
            session_id: None,
            system_instructions: String::new(),
            history: Vec::new(),
            memories: Vec::new(),
            task_text: String::new(),
            token_count: 0,
            max_tokens,
            report: ContextBudgetReport::default(),
        }
    }

    /// Render the prompt text. Empty sections are omitted.
    pub fn render(&self) -> String {
        let mut sections: Vec<String> = Vec::new();
        if !self.system_instructions.is_empty() {
            sections.push(format!("## Instructions\n{}", self.system_instructions));
        }
        if !self.history.is_empty() {
            let lines: Vec<String> = self.history.iter().map(SessionTurn::render).collect();
            sections.push(format!("## Conversation\n{}", lines.join("\n")));
        }
        if !self.memories.is_empty() {
            let lines: Vec<String> = self.memories.iter().map(MemoryHit::render).collect();
            sections.push(format!("## Known facts\n{}", lines.join("\n")));
        }
        if !self.task_text.is_empty() {
            sections.push(format!("## Task\n{}", self.task_text));
        }
        sections.join("\n\n")
    }

    /// Source texts a semantic handoff check may cite as evidence.
    pub fn evidence(&self) -> Vec<String> {
        let mut out: Vec<String> = self.history.iter().map(|t| t.content.clone()).collect();
        out.extend(self.memories.iter().map(|m| m.content.clone()));
        if !self.task_text.is_empty() {
            out.push(self.task_text.clone());
        }
        out
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_render_omits_empty_sections() {
        let mut ctx = WorkingContext::empty(TenantId::new("t1").unwrap(), 100);
        ctx.task_text = "send a status email".into();
        let text = ctx.render();
        assert!(text.starts_with("## Task"));
        assert!(!text.contains("## Conversation"));
    }

    #[test]
    fn test_render_orders_sections() {
        let mut ctx = WorkingContext::empty(TenantId::new("t1").unwrap(), 100);
        ctx.system_instructions = "be brief".into();
        ctx.history.push(SessionTurn::user("hello"));
        ctx.memories.push(MemoryHit {
            id: Uuid::new_v4(),
            subject: "acme".into(),
            content: "Acme renews in March".into(),
            relevance: 0.9,
        });
        ctx.task_text = "draft".into();
        let text = ctx.render();
        let i = text.find("## Instructions").unwrap();
        let c = text.find("## Conversation").unwrap();
        let k = text.find("## Known facts").unwrap();
        let t = text.find("## Task").unwrap();
        assert!(i < c && c < k && k < t);
    }

    #[test]
    fn test_worker_turn_render() {
        let turn = SessionTurn::from_worker("crm", "updated deal stage");
        assert_eq!(turn.render(), "[worker:crm] updated deal stage");
    }

    #[test]
    fn test_evidence_collects_all_sources() {
        let mut ctx = WorkingContext::empty(TenantId::new("t1").unwrap(), 100);
        ctx.history.push(SessionTurn::user("budget is 10k"));
        ctx.task_text = "summarize".into();
        assert_eq!(ctx.evidence(), vec!["budget is 10k".to_string(), "summarize".to_string()]);
    }
}
