use crate::embedding::{EmbeddingProvider, LocalEmbedding};
use crate::memory::{InMemoryMemoryStore, MemoryEntry, MemoryStore};
use crate::session::{InMemorySessionStore, SessionStore};
use crate::tokens::TokenCounter;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use switchboard_core::{
    ContextBudgetReport, ContextConfig, MemoryHit, SectionUsage, SessionTurn, SwitchboardError,
    SwitchboardResult, Task, TenantId, WorkingContext,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Token allocation for one compilation, derived from the configured split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionBudgets {
    /// Base instructions.
    pub system: usize,
    /// Recent session turns.
    pub history: usize,
    /// Retrieved memories.
    pub memory: usize,
    /// Task text plus response headroom: whatever the other sections leave.
    pub task: usize,
}

impl SectionBudgets {
    /// Split `max_tokens` by the configured ratios.
    pub fn from_config(config: &ContextConfig) -> Self {
        let max = config.max_tokens;
        // Basis points keep 0.35 * 8000 at exactly 2800.
        let share = |f: f32| {
            let bp = (f64::from(f) * 10_000.0).round() as usize;
            max.saturating_mul(bp) / 10_000
        };
        let system = share(config.split.system);
        let history = share(config.split.history);
        let memory = share(config.split.memory);
        Self {
            system,
            history,
            memory,
            task: max.saturating_sub(system + history + memory),
        }
    }
}

/// Text a task contributes to its own context and to memory search.
pub fn task_text(task: &Task) -> String {
    let head = if task.instruction.trim().is_empty() {
        task.task_type.clone()
    } else {
        task.instruction.clone()
    };
    if task.params.is_empty() {
        head
    } else {
        let params = serde_json::Value::Object(task.params.clone());
        format!("{head}\nParameters: {params}")
    }
}

type SessionKey = (TenantId, String);

/// The three-tier context manager.
///
/// Long-term memory and session history live behind their stores; the
/// working context is compiled per invocation and never persisted. Writes to
/// one session are serialised through a per-session lock.
pub struct ContextManager {
    config: ContextConfig,
    counter: TokenCounter,
    sessions: Arc<dyn SessionStore>,
    memory: Arc<dyn MemoryStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    session_locks: Mutex<HashMap<SessionKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl ContextManager {
    /// Manager over the given stores and embedder.
    pub fn new(
        config: ContextConfig,
        sessions: Arc<dyn SessionStore>,
        memory: Arc<dyn MemoryStore>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        let counter = TokenCounter::new(config.encoding);
        Self {
            config,
            counter,
            sessions,
            memory,
            embedder,
            session_locks: Mutex::new(HashMap::new()),
        }
    }

    /// A manager backed by in-memory stores and the local embedding.
    pub fn in_memory(config: ContextConfig) -> Self {
        Self::new(
            config,
            Arc::new(InMemorySessionStore::new()),
            Arc::new(InMemoryMemoryStore::new()),
            Arc::new(LocalEmbedding::default()),
        )
    }

    /// Active context configuration.
    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Token counter used for every budget check.
    pub fn counter(&self) -> &TokenCounter {
        &self.counter
    }

    fn session_lock(&self, tenant: &TenantId, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.session_locks
            .lock()
            .entry((tenant.clone(), session_id.to_string()))
            .or_default()
            .clone()
    }

    /// Compile the token-budgeted working context for one task.
    ///
    /// The rendered context never exceeds `max_tokens`. Over-budget history
    /// loses its oldest turns first and memory its least relevant entries
    /// first.
    pub async fn compile_working_context(
        &self,
        tenant: &TenantId,
        session_id: Option<&str>,
        task: &Task,
    ) -> SwitchboardResult<WorkingContext> {
        if &task.tenant_id != tenant {
            return Err(SwitchboardError::TenantMismatch {
                expected: tenant.to_string(),
                actual: task.tenant_id.to_string(),
            });
        }

        let budgets = SectionBudgets::from_config(&self.config);
        let query = task_text(task);
        let mut report = ContextBudgetReport::default();

        let system_instructions = self
            .counter
            .truncate(&self.config.system_instructions, budgets.system);
        let task_section = self.counter.truncate(&query, budgets.task);

        // History: newest first until the next turn no longer fits.
        let recent = match session_id {
            Some(sid) => {
                self.sessions
                    .read_recent(tenant, sid, self.config.recent_turns)
                    .await?
            }
            None => Vec::new(),
        };
        let mut kept_turns: Vec<SessionTurn> = Vec::new();
        let mut used = 0usize;
        for turn in recent.iter().rev() {
            let cost = self.counter.count(&turn.render()) + 1;
            if used + cost > budgets.history {
                break;
            }
            used += cost;
            kept_turns.push(turn.clone());
        }
        report.dropped_turns = recent.len() - kept_turns.len();
        kept_turns.reverse();

        // Memory: most relevant first until the next hit no longer fits.
        let mut hits: Vec<MemoryHit> = Vec::new();
        if !query.trim().is_empty() && self.config.memory_top_k > 0 {
            let embedding = self.embedder.embed(&query).await?;
            let scored = self
                .memory
                .search(tenant, &embedding, self.config.memory_top_k)
                .await?;
            let relevant: Vec<_> = scored
                .into_iter()
                .filter(|s| s.score >= self.config.min_relevance)
                .collect();
            let mut used = 0usize;
            for s in &relevant {
                let hit = MemoryHit {
                    id: s.entry.id,
                    subject: s.entry.subject.clone(),
                    content: s.entry.content.clone(),
                    relevance: s.score,
                };
                let cost = self.counter.count(&hit.render()) + 1;
                if used + cost > budgets.memory {
                    break;
                }
                used += cost;
                hits.push(hit);
            }
            report.dropped_memories = relevant.len() - hits.len();
        }

        let mut ctx = WorkingContext {
            tenant_id: tenant.clone(),
            session_id: session_id.map(str::to_string),
            system_instructions,
            history: kept_turns,
            memories: hits,
            task_text: task_section,
            token_count: 0,
            max_tokens: self.config.max_tokens,
            report,
        };
        self.enforce_ceiling(&mut ctx);
        ctx.report = ContextBudgetReport {
            system: self.usage(budgets.system, &ctx.system_instructions),
            history: self.usage(
                budgets.history,
                &ctx.history
                    .iter()
                    .map(SessionTurn::render)
                    .collect::<Vec<_>>()
                    .join("\n"),
            ),
            memory: self.usage(
                budgets.memory,
                &ctx.memories
                    .iter()
                    .map(MemoryHit::render)
                    .collect::<Vec<_>>()
                    .join("\n"),
            ),
            task: self.usage(budgets.task, &ctx.task_text),
            ..ctx.report
        };

        debug!(
            tenant = %tenant,
            task_id = %task.id,
            tokens = ctx.token_count,
            max_tokens = ctx.max_tokens,
            turns = ctx.history.len(),
            memories = ctx.memories.len(),
            dropped_turns = ctx.report.dropped_turns,
            dropped_memories = ctx.report.dropped_memories,
            "Compiled working context"
        );
        Ok(ctx)
    }

    fn usage(&self, allocated: usize, text: &str) -> SectionUsage {
        SectionUsage {
            allocated,
            used: self.counter.count(text),
        }
    }

    /// Section headers and separators are not part of any section budget,
    /// so trim until the full render fits: oldest turns, then least relevant
    /// memories, then the task text, then the system text.
    fn enforce_ceiling(&self, ctx: &mut WorkingContext) {
        loop {
            let count = self.counter.count(&ctx.render());
            ctx.token_count = count;
            if count <= ctx.max_tokens {
                return;
            }
            let excess = (count - ctx.max_tokens).max(1);
            if !ctx.history.is_empty() {
                ctx.history.remove(0);
                ctx.report.dropped_turns += 1;
            } else if !ctx.memories.is_empty() {
                ctx.memories.pop();
                ctx.report.dropped_memories += 1;
            } else if !ctx.task_text.is_empty() {
                let target = self.counter.count(&ctx.task_text).saturating_sub(excess);
                ctx.task_text = self.counter.truncate(&ctx.task_text, target);
            } else if !ctx.system_instructions.is_empty() {
                let target = self
                    .counter
                    .count(&ctx.system_instructions)
                    .saturating_sub(excess);
                ctx.system_instructions = self.counter.truncate(&ctx.system_instructions, target);
            } else {
                warn!(
                    max_tokens = ctx.max_tokens,
                    "Empty context still over budget"
                );
                ctx.token_count = 0;
                return;
            }
        }
    }

    /// Append a fact to the tenant's long-term memory.
    pub async fn store_memory(
        &self,
        tenant: &TenantId,
        subject: &str,
        content: &str,
    ) -> SwitchboardResult<Uuid> {
        let embedding = self.embedder.embed(content).await?;
        let entry = MemoryEntry::new(tenant.clone(), subject, content, embedding);
        let id = entry.id;
        self.memory.insert(entry).await?;
        info!(tenant = %tenant, subject, memory_id = %id, "Stored memory");
        Ok(id)
    }

    /// Append a turn to a session. Writers to the same session are
    /// serialised.
    pub async fn append_turn(
        &self,
        tenant: &TenantId,
        session_id: &str,
        turn: SessionTurn,
    ) -> SwitchboardResult<()> {
        let lock = self.session_lock(tenant, session_id);
        let _guard = lock.lock().await;
        self.sessions.append(tenant, session_id, turn).await
    }

    /// Last `n` turns of a session, oldest first.
    pub async fn recent_turns(
        &self,
        tenant: &TenantId,
        session_id: &str,
        n: usize,
    ) -> SwitchboardResult<Vec<SessionTurn>> {
        self.sessions.read_recent(tenant, session_id, n).await
    }

    /// Clear a session. Called when the owning business process ends.
    pub async fn clear_session(&self, tenant: &TenantId, session_id: &str) -> SwitchboardResult<bool> {
        let lock = self.session_lock(tenant, session_id);
        let existed = {
            let _guard = lock.lock().await;
            self.sessions.clear(tenant, session_id).await?
        };
        self.session_locks
            .lock()
            .remove(&(tenant.clone(), session_id.to_string()));
        info!(tenant = %tenant, session_id, existed, "Cleared session");
        Ok(existed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use switchboard_core::TokenEncoding;

    fn tenant() -> TenantId {
        TenantId::new("t1").unwrap()
    }

    fn config(max_tokens: usize) -> ContextConfig {
        ContextConfig {
            max_tokens,
            encoding: TokenEncoding::Heuristic,
            system_instructions: "You coordinate sales workers for one account.".into(),
            ..ContextConfig::default()
        }
    }

    #[test]
    fn test_budgets_follow_split() {
        let b = SectionBudgets::from_config(&config(8000));
        assert_eq!(b, SectionBudgets { system: 1200, history: 2800, memory: 2800, task: 1200 });
        let b = SectionBudgets::from_config(&config(10));
        assert_eq!(b.system + b.history + b.memory + b.task, 10);
    }

    #[test]
    fn test_task_text_includes_params() {
        let task = Task::new(tenant(), "email")
            .with_instruction("send a status email")
            .with_param("to", serde_json::json!("ops@acme.test"));
        let text = task_text(&task);
        assert!(text.starts_with("send a status email"));
        assert!(text.contains("Parameters: {\"to\":\"ops@acme.test\"}"));
        assert_eq!(task_text(&Task::new(tenant(), "crm_sync")), "crm_sync");
    }

    #[tokio::test]
    async fn test_rejects_foreign_task() {
        let mgr = ContextManager::in_memory(config(1000));
        let task = Task::new(TenantId::new("other").unwrap(), "x");
        assert!(matches!(
            mgr.compile_working_context(&tenant(), None, &task).await,
            Err(SwitchboardError::TenantMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_history_drops_oldest_first() {
        let mgr = ContextManager::in_memory(config(200));
        let t = tenant();
        for i in 0..30 {
            mgr.append_turn(&t, "s1", SessionTurn::user(format!("message number {i:02} about the deal")))
                .await
                .unwrap();
        }
        let task = Task::new(t.clone(), "note").with_instruction("log a call");
        let ctx = mgr.compile_working_context(&t, Some("s1"), &task).await.unwrap();

        assert!(ctx.token_count <= 200);
        assert!(!ctx.history.is_empty());
        assert!(ctx.report.dropped_turns > 0);
        assert_eq!(ctx.history.last().unwrap().content, "message number 29 about the deal");
        assert_eq!(ctx.history.len() + ctx.report.dropped_turns, 30);
    }

    #[tokio::test]
    async fn test_memory_is_relevance_ordered_and_tenant_scoped() {
        let mgr = ContextManager::in_memory(config(2000));
        let t = tenant();
        mgr.store_memory(&t, "renewal", "Acme contract renewal is due in March").await.unwrap();
        mgr.store_memory(&t, "coffee", "The office coffee machine is broken").await.unwrap();
        mgr.store_memory(&TenantId::new("t2").unwrap(), "renewal", "Globex renewal due May")
            .await
            .unwrap();

        let task = Task::new(t.clone(), "email").with_instruction("email Acme about the contract renewal");
        let ctx = mgr.compile_working_context(&t, None, &task).await.unwrap();
        assert_eq!(ctx.memories[0].subject, "renewal");
        assert!(ctx.memories.iter().all(|m| !m.content.contains("Globex")));
        assert!(ctx.memories.windows(2).all(|w| w[0].relevance >= w[1].relevance));
    }

    #[tokio::test]
    async fn test_tiny_ceiling_still_holds() {
        let mut cfg = config(12);
        cfg.system_instructions = "a long system preamble that cannot possibly fit".into();
        let mgr = ContextManager::in_memory(cfg);
        let t = tenant();
        mgr.append_turn(&t, "s", SessionTurn::user("hello there")).await.unwrap();
        let task = Task::new(t.clone(), "x").with_instruction("a rather long instruction text for a tiny budget");
        let ctx = mgr.compile_working_context(&t, Some("s"), &task).await.unwrap();
        assert!(ctx.token_count <= 12, "{}", ctx.render());
        assert_eq!(ctx.token_count, mgr.counter().count(&ctx.render()));
    }

    #[tokio::test]
    async fn test_clear_session() {
        let mgr = ContextManager::in_memory(config(500));
        let t = tenant();
        mgr.append_turn(&t, "deal-7", SessionTurn::user("hi")).await.unwrap();
        assert!(mgr.clear_session(&t, "deal-7").await.unwrap());
        assert!(mgr.recent_turns(&t, "deal-7", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_appends_are_all_kept() {
        let mgr = Arc::new(ContextManager::in_memory(config(500)));
        let t = tenant();
        let mut handles = Vec::new();
        for i in 0..20 {
            let mgr = mgr.clone();
            let t = t.clone();
            handles.push(tokio::spawn(async move {
                mgr.append_turn(&t, "shared", SessionTurn::user(format!("w{i}"))).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(mgr.recent_turns(&t, "shared", 100).await.unwrap().len(), 20);
    }
}
