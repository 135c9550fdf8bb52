#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use switchboard_context::{
    ContextManager, FileMemoryStore, FileSessionStore, LocalEmbedding, MemoryStore,
};
use switchboard_core::{ContextConfig, SessionTurn, Task, TenantId, TokenEncoding};

fn tenant(id: &str) -> TenantId {
    TenantId::new(id).unwrap()
}

#[tokio::test]
async fn test_ceiling_holds_for_any_history_and_memory_size() {
    for encoding in [TokenEncoding::Heuristic, TokenEncoding::Cl100kBase] {
        for max_tokens in [16usize, 64, 256, 1024] {
            for turns in [0usize, 1, 7, 60] {
                for facts in [0usize, 3, 40] {
                    let config = ContextConfig {
                        max_tokens,
                        encoding,
                        ..ContextConfig::default()
                    };
                    let fetched = turns.min(config.recent_turns);
                    let mgr = ContextManager::in_memory(config);
                    let t = tenant("t1");
                    for i in 0..turns {
                        mgr.append_turn(
                            &t,
                            "s",
                            SessionTurn::user(format!("turn {i}: the buyer wants a proposal by Friday")),
                        )
                        .await
                        .unwrap();
                    }
                    for i in 0..facts {
                        mgr.store_memory(&t, &format!("f{i}"), &format!("proposal fact {i} about pricing and Friday"))
                            .await
                            .unwrap();
                    }
                    let task = Task::new(t.clone(), "draft")
                        .with_instruction("draft the proposal for Friday with pricing")
                        .with_param("account", serde_json::json!("Acme"));
                    let ctx = mgr.compile_working_context(&t, Some("s"), &task).await.unwrap();

                    assert!(
                        ctx.token_count <= max_tokens,
                        "{encoding:?} max={max_tokens} turns={turns} facts={facts}: {}",
                        ctx.token_count
                    );
                    assert_eq!(ctx.token_count, mgr.counter().count(&ctx.render()));
                    assert_eq!(ctx.history.len() + ctx.report.dropped_turns, fetched);
                }
            }
        }
    }
}

#[tokio::test]
async fn test_memory_never_crosses_tenants() {
    let mgr = ContextManager::in_memory(ContextConfig::default());
    mgr.store_memory(&tenant("acme"), "pricing", "Acme pays 40 per seat").await.unwrap();
    mgr.store_memory(&tenant("globex"), "pricing", "Globex pays 90 per seat").await.unwrap();

    let t = tenant("acme");
    let task = Task::new(t.clone(), "quote").with_instruction("quote the per seat pricing");
    let ctx = mgr.compile_working_context(&t, None, &task).await.unwrap();
    assert_eq!(ctx.memories.len(), 1);
    assert!(ctx.memories[0].content.contains("Acme"));
}

#[tokio::test]
async fn test_superseded_fact_is_not_compiled() {
    let mgr = ContextManager::in_memory(ContextConfig::default());
    let t = tenant("acme");
    mgr.store_memory(&t, "decision maker", "The decision maker is Dana").await.unwrap();
    mgr.store_memory(&t, "decision maker", "The decision maker is Lee").await.unwrap();

    let task = Task::new(t.clone(), "email").with_instruction("email the decision maker");
    let ctx = mgr.compile_working_context(&t, None, &task).await.unwrap();
    let facts: Vec<&str> = ctx.memories.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(facts, vec!["The decision maker is Lee"]);
}

#[tokio::test]
async fn test_file_backed_manager_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let t = tenant("acme");

    let build = |dir: std::path::PathBuf| async move {
        let sessions = Arc::new(FileSessionStore::new(dir.join("sessions")).await.unwrap());
        let memory = Arc::new(FileMemoryStore::open(dir.join("memory")).await.unwrap());
        let mgr = ContextManager::new(
            ContextConfig::default(),
            sessions,
            memory.clone(),
            Arc::new(LocalEmbedding::default()),
        );
        (mgr, memory)
    };

    {
        let (mgr, _) = build(dir.path().to_path_buf()).await;
        mgr.append_turn(&t, "deal-3", SessionTurn::user("We agreed on a pilot in Q3")).await.unwrap();
        mgr.store_memory(&t, "pilot", "Acme pilot starts in Q3").await.unwrap();
    }

    let (mgr, memory) = build(dir.path().to_path_buf()).await;
    assert_eq!(memory.count(&t).await.unwrap(), 1);
    let task = Task::new(t.clone(), "plan").with_instruction("plan the Q3 pilot kickoff");
    let ctx = mgr.compile_working_context(&t, Some("deal-3"), &task).await.unwrap();
    assert_eq!(ctx.history.len(), 1);
    assert_eq!(ctx.memories[0].subject, "pilot");

    assert!(mgr.clear_session(&t, "deal-3").await.unwrap());
    let ctx = mgr.compile_working_context(&t, Some("deal-3"), &task).await.unwrap();
    assert!(ctx.history.is_empty());
}
