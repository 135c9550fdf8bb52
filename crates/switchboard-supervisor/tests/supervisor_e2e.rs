#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Barrier, Mutex};
use switchboard_bus::{Event, EventBus, EventKind, InMemoryStreamTransport, StreamTransport};
use switchboard_context::ContextManager;
use switchboard_core::{
    BusConfig, ContextConfig, ErrorClass, HandoffConfig, LlmConfig, LlmProvider, ModelConfig,
    ResultStatus, RetryPolicy, RouterConfig, RuleConfig, SupervisorConfig, SwitchboardConfig,
    SwitchboardError, SwitchboardResult, Task, TaskResult, TenantId, TurnRole, Worker, WorkingContext,
};
use switchboard_handoff::HandoffValidator;
use switchboard_llm::{Completion, CompletionRequest, CompletionService, ModelTier};
use switchboard_registry::{AgentRegistration, AgentRegistry, AgentStatus, WorkerPool};
use switchboard_router::HybridRouter;
use switchboard_supervisor::{Supervisor, TaskState};
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

enum Behavior {
    Succeed(serde_json::Value),
    Fail,
    Slow,
}

struct Scripted {
    id: &'static str,
    behavior: Behavior,
    calls: AtomicUsize,
    finished: AtomicBool,
}

impl Scripted {
    fn new(id: &'static str, behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            id,
            behavior,
            calls: AtomicUsize::new(0),
            finished: AtomicBool::new(false),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Worker for Scripted {
    fn id(&self) -> &str {
        self.id
    }

    async fn execute(&self, task: &Task, _ctx: &WorkingContext) -> SwitchboardResult<TaskResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let result = match &self.behavior {
            Behavior::Succeed(data) => Ok(TaskResult::success(data.clone(), 0.9)),
            Behavior::Fail => Err(SwitchboardError::Worker(format!(
                "{} could not handle {}",
                self.id, task.task_type
            ))),
            Behavior::Slow => {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(TaskResult::success(json!({ "summary": "too late" }), 0.9))
            }
        };
        self.finished.store(true, Ordering::SeqCst);
        result
    }
}

/// Records its own registry status while executing.
struct SelfInspecting {
    registry: Arc<AgentRegistry>,
    seen: Mutex<Option<AgentStatus>>,
}

#[async_trait]
impl Worker for SelfInspecting {
    fn id(&self) -> &str {
        "inspector"
    }

    async fn execute(&self, _task: &Task, _ctx: &WorkingContext) -> SwitchboardResult<TaskResult> {
        *self.seen.lock().await = self.registry.get("inspector").map(|r| r.status);
        Ok(TaskResult::success(json!({ "summary": "inspected" }), 0.9))
    }
}

/// Completes only once every worker sharing the barrier is running.
struct Rendezvous {
    id: &'static str,
    barrier: Arc<Barrier>,
}

#[async_trait]
impl Worker for Rendezvous {
    fn id(&self) -> &str {
        self.id
    }

    async fn execute(&self, _task: &Task, _ctx: &WorkingContext) -> SwitchboardResult<TaskResult> {
        tokio::time::timeout(Duration::from_secs(2), self.barrier.wait())
            .await
            .map_err(|_| SwitchboardError::Worker(format!("{} ran alone", self.id)))?;
        Ok(TaskResult::success(json!({ "summary": format!("{} done", self.id) }), 0.9))
    }
}

/// Rejects every strict handoff as unsupported by the context.
struct Skeptic;

#[async_trait]
impl CompletionService for Skeptic {
    async fn complete(&self, request: CompletionRequest) -> SwitchboardResult<Completion> {
        assert_eq!(request.tier, ModelTier::Fast);
        Ok(Completion {
            text: r#"{"supported": false, "unsupported_claims": ["budget: 250000"]}"#.into(),
            model: "fast".into(),
        })
    }
}

struct Harness {
    registry: Arc<AgentRegistry>,
    pool: Arc<WorkerPool>,
}

impl Harness {
    fn new() -> Self {
        Self {
            registry: Arc::new(AgentRegistry::new()),
            pool: Arc::new(WorkerPool::new()),
        }
    }

    fn add(&self, worker: Arc<Scripted>, backup: Option<&str>) -> &Self {
        let mut reg = AgentRegistration::new(worker.id, worker.id, "scripted worker");
        if let Some(b) = backup {
            reg = reg.with_backup(b);
        }
        self.registry.register(reg).unwrap();
        self.pool.insert(worker, 2);
        self
    }

    fn supervisor(
        &self,
        rules: &[(&str, &str)],
        completion: Option<Arc<dyn CompletionService>>,
    ) -> Supervisor {
        let router_config = RouterConfig {
            rules: rules.iter().map(|(t, w)| rule(t, w)).collect(),
            ..RouterConfig::default()
        };
        let router =
            HybridRouter::new(self.registry.clone(), completion.clone(), &router_config).unwrap();
        let validator =
            HandoffValidator::new(self.registry.clone(), completion.clone(), &HandoffConfig::default());
        Supervisor::new(
            self.registry.clone(),
            self.pool.clone(),
            Arc::new(router),
            Arc::new(validator),
            Arc::new(ContextManager::in_memory(ContextConfig::default())),
            completion,
            SupervisorConfig::default(),
        )
    }
}

fn rule(task_type: &str, worker_id: &str) -> RuleConfig {
    RuleConfig {
        name: None,
        task_type: Some(task_type.into()),
        param: None,
        equals: None,
        worker_id: worker_id.into(),
    }
}

fn tenant(id: &str) -> TenantId {
    TenantId::new(id).unwrap()
}

fn bus_config() -> BusConfig {
    BusConfig {
        batch_size: 100,
        block_timeout_ms: 10,
        ..BusConfig::default()
    }
}

async fn events(transport: Arc<dyn StreamTransport>, tenant_id: &str) -> Vec<Event> {
    let bus = EventBus::new(tenant(tenant_id), transport, bus_config());
    bus.subscribe("handoffs", "audit", "reader")
        .await
        .unwrap()
        .into_iter()
        .map(|d| d.event)
        .collect()
}

async fn event_kinds(transport: Arc<dyn StreamTransport>, tenant_id: &str) -> Vec<String> {
    events(transport, tenant_id)
        .await
        .into_iter()
        .map(|e| e.kind)
        .collect()
}

#[tokio::test]
async fn test_failover_to_backup_completes_task() {
    let flaky = Scripted::new("flaky", Behavior::Fail);
    let steady = Scripted::new("steady", Behavior::Succeed(json!({ "summary": "deal updated" })));
    let h = Harness::new();
    h.add(steady.clone(), None).add(flaky.clone(), Some("steady"));

    let transport: Arc<dyn StreamTransport> = Arc::new(InMemoryStreamTransport::new());
    let sup = h
        .supervisor(&[("crm_update", "flaky")], None)
        .with_events(transport.clone(), bus_config());

    let task = Task::new(tenant("acme"), "crm_update").with_instruction("update the deal stage");
    let out = sup.run(task, None).await;

    assert!(out.is_done());
    assert_eq!(out.response_text(), "deal updated");
    assert_eq!(out.subtasks[0].attempts, vec!["flaky", "steady"]);
    assert!(out.subtasks[0].failed_over());
    assert_eq!(flaky.calls(), 1);
    assert_eq!(steady.calls(), 1);

    assert_eq!(h.registry.get("flaky").unwrap().status, AgentStatus::Error);
    let flaky_metrics = sup.monitor().get("flaky").await.unwrap().metrics;
    assert_eq!(flaky_metrics.failures, 1);
    assert_eq!(flaky_metrics.failovers, 1);

    let events = events(transport, "acme").await;
    let kinds: Vec<&str> = events.iter().map(|e| e.kind.as_str()).collect();
    assert_eq!(
        kinds,
        vec![
            EventKind::TASK_RECEIVED,
            EventKind::TASK_ROUTED,
            EventKind::WORKER_FAILED,
            EventKind::WORKER_FAILOVER,
            EventKind::HANDOFF_ACCEPTED,
            EventKind::TASK_COMPLETED,
        ]
    );
    let accepted = events
        .iter()
        .find(|e| e.kind == EventKind::HANDOFF_ACCEPTED)
        .unwrap();
    assert_eq!(accepted.call_chain, vec!["flaky", "steady"]);
    assert_eq!(accepted.source_worker_id, "steady");
}

#[tokio::test]
async fn test_worker_is_busy_while_executing() {
    let h = Harness::new();
    let inspector = Arc::new(SelfInspecting {
        registry: h.registry.clone(),
        seen: Mutex::new(None),
    });
    h.registry
        .register(AgentRegistration::new("inspector", "Inspector", "reports its status"))
        .unwrap();
    h.pool.insert(inspector.clone(), 1);
    let sup = h.supervisor(&[("audit", "inspector")], None);

    let out = sup
        .run(Task::new(tenant("acme"), "audit").with_instruction("audit the account"), None)
        .await;

    assert!(out.is_done());
    assert_eq!(*inspector.seen.lock().await, Some(AgentStatus::Busy));
    assert_eq!(h.registry.get("inspector").unwrap().status, AgentStatus::Idle);
}

#[tokio::test]
async fn test_independent_subtasks_run_concurrently() {
    let barrier = Arc::new(Barrier::new(2));
    let h = Harness::new();
    for id in ["analyst", "notifier"] {
        h.registry
            .register(AgentRegistration::new(id, id, "waits for its peer"))
            .unwrap();
        h.pool.insert(
            Arc::new(Rendezvous {
                id,
                barrier: barrier.clone(),
            }),
            1,
        );
    }
    let sup = h.supervisor(&[("research", "analyst"), ("notify", "notifier")], None);

    let out = sup
        .run(
            Task::new(tenant("acme"), "request")
                .with_instruction("research the account and notify the team"),
            None,
        )
        .await;

    assert!(out.is_done());
    assert_eq!(out.subtasks.len(), 2);
    assert!(out.subtasks.iter().all(|s| s.succeeded()));
    assert!(out.synthesized);
}

#[tokio::test]
async fn test_worker_and_backup_failure_fails_task() {
    let primary = Scripted::new("primary", Behavior::Fail);
    let backup = Scripted::new("backup", Behavior::Fail);
    let h = Harness::new();
    h.add(backup.clone(), None).add(primary.clone(), Some("backup"));
    let sup = h.supervisor(&[("crm_update", "primary")], None);

    let out = sup
        .run(Task::new(tenant("acme"), "crm_update").with_instruction("update the deal"), None)
        .await;

    assert_eq!(out.state, TaskState::Failed);
    assert_eq!(out.result.error_class(), Some(ErrorClass::WorkerFailure));
    assert_eq!(out.subtasks[0].attempts, vec!["primary", "backup"]);
    assert_eq!(primary.calls(), 1);
    assert_eq!(backup.calls(), 1);
    assert_eq!(sup.monitor().task_counters().await.failed, 1);
}

#[tokio::test]
async fn test_unsupported_claims_reject_handoff() {
    let crm = Scripted::new("crm", Behavior::Succeed(json!({ "budget": "250000" })));
    let h = Harness::new();
    h.add(crm.clone(), None);
    let sup = h.supervisor(&[("update_crm", "crm")], Some(Arc::new(Skeptic)));

    let out = sup
        .run(
            Task::new(tenant("acme"), "update_crm").with_instruction("update the opportunity"),
            None,
        )
        .await;

    assert_eq!(out.state, TaskState::Failed);
    assert_eq!(out.result.error_class(), Some(ErrorClass::HandoffRejected));
    let handoff = out.subtasks[0].handoff.as_ref().unwrap();
    assert!(!handoff.accepted);
    assert!(handoff.semantic_checked);
    assert_eq!(handoff.reasons, vec!["unsupported claim: budget: 250000".to_string()]);
    // A rejected result is not a worker failure; no failover.
    assert_eq!(out.subtasks[0].attempts, vec!["crm"]);
    assert_eq!(sup.monitor().get("crm").await.unwrap().metrics.rejected_handoffs, 1);
}

#[tokio::test]
async fn test_failed_dependency_skips_dependent_only() {
    let analyst = Scripted::new("analyst", Behavior::Fail);
    let writer = Scripted::new("writer", Behavior::Succeed(json!({ "summary": "draft ready" })));
    let notifier = Scripted::new("notifier", Behavior::Succeed(json!({ "summary": "team notified" })));
    let h = Harness::new();
    h.add(analyst.clone(), None)
        .add(writer.clone(), None)
        .add(notifier.clone(), None);
    let sup = h.supervisor(
        &[("research", "analyst"), ("draft", "writer"), ("notify", "notifier")],
        None,
    );

    let out = sup
        .run(
            Task::new(tenant("acme"), "request")
                .with_instruction("research the account and then draft a proposal; notify the team"),
            None,
        )
        .await;

    assert!(out.is_done());
    assert!(out.states().contains(&TaskState::Decomposed));
    assert_eq!(out.subtasks.len(), 3);
    assert_eq!(out.subtasks[1].result.error_class(), Some(ErrorClass::DependencyFailed));
    assert!(out.subtasks[2].succeeded());
    assert_eq!(writer.calls(), 0);

    // One surviving result is returned directly, marked partial.
    assert!(!out.synthesized);
    assert_eq!(out.result.status, ResultStatus::Partial);
    assert_eq!(out.response_text(), "team notified");
}

#[tokio::test]
async fn test_cancel_abandons_in_flight_worker() {
    let slow = Scripted::new("slow", Behavior::Slow);
    let h = Harness::new();
    h.add(slow.clone(), None);
    let sup = h.supervisor(&[("report", "slow")], None);

    let task = Task::new(tenant("acme"), "report").with_instruction("prepare the quarterly report");
    let task_id = task.id;
    let (out, cancelled) = tokio::join!(sup.run(task, Some("s1")), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        sup.cancel(task_id)
    });

    assert!(cancelled);
    assert_eq!(out.state, TaskState::Cancelled);
    assert_eq!(out.result.error_class(), Some(ErrorClass::Cancelled));
    assert!(!slow.finished.load(Ordering::SeqCst));
    assert!(sup.running_tasks().is_empty());
    assert!(!sup.cancel(task_id));
    assert_eq!(sup.monitor().task_counters().await.cancelled, 1);

    // Cancelled runs leave no assistant turn behind.
    let turns = sup.context().recent_turns(&tenant("acme"), "s1", 10).await.unwrap();
    assert!(turns.iter().all(|t| t.role != TurnRole::Assistant));
}

#[tokio::test]
async fn test_session_records_request_and_response() {
    let mailer = Scripted::new("mailer", Behavior::Succeed(json!({ "summary": "email sent" })));
    let h = Harness::new();
    h.add(mailer.clone(), None);
    let sup = h.supervisor(&[("email", "mailer")], None);

    let out = sup
        .run(
            Task::new(tenant("acme"), "email").with_instruction("send the renewal reminder"),
            Some("deal-9"),
        )
        .await;
    assert!(out.is_done());

    let turns = sup.context().recent_turns(&tenant("acme"), "deal-9", 10).await.unwrap();
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0].role, TurnRole::User);
    assert!(turns[0].content.contains("send the renewal reminder"));
    assert_eq!(turns[1].role, TurnRole::Assistant);
    assert_eq!(turns[1].content, "email sent");

    // Other tenants never see this session.
    let other = sup.context().recent_turns(&tenant("globex"), "deal-9", 10).await.unwrap();
    assert!(other.is_empty());
}

#[tokio::test]
async fn test_events_stay_on_tenant_streams() {
    let mailer = Scripted::new("mailer", Behavior::Succeed(json!({ "summary": "sent" })));
    let h = Harness::new();
    h.add(mailer, None);
    let transport: Arc<dyn StreamTransport> = Arc::new(InMemoryStreamTransport::new());
    let sup = h
        .supervisor(&[("email", "mailer")], None)
        .with_events(transport.clone(), bus_config());

    sup.run(Task::new(tenant("acme"), "email").with_instruction("send a note"), None)
        .await;
    sup.run(Task::new(tenant("acme"), "email").with_instruction("send a memo"), None)
        .await;
    sup.run(Task::new(tenant("globex"), "email").with_instruction("send a note"), None)
        .await;

    let acme = event_kinds(transport.clone(), "acme").await;
    let globex = event_kinds(transport, "globex").await;
    let completed = |kinds: &[String]| {
        kinds
            .iter()
            .filter(|k| k.as_str() == EventKind::TASK_COMPLETED)
            .count()
    };
    assert_eq!(completed(acme.as_slice()), 2);
    assert_eq!(completed(globex.as_slice()), 1);
}

fn openai_model(server: &MockServer, model_id: &str) -> ModelConfig {
    ModelConfig {
        provider: LlmProvider::OpenAi,
        model_id: model_id.into(),
        api_key: "test-key".into(),
        api_base_url: Some(server.uri()),
        max_tokens: 512,
    }
}

fn chat_reply(content: &str, model: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "model": model,
        "choices": [{ "message": { "role": "assistant", "content": content } }]
    }))
}

#[tokio::test]
async fn test_model_synthesis_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({ "model": "fast-model" })))
        .respond_with(chat_reply(
            r#"{"supported": true, "unsupported_claims": []}"#,
            "fast-model",
        ))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({ "model": "reasoning-model" })))
        .respond_with(chat_reply(
            "```json\n{\"response\": \"Acme is growing; proposal drafted.\", \"confidence\": 0.95}\n```",
            "reasoning-model",
        ))
        .expect(1)
        .mount(&server)
        .await;

    let config = SwitchboardConfig {
        router: RouterConfig {
            rules: vec![rule("research", "analyst"), rule("draft", "writer")],
            ..RouterConfig::default()
        },
        llm: LlmConfig {
            enabled: true,
            fast: vec![openai_model(&server, "fast-model")],
            reasoning: vec![openai_model(&server, "reasoning-model")],
            retry: RetryPolicy {
                max_retries: 0,
                backoff_base_ms: 1,
                backoff_max_ms: 1,
            },
            ..LlmConfig::default()
        },
        ..SwitchboardConfig::default()
    };

    let h = Harness::new();
    h.add(Scripted::new("analyst", Behavior::Succeed(json!({ "summary": "revenue up 20%" }))), None)
        .add(Scripted::new("writer", Behavior::Succeed(json!({ "summary": "proposal v1" }))), None);
    let sup = Supervisor::from_config(&config, h.registry.clone(), h.pool.clone()).unwrap();

    let out = sup
        .run(
            Task::new(tenant("acme"), "request")
                .with_instruction("research Acme and then draft the proposal"),
            None,
        )
        .await;

    assert!(out.is_done());
    assert!(out.synthesized);
    assert!(out.states().contains(&TaskState::Synthesizing));
    assert_eq!(out.response_text(), "Acme is growing; proposal drafted.");
    // Never more confident than the inputs it merged.
    assert!(out.result.confidence <= 0.9 + f32::EPSILON);
    for report in &out.subtasks {
        assert!(report.handoff.as_ref().unwrap().semantic_checked);
    }
    assert_eq!(sup.monitor().task_counters().await.synthesized, 1);
}
