use crate::monitor::SupervisorMonitor;
use crate::outcome::{SubtaskReport, SupervisorOutcome};
use crate::state::{TaskState, TaskTrace};
use crate::synthesis::{MergeInput, Synthesizer};
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use switchboard_bus::{Event, EventBus, EventKind, StreamTransport};
use switchboard_context::{task_text, ContextManager};
use switchboard_core::{
    BusConfig, ErrorClass, ResultStatus, SessionTurn, SupervisorConfig, SwitchboardConfig,
    SwitchboardError, SwitchboardResult, Task, TaskResult, TenantId, WorkingContext,
    SUPERVISOR_ID,
};
use switchboard_handoff::{HandoffPayload, HandoffValidator, ValidationOutcome};
use switchboard_llm::{completion_from_config, CompletionService};
use switchboard_registry::{AgentRegistry, AgentStatus, WorkerPool};
use switchboard_router::HybridRouter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Parameter under which a dependent subtask receives its dependencies'
/// results.
pub const UPSTREAM_PARAM: &str = "upstream";

/// Per-tenant buses over one shared transport.
struct EventSink {
    transport: Arc<dyn StreamTransport>,
    config: BusConfig,
    buses: RwLock<HashMap<TenantId, Arc<EventBus>>>,
}

impl EventSink {
    fn bus(&self, tenant: &TenantId) -> Arc<EventBus> {
        if let Some(bus) = self.buses.read().get(tenant) {
            return bus.clone();
        }
        self.buses
            .write()
            .entry(tenant.clone())
            .or_insert_with(|| {
                Arc::new(EventBus::new(
                    tenant.clone(),
                    self.transport.clone(),
                    self.config.clone(),
                ))
            })
            .clone()
    }
}

/// Workers that ran a subtask, and how it ended.
struct Execution {
    attempts: Vec<String>,
    outcome: SwitchboardResult<TaskResult>,
}

/// What `drive` hands back to `run_with_cancel`.
struct Drive {
    result: TaskResult,
    subtasks: Vec<SubtaskReport>,
    synthesized: bool,
}

/// Removes a task's cancellation token when its run ends, even if the run
/// future is dropped.
struct RunningGuard<'a> {
    running: &'a Mutex<HashMap<Uuid, CancellationToken>>,
    task_id: Uuid,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.running.lock().remove(&self.task_id);
    }
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = SwitchboardResult<T>>,
) -> SwitchboardResult<T> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(SwitchboardError::Cancelled("task cancelled".into())),
        out = fut => out,
    }
}

/// The top-level control loop.
///
/// For each task: compile context, decompose if the task carries
/// decomposition signals, then per dependency wave route every subtask,
/// execute them concurrently (failing over once to a registered backup),
/// and validate every result as a handoff to the supervisor. Several
/// surviving results are synthesized into one; a single result is returned
/// directly.
pub struct Supervisor {
    registry: Arc<AgentRegistry>,
    pool: Arc<WorkerPool>,
    router: Arc<HybridRouter>,
    validator: Arc<HandoffValidator>,
    context: Arc<ContextManager>,
    synthesizer: Synthesizer,
    events: Option<EventSink>,
    config: SupervisorConfig,
    monitor: Arc<SupervisorMonitor>,
    running: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl Supervisor {
    /// Supervisor over explicit components.
    pub fn new(
        registry: Arc<AgentRegistry>,
        pool: Arc<WorkerPool>,
        router: Arc<HybridRouter>,
        validator: Arc<HandoffValidator>,
        context: Arc<ContextManager>,
        completion: Option<Arc<dyn CompletionService>>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            registry,
            pool,
            router,
            validator,
            context,
            synthesizer: Synthesizer::new(completion, config.model_synthesis),
            events: None,
            config,
            monitor: Arc::new(SupervisorMonitor::new()),
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Wire every component from one configuration, with in-memory session
    /// and memory stores.
    pub fn from_config(
        config: &SwitchboardConfig,
        registry: Arc<AgentRegistry>,
        pool: Arc<WorkerPool>,
    ) -> SwitchboardResult<Self> {
        config.validate()?;
        let completion = completion_from_config(&config.llm);
        let router = HybridRouter::new(registry.clone(), completion.clone(), &config.router)?;
        let validator = HandoffValidator::new(registry.clone(), completion.clone(), &config.handoff);
        let context = ContextManager::in_memory(config.context.clone());
        Ok(Self::new(
            registry,
            pool,
            Arc::new(router),
            Arc::new(validator),
            Arc::new(context),
            completion,
            config.supervisor.clone(),
        ))
    }

    /// Publish lifecycle events to each tenant's bus over `transport`.
    pub fn with_events(mut self, transport: Arc<dyn StreamTransport>, config: BusConfig) -> Self {
        self.events = Some(EventSink {
            transport,
            config,
            buses: RwLock::new(HashMap::new()),
        });
        self
    }

    /// Activity and outcome counters.
    pub fn monitor(&self) -> &Arc<SupervisorMonitor> {
        &self.monitor
    }

    /// Context manager.
    pub fn context(&self) -> &Arc<ContextManager> {
        &self.context
    }

    /// Worker registry.
    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// Supervisor settings.
    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Ids of tasks currently running.
    pub fn running_tasks(&self) -> Vec<Uuid> {
        self.running.lock().keys().copied().collect()
    }

    /// Cancel a running task. In-flight worker calls are abandoned and their
    /// results discarded. Returns `false` when the task is not running.
    pub fn cancel(&self, task_id: Uuid) -> bool {
        if let Some(token) = self.running.lock().get(&task_id) {
            info!(task_id = %task_id, "Cancelling task");
            token.cancel();
            true
        } else {
            false
        }
    }

    /// Run a task to completion. Failures come back in the outcome.
    pub async fn run(&self, task: Task, session_id: Option<&str>) -> SupervisorOutcome {
        self.run_with_cancel(task, session_id, CancellationToken::new()).await
    }

    /// Run a task until it finishes or `cancel` fires.
    pub async fn run_with_cancel(
        &self,
        task: Task,
        session_id: Option<&str>,
        cancel: CancellationToken,
    ) -> SupervisorOutcome {
        let token = cancel.child_token();
        self.running.lock().insert(task.id, token.clone());
        let _guard = RunningGuard {
            running: &self.running,
            task_id: task.id,
        };

        let started = Instant::now();
        let mut trace = TaskTrace::new(task.id);
        info!(
            task_id = %task.id,
            tenant = %task.tenant_id,
            task_type = %task.task_type,
            "Supervisor: task received"
        );
        self.publish(
            &task,
            EventKind::TASK_RECEIVED,
            vec![SUPERVISOR_ID.to_string()],
            serde_json::json!({ "task_type": task.task_type }),
        )
        .await;

        let drive = self.drive(&task, session_id, &token, &mut trace).await;

        let state = trace.state();
        let response = crate::outcome::response_text(&drive.result);
        match state {
            TaskState::Done => {
                self.monitor.record_task_completed(drive.synthesized).await;
                self.publish(
                    &task,
                    EventKind::TASK_COMPLETED,
                    vec![SUPERVISOR_ID.to_string()],
                    serde_json::json!({
                        "status": drive.result.status,
                        "confidence": drive.result.confidence,
                        "synthesized": drive.synthesized,
                    }),
                )
                .await;
            }
            TaskState::Cancelled => {
                self.monitor.record_task_cancelled().await;
                self.publish(
                    &task,
                    EventKind::TASK_CANCELLED,
                    vec![SUPERVISOR_ID.to_string()],
                    serde_json::json!({}),
                )
                .await;
            }
            _ => {
                self.monitor.record_task_failed().await;
                self.publish(
                    &task,
                    EventKind::TASK_FAILED,
                    vec![SUPERVISOR_ID.to_string()],
                    serde_json::json!({ "error": drive.result.error }),
                )
                .await;
            }
        }

        if let Some(sid) = session_id {
            if state != TaskState::Cancelled {
                if let Err(e) = self
                    .context
                    .append_turn(&task.tenant_id, sid, SessionTurn::assistant(response))
                    .await
                {
                    warn!(task_id = %task.id, session = sid, error = %e, "Failed to record response turn");
                }
            }
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        info!(
            task_id = %task.id,
            state = %state,
            status = ?drive.result.status,
            duration_ms,
            "Supervisor: task finished"
        );

        SupervisorOutcome {
            task_id: task.id,
            tenant_id: task.tenant_id.clone(),
            state,
            result: drive.result,
            subtasks: drive.subtasks,
            synthesized: drive.synthesized,
            transitions: trace.transitions().to_vec(),
            duration_ms,
        }
    }

    async fn drive(
        &self,
        task: &Task,
        session_id: Option<&str>,
        cancel: &CancellationToken,
        trace: &mut TaskTrace,
    ) -> Drive {
        let ctx = match cancellable(
            cancel,
            self.context
                .compile_working_context(&task.tenant_id, session_id, task),
        )
        .await
        {
            Ok(ctx) => ctx,
            Err(e) => return abort(trace, e, Vec::new()),
        };
        trace.advance(
            TaskState::ContextCompiled,
            Some(format!("{} of {} tokens", ctx.token_count, ctx.max_tokens)),
        );

        if let Some(sid) = session_id {
            let said = if task.instruction.trim().is_empty() {
                task.task_type.clone()
            } else {
                task.instruction.clone()
            };
            if let Err(e) = self
                .context
                .append_turn(&task.tenant_id, sid, SessionTurn::user(said))
                .await
            {
                warn!(task_id = %task.id, session = sid, error = %e, "Failed to record request turn");
            }
        }

        let plan = match cancellable(cancel, self.router.decompose(task)).await {
            Ok(plan) => plan,
            Err(e) => return abort(trace, e, Vec::new()),
        };
        let decomposed = plan.is_some();
        let (nodes, waves): (Vec<(Task, Vec<usize>)>, Vec<Vec<usize>>) = match plan {
            Some(d) => {
                trace.advance(
                    TaskState::Decomposed,
                    Some(format!("{} subtasks in {} waves", d.len(), d.waves().len())),
                );
                (
                    d.subtasks()
                        .iter()
                        .map(|s| (s.task.clone(), s.depends_on.clone()))
                        .collect(),
                    d.waves().to_vec(),
                )
            }
            None => {
                trace.advance(TaskState::Single, None);
                (vec![(task.clone(), Vec::new())], vec![vec![0]])
            }
        };

        let mut reports: Vec<SubtaskReport> = nodes
            .iter()
            .enumerate()
            .map(|(i, (t, deps))| SubtaskReport::new(i, t, deps))
            .collect();

        for wave in &waves {
            if cancel.is_cancelled() {
                return abort(trace, cancelled(), reports);
            }

            let mut runnable = Vec::new();
            for &i in wave {
                let deps = &nodes[i].1;
                match deps.iter().find(|&&d| !reports[d].succeeded()) {
                    Some(&d) => {
                        debug!(task_id = %task.id, subtask = i, dependency = d, "Skipping subtask, dependency failed");
                        reports[i].result = TaskResult::failure(
                            ErrorClass::DependencyFailed,
                            format!("dependency {d} ({}) failed", nodes[d].0.task_type),
                        );
                    }
                    None => runnable.push(i),
                }
            }
            if runnable.is_empty() {
                continue;
            }

            let prepared: Vec<(usize, Task)> = runnable
                .iter()
                .map(|&i| (i, with_upstream(&nodes[i].0, &nodes[i].1, &reports)))
                .collect();

            // Route.
            let ctx_ref = &ctx;
            let routes = join_all(prepared.iter().map(move |(_, t)| {
                cancellable(cancel, self.router.route_with_context(t, Some(ctx_ref)))
            }))
            .await;
            if cancel.is_cancelled() {
                return abort(trace, cancelled(), reports);
            }
            let mut assignments = Vec::new();
            for ((i, t), route) in prepared.iter().zip(&routes) {
                match route {
                    Ok(decision) => {
                        assignments.push(format!("{i}->{}({})", decision.worker_id, decision.method));
                        self.publish(
                            t,
                            EventKind::TASK_ROUTED,
                            vec![SUPERVISOR_ID.to_string()],
                            serde_json::json!({
                                "worker_id": decision.worker_id,
                                "method": decision.method,
                                "confidence": decision.confidence,
                                "reasoning": decision.reasoning,
                            }),
                        )
                        .await;
                    }
                    Err(e) => {
                        warn!(task_id = %task.id, subtask = i, error = %e, "Subtask could not be routed");
                        assignments.push(format!("{i}->unrouted"));
                    }
                }
            }
            trace.advance(TaskState::Routed, Some(assignments.join(", ")));

            // Execute.
            let dispatched = routes.iter().filter(|r| r.is_ok()).count();
            trace.advance(TaskState::Executing, Some(format!("{dispatched} dispatched")));
            let executions = join_all(prepared.iter().zip(routes).map(move |((_, t), route)| async move {
                match route {
                    Ok(decision) => {
                        let exec = self
                            .execute_with_failover(t, &decision.worker_id, ctx_ref, cancel)
                            .await;
                        (Some(decision), exec)
                    }
                    Err(e) => (
                        None,
                        Execution {
                            attempts: Vec::new(),
                            outcome: Err(e),
                        },
                    ),
                }
            }))
            .await;
            if cancel.is_cancelled() {
                return abort(trace, cancelled(), reports);
            }

            // Validate.
            trace.advance(TaskState::HandoffValidating, None);
            let upstream_chains: Vec<Vec<String>> = prepared
                .iter()
                .map(|(i, _)| upstream_workers(&nodes[*i].1, &reports))
                .collect();
            let validated = join_all(
                prepared
                    .iter()
                    .zip(executions)
                    .zip(&upstream_chains)
                    .map(move |(((_, t), (decision, exec)), upstream)| async move {
                        let (handoff, result) = self.accept_result(t, &exec, upstream, ctx_ref).await;
                        (decision, exec.attempts, handoff, result)
                    }),
            )
            .await;
            if cancel.is_cancelled() {
                return abort(trace, cancelled(), reports);
            }

            for ((i, _), (decision, attempts, handoff, result)) in prepared.iter().zip(validated) {
                let report = &mut reports[*i];
                report.routing = decision;
                report.attempts = attempts;
                report.handoff = handoff;
                report.result = result;
            }
        }

        self.finish(task, trace, cancel, reports, decomposed).await
    }

    async fn finish(
        &self,
        task: &Task,
        trace: &mut TaskTrace,
        cancel: &CancellationToken,
        reports: Vec<SubtaskReport>,
        decomposed: bool,
    ) -> Drive {
        let succeeded: Vec<&SubtaskReport> = reports.iter().filter(|r| r.succeeded()).collect();
        let failed = reports.len() - succeeded.len();

        if succeeded.is_empty() {
            let primary = reports
                .iter()
                .filter_map(|r| r.result.error.as_ref().map(|f| (r, f)))
                .find(|(_, f)| f.class != ErrorClass::DependencyFailed)
                .or_else(|| {
                    reports
                        .iter()
                        .find_map(|r| r.result.error.as_ref().map(|f| (r, f)))
                });
            let (class, message) = match primary {
                Some((_, f)) if reports.len() == 1 => (f.class, f.message.clone()),
                Some((r, f)) => (
                    f.class,
                    format!("all {} subtasks failed; subtask {} ({}): {}", reports.len(), r.index, r.task_type, f.message),
                ),
                None => (ErrorClass::Internal, "no subtask produced a result".to_string()),
            };
            error!(task_id = %task.id, class = %class, error = %message, "Task failed");
            trace.advance(TaskState::Failed, Some(message.clone()));
            return Drive {
                result: TaskResult::failure(class, message),
                subtasks: reports,
                synthesized: false,
            };
        }

        if decomposed && succeeded.len() > 1 {
            trace.advance(
                TaskState::Synthesizing,
                Some(format!("{} results, {failed} failed", succeeded.len())),
            );
            let parts: Vec<MergeInput<'_>> = succeeded
                .iter()
                .map(|r| MergeInput {
                    task_type: &r.task_type,
                    worker_id: r.worker_id().unwrap_or(SUPERVISOR_ID),
                    result: &r.result,
                })
                .collect();
            let synthesis = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                s = self.synthesizer.merge(task, &parts, failed > 0) => Some(s),
            };
            let Some(synthesis) = synthesis else {
                return abort(trace, cancelled(), reports);
            };
            let how = if synthesis.model_used {
                "model synthesis"
            } else {
                "structured merge"
            };
            trace.advance(TaskState::Done, Some(how.to_string()));
            return Drive {
                result: synthesis.result,
                subtasks: reports,
                synthesized: true,
            };
        }

        trace.advance(TaskState::DirectResult, None);
        let mut result = succeeded[0].result.clone();
        if failed > 0 && result.status == ResultStatus::Success {
            result.status = ResultStatus::Partial;
        }
        trace.advance(TaskState::Done, None);
        Drive {
            result,
            subtasks: reports,
            synthesized: false,
        }
    }

    /// Run a subtask on its routed worker and, if that fails, exactly once
    /// on the worker's registered backup. The same worker is never retried.
    async fn execute_with_failover(
        &self,
        task: &Task,
        worker_id: &str,
        ctx: &WorkingContext,
        cancel: &CancellationToken,
    ) -> Execution {
        let mut attempts = vec![worker_id.to_string()];
        let first = match self.run_worker(worker_id, task, ctx, cancel).await {
            Ok(result) => {
                return Execution {
                    attempts,
                    outcome: Ok(result),
                }
            }
            Err(e) => e,
        };
        if matches!(
            first,
            SwitchboardError::Cancelled(_) | SwitchboardError::UnknownTaskType { .. }
        ) {
            return Execution {
                attempts,
                outcome: Err(first),
            };
        }
        self.note_failure(task, worker_id, &first).await;

        let backup = match self.registry.get_backup(worker_id) {
            Ok(Some(backup)) if backup.worker_id != worker_id => backup,
            Ok(_) => {
                return Execution {
                    attempts,
                    outcome: Err(first),
                }
            }
            Err(e) => {
                warn!(worker_id, error = %e, "Backup lookup failed");
                return Execution {
                    attempts,
                    outcome: Err(first),
                };
            }
        };

        info!(
            task_id = %task.id,
            from = worker_id,
            to = %backup.worker_id,
            "Failing over to backup worker"
        );
        self.monitor.record_failover(worker_id).await;
        self.publish(
            task,
            EventKind::WORKER_FAILOVER,
            vec![worker_id.to_string(), SUPERVISOR_ID.to_string()],
            serde_json::json!({
                "failed_worker": worker_id,
                "backup_worker": backup.worker_id,
                "error": first.to_string(),
            }),
        )
        .await;

        attempts.push(backup.worker_id.clone());
        let outcome = match self.run_worker(&backup.worker_id, task, ctx, cancel).await {
            Ok(result) => Ok(result),
            Err(SwitchboardError::Cancelled(m)) => Err(SwitchboardError::Cancelled(m)),
            Err(e) => {
                self.note_failure(task, &backup.worker_id, &e).await;
                Err(SwitchboardError::Worker(format!(
                    "'{worker_id}' failed ({first}); backup '{}' failed ({e})",
                    backup.worker_id
                )))
            }
        };
        Execution { attempts, outcome }
    }

    /// One execution attempt under the worker's concurrency permit and the
    /// configured timeout. An error-status result counts as a failure.
    async fn run_worker(
        &self,
        worker_id: &str,
        task: &Task,
        ctx: &WorkingContext,
        cancel: &CancellationToken,
    ) -> SwitchboardResult<TaskResult> {
        let (worker, _permit) = cancellable(cancel, self.pool.acquire(worker_id)).await?;
        self.monitor.start_task(worker_id, task.id).await;
        self.mark_status(worker_id, AgentStatus::Busy);
        let started = Instant::now();
        let timeout = Duration::from_millis(self.config.worker_timeout_ms);

        let outcome = cancellable(cancel, async {
            match tokio::time::timeout(timeout, worker.execute(task, ctx)).await {
                Ok(result) => result,
                Err(_) => Err(SwitchboardError::Timeout(format!(
                    "worker '{worker_id}' exceeded {timeout:?}"
                ))),
            }
        })
        .await;

        let in_flight = self
            .monitor
            .finish_task(worker_id, task.id, started.elapsed().as_millis() as u64)
            .await;

        let outcome = match outcome {
            Ok(result) => match &result.error {
                Some(failure) if failure.class == ErrorClass::UnknownTaskType => {
                    Err(SwitchboardError::UnknownTaskType {
                        worker_id: worker_id.to_string(),
                        task_type: task.task_type.clone(),
                    })
                }
                Some(failure) => Err(SwitchboardError::Worker(format!(
                    "'{worker_id}' returned {}: {}",
                    failure.class, failure.message
                ))),
                None => Ok(result),
            },
            Err(e) => Err(e),
        };

        // Genuine failures are marked Error by `note_failure`.
        let settled = matches!(
            outcome,
            Ok(_) | Err(SwitchboardError::Cancelled(_) | SwitchboardError::UnknownTaskType { .. })
        );
        if in_flight == 0 && settled {
            self.mark_status(worker_id, AgentStatus::Idle);
        }
        outcome
    }

    /// Update a worker's registry status unless an operator took it offline.
    fn mark_status(&self, worker_id: &str, status: AgentStatus) {
        if self
            .registry
            .get(worker_id)
            .is_some_and(|r| r.status != AgentStatus::Offline)
        {
            if let Err(e) = self.registry.set_status(worker_id, status) {
                debug!(worker_id, error = %e, status = %status, "Could not update worker status");
            }
        }
    }

    async fn note_failure(&self, task: &Task, worker_id: &str, err: &SwitchboardError) {
        warn!(task_id = %task.id, worker_id, error = %err, "Worker execution failed");
        self.monitor.record_failure(worker_id).await;
        self.mark_status(worker_id, AgentStatus::Error);
        self.publish(
            task,
            EventKind::WORKER_FAILED,
            vec![worker_id.to_string(), SUPERVISOR_ID.to_string()],
            serde_json::json!({ "worker_id": worker_id, "error": err.to_string() }),
        )
        .await;
    }

    /// Validate a worker result as a handoff to the supervisor. A rejected
    /// handoff becomes a failed result carrying the reasons.
    async fn accept_result(
        &self,
        task: &Task,
        exec: &Execution,
        upstream: &[String],
        ctx: &WorkingContext,
    ) -> (Option<ValidationOutcome>, TaskResult) {
        let result = match &exec.outcome {
            Ok(result) => result,
            Err(e) => return (None, TaskResult::failure(e.class(), e.to_string())),
        };
        let Some(source) = exec.attempts.last() else {
            return (
                None,
                TaskResult::failure(ErrorClass::Internal, "result without a worker"),
            );
        };

        let handoff_type = self
            .config
            .result_handoff_types
            .get(&task.task_type)
            .cloned()
            .unwrap_or_else(|| task.task_type.clone());
        let data = if result.data.is_object() {
            result.data.clone()
        } else {
            serde_json::json!({ "result": result.data })
        };
        let mut chain: Vec<String> = upstream
            .iter()
            .filter(|w| !exec.attempts.contains(w))
            .cloned()
            .collect();
        chain.extend(exec.attempts.iter().cloned());

        let payload = HandoffPayload::new(&task.tenant_id, source.clone(), SUPERVISOR_ID, handoff_type, data)
            .with_call_chain(chain.clone())
            .with_confidence(result.confidence)
            .with_task(task.id);

        let mut evidence = ctx.evidence();
        evidence.push(task_text(task));
        let outcome = self.validator.validate_for_type(&payload, &evidence).await;

        if outcome.accepted {
            self.publish(
                task,
                EventKind::HANDOFF_ACCEPTED,
                chain,
                serde_json::json!({
                    "handoff_id": payload.id,
                    "handoff_type": payload.handoff_type,
                    "strictness": outcome.strictness,
                    "semantic_checked": outcome.semantic_checked,
                    "degraded": outcome.degraded,
                }),
            )
            .await;
            (Some(outcome), result.clone())
        } else {
            warn!(
                task_id = %task.id,
                worker_id = %source,
                reasons = ?outcome.reasons,
                "Worker result rejected at handoff"
            );
            self.monitor.record_rejection(source).await;
            self.publish(
                task,
                EventKind::HANDOFF_REJECTED,
                chain,
                serde_json::json!({
                    "handoff_id": payload.id,
                    "handoff_type": payload.handoff_type,
                    "reasons": outcome.reasons,
                }),
            )
            .await;
            let message = outcome.reasons.join("; ");
            (
                Some(outcome),
                TaskResult::failure(ErrorClass::HandoffRejected, message),
            )
        }
    }

    /// Publish a lifecycle event. Failures are logged, never propagated.
    async fn publish(
        &self,
        task: &Task,
        kind: &str,
        call_chain: Vec<String>,
        mut payload: serde_json::Value,
    ) {
        let Some(events) = &self.events else {
            return;
        };
        let Some(source) = call_chain.last().cloned() else {
            return;
        };
        if let Some(obj) = payload.as_object_mut() {
            obj.insert("task_id".into(), serde_json::json!(task.id));
            if let Some(parent) = task.parent_task {
                obj.insert("parent_task".into(), serde_json::json!(parent));
            }
        }
        let correlation = task.parent_task.unwrap_or(task.id);
        let event = Event::new(task.tenant_id.clone(), kind, source, payload)
            .with_call_chain(call_chain)
            .with_correlation_id(correlation.to_string());
        let bus = events.bus(&task.tenant_id);
        if let Err(e) = bus.publish(&self.config.events_stream, &event).await {
            warn!(task_id = %task.id, kind, error = %e, "Failed to publish lifecycle event");
        }
    }
}

fn cancelled() -> SwitchboardError {
    SwitchboardError::Cancelled("task cancelled".into())
}

fn abort(trace: &mut TaskTrace, err: SwitchboardError, subtasks: Vec<SubtaskReport>) -> Drive {
    if matches!(err, SwitchboardError::Cancelled(_)) {
        trace.advance(TaskState::Cancelled, None);
    } else {
        error!(task_id = %trace.task_id, error = %err, "Task failed");
        trace.advance(TaskState::Failed, Some(err.to_string()));
    }
    Drive {
        result: TaskResult::failure(err.class(), err.to_string()),
        subtasks,
        synthesized: false,
    }
}

/// Copy of `task` carrying its dependencies' results under [`UPSTREAM_PARAM`].
fn with_upstream(task: &Task, depends_on: &[usize], reports: &[SubtaskReport]) -> Task {
    if depends_on.is_empty() {
        return task.clone();
    }
    let upstream: Vec<serde_json::Value> = depends_on
        .iter()
        .map(|&d| {
            let r = &reports[d];
            serde_json::json!({
                "task_type": r.task_type,
                "worker_id": r.worker_id(),
                "data": r.result.data,
            })
        })
        .collect();
    task.clone()
        .with_param(UPSTREAM_PARAM, serde_json::Value::Array(upstream))
}

fn upstream_workers(depends_on: &[usize], reports: &[SubtaskReport]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for &d in depends_on {
        if let Some(w) = reports[d].worker_id() {
            if !out.iter().any(|x| x == w) {
                out.push(w.to_string());
            }
        }
    }
    out
}
