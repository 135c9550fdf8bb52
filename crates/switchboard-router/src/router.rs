use crate::decision::{RoutingDecision, RoutingMethod};
use crate::decompose::{Decomposer, Decomposition};
use crate::rule::RoutingRule;
use parking_lot::RwLock;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use switchboard_core::{
    RouterConfig, SwitchboardError, SwitchboardResult, Task, WorkingContext,
};
use switchboard_llm::{complete_json, ChatMessage, CompletionRequest, CompletionService, ModelTier};
use switchboard_registry::{render_catalog, AgentRegistry, AgentStatus};
use tracing::{debug, info, warn};

const ROUTING_PROMPT: &str = "You route business tasks to exactly one worker. \
Choose only from the worker ids listed in the catalog. Reply with JSON only: \
{\"worker_id\": \"<id from the catalog>\", \"reasoning\": \"<one sentence>\", \"confidence\": <0.0-1.0>}";

const DEFAULT_MODEL_CONFIDENCE: f32 = 0.7;

#[derive(Debug, Deserialize)]
struct ModelChoice {
    worker_id: String,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    confidence: Option<f32>,
}

/// Rule-first router with a model-assisted fallback.
///
/// Rules are pure predicates evaluated in order. When none matches, the fast
/// tier picks from the registry catalog. Routing fails closed: if the model
/// is unavailable or names an unknown worker the task is not routed.
pub struct HybridRouter {
    registry: Arc<AgentRegistry>,
    completion: Option<Arc<dyn CompletionService>>,
    rules: RwLock<Vec<RoutingRule>>,
    decomposer: Decomposer,
    model_timeout: Duration,
}

impl HybridRouter {
    /// Router with the configured rules. Fails on an invalid rule.
    pub fn new(
        registry: Arc<AgentRegistry>,
        completion: Option<Arc<dyn CompletionService>>,
        config: &RouterConfig,
    ) -> SwitchboardResult<Self> {
        let rules = config
            .rules
            .iter()
            .map(RoutingRule::from_config)
            .collect::<SwitchboardResult<Vec<_>>>()?;
        info!(rules = rules.len(), model_fallback = completion.is_some(), "Router initialized");
        Ok(Self {
            registry,
            decomposer: Decomposer::new(config, completion.clone()),
            completion,
            rules: RwLock::new(rules),
            model_timeout: Duration::from_millis(config.model_timeout_ms),
        })
    }

    /// Builder form of [`add_rule`](Self::add_rule).
    pub fn with_rule(self, rule: RoutingRule) -> Self {
        self.add_rule(rule);
        self
    }

    /// Append a rule after the existing ones.
    pub fn add_rule(&self, rule: RoutingRule) {
        debug!(rule = %rule.name, worker_id = %rule.worker_id, "Added routing rule");
        self.rules.write().push(rule);
    }

    /// Number of rules.
    pub fn rule_count(&self) -> usize {
        self.rules.read().len()
    }

    /// Route a task with no working context.
    pub async fn route(&self, task: &Task) -> SwitchboardResult<RoutingDecision> {
        self.route_with_context(task, None).await
    }

    /// Route with the compiled working context available to the model.
    pub async fn route_with_context(
        &self,
        task: &Task,
        context: Option<&WorkingContext>,
    ) -> SwitchboardResult<RoutingDecision> {
        if let Some(target) = &task.target_worker_id {
            if !self.registry.contains(target) {
                return Err(SwitchboardError::Routing(format!(
                    "explicit target '{target}' is not a registered worker"
                )));
            }
            return Ok(RoutingDecision {
                worker_id: target.clone(),
                reasoning: "explicit target on task".into(),
                confidence: 1.0,
                method: RoutingMethod::Explicit,
            });
        }

        if let Some(decision) = self.match_rules(task) {
            debug!(task_id = %task.id, worker_id = %decision.worker_id, "Routed by rule");
            return Ok(decision);
        }

        match self.route_by_model(task, context).await {
            Ok(decision) => {
                info!(
                    task_id = %task.id,
                    worker_id = %decision.worker_id,
                    confidence = decision.confidence,
                    "Routed by model"
                );
                Ok(decision)
            }
            Err(e) => {
                warn!(task_id = %task.id, task_type = %task.task_type, error = %e, "Routing failed closed");
                Err(match e {
                    SwitchboardError::Routing(_) => e,
                    other => SwitchboardError::Routing(format!(
                        "no rule matched task type '{}' and model routing failed: {other}",
                        task.task_type
                    )),
                })
            }
        }
    }

    fn match_rules(&self, task: &Task) -> Option<RoutingDecision> {
        let rules = self.rules.read();
        for rule in rules.iter().filter(|r| r.matches(task)) {
            match self.registry.get(&rule.worker_id) {
                Some(reg) if reg.status != AgentStatus::Offline => {
                    return Some(RoutingDecision {
                        worker_id: rule.worker_id.clone(),
                        reasoning: format!("matched rule {}", rule.name),
                        confidence: 1.0,
                        method: RoutingMethod::Rule,
                    });
                }
                Some(_) => debug!(rule = %rule.name, worker_id = %rule.worker_id, "Rule target offline"),
                None => warn!(rule = %rule.name, worker_id = %rule.worker_id, "Rule targets unregistered worker"),
            }
        }
        None
    }

    async fn route_by_model(
        &self,
        task: &Task,
        context: Option<&WorkingContext>,
    ) -> SwitchboardResult<RoutingDecision> {
        let service = self.completion.as_ref().ok_or_else(|| {
            SwitchboardError::Routing(format!(
                "no rule matched task type '{}' and no completion service is configured",
                task.task_type
            ))
        })?;

        let online: Vec<_> = self
            .registry
            .list_all()
            .into_iter()
            .filter(|s| {
                self.registry
                    .get(&s.worker_id)
                    .is_some_and(|r| r.status != AgentStatus::Offline)
            })
            .collect();
        if online.is_empty() {
            return Err(SwitchboardError::Routing("no workers available".into()));
        }

        let mut user = format!(
            "Workers:\n{}\n\nTask type: {}\nRequest: {}",
            render_catalog(&online),
            task.task_type,
            task.instruction
        );
        if !task.params.is_empty() {
            user.push_str(&format!(
                "\nParameters: {}",
                serde_json::Value::Object(task.params.clone())
            ));
        }
        if let Some(ctx) = context {
            user.push_str("\n\nContext:\n");
            user.push_str(&ctx.render());
        }

        let request = CompletionRequest::new(
            ModelTier::Fast,
            vec![ChatMessage::system(ROUTING_PROMPT), ChatMessage::user(user)],
        )
        .with_temperature(0.0)
        .for_tenant(&task.tenant_id);

        let choice: ModelChoice =
            tokio::time::timeout(self.model_timeout, complete_json(service.as_ref(), request))
                .await
                .map_err(|_| {
                    SwitchboardError::Timeout(format!("model routing exceeded {:?}", self.model_timeout))
                })??;

        let worker_id = choice.worker_id.trim();
        if !online.iter().any(|s| s.worker_id == worker_id) {
            return Err(SwitchboardError::Routing(format!(
                "model chose '{worker_id}', which is not an available worker"
            )));
        }

        let confidence = choice
            .confidence
            .filter(|c| c.is_finite())
            .unwrap_or(DEFAULT_MODEL_CONFIDENCE)
            .clamp(0.0, 1.0);
        Ok(RoutingDecision {
            worker_id: worker_id.to_string(),
            reasoning: choice.reasoning,
            confidence,
            method: RoutingMethod::Model,
        })
    }

    /// Split a task into subtasks, or `None` when it should run whole.
    pub async fn decompose(&self, task: &Task) -> SwitchboardResult<Option<Decomposition>> {
        self.decomposer.decompose(task).await
    }
}
