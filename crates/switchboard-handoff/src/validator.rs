use crate::payload::HandoffPayload;
use crate::strictness::StrictnessTable;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use switchboard_core::{
    HandoffConfig, Strictness, SwitchboardError, SwitchboardResult, TenantId, SUPERVISOR_ID,
};
use switchboard_llm::{extract_json, ChatMessage, CompletionRequest, CompletionService, ModelTier};
use switchboard_registry::AgentRegistry;
use tracing::{debug, info, warn};

const FACT_CHECK_PROMPT: &str = "You verify data handed from one business worker to another. \
You receive CONTEXT (everything the worker was allowed to know) and CLAIMS (the data it produced). \
A claim is supported only if the CONTEXT states it or it follows directly from the CONTEXT. \
Reply with JSON only: {\"supported\": true|false, \"unsupported_claims\": [\"<claim>\", ...]}";

/// Result of validating one handoff.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationOutcome {
    /// Whether the handoff may proceed.
    pub accepted: bool,
    /// Structural reasons first, then semantic ones.
    pub reasons: Vec<String>,
    /// Strictness that applied.
    pub strictness: Strictness,
    /// The semantic stage produced a verdict.
    pub semantic_checked: bool,
    /// The semantic stage was required but the completion service was
    /// unavailable, so only the structural stage ran. An unreadable verdict
    /// is not an outage: it rejects the handoff instead.
    pub degraded: bool,
}

/// What the fact-check model said about a payload's claims.
#[derive(Debug)]
enum Verdict {
    /// Claims the context does not support; empty when all are supported.
    Checked(Vec<String>),
    /// The model answered, but not with a verdict we can read.
    Unreadable(String),
}

#[derive(Debug, Deserialize)]
struct FactCheck {
    supported: bool,
    #[serde(default)]
    unsupported_claims: Vec<String>,
}

/// Two-stage handoff validator.
///
/// The structural stage always runs. The semantic stage runs only for
/// [`Strictness::Strict`] payloads that passed it. It fails open when the
/// completion service is unavailable and closed when the model's reply
/// cannot be read.
pub struct HandoffValidator {
    registry: Arc<AgentRegistry>,
    completion: Option<Arc<dyn CompletionService>>,
    table: StrictnessTable,
    semantic_timeout: Duration,
}

impl HandoffValidator {
    /// Validator with a strictness table and an optional completion service for fact checks.
    pub fn new(
        registry: Arc<AgentRegistry>,
        completion: Option<Arc<dyn CompletionService>>,
        config: &HandoffConfig,
    ) -> Self {
        Self {
            registry,
            completion,
            table: StrictnessTable::from_config(config),
            semantic_timeout: Duration::from_millis(config.semantic_timeout_ms),
        }
    }

    /// Strictness that applies to `handoff_type`.
    pub fn strictness_for(&self, handoff_type: &str) -> Strictness {
        self.table.resolve(handoff_type)
    }

    /// Schema, call-chain and required-field checks. Returns every violation.
    pub fn check_structure(&self, payload: &HandoffPayload) -> Vec<String> {
        let mut reasons = Vec::new();

        if TenantId::new(payload.tenant_id.as_str()).is_err() {
            reasons.push(format!("invalid tenant id '{}'", payload.tenant_id));
        }
        if payload.source_worker_id.trim().is_empty() {
            reasons.push("source_worker_id is empty".to_string());
        }
        if payload.target_worker_id.trim().is_empty() {
            reasons.push("target_worker_id is empty".to_string());
        }
        if payload.handoff_type.trim().is_empty() {
            reasons.push("handoff_type is empty".to_string());
        }
        if payload.source_worker_id == payload.target_worker_id {
            reasons.push(format!(
                "worker '{}' cannot hand off to itself",
                payload.source_worker_id
            ));
        }

        if !payload.call_chain.contains(&payload.source_worker_id) {
            reasons.push(format!(
                "source '{}' is missing from the call chain",
                payload.source_worker_id
            ));
        }
        if payload.call_chain.contains(&payload.target_worker_id) {
            reasons.push(format!(
                "target '{}' already appears in the call chain (loop)",
                payload.target_worker_id
            ));
        }
        let mut seen = HashSet::new();
        for id in &payload.call_chain {
            if !seen.insert(id.as_str()) {
                reasons.push(format!("call chain repeats worker '{id}'"));
            }
        }

        if !payload.confidence.is_finite() || !(0.0..=1.0).contains(&payload.confidence) {
            reasons.push(format!(
                "confidence {} is outside [0, 1]",
                payload.confidence
            ));
        }

        if !payload.data.is_object() {
            reasons.push("data must be a JSON object".to_string());
        }

        if payload.target_worker_id != SUPERVISOR_ID && !payload.target_worker_id.is_empty() {
            match self.registry.get(&payload.target_worker_id) {
                None => reasons.push(format!(
                    "target '{}' is not a registered worker",
                    payload.target_worker_id
                )),
                Some(target) => {
                    for field in &target.required_fields {
                        if !has_field(&payload.data, field) {
                            reasons.push(format!(
                                "missing required field '{field}' for target '{}'",
                                target.worker_id
                            ));
                        }
                    }
                }
            }
        }

        reasons
    }

    /// Validate with an explicit strictness. `evidence` is the context that
    /// was available to the source worker.
    pub async fn validate(
        &self,
        payload: &HandoffPayload,
        strictness: Strictness,
        evidence: &[String],
    ) -> ValidationOutcome {
        let mut outcome = ValidationOutcome {
            accepted: false,
            reasons: self.check_structure(payload),
            strictness,
            semantic_checked: false,
            degraded: false,
        };

        if outcome.reasons.is_empty() && strictness == Strictness::Strict {
            match self.fact_check(payload, evidence).await {
                Ok(Verdict::Unreadable(detail)) => {
                    warn!(
                        handoff_id = %payload.id,
                        handoff_type = %payload.handoff_type,
                        source = %payload.source_worker_id,
                        error = %detail,
                        "Fact check reply unreadable, rejecting strict handoff"
                    );
                    outcome
                        .reasons
                        .push(format!("fact check returned an unreadable verdict: {detail}"));
                }
                Ok(Verdict::Checked(unsupported)) => {
                    outcome.semantic_checked = true;
                    outcome.reasons.extend(
                        unsupported
                            .into_iter()
                            .map(|claim| format!("unsupported claim: {claim}")),
                    );
                }
                Err(e) => {
                    warn!(
                        handoff_id = %payload.id,
                        handoff_type = %payload.handoff_type,
                        source = %payload.source_worker_id,
                        target = %payload.target_worker_id,
                        error = %e,
                        "Semantic validation unavailable, accepting on structural checks only"
                    );
                    outcome.degraded = true;
                }
            }
        }

        outcome.accepted = outcome.reasons.is_empty();
        if outcome.accepted {
            debug!(
                handoff_id = %payload.id,
                strictness = %strictness,
                semantic = outcome.semantic_checked,
                "Handoff accepted"
            );
        } else {
            info!(
                handoff_id = %payload.id,
                handoff_type = %payload.handoff_type,
                source = %payload.source_worker_id,
                target = %payload.target_worker_id,
                reasons = ?outcome.reasons,
                "Handoff rejected"
            );
        }
        outcome
    }

    /// Like [`validate`](Self::validate) but turns a rejection into
    /// [`SwitchboardError::HandoffRejected`].
    pub async fn validate_or_reject(
        &self,
        payload: &HandoffPayload,
        strictness: Strictness,
        evidence: &[String],
    ) -> SwitchboardResult<ValidationOutcome> {
        let outcome = self.validate(payload, strictness, evidence).await;
        if outcome.accepted {
            Ok(outcome)
        } else {
            Err(SwitchboardError::HandoffRejected {
                reasons: outcome.reasons,
            })
        }
    }

    /// Validate with the strictness configured for the payload's type.
    pub async fn validate_for_type(
        &self,
        payload: &HandoffPayload,
        evidence: &[String],
    ) -> ValidationOutcome {
        let strictness = self.strictness_for(&payload.handoff_type);
        self.validate(payload, strictness, evidence).await
    }

    /// Ask the fast tier which claims lack support in `evidence`. Errors mean
    /// the service could not answer at all.
    async fn fact_check(
        &self,
        payload: &HandoffPayload,
        evidence: &[String],
    ) -> SwitchboardResult<Verdict> {
        let claims = payload.claims();
        if claims.is_empty() {
            return Ok(Verdict::Checked(Vec::new()));
        }
        let service = self.completion.as_ref().ok_or_else(|| {
            SwitchboardError::Completion("no completion service configured".into())
        })?;

        let context = if evidence.is_empty() {
            "(none)".to_string()
        } else {
            evidence
                .iter()
                .map(|e| format!("- {e}"))
                .collect::<Vec<_>>()
                .join("\n")
        };
        let claim_lines = claims
            .iter()
            .map(|c| format!("- {c}"))
            .collect::<Vec<_>>()
            .join("\n");

        let mut request = CompletionRequest::new(
            ModelTier::Fast,
            vec![
                ChatMessage::system(FACT_CHECK_PROMPT),
                ChatMessage::user(format!("CONTEXT:\n{context}\n\nCLAIMS:\n{claim_lines}")),
            ],
        )
        .with_temperature(0.0);
        if let Ok(tenant) = TenantId::new(payload.tenant_id.as_str()) {
            request = request.for_tenant(&tenant);
        }

        let completion = tokio::time::timeout(self.semantic_timeout, service.complete(request))
            .await
            .map_err(|_| {
                SwitchboardError::Timeout(format!("fact check exceeded {:?}", self.semantic_timeout))
            })??;

        let Some(raw) = extract_json(&completion.text) else {
            return Ok(Verdict::Unreadable(format!(
                "model '{}' returned no JSON object",
                completion.model
            )));
        };
        let verdict: FactCheck = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                return Ok(Verdict::Unreadable(format!(
                    "model '{}' returned malformed JSON: {e}",
                    completion.model
                )))
            }
        };

        if verdict.supported && verdict.unsupported_claims.is_empty() {
            return Ok(Verdict::Checked(Vec::new()));
        }
        if verdict.unsupported_claims.is_empty() {
            return Ok(Verdict::Checked(vec![
                "model found unsupported content without naming it".to_string(),
            ]));
        }
        Ok(Verdict::Checked(verdict.unsupported_claims))
    }
}

/// Whether `data` has a non-null value at a dotted path (`deal.stage`).
fn has_field(data: &serde_json::Value, path: &str) -> bool {
    let mut current = data;
    for part in path.split('.') {
        match current.get(part) {
            Some(next) => current = next,
            None => return false,
        }
    }
    !current.is_null()
}
