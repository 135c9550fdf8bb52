use crate::backends::{backend_for, ChatBackend};
use crate::service::CompletionService;
use crate::types::{Completion, CompletionRequest, ModelTier};
use async_trait::async_trait;
use std::time::Duration;
use switchboard_core::{LlmConfig, RetryPolicy, SwitchboardError, SwitchboardResult};
use tracing::{info, warn};

/// Type alias for the injectable sleep function used in tests.
#[cfg(test)]
type SleepFn = Box<
    dyn Fn(u64) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> + Send + Sync,
>;

/// Backoff before retry `attempt` (0-based), doubling and capped.
fn compute_backoff(policy: &RetryPolicy, attempt: u32) -> u64 {
    let delay = policy
        .backoff_base_ms
        .saturating_mul(2u64.saturating_pow(attempt));
    delay.min(policy.backoff_max_ms)
}

/// A completion service with one ordered fallback chain per model tier.
///
/// For each request it walks the requested tier's chain in order. Within a
/// backend it retries transient errors (see
/// [`SwitchboardError::is_transient`]) with exponential backoff; a
/// non-transient error or exhausted retries moves on to the next backend.
/// Each attempt is bounded by the per-call timeout. A tier with no backends
/// borrows the other tier's chain.
pub struct TieredCompletion {
    fast: Vec<Box<dyn ChatBackend>>,
    reasoning: Vec<Box<dyn ChatBackend>>,
    policy: RetryPolicy,
    timeout: Duration,
    #[cfg(test)]
    sleep_fn: Option<SleepFn>,
}

impl TieredCompletion {
    /// Service over ordered fast and reasoning chains, each backend retried per `policy`.
    pub fn new(
        fast: Vec<Box<dyn ChatBackend>>,
        reasoning: Vec<Box<dyn ChatBackend>>,
        policy: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            fast,
            reasoning,
            policy,
            timeout,
            #[cfg(test)]
            sleep_fn: None,
        }
    }

    /// Build both chains from configuration.
    pub fn from_config(config: &LlmConfig) -> Self {
        Self::new(
            config.fast.iter().cloned().map(backend_for).collect(),
            config.reasoning.iter().cloned().map(backend_for).collect(),
            config.retry.clone(),
            Duration::from_millis(config.request_timeout_ms),
        )
    }

    fn chain(&self, tier: ModelTier) -> &[Box<dyn ChatBackend>] {
        let (own, other) = match tier {
            ModelTier::Fast => (&self.fast, &self.reasoning),
            ModelTier::Reasoning => (&self.reasoning, &self.fast),
        };
        if own.is_empty() {
            other
        } else {
            own
        }
    }

    async fn do_sleep(&self, ms: u64) {
        #[cfg(test)]
        if let Some(ref f) = self.sleep_fn {
            f(ms).await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

#[async_trait]
impl CompletionService for TieredCompletion {
    async fn complete(&self, request: CompletionRequest) -> SwitchboardResult<Completion> {
        let chain = self.chain(request.tier);
        if chain.is_empty() {
            return Err(SwitchboardError::Completion(
                "no completion backends configured".into(),
            ));
        }

        let mut last_err: Option<SwitchboardError> = None;
        for backend in chain {
            for attempt in 0..=self.policy.max_retries {
                let call = backend.chat(&request.messages, request.temperature, request.max_tokens);
                let result = match tokio::time::timeout(self.timeout, call).await {
                    Ok(result) => result,
                    Err(_) => Err(SwitchboardError::Timeout(format!(
                        "model '{}' did not answer within {:?}",
                        backend.model_id(),
                        self.timeout
                    ))),
                };
                match result {
                    Ok(completion) => return Ok(completion),
                    Err(e) => {
                        if !e.is_transient() {
                            warn!(
                                tier = %request.tier,
                                model = backend.model_id(),
                                attempt,
                                error = %e,
                                "Non-retryable completion error, moving to next backend"
                            );
                            last_err = Some(e);
                            break;
                        }
                        if attempt < self.policy.max_retries {
                            let delay = compute_backoff(&self.policy, attempt);
                            info!(
                                tier = %request.tier,
                                model = backend.model_id(),
                                attempt,
                                delay_ms = delay,
                                error = %e,
                                "Retryable completion error, backing off"
                            );
                            self.do_sleep(delay).await;
                        }
                        last_err = Some(e);
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            SwitchboardError::Completion("all completion backends exhausted".into())
        }))
    }
}
