use serde::Deserialize;
use std::sync::Arc;
use switchboard_core::{ResultStatus, SwitchboardResult, Task, TaskResult};
use switchboard_llm::{complete_json, ChatMessage, CompletionRequest, CompletionService, ModelTier};
use tracing::{debug, warn};

const SYNTHESIS_PROMPT: &str = "You merge results from several specialist workers into one \
response for the person who made the request. Use only facts present in the results. \
Mention any part that is missing. Reply with JSON only: \
{\"response\": \"<merged response>\", \"confidence\": <0.0-1.0>}";

/// Confidence multiplier applied when results are merged without the model.
const STRUCTURED_MERGE_FACTOR: f32 = 0.8;

/// One successful subtask result to merge.
#[derive(Debug, Clone, Copy)]
pub struct MergeInput<'a> {
    /// Subtask type, used as the section label.
    pub task_type: &'a str,
    /// Worker that produced the result.
    pub worker_id: &'a str,
    /// The result to merge.
    pub result: &'a TaskResult,
}

/// A merged result.
#[derive(Debug, Clone)]
pub struct Synthesis {
    /// Merged result.
    pub result: TaskResult,
    /// The reasoning tier produced the response.
    pub model_used: bool,
}

#[derive(Debug, Deserialize)]
struct SynthesisReply {
    response: String,
    #[serde(default)]
    confidence: Option<f32>,
}

/// Merges several subtask results into one.
pub struct Synthesizer {
    completion: Option<Arc<dyn CompletionService>>,
    use_model: bool,
}

impl Synthesizer {
    /// Synthesizer that asks the model only when `use_model` is set and a service is present.
    pub fn new(completion: Option<Arc<dyn CompletionService>>, use_model: bool) -> Self {
        Self {
            completion,
            use_model,
        }
    }

    /// Merge `parts`. Falls back to a structured merge at lower confidence
    /// when the model is disabled or unavailable. The result is partial
    /// when any part was partial or `incomplete` is set.
    pub async fn merge(&self, task: &Task, parts: &[MergeInput<'_>], incomplete: bool) -> Synthesis {
        let results: Vec<serde_json::Value> = parts
            .iter()
            .map(|p| {
                serde_json::json!({
                    "task_type": p.task_type,
                    "worker_id": p.worker_id,
                    "status": p.result.status,
                    "data": p.result.data,
                })
            })
            .collect();
        let mean = if parts.is_empty() {
            0.0
        } else {
            parts.iter().map(|p| p.result.confidence).sum::<f32>() / parts.len() as f32
        };
        let partial = incomplete || parts.iter().any(|p| p.result.status == ResultStatus::Partial);

        if self.use_model {
            if let Some(service) = &self.completion {
                match self.ask_model(service.as_ref(), task, parts).await {
                    Ok(reply) => {
                        debug!(task_id = %task.id, parts = parts.len(), "Synthesized with model");
                        let confidence = reply
                            .confidence
                            .filter(|c| c.is_finite())
                            .map_or(mean, |c| c.clamp(0.0, 1.0).min(mean));
                        let data = serde_json::json!({
                            "response": reply.response,
                            "results": results,
                        });
                        return Synthesis {
                            result: envelope(data, confidence, partial),
                            model_used: true,
                        };
                    }
                    Err(e) => {
                        warn!(task_id = %task.id, error = %e, "Model synthesis failed, using structured merge");
                    }
                }
            }
        }

        let response = parts
            .iter()
            .map(|p| format!("- {} ({}): {}", p.task_type, p.worker_id, crate::outcome::response_text(p.result)))
            .collect::<Vec<_>>()
            .join("\n");
        let data = serde_json::json!({
            "response": response,
            "results": results,
        });
        Synthesis {
            result: envelope(data, mean * STRUCTURED_MERGE_FACTOR, partial),
            model_used: false,
        }
    }

    async fn ask_model(
        &self,
        service: &dyn CompletionService,
        task: &Task,
        parts: &[MergeInput<'_>],
    ) -> SwitchboardResult<SynthesisReply> {
        let mut user = format!("Request: {}\n\nResults:\n", task.instruction);
        for p in parts {
            user.push_str(&format!("[{} via {}] {}\n", p.task_type, p.worker_id, p.result.data));
        }
        let request = CompletionRequest::new(
            ModelTier::Reasoning,
            vec![ChatMessage::system(SYNTHESIS_PROMPT), ChatMessage::user(user)],
        )
        .with_temperature(0.2)
        .for_tenant(&task.tenant_id);
        complete_json(service, request).await
    }
}

fn envelope(data: serde_json::Value, confidence: f32, partial: bool) -> TaskResult {
    if partial {
        TaskResult::partial(data, confidence)
    } else {
        TaskResult::success(data, confidence)
    }
}
