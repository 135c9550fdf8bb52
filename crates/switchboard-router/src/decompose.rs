use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use switchboard_core::{RouterConfig, SwitchboardError, SwitchboardResult, Task};
use switchboard_llm::{complete_json, ChatMessage, CompletionRequest, CompletionService, ModelTier};
use tracing::{debug, info, warn};

/// Parameter holding an explicit step list.
pub const STEPS_PARAM: &str = "steps";
/// Boolean parameter chaining explicit steps one after another.
pub const SEQUENTIAL_PARAM: &str = "sequential";

const SPLIT_PROMPT: &str = "You split a business request into the smallest set of \
independent subtasks a specialist could each complete alone. Keep a request whole when its \
parts share one object or only make sense together. Mark a dependency only when a subtask \
needs another's output. Reply with JSON only: \
{\"subtasks\": [{\"task_type\": \"<verb>\", \"instruction\": \"...\", \"depends_on\": [<index>]}]}";

/// Model-assisted plans remembered per decomposer before the oldest is dropped.
pub const DEFAULT_MEMO_CAPACITY: usize = 256;

#[allow(clippy::expect_used)]
fn separator_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\s*(?:;|\.\s+|,?\s+and\s+then\s+|,?\s+then\s+|,\s*and\s+|\s+and\s+|,\s*)\s*")
            .expect("static separator pattern")
    })
}

#[allow(clippy::expect_used)]
fn lead_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^(?:(then|next|finally|afterwards|after that)|also|first|please),?\s+")
            .expect("static lead pattern")
    })
}

/// One planned subtask: what to do and which earlier steps it waits for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedStep {
    /// Task type of the step; empty inherits the parent type.
    #[serde(default)]
    pub task_type: String,
    /// What the step should do.
    pub instruction: String,
    /// Indices of earlier steps this one waits for.
    #[serde(default)]
    pub depends_on: Vec<usize>,
    /// Explicit worker for the step, if the plan names one.
    #[serde(default)]
    pub target_worker_id: Option<String>,
}

/// A planned step materialised as a child task.
#[derive(Debug, Clone, PartialEq)]
pub struct Subtask {
    /// The child task.
    pub task: Task,
    /// Indices of the subtasks this one waits for.
    pub depends_on: Vec<usize>,
}

/// A validated, acyclic subtask graph.
#[derive(Debug, Clone, PartialEq)]
pub struct Decomposition {
    subtasks: Vec<Subtask>,
    waves: Vec<Vec<usize>>,
}

impl Decomposition {
    /// Validate dependency indices and reject cycles.
    pub fn new(subtasks: Vec<Subtask>) -> SwitchboardResult<Self> {
        let n = subtasks.len();
        for (i, s) in subtasks.iter().enumerate() {
            for &d in &s.depends_on {
                if d >= n {
                    return Err(SwitchboardError::Routing(format!(
                        "subtask {i} depends on unknown subtask {d}"
                    )));
                }
                if d == i {
                    return Err(SwitchboardError::Routing(format!(
                        "subtask {i} depends on itself"
                    )));
                }
            }
        }

        let mut placed = vec![false; n];
        let mut waves = Vec::new();
        let mut remaining = n;
        while remaining > 0 {
            let wave: Vec<usize> = (0..n)
                .filter(|&i| !placed[i] && subtasks[i].depends_on.iter().all(|&d| placed[d]))
                .collect();
            if wave.is_empty() {
                return Err(SwitchboardError::Routing(
                    "dependency cycle detected in subtask graph".into(),
                ));
            }
            for &i in &wave {
                placed[i] = true;
            }
            remaining -= wave.len();
            waves.push(wave);
        }

        Ok(Self { subtasks, waves })
    }

    /// Subtasks in plan order.
    pub fn subtasks(&self) -> &[Subtask] {
        &self.subtasks
    }

    /// Number of subtasks.
    pub fn len(&self) -> usize {
        self.subtasks.len()
    }

    /// Whether the plan is empty.
    pub fn is_empty(&self) -> bool {
        self.subtasks.is_empty()
    }

    /// Subtask indices grouped into execution waves. Subtasks in one wave
    /// have no edges between them; each wave depends only on earlier ones.
    pub fn waves(&self) -> &[Vec<usize>] {
        &self.waves
    }

    /// `(dependency, dependent)` pairs.
    pub fn edges(&self) -> Vec<(usize, usize)> {
        self.subtasks
            .iter()
            .enumerate()
            .flat_map(|(i, s)| s.depends_on.iter().map(move |&d| (d, i)))
            .collect()
    }

    /// The plan without task ids, for comparing two decompositions.
    pub fn plan(&self) -> Vec<PlannedStep> {
        self.subtasks
            .iter()
            .map(|s| PlannedStep {
                task_type: s.task.task_type.clone(),
                instruction: s.task.instruction.clone(),
                depends_on: s.depends_on.clone(),
                target_worker_id: s.task.target_worker_id.clone(),
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct ModelPlan {
    subtasks: Vec<PlannedStep>,
}

/// Insertion-ordered plan cache that drops its oldest entry when full.
struct PlanMemo {
    plans: HashMap<String, Vec<PlannedStep>>,
    order: VecDeque<String>,
    capacity: usize,
}

impl PlanMemo {
    fn new(capacity: usize) -> Self {
        Self {
            plans: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn get(&self, key: &str) -> Option<Vec<PlannedStep>> {
        self.plans.get(key).cloned()
    }

    /// Keep the first plan stored under `key` and return it.
    fn insert(&mut self, key: String, plan: Vec<PlannedStep>) -> Vec<PlannedStep> {
        if let Some(existing) = self.plans.get(&key) {
            return existing.clone();
        }
        while self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.plans.remove(&oldest);
            }
        }
        self.order.push_back(key.clone());
        self.plans.insert(key, plan.clone());
        plan
    }

    fn len(&self) -> usize {
        self.plans.len()
    }
}

/// Conservative task decomposition.
///
/// Fires only on explicit structure (a `steps` parameter) or on free text
/// made of at least two clauses that each start with a known action verb.
/// Anything ambiguous stays a single task.
pub struct Decomposer {
    action_verbs: HashSet<String>,
    max_subtasks: usize,
    completion: Option<Arc<dyn CompletionService>>,
    model_assisted: bool,
    model_timeout: Duration,
    memo: Mutex<PlanMemo>,
}

impl Decomposer {
    /// Decomposer using the configured action verbs and an optional planning model.
    pub fn new(config: &RouterConfig, completion: Option<Arc<dyn CompletionService>>) -> Self {
        Self {
            action_verbs: config
                .action_verbs
                .iter()
                .map(|v| v.trim().to_lowercase())
                .collect(),
            max_subtasks: config.max_subtasks.max(2),
            completion,
            model_assisted: config.model_assisted_decomposition,
            model_timeout: Duration::from_millis(config.model_timeout_ms),
            memo: Mutex::new(PlanMemo::new(DEFAULT_MEMO_CAPACITY)),
        }
    }

    /// Limit how many model-assisted plans are remembered.
    pub fn with_memo_capacity(self, capacity: usize) -> Self {
        Self {
            memo: Mutex::new(PlanMemo::new(capacity)),
            ..self
        }
    }

    /// Number of remembered model-assisted plans.
    pub fn memo_len(&self) -> usize {
        self.memo.lock().len()
    }

    /// Split a task, or `None` when it should run as a single unit.
    pub async fn decompose(&self, task: &Task) -> SwitchboardResult<Option<Decomposition>> {
        if let Some(steps) = task.params.get(STEPS_PARAM) {
            let plan = self.plan_from_steps(task, steps)?;
            if plan.len() < 2 {
                return Ok(None);
            }
            return self.build(task, plan).map(Some);
        }

        let Some(heuristic) = self.plan_from_text(&task.instruction) else {
            return Ok(None);
        };

        let plan = if self.model_assisted && self.completion.is_some() {
            self.model_plan(task, heuristic).await
        } else {
            heuristic
        };
        self.build(task, plan).map(Some)
    }

    fn build(&self, task: &Task, plan: Vec<PlannedStep>) -> SwitchboardResult<Decomposition> {
        let mut inherited = task.params.clone();
        inherited.remove(STEPS_PARAM);
        inherited.remove(SEQUENTIAL_PARAM);

        let subtasks = plan
            .into_iter()
            .map(|step| {
                let mut sub = task.subtask(step.task_type, step.instruction);
                sub.params = inherited.clone();
                sub.target_worker_id = step.target_worker_id;
                Subtask {
                    task: sub,
                    depends_on: step.depends_on,
                }
            })
            .collect();
        let decomposition = Decomposition::new(subtasks)?;
        debug!(
            task_id = %task.id,
            subtasks = decomposition.len(),
            waves = decomposition.waves().len(),
            "Decomposed task"
        );
        Ok(decomposition)
    }

    fn leading_verb(&self, text: &str) -> Option<String> {
        let first = text.split_whitespace().next()?;
        let word: String = first
            .chars()
            .filter(|c| c.is_alphanumeric())
            .collect::<String>()
            .to_lowercase();
        self.action_verbs.contains(&word).then_some(word)
    }

    fn plan_from_steps(
        &self,
        task: &Task,
        steps: &serde_json::Value,
    ) -> SwitchboardResult<Vec<PlannedStep>> {
        let items = steps.as_array().ok_or_else(|| {
            SwitchboardError::Routing(format!("'{STEPS_PARAM}' must be an array"))
        })?;
        if items.len() > self.max_subtasks {
            return Err(SwitchboardError::Routing(format!(
                "{} steps exceed the limit of {}",
                items.len(),
                self.max_subtasks
            )));
        }
        let sequential = task
            .params
            .get(SEQUENTIAL_PARAM)
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);

        let mut plan = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            let mut step = match item {
                serde_json::Value::String(text) => PlannedStep {
                    task_type: self
                        .leading_verb(text)
                        .unwrap_or_else(|| task.task_type.clone()),
                    instruction: text.trim().to_string(),
                    depends_on: Vec::new(),
                    target_worker_id: None,
                },
                serde_json::Value::Object(_) => {
                    let mut step: PlannedStep = serde_json::from_value(item.clone())
                        .map_err(|e| SwitchboardError::Routing(format!("invalid step {i}: {e}")))?;
                    if step.task_type.trim().is_empty() {
                        step.task_type = task.task_type.clone();
                    }
                    step
                }
                other => {
                    return Err(SwitchboardError::Routing(format!(
                        "step {i} must be a string or an object, got {other}"
                    )))
                }
            };
            if step.instruction.trim().is_empty() {
                return Err(SwitchboardError::Routing(format!("step {i} has no instruction")));
            }
            if sequential && i > 0 && step.depends_on.is_empty() {
                step.depends_on.push(i - 1);
            }
            plan.push(step);
        }
        Ok(plan)
    }

    /// Split free text on clause connectives. Every clause must lead with a
    /// known action verb and carry an object; otherwise the text is treated
    /// as one task. A `then` connective makes a clause wait for the previous one.
    pub fn plan_from_text(&self, text: &str) -> Option<Vec<PlannedStep>> {
        let text = text.trim().trim_end_matches(['.', '!']);
        if text.is_empty() {
            return None;
        }

        let mut raw: Vec<(String, bool)> = Vec::new();
        let mut last = 0;
        let mut pending_then = false;
        for m in separator_re().find_iter(text) {
            raw.push((text[last..m.start()].to_string(), pending_then));
            pending_then = m.as_str().to_lowercase().contains("then");
            last = m.end();
        }
        raw.push((text[last..].to_string(), pending_then));

        let mut plan: Vec<PlannedStep> = Vec::new();
        for (clause, mut after_previous) in raw {
            let mut clause = clause.trim().trim_end_matches(['.', '!']).to_string();
            while let Some(caps) = lead_re().captures(&clause) {
                if caps.get(1).is_some() {
                    after_previous = true;
                }
                let end = caps.get(0).map_or(0, |m| m.end());
                clause = clause[end..].to_string();
            }
            if clause.is_empty() {
                continue;
            }
            let verb = self.leading_verb(&clause)?;
            if clause.split_whitespace().count() < 2 {
                return None;
            }
            let depends_on = if after_previous && !plan.is_empty() {
                vec![plan.len() - 1]
            } else {
                Vec::new()
            };
            plan.push(PlannedStep {
                task_type: verb,
                instruction: clause,
                depends_on,
                target_worker_id: None,
            });
        }

        if plan.len() < 2 {
            return None;
        }
        if plan.len() > self.max_subtasks {
            debug!(clauses = plan.len(), limit = self.max_subtasks, "Too many clauses, not decomposing");
            return None;
        }
        Some(plan)
    }

    fn memo_key(task: &Task) -> String {
        format!(
            "{}\u{1f}{}\u{1f}{}",
            task.tenant_id,
            task.task_type,
            task.instruction.trim()
        )
    }

    /// Ask the reasoning tier for a better split. The first answer for an
    /// input (or the heuristic plan when the model fails) is memoised so
    /// repeated decompositions agree.
    async fn model_plan(&self, task: &Task, heuristic: Vec<PlannedStep>) -> Vec<PlannedStep> {
        let key = Self::memo_key(task);
        if let Some(plan) = self.memo.lock().get(&key) {
            return plan;
        }

        let plan = match self.ask_model(task).await {
            Ok(plan) if plan.len() >= 2 && plan.len() <= self.max_subtasks => {
                info!(task_id = %task.id, subtasks = plan.len(), "Model-assisted decomposition");
                plan
            }
            Ok(plan) => {
                warn!(
                    task_id = %task.id,
                    subtasks = plan.len(),
                    "Model split out of range, using clause split"
                );
                heuristic
            }
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Model decomposition failed, using clause split");
                heuristic
            }
        };

        self.memo.lock().insert(key, plan)
    }

    async fn ask_model(&self, task: &Task) -> SwitchboardResult<Vec<PlannedStep>> {
        let service = self
            .completion
            .as_ref()
            .ok_or_else(|| SwitchboardError::Completion("no completion service".into()))?;
        let request = CompletionRequest::new(
            ModelTier::Reasoning,
            vec![
                ChatMessage::system(SPLIT_PROMPT),
                ChatMessage::user(task.instruction.clone()),
            ],
        )
        .with_temperature(0.0)
        .for_tenant(&task.tenant_id);

        let parsed: ModelPlan =
            tokio::time::timeout(self.model_timeout, complete_json(service.as_ref(), request))
                .await
                .map_err(|_| {
                    SwitchboardError::Timeout(format!(
                        "decomposition exceeded {:?}",
                        self.model_timeout
                    ))
                })??;

        let mut plan = parsed.subtasks;
        for step in &mut plan {
            if step.task_type.trim().is_empty() {
                step.task_type = self
                    .leading_verb(&step.instruction)
                    .unwrap_or_else(|| task.task_type.clone());
            }
        }
        // Surface bad indices or cycles here so the caller can fall back.
        let candidate: Vec<Subtask> = plan
            .iter()
            .map(|s| Subtask {
                task: task.subtask(s.task_type.clone(), s.instruction.clone()),
                depends_on: s.depends_on.clone(),
            })
            .collect();
        Decomposition::new(candidate)?;
        Ok(plan)
    }
}
