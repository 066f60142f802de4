//! 思考阶段：为任务生成推理结果（理由文本 + approach 标签 + 置信度）
//!
//! 推理文本来自外部预言机；预言机失败或超时时退回确定性模板。
//! approach 与置信度完全由规则计算，不依赖预言机输出的内容。

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::backend::FailureKind;
use crate::core::{DependencyStatus, ExecutionState, History};
use crate::llm::{Reasoner, ReasoningTier};
use crate::plan::{Complexity, Task, TaskId};

const MAX_CONSIDERATIONS: usize = 5;
const GUIDANCE_KEYWORDS: [&str; 8] = [
    "should", "must", "ensure", "consider", "verify", "check", "avoid", "careful",
];

/// 执行策略标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Approach {
    DirectExecution,
    StandardExecution,
    CarefulExecution,
    ValidateThenExecute,
    ExtendedTimeout,
    WaitAndRetry,
    FixAndRetry,
    RetryWithModifications,
}

impl Approach {
    pub fn as_str(self) -> &'static str {
        match self {
            Approach::DirectExecution => "direct_execution",
            Approach::StandardExecution => "standard_execution",
            Approach::CarefulExecution => "careful_execution",
            Approach::ValidateThenExecute => "validate_then_execute",
            Approach::ExtendedTimeout => "extended_timeout",
            Approach::WaitAndRetry => "wait_and_retry",
            Approach::FixAndRetry => "fix_and_retry",
            Approach::RetryWithModifications => "retry_with_modifications",
        }
    }

    /// 按优先级选择：先看上次失败，再看复杂度与依赖数
    pub fn select(task: &Task, prior_attempts: usize, last_failure: Option<FailureKind>) -> Self {
        if prior_attempts >= 1 {
            return match last_failure {
                Some(FailureKind::Timeout) => Approach::ExtendedTimeout,
                Some(FailureKind::ResourceUnavailable) => Approach::WaitAndRetry,
                Some(FailureKind::ValidationFailed) | Some(FailureKind::MissingField) => {
                    Approach::FixAndRetry
                }
                _ => Approach::RetryWithModifications,
            };
        }
        if task.complexity.is_demanding() {
            Approach::CarefulExecution
        } else if task.dependencies.len() > 3 {
            Approach::ValidateThenExecute
        } else if task.complexity == Complexity::Simple {
            Approach::DirectExecution
        } else {
            Approach::StandardExecution
        }
    }
}

impl std::fmt::Display for Approach {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 思考结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thought {
    pub task_id: TaskId,
    pub reasoning: String,
    pub approach: Approach,
    pub considerations: Vec<String>,
    pub dependency_status: BTreeMap<TaskId, DependencyStatus>,
    pub confidence: f64,
    pub metadata: Map<String, Value>,
}

/// 生成推理时可见的上下文
#[derive(Debug, Clone)]
pub struct ThoughtContext {
    pub completed: usize,
    pub failed: usize,
    pub in_flight: usize,
    pub ceiling: usize,
    pub reserved_memory_mb: u64,
    pub prior_attempts: usize,
    pub retries: u32,
    pub last_failure: Option<(FailureKind, String)>,
    pub time_budget: Duration,
    pub dependency_status: BTreeMap<TaskId, DependencyStatus>,
}

impl ThoughtContext {
    pub fn gather(task: &Task, state: &ExecutionState, history: &History, ceiling: usize) -> Self {
        Self {
            completed: state.completed_tasks().len(),
            failed: state.failed_tasks().len(),
            in_flight: state.in_flight_count(),
            ceiling,
            reserved_memory_mb: state.resource_allocations().values().map(|a| a.memory_mb).sum(),
            prior_attempts: history.failure_count(&task.id),
            retries: history.retry_count(&task.id),
            last_failure: history
                .last_failure(&task.id)
                .map(|r| (r.failure.kind, r.failure.message.clone())),
            time_budget: task.complexity.time_budget(),
            dependency_status: state.dependency_status(&task.id),
        }
    }

    fn dependency_line(&self) -> String {
        if self.dependency_status.is_empty() {
            return "none".to_string();
        }
        self.dependency_status
            .iter()
            .map(|(id, status)| {
                let status = serde_json::to_value(status)
                    .ok()
                    .and_then(|v| v.as_str().map(String::from))
                    .unwrap_or_default();
                format!("{}={}", id, status)
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// 思考生成器（Clone 后可在独立任务里完成预言机调用）
#[derive(Clone)]
pub struct ThoughtGenerator {
    reasoner: Arc<dyn Reasoner>,
    timeout: Duration,
}

/// 在运行循环内采集好的思考请求，之后不再需要访问执行状态
#[derive(Debug, Clone)]
pub struct ThoughtRequest {
    pub task: Task,
    pub ctx: ThoughtContext,
    tier: ReasoningTier,
    prompt: String,
    started: Instant,
}

impl ThoughtGenerator {
    pub fn new(reasoner: Arc<dyn Reasoner>, timeout: Duration) -> Self {
        Self { reasoner, timeout }
    }

    /// 同步部分：采集上下文并拼好提示词
    pub fn prepare(
        &self,
        task: &Task,
        state: &ExecutionState,
        history: &History,
        ceiling: usize,
    ) -> ThoughtRequest {
        let ctx = ThoughtContext::gather(task, state, history, ceiling);
        let tier = if task.complexity.is_demanding() {
            ReasoningTier::Advanced
        } else {
            ReasoningTier::Standard
        };
        ThoughtRequest {
            prompt: build_prompt(task, &ctx),
            task: task.clone(),
            ctx,
            tier,
            started: Instant::now(),
        }
    }

    /// 异步部分：调用预言机（受 timeout 约束），失败时退回模板
    pub async fn complete(&self, request: ThoughtRequest) -> Thought {
        let ThoughtRequest {
            task,
            ctx,
            tier,
            prompt,
            started,
        } = request;

        let (reasoning, source) =
            match tokio::time::timeout(self.timeout, self.reasoner.generate(&prompt, tier)).await {
                Ok(Ok(text)) if !text.trim().is_empty() => (text, "oracle"),
                Ok(Ok(_)) => (fallback_reasoning(&task, &ctx), "template"),
                Ok(Err(e)) => {
                    tracing::warn!(task_id = %task.id, error = %e, "Reasoner failed, using template");
                    (fallback_reasoning(&task, &ctx), "template")
                }
                Err(_) => {
                    tracing::warn!(task_id = %task.id, "Reasoner timed out, using template");
                    (fallback_reasoning(&task, &ctx), "template")
                }
            };

        let approach = Approach::select(&task, ctx.prior_attempts, ctx.last_failure.as_ref().map(|f| f.0));
        let confidence = confidence(&task, &ctx, &reasoning);
        let considerations = extract_considerations(&reasoning);

        let mut metadata = Map::new();
        metadata.insert("complexity".to_string(), json!(task.complexity.as_str()));
        metadata.insert("retry_count".to_string(), json!(ctx.retries));
        metadata.insert("prior_attempts".to_string(), json!(ctx.prior_attempts));
        metadata.insert("reasoning_tier".to_string(), json!(tier));
        metadata.insert("reasoning_source".to_string(), json!(source));
        metadata.insert(
            "generation_time_ms".to_string(),
            json!(started.elapsed().as_millis() as u64),
        );

        tracing::debug!(
            task_id = %task.id,
            approach = %approach,
            confidence,
            "Thought generated"
        );

        Thought {
            task_id: task.id,
            reasoning,
            approach,
            considerations,
            dependency_status: ctx.dependency_status,
            confidence,
            metadata,
        }
    }
}

fn build_prompt(task: &Task, ctx: &ThoughtContext) -> String {
    let mut prompt = format!("Task: {} ({})\n", task.name, task.id);
    if !task.description.is_empty() {
        prompt.push_str(&format!("Description: {}\n", task.description));
    }
    prompt.push_str(&format!("Complexity: {}\n", task.complexity));
    prompt.push_str(&format!("Dependencies: {}\n", ctx.dependency_line()));
    prompt.push_str(&format!(
        "Progress: {} completed, {} failed, {} in flight\n",
        ctx.completed, ctx.failed, ctx.in_flight
    ));
    prompt.push_str(&format!(
        "Resources: {} of {} execution slots busy, {} MB reserved\n",
        ctx.in_flight, ctx.ceiling, ctx.reserved_memory_mb
    ));
    prompt.push_str(&format!("Time budget: {}s\n", ctx.time_budget.as_secs()));
    match &ctx.last_failure {
        Some((kind, message)) => prompt.push_str(&format!(
            "Prior attempts: {} (last failure: {}: {})\n",
            ctx.prior_attempts,
            kind.as_str(),
            message
        )),
        None => prompt.push_str("Prior attempts: 0\n"),
    }
    prompt.push_str("How should this task be executed and what needs attention?");
    prompt
}

fn fallback_reasoning(task: &Task, ctx: &ThoughtContext) -> String {
    let satisfied = ctx
        .dependency_status
        .values()
        .filter(|s| **s == DependencyStatus::Completed)
        .count();
    let mut text = format!(
        "Execute task '{}' of {} complexity within {}s. {} of {} dependencies are satisfied.",
        task.name,
        task.complexity,
        ctx.time_budget.as_secs(),
        satisfied,
        ctx.dependency_status.len()
    );
    if let Some((kind, _)) = &ctx.last_failure {
        text.push_str(&format!(
            " The previous attempt failed with {}, so the execution should adapt.",
            kind.as_str()
        ));
    }
    text
}

/// 从 0.8 起按复杂度 / 尝试次数 / 依赖状态 / 推理长度调整，截断到 [0, 1]
fn confidence(task: &Task, ctx: &ThoughtContext, reasoning: &str) -> f64 {
    let mut c = 0.8;
    c += match task.complexity {
        Complexity::Trivial | Complexity::Medium => 0.0,
        Complexity::Simple => 0.1,
        Complexity::Complex => -0.1,
        Complexity::VeryComplex => -0.2,
    };
    c -= 0.05 * ctx.prior_attempts.min(3) as f64;

    if ctx.dependency_status.is_empty() {
        c += 0.05;
    } else if ctx
        .dependency_status
        .values()
        .all(|s| *s == DependencyStatus::Completed)
    {
        c += 0.1;
    } else {
        c -= 0.05;
    }

    let words = reasoning.split_whitespace().count();
    if words < 20 {
        c -= 0.1;
    } else if words > 100 {
        c += 0.05;
    }
    c.clamp(0.0, 1.0)
}

fn bullet_re() -> Option<&'static Regex> {
    static BULLET_RE: OnceLock<Option<Regex>> = OnceLock::new();
    BULLET_RE
        .get_or_init(|| Regex::new(r"^\s*(?:[-*•]|\d+[.)])\s+(.+?)\s*$").ok())
        .as_ref()
}

/// 优先取列表行；没有列表时取含指导性关键词的句子；至多 5 条
pub fn extract_considerations(reasoning: &str) -> Vec<String> {
    let bullets: Vec<String> = match bullet_re() {
        Some(re) => reasoning
            .lines()
            .filter_map(|line| re.captures(line))
            .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
            .take(MAX_CONSIDERATIONS)
            .collect(),
        None => Vec::new(),
    };
    if !bullets.is_empty() {
        return bullets;
    }

    reasoning
        .split(['.', '!', '?', '\n'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter(|s| {
            let lower = s.to_lowercase();
            GUIDANCE_KEYWORDS.iter().any(|k| lower.contains(k))
        })
        .map(String::from)
        .take(MAX_CONSIDERATIONS)
        .collect()
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::backend::TaskFailure;
    use crate::llm::LlmError;

    struct FixedReasoner(Result<String, LlmError>);

    #[async_trait]
    impl Reasoner for FixedReasoner {
        async fn generate(&self, _prompt: &str, _tier: ReasoningTier) -> Result<String, LlmError> {
            self.0.clone()
        }
    }

    struct HangingReasoner;

    #[async_trait]
    impl Reasoner for HangingReasoner {
        async fn generate(&self, _prompt: &str, _tier: ReasoningTier) -> Result<String, LlmError> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok("never".to_string())
        }
    }

    fn generator(reasoner: impl Reasoner + 'static) -> ThoughtGenerator {
        ThoughtGenerator::new(Arc::new(reasoner), Duration::from_millis(50))
    }

    async fn think(
        thoughts: &ThoughtGenerator,
        task: &Task,
        state: &ExecutionState,
        history: &History,
    ) -> Thought {
        thoughts.complete(thoughts.prepare(task, state, history, 5)).await
    }

    fn setup(tasks: &[Task]) -> ExecutionState {
        let mut state = ExecutionState::new();
        state.initialize(tasks);
        state
    }

    #[test]
    fn test_approach_priority() {
        let simple = Task::new("t", "T").with_complexity(Complexity::Simple);
        let complex = Task::new("t", "T").with_complexity(Complexity::Complex);
        let many_deps = Task::new("t", "T").depends_on(["a", "b", "c", "d"]);
        let medium = Task::new("t", "T");

        assert_eq!(Approach::select(&simple, 0, None), Approach::DirectExecution);
        assert_eq!(Approach::select(&complex, 0, None), Approach::CarefulExecution);
        assert_eq!(Approach::select(&many_deps, 0, None), Approach::ValidateThenExecute);
        assert_eq!(Approach::select(&medium, 0, None), Approach::StandardExecution);

        assert_eq!(
            Approach::select(&complex, 1, Some(FailureKind::Timeout)),
            Approach::ExtendedTimeout
        );
        assert_eq!(
            Approach::select(&simple, 2, Some(FailureKind::ResourceUnavailable)),
            Approach::WaitAndRetry
        );
        assert_eq!(
            Approach::select(&simple, 1, Some(FailureKind::MissingField)),
            Approach::FixAndRetry
        );
        assert_eq!(
            Approach::select(&simple, 1, Some(FailureKind::Execution)),
            Approach::RetryWithModifications
        );
    }

    #[tokio::test]
    async fn test_confidence_simple_task_with_short_reasoning() {
        let task = Task::new("t", "T").with_complexity(Complexity::Simple);
        let state = setup(&[task.clone()]);
        let thoughts = generator(FixedReasoner(Ok("Just run it.".to_string())));
        let thought = think(&thoughts, &task, &state, &History::new()).await;
        // 0.8 + 0.1 (simple) + 0.05 (no deps) - 0.1 (short)
        assert!((thought.confidence - 0.85).abs() < 1e-9);
        assert_eq!(thought.approach, Approach::DirectExecution);
        assert_eq!(thought.metadata["reasoning_source"], "oracle");
    }

    #[tokio::test]
    async fn test_confidence_penalised_by_failures() {
        let dep = Task::new("a", "A");
        let task = Task::new("t", "T")
            .with_complexity(Complexity::VeryComplex)
            .depends_on(["a"]);
        let state = setup(&[dep, task.clone()]);
        let mut history = History::new();
        for _ in 0..4 {
            history.record_failure("t", TaskFailure::timeout("slow"));
        }
        let long = "word ".repeat(120);
        let thought = think(&generator(FixedReasoner(Ok(long))), &task, &state, &history).await;
        // 0.8 - 0.2 - 0.15 (max 3 attempts) - 0.05 (pending dep) + 0.05 (long)
        assert!((thought.confidence - 0.45).abs() < 1e-9);
        assert_eq!(thought.approach, Approach::ExtendedTimeout);
        assert_eq!(thought.dependency_status["a"], DependencyStatus::Pending);
    }

    #[tokio::test]
    async fn test_oracle_failure_falls_back_to_template() {
        let task = Task::new("t", "Load data");
        let state = setup(&[task.clone()]);
        let thoughts = generator(FixedReasoner(Err(LlmError::EmptyResponse)));
        let thought = think(&thoughts, &task, &state, &History::new()).await;
        assert!(thought.reasoning.contains("Load data"));
        assert_eq!(thought.metadata["reasoning_source"], "template");
    }

    #[tokio::test]
    async fn test_oracle_timeout_falls_back_to_template() {
        let task = Task::new("t", "Load data");
        let state = setup(&[task.clone()]);
        let thought = think(&generator(HangingReasoner), &task, &state, &History::new()).await;
        assert_eq!(thought.metadata["reasoning_source"], "template");
    }

    #[test]
    fn test_extract_considerations() {
        let text = "Overview first.\n- Check inputs\n2. Verify outputs\n* Watch memory";
        assert_eq!(
            extract_considerations(text),
            vec!["Check inputs", "Verify outputs", "Watch memory"]
        );

        let prose = "Run the job. You should verify the schema. Then finish! Avoid large batches.";
        assert_eq!(
            extract_considerations(prose),
            vec!["You should verify the schema", "Avoid large batches"]
        );
    }
}
