//! 计划调整：根据观察与执行状态决定是否改写剩余计划
//!
//! 触发条件按顺序判断，先命中者生效：失败率 > 性能 > 资源异常 > 重复失败 > 洞察。
//! 改写后的计划必须通过校验（同 id / name、至少一个任务、依赖图合法），否则保留原计划。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::config::AdjusterSection;
use crate::core::ExecutionState;
use crate::llm::{LlmError, Reasoner, ReasoningTier};
use crate::plan::{group_by_dependencies, keys, validate_plan, Plan, PlanError, RateLimit, Task, TaskId};
use crate::react::observation::{AnomalyKind, Observation, Severity};

const INSIGHT_KEYWORDS: [&str; 4] = ["reconsider", "alternative", "optimize", "restructure"];

/// 触发调整的原因
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdjustmentTrigger {
    HighFailureRate { rate: f64 },
    SlowExecution { execution_time_ms: u64 },
    HighMemory,
    HighCpu,
    RepeatedFailures { task_id: TaskId },
    Insight { insight: String },
}

impl AdjustmentTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdjustmentTrigger::HighFailureRate { .. } => "high_failure_rate",
            AdjustmentTrigger::SlowExecution { .. } => "slow_execution",
            AdjustmentTrigger::HighMemory => "high_memory",
            AdjustmentTrigger::HighCpu => "high_cpu",
            AdjustmentTrigger::RepeatedFailures { .. } => "repeated_failures",
            AdjustmentTrigger::Insight { .. } => "insight",
        }
    }
}

/// adjust 的结果
#[derive(Debug, Clone)]
pub enum Adjustment {
    Unchanged,
    Adjusted {
        plan: Plan,
        trigger: AdjustmentTrigger,
        strategy: &'static str,
    },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AdjustmentError {
    #[error("Adjusted plan changed id from {original} to {adjusted}")]
    IdChanged { original: String, adjusted: String },
    #[error("Adjusted plan changed name from {original} to {adjusted}")]
    NameChanged { original: String, adjusted: String },
    #[error("Adjusted plan is invalid: {0}")]
    InvalidPlan(#[from] PlanError),
    #[error("Task {0} not found in plan")]
    UnknownTask(TaskId),
    #[error("Reasoner unavailable: {0}")]
    Reasoner(#[from] LlmError),
}

/// 计划调整器
pub struct PlanAdjuster {
    thresholds: AdjusterSection,
    reasoner: Option<Arc<dyn Reasoner>>,
    reasoner_timeout: Duration,
}

impl PlanAdjuster {
    pub fn new(thresholds: AdjusterSection) -> Self {
        Self {
            thresholds,
            reasoner: None,
            reasoner_timeout: Duration::from_secs(30),
        }
    }

    /// 「alternative」类洞察需要预言机给出替代方案；调用在 timeout 内必须返回
    pub fn with_reasoner(mut self, reasoner: Arc<dyn Reasoner>, timeout: Duration) -> Self {
        self.reasoner = Some(reasoner);
        self.reasoner_timeout = timeout;
        self
    }

    /// 判断是否需要调整（不改动计划）
    pub fn evaluate(&self, obs: &Observation, state: &ExecutionState) -> Option<AdjustmentTrigger> {
        let rate = state.failure_rate();
        if rate > self.thresholds.failure_rate {
            return Some(AdjustmentTrigger::HighFailureRate { rate });
        }
        if let Some(ms) = obs
            .metrics
            .execution_time_ms
            .filter(|ms| *ms > self.thresholds.slow_execution_ms)
        {
            return Some(AdjustmentTrigger::SlowExecution { execution_time_ms: ms });
        }
        if obs.has_anomaly(AnomalyKind::HighMemory) {
            return Some(AdjustmentTrigger::HighMemory);
        }
        if obs.has_anomaly(AnomalyKind::HighCpu) {
            return Some(AdjustmentTrigger::HighCpu);
        }
        if let Some(anomaly) = obs
            .anomalies
            .iter()
            .find(|a| a.severity == Severity::Error || a.kind == AnomalyKind::RepeatedFailures)
        {
            return Some(AdjustmentTrigger::RepeatedFailures {
                task_id: anomaly.task_id.clone(),
            });
        }
        obs.insights
            .iter()
            .find(|i| {
                let lower = i.to_lowercase();
                INSIGHT_KEYWORDS.iter().any(|k| lower.contains(k))
            })
            .map(|insight| AdjustmentTrigger::Insight {
                insight: insight.clone(),
            })
    }

    pub async fn adjust(
        &self,
        plan: &Plan,
        obs: &Observation,
        state: &ExecutionState,
    ) -> Result<Adjustment, AdjustmentError> {
        let Some(trigger) = self.evaluate(obs, state) else {
            return Ok(Adjustment::Unchanged);
        };

        let unresolved: HashSet<TaskId> = state.remaining_tasks().into_iter().collect();
        let remaining: HashSet<TaskId> = plan
            .tasks
            .iter()
            .filter(|t| !state.contains(&t.id) || unresolved.contains(&t.id))
            .map(|t| t.id.clone())
            .collect();

        let mut adjusted = plan.clone();
        let strategy = match &trigger {
            AdjustmentTrigger::HighFailureRate { .. } => {
                simplify(&mut adjusted, &remaining);
                "simplify_remaining"
            }
            AdjustmentTrigger::SlowExecution { .. } => {
                parallelize(&mut adjusted, &remaining);
                "parallelize"
            }
            AdjustmentTrigger::HighMemory => {
                halve_batch_size(&mut adjusted, &remaining);
                "reduce_batch_size"
            }
            AdjustmentTrigger::HighCpu => {
                let limit = RateLimit {
                    max_concurrent_tasks: self.thresholds.rate_limit_max_concurrent,
                    inter_task_delay_ms: self.thresholds.rate_limit_delay_ms,
                };
                inject_rate_limit(&mut adjusted, &remaining, limit);
                "rate_limit"
            }
            AdjustmentTrigger::RepeatedFailures { task_id } => {
                replace_or_mark_optional(&mut adjusted, task_id)?
            }
            AdjustmentTrigger::Insight { insight } => {
                let lower = insight.to_lowercase();
                if lower.contains("optimize") {
                    optimize(&mut adjusted, &remaining, state);
                    "optimize"
                } else if lower.contains("alternative") {
                    let suggestion = self.suggest_alternative(plan, insight).await?;
                    adjusted.metadata.insert(
                        "suggested_restructuring".to_string(),
                        json!({ "insight": insight, "suggestion": suggestion }),
                    );
                    "alternative_approach"
                } else {
                    strip_satisfied_dependencies(&mut adjusted, &remaining, state);
                    "generic_optimization"
                }
            }
        };

        validate_adjusted(plan, &adjusted)?;

        let record = json!({
            "trigger": trigger,
            "strategy": strategy,
            "at": Utc::now().to_rfc3339(),
        });
        match adjusted.metadata.get_mut("adjustments") {
            Some(Value::Array(list)) => list.push(record),
            _ => {
                adjusted
                    .metadata
                    .insert("adjustments".to_string(), Value::Array(vec![record]));
            }
        }

        tracing::info!(
            plan_id = %plan.id,
            trigger = trigger.as_str(),
            strategy,
            "Plan adjusted"
        );
        Ok(Adjustment::Adjusted {
            plan: adjusted,
            trigger,
            strategy,
        })
    }

    async fn suggest_alternative(&self, plan: &Plan, insight: &str) -> Result<Option<String>, LlmError> {
        let Some(reasoner) = &self.reasoner else {
            return Ok(None);
        };
        let tasks = plan
            .tasks
            .iter()
            .map(|t| format!("- {} ({}): {}", t.id, t.complexity, t.name))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "Plan: {}\nTasks:\n{}\nObservation: {}\nSuggest an alternative way to structure the remaining work.",
            plan.name, tasks, insight
        );
        match tokio::time::timeout(
            self.reasoner_timeout,
            reasoner.generate(&prompt, ReasoningTier::Advanced),
        )
        .await
        {
            Ok(result) => result.map(Some),
            Err(_) => Err(LlmError::Timeout(self.reasoner_timeout.as_secs())),
        }
    }
}

/// 同 id / name、至少一个任务、依赖图合法
fn validate_adjusted(original: &Plan, adjusted: &Plan) -> Result<(), AdjustmentError> {
    if original.id != adjusted.id {
        return Err(AdjustmentError::IdChanged {
            original: original.id.clone(),
            adjusted: adjusted.id.clone(),
        });
    }
    if original.name != adjusted.name {
        return Err(AdjustmentError::NameChanged {
            original: original.name.clone(),
            adjusted: adjusted.name.clone(),
        });
    }
    validate_plan(adjusted)?;
    Ok(())
}

fn remaining_mut<'a>(
    plan: &'a mut Plan,
    remaining: &'a HashSet<TaskId>,
) -> impl Iterator<Item = &'a mut Task> + 'a {
    plan.tasks.iter_mut().filter(move |t| remaining.contains(&t.id))
}

fn simplify(plan: &mut Plan, remaining: &HashSet<TaskId>) {
    for task in remaining_mut(plan, remaining) {
        task.complexity = task.complexity.simplified();
        task.metadata.insert(keys::SIMPLIFIED.to_string(), json!(true));
    }
}

fn parallelize(plan: &mut Plan, remaining: &HashSet<TaskId>) {
    let groups = group_by_dependencies(plan.tasks.iter().filter(|t| remaining.contains(&t.id)));
    for (index, group) in groups.into_iter().enumerate() {
        for task_id in group {
            if let Some(task) = plan.task_mut(&task_id) {
                task.metadata
                    .insert(keys::PARALLEL_GROUP.to_string(), json!(index));
            }
        }
    }
}

fn halve_batch_size(plan: &mut Plan, remaining: &HashSet<TaskId>) {
    for task in remaining_mut(plan, remaining) {
        if let Some(size) = task.batch_size() {
            task.metadata
                .insert(keys::BATCH_SIZE.to_string(), json!((size / 2).max(1)));
        }
    }
}

fn inject_rate_limit(plan: &mut Plan, remaining: &HashSet<TaskId>, limit: RateLimit) {
    let value = json!(limit);
    plan.metadata.insert(keys::RATE_LIMIT.to_string(), value.clone());
    for task in remaining_mut(plan, remaining) {
        task.metadata.insert(keys::RATE_LIMIT.to_string(), value.clone());
    }
}

/// 用第一个替代定义替换失败任务（保留 id），没有替代则标记为可选
fn replace_or_mark_optional(plan: &mut Plan, task_id: &str) -> Result<&'static str, AdjustmentError> {
    let task = plan
        .task_mut(task_id)
        .ok_or_else(|| AdjustmentError::UnknownTask(task_id.to_string()))?;

    let mut alternatives = task.alternatives().to_vec();
    let first = (!alternatives.is_empty()).then(|| alternatives.remove(0));
    let Some(Value::Object(alt)) = first else {
        task.metadata.insert(keys::OPTIONAL.to_string(), json!(true));
        return Ok("mark_optional");
    };

    if let Some(name) = alt.get("name").and_then(Value::as_str) {
        task.name = name.to_string();
    }
    if let Some(description) = alt.get("description").and_then(Value::as_str) {
        task.description = description.to_string();
    }
    if let Some(complexity) = alt
        .get("complexity")
        .cloned()
        .and_then(|c| serde_json::from_value(c).ok())
    {
        task.complexity = complexity;
    }
    if let Some(deps) = alt
        .get("dependencies")
        .cloned()
        .and_then(|d| serde_json::from_value::<Vec<TaskId>>(d).ok())
    {
        task.dependencies = deps;
    }
    // 旧的后端提示不再适用
    for key in [keys::WORKFLOW, keys::ENGINE, keys::QUERY, keys::TOOL, keys::ACTION] {
        task.metadata.remove(key);
    }
    if let Some(Value::Object(meta)) = alt.get("metadata") {
        task.metadata.extend(meta.clone());
    }
    task.metadata
        .insert(keys::ALTERNATIVES.to_string(), Value::Array(alternatives));
    task.metadata.insert("replaced".to_string(), json!(true));
    Ok("replace_with_alternative")
}

fn strip_satisfied_dependencies(plan: &mut Plan, remaining: &HashSet<TaskId>, state: &ExecutionState) {
    for task in remaining_mut(plan, remaining) {
        task.dependencies
            .retain(|d| !state.completed_tasks().contains(d));
    }
}

/// 去掉已满足的依赖，并按未满足依赖数把剩余任务前移
fn optimize(plan: &mut Plan, remaining: &HashSet<TaskId>, state: &ExecutionState) {
    strip_satisfied_dependencies(plan, remaining, state);
    let (mut pending, settled): (Vec<Task>, Vec<Task>) = std::mem::take(&mut plan.tasks)
        .into_iter()
        .partition(|t| remaining.contains(&t.id));
    pending.sort_by_key(|t| t.dependencies.len());
    plan.tasks = settled;
    plan.tasks.extend(pending);
}
