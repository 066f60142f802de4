//! 计划类型定义
//!
//! 定义计划、任务、复杂度等级以及任务元数据的类型化访问

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub type PlanId = String;
pub type TaskId = String;

/// 元数据键（计划调整与执行后端共用）
pub mod keys {
    pub const WORKFLOW: &str = "workflow";
    pub const ENGINE: &str = "engine";
    pub const QUERY: &str = "query";
    pub const TOOL: &str = "tool";
    pub const ACTION: &str = "action";
    pub const INPUT: &str = "input";
    pub const DEFAULTS: &str = "defaults";
    pub const TIMEOUT_MS: &str = "timeout_ms";
    pub const BATCH_SIZE: &str = "batch_size";
    pub const ALTERNATIVES: &str = "alternatives";
    pub const OPTIONAL: &str = "optional";
    pub const SIMPLIFIED: &str = "simplified";
    pub const PARALLEL_GROUP: &str = "parallel_group";
    pub const RATE_LIMIT: &str = "rate_limit";
    pub const RESOURCES: &str = "resources";
    pub const SKIPPABLE: &str = "skippable";
}

/// 任务复杂度等级
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Trivial,
    Simple,
    #[default]
    Medium,
    Complex,
    VeryComplex,
}

impl Complexity {
    /// 降一级：very_complex → complex → medium → simple，simple / trivial 不变
    pub fn simplified(self) -> Self {
        match self {
            Complexity::VeryComplex => Complexity::Complex,
            Complexity::Complex => Complexity::Medium,
            Complexity::Medium => Complexity::Simple,
            other => other,
        }
    }

    /// complex / very_complex 需要更谨慎的执行与更高能力的推理
    pub fn is_demanding(self) -> bool {
        matches!(self, Complexity::Complex | Complexity::VeryComplex)
    }

    /// 按复杂度估算的剩余时间
    pub fn time_budget(self) -> Duration {
        let secs = match self {
            Complexity::Trivial | Complexity::Simple => 60,
            Complexity::Medium => 300,
            Complexity::Complex => 900,
            Complexity::VeryComplex => 1800,
        };
        Duration::from_secs(secs)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Complexity::Trivial => "trivial",
            Complexity::Simple => "simple",
            Complexity::Medium => "medium",
            Complexity::Complex => "complex",
            Complexity::VeryComplex => "very_complex",
        }
    }
}

impl std::fmt::Display for Complexity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 集群级限流（高 CPU 调整时注入）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub max_concurrent_tasks: usize,
    pub inter_task_delay_ms: u64,
}

/// 计划中的单个任务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub complexity: Complexity,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Task {
    pub fn new(id: impl Into<TaskId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            complexity: Complexity::default(),
            dependencies: Vec::new(),
            metadata: Map::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_complexity(mut self, complexity: Complexity) -> Self {
        self.complexity = complexity;
        self
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TaskId>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    pub fn meta_flag(&self, key: &str) -> bool {
        self.metadata.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    /// 后端输入；未声明时为空对象
    pub fn input(&self) -> Value {
        self.metadata
            .get(keys::INPUT)
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new()))
    }

    pub fn timeout_override(&self) -> Option<Duration> {
        self.metadata
            .get(keys::TIMEOUT_MS)
            .and_then(Value::as_u64)
            .map(Duration::from_millis)
    }

    pub fn batch_size(&self) -> Option<u64> {
        self.metadata.get(keys::BATCH_SIZE).and_then(Value::as_u64)
    }

    pub fn is_optional(&self) -> bool {
        self.meta_flag(keys::OPTIONAL)
    }

    pub fn alternatives(&self) -> &[Value] {
        self.metadata
            .get(keys::ALTERNATIVES)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// 一次运行所消费的计划
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Plan {
    pub fn new(name: impl Into<String>, tasks: Vec<Task>) -> Self {
        Self {
            id: format!("plan_{}", uuid::Uuid::new_v4()),
            name: name.into(),
            description: None,
            tasks,
            metadata: Map::new(),
        }
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn task_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    pub fn task_ids(&self) -> Vec<TaskId> {
        self.tasks.iter().map(|t| t.id.clone()).collect()
    }

    pub fn rate_limit(&self) -> Option<RateLimit> {
        self.metadata
            .get(keys::RATE_LIMIT)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn from_json_str(raw: &str) -> Result<Self, PlanError> {
        serde_json::from_str(raw).map_err(|e| PlanError::Parse(e.to_string()))
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, PlanError> {
        toml::from_str(raw).map_err(|e| PlanError::Parse(e.to_string()))
    }

    /// 按扩展名加载计划文件（.toml 走 TOML，其余按 JSON）
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, PlanError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| PlanError::Parse(format!("{}: {}", path.display(), e)))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&raw),
            _ => Self::from_json_str(&raw),
        }
    }
}

/// 计划错误类型
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlanError {
    #[error("Plan has no tasks")]
    EmptyPlan,
    #[error("Duplicate task id: {0}")]
    DuplicateTask(TaskId),
    #[error("Task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: TaskId, dependency: TaskId },
    #[error("Cyclic dependency detected")]
    CyclicDependency,
    #[error("Plan parse error: {0}")]
    Parse(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_complexity_simplified_one_tier() {
        assert_eq!(Complexity::VeryComplex.simplified(), Complexity::Complex);
        assert_eq!(Complexity::Complex.simplified(), Complexity::Medium);
        assert_eq!(Complexity::Medium.simplified(), Complexity::Simple);
        assert_eq!(Complexity::Simple.simplified(), Complexity::Simple);
        assert_eq!(Complexity::Trivial.simplified(), Complexity::Trivial);
    }

    #[test]
    fn test_task_metadata_accessors() {
        let task = Task::new("t1", "Load")
            .with_metadata(keys::TIMEOUT_MS, json!(1500))
            .with_metadata(keys::BATCH_SIZE, json!(64))
            .with_metadata(keys::OPTIONAL, json!(true));

        assert_eq!(task.timeout_override(), Some(Duration::from_millis(1500)));
        assert_eq!(task.batch_size(), Some(64));
        assert!(task.is_optional());
        assert!(task.alternatives().is_empty());
        assert_eq!(task.input(), json!({}));
    }

    #[test]
    fn test_plan_from_toml() {
        let raw = r#"
id = "plan_demo"
name = "Demo"

[[tasks]]
id = "fetch"
name = "Fetch data"
complexity = "simple"

[[tasks]]
id = "report"
name = "Build report"
complexity = "very_complex"
dependencies = ["fetch"]

[tasks.metadata]
batch_size = 32
"#;
        let plan = Plan::from_toml_str(raw).unwrap();
        assert_eq!(plan.id, "plan_demo");
        assert_eq!(plan.tasks.len(), 2);
        let report = plan.task("report").unwrap();
        assert_eq!(report.complexity, Complexity::VeryComplex);
        assert_eq!(report.dependencies, vec!["fetch".to_string()]);
        assert_eq!(report.batch_size(), Some(32));
    }

    #[test]
    fn test_plan_rate_limit_roundtrip() {
        let mut plan = Plan::new("p", vec![Task::new("a", "A")]);
        assert!(plan.rate_limit().is_none());
        plan.metadata.insert(
            keys::RATE_LIMIT.to_string(),
            json!({"max_concurrent_tasks": 2, "inter_task_delay_ms": 500}),
        );
        assert_eq!(
            plan.rate_limit(),
            Some(RateLimit { max_concurrent_tasks: 2, inter_task_delay_ms: 500 })
        );
    }
}
