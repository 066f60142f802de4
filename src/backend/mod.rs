//! 执行后端抽象
//!
//! 三种派发形态（工作流 / 计算引擎 / 工具）加一个兜底执行器；派发成功返回 Dispatched，
//! 其 completion future 最终给出任务结果或 TaskFailure。派发目标按元数据优先级选取一次。

pub mod simulated;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::plan::{keys, Task, TaskId};

pub use simulated::SimulatedBackend;

/// 任务失败类别（决定下一次思考选择的 approach）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    ResourceUnavailable,
    ValidationFailed,
    MissingField,
    Dispatch,
    Execution,
    Cancelled,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::ResourceUnavailable => "resource_unavailable",
            FailureKind::ValidationFailed => "validation_failed",
            FailureKind::MissingField => "missing_field",
            FailureKind::Dispatch => "dispatch",
            FailureKind::Execution => "execution",
            FailureKind::Cancelled => "cancelled",
        }
    }
}

/// 派发出去的工作报告的失败
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{}: {message}", .kind.as_str())]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
    /// 校验类失败涉及的字段
    #[serde(default)]
    pub field: Option<String>,
}

impl TaskFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            field: None,
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Execution, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, message)
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }
}

/// 派发本身失败（后端未能启动），与任务执行失败区分
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    #[error("No {0} backend registered")]
    BackendUnavailable(&'static str),
    #[error("Dependencies not met for {task_id}: {missing:?}")]
    DependenciesNotMet { task_id: TaskId, missing: Vec<TaskId> },
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Backend rejected dispatch: {0}")]
    Rejected(String),
}

pub type Completion = BoxFuture<'static, Result<Value, TaskFailure>>;

/// 已派发的动作：后端引用 + 完成信号
pub struct Dispatched {
    pub reference: String,
    pub completion: Completion,
}

impl Dispatched {
    pub fn new<F>(reference: impl Into<String>, completion: F) -> Self
    where
        F: Future<Output = Result<Value, TaskFailure>> + Send + 'static,
    {
        Self {
            reference: reference.into(),
            completion: Box::pin(completion),
        }
    }
}

impl std::fmt::Debug for Dispatched {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatched").field("reference", &self.reference).finish()
    }
}

/// 派发目标
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DispatchTarget {
    Workflow { module: String },
    Engine { engine: String, query: String },
    Tool { tool: String, action: String },
    Fallback,
}

impl DispatchTarget {
    /// 优先级：workflow > engine > tool > fallback
    pub fn for_task(task: &Task) -> Self {
        if let Some(module) = task.meta_str(keys::WORKFLOW) {
            return DispatchTarget::Workflow { module: module.to_string() };
        }
        if let Some(engine) = task.meta_str(keys::ENGINE) {
            let query = task
                .meta_str(keys::QUERY)
                .map(String::from)
                .unwrap_or_else(|| task.description.clone());
            return DispatchTarget::Engine { engine: engine.to_string(), query };
        }
        if let Some(tool) = task.meta_str(keys::TOOL) {
            let action = task.meta_str(keys::ACTION).unwrap_or("run").to_string();
            return DispatchTarget::Tool { tool: tool.to_string(), action };
        }
        DispatchTarget::Fallback
    }

    pub fn label(&self) -> &'static str {
        match self {
            DispatchTarget::Workflow { .. } => "workflow",
            DispatchTarget::Engine { .. } => "engine",
            DispatchTarget::Tool { .. } => "tool",
            DispatchTarget::Fallback => "fallback",
        }
    }
}

/// 工作流派发：(module_ref, input)
#[async_trait]
pub trait WorkflowBackend: Send + Sync {
    async fn dispatch(&self, module: &str, input: Value) -> Result<Dispatched, DispatchError>;
}

/// 长时计算引擎派发：(engine_ref, query)
#[async_trait]
pub trait ComputeBackend: Send + Sync {
    async fn submit(&self, engine: &str, query: &str) -> Result<Dispatched, DispatchError>;
}

/// 外部工具调用：(tool_ref, action, params)
#[async_trait]
pub trait ToolBackend: Send + Sync {
    async fn invoke(&self, tool: &str, action: &str, params: Value) -> Result<Dispatched, DispatchError>;
}

/// 兜底执行器：没有后端提示的任务走这里，同样必须回报完成或失败
#[async_trait]
pub trait FallbackExecutor: Send + Sync {
    async fn run(&self, task: &Task, input: Value) -> Result<Dispatched, DispatchError>;
}

/// 进程内兜底：直接以输入作为输出完成
#[derive(Debug, Default)]
pub struct InlineExecutor;

#[async_trait]
impl FallbackExecutor for InlineExecutor {
    async fn run(&self, task: &Task, input: Value) -> Result<Dispatched, DispatchError> {
        let output = json!({
            "task_id": task.id,
            "executor": "inline",
            "output": input,
        });
        Ok(Dispatched::new(format!("inline:{}", task.id), async move { Ok(output) }))
    }
}

/// 已注册的执行后端集合
#[derive(Clone)]
pub struct Backends {
    workflow: Option<Arc<dyn WorkflowBackend>>,
    compute: Option<Arc<dyn ComputeBackend>>,
    tool: Option<Arc<dyn ToolBackend>>,
    fallback: Arc<dyn FallbackExecutor>,
}

impl Backends {
    pub fn new(fallback: Arc<dyn FallbackExecutor>) -> Self {
        Self {
            workflow: None,
            compute: None,
            tool: None,
            fallback,
        }
    }

    /// 同一个模拟后端承担全部四种形态
    pub fn simulated(backend: Arc<SimulatedBackend>) -> Self {
        Self {
            workflow: Some(backend.clone()),
            compute: Some(backend.clone()),
            tool: Some(backend.clone()),
            fallback: backend,
        }
    }

    pub fn with_workflow(mut self, backend: Arc<dyn WorkflowBackend>) -> Self {
        self.workflow = Some(backend);
        self
    }

    pub fn with_compute(mut self, backend: Arc<dyn ComputeBackend>) -> Self {
        self.compute = Some(backend);
        self
    }

    pub fn with_tool(mut self, backend: Arc<dyn ToolBackend>) -> Self {
        self.tool = Some(backend);
        self
    }

    /// 按目标派发；目标对应的后端未注册时返回 BackendUnavailable
    pub async fn dispatch(
        &self,
        task: &Task,
        target: &DispatchTarget,
        input: Value,
    ) -> Result<Dispatched, DispatchError> {
        match target {
            DispatchTarget::Workflow { module } => {
                let backend = self
                    .workflow
                    .as_ref()
                    .ok_or(DispatchError::BackendUnavailable("workflow"))?;
                backend.dispatch(module, input).await
            }
            DispatchTarget::Engine { engine, query } => {
                let backend = self
                    .compute
                    .as_ref()
                    .ok_or(DispatchError::BackendUnavailable("engine"))?;
                backend.submit(engine, query).await
            }
            DispatchTarget::Tool { tool, action } => {
                let backend = self
                    .tool
                    .as_ref()
                    .ok_or(DispatchError::BackendUnavailable("tool"))?;
                backend.invoke(tool, action, input).await
            }
            DispatchTarget::Fallback => self.fallback.run(task, input).await,
        }
    }
}

impl Default for Backends {
    fn default() -> Self {
        Self::new(Arc::new(InlineExecutor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_precedence() {
        let all = Task::new("t", "T")
            .with_metadata(keys::TOOL, json!("grep"))
            .with_metadata(keys::ENGINE, json!("spark"))
            .with_metadata(keys::WORKFLOW, json!("etl.load"));
        assert_eq!(
            DispatchTarget::for_task(&all),
            DispatchTarget::Workflow { module: "etl.load".to_string() }
        );

        let engine_and_tool = Task::new("t", "T")
            .with_description("select 1")
            .with_metadata(keys::TOOL, json!("grep"))
            .with_metadata(keys::ENGINE, json!("spark"));
        assert_eq!(
            DispatchTarget::for_task(&engine_and_tool),
            DispatchTarget::Engine { engine: "spark".to_string(), query: "select 1".to_string() }
        );

        let tool = Task::new("t", "T").with_metadata(keys::TOOL, json!("grep"));
        assert_eq!(
            DispatchTarget::for_task(&tool),
            DispatchTarget::Tool { tool: "grep".to_string(), action: "run".to_string() }
        );

        assert_eq!(DispatchTarget::for_task(&Task::new("t", "T")), DispatchTarget::Fallback);
    }

    #[tokio::test]
    async fn test_missing_backend_is_dispatch_error() {
        let backends = Backends::default();
        let task = Task::new("t", "T").with_metadata(keys::WORKFLOW, json!("etl.load"));
        let target = DispatchTarget::for_task(&task);
        let err = backends.dispatch(&task, &target, json!({})).await.unwrap_err();
        assert_eq!(err, DispatchError::BackendUnavailable("workflow"));
    }

    #[tokio::test]
    async fn test_inline_fallback_completes() {
        let backends = Backends::default();
        let task = Task::new("t", "T");
        let dispatched = backends
            .dispatch(&task, &DispatchTarget::Fallback, json!({"x": 1}))
            .await
            .unwrap();
        let output = dispatched.completion.await.unwrap();
        assert_eq!(output["output"]["x"], 1);
        assert_eq!(output["executor"], "inline");
    }
}
