//! 模拟执行后端（用于演示与测试，无需真实工作流 / 引擎 / 工具）
//!
//! 每次派发在固定延迟后完成；可按任务脚本化失败次数与返回结果。

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;

use crate::backend::{
    ComputeBackend, DispatchError, Dispatched, FailureKind, FallbackExecutor, TaskFailure,
    ToolBackend, WorkflowBackend,
};
use crate::plan::Task;

#[derive(Debug, Clone)]
struct FailureScript {
    remaining: u32,
    failure: TaskFailure,
}

/// 模拟后端：同时实现四种派发形态
#[derive(Debug)]
pub struct SimulatedBackend {
    latency: Duration,
    failures: Mutex<HashMap<String, FailureScript>>,
    results: Mutex<HashMap<String, Value>>,
    dispatches: Mutex<HashMap<String, u32>>,
}

impl SimulatedBackend {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            failures: Mutex::new(HashMap::new()),
            results: Mutex::new(HashMap::new()),
            dispatches: Mutex::new(HashMap::new()),
        }
    }

    /// 让 key 对应的任务先失败 times 次
    pub fn fail_times(self, key: impl Into<String>, times: u32, kind: FailureKind) -> Self {
        self.fail_with(key, times, TaskFailure::new(kind, "simulated failure"))
    }

    pub fn fail_with(mut self, key: impl Into<String>, times: u32, failure: TaskFailure) -> Self {
        self.failures
            .get_mut()
            .insert(key.into(), FailureScript { remaining: times, failure });
        self
    }

    /// 覆盖 key 的返回结果（与默认结果合并，可用于注入 metrics / insights）
    pub fn with_result(mut self, key: impl Into<String>, result: Value) -> Self {
        self.results.get_mut().insert(key.into(), result);
        self
    }

    /// key 被派发的次数
    pub async fn dispatch_count(&self, key: &str) -> u32 {
        self.dispatches.lock().await.get(key).copied().unwrap_or(0)
    }

    async fn simulate(&self, key: String, backend: &'static str, input: Value) -> Dispatched {
        *self.dispatches.lock().await.entry(key.clone()).or_insert(0) += 1;

        let scripted_failure = {
            let mut failures = self.failures.lock().await;
            match failures.get_mut(&key) {
                Some(script) if script.remaining > 0 => {
                    script.remaining -= 1;
                    Some(script.failure.clone())
                }
                _ => None,
            }
        };

        let mut output = Map::new();
        output.insert("task_id".to_string(), json!(key));
        output.insert("backend".to_string(), json!(backend));
        output.insert("output".to_string(), input);
        if let Some(Value::Object(extra)) = self.results.lock().await.get(&key).cloned() {
            output.extend(extra);
        }

        let latency = self.latency;
        let reference = format!("sim:{}:{}", backend, key);
        Dispatched::new(reference, async move {
            tokio::time::sleep(latency).await;
            match scripted_failure {
                Some(failure) => Err(failure),
                None => Ok(Value::Object(output)),
            }
        })
    }
}

/// 执行器注入的 `_execution.task_id`，没有则用引用名
fn task_key(input: &Value, fallback: &str) -> String {
    input
        .get("_execution")
        .and_then(|e| e.get("task_id"))
        .and_then(Value::as_str)
        .unwrap_or(fallback)
        .to_string()
}

#[async_trait]
impl WorkflowBackend for SimulatedBackend {
    async fn dispatch(&self, module: &str, input: Value) -> Result<Dispatched, DispatchError> {
        let key = task_key(&input, module);
        Ok(self.simulate(key, "workflow", input).await)
    }
}

#[async_trait]
impl ComputeBackend for SimulatedBackend {
    async fn submit(&self, engine: &str, query: &str) -> Result<Dispatched, DispatchError> {
        if query.trim().is_empty() {
            return Err(DispatchError::InvalidInput(format!("empty query for engine {}", engine)));
        }
        Ok(self.simulate(engine.to_string(), "engine", json!({ "query": query })).await)
    }
}

#[async_trait]
impl ToolBackend for SimulatedBackend {
    async fn invoke(&self, tool: &str, action: &str, params: Value) -> Result<Dispatched, DispatchError> {
        let key = task_key(&params, tool);
        let input = json!({ "action": action, "params": params });
        Ok(self.simulate(key, "tool", input).await)
    }
}

#[async_trait]
impl FallbackExecutor for SimulatedBackend {
    async fn run(&self, task: &Task, input: Value) -> Result<Dispatched, DispatchError> {
        Ok(self.simulate(task.id.clone(), "fallback", input).await)
    }
}
