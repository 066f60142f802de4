//! 行动阶段：按 approach 选择八种执行策略之一，把任务派发到后端
//!
//! 派发成功后立即返回 ActionHandle；真正的执行在独立的 tokio 任务里，
//! 完成、失败、超时或取消都会以 ActionOutcome 发回运行循环。

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::Rng;
use regex::Regex;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::backend::{Backends, Completion, DispatchError, DispatchTarget, FailureKind, TaskFailure};
use crate::config::{AppConfig, BackoffSection};
use crate::core::{ExecutionState, History};
use crate::plan::{keys, Complexity, Task, TaskId};
use crate::react::thought::{Approach, Thought};

/// 动作结束的消息（由派发出去的任务发回运行循环）
#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub action_id: String,
    pub task_id: TaskId,
    pub result: Result<Value, TaskFailure>,
    pub finished_at: DateTime<Utc>,
}

/// 在途动作句柄
#[derive(Debug, Clone)]
pub struct ActionHandle {
    pub action_id: String,
    pub task_id: TaskId,
    pub strategy: Approach,
    pub target: &'static str,
    pub timeout: Duration,
    pub dispatched_at: DateTime<Utc>,
    cancel: CancellationToken,
}

impl ActionHandle {
    pub fn new(
        task_id: impl Into<TaskId>,
        strategy: Approach,
        target: &'static str,
        timeout: Duration,
    ) -> Self {
        Self {
            action_id: format!("act_{}", uuid::Uuid::new_v4()),
            task_id: task_id.into(),
            strategy,
            target,
            timeout,
            dispatched_at: Utc::now(),
            cancel: CancellationToken::new(),
        }
    }

    fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// 执行一次动作需要的运行上下文（由运行循环借出）
pub struct ActionContext<'a> {
    pub state: &'a mut ExecutionState,
    pub history: &'a History,
    pub outcomes: &'a UnboundedSender<ActionOutcome>,
    /// 运行级取消令牌；每个动作拿它的子令牌
    pub cancel: &'a CancellationToken,
}

/// 超时与退避设置
#[derive(Debug, Clone)]
pub struct ActionSettings {
    pub default_timeout: Duration,
    pub max_timeout: Duration,
    pub backoff: BackoffSection,
}

impl Default for ActionSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

impl ActionSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            default_timeout: Duration::from_millis(cfg.executor.action_timeout_ms),
            max_timeout: Duration::from_millis(cfg.executor.max_action_timeout_ms),
            backoff: cfg.backoff.clone(),
        }
    }
}

/// `base × 2^retry + jitter(0..=jitter)`，上限 max
pub fn backoff_delay(retry: u32, cfg: &BackoffSection) -> Duration {
    let exp = cfg.base_ms.saturating_mul(1u64 << retry.min(20));
    let jitter = if cfg.jitter_ms > 0 {
        rand::thread_rng().gen_range(0..=cfg.jitter_ms)
    } else {
        0
    };
    Duration::from_millis(exp.saturating_add(jitter).min(cfg.max_ms))
}

fn timeout_key(task_id: &str) -> String {
    format!("{}:timeout_ms", task_id)
}

/// 派发前准备好的执行参数
#[derive(Debug)]
struct Prepared {
    target: DispatchTarget,
    input: Value,
    timeout: Duration,
    delay: Option<Duration>,
    flags: Map<String, Value>,
    validate_output: bool,
}

/// 行动执行器
#[derive(Clone)]
pub struct ActionExecutor {
    backends: Backends,
    settings: ActionSettings,
}

impl ActionExecutor {
    pub fn new(backends: Backends, settings: ActionSettings) -> Self {
        Self { backends, settings }
    }

    /// 任务当前的动作超时：升级值 > 任务覆盖 > 默认
    pub fn current_timeout(&self, task: &Task, state: &ExecutionState) -> Duration {
        state
            .metadata(&timeout_key(&task.id))
            .and_then(Value::as_u64)
            .map(Duration::from_millis)
            .or_else(|| task.timeout_override())
            .unwrap_or(self.settings.default_timeout)
    }

    fn prepare(
        &self,
        task: &Task,
        thought: &Thought,
        state: &mut ExecutionState,
        history: &History,
    ) -> Result<Prepared, DispatchError> {
        let mut input = match task.input() {
            Value::Object(map) => Value::Object(map),
            Value::Null => Value::Object(Map::new()),
            other if thought.approach == Approach::CarefulExecution => {
                return Err(DispatchError::InvalidInput(format!(
                    "input for {} must be an object, got {}",
                    task.id, other
                )));
            }
            other => json!({ "value": other }),
        };
        let mut timeout = self.current_timeout(task, state);
        let mut delay = None;
        let mut flags = Map::new();
        let mut validate_output = false;

        match thought.approach {
            Approach::DirectExecution => {}
            Approach::StandardExecution => {
                flags.insert("monitor".to_string(), json!(true));
            }
            Approach::CarefulExecution => {
                flags.insert("monitor".to_string(), json!(true));
                flags.insert("validate_input".to_string(), json!(true));
                flags.insert("validate_output".to_string(), json!(true));
                flags.insert("checkpoint_eligible".to_string(), json!(true));
                validate_output = true;
                let factor = match task.complexity {
                    Complexity::VeryComplex => 3,
                    Complexity::Complex => 2,
                    _ => 1,
                };
                timeout = (timeout * factor).min(self.settings.max_timeout);
            }
            Approach::ValidateThenExecute => {
                let missing: Vec<TaskId> = state
                    .dependencies(&task.id)
                    .iter()
                    .filter(|d| !state.completed_tasks().contains(*d))
                    .cloned()
                    .collect();
                if !missing.is_empty() {
                    return Err(DispatchError::DependenciesNotMet {
                        task_id: task.id.clone(),
                        missing,
                    });
                }
                flags.insert("dependencies_validated".to_string(), json!(true));
            }
            Approach::ExtendedTimeout => {
                timeout = (timeout * 2).min(self.settings.max_timeout);
                state.set_metadata(timeout_key(&task.id), json!(timeout.as_millis() as u64));
                flags.insert("extended_timeout".to_string(), json!(true));
            }
            Approach::WaitAndRetry => {
                delay = Some(backoff_delay(
                    history.retry_count(&task.id),
                    &self.settings.backoff,
                ));
            }
            Approach::FixAndRetry => {
                if let Some(record) = history.last_failure(&task.id) {
                    fix_input(task, &mut input, &record.failure);
                }
                flags.insert("fixed".to_string(), json!(true));
            }
            Approach::RetryWithModifications => {
                let attempts = history.failure_count(&task.id);
                if attempts >= 1 {
                    flags.insert("verbose".to_string(), json!(true));
                    flags.insert("diagnostics".to_string(), json!(true));
                }
                if attempts >= 3 {
                    flags.insert(keys::SIMPLIFIED.to_string(), json!(true));
                    flags.insert("mode".to_string(), json!("fallback"));
                }
            }
        }

        if task.meta_flag(keys::SKIPPABLE) {
            flags.insert(keys::SKIPPABLE.to_string(), json!(true));
        }
        if let Value::Object(map) = &mut input {
            map.insert(
                "_execution".to_string(),
                json!({
                    "task_id": task.id,
                    "strategy": thought.approach,
                    "flags": flags.clone(),
                }),
            );
        }

        let mut target = DispatchTarget::for_task(task);
        // 计算引擎只收 query：修正作用在查询文本上，缺失字段的默认值无处注入
        if thought.approach == Approach::FixAndRetry {
            if let DispatchTarget::Engine { query, .. } = &mut target {
                *query = sanitize_str(query);
            }
        }

        Ok(Prepared {
            target,
            input,
            timeout,
            delay,
            flags,
            validate_output,
        })
    }

    /// 派发任务；派发失败直接返回错误，执行结果异步发回 ctx.outcomes
    pub async fn execute(
        &self,
        task: &Task,
        thought: &Thought,
        ctx: ActionContext<'_>,
    ) -> Result<ActionHandle, DispatchError> {
        let prepared = self.prepare(task, thought, ctx.state, ctx.history)?;
        let handle = ActionHandle::new(
            task.id.clone(),
            thought.approach,
            prepared.target.label(),
            prepared.timeout,
        )
        .with_cancel(ctx.cancel.child_token());

        let audit = json!({
            "event": "action_audit",
            "action_id": handle.action_id,
            "task_id": task.id,
            "strategy": thought.approach,
            "target": prepared.target,
            "timeout_ms": prepared.timeout.as_millis() as u64,
            "delay_ms": prepared.delay.map(|d| d.as_millis() as u64),
            "flags": prepared.flags,
        });
        tracing::info!(audit = %audit.to_string(), "action");

        let supervisor = Supervisor {
            action_id: handle.action_id.clone(),
            task_id: task.id.clone(),
            timeout: prepared.timeout,
            validate_output: prepared.validate_output,
            cancel: handle.cancel.clone(),
            outcomes: ctx.outcomes.clone(),
        };

        match prepared.delay {
            None => {
                let dispatched = self
                    .backends
                    .dispatch(task, &prepared.target, prepared.input)
                    .await?;
                tracing::debug!(task_id = %task.id, reference = %dispatched.reference, "Dispatched");
                tokio::spawn(supervisor.watch(dispatched.completion));
            }
            Some(delay) => {
                let backends = self.backends.clone();
                let task = task.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = supervisor.cancel.cancelled() => {
                            supervisor.report(Err(TaskFailure::new(FailureKind::Cancelled, "cancelled during backoff")), 0);
                            return;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    match backends.dispatch(&task, &prepared.target, prepared.input).await {
                        Ok(dispatched) => supervisor.watch(dispatched.completion).await,
                        Err(e) => supervisor.report(
                            Err(TaskFailure::new(FailureKind::Dispatch, e.to_string())),
                            0,
                        ),
                    }
                });
            }
        }

        Ok(handle)
    }
}

/// 监视单个动作的完成信号
struct Supervisor {
    action_id: String,
    task_id: TaskId,
    timeout: Duration,
    validate_output: bool,
    cancel: CancellationToken,
    outcomes: UnboundedSender<ActionOutcome>,
}

impl Supervisor {
    async fn watch(self, completion: Completion) {
        let started = Instant::now();
        let result = tokio::select! {
            _ = self.cancel.cancelled() => Err(TaskFailure::new(FailureKind::Cancelled, "action cancelled")),
            r = tokio::time::timeout(self.timeout, completion) => match r {
                Ok(Ok(Value::Null)) if self.validate_output => Err(
                    TaskFailure::new(FailureKind::ValidationFailed, "backend returned no output"),
                ),
                Ok(result) => result,
                Err(_) => Err(TaskFailure::timeout(format!(
                    "action exceeded {}ms",
                    self.timeout.as_millis()
                ))),
            },
        };
        self.report(result, started.elapsed().as_millis() as u64);
    }

    fn report(&self, result: Result<Value, TaskFailure>, duration_ms: u64) {
        let outcome = match &result {
            Ok(_) => "ok".to_string(),
            Err(e) => e.to_string(),
        };
        let audit = json!({
            "event": "action_audit",
            "action_id": self.action_id,
            "task_id": self.task_id,
            "ok": result.is_ok(),
            "outcome": outcome,
            "duration_ms": duration_ms,
        });
        tracing::info!(audit = %audit.to_string(), "action");

        // 运行循环已退出时接收端关闭，结果直接丢弃
        let _ = self.outcomes.send(ActionOutcome {
            action_id: self.action_id.clone(),
            task_id: self.task_id.clone(),
            result,
            finished_at: Utc::now(),
        });
    }
}

fn field_re() -> Option<&'static Regex> {
    static FIELD_RE: OnceLock<Option<Regex>> = OnceLock::new();
    FIELD_RE
        .get_or_init(|| Regex::new(r#"(?i)field[\s:'"`]*([A-Za-z_][A-Za-z0-9_]*)"#).ok())
        .as_ref()
}

/// 失败记录中的字段名，没有就从消息里解析
fn failure_field(failure: &TaskFailure) -> Option<String> {
    failure.field.clone().or_else(|| {
        field_re()?
            .captures(&failure.message)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
    })
}

fn sanitize_str(s: &str) -> String {
    s.trim().chars().filter(|c| !c.is_control()).collect()
}

/// 按上次失败修正输入：非法字段清洗或移除，缺失字段注入默认值
fn fix_input(task: &Task, input: &mut Value, failure: &TaskFailure) {
    let Value::Object(map) = input else {
        return;
    };
    let field = failure_field(failure);

    match failure.kind {
        FailureKind::MissingField => {
            let Some(field) = field else {
                return;
            };
            let default = task
                .metadata
                .get(keys::DEFAULTS)
                .and_then(|d| d.get(&field))
                .cloned()
                .unwrap_or_else(|| json!(""));
            match map.get(&field) {
                Some(v) if !v.is_null() => {}
                _ => {
                    map.insert(field, default);
                }
            }
        }
        FailureKind::ValidationFailed => match field {
            Some(field) => match map.get(&field) {
                Some(Value::String(s)) => {
                    let cleaned = sanitize_str(s);
                    map.insert(field, Value::String(cleaned));
                }
                Some(_) => {
                    map.remove(&field);
                }
                None => {}
            },
            None => {
                for value in map.values_mut() {
                    if let Value::String(s) = value {
                        *s = sanitize_str(s);
                    }
                }
            }
        },
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use super::*;
    use crate::backend::SimulatedBackend;

    fn thought(task: &Task, approach: Approach) -> Thought {
        Thought {
            task_id: task.id.clone(),
            reasoning: String::new(),
            approach,
            considerations: vec![],
            dependency_status: BTreeMap::new(),
            confidence: 0.8,
            metadata: Map::new(),
        }
    }

    fn settings() -> ActionSettings {
        ActionSettings {
            default_timeout: Duration::from_millis(200),
            max_timeout: Duration::from_millis(1000),
            backoff: BackoffSection {
                base_ms: 10,
                max_ms: 50,
                jitter_ms: 0,
            },
        }
    }

    fn executor(backend: SimulatedBackend) -> ActionExecutor {
        ActionExecutor::new(Backends::simulated(Arc::new(backend)), settings())
    }

    fn state_for(tasks: &[Task]) -> ExecutionState {
        let mut state = ExecutionState::new();
        state.initialize(tasks);
        state
    }

    #[test]
    fn test_backoff_delay_grows_and_caps() {
        let cfg = BackoffSection {
            base_ms: 1000,
            max_ms: 30_000,
            jitter_ms: 0,
        };
        assert_eq!(backoff_delay(0, &cfg), Duration::from_millis(1000));
        assert_eq!(backoff_delay(2, &cfg), Duration::from_millis(4000));
        assert_eq!(backoff_delay(10, &cfg), Duration::from_millis(30_000));

        let jittered = BackoffSection { jitter_ms: 500, ..cfg };
        let d = backoff_delay(1, &jittered).as_millis();
        assert!((2000..=2500).contains(&d));
    }

    #[tokio::test]
    async fn test_direct_execution_reports_outcome() {
        let task = Task::new("t1", "T1");
        let mut state = state_for(&[task.clone()]);
        let history = History::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let exec = executor(SimulatedBackend::new(Duration::from_millis(5)));
        let handle = exec
            .execute(
                &task,
                &thought(&task, Approach::DirectExecution),
                ActionContext { state: &mut state, history: &history, outcomes: &tx, cancel: &cancel },
            )
            .await
            .unwrap();

        let outcome = rx.recv().await.unwrap();
        assert_eq!(outcome.action_id, handle.action_id);
        let value = outcome.result.unwrap();
        assert_eq!(value["output"]["_execution"]["strategy"], "direct_execution");
        assert_eq!(handle.target, "fallback");
    }

    #[tokio::test]
    async fn test_timeout_becomes_failure() {
        let task = Task::new("t1", "T1").with_metadata(keys::TIMEOUT_MS, json!(20));
        let mut state = state_for(&[task.clone()]);
        let history = History::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let exec = executor(SimulatedBackend::new(Duration::from_millis(500)));
        exec.execute(
            &task,
            &thought(&task, Approach::StandardExecution),
            ActionContext { state: &mut state, history: &history, outcomes: &tx, cancel: &cancel },
        )
        .await
        .unwrap();

        let outcome = rx.recv().await.unwrap();
        assert_eq!(outcome.result.unwrap_err().kind, FailureKind::Timeout);
    }

    #[test]
    fn test_fix_and_retry_sanitizes_engine_query() {
        let task = Task::new("q", "Query")
            .with_metadata(keys::ENGINE, json!("warehouse"))
            .with_metadata(keys::QUERY, json!("  select 1\u{7}\n"));
        let mut state = state_for(&[task.clone()]);
        let mut history = History::new();
        history.record_failure("q", TaskFailure::new(FailureKind::ValidationFailed, "bad query"));

        let exec = executor(SimulatedBackend::new(Duration::from_millis(1)));
        let prepared = exec
            .prepare(&task, &thought(&task, Approach::FixAndRetry), &mut state, &history)
            .unwrap();
        assert_eq!(
            prepared.target,
            DispatchTarget::Engine { engine: "warehouse".to_string(), query: "select 1".to_string() }
        );
    }

    #[tokio::test]
    async fn test_validate_then_execute_rejects_unmet_dependencies() {
        let dep = Task::new("a", "A");
        let task = Task::new("t", "T").depends_on(["a"]);
        let mut state = state_for(&[dep, task.clone()]);
        let history = History::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let err = executor(SimulatedBackend::new(Duration::from_millis(1)))
            .execute(
                &task,
                &thought(&task, Approach::ValidateThenExecute),
                ActionContext { state: &mut state, history: &history, outcomes: &tx, cancel: &cancel },
            )
            .await
            .unwrap_err();
        assert_eq!(
            err,
            DispatchError::DependenciesNotMet { task_id: "t".to_string(), missing: vec!["a".to_string()] }
        );
    }

    #[tokio::test]
    async fn test_extended_timeout_doubles_and_is_remembered() {
        let task = Task::new("t", "T").with_metadata(keys::TIMEOUT_MS, json!(300));
        let mut state = state_for(&[task.clone()]);
        let history = History::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let exec = executor(SimulatedBackend::new(Duration::from_millis(1)));

        for expected in [600u64, 1000] {
            let handle = exec
                .execute(
                    &task,
                    &thought(&task, Approach::ExtendedTimeout),
                    ActionContext { state: &mut state, history: &history, outcomes: &tx, cancel: &cancel },
                )
                .await
                .unwrap();
            assert_eq!(handle.timeout, Duration::from_millis(expected));
        }
        assert_eq!(state.metadata("t:timeout_ms"), Some(&json!(1000)));
    }

    #[tokio::test]
    async fn test_careful_execution_multiplies_timeout_and_rejects_null_output() {
        let task = Task::new("t", "T")
            .with_complexity(Complexity::Complex)
            .with_metadata(keys::TIMEOUT_MS, json!(100));
        let mut state = state_for(&[task.clone()]);
        let history = History::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        struct NullBackend;
        #[async_trait::async_trait]
        impl crate::backend::FallbackExecutor for NullBackend {
            async fn run(&self, _task: &Task, _input: Value) -> Result<crate::backend::Dispatched, DispatchError> {
                Ok(crate::backend::Dispatched::new("null", async { Ok(Value::Null) }))
            }
        }

        let exec = ActionExecutor::new(Backends::new(Arc::new(NullBackend)), settings());
        let handle = exec
            .execute(
                &task,
                &thought(&task, Approach::CarefulExecution),
                ActionContext { state: &mut state, history: &history, outcomes: &tx, cancel: &cancel },
            )
            .await
            .unwrap();
        assert_eq!(handle.timeout, Duration::from_millis(200));
        let outcome = rx.recv().await.unwrap();
        assert_eq!(outcome.result.unwrap_err().kind, FailureKind::ValidationFailed);
    }

    #[tokio::test]
    async fn test_wait_and_retry_delays_inside_action() {
        let task = Task::new("t", "T");
        let mut state = state_for(&[task.clone()]);
        let mut history = History::new();
        history.increment_retry("t");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let started = Instant::now();
        executor(SimulatedBackend::new(Duration::from_millis(1)))
            .execute(
                &task,
                &thought(&task, Approach::WaitAndRetry),
                ActionContext { state: &mut state, history: &history, outcomes: &tx, cancel: &cancel },
            )
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_millis(20));

        let outcome = rx.recv().await.unwrap();
        assert!(outcome.result.is_ok());
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_cancel_token_stops_action() {
        let task = Task::new("t", "T");
        let mut state = state_for(&[task.clone()]);
        let history = History::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        executor(SimulatedBackend::new(Duration::from_millis(500)))
            .execute(
                &task,
                &thought(&task, Approach::StandardExecution),
                ActionContext { state: &mut state, history: &history, outcomes: &tx, cancel: &cancel },
            )
            .await
            .unwrap();
        cancel.cancel();
        let outcome = rx.recv().await.unwrap();
        assert_eq!(outcome.result.unwrap_err().kind, FailureKind::Cancelled);
    }

    #[test]
    fn test_fix_input_injects_default_for_missing_field() {
        let task = Task::new("t", "T").with_metadata(keys::DEFAULTS, json!({"region": "eu"}));
        let mut input = json!({"name": "x"});
        let failure = TaskFailure::new(FailureKind::MissingField, "missing field `region`");
        fix_input(&task, &mut input, &failure);
        assert_eq!(input["region"], "eu");

        let mut input = json!({});
        let failure = TaskFailure::new(FailureKind::MissingField, "required").with_field("owner");
        fix_input(&task, &mut input, &failure);
        assert_eq!(input["owner"], "");
    }

    #[test]
    fn test_fix_input_sanitizes_invalid_field() {
        let task = Task::new("t", "T");
        let mut input = json!({"name": "  bad\u{0007}name ", "size": [1, 2]});
        let failure = TaskFailure::new(FailureKind::ValidationFailed, "invalid field: name");
        fix_input(&task, &mut input, &failure);
        assert_eq!(input["name"], "badname");

        let failure = TaskFailure::new(FailureKind::ValidationFailed, "bad").with_field("size");
        fix_input(&task, &mut input, &failure);
        assert!(input.get("size").is_none());
    }
}
