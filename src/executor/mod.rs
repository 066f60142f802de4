//! 计划执行器：运行生命周期状态机与控制面
//!
//! PlanExecutor 是一个轻量句柄（可 Clone），所有操作都以命令形式发给后台运行循环；
//! 运行循环独占执行状态与历史，对外只返回快照。一个 PlanExecutor 对应一次运行。

pub mod checkpoint;
pub mod options;
mod run_loop;
pub mod types;

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};

use crate::backend::Backends;
use crate::config::AppConfig;
use crate::core::{EngineError, History};
use crate::llm::{create_reasoner_from_config, Reasoner};
use crate::plan::Plan;
use crate::react::{DefaultObservationBuilder, EventBus, EventEnvelope, ObservationBuilder};

pub use checkpoint::Checkpoint;
pub use options::ExecutionOptions;
pub use types::{CancelReason, InFlightView, RunResult, RunStateView, RunStatus};

use run_loop::{Command, Components, RunLoop};

const EVENT_CAPACITY: usize = 256;

/// 执行器构建器：未指定的协作者按配置取默认值
#[derive(Default)]
pub struct ExecutorBuilder {
    config: Option<AppConfig>,
    backends: Option<Backends>,
    reasoner: Option<Arc<dyn Reasoner>>,
    observer: Option<Arc<dyn ObservationBuilder>>,
}

impl ExecutorBuilder {
    pub fn config(mut self, config: AppConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn backends(mut self, backends: Backends) -> Self {
        self.backends = Some(backends);
        self
    }

    pub fn reasoner(mut self, reasoner: Arc<dyn Reasoner>) -> Self {
        self.reasoner = Some(reasoner);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn ObservationBuilder>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// 启动后台运行循环；必须在 tokio 运行时内调用
    pub fn spawn(self) -> PlanExecutor {
        let config = self.config.unwrap_or_default();
        let reasoner = self
            .reasoner
            .unwrap_or_else(|| create_reasoner_from_config(&config));
        let observer = self
            .observer
            .unwrap_or_else(|| Arc::new(DefaultObservationBuilder::from_config(&config.adjuster)));
        let components = Components::new(
            &config,
            self.backends.unwrap_or_default(),
            reasoner,
            observer,
        );

        let run_id = format!("run_{}", uuid::Uuid::new_v4());
        let events = EventBus::new(run_id.clone(), EVENT_CAPACITY);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let (thought_tx, thought_rx) = mpsc::unbounded_channel();

        let run_loop = RunLoop::new(
            run_id.clone(),
            components,
            events.clone(),
            outcome_tx,
            thought_tx,
        );
        tokio::spawn(run_loop.run(cmd_rx, outcome_rx, thought_rx));

        PlanExecutor {
            cmd_tx,
            run_id,
            events,
        }
    }
}

/// 运行句柄
#[derive(Clone)]
pub struct PlanExecutor {
    cmd_tx: mpsc::UnboundedSender<Command>,
    run_id: String,
    events: EventBus,
}

impl PlanExecutor {
    pub fn builder() -> ExecutorBuilder {
        ExecutorBuilder::default()
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// 事件主题 `plan_execution:{run_id}`
    pub fn topic(&self) -> &str {
        self.events.topic()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.events.subscribe()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .map_err(|_| EngineError::LoopClosed)?;
        rx.await.map_err(|_| EngineError::LoopClosed)
    }

    /// 执行计划，运行结束（完成 / 取消）时返回；超过 options.timeout 返回 Timeout，运行继续
    pub async fn execute_plan(
        &self,
        plan: Plan,
        options: ExecutionOptions,
    ) -> Result<RunResult, EngineError> {
        let timeout = options.timeout;
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Execute {
                plan,
                options,
                reply: tx,
            })
            .map_err(|_| EngineError::LoopClosed)?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(EngineError::LoopClosed),
            Err(_) => {
                tracing::warn!(run_id = %self.run_id, timeout_ms = timeout.as_millis() as u64, "execute_plan timed out, run continues");
                Err(EngineError::Timeout(timeout.as_millis() as u64))
            }
        }
    }

    pub async fn get_state(&self) -> Result<RunStateView, EngineError> {
        self.request(|reply| Command::GetState { reply }).await
    }

    pub async fn pause(&self) -> Result<(), EngineError> {
        self.request(|reply| Command::Pause { reply }).await?
    }

    pub async fn resume(&self) -> Result<(), EngineError> {
        self.request(|reply| Command::Resume { reply }).await?
    }

    pub async fn cancel(&self, reason: impl Into<String>) -> Result<(), EngineError> {
        let reason = reason.into();
        self.request(|reply| Command::Cancel { reason, reply }).await?
    }

    /// 只能在 paused 或终止状态下回滚
    pub async fn rollback(&self, checkpoint_id: impl Into<String>) -> Result<(), EngineError> {
        let checkpoint_id = checkpoint_id.into();
        self.request(|reply| Command::Rollback {
            checkpoint_id,
            reply,
        })
        .await?
    }

    /// 立即创建一个检查点
    pub async fn checkpoint(&self) -> Result<Checkpoint, EngineError> {
        self.request(|reply| Command::Checkpoint { reply }).await?
    }

    /// 检查点列表（最新在前）
    pub async fn checkpoints(&self) -> Result<Vec<Checkpoint>, EngineError> {
        self.request(|reply| Command::Checkpoints { reply }).await
    }

    pub async fn get_history(&self) -> Result<History, EngineError> {
        self.request(|reply| Command::GetHistory { reply }).await
    }
}
