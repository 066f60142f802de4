//! 运行循环：单个运行的唯一写者
//!
//! 命令、推理结果与动作结果都从通道进入，串行处理；调度 tick 与检查点定时器是独立的 select 分支。
//! 预言机调用在独立任务里完成，循环本身只做状态迁移，不等待推理。
//! 对外只交出快照，执行状态与历史从不离开本循环。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, interval_at, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::backend::{Backends, FailureKind, TaskFailure};
use crate::config::{AdjusterSection, AppConfig, ExecutorSection};
use crate::core::{EngineError, ExecutionState, History, RecoveryAction, RecoveryPolicy};
use crate::executor::checkpoint::{Checkpoint, CheckpointStore};
use crate::executor::options::ExecutionOptions;
use crate::executor::types::{CancelReason, InFlightView, RunResult, RunStateView, RunStatus};
use crate::llm::Reasoner;
use crate::plan::{keys, validate_plan, Plan, TaskId};
use crate::react::{
    ActionContext, ActionExecutor, ActionOutcome, ActionSettings, Adjustment, Anomaly, AnomalyKind,
    EventBus, ExecutionEvent, ObservationBuilder, PlanAdjuster, Severity, Thought, ThoughtGenerator,
};

const BLOCKED_REASON: &str = "blocked_by_failed_dependency";

/// 从 PlanExecutor 句柄发往运行循环的命令
pub(crate) enum Command {
    Execute {
        plan: Plan,
        options: ExecutionOptions,
        reply: oneshot::Sender<Result<RunResult, EngineError>>,
    },
    GetState {
        reply: oneshot::Sender<RunStateView>,
    },
    Pause {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Resume {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Cancel {
        reason: String,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Rollback {
        checkpoint_id: String,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Checkpoint {
        reply: oneshot::Sender<Result<Checkpoint, EngineError>>,
    },
    GetHistory {
        reply: oneshot::Sender<History>,
    },
    Checkpoints {
        reply: oneshot::Sender<Vec<Checkpoint>>,
    },
}

/// 推理任务完成后发回的消息
pub(crate) struct ThoughtReady {
    request_id: String,
    thought: Thought,
}

/// 运行循环持有的协作者
pub(crate) struct Components {
    pub thoughts: ThoughtGenerator,
    pub actions: ActionExecutor,
    pub adjuster: PlanAdjuster,
    pub observer: Arc<dyn ObservationBuilder>,
    pub executor: ExecutorSection,
    pub adjuster_cfg: AdjusterSection,
}

impl Components {
    pub(crate) fn new(
        config: &AppConfig,
        backends: Backends,
        reasoner: Arc<dyn Reasoner>,
        observer: Arc<dyn ObservationBuilder>,
    ) -> Self {
        let reasoner_timeout = Duration::from_secs(config.reasoner.timeout_secs.max(1));
        Self {
            thoughts: ThoughtGenerator::new(reasoner.clone(), reasoner_timeout),
            actions: ActionExecutor::new(backends, ActionSettings::from_config(config)),
            adjuster: PlanAdjuster::new(config.adjuster.clone())
                .with_reasoner(reasoner, reasoner_timeout),
            observer,
            executor: config.executor.clone(),
            adjuster_cfg: config.adjuster.clone(),
        }
    }
}

pub(crate) struct RunLoop {
    run_id: String,
    status: RunStatus,
    plan: Option<Plan>,
    options: ExecutionOptions,
    policy: RecoveryPolicy,
    state: ExecutionState,
    history: History,
    checkpoints: CheckpointStore,
    results: BTreeMap<TaskId, Value>,
    components: Components,
    events: EventBus,
    outcome_tx: mpsc::UnboundedSender<ActionOutcome>,
    thought_tx: mpsc::UnboundedSender<ThoughtReady>,
    /// 等待推理结果的任务 → 请求 id；不在表中的结果一律作废
    thinking: HashMap<TaskId, String>,
    /// 已为其生成 repeated_failures 异常时的失败次数
    struggle_marks: HashMap<TaskId, usize>,
    cancel: CancellationToken,
    reply: Option<oneshot::Sender<Result<RunResult, EngineError>>>,
    last_dispatch: Option<Instant>,
}

impl RunLoop {
    pub(crate) fn new(
        run_id: String,
        components: Components,
        events: EventBus,
        outcome_tx: mpsc::UnboundedSender<ActionOutcome>,
        thought_tx: mpsc::UnboundedSender<ThoughtReady>,
    ) -> Self {
        let options = ExecutionOptions::from_config(&components.executor);
        Self {
            run_id,
            status: RunStatus::Initialized,
            plan: None,
            policy: RecoveryPolicy::from_config(&components.executor, options.max_retries),
            options,
            state: ExecutionState::new(),
            history: History::new(),
            checkpoints: CheckpointStore::new(components.executor.max_checkpoints),
            results: BTreeMap::new(),
            components,
            events,
            outcome_tx,
            thought_tx,
            thinking: HashMap::new(),
            struggle_marks: HashMap::new(),
            cancel: CancellationToken::new(),
            reply: None,
            last_dispatch: None,
        }
    }

    pub(crate) async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        mut outcome_rx: mpsc::UnboundedReceiver<ActionOutcome>,
        mut thought_rx: mpsc::UnboundedReceiver<ThoughtReady>,
    ) {
        let mut tick = interval(Duration::from_millis(self.components.executor.tick_ms.max(1)));
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let period = Duration::from_secs(self.components.executor.checkpoint_interval_secs.max(1));
        let mut checkpoint_timer = interval_at(tokio::time::Instant::now() + period, period);
        checkpoint_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(run_id = %self.run_id, "Run loop started");
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    // 所有句柄都已丢弃
                    None => break,
                },
                Some(ready) = thought_rx.recv() => self.handle_thought(ready).await,
                Some(outcome) = outcome_rx.recv() => self.handle_outcome(outcome).await,
                _ = tick.tick() => {
                    if self.status == RunStatus::Running {
                        self.schedule();
                    }
                }
                // 只要加载过计划就定期打点，与运行状态无关（终止后也可用于检查）
                _ = checkpoint_timer.tick() => {
                    if self.plan.is_some() {
                        self.create_checkpoint();
                    }
                }
            }
        }

        self.state.cancel_in_flight();
        self.cancel.cancel();
        tracing::info!(run_id = %self.run_id, "Run loop stopped");
    }

    fn transition_error(&self, action: &'static str) -> EngineError {
        EngineError::InvalidTransition {
            action,
            status: self.status.to_string(),
        }
    }

    fn set_status(&mut self, status: RunStatus) {
        tracing::info!(run_id = %self.run_id, from = %self.status, to = %status, "Run status changed");
        self.status = status;
        self.events.publish(ExecutionEvent::StatusChanged {
            status: self.status.to_string(),
        });
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Execute {
                plan,
                options,
                reply,
            } => {
                if self.status != RunStatus::Initialized {
                    let _ = reply.send(Err(self.transition_error("execute")));
                    return;
                }
                if let Err(e) = validate_plan(&plan) {
                    let _ = reply.send(Err(EngineError::InvalidPlan(e)));
                    return;
                }
                self.start(plan, options, reply);
            }
            Command::GetState { reply } => {
                let _ = reply.send(self.view());
            }
            Command::Pause { reply } => {
                let result = if self.status == RunStatus::Running {
                    self.set_status(RunStatus::Paused);
                    Ok(())
                } else {
                    Err(self.transition_error("pause"))
                };
                let _ = reply.send(result);
            }
            Command::Resume { reply } => {
                if self.status == RunStatus::Paused {
                    self.set_status(RunStatus::Running);
                    let _ = reply.send(Ok(()));
                    self.schedule();
                } else {
                    let _ = reply.send(Err(self.transition_error("resume")));
                }
            }
            Command::Cancel { reason, reply } => {
                if self.status.is_terminal() {
                    let _ = reply.send(Err(self.transition_error("cancel")));
                } else {
                    self.finish_cancelled(CancelReason::Requested { reason });
                    let _ = reply.send(Ok(()));
                }
            }
            Command::Rollback {
                checkpoint_id,
                reply,
            } => {
                let _ = reply.send(self.rollback(&checkpoint_id));
            }
            Command::Checkpoint { reply } => {
                let result = if self.plan.is_some() {
                    Ok(self.create_checkpoint())
                } else {
                    Err(self.transition_error("checkpoint"))
                };
                let _ = reply.send(result);
            }
            Command::GetHistory { reply } => {
                let _ = reply.send(self.history.clone());
            }
            Command::Checkpoints { reply } => {
                let _ = reply.send(self.checkpoints.list());
            }
        }
    }

    fn start(
        &mut self,
        plan: Plan,
        options: ExecutionOptions,
        reply: oneshot::Sender<Result<RunResult, EngineError>>,
    ) {
        tracing::info!(
            run_id = %self.run_id,
            plan_id = %plan.id,
            tasks = plan.tasks.len(),
            max_concurrent = options.max_concurrent_tasks,
            "Executing plan"
        );
        self.policy = RecoveryPolicy::from_config(&self.components.executor, options.max_retries);
        self.options = options;
        self.state.initialize(&plan.tasks);
        self.history
            .record_snapshot("initial_plan", serde_json::to_value(&plan).unwrap_or(Value::Null));
        self.plan = Some(plan);
        self.reply = Some(reply);
        self.set_status(RunStatus::Running);
        self.schedule();
    }

    /// 并发上限：选项与计划注入的限流取较小者，至少 1
    fn ceiling(&self) -> usize {
        let limit = self
            .plan
            .as_ref()
            .and_then(Plan::rate_limit)
            .map(|r| r.max_concurrent_tasks)
            .unwrap_or(usize::MAX);
        self.options.max_concurrent_tasks.min(limit).max(1)
    }

    fn inter_task_delay(&self) -> Option<Duration> {
        self.plan
            .as_ref()
            .and_then(Plan::rate_limit)
            .map(|r| Duration::from_millis(r.inter_task_delay_ms))
            .filter(|d| !d.is_zero())
    }

    /// 占用的执行槽：在途动作 + 正在推理的任务
    fn busy(&self) -> usize {
        self.state.in_flight_count() + self.thinking.len()
    }

    fn ready_tasks(&self) -> Vec<TaskId> {
        self.state
            .get_ready_tasks()
            .into_iter()
            .filter(|id| !self.thinking.contains_key(id))
            .collect()
    }

    /// 一次调度：在上限内为就绪任务启动推理，并检查运行是否结束
    fn schedule(&mut self) {
        if self.status != RunStatus::Running || self.plan.is_none() {
            return;
        }
        let ceiling = self.ceiling();
        let delay = self.inter_task_delay();
        let ready = self.ready_tasks();
        tracing::debug!(
            run_id = %self.run_id,
            ready = ready.len(),
            in_flight = self.state.in_flight_count(),
            thinking = self.thinking.len(),
            ceiling,
            "Scheduling pass"
        );

        for task_id in ready {
            if self.busy() >= ceiling {
                break;
            }
            if let (Some(delay), Some(last)) = (delay, self.last_dispatch) {
                if last.elapsed() < delay {
                    break;
                }
            }
            self.begin_thinking(&task_id);
            if self.status != RunStatus::Running {
                return;
            }
        }

        if self.busy() > 0 {
            return;
        }
        if self.state.execution_complete() {
            self.finish_completed();
            return;
        }
        if !self.ready_tasks().is_empty() {
            return;
        }

        let blocked = self.state.blocked_tasks();
        if blocked.is_empty() {
            self.fault("no schedulable tasks remain".to_string());
            return;
        }
        for task_id in blocked {
            tracing::warn!(run_id = %self.run_id, task_id = %task_id, "Task blocked by failed dependency");
            if self.state.fail_task(&task_id).is_ok() {
                self.history.record_failure(
                    &task_id,
                    TaskFailure::execution(BLOCKED_REASON),
                );
                self.events.publish(ExecutionEvent::TaskFailed {
                    task_id: task_id.clone(),
                    reason: BLOCKED_REASON.to_string(),
                    attempt: 1,
                });
            }
        }
        self.publish_progress();
        if self.state.execution_complete() {
            self.finish_completed();
        }
    }

    /// 思考：在循环内采集上下文，预言机调用交给独立任务
    fn begin_thinking(&mut self, task_id: &str) {
        let Some(task) = self.plan.as_ref().and_then(|p| p.task(task_id)).cloned() else {
            self.fault(format!("task {} missing from plan", task_id));
            return;
        };
        let request = self
            .components
            .thoughts
            .prepare(&task, &self.state, &self.history, self.ceiling());
        let request_id = uuid::Uuid::new_v4().to_string();
        self.thinking.insert(task_id.to_string(), request_id.clone());
        self.last_dispatch = Some(Instant::now());

        let thoughts = self.components.thoughts.clone();
        let cancel = self.cancel.clone();
        let thought_tx = self.thought_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                thought = thoughts.complete(request) => {
                    // 运行循环已退出时直接丢弃
                    let _ = thought_tx.send(ThoughtReady { request_id, thought });
                }
            }
        });
    }

    async fn handle_thought(&mut self, ready: ThoughtReady) {
        let task_id = ready.thought.task_id.clone();
        if self.thinking.get(&task_id) != Some(&ready.request_id) {
            tracing::debug!(run_id = %self.run_id, task_id = %task_id, "Ignoring stale thought");
            return;
        }
        self.thinking.remove(&task_id);
        if self.status != RunStatus::Running {
            // 暂停期间到达的推理作废，恢复后重新思考
            tracing::debug!(run_id = %self.run_id, task_id = %task_id, status = %self.status, "Dropping thought, run not running");
            return;
        }
        self.act(&task_id, ready.thought).await;
        self.schedule();
    }

    /// 行动：分配资源并派发
    async fn act(&mut self, task_id: &str, thought: Thought) {
        if self.state.is_resolved(task_id) || self.state.is_current(task_id) {
            return;
        }
        let Some(task) = self.plan.as_ref().and_then(|p| p.task(task_id)).cloned() else {
            self.fault(format!("task {} missing from plan", task_id));
            return;
        };
        self.history.record_thought(task_id, thought.clone());
        self.state.allocate_resources(&task);

        let ctx = ActionContext {
            state: &mut self.state,
            history: &self.history,
            outcomes: &self.outcome_tx,
            cancel: &self.cancel,
        };
        match self.components.actions.execute(&task, &thought, ctx).await {
            Ok(handle) => {
                let action_id = handle.action_id.clone();
                if let Err(e) = self.state.start_task(task_id, handle) {
                    self.fault(e.to_string());
                    return;
                }
                self.history.record_attempt(task_id, thought.approach, &action_id);
                self.history.record_start(task_id);
                self.events.publish(ExecutionEvent::TaskStarted {
                    task_id: task_id.to_string(),
                    approach: thought.approach.to_string(),
                    action_id,
                });
            }
            Err(e) => {
                tracing::warn!(run_id = %self.run_id, task_id = %task_id, error = %e, "Dispatch failed");
                self.state.release_resources(task_id);
                self.handle_failure(task_id, TaskFailure::new(FailureKind::Dispatch, e.to_string()));
            }
        }
    }

    async fn handle_outcome(&mut self, outcome: ActionOutcome) {
        let tracked = self
            .state
            .in_flight(&outcome.task_id)
            .map(|t| t.handle.action_id == outcome.action_id)
            .unwrap_or(false);
        if !tracked {
            tracing::debug!(
                run_id = %self.run_id,
                task_id = %outcome.task_id,
                action_id = %outcome.action_id,
                "Ignoring outcome of untracked action"
            );
            return;
        }

        self.history.record_end(&outcome.task_id);
        match outcome.result {
            Ok(raw) => self.on_task_completed(&outcome.task_id, raw).await,
            Err(failure) => self.handle_failure(&outcome.task_id, failure),
        }
        self.publish_progress();
        self.schedule();
    }

    /// 观察 → 记录 → 调整 → 同步计划 → 完成
    async fn on_task_completed(&mut self, task_id: &str, raw: Value) {
        let mut observation = self.components.observer.build(task_id, &raw, &self.state);
        if !observation.has_anomaly(AnomalyKind::RepeatedFailures) {
            if let Some(anomaly) = self.struggle_anomaly() {
                observation.anomalies.push(anomaly);
            }
        }
        self.history.record_observation(task_id, observation.clone());
        self.state
            .set_metadata(format!("{}:result", task_id), raw.clone());
        self.results.insert(task_id.to_string(), raw);

        if let Some(plan) = self.plan.as_ref() {
            match self
                .components
                .adjuster
                .adjust(plan, &observation, &self.state)
                .await
            {
                Ok(Adjustment::Adjusted {
                    plan,
                    trigger,
                    strategy,
                }) => {
                    self.state.sync_plan(&plan);
                    self.plan = Some(plan);
                    self.history.record_adjustment(
                        Some(task_id),
                        json!({ "trigger": trigger, "strategy": strategy }),
                    );
                    self.events.publish(ExecutionEvent::PlanAdjusted {
                        trigger: trigger.as_str().to_string(),
                        strategy: strategy.to_string(),
                    });
                }
                Ok(Adjustment::Unchanged) => {}
                Err(e) => {
                    tracing::warn!(run_id = %self.run_id, task_id = %task_id, error = %e, "Plan adjustment rejected");
                    self.history
                        .record_adjustment(Some(task_id), json!({ "error": e.to_string() }));
                }
            }
        }

        match self.state.complete_task(task_id) {
            Ok(_) => {
                tracing::info!(run_id = %self.run_id, task_id = %task_id, "Task completed");
                self.events.publish(ExecutionEvent::TaskCompleted {
                    task_id: task_id.to_string(),
                });
            }
            Err(e) => self.fault(e.to_string()),
        }
    }

    /// 第一个失败次数达到阈值、自上次标记后又有新失败、且还能被调整的未决任务
    ///
    /// 已是 optional 且没有剩余替代定义的任务不再触发调整。
    fn struggle_anomaly(&mut self) -> Option<Anomaly> {
        let threshold = self.components.adjuster_cfg.repeated_failure_threshold.max(1);
        let plan = self.plan.as_ref()?;
        let (task_id, failures) = self.state.remaining_tasks().into_iter().find_map(|id| {
            let failures = self.history.failure_count(&id);
            let fresh = failures > self.struggle_marks.get(&id).copied().unwrap_or(0);
            let adjustable = plan
                .task(&id)
                .map(|t| !t.is_optional() || !t.alternatives().is_empty())
                .unwrap_or(false);
            (failures >= threshold && fresh && adjustable).then_some((id, failures))
        })?;
        self.struggle_marks.insert(task_id.clone(), failures);
        Some(Anomaly {
            kind: AnomalyKind::RepeatedFailures,
            severity: Severity::Warning,
            detail: format!("{} failures", failures),
            task_id,
        })
    }

    /// 记录失败后按恢复策略处理
    fn handle_failure(&mut self, task_id: &str, failure: TaskFailure) {
        let attempt = self.history.record_failure(task_id, failure.clone());
        self.state.set_metadata(
            format!("{}:error", task_id),
            serde_json::to_value(&failure).unwrap_or(Value::Null),
        );
        self.events.publish(ExecutionEvent::TaskFailed {
            task_id: task_id.to_string(),
            reason: failure.to_string(),
            attempt,
        });

        let optional = self
            .plan
            .as_ref()
            .and_then(|p| p.task(task_id))
            .map(|t| t.is_optional())
            .unwrap_or(false);
        let retries = self.history.retry_count(task_id);

        match self.policy.decide(retries, optional) {
            RecoveryAction::Retry => {
                tracing::warn!(run_id = %self.run_id, task_id = %task_id, attempt, error = %failure, "Retrying task");
                self.history.increment_retry(task_id);
                self.requeue(task_id);
            }
            RecoveryAction::SkipAttempt => {
                tracing::warn!(run_id = %self.run_id, task_id = %task_id, attempt, "Skipping attempt, task marked skippable");
                self.history.increment_retry(task_id);
                if let Some(task) = self.plan.as_mut().and_then(|p| p.task_mut(task_id)) {
                    task.metadata.insert(keys::SKIPPABLE.to_string(), json!(true));
                }
                self.requeue(task_id);
            }
            RecoveryAction::SkipTask => {
                tracing::warn!(run_id = %self.run_id, task_id = %task_id, "Optional task skipped");
                if let Err(e) = self.state.fail_task(task_id) {
                    self.fault(e.to_string());
                }
            }
            RecoveryAction::Abort => {
                tracing::error!(
                    run_id = %self.run_id,
                    task_id = %task_id,
                    attempt,
                    budget = self.policy.failure_budget(),
                    "Task exhausted retries, cancelling run"
                );
                self.finish_cancelled(CancelReason::TaskFailed {
                    task_id: task_id.to_string(),
                });
            }
        }
    }

    fn requeue(&mut self, task_id: &str) {
        if self.state.is_current(task_id) {
            let _ = self.state.requeue_task(task_id);
        } else {
            self.state.release_resources(task_id);
        }
    }

    fn rollback(&mut self, checkpoint_id: &str) -> Result<(), EngineError> {
        if self.status == RunStatus::Running {
            return Err(self.transition_error("rollback"));
        }
        let checkpoint = self
            .checkpoints
            .get(checkpoint_id)
            .cloned()
            .ok_or_else(|| EngineError::CheckpointNotFound(checkpoint_id.to_string()))?;

        let cancelled = self.state.cancel_in_flight();
        self.thinking.clear();
        self.state.restore(&checkpoint.state);
        self.history.record_snapshot(
            "rollback",
            json!({
                "checkpoint_id": checkpoint.id,
                "cancelled_actions": cancelled.len(),
            }),
        );
        tracing::info!(run_id = %self.run_id, checkpoint_id = %checkpoint.id, "Rolled back to checkpoint");
        self.publish_progress();
        Ok(())
    }

    fn create_checkpoint(&mut self) -> Checkpoint {
        let checkpoint = Checkpoint::new(self.state.snapshot());
        tracing::debug!(run_id = %self.run_id, checkpoint_id = %checkpoint.id, "Checkpoint created");
        self.checkpoints.push(checkpoint.clone());
        self.events.publish(ExecutionEvent::CheckpointCreated {
            checkpoint_id: checkpoint.id.clone(),
        });
        checkpoint
    }

    fn publish_progress(&self) {
        self.events.publish(ExecutionEvent::Progress {
            total: self.state.all_tasks().len(),
            completed: self.state.completed_tasks().len(),
            failed: self.state.failed_tasks().len(),
            in_flight: self.state.in_flight_count(),
            percentage: self.state.progress_percentage(),
        });
    }

    fn result(&self) -> RunResult {
        RunResult {
            run_id: self.run_id.clone(),
            plan_id: self.plan.as_ref().map(|p| p.id.clone()).unwrap_or_default(),
            status: self.status.clone(),
            completed_tasks: self.state.completed_tasks().iter().cloned().collect(),
            failed_tasks: self.state.failed_tasks().iter().cloned().collect(),
            progress: self.state.progress_percentage(),
            plan: self
                .plan
                .clone()
                .unwrap_or_else(|| Plan::new("", Vec::new())),
            results: self.results.clone(),
            summary: self.history.summary(),
        }
    }

    fn view(&self) -> RunStateView {
        let mut in_flight: Vec<InFlightView> = self
            .state
            .current_tasks()
            .iter()
            .map(|(task_id, t)| InFlightView {
                task_id: task_id.clone(),
                action_id: t.handle.action_id.clone(),
                strategy: t.handle.strategy,
                target: t.handle.target,
                started_at: t.started_at,
            })
            .collect();
        in_flight.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        let mut thinking: Vec<TaskId> = self.thinking.keys().cloned().collect();
        thinking.sort();
        RunStateView {
            run_id: self.run_id.clone(),
            status: self.status.clone(),
            plan_id: self.plan.as_ref().map(|p| p.id.clone()),
            progress: self.state.progress_percentage(),
            state: self.state.snapshot(),
            in_flight,
            thinking,
            checkpoints: self.checkpoints.len(),
        }
    }

    fn finish_completed(&mut self) {
        self.set_status(RunStatus::Completed);
        let result = self.result();
        tracing::info!(
            run_id = %self.run_id,
            completed = result.completed_tasks.len(),
            failed = result.failed_tasks.len(),
            "Plan execution completed"
        );
        self.events.publish(ExecutionEvent::Completed {
            result: serde_json::to_value(&result).unwrap_or(Value::Null),
            final_state: self.state.snapshot(),
        });
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(Ok(result));
        }
    }

    fn finish_cancelled(&mut self, reason: CancelReason) {
        self.state.cancel_in_flight();
        self.thinking.clear();
        self.cancel.cancel();
        self.set_status(RunStatus::Cancelled {
            reason: reason.clone(),
        });
        self.events.publish(ExecutionEvent::Cancelled {
            reason: serde_json::to_value(&reason).unwrap_or(Value::Null),
            final_state: self.state.snapshot(),
        });
        let result = self.result();
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(Ok(result));
        }
    }

    fn fault(&mut self, error: String) {
        tracing::error!(run_id = %self.run_id, error = %error, "Run fault");
        self.state.cancel_in_flight();
        self.thinking.clear();
        self.cancel.cancel();
        self.set_status(RunStatus::Failed {
            error: error.clone(),
        });
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(Err(EngineError::RunFault(error)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::create_reasoner_from_config;
    use crate::plan::Task;
    use crate::react::DefaultObservationBuilder;

    fn run_loop(plan: Plan) -> RunLoop {
        let config = AppConfig::default();
        let components = Components::new(
            &config,
            Backends::default(),
            create_reasoner_from_config(&config),
            Arc::new(DefaultObservationBuilder::default()),
        );
        let (outcome_tx, _outcome_rx) = mpsc::unbounded_channel();
        let (thought_tx, _thought_rx) = mpsc::unbounded_channel();
        let mut run = RunLoop::new(
            "run_test".to_string(),
            components,
            EventBus::new("run_test", 16),
            outcome_tx,
            thought_tx,
        );
        run.state.initialize(&plan.tasks);
        run.plan = Some(plan);
        run
    }

    fn fail(run: &mut RunLoop, task_id: &str, times: usize) {
        for _ in 0..times {
            run.history
                .record_failure(task_id, TaskFailure::execution("boom"));
        }
    }

    #[test]
    fn test_struggle_anomaly_needs_new_failures() {
        let mut run = run_loop(Plan::new("p", vec![Task::new("a", "A"), Task::new("b", "B")]));
        fail(&mut run, "a", 1);
        assert!(run.struggle_anomaly().is_none());

        fail(&mut run, "a", 1);
        let anomaly = run.struggle_anomaly().unwrap();
        assert_eq!(anomaly.kind, AnomalyKind::RepeatedFailures);
        assert_eq!(anomaly.task_id, "a");
        // 没有新失败就不再重复触发
        assert!(run.struggle_anomaly().is_none());

        fail(&mut run, "a", 1);
        assert_eq!(run.struggle_anomaly().unwrap().detail, "3 failures");
    }

    #[test]
    fn test_struggle_anomaly_skips_exhausted_optional_tasks() {
        let plan = Plan::new(
            "p",
            vec![
                Task::new("opt", "Optional").with_metadata(keys::OPTIONAL, json!(true)),
                Task::new("alt", "Has alternative")
                    .with_metadata(keys::OPTIONAL, json!(true))
                    .with_metadata(keys::ALTERNATIVES, json!([{ "name": "Backup" }])),
            ],
        );
        let mut run = run_loop(plan);
        fail(&mut run, "opt", 3);
        assert!(run.struggle_anomaly().is_none());

        fail(&mut run, "alt", 2);
        assert_eq!(run.struggle_anomaly().unwrap().task_id, "alt");
    }
}
