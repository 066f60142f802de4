//! 运行状态机与对外返回的视图类型

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::core::{HistorySummary, StateSnapshot};
use crate::plan::{Plan, TaskId};
use crate::react::Approach;

/// 取消原因
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CancelReason {
    /// 某任务用尽重试与跳过次数
    TaskFailed { task_id: TaskId },
    /// 调用方主动取消
    Requested { reason: String },
}

/// initialized → running ⇄ paused；running → completed | cancelled | failed
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Initialized,
    Running,
    Paused,
    Completed,
    Cancelled { reason: CancelReason },
    Failed { error: String },
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Initialized => "initialized",
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Completed => "completed",
            RunStatus::Cancelled { .. } => "cancelled",
            RunStatus::Failed { .. } => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Cancelled { .. } | RunStatus::Failed { .. }
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 运行结束时 execute_plan 返回的结果
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub run_id: String,
    pub plan_id: String,
    pub status: RunStatus,
    pub completed_tasks: Vec<TaskId>,
    pub failed_tasks: Vec<TaskId>,
    pub progress: f64,
    /// 调整后的最终计划
    pub plan: Plan,
    pub results: BTreeMap<TaskId, Value>,
    pub summary: HistorySummary,
}

/// 在途任务视图
#[derive(Debug, Clone, Serialize)]
pub struct InFlightView {
    pub task_id: TaskId,
    pub action_id: String,
    pub strategy: Approach,
    pub target: &'static str,
    pub started_at: DateTime<Utc>,
}

/// get_state() 的结果
#[derive(Debug, Clone, Serialize)]
pub struct RunStateView {
    pub run_id: String,
    pub status: RunStatus,
    pub plan_id: Option<String>,
    pub progress: f64,
    pub state: StateSnapshot,
    pub in_flight: Vec<InFlightView>,
    /// 正在等待推理结果、尚未派发的任务
    pub thinking: Vec<TaskId>,
    pub checkpoints: usize,
}
