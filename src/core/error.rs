//! 引擎错误类型与恢复动作
//!
//! 与 RecoveryPolicy 配合：任务失败按已重试次数映射为 Retry / SkipAttempt / SkipTask / Abort。

use thiserror::Error;

use crate::core::state::StateError;
use crate::plan::PlanError;

/// 控制面（execute_plan / pause / resume / cancel / rollback）返回的错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Invalid plan: {0}")]
    InvalidPlan(#[from] PlanError),

    #[error("Cannot {action} while run is {status}")]
    InvalidTransition { action: &'static str, status: String },

    #[error("Checkpoint not found: {0}")]
    CheckpointNotFound(String),

    /// 调用方等待超时；运行本身继续，需要时由调用方取消
    #[error("Execution timed out after {0}ms")]
    Timeout(u64),

    /// 运行期内部故障，运行状态置为 failed
    #[error("Run fault: {0}")]
    RunFault(String),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Run loop has stopped")]
    LoopClosed,
}

/// 恢复策略给出的动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 重新排队，下一轮重新思考并派发
    Retry,
    /// 跳过本次尝试，标记 skippable 后重新派发
    SkipAttempt,
    /// 可选任务：直接记为失败，运行继续
    SkipTask,
    /// 终止运行（cancelled: task_failed）
    Abort,
}
