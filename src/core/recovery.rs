//! 失败恢复策略
//!
//! 根据任务已重试次数 r 返回 RecoveryAction：r < max_retries 重试；
//! r < max_retries + max_skips 跳过本次尝试（可选任务直接放弃）；否则终止运行。

use crate::config::ExecutorSection;
use crate::core::RecoveryAction;

/// 有界重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryPolicy {
    pub max_retries: u32,
    pub max_skips: u32,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_skips: 2,
        }
    }
}

impl RecoveryPolicy {
    pub fn new(max_retries: u32, max_skips: u32) -> Self {
        Self {
            max_retries,
            max_skips,
        }
    }

    pub fn from_config(cfg: &ExecutorSection, max_retries: u32) -> Self {
        Self::new(max_retries, cfg.max_skips)
    }

    /// retries：该任务此前累计的重试次数；optional：任务是否已被标记为可选
    pub fn decide(&self, retries: u32, optional: bool) -> RecoveryAction {
        if retries < self.max_retries {
            RecoveryAction::Retry
        } else if retries < self.max_retries + self.max_skips {
            if optional {
                RecoveryAction::SkipTask
            } else {
                RecoveryAction::SkipAttempt
            }
        } else {
            RecoveryAction::Abort
        }
    }

    /// 触发终止前最多容忍的连续失败次数
    pub fn failure_budget(&self) -> u32 {
        self.max_retries + self.max_skips + 1
    }
}
