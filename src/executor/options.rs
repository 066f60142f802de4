//! 单次运行的选项

use std::time::Duration;

use crate::config::ExecutorSection;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOptions {
    /// execute_plan 等待运行结束的上限；超时后运行继续
    pub timeout: Duration,
    pub max_concurrent_tasks: usize,
    pub max_retries: u32,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self::from_config(&ExecutorSection::default())
    }
}

impl ExecutionOptions {
    pub fn from_config(cfg: &ExecutorSection) -> Self {
        Self {
            timeout: Duration::from_millis(cfg.timeout_ms),
            max_concurrent_tasks: cfg.max_concurrent_tasks,
            max_retries: cfg.max_retries,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_concurrent_tasks(mut self, n: usize) -> Self {
        self.max_concurrent_tasks = n;
        self
    }

    pub fn with_max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }
}
