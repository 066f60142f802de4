//! 核心层：错误与恢复策略、执行状态、运行历史

pub mod error;
pub mod history;
pub mod recovery;
pub mod state;

pub use error::{EngineError, RecoveryAction};
pub use history::{History, HistoryEntry, HistorySummary};
pub use recovery::RecoveryPolicy;
pub use state::{DependencyStatus, ExecutionState, InFlightTask, ResourceAllocation, StateError, StateSnapshot};
