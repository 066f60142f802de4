//! 思考 / 行动 / 观察 / 调整：单个任务的推理执行循环各阶段与运行事件

pub mod action;
pub mod adjuster;
pub mod events;
pub mod observation;
pub mod thought;

pub use action::{backoff_delay, ActionContext, ActionExecutor, ActionHandle, ActionOutcome, ActionSettings};
pub use adjuster::{Adjustment, AdjustmentError, AdjustmentTrigger, PlanAdjuster};
pub use events::{EventBus, EventEnvelope, ExecutionEvent};
pub use observation::{
    Anomaly, AnomalyKind, DefaultObservationBuilder, Metrics, Observation, ObservationBuilder,
    ObservationStatus, Severity,
};
pub use thought::{Approach, Thought, ThoughtGenerator, ThoughtRequest};
