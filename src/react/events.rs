//! 运行事件：按 `plan_execution:{run_id}` 主题广播状态、进度与任务生命周期

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::core::StateSnapshot;
use crate::plan::TaskId;

/// 单个运行事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    /// 运行状态变化
    StatusChanged { status: String },
    /// 进度更新
    Progress {
        total: usize,
        completed: usize,
        failed: usize,
        in_flight: usize,
        percentage: f64,
    },
    TaskStarted {
        task_id: TaskId,
        approach: String,
        action_id: String,
    },
    TaskCompleted { task_id: TaskId },
    TaskFailed {
        task_id: TaskId,
        reason: String,
        attempt: u32,
    },
    /// 计划被调整
    PlanAdjusted { trigger: String, strategy: String },
    CheckpointCreated { checkpoint_id: String },
    /// 运行完成
    Completed {
        result: Value,
        final_state: StateSnapshot,
    },
    /// 运行被取消
    Cancelled {
        reason: Value,
        final_state: StateSnapshot,
    },
}

/// 带主题的事件
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    pub topic: String,
    pub run_id: String,
    pub event: ExecutionEvent,
}

pub fn topic_for(run_id: &str) -> String {
    format!("plan_execution:{}", run_id)
}

/// 单次运行的事件总线（broadcast；没有订阅者时事件直接丢弃）
#[derive(Debug, Clone)]
pub struct EventBus {
    run_id: String,
    topic: String,
    tx: broadcast::Sender<EventEnvelope>,
}

impl EventBus {
    pub fn new(run_id: impl Into<String>, capacity: usize) -> Self {
        let run_id = run_id.into();
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            topic: topic_for(&run_id),
            run_id,
            tx,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: ExecutionEvent) {
        let _ = self.tx.send(EventEnvelope {
            topic: self.topic.clone(),
            run_id: self.run_id.clone(),
            event,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_topic_envelope() {
        let bus = EventBus::new("run_1", 16);
        let mut rx = bus.subscribe();
        bus.publish(ExecutionEvent::StatusChanged {
            status: "running".to_string(),
        });
        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.topic, "plan_execution:run_1");
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["event"]["type"], "status_changed");
        assert_eq!(json["event"]["status"], "running");
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::new("run_2", 4);
        bus.publish(ExecutionEvent::TaskCompleted {
            task_id: "t".to_string(),
        });
    }
}
