//! 检查点：执行状态的时间点快照，按最新在前保存，数量有上限

use std::collections::{BTreeSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::StateSnapshot;
use crate::plan::TaskId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub state: StateSnapshot,
    pub completed_tasks: BTreeSet<TaskId>,
    pub failed_tasks: BTreeSet<TaskId>,
}

impl Checkpoint {
    pub fn new(state: StateSnapshot) -> Self {
        Self {
            id: format!("ckpt_{}", uuid::Uuid::new_v4()),
            created_at: Utc::now(),
            completed_tasks: state.completed_tasks.clone(),
            failed_tasks: state.failed_tasks.clone(),
            state,
        }
    }
}

#[derive(Debug)]
pub(crate) struct CheckpointStore {
    items: VecDeque<Checkpoint>,
    max: usize,
}

impl CheckpointStore {
    pub fn new(max: usize) -> Self {
        Self {
            items: VecDeque::new(),
            max: max.max(1),
        }
    }

    /// 插到最前；超出上限时丢弃最旧的
    pub fn push(&mut self, checkpoint: Checkpoint) {
        self.items.push_front(checkpoint);
        self.items.truncate(self.max);
    }

    pub fn get(&self, id: &str) -> Option<&Checkpoint> {
        self.items.iter().find(|c| c.id == id)
    }

    pub fn list(&self) -> Vec<Checkpoint> {
        self.items.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}
