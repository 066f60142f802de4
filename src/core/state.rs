//! 执行状态：单次运行的任务状态、依赖满足与资源分配
//!
//! 只由运行循环写入；外部读者拿到的是 StateSnapshot。
//! 不变量：completed ∩ failed = ∅，且每个任务至多处于 current / completed / failed 之一。

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::plan::{Complexity, Plan, Task, TaskId};
use crate::react::action::ActionHandle;

/// 状态迁移错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StateError {
    #[error("Unknown task: {0}")]
    UnknownTask(TaskId),
    #[error("Task {0} is already in flight")]
    AlreadyInFlight(TaskId),
    #[error("Task {0} is not in flight")]
    NotInFlight(TaskId),
    #[error("Task {0} is already resolved")]
    AlreadyResolved(TaskId),
}

/// 依赖状态（供思考阶段使用）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyStatus {
    Completed,
    Failed,
    InProgress,
    Pending,
}

/// 资源预留记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceAllocation {
    pub cpu_shares: u32,
    pub memory_mb: u64,
    pub allocated_at: DateTime<Utc>,
}

impl ResourceAllocation {
    /// 按复杂度估算预留量
    pub fn for_task(task: &Task) -> Self {
        let (cpu_shares, memory_mb) = match task.complexity {
            Complexity::Trivial => (1, 128),
            Complexity::Simple => (1, 256),
            Complexity::Medium => (2, 512),
            Complexity::Complex => (4, 1024),
            Complexity::VeryComplex => (8, 2048),
        };
        Self {
            cpu_shares,
            memory_mb,
            allocated_at: Utc::now(),
        }
    }
}

/// 在途任务
#[derive(Debug, Clone)]
pub struct InFlightTask {
    pub handle: ActionHandle,
    pub started_at: DateTime<Utc>,
}

/// 检查点用的状态快照（不含在途句柄与 metadata）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub all_tasks: Vec<TaskId>,
    pub completed_tasks: BTreeSet<TaskId>,
    pub failed_tasks: BTreeSet<TaskId>,
    pub task_dependencies: BTreeMap<TaskId, Vec<TaskId>>,
    pub resource_allocations: BTreeMap<TaskId, ResourceAllocation>,
    pub taken_at: DateTime<Utc>,
}

/// 单次运行的执行状态
#[derive(Debug, Default)]
pub struct ExecutionState {
    /// 按计划顺序
    all_tasks: Vec<TaskId>,
    completed_tasks: BTreeSet<TaskId>,
    failed_tasks: BTreeSet<TaskId>,
    current_tasks: HashMap<TaskId, InFlightTask>,
    task_dependencies: HashMap<TaskId, Vec<TaskId>>,
    resource_allocations: HashMap<TaskId, ResourceAllocation>,
    /// 任务结果 / 错误 / 升级后的超时等辅助数据
    metadata: HashMap<String, Value>,
}

impl ExecutionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// 用任务集合与依赖表初始化（清空之前的一切）
    pub fn initialize(&mut self, tasks: &[Task]) {
        *self = Self::default();
        for task in tasks {
            self.all_tasks.push(task.id.clone());
            self.task_dependencies
                .insert(task.id.clone(), task.dependencies.clone());
        }
    }

    /// 计划调整后同步：追加新任务，刷新未决任务的依赖
    pub fn sync_plan(&mut self, plan: &Plan) {
        for task in &plan.tasks {
            if !self.task_dependencies.contains_key(&task.id) {
                self.all_tasks.push(task.id.clone());
            }
            if !self.is_resolved(&task.id) {
                self.task_dependencies
                    .insert(task.id.clone(), task.dependencies.clone());
            }
        }
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.task_dependencies.contains_key(task_id)
    }

    pub fn is_resolved(&self, task_id: &str) -> bool {
        self.completed_tasks.contains(task_id) || self.failed_tasks.contains(task_id)
    }

    pub fn is_current(&self, task_id: &str) -> bool {
        self.current_tasks.contains_key(task_id)
    }

    fn deps_satisfied(&self, task_id: &str) -> bool {
        self.task_dependencies
            .get(task_id)
            .map(|deps| deps.iter().all(|d| self.completed_tasks.contains(d)))
            .unwrap_or(true)
    }

    /// 就绪任务：未完成、未失败、不在途，且依赖全部完成；按计划顺序返回
    pub fn get_ready_tasks(&self) -> Vec<TaskId> {
        self.all_tasks
            .iter()
            .filter(|id| !self.is_resolved(id) && !self.is_current(id))
            .filter(|id| self.deps_satisfied(id))
            .cloned()
            .collect()
    }

    /// 未完成、未失败、不在途的任务（计划调整的作用范围）
    pub fn remaining_tasks(&self) -> Vec<TaskId> {
        self.all_tasks
            .iter()
            .filter(|id| !self.is_resolved(id) && !self.is_current(id))
            .cloned()
            .collect()
    }

    /// 依赖链上存在失败任务、永远无法就绪的未决任务（不动点）
    pub fn blocked_tasks(&self) -> Vec<TaskId> {
        let mut doomed: BTreeSet<&TaskId> = self.failed_tasks.iter().collect();
        let mut blocked = Vec::new();
        loop {
            let mut changed = false;
            for id in &self.all_tasks {
                if self.is_resolved(id) || self.is_current(id) || blocked.contains(id) {
                    continue;
                }
                let hit = self
                    .task_dependencies
                    .get(id)
                    .map(|deps| deps.iter().any(|d| doomed.contains(d)))
                    .unwrap_or(false);
                if hit {
                    doomed.insert(id);
                    blocked.push(id.clone());
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        // 保持计划顺序
        self.all_tasks
            .iter()
            .filter(|id| blocked.contains(id))
            .cloned()
            .collect()
    }

    /// completed ∪ failed = all_tasks
    pub fn execution_complete(&self) -> bool {
        self.all_tasks.iter().all(|id| self.is_resolved(id))
    }

    pub fn progress_percentage(&self) -> f64 {
        if self.all_tasks.is_empty() {
            return 100.0;
        }
        100.0 * self.completed_tasks.len() as f64 / self.all_tasks.len() as f64
    }

    /// failed / (failed + completed)，没有已决任务时为 0
    pub fn failure_rate(&self) -> f64 {
        let resolved = self.failed_tasks.len() + self.completed_tasks.len();
        if resolved == 0 {
            return 0.0;
        }
        self.failed_tasks.len() as f64 / resolved as f64
    }

    pub fn start_task(&mut self, task_id: &str, handle: ActionHandle) -> Result<(), StateError> {
        if !self.contains(task_id) {
            return Err(StateError::UnknownTask(task_id.to_string()));
        }
        if self.is_resolved(task_id) {
            return Err(StateError::AlreadyResolved(task_id.to_string()));
        }
        if self.is_current(task_id) {
            return Err(StateError::AlreadyInFlight(task_id.to_string()));
        }
        self.current_tasks.insert(
            task_id.to_string(),
            InFlightTask {
                handle,
                started_at: Utc::now(),
            },
        );
        Ok(())
    }

    /// 完成在途任务并释放资源
    pub fn complete_task(&mut self, task_id: &str) -> Result<InFlightTask, StateError> {
        let in_flight = self
            .current_tasks
            .remove(task_id)
            .ok_or_else(|| StateError::NotInFlight(task_id.to_string()))?;
        self.resource_allocations.remove(task_id);
        self.completed_tasks.insert(task_id.to_string());
        Ok(in_flight)
    }

    /// 标记失败；任务可以不在途（例如被失败依赖阻塞）
    pub fn fail_task(&mut self, task_id: &str) -> Result<Option<InFlightTask>, StateError> {
        if !self.contains(task_id) {
            return Err(StateError::UnknownTask(task_id.to_string()));
        }
        if self.is_resolved(task_id) {
            return Err(StateError::AlreadyResolved(task_id.to_string()));
        }
        let in_flight = self.current_tasks.remove(task_id);
        self.resource_allocations.remove(task_id);
        self.failed_tasks.insert(task_id.to_string());
        Ok(in_flight)
    }

    /// 离开在途集合但不决议，下一轮重新就绪
    pub fn requeue_task(&mut self, task_id: &str) -> Result<InFlightTask, StateError> {
        let in_flight = self
            .current_tasks
            .remove(task_id)
            .ok_or_else(|| StateError::NotInFlight(task_id.to_string()))?;
        self.resource_allocations.remove(task_id);
        Ok(in_flight)
    }

    pub fn allocate_resources(&mut self, task: &Task) -> ResourceAllocation {
        let allocation = ResourceAllocation::for_task(task);
        self.resource_allocations
            .insert(task.id.clone(), allocation.clone());
        allocation
    }

    pub fn release_resources(&mut self, task_id: &str) -> Option<ResourceAllocation> {
        self.resource_allocations.remove(task_id)
    }

    /// 取消并清空全部在途动作
    pub fn cancel_in_flight(&mut self) -> Vec<InFlightTask> {
        let drained: Vec<InFlightTask> = self.current_tasks.drain().map(|(_, t)| t).collect();
        for task in &drained {
            task.handle.cancel();
        }
        self.resource_allocations.clear();
        drained
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            all_tasks: self.all_tasks.clone(),
            completed_tasks: self.completed_tasks.clone(),
            failed_tasks: self.failed_tasks.clone(),
            task_dependencies: self
                .task_dependencies
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            resource_allocations: self
                .resource_allocations
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            taken_at: Utc::now(),
        }
    }

    /// 从快照恢复；在途集合清空（调用方负责先取消在途动作），metadata 保留
    pub fn restore(&mut self, snapshot: &StateSnapshot) {
        self.all_tasks = snapshot.all_tasks.clone();
        self.completed_tasks = snapshot.completed_tasks.clone();
        self.failed_tasks = snapshot.failed_tasks.clone();
        self.task_dependencies = snapshot.task_dependencies.clone().into_iter().collect();
        self.resource_allocations = snapshot.resource_allocations.clone().into_iter().collect();
        self.current_tasks.clear();
    }

    /// 某任务每个依赖的当前状态
    pub fn dependency_status(&self, task_id: &str) -> BTreeMap<TaskId, DependencyStatus> {
        self.dependencies(task_id)
            .iter()
            .map(|dep| {
                let status = if self.completed_tasks.contains(dep) {
                    DependencyStatus::Completed
                } else if self.failed_tasks.contains(dep) {
                    DependencyStatus::Failed
                } else if self.current_tasks.contains_key(dep) {
                    DependencyStatus::InProgress
                } else {
                    DependencyStatus::Pending
                };
                (dep.clone(), status)
            })
            .collect()
    }

    pub fn dependencies(&self, task_id: &str) -> &[TaskId] {
        self.task_dependencies
            .get(task_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn all_tasks(&self) -> &[TaskId] {
        &self.all_tasks
    }

    pub fn completed_tasks(&self) -> &BTreeSet<TaskId> {
        &self.completed_tasks
    }

    pub fn failed_tasks(&self) -> &BTreeSet<TaskId> {
        &self.failed_tasks
    }

    pub fn current_tasks(&self) -> &HashMap<TaskId, InFlightTask> {
        &self.current_tasks
    }

    pub fn in_flight(&self, task_id: &str) -> Option<&InFlightTask> {
        self.current_tasks.get(task_id)
    }

    pub fn in_flight_count(&self) -> usize {
        self.current_tasks.len()
    }

    pub fn resource_allocations(&self) -> &HashMap<TaskId, ResourceAllocation> {
        &self.resource_allocations
    }

    pub fn metadata(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: Value) {
        self.metadata.insert(key.into(), value);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::react::Approach;

    fn task(id: &str, deps: &[&str]) -> Task {
        Task::new(id, id.to_uppercase()).depends_on(deps.iter().copied())
    }

    fn handle(task_id: &str) -> ActionHandle {
        ActionHandle::new(task_id, Approach::DirectExecution, "fallback", Duration::from_secs(1))
    }

    fn state(tasks: &[Task]) -> ExecutionState {
        let mut s = ExecutionState::new();
        s.initialize(tasks);
        s
    }

    #[test]
    fn test_ready_tasks_respect_dependencies() {
        let mut s = state(&[task("a", &[]), task("b", &["a"]), task("c", &[])]);
        assert_eq!(s.get_ready_tasks(), vec!["a", "c"]);

        s.start_task("a", handle("a")).unwrap();
        assert_eq!(s.get_ready_tasks(), vec!["c"]);

        s.complete_task("a").unwrap();
        assert_eq!(s.get_ready_tasks(), vec!["b", "c"]);
    }

    #[test]
    fn test_completed_and_failed_disjoint() {
        let mut s = state(&[task("a", &[]), task("b", &[])]);
        s.start_task("a", handle("a")).unwrap();
        s.complete_task("a").unwrap();
        assert!(matches!(s.fail_task("a"), Err(StateError::AlreadyResolved(_))));
        s.fail_task("b").unwrap();
        assert!(s.completed_tasks().is_disjoint(s.failed_tasks()));
        assert!(s.execution_complete());
    }

    #[test]
    fn test_progress_non_decreasing() {
        let mut s = state(&[task("a", &[]), task("b", &[]), task("c", &[]), task("d", &[])]);
        assert_eq!(s.progress_percentage(), 0.0);
        s.start_task("a", handle("a")).unwrap();
        s.complete_task("a").unwrap();
        assert_eq!(s.progress_percentage(), 25.0);
        s.fail_task("b").unwrap();
        assert_eq!(s.progress_percentage(), 25.0);
        assert!((s.failure_rate() - 0.5).abs() < f64::EPSILON);
        assert_eq!(ExecutionState::new().progress_percentage(), 100.0);
    }

    #[test]
    fn test_start_twice_rejected() {
        let mut s = state(&[task("a", &[])]);
        s.start_task("a", handle("a")).unwrap();
        assert_eq!(
            s.start_task("a", handle("a")),
            Err(StateError::AlreadyInFlight("a".to_string()))
        );
        assert_eq!(
            s.start_task("ghost", handle("ghost")),
            Err(StateError::UnknownTask("ghost".to_string()))
        );
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let tasks = [task("a", &[]), task("b", &["a"]), task("c", &[])];
        let mut s = state(&tasks);
        s.allocate_resources(&tasks[0]);
        s.start_task("a", handle("a")).unwrap();
        s.complete_task("a").unwrap();
        s.allocate_resources(&tasks[2]);
        s.fail_task("c").unwrap();
        s.allocate_resources(&tasks[1]);
        s.set_metadata("a:result", json!({"ok": true}));
        let snap = s.snapshot();

        s.start_task("b", handle("b")).unwrap();
        s.complete_task("b").unwrap();

        s.restore(&snap);
        assert_eq!(s.completed_tasks(), &snap.completed_tasks);
        assert_eq!(s.failed_tasks(), &snap.failed_tasks);
        assert_eq!(s.resource_allocations().len(), 1);
        assert!(s.resource_allocations().contains_key("b"));
        assert_eq!(s.in_flight_count(), 0);
        assert_eq!(s.metadata("a:result"), Some(&json!({"ok": true})));
    }

    #[test]
    fn test_blocked_tasks_follow_failed_chain() {
        let mut s = state(&[task("a", &[]), task("b", &["a"]), task("c", &["b"]), task("d", &[])]);
        s.fail_task("a").unwrap();
        assert_eq!(s.blocked_tasks(), vec!["b", "c"]);
        assert_eq!(s.get_ready_tasks(), vec!["d"]);
    }

    #[test]
    fn test_requeue_makes_task_ready_again() {
        let mut s = state(&[task("a", &[])]);
        s.start_task("a", handle("a")).unwrap();
        assert!(s.get_ready_tasks().is_empty());
        s.requeue_task("a").unwrap();
        assert_eq!(s.get_ready_tasks(), vec!["a"]);
    }

    #[test]
    fn test_sync_plan_adds_tasks_and_refreshes_deps() {
        let mut s = state(&[task("a", &[]), task("b", &["a"])]);
        let plan = Plan::new("p", vec![task("a", &[]), task("b", &[]), task("c", &["b"])]);
        s.sync_plan(&plan);
        assert_eq!(s.all_tasks(), &["a", "b", "c"]);
        assert!(s.dependencies("b").is_empty());
        assert_eq!(s.get_ready_tasks(), vec!["a", "b"]);
    }

    #[test]
    fn test_dependency_status() {
        let mut s = state(&[task("a", &[]), task("b", &[]), task("c", &[]), task("d", &["a", "b", "c"])]);
        s.start_task("a", handle("a")).unwrap();
        s.complete_task("a").unwrap();
        s.fail_task("b").unwrap();
        let status = s.dependency_status("d");
        assert_eq!(status["a"], DependencyStatus::Completed);
        assert_eq!(status["b"], DependencyStatus::Failed);
        assert_eq!(status["c"], DependencyStatus::Pending);
    }

    #[test]
    fn test_cancel_in_flight_cancels_handles() {
        let mut s = state(&[task("a", &[])]);
        let h = handle("a");
        s.start_task("a", h.clone()).unwrap();
        let drained = s.cancel_in_flight();
        assert_eq!(drained.len(), 1);
        assert!(h.is_cancelled());
    }
}
