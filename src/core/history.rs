//! 运行历史：只追加的思考 / 观察 / 失败 / 重试 / 调整记录，以及派生的统计与洞察

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backend::TaskFailure;
use crate::plan::TaskId;
use crate::react::{Approach, Observation, Thought};

const TOP_N: usize = 5;
const HEAVY_RETRY_THRESHOLD: u32 = 3;
const SLOW_TASK_MS: u64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Thought,
    Observation,
    Failure,
    Retry,
    Adjustment,
}

/// 一条历史记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub kind: EntryKind,
    pub task_id: Option<TaskId>,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub failure: TaskFailure,
    /// 1 + 该任务此前的失败次数
    pub attempt: u32,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub approach: Approach,
    pub action_id: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timing {
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Timing {
    pub fn duration_ms(&self) -> Option<u64> {
        self.ended_at
            .map(|end| (end - self.started_at).num_milliseconds().max(0) as u64)
    }
}

/// 调试用的命名快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedSnapshot {
    pub name: String,
    pub value: Value,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailurePattern {
    pub task_id: TaskId,
    pub failures: usize,
    pub kinds: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternAnalysis {
    pub most_retried: Vec<(TaskId, u32)>,
    pub most_failed: Vec<FailurePattern>,
    pub slowest: Vec<(TaskId, u64)>,
}

/// summary() 的结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistorySummary {
    pub total_entries: usize,
    pub thoughts: usize,
    pub observations: usize,
    pub failures: usize,
    pub total_retries: u32,
    pub unique_tasks: usize,
    pub patterns: PatternAnalysis,
    pub insights: Vec<String>,
}

/// 单次运行的历史
#[derive(Debug, Clone, Default, Serialize)]
pub struct History {
    entries: Vec<HistoryEntry>,
    thoughts: HashMap<TaskId, Vec<Thought>>,
    observations: HashMap<TaskId, Vec<Observation>>,
    failures: HashMap<TaskId, Vec<FailureRecord>>,
    retries: HashMap<TaskId, u32>,
    attempts: HashMap<TaskId, Vec<AttemptRecord>>,
    timings: HashMap<TaskId, Timing>,
    snapshots: Vec<NamedSnapshot>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, kind: EntryKind, task_id: Option<&str>, payload: Value) {
        self.entries.push(HistoryEntry {
            kind,
            task_id: task_id.map(String::from),
            timestamp: Utc::now(),
            payload,
        });
    }

    pub fn record_thought(&mut self, task_id: &str, thought: Thought) {
        self.push(
            EntryKind::Thought,
            Some(task_id),
            serde_json::to_value(&thought).unwrap_or(Value::Null),
        );
        self.thoughts.entry(task_id.to_string()).or_default().push(thought);
    }

    pub fn record_observation(&mut self, task_id: &str, observation: Observation) {
        self.push(
            EntryKind::Observation,
            Some(task_id),
            serde_json::to_value(&observation).unwrap_or(Value::Null),
        );
        self.observations
            .entry(task_id.to_string())
            .or_default()
            .push(observation);
    }

    /// 记录失败，返回本次的 attempt 序号
    pub fn record_failure(&mut self, task_id: &str, failure: TaskFailure) -> u32 {
        let records = self.failures.entry(task_id.to_string()).or_default();
        let attempt = records.len() as u32 + 1;
        let record = FailureRecord {
            failure,
            attempt,
            at: Utc::now(),
        };
        let payload = serde_json::to_value(&record).unwrap_or(Value::Null);
        records.push(record);
        self.push(EntryKind::Failure, Some(task_id), payload);
        attempt
    }

    /// 重试计数 +1，返回新值
    pub fn increment_retry(&mut self, task_id: &str) -> u32 {
        let count = self.retries.entry(task_id.to_string()).or_insert(0);
        *count += 1;
        let count = *count;
        self.push(
            EntryKind::Retry,
            Some(task_id),
            serde_json::json!({ "retry": count }),
        );
        count
    }

    pub fn record_attempt(&mut self, task_id: &str, approach: Approach, action_id: &str) -> u32 {
        let records = self.attempts.entry(task_id.to_string()).or_default();
        let attempt = records.len() as u32 + 1;
        records.push(AttemptRecord {
            attempt,
            approach,
            action_id: action_id.to_string(),
            at: Utc::now(),
        });
        attempt
    }

    pub fn record_start(&mut self, task_id: &str) {
        self.timings.insert(
            task_id.to_string(),
            Timing {
                started_at: Utc::now(),
                ended_at: None,
            },
        );
    }

    pub fn record_end(&mut self, task_id: &str) {
        if let Some(timing) = self.timings.get_mut(task_id) {
            timing.ended_at = Some(Utc::now());
        }
    }

    pub fn record_adjustment(&mut self, task_id: Option<&str>, payload: Value) {
        self.push(EntryKind::Adjustment, task_id, payload);
    }

    pub fn record_snapshot(&mut self, name: impl Into<String>, value: Value) {
        self.snapshots.push(NamedSnapshot {
            name: name.into(),
            value,
            at: Utc::now(),
        });
    }

    pub fn retry_count(&self, task_id: &str) -> u32 {
        self.retries.get(task_id).copied().unwrap_or(0)
    }

    pub fn failure_count(&self, task_id: &str) -> usize {
        self.failures.get(task_id).map(Vec::len).unwrap_or(0)
    }

    pub fn last_failure(&self, task_id: &str) -> Option<&FailureRecord> {
        self.failures.get(task_id).and_then(|f| f.last())
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn thoughts(&self, task_id: &str) -> &[Thought] {
        self.thoughts.get(task_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn observations(&self, task_id: &str) -> &[Observation] {
        self.observations
            .get(task_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn timing(&self, task_id: &str) -> Option<&Timing> {
        self.timings.get(task_id)
    }

    pub fn snapshots(&self) -> &[NamedSnapshot] {
        &self.snapshots
    }

    /// 任务耗时：优先取计时对，否则取最近一次观察的 execution_time_ms
    fn durations(&self) -> BTreeMap<TaskId, u64> {
        let mut out = BTreeMap::new();
        for (task_id, obs) in &self.observations {
            if let Some(ms) = obs.last().and_then(|o| o.metrics.execution_time_ms) {
                out.insert(task_id.clone(), ms);
            }
        }
        for (task_id, timing) in &self.timings {
            if let Some(ms) = timing.duration_ms() {
                out.insert(task_id.clone(), ms);
            }
        }
        out
    }

    pub fn summary(&self) -> HistorySummary {
        let count = |kind: EntryKind| self.entries.iter().filter(|e| e.kind == kind).count();
        let thoughts = count(EntryKind::Thought);
        let observations = count(EntryKind::Observation);
        let failures = count(EntryKind::Failure);
        let total_retries: u32 = self.retries.values().sum();
        let unique_tasks = self
            .entries
            .iter()
            .filter_map(|e| e.task_id.as_ref())
            .collect::<BTreeSet<_>>()
            .len();

        let mut most_retried: Vec<(TaskId, u32)> =
            self.retries.iter().map(|(k, v)| (k.clone(), *v)).collect();
        most_retried.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        most_retried.truncate(TOP_N);

        let mut most_failed: Vec<FailurePattern> = self
            .failures
            .iter()
            .map(|(task_id, records)| {
                let mut kinds = BTreeMap::new();
                for r in records {
                    *kinds.entry(r.failure.kind.as_str().to_string()).or_insert(0) += 1;
                }
                FailurePattern {
                    task_id: task_id.clone(),
                    failures: records.len(),
                    kinds,
                }
            })
            .collect();
        most_failed.sort_by(|a, b| b.failures.cmp(&a.failures).then_with(|| a.task_id.cmp(&b.task_id)));
        most_failed.truncate(TOP_N);

        let durations = self.durations();
        let mut slowest: Vec<(TaskId, u64)> =
            durations.iter().map(|(k, v)| (k.clone(), *v)).collect();
        slowest.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        slowest.truncate(TOP_N);

        let mut insights = Vec::new();
        let heavy = self
            .retries
            .values()
            .filter(|r| **r >= HEAVY_RETRY_THRESHOLD)
            .count();
        if heavy > 0 {
            insights.push(format!("{} tasks required 3+ retries", heavy));
        }
        if failures > 0 {
            let rate = failures as f64 / (failures + observations) as f64;
            insights.push(format!("overall failure rate: {:.1}%", rate * 100.0));
        }
        let slow = durations.values().filter(|ms| **ms > SLOW_TASK_MS).count();
        if slow > 0 {
            insights.push(format!("{} tasks took over 1 minute", slow));
        }

        HistorySummary {
            total_entries: self.entries.len(),
            thoughts,
            observations,
            failures,
            total_retries,
            unique_tasks,
            patterns: PatternAnalysis {
                most_retried,
                most_failed,
                slowest,
            },
            insights,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::FailureKind;
    use crate::react::observation::{Metrics, ObservationStatus};

    fn observation(task_id: &str, ms: Option<u64>) -> Observation {
        Observation {
            task_id: task_id.to_string(),
            status: ObservationStatus::Completed,
            metrics: Metrics {
                execution_time_ms: ms,
                ..Metrics::default()
            },
            anomalies: vec![],
            insights: vec![],
            raw: Value::Null,
        }
    }

    #[test]
    fn test_failure_attempts_increase() {
        let mut h = History::new();
        assert_eq!(h.record_failure("a", TaskFailure::timeout("slow")), 1);
        assert_eq!(h.record_failure("a", TaskFailure::execution("boom")), 2);
        assert_eq!(h.record_failure("b", TaskFailure::execution("boom")), 1);
        assert_eq!(h.failure_count("a"), 2);
        assert_eq!(h.last_failure("a").unwrap().failure.kind, FailureKind::Execution);
    }

    #[test]
    fn test_summary_counts_and_insights() {
        let mut h = History::new();
        for _ in 0..3 {
            h.increment_retry("a");
        }
        h.record_failure("a", TaskFailure::timeout("slow"));
        h.record_observation("b", observation("b", Some(90_000)));
        h.record_observation("c", observation("c", Some(10)));
        h.record_observation("d", observation("d", None));

        let summary = h.summary();
        assert_eq!(summary.failures, 1);
        assert_eq!(summary.observations, 3);
        assert_eq!(summary.total_retries, 3);
        assert_eq!(summary.unique_tasks, 4);
        assert_eq!(summary.total_entries, 7);
        assert_eq!(
            summary.insights,
            vec![
                "1 tasks required 3+ retries".to_string(),
                "overall failure rate: 25.0%".to_string(),
                "1 tasks took over 1 minute".to_string(),
            ]
        );
        assert_eq!(summary.patterns.most_retried, vec![("a".to_string(), 3)]);
        assert_eq!(summary.patterns.slowest[0], ("b".to_string(), 90_000));
        assert_eq!(summary.patterns.most_failed[0].kinds["timeout"], 1);
    }

    #[test]
    fn test_empty_summary_has_no_insights() {
        let summary = History::new().summary();
        assert_eq!(summary.total_entries, 0);
        assert!(summary.insights.is_empty());
    }

    #[test]
    fn test_timing_pair() {
        let mut h = History::new();
        h.record_start("a");
        assert!(h.timing("a").unwrap().duration_ms().is_none());
        h.record_end("a");
        assert!(h.timing("a").unwrap().duration_ms().is_some());
    }
}
