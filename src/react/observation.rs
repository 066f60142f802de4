//! 观察阶段：把后端原始结果整理为 Observation（状态 / 指标 / 异常 / 洞察）
//!
//! 原始结果中可选的字段：
//! - `metrics`: `{execution_time_ms, memory_mb, cpu_percent}`
//! - `anomalies`: `[{kind, severity, detail}]`
//! - `insights`: `[string]`

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::AdjusterSection;
use crate::core::ExecutionState;
use crate::plan::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub execution_time_ms: Option<u64>,
    pub memory_mb: Option<f64>,
    pub cpu_percent: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    HighMemory,
    HighCpu,
    RepeatedFailures,
    SlowExecution,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub kind: AnomalyKind,
    pub severity: Severity,
    pub task_id: TaskId,
    #[serde(default)]
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub task_id: TaskId,
    pub status: ObservationStatus,
    pub metrics: Metrics,
    pub anomalies: Vec<Anomaly>,
    pub insights: Vec<String>,
    /// 后端返回的原始结果
    #[serde(default)]
    pub raw: Value,
}

impl Observation {
    pub fn has_anomaly(&self, kind: AnomalyKind) -> bool {
        self.anomalies.iter().any(|a| a.kind == kind)
    }
}

/// 观察构建器：(task_id, raw_result, execution_state) -> Observation
pub trait ObservationBuilder: Send + Sync {
    fn build(&self, task_id: &str, raw: &Value, state: &ExecutionState) -> Observation;
}

/// 默认实现：读取原始结果中的指标 / 异常 / 洞察，并按阈值补充高内存、高 CPU、慢执行异常
#[derive(Debug, Clone)]
pub struct DefaultObservationBuilder {
    high_memory_mb: f64,
    high_cpu_percent: f64,
    slow_execution_ms: u64,
}

impl Default for DefaultObservationBuilder {
    fn default() -> Self {
        Self::from_config(&AdjusterSection::default())
    }
}

impl DefaultObservationBuilder {
    pub fn from_config(cfg: &AdjusterSection) -> Self {
        Self {
            high_memory_mb: cfg.high_memory_mb,
            high_cpu_percent: cfg.high_cpu_percent,
            slow_execution_ms: cfg.slow_execution_ms,
        }
    }

    fn parse_anomaly(task_id: &str, v: &Value) -> Option<Anomaly> {
        let kind = v
            .get("kind")
            .cloned()
            .and_then(|k| serde_json::from_value(k).ok())
            .unwrap_or(AnomalyKind::Other);
        let severity = v
            .get("severity")
            .cloned()
            .and_then(|s| serde_json::from_value(s).ok())
            .unwrap_or(Severity::Warning);
        let detail = v
            .get("detail")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        v.is_object().then(|| Anomaly {
            kind,
            severity,
            task_id: task_id.to_string(),
            detail,
        })
    }
}

impl ObservationBuilder for DefaultObservationBuilder {
    fn build(&self, task_id: &str, raw: &Value, _state: &ExecutionState) -> Observation {
        let m = raw.get("metrics");
        let metrics = Metrics {
            execution_time_ms: m.and_then(|m| m.get("execution_time_ms")).and_then(Value::as_u64),
            memory_mb: m.and_then(|m| m.get("memory_mb")).and_then(Value::as_f64),
            cpu_percent: m.and_then(|m| m.get("cpu_percent")).and_then(Value::as_f64),
        };

        let mut anomalies: Vec<Anomaly> = raw
            .get("anomalies")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(|v| Self::parse_anomaly(task_id, v))
                    .collect()
            })
            .unwrap_or_default();

        let mut derive = |kind: AnomalyKind, detail: String| {
            if !anomalies.iter().any(|a| a.kind == kind) {
                anomalies.push(Anomaly {
                    kind,
                    severity: Severity::Warning,
                    task_id: task_id.to_string(),
                    detail,
                });
            }
        };
        if let Some(mb) = metrics.memory_mb.filter(|mb| *mb > self.high_memory_mb) {
            derive(AnomalyKind::HighMemory, format!("memory {:.0} MB", mb));
        }
        if let Some(cpu) = metrics.cpu_percent.filter(|c| *c > self.high_cpu_percent) {
            derive(AnomalyKind::HighCpu, format!("cpu {:.0}%", cpu));
        }
        if let Some(ms) = metrics.execution_time_ms.filter(|ms| *ms > self.slow_execution_ms) {
            derive(AnomalyKind::SlowExecution, format!("took {} ms", ms));
        }

        let insights = raw
            .get("insights")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        Observation {
            task_id: task_id.to_string(),
            status: ObservationStatus::Completed,
            metrics,
            anomalies,
            insights,
            raw: raw.clone(),
        }
    }
}
