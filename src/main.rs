//! Hive - 自适应计划执行引擎演示
//!
//! 入口：初始化日志、加载配置与计划文件，在模拟后端上执行计划，打印运行结果与历史摘要。
//! 用法：`hive [plan.toml|plan.json] [config.toml]`

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use hive::backend::{Backends, FailureKind, SimulatedBackend};
use hive::config::{load_config, AppConfig};
use hive::observability;
use hive::{ExecutionOptions, Plan, PlanExecutor};
use tokio::sync::broadcast::error::RecvError;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 日志：默认 info，可通过 RUST_LOG 覆盖
    observability::init();

    let mut args = std::env::args().skip(1);
    let plan_path = args
        .next()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("plans/sample.toml"));
    let config_path = args.next().map(PathBuf::from);

    let cfg = load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });

    let plan = Plan::from_file(&plan_path)
        .with_context(|| format!("Failed to load plan {}", plan_path.display()))?;

    // 演示：transform 第一次超时，展示 extended_timeout 重试
    let backend = SimulatedBackend::new(Duration::from_millis(200)).fail_times(
        "transform",
        1,
        FailureKind::Timeout,
    );
    let executor = PlanExecutor::builder()
        .config(cfg.clone())
        .backends(Backends::simulated(Arc::new(backend)))
        .spawn();

    let mut events = executor.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(envelope) => {
                    let event = serde_json::to_string(&envelope.event).unwrap_or_default();
                    tracing::info!(topic = %envelope.topic, %event, "event");
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event subscriber lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    // Ctrl+C 取消运行
    let control = executor.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = control.cancel("interrupted").await;
        }
    });

    let result = executor
        .execute_plan(plan, ExecutionOptions::from_config(&cfg.executor))
        .await
        .context("Plan execution failed")?;

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
