//! Hive - Rust 自适应计划执行引擎
//!
//! 模块划分：
//! - **plan**: 计划 / 任务模型、依赖图校验、构建器
//! - **backend**: 执行后端抽象（工作流 / 计算引擎 / 工具 / 兜底）与模拟后端
//! - **core**: 执行状态、运行历史、错误与恢复策略
//! - **llm**: LLM 客户端与推理预言机（OpenAI 兼容 / Mock）
//! - **react**: 思考、行动、观察、计划调整与运行事件
//! - **executor**: 运行状态机、运行循环、检查点与控制面
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **observability**: tracing 初始化

pub mod backend;
pub mod config;
pub mod core;
pub mod executor;
pub mod llm;
pub mod observability;
pub mod plan;
pub mod react;

pub use executor::{ExecutionOptions, PlanExecutor, RunResult, RunStatus};
pub use plan::{Plan, PlanBuilder, Task};
