//! 计划模型：计划 / 任务类型、依赖图校验、构建器

pub mod builder;
pub mod graph;
pub mod types;

pub use builder::PlanBuilder;
pub use graph::{group_by_dependencies, validate_plan, DependencyGraph};
pub use types::*;
