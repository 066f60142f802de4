//! 计划构建器
//!
//! 提供流畅的API来构建计划，build 时做依赖校验

use serde_json::{Map, Value};

use crate::plan::graph::validate_plan;
use crate::plan::types::*;

/// 计划构建器
pub struct PlanBuilder {
    id: PlanId,
    name: String,
    description: Option<String>,
    tasks: Vec<Task>,
    metadata: Map<String, Value>,
}

impl PlanBuilder {
    /// 创建新的计划构建器
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: format!("plan_{}", uuid::Uuid::new_v4()),
            name: name.into(),
            description: None,
            tasks: Vec::new(),
            metadata: Map::new(),
        }
    }

    /// 指定计划 ID（默认随机生成）
    pub fn id(mut self, id: impl Into<PlanId>) -> Self {
        self.id = id.into();
        self
    }

    /// 设置描述
    pub fn description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    /// 添加任务
    pub fn task(mut self, task: Task) -> Self {
        self.tasks.push(task);
        self
    }

    /// 设置顺序依赖
    pub fn sequential(mut self, from: impl Into<TaskId>, to: &str) -> Self {
        let from = from.into();
        if let Some(task) = self.tasks.iter_mut().find(|t| t.id == to) {
            if !task.dependencies.contains(&from) {
                task.dependencies.push(from);
            }
        }
        self
    }

    /// 设置AND依赖（所有前置任务）
    pub fn depends_on_all(mut self, task_id: &str, deps: Vec<TaskId>) -> Self {
        if let Some(task) = self.tasks.iter_mut().find(|t| t.id == task_id) {
            task.dependencies = deps;
        }
        self
    }

    /// 计划级元数据
    pub fn metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// 构建计划
    pub fn build(self) -> Result<Plan, PlanError> {
        let plan = Plan {
            id: self.id,
            name: self.name,
            description: self.description,
            tasks: self.tasks,
            metadata: self.metadata,
        };
        validate_plan(&plan)?;
        Ok(plan)
    }
}
