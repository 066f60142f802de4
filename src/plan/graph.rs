//! 计划依赖图
//!
//! 使用邻接表和入度表实现 DAG 校验（未知依赖、环）与独立任务分组

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use crate::plan::types::*;

/// 计划依赖图
pub struct DependencyGraph {
    /// 邻接表：任务 ID -> 依赖该任务的任务列表
    pub adjacency: HashMap<TaskId, Vec<TaskId>>,
    /// 入度表：任务 ID -> 依赖数
    pub in_degree: HashMap<TaskId, usize>,
    order: Vec<TaskId>,
}

impl DependencyGraph {
    /// 创建依赖图；未知依赖与重复 ID 直接报错
    pub fn new(tasks: &[Task]) -> Result<Self, PlanError> {
        let mut adjacency: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
        let mut in_degree: HashMap<TaskId, usize> = HashMap::new();
        let mut order = Vec::with_capacity(tasks.len());

        for task in tasks {
            if in_degree.insert(task.id.clone(), 0).is_some() {
                return Err(PlanError::DuplicateTask(task.id.clone()));
            }
            adjacency.insert(task.id.clone(), Vec::new());
            order.push(task.id.clone());
        }

        for task in tasks {
            for dep_id in &task.dependencies {
                if !in_degree.contains_key(dep_id) {
                    return Err(PlanError::UnknownDependency {
                        task: task.id.clone(),
                        dependency: dep_id.clone(),
                    });
                }
                adjacency.entry(dep_id.clone()).or_default().push(task.id.clone());
                *in_degree.entry(task.id.clone()).or_insert(0) += 1;
            }
        }

        Ok(Self { adjacency, in_degree, order })
    }

    /// Kahn 拓扑排序；存在环时返回 CyclicDependency
    pub fn topological_order(&self) -> Result<Vec<TaskId>, PlanError> {
        let mut degree = self.in_degree.clone();
        let mut queue: VecDeque<TaskId> = self
            .order
            .iter()
            .filter(|id| degree.get(*id) == Some(&0))
            .cloned()
            .collect();
        let mut sorted = Vec::with_capacity(self.order.len());

        while let Some(id) = queue.pop_front() {
            if let Some(dependents) = self.adjacency.get(&id) {
                for dependent in dependents {
                    if let Some(d) = degree.get_mut(dependent) {
                        *d -= 1;
                        if *d == 0 {
                            queue.push_back(dependent.clone());
                        }
                    }
                }
            }
            sorted.push(id);
        }

        if sorted.len() != self.order.len() {
            return Err(PlanError::CyclicDependency);
        }
        Ok(sorted)
    }
}

/// 完整校验：至少一个任务、无重复、无未知依赖、无环
pub fn validate_plan(plan: &Plan) -> Result<(), PlanError> {
    if plan.tasks.is_empty() {
        return Err(PlanError::EmptyPlan);
    }
    DependencyGraph::new(&plan.tasks)?.topological_order()?;
    Ok(())
}

/// 按相同依赖集合分组（组内任务彼此独立，可并行）；组按首次出现顺序排列
pub fn group_by_dependencies<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Vec<Vec<TaskId>> {
    let mut groups: BTreeMap<usize, Vec<TaskId>> = BTreeMap::new();
    let mut index: HashMap<Vec<TaskId>, usize> = HashMap::new();

    for task in tasks {
        let mut key: Vec<TaskId> = task
            .dependencies
            .iter()
            .cloned()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        key.sort();
        let next = index.len();
        let slot = *index.entry(key).or_insert(next);
        groups.entry(slot).or_default().push(task.id.clone());
    }

    groups.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, deps: &[&str]) -> Task {
        Task::new(id, format!("Task {}", id)).depends_on(deps.iter().copied())
    }

    #[test]
    fn test_graph_construction() {
        let tasks = vec![task("task1", &[]), task("task2", &["task1"])];
        let graph = DependencyGraph::new(&tasks).unwrap();

        assert_eq!(graph.in_degree.get("task1"), Some(&0));
        assert_eq!(graph.in_degree.get("task2"), Some(&1));
        assert_eq!(graph.adjacency.get("task1").unwrap(), &vec!["task2".to_string()]);
    }

    #[test]
    fn test_topological_order() {
        let tasks = vec![task("c", &["a", "b"]), task("a", &[]), task("b", &["a"])];
        let order = DependencyGraph::new(&tasks).unwrap().topological_order().unwrap();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_cycle_detected() {
        let tasks = vec![task("a", &["b"]), task("b", &["a"])];
        let result = DependencyGraph::new(&tasks).unwrap().topological_order();
        assert_eq!(result, Err(PlanError::CyclicDependency));
    }

    #[test]
    fn test_unknown_dependency() {
        let tasks = vec![task("a", &["ghost"])];
        assert!(matches!(
            DependencyGraph::new(&tasks),
            Err(PlanError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn test_empty_plan_rejected() {
        let plan = Plan::new("empty", vec![]);
        assert_eq!(validate_plan(&plan), Err(PlanError::EmptyPlan));
    }

    #[test]
    fn test_group_by_dependencies() {
        let tasks = vec![
            task("x", &["root"]),
            task("y", &[]),
            task("z", &["root"]),
            task("w", &[]),
        ];
        let groups = group_by_dependencies(&tasks);
        assert_eq!(groups, vec![vec!["x".to_string(), "z".to_string()], vec!["y".to_string(), "w".to_string()]]);
    }
}
