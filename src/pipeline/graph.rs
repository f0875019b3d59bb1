//! 流水线依赖图
//!
//! 使用邻接表和入度表实现 DAG：构建时校验依赖存在且无环（Kahn 拓扑排序）

use std::collections::{HashMap, VecDeque};

use crate::core::ErrorKind;
use crate::pipeline::types::StageId;

/// 流水线依赖图
#[derive(Debug, Clone)]
pub struct PipelineGraph {
    /// 邻接表：阶段 ID -> 依赖该阶段的阶段列表
    pub adjacency: HashMap<StageId, Vec<StageId>>,
    /// 入度表：阶段 ID -> 未完成的前置阶段数
    pub in_degree: HashMap<StageId, usize>,
    /// 声明顺序，保证调度确定性
    order: Vec<StageId>,
}

impl PipelineGraph {
    /// 由 (阶段, 前置阶段列表) 构建依赖图
    pub fn new<'a, I>(stages: I) -> Result<Self, ErrorKind>
    where
        I: IntoIterator<Item = (&'a StageId, &'a [StageId])>,
    {
        let stages: Vec<(&StageId, &[StageId])> = stages.into_iter().collect();
        let mut adjacency: HashMap<StageId, Vec<StageId>> = HashMap::new();
        let mut in_degree: HashMap<StageId, usize> = HashMap::new();
        let mut order = Vec::with_capacity(stages.len());

        for (stage_id, _) in &stages {
            if in_degree.insert((*stage_id).clone(), 0).is_some() {
                return Err(ErrorKind::Configuration(format!("duplicate stage '{stage_id}'")));
            }
            adjacency.insert((*stage_id).clone(), Vec::new());
            order.push((*stage_id).clone());
        }

        for (stage_id, deps) in &stages {
            for dep_id in deps.iter() {
                if !in_degree.contains_key(dep_id) {
                    return Err(ErrorKind::Configuration(format!(
                        "stage '{stage_id}' depends on unknown stage '{dep_id}'"
                    )));
                }
                adjacency.entry(dep_id.clone()).or_default().push((*stage_id).clone());
                *in_degree.entry((*stage_id).clone()).or_insert(0) += 1;
            }
        }

        let graph = Self { adjacency, in_degree, order };
        graph.topological_order()?;
        Ok(graph)
    }

    /// 拓扑序；存在环时返回 Configuration 错误
    pub fn topological_order(&self) -> Result<Vec<StageId>, ErrorKind> {
        let mut in_degree = self.in_degree.clone();
        let mut queue: VecDeque<StageId> = self
            .order
            .iter()
            .filter(|id| in_degree.get(*id) == Some(&0))
            .cloned()
            .collect();
        let mut sorted = Vec::with_capacity(self.order.len());

        while let Some(id) = queue.pop_front() {
            if let Some(dependents) = self.adjacency.get(&id) {
                for dependent in dependents {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push_back(dependent.clone());
                        }
                    }
                }
            }
            sorted.push(id);
        }

        if sorted.len() != self.order.len() {
            return Err(ErrorKind::Configuration("cyclic stage dependency detected".to_string()));
        }
        Ok(sorted)
    }

    /// 无前置依赖的阶段（按声明顺序）
    pub fn roots(&self) -> Vec<StageId> {
        self.order
            .iter()
            .filter(|id| self.in_degree.get(*id) == Some(&0))
            .cloned()
            .collect()
    }

    pub fn stage_ids(&self) -> &[StageId] {
        &self.order
    }

    pub fn dependents(&self, stage_id: &str) -> &[StageId] {
        self.adjacency.get(stage_id).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// 运行期入度追踪：阶段成功后返回新变为可执行的阶段
#[derive(Debug)]
pub struct ReadyTracker<'g> {
    graph: &'g PipelineGraph,
    remaining: HashMap<StageId, usize>,
}

impl<'g> ReadyTracker<'g> {
    pub fn new(graph: &'g PipelineGraph) -> Self {
        Self {
            graph,
            remaining: graph.in_degree.clone(),
        }
    }

    pub fn mark_succeeded(&mut self, stage_id: &str) -> Vec<StageId> {
        let mut newly_ready = Vec::new();
        for dependent in self.graph.dependents(stage_id) {
            if let Some(degree) = self.remaining.get_mut(dependent) {
                *degree = degree.saturating_sub(1);
                if *degree == 0 {
                    newly_ready.push(dependent.clone());
                }
            }
        }
        newly_ready
    }
}
