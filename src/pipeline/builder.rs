//! 流水线构建器
//!
//! 提供流畅的API来组装阶段、依赖、清理步骤与完成回调

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::core::{ErrorKind, WorkerPool};
use crate::pipeline::engine::{CleanupFn, CompletionFn, Pipeline};
use crate::pipeline::graph::PipelineGraph;
use crate::pipeline::types::*;

/// 流水线构建器
pub struct PipelineBuilder<C> {
    id: PipelineId,
    name: String,
    stages: Vec<PipelineStage<C>>,
    cleanups: Vec<CleanupFn<C>>,
    on_complete: Option<CompletionFn<C>>,
    cancel: Option<CancellationToken>,
    pool: Option<WorkerPool>,
}

impl<C: Send + 'static> PipelineBuilder<C> {
    /// 创建新的流水线构建器
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: format!("pl_{}", uuid::Uuid::new_v4()),
            name: name.into(),
            stages: Vec::new(),
            cleanups: Vec::new(),
            on_complete: None,
            cancel: None,
            pool: None,
        }
    }

    /// 添加阶段；weight 为其在总进度中的单位数
    pub fn stage(mut self, id: impl Into<StageId>, weight: u64, stage: impl Stage<C> + 'static) -> Self {
        self.stages.push(PipelineStage {
            id: id.into(),
            weight,
            dependencies: Vec::new(),
            stage: Arc::new(stage),
        });
        self
    }

    /// 设置顺序依赖：from 成功后才执行 to
    pub fn sequential(self, from: impl Into<StageId>, to: impl Into<StageId>) -> Self {
        self.depends_on(to, vec![from.into()])
    }

    /// 追加前置阶段（全部成功后才执行）
    pub fn depends_on(mut self, stage_id: impl Into<StageId>, deps: Vec<StageId>) -> Self {
        let id = stage_id.into();
        if let Some(stage) = self.stages.iter_mut().find(|s| s.id == id) {
            for dep in deps {
                if !stage.dependencies.contains(&dep) {
                    stage.dependencies.push(dep);
                }
            }
        }
        self
    }

    /// 终态后必定执行的清理步骤
    pub fn cleanup(mut self, f: impl FnOnce(&mut C) + Send + 'static) -> Self {
        self.cleanups.push(Box::new(f));
        self
    }

    /// 完成回调，恰好调用一次
    pub fn on_complete(mut self, f: impl FnOnce(&Outcome<C>) + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(f));
        self
    }

    /// 外部取消令牌（流水线内部使用其子令牌）
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn worker_pool(mut self, pool: WorkerPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// 构建流水线：校验依赖存在且无环
    pub fn build(self, context: C) -> Result<Pipeline<C>, ErrorKind> {
        if self.stages.is_empty() {
            return Err(ErrorKind::Configuration("pipeline has no stages".to_string()));
        }

        let graph = PipelineGraph::new(
            self.stages.iter().map(|s| (&s.id, s.dependencies.as_slice())),
        )?;

        Ok(Pipeline::new(
            self.id,
            self.name,
            graph,
            self.stages,
            context,
            self.cleanups,
            self.on_complete,
            self.cancel.unwrap_or_else(CancellationToken::new),
            self.pool.unwrap_or_default(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use crate::progress::Progress;

    fn noop() -> FnStage<()> {
        FnStage::new(|_cx: StageContext<()>, _p: Progress| async { Outcome::Success(()) }.boxed())
    }

    #[test]
    fn test_build_sequential_pipeline() {
        let pipeline = PipelineBuilder::new("Test Pipeline")
            .stage("unpack", 10, noop())
            .stage("install", 65, noop())
            .sequential("unpack", "install")
            .build(())
            .expect("Failed to build pipeline");

        assert_eq!(pipeline.name(), "Test Pipeline");
        assert_eq!(pipeline.handle().progress().total_units(), 75);
    }

    #[test]
    fn test_build_without_stages_fails() {
        let result = PipelineBuilder::<()>::new("Empty").build(());
        assert!(matches!(result, Err(ErrorKind::Configuration(_))));
    }

    #[test]
    fn test_build_with_cycle_fails() {
        let result = PipelineBuilder::new("Cycle")
            .stage("a", 1, noop())
            .stage("b", 1, noop())
            .sequential("a", "b")
            .sequential("b", "a")
            .build(());
        assert!(matches!(result, Err(ErrorKind::Configuration(_))));
    }
}
