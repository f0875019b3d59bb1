//! 流水线引擎
//!
//! 核心执行引擎：按依赖顺序调度阶段、短路失败、聚合进度、协作式取消，
//! 终态后执行清理步骤并恰好调用一次完成回调。

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError};

use futures_util::FutureExt;
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::core::{ErrorKind, WorkerPool};
use crate::pipeline::graph::{PipelineGraph, ReadyTracker};
use crate::pipeline::types::*;
use crate::progress::Progress;

pub(crate) type CleanupFn<C> = Box<dyn FnOnce(&mut C) + Send>;
pub(crate) type CompletionFn<C> = Box<dyn FnOnce(&Outcome<C>) + Send>;

/// 每个阶段可见的进度单位
pub const STAGE_UNITS: u64 = 100;

/// 流水线句柄：取消、进度与阶段状态观察
#[derive(Clone, Debug)]
pub struct PipelineHandle {
    id: PipelineId,
    cancel: CancellationToken,
    progress: Progress,
    states: Arc<std::sync::Mutex<HashMap<StageId, StageState>>>,
    status: Arc<std::sync::Mutex<PipelineStatus>>,
}

impl PipelineHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// 取消流水线：未终结的阶段全部以 Cancelled 结束
    pub fn cancel(&self) {
        self.progress.cancel();
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    pub fn stage_state(&self, stage_id: &str) -> Option<StageState> {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(stage_id)
            .copied()
    }

    pub fn stage_states(&self) -> HashMap<StageId, StageState> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn status(&self) -> PipelineStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, stage_id: &str, state: StageState) {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(stage_id.to_string(), state);
    }

    fn set_status(&self, status: PipelineStatus) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status;
    }

    /// 所有仍在等待的阶段标记为 Skipped，不再调用
    fn skip_waiting(&self) -> usize {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        let mut skipped = 0;
        for state in states.values_mut() {
            if *state == StageState::Waiting {
                *state = StageState::Skipped;
                skipped += 1;
            }
        }
        skipped
    }
}

/// 阶段进度：slot 挂在根节点上，阶段只能推进 reporter（占 slot 的 99%），
/// 最后 1% 在阶段成功后由引擎补齐
struct StageMeter {
    slot: Progress,
    reporter: Progress,
}

/// 一次安装/侧载请求对应的流水线实例
pub struct Pipeline<C> {
    id: PipelineId,
    name: String,
    graph: PipelineGraph,
    stages: HashMap<StageId, PipelineStage<C>>,
    meters: HashMap<StageId, StageMeter>,
    shared: Arc<Mutex<C>>,
    cleanups: Vec<CleanupFn<C>>,
    on_complete: Option<CompletionFn<C>>,
    cancel: CancellationToken,
    pool: WorkerPool,
    handle: PipelineHandle,
}

impl<C: Send + 'static> Pipeline<C> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: PipelineId,
        name: String,
        graph: PipelineGraph,
        stages: Vec<PipelineStage<C>>,
        context: C,
        cleanups: Vec<CleanupFn<C>>,
        on_complete: Option<CompletionFn<C>>,
        cancel: CancellationToken,
        pool: WorkerPool,
    ) -> Self {
        let total: u64 = stages.iter().map(|s| s.weight).sum();
        let root = Progress::new(total).with_cancellation(cancel.clone());

        let mut meters = HashMap::new();
        let mut states = HashMap::new();
        for stage in &stages {
            let slot = Progress::new(STAGE_UNITS);
            let reporter = Progress::new(STAGE_UNITS);
            slot.add_child(&reporter, STAGE_UNITS - 1);
            root.add_child(&slot, stage.weight);
            meters.insert(stage.id.clone(), StageMeter { slot, reporter });
            states.insert(stage.id.clone(), StageState::Waiting);
        }

        let handle = PipelineHandle {
            id: id.clone(),
            cancel: cancel.clone(),
            progress: root,
            states: Arc::new(std::sync::Mutex::new(states)),
            status: Arc::new(std::sync::Mutex::new(PipelineStatus::Created)),
        };

        Self {
            id,
            name,
            graph,
            stages: stages.into_iter().map(|s| (s.id.clone(), s)).collect(),
            meters,
            shared: Arc::new(Mutex::new(context)),
            cleanups,
            on_complete,
            cancel,
            pool,
            handle,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> PipelineHandle {
        self.handle.clone()
    }

    /// 在后台运行，立即返回句柄
    pub fn spawn(self) -> (PipelineHandle, JoinHandle<Outcome<C>>) {
        let handle = self.handle();
        (handle, tokio::spawn(self.run()))
    }

    fn launch(
        &self,
        joins: &mut JoinSet<(StageId, Outcome<()>)>,
        stage_id: &str,
        run_token: &CancellationToken,
    ) {
        let (Some(stage), Some(meter)) = (self.stages.get(stage_id), self.meters.get(stage_id)) else {
            return;
        };
        if self.handle.stage_state(stage_id) != Some(StageState::Waiting) {
            return;
        }

        let id = stage.id.clone();
        let runner = Arc::clone(&stage.stage);
        let cx = StageContext::new(Arc::clone(&self.shared), run_token.clone());
        let reporter = meter.reporter.clone();
        let pool = self.pool.clone();
        let handle = self.handle.clone();

        joins.spawn(async move {
            let outcome = match pool.acquire(cx.cancel_token()).await {
                Err(e) => Outcome::from(Err::<(), _>(e)),
                Ok(_permit) if cx.is_cancelled() => Outcome::Cancelled,
                Ok(_permit) => {
                    handle.set_state(&id, StageState::Running);
                    tracing::debug!(stage = %id, "Stage started");
                    match AssertUnwindSafe(runner.run(cx, reporter)).catch_unwind().await {
                        Ok(outcome) => outcome,
                        Err(_) => Outcome::Failure(ErrorKind::Internal(format!("stage '{id}' panicked"))),
                    }
                }
            };
            (id, outcome)
        });
    }

    /// 执行流水线直到终态
    pub async fn run(self) -> Outcome<C> {
        self.handle.set_status(PipelineStatus::Running);
        tracing::info!(pipeline = %self.id, name = %self.name, "Pipeline started");

        let graph = self.graph.clone();
        let run_token = self.cancel.child_token();
        let mut tracker = ReadyTracker::new(&graph);
        let mut joins = JoinSet::new();
        let mut terminal: Option<Outcome<()>> = None;
        let mut external_seen = false;

        for stage_id in graph.roots() {
            self.launch(&mut joins, &stage_id, &run_token);
        }

        while !joins.is_empty() {
            tokio::select! {
                _ = self.cancel.cancelled(), if !external_seen => {
                    external_seen = true;
                    terminal.get_or_insert(Outcome::Cancelled);
                    run_token.cancel();
                    let skipped = self.handle.skip_waiting();
                    tracing::info!(pipeline = %self.id, skipped, "Pipeline cancelled");
                }
                joined = joins.join_next() => {
                    let Some(joined) = joined else { break };
                    let (stage_id, outcome) = match joined {
                        Ok(v) => v,
                        Err(e) => {
                            tracing::warn!(pipeline = %self.id, "Stage task aborted: {}", e);
                            terminal.get_or_insert(Outcome::Failure(ErrorKind::Internal(e.to_string())));
                            run_token.cancel();
                            self.handle.skip_waiting();
                            continue;
                        }
                    };

                    // 取消后返回的成功结果一律丢弃
                    let outcome = match outcome {
                        Outcome::Success(()) if run_token.is_cancelled() => Outcome::Cancelled,
                        other => other,
                    };

                    match outcome {
                        Outcome::Success(()) => {
                            self.handle.set_state(&stage_id, StageState::Completed);
                            if let Some(meter) = self.meters.get(&stage_id) {
                                meter.reporter.complete();
                                meter.slot.advance(1);
                            }
                            tracing::debug!(stage = %stage_id, "Stage completed");
                            for next in tracker.mark_succeeded(&stage_id) {
                                if terminal.is_none() {
                                    self.launch(&mut joins, &next, &run_token);
                                }
                            }
                        }
                        Outcome::Failure(e) => {
                            self.handle.set_state(&stage_id, StageState::Failed);
                            tracing::warn!(pipeline = %self.id, stage = %stage_id, "Stage failed: {}", e);
                            if terminal.is_none() {
                                terminal = Some(Outcome::Failure(e));
                            }
                            run_token.cancel();
                            self.handle.skip_waiting();
                        }
                        Outcome::Cancelled => {
                            self.handle.set_state(&stage_id, StageState::Cancelled);
                            terminal.get_or_insert(Outcome::Cancelled);
                            run_token.cancel();
                            self.handle.skip_waiting();
                        }
                    }
                }
            }
        }

        let terminal = match terminal {
            Some(t) => t,
            None => {
                let all_completed = self
                    .handle
                    .stage_states()
                    .values()
                    .all(|s| *s == StageState::Completed);
                if all_completed {
                    Outcome::Success(())
                } else {
                    Outcome::Failure(ErrorKind::Internal("pipeline stalled".to_string()))
                }
            }
        };

        let Pipeline { id, shared, cleanups, on_complete, handle, .. } = self;
        {
            let mut ctx = shared.lock().await;
            for cleanup in cleanups {
                cleanup(&mut ctx);
            }
        }

        // 阶段任务已全部结束，此处不应再有其他持有者
        let outcome = match terminal {
            Outcome::Success(()) => match Arc::try_unwrap(shared) {
                Ok(mutex) => Outcome::Success(mutex.into_inner()),
                Err(_) => Outcome::Failure(ErrorKind::Internal("shared context still borrowed".to_string())),
            },
            Outcome::Failure(e) => Outcome::Failure(e),
            Outcome::Cancelled => Outcome::Cancelled,
        };

        let status = match &outcome {
            Outcome::Success(_) => PipelineStatus::Completed,
            Outcome::Failure(_) => PipelineStatus::Failed,
            Outcome::Cancelled => PipelineStatus::Cancelled,
        };
        handle.set_status(status);
        tracing::info!(pipeline = %id, status = ?status, "Pipeline finished");

        if let Some(callback) = on_complete {
            callback(&outcome);
        }
        outcome
    }
}
