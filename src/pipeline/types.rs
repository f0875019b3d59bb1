//! 流水线类型定义
//!
//! 定义阶段、结果、阶段状态与阶段上下文

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use crate::core::ErrorKind;
use crate::progress::Progress;

pub type PipelineId = String;
pub type StageId = String;

/// 阶段或流水线的终态
#[derive(Debug)]
pub enum Outcome<T> {
    Success(T),
    Failure(ErrorKind),
    Cancelled,
}

impl<T> Outcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Cancelled)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Success(v) => Outcome::Success(f(v)),
            Outcome::Failure(e) => Outcome::Failure(e),
            Outcome::Cancelled => Outcome::Cancelled,
        }
    }

    /// Cancelled 折叠为 ErrorKind::Cancelled
    pub fn into_result(self) -> Result<T, ErrorKind> {
        match self {
            Outcome::Success(v) => Ok(v),
            Outcome::Failure(e) => Err(e),
            Outcome::Cancelled => Err(ErrorKind::Cancelled),
        }
    }
}

impl<T> From<Result<T, ErrorKind>> for Outcome<T> {
    fn from(result: Result<T, ErrorKind>) -> Self {
        match result {
            Ok(v) => Outcome::Success(v),
            Err(ErrorKind::Cancelled) => Outcome::Cancelled,
            Err(e) => Outcome::Failure(e),
        }
    }
}

/// 阶段状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageState {
    /// 等待前置阶段
    Waiting,
    /// 正在执行
    Running,
    /// 成功完成
    Completed,
    /// 执行失败
    Failed,
    /// 已取消
    Cancelled,
    /// 前置失败或取消，未执行
    Skipped,
}

impl StageState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StageState::Waiting | StageState::Running)
    }
}

/// 流水线状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineStatus {
    Created,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// 传给每个阶段的上下文：共享产物 + 取消令牌
pub struct StageContext<C> {
    shared: Arc<Mutex<C>>,
    cancel: CancellationToken,
}

impl<C> Clone for StageContext<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            cancel: self.cancel.clone(),
        }
    }
}

impl<C> StageContext<C> {
    pub(crate) fn new(shared: Arc<Mutex<C>>, cancel: CancellationToken) -> Self {
        Self { shared, cancel }
    }

    pub async fn lock(&self) -> MutexGuard<'_, C> {
        self.shared.lock().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// 让步点：已取消则返回 Err(Cancelled)
    pub fn checkpoint(&self) -> Result<(), ErrorKind> {
        if self.cancel.is_cancelled() {
            Err(ErrorKind::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// 流水线阶段
#[async_trait]
pub trait Stage<C>: Send + Sync {
    async fn run(&self, cx: StageContext<C>, progress: Progress) -> Outcome<()>;
}

type StageFn<C> = dyn Fn(StageContext<C>, Progress) -> BoxFuture<'static, Outcome<()>> + Send + Sync;

/// 以闭包实现的阶段
pub struct FnStage<C> {
    f: Box<StageFn<C>>,
}

impl<C> FnStage<C> {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(StageContext<C>, Progress) -> BoxFuture<'static, Outcome<()>> + Send + Sync + 'static,
    {
        Self { f: Box::new(f) }
    }
}

#[async_trait]
impl<C: Send + 'static> Stage<C> for FnStage<C> {
    async fn run(&self, cx: StageContext<C>, progress: Progress) -> Outcome<()> {
        (self.f)(cx, progress).await
    }
}

/// 流水线中的阶段节点
pub struct PipelineStage<C> {
    pub id: StageId,
    pub weight: u64,
    pub dependencies: Vec<StageId>,
    pub stage: Arc<dyn Stage<C>>,
}
