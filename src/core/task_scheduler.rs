//! 工作池：限制同时执行的流水线阶段数
//!
//! 所有流水线共享同一 Semaphore；不同流水线之间无顺序保证，仅受并发上限约束。

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::core::ErrorKind;

/// 有界工作池
#[derive(Clone, Debug)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(max_concurrent_stages: usize) -> Self {
        let size = max_concurrent_stages.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// 获取执行许可；等待期间被取消则返回 Cancelled
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<OwnedSemaphorePermit, ErrorKind> {
        tokio::select! {
            permit = self.permits.clone().acquire_owned() => {
                permit.map_err(|_| ErrorKind::Internal("worker pool closed".to_string()))
            }
            _ = cancel.cancelled() => Err(ErrorKind::Cancelled),
        }
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(3)
    }
}
