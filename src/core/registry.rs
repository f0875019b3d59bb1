//! 进行中操作登记表
//!
//! 每个 (应用, 操作类别) 至多一个未完成操作。重复进入会取消已有操作，重入调用本身返回 Cancelled。
//! 所有操作令牌都是根令牌的子令牌；关闭时取消根令牌即可取消全部操作。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;

use crate::core::state::Verb;
use crate::core::ErrorKind;
use crate::progress::Progress;

/// 操作类别：安装走独立通道；刷新/激活/停用/备份/恢复共享设备通道
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Install,
    Device,
}

type Key = (String, OperationKind);

#[derive(Debug)]
struct Entry {
    id: u64,
    verb: Verb,
    progress: Progress,
}

/// 进行中操作的快照
#[derive(Debug, Clone)]
pub struct InFlightOperation {
    pub key: String,
    pub kind: OperationKind,
    pub verb: Verb,
    pub fraction_completed: f64,
}

#[derive(Debug)]
pub struct InFlightRegistry {
    root: CancellationToken,
    entries: Arc<Mutex<HashMap<Key, Entry>>>,
    next_id: AtomicU64,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::with_root(CancellationToken::new())
    }

    /// 以外部令牌（通常来自 ShutdownManager）为根
    pub fn with_root(root: CancellationToken) -> Self {
        Self {
            root,
            entries: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Key, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn admit(&self, entries: &mut HashMap<Key, Entry>, key: Key, verb: Verb, total_units: u64) -> OperationGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = self.root.child_token();
        let progress = Progress::new(total_units).with_cancellation(token.clone());
        entries.insert(
            key.clone(),
            Entry {
                id,
                verb,
                progress: progress.clone(),
            },
        );
        OperationGuard {
            key,
            id,
            token,
            progress,
            entries: Arc::clone(&self.entries),
        }
    }

    /// 开始一个操作；已有未完成操作时取消它，并返回 Err(Cancelled)
    pub fn begin(
        &self,
        key: &str,
        kind: OperationKind,
        verb: Verb,
        total_units: u64,
    ) -> Result<OperationGuard, ErrorKind> {
        let key = (key.to_string(), kind);
        let mut entries = self.lock();
        if let Some(existing) = entries.get(&key) {
            tracing::info!(
                key = %key.0,
                outstanding = %existing.verb,
                requested = %verb,
                "Re-entered in-flight operation, cancelling outstanding one"
            );
            existing.progress.cancel();
            return Err(ErrorKind::Cancelled);
        }
        Ok(self.admit(&mut entries, key, verb, total_units))
    }

    /// 通道空闲时开始操作，否则返回 None（不取消已有操作）
    pub fn try_begin(&self, key: &str, kind: OperationKind, verb: Verb, total_units: u64) -> Option<OperationGuard> {
        let key = (key.to_string(), kind);
        let mut entries = self.lock();
        if entries.contains_key(&key) {
            return None;
        }
        Some(self.admit(&mut entries, key, verb, total_units))
    }

    pub fn progress(&self, key: &str, kind: OperationKind) -> Option<Progress> {
        self.lock().get(&(key.to_string(), kind)).map(|e| e.progress.clone())
    }

    pub fn is_in_flight(&self, key: &str, kind: OperationKind) -> bool {
        self.lock().contains_key(&(key.to_string(), kind))
    }

    /// 取消指定操作；返回是否存在该操作
    pub fn cancel(&self, key: &str, kind: OperationKind) -> bool {
        match self.lock().get(&(key.to_string(), kind)) {
            Some(entry) => {
                entry.progress.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        self.root.cancel();
        for entry in self.lock().values() {
            entry.progress.cancel();
        }
    }

    pub fn in_flight(&self) -> Vec<InFlightOperation> {
        self.lock()
            .iter()
            .map(|((key, kind), entry)| InFlightOperation {
                key: key.clone(),
                kind: *kind,
                verb: entry.verb,
                fraction_completed: entry.progress.fraction_completed(),
            })
            .collect()
    }
}

impl Default for InFlightRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// 操作占位；drop 时注销（仅当登记项仍属于本操作）
#[derive(Debug)]
pub struct OperationGuard {
    key: Key,
    id: u64,
    token: CancellationToken,
    progress: Progress,
    entries: Arc<Mutex<HashMap<Key, Entry>>>,
}

impl OperationGuard {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn checkpoint(&self) -> Result<(), ErrorKind> {
        if self.is_cancelled() {
            Err(ErrorKind::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn key(&self) -> &str {
        &self.key.0
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.get(&self.key).map(|e| e.id) == Some(self.id) {
            entries.remove(&self.key);
        }
    }
}
