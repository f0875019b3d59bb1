//! 应用记录存储
//!
//! 简单对象存储：读、写、删、列举，外加变更通知。内存实现可选地把每次变更写入单个 JSON 文件。

pub mod model;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};

use crate::core::ErrorKind;

pub use model::{ApplicationRecord, DEFAULT_SIGNING_VALIDITY_DAYS};

/// 一次记录变更（previous/current 为 None 分别表示新建/删除）
#[derive(Debug, Clone)]
pub struct StoreChange {
    pub bundle_identifier: String,
    pub previous: Option<ApplicationRecord>,
    pub current: Option<ApplicationRecord>,
}

#[async_trait]
pub trait ApplicationStore: Send + Sync {
    async fn load(&self, bundle_identifier: &str) -> Result<Option<ApplicationRecord>, ErrorKind>;

    async fn save(&self, record: ApplicationRecord) -> Result<(), ErrorKind>;

    async fn delete(&self, bundle_identifier: &str) -> Result<Option<ApplicationRecord>, ErrorKind>;

    async fn all(&self) -> Result<Vec<ApplicationRecord>, ErrorKind>;

    fn subscribe(&self) -> broadcast::Receiver<StoreChange>;
}

/// 内存记录存储（可选 JSON 文件持久化）
#[derive(Debug)]
pub struct RecordStore {
    records: RwLock<BTreeMap<String, ApplicationRecord>>,
    changes: broadcast::Sender<StoreChange>,
    path: Option<PathBuf>,
}

impl RecordStore {
    /// 创建内存版存储
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            records: RwLock::new(BTreeMap::new()),
            changes,
            path: None,
        }
    }

    /// 创建持久化版存储；文件存在时先加载
    pub async fn with_persistence(path: impl AsRef<Path>) -> Result<Self, ErrorKind> {
        let path = path.as_ref().to_path_buf();
        let mut records = BTreeMap::new();
        match tokio::fs::read_to_string(&path).await {
            Ok(data) => {
                let loaded: Vec<ApplicationRecord> =
                    serde_json::from_str(&data).map_err(|e| ErrorKind::Store(format!("{}: {}", path.display(), e)))?;
                for record in loaded {
                    records.insert(record.bundle_identifier.clone(), record);
                }
                tracing::info!(path = %path.display(), count = records.len(), "Loaded application records");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let (changes, _) = broadcast::channel(256);
        Ok(Self {
            records: RwLock::new(records),
            changes,
            path: Some(path),
        })
    }

    async fn flush(&self, records: &BTreeMap<String, ApplicationRecord>) -> Result<(), ErrorKind> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let list: Vec<&ApplicationRecord> = records.values().collect();
        let data = serde_json::to_string_pretty(&list).map_err(|e| ErrorKind::Store(e.to_string()))?;
        tokio::fs::write(path, data).await?;
        Ok(())
    }

    fn notify(&self, change: StoreChange) {
        // 无订阅者时发送失败，可忽略
        let _ = self.changes.send(change);
    }
}

impl Default for RecordStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ApplicationStore for RecordStore {
    async fn load(&self, bundle_identifier: &str) -> Result<Option<ApplicationRecord>, ErrorKind> {
        Ok(self.records.read().await.get(bundle_identifier).cloned())
    }

    async fn save(&self, record: ApplicationRecord) -> Result<(), ErrorKind> {
        let mut records = self.records.write().await;
        let previous = records.insert(record.bundle_identifier.clone(), record.clone());
        if let Err(e) = self.flush(&records).await {
            // 写盘失败时回滚内存状态
            match &previous {
                Some(prev) => records.insert(prev.bundle_identifier.clone(), prev.clone()),
                None => records.remove(&record.bundle_identifier),
            };
            return Err(e);
        }
        drop(records);

        self.notify(StoreChange {
            bundle_identifier: record.bundle_identifier.clone(),
            previous,
            current: Some(record),
        });
        Ok(())
    }

    async fn delete(&self, bundle_identifier: &str) -> Result<Option<ApplicationRecord>, ErrorKind> {
        let mut records = self.records.write().await;
        let Some(previous) = records.remove(bundle_identifier) else {
            return Ok(None);
        };
        if let Err(e) = self.flush(&records).await {
            records.insert(previous.bundle_identifier.clone(), previous);
            return Err(e);
        }
        drop(records);

        self.notify(StoreChange {
            bundle_identifier: bundle_identifier.to_string(),
            previous: Some(previous.clone()),
            current: None,
        });
        Ok(Some(previous))
    }

    async fn all(&self) -> Result<Vec<ApplicationRecord>, ErrorKind> {
        Ok(self.records.read().await.values().cloned().collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}
