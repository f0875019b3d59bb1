//! 编排器：对外暴露侧载、刷新、激活、停用、备份、恢复、移除与调试等动词
//!
//! 所有动词在做任何槽位或流水线工作之前，先检查设备可达性（不可达立即返回 DeviceUnreachable）。
//! 失败结果经 NoticePolicy 映射为通知并广播；取消不产生通知。

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use futures_util::future::join_all;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::config::{load_config, AppConfig};
use crate::core::notice::{Notice, NoticePolicy};
use crate::core::registry::{InFlightRegistry, OperationKind};
use crate::core::state::{sort_views, ActivationEvent, AppView, Verb};
use crate::core::{ErrorKind, WorkerPool};
use crate::device::DeviceTransport;
use crate::install::{ExtensionPrompt, SideloadPipelineFactory, SideloadSource};
use crate::progress::Progress;
use crate::slots::{ActivationSlotManager, EvictionPolicy, SlotLedger, SlotUsage};
use crate::store::{ApplicationRecord, ApplicationStore, RecordStore};

/// 每个应用的刷新结果
pub type RefreshResults = BTreeMap<String, Result<ApplicationRecord, ErrorKind>>;

pub struct Orchestrator {
    config: AppConfig,
    store: Arc<dyn ApplicationStore>,
    device: Arc<dyn DeviceTransport>,
    registry: Arc<InFlightRegistry>,
    slots: Arc<ActivationSlotManager>,
    sideload: SideloadPipelineFactory,
    notices: broadcast::Sender<Notice>,
}

impl Orchestrator {
    pub fn new(
        config: AppConfig,
        store: Arc<dyn ApplicationStore>,
        device: Arc<dyn DeviceTransport>,
        prompt: Arc<dyn ExtensionPrompt>,
        registry: Arc<InFlightRegistry>,
    ) -> Self {
        let ledger = SlotLedger::new(config.slots.capacity(), config.slots.limit_includes_extensions);
        let slots = Arc::new(ActivationSlotManager::new(
            Arc::clone(&store),
            Arc::clone(&device),
            ledger,
            config.app.host_bundle_identifier.clone(),
            Arc::clone(&registry),
        ));
        let sideload = SideloadPipelineFactory {
            slots: Arc::clone(&slots),
            device: Arc::clone(&device),
            store: Arc::clone(&store),
            registry: Arc::clone(&registry),
            prompt,
            client: reqwest::Client::new(),
            pool: WorkerPool::new(config.pipeline.max_concurrent_stages),
            apps_dir: config.app.apps_dir(),
            temp_root: config.pipeline.temp_dir.clone(),
            prompt_timeout: config.pipeline.prompt_timeout(),
            download_timeout: config.pipeline.download_timeout(),
        };
        let (notices, _) = broadcast::channel(64);

        Self {
            config,
            store,
            device,
            registry,
            slots,
            sideload,
            notices,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ApplicationStore> {
        &self.store
    }

    pub fn slots(&self) -> &Arc<ActivationSlotManager> {
        &self.slots
    }

    pub fn registry(&self) -> &Arc<InFlightRegistry> {
        &self.registry
    }

    /// 失败通知流
    pub fn subscribe_notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    pub fn subscribe_activation(&self) -> broadcast::Receiver<ActivationEvent> {
        self.slots.subscribe()
    }

    fn host(&self) -> &str {
        &self.config.app.host_bundle_identifier
    }

    fn report<T>(&self, verb: Verb, subject: &str, result: &Result<T, ErrorKind>) {
        match result {
            Ok(_) => tracing::info!(verb = %verb, subject = %subject, "Verb finished"),
            Err(e) if e.is_silent() => tracing::info!(verb = %verb, subject = %subject, "Verb cancelled"),
            Err(e) => tracing::warn!(verb = %verb, subject = %subject, "Verb failed: {}", e),
        }
        if let Some(notice) = NoticePolicy::for_verb(verb, subject, result) {
            let _ = self.notices.send(notice);
        }
    }

    async fn ensure_reachable(&self) -> Result<(), ErrorKind> {
        if self.device.is_reachable().await {
            Ok(())
        } else {
            Err(ErrorKind::DeviceUnreachable)
        }
    }

    async fn require_record(&self, bundle_identifier: &str) -> Result<ApplicationRecord, ErrorKind> {
        self.store
            .load(bundle_identifier)
            .await?
            .ok_or_else(|| ErrorKind::InvalidInput(format!("unknown app '{bundle_identifier}'")))
    }

    // ---------- sideload ----------

    /// 侧载：本地路径、file:// 或 http(s):// 来源
    pub async fn sideload(&self, source: &str) -> Result<ApplicationRecord, ErrorKind> {
        let result = self.sideload_inner(source).await;
        self.report(Verb::Sideload, source, &result);
        result
    }

    async fn sideload_inner(&self, source: &str) -> Result<ApplicationRecord, ErrorKind> {
        let source = SideloadSource::parse(source)?;
        self.ensure_reachable().await?;

        let guard = self
            .registry
            .begin(&source.key(), OperationKind::Install, Verb::Sideload, 1)?;
        tracing::info!(source = %source.key(), "Sideload started");

        let pipeline = self.sideload.build(source, guard.token().clone())?;
        guard.progress().add_child(pipeline.handle().progress(), 1);

        let context = pipeline.run().await.into_result()?;
        context.require_installed().cloned()
    }

    // ---------- refresh ----------

    /// 刷新给定应用：各自独立通道并发执行，宿主应用最后刷新
    pub async fn refresh(&self, bundle_identifiers: &[String]) -> Result<RefreshResults, ErrorKind> {
        if let Err(e) = self.ensure_reachable().await {
            self.report(Verb::Refresh, "apps", &Err::<(), _>(ErrorKind::DeviceUnreachable));
            return Err(e);
        }
        tracing::info!(count = bundle_identifiers.len(), "Refresh started");

        let (host, others): (Vec<&String>, Vec<&String>) =
            bundle_identifiers.iter().partition(|id| id.as_str() == self.host());

        let mut results = RefreshResults::new();
        let refreshed = join_all(others.iter().map(|id| self.refresh_one(id))).await;
        for (id, result) in others.into_iter().zip(refreshed) {
            results.insert(id.clone(), result);
        }
        if let Some(id) = host.first() {
            let result = self.refresh_one(id).await;
            results.insert((*id).clone(), result);
        }

        let names: BTreeMap<&str, String> = {
            let mut names = BTreeMap::new();
            for id in results.keys() {
                let name = match self.store.load(id).await {
                    Ok(Some(record)) => record.name,
                    _ => id.clone(),
                };
                names.insert(id.as_str(), name);
            }
            names
        };
        let notice = NoticePolicy::for_batch(
            Verb::Refresh,
            results
                .iter()
                .map(|(id, result)| (names.get(id.as_str()).map(String::as_str).unwrap_or(id.as_str()), result)),
        );
        if let Some(notice) = notice {
            tracing::warn!(title = %notice.title, "Refresh finished with failures");
            let _ = self.notices.send(notice);
        }
        Ok(results)
    }

    async fn refresh_one(&self, bundle_identifier: &str) -> Result<ApplicationRecord, ErrorKind> {
        let guard = self
            .registry
            .begin(bundle_identifier, OperationKind::Device, Verb::Refresh, 1)?;
        let mut record = self.require_record(bundle_identifier).await?;
        if !record.is_active {
            return Err(ErrorKind::InvalidInput(format!("{} is not active", record.name)));
        }

        let handle = self.device.refresh(&record).await?;
        guard.checkpoint()?;

        record.resigned_bundle_identifier = handle.resigned_bundle_identifier;
        record.refreshed_at = handle.refreshed_at;
        record.expires_at = handle.expires_at;
        if handle.certificate_serial.is_some() {
            record.certificate_serial = handle.certificate_serial;
        }
        self.store.save(record.clone()).await?;
        guard.progress().complete();
        tracing::debug!(bundle = %bundle_identifier, expires_at = %record.expires_at, "App refreshed");
        Ok(record)
    }

    /// 待刷新集合：活跃应用按到期时间升序，宿主应用追加在最后
    async fn refresh_candidates(&self) -> Result<Vec<ApplicationRecord>, ErrorKind> {
        let mut apps: Vec<ApplicationRecord> = self
            .store
            .all()
            .await?
            .into_iter()
            .filter(|r| r.is_active || r.bundle_identifier == self.host())
            .collect();
        apps.sort_by(|a, b| a.expires_at.cmp(&b.expires_at));
        let (host, mut others): (Vec<_>, Vec<_>) =
            apps.into_iter().partition(|r| r.bundle_identifier == self.host());
        others.extend(host);
        Ok(others)
    }

    pub async fn refresh_all(&self) -> Result<RefreshResults, ErrorKind> {
        let ids: Vec<String> = self
            .refresh_candidates()
            .await?
            .into_iter()
            .map(|r| r.bundle_identifier)
            .collect();
        self.refresh(&ids).await
    }

    /// 后台刷新：距上次刷新超过配置间隔的应用
    pub async fn apps_for_background_refresh(&self) -> Result<Vec<ApplicationRecord>, ErrorKind> {
        let interval = chrono::Duration::hours(self.config.device.background_refresh_interval_hours as i64);
        let now = Utc::now();
        Ok(self
            .refresh_candidates()
            .await?
            .into_iter()
            .filter(|r| now - r.refreshed_at >= interval)
            .collect())
    }

    // ---------- activation ----------

    pub async fn activate(&self, bundle_identifier: &str, policy: EvictionPolicy) -> Result<ApplicationRecord, ErrorKind> {
        let result = match self.ensure_reachable().await {
            Ok(()) => self.slots.activate(bundle_identifier, policy).await,
            Err(e) => Err(e),
        };
        self.report(Verb::Activate, bundle_identifier, &result);
        result
    }

    pub async fn deactivate(&self, bundle_identifier: &str) -> Result<ApplicationRecord, ErrorKind> {
        let result = match self.ensure_reachable().await {
            Ok(()) => self.slots.deactivate(bundle_identifier).await,
            Err(e) => Err(e),
        };
        self.report(Verb::Deactivate, bundle_identifier, &result);
        result
    }

    pub async fn usage(&self) -> Result<SlotUsage, ErrorKind> {
        self.slots.usage().await
    }

    // ---------- backup / restore ----------

    pub async fn backup(&self, bundle_identifier: &str) -> Result<ApplicationRecord, ErrorKind> {
        let result = self.device_verb(Verb::Backup, bundle_identifier).await;
        self.report(Verb::Backup, bundle_identifier, &result);
        result
    }

    pub async fn restore(&self, bundle_identifier: &str) -> Result<ApplicationRecord, ErrorKind> {
        let result = self.device_verb(Verb::Restore, bundle_identifier).await;
        self.report(Verb::Restore, bundle_identifier, &result);
        result
    }

    async fn device_verb(&self, verb: Verb, bundle_identifier: &str) -> Result<ApplicationRecord, ErrorKind> {
        self.ensure_reachable().await?;
        let guard = self.registry.begin(bundle_identifier, OperationKind::Device, verb, 1)?;
        let record = self.require_record(bundle_identifier).await?;

        match verb {
            Verb::Backup => self.device.backup(&record).await?,
            Verb::Restore => {
                if !record.is_active {
                    return Err(ErrorKind::InvalidInput(format!("{} must be active to restore", record.name)));
                }
                self.device.restore(&record).await?
            }
            Verb::EnableDebugging => self.device.debug_enable(&record.resigned_bundle_identifier).await?,
            other => return Err(ErrorKind::Internal(format!("'{other}' is not a device verb"))),
        }
        guard.checkpoint()?;
        guard.progress().complete();
        Ok(record)
    }

    // ---------- remove ----------

    /// 移除应用：活跃时先停用，再删除本地产物目录与记录
    pub async fn remove(&self, bundle_identifier: &str) -> Result<ApplicationRecord, ErrorKind> {
        let result = self.remove_inner(bundle_identifier).await;
        self.report(Verb::Remove, bundle_identifier, &result);
        result
    }

    async fn remove_inner(&self, bundle_identifier: &str) -> Result<ApplicationRecord, ErrorKind> {
        if bundle_identifier == self.host() {
            return Err(ErrorKind::InvalidInput("the host app cannot be removed".to_string()));
        }
        self.ensure_reachable().await?;
        let guard = self
            .registry
            .begin(bundle_identifier, OperationKind::Device, Verb::Remove, 1)?;
        let record = self.require_record(bundle_identifier).await?;
        if record.is_active {
            self.slots.deactivate_in_lane(&guard, bundle_identifier).await?;
        }
        guard.checkpoint()?;

        let artifacts: PathBuf = self.config.app.apps_dir().join(bundle_identifier);
        match tokio::fs::remove_dir_all(&artifacts).await {
            Ok(()) => tracing::debug!(path = %artifacts.display(), "Removed app artifacts"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let removed = self.store.delete(bundle_identifier).await?;
        removed.ok_or_else(|| ErrorKind::InvalidInput(format!("unknown app '{bundle_identifier}'")))
    }

    // ---------- debugging ----------

    /// 启用 JIT 调试；要求应用活跃，且设备系统主版本低于配置上限
    pub async fn enable_debugging(&self, bundle_identifier: &str) -> Result<ApplicationRecord, ErrorKind> {
        let result = self.enable_debugging_inner(bundle_identifier).await;
        self.report(Verb::EnableDebugging, bundle_identifier, &result);
        result
    }

    async fn enable_debugging_inner(&self, bundle_identifier: &str) -> Result<ApplicationRecord, ErrorKind> {
        self.ensure_reachable().await?;
        let record = self.require_record(bundle_identifier).await?;
        if !record.is_active {
            return Err(ErrorKind::InvalidInput(format!("{} must be active to enable debugging", record.name)));
        }
        let info = self.device.device_info().await?;
        if info.os_version.major >= self.config.device.debugging_unsupported_from_major {
            return Err(ErrorKind::Unsupported(format!(
                "enabling debugging is not supported on iOS {}",
                info.os_version
            )));
        }
        self.device_verb(Verb::EnableDebugging, bundle_identifier).await
    }

    // ---------- projections ----------

    /// 展示层投影：活跃在前，其次按刷新时间倒序
    pub async fn views(&self) -> Result<Vec<AppView>, ErrorKind> {
        let records = self.store.all().await?;
        let mut views = Vec::with_capacity(records.len());
        for record in &records {
            let phase = self.slots.phase(&record.bundle_identifier).await?;
            let progress = self
                .registry
                .progress(&record.bundle_identifier, OperationKind::Device)
                .map(|p| p.fraction_completed());
            views.push(AppView::project(record, phase, progress));
        }
        sort_views(&mut views);
        Ok(views)
    }

    pub fn progress_for(&self, key: &str, kind: OperationKind) -> Option<Progress> {
        self.registry.progress(key, kind)
    }

    pub fn cancel(&self, key: &str, kind: OperationKind) -> bool {
        self.registry.cancel(key, kind)
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("host", &self.config.app.host_bundle_identifier)
            .field("slots", &self.slots)
            .finish()
    }
}

/// 由配置文件创建编排器：记录持久化到 data_dir/apps.json，操作以 root 为根令牌
pub async fn create_orchestrator(
    config_path: Option<PathBuf>,
    device: Arc<dyn DeviceTransport>,
    prompt: Arc<dyn ExtensionPrompt>,
    root: CancellationToken,
) -> anyhow::Result<Orchestrator> {
    let cfg = load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });

    let store = RecordStore::with_persistence(cfg.app.records_path()).await?;
    let registry = Arc::new(InFlightRegistry::with_root(root));
    tracing::info!(
        data_dir = %cfg.app.data_dir.display(),
        capacity = ?cfg.slots.capacity(),
        "Orchestrator ready"
    );
    Ok(Orchestrator::new(cfg, Arc::new(store), device, prompt, registry))
}
