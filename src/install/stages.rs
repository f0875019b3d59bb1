//! 侧载流水线阶段
//!
//! download? → unpack → sanitize → install。各阶段通过 SideloadContext 传递产物，
//! 进入时检查所需字段是否已由前置阶段填入。

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::core::registry::{InFlightRegistry, OperationGuard, OperationKind};
use crate::core::state::Verb;
use crate::core::{ErrorKind, WorkerPool};
use crate::device::{DeviceTransport, TransportError};
use crate::install::prompt::{ask, ExtensionDecision, ExtensionPrompt};
use crate::install::{unzip_app_bundle, AppBundle, SideloadSource};
use crate::pipeline::{Outcome, Pipeline, PipelineBuilder, Stage, StageContext};
use crate::progress::Progress;
use crate::slots::ActivationSlotManager;
use crate::store::{ApplicationRecord, ApplicationStore};

pub const DOWNLOAD_WEIGHT: u64 = 20;
pub const UNPACK_WEIGHT: u64 = 10;
pub const SANITIZE_WEIGHT: u64 = 5;
pub const INSTALL_WEIGHT: u64 = 65;

/// 侧载流水线的共享上下文
#[derive(Debug)]
pub struct SideloadContext {
    pub source: SideloadSource,
    pub temp_dir: Option<TempDir>,
    pub archive_path: Option<PathBuf>,
    pub bundle: Option<AppBundle>,
    pub installed: Option<ApplicationRecord>,
}

impl SideloadContext {
    pub fn new(source: SideloadSource, temp_dir: TempDir) -> Self {
        let archive_path = match &source {
            SideloadSource::Local(path) => Some(path.clone()),
            SideloadSource::Remote(_) => None,
        };
        Self {
            source,
            temp_dir: Some(temp_dir),
            archive_path,
            bundle: None,
            installed: None,
        }
    }

    pub fn require_temp_dir(&self) -> Result<&Path, ErrorKind> {
        self.temp_dir
            .as_ref()
            .map(|d| d.path())
            .ok_or_else(|| ErrorKind::Internal("temporary directory already removed".to_string()))
    }

    pub fn require_archive(&self) -> Result<&Path, ErrorKind> {
        self.archive_path
            .as_deref()
            .ok_or_else(|| ErrorKind::Internal("archive not downloaded".to_string()))
    }

    pub fn require_bundle(&self) -> Result<&AppBundle, ErrorKind> {
        self.bundle
            .as_ref()
            .ok_or_else(|| ErrorKind::Internal("bundle not unpacked".to_string()))
    }

    pub fn require_installed(&self) -> Result<&ApplicationRecord, ErrorKind> {
        self.installed
            .as_ref()
            .ok_or_else(|| ErrorKind::Internal("app not installed".to_string()))
    }

    /// 删除临时目录
    pub fn close_temp_dir(&mut self) {
        if let Some(dir) = self.temp_dir.take() {
            let path = dir.path().to_path_buf();
            match dir.close() {
                Ok(()) => tracing::debug!(path = %path.display(), "Removed temporary directory"),
                Err(e) => tracing::warn!(path = %path.display(), "Failed to remove temporary directory: {}", e),
            }
        }
    }
}

fn network_error(e: reqwest::Error) -> ErrorKind {
    if e.is_timeout() {
        TransportError::Timeout.into()
    } else {
        TransportError::Network(e.to_string()).into()
    }
}

/// 下载远程 .ipa
pub struct DownloadStage {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl DownloadStage {
    pub fn new(client: reqwest::Client, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            url: url.into(),
            timeout,
        }
    }

    async fn download(&self, cx: &StageContext<SideloadContext>, progress: &Progress) -> Result<(), ErrorKind> {
        let dest = cx.lock().await.require_temp_dir()?.join("download.ipa");
        let cancel = cx.cancel_token();

        let request = self.client.get(&self.url).timeout(self.timeout).send();
        let mut response = tokio::select! {
            _ = cancel.cancelled() => return Err(ErrorKind::Cancelled),
            response = request => response.map_err(network_error)?,
        };
        response = response.error_for_status().map_err(network_error)?;

        let total = response.content_length();
        let mut file = tokio::fs::File::create(&dest).await?;
        let mut received: u64 = 0;
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(ErrorKind::Cancelled),
                chunk = response.chunk() => chunk.map_err(network_error)?,
            };
            let Some(chunk) = chunk else { break };
            file.write_all(&chunk).await?;
            received += chunk.len() as u64;
            if let Some(total) = total.filter(|t| *t > 0) {
                progress.set_completed(received.saturating_mul(progress.total_units()) / total);
            }
            cx.checkpoint()?;
        }
        file.flush().await?;

        tracing::debug!(url = %self.url, bytes = received, "Download finished");
        cx.lock().await.archive_path = Some(dest);
        Ok(())
    }
}

#[async_trait]
impl Stage<SideloadContext> for DownloadStage {
    async fn run(&self, cx: StageContext<SideloadContext>, progress: Progress) -> Outcome<()> {
        self.download(&cx, &progress).await.into()
    }
}

/// 解包并解析应用包
pub struct UnpackStage;

impl UnpackStage {
    async fn unpack(&self, cx: &StageContext<SideloadContext>) -> Result<(), ErrorKind> {
        let (archive, dest) = {
            let context = cx.lock().await;
            (
                context.require_archive()?.to_path_buf(),
                context.require_temp_dir()?.join("unpacked"),
            )
        };
        if !archive.is_file() {
            return Err(ErrorKind::InvalidInput(format!("{} does not exist", archive.display())));
        }
        cx.checkpoint()?;

        let bundle = tokio::task::spawn_blocking(move || {
            let root = unzip_app_bundle(&archive, &dest)?;
            AppBundle::load(&root)
        })
        .await
        .map_err(|e| ErrorKind::Internal(e.to_string()))??;

        cx.checkpoint()?;
        tracing::debug!(bundle = %bundle.bundle_identifier, extensions = bundle.extension_count(), "Unpacked app bundle");
        cx.lock().await.bundle = Some(bundle);
        Ok(())
    }
}

#[async_trait]
impl Stage<SideloadContext> for UnpackStage {
    async fn run(&self, cx: StageContext<SideloadContext>, _progress: Progress) -> Outcome<()> {
        self.unpack(&cx).await.into()
    }
}

/// 处理应用扩展：保留、删除或取消安装
pub struct SanitizeStage {
    prompt: Arc<dyn ExtensionPrompt>,
    timeout: Option<Duration>,
}

impl SanitizeStage {
    pub fn new(prompt: Arc<dyn ExtensionPrompt>, timeout: Option<Duration>) -> Self {
        Self { prompt, timeout }
    }

    async fn sanitize(&self, cx: &StageContext<SideloadContext>) -> Result<(), ErrorKind> {
        let mut bundle = cx.lock().await.require_bundle()?.clone();
        if bundle.extensions.is_empty() {
            return Ok(());
        }

        match ask(self.prompt.as_ref(), &bundle, self.timeout, cx.cancel_token()).await {
            ExtensionDecision::Keep => Ok(()),
            ExtensionDecision::Cancel => Err(ErrorKind::Cancelled),
            ExtensionDecision::Remove => {
                cx.checkpoint()?;
                bundle = tokio::task::spawn_blocking(move || bundle.remove_extensions().map(|_| bundle))
                    .await
                    .map_err(|e| ErrorKind::Internal(e.to_string()))??;
                tracing::info!(bundle = %bundle.bundle_identifier, "Removed app extensions before install");
                cx.lock().await.bundle = Some(bundle);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Stage<SideloadContext> for SanitizeStage {
    async fn run(&self, cx: StageContext<SideloadContext>, _progress: Progress) -> Outcome<()> {
        self.sanitize(&cx).await.into()
    }
}

/// 预留槽位、安装到设备并提交记录。
/// 包标识确定后占用该应用的设备通道，同一应用的并发侧载、激活或移除直接拒绝
pub struct InstallStage {
    slots: Arc<ActivationSlotManager>,
    device: Arc<dyn DeviceTransport>,
    store: Arc<dyn ApplicationStore>,
    registry: Arc<InFlightRegistry>,
    apps_dir: PathBuf,
}

impl InstallStage {
    pub fn new(
        slots: Arc<ActivationSlotManager>,
        device: Arc<dyn DeviceTransport>,
        store: Arc<dyn ApplicationStore>,
        registry: Arc<InFlightRegistry>,
        apps_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            slots,
            device,
            store,
            registry,
            apps_dir: apps_dir.into(),
        }
    }

    async fn install(&self, cx: &StageContext<SideloadContext>, progress: &Progress) -> Result<(), ErrorKind> {
        let bundle = cx.lock().await.require_bundle()?.clone();
        cx.checkpoint()?;
        let lane = self
            .registry
            .try_begin(&bundle.bundle_identifier, OperationKind::Device, Verb::Sideload, 1)
            .ok_or_else(|| ErrorKind::InvalidInput(format!("'{}' is busy", bundle.bundle_identifier)))?;

        let mut record = self
            .store
            .load(&bundle.bundle_identifier)
            .await?
            .unwrap_or_else(|| ApplicationRecord::new(&bundle.name, &bundle.bundle_identifier, &bundle.version));
        record.name = bundle.name.clone();
        record.version = bundle.version.clone();
        record.extension_count = bundle.extension_count();

        let cost = self.slots.ledger().cost(&record);
        self.slots.reserve_install(&bundle.bundle_identifier, cost).await?;

        let result = self.install_reserved(cx, &lane, &bundle, record, progress).await;
        if result.is_err() {
            if let Err(e) = self.slots.release(&bundle.bundle_identifier).await {
                tracing::warn!(bundle = %bundle.bundle_identifier, "Failed to release install reservation: {}", e);
            }
        }
        result
    }

    async fn install_reserved(
        &self,
        cx: &StageContext<SideloadContext>,
        lane: &OperationGuard,
        bundle: &AppBundle,
        mut record: ApplicationRecord,
        progress: &Progress,
    ) -> Result<(), ErrorKind> {
        let device_progress = Progress::new(100);
        progress.add_child(&device_progress, 90);

        let handle = self.device.install(bundle, device_progress).await?;
        // 取消后到达的设备结果一律丢弃
        cx.checkpoint()?;
        lane.checkpoint()?;

        let source = bundle.root.clone();
        let target = self.apps_dir.join(&bundle.bundle_identifier);
        tokio::task::spawn_blocking(move || copy_bundle(&source, &target))
            .await
            .map_err(|e| ErrorKind::Internal(e.to_string()))??;
        progress.advance(10);

        record.resigned_bundle_identifier = handle.resigned_bundle_identifier;
        record.refreshed_at = handle.refreshed_at;
        record.expires_at = handle.expires_at;
        record.certificate_serial = handle.certificate_serial;

        let committed = self.slots.commit_install(record).await?;
        tracing::info!(bundle = %committed.bundle_identifier, version = %committed.version, "App installed");
        cx.lock().await.installed = Some(committed);
        Ok(())
    }
}

#[async_trait]
impl Stage<SideloadContext> for InstallStage {
    async fn run(&self, cx: StageContext<SideloadContext>, progress: Progress) -> Outcome<()> {
        self.install(&cx, &progress).await.into()
    }
}

/// 将 .app 目录复制为本地产物（先清空旧产物）
fn copy_bundle(source: &Path, target_dir: &Path) -> Result<(), ErrorKind> {
    if target_dir.exists() {
        std::fs::remove_dir_all(target_dir)?;
    }
    let app_name = source
        .file_name()
        .ok_or_else(|| ErrorKind::InvalidBundle(format!("{} has no file name", source.display())))?;
    let destination = target_dir.join(app_name);

    for entry in WalkDir::new(source) {
        let entry = entry.map_err(|e| ErrorKind::Io(std::io::Error::other(e.to_string())))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| ErrorKind::Internal(e.to_string()))?;
        let output = destination.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&output)?;
        } else {
            if let Some(parent) = output.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &output)?;
        }
    }
    Ok(())
}

/// 侧载流水线的依赖与参数
#[derive(Clone)]
pub struct SideloadPipelineFactory {
    pub slots: Arc<ActivationSlotManager>,
    pub device: Arc<dyn DeviceTransport>,
    pub store: Arc<dyn ApplicationStore>,
    pub registry: Arc<InFlightRegistry>,
    pub prompt: Arc<dyn ExtensionPrompt>,
    pub client: reqwest::Client,
    pub pool: WorkerPool,
    pub apps_dir: PathBuf,
    /// 临时目录的父目录；None 时使用系统默认
    pub temp_root: Option<PathBuf>,
    pub prompt_timeout: Option<Duration>,
    pub download_timeout: Duration,
}

impl SideloadPipelineFactory {
    /// 组装流水线；本地来源不含下载阶段
    pub fn build(&self, source: SideloadSource, cancel: CancellationToken) -> Result<Pipeline<SideloadContext>, ErrorKind> {
        let mut temp = tempfile::Builder::new();
        temp.prefix("sideload-");
        let temp_dir = match &self.temp_root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                temp.tempdir_in(root)?
            }
            None => temp.tempdir()?,
        };

        let mut builder = PipelineBuilder::new(format!("sideload {}", source.key()));
        if let SideloadSource::Remote(url) = &source {
            builder = builder.stage(
                "download",
                DOWNLOAD_WEIGHT,
                DownloadStage::new(self.client.clone(), url, self.download_timeout),
            );
        }

        builder
            .stage("unpack", UNPACK_WEIGHT, UnpackStage)
            .stage("sanitize", SANITIZE_WEIGHT, SanitizeStage::new(Arc::clone(&self.prompt), self.prompt_timeout))
            .stage(
                "install",
                INSTALL_WEIGHT,
                InstallStage::new(
                    Arc::clone(&self.slots),
                    Arc::clone(&self.device),
                    Arc::clone(&self.store),
                    Arc::clone(&self.registry),
                    self.apps_dir.clone(),
                ),
            )
            .depends_on("unpack", download_dependency(&source))
            .sequential("unpack", "sanitize")
            .sequential("sanitize", "install")
            .cleanup(SideloadContext::close_temp_dir)
            .cancellation(cancel)
            .worker_pool(self.pool.clone())
            .build(SideloadContext::new(source, temp_dir))
    }
}

fn download_dependency(source: &SideloadSource) -> Vec<String> {
    if source.is_remote() {
        vec!["download".to_string()]
    } else {
        Vec::new()
    }
}
