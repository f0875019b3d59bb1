//! 模拟设备
//!
//! 无真实设备时使用：支持可达性切换、按 (bundle, 调用) 注入失败、固定延迟与调用日志。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use super::{DeviceInfo, DeviceTransport, InstalledHandle, OsVersion, TransportError};
use crate::install::AppBundle;
use crate::progress::Progress;
use crate::store::{ApplicationRecord, DEFAULT_SIGNING_VALIDITY_DAYS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceCall {
    Install,
    Refresh,
    Activate,
    Deactivate,
    Backup,
    Restore,
    DebugEnable,
}

/// 模拟设备
#[derive(Debug)]
pub struct SimulatedDevice {
    reachable: AtomicBool,
    info: DeviceInfo,
    latency: Duration,
    failures: Mutex<HashMap<(String, DeviceCall), TransportError>>,
    journal: Mutex<Vec<(DeviceCall, String)>>,
}

impl SimulatedDevice {
    pub fn new() -> Self {
        Self {
            reachable: AtomicBool::new(true),
            info: DeviceInfo {
                name: "Simulated iPhone".to_string(),
                os_version: OsVersion { major: 16, minor: 6, patch: 0 },
            },
            latency: Duration::ZERO,
            failures: Mutex::new(HashMap::new()),
            journal: Mutex::new(Vec::new()),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_os_version(mut self, major: u32, minor: u32, patch: u32) -> Self {
        self.info.os_version = OsVersion { major, minor, patch };
        self
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// 之后对该 bundle 的此类调用均返回 error，直到 clear_failures
    pub fn inject_failure(&self, bundle_identifier: &str, call: DeviceCall, error: TransportError) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((bundle_identifier.to_string(), call), error);
    }

    pub fn clear_failures(&self) {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// 已执行调用的日志（按发生顺序）
    pub fn calls(&self) -> Vec<(DeviceCall, String)> {
        self.journal.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn calls_for(&self, bundle_identifier: &str) -> Vec<DeviceCall> {
        self.calls()
            .into_iter()
            .filter(|(_, id)| id == bundle_identifier)
            .map(|(call, _)| call)
            .collect()
    }

    async fn perform(&self, call: DeviceCall, bundle_identifier: &str) -> Result<(), TransportError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(TransportError::Unreachable);
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.journal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((call, bundle_identifier.to_string()));

        let injected = self
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(bundle_identifier.to_string(), call))
            .cloned();
        match injected {
            Some(err) => {
                tracing::debug!(bundle = %bundle_identifier, call = ?call, "Simulated device failure: {}", err);
                Err(err)
            }
            None => Ok(()),
        }
    }

    fn signed(resigned_bundle_identifier: &str, version: &str) -> InstalledHandle {
        let now = Utc::now();
        InstalledHandle {
            resigned_bundle_identifier: resigned_bundle_identifier.to_string(),
            version: version.to_string(),
            refreshed_at: now,
            expires_at: now + chrono::Duration::days(DEFAULT_SIGNING_VALIDITY_DAYS),
            certificate_serial: Some("SIMULATED-0001".to_string()),
        }
    }
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceTransport for SimulatedDevice {
    async fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    async fn device_info(&self) -> Result<DeviceInfo, TransportError> {
        if !self.is_reachable().await {
            return Err(TransportError::Unreachable);
        }
        Ok(self.info.clone())
    }

    async fn install(&self, bundle: &AppBundle, progress: Progress) -> Result<InstalledHandle, TransportError> {
        progress.set_completed(progress.total_units() / 2);
        self.perform(DeviceCall::Install, &bundle.bundle_identifier).await?;
        progress.complete();
        Ok(Self::signed(&bundle.bundle_identifier, &bundle.version))
    }

    async fn refresh(&self, record: &ApplicationRecord) -> Result<InstalledHandle, TransportError> {
        self.perform(DeviceCall::Refresh, &record.bundle_identifier).await?;
        Ok(Self::signed(&record.resigned_bundle_identifier, &record.version))
    }

    async fn activate(&self, record: &ApplicationRecord) -> Result<InstalledHandle, TransportError> {
        self.perform(DeviceCall::Activate, &record.bundle_identifier).await?;
        Ok(Self::signed(&record.resigned_bundle_identifier, &record.version))
    }

    async fn deactivate(&self, record: &ApplicationRecord) -> Result<(), TransportError> {
        self.perform(DeviceCall::Deactivate, &record.bundle_identifier).await
    }

    async fn backup(&self, record: &ApplicationRecord) -> Result<(), TransportError> {
        self.perform(DeviceCall::Backup, &record.bundle_identifier).await
    }

    async fn restore(&self, record: &ApplicationRecord) -> Result<(), TransportError> {
        self.perform(DeviceCall::Restore, &record.bundle_identifier).await
    }

    async fn debug_enable(&self, resigned_bundle_identifier: &str) -> Result<(), TransportError> {
        self.perform(DeviceCall::DebugEnable, resigned_bundle_identifier).await
    }
}
