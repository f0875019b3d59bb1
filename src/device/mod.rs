//! 设备传输层
//!
//! 设备被视为黑盒：只暴露「是否可达」和针对某个 bundle 的安装/刷新/激活/调试等操作，
//! 所有操作都可能瞬时失败。

pub mod simulated;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::install::AppBundle;
use crate::progress::Progress;
use crate::store::ApplicationRecord;

pub use simulated::{DeviceCall, SimulatedDevice};

/// 传输层错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("device went away")]
    Unreachable,

    #[error("device rejected the request ({code}): {message}")]
    Rejected { code: i32, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,
}

impl TransportError {
    /// 瞬时错误：重新发起可能成功
    pub fn is_transient(&self) -> bool {
        !matches!(self, TransportError::Rejected { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl std::fmt::Display for OsVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    pub os_version: OsVersion,
}

/// 设备确认安装/刷新/激活后返回的签名信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstalledHandle {
    pub resigned_bundle_identifier: String,
    pub version: String,
    pub refreshed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub certificate_serial: Option<String>,
}

/// 设备传输接口（签名与描述文件获取在此接口之后完成）
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    async fn is_reachable(&self) -> bool;

    async fn device_info(&self) -> Result<DeviceInfo, TransportError>;

    /// 签名并安装 bundle；可通过 progress 汇报传输进度
    async fn install(&self, bundle: &AppBundle, progress: Progress) -> Result<InstalledHandle, TransportError>;

    /// 重新签名，延长有效期
    async fn refresh(&self, record: &ApplicationRecord) -> Result<InstalledHandle, TransportError>;

    async fn activate(&self, record: &ApplicationRecord) -> Result<InstalledHandle, TransportError>;

    async fn deactivate(&self, record: &ApplicationRecord) -> Result<(), TransportError>;

    async fn backup(&self, record: &ApplicationRecord) -> Result<(), TransportError>;

    async fn restore(&self, record: &ApplicationRecord) -> Result<(), TransportError>;

    async fn debug_enable(&self, resigned_bundle_identifier: &str) -> Result<(), TransportError>;
}
