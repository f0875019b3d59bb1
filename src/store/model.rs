//! 应用记录

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// 设备尚未回报描述文件日期时使用的默认签名有效期
pub const DEFAULT_SIGNING_VALIDITY_DAYS: i64 = 7;

/// 已侧载应用的持久化记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationRecord {
    pub name: String,
    /// 稳定标识
    pub bundle_identifier: String,
    /// 重签名后的标识，可能与 bundle_identifier 不同
    pub resigned_bundle_identifier: String,
    pub version: String,
    pub installed_at: DateTime<Utc>,
    pub refreshed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub extension_count: usize,
    #[serde(default)]
    pub certificate_serial: Option<String>,
}

impl ApplicationRecord {
    pub fn new(name: impl Into<String>, bundle_identifier: impl Into<String>, version: impl Into<String>) -> Self {
        let bundle_identifier = bundle_identifier.into();
        let now = Utc::now();
        Self {
            name: name.into(),
            resigned_bundle_identifier: bundle_identifier.clone(),
            bundle_identifier,
            version: version.into(),
            installed_at: now,
            refreshed_at: now,
            expires_at: now + Duration::days(DEFAULT_SIGNING_VALIDITY_DAYS),
            is_active: false,
            extension_count: 0,
            certificate_serial: None,
        }
    }

    pub fn with_extensions(mut self, extension_count: usize) -> Self {
        self.extension_count = extension_count;
        self
    }

    /// 应用本身加每个扩展各占一个 App ID
    pub fn app_id_count(&self) -> usize {
        1 + self.extension_count
    }

    /// 激活时占用的槽位数
    pub fn required_slots(&self, include_extensions: bool) -> usize {
        if include_extensions {
            self.app_id_count()
        } else {
            1
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
