//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `SIDELOADER__*` 覆盖（双下划线表示嵌套，如 `SIDELOADER__SLOTS__ACTIVE_APPS_LIMIT=10`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::slots::SlotCapacity;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub slots: SlotsSection,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub device: DeviceSection,
}

/// [app] 段：应用名、数据目录、宿主应用标识
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
    /// 记录与本地产物目录，未设置时用 ./data
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// 宿主应用：不可停用、不可驱逐、刷新时排在最后
    #[serde(default = "default_host_bundle_identifier")]
    pub host_bundle_identifier: String,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            data_dir: default_data_dir(),
            host_bundle_identifier: default_host_bundle_identifier(),
        }
    }
}

impl AppSection {
    pub fn records_path(&self) -> PathBuf {
        self.data_dir.join("apps.json")
    }

    pub fn apps_dir(&self) -> PathBuf {
        self.data_dir.join("apps")
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_host_bundle_identifier() -> String {
    "com.SideStore.SideStore".to_string()
}

/// [slots] 段：活跃应用上限
#[derive(Debug, Clone, Deserialize)]
pub struct SlotsSection {
    #[serde(default = "default_active_apps_limit")]
    pub active_apps_limit: usize,
    /// 为 true 时不限制（如已注册付费开发者账号）
    #[serde(default)]
    pub unlimited: bool,
    /// 扩展是否各占一个槽位
    #[serde(default)]
    pub limit_includes_extensions: bool,
}

impl Default for SlotsSection {
    fn default() -> Self {
        Self {
            active_apps_limit: default_active_apps_limit(),
            unlimited: false,
            limit_includes_extensions: false,
        }
    }
}

impl SlotsSection {
    pub fn capacity(&self) -> SlotCapacity {
        if self.unlimited {
            SlotCapacity::Unlimited
        } else {
            SlotCapacity::Limited(self.active_apps_limit)
        }
    }
}

fn default_active_apps_limit() -> usize {
    3
}

/// [pipeline] 段：阶段并发、扩展询问超时、下载超时、临时目录
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineSection {
    #[serde(default = "default_max_concurrent_stages")]
    pub max_concurrent_stages: usize,
    /// 未设置时无限等待
    pub extension_prompt_timeout_secs: Option<u64>,
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
    pub temp_dir: Option<PathBuf>,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            max_concurrent_stages: default_max_concurrent_stages(),
            extension_prompt_timeout_secs: None,
            download_timeout_secs: default_download_timeout_secs(),
            temp_dir: None,
        }
    }
}

impl PipelineSection {
    pub fn prompt_timeout(&self) -> Option<Duration> {
        self.extension_prompt_timeout_secs.map(Duration::from_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}

fn default_max_concurrent_stages() -> usize {
    3
}

fn default_download_timeout_secs() -> u64 {
    300
}

/// [device] 段
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceSection {
    /// 从该主版本起不支持 enable_debugging
    #[serde(default = "default_debugging_unsupported_from_major")]
    pub debugging_unsupported_from_major: u32,
    #[serde(default = "default_background_refresh_interval_hours")]
    pub background_refresh_interval_hours: u64,
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            debugging_unsupported_from_major: default_debugging_unsupported_from_major(),
            background_refresh_interval_hours: default_background_refresh_interval_hours(),
        }
    }
}

fn default_debugging_unsupported_from_major() -> u32 {
    17
}

fn default_background_refresh_interval_hours() -> u64 {
    6
}

/// 从 config 目录加载配置，环境变量 SIDELOADER__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 SIDELOADER__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("SIDELOADER")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
