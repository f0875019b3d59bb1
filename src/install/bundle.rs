//! 应用包（.app 目录）解析
//!
//! 读取 Info.plist（XML 与二进制格式均可）并扫描 PlugIns/*.appex 扩展。

use std::path::{Path, PathBuf};

use serde::Deserialize;
use walkdir::WalkDir;

use crate::core::ErrorKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppBundle {
    pub root: PathBuf,
    pub bundle_identifier: String,
    pub name: String,
    pub version: String,
    pub extensions: Vec<PathBuf>,
}

/// Info.plist 中用到的键
#[derive(Debug, Default, Deserialize)]
struct InfoPlist {
    #[serde(rename = "CFBundleIdentifier")]
    bundle_identifier: Option<String>,
    #[serde(rename = "CFBundleDisplayName")]
    display_name: Option<String>,
    #[serde(rename = "CFBundleName")]
    bundle_name: Option<String>,
    #[serde(rename = "CFBundleShortVersionString")]
    short_version: Option<String>,
    #[serde(rename = "CFBundleVersion")]
    build_version: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl AppBundle {
    /// 从 .app 目录加载（阻塞 IO，应在 spawn_blocking 中调用）
    pub fn load(root: &Path) -> Result<Self, ErrorKind> {
        let plist_path = root.join("Info.plist");
        if !plist_path.is_file() {
            return Err(ErrorKind::InvalidBundle(format!("{} does not exist", plist_path.display())));
        }
        let info: InfoPlist = plist::from_file(&plist_path)
            .map_err(|e| ErrorKind::InvalidBundle(format!("cannot parse {}: {}", plist_path.display(), e)))?;

        let bundle_identifier = non_empty(info.bundle_identifier)
            .ok_or_else(|| ErrorKind::InvalidBundle("missing CFBundleIdentifier".to_string()))?;
        let name = non_empty(info.display_name)
            .or_else(|| non_empty(info.bundle_name))
            .or_else(|| root.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .unwrap_or_else(|| bundle_identifier.clone());
        let version = non_empty(info.short_version)
            .or_else(|| non_empty(info.build_version))
            .unwrap_or_else(|| "1.0".to_string());

        Ok(Self {
            root: root.to_path_buf(),
            bundle_identifier,
            name,
            version,
            extensions: scan_extensions(root),
        })
    }

    pub fn extension_count(&self) -> usize {
        self.extensions.len()
    }

    /// 删除全部扩展目录
    pub fn remove_extensions(&mut self) -> Result<(), ErrorKind> {
        for extension in self.extensions.drain(..) {
            std::fs::remove_dir_all(&extension)?;
            tracing::debug!(path = %extension.display(), "Removed app extension");
        }
        Ok(())
    }
}

fn scan_extensions(root: &Path) -> Vec<PathBuf> {
    let plugins = root.join("PlugIns");
    if !plugins.is_dir() {
        return Vec::new();
    }
    let mut extensions: Vec<PathBuf> = WalkDir::new(&plugins)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
        .map(|e| e.into_path())
        .filter(|p| p.extension().map(|ext| ext == "appex").unwrap_or(false))
        .collect();
    extensions.sort();
    extensions
}

/// 生成最小的 XML Info.plist（测试与模拟使用）
pub fn info_plist(bundle_identifier: &str, name: &str, version: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>CFBundleIdentifier</key>
    <string>{bundle_identifier}</string>
    <key>CFBundleName</key>
    <string>{name}</string>
    <key>CFBundleShortVersionString</key>
    <string>{version}</string>
</dict>
</plist>
"#
    )
}
