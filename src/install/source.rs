//! 侧载来源：本地 .ipa 或远程 URL

use std::path::PathBuf;

use crate::core::ErrorKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideloadSource {
    Local(PathBuf),
    Remote(String),
}

impl SideloadSource {
    /// 识别 http(s):// 与 file:// 前缀，其余视为本地路径
    pub fn parse(input: &str) -> Result<Self, ErrorKind> {
        let input = input.trim();
        if input.is_empty() {
            return Err(ErrorKind::InvalidInput("empty sideload source".to_string()));
        }

        let lower = input.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            return Ok(SideloadSource::Remote(input.to_string()));
        }
        if lower.starts_with("file://") {
            let path = &input["file://".len()..];
            if path.is_empty() {
                return Err(ErrorKind::InvalidInput(format!("'{input}' has no path")));
            }
            return Ok(SideloadSource::Local(PathBuf::from(path)));
        }
        if lower.contains("://") {
            return Err(ErrorKind::InvalidInput(format!("unsupported URL scheme in '{input}'")));
        }
        Ok(SideloadSource::Local(PathBuf::from(input)))
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, SideloadSource::Remote(_))
    }

    /// 进行中操作登记表的键
    pub fn key(&self) -> String {
        match self {
            SideloadSource::Local(path) => path.display().to_string(),
            SideloadSource::Remote(url) => url.clone(),
        }
    }
}
