//! 错误类型
//!
//! 所有动词、流水线阶段与槽位管理统一返回 ErrorKind；NoticePolicy 据此决定是否向用户发出通知。

use thiserror::Error;

use crate::device::TransportError;

/// 侧载核心的错误分类
#[derive(Error, Debug)]
pub enum ErrorKind {
    #[error("Device is not reachable")]
    DeviceUnreachable,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid app bundle: {0}")]
    InvalidBundle(String),

    /// 用户或系统取消；不产生失败通知
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Not enough active slots: {required} required, {available} available")]
    CapacityExceeded { required: usize, available: usize },

    #[error("Device transport failed: {0}")]
    TransportFailure(#[from] TransportError),

    /// 受系统版本/设备能力限制，重试无意义
    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid pipeline configuration: {0}")]
    Configuration(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ErrorKind {
    /// 取消是静默的：不弹失败提示
    pub fn is_silent(&self) -> bool {
        matches!(self, ErrorKind::Cancelled)
    }

    /// 调用方是否值得重新发起一次（核心本身从不自动重试）
    pub fn is_retryable(&self) -> bool {
        match self {
            ErrorKind::DeviceUnreachable => true,
            ErrorKind::TransportFailure(e) => e.is_transient(),
            ErrorKind::Io(_) => true,
            _ => false,
        }
    }
}
