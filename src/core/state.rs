//! 状态定义：激活阶段、激活事件与 AppView 投影
//!
//! 展示层只持有轻量的 AppView（名称、阶段、进行中进度、到期时间）；完整状态由存储与槽位管理器维护。

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::store::ApplicationRecord;

/// 用户发起的动词
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Verb {
    Sideload,
    Refresh,
    Activate,
    Deactivate,
    Backup,
    Restore,
    Remove,
    EnableDebugging,
}

impl Verb {
    /// 用于通知文案的动词原形
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Sideload => "install",
            Verb::Refresh => "refresh",
            Verb::Activate => "activate",
            Verb::Deactivate => "deactivate",
            Verb::Backup => "back up",
            Verb::Restore => "restore",
            Verb::Remove => "remove",
            Verb::EnableDebugging => "enable debugging for",
        }
    }
}

impl std::fmt::Display for Verb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 激活阶段：Inactive → Pending → Active；Pending 失败回退为 Inactive
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum ActivationPhase {
    Inactive,
    Pending,
    Active,
}

/// 激活状态变化通知
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActivationEvent {
    pub bundle_identifier: String,
    pub from: ActivationPhase,
    pub to: ActivationPhase,
}

impl ActivationEvent {
    pub fn new(bundle_identifier: impl Into<String>, from: ActivationPhase, to: ActivationPhase) -> Self {
        Self {
            bundle_identifier: bundle_identifier.into(),
            from,
            to,
        }
    }

    /// 是否可能腾出槽位：转为 Inactive，或结清了一笔预留（离开 Pending）
    pub fn frees_slot(&self) -> bool {
        self.to == ActivationPhase::Inactive || self.from == ActivationPhase::Pending
    }
}

/// 展示层看到的「投影」
#[derive(Clone, Debug, Serialize)]
pub struct AppView {
    pub name: String,
    pub bundle_identifier: String,
    pub phase: ActivationPhase,
    /// 进行中操作的完成比例
    pub progress: Option<f64>,
    pub expires_at: DateTime<Utc>,
    pub refreshed_at: DateTime<Utc>,
}

impl AppView {
    pub fn project(record: &ApplicationRecord, phase: ActivationPhase, progress: Option<f64>) -> Self {
        Self {
            name: record.name.clone(),
            bundle_identifier: record.bundle_identifier.clone(),
            phase,
            progress,
            expires_at: record.expires_at,
            refreshed_at: record.refreshed_at,
        }
    }
}

/// 排序：活跃在前，其次按刷新时间倒序
pub fn sort_views(views: &mut [AppView]) {
    views.sort_by(|a, b| {
        let a_active = a.phase != ActivationPhase::Inactive;
        let b_active = b.phase != ActivationPhase::Inactive;
        b_active
            .cmp(&a_active)
            .then_with(|| b.refreshed_at.cmp(&a.refreshed_at))
    });
}
