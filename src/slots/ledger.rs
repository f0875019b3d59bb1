//! 槽位账本
//!
//! 纯计算，不持久化：由活跃记录与未决预留推导已占用与可用槽位。

use serde::Serialize;

use crate::store::ApplicationRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SlotCapacity {
    Limited(usize),
    Unlimited,
}

impl SlotCapacity {
    pub fn available(&self, consumed: usize) -> Option<usize> {
        match self {
            SlotCapacity::Limited(limit) => Some(limit.saturating_sub(consumed)),
            SlotCapacity::Unlimited => None,
        }
    }

    pub fn fits(&self, consumed: usize, cost: usize) -> bool {
        match self {
            SlotCapacity::Limited(limit) => consumed + cost <= *limit,
            SlotCapacity::Unlimited => true,
        }
    }

    /// 单个应用的开销是否超过总容量（永远无法满足）
    pub fn can_ever_fit(&self, cost: usize) -> bool {
        self.fits(0, cost)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ActivationDecision {
    Proceed,
    RequiresEviction {
        required: usize,
        available: usize,
        candidates: Vec<ApplicationRecord>,
    },
    /// 设备不可达
    Blocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SlotUsage {
    pub capacity: SlotCapacity,
    pub consumed: usize,
    /// Unlimited 时为 None
    pub available: Option<usize>,
}

#[derive(Debug, Clone, Copy)]
pub struct SlotLedger {
    capacity: SlotCapacity,
    include_extensions: bool,
}

impl SlotLedger {
    pub fn new(capacity: SlotCapacity, include_extensions: bool) -> Self {
        Self {
            capacity,
            include_extensions,
        }
    }

    pub fn capacity(&self) -> SlotCapacity {
        self.capacity
    }

    pub fn cost(&self, record: &ApplicationRecord) -> usize {
        record.required_slots(self.include_extensions)
    }

    /// 活跃记录（排除 excluding）开销之和加上未决预留
    pub fn consumed<'a>(
        &self,
        active: impl IntoIterator<Item = &'a ApplicationRecord>,
        reserved: usize,
        excluding: &str,
    ) -> usize {
        active
            .into_iter()
            .filter(|r| r.is_active && r.bundle_identifier != excluding)
            .map(|r| self.cost(r))
            .sum::<usize>()
            + reserved
    }

    pub fn usage(&self, consumed: usize) -> SlotUsage {
        SlotUsage {
            capacity: self.capacity,
            consumed,
            available: self.capacity.available(consumed),
        }
    }

    /// 可被停用以腾出槽位的应用：活跃、非宿主、非申请者本身
    pub fn candidates(&self, records: &[ApplicationRecord], app: &ApplicationRecord, host: &str) -> Vec<ApplicationRecord> {
        let mut candidates: Vec<ApplicationRecord> = records
            .iter()
            .filter(|r| r.is_active && r.bundle_identifier != host && r.bundle_identifier != app.bundle_identifier)
            .cloned()
            .collect();
        candidates.sort_by(|a, b| a.name.cmp(&b.name));
        candidates
    }

    pub fn evaluate(
        &self,
        app: &ApplicationRecord,
        records: &[ApplicationRecord],
        reserved: usize,
        host: &str,
    ) -> ActivationDecision {
        let consumed = self.consumed(records, reserved, &app.bundle_identifier);
        let required = self.cost(app);
        if self.capacity.fits(consumed, required) {
            return ActivationDecision::Proceed;
        }
        ActivationDecision::RequiresEviction {
            required,
            available: self.capacity.available(consumed).unwrap_or(0),
            candidates: self.candidates(records, app, host),
        }
    }
}
