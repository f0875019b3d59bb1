//! 激活槽位：账本计算与槽位管理器

pub mod ledger;
pub mod manager;

pub use ledger::{ActivationDecision, SlotCapacity, SlotLedger, SlotUsage};
pub use manager::{ActivationSlotManager, EvictionPolicy};
