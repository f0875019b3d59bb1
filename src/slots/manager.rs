//! 激活槽位管理器
//!
//! 所有可变槽位状态都在一把 tokio Mutex 之后（公平 FIFO），评估与预留在同一临界区内完成。
//! 激活采用两阶段乐观翻转：Inactive → Pending（预留）→ Active（设备确认）或回退为 Inactive。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;

use crate::core::registry::{InFlightRegistry, OperationGuard, OperationKind};
use crate::core::state::{ActivationEvent, ActivationPhase, Verb};
use crate::core::ErrorKind;
use crate::device::DeviceTransport;
use crate::slots::ledger::{ActivationDecision, SlotLedger, SlotUsage};
use crate::store::{ApplicationRecord, ApplicationStore, StoreChange};

/// 槽位不足时的处理策略
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// 直接返回 CapacityExceeded
    None,
    /// 先停用指定应用，再重新评估
    Evict(String),
    /// 等待任一应用转为 Inactive 后重新评估
    WaitForSlot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReservationKind {
    Activation,
    Install,
}

#[derive(Debug, Clone, Copy)]
struct Reservation {
    cost: usize,
    kind: ReservationKind,
}

#[derive(Debug, Default)]
struct SlotState {
    reservations: HashMap<String, Reservation>,
}

impl SlotState {
    fn reserved_excluding(&self, bundle_identifier: &str) -> usize {
        self.reservations
            .iter()
            .filter(|(id, _)| id.as_str() != bundle_identifier)
            .map(|(_, r)| r.cost)
            .sum()
    }
}

pub struct ActivationSlotManager {
    store: Arc<dyn ApplicationStore>,
    device: Arc<dyn DeviceTransport>,
    ledger: SlotLedger,
    host_bundle_identifier: String,
    registry: Arc<InFlightRegistry>,
    state: Mutex<SlotState>,
    events: broadcast::Sender<ActivationEvent>,
}

impl ActivationSlotManager {
    pub fn new(
        store: Arc<dyn ApplicationStore>,
        device: Arc<dyn DeviceTransport>,
        ledger: SlotLedger,
        host_bundle_identifier: impl Into<String>,
        registry: Arc<InFlightRegistry>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            store,
            device,
            ledger,
            host_bundle_identifier: host_bundle_identifier.into(),
            registry,
            state: Mutex::new(SlotState::default()),
            events,
        }
    }

    pub fn ledger(&self) -> &SlotLedger {
        &self.ledger
    }

    pub fn host_bundle_identifier(&self) -> &str {
        &self.host_bundle_identifier
    }

    /// 激活状态变化流
    pub fn subscribe(&self) -> broadcast::Receiver<ActivationEvent> {
        self.events.subscribe()
    }

    fn publish(&self, bundle_identifier: &str, from: ActivationPhase, to: ActivationPhase) {
        tracing::debug!(bundle = %bundle_identifier, ?from, ?to, "Activation phase changed");
        let _ = self.events.send(ActivationEvent::new(bundle_identifier, from, to));
    }

    async fn require_record(&self, bundle_identifier: &str) -> Result<ApplicationRecord, ErrorKind> {
        self.store
            .load(bundle_identifier)
            .await?
            .ok_or_else(|| ErrorKind::InvalidInput(format!("unknown app '{bundle_identifier}'")))
    }

    async fn evaluate_locked(&self, state: &SlotState, app: &ApplicationRecord) -> Result<ActivationDecision, ErrorKind> {
        let records = self.store.all().await?;
        let reserved = state.reserved_excluding(&app.bundle_identifier);
        Ok(self.ledger.evaluate(app, &records, reserved, &self.host_bundle_identifier))
    }

    /// 评估激活是否可行（只读）
    pub async fn evaluate_activation(&self, bundle_identifier: &str) -> Result<ActivationDecision, ErrorKind> {
        if !self.device.is_reachable().await {
            return Ok(ActivationDecision::Blocked);
        }
        let record = self.require_record(bundle_identifier).await?;
        let state = self.state.lock().await;
        self.evaluate_locked(&state, &record).await
    }

    pub async fn usage(&self) -> Result<SlotUsage, ErrorKind> {
        let state = self.state.lock().await;
        let records = self.store.all().await?;
        let consumed = self.ledger.consumed(&records, state.reserved_excluding(""), "");
        Ok(self.ledger.usage(consumed))
    }

    pub async fn eviction_candidates(&self, bundle_identifier: &str) -> Result<Vec<ApplicationRecord>, ErrorKind> {
        let record = self.require_record(bundle_identifier).await?;
        let records = self.store.all().await?;
        Ok(self.ledger.candidates(&records, &record, &self.host_bundle_identifier))
    }

    pub async fn phase(&self, bundle_identifier: &str) -> Result<ActivationPhase, ErrorKind> {
        if self.state.lock().await.reservations.contains_key(bundle_identifier) {
            return Ok(ActivationPhase::Pending);
        }
        let record = self.require_record(bundle_identifier).await?;
        Ok(if record.is_active {
            ActivationPhase::Active
        } else {
            ActivationPhase::Inactive
        })
    }

    /// 激活应用；在该应用的设备通道上单飞
    pub async fn activate(&self, bundle_identifier: &str, policy: EvictionPolicy) -> Result<ApplicationRecord, ErrorKind> {
        let guard = self
            .registry
            .begin(bundle_identifier, OperationKind::Device, Verb::Activate, 1)?;
        self.activate_in_lane(&guard, bundle_identifier, policy).await
    }

    async fn activate_in_lane(
        &self,
        guard: &OperationGuard,
        bundle_identifier: &str,
        policy: EvictionPolicy,
    ) -> Result<ApplicationRecord, ErrorKind> {
        if !self.device.is_reachable().await {
            return Err(ErrorKind::DeviceUnreachable);
        }
        let record = self.require_record(bundle_identifier).await?;
        if record.is_active {
            guard.progress().complete();
            return Ok(record);
        }

        let cost = self.ledger.cost(&record);
        let mut evicted = false;
        loop {
            // 先订阅再评估：评估之后发生的释放不会丢失
            let mut released = self.events.subscribe();
            let mut changes = self.store.subscribe();
            let decision = {
                let mut state = self.state.lock().await;
                guard.checkpoint()?;
                let decision = self.evaluate_locked(&state, &record).await?;
                if decision == ActivationDecision::Proceed {
                    state.reservations.insert(
                        bundle_identifier.to_string(),
                        Reservation {
                            cost,
                            kind: ReservationKind::Activation,
                        },
                    );
                    self.publish(bundle_identifier, ActivationPhase::Inactive, ActivationPhase::Pending);
                }
                decision
            };

            match decision {
                ActivationDecision::Proceed => break,
                ActivationDecision::Blocked => return Err(ErrorKind::DeviceUnreachable),
                ActivationDecision::RequiresEviction {
                    required,
                    available,
                    candidates,
                } => match &policy {
                    EvictionPolicy::None => return Err(ErrorKind::CapacityExceeded { required, available }),
                    EvictionPolicy::Evict(_) if evicted => {
                        return Err(ErrorKind::CapacityExceeded { required, available })
                    }
                    EvictionPolicy::Evict(victim) => {
                        if !candidates.iter().any(|c| &c.bundle_identifier == victim) {
                            return Err(ErrorKind::InvalidInput(format!("'{victim}' cannot be evicted")));
                        }
                        let victim_guard = self
                            .registry
                            .try_begin(victim, OperationKind::Device, Verb::Deactivate, 1)
                            .ok_or_else(|| ErrorKind::InvalidInput(format!("'{victim}' is busy")))?;
                        tracing::info!(bundle = %bundle_identifier, victim = %victim, "Evicting app to free slots");
                        self.deactivate_in_lane(&victim_guard, victim).await?;
                        evicted = true;
                    }
                    EvictionPolicy::WaitForSlot => {
                        if !self.ledger.capacity().can_ever_fit(required) {
                            return Err(ErrorKind::CapacityExceeded { required, available });
                        }
                        tracing::info!(bundle = %bundle_identifier, required, available, "Waiting for a free slot");
                        wait_for_release(&mut released, &mut changes, guard.token()).await?;
                    }
                },
            }
        }

        let confirmed = match self.device.activate(&record).await {
            Ok(_) if guard.is_cancelled() => {
                tracing::warn!(bundle = %bundle_identifier, "Activation cancelled after device confirmed, undoing");
                if let Err(e) = self.device.deactivate(&record).await {
                    tracing::warn!(bundle = %bundle_identifier, "Failed to undo cancelled activation: {}", e);
                }
                Err(ErrorKind::Cancelled)
            }
            Ok(handle) => {
                let mut updated = record.clone();
                updated.resigned_bundle_identifier = handle.resigned_bundle_identifier;
                updated.refreshed_at = handle.refreshed_at;
                updated.expires_at = handle.expires_at;
                updated.is_active = true;
                Ok(updated)
            }
            Err(e) => Err(ErrorKind::from(e)),
        };

        let mut state = self.state.lock().await;
        let result = match confirmed {
            Ok(updated) => self.store.save(updated.clone()).await.map(|_| updated),
            Err(e) => Err(e),
        };
        state.reservations.remove(bundle_identifier);
        match &result {
            Ok(_) => {
                guard.progress().complete();
                self.publish(bundle_identifier, ActivationPhase::Pending, ActivationPhase::Active);
                tracing::info!(bundle = %bundle_identifier, "App activated");
            }
            Err(e) => {
                if !e.is_silent() {
                    tracing::warn!(bundle = %bundle_identifier, "Activation failed, reverting: {}", e);
                }
                self.publish(bundle_identifier, ActivationPhase::Pending, ActivationPhase::Inactive);
            }
        }
        result
    }

    /// 停用应用；宿主应用不可停用，已停用时直接返回
    pub async fn deactivate(&self, bundle_identifier: &str) -> Result<ApplicationRecord, ErrorKind> {
        if bundle_identifier == self.host_bundle_identifier {
            return Err(ErrorKind::InvalidInput("the host app cannot be deactivated".to_string()));
        }
        let guard = self
            .registry
            .begin(bundle_identifier, OperationKind::Device, Verb::Deactivate, 1)?;
        self.deactivate_in_lane(&guard, bundle_identifier).await
    }

    pub(crate) async fn deactivate_in_lane(
        &self,
        guard: &OperationGuard,
        bundle_identifier: &str,
    ) -> Result<ApplicationRecord, ErrorKind> {
        if !self.device.is_reachable().await {
            return Err(ErrorKind::DeviceUnreachable);
        }
        let record = self.require_record(bundle_identifier).await?;
        if !record.is_active {
            guard.progress().complete();
            return Ok(record);
        }
        guard.checkpoint()?;

        self.device.deactivate(&record).await?;

        // 设备已确认：无论是否被取消，账本都要反映真实状态
        let mut updated = record;
        updated.is_active = false;
        {
            let _state = self.state.lock().await;
            self.store.save(updated.clone()).await?;
            self.publish(bundle_identifier, ActivationPhase::Active, ActivationPhase::Inactive);
        }
        guard.progress().complete();
        tracing::info!(bundle = %bundle_identifier, "App deactivated");

        guard.checkpoint()?;
        Ok(updated)
    }

    /// 为新安装预留槽位；同一应用已有未决预留时拒绝。
    /// 应用已活跃（重装）时只预留超出现有开销的部分
    pub async fn reserve_install(&self, bundle_identifier: &str, cost: usize) -> Result<(), ErrorKind> {
        let mut state = self.state.lock().await;
        if state.reservations.contains_key(bundle_identifier) {
            return Err(ErrorKind::InvalidInput(format!(
                "'{bundle_identifier}' already has a pending install or activation"
            )));
        }
        let records = self.store.all().await?;
        let consumed = self
            .ledger
            .consumed(&records, state.reserved_excluding(bundle_identifier), bundle_identifier);
        if !self.ledger.capacity().fits(consumed, cost) {
            return Err(ErrorKind::CapacityExceeded {
                required: cost,
                available: self.ledger.capacity().available(consumed).unwrap_or(0),
            });
        }
        let existing_cost = records
            .iter()
            .find(|r| r.bundle_identifier == bundle_identifier && r.is_active)
            .map(|r| self.ledger.cost(r));
        state.reservations.insert(
            bundle_identifier.to_string(),
            Reservation {
                cost: cost.saturating_sub(existing_cost.unwrap_or(0)),
                kind: ReservationKind::Install,
            },
        );
        let from = if existing_cost.is_some() {
            ActivationPhase::Active
        } else {
            ActivationPhase::Inactive
        };
        self.publish(bundle_identifier, from, ActivationPhase::Pending);
        Ok(())
    }

    /// 安装成功：持久化为活跃并释放预留
    pub async fn commit_install(&self, mut record: ApplicationRecord) -> Result<ApplicationRecord, ErrorKind> {
        let mut state = self.state.lock().await;
        record.is_active = true;
        self.store.save(record.clone()).await?;
        let reservation = state.reservations.remove(&record.bundle_identifier);
        let from = match reservation {
            Some(r) if r.kind == ReservationKind::Install => ActivationPhase::Pending,
            _ => ActivationPhase::Inactive,
        };
        self.publish(&record.bundle_identifier, from, ActivationPhase::Active);
        Ok(record)
    }

    /// 放弃预留（安装失败或取消）
    pub async fn release(&self, bundle_identifier: &str) -> Result<(), ErrorKind> {
        let mut state = self.state.lock().await;
        if state.reservations.remove(bundle_identifier).is_none() {
            return Ok(());
        }
        let to = match self.store.load(bundle_identifier).await? {
            Some(record) if record.is_active => ActivationPhase::Active,
            _ => ActivationPhase::Inactive,
        };
        self.publish(bundle_identifier, ActivationPhase::Pending, to);
        Ok(())
    }
}

/// 等待可能的槽位释放：激活事件中的释放或预留结清，或存储中活跃记录被停用、删除。
/// 消息积压时也视为可能有槽位释放
async fn wait_for_release(
    released: &mut broadcast::Receiver<ActivationEvent>,
    changes: &mut broadcast::Receiver<StoreChange>,
    cancel: &CancellationToken,
) -> Result<(), ErrorKind> {
    let mut store_open = true;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(ErrorKind::Cancelled),
            event = released.recv() => match event {
                Ok(event) if event.frees_slot() => return Ok(()),
                Ok(_) => continue,
                Err(RecvError::Lagged(_)) => return Ok(()),
                Err(RecvError::Closed) => {
                    return Err(ErrorKind::Internal("activation event stream closed".to_string()))
                }
            },
            change = changes.recv(), if store_open => match change {
                Ok(change) if deactivated(&change) => return Ok(()),
                Ok(_) => continue,
                Err(RecvError::Lagged(_)) => return Ok(()),
                // 存储不再推送变更时只依赖激活事件
                Err(RecvError::Closed) => store_open = false,
            },
        }
    }
}

/// 活跃记录被改为未激活或被删除
fn deactivated(change: &StoreChange) -> bool {
    let was_active = change.previous.as_ref().map(|r| r.is_active).unwrap_or(false);
    let is_active = change.current.as_ref().map(|r| r.is_active).unwrap_or(false);
    was_active && !is_active
}

impl std::fmt::Debug for ActivationSlotManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivationSlotManager")
            .field("ledger", &self.ledger)
            .field("host_bundle_identifier", &self.host_bundle_identifier)
            .finish()
    }
}
