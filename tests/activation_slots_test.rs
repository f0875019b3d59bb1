//! 激活槽位集成测试

use std::sync::Arc;
use std::time::Duration;

use sideloader::core::{ActivationEvent, ActivationPhase, ErrorKind, InFlightRegistry};
use sideloader::device::{DeviceCall, SimulatedDevice};
use sideloader::slots::{ActivationSlotManager, EvictionPolicy, SlotCapacity, SlotLedger};
use sideloader::store::{ApplicationRecord, ApplicationStore, RecordStore};

const HOST: &str = "com.SideStore.SideStore";

struct Fixture {
    manager: Arc<ActivationSlotManager>,
    store: Arc<RecordStore>,
    device: Arc<SimulatedDevice>,
}

/// 宿主 A 与 B、C 活跃，D 未激活；上限 3
async fn fixture(device: SimulatedDevice) -> Fixture {
    let store = Arc::new(RecordStore::new());
    for (id, active) in [(HOST, true), ("com.b", true), ("com.c", true), ("com.d", false)] {
        let mut record = ApplicationRecord::new(id.trim_start_matches("com."), id, "1.0");
        record.is_active = active;
        store.save(record).await.unwrap();
    }
    let device = Arc::new(device);
    let manager = Arc::new(ActivationSlotManager::new(
        store.clone(),
        device.clone(),
        SlotLedger::new(SlotCapacity::Limited(3), false),
        HOST,
        Arc::new(InFlightRegistry::new()),
    ));
    Fixture { manager, store, device }
}

async fn active_cost(store: &RecordStore) -> usize {
    store.all().await.unwrap().iter().filter(|r| r.is_active).count()
}

#[tokio::test]
async fn test_full_ledger_requires_eviction() {
    let f = fixture(SimulatedDevice::new()).await;

    let err = f.manager.activate("com.d", EvictionPolicy::None).await.unwrap_err();
    assert!(matches!(err, ErrorKind::CapacityExceeded { required: 1, available: 0 }));
    assert!(f.device.calls().is_empty());

    let candidates: Vec<String> = f
        .manager
        .eviction_candidates("com.d")
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.bundle_identifier)
        .collect();
    assert_eq!(candidates, vec!["com.b", "com.c"]);
}

#[tokio::test]
async fn test_evict_then_activate_publishes_in_order() {
    let f = fixture(SimulatedDevice::new()).await;
    let mut events = f.manager.subscribe();

    let record = f
        .manager
        .activate("com.d", EvictionPolicy::Evict("com.b".to_string()))
        .await
        .unwrap();
    assert!(record.is_active);
    assert!(!f.store.load("com.b").await.unwrap().unwrap().is_active);
    assert_eq!(active_cost(&f.store).await, 3);

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert_eq!(
        seen,
        vec![
            ActivationEvent::new("com.b", ActivationPhase::Active, ActivationPhase::Inactive),
            ActivationEvent::new("com.d", ActivationPhase::Inactive, ActivationPhase::Pending),
            ActivationEvent::new("com.d", ActivationPhase::Pending, ActivationPhase::Active),
        ]
    );
    assert_eq!(
        f.device.calls(),
        vec![(DeviceCall::Deactivate, "com.b".to_string()), (DeviceCall::Activate, "com.d".to_string())]
    );
}

#[tokio::test]
async fn test_host_is_never_an_eviction_target() {
    let f = fixture(SimulatedDevice::new()).await;
    let err = f
        .manager
        .activate("com.d", EvictionPolicy::Evict(HOST.to_string()))
        .await
        .unwrap_err();
    assert!(matches!(err, ErrorKind::InvalidInput(_)));
    assert!(f.store.load(HOST).await.unwrap().unwrap().is_active);
}

#[tokio::test]
async fn test_wait_for_slot_wakes_after_deactivate() {
    let f = fixture(SimulatedDevice::new()).await;

    let waiter = {
        let manager = Arc::clone(&f.manager);
        tokio::spawn(async move { manager.activate("com.d", EvictionPolicy::WaitForSlot).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());
    assert!(!f.store.load("com.d").await.unwrap().unwrap().is_active);

    f.manager.deactivate("com.c").await.unwrap();

    let record = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(record.is_active);
    assert_eq!(active_cost(&f.store).await, 3);
}

#[tokio::test]
async fn test_reentrant_activate_cancels_both() {
    let f = fixture(SimulatedDevice::new().with_latency(Duration::from_millis(200))).await;
    f.manager.deactivate("com.c").await.unwrap();

    let first = {
        let manager = Arc::clone(&f.manager);
        tokio::spawn(async move { manager.activate("com.d", EvictionPolicy::None).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = f.manager.activate("com.d", EvictionPolicy::None).await;
    assert!(matches!(second, Err(ErrorKind::Cancelled)));

    let first = first.await.unwrap();
    assert!(matches!(first, Err(ErrorKind::Cancelled)));
    assert!(!f.store.load("com.d").await.unwrap().unwrap().is_active);
    assert_eq!(f.manager.phase("com.d").await.unwrap(), ActivationPhase::Inactive);
}

#[tokio::test]
async fn test_concurrent_activations_never_overcommit() {
    let store = Arc::new(RecordStore::new());
    let mut host = ApplicationRecord::new("SideStore", HOST, "1.0");
    host.is_active = true;
    store.save(host).await.unwrap();
    for i in 0..6 {
        let id = format!("com.app{i}");
        store.save(ApplicationRecord::new(&id, &id, "1.0")).await.unwrap();
    }
    let device = Arc::new(SimulatedDevice::new().with_latency(Duration::from_millis(10)));
    let manager = Arc::new(ActivationSlotManager::new(
        store.clone(),
        device,
        SlotLedger::new(SlotCapacity::Limited(3), false),
        HOST,
        Arc::new(InFlightRegistry::new()),
    ));

    let mut joins = tokio::task::JoinSet::new();
    for i in 0..6 {
        let manager = Arc::clone(&manager);
        joins.spawn(async move { manager.activate(&format!("com.app{i}"), EvictionPolicy::None).await });
    }

    let mut activated = 0;
    let mut rejected = 0;
    while let Some(result) = joins.join_next().await {
        match result.unwrap() {
            Ok(_) => activated += 1,
            Err(ErrorKind::CapacityExceeded { .. }) => rejected += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(activated, 2);
    assert_eq!(rejected, 4);
    assert_eq!(active_cost(&store).await, 3);

    let usage = manager.usage().await.unwrap();
    assert_eq!(usage.consumed, 3);
}

#[tokio::test]
async fn test_failed_activation_reverts_and_frees_reservation() {
    let f = fixture(SimulatedDevice::new()).await;
    f.manager.deactivate("com.c").await.unwrap();
    f.device.inject_failure(
        "com.d",
        DeviceCall::Activate,
        sideloader::device::TransportError::Network("connection reset".into()),
    );

    let err = f.manager.activate("com.d", EvictionPolicy::None).await.unwrap_err();
    assert!(matches!(err, ErrorKind::TransportFailure(_)));
    assert_eq!(f.manager.phase("com.d").await.unwrap(), ActivationPhase::Inactive);

    f.device.clear_failures();
    assert!(f.manager.activate("com.d", EvictionPolicy::None).await.unwrap().is_active);
}

#[tokio::test]
async fn test_one_freed_slot_wakes_exactly_one_waiter() {
    let f = fixture(SimulatedDevice::new()).await;
    f.store.save(ApplicationRecord::new("e", "com.e", "1.0")).await.unwrap();

    let spawn_waiter = |id: &'static str| {
        let manager = Arc::clone(&f.manager);
        tokio::spawn(async move { manager.activate(id, EvictionPolicy::WaitForSlot).await })
    };
    let mut d = spawn_waiter("com.d");
    let mut e = spawn_waiter("com.e");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!d.is_finished() && !e.is_finished());

    f.manager.deactivate("com.c").await.unwrap();

    // 只有一个等待者能拿到唯一的空位
    let d_won = tokio::select! {
        result = &mut d => {
            assert!(result.unwrap().unwrap().is_active);
            true
        }
        result = &mut e => {
            assert!(result.unwrap().unwrap().is_active);
            false
        }
    };
    let mut loser = if d_won { e } else { d };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!loser.is_finished());
    assert_eq!(active_cost(&f.store).await, 3);

    f.manager.deactivate("com.b").await.unwrap();
    let record = tokio::time::timeout(Duration::from_secs(5), &mut loser)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(record.is_active);
    assert_eq!(active_cost(&f.store).await, 3);
    assert_eq!(f.manager.usage().await.unwrap().consumed, 3);
}

#[tokio::test]
async fn test_reinstall_does_not_double_count_active_app() {
    let f = fixture(SimulatedDevice::new()).await;
    f.manager.deactivate("com.c").await.unwrap();

    // com.b 已活跃，重装只预留差额（0）
    f.manager.reserve_install("com.b", 1).await.unwrap();
    assert_eq!(f.manager.usage().await.unwrap().consumed, 2);
    assert!(f.manager.activate("com.d", EvictionPolicy::None).await.unwrap().is_active);

    let record = f.store.load("com.b").await.unwrap().unwrap();
    let committed = f.manager.commit_install(record).await.unwrap();
    assert!(committed.is_active);
    assert_eq!(f.manager.usage().await.unwrap().consumed, 3);
}

#[tokio::test]
async fn test_settled_reservation_wakes_waiter() {
    let store = Arc::new(RecordStore::new());
    let mut host = ApplicationRecord::new("SideStore", HOST, "1.0");
    host.is_active = true;
    store.save(host).await.unwrap();
    let mut b = ApplicationRecord::new("b", "com.b", "1.0");
    b.is_active = true;
    store.save(b.clone()).await.unwrap();
    store.save(ApplicationRecord::new("c", "com.c", "1.0")).await.unwrap();
    let manager = Arc::new(ActivationSlotManager::new(
        store.clone(),
        Arc::new(SimulatedDevice::new()),
        SlotLedger::new(SlotCapacity::Limited(3), true),
        HOST,
        Arc::new(InFlightRegistry::new()),
    ));

    // 重装的新版本带一个扩展：差额 1 个槽位占满账本
    manager.reserve_install("com.b", 2).await.unwrap();
    assert_eq!(manager.usage().await.unwrap().consumed, 3);

    let waiter = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.activate("com.c", EvictionPolicy::WaitForSlot).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());

    // 最终安装的版本没有扩展，结清预留后腾出一个槽位
    manager.commit_install(b).await.unwrap();

    let record = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(record.is_active);
    assert_eq!(manager.usage().await.unwrap().consumed, 3);
}

#[tokio::test]
async fn test_external_store_deactivation_wakes_waiter() {
    let f = fixture(SimulatedDevice::new()).await;

    let waiter = {
        let manager = Arc::clone(&f.manager);
        tokio::spawn(async move { manager.activate("com.d", EvictionPolicy::WaitForSlot).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());

    // 绕过管理器直接改写记录，例如另一进程同步下来的状态
    let mut c = f.store.load("com.c").await.unwrap().unwrap();
    c.is_active = false;
    f.store.save(c).await.unwrap();

    let record = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(record.is_active);
    assert_eq!(active_cost(&f.store).await, 3);
}
