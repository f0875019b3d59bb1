//! 编排器端到端测试（模拟设备）

mod common;

use std::sync::Arc;

use sideloader::config::AppConfig;
use sideloader::core::{ErrorKind, InFlightRegistry, Orchestrator};
use sideloader::device::{DeviceCall, SimulatedDevice, TransportError};
use sideloader::install::{AutoPrompt, ExtensionPrompt};
use sideloader::store::{ApplicationRecord, ApplicationStore, RecordStore};
use tempfile::TempDir;

const HOST: &str = "com.SideStore.SideStore";

struct Harness {
    orchestrator: Orchestrator,
    store: Arc<RecordStore>,
    device: Arc<SimulatedDevice>,
    config: AppConfig,
    dir: TempDir,
}

fn harness_with(device: SimulatedDevice, prompt: impl ExtensionPrompt + 'static) -> Harness {
    let dir = TempDir::new().unwrap();
    let mut config = AppConfig::default();
    config.app.data_dir = dir.path().join("data");
    config.pipeline.temp_dir = Some(dir.path().join("tmp"));
    config.slots.active_apps_limit = 10;

    let store = Arc::new(RecordStore::new());
    let device = Arc::new(device);
    let orchestrator = Orchestrator::new(
        config.clone(),
        store.clone(),
        device.clone(),
        Arc::new(prompt),
        Arc::new(InFlightRegistry::new()),
    );
    Harness {
        orchestrator,
        store,
        device,
        config,
        dir,
    }
}

fn harness() -> Harness {
    harness_with(SimulatedDevice::new(), AutoPrompt::keep())
}

async fn seed_active(store: &RecordStore, id: &str, name: &str) {
    let mut record = ApplicationRecord::new(name, id, "1.0");
    record.is_active = true;
    store.save(record).await.unwrap();
}

#[tokio::test]
async fn test_local_sideload_installs_and_cleans_up() {
    let h = harness();
    let ipa = common::build_ipa(h.dir.path(), "com.rileytestut.Delta", "Delta", false);

    let record = h.orchestrator.sideload(ipa.to_str().unwrap()).await.unwrap();
    assert_eq!(record.bundle_identifier, "com.rileytestut.Delta");
    assert_eq!(record.name, "Delta");
    assert!(record.is_active);
    assert_eq!(h.device.calls_for("com.rileytestut.Delta"), vec![DeviceCall::Install]);

    let stored = h.store.load("com.rileytestut.Delta").await.unwrap().unwrap();
    assert_eq!(stored, record);
    assert!(h
        .config
        .app
        .apps_dir()
        .join("com.rileytestut.Delta")
        .join("Delta.app")
        .join("Info.plist")
        .exists());
    assert!(common::is_empty_dir(&h.dir.path().join("tmp")));
}

#[tokio::test]
async fn test_remote_download_failure_skips_later_stages() {
    let h = harness();
    let mut notices = h.orchestrator.subscribe_notices();

    let err = h.orchestrator.sideload("http://127.0.0.1:9/app.ipa").await.unwrap_err();
    assert!(matches!(err, ErrorKind::TransportFailure(_)), "got {err:?}");
    assert!(h.device.calls().is_empty());
    assert!(h.store.all().await.unwrap().is_empty());
    assert!(common::is_empty_dir(&h.dir.path().join("tmp")));

    let notice = notices.try_recv().unwrap();
    assert_eq!(notice.title, "Failed to install http://127.0.0.1:9/app.ipa.");
}

#[tokio::test]
async fn test_missing_local_file_is_invalid_input() {
    let h = harness();
    let missing = h.dir.path().join("missing.ipa");
    let err = h.orchestrator.sideload(missing.to_str().unwrap()).await.unwrap_err();
    assert!(matches!(err, ErrorKind::InvalidInput(_)));
    assert!(h.device.calls().is_empty());
}

#[tokio::test]
async fn test_extension_prompt_cancel_is_silent() {
    let h = harness_with(SimulatedDevice::new(), AutoPrompt::cancel());
    let mut notices = h.orchestrator.subscribe_notices();
    let ipa = common::build_ipa(h.dir.path(), "com.example.widgets", "Widgets", true);

    let err = h.orchestrator.sideload(ipa.to_str().unwrap()).await.unwrap_err();
    assert!(matches!(err, ErrorKind::Cancelled));
    assert!(h.device.calls().is_empty());
    assert!(h.store.load("com.example.widgets").await.unwrap().is_none());
    assert!(notices.try_recv().is_err());
    assert!(common::is_empty_dir(&h.dir.path().join("tmp")));
}

#[tokio::test]
async fn test_extension_prompt_remove_strips_plugins() {
    let h = harness_with(SimulatedDevice::new(), AutoPrompt::remove());
    let ipa = common::build_ipa(h.dir.path(), "com.example.widgets", "Widgets", true);

    let record = h.orchestrator.sideload(ipa.to_str().unwrap()).await.unwrap();
    assert_eq!(record.extension_count, 0);
    let installed = h.config.app.apps_dir().join("com.example.widgets").join("Widgets.app");
    assert!(installed.join("Info.plist").exists());
    assert!(!installed.join("PlugIns").join("Widget.appex").exists());
}

#[tokio::test]
async fn test_extension_prompt_keep_counts_extensions() {
    let h = harness();
    let ipa = common::build_ipa(h.dir.path(), "com.example.widgets", "Widgets", true);

    let record = h.orchestrator.sideload(ipa.to_str().unwrap()).await.unwrap();
    assert_eq!(record.extension_count, 1);
}

#[tokio::test]
async fn test_refresh_reports_partial_failure_once() {
    let h = harness();
    let mut notices = h.orchestrator.subscribe_notices();
    let ids: Vec<String> = (1..=5).map(|i| format!("com.app{i}")).collect();
    for (i, id) in ids.iter().enumerate() {
        seed_active(&h.store, id, &format!("App {}", i + 1)).await;
    }
    h.device.inject_failure(
        "com.app3",
        DeviceCall::Refresh,
        TransportError::Rejected {
            code: -22411,
            message: "certificate revoked".to_string(),
        },
    );

    let results = h.orchestrator.refresh(&ids).await.unwrap();
    assert_eq!(results.len(), 5);
    assert_eq!(results.values().filter(|r| r.is_ok()).count(), 4);
    assert!(matches!(results["com.app3"], Err(ErrorKind::TransportFailure(_))));

    let notice = notices.try_recv().unwrap();
    assert_eq!(notice.title, "Failed to refresh 1 app.");
    assert!(notice.detail.contains("certificate revoked"));
    assert!(notices.try_recv().is_err());
}

#[tokio::test]
async fn test_refresh_all_puts_host_last() {
    let h = harness();
    seed_active(&h.store, HOST, "SideStore").await;
    seed_active(&h.store, "com.app1", "App 1").await;
    seed_active(&h.store, "com.app2", "App 2").await;
    h.store.save(ApplicationRecord::new("Idle", "com.idle", "1.0")).await.unwrap();

    let results = h.orchestrator.refresh_all().await.unwrap();
    assert_eq!(results.len(), 3);
    assert!(!results.contains_key("com.idle"));

    let calls = h.device.calls();
    assert_eq!(calls.last(), Some(&(DeviceCall::Refresh, HOST.to_string())));
}

#[tokio::test]
async fn test_unreachable_device_fails_fast() {
    let h = harness();
    seed_active(&h.store, "com.app1", "App 1").await;
    h.store.save(ApplicationRecord::new("App 2", "com.app2", "1.0")).await.unwrap();
    h.device.set_reachable(false);
    let mut notices = h.orchestrator.subscribe_notices();

    let err = h
        .orchestrator
        .activate("com.app2", sideloader::slots::EvictionPolicy::None)
        .await
        .unwrap_err();
    assert!(matches!(err, ErrorKind::DeviceUnreachable));
    assert_eq!(notices.try_recv().unwrap().title, "Failed to activate com.app2.");

    assert!(matches!(
        h.orchestrator.refresh(&["com.app1".to_string()]).await,
        Err(ErrorKind::DeviceUnreachable)
    ));
    assert!(h.device.calls().is_empty());
}

#[tokio::test]
async fn test_enable_debugging_depends_on_os_version() {
    let h = harness_with(SimulatedDevice::new().with_os_version(17, 0, 0), AutoPrompt::keep());
    seed_active(&h.store, "com.app1", "App 1").await;
    let err = h.orchestrator.enable_debugging("com.app1").await.unwrap_err();
    assert!(matches!(err, ErrorKind::Unsupported(_)));
    assert!(h.device.calls().is_empty());

    let h = harness();
    seed_active(&h.store, "com.app1", "App 1").await;
    h.orchestrator.enable_debugging("com.app1").await.unwrap();
    assert_eq!(h.device.calls_for("com.app1"), vec![DeviceCall::DebugEnable]);
}

#[tokio::test]
async fn test_remove_deactivates_and_deletes() {
    let h = harness();
    let ipa = common::build_ipa(h.dir.path(), "com.rileytestut.Delta", "Delta", false);
    h.orchestrator.sideload(ipa.to_str().unwrap()).await.unwrap();

    let removed = h.orchestrator.remove("com.rileytestut.Delta").await.unwrap();
    assert_eq!(removed.bundle_identifier, "com.rileytestut.Delta");
    assert!(h.store.load("com.rileytestut.Delta").await.unwrap().is_none());
    assert!(!h.config.app.apps_dir().join("com.rileytestut.Delta").exists());
    assert_eq!(
        h.device.calls_for("com.rileytestut.Delta"),
        vec![DeviceCall::Install, DeviceCall::Deactivate]
    );
}

#[tokio::test]
async fn test_host_cannot_be_removed_or_deactivated() {
    let h = harness();
    seed_active(&h.store, HOST, "SideStore").await;

    assert!(matches!(h.orchestrator.remove(HOST).await, Err(ErrorKind::InvalidInput(_))));
    assert!(matches!(h.orchestrator.deactivate(HOST).await, Err(ErrorKind::InvalidInput(_))));
    assert!(h.store.load(HOST).await.unwrap().unwrap().is_active);
}

#[tokio::test]
async fn test_restore_requires_active_app() {
    let h = harness();
    h.store.save(ApplicationRecord::new("App 1", "com.app1", "1.0")).await.unwrap();
    assert!(matches!(
        h.orchestrator.restore("com.app1").await,
        Err(ErrorKind::InvalidInput(_))
    ));

    h.orchestrator.backup("com.app1").await.unwrap();
    assert_eq!(h.device.calls_for("com.app1"), vec![DeviceCall::Backup]);
}

#[tokio::test]
async fn test_views_list_active_first() {
    let h = harness();
    h.store.save(ApplicationRecord::new("Idle", "com.idle", "1.0")).await.unwrap();
    seed_active(&h.store, "com.app1", "App 1").await;

    let views = h.orchestrator.views().await.unwrap();
    assert_eq!(views.len(), 2);
    assert_eq!(views[0].bundle_identifier, "com.app1");
    assert_eq!(views[1].bundle_identifier, "com.idle");
}

#[tokio::test]
async fn test_concurrent_sideloads_of_same_app_are_single_flight() {
    let h = harness_with(
        SimulatedDevice::new().with_latency(std::time::Duration::from_millis(300)),
        AutoPrompt::keep(),
    );
    let first_dir = h.dir.path().join("first");
    let second_dir = h.dir.path().join("second");
    std::fs::create_dir_all(&first_dir).unwrap();
    std::fs::create_dir_all(&second_dir).unwrap();
    let first = common::build_ipa(&first_dir, "com.rileytestut.Delta", "Delta", false);
    let second = common::build_ipa(&second_dir, "com.rileytestut.Delta", "Delta", false);

    let (a, b) = tokio::join!(
        h.orchestrator.sideload(first.to_str().unwrap()),
        h.orchestrator.sideload(second.to_str().unwrap()),
    );
    let (ok, err) = match (a, b) {
        (Ok(record), Err(e)) | (Err(e), Ok(record)) => (record, e),
        other => panic!("expected exactly one success, got {other:?}"),
    };
    assert_eq!(ok.bundle_identifier, "com.rileytestut.Delta");
    assert!(matches!(err, ErrorKind::InvalidInput(_)), "got {err:?}");
    assert_eq!(h.device.calls_for("com.rileytestut.Delta"), vec![DeviceCall::Install]);
    assert_eq!(h.orchestrator.slots().usage().await.unwrap().consumed, 1);
    assert!(common::is_empty_dir(&h.dir.path().join("tmp")));
}
