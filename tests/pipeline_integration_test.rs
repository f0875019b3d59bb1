//! 流水线集成测试

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::FutureExt;
use sideloader::core::{ErrorKind, WorkerPool};
use sideloader::pipeline::*;
use sideloader::progress::Progress;

#[derive(Debug, Default)]
struct Journal {
    ran: Vec<String>,
    cleaned: bool,
}

fn recording(id: &'static str) -> FnStage<Journal> {
    FnStage::new(move |cx: StageContext<Journal>, progress: Progress| {
        async move {
            progress.set_completed(50);
            cx.lock().await.ran.push(id.to_string());
            progress.complete();
            Outcome::Success(())
        }
        .boxed()
    })
}

fn failing(error: fn() -> ErrorKind) -> FnStage<Journal> {
    FnStage::new(move |_cx: StageContext<Journal>, progress: Progress| {
        async move {
            progress.set_completed(30);
            Outcome::Failure(error())
        }
        .boxed()
    })
}

#[tokio::test]
async fn test_success_runs_in_dependency_order() {
    let pipeline = PipelineBuilder::new("ordered")
        .stage("download", 20, recording("download"))
        .stage("unpack", 10, recording("unpack"))
        .stage("install", 70, recording("install"))
        .sequential("download", "unpack")
        .sequential("unpack", "install")
        .build(Journal::default())
        .unwrap();
    let handle = pipeline.handle();

    let journal = pipeline.run().await.into_result().unwrap();
    assert_eq!(journal.ran, vec!["download", "unpack", "install"]);
    assert_eq!(handle.status(), PipelineStatus::Completed);
    assert_eq!(handle.progress().fraction_completed(), 1.0);
}

#[tokio::test]
async fn test_failure_short_circuits_dependents() {
    let invoked = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&invoked);
    let dependent = FnStage::new(move |_cx: StageContext<Journal>, _p: Progress| {
        let flag = Arc::clone(&flag);
        async move {
            flag.store(true, Ordering::SeqCst);
            Outcome::Success(())
        }
        .boxed()
    });

    let pipeline = PipelineBuilder::new("short circuit")
        .stage("unpack", 10, failing(|| ErrorKind::InvalidBundle("corrupt".into())))
        .stage("install", 90, dependent)
        .sequential("unpack", "install")
        .build(Journal::default())
        .unwrap();
    let handle = pipeline.handle();

    let outcome = pipeline.run().await;
    assert!(matches!(outcome, Outcome::Failure(ErrorKind::InvalidBundle(_))));
    assert!(!invoked.load(Ordering::SeqCst));
    assert_eq!(handle.stage_state("unpack"), Some(StageState::Failed));
    assert_eq!(handle.stage_state("install"), Some(StageState::Skipped));
    assert_eq!(handle.status(), PipelineStatus::Failed);
    assert!(handle.progress().fraction_completed() < 1.0);
}

#[tokio::test]
async fn test_progress_never_decreases() {
    let stage = |delay: u64| {
        FnStage::new(move |_cx: StageContext<()>, progress: Progress| {
            async move {
                for step in 1..=4 {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    progress.set_completed(step * 25);
                }
                Outcome::Success(())
            }
            .boxed()
        })
    };

    let pipeline = PipelineBuilder::new("monotonic")
        .stage("a", 30, stage(5))
        .stage("b", 70, stage(3))
        .sequential("a", "b")
        .build(())
        .unwrap();
    let (handle, join) = pipeline.spawn();

    let samples = Arc::new(Mutex::new(Vec::new()));
    let sampler = {
        let samples = Arc::clone(&samples);
        let progress = handle.progress().clone();
        tokio::spawn(async move {
            loop {
                let fraction = progress.fraction_completed();
                samples.lock().unwrap().push(fraction);
                if fraction >= 1.0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
    };

    assert!(join.await.unwrap().is_success());
    tokio::time::timeout(Duration::from_secs(5), sampler).await.unwrap().unwrap();

    let samples = samples.lock().unwrap();
    assert!(samples.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(samples.last().copied(), Some(1.0));
}

#[tokio::test]
async fn test_cancel_runs_cleanup_and_completion_once() {
    let started = Arc::new(tokio::sync::Notify::new());
    let notify = Arc::clone(&started);
    let blocking = FnStage::new(move |cx: StageContext<Journal>, _p: Progress| {
        let notify = Arc::clone(&notify);
        async move {
            notify.notify_one();
            cx.cancel_token().cancelled().await;
            Outcome::Cancelled
        }
        .boxed()
    });

    let completions = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&completions);
    let cleaned = Arc::new(AtomicBool::new(false));
    let cleaned_flag = Arc::clone(&cleaned);

    let pipeline = PipelineBuilder::new("cancel")
        .stage("download", 20, blocking)
        .stage("install", 80, recording("install"))
        .sequential("download", "install")
        .cleanup(move |journal: &mut Journal| {
            journal.cleaned = true;
            cleaned_flag.store(true, Ordering::SeqCst);
        })
        .on_complete(move |outcome| {
            assert!(outcome.is_cancelled());
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .build(Journal::default())
        .unwrap();
    let (handle, join) = pipeline.spawn();

    started.notified().await;
    handle.cancel();

    let outcome = join.await.unwrap();
    assert!(outcome.is_cancelled());
    assert!(cleaned.load(Ordering::SeqCst));
    assert_eq!(completions.load(Ordering::SeqCst), 1);
    assert_eq!(handle.status(), PipelineStatus::Cancelled);
    assert_eq!(handle.stage_state("install"), Some(StageState::Skipped));
    assert!(handle.progress().fraction_completed() < 1.0);
}

#[tokio::test]
async fn test_external_token_cancels_before_start() {
    let token = tokio_util::sync::CancellationToken::new();
    token.cancel();

    let pipeline = PipelineBuilder::new("pre-cancelled")
        .stage("unpack", 10, recording("unpack"))
        .cancellation(token)
        .build(Journal::default())
        .unwrap();

    assert!(pipeline.run().await.is_cancelled());
}

#[tokio::test]
async fn test_panicking_stage_becomes_internal_failure() {
    let panicking = FnStage::new(|_cx: StageContext<Journal>, _p: Progress| {
        async { panic!("stage exploded") }.boxed()
    });
    let pipeline = PipelineBuilder::new("panic")
        .stage("sanitize", 5, panicking)
        .stage("install", 95, recording("install"))
        .sequential("sanitize", "install")
        .build(Journal::default())
        .unwrap();

    let outcome = pipeline.run().await;
    assert!(matches!(outcome, Outcome::Failure(ErrorKind::Internal(_))));
}

#[tokio::test]
async fn test_independent_stages_share_worker_pool() {
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let stage = || {
        let running = Arc::clone(&running);
        let peak = Arc::clone(&peak);
        FnStage::new(move |_cx: StageContext<()>, _p: Progress| {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Outcome::Success(())
            }
            .boxed()
        })
    };

    let pipeline = PipelineBuilder::new("fan out")
        .stage("a", 1, stage())
        .stage("b", 1, stage())
        .stage("c", 1, stage())
        .worker_pool(WorkerPool::new(2))
        .build(())
        .unwrap();

    assert!(pipeline.run().await.is_success());
    assert_eq!(peak.load(Ordering::SeqCst), 2);
}
