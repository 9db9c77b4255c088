//! Integration tests for pool reconciliation.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use warmpool_manager::platform::{BuildScript, Operation};
use warmpool_manager::{
    BuildLogSink, MockPlatform, PoolReconciler, ProvisionError, Provisioner, ReconcileError,
    ReconcilerConfig,
};
use warmpool_naming::Phase;
use warmpool_reconcile::{FailurePolicy, PoolTarget};

fn config(desired_idle: u32, batch_size: u32, failure_policy: FailurePolicy) -> ReconcilerConfig {
    ReconcilerConfig {
        target: PoolTarget {
            desired_idle,
            batch_size,
        },
        check_interval: Duration::from_millis(20),
        failure_policy,
    }
}

fn reconciler(mock: &MockPlatform, template: &tempfile::TempDir, config: ReconcilerConfig) -> PoolReconciler {
    PoolReconciler::new(
        Arc::new(mock.clone()),
        common::provisioner(mock, template),
        config,
    )
}

fn idle_count(mock: &MockPlatform) -> usize {
    let codec = common::codec();
    mock.instance_names()
        .iter()
        .filter_map(|name| codec.decode(name))
        .filter(|name| name.phase == Phase::Idle && codec.is_current(name))
        .count()
}

#[tokio::test]
async fn test_tick_launches_batch_bounded_deficit() {
    let mock = MockPlatform::new();
    mock.seed_owned(&common::pool_name(Phase::Idle, "001"));
    mock.seed_owned(&common::pool_name(Phase::Idle, "001"));
    let template = common::template();
    let reconciler = reconciler(&mock, &template, config(5, 2, FailurePolicy::FailFast));

    let report = reconciler.tick(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.idle_current, 2);
    assert_eq!(report.launched, 2);
    assert_eq!(report.succeeded, 2);
    assert_eq!(report.failed, 0);
    assert_eq!(mock.count(Operation::CreateInstance), 2);
    assert_eq!(idle_count(&mock), 4);
}

#[tokio::test]
async fn test_full_pool_launches_nothing() {
    let mock = MockPlatform::new();
    for _ in 0..3 {
        mock.seed_owned(&common::pool_name(Phase::Idle, "001"));
    }
    let template = common::template();
    let reconciler = reconciler(&mock, &template, config(2, 2, FailurePolicy::FailFast));

    let report = reconciler.tick(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.idle_current, 3);
    assert_eq!(report.launched, 0);
    assert_eq!(mock.count(Operation::CreateInstance), 0);
}

#[tokio::test]
async fn test_only_current_idle_counts() {
    let mock = MockPlatform::new();
    mock.seed_owned(&common::pool_name(Phase::Idle, "000"));
    mock.seed_owned(&common::pool_name(Phase::Building, "001"));
    mock.seed_owned(&common::pool_name(Phase::Claimed, "001"));
    mock.seed_owned("someone-elses-app");
    let template = common::template();
    let reconciler = reconciler(&mock, &template, config(1, 2, FailurePolicy::FailFast));

    let report = reconciler.tick(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.idle_current, 0);
    assert_eq!(report.idle_other, 1);
    assert_eq!(report.launched, 1);
    assert_eq!(idle_count(&mock), 1);
}

#[tokio::test]
async fn test_fail_fast_rolls_back_siblings() {
    let mock = MockPlatform::new();
    mock.script_builds([
        BuildScript::Fail { after_polls: 0 },
        BuildScript::Pending,
        BuildScript::Pending,
    ]);
    let template = common::template();
    let reconciler = reconciler(&mock, &template, config(3, 3, FailurePolicy::FailFast));

    let err = reconciler.tick(&CancellationToken::new()).await.unwrap_err();

    match err {
        ReconcileError::Provision { report, first } => {
            assert_eq!(report.launched, 3);
            assert_eq!(report.succeeded, 0);
            assert_eq!(report.failed, 3);
            assert!(matches!(first, ProvisionError::BuildFailed { .. }));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(mock.count(Operation::DeleteInstance), 3);
    assert!(mock.instances().is_empty());
}

#[tokio::test]
async fn test_isolate_keeps_successful_siblings() {
    let mock = MockPlatform::new();
    mock.script_builds([
        BuildScript::Fail { after_polls: 0 },
        BuildScript::Succeed { after_polls: 2 },
        BuildScript::Succeed { after_polls: 2 },
    ]);
    let template = common::template();
    let reconciler = reconciler(&mock, &template, config(3, 3, FailurePolicy::Isolate));

    let err = reconciler.tick(&CancellationToken::new()).await.unwrap_err();

    let report = err.report().cloned().unwrap();
    assert_eq!(report.succeeded, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(mock.count(Operation::DeleteInstance), 1);
    assert_eq!(idle_count(&mock), 2);
}

#[tokio::test]
async fn test_list_failure_launches_nothing() {
    let mock = MockPlatform::new();
    mock.fail_on(Operation::ListOwnedInstances);
    let template = common::template();
    let reconciler = reconciler(&mock, &template, config(2, 2, FailurePolicy::FailFast));

    let err = reconciler.tick(&CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, ReconcileError::List(_)));
    assert!(err.report().is_none());
    assert_eq!(mock.count(Operation::CreateInstance), 0);
}

#[tokio::test]
async fn test_run_fills_pool_across_ticks() {
    let mock = MockPlatform::new();
    let template = common::template();
    let reconciler = reconciler(&mock, &template, config(3, 1, FailurePolicy::FailFast));
    let shutdown = CancellationToken::new();

    let handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { reconciler.run(shutdown).await }
    });

    tokio::time::timeout(Duration::from_secs(10), async {
        while idle_count(&mock) < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("pool never filled");

    shutdown.cancel();
    handle.await.unwrap();

    // Each tick launches at most one run, and nothing overshoots the target
    assert_eq!(mock.count(Operation::CreateInstance), 3);
    assert_eq!(idle_count(&mock), 3);
}

#[tokio::test]
async fn test_run_survives_failed_ticks() {
    let mock = MockPlatform::new();
    mock.fail_once(Operation::ListOwnedInstances);
    let template = common::template();
    let reconciler = reconciler(&mock, &template, config(1, 1, FailurePolicy::FailFast));
    let shutdown = CancellationToken::new();

    let handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { reconciler.run(shutdown).await }
    });

    tokio::time::timeout(Duration::from_secs(10), async {
        while idle_count(&mock) < 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("pool never filled");

    shutdown.cancel();
    handle.await.unwrap();
    assert!(mock.count(Operation::ListOwnedInstances) >= 2);
}

/// Panics on the first build log line it sees.
#[derive(Default)]
struct PanickingSink {
    tripped: AtomicBool,
}

impl BuildLogSink for PanickingSink {
    fn line(&self, _instance: &str, _line: &str) {
        if !self.tripped.swap(true, Ordering::SeqCst) {
            panic!("sink exploded");
        }
    }
}

#[tokio::test]
async fn test_panic_under_fail_fast_is_reported_as_panic() {
    let mock = MockPlatform::new();
    mock.set_default_build(BuildScript::Pending);
    let template = common::template();
    let provisioner = Provisioner::new(
        Arc::new(mock.clone()),
        common::codec(),
        common::provisioner_config(&template),
    )
    .with_sink(Arc::new(PanickingSink::default()));
    let reconciler = PoolReconciler::new(
        Arc::new(mock.clone()),
        Arc::new(provisioner),
        config(3, 3, FailurePolicy::FailFast),
    );

    let err = tokio::time::timeout(Duration::from_secs(5), reconciler.tick(&CancellationToken::new()))
        .await
        .unwrap()
        .unwrap_err();

    match err {
        ReconcileError::Panicked { report } => {
            assert_eq!(report.launched, 3);
            assert_eq!(report.succeeded, 0);
            assert_eq!(report.failed, 3);
        }
        other => panic!("unexpected error: {other}"),
    }

    // The panicked run's instance is deleted from its guard's drop
    tokio::time::timeout(Duration::from_secs(5), async {
        while !mock.instances().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}
