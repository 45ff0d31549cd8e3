//! Failure injection against real sockets and a real filesystem.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bulkhead::admission::NoopProbe;
use bulkhead::boundary::{CallError, CallOutcome, InvokeOptions};
use bulkhead::cache::DiskMode;
use bulkhead::resilience::CircuitState;
use bulkhead::Services;

mod common;

#[tokio::test]
async fn retries_until_backend_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let services = Services::build(common::test_config(dir.path()), Arc::new(NoopProbe));

    let served = Arc::new(AtomicU32::new(0));
    let counter = served.clone();
    let backend = common::start_programmable_backend(move |request| {
        let counter = counter.clone();
        async move {
            // First two connections are dropped without a reply.
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                None
            } else {
                Some(format!("echo:{request}"))
            }
        }
    })
    .await;

    let out = services
        .calls
        .invoke("echo", "ping".to_string(), InvokeOptions::new(), |payload, _| {
            common::roundtrip(backend, payload)
        })
        .await
        .unwrap();

    assert_eq!(out, CallOutcome::Completed("echo:ping".to_string()));
    assert_eq!(served.load(Ordering::SeqCst), 3);
    let stats = services.calls.stats();
    assert_eq!(stats[0].transport_failures, 2);
    assert_eq!(stats[0].successes, 1);
}

#[tokio::test]
async fn dead_backend_opens_breaker_and_fallback_takes_over() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = common::test_config(dir.path());
    config.calls.max_retries = 0;
    config.breaker.failure_threshold = 3;
    let services = Services::build(config, Arc::new(NoopProbe));
    let backend = common::dead_address().await;

    for _ in 0..3 {
        let err = services
            .calls
            .invoke("ledger", "ping".to_string(), InvokeOptions::new(), |payload, _| {
                common::roundtrip(backend, payload)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::TransportFailure { .. }));
    }
    assert_eq!(services.calls.breaker_state("ledger"), CircuitState::Open);

    let out = services
        .calls
        .invoke(
            "ledger",
            "ping".to_string(),
            InvokeOptions::new().fallback("cached".to_string()),
            |payload, _| common::roundtrip(backend, payload),
        )
        .await
        .unwrap();
    assert!(out.is_fallback());
    assert_eq!(services.calls.stats()[0].breaker_denied, 1);
}

#[tokio::test]
async fn slow_backend_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let services = Services::build(common::test_config(dir.path()), Arc::new(NoopProbe));
    let backend = common::start_programmable_backend(|_| async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Some("late".to_string())
    })
    .await;

    let err = services
        .calls
        .invoke(
            "slow",
            "ping".to_string(),
            InvokeOptions::new().timeout(Duration::from_millis(100)).max_retries(0),
            |payload, _| common::roundtrip(backend, payload),
        )
        .await
        .unwrap_err();
    assert_eq!(
        err,
        CallError::CallTimeout {
            channel: "slow".to_string(),
            timeout: Duration::from_millis(100),
        }
    );
}

#[tokio::test]
async fn cache_survives_disk_loss_and_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let services = Services::build(common::test_config(dir.path()), Arc::new(NoopProbe));
    let cache = &services.cache;

    cache.set("before", b"1".to_vec()).await;

    let disk = dir.path().join("disk");
    std::fs::remove_dir_all(&disk).unwrap();
    std::fs::write(&disk, b"unplugged").unwrap();

    for i in 0..3 {
        cache.set(&format!("during-{i}"), vec![i]).await;
    }
    assert_eq!(cache.disk_mode(), DiskMode::MemoryOnly);
    assert!(!cache.recover_now().await);

    std::fs::remove_file(&disk).unwrap();
    assert!(cache.recover_now().await);
    assert_eq!(cache.disk_mode(), DiskMode::Normal);

    cache.set("after", b"2".to_vec()).await;
    assert_eq!(cache.get("after").await, Some(b"2".to_vec()));
    assert_eq!(cache.get("during-0").await, Some(vec![0]));
    assert!(dir.path().join("disk/warm/entries").read_dir().unwrap().count() >= 1);
}
