//! End-to-end locking behavior over the in-memory store

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use leasehold_core::{
    LockError, LockingOptions, LockingProvider, MemoryLockStore,
    options::MemoryStoreOptions,
};

fn provider(options: LockingOptions) -> Arc<LockingProvider> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let store = Arc::new(MemoryLockStore::new(MemoryStoreOptions::default()));
    Arc::new(LockingProvider::new(store, options).unwrap())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mutual_exclusion_under_contention() {
    let provider = provider(LockingOptions::default());

    let mut tasks = Vec::new();
    for i in 0..16 {
        let provider = provider.clone();
        tasks.push(tokio::spawn(async move {
            provider
                .try_acquire("contested", &format!("node-{i}"))
                .await
                .unwrap()
        }));
    }

    let mut handles = Vec::new();
    for task in tasks {
        if let Some(handle) = task.await.unwrap() {
            handles.push(handle);
        }
    }
    assert_eq!(handles.len(), 1, "exactly one requester may win");

    handles.pop().unwrap().release().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn release_notification_wakes_waiter_before_polling() {
    // Polling alone would take 10 seconds; only the release notification can
    // let the waiter in quickly
    let provider = provider(LockingOptions {
        request_polling_rate_ms: 10000,
        ..Default::default()
    });

    let holder = provider
        .try_acquire("resource", "holder")
        .await
        .unwrap()
        .unwrap();

    let waiter_provider = provider.clone();
    let waiter = tokio::spawn(async move {
        let started = Instant::now();
        let handle = waiter_provider
            .acquire(
                "resource",
                "waiter",
                Some(Duration::from_secs(5)),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        (handle, started.elapsed())
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    holder.release().await.unwrap();

    let (handle, waited) = waiter.await.unwrap();
    assert!(
        waited < Duration::from_secs(2),
        "waiter should be woken by the release notification, waited {waited:?}"
    );
    handle.release().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn acquire_times_out_with_info_and_no_dangling_pending() {
    let provider = provider(LockingOptions {
        request_polling_rate_ms: 20,
        ..Default::default()
    });

    let _holder = provider
        .try_acquire("resource", "holder")
        .await
        .unwrap()
        .unwrap();

    let started = Instant::now();
    let err = provider
        .acquire(
            "resource",
            "impatient",
            Some(Duration::from_millis(100)),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    match err {
        LockError::Timeout {
            requester,
            timeout,
            info,
        } => {
            assert_eq!(requester, "impatient");
            assert_eq!(timeout, Duration::from_millis(100));
            assert_eq!(info.owner.as_deref(), Some("holder"));
        }
        other => panic!("expected Timeout, got {other:?}"),
    }
    assert!(elapsed >= Duration::from_millis(90), "returned too early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(500), "returned too late: {elapsed:?}");

    // The pending entry must not linger after the timeout
    let info = provider.get_info("resource").await.unwrap();
    assert_eq!(info.pending_requests, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelled_acquire_is_not_a_timeout() {
    let provider = provider(LockingOptions {
        request_polling_rate_ms: 20,
        ..Default::default()
    });

    let _holder = provider
        .try_acquire("resource", "holder")
        .await
        .unwrap()
        .unwrap();

    let cancel = CancellationToken::new();
    let waiter_provider = provider.clone();
    let waiter_cancel = cancel.clone();
    let waiter = tokio::spawn(async move {
        waiter_provider
            .acquire("resource", "waiter", None, &waiter_cancel)
            .await
    });

    tokio::time::sleep(Duration::from_millis(60)).await;
    cancel.cancel();

    let err = waiter.await.unwrap().unwrap_err();
    match err {
        LockError::Cancelled {
            resource,
            requester,
        } => {
            assert_eq!(resource, "resource");
            assert_eq!(requester, "waiter");
        }
        other => panic!("expected Cancelled, got {other:?}"),
    }

    let info = provider.get_info("resource").await.unwrap();
    assert_eq!(info.pending_requests, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn expired_lease_becomes_stealable_on_schedule() {
    let provider = provider(LockingOptions {
        expiry_offset_ms: 150,
        request_polling_rate_ms: 20,
        ..Default::default()
    });

    let acquired_at = Instant::now();
    let _holder = provider
        .try_acquire("resource", "holder")
        .await
        .unwrap()
        .unwrap();

    // Well before the expiry the lease is not stealable
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(
        provider
            .try_acquire("resource", "thief")
            .await
            .unwrap()
            .is_none()
    );

    // A blocking acquire gets through once the lease lapses
    let handle = provider
        .acquire(
            "resource",
            "thief",
            Some(Duration::from_secs(2)),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert!(
        acquired_at.elapsed() >= Duration::from_millis(140),
        "lease was stolen before it expired"
    );
    handle.release().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sweep_reclaims_abandoned_lease_and_wakes_waiter() {
    // Polling is too slow to matter; only the sweep's release notification
    // can wake the waiter within the test window
    let provider = provider(LockingOptions {
        expiry_offset_ms: 100,
        cleanup_interval_ms: 100,
        request_polling_rate_ms: 10000,
        ..Default::default()
    });

    let abandoned = provider
        .try_acquire("resource", "holder")
        .await
        .unwrap()
        .unwrap();
    // Simulate a crashed holder: the handle must not release on drop
    std::mem::forget(abandoned);

    let handle = provider
        .acquire(
            "resource",
            "waiter",
            Some(Duration::from_secs(5)),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(handle.requester(), "waiter");
    handle.release().await.unwrap();
}
