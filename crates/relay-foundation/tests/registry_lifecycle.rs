//! Registry lifecycle tests driven through the mock adapter family.

mod common;

use std::time::Duration;

use common::mock_adapter::{MockFactory, mock_model};
use relay_foundation::{ModelRegistry, RegistryConfig};
use relay_kernel::{ModelId, ModelState, RelayError};

fn registry(factory: &MockFactory, config: RegistryConfig) -> ModelRegistry {
    ModelRegistry::new(config).with_factory(factory.shared())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_share_one_load() {
    let factory = MockFactory::builder()
        .load_delay(Duration::from_millis(50))
        .build();
    let registry = registry(&factory, RegistryConfig::default());
    let id = registry.register(mock_model("m1", 1024)).unwrap();

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let registry = registry.clone();
            let id = id.clone();
            tokio::spawn(async move { registry.ensure_loaded(&id).await })
        })
        .collect();

    let mut leases = Vec::new();
    for task in tasks {
        leases.push(task.await.unwrap().unwrap());
    }

    assert_eq!(factory.load_count("m1"), 1);
    assert_eq!(registry.state(&id), Some(ModelState::Ready));
    assert_eq!(registry.snapshot(&id).unwrap().active_refs, 8);
    assert!(leases.iter().all(|l| l.load_id() == leases[0].load_id()));

    drop(leases);
    assert_eq!(registry.snapshot(&id).unwrap().active_refs, 0);
    assert_eq!(registry.committed_mb(), 1024);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_share_one_failed_load() {
    let factory = MockFactory::builder()
        .load_delay(Duration::from_millis(50))
        .fail_load("broken", "weights corrupted")
        .build();
    let registry = registry(&factory, RegistryConfig::default());
    let id = registry.register(mock_model("broken", 1024)).unwrap();

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let registry = registry.clone();
            let id = id.clone();
            tokio::spawn(async move { registry.ensure_loaded(&id).await })
        })
        .collect();

    let mut errors = Vec::new();
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => panic!("load of a broken model succeeded"),
            Err(err) => errors.push(err),
        }
    }

    assert_eq!(factory.load_count("broken"), 1);
    assert!(
        errors
            .iter()
            .all(|e| matches!(e, RelayError::LoadError { reason, .. } if reason.contains("weights corrupted")))
    );
    assert!(errors.iter().all(|e| e.to_string() == errors[0].to_string()));
    assert_eq!(registry.state(&id), Some(ModelState::Failed));
    assert_eq!(registry.committed_mb(), 0);
}

#[tokio::test]
async fn models_in_use_are_never_evicted() {
    let factory = MockFactory::builder().build();
    let registry = registry(&factory, RegistryConfig::default().with_capacity_mb(2048));
    let a = registry.register(mock_model("a", 1536)).unwrap();
    let b = registry.register(mock_model("b", 1024)).unwrap();

    let lease = registry.ensure_loaded(&a).await.unwrap();
    let err = registry.ensure_loaded(&b).await.unwrap_err();
    match err {
        RelayError::CapacityExceeded {
            model,
            requested_mb,
            committed_mb,
            capacity_mb,
        } => {
            assert_eq!(model, b);
            assert_eq!(requested_mb, 1024);
            assert_eq!(committed_mb, 1536);
            assert_eq!(capacity_mb, 2048);
        }
        other => panic!("expected CapacityExceeded, got {other:?}"),
    }
    assert_eq!(registry.state(&a), Some(ModelState::Ready));
    assert_eq!(registry.state(&b), Some(ModelState::Registered));
    assert_eq!(factory.shutdown_count("a"), 0);

    // Once idle, `a` can make room.
    drop(lease);
    let _lease_b = registry.ensure_loaded(&b).await.unwrap();
    assert_eq!(registry.state(&a), Some(ModelState::Registered));
    assert_eq!(factory.shutdown_count("a"), 1);
    assert_eq!(registry.committed_mb(), 1024);
}

#[tokio::test]
async fn model_larger_than_capacity_is_rejected_without_eviction() {
    let factory = MockFactory::builder().build();
    let registry = registry(&factory, RegistryConfig::default().with_capacity_mb(1024));
    let small = registry.register(mock_model("small", 512)).unwrap();
    let huge = registry.register(mock_model("huge", 4096)).unwrap();

    drop(registry.ensure_loaded(&small).await.unwrap());
    let err = registry.ensure_loaded(&huge).await.unwrap_err();
    assert!(matches!(err, RelayError::CapacityExceeded { .. }));
    assert!(err.is_unsatisfiable());
    assert_eq!(registry.state(&small), Some(ModelState::Ready));
    assert_eq!(factory.load_count("huge"), 0);
}

#[tokio::test(start_paused = true)]
async fn load_timeout_returns_model_to_registered() {
    let factory = MockFactory::builder()
        .load_delay(Duration::from_secs(30))
        .build();
    let registry = registry(
        &factory,
        RegistryConfig::default().with_load_timeout(Duration::from_secs(2)),
    );
    let id = registry.register(mock_model("slow", 2048)).unwrap();

    let err = registry.ensure_loaded(&id).await.unwrap_err();
    assert!(matches!(err, RelayError::Fatal { .. }));
    assert!(err.to_string().contains("timed out"));
    assert_eq!(registry.state(&id), Some(ModelState::Registered));
    assert_eq!(registry.committed_mb(), 0);
    assert_eq!(registry.health().load_timeouts, 1);
}

#[tokio::test]
async fn failed_load_releases_capacity_and_records_cause() {
    let factory = MockFactory::builder()
        .fail_load("broken", "weights corrupted")
        .build();
    let registry = registry(&factory, RegistryConfig::default());
    let id = registry.register(mock_model("broken", 1024)).unwrap();

    let err = registry.ensure_loaded(&id).await.unwrap_err();
    match &err {
        RelayError::LoadError { model, reason } => {
            assert_eq!(model, &id);
            assert!(reason.contains("weights corrupted"));
        }
        other => panic!("expected LoadError, got {other:?}"),
    }
    assert_eq!(registry.state(&id), Some(ModelState::Failed));
    assert_eq!(registry.committed_mb(), 0);

    let events = registry.events_since(0);
    let last = events.last().unwrap();
    assert_eq!(last.to, ModelState::Failed);
    assert!(last.detail.as_deref().unwrap_or("").contains("weights corrupted"));
}

#[tokio::test]
async fn degraded_model_reloads_once_idle() {
    let factory = MockFactory::builder().build();
    let registry = registry(&factory, RegistryConfig::default());
    let id = registry.register(mock_model("m1", 1024)).unwrap();

    let lease = registry.ensure_loaded(&id).await.unwrap();
    registry.mark_degraded(&id, "engine crashed").unwrap();
    assert!(lease.is_revoked());
    assert_eq!(
        registry.snapshot(&id).unwrap().degraded_cause.as_deref(),
        Some("engine crashed")
    );

    // Still leased: no reload.
    assert!(registry.ensure_loaded(&id).await.is_err());

    drop(lease);
    let fresh = registry.ensure_loaded(&id).await.unwrap();
    assert!(!fresh.is_revoked());
    assert_eq!(registry.state(&id), Some(ModelState::Ready));
    assert_eq!(factory.load_count("m1"), 2);
    assert_eq!(factory.shutdown_count("m1"), 1);
    // A reload reuses the capacity it already held.
    assert_eq!(registry.committed_mb(), 1024);
}

#[tokio::test(start_paused = true)]
async fn unload_keeps_capacity_until_shutdown_finishes() {
    let factory = MockFactory::builder()
        .shutdown_delay(Duration::from_millis(200))
        .build();
    let registry = registry(&factory, RegistryConfig::default().with_capacity_mb(2048));
    let a = registry.register(mock_model("a", 1536)).unwrap();
    let b = registry.register(mock_model("b", 1024)).unwrap();
    drop(registry.ensure_loaded(&a).await.unwrap());

    let unloading = tokio::spawn({
        let registry = registry.clone();
        let a = a.clone();
        async move { registry.unload(&a).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(registry.state(&a), Some(ModelState::Unloading));
    assert_eq!(factory.shutdown_count("a"), 0);
    assert_eq!(registry.committed_mb(), 1536);
    let err = registry.ensure_loaded(&b).await.unwrap_err();
    assert!(matches!(err, RelayError::CapacityExceeded { committed_mb: 1536, .. }));

    assert!(unloading.await.unwrap().unwrap());
    assert_eq!(factory.shutdown_count("a"), 1);
    assert_eq!(registry.committed_mb(), 0);
    let _lease = registry.ensure_loaded(&b).await.unwrap();
    assert_eq!(registry.committed_mb(), 1024);
}

#[tokio::test]
async fn events_are_polled_incrementally() {
    let factory = MockFactory::builder().build();
    let registry = registry(&factory, RegistryConfig::default());
    let id = registry.register(mock_model("m1", 256)).unwrap();
    let cursor = registry.latest_event_id();

    drop(registry.ensure_loaded(&id).await.unwrap());
    registry.unload(&id).await.unwrap();

    let transitions: Vec<(ModelState, ModelState)> = registry
        .events_since(cursor)
        .iter()
        .map(|e| (e.from, e.to))
        .collect();
    assert_eq!(
        transitions,
        vec![
            (ModelState::Registered, ModelState::Loading),
            (ModelState::Loading, ModelState::Ready),
            (ModelState::Ready, ModelState::Unloading),
            (ModelState::Unloading, ModelState::Registered),
        ]
    );
    assert!(registry.events_since(registry.latest_event_id()).is_empty());
    assert!(
        registry
            .events_since(cursor)
            .iter()
            .all(|e| e.model_id == ModelId::new("m1"))
    );
}
