mod common;

use common::{descriptor, Behaviour, MemoryFactory};
use futures::future::join_all;
use sharefs::session::SessionRegistry;
use sharefs::{AccessSettings, StorageError};
use std::sync::Arc;
use std::time::Duration;

fn registry(behaviour: Behaviour) -> (SessionRegistry, Arc<MemoryFactory>) {
    let factory = MemoryFactory::new(behaviour);
    (SessionRegistry::new(factory.clone(), AccessSettings::default()), factory)
}

fn slow() -> Behaviour {
    Behaviour {
        connect_delay: Duration::from_millis(50),
        ..Behaviour::default()
    }
}

#[tokio::test]
async fn test_concurrent_acquire_connects_once() {
    let (registry, factory) = registry(slow());
    let d = descriptor("files.local");

    let sessions = join_all((0..16).map(|_| registry.acquire(&d))).await;

    let first = sessions[0].as_ref().unwrap();
    for session in &sessions {
        assert!(Arc::ptr_eq(first, session.as_ref().unwrap()));
    }
    assert_eq!(factory.counters.connects(), 1);
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn test_concurrent_acquire_shares_one_failure() {
    let (registry, factory) = registry(Behaviour {
        connect_error: Some(StorageError::AuthenticationFailed),
        ..slow()
    });
    let d = descriptor("files.local");

    let results = join_all((0..8).map(|_| registry.acquire(&d))).await;

    for result in results {
        assert_eq!(result.unwrap_err(), StorageError::AuthenticationFailed);
    }
    assert_eq!(factory.counters.connects(), 1);
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_descriptors_differing_in_one_field_get_separate_sessions() {
    let (registry, factory) = registry(Behaviour::default());
    let plain = descriptor("files.local");
    let mut safe = plain.clone();
    safe.safe_transfer = true;

    let a = registry.acquire(&plain).await.unwrap();
    let b = registry.acquire(&safe).await.unwrap();

    assert!(!Arc::ptr_eq(&a, &b));
    assert_eq!(factory.counters.connects(), 2);
}

#[tokio::test]
async fn test_abandoned_caller_does_not_abort_connect() {
    let (registry, factory) = registry(Behaviour {
        connect_delay: Duration::from_millis(100),
        ..Behaviour::default()
    });
    let d = descriptor("files.local");

    let gave_up = tokio::time::timeout(Duration::from_millis(10), registry.acquire(&d)).await;
    assert!(gave_up.is_err());

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(registry.len(), 1);

    registry.acquire(&d).await.unwrap();
    assert_eq!(factory.counters.connects(), 1);
}

#[tokio::test]
async fn test_evict_during_connect_closes_the_late_session() {
    let (registry, factory) = registry(Behaviour {
        connect_delay: Duration::from_millis(50),
        ..Behaviour::default()
    });
    let d = descriptor("files.local");

    let pending = {
        let registry = registry.clone();
        let d = d.clone();
        tokio::spawn(async move { registry.acquire(&d).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    registry.evict(&d).await;

    let result = pending.await.unwrap();
    assert_eq!(result.unwrap_err(), StorageError::Cancelled);
    assert!(registry.is_empty());
    assert_eq!(factory.counters.disconnects(), 1);
}

#[tokio::test]
async fn test_evict_all_is_idempotent() {
    let (registry, factory) = registry(Behaviour::default());
    for host in ["a", "b", "c"] {
        registry.acquire(&descriptor(host)).await.unwrap();
    }

    registry.evict_all().await;
    registry.evict_all().await;
    registry.evict(&descriptor("a")).await;

    assert!(registry.is_empty());
    assert_eq!(factory.counters.disconnects(), 3);
}

#[tokio::test]
async fn test_maintenance_reaps_idle_sessions() {
    let factory = MemoryFactory::new(Behaviour::default());
    let settings = AccessSettings {
        idle_timeout_secs: 0,
        ..AccessSettings::default()
    };
    let registry = SessionRegistry::new(factory.clone(), settings);
    registry.acquire(&descriptor("a")).await.unwrap();

    let task = registry.spawn_maintenance(Duration::from_millis(20));
    tokio::time::sleep(Duration::from_millis(100)).await;
    task.abort();

    assert!(registry.is_empty());
    assert_eq!(factory.counters.disconnects(), 1);
}
