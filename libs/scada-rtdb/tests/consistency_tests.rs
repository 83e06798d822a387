//! Consistency tests for the variable store
//!
//! Covers write visibility, string-ID uniqueness, batch semantics and
//! subscription delivery through the public `VariableStorage` interface.

// Allow unwrap() in tests for cleaner test code
#![allow(clippy::disallowed_methods)]

use parking_lot::Mutex;
use scada_model::{QualityCode, Value, Variable, VariableUpdate};
use scada_rtdb::helpers::{create_test_storage, update_value};
use scada_rtdb::{MemoryStorage, RtdbError, VariableStorage};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn var(id: u64, device: &str, value: f64) -> Variable {
    Variable::new(id, format!("DV-{}-VAR{:06}", device, id), device).with_value(value)
}

/// Poll until `check` holds or the deadline passes
async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

// ============================================================================
// Read / Write
// ============================================================================

#[tokio::test]
async fn test_last_write_wins() {
    let storage = create_test_storage();
    for value in [1.0, 2.0, 3.0] {
        storage.write(var(100_001, "PLC001", value)).await.unwrap();
    }
    assert_eq!(storage.read(100_001).await.unwrap().value, Value::Float(3.0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_distinct_ids() {
    let storage = Arc::new(MemoryStorage::new());
    let mut handles = Vec::new();
    for writer in 0..8u64 {
        let storage = Arc::clone(&storage);
        handles.push(tokio::spawn(async move {
            for i in 0..100u64 {
                let id = 100_000 + writer * 100 + i;
                storage.write(var(id, "PLC001", id as f64)).await.unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(storage.stats().variable_count, 800);
    let v = storage.read(100_742).await.unwrap();
    assert_eq!(v.value, Value::Float(100_742.0));
}

#[tokio::test]
async fn test_missing_variable() {
    let storage = create_test_storage();
    let err = storage.read(424_242).await.unwrap_err();
    assert!(matches!(err, RtdbError::NotFound(424_242)));

    let err = storage.read_by_string_id("DV-NOPE-VAR").await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_batch_read_skips_missing() {
    let storage = create_test_storage();
    storage.write(var(100_001, "PLC001", 1.0)).await.unwrap();
    storage.write(var(100_003, "PLC001", 3.0)).await.unwrap();

    let vars = storage
        .read_batch(&[100_001, 100_002, 100_003])
        .await
        .unwrap();
    assert_eq!(vars.len(), 2);
    assert_eq!(vars[0].id, 100_001);
    assert_eq!(vars[1].id, 100_003);

    assert!(storage.read_batch(&[]).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_string_id_is_unique() {
    let storage = create_test_storage();
    storage
        .write(Variable::new(100_001, "DV-PLC001-TEMP", "PLC001"))
        .await
        .unwrap();

    let err = storage
        .create_variable(Variable::new(100_002, "DV-PLC001-TEMP", "PLC001"))
        .await
        .unwrap_err();
    assert!(matches!(err, RtdbError::DuplicateStringId { existing: 100_001, .. }));

    // Rewriting the owner with the same string ID is fine
    storage
        .write(Variable::new(100_001, "DV-PLC001-TEMP", "PLC001").with_value(9.0))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_delete_frees_string_id() {
    let storage = create_test_storage();
    let id = storage
        .create_variable(Variable::new(0, "DV-PLC001-TEMP", "PLC001"))
        .await
        .unwrap();
    storage.delete_variable(id).await.unwrap();

    let new_id = storage
        .create_variable(Variable::new(200_000, "DV-PLC001-TEMP", "PLC001"))
        .await
        .unwrap();
    assert_eq!(new_id, 200_000);
    assert_eq!(
        storage.read_by_string_id("DV-PLC001-TEMP").await.unwrap().id,
        200_000
    );
}

#[tokio::test]
async fn test_update_value_helper() {
    let storage = create_test_storage();
    storage.write(var(100_001, "PLC001", 1.0)).await.unwrap();

    update_value(storage.as_ref(), 100_001, 42.5, QualityCode::Bad)
        .await
        .unwrap();
    let v = storage.read(100_001).await.unwrap();
    assert_eq!(v.value, Value::Float(42.5));
    assert_eq!(v.quality, QualityCode::Bad);

    assert!(update_value(storage.as_ref(), 999_999, 1.0, QualityCode::Good)
        .await
        .is_err());
}

// ============================================================================
// Subscriptions
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_subscribe_then_write_delivers() {
    let storage = create_test_storage();
    storage.start().await.unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    storage
        .subscribe(
            "hmi",
            &[100_001],
            Arc::new(move |u: VariableUpdate| sink.lock().push(u)),
        )
        .unwrap();

    storage.write(var(100_001, "PLC001", 7.0)).await.unwrap();
    storage.write(var(100_002, "PLC001", 8.0)).await.unwrap();

    assert!(wait_until(|| received.lock().len() == 1).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let got = received.lock().clone();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].variable_id, 100_001);
    assert_eq!(got[0].value, Value::Float(7.0));

    storage.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_device_and_pattern_subscriptions() {
    let storage = create_test_storage();
    storage.start().await.unwrap();

    let device_hits = Arc::new(AtomicUsize::new(0));
    let prefix_hits = Arc::new(AtomicUsize::new(0));
    let wildcard_hits = Arc::new(AtomicUsize::new(0));

    let d = Arc::clone(&device_hits);
    storage
        .subscribe_by_device(
            "dev",
            "PLC001",
            Arc::new(move |_: VariableUpdate| {
                d.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();
    let p = Arc::clone(&prefix_hits);
    storage
        .subscribe_by_pattern(
            "pre",
            "DV-PLC002-",
            Arc::new(move |_: VariableUpdate| {
                p.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();
    let w = Arc::clone(&wildcard_hits);
    storage
        .subscribe_by_pattern(
            "wild",
            "DV-*-VAR100002",
            Arc::new(move |_: VariableUpdate| {
                w.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

    storage.write(var(100_001, "PLC001", 1.0)).await.unwrap();
    storage.write(var(100_002, "PLC002", 2.0)).await.unwrap();
    storage.write(var(100_003, "PLC002", 3.0)).await.unwrap();

    assert!(
        wait_until(|| {
            device_hits.load(Ordering::SeqCst) == 1
                && prefix_hits.load(Ordering::SeqCst) == 2
                && wildcard_hits.load(Ordering::SeqCst) == 1
        })
        .await
    );

    storage.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unsubscribe_all_stops_delivery() {
    let storage = create_test_storage();
    storage.start().await.unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let h = Arc::clone(&hits);
    storage
        .subscribe(
            "alarm-1",
            &[100_001],
            Arc::new(move |_: VariableUpdate| {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

    storage.write(var(100_001, "PLC001", 1.0)).await.unwrap();
    assert!(wait_until(|| hits.load(Ordering::SeqCst) == 1).await);

    storage.unsubscribe_all("alarm-1").unwrap();
    assert_eq!(storage.stats().subscription_count, 0);

    storage.write(var(100_001, "PLC001", 2.0)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    storage.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_panicking_subscriber_does_not_affect_others() {
    let storage = create_test_storage();
    storage.start().await.unwrap();

    storage
        .subscribe(
            "bad",
            &[100_001],
            Arc::new(|_: VariableUpdate| panic!("subscriber bug")),
        )
        .unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let h = Arc::clone(&hits);
    storage
        .subscribe(
            "good",
            &[100_001],
            Arc::new(move |_: VariableUpdate| {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

    storage.write(var(100_001, "PLC001", 1.0)).await.unwrap();
    storage.write(var(100_001, "PLC001", 2.0)).await.unwrap();

    assert!(wait_until(|| hits.load(Ordering::SeqCst) == 2).await);
    assert!(wait_until(|| storage.stats().callback_panics == 2).await);
    assert_eq!(storage.read(100_001).await.unwrap().value, Value::Float(2.0));

    storage.stop().await.unwrap();
}
