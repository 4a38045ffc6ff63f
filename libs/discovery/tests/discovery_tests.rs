#![allow(clippy::unwrap_used, clippy::expect_used)]

//! End-to-end registration and discovery over the in-memory store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use discovery::store::{LeaseId, Snapshot, WatchStream};
use discovery::{
    CoordinationStore, DiscoveryError, LeasePublisher, MemoryStore, Operation, RegistrationConfig,
    ServiceValue, StoreError, Update, WatchConfig, Watcher, instance_key,
};
use parking_lot::Mutex;
use tokio::time::Instant;

const PREFIX: &str = "/services";

fn registration() -> RegistrationConfig {
    RegistrationConfig {
        renewal_interval: Duration::from_secs(1),
        lease_ttl: Duration::from_secs(3),
        ..RegistrationConfig::default()
    }
}

fn watch_config() -> WatchConfig {
    WatchConfig::default()
}

async fn next_batch(watcher: &mut Watcher) -> Vec<Update> {
    tokio::time::timeout(Duration::from_secs(30), watcher.next())
        .await
        .expect("timed out waiting for updates")
        .expect("watcher closed")
}

/// Collect updates until at least `n` have arrived.
async fn collect(watcher: &mut Watcher, n: usize) -> Vec<Update> {
    let mut updates = Vec::new();
    while updates.len() < n {
        updates.extend(next_batch(watcher).await);
    }
    updates
}

async fn assert_quiet(watcher: &mut Watcher) {
    let extra = tokio::time::timeout(Duration::from_secs(10), watcher.next()).await;
    assert!(extra.is_err(), "unexpected updates: {extra:?}");
}

fn ops(updates: &[Update]) -> Vec<(Operation, &str)> {
    updates.iter().map(|u| (u.op, u.addr.as_str())).collect()
}

async fn put_instance(store: &MemoryStore, service: &str, addr: &str) {
    store
        .put(
            &instance_key(PREFIX, service, addr),
            ServiceValue::new(addr).encode().unwrap(),
            None,
        )
        .await
        .unwrap();
}

async fn delete_instance(store: &MemoryStore, service: &str, addr: &str) {
    store.delete(&instance_key(PREFIX, service, addr)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn register_then_watch_yields_single_add() {
    let store = MemoryStore::new();
    let publisher = LeasePublisher::new(store.clone(), PREFIX, registration()).unwrap();
    publisher.register("svcA", "10.0.0.1:9000").unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let mut watcher = Watcher::new(store, PREFIX, "svcA", watch_config()).unwrap();
    let batch = next_batch(&mut watcher).await;
    assert_eq!(ops(&batch), vec![(Operation::Add, "10.0.0.1:9000")]);
}

#[tokio::test(start_paused = true)]
async fn deregister_emits_delete() {
    let store = MemoryStore::new();
    let publisher = LeasePublisher::new(store.clone(), PREFIX, registration()).unwrap();
    publisher.register("svcA", "10.0.0.1:9000").unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let mut watcher = Watcher::new(store.clone(), PREFIX, "svcA", watch_config()).unwrap();
    next_batch(&mut watcher).await;

    publisher.deregister("svcA", "10.0.0.1:9000").await.unwrap();
    let batch = next_batch(&mut watcher).await;
    assert_eq!(ops(&batch), vec![(Operation::Delete, "10.0.0.1:9000")]);
    assert!(publisher.registered_keys().is_empty());
    assert_quiet(&mut watcher).await;
}

#[tokio::test(start_paused = true)]
async fn lease_expiry_surfaces_as_delete() {
    let store = MemoryStore::new();
    let publisher = LeasePublisher::new(store.clone(), PREFIX, registration()).unwrap();
    publisher.register("svcA", "10.0.0.1:9000").unwrap();

    let mut watcher = Watcher::new(store.clone(), PREFIX, "svcA", watch_config()).unwrap();
    let added = next_batch(&mut watcher).await;
    assert_eq!(ops(&added), vec![(Operation::Add, "10.0.0.1:9000")]);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(publisher.stop_renewal("svcA", "10.0.0.1:9000"));

    let started = Instant::now();
    let removed = next_batch(&mut watcher).await;
    assert_eq!(ops(&removed), vec![(Operation::Delete, "10.0.0.1:9000")]);
    assert!(started.elapsed() <= Duration::from_secs(3));
    assert!(store.value(&instance_key(PREFIX, "svcA", "10.0.0.1:9000")).is_none());
}

#[tokio::test(start_paused = true)]
async fn shared_lease_expiry_removes_every_instance() {
    let store = MemoryStore::new();
    let lease = store.grant(5).await.unwrap();
    for addr in ["10.0.0.1:9000", "10.0.0.2:9000"] {
        store
            .put(
                &instance_key(PREFIX, "svcA", addr),
                ServiceValue::new(addr).encode().unwrap(),
                Some(lease),
            )
            .await
            .unwrap();
    }

    let mut watcher = Watcher::new(store.clone(), PREFIX, "svcA", watch_config()).unwrap();
    let added = collect(&mut watcher, 2).await;
    assert_eq!(
        ops(&added),
        vec![(Operation::Add, "10.0.0.1:9000"), (Operation::Add, "10.0.0.2:9000")]
    );

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(store.lease_count(), 0);

    let removed = collect(&mut watcher, 2).await;
    assert_eq!(
        ops(&removed),
        vec![(Operation::Delete, "10.0.0.1:9000"), (Operation::Delete, "10.0.0.2:9000")]
    );
    assert_quiet(&mut watcher).await;
}

#[tokio::test(start_paused = true)]
async fn watcher_ignores_other_services() {
    let store = MemoryStore::new();
    let mut watcher = Watcher::new(store.clone(), PREFIX, "svcA", watch_config()).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    put_instance(&store, "svcB", "10.0.0.2:9000").await;
    put_instance(&store, "svcAB", "10.0.0.3:9000").await;
    put_instance(&store, "svcA", "10.0.0.1:9000").await;

    let batch = next_batch(&mut watcher).await;
    assert_eq!(ops(&batch), vec![(Operation::Add, "10.0.0.1:9000")]);
    assert_quiet(&mut watcher).await;
}

#[tokio::test(start_paused = true)]
async fn churn_is_delivered_in_store_order() {
    let store = MemoryStore::new();
    put_instance(&store, "svcA", "a:1").await;
    let mut watcher = Watcher::new(store.clone(), PREFIX, "svcA", watch_config()).unwrap();
    next_batch(&mut watcher).await;

    delete_instance(&store, "svcA", "a:1").await;
    put_instance(&store, "svcA", "a:1").await;
    delete_instance(&store, "svcA", "a:1").await;
    put_instance(&store, "svcA", "b:1").await;

    let updates = collect(&mut watcher, 4).await;
    assert_eq!(
        ops(&updates),
        vec![
            (Operation::Delete, "a:1"),
            (Operation::Add, "a:1"),
            (Operation::Delete, "a:1"),
            (Operation::Add, "b:1"),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn re_registration_is_observed_once() {
    let store = MemoryStore::new();
    let publisher = LeasePublisher::new(store.clone(), PREFIX, registration()).unwrap();
    let mut watcher = Watcher::new(store.clone(), PREFIX, "svcA", watch_config()).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    publisher.register("svcA", "10.0.0.1:9000").unwrap();
    publisher.register("svcA", "10.0.0.1:9000").unwrap();

    let batch = next_batch(&mut watcher).await;
    assert_eq!(ops(&batch), vec![(Operation::Add, "10.0.0.1:9000")]);
    // Renewals keep rewriting the same value without producing updates.
    assert_quiet(&mut watcher).await;
    assert_eq!(publisher.registered_keys().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn metadata_is_delivered_with_add() {
    let store = MemoryStore::new();
    let publisher = LeasePublisher::new(store.clone(), PREFIX, registration()).unwrap();
    publisher
        .register_with_metadata(
            "svcA",
            "10.0.0.1:9000",
            Some(serde_json::json!({"zone": "eu-1"})),
        )
        .unwrap();

    let mut watcher = Watcher::new(store, PREFIX, "svcA", watch_config()).unwrap();
    let batch = next_batch(&mut watcher).await;
    assert_eq!(batch[0].metadata, Some(serde_json::json!({"zone": "eu-1"})));
}

#[tokio::test(start_paused = true)]
async fn reconnect_neither_loses_nor_replays_changes() {
    let store = MemoryStore::new();
    put_instance(&store, "svcA", "a:1").await;
    let mut watcher = Watcher::new(store.clone(), PREFIX, "svcA", watch_config()).unwrap();
    next_batch(&mut watcher).await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    store.sever_watches();
    put_instance(&store, "svcA", "b:1").await;
    delete_instance(&store, "svcA", "a:1").await;

    let updates = collect(&mut watcher, 2).await;
    assert_eq!(
        ops(&updates),
        vec![(Operation::Add, "b:1"), (Operation::Delete, "a:1")]
    );
    assert_quiet(&mut watcher).await;
}

#[tokio::test(start_paused = true)]
async fn compaction_triggers_resync() {
    let store = MemoryStore::new();
    put_instance(&store, "svcA", "a:1").await;
    let mut watcher = Watcher::new(store.clone(), PREFIX, "svcA", watch_config()).unwrap();
    next_batch(&mut watcher).await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    store.sever_watches();
    put_instance(&store, "svcA", "b:1").await;
    delete_instance(&store, "svcA", "a:1").await;
    store.compact(store.revision());

    let updates = collect(&mut watcher, 2).await;
    assert!(updates.contains(&Update::delete(ServiceValue::new("a:1"))));
    assert!(updates.contains(&Update::add(ServiceValue::new("b:1"))));
    assert_quiet(&mut watcher).await;
}

#[tokio::test(start_paused = true)]
async fn closed_watcher_drains_then_reports_closed() {
    let store = MemoryStore::new();
    put_instance(&store, "svcA", "a:1").await;
    let mut watcher = Watcher::new(store, PREFIX, "svcA", watch_config()).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    watcher.close();
    assert!(watcher.is_closed());
    let buffered = watcher.next().await.unwrap();
    assert_eq!(ops(&buffered), vec![(Operation::Add, "a:1")]);
    assert!(matches!(watcher.next().await, Err(DiscoveryError::WatcherClosed)));
    assert!(matches!(watcher.next().await, Err(DiscoveryError::WatcherClosed)));
}

/// Delegates to a [`MemoryStore`] and records when reads and watches start.
#[derive(Clone, Default)]
struct RecordingStore {
    inner: MemoryStore,
    reads: Arc<Mutex<Vec<Instant>>>,
    watches: Arc<Mutex<Vec<Instant>>>,
}

#[async_trait]
impl CoordinationStore for RecordingStore {
    async fn get_prefix(&self, prefix: &str) -> Result<Snapshot, StoreError> {
        self.reads.lock().push(Instant::now());
        self.inner.get_prefix(prefix).await
    }

    async fn grant(&self, ttl_seconds: i64) -> Result<LeaseId, StoreError> {
        self.inner.grant(ttl_seconds).await
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<(), StoreError> {
        self.inner.put(key, value, lease).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.inner.delete(key).await
    }

    async fn watch(&self, prefix: &str, from_revision: Option<i64>) -> Result<WatchStream, StoreError> {
        self.watches.lock().push(Instant::now());
        self.inner.watch(prefix, from_revision).await
    }
}

#[tokio::test(start_paused = true)]
async fn retry_delays_grow_linearly_up_to_ten_steps() {
    let store = RecordingStore::default();
    store.inner.set_unavailable(true);
    let _watcher = Watcher::new(store.clone(), PREFIX, "svcA", watch_config()).unwrap();

    tokio::time::sleep(Duration::from_secs(80)).await;

    let reads = store.reads.lock().clone();
    assert!(reads.len() >= 13, "only {} attempts", reads.len());
    let delays: Vec<u64> = reads
        .windows(2)
        .take(12)
        .map(|w| w[1].duration_since(w[0]).as_secs())
        .collect();
    assert_eq!(delays, vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 10, 10]);
}

/// Delay between the second forced disconnect and the following reconnect.
async fn second_reconnect_delay(reset_backoff_on_reconnect: bool) -> Duration {
    let store = RecordingStore::default();
    put_instance(&store.inner, "svcA", "a:1").await;
    let config = WatchConfig {
        reset_backoff_on_reconnect,
        ..WatchConfig::default()
    };
    let mut watcher = Watcher::new(store.clone(), PREFIX, "svcA", config).unwrap();
    next_batch(&mut watcher).await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    store.inner.sever_watches();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(store.watches.lock().len(), 2);

    let severed_at = Instant::now();
    store.inner.sever_watches();
    tokio::time::sleep(Duration::from_secs(5)).await;

    let watches = store.watches.lock().clone();
    assert_eq!(watches.len(), 3);
    watches[2].duration_since(severed_at)
}

#[tokio::test(start_paused = true)]
async fn backoff_keeps_growing_across_reconnects_by_default() {
    assert_eq!(second_reconnect_delay(false).await, Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn backoff_can_reset_after_reconnect() {
    assert_eq!(second_reconnect_delay(true).await, Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn dropping_publisher_stops_renewal() {
    let store = MemoryStore::new();
    let publisher = LeasePublisher::new(store.clone(), PREFIX, registration()).unwrap();
    publisher.register("svcA", "10.0.0.1:9000").unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    let key = instance_key(PREFIX, "svcA", "10.0.0.1:9000");
    assert!(store.value(&key).is_some());

    drop(publisher);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(store.value(&key).is_none());
}
