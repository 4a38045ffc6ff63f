//! In-process [`CoordinationStore`].
//!
//! Linearizable by construction (one mutex), with a store-wide revision counter,
//! leases that expire on the tokio clock and a revision history used to replay
//! watches. Used by tests and for local development without etcd.
//!
//! History is bounded: once it holds more than the configured number of
//! batches, the oldest are compacted away as etcd's auto-compaction would, and
//! watches starting before them fail with [`StoreError::Compacted`].

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use super::{
    CoordinationStore, EventKind, KeyValue, LeaseId, Snapshot, WatchBatch, WatchEvent,
    WatchStream,
};
use crate::error::StoreError;

const WATCH_CHANNEL_CAPACITY: usize = 1024;
/// Default number of committed revisions kept for watch replay.
const DEFAULT_HISTORY_LIMIT: usize = 10_000;

/// In-memory coordination store. Clones share the same data.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    changes: broadcast::Sender<Arc<WatchBatch>>,
}

struct State {
    revision: i64,
    compact_revision: i64,
    kvs: BTreeMap<String, KeyValue>,
    leases: HashMap<LeaseId, BTreeSet<String>>,
    next_lease: LeaseId,
    history: VecDeque<Arc<WatchBatch>>,
    history_limit: usize,
    severed: CancellationToken,
    unavailable: bool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("MemoryStore")
            .field("revision", &state.revision)
            .field("keys", &state.kvs.len())
            .field("leases", &state.leases.len())
            .finish_non_exhaustive()
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    /// Store that keeps at most `limit` revisions (at least one) for watch replay.
    /// [`MemoryStore::new`] keeps 10 000.
    #[must_use]
    pub fn with_history_limit(limit: usize) -> Self {
        let (changes, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    revision: 0,
                    compact_revision: 0,
                    kvs: BTreeMap::new(),
                    leases: HashMap::new(),
                    next_lease: 0,
                    history: VecDeque::new(),
                    history_limit: limit.max(1),
                    severed: CancellationToken::new(),
                    unavailable: false,
                }),
                changes,
            }),
        }
    }

    /// Current store revision.
    #[must_use]
    pub fn revision(&self) -> i64 {
        self.inner.state.lock().revision
    }

    /// Number of leases that have been granted and not yet expired.
    #[must_use]
    pub fn lease_count(&self) -> usize {
        self.inner.state.lock().leases.len()
    }

    /// Raw value stored at `key`.
    #[must_use]
    pub fn value(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.state.lock().kvs.get(key).map(|kv| kv.value.clone())
    }

    /// Terminate every open watch stream with an error, as a dropped connection would.
    pub fn sever_watches(&self) {
        let mut state = self.inner.state.lock();
        let old = std::mem::replace(&mut state.severed, CancellationToken::new());
        old.cancel();
    }

    /// While unavailable every operation fails and open watches are severed.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.state.lock().unavailable = unavailable;
        if unavailable {
            self.sever_watches();
        }
    }

    /// Drop history up to and including `revision`; older watch starts fail.
    pub fn compact(&self, revision: i64) {
        let mut state = self.inner.state.lock();
        let revision = revision.min(state.revision);
        state.history.retain(|batch| batch.revision > revision);
        state.compact_revision = state.compact_revision.max(revision);
    }

    fn check_available(state: &State) -> Result<(), StoreError> {
        if state.unavailable {
            Err(StoreError::Unavailable("memory store marked unavailable".to_owned()))
        } else {
            Ok(())
        }
    }
}

impl Inner {
    fn commit(&self, state: &mut State, events: Vec<WatchEvent>) {
        let batch = Arc::new(WatchBatch {
            revision: state.revision,
            events,
        });
        state.history.push_back(Arc::clone(&batch));
        while state.history.len() > state.history_limit {
            if let Some(oldest) = state.history.pop_front() {
                state.compact_revision = state.compact_revision.max(oldest.revision);
            }
        }
        let receivers = self.changes.send(batch).unwrap_or(0);
        tracing::trace!(revision = state.revision, receivers, "change committed");
    }

    fn unbind(state: &mut State, key: &str, lease: LeaseId) {
        if lease == 0 {
            return;
        }
        if let Some(keys) = state.leases.get_mut(&lease) {
            keys.remove(key);
        }
    }

    fn expire(&self, lease: LeaseId) {
        let mut state = self.state.lock();
        let Some(keys) = state.leases.remove(&lease) else {
            return;
        };
        if keys.is_empty() {
            return;
        }

        state.revision += 1;
        let revision = state.revision;
        let events = keys
            .into_iter()
            .filter_map(|key| {
                let prev = state.kvs.remove(&key)?;
                Some(WatchEvent {
                    kind: EventKind::Delete,
                    kv: KeyValue {
                        key,
                        value: Vec::new(),
                        mod_revision: revision,
                        lease: 0,
                    },
                    prev_kv: Some(prev),
                })
            })
            .collect::<Vec<_>>();
        tracing::debug!(lease, revision, removed = events.len(), "lease expired");
        self.commit(&mut state, events);
    }
}

fn spawn_expiry(inner: Weak<Inner>, lease: LeaseId, ttl: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(ttl).await;
        if let Some(inner) = inner.upgrade() {
            inner.expire(lease);
        }
    });
}

struct WatchCursor {
    prefix: String,
    replay: VecDeque<WatchBatch>,
    changes: broadcast::Receiver<Arc<WatchBatch>>,
    severed: CancellationToken,
    last_revision: i64,
    finished: bool,
}

enum Next {
    Severed,
    Received(Result<Arc<WatchBatch>, RecvError>),
}

impl WatchCursor {
    async fn next_batch(&mut self) -> Option<Result<WatchBatch, StoreError>> {
        if self.finished {
            return None;
        }
        if let Some(batch) = self.replay.pop_front() {
            return Some(Ok(batch));
        }
        loop {
            let next = tokio::select! {
                biased;
                () = self.severed.cancelled() => Next::Severed,
                received = self.changes.recv() => Next::Received(received),
            };
            match next {
                Next::Severed => {
                    self.finished = true;
                    return Some(Err(StoreError::Unavailable(
                        "watch stream severed".to_owned(),
                    )));
                }
                Next::Received(Ok(batch)) => {
                    if batch.revision <= self.last_revision {
                        continue;
                    }
                    self.last_revision = batch.revision;
                    if let Some(filtered) = batch.retain_prefix(&self.prefix) {
                        return Some(Ok(filtered));
                    }
                }
                Next::Received(Err(RecvError::Lagged(skipped))) => {
                    self.finished = true;
                    return Some(Err(StoreError::WatchClosed(format!(
                        "watcher fell behind by {skipped} batches"
                    ))));
                }
                Next::Received(Err(RecvError::Closed)) => return None,
            }
        }
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get_prefix(&self, prefix: &str) -> Result<Snapshot, StoreError> {
        let state = self.inner.state.lock();
        Self::check_available(&state)?;
        let entries = state
            .kvs
            .range(prefix.to_owned()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(_, kv)| kv.clone())
            .collect();
        Ok(Snapshot {
            entries,
            revision: state.revision,
        })
    }

    async fn grant(&self, ttl_seconds: i64) -> Result<LeaseId, StoreError> {
        let lease = {
            let mut state = self.inner.state.lock();
            Self::check_available(&state)?;
            state.next_lease += 1;
            let lease = state.next_lease;
            state.leases.insert(lease, BTreeSet::new());
            lease
        };
        let ttl = Duration::from_secs(u64::try_from(ttl_seconds.max(1)).unwrap_or(1));
        spawn_expiry(Arc::downgrade(&self.inner), lease, ttl);
        Ok(lease)
    }

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> Result<(), StoreError> {
        let mut state = self.inner.state.lock();
        Self::check_available(&state)?;
        if let Some(id) = lease {
            if !state.leases.contains_key(&id) {
                return Err(StoreError::LeaseNotFound(id));
            }
        }

        state.revision += 1;
        let prev = state.kvs.get(key).cloned();
        if let Some(prev) = &prev {
            Inner::unbind(&mut state, key, prev.lease);
        }
        if let Some(id) = lease {
            if let Some(keys) = state.leases.get_mut(&id) {
                keys.insert(key.to_owned());
            }
        }

        let kv = KeyValue {
            key: key.to_owned(),
            value,
            mod_revision: state.revision,
            lease: lease.unwrap_or(0),
        };
        state.kvs.insert(key.to_owned(), kv.clone());
        self.inner.commit(
            &mut state,
            vec![WatchEvent {
                kind: EventKind::Put,
                kv,
                prev_kv: prev,
            }],
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut state = self.inner.state.lock();
        Self::check_available(&state)?;
        let Some(prev) = state.kvs.remove(key) else {
            return Ok(());
        };

        state.revision += 1;
        Inner::unbind(&mut state, key, prev.lease);
        let kv = KeyValue {
            key: key.to_owned(),
            value: Vec::new(),
            mod_revision: state.revision,
            lease: 0,
        };
        self.inner.commit(
            &mut state,
            vec![WatchEvent {
                kind: EventKind::Delete,
                kv,
                prev_kv: Some(prev),
            }],
        );
        Ok(())
    }

    async fn watch(
        &self,
        prefix: &str,
        from_revision: Option<i64>,
    ) -> Result<WatchStream, StoreError> {
        let state = self.inner.state.lock();
        Self::check_available(&state)?;

        let from = from_revision.unwrap_or(state.revision + 1);
        if from <= state.compact_revision {
            return Err(StoreError::Compacted {
                requested: from,
                compact_revision: state.compact_revision,
            });
        }

        // Subscribing under the lock: everything committed later arrives through
        // the channel, everything before comes from history.
        let changes = self.inner.changes.subscribe();
        let replay = state
            .history
            .iter()
            .filter(|batch| batch.revision >= from)
            .filter_map(|batch| batch.retain_prefix(prefix))
            .collect();
        let cursor = WatchCursor {
            prefix: prefix.to_owned(),
            replay,
            changes,
            severed: state.severed.clone(),
            last_revision: state.revision,
            finished: false,
        };
        drop(state);

        let stream = futures::stream::unfold(cursor, |mut cursor| async move {
            let item = cursor.next_batch().await?;
            Some((item, cursor))
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_and_revision() {
        let store = MemoryStore::new();
        store.put("/a/1", b"one".to_vec(), None).await.unwrap();
        store.put("/a/2", b"two".to_vec(), None).await.unwrap();
        store.put("/b/1", b"other".to_vec(), None).await.unwrap();

        let snapshot = store.get_prefix("/a/").await.unwrap();
        assert_eq!(snapshot.revision, 3);
        let keys: Vec<_> = snapshot.entries.iter().map(|kv| kv.key.as_str()).collect();
        assert_eq!(keys, vec!["/a/1", "/a/2"]);
    }

    #[tokio::test]
    async fn test_delete_missing_key_keeps_revision() {
        let store = MemoryStore::new();
        store.delete("/missing").await.unwrap();
        assert_eq!(store.revision(), 0);
    }

    #[tokio::test]
    async fn test_put_with_unknown_lease_fails() {
        let store = MemoryStore::new();
        let err = store.put("/a", Vec::new(), Some(42)).await.unwrap_err();
        assert!(matches!(err, StoreError::LeaseNotFound(42)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expiry_deletes_bound_keys() {
        let store = MemoryStore::new();
        let lease = store.grant(5).await.unwrap();
        store.put("/a/1", b"x".to_vec(), Some(lease)).await.unwrap();
        assert_eq!(store.lease_count(), 1);

        tokio::time::sleep(Duration::from_secs(6)).await;

        assert!(store.value("/a/1").is_none());
        assert_eq!(store.lease_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rebinding_to_new_lease_survives_old_expiry() {
        let store = MemoryStore::new();
        let first = store.grant(5).await.unwrap();
        store.put("/a/1", b"x".to_vec(), Some(first)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        let second = store.grant(5).await.unwrap();
        store.put("/a/1", b"x".to_vec(), Some(second)).await.unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(store.value("/a/1").is_some(), "first lease must not delete the key");

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(store.value("/a/1").is_none());
    }

    #[tokio::test]
    async fn test_watch_replays_history_and_streams_live_changes() {
        let store = MemoryStore::new();
        store.put("/a/1", b"one".to_vec(), None).await.unwrap();
        store.put("/b/1", b"skip".to_vec(), None).await.unwrap();

        let mut stream = store.watch("/a/", Some(1)).await.unwrap();
        let replayed = stream.next().await.unwrap().unwrap();
        assert_eq!(replayed.revision, 1);
        assert_eq!(replayed.events[0].kv.key, "/a/1");

        store.delete("/a/1").await.unwrap();
        let live = stream.next().await.unwrap().unwrap();
        assert_eq!(live.events[0].kind, EventKind::Delete);
        assert_eq!(live.events[0].prev_kv.as_ref().unwrap().value, b"one");
    }

    #[tokio::test]
    async fn test_sever_ends_stream_with_error() {
        let store = MemoryStore::new();
        let mut stream = store.watch("/a/", None).await.unwrap();
        store.sever_watches();
        assert!(matches!(
            stream.next().await,
            Some(Err(StoreError::Unavailable(_)))
        ));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_watch_from_compacted_revision_fails() {
        let store = MemoryStore::new();
        store.put("/a/1", Vec::new(), None).await.unwrap();
        store.put("/a/2", Vec::new(), None).await.unwrap();
        store.compact(2);

        let err = store.watch("/a/", Some(1)).await.err().unwrap();
        assert!(matches!(
            err,
            StoreError::Compacted {
                requested: 1,
                compact_revision: 2
            }
        ));
        assert!(store.watch("/a/", Some(3)).await.is_ok());
    }

    #[tokio::test]
    async fn test_unavailable_store_rejects_operations() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(store.get_prefix("/").await.is_err());
        assert!(store.grant(1).await.is_err());
        store.set_unavailable(false);
        assert!(store.get_prefix("/").await.is_ok());
    }

    #[tokio::test]
    async fn test_history_limit_compacts_oldest_revisions() {
        let store = MemoryStore::with_history_limit(2);
        for n in 1..=3 {
            store.put(&format!("/a/{n}"), b"x".to_vec(), None).await.unwrap();
        }

        let err = store.watch("/a/", Some(1)).await.err().unwrap();
        assert!(matches!(
            err,
            StoreError::Compacted {
                requested: 1,
                compact_revision: 1
            }
        ));

        let mut stream = store.watch("/a/", Some(2)).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.revision, 2);
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.revision, 3);
    }
}
