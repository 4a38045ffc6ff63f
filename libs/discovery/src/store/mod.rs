//! Coordination store abstraction.
//!
//! The discovery components only need five operations from the store: a prefix
//! snapshot, lease grants, puts bound to a lease, deletes and a revision-ordered
//! watch stream. [`EtcdStore`] talks to a real etcd cluster, [`MemoryStore`] keeps
//! everything in process.

mod etcd;
mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::StoreError;

pub use etcd::EtcdStore;
pub use memory::MemoryStore;

/// Store-side identifier of a lease.
pub type LeaseId = i64;

/// Stream of change batches returned by [`CoordinationStore::watch`].
///
/// The stream ends (or yields an error) on any disruption; callers reconnect.
pub type WatchStream = BoxStream<'static, Result<WatchBatch, StoreError>>;

/// A stored key and its value at some revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    /// Revision of the last modification of this key.
    pub mod_revision: i64,
    /// Lease the key is bound to, `0` when none.
    pub lease: LeaseId,
}

/// Result of a prefix read.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub entries: Vec<KeyValue>,
    /// Store revision at read time.
    pub revision: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Put,
    Delete,
}

/// One key change observed on a watch stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: EventKind,
    /// The key after the change. For deletes the value is empty.
    pub kv: KeyValue,
    /// The key before the change, when the store reports it.
    pub prev_kv: Option<KeyValue>,
}

/// Events delivered together by the store.
#[derive(Debug, Clone, Default)]
pub struct WatchBatch {
    /// Store revision reported with the batch.
    pub revision: i64,
    pub events: Vec<WatchEvent>,
}

impl WatchBatch {
    /// Keep only the events under `prefix`; `None` when nothing is left.
    #[must_use]
    pub fn retain_prefix(&self, prefix: &str) -> Option<Self> {
        let events: Vec<_> = self
            .events
            .iter()
            .filter(|e| e.kv.key.starts_with(prefix))
            .cloned()
            .collect();
        if events.is_empty() {
            None
        } else {
            Some(Self {
                revision: self.revision,
                events,
            })
        }
    }
}

/// Operations the discovery subsystem consumes from a coordination store.
///
/// Implementations are cheap handles; the watcher and the lease publisher each
/// own their own clone.
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    /// Read every key under `prefix` together with the current revision.
    async fn get_prefix(&self, prefix: &str) -> Result<Snapshot, StoreError>;

    /// Create a lease that expires after `ttl_seconds` unless renewed.
    async fn grant(&self, ttl_seconds: i64) -> Result<LeaseId, StoreError>;

    /// Upsert `key`, optionally bound to `lease`.
    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>)
        -> Result<(), StoreError>;

    /// Remove `key` immediately.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Watch every key under `prefix`, starting at `from_revision` (inclusive)
    /// or at the next revision when `None`.
    async fn watch(&self, prefix: &str, from_revision: Option<i64>)
        -> Result<WatchStream, StoreError>;
}

#[async_trait]
impl<T: CoordinationStore + ?Sized> CoordinationStore for Arc<T> {
    async fn get_prefix(&self, prefix: &str) -> Result<Snapshot, StoreError> {
        (**self).get_prefix(prefix).await
    }

    async fn grant(&self, ttl_seconds: i64) -> Result<LeaseId, StoreError> {
        (**self).grant(ttl_seconds).await
    }

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> Result<(), StoreError> {
        (**self).put(key, value, lease).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        (**self).delete(key).await
    }

    async fn watch(
        &self,
        prefix: &str,
        from_revision: Option<i64>,
    ) -> Result<WatchStream, StoreError> {
        (**self).watch(prefix, from_revision).await
    }
}
