//! etcd-backed [`CoordinationStore`].

use async_trait::async_trait;
use etcd_client::{
    Client, ConnectOptions, DeleteOptions, EventType, GetOptions, PutOptions, WatchOptions,
};
use futures::StreamExt;

use super::{
    CoordinationStore, EventKind, KeyValue, LeaseId, Snapshot, WatchBatch, WatchEvent,
    WatchStream,
};
use crate::config::StoreConfig;
use crate::error::StoreError;

/// Handle to an etcd cluster.
///
/// Cloning is cheap and shares the underlying gRPC connection.
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl std::fmt::Debug for EtcdStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdStore").finish_non_exhaustive()
    }
}

impl EtcdStore {
    /// Connect to the endpoints listed in `cfg`.
    ///
    /// # Errors
    /// Returns an error if no endpoint can be reached or authentication fails.
    pub async fn connect(cfg: &StoreConfig) -> Result<Self, StoreError> {
        let mut options = ConnectOptions::new()
            .with_connect_timeout(cfg.connect_timeout)
            .with_timeout(cfg.request_timeout)
            .with_keep_alive(cfg.keep_alive_interval, cfg.keep_alive_timeout);
        if let (Some(user), Some(password)) = (&cfg.username, &cfg.password) {
            options = options.with_user(user.clone(), password.expose().to_owned());
        }

        let client = Client::connect(&cfg.endpoints, Some(options)).await?;
        tracing::info!(endpoints = ?cfg.endpoints, "connected to etcd");
        Ok(Self { client })
    }

    /// Wrap an already connected client.
    #[must_use]
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

fn convert_kv(kv: &etcd_client::KeyValue) -> KeyValue {
    KeyValue {
        key: String::from_utf8_lossy(kv.key()).into_owned(),
        value: kv.value().to_vec(),
        mod_revision: kv.mod_revision(),
        lease: kv.lease(),
    }
}

/// Error carried by a watch response that ends the stream, if any.
///
/// A non-zero compact revision wins over the cancel flag: etcd sets both when
/// the start revision has been compacted away.
fn terminal_error(
    compact_revision: i64,
    canceled: bool,
    cancel_reason: &str,
    requested: i64,
) -> Option<StoreError> {
    if compact_revision > 0 {
        Some(StoreError::Compacted {
            requested,
            compact_revision,
        })
    } else if canceled {
        Some(StoreError::WatchClosed(cancel_reason.to_owned()))
    } else {
        None
    }
}

fn convert_response(
    resp: &etcd_client::WatchResponse,
    requested: i64,
) -> Result<WatchBatch, StoreError> {
    if let Some(e) = terminal_error(
        resp.compact_revision(),
        resp.canceled(),
        resp.cancel_reason(),
        requested,
    ) {
        return Err(e);
    }

    let events = resp
        .events()
        .iter()
        .filter_map(|event| {
            let kv = event.kv()?;
            let kind = match event.event_type() {
                EventType::Put => EventKind::Put,
                EventType::Delete => EventKind::Delete,
            };
            Some(WatchEvent {
                kind,
                kv: convert_kv(kv),
                prev_kv: event.prev_kv().map(convert_kv),
            })
        })
        .collect();

    Ok(WatchBatch {
        revision: resp.header().map_or(0, |h| h.revision()),
        events,
    })
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn get_prefix(&self, prefix: &str) -> Result<Snapshot, StoreError> {
        let mut client = self.client.clone();
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;
        Ok(Snapshot {
            entries: resp.kvs().iter().map(convert_kv).collect(),
            revision: resp.header().map_or(0, |h| h.revision()),
        })
    }

    async fn grant(&self, ttl_seconds: i64) -> Result<LeaseId, StoreError> {
        let mut client = self.client.clone();
        let resp = client.lease_grant(ttl_seconds, None).await?;
        Ok(resp.id())
    }

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> Result<(), StoreError> {
        let mut client = self.client.clone();
        let options = lease.map(|id| PutOptions::new().with_lease(id));
        client.put(key, value, options).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut client = self.client.clone();
        client.delete(key, Some(DeleteOptions::new())).await?;
        Ok(())
    }

    async fn watch(
        &self,
        prefix: &str,
        from_revision: Option<i64>,
    ) -> Result<WatchStream, StoreError> {
        let mut client = self.client.clone();
        let mut options = WatchOptions::new().with_prefix().with_prev_key();
        if let Some(revision) = from_revision {
            options = options.with_start_revision(revision);
        }
        let (watcher, stream) = client.watch(prefix, Some(options)).await?;
        let requested = from_revision.unwrap_or(0);

        // The watcher handle owns the request side of the bidi stream; dropping
        // it would cancel the watch, so it travels with the response stream.
        let stream = futures::stream::unfold(
            (watcher, stream, false),
            move |(watcher, mut stream, done)| async move {
                if done {
                    return None;
                }
                match stream.message().await {
                    Ok(Some(resp)) => {
                        let batch = convert_response(&resp, requested);
                        let done = batch.is_err();
                        Some((batch, (watcher, stream, done)))
                    }
                    Ok(None) => None,
                    Err(e) => Some((Err(StoreError::from(e)), (watcher, stream, true))),
                }
            },
        );
        Ok(stream.boxed())
    }
}

// `etcd_client` response types cannot be built outside the crate, so only the
// mapping decision is covered here; event conversion needs a live cluster.
#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_compacted_response_maps_to_compacted() {
        let err = terminal_error(7, true, "compacted", 3).unwrap();
        assert!(matches!(
            err,
            StoreError::Compacted {
                requested: 3,
                compact_revision: 7
            }
        ));
    }

    #[test]
    fn test_canceled_response_maps_to_watch_closed() {
        let err = terminal_error(0, true, "permission denied", 3).unwrap();
        assert!(matches!(err, StoreError::WatchClosed(ref reason) if reason == "permission denied"));
    }

    #[test]
    fn test_regular_response_is_not_terminal() {
        assert!(terminal_error(0, false, "", 3).is_none());
    }
}
