//! Lease-based presence publishing.
//!
//! Each registered instance gets its own background task. On every tick the
//! task grants a fresh lease and rewrites the instance key bound to it, so the
//! key stays alive exactly as long as the process keeps renewing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::RegistrationConfig;
use crate::error::{DiscoveryError, StoreError};
use crate::model::{ServiceValue, instance_key};
use crate::store::{CoordinationStore, LeaseId};
use crate::throttle::FailureThrottle;

const FAILURE_LOG_INTERVAL: Duration = Duration::from_secs(30);

struct Renewal {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Keeps service instances registered in a coordination store.
pub struct LeasePublisher<S> {
    store: Arc<S>,
    service_prefix: String,
    config: RegistrationConfig,
    renewals: Mutex<HashMap<String, Renewal>>,
}

impl<S> std::fmt::Debug for LeasePublisher<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeasePublisher")
            .field("service_prefix", &self.service_prefix)
            .field("config", &self.config)
            .field("registered", &self.renewals.lock().len())
            .finish_non_exhaustive()
    }
}

impl<S: CoordinationStore> LeasePublisher<S> {
    /// # Errors
    /// Returns [`DiscoveryError::InvalidConfig`] if the renewal interval is not
    /// strictly shorter than the lease TTL.
    pub fn new(
        store: S,
        service_prefix: impl Into<String>,
        config: RegistrationConfig,
    ) -> Result<Self, DiscoveryError> {
        config.validate()?;
        Ok(Self {
            store: Arc::new(store),
            service_prefix: service_prefix.into(),
            config,
            renewals: Mutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn service_prefix(&self) -> &str {
        &self.service_prefix
    }

    /// Start keeping `addr` registered under `service`.
    ///
    /// Returns as soon as the renewal task is spawned; the first write happens
    /// right away on that task. Must be called within a tokio runtime.
    ///
    /// # Errors
    /// Returns an error only if the payload cannot be encoded.
    pub fn register(&self, service: &str, addr: &str) -> Result<(), DiscoveryError> {
        self.register_with_metadata(service, addr, None)
    }

    /// Like [`register`](Self::register), attaching `metadata` to the stored value.
    ///
    /// Registering a pair that is already registered replaces its renewal task;
    /// the new task starts once the old one has finished any in-flight write.
    ///
    /// # Errors
    /// Returns an error only if the payload cannot be encoded.
    pub fn register_with_metadata(
        &self,
        service: &str,
        addr: &str,
        metadata: Option<Value>,
    ) -> Result<(), DiscoveryError> {
        let key = instance_key(&self.service_prefix, service, addr);
        let mut value = ServiceValue::new(addr);
        value.metadata = metadata;
        let payload = value.encode()?;

        let mut renewals = self.renewals.lock();
        let previous = renewals.remove(&key).map(|old| {
            old.cancel.cancel();
            old.handle
        });
        if previous.is_some() {
            tracing::debug!(%key, "replacing existing registration");
        }

        let cancel = CancellationToken::new();
        let task = RenewalTask {
            store: Arc::clone(&self.store),
            key: key.clone(),
            payload,
            config: self.config.clone(),
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(task.run(previous));
        renewals.insert(key.clone(), Renewal { cancel, handle });
        drop(renewals);

        tracing::info!(service, addr, %key, "service registered");
        Ok(())
    }

    /// Stop renewing and delete the key immediately.
    ///
    /// An in-flight renewal write is allowed to finish first so it cannot
    /// resurrect the key after the delete.
    ///
    /// # Errors
    /// Returns [`DiscoveryError::Deregister`] carrying the key if the delete fails.
    pub async fn deregister(&self, service: &str, addr: &str) -> Result<(), DiscoveryError> {
        let key = instance_key(&self.service_prefix, service, addr);
        let renewal = self.renewals.lock().remove(&key);
        if let Some(renewal) = renewal {
            renewal.cancel.cancel();
            if let Err(e) = renewal.handle.await {
                tracing::warn!(%key, error = %e, "renewal task ended abnormally");
            }
        }

        let timeout = self.config.deregister_timeout;
        let result = match tokio::time::timeout(timeout, self.store.delete(&key)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout {
                op: "delete",
                timeout,
            }),
        };
        result.map_err(|source| DiscoveryError::Deregister {
            key: key.clone(),
            source,
        })?;

        tracing::info!(service, addr, %key, "service deregistered");
        Ok(())
    }

    /// Stop renewing without deleting. The key disappears when its lease expires.
    ///
    /// Returns `false` if the pair was not registered.
    pub fn stop_renewal(&self, service: &str, addr: &str) -> bool {
        let key = instance_key(&self.service_prefix, service, addr);
        let Some(renewal) = self.renewals.lock().remove(&key) else {
            return false;
        };
        renewal.cancel.cancel();
        tracing::info!(%key, "renewal stopped, key will expire with its lease");
        true
    }

    /// Keys currently being renewed, sorted.
    #[must_use]
    pub fn registered_keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.renewals.lock().keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl<S> Drop for LeasePublisher<S> {
    fn drop(&mut self) {
        for renewal in self.renewals.get_mut().values() {
            renewal.cancel.cancel();
        }
    }
}

struct RenewalTask<S> {
    store: Arc<S>,
    key: String,
    payload: Vec<u8>,
    config: RegistrationConfig,
    cancel: CancellationToken,
}

impl<S: CoordinationStore> RenewalTask<S> {
    async fn run(self, previous: Option<JoinHandle<()>>) {
        if let Some(previous) = previous {
            // Let the replaced task finish its last write before ours starts.
            if let Err(e) = previous.await {
                tracing::debug!(key = %self.key, error = %e, "replaced renewal task ended abnormally");
            }
        }

        let throttle = FailureThrottle::new(FAILURE_LOG_INTERVAL);
        let mut ticker = tokio::time::interval(self.config.renewal_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.publish_once().await {
                Ok(lease) => {
                    if let Some(failures) = throttle.record_success() {
                        tracing::info!(key = %self.key, lease, failures, "lease renewal recovered");
                    } else {
                        tracing::trace!(key = %self.key, lease, "lease renewed");
                    }
                }
                Err(e) => {
                    if let Some(failures) = throttle.record_failure() {
                        tracing::warn!(
                            key = %self.key,
                            error = %e,
                            consecutive_failures = failures,
                            "lease renewal failed, retrying on next tick"
                        );
                    }
                }
            }
        }
        tracing::debug!(key = %self.key, "renewal task stopped");
    }

    async fn publish_once(&self) -> Result<LeaseId, StoreError> {
        let grant_timeout = self.config.grant_timeout;
        let lease = tokio::time::timeout(grant_timeout, self.store.grant(self.config.ttl_seconds()))
            .await
            .map_err(|_| StoreError::Timeout {
                op: "grant",
                timeout: grant_timeout,
            })??;

        let put_timeout = self.config.put_timeout;
        tokio::time::timeout(
            put_timeout,
            self.store.put(&self.key, self.payload.clone(), Some(lease)),
        )
        .await
        .map_err(|_| StoreError::Timeout {
            op: "put",
            timeout: put_timeout,
        })??;
        Ok(lease)
    }
}
