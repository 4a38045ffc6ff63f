//! Consistent membership view of one service.
//!
//! A [`Watcher`] runs a background loop that reads the service's key prefix,
//! then follows the store's change stream from the next revision. Every
//! observed change is turned into [`Update`]s and handed to the consumer
//! through a single-slot channel. When the stream breaks, the loop sleeps
//! with linear backoff and resumes right after the last revision it
//! processed, so consumers see neither gaps nor replays.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::WatchConfig;
use crate::error::{DiscoveryError, StoreError};
use crate::model::{ServiceValue, Update, watch_prefix};
use crate::store::{CoordinationStore, EventKind, Snapshot, WatchBatch, WatchStream};

/// Linear reconnect backoff: the Nth consecutive failure waits
/// `min(N, max_steps) * step`.
#[derive(Debug, Clone)]
pub struct Backoff {
    step: Duration,
    max_steps: u32,
    attempt: u32,
}

impl Backoff {
    #[must_use]
    pub fn new(step: Duration, max_steps: u32) -> Self {
        Self {
            step,
            max_steps,
            attempt: 0,
        }
    }

    #[must_use]
    pub fn from_config(config: &WatchConfig) -> Self {
        Self::new(config.backoff_step, config.max_backoff_steps)
    }

    /// Record a failure and return how long to wait before retrying.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1).min(self.max_steps);
        self.step.saturating_mul(self.attempt)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Failures counted so far (capped).
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// Live view of the instances registered under one service name.
///
/// Dropping the watcher stops its background loop.
pub struct Watcher {
    service_name: String,
    updates: mpsc::Receiver<Vec<Update>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("service_name", &self.service_name)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Watcher {
    /// Start watching `service_name` under `service_prefix`.
    ///
    /// Must be called within a tokio runtime.
    ///
    /// # Errors
    /// Returns [`DiscoveryError::InvalidConfig`] for an unusable backoff configuration.
    pub fn new<S: CoordinationStore>(
        store: S,
        service_prefix: &str,
        service_name: &str,
        config: WatchConfig,
    ) -> Result<Self, DiscoveryError> {
        config.validate()?;
        // Capacity 1: the loop cannot run ahead of the consumer.
        let (tx, rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        let watch_loop = WatchLoop {
            store,
            prefix: watch_prefix(service_prefix, service_name),
            backoff: Backoff::from_config(&config),
            config,
            view: MembershipView::default(),
            tx,
            cancel: cancel.clone(),
        };
        tokio::spawn(watch_loop.run());

        Ok(Self {
            service_name: service_name.to_owned(),
            updates: rx,
            cancel,
        })
    }

    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Wait for the next batch of membership changes.
    ///
    /// Batches are never empty and arrive in store revision order. The
    /// background loop blocks until each batch is taken, so a consumer that
    /// stops calling this also stops reconnect attempts.
    ///
    /// # Errors
    /// Returns [`DiscoveryError::WatcherClosed`] once the watcher is closed and
    /// any buffered batch has been drained.
    pub async fn next(&mut self) -> Result<Vec<Update>, DiscoveryError> {
        self.updates.recv().await.ok_or(DiscoveryError::WatcherClosed)
    }

    /// Stop the background loop. Idempotent.
    pub fn close(&self) {
        if !self.cancel.is_cancelled() {
            tracing::debug!(service = %self.service_name, "closing watcher");
            self.cancel.cancel();
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Local copy of the watched prefix and the revision it reflects.
#[derive(Debug, Default)]
struct MembershipView {
    members: BTreeMap<String, ServiceValue>,
    /// Highest revision applied, `0` before the first read.
    revision: i64,
    initialized: bool,
    needs_resync: bool,
}

impl MembershipView {
    fn needs_snapshot(&self) -> bool {
        !self.initialized || self.needs_resync
    }

    /// Where the next watch stream should start.
    fn resume_revision(&self) -> Option<i64> {
        (self.revision > 0).then_some(self.revision + 1)
    }

    /// Replace the view with `snapshot`, returning what changed.
    fn apply_snapshot(&mut self, snapshot: Snapshot) -> Vec<Update> {
        let mut fresh = BTreeMap::new();
        for kv in snapshot.entries {
            match ServiceValue::decode(&kv.value) {
                Ok(value) => {
                    fresh.insert(kv.key, value);
                }
                Err(e) => tracing::debug!(key = %kv.key, error = %e, "skipping undecodable entry"),
            }
        }

        let mut updates = Vec::new();
        for (key, old) in &self.members {
            if !fresh.contains_key(key) {
                updates.push(Update::delete(old.clone()));
            }
        }
        for (key, value) in &fresh {
            if self.members.get(key) != Some(value) {
                updates.push(Update::add(value.clone()));
            }
        }

        if !fresh.is_empty() {
            self.initialized = true;
        }
        self.members = fresh;
        self.revision = self.revision.max(snapshot.revision);
        self.needs_resync = false;
        updates
    }

    /// Apply one change batch, returning the resulting updates.
    ///
    /// Several events may carry the same revision (a lease revocation or a
    /// transaction), so replays are judged against the revision held before
    /// the batch.
    fn apply_batch(&mut self, prefix: &str, batch: WatchBatch) -> Vec<Update> {
        let applied = self.revision;
        let mut updates = Vec::new();
        for event in batch.events {
            let revision = event.kv.mod_revision;
            if revision <= applied || !event.kv.key.starts_with(prefix) {
                continue;
            }
            self.revision = self.revision.max(revision);

            match event.kind {
                EventKind::Put => match ServiceValue::decode(&event.kv.value) {
                    Ok(value) => {
                        if self.members.get(&event.kv.key) == Some(&value) {
                            continue;
                        }
                        self.members.insert(event.kv.key, value.clone());
                        updates.push(Update::add(value));
                    }
                    Err(e) => {
                        tracing::debug!(key = %event.kv.key, revision, error = %e, "skipping undecodable value");
                    }
                },
                EventKind::Delete => {
                    let removed = self.members.remove(&event.kv.key).or_else(|| {
                        event
                            .prev_kv
                            .and_then(|prev| ServiceValue::decode(&prev.value).ok())
                    });
                    if let Some(value) = removed {
                        updates.push(Update::delete(value));
                    }
                }
            }
        }
        updates
    }
}

/// Why a watch session ended.
enum SessionEnd {
    Closed,
    Failed(StoreError),
}

impl From<StoreError> for SessionEnd {
    fn from(e: StoreError) -> Self {
        Self::Failed(e)
    }
}

async fn cancellable<F: Future>(cancel: &CancellationToken, fut: F) -> Result<F::Output, SessionEnd> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(SessionEnd::Closed),
        out = fut => Ok(out),
    }
}

struct WatchLoop<S> {
    store: S,
    prefix: String,
    config: WatchConfig,
    backoff: Backoff,
    view: MembershipView,
    tx: mpsc::Sender<Vec<Update>>,
    cancel: CancellationToken,
}

impl<S: CoordinationStore> WatchLoop<S> {
    async fn run(mut self) {
        tracing::debug!(prefix = %self.prefix, "watch loop started");
        loop {
            let error = match self.session().await {
                SessionEnd::Closed => break,
                SessionEnd::Failed(e) => e,
            };

            let delay = self.backoff.next_delay();
            tracing::warn!(
                prefix = %self.prefix,
                revision = self.view.revision,
                attempt = self.backoff.attempt(),
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "watch interrupted, reconnecting"
            );
            if cancellable(&self.cancel, tokio::time::sleep(delay)).await.is_err() {
                break;
            }
        }
        tracing::debug!(prefix = %self.prefix, "watch loop stopped");
    }

    /// One connect-and-stream cycle. Only returns on close or failure.
    async fn session(&mut self) -> SessionEnd {
        match self.try_session().await {
            Ok(never) => match never {},
            Err(end) => end,
        }
    }

    async fn try_session(&mut self) -> Result<std::convert::Infallible, SessionEnd> {
        if self.view.needs_snapshot() {
            let timeout = self.config.snapshot_timeout;
            let snapshot = cancellable(
                &self.cancel,
                tokio::time::timeout(timeout, self.store.get_prefix(&self.prefix)),
            )
            .await?
            .map_err(|_| StoreError::Timeout {
                op: "get_prefix",
                timeout,
            })??;
            let revision = snapshot.revision;
            let entries = snapshot.entries.len();
            let updates = self.view.apply_snapshot(snapshot);
            tracing::debug!(prefix = %self.prefix, revision, entries, "read service snapshot");
            self.deliver(updates).await?;
        }

        let mut stream = self.open_stream().await?;
        if self.config.reset_backoff_on_reconnect {
            self.backoff.reset();
        }

        loop {
            match cancellable(&self.cancel, stream.next()).await? {
                Some(Ok(batch)) => {
                    let updates = self.view.apply_batch(&self.prefix, batch);
                    self.deliver(updates).await?;
                }
                Some(Err(e)) => return Err(self.fail(e)),
                None => {
                    return Err(SessionEnd::Failed(StoreError::WatchClosed(
                        "stream ended".to_owned(),
                    )));
                }
            }
        }
    }

    async fn open_stream(&mut self) -> Result<WatchStream, SessionEnd> {
        let from = self.view.resume_revision();
        match cancellable(&self.cancel, self.store.watch(&self.prefix, from)).await? {
            Ok(stream) => {
                tracing::debug!(prefix = %self.prefix, from_revision = ?from, "watch stream established");
                Ok(stream)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn fail(&mut self, e: StoreError) -> SessionEnd {
        if matches!(e, StoreError::Compacted { .. }) {
            self.view.needs_resync = true;
        }
        SessionEnd::Failed(e)
    }

    async fn deliver(&self, updates: Vec<Update>) -> Result<(), SessionEnd> {
        if updates.is_empty() {
            return Ok(());
        }
        cancellable(&self.cancel, self.tx.send(updates))
            .await?
            // Receiver gone: the watcher was dropped.
            .map_err(|_| SessionEnd::Closed)
    }
}
