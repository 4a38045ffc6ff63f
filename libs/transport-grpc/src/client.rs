//! gRPC client assembly on top of service discovery.
//!
//! [`dial`] resolves a logical service name, connects to every instance it
//! finds and returns a [`BalancedChannel`] that keeps following membership
//! changes in the background:
//! - Configurable connect and RPC timeouts
//! - HTTP/2 keepalive settings for connection health
//! - Bounded exponential backoff while dialing the initial instances
//! - Tracing spans around connection establishment

use std::sync::Arc;
use std::time::Duration;

use discovery::{
    CoordinationStore, NameResolver, NameWatcher, Operation, StoreResolver, Update, WatchConfig,
};
use tonic::transport::{Channel, Endpoint};
use tracing::Instrument;

use crate::balance::BalancedChannel;
use crate::error::TransportError;

fn duration_to_u64_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Configuration for discovery-backed gRPC clients.
#[derive(Debug, Clone)]
pub struct GrpcClientConfig {
    /// Timeout for establishing each connection.
    pub connect_timeout: Duration,

    /// Timeout for individual RPC calls (applied at transport level).
    pub rpc_timeout: Duration,

    /// How long to wait for the first resolution result.
    pub resolve_timeout: Duration,

    /// Retries per instance while dialing, after the first attempt.
    pub max_dial_retries: u32,

    /// Delay before the first retry; doubles on every further retry.
    pub base_backoff: Duration,

    /// Upper bound for the dial backoff.
    pub max_backoff: Duration,

    /// Service name for logs and tracing.
    pub service_name: String,
}

impl Default for GrpcClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            rpc_timeout: Duration::from_secs(30),
            resolve_timeout: Duration::from_secs(5),
            max_dial_retries: 3,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            service_name: "grpc_client".to_owned(),
        }
    }
}

impl GrpcClientConfig {
    /// Create a new configuration with the given service name.
    #[must_use]
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_resolve_timeout(mut self, timeout: Duration) -> Self {
        self.resolve_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_max_dial_retries(mut self, retries: u32) -> Self {
        self.max_dial_retries = retries;
        self
    }

    /// Set the initial and maximum dial backoff.
    #[must_use]
    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.base_backoff = base;
        self.max_backoff = max;
        self
    }

    /// Backoff before retry number `retry` (1-based): `base * 2^(retry-1)`, capped.
    #[must_use]
    pub fn dial_backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

/// Build a plaintext tonic `Endpoint` for `addr` with timeouts and keepalive.
fn build_endpoint(addr: &str, cfg: &GrpcClientConfig) -> Result<Endpoint, tonic::transport::Error> {
    let endpoint = Endpoint::from_shared(format!("http://{addr}"))?
        .connect_timeout(cfg.connect_timeout)
        .timeout(cfg.rpc_timeout)
        .tcp_keepalive(Some(Duration::from_secs(30)))
        .http2_keep_alive_interval(Duration::from_secs(30))
        .keep_alive_timeout(Duration::from_secs(10))
        .keep_alive_while_idle(true);

    Ok(endpoint)
}

/// Connect to one instance, retrying with exponential backoff.
async fn connect_with_retry(addr: &str, cfg: &GrpcClientConfig) -> Result<Channel, TransportError> {
    let endpoint = build_endpoint(addr, cfg)?;
    let mut retry: u32 = 0;

    loop {
        match endpoint.connect().await {
            Ok(channel) => {
                if retry > 0 {
                    tracing::info!(service = %cfg.service_name, %addr, retry, "gRPC connection established after retries");
                }
                return Ok(channel);
            }
            Err(e) if retry < cfg.max_dial_retries => {
                retry += 1;
                let backoff = cfg.dial_backoff(retry);
                tracing::warn!(
                    service = %cfg.service_name,
                    %addr,
                    retry,
                    max_retries = cfg.max_dial_retries,
                    error = %e,
                    backoff_ms = duration_to_u64_ms(backoff),
                    "gRPC connection failed, retrying..."
                );
                tokio::time::sleep(backoff).await;
            }
            Err(e) => {
                tracing::error!(
                    service = %cfg.service_name,
                    %addr,
                    attempts = retry + 1,
                    error = %e,
                    "gRPC connection failed after all retries"
                );
                return Err(e.into());
            }
        }
    }
}

/// Apply one resolver batch to a live channel. New instances connect lazily.
fn apply_updates(channel: &BalancedChannel, updates: Vec<Update>, cfg: &GrpcClientConfig) {
    for update in updates {
        match update.op {
            Operation::Add => {
                if channel.contains(&update.addr) {
                    continue;
                }
                match build_endpoint(&update.addr, cfg) {
                    Ok(endpoint) => {
                        tracing::debug!(service = %cfg.service_name, addr = %update.addr, "instance added");
                        channel.insert(update.addr, endpoint.connect_lazy());
                    }
                    Err(e) => {
                        tracing::warn!(service = %cfg.service_name, addr = %update.addr, error = %e, "ignoring instance with invalid address");
                    }
                }
            }
            Operation::Delete => {
                if channel.remove(&update.addr) {
                    tracing::debug!(service = %cfg.service_name, addr = %update.addr, "instance removed");
                }
            }
        }
    }
}

fn spawn_updater(channel: &BalancedChannel, mut watcher: Box<dyn NameWatcher>, cfg: GrpcClientConfig) {
    let shared = Arc::downgrade(&channel.shared);
    let closed = channel.shared.closed.clone();
    tokio::spawn(async move {
        loop {
            let next = tokio::select! {
                biased;
                () = closed.cancelled() => break,
                next = watcher.next() => next,
            };
            let Ok(updates) = next else {
                break;
            };
            let Some(shared) = shared.upgrade() else {
                break;
            };
            apply_updates(&BalancedChannel { shared }, updates, &cfg);
        }
        watcher.close();
        tracing::debug!(service = %cfg.service_name, "resolver updates stopped");
    });
}

/// Dial `target` through `resolver` and return a round-robin channel.
///
/// Waits up to `resolve_timeout` for the first resolution, then connects to
/// every resolved instance (with retries). Succeeds once at least one
/// instance is connected; later membership changes are applied in the
/// background until the channel is dropped.
///
/// # Errors
/// Returns [`TransportError::ResolveTimeout`] if nothing resolves in time and
/// [`TransportError::NoReachableEndpoint`] if no resolved instance accepts a
/// connection.
pub async fn dial(
    target: &str,
    resolver: &dyn NameResolver,
    cfg: &GrpcClientConfig,
) -> Result<BalancedChannel, TransportError> {
    let span = tracing::debug_span!("grpc_dial", service = %cfg.service_name, resolve_target = %target);

    async move {
        let mut watcher = resolver.resolve(target)?;
        let first = match tokio::time::timeout(cfg.resolve_timeout, watcher.next()).await {
            Ok(batch) => batch?,
            Err(_) => {
                watcher.close();
                return Err(TransportError::ResolveTimeout {
                    target: target.to_owned(),
                    timeout: cfg.resolve_timeout,
                });
            }
        };

        let channel = BalancedChannel::new(target);
        for update in first {
            match update.op {
                Operation::Add => match connect_with_retry(&update.addr, cfg).await {
                    Ok(connected) => channel.insert(update.addr, connected),
                    Err(e) => {
                        tracing::warn!(addr = %update.addr, error = %e, "skipping unreachable instance");
                    }
                },
                Operation::Delete => {
                    channel.remove(&update.addr);
                }
            }
        }

        if channel.is_empty() {
            watcher.close();
            return Err(TransportError::NoReachableEndpoint {
                target: target.to_owned(),
            });
        }

        tracing::info!(
            service = %cfg.service_name,
            endpoints = channel.len(),
            connect_timeout_ms = duration_to_u64_ms(cfg.connect_timeout),
            rpc_timeout_ms = duration_to_u64_ms(cfg.rpc_timeout),
            "gRPC client connected"
        );
        spawn_updater(&channel, watcher, cfg.clone());
        Ok(channel)
    }
    .instrument(span)
    .await
}

/// [`dial`] through a [`StoreResolver`] over `store`.
///
/// # Errors
/// See [`dial`].
pub async fn dial_with_store<S>(
    target: &str,
    store: S,
    service_prefix: &str,
    cfg: &GrpcClientConfig,
) -> Result<BalancedChannel, TransportError>
where
    S: CoordinationStore + Clone,
{
    let resolver = StoreResolver::new(store, service_prefix, WatchConfig::default());
    dial(target, &resolver, cfg).await
}
