//! Name resolution on top of [`Watcher`].
//!
//! RPC clients depend on [`NameResolver`] and [`NameWatcher`] only, so the
//! balancer never sees the coordination store.

use async_trait::async_trait;

use crate::config::WatchConfig;
use crate::error::DiscoveryError;
use crate::model::Update;
use crate::store::CoordinationStore;
use crate::watcher::Watcher;

/// URI scheme accepted in front of a target, as in `etcd:///svcA`.
pub const SCHEME: &str = "etcd";

/// Handle producing the address changes of one resolved target.
#[async_trait]
pub trait NameWatcher: Send {
    /// Block until the next batch of changes is available.
    async fn next(&mut self) -> Result<Vec<Update>, DiscoveryError>;

    /// Release the underlying resources. Later calls to `next` fail.
    fn close(&mut self);
}

/// Turns a logical service name into a [`NameWatcher`].
pub trait NameResolver: Send + Sync {
    /// # Errors
    /// Returns an error if the target is malformed or watching cannot start.
    fn resolve(&self, target: &str) -> Result<Box<dyn NameWatcher>, DiscoveryError>;
}

#[async_trait]
impl NameWatcher for Watcher {
    async fn next(&mut self) -> Result<Vec<Update>, DiscoveryError> {
        Watcher::next(self).await
    }

    fn close(&mut self) {
        Watcher::close(self);
    }
}

/// Strip an optional `etcd:///` prefix from `target`.
///
/// # Errors
/// Returns [`DiscoveryError::InvalidConfig`] for an empty name or a foreign scheme.
pub fn parse_target(target: &str) -> Result<&str, DiscoveryError> {
    let name = match target.split_once(":///") {
        Some((scheme, name)) if scheme == SCHEME => name,
        Some((scheme, _)) => {
            return Err(DiscoveryError::InvalidConfig(format!(
                "unsupported resolver scheme `{scheme}` in target `{target}`"
            )));
        }
        None => target,
    };
    let name = name.trim_matches('/');
    if name.is_empty() {
        return Err(DiscoveryError::InvalidConfig(format!(
            "target `{target}` names no service"
        )));
    }
    Ok(name)
}

/// [`NameResolver`] that starts one [`Watcher`] per resolved target.
#[derive(Debug, Clone)]
pub struct StoreResolver<S> {
    store: S,
    service_prefix: String,
    config: WatchConfig,
}

impl<S: CoordinationStore + Clone> StoreResolver<S> {
    #[must_use]
    pub fn new(store: S, service_prefix: impl Into<String>, config: WatchConfig) -> Self {
        Self {
            store,
            service_prefix: service_prefix.into(),
            config,
        }
    }
}

impl<S: CoordinationStore + Clone> NameResolver for StoreResolver<S> {
    fn resolve(&self, target: &str) -> Result<Box<dyn NameWatcher>, DiscoveryError> {
        let service = parse_target(target)?;
        tracing::debug!(service, prefix = %self.service_prefix, "resolving target");
        let watcher = Watcher::new(
            self.store.clone(),
            &self.service_prefix,
            service,
            self.config.clone(),
        )?;
        Ok(Box::new(watcher))
    }
}
