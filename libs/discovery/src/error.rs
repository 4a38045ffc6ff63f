use std::time::Duration;

use crate::store::LeaseId;

/// Failures reported by a coordination store backend.
///
/// Every variant except [`StoreError::LeaseNotFound`] is treated as transient by the
/// watcher and the lease publisher: they log it and try again on the next cycle.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("coordination store unavailable: {0}")]
    Unavailable(String),

    #[error("store operation `{op}` timed out after {}ms", timeout.as_millis())]
    Timeout { op: &'static str, timeout: Duration },

    #[error("revision {requested} has been compacted (compact revision: {compact_revision})")]
    Compacted {
        requested: i64,
        compact_revision: i64,
    },

    #[error("watch stream closed: {0}")]
    WatchClosed(String),

    #[error("lease {0} not found")]
    LeaseNotFound(LeaseId),

    #[error(transparent)]
    Etcd(#[from] etcd_client::Error),
}

/// Errors surfaced by the discovery API.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("failed to load discovery configuration: {0}")]
    Config(Box<figment::Error>),

    #[error("invalid discovery configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to encode service value: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("deregister service {key} failed")]
    Deregister {
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("watcher closed")]
    WatcherClosed,
}

impl From<figment::Error> for DiscoveryError {
    fn from(e: figment::Error) -> Self {
        Self::Config(Box::new(e))
    }
}

impl DiscoveryError {
    /// Failing key for a deregistration error.
    #[must_use]
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::Deregister { key, .. } => Some(key),
            _ => None,
        }
    }
}
