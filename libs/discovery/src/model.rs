//! Keys and payloads stored for each registered service instance.
//!
//! An instance lives at `{prefix}/{service}/{address}` and its value is a JSON
//! object `{"Addr": "host:port", "Metadata": ...}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

const SEPARATOR: char = '/';

/// Key under which all instances of `service_name` are stored.
#[must_use]
pub fn service_key(service_prefix: &str, service_name: &str) -> String {
    let prefix = service_prefix.strip_suffix(SEPARATOR).unwrap_or(service_prefix);
    format!("{prefix}{SEPARATOR}{service_name}")
}

/// Key of a single instance.
#[must_use]
pub fn instance_key(service_prefix: &str, service_name: &str, address: &str) -> String {
    format!(
        "{}{SEPARATOR}{address}",
        service_key(service_prefix, service_name)
    )
}

/// Prefix to watch for one service.
///
/// Ends with the separator so that `svcA` never matches keys of `svcAB`.
#[must_use]
pub fn watch_prefix(service_prefix: &str, service_name: &str) -> String {
    format!("{}{SEPARATOR}", service_key(service_prefix, service_name))
}

/// Payload stored at an instance key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceValue {
    #[serde(rename = "Addr")]
    pub addr: String,

    #[serde(
        rename = "Metadata",
        alias = "MetaData",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub metadata: Option<Value>,
}

impl ServiceValue {
    #[must_use]
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            metadata: None,
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Serialize to the store's value encoding.
    ///
    /// # Errors
    /// Returns an error if the metadata cannot be serialized.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parse a stored value.
    ///
    /// # Errors
    /// Returns an error if the payload is not a valid service value.
    pub fn decode(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }
}

/// Kind of membership change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Add,
    Delete,
}

/// One observed change to a service's instance set.
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub op: Operation,
    pub addr: String,
    pub metadata: Option<Value>,
}

impl Update {
    #[must_use]
    pub fn add(value: ServiceValue) -> Self {
        Self {
            op: Operation::Add,
            addr: value.addr,
            metadata: value.metadata,
        }
    }

    #[must_use]
    pub fn delete(value: ServiceValue) -> Self {
        Self {
            op: Operation::Delete,
            addr: value.addr,
            metadata: value.metadata,
        }
    }
}
