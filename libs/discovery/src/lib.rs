#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

//! Service registration and discovery over a coordination store.
//!
//! - [`LeasePublisher`] keeps instances alive under `{prefix}/{service}/{addr}`
//!   by renewing short leases.
//! - [`Watcher`] follows one service's instances with revision tracking and
//!   reconnects transparently.
//! - [`StoreResolver`] exposes watchers through the [`NameResolver`] trait
//!   consumed by RPC clients.

pub mod config;
pub mod error;
pub mod model;
pub mod register;
pub mod resolver;
pub mod store;
mod throttle;
pub mod watcher;

pub use config::{DiscoveryConfig, RegistrationConfig, StoreConfig, StorePassword, WatchConfig};
pub use error::{DiscoveryError, StoreError};
pub use model::{Operation, ServiceValue, Update, instance_key, service_key, watch_prefix};
pub use register::LeasePublisher;
pub use resolver::{NameResolver, NameWatcher, StoreResolver, parse_target};
pub use store::{CoordinationStore, EtcdStore, MemoryStore};
pub use watcher::{Backoff, Watcher};
