//! Discovery configuration.
//!
//! Loaded in layers with `figment`: built-in defaults, then an optional YAML
//! file, then `DISCOVERY__*` environment variables (`__` separates nesting
//! levels, e.g. `DISCOVERY__WATCH__BACKOFF_STEP=500ms`).

use std::fmt;
use std::path::Path;
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::DiscoveryError;

const ENV_PREFIX: &str = "DISCOVERY__";

/// Top-level configuration for registration and discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiscoveryConfig {
    /// Root of all service keys, e.g. `/services`.
    pub service_prefix: String,
    pub store: StoreConfig,
    pub registration: RegistrationConfig,
    pub watch: WatchConfig,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            service_prefix: default_service_prefix(),
            store: StoreConfig::default(),
            registration: RegistrationConfig::default(),
            watch: WatchConfig::default(),
        }
    }
}

fn default_service_prefix() -> String {
    "/services".to_owned()
}

impl DiscoveryConfig {
    /// Load defaults, then `path` (if any), then environment overrides.
    ///
    /// # Errors
    /// Returns an error if a layer cannot be parsed or the result fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self, DiscoveryError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        let config: Self = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns [`DiscoveryError::InvalidConfig`] describing the first problem found.
    pub fn validate(&self) -> Result<(), DiscoveryError> {
        if self.service_prefix.trim_matches('/').is_empty() {
            return Err(DiscoveryError::InvalidConfig(
                "service_prefix must not be empty".to_owned(),
            ));
        }
        if self.store.endpoints.is_empty() {
            return Err(DiscoveryError::InvalidConfig(
                "store.endpoints must list at least one endpoint".to_owned(),
            ));
        }
        if self.store.username.is_some() != self.store.password.is_some() {
            return Err(DiscoveryError::InvalidConfig(
                "store.username and store.password must be set together".to_owned(),
            ));
        }
        self.registration.validate()?;
        self.watch.validate()
    }
}

/// Connection settings for the etcd cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    pub endpoints: Vec<String>,
    #[serde(with = "humantime_duration")]
    pub connect_timeout: Duration,
    #[serde(with = "humantime_duration")]
    pub request_timeout: Duration,
    #[serde(with = "humantime_duration")]
    pub keep_alive_interval: Duration,
    #[serde(with = "humantime_duration")]
    pub keep_alive_timeout: Duration,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<StorePassword>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://127.0.0.1:2379".to_owned()],
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
            keep_alive_interval: Duration::from_secs(30),
            keep_alive_timeout: Duration::from_secs(10),
            username: None,
            password: None,
        }
    }
}

/// Lease renewal settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegistrationConfig {
    /// How often a fresh lease is granted and the key rewritten.
    #[serde(with = "humantime_duration")]
    pub renewal_interval: Duration,
    /// Lifetime of each lease. Must exceed `renewal_interval`.
    #[serde(with = "humantime_duration")]
    pub lease_ttl: Duration,
    #[serde(with = "humantime_duration")]
    pub grant_timeout: Duration,
    #[serde(with = "humantime_duration")]
    pub put_timeout: Duration,
    #[serde(with = "humantime_duration")]
    pub deregister_timeout: Duration,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            renewal_interval: Duration::from_secs(3),
            lease_ttl: Duration::from_secs(10),
            grant_timeout: Duration::from_secs(2),
            put_timeout: Duration::from_secs(1),
            deregister_timeout: Duration::from_secs(3),
        }
    }
}

impl RegistrationConfig {
    /// Lease TTL in whole seconds, as the store expects it.
    #[must_use]
    pub fn ttl_seconds(&self) -> i64 {
        i64::try_from(self.lease_ttl.as_secs()).unwrap_or(i64::MAX)
    }

    /// # Errors
    /// Returns [`DiscoveryError::InvalidConfig`] if a lease could expire between renewals.
    pub fn validate(&self) -> Result<(), DiscoveryError> {
        if self.renewal_interval.is_zero() {
            return Err(DiscoveryError::InvalidConfig(
                "registration.renewal_interval must be positive".to_owned(),
            ));
        }
        if self.lease_ttl < Duration::from_secs(1) {
            return Err(DiscoveryError::InvalidConfig(
                "registration.lease_ttl must be at least 1s".to_owned(),
            ));
        }
        // Leases are granted in whole seconds, so the fraction never counts.
        let granted = Duration::from_secs(self.lease_ttl.as_secs());
        if self.renewal_interval >= granted {
            return Err(DiscoveryError::InvalidConfig(format!(
                "registration.renewal_interval ({}) must be shorter than the granted lease_ttl ({})",
                humantime::format_duration(self.renewal_interval),
                humantime::format_duration(granted),
            )));
        }
        Ok(())
    }
}

/// Watch reconnect settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WatchConfig {
    /// Delay added per consecutive failure.
    #[serde(with = "humantime_duration")]
    pub backoff_step: Duration,
    /// Cap on the failure counter.
    pub max_backoff_steps: u32,
    /// Reset the failure counter once a watch stream is established.
    pub reset_backoff_on_reconnect: bool,
    /// Bound on the initial prefix read of each attempt.
    #[serde(with = "humantime_duration")]
    pub snapshot_timeout: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            backoff_step: Duration::from_secs(1),
            max_backoff_steps: 10,
            reset_backoff_on_reconnect: false,
            snapshot_timeout: Duration::from_secs(2),
        }
    }
}

impl WatchConfig {
    /// # Errors
    /// Returns [`DiscoveryError::InvalidConfig`] for a zero step or cap.
    pub fn validate(&self) -> Result<(), DiscoveryError> {
        if self.backoff_step.is_zero() || self.max_backoff_steps == 0 {
            return Err(DiscoveryError::InvalidConfig(
                "watch.backoff_step and watch.max_backoff_steps must be positive".to_owned(),
            ));
        }
        Ok(())
    }
}

/// etcd password. Never printed, zeroed on drop.
#[derive(Clone, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct StorePassword(String);

impl StorePassword {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Callers must not log the returned value.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for StorePassword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl fmt::Display for StorePassword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

/// `Duration` fields written as `"3s"`, `"250ms"`, `"1m 30s"`.
pub mod humantime_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de};

    /// # Errors
    /// Fails if the value is not a valid humantime duration.
    pub fn deserialize<'de, D>(d: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(&raw).map_err(de::Error::custom)
    }

    /// # Errors
    /// Propagates serializer errors.
    pub fn serialize<S>(d: &Duration, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        s.collect_str(&humantime::format_duration(*d))
    }
}
