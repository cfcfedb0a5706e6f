//! # Proxy Configuration
//!
//! All timeouts and limits have working defaults and can be overridden from
//! the environment.

use crate::domain::DEFAULT_MAX_FRAME_SIZE;
use crate::service::DEFAULT_AUTH_TIMEOUT;
use shared_bus::DEFAULT_QUEUE_CAPACITY;
use std::env;
use std::fmt::Display;
use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Default listening port.
pub const DEFAULT_PORT: u16 = 8180;

/// Default broker dial timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Runtime configuration of the proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Address the client listener binds to.
    pub listen_addr: SocketAddr,
    /// Backend broker `host:port`, dialed once per client.
    pub broker_addr: String,
    /// Internal bus URL.
    pub bus_url: String,
    /// Identity service base URL.
    pub things_url: String,
    /// Bound on each identity call.
    pub auth_timeout: Duration,
    /// Bound on each broker dial.
    pub connect_timeout: Duration,
    /// Per-subscription delivery queue capacity.
    pub delivery_queue_capacity: usize,
    /// Largest accepted MQTT frame, in bytes.
    pub max_frame_size: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            broker_addr: "localhost:1883".to_string(),
            bus_url: "nats://localhost:4222".to_string(),
            things_url: "http://localhost:8182".to_string(),
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            delivery_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl ProxyConfig {
    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `MF_MQTT_ADAPTER_PORT`: Listening port (default: 8180)
    /// - `MF_MQTT_BROKER_URL`: Broker `host:port` (default: localhost:1883)
    /// - `MF_NATS_URL`: Bus URL (default: nats://localhost:4222)
    /// - `MF_THINGS_URL`: Identity service URL (default: http://localhost:8182)
    /// - `MF_MQTT_ADAPTER_AUTH_TIMEOUT_MS`: Identity call bound (default: 1000)
    /// - `MF_MQTT_ADAPTER_CONNECT_TIMEOUT_MS`: Broker dial bound (default: 5000)
    /// - `MF_MQTT_ADAPTER_QUEUE_CAPACITY`: Delivery queue size (default: 256)
    /// - `MF_MQTT_ADAPTER_MAX_FRAME_SIZE`: Largest frame in bytes (default: 1 MiB)
    ///
    /// Values that do not parse are logged and replaced by the default.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let port = parsed(&lookup, "MF_MQTT_ADAPTER_PORT", DEFAULT_PORT);

        Self {
            listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
            broker_addr: lookup("MF_MQTT_BROKER_URL").unwrap_or(defaults.broker_addr),
            bus_url: lookup("MF_NATS_URL").unwrap_or(defaults.bus_url),
            things_url: lookup("MF_THINGS_URL").unwrap_or(defaults.things_url),
            auth_timeout: millis(&lookup, "MF_MQTT_ADAPTER_AUTH_TIMEOUT_MS", defaults.auth_timeout),
            connect_timeout: millis(
                &lookup,
                "MF_MQTT_ADAPTER_CONNECT_TIMEOUT_MS",
                defaults.connect_timeout,
            ),
            delivery_queue_capacity: parsed(
                &lookup,
                "MF_MQTT_ADAPTER_QUEUE_CAPACITY",
                defaults.delivery_queue_capacity,
            ),
            max_frame_size: parsed(
                &lookup,
                "MF_MQTT_ADAPTER_MAX_FRAME_SIZE",
                defaults.max_frame_size,
            ),
        }
    }

    /// Reject values the proxy cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker_addr.trim().is_empty() {
            return Err(ConfigError::Invalid("broker address cannot be empty".into()));
        }
        if self.bus_url.trim().is_empty() {
            return Err(ConfigError::Invalid("bus URL cannot be empty".into()));
        }
        if self.things_url.trim().is_empty() {
            return Err(ConfigError::Invalid("identity service URL cannot be empty".into()));
        }

        if self.auth_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout("auth_timeout cannot be 0".into()));
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout("connect_timeout cannot be 0".into()));
        }

        if self.delivery_queue_capacity == 0 {
            return Err(ConfigError::InvalidLimit(
                "delivery_queue_capacity cannot be 0".into(),
            ));
        }
        // Must at least hold a CONNECT with a maximal credential
        if self.max_frame_size < 1024 {
            return Err(ConfigError::InvalidLimit(format!(
                "max_frame_size must be at least 1024, got {}",
                self.max_frame_size
            )));
        }
        Ok(())
    }
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr + Display,
{
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, default = %default, "Invalid value, using default");
            default
        }),
    }
}

fn millis(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> Duration {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(parsed(lookup, key, default_ms))
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Invalid size or count limit
    #[error("invalid limit: {0}")]
    InvalidLimit(String),
    /// Invalid timeout value
    #[error("invalid timeout: {0}")]
    InvalidTimeout(String),
    /// General configuration error
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
