//! # MQTT Channel Proxy Runtime
//!
//! Entry point for the proxy process.
//!
//! ## Startup Sequence
//!
//! 1. Load `ProxyConfig` and `TelemetryConfig` from the environment
//! 2. Validate configuration
//! 3. Initialize logging and metrics
//! 4. Connect the identity service client and the NATS bus
//! 5. Bind the listener and accept clients until Ctrl+C
//! 6. Signal shutdown, drain sessions, log a metrics snapshot

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use mqtt_proxy::{HttpIdentityProvider, Listener, ProxyConfig};
use proxy_telemetry::{encode_metrics, init_telemetry, TelemetryConfig};
use shared_bus::NatsBridge;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// How long sessions get to wind down after Ctrl+C.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// A started proxy: the listener task and its shutdown signal.
struct ProxyRuntime {
    listener: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl ProxyRuntime {
    /// Wire the production adapters and start accepting clients.
    async fn start(config: ProxyConfig) -> Result<Self> {
        let identity = HttpIdentityProvider::new(config.things_url.clone(), config.auth_timeout)
            .context("Failed to build identity service client")?;
        info!(url = %identity.base_url(), "Identity service client ready");

        let bridge = NatsBridge::connect_with_capacity(&config.bus_url, config.delivery_queue_capacity)
            .await
            .with_context(|| format!("Failed to connect to message bus at {}", config.bus_url))?;
        info!(url = %config.bus_url, "Connected to message bus");

        let listener = Listener::bind(config.clone(), Arc::new(identity), Arc::new(bridge))
            .await
            .with_context(|| format!("Failed to bind {}", config.listen_addr))?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let listener = tokio::spawn(listener.run(shutdown_rx));

        Ok(Self {
            listener,
            shutdown_tx,
        })
    }

    /// Stop accepting, let sessions close, abort whatever is left.
    async fn shutdown(self) {
        info!("Initiating graceful shutdown...");
        self.shutdown_tx.send_replace(true);

        let mut listener = self.listener;
        match tokio::time::timeout(DRAIN_TIMEOUT, &mut listener).await {
            Ok(Ok(())) => info!("Shutdown complete"),
            Ok(Err(e)) => error!(error = %e, "Listener task failed"),
            Err(_) => {
                warn!(
                    timeout_secs = DRAIN_TIMEOUT.as_secs(),
                    "Sessions did not drain in time, aborting"
                );
                listener.abort();
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry_config = TelemetryConfig::from_env();
    let _telemetry = init_telemetry(&telemetry_config).context("Failed to initialize telemetry")?;

    let config = ProxyConfig::from_env();
    config.validate().context("Invalid proxy configuration")?;

    info!("===========================================");
    info!("  MQTT Channel Proxy v{}", env!("CARGO_PKG_VERSION"));
    info!("===========================================");
    info!(
        listen = %config.listen_addr,
        broker = %config.broker_addr,
        auth_timeout_ms = u64::try_from(config.auth_timeout.as_millis()).unwrap_or(u64::MAX),
        queue_capacity = config.delivery_queue_capacity,
        "Configuration loaded"
    );

    let runtime = ProxyRuntime::start(config).await?;

    info!("Proxy is running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    runtime.shutdown().await;

    match encode_metrics() {
        Ok(snapshot) => info!(metrics = %snapshot, "Final metrics snapshot"),
        Err(e) => warn!(error = %e, "Could not encode metrics"),
    }
    Ok(())
}
