//! # Client Listener
//!
//! Accepts client connections, dials a dedicated broker connection for each
//! and runs the session relay on its own task.

use crate::adapters::relay::{run_session, SessionContext};
use crate::config::ProxyConfig;
use crate::ports::{IdentityProvider, MessageBridge};
use proxy_telemetry::metrics::BROKER_DIAL_FAILURES;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Pause after a failed accept so a persistent error (e.g. fd exhaustion)
/// does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// TCP front end of the proxy.
pub struct Listener {
    listener: TcpListener,
    broker_addr: String,
    connect_timeout: Duration,
    ctx: SessionContext,
}

impl Listener {
    /// Bind the client listener.
    ///
    /// # Errors
    ///
    /// Returns the bind error if `config.listen_addr` is unavailable.
    pub async fn bind(
        config: ProxyConfig,
        identity: Arc<dyn IdentityProvider>,
        bridge: Arc<dyn MessageBridge>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        info!(
            addr = %listener.local_addr()?,
            broker = %config.broker_addr,
            "MQTT proxy listening"
        );

        Ok(Self {
            listener,
            broker_addr: config.broker_addr,
            connect_timeout: config.connect_timeout,
            ctx: SessionContext {
                identity,
                bridge,
                auth_timeout: config.auth_timeout,
                max_frame_size: config.max_frame_size,
            },
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept clients until `shutdown` flips to `true`, then wait for the
    /// running sessions to finish.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut sessions = JoinSet::new();

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        // Nobody can signal the sessions any more
                        warn!("Shutdown channel dropped, aborting sessions");
                        sessions.abort_all();
                        break;
                    }
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((client, peer)) => {
                        let span = info_span!("connection", %peer);
                        sessions.spawn(
                            handle_connection(
                                client,
                                self.broker_addr.clone(),
                                self.connect_timeout,
                                self.ctx.clone(),
                                shutdown.clone(),
                            )
                            .instrument(span),
                        );
                    }
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                    log_session_exit(finished);
                }
            }
        }

        info!(sessions = sessions.len(), "Listener stopped, draining sessions");
        while let Some(finished) = sessions.join_next().await {
            log_session_exit(finished);
        }
        info!("All sessions closed");
    }
}

fn log_session_exit(finished: Result<(), tokio::task::JoinError>) {
    match finished {
        Ok(()) => {}
        Err(e) if e.is_cancelled() => debug!("Session task cancelled"),
        Err(e) => error!(error = %e, "Session task panicked"),
    }
}

async fn handle_connection(
    client: TcpStream,
    broker_addr: String,
    connect_timeout: Duration,
    ctx: SessionContext,
    shutdown: watch::Receiver<bool>,
) {
    if let Err(e) = client.set_nodelay(true) {
        debug!(error = %e, "Could not set TCP_NODELAY on client socket");
    }

    let broker = match timeout(connect_timeout, TcpStream::connect(&broker_addr)).await {
        Ok(Ok(broker)) => broker,
        Ok(Err(e)) => {
            BROKER_DIAL_FAILURES.inc();
            warn!(broker = %broker_addr, error = %e, "Broker dial failed, closing client");
            return;
        }
        Err(_) => {
            BROKER_DIAL_FAILURES.inc();
            warn!(
                broker = %broker_addr,
                timeout_ms = u64::try_from(connect_timeout.as_millis()).unwrap_or(u64::MAX),
                "Broker dial timed out, closing client"
            );
            return;
        }
    };
    if let Err(e) = broker.set_nodelay(true) {
        debug!(error = %e, "Could not set TCP_NODELAY on broker socket");
    }

    info!("Client connected");
    run_session(ctx, client, broker, shutdown).await;
}
