//! # Session Relay
//!
//! Pumps frames between one client and its dedicated broker connection.
//!
//! ```text
//!            ┌──────────── client_to_broker ────────────┐
//!  client ───┤ read_frame → SessionService → Verdict    ├──► broker
//!            └──────────────────────────────────────────┘
//!            ┌──────────── broker_to_client ────────────┐
//!  client ◄──┤ read_frame → verbatim                    ├─── broker
//!            └──────────────────────────────────────────┘
//!  client ◄── delivery loops (one per subscribed channel) ◄── bus
//! ```
//!
//! Every writer to the client goes through one async mutex, so frames are
//! never interleaved. A frame, once started, is written in full unless the
//! session is tearing down. The first loop to stop fires the [`Teardown`]
//! guard; every read, write and lock wait races it, so the rest exit even
//! when a peer has stopped reading.

use crate::domain::{delivery_topic, encode_publish, read_frame, Frame, ProxyError, SessionId};
use crate::ports::{DeliveryLauncher, IdentityProvider, MessageBridge};
use crate::service::{SessionService, Verdict};
use parking_lot::Mutex as SyncMutex;
use proxy_telemetry::metrics::{
    BRIDGE_DELIVERIES, DELIVERY_DROPS, DIRECTION_BROKER_TO_CLIENT, DIRECTION_CLIENT_TO_BROKER,
    ECHOES_SUPPRESSED, FRAMES_FORWARDED, SESSIONS_ACTIVE, SESSIONS_CLOSED, SESSIONS_OPENED,
};
use shared_bus::DeliveryReceiver;
use shared_types::{ChannelId, PROTOCOL_MQTT};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, info_span, trace, warn, Instrument};

/// Shared dependencies handed to every session.
#[derive(Clone)]
pub struct SessionContext {
    pub identity: Arc<dyn IdentityProvider>,
    pub bridge: Arc<dyn MessageBridge>,
    pub auth_timeout: Duration,
    pub max_frame_size: usize,
}

/// Summary of a finished session.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub session_id: SessionId,
    /// Why the session ended (the first teardown cause).
    pub reason: ProxyError,
    pub frames_from_client: u64,
    pub frames_from_broker: u64,
    pub subscriptions_released: usize,
}

/// Run-once teardown guard for a session.
///
/// The first `trigger` records the reason and signals every loop; later
/// calls are ignored.
pub struct Teardown {
    fired: AtomicBool,
    reason: SyncMutex<Option<ProxyError>>,
    signal: watch::Sender<bool>,
}

impl Teardown {
    #[must_use]
    pub fn new() -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            fired: AtomicBool::new(false),
            reason: SyncMutex::new(None),
            signal,
        }
    }

    /// Start teardown. Returns `false` if it had already started.
    pub fn trigger(&self, reason: ProxyError) -> bool {
        if self.fired.swap(true, Ordering::SeqCst) {
            debug!(%reason, "Teardown already in progress");
            return false;
        }
        debug!(%reason, "Tearing down session");
        *self.reason.lock() = Some(reason);
        self.signal.send_replace(true);
        true
    }

    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// The first recorded reason, or `Shutdown` if none was given.
    #[must_use]
    pub fn reason(&self) -> ProxyError {
        self.reason.lock().clone().unwrap_or(ProxyError::Shutdown)
    }

    /// Receiver that flips to `true` once teardown starts.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.signal.subscribe()
    }
}

impl Default for Teardown {
    fn default() -> Self {
        Self::new()
    }
}

type SharedWriter<W> = Arc<Mutex<W>>;

/// Bound on the final reply written before a refused session closes.
const CLOSE_REPLY_TIMEOUT: Duration = Duration::from_secs(1);

/// Bound on closing each socket once the loops have stopped.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Launches delivery loops that write bus messages to the client.
struct ClientDelivery<W> {
    writer: SharedWriter<W>,
    teardown: Arc<Teardown>,
}

impl<W> DeliveryLauncher for ClientDelivery<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    fn launch(
        &self,
        channel: ChannelId,
        receiver: DeliveryReceiver,
        cancel: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let writer = Arc::clone(&self.writer);
        let teardown = Arc::clone(&self.teardown);
        tokio::spawn(deliver(channel, receiver, cancel, writer, teardown).in_current_span())
    }
}

async fn deliver<W>(
    channel: ChannelId,
    mut receiver: DeliveryReceiver,
    mut cancel: watch::Receiver<bool>,
    writer: SharedWriter<W>,
    teardown: Arc<Teardown>,
) where
    W: AsyncWrite + Unpin,
{
    let topic = delivery_topic(channel);
    let mut stop = teardown.watch();
    let mut dropped_seen = 0u64;

    loop {
        // Unsubscribe is only honoured here, between frames.
        let message = tokio::select! {
            biased;
            () = stopped(&mut cancel) => break,
            () = stopped(&mut stop) => break,
            next = receiver.recv() => match next {
                Some(message) => message,
                None => break,
            },
        };

        let dropped = receiver.dropped();
        if dropped > dropped_seen {
            DELIVERY_DROPS.inc_by((dropped - dropped_seen) as f64);
            warn!(%channel, dropped = dropped - dropped_seen, "Client fell behind, deliveries dropped");
            dropped_seen = dropped;
        }

        if message.is_from(PROTOCOL_MQTT) {
            ECHOES_SUPPRESSED.inc();
            trace!(%channel, "Skipping message produced by an MQTT client");
            continue;
        }

        let frame = match encode_publish(&topic, &message.payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(%channel, error = %e, "Cannot encode delivery");
                continue;
            }
        };

        match send_to_client(&writer, &frame, &mut stop).await {
            Ok(()) => {
                BRIDGE_DELIVERIES.inc();
                trace!(%channel, bytes = frame.len(), "Delivered bus message");
            }
            Err(WriteAbort::Stopped) => break,
            Err(WriteAbort::Io(e)) => {
                teardown.trigger(ProxyError::Transport(format!("client write failed: {e}")));
                break;
            }
        }
    }
}

/// Why a guarded write did not complete.
enum WriteAbort {
    /// Teardown started first; the rest of the frame is abandoned along
    /// with the socket.
    Stopped,
    Io(std::io::Error),
}

/// Resolves once `stop` reads `true` or its sender is gone.
async fn stopped(stop: &mut watch::Receiver<bool>) {
    while !*stop.borrow_and_update() {
        if stop.changed().await.is_err() {
            return;
        }
    }
}

async fn write_frame<W>(writer: &mut W, bytes: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(bytes).await?;
    writer.flush().await
}

/// Write one whole frame unless teardown starts first.
async fn write_or_stop<W>(
    writer: &mut W,
    bytes: &[u8],
    stop: &mut watch::Receiver<bool>,
) -> Result<(), WriteAbort>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    tokio::select! {
        biased;
        () = stopped(stop) => Err(WriteAbort::Stopped),
        written = write_frame(writer, bytes) => written.map_err(WriteAbort::Io),
    }
}

/// Take the client writer and write one whole frame, unless teardown
/// starts first. Waiting for the lock is abandoned on teardown too, so a
/// peer stuck in a write never pins this caller.
async fn send_to_client<W>(
    writer: &SharedWriter<W>,
    bytes: &[u8],
    stop: &mut watch::Receiver<bool>,
) -> Result<(), WriteAbort>
where
    W: AsyncWrite + Unpin,
{
    tokio::select! {
        biased;
        () = stopped(stop) => Err(WriteAbort::Stopped),
        written = async {
            let mut client = writer.lock().await;
            write_frame(&mut *client, bytes).await
        } => written.map_err(WriteAbort::Io),
    }
}

async fn close_writer<W>(writer: &mut W, side: &'static str)
where
    W: AsyncWrite + Unpin + ?Sized,
{
    match timeout(SHUTDOWN_TIMEOUT, writer.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => trace!(side, error = %e, "Shutdown failed"),
        Err(_) => debug!(side, "Shutdown timed out"),
    }
}

/// Relay one session until either side closes, a frame is refused with
/// close, or `shutdown` flips to `true`.
///
/// Subscriptions are always released before this returns.
pub async fn run_session<C, B>(
    ctx: SessionContext,
    client: C,
    broker: B,
    mut shutdown: watch::Receiver<bool>,
) -> SessionReport
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let session_id = SessionId::new();
    let span = info_span!("session", session_id = %session_id);

    async move {
        SESSIONS_OPENED.inc();
        SESSIONS_ACTIVE.inc();
        debug!("Session started");

        let teardown = Arc::new(Teardown::new());
        let watcher = {
            let teardown = Arc::clone(&teardown);
            tokio::spawn(async move {
                loop {
                    if *shutdown.borrow_and_update() {
                        teardown.trigger(ProxyError::Shutdown);
                        break;
                    }
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                }
            })
        };

        let (client_read, client_write) = tokio::io::split(client);
        let (broker_read, broker_write) = tokio::io::split(broker);
        let client_writer: SharedWriter<WriteHalf<C>> = Arc::new(Mutex::new(client_write));

        let launcher = Arc::new(ClientDelivery {
            writer: Arc::clone(&client_writer),
            teardown: Arc::clone(&teardown),
        });
        let service = SessionService::new(
            session_id,
            ctx.identity,
            ctx.bridge,
            launcher,
            ctx.auth_timeout,
        );

        let ((frames_from_client, released), frames_from_broker) = tokio::join!(
            client_to_broker(
                service,
                BufReader::new(client_read),
                broker_write,
                Arc::clone(&client_writer),
                Arc::clone(&teardown),
                ctx.max_frame_size,
            ),
            broker_to_client(
                BufReader::new(broker_read),
                Arc::clone(&client_writer),
                Arc::clone(&teardown),
                ctx.max_frame_size,
            ),
        );

        watcher.abort();
        // Every holder of the client writer races teardown, so the lock
        // frees up; the timeout covers a writer that never does.
        match timeout(SHUTDOWN_TIMEOUT, client_writer.lock()).await {
            Ok(mut client) => close_writer(&mut *client, "client").await,
            Err(_) => debug!("Client writer still busy at close"),
        }

        let reason = teardown.reason();
        SESSIONS_CLOSED.inc();
        SESSIONS_ACTIVE.dec();
        info!(
            %reason,
            frames_from_client,
            frames_from_broker,
            subscriptions_released = released,
            "Session closed"
        );

        SessionReport {
            session_id,
            reason,
            frames_from_client,
            frames_from_broker,
            subscriptions_released: released,
        }
    }
    .instrument(span)
    .await
}

/// Returns the number of frames forwarded and subscriptions released.
async fn client_to_broker<C, B>(
    mut service: SessionService,
    mut client: BufReader<ReadHalf<C>>,
    mut broker: WriteHalf<B>,
    client_writer: SharedWriter<WriteHalf<C>>,
    teardown: Arc<Teardown>,
    max_frame_size: usize,
) -> (u64, usize)
where
    C: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let mut stop = teardown.watch();
    let mut forwarded = 0u64;

    loop {
        let frame: Frame = tokio::select! {
            biased;
            () = stopped(&mut stop) => break,
            read = read_frame(&mut client, max_frame_size) => match read {
                Ok(frame) => frame,
                Err(e) => {
                    teardown.trigger(client_read_error(e.into()));
                    break;
                }
            },
        };

        match service.handle_frame(&frame).await {
            Verdict::Forward => match write_or_stop(&mut broker, frame.as_bytes(), &mut stop).await {
                Ok(()) => {
                    forwarded += 1;
                    FRAMES_FORWARDED
                        .with_label_values(&[DIRECTION_CLIENT_TO_BROKER])
                        .inc();
                }
                Err(WriteAbort::Stopped) => break,
                Err(WriteAbort::Io(e)) => {
                    teardown.trigger(ProxyError::Transport(format!("broker write failed: {e}")));
                    break;
                }
            },
            Verdict::Reply(reply) => match send_to_client(&client_writer, &reply, &mut stop).await {
                Ok(()) => {}
                Err(WriteAbort::Stopped) => break,
                Err(WriteAbort::Io(e)) => {
                    teardown.trigger(ProxyError::Transport(format!("client write failed: {e}")));
                    break;
                }
            },
            Verdict::Drop => {}
            Verdict::Close { reply, reason } => {
                if let Some(reply) = reply {
                    let sent = timeout(
                        CLOSE_REPLY_TIMEOUT,
                        send_to_client(&client_writer, &reply, &mut stop),
                    )
                    .await;
                    if !matches!(sent, Ok(Ok(()))) {
                        debug!("Could not send final reply");
                    }
                }
                teardown.trigger(reason);
                break;
            }
        }
    }

    let released = service.close();
    close_writer(&mut broker, "broker").await;
    (forwarded, released)
}

async fn broker_to_client<B, C>(
    mut broker: BufReader<ReadHalf<B>>,
    client_writer: SharedWriter<WriteHalf<C>>,
    teardown: Arc<Teardown>,
    max_frame_size: usize,
) -> u64
where
    B: AsyncRead + AsyncWrite,
    C: AsyncRead + AsyncWrite,
{
    let mut stop = teardown.watch();
    let mut forwarded = 0u64;

    loop {
        let frame = tokio::select! {
            biased;
            () = stopped(&mut stop) => break,
            read = read_frame(&mut broker, max_frame_size) => match read {
                Ok(frame) => frame,
                Err(e) => {
                    let reason = match ProxyError::from(e) {
                        ProxyError::Transport(_) => ProxyError::Transport("broker closed connection".into()),
                        other => other,
                    };
                    teardown.trigger(reason);
                    break;
                }
            },
        };

        match send_to_client(&client_writer, frame.as_bytes(), &mut stop).await {
            Ok(()) => {
                forwarded += 1;
                FRAMES_FORWARDED
                    .with_label_values(&[DIRECTION_BROKER_TO_CLIENT])
                    .inc();
            }
            Err(WriteAbort::Stopped) => break,
            Err(WriteAbort::Io(e)) => {
                teardown.trigger(ProxyError::Transport(format!("client write failed: {e}")));
                break;
            }
        }
    }
    forwarded
}

fn client_read_error(err: ProxyError) -> ProxyError {
    match err {
        ProxyError::Transport(_) => ProxyError::Transport("client closed connection".into()),
        other => other,
    }
}
