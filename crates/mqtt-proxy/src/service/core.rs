//! Core `SessionService` struct and packet handling.

use crate::domain::{
    encode_connack, encode_suback, parse_channel_topic, CodecError, ConnackCode, ConnectPacket,
    Frame, Packet, PacketType, ProxyError, PublishPacket, Session, SessionId, SessionState,
    SubscribePacket, UnsubscribePacket, SUBACK_FAILURE,
};
use crate::ports::{DeliveryLauncher, IdentityProvider, MessageBridge};
use bytes::Bytes;
use proxy_telemetry::metrics::{
    AUTH_DENIALS, AUTH_DURATION, BRIDGE_PUBLISHES, BRIDGE_PUBLISH_FAILURES,
};
use proxy_telemetry::HistogramTimer;
use shared_bus::UnsubscribeHandle;
use shared_types::{Action, AuthError, BridgeMessage, ChannelId, Credential, ThingId, PROTOCOL_MQTT};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Default bound on every identity service call.
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(1);

/// What the relay must do with one client frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Write the frame to the broker unchanged.
    Forward,
    /// Write these bytes back to the client instead of forwarding.
    Reply(Bytes),
    /// Discard the frame.
    Drop,
    /// Write the optional reply to the client, then tear the session down.
    Close {
        reply: Option<Bytes>,
        reason: ProxyError,
    },
}

impl Verdict {
    fn close(reason: ProxyError) -> Self {
        Self::Close {
            reply: None,
            reason,
        }
    }
}

struct ActiveSubscription {
    handle: UnsubscribeHandle,
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ActiveSubscription {
    /// Release the bus subscription and stop the delivery loop at the next
    /// frame boundary. The task is detached, never aborted, so a frame
    /// already being written reaches the client intact.
    fn release(mut self) {
        self.handle.release();
        self.cancel.send_replace(true);
    }

    /// Release and abort. Only for session close, when the client socket is
    /// going away with whatever is in flight.
    fn abort(self) {
        self.task.abort();
        self.release();
    }
}

/// Session engine for one client connection.
///
/// Owns the session state and the channel subscription map. Only the
/// client-to-broker loop holds it, so the map has a single writer.
pub struct SessionService {
    session: Session,
    identity: Arc<dyn IdentityProvider>,
    bridge: Arc<dyn MessageBridge>,
    launcher: Arc<dyn DeliveryLauncher>,
    subscriptions: HashMap<ChannelId, ActiveSubscription>,
    auth_timeout: Duration,
}

impl SessionService {
    /// Create the engine for a new, unauthenticated session.
    ///
    /// # Arguments
    ///
    /// * `id` - Session identifier used in logs
    /// * `identity` - Identity/authorization service
    /// * `bridge` - Internal bus
    /// * `launcher` - Starts delivery loops for new subscriptions
    /// * `auth_timeout` - Bound on each identity call
    pub fn new(
        id: SessionId,
        identity: Arc<dyn IdentityProvider>,
        bridge: Arc<dyn MessageBridge>,
        launcher: Arc<dyn DeliveryLauncher>,
        auth_timeout: Duration,
    ) -> Self {
        Self {
            session: Session::new(id),
            identity,
            bridge,
            launcher,
            subscriptions: HashMap::new(),
            auth_timeout,
        }
    }

    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.session.id()
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// Identity resolved at connect time.
    #[must_use]
    pub fn thing_id(&self) -> Option<&ThingId> {
        self.session.thing()
    }

    /// Channels with an active bus subscription, ascending.
    #[must_use]
    pub fn subscribed_channels(&self) -> Vec<ChannelId> {
        let mut channels: Vec<_> = self.subscriptions.keys().copied().collect();
        channels.sort_unstable();
        channels
    }

    // =========================================================================
    // FRAME DISPATCH
    // =========================================================================

    /// Decide what happens to one frame read from the client.
    pub async fn handle_frame(&mut self, frame: &Frame) -> Verdict {
        if self.session.is_closed() {
            return Verdict::close(ProxyError::ProtocolViolation("session is closed".into()));
        }

        let packet = match Packet::decode(frame) {
            Ok(packet) => packet,
            Err(e) => return Self::on_decode_error(frame, e),
        };

        match packet {
            Packet::Connect(connect) => self.on_connect(&connect).await,
            Packet::Subscribe(subscribe) => self.on_subscribe(&subscribe).await,
            Packet::Unsubscribe(unsubscribe) => self.on_unsubscribe(&unsubscribe),
            Packet::Publish(publish) => self.on_publish(&publish).await,
            Packet::Passthrough(kind) => {
                debug!(packet = kind.name(), "Passthrough");
                Verdict::Forward
            }
        }
    }

    fn on_decode_error(frame: &Frame, err: CodecError) -> Verdict {
        let reason = ProxyError::from(err);
        let is_connect = matches!(frame.packet_type(), Ok(PacketType::Connect));
        warn!(error = %reason, "Rejecting undecodable frame");

        let reply = match (&reason, is_connect) {
            (ProxyError::UnsupportedProtocol(_), true) => Some(encode_connack(
                false,
                ConnackCode::UnacceptableProtocolVersion,
            )),
            _ => None,
        };
        Verdict::Close { reply, reason }
    }

    async fn on_connect(&mut self, packet: &ConnectPacket) -> Verdict {
        match self.connect(packet).await {
            Ok(thing) => {
                info!(thing_id = %thing, client_id = %packet.client_id, "Client authenticated");
                Verdict::Forward
            }
            Err(reason @ ProxyError::ProtocolViolation(_)) => {
                warn!(error = %reason, "Closing session");
                Verdict::close(reason)
            }
            Err(reason) => {
                AUTH_DENIALS.with_label_values(&["connect"]).inc();
                let code = match reason {
                    ProxyError::MalformedData(_) => ConnackCode::BadUsernamePassword,
                    _ => ConnackCode::NotAuthorized,
                };
                warn!(client_id = %packet.client_id, error = %reason, "Connect refused");
                Verdict::Close {
                    reply: Some(encode_connack(false, code)),
                    reason,
                }
            }
        }
    }

    async fn on_subscribe(&mut self, packet: &SubscribePacket) -> Verdict {
        if let Err(reason) = self.session.require_authenticated() {
            return Verdict::close(reason);
        }
        let refuse = Verdict::Reply(encode_suback(
            packet.packet_id,
            &vec![SUBACK_FAILURE; packet.topics.len()],
        ));

        let [(topic, _qos)] = packet.topics.as_slice() else {
            warn!(topics = packet.topics.len(), "SUBSCRIBE must name exactly one topic");
            return refuse;
        };
        let channel = match parse_channel_topic(topic) {
            Ok(channel) => channel,
            Err(e) => {
                warn!(error = %e, "Subscribe refused");
                return refuse;
            }
        };

        match self.subscribe(channel).await {
            Ok(()) => Verdict::Forward,
            Err(e) => {
                if e.is_refusal() {
                    AUTH_DENIALS.with_label_values(&["subscribe"]).inc();
                }
                warn!(%channel, error = %e, "Subscribe refused");
                refuse
            }
        }
    }

    fn on_unsubscribe(&mut self, packet: &UnsubscribePacket) -> Verdict {
        if let Err(reason) = self.session.require_authenticated() {
            return Verdict::close(reason);
        }

        let mut channels = Vec::with_capacity(packet.topics.len());
        for topic in &packet.topics {
            match parse_channel_topic(topic) {
                Ok(channel) => channels.push(channel),
                Err(reason) => return Verdict::close(reason),
            }
        }

        for channel in channels {
            match self.unsubscribe(channel) {
                Ok(()) => debug!(%channel, "Unsubscribed"),
                Err(e) => debug!(%channel, error = %e, "Unsubscribe of unknown channel"),
            }
        }
        Verdict::Forward
    }

    async fn on_publish(&mut self, packet: &PublishPacket) -> Verdict {
        if let Err(reason) = self.session.require_authenticated() {
            return Verdict::close(reason);
        }
        let channel = match parse_channel_topic(&packet.topic) {
            Ok(channel) => channel,
            Err(reason) => return Verdict::close(reason),
        };

        match self.publish(channel, packet.payload.clone()).await {
            Ok(()) => Verdict::Forward,
            Err(e) => {
                AUTH_DENIALS.with_label_values(&["publish"]).inc();
                warn!(%channel, error = %e, "Publish dropped");
                Verdict::Drop
            }
        }
    }

    // =========================================================================
    // OPERATIONS
    // =========================================================================

    /// Authenticate the session with the CONNECT credential.
    ///
    /// # Errors
    ///
    /// - `MalformedData` for an empty credential (no identity call is made)
    /// - `Unauthorized` / `UpstreamUnavailable` when the identity service
    ///   refuses or does not answer in time
    /// - `ProtocolViolation` if the session is already authenticated
    pub async fn connect(&mut self, packet: &ConnectPacket) -> Result<ThingId, ProxyError> {
        if self.session.state() != SessionState::Unauthenticated {
            return Err(ProxyError::ProtocolViolation(
                "second CONNECT on an authenticated session".into(),
            ));
        }
        if packet.credential.is_empty() {
            return Err(ProxyError::MalformedData("empty credential".into()));
        }

        let thing = within(self.auth_timeout, self.identity.identify(&packet.credential)).await?;
        self.session
            .authenticate(packet.credential.clone(), thing.clone())?;
        Ok(thing)
    }

    /// Open a bus subscription for `channel` and start its delivery loop.
    ///
    /// An existing subscription on the same channel is replaced.
    pub async fn subscribe(&mut self, channel: ChannelId) -> Result<(), ProxyError> {
        let credential = self.session.require_authenticated()?.clone();
        self.authorize(channel, &credential, Action::Read).await?;

        let subscription = self
            .bridge
            .subscribe(channel)
            .await
            .map_err(|e| ProxyError::UpstreamUnavailable(e.to_string()))?;
        let (receiver, handle) = subscription.into_parts();
        let (cancel, cancelled) = watch::channel(false);
        let task = self.launcher.launch(channel, receiver, cancelled);

        if let Some(previous) = self.subscriptions.insert(
            channel,
            ActiveSubscription {
                handle,
                cancel,
                task,
            },
        ) {
            previous.release();
            debug!(%channel, "Replaced existing subscription");
        }
        debug!(%channel, "Subscribed");
        Ok(())
    }

    /// Release the subscription for `channel`.
    ///
    /// Returns `NotFound` when there is none; nothing changes in that case.
    pub fn unsubscribe(&mut self, channel: ChannelId) -> Result<(), ProxyError> {
        self.session.require_authenticated()?;
        let active = self
            .subscriptions
            .remove(&channel)
            .ok_or(ProxyError::NotFound(channel))?;
        active.release();
        Ok(())
    }

    /// Authorize a publish and mirror it to the bus.
    ///
    /// `Ok` means the frame may be forwarded to the broker. A bus failure is
    /// logged and does not change that.
    pub async fn publish(&mut self, channel: ChannelId, payload: Bytes) -> Result<(), ProxyError> {
        let credential = self.session.require_authenticated()?.clone();
        let publisher = self.authorize(channel, &credential, Action::Write).await?;

        let message = BridgeMessage::new(channel, PROTOCOL_MQTT, payload.to_vec(), publisher);
        match timeout(self.auth_timeout, self.bridge.publish(message)).await {
            Ok(Ok(())) => BRIDGE_PUBLISHES.inc(),
            Ok(Err(e)) => {
                BRIDGE_PUBLISH_FAILURES.inc();
                error!(%channel, error = %e, "Bridge publish failed");
            }
            Err(_) => {
                BRIDGE_PUBLISH_FAILURES.inc();
                error!(%channel, "Bridge publish timed out");
            }
        }
        Ok(())
    }

    /// Release every subscription and mark the session closed.
    ///
    /// Safe to call repeatedly. Returns the number of subscriptions released
    /// by this call.
    pub fn close(&mut self) -> usize {
        let released = self.subscriptions.len();
        for (_, active) in self.subscriptions.drain() {
            active.abort();
        }
        if self.session.close() {
            debug!(released, "Session closed");
        }
        released
    }

    async fn authorize(
        &self,
        channel: ChannelId,
        credential: &Credential,
        action: Action,
    ) -> Result<ThingId, ProxyError> {
        within(
            self.auth_timeout,
            self.identity.can_access(channel, credential, action),
        )
        .await
    }
}

impl Drop for SessionService {
    fn drop(&mut self) {
        self.close();
    }
}

/// Run an identity call under `limit`; a timeout is an upstream failure.
async fn within<T, F>(limit: Duration, call: F) -> Result<T, ProxyError>
where
    F: Future<Output = Result<T, AuthError>>,
{
    let _timer = HistogramTimer::new(&AUTH_DURATION);
    match timeout(limit, call).await {
        Ok(result) => result.map_err(ProxyError::from),
        Err(_) => Err(ProxyError::from(AuthError::Timeout {
            timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
        })),
    }
}
