//! # NATS Bridge
//!
//! Network-backed bridge on top of the `async-nats` client.
//!
//! ## Wire Mapping
//!
//! ```text
//! publish(msg)        ──►  PUB channel.<id>  (bincode envelope)
//! subscribe(channel)  ──►  SUB channel.<id>, one forwarding task
//! release(handle)     ──►  task stops, dropping the subscriber sends UNSUB
//! ```
//!
//! The client reconnects on its own and replays live subscriptions; while
//! it is away, publishes are buffered by the client instead of failing.

use crate::publisher::MessagePublisher;
use crate::queue::{delivery_queue, DeliverySender, PushOutcome};
use crate::subscriber::{MessageSubscriber, Subscription, UnsubscribeHandle};
use crate::DEFAULT_QUEUE_CAPACITY;
use async_nats::connection::State;
use async_nats::{Client, ConnectOptions, Event};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use shared_types::{BridgeError, BridgeMessage, ChannelId};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument};

/// Subject prefix; a channel's subject is `channel.<id>`.
pub const SUBJECT_PREFIX: &str = "channel";

const CLIENT_NAME: &str = "mqtt-proxy";

/// Bus subject for a channel.
#[must_use]
pub fn subject_for(channel: ChannelId) -> String {
    format!("{SUBJECT_PREFIX}.{channel}")
}

fn transport(e: impl std::fmt::Display) -> BridgeError {
    BridgeError::Transport(e.to_string())
}

/// Bridge backed by a NATS server.
pub struct NatsBridge {
    client: Client,
    capacity: usize,
    live: Arc<AtomicUsize>,
}

impl NatsBridge {
    /// Connect with the default delivery queue capacity.
    pub async fn connect(url: &str) -> Result<Self, BridgeError> {
        Self::connect_with_capacity(url, DEFAULT_QUEUE_CAPACITY).await
    }

    /// Connect to `url` (`nats://host:port` or `host:port`).
    ///
    /// The first connection attempt must succeed; later outages are
    /// handled by the client's reconnect loop and logged here.
    pub async fn connect_with_capacity(url: &str, capacity: usize) -> Result<Self, BridgeError> {
        let client = ConnectOptions::new()
            .name(CLIENT_NAME)
            .event_callback(|event| async move {
                match event {
                    Event::Connected => info!("NATS connection established"),
                    Event::Disconnected => warn!("NATS connection lost, reconnecting"),
                    other => debug!(event = %other, "NATS client event"),
                }
            })
            .connect(url)
            .await
            .map_err(transport)?;
        info!(%url, "Connected to NATS");

        Ok(Self {
            client,
            capacity,
            live: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// True while the client has no server connection.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.client.connection_state() != State::Connected
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessagePublisher for NatsBridge {
    async fn publish(&self, message: BridgeMessage) -> Result<(), BridgeError> {
        let payload = Bytes::from(message.to_bytes()?);
        self.client
            .publish(subject_for(message.channel), payload)
            .await
            .map_err(transport)
    }
}

#[async_trait]
impl MessageSubscriber for NatsBridge {
    async fn subscribe(&self, channel: ChannelId) -> Result<Subscription, BridgeError> {
        let subscriber = self
            .client
            .subscribe(subject_for(channel))
            .await
            .map_err(transport)?;
        let (sender, receiver) = delivery_queue(self.capacity);

        let task = tokio::spawn(forward(channel, subscriber, sender.clone()).in_current_span());
        self.live.fetch_add(1, Ordering::SeqCst);
        debug!(%channel, "NATS subscription opened");

        let live = Arc::clone(&self.live);
        let handle = UnsubscribeHandle::new(channel, move || {
            task.abort();
            sender.close();
            live.fetch_sub(1, Ordering::SeqCst);
        });

        Ok(Subscription::new(channel, receiver, handle))
    }
}

/// Pump one NATS subscriber into its delivery queue until either ends.
async fn forward(channel: ChannelId, mut subscriber: async_nats::Subscriber, sender: DeliverySender) {
    while let Some(message) = subscriber.next().await {
        if enqueue(channel, &message.payload, &sender) == PushOutcome::Closed {
            break;
        }
    }
    sender.close();
}

/// Decode one bus payload and queue it. Undecodable payloads are skipped.
fn enqueue(channel: ChannelId, payload: &[u8], sender: &DeliverySender) -> PushOutcome {
    let message = match BridgeMessage::from_bytes(payload) {
        Ok(message) => message,
        Err(e) => {
            warn!(%channel, error = %e, "Dropping undecodable bus message");
            return PushOutcome::Queued;
        }
    };
    let outcome = sender.push(message);
    if outcome == PushOutcome::DroppedOldest {
        warn!(%channel, "Delivery queue full, dropped oldest message");
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use shared_types::{ThingId, PROTOCOL_HTTP};
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;
    use tokio::time::{sleep, timeout};

    fn sample(payload: &[u8]) -> BridgeMessage {
        BridgeMessage::new(ChannelId(42), PROTOCOL_HTTP, payload.to_vec(), ThingId::new("t1"))
    }

    #[test]
    fn test_subject_for() {
        assert_eq!(subject_for(ChannelId(42)), "channel.42");
    }

    #[tokio::test]
    async fn test_enqueue_decodes_and_skips_garbage() {
        let (sender, mut receiver) = delivery_queue(4);
        let msg = sample(b"temp=21");

        assert_eq!(enqueue(ChannelId(42), b"not bincode", &sender), PushOutcome::Queued);
        assert!(receiver.is_empty());

        assert_eq!(
            enqueue(ChannelId(42), &msg.to_bytes().unwrap(), &sender),
            PushOutcome::Queued
        );
        assert_eq!(receiver.recv().await.unwrap(), msg);

        sender.close();
        assert_eq!(
            enqueue(ChannelId(42), &msg.to_bytes().unwrap(), &sender),
            PushOutcome::Closed
        );
    }

    /// Minimal NATS server: echoes every PUB to matching SUBs and records
    /// the command lines it saw.
    async fn fake_server() -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            write_half
                .write_all(
                    b"INFO {\"server_id\":\"test\",\"version\":\"2.10.0\",\"proto\":1,\"max_payload\":1048576,\"headers\":false}\r\n",
                )
                .await
                .unwrap();

            let mut subs: HashMap<String, String> = HashMap::new();
            let mut line = String::new();
            loop {
                line.clear();
                if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                    break;
                }
                let cmd = line.trim_end().to_string();
                log.lock().push(cmd.clone());
                let parts: Vec<&str> = cmd.split_whitespace().collect();
                match parts.first().copied() {
                    Some("PING") => write_half.write_all(b"PONG\r\n").await.unwrap(),
                    Some("SUB") => {
                        subs.insert(parts[1].to_string(), parts[2].to_string());
                    }
                    Some("UNSUB") => subs.retain(|_, sid| sid.as_str() != parts[1]),
                    Some("PUB") => {
                        let len: usize = parts[parts.len() - 1].parse().unwrap();
                        let mut body = vec![0u8; len + 2];
                        reader.read_exact(&mut body).await.unwrap();
                        if let Some(sid) = subs.get(parts[1]) {
                            let header = format!("MSG {} {} {}\r\n", parts[1], sid, len);
                            write_half.write_all(header.as_bytes()).await.unwrap();
                            write_half.write_all(&body).await.unwrap();
                        }
                    }
                    _ => {}
                }
            }
        });

        (addr, seen)
    }

    #[tokio::test]
    async fn test_publish_subscribe_round_trip() {
        let (addr, seen) = fake_server().await;
        let bridge = NatsBridge::connect(&format!("nats://{addr}")).await.unwrap();

        let mut sub = bridge.subscribe(ChannelId(42)).await.unwrap();
        assert_eq!(bridge.subscription_count(), 1);
        let msg = sample(b"temp=21");
        bridge.publish(msg.clone()).await.unwrap();

        let received = timeout(Duration::from_secs(2), sub.recv())
            .await
            .expect("timeout")
            .unwrap();
        assert_eq!(received, msg);

        assert!(sub.unsubscribe());
        assert_eq!(bridge.subscription_count(), 0);
        assert_eq!(sub.recv().await, None);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !seen.lock().iter().any(|l| l.starts_with("UNSUB ")) {
            assert!(tokio::time::Instant::now() < deadline, "UNSUB never reached server");
            sleep(Duration::from_millis(10)).await;
        }
        assert!(seen.lock().iter().any(|l| l.starts_with("SUB channel.42 ")));
    }

    #[tokio::test]
    async fn test_connect_refused_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = NatsBridge::connect(&addr.to_string()).await.err().unwrap();
        assert!(matches!(err, BridgeError::Transport(_)));
    }
}
