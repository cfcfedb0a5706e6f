//! Test fixtures: a scripted backend broker, a running proxy and a raw
//! MQTT client.

use bytes::Bytes;
use mqtt_proxy::domain::{encode_connack, encode_suback, ConnackCode};
use mqtt_proxy::{
    read_frame, CodecError, Frame, InMemoryIdentityProvider, Listener, Packet, PacketType,
    ProxyConfig, DEFAULT_MAX_FRAME_SIZE,
};
use parking_lot::Mutex;
use shared_bus::InMemoryBridge;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Upper bound for every wait in the flows.
pub const WAIT: Duration = Duration::from_secs(2);

/// A minimal broker that records every frame it receives and answers
/// CONNECT, SUBSCRIBE, UNSUBSCRIBE and PINGREQ.
pub struct ScriptedBroker {
    addr: SocketAddr,
    frames: Arc<Mutex<Vec<Frame>>>,
    connections: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl ScriptedBroker {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let frames = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));

        let task = {
            let frames = Arc::clone(&frames);
            let connections = Arc::clone(&connections);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    connections.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve(stream, Arc::clone(&frames)));
                }
            })
        };

        Self {
            addr,
            frames,
            connections,
            task,
        }
    }

    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Every frame received so far, across all connections.
    #[must_use]
    pub fn frames(&self) -> Vec<Frame> {
        self.frames.lock().clone()
    }

    /// Packet types received so far, in arrival order.
    #[must_use]
    pub fn packet_types(&self) -> Vec<PacketType> {
        self.frames()
            .iter()
            .filter_map(|frame| frame.packet_type().ok())
            .collect()
    }

    #[must_use]
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

impl Drop for ScriptedBroker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(mut stream: TcpStream, frames: Arc<Mutex<Vec<Frame>>>) {
    loop {
        let frame = match read_frame(&mut stream, DEFAULT_MAX_FRAME_SIZE).await {
            Ok(frame) => frame,
            Err(_) => return,
        };
        frames.lock().push(frame.clone());

        let reply = match Packet::decode(&frame) {
            Ok(Packet::Connect(_)) => Some(encode_connack(false, ConnackCode::Accepted)),
            Ok(Packet::Subscribe(subscribe)) => Some(encode_suback(
                subscribe.packet_id,
                &vec![0; subscribe.topics.len()],
            )),
            Ok(Packet::Unsubscribe(unsubscribe)) => {
                let [hi, lo] = unsubscribe.packet_id.to_be_bytes();
                Some(Bytes::from(vec![0xB0, 0x02, hi, lo]))
            }
            Ok(Packet::Passthrough(PacketType::Pingreq)) => Some(Bytes::from_static(&[0xD0, 0x00])),
            _ => None,
        };
        if let Some(reply) = reply {
            if stream.write_all(&reply).await.is_err() {
                return;
            }
        }
    }
}

/// A proxy listening on loopback in front of a [`ScriptedBroker`].
pub struct ProxyHarness {
    pub addr: SocketAddr,
    pub identity: Arc<InMemoryIdentityProvider>,
    pub bridge: Arc<InMemoryBridge>,
    pub broker: ScriptedBroker,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ProxyHarness {
    pub async fn start(identity: InMemoryIdentityProvider) -> Self {
        let broker = ScriptedBroker::start().await;
        let identity = Arc::new(identity);
        let bridge = Arc::new(InMemoryBridge::new());

        let config = ProxyConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            broker_addr: broker.addr().to_string(),
            auth_timeout: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(1),
            ..ProxyConfig::default()
        };
        let listener = Listener::bind(config, identity.clone(), bridge.clone())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(listener.run(rx));

        Self {
            addr,
            identity,
            bridge,
            broker,
            shutdown,
            task,
        }
    }

    pub async fn client(&self) -> TestClient {
        TestClient {
            stream: TcpStream::connect(self.addr).await.unwrap(),
        }
    }

    /// Signal shutdown and wait for every session to finish.
    pub async fn stop(self) {
        self.shutdown.send_replace(true);
        timeout(WAIT, self.task).await.unwrap().unwrap();
    }
}

/// Raw MQTT client speaking through the proxy.
pub struct TestClient {
    stream: TcpStream,
}

impl TestClient {
    pub async fn send(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    /// Next frame from the proxy, or the read error.
    pub async fn next(&mut self) -> Result<Frame, CodecError> {
        timeout(WAIT, read_frame(&mut self.stream, DEFAULT_MAX_FRAME_SIZE))
            .await
            .expect("timed out waiting for a frame")
    }

    /// Next frame, which must exist.
    pub async fn expect_frame(&mut self) -> Frame {
        self.next().await.unwrap()
    }

    /// Assert the proxy closed the connection.
    pub async fn expect_closed(&mut self) {
        match self.next().await {
            Err(CodecError::ConnectionClosed) | Err(CodecError::Io(_)) => {}
            other => panic!("expected connection close, got {other:?}"),
        }
    }
}
