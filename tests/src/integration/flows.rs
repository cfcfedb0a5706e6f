//! # Proxy Flows
//!
//! Whole sessions over loopback TCP:
//!
//! 1. **Connect**: refused credentials get CONNACK 5 and a close
//! 2. **Subscribe**: one bus subscription per authorized channel, bus
//!    messages delivered to the client
//! 3. **Publish**: unauthorized publishes never reach broker or bus
//! 4. **Round trip**: authorized publishes reach both, without echo
//! 5. **Teardown**: unsubscribe idempotence, second CONNECT, shutdown

#[cfg(test)]
mod tests {
    use crate::integration::harness::{ProxyHarness, WAIT};
    use mqtt_proxy::domain::{
        encode_connect, encode_disconnect, encode_pingreq, encode_publish, encode_subscribe,
        encode_unsubscribe,
    };
    use mqtt_proxy::{InMemoryIdentityProvider, Packet, PacketType};
    use shared_types::{Action, BridgeMessage, ChannelId, ThingId, PROTOCOL_HTTP, PROTOCOL_MQTT};
    use std::time::Duration;
    use tokio::time::{sleep, Instant};

    // =========================================================================
    // TEST FIXTURES
    // =========================================================================

    /// thing-1 (key-1) may read and write 42 and read 7.
    /// thing-2 (key-2) may read 42.
    fn identity() -> InMemoryIdentityProvider {
        InMemoryIdentityProvider::new()
            .with_thing("key-1", "thing-1")
            .with_thing("key-2", "thing-2")
            .with_grant("thing-1", 42, Action::Read)
            .with_grant("thing-1", 42, Action::Write)
            .with_grant("thing-1", 7, Action::Read)
            .with_grant("thing-2", 42, Action::Read)
    }

    fn connect(key: &str) -> bytes::Bytes {
        encode_connect("device", None, Some(key), 30).unwrap()
    }

    fn http_message(channel: u64, payload: &[u8]) -> BridgeMessage {
        BridgeMessage::new(
            ChannelId(channel),
            PROTOCOL_HTTP,
            payload.to_vec(),
            ThingId::new("http-device"),
        )
    }

    /// Wait until `condition` holds or `WAIT` elapses.
    async fn eventually(condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }
        condition()
    }

    fn decode(frame: &mqtt_proxy::Frame) -> Packet {
        Packet::decode(frame).unwrap()
    }

    // =========================================================================
    // CONNECT
    // =========================================================================

    #[tokio::test]
    async fn test_refused_connect_gets_connack_5_then_close() {
        let proxy = ProxyHarness::start(identity()).await;
        let mut client = proxy.client().await;

        client.send(&connect("wrong-key")).await;
        let connack = client.expect_frame().await;
        assert_eq!(connack.as_bytes().as_ref(), &[0x20, 0x02, 0x00, 0x05]);
        client.expect_closed().await;

        // The broker connection was dialed but saw no bytes
        assert!(eventually(|| proxy.broker.connections() == 1).await);
        assert!(proxy.broker.frames().is_empty());
        proxy.stop().await;
    }

    #[tokio::test]
    async fn test_accepted_connect_gets_broker_connack() {
        let proxy = ProxyHarness::start(identity()).await;
        let mut client = proxy.client().await;

        client.send(&connect("key-1")).await;
        let connack = client.expect_frame().await;
        assert_eq!(connack.as_bytes().as_ref(), &[0x20, 0x02, 0x00, 0x00]);
        assert_eq!(proxy.broker.packet_types(), vec![PacketType::Connect]);
        proxy.stop().await;
    }

    #[tokio::test]
    async fn test_each_client_gets_its_own_broker_connection() {
        let proxy = ProxyHarness::start(identity()).await;
        let mut first = proxy.client().await;
        let mut second = proxy.client().await;

        first.send(&connect("key-1")).await;
        second.send(&connect("key-2")).await;
        first.expect_frame().await;
        second.expect_frame().await;

        assert_eq!(proxy.broker.connections(), 2);
        proxy.stop().await;
    }

    #[tokio::test]
    async fn test_second_connect_closes_session() {
        let proxy = ProxyHarness::start(identity()).await;
        let mut client = proxy.client().await;

        client.send(&connect("key-1")).await;
        client.expect_frame().await;
        client.send(&connect("key-1")).await;
        client.expect_closed().await;

        assert_eq!(proxy.broker.packet_types(), vec![PacketType::Connect]);
        proxy.stop().await;
    }

    // =========================================================================
    // SUBSCRIBE
    // =========================================================================

    #[tokio::test]
    async fn test_subscribe_opens_one_bus_subscription_and_delivers() {
        let proxy = ProxyHarness::start(identity()).await;
        let mut client = proxy.client().await;

        client.send(&connect("key-1")).await;
        client.expect_frame().await;
        client.send(&encode_subscribe(1, &["channels.42"]).unwrap()).await;

        // SUBACK comes from the broker
        let suback = client.expect_frame().await;
        assert_eq!(suback.as_bytes().as_ref(), &[0x90, 0x03, 0x00, 0x01, 0x00]);
        assert_eq!(proxy.bridge.subscribe_calls(), vec![ChannelId(42)]);

        assert_eq!(proxy.bridge.inject(http_message(42, b"{\"t\":21}")), 1);
        match decode(&client.expect_frame().await) {
            Packet::Publish(publish) => {
                assert_eq!(publish.topic, "channels.42");
                assert_eq!(publish.qos, 0);
                assert_eq!(publish.payload.as_ref(), b"{\"t\":21}");
            }
            other => panic!("expected publish, got {other:?}"),
        }
        proxy.stop().await;
    }

    #[tokio::test]
    async fn test_denied_subscribe_is_answered_by_proxy() {
        let proxy = ProxyHarness::start(identity()).await;
        let mut client = proxy.client().await;

        client.send(&connect("key-2")).await;
        client.expect_frame().await;
        client.send(&encode_subscribe(5, &["channels.7"]).unwrap()).await;

        let suback = client.expect_frame().await;
        assert_eq!(suback.as_bytes().as_ref(), &[0x90, 0x03, 0x00, 0x05, 0x80]);
        assert!(proxy.bridge.subscribe_calls().is_empty());

        // Session continues
        client.send(&encode_pingreq()).await;
        assert_eq!(
            client.expect_frame().await.packet_type().unwrap(),
            PacketType::Pingresp
        );
        assert_eq!(
            proxy.broker.packet_types(),
            vec![PacketType::Connect, PacketType::Pingreq]
        );
        proxy.stop().await;
    }

    // =========================================================================
    // PUBLISH
    // =========================================================================

    #[tokio::test]
    async fn test_unauthorized_publish_reaches_neither_broker_nor_bus() {
        let proxy = ProxyHarness::start(identity()).await;
        let mut client = proxy.client().await;

        client.send(&connect("key-1")).await;
        client.expect_frame().await;
        client.send(&encode_publish("channels.7", b"forged").unwrap()).await;

        // A later ping is answered, so the publish was already processed
        client.send(&encode_pingreq()).await;
        assert_eq!(
            client.expect_frame().await.packet_type().unwrap(),
            PacketType::Pingresp
        );
        assert_eq!(
            proxy.broker.packet_types(),
            vec![PacketType::Connect, PacketType::Pingreq]
        );
        assert!(proxy.bridge.published().is_empty());
        proxy.stop().await;
    }

    #[tokio::test]
    async fn test_round_trip_without_echo() {
        let proxy = ProxyHarness::start(identity()).await;

        let mut subscriber = proxy.client().await;
        subscriber.send(&connect("key-2")).await;
        subscriber.expect_frame().await;
        subscriber.send(&encode_subscribe(1, &["channels.42"]).unwrap()).await;
        subscriber.expect_frame().await;

        let mut publisher = proxy.client().await;
        publisher.send(&connect("key-1")).await;
        publisher.expect_frame().await;
        let publish = encode_publish("channels.42", b"21.5").unwrap();
        publisher.send(&publish).await;

        // Mirrored to the bus with the publisher's identity
        assert!(eventually(|| proxy.bridge.published().len() == 1).await);
        let mirrored = &proxy.bridge.published()[0];
        assert_eq!(mirrored.protocol, PROTOCOL_MQTT);
        assert_eq!(mirrored.publisher, ThingId::new("thing-1"));
        assert_eq!(mirrored.payload, b"21.5".to_vec());

        // And forwarded verbatim to the broker
        assert!(eventually(|| proxy
            .broker
            .frames()
            .iter()
            .any(|frame| frame.as_bytes() == &publish))
        .await);

        // The subscriber's first delivery is the HTTP message, not the echo
        proxy.bridge.inject(http_message(42, b"from-http"));
        match decode(&subscriber.expect_frame().await) {
            Packet::Publish(delivery) => assert_eq!(delivery.payload.as_ref(), b"from-http"),
            other => panic!("expected publish, got {other:?}"),
        }
        proxy.stop().await;
    }

    // =========================================================================
    // TEARDOWN
    // =========================================================================

    #[tokio::test]
    async fn test_unsubscribe_twice_is_harmless() {
        let proxy = ProxyHarness::start(identity()).await;
        let mut client = proxy.client().await;

        client.send(&connect("key-1")).await;
        client.expect_frame().await;
        client.send(&encode_subscribe(1, &["channels.42"]).unwrap()).await;
        client.expect_frame().await;

        for packet_id in [2u16, 3] {
            client.send(&encode_unsubscribe(packet_id, &["channels.42"]).unwrap()).await;
            let unsuback = client.expect_frame().await;
            assert_eq!(unsuback.packet_type().unwrap(), PacketType::Unsuback);
        }

        assert_eq!(proxy.bridge.unsubscribe_calls(), vec![ChannelId(42)]);
        assert_eq!(proxy.bridge.subscriber_count(ChannelId(42)), 0);
        proxy.stop().await;
    }

    #[tokio::test]
    async fn test_client_disconnect_releases_subscriptions() {
        let proxy = ProxyHarness::start(identity()).await;
        let mut client = proxy.client().await;

        client.send(&connect("key-1")).await;
        client.expect_frame().await;
        client.send(&encode_subscribe(1, &["channels.42"]).unwrap()).await;
        client.expect_frame().await;
        client.send(&encode_subscribe(2, &["channels.7"]).unwrap()).await;
        client.expect_frame().await;
        client.send(&encode_disconnect()).await;
        drop(client);

        assert!(eventually(|| proxy.bridge.unsubscribe_calls().len() == 2).await);
        assert_eq!(proxy.bridge.subscriber_count(ChannelId(42)), 0);
        assert_eq!(proxy.bridge.subscriber_count(ChannelId(7)), 0);
        proxy.stop().await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_live_sessions() {
        let proxy = ProxyHarness::start(identity()).await;
        let mut client = proxy.client().await;

        client.send(&connect("key-1")).await;
        client.expect_frame().await;
        client.send(&encode_subscribe(1, &["channels.42"]).unwrap()).await;
        client.expect_frame().await;

        let bridge = proxy.bridge.clone();
        proxy.stop().await;

        client.expect_closed().await;
        assert_eq!(bridge.subscriber_count(ChannelId(42)), 0);
    }
}
