//! End-to-end integration tests driving a real broker over loopback TCP.
//!
//! Each test binds a broker on `127.0.0.1:<ephemeral>`, connects one or
//! more plain `TcpStream`s, and speaks raw MQTT 3.1.1 bytes built with
//! `edgemq::codec`/`edgemq::protocol` directly (not through a client
//! library), so these tests exercise the exact wire format the broker
//! emits.

use std::future::Future;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use pretty_assertions::assert_eq;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use edgemq::auth::AllowAllAuthProvider;
use edgemq::codec::{Decoder, Encoder};
use edgemq::config::Config;
use edgemq::protocol::{
    ConnAck, Connect, ConnectReturnCode, Packet, PubAck, PubComp, PubRec, PubRel, Publish, QoS,
    SubAck, Subscribe, SubscribeReasonCode, TopicFilter, Unsubscribe, Will,
};
use edgemq::Broker;

static PORT_COUNTER: AtomicU16 = AtomicU16::new(18000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

fn test_config(port: u16) -> Config {
    let mut config = Config::default();
    config.server.bind_addr = "127.0.0.1".parse().unwrap();
    config.server.port = port;
    config.limits.max_packet_size = 64 * 1024;
    config
}

/// Runs `test` concurrently with a broker bound to `config`'s address.
///
/// `Broker::run` manages its own `LocalSet` internally and never needs
/// to be spawned onto an ambient one; racing it against the test body
/// with `select!` lets a single `#[tokio::test]` (no `LocalSet` of its
/// own) drive both without requiring `Broker`'s `Rc`-based state to be
/// `Send`. The broker side of the `select!` only resolves on a bind
/// failure or early exit, both of which are test failures.
async fn with_broker<F, Fut>(config: Config, test: F)
where
    F: FnOnce(SocketAddr) -> Fut,
    Fut: Future<Output = ()>,
{
    let addr = config.server.socket_addr();
    let broker = Broker::new(config, Rc::new(AllowAllAuthProvider));
    let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let server = broker.run(shutdown_rx);
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => {
            panic!("broker exited before the test finished: {result:?}");
        }
        _ = async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            test(addr).await;
        } => {}
    }
}

/// A raw MQTT connection: a TCP socket plus the leftover bytes from the
/// last `read()` that hadn't yet formed a complete packet. Tests read
/// one packet at a time but the broker is free to write several in one
/// `write_all`, so leftover bytes must survive across calls instead of
/// being dropped with a fresh per-call buffer.
struct RawConn {
    stream: TcpStream,
    buf: BytesMut,
}

impl RawConn {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = timeout(Duration::from_secs(2), TcpStream::connect(addr))
            .await
            .expect("connect timed out")
            .expect("connect failed");
        Self { stream, buf: BytesMut::new() }
    }

    async fn write(&mut self, packet: &Packet) {
        let mut buf = BytesMut::new();
        Encoder::new().encode(packet, &mut buf).expect("encode failed");
        self.stream.write_all(&buf).await.expect("write failed");
    }

    async fn write_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("write failed");
    }

    /// Reads exactly one packet, buffering as many socket reads as needed
    /// and retaining any bytes beyond it for the next call.
    async fn read(&mut self) -> Packet {
        let decoder = Decoder::new();
        loop {
            if let Some(parsed) = decoder.decode(&self.buf).expect("decode failed") {
                let rest = self.buf.split_off(parsed.consumed);
                self.buf = rest;
                return parsed.packet;
            }
            let mut chunk = [0u8; 4096];
            let n = timeout(Duration::from_secs(2), self.stream.read(&mut chunk))
                .await
                .expect("read timed out")
                .expect("read failed");
            assert!(n > 0, "connection closed before a full packet arrived");
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Asserts the connection closes (EOF or error) within the timeout,
    /// used to confirm a rejected/evicted client's socket was torn down.
    async fn assert_closed(&mut self) {
        if !self.buf.is_empty() {
            panic!("expected connection to close, but {} buffered bytes remain", self.buf.len());
        }
        let mut chunk = [0u8; 16];
        let result = timeout(Duration::from_secs(2), self.stream.read(&mut chunk)).await;
        match result {
            Ok(Ok(0)) => {}
            Ok(Err(_)) => {}
            other => panic!("expected connection to close, got {other:?}"),
        }
    }

    /// Asserts nothing arrives within a short window, used to confirm a
    /// message was correctly *not* routed to this subscriber.
    async fn assert_silent(&mut self, window: Duration) {
        if !self.buf.is_empty() {
            panic!("expected silence, but {} buffered bytes remain", self.buf.len());
        }
        let mut chunk = [0u8; 16];
        let result = timeout(window, self.stream.read(&mut chunk)).await;
        assert!(result.is_err(), "expected silence, but data arrived");
    }

    async fn connect_and_expect(&mut self, client_id: &str, clean_session: bool, session_present: bool) {
        self.write(&connect_packet(client_id, clean_session)).await;
        match self.read().await {
            Packet::ConnAck(ConnAck { session_present: sp, return_code }) => {
                assert_eq!(return_code, ConnectReturnCode::Accepted);
                assert_eq!(sp, session_present, "session_present mismatch");
            }
            other => panic!("expected CONNACK, got {other:?}"),
        }
    }

    async fn subscribe_and_expect(&mut self, packet_id: u16, filter: &str, qos: QoS, expect: SubscribeReasonCode) {
        self.write(&Packet::Subscribe(Subscribe {
            packet_id,
            filters: vec![TopicFilter { filter: filter.to_string(), qos }],
        }))
        .await;
        match self.read().await {
            Packet::SubAck(SubAck { packet_id: pid, codes }) => {
                assert_eq!(pid, packet_id);
                assert_eq!(codes, vec![expect]);
            }
            other => panic!("expected SUBACK, got {other:?}"),
        }
    }
}

fn connect_packet(client_id: &str, clean_session: bool) -> Packet {
    Packet::Connect(Box::new(Connect {
        client_id: client_id.to_string(),
        clean_session,
        keep_alive: 60,
        username: None,
        password: None,
        will: None,
    }))
}

fn publish_packet(topic: &str, payload: &[u8], qos: QoS, retain: bool, packet_id: Option<u16>) -> Packet {
    Packet::Publish(Publish {
        dup: false,
        qos,
        retain,
        topic: std::sync::Arc::from(topic),
        packet_id,
        payload: Bytes::copy_from_slice(payload),
    })
}

// --- Scenario 1: wildcard delivery -----------------------------------

#[tokio::test]
async fn wildcard_delivery() {
    let port = next_port();
    with_broker(test_config(port), |addr| async move {
        let mut subscriber = RawConn::connect(addr).await;
        subscriber.connect_and_expect("sub-a", true, false).await;
        subscriber
            .subscribe_and_expect(1, "sensors/+/temp", QoS::AtLeastOnce, SubscribeReasonCode::GrantedQoS(QoS::AtLeastOnce))
            .await;

        let mut publisher = RawConn::connect(addr).await;
        publisher.connect_and_expect("pub-a", true, false).await;

        publisher
            .write(&publish_packet("sensors/room1/temp", b"22.5", QoS::AtLeastOnce, false, Some(9)))
            .await;
        match publisher.read().await {
            Packet::PubAck(PubAck { packet_id }) => assert_eq!(packet_id, 9),
            other => panic!("expected PUBACK, got {other:?}"),
        }

        match subscriber.read().await {
            Packet::Publish(p) => {
                assert_eq!(&*p.topic, "sensors/room1/temp");
                assert_eq!(p.payload, Bytes::from_static(b"22.5"));
                assert_eq!(p.qos, QoS::AtLeastOnce);
            }
            other => panic!("expected PUBLISH, got {other:?}"),
        }

        // One level deeper matches nobody.
        publisher
            .write(&publish_packet("sensors/room1/data/temp", b"x", QoS::AtMostOnce, false, None))
            .await;
        subscriber.assert_silent(Duration::from_millis(300)).await;
    })
    .await;
}

// --- Scenario 2: system-topic isolation -------------------------------

#[tokio::test]
async fn system_topic_isolation() {
    let port = next_port();
    with_broker(test_config(port), |addr| async move {
        let mut client = RawConn::connect(addr).await;
        client.connect_and_expect("sys-client", true, false).await;
        client
            .subscribe_and_expect(1, "#", QoS::AtMostOnce, SubscribeReasonCode::GrantedQoS(QoS::AtMostOnce))
            .await;

        let mut publisher = RawConn::connect(addr).await;
        publisher.connect_and_expect("sys-pub", true, false).await;
        publisher
            .write(&publish_packet("$SYS/broker/uptime", b"1", QoS::AtMostOnce, false, None))
            .await;
        client.assert_silent(Duration::from_millis(300)).await;

        client
            .subscribe_and_expect(2, "$SYS/#", QoS::AtMostOnce, SubscribeReasonCode::GrantedQoS(QoS::AtMostOnce))
            .await;
        publisher
            .write(&publish_packet("$SYS/broker/uptime", b"2", QoS::AtMostOnce, false, None))
            .await;
        match client.read().await {
            Packet::Publish(p) => assert_eq!(&*p.topic, "$SYS/broker/uptime"),
            other => panic!("expected PUBLISH, got {other:?}"),
        }
    })
    .await;
}

// --- Scenario 3: QoS 2 exactly-once under duplicate -------------------

#[tokio::test]
async fn qos2_exactly_once_under_duplicate() {
    let port = next_port();
    with_broker(test_config(port), |addr| async move {
        let mut subscriber = RawConn::connect(addr).await;
        subscriber.connect_and_expect("qos2-sub", true, false).await;
        subscriber
            .subscribe_and_expect(1, "alerts/fire", QoS::ExactlyOnce, SubscribeReasonCode::GrantedQoS(QoS::ExactlyOnce))
            .await;

        let mut publisher = RawConn::connect(addr).await;
        publisher.connect_and_expect("qos2-pub", true, false).await;

        let publish = publish_packet("alerts/fire", b"evacuate", QoS::ExactlyOnce, false, Some(7));
        publisher.write(&publish).await;
        match publisher.read().await {
            Packet::PubRec(PubRec { packet_id }) => assert_eq!(packet_id, 7),
            other => panic!("expected PUBREC, got {other:?}"),
        }

        // Duplicate PUBLISH before PUBREL: broker must PUBREC again but not re-route.
        let Packet::Publish(mut dup) = publish else { unreachable!() };
        dup.dup = true;
        publisher.write(&Packet::Publish(dup)).await;
        match publisher.read().await {
            Packet::PubRec(PubRec { packet_id }) => assert_eq!(packet_id, 7),
            other => panic!("expected second PUBREC, got {other:?}"),
        }

        publisher.write(&Packet::PubRel(PubRel { packet_id: 7 })).await;
        match publisher.read().await {
            Packet::PubComp(PubComp { packet_id }) => assert_eq!(packet_id, 7),
            other => panic!("expected PUBCOMP, got {other:?}"),
        }

        // Exactly one delivery reaches the subscriber despite the duplicate.
        match subscriber.read().await {
            Packet::Publish(p) => assert_eq!(p.payload, Bytes::from_static(b"evacuate")),
            other => panic!("expected PUBLISH, got {other:?}"),
        }
        subscriber.assert_silent(Duration::from_millis(300)).await;
    })
    .await;
}

// --- Scenario 4: persistent session replay ----------------------------

#[tokio::test]
async fn persistent_session_replay() {
    let port = next_port();
    with_broker(test_config(port), |addr| async move {
        {
            let mut client = RawConn::connect(addr).await;
            client.connect_and_expect("persist-c", false, false).await;
            client
                .subscribe_and_expect(1, "alerts/#", QoS::AtLeastOnce, SubscribeReasonCode::GrantedQoS(QoS::AtLeastOnce))
                .await;
            // Dropped here: ungraceful disconnect, but clean_session=false keeps the session.
        }

        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut publisher = RawConn::connect(addr).await;
        publisher.connect_and_expect("persist-pub", true, false).await;
        for (i, payload) in [b"a" as &[u8], b"b", b"c"].iter().enumerate() {
            publisher
                .write(&publish_packet("alerts/smoke", payload, QoS::AtLeastOnce, false, Some((i + 1) as u16)))
                .await;
            match publisher.read().await {
                Packet::PubAck(_) => {}
                other => panic!("expected PUBACK, got {other:?}"),
            }
        }

        let mut reconnect = RawConn::connect(addr).await;
        reconnect.connect_and_expect("persist-c", false, true).await;

        let mut received = Vec::new();
        for _ in 0..3 {
            match reconnect.read().await {
                Packet::Publish(p) => {
                    let packet_id = p.packet_id.expect("QoS 1 PUBLISH must carry a packet id");
                    received.push(p.payload.to_vec());
                    reconnect.write(&Packet::PubAck(PubAck { packet_id })).await;
                }
                other => panic!("expected PUBLISH, got {other:?}"),
            }
        }

        assert_eq!(received, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    })
    .await;
}

// --- Scenario 5: retained delivery on subscribe -----------------------

#[tokio::test]
async fn retained_delivery_on_subscribe() {
    let port = next_port();
    with_broker(test_config(port), |addr| async move {
        let mut publisher = RawConn::connect(addr).await;
        publisher.connect_and_expect("retain-pub", true, false).await;
        publisher
            .write(&publish_packet("status/device1", b"online", QoS::AtLeastOnce, true, Some(1)))
            .await;
        match publisher.read().await {
            Packet::PubAck(_) => {}
            other => panic!("expected PUBACK, got {other:?}"),
        }

        let mut subscriber = RawConn::connect(addr).await;
        subscriber.connect_and_expect("retain-sub", true, false).await;
        subscriber
            .subscribe_and_expect(1, "status/+", QoS::ExactlyOnce, SubscribeReasonCode::GrantedQoS(QoS::ExactlyOnce))
            .await;

        match subscriber.read().await {
            Packet::Publish(p) => {
                assert_eq!(&*p.topic, "status/device1");
                assert_eq!(p.payload, Bytes::from_static(b"online"));
                assert_eq!(p.qos, QoS::AtLeastOnce); // min(retained QoS 1, granted QoS 2)
                assert!(p.retain);
            }
            other => panic!("expected retained PUBLISH, got {other:?}"),
        }
    })
    .await;
}

// --- Scenario 6: takeover ----------------------------------------------

#[tokio::test]
async fn takeover_evicts_prior_connection_without_will() {
    let port = next_port();
    with_broker(test_config(port), |addr| async move {
        let mut first = RawConn::connect(addr).await;
        first.connect_and_expect("takeover-x", false, false).await;

        let mut second = RawConn::connect(addr).await;
        second.connect_and_expect("takeover-x", true, false).await;

        first.assert_closed().await;

        // The new connection must survive the old one's teardown running
        // after it: the evicted task wakes on its dropped sender and
        // must not remove the *new* connections-table entry that now
        // shares this client id.
        second.write(&Packet::PingReq).await;
        match second.read().await {
            Packet::PingResp => {}
            other => panic!("expected PINGRESP on the surviving connection, got {other:?}"),
        }
    })
    .await;
}

// --- Scenario 7: will on ungraceful disconnect -------------------------

#[tokio::test]
async fn will_published_only_on_ungraceful_disconnect() {
    let port = next_port();
    with_broker(test_config(port), |addr| async move {
        let mut subscriber = RawConn::connect(addr).await;
        subscriber.connect_and_expect("will-sub", true, false).await;
        subscriber
            .subscribe_and_expect(1, "goodbye", QoS::AtLeastOnce, SubscribeReasonCode::GrantedQoS(QoS::AtLeastOnce))
            .await;

        {
            let mut dying = RawConn::connect(addr).await;
            dying
                .write(&Packet::Connect(Box::new(Connect {
                    client_id: "dying-client".to_string(),
                    clean_session: true,
                    keep_alive: 60,
                    username: None,
                    password: None,
                    will: Some(Will {
                        topic: "goodbye".to_string(),
                        payload: Bytes::from_static(b"bye"),
                        qos: QoS::AtLeastOnce,
                        retain: false,
                    }),
                })))
                .await;
            match dying.read().await {
                Packet::ConnAck(_) => {}
                other => panic!("expected CONNACK, got {other:?}"),
            }
            // Dropped here without DISCONNECT.
        }

        match subscriber.read().await {
            Packet::Publish(p) => {
                assert_eq!(&*p.topic, "goodbye");
                assert_eq!(p.payload, Bytes::from_static(b"bye"));
            }
            other => panic!("expected will PUBLISH, got {other:?}"),
        }
    })
    .await;
}

#[tokio::test]
async fn graceful_disconnect_suppresses_will() {
    let port = next_port();
    with_broker(test_config(port), |addr| async move {
        let mut subscriber = RawConn::connect(addr).await;
        subscriber.connect_and_expect("will-sub-2", true, false).await;
        subscriber
            .subscribe_and_expect(1, "goodbye2", QoS::AtLeastOnce, SubscribeReasonCode::GrantedQoS(QoS::AtLeastOnce))
            .await;

        {
            let mut client = RawConn::connect(addr).await;
            client
                .write(&Packet::Connect(Box::new(Connect {
                    client_id: "graceful-client".to_string(),
                    clean_session: true,
                    keep_alive: 60,
                    username: None,
                    password: None,
                    will: Some(Will {
                        topic: "goodbye2".to_string(),
                        payload: Bytes::from_static(b"bye"),
                        qos: QoS::AtLeastOnce,
                        retain: false,
                    }),
                })))
                .await;
            match client.read().await {
                Packet::ConnAck(_) => {}
                other => panic!("expected CONNACK, got {other:?}"),
            }
            client.write(&Packet::Disconnect).await;
        }

        subscriber.assert_silent(Duration::from_millis(300)).await;
    })
    .await;
}

// --- Protocol-level conformance ---------------------------------------

#[tokio::test]
async fn first_packet_must_be_connect() {
    let port = next_port();
    with_broker(test_config(port), |addr| async move {
        let mut conn = RawConn::connect(addr).await;
        conn.write(&Packet::PingReq).await;
        conn.assert_closed().await;
    })
    .await;
}

#[tokio::test]
async fn bad_protocol_version_gets_connack_0x01() {
    let port = next_port();
    with_broker(test_config(port), |addr| async move {
        let mut conn = RawConn::connect(addr).await;
        let mut raw = BytesMut::new();
        raw.extend_from_slice(&[0x10, 13]);
        raw.extend_from_slice(&[0x00, 0x04]);
        raw.extend_from_slice(b"MQTT");
        raw.extend_from_slice(&[5]); // unsupported protocol level
        raw.extend_from_slice(&[0x02]); // clean session
        raw.extend_from_slice(&[0x00, 0x3C]);
        raw.extend_from_slice(&[0x00, 0x00]); // empty client id
        conn.write_raw(&raw).await;

        match conn.read().await {
            Packet::ConnAck(ConnAck { return_code, .. }) => {
                assert_eq!(return_code, ConnectReturnCode::UnacceptableProtocolVersion);
            }
            other => panic!("expected CONNACK, got {other:?}"),
        }
    })
    .await;
}

#[tokio::test]
async fn empty_client_id_with_clean_session_false_is_rejected() {
    let port = next_port();
    with_broker(test_config(port), |addr| async move {
        let mut conn = RawConn::connect(addr).await;
        conn.write(&connect_packet("", false)).await;
        match conn.read().await {
            Packet::ConnAck(ConnAck { return_code, .. }) => {
                assert_eq!(return_code, ConnectReturnCode::IdentifierRejected);
            }
            other => panic!("expected CONNACK, got {other:?}"),
        }
    })
    .await;
}

#[tokio::test]
async fn subscription_over_limit_returns_suback_failure() {
    let port = next_port();
    let mut config = test_config(port);
    config.limits.max_subscriptions_per_client = 1;
    with_broker(config, |addr| async move {
        let mut conn = RawConn::connect(addr).await;
        conn.connect_and_expect("limited", true, false).await;
        conn.subscribe_and_expect(1, "a/1", QoS::AtMostOnce, SubscribeReasonCode::GrantedQoS(QoS::AtMostOnce)).await;
        conn.subscribe_and_expect(2, "a/2", QoS::AtMostOnce, SubscribeReasonCode::Failure).await;
    })
    .await;
}

#[tokio::test]
async fn oversized_payload_is_dropped_but_acked() {
    let port = next_port();
    let mut config = test_config(port);
    config.limits.max_payload_size = 8;
    with_broker(config, |addr| async move {
        let mut subscriber = RawConn::connect(addr).await;
        subscriber.connect_and_expect("oversize-sub", true, false).await;
        subscriber
            .subscribe_and_expect(1, "big/topic", QoS::AtLeastOnce, SubscribeReasonCode::GrantedQoS(QoS::AtLeastOnce))
            .await;

        let mut publisher = RawConn::connect(addr).await;
        publisher.connect_and_expect("oversize-pub", true, false).await;
        publisher
            .write(&publish_packet(
                "big/topic",
                b"this payload is far larger than 8 bytes",
                QoS::AtLeastOnce,
                false,
                Some(1),
            ))
            .await;

        // Sender still gets its PUBACK even though the message was dropped.
        match publisher.read().await {
            Packet::PubAck(PubAck { packet_id }) => assert_eq!(packet_id, 1),
            other => panic!("expected PUBACK, got {other:?}"),
        }

        subscriber.assert_silent(Duration::from_millis(300)).await;
    })
    .await;
}

#[tokio::test]
async fn unsubscribe_stops_further_delivery() {
    let port = next_port();
    with_broker(test_config(port), |addr| async move {
        let mut subscriber = RawConn::connect(addr).await;
        subscriber.connect_and_expect("unsub-c", true, false).await;
        subscriber
            .subscribe_and_expect(1, "news/tech", QoS::AtMostOnce, SubscribeReasonCode::GrantedQoS(QoS::AtMostOnce))
            .await;

        subscriber
            .write(&Packet::Unsubscribe(Unsubscribe { packet_id: 2, filters: vec!["news/tech".to_string()] }))
            .await;
        match subscriber.read().await {
            Packet::UnsubAck(ack) => assert_eq!(ack.packet_id, 2),
            other => panic!("expected UNSUBACK, got {other:?}"),
        }

        let mut publisher = RawConn::connect(addr).await;
        publisher.connect_and_expect("unsub-pub", true, false).await;
        publisher
            .write(&publish_packet("news/tech", b"breaking", QoS::AtMostOnce, false, None))
            .await;

        subscriber.assert_silent(Duration::from_millis(300)).await;
    })
    .await;
}

#[tokio::test]
async fn ping_gets_pong() {
    let port = next_port();
    with_broker(test_config(port), |addr| async move {
        let mut conn = RawConn::connect(addr).await;
        conn.connect_and_expect("ping-c", true, false).await;
        conn.write(&Packet::PingReq).await;
        match conn.read().await {
            Packet::PingResp => {}
            other => panic!("expected PINGRESP, got {other:?}"),
        }
    })
    .await;
}
