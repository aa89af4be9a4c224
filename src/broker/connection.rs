//! Per-socket connection handler: read a packet, dispatch by
//! type, enforce keep-alive, publish a will on ungraceful disconnect.
//!
//! One task per accepted socket, `spawn_local`'d onto the broker's
//! `LocalSet`. A single `tokio::select!` loop multiplexes the socket
//! read half against the `mpsc::UnboundedReceiver` half of this
//! client's [`super::ConnectionHandle`] — the latter carries
//! already-encoded bytes queued by the router (fan-out) or the retry
//! scanner (retransmission), and its closing (sender dropped, e.g. on
//! takeover or keep-alive eviction) is this task's external "please
//! stop" signal.
//!
//! States: `AwaitConnect -> Connected -> Disconnecting -> Closed`.
//! Only `Connected` is reachable by the router (it requires an entry
//! in `BrokerCore::connections`).

use std::cell::Cell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::codec::{Decoder, Encoder};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, ConnectionError, Packet, PubAck, PubComp, PubRec, PubRel,
    Publish, QoS, SubAck, SubscribeReasonCode, UnsubAck,
};
use crate::session::qos::{self, InboundQos2Outcome};
use crate::session::Will as SessionWill;
use crate::topic::{validate_topic_filter_with_max_levels, validate_topic_name_with_max_levels};

use super::{router, BrokerCore, ConnectionHandle};

static ANONYMOUS_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    AwaitConnect,
    Connected,
    Disconnecting,
    Closed,
}

/// Owns one accepted socket for its lifetime.
pub struct ConnectionTask {
    stream: TcpStream,
    addr: SocketAddr,
    core: Rc<BrokerCore>,
    decoder: Decoder,
    encoder: Encoder,
    read_buf: BytesMut,
    state: ConnState,
    client_id: Option<Arc<str>>,
    rx: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    suppress_will: Option<Rc<Cell<bool>>>,
    connection_token: u64,
}

impl ConnectionTask {
    pub fn new(stream: TcpStream, addr: SocketAddr, core: Rc<BrokerCore>) -> Self {
        let decoder = Decoder::new().with_max_packet_size(core.config.limits.max_packet_size);
        let recv_buffer_size = core.config.limits.recv_buffer_size;
        Self {
            stream,
            addr,
            core,
            decoder,
            encoder: Encoder::new(),
            read_buf: BytesMut::with_capacity(recv_buffer_size),
            state: ConnState::AwaitConnect,
            client_id: None,
            rx: None,
            suppress_will: None,
            connection_token: 0,
        }
    }

    pub async fn run(mut self) -> Result<(), ConnectionError> {
        let connect_timeout = self.core.config.timing.connect_timeout();
        let connect = match timeout(connect_timeout, self.read_first_packet()).await {
            Ok(result) => result?,
            Err(_) => {
                debug!(addr = %self.addr, "connect timeout");
                return Err(ConnectionError::KeepAliveTimeout);
            }
        };

        if let Err(e) = self.handle_connect(connect).await {
            self.teardown(false).await;
            return Err(e);
        }

        let result = self.run_connected().await;
        let graceful = matches!(self.state, ConnState::Disconnecting);
        self.teardown(graceful).await;
        result
    }

    /// Blocks until the first complete packet arrives and returns it
    /// if it is a CONNECT; any other first packet, or a socket close,
    /// is a protocol violation.
    async fn read_first_packet(&mut self) -> Result<Connect, ConnectionError> {
        loop {
            if let Some(parsed) = self.decoder.decode(&self.read_buf)? {
                self.read_buf.advance(parsed.consumed);
                return match parsed.packet {
                    Packet::Connect(connect) => Ok(*connect),
                    _ => Err(ConnectionError::ProtocolViolation(
                        "first packet must be CONNECT",
                    )),
                };
            }
            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(ConnectionError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed before CONNECT",
                )));
            }
            self.core.counters.borrow_mut().bytes_received += n as u64;
        }
    }

    /// Runs the CONNECT handshake. On success,
    /// `self.client_id`/`self.rx`/`self.suppress_will` are set and
    /// `self.state == Connected`.
    async fn handle_connect(&mut self, connect: Connect) -> Result<(), ConnectionError> {
        let config = &self.core.config;

        // [MQTT-3.1.3-8] empty client id with clean_session=false is rejected outright.
        if connect.client_id.is_empty() && !connect.clean_session {
            return self.reject_connect(ConnectReturnCode::IdentifierRejected).await;
        }
        if connect.client_id.is_empty() && !config.mqtt.allow_zero_length_clientid {
            return self.reject_connect(ConnectReturnCode::IdentifierRejected).await;
        }

        let client_id: Arc<str> = if connect.client_id.is_empty() {
            Arc::from(generate_client_id(self.addr))
        } else {
            Arc::from(connect.client_id.as_str())
        };

        if connect.username.is_none() && !config.mqtt.allow_anonymous {
            return self.reject_connect(ConnectReturnCode::NotAuthorized).await;
        }

        let authenticated = self.core.auth.authenticate(
            &client_id,
            connect.username.as_deref(),
            connect.password.as_deref(),
        );
        if !authenticated {
            return self.reject_connect(ConnectReturnCode::BadUsernameOrPassword).await;
        }

        if self.core.connected_client_count() >= config.limits.max_clients {
            warn!(%client_id, "max_clients reached, rejecting connection");
            return self.reject_connect(ConnectReturnCode::ServerUnavailable).await;
        }

        // Evict any existing connection for this client id before taking
        // over its session — no will publication for the evicted side.
        {
            let connections = self.core.connections.borrow();
            if let Some(existing) = connections.get(&client_id) {
                existing.suppress_will.set(true);
            }
        }
        self.core.connections.borrow_mut().remove(&client_id);

        let takeover = self.core.sessions.create_or_takeover(
            &client_id,
            connect.clean_session,
            connect.keep_alive,
            config.limits.max_queued_messages,
            config.limits.max_inflight as usize,
        );
        if connect.clean_session {
            self.core.subscriptions.borrow_mut().unsubscribe_all(&client_id);
        }
        if let Some(will) = connect.will {
            takeover.session.borrow_mut().will = Some(SessionWill {
                topic: will.topic,
                payload: will.payload,
                qos: will.qos,
                retain: will.retain,
            });
        }

        let (tx, rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let suppress_will = Rc::new(Cell::new(false));
        let token = super::next_connection_token();
        self.core.connections.borrow_mut().insert(
            client_id.clone(),
            ConnectionHandle {
                sender: tx,
                suppress_will: suppress_will.clone(),
                token,
            },
        );

        self.client_id = Some(client_id.clone());
        self.rx = Some(rx);
        self.suppress_will = Some(suppress_will);
        self.connection_token = token;
        self.state = ConnState::Connected;
        self.core.counters.borrow_mut().clients_total += 1;

        self.write_packet(&Packet::ConnAck(ConnAck {
            session_present: takeover.session_present,
            return_code: ConnectReturnCode::Accepted,
        }))
        .await?;

        info!(%client_id, addr = %self.addr, session_present = takeover.session_present, "client connected");
        self.core.hooks.on_connect(&client_id, connect.username.as_deref());
        router::flush_offline_queue(&self.core, &client_id);

        Ok(())
    }

    async fn reject_connect(&mut self, code: ConnectReturnCode) -> Result<(), ConnectionError> {
        let _ = self
            .write_packet(&Packet::ConnAck(ConnAck {
                session_present: false,
                return_code: code,
            }))
            .await;
        Err(ConnectionError::ConnectRejected(code))
    }

    async fn run_connected(&mut self) -> Result<(), ConnectionError> {
        let client_id = self.client_id.clone().expect("connected before run_connected");
        let mut rx = self.rx.take().expect("rx set by handle_connect");

        let result = loop {
            while let Some(parsed) = self.decoder.decode(&self.read_buf)? {
                self.read_buf.advance(parsed.consumed);
                if let Some(session) = self.core.sessions.get(&client_id) {
                    session.borrow_mut().touch();
                }
                self.core.counters.borrow_mut().messages_received += 1;

                if matches!(parsed.packet, Packet::Disconnect) {
                    if let Some(session) = self.core.sessions.get(&client_id) {
                        session.borrow_mut().will = None;
                    }
                    self.state = ConnState::Disconnecting;
                    self.rx = Some(rx);
                    return Ok(());
                }

                if let Err(e) = self.dispatch(&client_id, parsed.packet).await {
                    self.rx = Some(rx);
                    return Err(e);
                }
            }

            tokio::select! {
                read_result = self.stream.read_buf(&mut self.read_buf) => {
                    match read_result {
                        Ok(0) => break Err(ConnectionError::Io(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "connection closed",
                        ))),
                        Ok(n) => {
                            self.core.counters.borrow_mut().bytes_received += n as u64;
                        }
                        Err(e) => break Err(ConnectionError::Io(e)),
                    }
                }
                outgoing = rx.recv() => {
                    match outgoing {
                        Some(bytes) => {
                            if let Err(e) = self.stream.write_all(&bytes).await {
                                break Err(ConnectionError::Io(e));
                            }
                        }
                        None => {
                            // Our entry in the connections table was
                            // removed by someone else (takeover, admin
                            // disconnect, or keep-alive timeout).
                            break Err(ConnectionError::KeepAliveTimeout);
                        }
                    }
                }
            }
        };
        self.rx = Some(rx);
        result
    }

    async fn dispatch(&mut self, client_id: &Arc<str>, packet: Packet) -> Result<(), ConnectionError> {
        match packet {
            Packet::Publish(publish) => self.handle_publish(client_id, publish).await,
            Packet::PubAck(ack) => {
                if let Some(session) = self.core.sessions.get(client_id) {
                    qos::on_puback(&mut session.borrow_mut(), ack.packet_id);
                }
                Ok(())
            }
            Packet::PubRec(rec) => {
                let should_reply = self
                    .core
                    .sessions
                    .get(client_id)
                    .map(|s| qos::on_pubrec(&mut s.borrow_mut(), rec.packet_id))
                    .unwrap_or(false);
                if should_reply {
                    self.write_packet(&Packet::PubRel(PubRel { packet_id: rec.packet_id })).await?;
                }
                Ok(())
            }
            Packet::PubRel(rel) => {
                if let Some(session) = self.core.sessions.get(client_id) {
                    qos::on_pubrel(&mut session.borrow_mut(), rel.packet_id);
                }
                self.write_packet(&Packet::PubComp(PubComp { packet_id: rel.packet_id })).await
            }
            Packet::PubComp(comp) => {
                if let Some(session) = self.core.sessions.get(client_id) {
                    qos::on_pubcomp(&mut session.borrow_mut(), comp.packet_id);
                }
                Ok(())
            }
            Packet::Subscribe(sub) => self.handle_subscribe(client_id, sub).await,
            Packet::Unsubscribe(unsub) => self.handle_unsubscribe(client_id, unsub).await,
            Packet::PingReq => self.write_packet(&Packet::PingResp).await,
            Packet::Disconnect => unreachable!("handled in run_connected"),
            Packet::Connect(_) => Err(ConnectionError::ProtocolViolation(
                "CONNECT received on an already-connected session",
            )),
            Packet::ConnAck(_) | Packet::SubAck(_) | Packet::UnsubAck(_) => Err(
                ConnectionError::ProtocolViolation("server-bound packet of a client-to-server type"),
            ),
        }
    }

    async fn handle_publish(&mut self, client_id: &Arc<str>, publish: Publish) -> Result<(), ConnectionError> {
        let config = &self.core.config;

        if publish.topic.len() > config.limits.max_topic_length
            || validate_topic_name_with_max_levels(&publish.topic, config.limits.max_topic_levels).is_err()
        {
            return Err(ConnectionError::ProtocolViolation("invalid topic name"));
        }

        let mut qos_level = publish.qos;
        if qos_level == QoS::ExactlyOnce && !config.mqtt.qos2_enabled {
            qos_level = QoS::AtLeastOnce;
        }

        let oversized = publish.payload.len() > config.limits.max_payload_size;
        let authorized = self.core.auth.authorize_publish(client_id, &publish.topic);
        let routable = !oversized && authorized;

        if oversized {
            warn!(%client_id, topic = %publish.topic, len = publish.payload.len(), "dropping oversized PUBLISH payload");
        }

        let retain = publish.retain && config.mqtt.retain_enabled;

        match qos_level {
            QoS::AtMostOnce => {
                if routable {
                    router::route(&self.core, client_id, publish.topic.to_string(), publish.payload, qos_level, retain);
                }
            }
            QoS::AtLeastOnce => {
                if routable {
                    router::route(&self.core, client_id, publish.topic.to_string(), publish.payload.clone(), qos_level, retain);
                }
                let packet_id = publish.packet_id.ok_or(ConnectionError::ProtocolViolation(
                    "QoS 1 PUBLISH missing packet identifier",
                ))?;
                self.write_packet(&Packet::PubAck(PubAck { packet_id })).await?;
            }
            QoS::ExactlyOnce => {
                let packet_id = publish.packet_id.ok_or(ConnectionError::ProtocolViolation(
                    "QoS 2 PUBLISH missing packet identifier",
                ))?;
                let outcome = self
                    .core
                    .sessions
                    .get(client_id)
                    .map(|s| qos::on_inbound_qos2_publish(&mut s.borrow_mut(), packet_id))
                    .unwrap_or(InboundQos2Outcome::RouteAndAck);
                if routable && outcome == InboundQos2Outcome::RouteAndAck {
                    router::route(&self.core, client_id, publish.topic.to_string(), publish.payload, qos_level, retain);
                }
                self.write_packet(&Packet::PubRec(PubRec { packet_id })).await?;
            }
        }
        Ok(())
    }

    async fn handle_subscribe(
        &mut self,
        client_id: &Arc<str>,
        sub: crate::protocol::Subscribe,
    ) -> Result<(), ConnectionError> {
        let max_topic_levels = self.core.config.limits.max_topic_levels;
        let mut codes = Vec::with_capacity(sub.filters.len());

        for filter in &sub.filters {
            let code = self.grant_one_subscription(client_id, &filter.filter, filter.qos, max_topic_levels);
            codes.push(code);
        }

        self.write_packet(&Packet::SubAck(SubAck { packet_id: sub.packet_id, codes })).await
    }

    fn grant_one_subscription(
        &self,
        client_id: &Arc<str>,
        filter: &str,
        requested_qos: QoS,
        max_topic_levels: usize,
    ) -> SubscribeReasonCode {
        use crate::auth::SubscribeAuthorization;

        if validate_topic_filter_with_max_levels(filter, max_topic_levels).is_err() {
            return SubscribeReasonCode::Failure;
        }

        let ceiling = match self.core.auth.authorize_subscribe(client_id, filter) {
            SubscribeAuthorization::Denied => return SubscribeReasonCode::Failure,
            SubscribeAuthorization::Granted(qos) => qos,
        };
        let candidate = requested_qos.min(ceiling);

        let Some(granted) = self.core.hooks.on_subscribe(client_id, filter, candidate) else {
            return SubscribeReasonCode::Failure;
        };

        let accepted = self.core.subscriptions.borrow_mut().subscribe(filter, client_id.clone(), granted);
        if !accepted {
            return SubscribeReasonCode::Failure;
        }

        if let Some(session) = self.core.sessions.get(client_id) {
            session.borrow_mut().subscriptions.insert(filter.to_string(), granted);
        }
        router::deliver_retained(&self.core, client_id, filter, granted);
        SubscribeReasonCode::GrantedQoS(granted)
    }

    async fn handle_unsubscribe(
        &mut self,
        client_id: &Arc<str>,
        unsub: crate::protocol::Unsubscribe,
    ) -> Result<(), ConnectionError> {
        for filter in &unsub.filters {
            self.core.subscriptions.borrow_mut().unsubscribe(filter, client_id);
            if let Some(session) = self.core.sessions.get(client_id) {
                session.borrow_mut().subscriptions.remove(filter);
            }
            self.core.hooks.on_unsubscribe(client_id, filter);
        }
        self.write_packet(&Packet::UnsubAck(UnsubAck { packet_id: unsub.packet_id })).await
    }

    async fn write_packet(&mut self, packet: &Packet) -> Result<(), ConnectionError> {
        let mut buf = BytesMut::new();
        self.encoder.encode(packet, &mut buf)?;
        let len = buf.len() as u64;
        self.stream.write_all(&buf).await?;
        let mut counters = self.core.counters.borrow_mut();
        counters.messages_sent += 1;
        counters.bytes_sent += len;
        if matches!(packet, Packet::Publish(_)) {
            counters.publish_sent += 1;
        }
        Ok(())
    }

    /// Tears down the session on the way out of [`Self::run`]: detaches
    /// from the session store, removes the connection-table entry (if
    /// still ours), and publishes the will unless this was a graceful
    /// DISCONNECT or an external eviction suppressed it.
    async fn teardown(&mut self, graceful: bool) {
        let Some(client_id) = self.client_id.clone() else {
            return;
        };

        let suppressed = self.suppress_will.as_ref().map(|c| c.get()).unwrap_or(false);

        // Only remove our own entry: a takeover inserts the new
        // connection's handle (with a new token) before evicting us, so
        // by the time we get here `connections` may already hold a
        // different, live connection for this client id.
        {
            let mut connections = self.core.connections.borrow_mut();
            let is_ours = connections
                .get(&client_id)
                .map(|h| h.token == self.connection_token)
                .unwrap_or(false);
            if is_ours {
                connections.remove(&client_id);
            }
        }

        let will = if !graceful && !suppressed {
            self.core
                .sessions
                .get(&client_id)
                .and_then(|s| s.borrow_mut().will.take())
        } else {
            None
        };

        if self.core.sessions.detach(&client_id) {
            self.core.subscriptions.borrow_mut().unsubscribe_all(&client_id);
        }
        self.core.hooks.on_disconnect(&client_id, graceful);
        self.core.auth.forget_client(&client_id);

        if let Some(will) = will {
            if self.core.hooks.on_will_publish(&client_id, &will.topic) {
                router::route(&self.core, &client_id, will.topic, will.payload, will.qos, will.retain);
            }
        }

        self.state = ConnState::Closed;
        debug!(%client_id, graceful, "connection closed");
    }
}

fn generate_client_id(addr: SocketAddr) -> String {
    let n = ANONYMOUS_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("edgemq-anon-{}-{}", addr.port(), n)
}
