//! Publish routing: interceptor pipeline, retained-store
//! update, subscriber fan-out through the QoS engine, and retained
//! replay for new SUBSCRIBEs.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};

use crate::codec::Encoder;
use crate::hooks::MessageContext;
use crate::protocol::{Packet, Publish, PubRel, QoS};
use crate::session::qos::{self, RetryAction};

use super::BrokerCore;

/// Routes one PUBLISH from `sender_id`. Returns `false` if an
/// interceptor dropped the message.
pub fn route(core: &BrokerCore, sender_id: &str, topic: String, payload: Bytes, qos_level: QoS, retain: bool) -> bool {
    let mut ctx = MessageContext::new(topic, payload, qos_level, retain);
    core.interceptors.run(&mut ctx);

    core.counters.borrow_mut().publish_received += 1;

    if ctx.is_dropped() {
        return false;
    }

    if ctx.retain {
        core.retained.borrow_mut().publish(&ctx.topic, ctx.payload.clone(), ctx.qos);
    }

    let topic: Arc<str> = Arc::from(ctx.topic.as_str());
    let subscribers = core.subscriptions.borrow().matches(&topic);
    for sub in subscribers {
        let effective = qos::effective_qos(ctx.qos, sub.qos);
        deliver(core, &sub.client_id, topic.clone(), ctx.payload.clone(), effective, false);
    }

    core.hooks.on_publish(sender_id, &topic, &ctx.payload, ctx.qos, ctx.retain);
    true
}

/// Delivers every retained message matching `filter` to `client_id` at
/// the subscription's granted QoS: new SUBSCRIBEs replay
/// retained messages with `QoS = min(retained.qos, granted.qos)` and
/// the retain flag set.
pub fn deliver_retained(core: &BrokerCore, client_id: &str, filter: &str, granted_qos: QoS) {
    let matches = core.retained.borrow().matching(filter);
    for (topic, msg) in matches {
        let effective = qos::effective_qos(msg.qos, granted_qos);
        deliver(core, client_id, Arc::from(topic.as_str()), msg.payload, effective, true);
    }
}

/// Delivers one message to one subscriber: registers outbound QoS≥1
/// state and sends immediately if the session is online, or offline-
/// queues it. QoS 0 for an offline session is simply dropped.
fn deliver(core: &BrokerCore, client_id: &str, topic: Arc<str>, payload: Bytes, qos_level: QoS, retain: bool) {
    let Some(session) = core.sessions.get(client_id) else {
        return;
    };

    let online = core.connections.borrow().contains_key(client_id);
    let packet_id = if online {
        let mut s = session.borrow_mut();
        qos::begin_outbound(&mut s, topic.clone(), payload.clone(), qos_level)
    } else {
        None
    };

    if online && (qos_level == QoS::AtMostOnce || packet_id.is_some()) {
        let publish = Publish {
            dup: false,
            qos: qos_level,
            retain,
            topic,
            packet_id,
            payload,
        };
        send(core, client_id, &Packet::Publish(publish));
        return;
    }

    if qos_level == QoS::AtMostOnce {
        return;
    }

    let mut s = session.borrow_mut();
    qos::enqueue_offline(&mut s, topic, payload, qos_level, retain);
}

/// Flushes a session's offline queue (and any messages it missed while
/// its inflight table was full) through the QoS engine. Called right
/// after CONNACK is sent on a resumed session.
pub fn flush_offline_queue(core: &BrokerCore, client_id: &str) {
    let Some(session) = core.sessions.get(client_id) else {
        return;
    };
    let drained = {
        let mut s = session.borrow_mut();
        qos::drain_offline(&mut s)
    };
    for msg in drained {
        deliver(core, client_id, msg.topic, msg.payload, msg.qos, msg.retain);
    }
}

/// Scans every connected session's outbound inflight table for overdue
/// retransmissions, resending PUBLISH/PUBREL as needed and dropping
/// entries that exhausted `qos_max_retries`.
pub fn scan_retries(core: &BrokerCore, retry_interval: Duration, max_retries: u32) {
    for client_id in core.sessions.client_ids() {
        if !core.connections.borrow().contains_key(&client_id) {
            continue;
        }
        let Some(session) = core.sessions.get(&client_id) else {
            continue;
        };
        let actions = {
            let mut s = session.borrow_mut();
            qos::scan_retries(&mut s, retry_interval, max_retries)
        };
        for action in actions {
            match action {
                RetryAction::ResendPublish { packet_id, topic, payload, qos: q } => {
                    let publish = Publish {
                        dup: true,
                        qos: q,
                        retain: false,
                        topic,
                        packet_id: Some(packet_id),
                        payload,
                    };
                    send(core, &client_id, &Packet::Publish(publish));
                }
                RetryAction::ResendPubrel { packet_id } => {
                    send(core, &client_id, &Packet::PubRel(PubRel { packet_id }));
                }
                RetryAction::Dropped { packet_id } => {
                    tracing::warn!(%client_id, packet_id, "dropping undelivered QoS message after max retries");
                }
            }
        }
    }
}

/// Encodes `packet` and hands it to the connection task's write half.
/// A missing or closed connection entry is not an error here — the
/// caller already decided the session was online based on a possibly
/// just-stale snapshot.
pub fn send(core: &BrokerCore, client_id: &str, packet: &Packet) -> bool {
    let connections = core.connections.borrow();
    let Some(handle) = connections.get(client_id) else {
        return false;
    };
    let mut buf = BytesMut::new();
    if Encoder::new().encode(packet, &mut buf).is_err() {
        return false;
    }
    let len = buf.len() as u64;
    let sent = handle.sender.send(buf.to_vec()).is_ok();
    if sent {
        drop(connections);
        let mut counters = core.counters.borrow_mut();
        counters.messages_sent += 1;
        counters.bytes_sent += len;
        if matches!(packet, Packet::Publish(_)) {
            counters.publish_sent += 1;
        }
    }
    sent
}
