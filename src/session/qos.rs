//! QoS 1/2 state machines, implemented as plain functions over
//! `&mut Session` rather than a struct with methods — both the
//! connection task (inbound handling, initial send) and the broker's
//! retry scanner (background retransmission) call into the same
//! functions, and neither owns a `Session` long enough to justify
//! wrapping these in their own type.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::protocol::QoS;

use super::{OutflightEntry, OutflightState, PendingMessage, Session};

/// Allocates the next free packet identifier for outbound use,
/// skipping any id currently in `inflight_out`. Returns `None` if
/// every id in 1..=65535 is in use (i.e. `max_inflight` was
/// misconfigured above the inflight cap, or overridden).
fn allocate_packet_id(session: &mut Session) -> Option<u16> {
    let start = session.next_packet_id;
    loop {
        let id = session.next_packet_id;
        session.next_packet_id = if session.next_packet_id == u16::MAX {
            1
        } else {
            session.next_packet_id + 1
        };
        if !session.inflight_out.contains_key(&id) {
            return Some(id);
        }
        if session.next_packet_id == start {
            return None;
        }
    }
}

/// The lower of two QoS levels — the QoS at which a message is
/// actually delivered to a given subscriber.
pub fn effective_qos(publish_qos: QoS, granted_qos: QoS) -> QoS {
    publish_qos.min(granted_qos)
}

/// Registers outbound QoS≥1 state for a message about to be sent to
/// an online session, returning the packet_id to encode. `QoS::AtMostOnce`
/// needs no inflight bookkeeping and always returns `None`. Returns
/// `None` for QoS≥1 too when the inflight table is full — the caller
/// should offline-queue the message instead of sending it.
pub fn begin_outbound(session: &mut Session, topic: Arc<str>, payload: Bytes, qos: QoS) -> Option<u16> {
    if qos == QoS::AtMostOnce {
        return None;
    }
    if session.is_inflight_full() {
        return None;
    }
    let packet_id = allocate_packet_id(session)?;
    let state = if qos == QoS::AtLeastOnce {
        OutflightState::AwaitPuback
    } else {
        OutflightState::AwaitPubrec
    };
    session.inflight_out.insert(
        packet_id,
        OutflightEntry {
            topic,
            payload,
            qos,
            state,
            last_sent_at: Instant::now(),
            attempts: 0,
        },
    );
    Some(packet_id)
}

/// A PUBACK arrived for `packet_id`. Returns `true` if it matched a
/// live `AwaitPuback` entry (which is then removed).
pub fn on_puback(session: &mut Session, packet_id: u16) -> bool {
    match session.inflight_out.get(&packet_id) {
        Some(entry) if entry.state == OutflightState::AwaitPuback => {
            session.inflight_out.remove(&packet_id);
            true
        }
        _ => false,
    }
}

/// A PUBREC arrived for `packet_id`. Returns `true` if the caller
/// should now send PUBREL (the entry transitions to `AwaitPubcomp`).
pub fn on_pubrec(session: &mut Session, packet_id: u16) -> bool {
    match session.inflight_out.get_mut(&packet_id) {
        Some(entry) if entry.state == OutflightState::AwaitPubrec => {
            entry.state = OutflightState::AwaitPubcomp;
            entry.last_sent_at = Instant::now();
            entry.attempts = 0;
            true
        }
        _ => false,
    }
}

/// A PUBCOMP arrived for `packet_id`. Returns `true` if it matched a
/// live `AwaitPubcomp` entry (which is then removed and its packet_id
/// freed for reuse).
pub fn on_pubcomp(session: &mut Session, packet_id: u16) -> bool {
    match session.inflight_out.get(&packet_id) {
        Some(entry) if entry.state == OutflightState::AwaitPubcomp => {
            session.inflight_out.remove(&packet_id);
            true
        }
        _ => false,
    }
}

/// What the inbound handler does with a just-received QoS 2 PUBLISH.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundQos2Outcome {
    /// First time seeing this packet_id: route it, then send PUBREC.
    RouteAndAck,
    /// A duplicate of a packet_id already awaiting PUBREL: send PUBREC
    /// again but do not route a second time.
    AckOnlyDuplicate,
}

/// Handles an inbound QoS 2 PUBLISH (DUP or not): routing
/// happens exactly once per packet_id regardless of how many times
/// the PUBLISH is retransmitted before PUBREL.
pub fn on_inbound_qos2_publish(session: &mut Session, packet_id: u16) -> InboundQos2Outcome {
    if session.inflight_in.insert(packet_id) {
        InboundQos2Outcome::RouteAndAck
    } else {
        InboundQos2Outcome::AckOnlyDuplicate
    }
}

/// A PUBREL arrived for `packet_id`. Always send PUBCOMP, even if the
/// id was not tracked (state may have been lost across a restart).
pub fn on_pubrel(session: &mut Session, packet_id: u16) {
    session.inflight_in.remove(&packet_id);
}

/// Pushes a message onto a session's bounded offline queue,
/// drop-oldest on overflow. Never called for QoS 0 — those are never
/// queued.
pub fn enqueue_offline(session: &mut Session, topic: Arc<str>, payload: Bytes, qos: QoS, retain: bool) {
    if session.offline_queue.len() >= session.max_queued_messages {
        session.offline_queue.pop_front();
    }
    session.offline_queue.push_back(PendingMessage {
        topic,
        payload,
        qos,
        retain,
    });
}

/// Drains the offline queue so it can be flushed through
/// [`begin_outbound`] once the session reconnects.
pub fn drain_offline(session: &mut Session) -> std::collections::VecDeque<PendingMessage> {
    std::mem::take(&mut session.offline_queue)
}

/// What the retry scanner should do for one outstanding entry.
#[derive(Debug, Clone)]
pub enum RetryAction {
    ResendPublish {
        packet_id: u16,
        topic: Arc<str>,
        payload: Bytes,
        qos: QoS,
    },
    ResendPubrel {
        packet_id: u16,
    },
    Dropped {
        packet_id: u16,
    },
}

/// Scans a session's outbound inflight table for entries overdue for
/// retransmission: an entry is resent with `attempts`
/// incremented once per `retry_interval` that elapses without the
/// expected ack, and dropped once `attempts` reaches `max_retries`
/// (so the message is sent a total of `max_retries + 1` times before
/// being abandoned).
pub fn scan_retries(session: &mut Session, retry_interval: Duration, max_retries: u32) -> Vec<RetryAction> {
    let mut actions = Vec::new();
    let mut to_drop = Vec::new();

    for (&packet_id, entry) in session.inflight_out.iter_mut() {
        if entry.last_sent_at.elapsed() < retry_interval {
            continue;
        }
        if entry.attempts >= max_retries {
            to_drop.push(packet_id);
            continue;
        }
        entry.attempts += 1;
        entry.last_sent_at = Instant::now();
        match entry.state {
            OutflightState::AwaitPuback | OutflightState::AwaitPubrec => {
                actions.push(RetryAction::ResendPublish {
                    packet_id,
                    topic: entry.topic.clone(),
                    payload: entry.payload.clone(),
                    qos: entry.qos,
                });
            }
            OutflightState::AwaitPubcomp => {
                actions.push(RetryAction::ResendPubrel { packet_id });
            }
        }
    }

    for packet_id in to_drop {
        session.inflight_out.remove(&packet_id);
        actions.push(RetryAction::Dropped { packet_id });
    }

    actions
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;

    fn make_session() -> Session {
        Session::new(StdArc::from("client-1"), false, 60, 50, 10)
    }

    #[test]
    fn qos0_never_enters_inflight() {
        let mut session = make_session();
        let id = begin_outbound(&mut session, StdArc::from("a/b"), Bytes::from_static(b"x"), QoS::AtMostOnce);
        assert_eq!(id, None);
        assert!(session.inflight_out.is_empty());
    }

    #[test]
    fn qos1_roundtrip_frees_packet_id() {
        let mut session = make_session();
        let id = begin_outbound(&mut session, StdArc::from("a/b"), Bytes::from_static(b"x"), QoS::AtLeastOnce).unwrap();
        assert!(session.inflight_out.contains_key(&id));
        assert!(on_puback(&mut session, id));
        assert!(session.inflight_out.is_empty());
    }

    #[test]
    fn qos2_full_handshake() {
        let mut session = make_session();
        let id = begin_outbound(&mut session, StdArc::from("a/b"), Bytes::from_static(b"x"), QoS::ExactlyOnce).unwrap();
        assert!(on_pubrec(&mut session, id));
        assert_eq!(session.inflight_out.get(&id).unwrap().state, OutflightState::AwaitPubcomp);
        assert!(on_pubcomp(&mut session, id));
        assert!(session.inflight_out.is_empty());
    }

    #[test]
    fn puback_for_unknown_id_is_rejected() {
        let mut session = make_session();
        assert!(!on_puback(&mut session, 42));
    }

    #[test]
    fn inbound_qos2_duplicate_does_not_reroute() {
        let mut session = make_session();
        assert_eq!(on_inbound_qos2_publish(&mut session, 7), InboundQos2Outcome::RouteAndAck);
        assert_eq!(on_inbound_qos2_publish(&mut session, 7), InboundQos2Outcome::AckOnlyDuplicate);
        on_pubrel(&mut session, 7);
        assert!(!session.inflight_in.contains(&7));
    }

    #[test]
    fn pubrel_on_untracked_id_is_a_noop_not_a_panic() {
        let mut session = make_session();
        on_pubrel(&mut session, 999);
    }

    #[test]
    fn offline_queue_drops_oldest_on_overflow() {
        let mut session = make_session();
        session.max_queued_messages = 2;
        enqueue_offline(&mut session, StdArc::from("a"), Bytes::from_static(b"1"), QoS::AtLeastOnce, false);
        enqueue_offline(&mut session, StdArc::from("b"), Bytes::from_static(b"2"), QoS::AtLeastOnce, false);
        enqueue_offline(&mut session, StdArc::from("c"), Bytes::from_static(b"3"), QoS::AtLeastOnce, false);
        let drained = drain_offline(&mut session);
        let topics: Vec<&str> = drained.iter().map(|m| &*m.topic).collect();
        assert_eq!(topics, vec!["b", "c"]);
    }

    #[test]
    fn retry_scan_resends_publish_then_drops_after_max_retries() {
        let mut session = make_session();
        let id = begin_outbound(&mut session, StdArc::from("a/b"), Bytes::from_static(b"x"), QoS::AtLeastOnce).unwrap();
        session.inflight_out.get_mut(&id).unwrap().last_sent_at =
            Instant::now() - Duration::from_secs(100);

        for expected_attempts in 1..=3 {
            let actions = scan_retries(&mut session, Duration::from_secs(1), 3);
            assert_eq!(actions.len(), 1);
            assert!(matches!(actions[0], RetryAction::ResendPublish { .. }));
            assert_eq!(session.inflight_out.get(&id).unwrap().attempts, expected_attempts);
            session.inflight_out.get_mut(&id).unwrap().last_sent_at =
                Instant::now() - Duration::from_secs(100);
        }

        let actions = scan_retries(&mut session, Duration::from_secs(1), 3);
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], RetryAction::Dropped { packet_id: p } if p == id));
        assert!(session.inflight_out.is_empty());
    }

    #[test]
    fn effective_qos_takes_the_lower_level() {
        assert_eq!(effective_qos(QoS::ExactlyOnce, QoS::AtLeastOnce), QoS::AtLeastOnce);
        assert_eq!(effective_qos(QoS::AtMostOnce, QoS::ExactlyOnce), QoS::AtMostOnce);
    }
}
