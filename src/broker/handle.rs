//! Read-only management queries and administrative commands over a
//! running broker: connected client list, per-client
//! subscription set, aggregate stats, retained-message dump, and
//! clear-retained / disconnect-client commands.

use std::rc::Rc;
use std::sync::Arc;

use crate::protocol::QoS;

use super::BrokerCore;

/// A snapshot of the counters published under `$SYS/*`.
#[derive(Debug, Clone, Default)]
pub struct BrokerStats {
    pub connected_clients: usize,
    pub total_sessions: usize,
    pub messages_received: u64,
    pub messages_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub subscription_count: usize,
    pub retained_count: usize,
}

/// A cheap, `Rc`-backed handle for querying and administering a running
/// broker from outside the connection-handling code path (CLI tooling,
/// an embedding application's own management endpoint).
#[derive(Clone)]
pub struct BrokerHandle {
    core: Rc<BrokerCore>,
}

impl BrokerHandle {
    pub(super) fn new(core: Rc<BrokerCore>) -> Self {
        Self { core }
    }

    pub fn connected_clients(&self) -> Vec<Arc<str>> {
        self.core.connections.borrow().keys().cloned().collect()
    }

    /// The filters a given client currently holds, with their granted QoS.
    pub fn subscriptions_of(&self, client_id: &str) -> Vec<(String, QoS)> {
        self.core
            .sessions
            .get(client_id)
            .map(|s| s.borrow().subscriptions.iter().map(|(f, q)| (f.clone(), *q)).collect())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> BrokerStats {
        let counters = self.core.counters.borrow();
        BrokerStats {
            connected_clients: self.core.connected_client_count(),
            total_sessions: self.core.sessions.len(),
            messages_received: counters.messages_received,
            messages_sent: counters.messages_sent,
            bytes_received: counters.bytes_received,
            bytes_sent: counters.bytes_sent,
            subscription_count: self.core.subscriptions.borrow().total_subscription_count(),
            retained_count: self.core.retained.borrow().len(),
        }
    }

    pub fn retained_dump(&self) -> Vec<(String, Vec<u8>)> {
        self.core
            .retained
            .borrow()
            .all()
            .into_iter()
            .map(|(topic, msg)| (topic, msg.payload.to_vec()))
            .collect()
    }

    /// Forcibly closes a connected client's socket without publishing
    /// its will (an administrative disconnect, not a protocol-level
    /// takeover or timeout).
    pub fn disconnect_client(&self, client_id: &str) -> bool {
        let connections = self.core.connections.borrow();
        let Some(handle) = connections.get(client_id) else {
            return false;
        };
        handle.suppress_will.set(true);
        drop(connections);
        self.core.connections.borrow_mut().remove(client_id).is_some()
    }

    pub fn clear_retained(&self, topic: &str) {
        self.core.retained.borrow_mut().clear_topic(topic);
    }
}
