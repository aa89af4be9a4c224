//! Topic matching and subscription management.
//!
//! A trie keyed by `/`-separated topic levels backs both subscription
//! lookup and retained-message storage. The broker owns a single
//! `SubscriptionStore`/`RetainedStore` pair behind `Rc<RefCell<_>>`; there
//! is no internal locking here since all mutation happens on the single
//! event-loop thread between `.await` points.

mod trie;
pub mod validation;

pub use trie::TopicTrie;
pub use validation::{
    topic_matches_filter, validate_topic_filter, validate_topic_filter_with_max_levels,
    validate_topic_name, validate_topic_name_with_max_levels, TopicLevel,
};

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;

use crate::protocol::QoS;

/// A single client's grant for a topic filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub client_id: Arc<str>,
    pub qos: QoS,
}

/// A retained message stored for an exact topic path.
#[derive(Debug, Clone)]
pub struct RetainedMessage {
    pub payload: Bytes,
    pub qos: QoS,
}

/// Subscription tree plus per-client subscription accounting.
///
/// `subscribe`/`unsubscribe` operate on exact filter strings; shared
/// subscriptions (`$share/...`) are not supported.
pub struct SubscriptionStore {
    trie: TopicTrie<Vec<Subscription>>,
    /// Filters each client currently holds, used to enforce
    /// `max_subscriptions_per_client` and to drive `unsubscribe_all`.
    per_client_filters: HashMap<Arc<str>, Vec<String>>,
    max_subscriptions_per_client: usize,
}

impl SubscriptionStore {
    pub fn new(max_subscriptions_per_client: usize) -> Self {
        Self {
            trie: TopicTrie::new(),
            per_client_filters: HashMap::new(),
            max_subscriptions_per_client,
        }
    }

    /// Add or upgrade a subscription. Returns `false` (caller should grant
    /// SUBACK failure 0x80) if the client is not already subscribed to this
    /// filter and is at its subscription-count limit.
    pub fn subscribe(&mut self, filter: &str, client_id: Arc<str>, qos: QoS) -> bool {
        let filters = self.per_client_filters.entry(client_id.clone()).or_default();
        let already_subscribed = filters.iter().any(|f| f == filter);

        if !already_subscribed
            && self.max_subscriptions_per_client > 0
            && filters.len() >= self.max_subscriptions_per_client
        {
            return false;
        }

        if !already_subscribed {
            filters.push(filter.to_string());
        }

        let subscription = Subscription { client_id, qos };
        if let Some(subs) = self.trie.get_mut(filter) {
            subs.retain(|s| s.client_id != subscription.client_id);
            subs.push(subscription);
        } else {
            self.trie.insert(filter, vec![subscription]);
        }

        true
    }

    /// Remove a single subscription. Returns `true` if one existed.
    pub fn unsubscribe(&mut self, filter: &str, client_id: &str) -> bool {
        let removed = if let Some(subs) = self.trie.get_mut(filter) {
            let len_before = subs.len();
            subs.retain(|s| s.client_id.as_ref() != client_id);
            let removed = subs.len() != len_before;
            if subs.is_empty() {
                self.trie.remove(filter);
            }
            removed
        } else {
            false
        };

        if removed {
            if let Some(filters) = self.per_client_filters.get_mut(client_id) {
                filters.retain(|f| f != filter);
            }
        }

        removed
    }

    /// Remove every subscription a client holds (on disconnect with
    /// `clean_session=true`, or session expiry).
    pub fn unsubscribe_all(&mut self, client_id: &str) {
        self.per_client_filters.remove(client_id);
        self.trie.remove_by_predicate(|subs| {
            subs.retain(|s| s.client_id.as_ref() != client_id);
            subs.is_empty()
        });
    }

    /// Invoke `callback` for every subscription whose filter matches
    /// `topic`, deduplicating by client and keeping the maximum granted
    /// QoS on collisions (a client can be matched by more than one filter).
    pub fn matches(&self, topic: &str) -> Vec<Subscription> {
        let mut best: HashMap<Arc<str>, QoS> = HashMap::new();
        self.trie.matches(topic, |subs| {
            for sub in subs {
                best.entry(sub.client_id.clone())
                    .and_modify(|q| *q = (*q).max(sub.qos))
                    .or_insert(sub.qos);
            }
        });
        best.into_iter()
            .map(|(client_id, qos)| Subscription { client_id, qos })
            .collect()
    }

    pub fn subscription_count(&self, client_id: &str) -> usize {
        self.per_client_filters
            .get(client_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn total_subscription_count(&self) -> usize {
        self.per_client_filters.values().map(Vec::len).sum()
    }
}

/// Bounded, insertion-ordered retained-message store. Eviction drops the
/// oldest entry (by insertion order, not last-published order) once a new
/// topic would exceed `max_retained_messages`.
pub struct RetainedStore {
    messages: HashMap<String, RetainedMessage>,
    insertion_order: VecDeque<String>,
    max_retained_messages: usize,
}

impl RetainedStore {
    pub fn new(max_retained_messages: usize) -> Self {
        Self {
            messages: HashMap::new(),
            insertion_order: VecDeque::new(),
            max_retained_messages,
        }
    }

    /// Store or clear a retained message for `topic`. An empty payload
    /// deletes the entry; otherwise a new topic evicts the oldest entry
    /// once the store is at capacity.
    pub fn publish(&mut self, topic: &str, payload: Bytes, qos: QoS) {
        if payload.is_empty() {
            if self.messages.remove(topic).is_some() {
                self.insertion_order.retain(|t| t != topic);
            }
            return;
        }

        let is_new = !self.messages.contains_key(topic);
        if is_new {
            if self.max_retained_messages > 0 && self.messages.len() >= self.max_retained_messages
            {
                if let Some(oldest) = self.insertion_order.pop_front() {
                    self.messages.remove(&oldest);
                }
            }
            self.insertion_order.push_back(topic.to_string());
        }

        self.messages
            .insert(topic.to_string(), RetainedMessage { payload, qos });
    }

    /// Every retained entry, topic and `$SYS/*` alike — unlike
    /// [`Self::matching`], this does not apply `$`-prefix wildcard
    /// isolation, since that rule only governs what a *subscription
    /// filter* can see, not an administrative dump of the whole store.
    pub fn all(&self) -> Vec<(String, RetainedMessage)> {
        self.messages
            .iter()
            .map(|(topic, msg)| (topic.clone(), msg.clone()))
            .collect()
    }

    /// Collect every retained message whose topic matches `filter`.
    pub fn matching(&self, filter: &str) -> Vec<(String, RetainedMessage)> {
        self.messages
            .iter()
            .filter(|(topic, _)| topic_matches_filter(topic, filter))
            .map(|(topic, msg)| (topic.clone(), msg.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear_topic(&mut self, topic: &str) {
        if self.messages.remove(topic).is_some() {
            self.insertion_order.retain(|t| t != topic);
        }
    }
}
