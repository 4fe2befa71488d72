//! Topic subscription registry
//!
//! The routing table of the resident relay: topic name to the connections
//! subscribed to it. A topic exists only while it has at least one
//! subscriber; the entry is dropped as soon as its last subscriber leaves.

use std::collections::HashMap;

use crate::connection::{ConnectionHandle, ConnectionId};

/// Topic name to subscriber set
#[derive(Debug, Default)]
pub struct TopicRegistry {
    topics: HashMap<String, HashMap<ConnectionId, ConnectionHandle>>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `conn` to `topic`, creating the topic if needed.
    ///
    /// Returns false if it was already subscribed.
    pub fn add_subscriber(&mut self, topic: &str, conn: &ConnectionHandle) -> bool {
        let subscribers = self.topics.entry(topic.to_owned()).or_default();
        subscribers.insert(conn.id(), conn.clone()).is_none()
    }

    /// Remove `id` from `topic`; the topic goes away with its last subscriber.
    ///
    /// Returns false if it was not subscribed.
    pub fn remove_subscriber(&mut self, topic: &str, id: ConnectionId) -> bool {
        let Some(subscribers) = self.topics.get_mut(topic) else {
            return false;
        };

        let removed = subscribers.remove(&id).is_some();
        if subscribers.is_empty() {
            self.topics.remove(topic);
        }
        removed
    }

    /// Snapshot of the current subscribers of `topic` (empty if unknown)
    pub fn subscribers_of(&self, topic: &str) -> Vec<ConnectionHandle> {
        self.topics
            .get(topic)
            .map(|subscribers| subscribers.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map_or(0, HashMap::len)
    }

    pub fn is_subscribed(&self, topic: &str, id: ConnectionId) -> bool {
        self.topics
            .get(topic)
            .is_some_and(|subscribers| subscribers.contains_key(&id))
    }

    pub fn contains_topic(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }

    /// Number of live topics
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.topics.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}
