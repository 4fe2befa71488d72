//! Per-connection session for the resident relay

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::connection::{ConnectionHandle, ConnectionId};
use crate::envelope::{self, Envelope, PONG_FRAME};
use crate::liveness::Liveness;
use crate::registry::TopicRegistry;

/// State of one live connection: its handle, the topics it is subscribed
/// to, and its heartbeat state.
///
/// Every topic in `topics` has this connection in its registry entry and
/// vice versa. Both sides are only ever changed together.
pub struct Session {
    conn: ConnectionHandle,
    topics: HashSet<String>,
    liveness: Liveness,
}

impl Session {
    /// Create a session with no subscriptions
    pub fn new(conn: ConnectionHandle) -> Self {
        Self {
            conn,
            topics: HashSet::new(),
            liveness: Liveness::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.conn.id()
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.conn
    }

    /// Topics this connection is subscribed to
    pub fn subscriptions(&self) -> impl Iterator<Item = &str> {
        self.topics.iter().map(String::as_str)
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.topics.contains(topic)
    }

    pub fn liveness_mut(&mut self) -> &mut Liveness {
        &mut self.liveness
    }

    /// Handle one inbound frame.
    ///
    /// Returns the connections whose outbound queue was gone during delivery;
    /// the caller closes them once this call has finished.
    pub fn on_message(&mut self, registry: &mut TopicRegistry, frame: &[u8]) -> Vec<ConnectionId> {
        let envelope = match envelope::decode(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!("Dropping frame from {}: {}", self.id(), e);
                return Vec::new();
            }
        };

        match envelope {
            Envelope::Subscribe { topics } => {
                self.subscribe(registry, topics);
                Vec::new()
            }
            Envelope::Unsubscribe { topics } => {
                self.unsubscribe(registry, topics);
                Vec::new()
            }
            Envelope::Publish {
                topic: Some(topic),
                message,
            } => {
                let subscribers = registry.subscribers_of(&topic);
                let frame = envelope::publish_frame(&message, subscribers.len());
                debug!(
                    "Publish from {} to {} ({} subscribers)",
                    self.id(),
                    topic,
                    subscribers.len()
                );
                deliver(&subscribers, &frame)
            }
            Envelope::Publish { topic: None, .. } => {
                debug!("Dropping publish without topic from {}", self.id());
                Vec::new()
            }
            Envelope::Ping => deliver(std::slice::from_ref(&self.conn), PONG_FRAME),
            Envelope::Unknown { kind } => {
                debug!("Ignoring unknown envelope type {:?} from {}", kind, self.id());
                Vec::new()
            }
        }
    }

    /// Leave every subscribed topic. Safe to call more than once.
    pub fn on_close(&mut self, registry: &mut TopicRegistry) {
        for topic in self.topics.drain() {
            registry.remove_subscriber(&topic, self.conn.id());
        }
    }

    fn subscribe(&mut self, registry: &mut TopicRegistry, topics: Vec<String>) {
        for topic in topics {
            if self.topics.contains(&topic) {
                continue;
            }
            registry.add_subscriber(&topic, &self.conn);
            debug!("{} subscribed to {}", self.id(), topic);
            self.topics.insert(topic);
        }
    }

    fn unsubscribe(&mut self, registry: &mut TopicRegistry, topics: Vec<String>) {
        for topic in topics {
            if self.topics.remove(&topic) {
                registry.remove_subscriber(&topic, self.conn.id());
                debug!("{} unsubscribed from {}", self.id(), topic);
            }
        }
    }
}

/// Send `frame` to each target; a dead target does not stop the others
fn deliver(targets: &[ConnectionHandle], frame: &str) -> Vec<ConnectionId> {
    let mut undeliverable = Vec::new();
    for target in targets {
        if let Err(e) = target.send(frame) {
            warn!("Delivery failed: {}", e);
            undeliverable.push(target.id());
        }
    }
    undeliverable
}
