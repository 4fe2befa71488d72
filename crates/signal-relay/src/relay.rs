//! Resident relay core
//!
//! Owns the topic registry and every live session. All methods are
//! synchronous and expect to be driven from a single task, which makes each
//! subscribe, unsubscribe and publish atomic with respect to the others.

use std::collections::HashMap;

use tracing::{debug, info};

use crate::connection::{ConnectionHandle, ConnectionId};
use crate::liveness::{Probe, LIVENESS_CLOSE_CODE, LIVENESS_CLOSE_REASON};
use crate::registry::TopicRegistry;
use crate::session::Session;

/// Close code recorded when a connection's outbound queue vanished mid-send
const SEND_FAILED_CODE: u16 = 1006;

/// Relay state for the resident execution model
#[derive(Default)]
pub struct Relay {
    registry: TopicRegistry,
    sessions: HashMap<ConnectionId, Session>,
}

impl Relay {
    pub fn new() -> Self {
        Self::with_registry(TopicRegistry::new())
    }

    /// Build a relay around an existing registry
    pub fn with_registry(registry: TopicRegistry) -> Self {
        Self {
            registry,
            sessions: HashMap::new(),
        }
    }

    /// Register a freshly accepted connection with no subscriptions
    pub fn on_connect(&mut self, conn: ConnectionHandle) -> ConnectionId {
        let id = conn.id();
        self.sessions.insert(id, Session::new(conn));
        debug!("Connection opened: {}", id);
        id
    }

    /// Dispatch one inbound frame from `id`. Frames from unknown or already
    /// closed connections are dropped.
    pub fn on_message(&mut self, id: ConnectionId, frame: &[u8]) {
        let Some(session) = self.sessions.get_mut(&id) else {
            debug!("Frame from closed connection {} dropped", id);
            return;
        };

        let undeliverable = session.on_message(&mut self.registry, frame);
        for dead in undeliverable {
            self.on_close(dead, SEND_FAILED_CODE, "send failed");
        }
    }

    /// Transport-level pong received from `id`
    pub fn on_pong(&mut self, id: ConnectionId) {
        if let Some(session) = self.sessions.get_mut(&id) {
            session.liveness_mut().on_pong();
        }
    }

    /// Tear down `id`: leave every topic and forget the session.
    ///
    /// Runs the cleanup exactly once; later calls return false.
    pub fn on_close(&mut self, id: ConnectionId, code: u16, reason: &str) -> bool {
        let Some(mut session) = self.sessions.remove(&id) else {
            return false;
        };

        session.on_close(&mut self.registry);
        debug!("Connection closed: {} (code {}, reason {:?})", id, code, reason);
        true
    }

    /// Run one heartbeat sweep over every connection.
    ///
    /// Connections that missed the previous probe are closed and cleaned up.
    /// Returns how many were evicted.
    pub fn sweep_liveness(&mut self) -> usize {
        let mut dead = Vec::new();
        for session in self.sessions.values_mut() {
            match session.liveness_mut().on_tick() {
                Probe::Ping => {
                    if session.handle().ping().is_err() {
                        dead.push(session.id());
                    }
                }
                Probe::Evict => dead.push(session.id()),
            }
        }

        let evicted = dead.len();
        for id in dead {
            if let Some(session) = self.sessions.get(&id) {
                session
                    .handle()
                    .close(LIVENESS_CLOSE_CODE, LIVENESS_CLOSE_REASON);
            }
            self.on_close(id, LIVENESS_CLOSE_CODE, LIVENESS_CLOSE_REASON);
        }

        if evicted > 0 {
            info!("Evicted {} unresponsive connections", evicted);
        }
        evicted
    }

    pub fn registry(&self) -> &TopicRegistry {
        &self.registry
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    /// Topics `id` is subscribed to, or `None` if it is not connected
    pub fn subscriptions_of(&self, id: ConnectionId) -> Option<Vec<String>> {
        self.sessions
            .get(&id)
            .map(|session| session.subscriptions().map(str::to_owned).collect())
    }

    pub fn is_connected(&self, id: ConnectionId) -> bool {
        self.sessions.contains_key(&id)
    }

    pub fn connection_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn topic_count(&self) -> usize {
        self.registry.topic_count()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.registry.subscriber_count(topic)
    }
}
