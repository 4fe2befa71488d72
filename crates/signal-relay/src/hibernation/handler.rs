//! Stateless per-event handler for the hibernating relay

use tracing::{debug, warn};

use crate::connection::ConnectionHandle;
use crate::envelope::{self, Envelope, PONG_FRAME};
use crate::storage::StorageError;

use super::host::SocketHost;

/// Handles one transport event and is then discarded.
///
/// Nothing is cached between calls: subscriptions are read from and written
/// back to each connection's attachment, and topic membership is derived by
/// scanning the open connections at publish time.
pub struct HibernatingHandler<'a> {
    host: &'a SocketHost,
}

impl<'a> HibernatingHandler<'a> {
    pub fn new(host: &'a SocketHost) -> Self {
        Self { host }
    }

    /// A connection finished its handshake
    pub fn on_open(&self, conn: ConnectionHandle) {
        let id = conn.id();
        match self.host.accept(conn) {
            Ok(()) => debug!("Connection opened: {}", id),
            Err(e) => warn!("Failed to initialize attachment for {}: {}", id, e),
        }
    }

    /// One inbound frame from `conn`
    pub fn on_message(&self, conn: &ConnectionHandle, frame: &[u8]) {
        let envelope = match envelope::decode(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!("Dropping frame from {}: {}", conn.id(), e);
                return;
            }
        };

        let kind = envelope.kind().to_owned();
        if let Err(e) = self.dispatch(conn, envelope) {
            warn!("Dropping {} from {}: {}", kind, conn.id(), e);
        }
    }

    /// The transport reported `conn` closed. Echoes the close and forgets
    /// the connection.
    pub fn on_close(&self, conn: &ConnectionHandle, code: u16, reason: &str) {
        conn.close(code, reason);
        match self.host.release(conn.id()) {
            Ok(true) => debug!(
                "Connection closed: {} (code {}, reason {:?})",
                conn.id(),
                code,
                reason
            ),
            Ok(false) => {}
            Err(e) => warn!("Failed to drop attachment for {}: {}", conn.id(), e),
        }
    }

    /// Open connections whose attachment lists `topic`
    pub fn subscribers_of(&self, topic: &str) -> Vec<ConnectionHandle> {
        self.host
            .connections()
            .into_iter()
            .filter(|peer| match self.host.attachment(peer.id()) {
                Ok(attachment) => attachment.is_subscribed(topic),
                Err(e) => {
                    warn!("Skipping {} during publish: {}", peer.id(), e);
                    false
                }
            })
            .collect()
    }

    fn dispatch(&self, conn: &ConnectionHandle, envelope: Envelope) -> Result<(), StorageError> {
        match envelope {
            Envelope::Subscribe { topics } => {
                let mut attachment = self.host.attachment(conn.id())?;
                for topic in &topics {
                    attachment.subscribe(topic);
                }
                self.host.set_attachment(conn.id(), &attachment)?;
            }
            Envelope::Unsubscribe { topics } => {
                let mut attachment = self.host.attachment(conn.id())?;
                for topic in &topics {
                    attachment.unsubscribe(topic);
                }
                self.host.set_attachment(conn.id(), &attachment)?;
            }
            Envelope::Publish {
                topic: Some(topic),
                message,
            } => {
                let subscribers = self.subscribers_of(&topic);
                let frame = envelope::publish_frame(&message, subscribers.len());
                debug!(
                    "Publish from {} to {} ({} subscribers)",
                    conn.id(),
                    topic,
                    subscribers.len()
                );
                for peer in &subscribers {
                    // the runtime reports the close for a dead peer on its own
                    if let Err(e) = peer.send(frame.as_str()) {
                        warn!("Delivery failed: {}", e);
                    }
                }
            }
            Envelope::Publish { topic: None, .. } => {
                debug!("Dropping publish without topic from {}", conn.id());
            }
            Envelope::Ping => {
                if let Err(e) = conn.send(PONG_FRAME) {
                    warn!("Delivery failed: {}", e);
                }
            }
            Envelope::Unknown { kind } => {
                debug!("Ignoring unknown envelope type {:?} from {}", kind, conn.id());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Outbound;
    use crate::hibernation::{AttachmentStore, MemoryStore};
    use crate::storage::SqliteStore;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Client {
        conn: ConnectionHandle,
        rx: UnboundedReceiver<Outbound>,
    }

    impl Client {
        /// Every call builds a fresh handler, as the runtime would
        fn connect(host: &SocketHost) -> Self {
            let (conn, rx) = ConnectionHandle::channel();
            HibernatingHandler::new(host).on_open(conn.clone());
            Self { conn, rx }
        }

        fn send(&self, host: &SocketHost, frame: Value) {
            HibernatingHandler::new(host).on_message(&self.conn, frame.to_string().as_bytes());
        }

        fn close(&self, host: &SocketHost) {
            HibernatingHandler::new(host).on_close(&self.conn, 1000, "bye");
        }

        fn recv(&mut self) -> Value {
            match self.rx.try_recv().expect("expected a frame") {
                Outbound::Text(text) => serde_json::from_str(&text).unwrap(),
                other => panic!("expected text, got {:?}", other),
            }
        }

        fn is_quiet(&mut self) -> bool {
            self.rx.try_recv().is_err()
        }
    }

    fn topics_of(host: &SocketHost, client: &Client) -> Vec<String> {
        host.attachment(client.conn.id()).unwrap().subscribed_topics
    }

    fn room_scenario(host: &SocketHost) {
        let mut a = Client::connect(host);
        let mut b = Client::connect(host);

        a.send(host, json!({"type": "subscribe", "topics": ["room1"]}));
        b.send(host, json!({"type": "subscribe", "topics": ["room1"]}));

        let publish = json!({"type": "publish", "topic": "room1", "text": "hi"});
        a.send(host, publish.clone());

        let expected = json!({"type": "publish", "topic": "room1", "text": "hi", "clients": 2});
        assert_eq!(b.recv(), expected);
        assert_eq!(a.recv(), expected);

        b.close(host);
        a.send(host, publish);
        assert_eq!(
            a.recv(),
            json!({"type": "publish", "topic": "room1", "text": "hi", "clients": 1})
        );

        a.send(host, json!({"type": "unsubscribe", "topics": ["room1"]}));
        assert!(topics_of(host, &a).is_empty());
        assert_eq!(host.topic_count().unwrap(), 0);
    }

    #[test]
    fn test_room_scenario_in_memory() {
        room_scenario(&SocketHost::in_memory());
    }

    #[test]
    fn test_room_scenario_sqlite() {
        room_scenario(&SocketHost::new(SqliteStore::in_memory().unwrap()));
    }

    #[test]
    fn test_subscriptions_live_in_attachment() {
        let host = SocketHost::in_memory();
        let a = Client::connect(&host);

        a.send(&host, json!({"type": "subscribe", "topics": ["x", 3, "y", "x"]}));
        assert_eq!(topics_of(&host, &a), vec!["x", "y"]);

        a.send(&host, json!({"type": "unsubscribe", "topics": ["x", "zzz"]}));
        assert_eq!(topics_of(&host, &a), vec!["y"]);
    }

    #[test]
    fn test_missing_attachment_reads_empty() {
        let store = Arc::new(MemoryStore::new());
        let host = SocketHost::new(store.clone());
        let a = Client::connect(&host);
        a.send(&host, json!({"type": "subscribe", "topics": ["x"]}));

        // the runtime lost the attachment
        store.remove(a.conn.id()).unwrap();
        assert!(HibernatingHandler::new(&host).subscribers_of("x").is_empty());

        a.send(&host, json!({"type": "subscribe", "topics": ["y"]}));
        assert_eq!(topics_of(&host, &a), vec!["y"]);
    }

    #[test]
    fn test_fan_out_excludes_non_subscribers() {
        let host = SocketHost::in_memory();
        let mut subscribers: Vec<Client> = (0..3).map(|_| Client::connect(&host)).collect();
        let mut outsider = Client::connect(&host);

        for client in &subscribers {
            client.send(&host, json!({"type": "subscribe", "topics": ["x"]}));
        }
        outsider.send(&host, json!({"type": "publish", "topic": "x", "candidate": "c"}));

        for client in &mut subscribers {
            assert_eq!(client.recv()["clients"], json!(3));
            assert!(client.is_quiet());
        }
        assert!(outsider.is_quiet());
    }

    #[test]
    fn test_failed_delivery_does_not_stop_fan_out() {
        let host = SocketHost::in_memory();
        let mut first = Client::connect(&host);
        let gone = Client::connect(&host);
        let mut last = Client::connect(&host);

        for client in [&first, &gone, &last] {
            client.send(&host, json!({"type": "subscribe", "topics": ["x"]}));
        }

        // the socket task is gone but the runtime has not reported the close
        let Client { conn: gone, rx } = gone;
        drop(rx);
        assert!(gone.is_closed());

        first.send(&host, json!({"type": "publish", "topic": "x", "sdp": "offer"}));

        let expected = json!({"type": "publish", "topic": "x", "sdp": "offer", "clients": 3});
        assert_eq!(first.recv(), expected);
        assert_eq!(last.recv(), expected);
        assert!(last.is_quiet());
        assert!(host.is_open(gone.id()));
    }

    #[test]
    fn test_unknown_and_malformed_are_ignored() {
        let host = SocketHost::in_memory();
        let mut a = Client::connect(&host);

        a.send(&host, json!({"type": "dance"}));
        a.send(&host, json!({"foo": 1}));
        HibernatingHandler::new(&host).on_message(&a.conn, b"not json");
        assert!(a.is_quiet());
        assert!(topics_of(&host, &a).is_empty());

        a.send(&host, json!({"type": "ping"}));
        assert_eq!(a.recv(), json!({"type": "pong"}));
    }

    #[test]
    fn test_close_echoes_and_forgets() {
        let store = SqliteStore::in_memory().unwrap();
        let host = SocketHost::new(store);
        let mut a = Client::connect(&host);
        a.send(&host, json!({"type": "subscribe", "topics": ["x"]}));

        a.close(&host);
        assert_eq!(
            a.rx.try_recv().unwrap(),
            Outbound::Close {
                code: 1000,
                reason: "bye".into()
            }
        );
        assert!(!host.is_open(a.conn.id()));
        assert_eq!(host.connection_count(), 0);

        // closing again does nothing harmful
        a.close(&host);
        assert!(HibernatingHandler::new(&host).subscribers_of("x").is_empty());
    }

    #[test]
    fn test_close_removes_stored_row() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let host = SocketHost::new(store.clone());
        let a = Client::connect(&host);
        let b = Client::connect(&host);
        a.send(&host, json!({"type": "subscribe", "topics": ["x"]}));
        assert_eq!(store.attachment_count().unwrap(), 2);

        a.close(&host);
        assert_eq!(store.attachment_count().unwrap(), 1);
        assert!(store.load(a.conn.id()).unwrap().is_none());
        assert!(store.load(b.conn.id()).unwrap().is_some());
    }
}
