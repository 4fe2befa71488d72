//! Connection handles shared by the registry, sessions and the transport
//!
//! A `ConnectionHandle` is the relay's view of one WebSocket: an identity plus
//! the sending half of that socket's outbound queue. Handles are cheap to
//! clone and never own the socket itself; the socket task does.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tokio::sync::mpsc;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identity
///
/// Ids are never reused within a process, so two handles compare equal only
/// when they refer to the same socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate a fresh id
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn from_u64(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A frame queued for delivery to the remote peer
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    /// Application frame (JSON text)
    Text(String),
    /// Transport-level liveness probe
    Ping,
    /// Close the socket with the given code and reason
    Close { code: u16, reason: String },
}

/// Outbound queue is gone; the socket is closing or closed
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("connection {0} is closed")]
pub struct SendError(pub ConnectionId);

/// Non-owning handle to a live connection
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ConnectionHandle {
    /// Create a handle with a fresh id and the receiving end of its queue
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                id: ConnectionId::next(),
                tx,
            },
            rx,
        )
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a text frame. Does not wait for delivery.
    pub fn send(&self, text: impl Into<String>) -> Result<(), SendError> {
        self.push(Outbound::Text(text.into()))
    }

    /// Queue a transport ping
    pub fn ping(&self) -> Result<(), SendError> {
        self.push(Outbound::Ping)
    }

    /// Ask the socket task to close. Closing twice is harmless.
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        let _ = self.push(Outbound::Close {
            code,
            reason: reason.into(),
        });
    }

    /// Whether the socket task has gone away
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn push(&self, frame: Outbound) -> Result<(), SendError> {
        self.tx.send(frame).map_err(|_| SendError(self.id))
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ConnectionHandle {}

impl Hash for ConnectionHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}
