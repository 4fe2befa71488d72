//! Signal Relay
//!
//! Minimal rendezvous relay for peer-to-peer applications. Peers connect over
//! WebSocket and exchange connection-setup metadata (offers, answers,
//! candidates) through named topics before talking to each other directly.
//! Payloads are never inspected beyond the envelope.
//!
//! # Protocol
//!
//! Every frame is a JSON object with a string `type`:
//!
//! 1. `{"type":"subscribe","topics":[...]}` joins topics
//! 2. `{"type":"unsubscribe","topics":[...]}` leaves them
//! 3. `{"type":"publish","topic":"t",...}` is forwarded to every subscriber
//!    of `t` (the sender included) with an added `clients` count
//! 4. `{"type":"ping"}` is answered with `{"type":"pong"}`
//!
//! Anything else is ignored. Delivery is best-effort to present subscribers.
//!
//! # Execution models
//!
//! - Resident ([`Relay`]): registry and sessions live in memory, driven by
//!   a single task, with a heartbeat sweep evicting dead connections.
//! - Hibernating ([`hibernation`]): subscriptions travel with each
//!   connection as a serialized attachment and are re-read on every event.

pub mod config;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod hibernation;
pub mod liveness;
pub mod registry;
pub mod relay;
pub mod server;
pub mod session;
pub mod storage;

pub use config::{Config, ExecutionModel};
pub use connection::{ConnectionHandle, ConnectionId, Outbound};
pub use envelope::{decode, Envelope};
pub use error::RelayError;
pub use hibernation::{HibernatingHandler, SocketHost};
pub use registry::TopicRegistry;
pub use relay::Relay;
pub use server::SignalServer;
pub use storage::{SqliteStore, StorageError};

/// Default listening port
pub const DEFAULT_PORT: u16 = 4444;
