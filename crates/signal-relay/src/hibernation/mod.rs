//! Per-invocation relay for runtimes that may drop handler state between
//! messages
//!
//! Each connection carries its subscription list as a serialized
//! [`Attachment`], read and rewritten on every mutating envelope. There is no
//! topic index: a publish scans every open connection known to the
//! [`SocketHost`] and filters by attachment. That costs O(connections) per
//! publish, which is fine at signaling scale. No liveness monitor runs here;
//! the transport's close notifications are the only cleanup trigger.

mod attachment;
mod handler;
mod host;

pub use attachment::{Attachment, AttachmentStore, MemoryStore};
pub use handler::HibernatingHandler;
pub use host::SocketHost;
