//! Runtime view of open sockets for the hibernating relay

use std::collections::HashSet;

use dashmap::DashMap;

use crate::connection::{ConnectionHandle, ConnectionId};
use crate::storage::StorageError;

use super::attachment::{Attachment, AttachmentStore, MemoryStore};

/// Every open connection plus the attachment each one carries.
///
/// This is the only state that survives between handler invocations.
pub struct SocketHost {
    sockets: DashMap<ConnectionId, ConnectionHandle>,
    store: Box<dyn AttachmentStore>,
}

impl SocketHost {
    pub fn new(store: impl AttachmentStore + 'static) -> Self {
        Self {
            sockets: DashMap::new(),
            store: Box::new(store),
        }
    }

    /// Host backed by an in-process attachment map
    pub fn in_memory() -> Self {
        Self::new(MemoryStore::new())
    }

    /// Start tracking `conn` with an empty attachment
    pub fn accept(&self, conn: ConnectionHandle) -> Result<(), StorageError> {
        self.store.save(conn.id(), &Attachment::default())?;
        self.sockets.insert(conn.id(), conn);
        Ok(())
    }

    /// Forget `id` and its attachment. Returns false if it was not tracked.
    pub fn release(&self, id: ConnectionId) -> Result<bool, StorageError> {
        let known = self.sockets.remove(&id).is_some();
        self.store.remove(id)?;
        Ok(known)
    }

    /// Snapshot of every open connection
    pub fn connections(&self) -> Vec<ConnectionHandle> {
        self.sockets.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Attachment of `id`; a missing one reads as empty
    pub fn attachment(&self, id: ConnectionId) -> Result<Attachment, StorageError> {
        Ok(self.store.load(id)?.unwrap_or_default())
    }

    pub fn set_attachment(
        &self,
        id: ConnectionId,
        attachment: &Attachment,
    ) -> Result<(), StorageError> {
        self.store.save(id, attachment)
    }

    pub fn is_open(&self, id: ConnectionId) -> bool {
        self.sockets.contains_key(&id)
    }

    pub fn connection_count(&self) -> usize {
        self.sockets.len()
    }

    /// Distinct topics with at least one open subscriber
    pub fn topic_count(&self) -> Result<usize, StorageError> {
        let mut topics = HashSet::new();
        for conn in self.connections() {
            topics.extend(self.attachment(conn.id())?.subscribed_topics);
        }
        Ok(topics.len())
    }
}
