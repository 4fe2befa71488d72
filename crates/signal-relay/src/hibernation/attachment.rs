//! Per-connection attachments and the stores that hold them

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::connection::ConnectionId;
use crate::storage::StorageError;

/// State that travels with a connection handle between invocations
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    /// Subscribed topics in subscription order, without duplicates
    #[serde(default)]
    pub subscribed_topics: Vec<String>,
}

impl Attachment {
    /// Add `topic`; returns false if already present
    pub fn subscribe(&mut self, topic: &str) -> bool {
        if self.is_subscribed(topic) {
            return false;
        }
        self.subscribed_topics.push(topic.to_owned());
        true
    }

    /// Remove `topic`; returns false if it was not present
    pub fn unsubscribe(&mut self, topic: &str) -> bool {
        let before = self.subscribed_topics.len();
        self.subscribed_topics.retain(|t| t != topic);
        self.subscribed_topics.len() != before
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.subscribed_topics.iter().any(|t| t == topic)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Storage for serialized attachments, keyed by connection
pub trait AttachmentStore: Send + Sync {
    /// Read the attachment of `id`, if one was written
    fn load(&self, id: ConnectionId) -> Result<Option<Attachment>, StorageError>;

    /// Replace the attachment of `id`
    fn save(&self, id: ConnectionId, attachment: &Attachment) -> Result<(), StorageError>;

    /// Forget `id`. Unknown ids are not an error.
    fn remove(&self, id: ConnectionId) -> Result<(), StorageError>;

    /// Drop every attachment
    fn clear(&self) -> Result<(), StorageError>;
}

impl<T: AttachmentStore + ?Sized> AttachmentStore for Arc<T> {
    fn load(&self, id: ConnectionId) -> Result<Option<Attachment>, StorageError> {
        (**self).load(id)
    }

    fn save(&self, id: ConnectionId, attachment: &Attachment) -> Result<(), StorageError> {
        (**self).save(id, attachment)
    }

    fn remove(&self, id: ConnectionId) -> Result<(), StorageError> {
        (**self).remove(id)
    }

    fn clear(&self) -> Result<(), StorageError> {
        (**self).clear()
    }
}

/// Attachments kept as serialized JSON in a concurrent map
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<ConnectionId, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl AttachmentStore for MemoryStore {
    fn load(&self, id: ConnectionId) -> Result<Option<Attachment>, StorageError> {
        match self.entries.get(&id) {
            Some(json) => Ok(Some(Attachment::from_json(json.value())?)),
            None => Ok(None),
        }
    }

    fn save(&self, id: ConnectionId, attachment: &Attachment) -> Result<(), StorageError> {
        self.entries.insert(id, attachment.to_json()?);
        Ok(())
    }

    fn remove(&self, id: ConnectionId) -> Result<(), StorageError> {
        self.entries.remove(&id);
        Ok(())
    }

    fn clear(&self) -> Result<(), StorageError> {
        self.entries.clear();
        Ok(())
    }
}
