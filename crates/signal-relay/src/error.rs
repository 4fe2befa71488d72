//! Error types for the signaling relay
//!
//! None of these are ever reported to clients; they surface only at startup
//! or in logs.

use thiserror::Error;

use crate::config::ConfigError;
use crate::storage::StorageError;

/// Errors that stop the relay from starting or serving
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}
