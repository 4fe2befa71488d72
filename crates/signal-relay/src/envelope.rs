//! Signaling envelope codec
//!
//! Every frame is a JSON object with a string `type`. Only the envelope is
//! interpreted; any other fields of a `publish` are carried through untouched.

use serde_json::{Map, Value};
use thiserror::Error;

/// Reply to an application-level `ping`
pub const PONG_FRAME: &str = r#"{"type":"pong"}"#;

/// A decoded inbound envelope
#[derive(Clone, Debug, PartialEq)]
pub enum Envelope {
    /// Join the named topics. Non-string entries are already dropped.
    Subscribe { topics: Vec<String> },

    /// Leave the named topics
    Unsubscribe { topics: Vec<String> },

    /// Forward `message` to every subscriber of `topic`.
    ///
    /// `topic` is `None` when the field is missing or not a string; the
    /// dispatcher ignores such publishes.
    Publish {
        topic: Option<String>,
        message: Map<String, Value>,
    },

    /// Application-level echo request
    Ping,

    /// Well-formed envelope with a `type` the relay does not handle
    Unknown { kind: String },
}

/// Frame could not be read as an envelope
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("frame is not valid UTF-8")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("frame is not JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame is not a JSON object")]
    NotAnObject,

    #[error("frame has no string `type` field")]
    MissingType,
}

impl Envelope {
    /// Wire tag, for logging
    pub fn kind(&self) -> &str {
        match self {
            Envelope::Subscribe { .. } => "subscribe",
            Envelope::Unsubscribe { .. } => "unsubscribe",
            Envelope::Publish { .. } => "publish",
            Envelope::Ping => "ping",
            Envelope::Unknown { kind } => kind.as_str(),
        }
    }
}

/// Decode one transport frame (text or binary, already defragmented)
pub fn decode(frame: &[u8]) -> Result<Envelope, DecodeError> {
    let text = std::str::from_utf8(frame)?;
    let Value::Object(message) = serde_json::from_str::<Value>(text)? else {
        return Err(DecodeError::NotAnObject);
    };

    let kind = match message.get("type") {
        Some(Value::String(kind)) => kind.clone(),
        _ => return Err(DecodeError::MissingType),
    };

    let envelope = match kind.as_str() {
        "subscribe" => Envelope::Subscribe {
            topics: topic_names(&message),
        },
        "unsubscribe" => Envelope::Unsubscribe {
            topics: topic_names(&message),
        },
        "publish" => Envelope::Publish {
            topic: message
                .get("topic")
                .and_then(Value::as_str)
                .map(str::to_owned),
            message,
        },
        "ping" => Envelope::Ping,
        _ => Envelope::Unknown { kind },
    };

    Ok(envelope)
}

/// Build the frame fanned out for a publish: the original object plus the
/// subscriber count. An existing `clients` field is overwritten.
pub fn publish_frame(message: &Map<String, Value>, clients: usize) -> String {
    let mut out = message.clone();
    out.insert("clients".into(), Value::from(clients));
    Value::Object(out).to_string()
}

/// A missing or non-array `topics` reads as empty
fn topic_names(message: &Map<String, Value>) -> Vec<String> {
    match message.get("topics") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_owned)
            .collect(),
        _ => Vec::new(),
    }
}
