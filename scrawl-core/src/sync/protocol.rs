//! Message envelope for the realtime channel.
//!
//! Messages are JSON text frames shaped as `{ "type": ..., "data": ...,
//! "timestamp": ... }`. `subscribe`, `unsubscribe` and `document_change` are
//! outbound intents; `document_updated`, `document_deleted` and
//! `conflict_detected` are inbound notifications; `ping`/`pong` is the
//! heartbeat.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::Document;

/// Wire envelope: a typed payload plus a send timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub payload: ChannelPayload,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    pub fn new(payload: ChannelPayload) -> Self {
        Self {
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Encodes the envelope as a JSON text frame.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decodes an envelope from a JSON text frame.
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Typed payloads carried by the envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ChannelPayload {
    /// Start receiving notifications for a document (outbound).
    Subscribe { document_id: String },
    /// Stop receiving notifications for a document (outbound).
    Unsubscribe { document_id: String },
    /// Announce a local mutation intent (outbound).
    DocumentChange { document: Document },
    /// A document changed remotely (inbound).
    DocumentUpdated { document: Document },
    /// A document was deleted remotely (inbound).
    DocumentDeleted { document_id: String },
    /// The server detected a conflict for a document (inbound).
    ConflictDetected {
        document_id: String,
        remote: Document,
    },
    /// Heartbeat request.
    Ping,
    /// Heartbeat response.
    Pong,
}
