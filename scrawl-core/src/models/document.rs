//! Document snapshot model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A snapshot of a markdown note.
///
/// The `version_token` is an opaque string identifying the remote revision
/// this snapshot was last reconciled against (an ETag-equivalent). `None`
/// means no remote version is known yet, e.g. for a note created offline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub title: String,
    pub content: String,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version_token: Option<String>,
}

impl Document {
    /// Creates a new document with a fresh id and no known remote version.
    pub fn new(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title: title.into(),
            content: content.into(),
            updated_at: Utc::now(),
            version_token: None,
        }
    }

    /// True when the document has neither a title nor any content.
    pub fn is_empty(&self) -> bool {
        self.title.trim().is_empty() && self.content.trim().is_empty()
    }

    /// Returns a copy carrying the given version token.
    pub fn with_version_token(mut self, token: Option<String>) -> Self {
        self.version_token = token;
        self
    }
}
