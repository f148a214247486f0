//! Request/response transport to the remote document store.
//!
//! The remote store is abstracted as a REST-like `/documents` resource.
//! Version tokens ride on the `ETag` response header and are echoed back as
//! `If-Match` for conditional updates, which is what makes retrying safe.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Response, StatusCode};

use super::error::SyncError;
use crate::models::Document;

/// Request/response operations against the remote document store.
///
/// Implementations classify failures per the sync error taxonomy: network
/// failures, timeouts and 5xx responses are retryable; a version mismatch
/// surfaces as [`SyncError::Conflict`] carrying the current remote document;
/// other 4xx responses are terminal.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn create(&self, doc: &Document) -> Result<Document, SyncError>;
    async fn read(&self, id: &str) -> Result<Document, SyncError>;
    /// Conditional update: when `expected_version` is given the write only
    /// succeeds if the remote still carries that token.
    async fn update(
        &self,
        id: &str,
        doc: &Document,
        expected_version: Option<&str>,
    ) -> Result<Document, SyncError>;
    async fn delete(&self, id: &str) -> Result<(), SyncError>;
}

/// HTTP transport over the logical `/documents` resource.
pub struct HttpTransport {
    base_url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpTransport {
    /// Creates a transport for the given server URL with a per-request
    /// timeout applied to every call.
    pub fn new(server_url: &str, timeout: Duration) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Network(e.to_string()))?;
        Ok(Self {
            base_url: normalize_http_url(server_url),
            client,
            timeout,
        })
    }

    fn collection_url(&self) -> String {
        format!("{}/documents", self.base_url)
    }

    fn document_url(&self, id: &str) -> String {
        format!("{}/documents/{}", self.base_url, id)
    }

    fn classify(&self, e: reqwest::Error) -> SyncError {
        if e.is_timeout() {
            SyncError::Timeout(self.timeout)
        } else {
            SyncError::Network(e.to_string())
        }
    }

    /// Maps a non-success response onto the error taxonomy.
    async fn error_for(&self, response: Response) -> SyncError {
        let status = response.status();
        if status == StatusCode::CONFLICT {
            // 409 carries the current remote document in the body.
            match response.json::<Document>().await {
                Ok(remote) => SyncError::Conflict {
                    document_id: remote.id.clone(),
                    remote: Box::new(remote),
                },
                Err(e) => SyncError::Server {
                    status: status.as_u16(),
                    message: format!("conflict response had no readable body: {e}"),
                },
            }
        } else {
            let code = status.as_u16();
            let message = response.text().await.unwrap_or_default();
            if status.is_server_error() {
                SyncError::Server {
                    status: code,
                    message,
                }
            } else {
                SyncError::Client {
                    status: code,
                    message,
                }
            }
        }
    }

    /// Parses a successful response body and attaches the `ETag` header as
    /// the document's version token.
    async fn document_from(&self, response: Response) -> Result<Document, SyncError> {
        let etag = response
            .headers()
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let mut doc: Document = response.json().await.map_err(|e| self.classify(e))?;
        if etag.is_some() {
            doc.version_token = etag;
        }
        Ok(doc)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn create(&self, doc: &Document) -> Result<Document, SyncError> {
        let response = self
            .client
            .post(self.collection_url())
            .json(doc)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        // 201 expected; any 2xx is accepted.
        if response.status().is_success() {
            self.document_from(response).await
        } else {
            Err(self.error_for(response).await)
        }
    }

    async fn read(&self, id: &str) -> Result<Document, SyncError> {
        let response = self
            .client
            .get(self.document_url(id))
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        if response.status().is_success() {
            self.document_from(response).await
        } else {
            Err(self.error_for(response).await)
        }
    }

    async fn update(
        &self,
        id: &str,
        doc: &Document,
        expected_version: Option<&str>,
    ) -> Result<Document, SyncError> {
        let mut request = self.client.put(self.document_url(id)).json(doc);
        if let Some(token) = expected_version {
            request = request.header(header::IF_MATCH, token);
        }
        let response = request.send().await.map_err(|e| self.classify(e))?;

        if response.status().is_success() {
            self.document_from(response).await
        } else {
            Err(self.error_for(response).await)
        }
    }

    async fn delete(&self, id: &str) -> Result<(), SyncError> {
        let response = self
            .client
            .delete(self.document_url(id))
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        // 200 and 204 both count as deleted.
        if response.status().is_success() {
            Ok(())
        } else {
            Err(self.error_for(response).await)
        }
    }
}

/// Normalizes a configured server URL to an http(s) base without a trailing
/// slash. Accepts ws(s) URLs since the realtime channel shares the setting.
pub(crate) fn normalize_http_url(server_url: &str) -> String {
    let base = if server_url.starts_with("ws://") {
        server_url.replace("ws://", "http://")
    } else if server_url.starts_with("wss://") {
        server_url.replace("wss://", "https://")
    } else if !server_url.starts_with("http://") && !server_url.starts_with("https://") {
        format!("http://{}", server_url)
    } else {
        server_url.to_string()
    };
    base.trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_http_url() {
        assert_eq!(
            normalize_http_url("http://localhost:8080"),
            "http://localhost:8080"
        );
        assert_eq!(
            normalize_http_url("ws://localhost:8080/"),
            "http://localhost:8080"
        );
        assert_eq!(
            normalize_http_url("wss://notes.example.com"),
            "https://notes.example.com"
        );
        assert_eq!(
            normalize_http_url("localhost:8080"),
            "http://localhost:8080"
        );
    }

    #[test]
    fn test_document_urls() {
        let transport =
            HttpTransport::new("localhost:8080", Duration::from_secs(5)).unwrap();
        assert_eq!(
            transport.collection_url(),
            "http://localhost:8080/documents"
        );
        assert_eq!(
            transport.document_url("abc-123"),
            "http://localhost:8080/documents/abc-123"
        );
    }
}
