//! Remote API adapters.
//!
//! A [`RemoteClient`] translates one domain mutation or query into one network
//! call. It knows nothing about the local store.

mod http;
mod memory;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::models::{RecordId, RemoteRecord};

pub use http::HttpRemoteClient;
pub use memory::InMemoryRemote;

/// Structured error returned by the server
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} ({status})")]
pub struct ApiError {
    /// HTTP status code
    pub status: u16,
    /// Machine-readable error code
    pub code: String,
    /// Human-readable message
    pub message: String,
}

impl ApiError {
    pub fn new(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
        }
    }

    /// Version conflict (409 Conflict / 412 Precondition Failed)
    pub const fn is_precondition_failed(&self) -> bool {
        matches!(self.status, 409 | 412)
    }

    /// The target record does not exist (404 / 410)
    pub const fn is_not_found(&self) -> bool {
        matches!(self.status, 404 | 410)
    }

    /// Build from a status and raw error body (`{code|error, message}` JSON or text)
    pub fn from_response(status: u16, body: &str) -> Self {
        #[derive(Deserialize)]
        struct ErrorBody {
            code: Option<String>,
            error: Option<String>,
            message: Option<String>,
        }

        if let Ok(payload) = serde_json::from_str::<ErrorBody>(body) {
            let code = payload
                .code
                .or_else(|| payload.error.clone())
                .unwrap_or_else(|| default_code(status).to_string());
            if let Some(message) = payload.message.or(payload.error) {
                return Self::new(status, code, message.trim());
            }
            return Self::new(status, code, format!("HTTP {status}"));
        }

        let trimmed = crate::util::compact_text(body);
        let message = if trimmed.is_empty() {
            format!("HTTP {status}")
        } else {
            trimmed
        };
        Self::new(status, default_code(status), message)
    }
}

const fn default_code(status: u16) -> &'static str {
    match status {
        400 => "bad_request",
        401 => "unauthorized",
        403 => "forbidden",
        404 | 410 => "not_found",
        409 | 412 => "version_conflict",
        429 => "rate_limited",
        500..=599 => "server_error",
        _ => "http_error",
    }
}

/// Failure of one remote call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// No connection to the server (offline, DNS failure, connection refused)
    #[error("transport error: {0}")]
    Transport(String),
    /// The request went out but no answer arrived in time
    #[error("request timed out: {0}")]
    Timeout(String),
    /// The server answered with an error
    #[error("API error: {0}")]
    Api(#[from] ApiError),
    /// The server answered with success but the body could not be decoded
    #[error("unreadable response: {0}")]
    InvalidResponse(String),
}

impl RemoteError {
    /// No answer from the server at all (connection failure or timeout)
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout(_))
    }

    /// The server could not be reached, so no other call can succeed either
    pub const fn is_connection_failure(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    pub const fn api(&self) -> Option<&ApiError> {
        match self {
            Self::Api(error) => Some(error),
            Self::Transport(_) | Self::Timeout(_) | Self::InvalidResponse(_) => None,
        }
    }
}

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// Request/response wrapper over the server API for one entity type
#[async_trait]
pub trait RemoteClient<T>: Send + Sync {
    /// Create a record; `client_id` is offered to the server, which may
    /// assign its own id instead
    async fn create(&self, client_id: &RecordId, payload: &T) -> RemoteResult<RemoteRecord<T>>;

    /// Update a record; `base_version` is the server version the edit was
    /// made against, so the server can answer with a precondition failure
    async fn update(
        &self,
        id: &RecordId,
        payload: &T,
        base_version: Option<i64>,
    ) -> RemoteResult<RemoteRecord<T>>;

    async fn delete(&self, id: &RecordId) -> RemoteResult<()>;

    /// List records, optionally only those changed after `since`
    async fn list(&self, since: Option<i64>) -> RemoteResult<Vec<RemoteRecord<T>>>;

    /// Whether `list(since)` returns a true delta rather than a full snapshot
    fn supports_delta(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precondition_failures_are_409_and_412() {
        assert!(ApiError::new(409, "x", "y").is_precondition_failed());
        assert!(ApiError::new(412, "x", "y").is_precondition_failed());
        assert!(!ApiError::new(400, "x", "y").is_precondition_failed());
        assert!(ApiError::new(404, "x", "y").is_not_found());
    }

    #[test]
    fn from_response_reads_structured_body() {
        let error = ApiError::from_response(
            412,
            r#"{"code":"stale_version","message":" farm was modified "}"#,
        );
        assert_eq!(error.code, "stale_version");
        assert_eq!(error.message, "farm was modified");
        assert_eq!(error.to_string(), "farm was modified (412)");
    }

    #[test]
    fn from_response_falls_back_to_text() {
        let error = ApiError::from_response(502, "  Bad gateway  ");
        assert_eq!(error.code, "server_error");
        assert_eq!(error.message, "Bad gateway");

        let empty = ApiError::from_response(500, "");
        assert_eq!(empty.message, "HTTP 500");
    }

    #[test]
    fn from_response_accepts_error_field() {
        let error = ApiError::from_response(401, r#"{"error":"token expired"}"#);
        assert_eq!(error.code, "token expired");
        assert_eq!(error.message, "token expired");
    }

    #[test]
    fn transport_errors_have_no_api_error() {
        let error = RemoteError::Transport("offline".into());
        assert!(error.is_transport());
        assert!(error.is_connection_failure());
        assert!(error.api().is_none());
    }

    #[test]
    fn timeouts_are_transport_but_not_connection_failures() {
        let error = RemoteError::Timeout("operation timed out".into());
        assert!(error.is_transport());
        assert!(!error.is_connection_failure());
        assert!(!RemoteError::InvalidResponse("eof".into()).is_transport());
    }
}
