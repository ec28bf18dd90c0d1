use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Backend message for an expired session token. The only 401 that is recoverable.
pub const TOKEN_EXPIRED: &str = "Token expired";

/// Backend messages for "please log in" states. Never trigger refresh or logout.
pub const NOT_LOGGED_IN: &str = "Not logged in";
pub const NO_TOKEN_PROVIDED: &str = "No token provided";

/// Upper bound on how much of a non-JSON error body is kept.
const MAX_RAW_BODY_CHARS: usize = 512;

/// Decoded `data` object of a failed backend response.
///
/// Backends answer errors with `{ "message": "...", ... }`; extra fields are
/// kept verbatim so callers can render validation details.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A non-2xx backend response: the `{ status, data }` pair every service sees.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiError {
    pub status: u16,
    pub data: ErrorData,
}

impl ApiError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            data: ErrorData {
                message: Some(message.into()),
                extra: serde_json::Map::new(),
            },
        }
    }

    /// Decode an error body leniently. Non-JSON bodies end up under `extra.body`.
    pub fn from_body(status: u16, body: &[u8]) -> Self {
        if let Ok(data) = serde_json::from_slice::<ErrorData>(body) {
            return Self { status, data };
        }
        let mut extra = serde_json::Map::new();
        let text = String::from_utf8_lossy(body);
        if !text.trim().is_empty() {
            let truncated: String = text.chars().take(MAX_RAW_BODY_CHARS).collect();
            extra.insert("body".to_string(), serde_json::Value::String(truncated));
        }
        Self {
            status,
            data: ErrorData {
                message: None,
                extra,
            },
        }
    }

    pub fn message(&self) -> Option<&str> {
        self.data.message.as_deref()
    }
}

/// Error taxonomy seen by callers. Every `StatusError` maps to exactly one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 401 "Token expired": recoverable by a session refresh.
    SessionExpired,
    /// Any other 401 apart from the benign ones: forces logout.
    SessionInvalid,
    /// 401 "Not logged in" / "No token provided": expected, passed through.
    Unauthenticated,
    /// Network failure, timeout, non-401 status, undecodable body.
    Transport,
    StorageUnavailable,
    Storage,
    InvalidArgument,
}

#[derive(Debug, Clone, Error)]
pub enum StatusError {
    #[error("http {}: {}", .0.status, .0.message().unwrap_or("no message"))]
    Http(ApiError),

    #[error("timeout after {0}ms")]
    Timeout(u64),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("session refresh abandoned before it settled")]
    RefreshAbandoned,

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("local test store unavailable: {0}")]
    StorageUnavailable(String),

    #[error("local test store error: {0}")]
    Storage(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl StatusError {
    /// Map a reqwest failure. `timeout` is what the request was sent with.
    pub fn from_reqwest(err: reqwest::Error, timeout: std::time::Duration) -> Self {
        if err.is_timeout() {
            Self::Timeout(timeout.as_millis() as u64)
        } else if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Http(api) if api.status == 401 => match api.message() {
                Some(TOKEN_EXPIRED) => ErrorKind::SessionExpired,
                Some(NOT_LOGGED_IN | NO_TOKEN_PROVIDED) => ErrorKind::Unauthenticated,
                _ => ErrorKind::SessionInvalid,
            },
            Self::Http(_)
            | Self::Timeout(_)
            | Self::Transport(_)
            | Self::RefreshAbandoned
            | Self::Decode(_) => ErrorKind::Transport,
            Self::StorageUnavailable(_) => ErrorKind::StorageUnavailable,
            Self::Storage(_) => ErrorKind::Storage,
            Self::InvalidArgument(_) | Self::Config(_) => ErrorKind::InvalidArgument,
        }
    }

    /// HTTP status of a backend error, if this is one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http(api) => Some(api.status),
            _ => None,
        }
    }

    /// Produce a message safe to show in a notification.
    /// Does not leak connection details or raw storage errors.
    pub fn user_message(&self) -> String {
        match self {
            Self::Http(api) => match api.message() {
                Some(msg) => msg.to_string(),
                None => format!("request failed with status {}", api.status),
            },
            Self::Timeout(ms) => format!("request timed out after {ms}ms"),
            Self::Transport(_) => "could not reach the server".to_string(),
            Self::RefreshAbandoned => "session refresh was interrupted".to_string(),
            Self::Decode(_) => "unexpected response from the server".to_string(),
            Self::StorageUnavailable(_) | Self::Storage(_) => {
                "local test history is unavailable".to_string()
            }
            Self::InvalidArgument(msg) => msg.clone(),
            Self::Config(msg) => format!("configuration error: {msg}"),
        }
    }
}

/// Reject empty identifiers before any I/O happens.
pub fn require_id(what: &str, value: &str) -> Result<(), StatusError> {
    if value.trim().is_empty() {
        return Err(StatusError::InvalidArgument(format!("{what} is required")));
    }
    Ok(())
}
