/// Error types for the synchronization engine
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    /// Live connection is down; callers fall back to request/response
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    /// Fallback send was rejected by the backend
    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Fetch failed: {0}")]
    FetchFailed(FetchFailure),

    /// Payload could not be turned into a canonical message/conversation
    #[error("Normalization failed: {0}")]
    NormalizationFailed(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown conversation: {0}")]
    UnknownConversation(String),

    #[error("Sync engine stopped")]
    EngineStopped,
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Error reported by a `ChatBackend` implementation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Transport error: {0}")]
    Transport(String),
}

impl BackendError {
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        BackendError::Status {
            status,
            message: message.into(),
        }
    }
}

/// Classified history/unread/detail fetch failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FetchFailure {
    SessionExpired,
    Forbidden,
    /// Treated as an empty result by callers
    NotFound,
    ServerError { status: u16 },
    Unknown { detail: String },
}

impl FetchFailure {
    /// Text shown next to the affected conversation
    pub fn user_message(&self) -> &'static str {
        match self {
            FetchFailure::SessionExpired => "Your session has expired. Please sign in again.",
            FetchFailure::Forbidden => "You no longer have access to this conversation.",
            FetchFailure::NotFound => "This conversation has no messages yet.",
            FetchFailure::ServerError { .. } => "The server had a problem. Try again in a moment.",
            FetchFailure::Unknown { .. } => "Something went wrong while loading messages.",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FetchFailure::NotFound)
    }
}

impl std::fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchFailure::SessionExpired => write!(f, "session expired"),
            FetchFailure::Forbidden => write!(f, "forbidden"),
            FetchFailure::NotFound => write!(f, "not found"),
            FetchFailure::ServerError { status } => write!(f, "server error ({})", status),
            FetchFailure::Unknown { detail } => write!(f, "unknown ({})", detail),
        }
    }
}

impl From<&BackendError> for FetchFailure {
    fn from(err: &BackendError) -> Self {
        match err {
            BackendError::Status { status: 401, .. } => FetchFailure::SessionExpired,
            BackendError::Status { status: 403, .. } => FetchFailure::Forbidden,
            BackendError::Status { status: 404, .. } => FetchFailure::NotFound,
            BackendError::Status { status, .. } if (500..600).contains(status) => {
                FetchFailure::ServerError { status: *status }
            }
            other => FetchFailure::Unknown {
                detail: other.to_string(),
            },
        }
    }
}

impl From<BackendError> for SyncError {
    fn from(err: BackendError) -> Self {
        SyncError::FetchFailed(FetchFailure::from(&err))
    }
}
