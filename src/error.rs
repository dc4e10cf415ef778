// Error handling module
// Defines the client error taxonomy and user-facing message extraction

use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;

/// Message surfaced when the refresh endpoint rejects the session
pub const NO_VALID_REFRESH_TOKEN: &str = "No valid refresh token";

/// Errors that can occur while talking to the portal backend
#[derive(Error, Debug)]
pub enum ClientError {
    /// Refresh attempted without a signed-in account
    #[error("No active session")]
    NoActiveSession,

    /// 401/403 on a protected request; the session has been logged out
    #[error("Authorization failed: {status} - {message}")]
    AuthFailure { status: u16, message: String },

    /// The refresh endpoint rejected the session; local credentials were cleared
    #[error("No valid refresh token")]
    RefreshFailure,

    /// Any other error response from the backend
    #[error("Request failed: {status} - {message}")]
    Request { status: u16, message: String },

    /// No response was received
    #[error("Network error: {0}")]
    Network(String),

    /// The credential's claims segment could not be decoded
    #[error("Malformed credential: {0}")]
    MalformedCredential(String),

    /// Local input validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Local storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ClientError {
    /// The plain message a front end shows to the user
    pub fn user_message(&self) -> String {
        match self {
            ClientError::AuthFailure { message, .. } | ClientError::Request { message, .. } => {
                message.clone()
            }
            ClientError::RefreshFailure => NO_VALID_REFRESH_TOKEN.to_string(),
            other => other.to_string(),
        }
    }

    /// HTTP status attached to the error, if the backend answered
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::AuthFailure { status, .. } | ClientError::Request { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }
}

/// Extract the message to surface from an error response
///
/// Looks at `message`, then `error.message` in a JSON body, then falls back
/// to the status text, then to the bare status code.
pub fn extract_error_message(status: u16, body: &str) -> String {
    if let Ok(json) = serde_json::from_str::<Value>(body) {
        let message = json
            .get("message")
            .and_then(|v| v.as_str())
            .or_else(|| {
                json.get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(|v| v.as_str())
            });
        if let Some(message) = message.filter(|m| !m.is_empty()) {
            return message.to_string();
        }
    }

    StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .map(str::to_string)
        .unwrap_or_else(|| status.to_string())
}

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;
