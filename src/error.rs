//! Error types for the policy gate

use thiserror::Error;

/// Policy gate error types
#[derive(Debug, Error)]
pub enum AuthzError {
    /// Policy compilation error
    #[error("failed to compile policy {policy}: {message}")]
    Compile {
        /// Policy name
        policy: String,
        /// Compiler diagnostic
        message: String,
    },

    /// Transport-level failure talking to the registry or running an evaluation
    #[error("transport error: {message}")]
    Transport {
        /// Error message
        message: String,
    },

    /// Registry answered with a non-success status
    #[error("unexpected registry response {status}: {body}")]
    HttpStatus {
        /// HTTP status code
        status: u16,
        /// Response body excerpt
        body: String,
    },

    /// Registry response body could not be decoded
    #[error("failed to decode registry response: {message}")]
    Decode {
        /// Error message
        message: String,
    },

    /// Authorization context was not valid JSON
    #[error("invalid authorization context: {message}")]
    Json {
        /// Parser diagnostic
        message: String,
    },

    /// Policy engine failed while running the prepared query
    #[error("policy evaluation error: {message}")]
    Evaluation {
        /// Error message
        message: String,
    },

    /// The prepared query produced no result set
    #[error("invalid response from policy evaluation")]
    InvalidResponse,

    /// Authorization denied
    #[error("unauthorized")]
    Unauthorized,
}

/// Canonical denial message surfaced by the authorization layer.
pub const UNAUTHORIZED_MESSAGE: &str = "unauthorized";

impl AuthzError {
    /// Create a policy compilation error
    pub fn compile(policy: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Compile {
            policy: policy.into(),
            message: msg.into(),
        }
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport {
            message: msg.into(),
        }
    }

    /// Create an HTTP status error
    pub fn http_status(status: u16, body: impl Into<String>) -> Self {
        Self::HttpStatus {
            status,
            body: body.into(),
        }
    }

    /// Create a decode error
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode {
            message: msg.into(),
        }
    }

    /// Create a context parse error
    pub fn json(msg: impl Into<String>) -> Self {
        Self::Json {
            message: msg.into(),
        }
    }

    /// Create an evaluation error
    pub fn evaluation(msg: impl Into<String>) -> Self {
        Self::Evaluation {
            message: msg.into(),
        }
    }

    /// Check if this error is an authorization denial (vs an engine or transport failure)
    ///
    /// Denials must not be conflated with internal errors in metrics and logs.
    pub fn is_denial(&self) -> bool {
        matches!(self, AuthzError::Unauthorized)
    }
}

/// Result type for policy gate operations
pub type Result<T> = std::result::Result<T, AuthzError>;
