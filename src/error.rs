//! Error types for the aggregator

use std::io;

use rmcp::model::ErrorCode;
use rmcp::ErrorData;
use thiserror::Error;

/// Result type alias for the aggregator
pub type Result<T> = std::result::Result<T, Error>;

/// Aggregator errors
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed config, invalid proxy parameter, invalid kit file
    #[error("Validation error: {0}")]
    Validation(String),

    /// Process spawn failed, pipe died, connection refused, handshake timeout
    #[error("Transport error: {0}")]
    Transport(String),

    /// Downstream MCP sent an unparseable or unexpected message
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Two enabled backends claim the same aggregated name
    #[error("Name collision: {name:?} already served by backend {holder:?}")]
    Collision {
        /// The contested aggregated name
        name: String,
        /// Backend that already owns the name
        holder: String,
    },

    /// Unknown server, capability, kit, or resource
    #[error("Not found: {0}")]
    NotFound(String),

    /// Request cancelled by the client or by shutdown
    #[error("Request cancelled")]
    Cancelled,

    /// A bounded operation exceeded its budget
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Missing, malformed, expired, or wrong-audience token
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Mutating operation attempted in read-only mode
    #[error("Read-only mode: {0}")]
    ReadOnly(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Error reported by a downstream MCP server
    #[error("Backend error {code}: {message}")]
    Backend {
        /// JSON-RPC error code
        code: i32,
        /// Error message
        message: String,
        /// Optional error data
        data: Option<serde_json::Value>,
    },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build an [`Error::Backend`] from a downstream MCP error, preserving
    /// code, message, and data verbatim.
    #[must_use]
    pub fn backend(err: ErrorData) -> Self {
        Self::Backend {
            code: err.code.0,
            message: err.message.to_string(),
            data: err.data,
        }
    }

    /// Map a client-side rmcp service error onto the taxonomy. Downstream
    /// MCP errors pass through; everything else is a transport failure.
    #[must_use]
    pub fn from_service(err: rmcp::ServiceError) -> Self {
        match err {
            rmcp::ServiceError::McpError(e) => Self::backend(e),
            other => Self::Transport(other.to_string()),
        }
    }

    /// Surface this error to an MCP client.
    ///
    /// Per-request kinds map onto standard JSON-RPC codes; downstream errors
    /// pass through untouched.
    #[must_use]
    pub fn to_mcp(&self) -> ErrorData {
        match self {
            Self::Validation(msg) => ErrorData::invalid_params(msg.clone(), None),
            Self::NotFound(msg) => ErrorData::new(ErrorCode(-32002), msg.clone(), None),
            Self::Backend {
                code,
                message,
                data,
            } => ErrorData::new(ErrorCode(*code), message.clone(), data.clone()),
            Self::Cancelled => ErrorData::new(ErrorCode(-32800), self.to_string(), None),
            Self::Timeout(_)
            | Self::Transport(_)
            | Self::Protocol(_)
            | Self::Collision { .. }
            | Self::ReadOnly(_)
            | Self::Auth(_) => ErrorData::new(ErrorCode(-32000), self.to_string(), None),
            _ => ErrorData::internal_error(self.to_string(), None),
        }
    }

    /// Owned-value adapter for `map_err` chains in handler methods.
    #[must_use]
    pub fn to_mcp_owned(self) -> ErrorData {
        self.to_mcp()
    }

    /// Whether a failed backend operation should transition the connection
    /// into `Degraded` and be retried.
    #[must_use]
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Protocol(_) | Self::Timeout(_) | Self::Io(_)
        )
    }
}

impl From<Error> for ErrorData {
    fn from(err: Error) -> Self {
        err.to_mcp()
    }
}
