//! Error types for the fleet runtime.
//!
//! One enum covers the whole taxonomy: configuration, control-plane protocol,
//! network, routing and service lifecycle failures. Control-plane errors that
//! travel between processes are flattened to strings and come back as
//! [`FleetError::Remote`].

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the fleet runtime.
#[derive(Debug, Error)]
pub enum FleetError {
    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("App '{app}' is not declared in the fleet config")]
    UnknownApp { app: String },

    // Control-plane errors
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Connection rejected by host: {reason}")]
    Rejected { reason: String },

    #[error("App '{app}' is not running")]
    NotRunning { app: String },

    #[error("{message}")]
    Remote { code: i32, message: String },

    // Network errors
    #[error("Network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Request timeout after {0:?}")]
    Timeout(std::time::Duration),

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Routing errors
    #[error("Service '{service}' is not registered")]
    ServiceNotRegistered { service: String },

    #[error("Service '{service}' is not available")]
    ServiceUnavailable { service: String },

    #[error("Method '{method}' not found on service '{service}'")]
    MethodNotFound { service: String, method: String },

    // Service lifecycle errors
    #[error("Lifecycle error in {service}: {message}")]
    Lifecycle { service: String, message: String },

    #[error("Invalid params: {message}")]
    InvalidParams { message: String },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for fleet operations.
pub type Result<T> = std::result::Result<T, FleetError>;

impl From<std::io::Error> for FleetError {
    fn from(err: std::io::Error) -> Self {
        FleetError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for FleetError {
    fn from(err: serde_json::Error) -> Self {
        FleetError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl FleetError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        FleetError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Create a network error wrapping an IO failure.
    pub fn network(message: impl Into<String>, source: std::io::Error) -> Self {
        FleetError::Network {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Convert to a JSON-RPC error code for the data plane.
    ///
    /// Standard JSON-RPC error codes:
    /// - -32700: Parse error
    /// - -32601: Method not found
    /// - -32602: Invalid params
    /// - -32603: Internal error
    ///
    /// Application-defined codes:
    /// - -32000: Network/connectivity error
    /// - -32010: Service not registered
    /// - -32011: Service not available
    /// - -32012: Service lifecycle failure
    pub fn to_rpc_error_code(&self) -> i32 {
        match self {
            FleetError::Json { .. } => -32700,
            FleetError::MethodNotFound { .. } => -32601,
            FleetError::InvalidParams { .. } => -32602,
            FleetError::Network { .. } | FleetError::Timeout(_) => -32000,
            FleetError::ServiceNotRegistered { .. } => -32010,
            FleetError::ServiceUnavailable { .. } => -32011,
            FleetError::Lifecycle { .. } => -32012,
            FleetError::Remote { code, .. } => *code,
            _ => -32603,
        }
    }

    /// Check if this error is a transient transport condition.
    ///
    /// The route registry never retries; callers that do can use this.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FleetError::Network { .. } | FleetError::Timeout(_) | FleetError::ServiceUnavailable { .. }
        )
    }
}
