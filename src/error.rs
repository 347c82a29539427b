//! Unified error handling for rolepool
//!
//! Transport failures, routing failures and errors reported by the data
//! store itself are kept apart so the dispatcher can decide what is worth a
//! retry and what must reach the caller untouched.

use std::fmt;
use std::io;
use thiserror::Error;

use crate::routing::RoutingMode;

/// Main error type for pool operations
#[derive(Debug, Error)]
pub enum PoolError {
    /// Initial connect or handshake failed
    #[error("Connect error: {0}")]
    Connect(#[from] ConnectError),

    /// The link broke while the request was in flight
    #[error("Connection to {addr} lost")]
    ConnectionLost { addr: String },

    /// The routing mode cannot be satisfied by the current topology
    #[error("No eligible node for routing mode {mode}")]
    NoEligibleNode { mode: RoutingMode },

    /// The request deadline elapsed before a response arrived
    #[error("Request {sync} to {addr} timed out")]
    Timeout { addr: String, sync: u64 },

    /// The pool has been shut down
    #[error("Connection pool is closed")]
    PoolClosed,

    /// The connection was closed locally
    #[error("Connection to {addr} is closed")]
    Closed { addr: String },

    /// Error reported by the data store, passed through verbatim
    #[error("Server error {code}: {message}")]
    Server { code: u32, message: String },

    /// Malformed frame or body
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Node {addr} is already a pool member")]
    DuplicateNode { addr: String },

    #[error("Node {addr} is not a pool member")]
    UnknownNode { addr: String },
}

/// Failures while establishing a link to a node
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("{addr} is unreachable: {source}")]
    Unreachable {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Connecting to {addr} timed out")]
    Timeout { addr: String },

    #[error("Handshake with {addr} failed: {message}")]
    Handshake { addr: String, message: String },

    #[error("Authentication rejected by {addr}: {message}")]
    AuthRejected { addr: String, message: String },
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Result type alias for pool operations
pub type PoolResult<T> = Result<T, PoolError>;

impl PoolError {
    pub fn connection_lost<S: Into<String>>(addr: S) -> Self {
        PoolError::ConnectionLost { addr: addr.into() }
    }

    pub fn closed<S: Into<String>>(addr: S) -> Self {
        PoolError::Closed { addr: addr.into() }
    }

    pub fn protocol<S: Into<String>>(message: S) -> Self {
        PoolError::Protocol(message.into())
    }

    pub fn no_eligible_node(mode: RoutingMode) -> Self {
        PoolError::NoEligibleNode { mode }
    }

    /// Whether the dispatcher may retry this failure on another node.
    ///
    /// Only availability failures qualify. Server errors, timeouts and
    /// shutdown are surfaced as they are.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PoolError::ConnectionLost { .. }
                | PoolError::NoEligibleNode { .. }
                | PoolError::Closed { .. }
        )
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            PoolError::Config(_) => ErrorSeverity::Critical,
            PoolError::Protocol(_) => ErrorSeverity::Critical,
            PoolError::Connect(_) => ErrorSeverity::Warning,
            PoolError::ConnectionLost { .. } => ErrorSeverity::Warning,
            PoolError::Timeout { .. } => ErrorSeverity::Warning,
            PoolError::Closed { .. } | PoolError::PoolClosed => ErrorSeverity::Info,
            _ => ErrorSeverity::Error,
        }
    }
}

impl ConnectError {
    pub fn handshake<A: Into<String>, M: Into<String>>(addr: A, message: M) -> Self {
        ConnectError::Handshake {
            addr: addr.into(),
            message: message.into(),
        }
    }

    pub fn auth_rejected<A: Into<String>, M: Into<String>>(addr: A, message: M) -> Self {
        ConnectError::AuthRejected {
            addr: addr.into(),
            message: message.into(),
        }
    }
}

/// Error severity levels for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical errors that require immediate attention
    Critical,
    /// Errors that affect functionality but don't crash the system
    Error,
    /// Warnings about potential issues
    Warning,
    /// Informational messages about recoverable issues
    Info,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Warning => write!(f, "WARNING"),
            ErrorSeverity::Info => write!(f, "INFO"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = PoolError::connection_lost("10.0.0.1:3301");
        assert_eq!(error.to_string(), "Connection to 10.0.0.1:3301 lost");

        let error = PoolError::no_eligible_node(RoutingMode::RequireReadWrite);
        assert_eq!(
            error.to_string(),
            "No eligible node for routing mode require-rw"
        );

        let error = PoolError::Server {
            code: 3,
            message: "Duplicate key exists".to_string(),
        };
        assert_eq!(error.to_string(), "Server error 3: Duplicate key exists");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(PoolError::connection_lost("a:1").is_retryable());
        assert!(PoolError::no_eligible_node(RoutingMode::Any).is_retryable());
        assert!(PoolError::closed("a:1").is_retryable());

        let server = PoolError::Server {
            code: 3,
            message: "dup".to_string(),
        };
        assert!(!server.is_retryable());
        assert!(!PoolError::Timeout { addr: "a:1".to_string(), sync: 7 }.is_retryable());
        assert!(!PoolError::PoolClosed.is_retryable());
    }

    #[test]
    fn test_error_severity() {
        let config_error = PoolError::Config(ConfigError::ValidationError("test".to_string()));
        assert_eq!(config_error.severity(), ErrorSeverity::Critical);

        let connect_error = PoolError::Connect(ConnectError::Unreachable {
            addr: "a:1".to_string(),
            source: io::Error::new(io::ErrorKind::ConnectionRefused, "test"),
        });
        assert_eq!(connect_error.severity(), ErrorSeverity::Warning);
        assert_eq!(PoolError::PoolClosed.severity(), ErrorSeverity::Info);
        assert_eq!(ErrorSeverity::Warning.to_string(), "WARNING");
    }

    #[test]
    fn test_connect_error_conversion() {
        let error: PoolError = ConnectError::auth_rejected("a:1", "bad password").into();
        assert!(matches!(error, PoolError::Connect(ConnectError::AuthRejected { .. })));
        assert_eq!(
            error.to_string(),
            "Connect error: Authentication rejected by a:1: bad password"
        );
    }
}
