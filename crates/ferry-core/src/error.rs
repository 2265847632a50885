//! Error types for the Ferry engine.
//!
//! Every failure an invocation can surface is an [`RpcError`]. Errors that
//! cross the wire are mapped to JSON-RPC error codes with
//! [`RpcError::to_rpc_error_code`] and rebuilt on the calling side as
//! [`RpcError::Remote`].

use crate::protocol::{ErrorCode, ProtocolError};
use std::time::Duration;
use thiserror::Error;

/// Main error type for Ferry.
#[derive(Debug, Error)]
pub enum RpcError {
    // Wire-level errors
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Method not found: {method}")]
    MethodNotFound { method: String },

    #[error("Invalid params: {message}")]
    InvalidParams { message: String },

    // Invocation errors
    #[error("Invocation failed: {message}")]
    InvocationFailed {
        message: String,
        data: Option<serde_json::Value>,
    },

    #[error("Remote error [{code}]: {message}")]
    Remote {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    #[error("Invocation timed out after {0:?}")]
    Timeout(Duration),

    // Lifecycle errors
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Endpoint is already bound to a connection")]
    AlreadyBound,

    // Transport errors
    #[error("Invalid address '{address}': {message}")]
    InvalidAddress { address: String, message: String },

    #[error("No suitable {kind} factory found for '{address}': {}", reasons.join("; "))]
    NoSuitableFactory {
        kind: &'static str,
        address: String,
        reasons: Vec<String>,
    },

    #[error("Transport error for {address}: {message}")]
    Transport { address: String, message: String },

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for Ferry operations.
pub type Result<T> = std::result::Result<T, RpcError>;

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        RpcError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl RpcError {
    /// Failure raised by an exposed method.
    pub fn failed(message: impl Into<String>) -> Self {
        RpcError::InvocationFailed {
            message: message.into(),
            data: None,
        }
    }

    /// Convert to a JSON-RPC error code.
    ///
    /// Errors received from the peer keep the code they arrived with, so a
    /// failure deep in a callback chain is reported with its original code.
    pub fn to_rpc_error_code(&self) -> i32 {
        match self {
            RpcError::Protocol(err) => err.code() as i32,
            RpcError::MethodNotFound { .. } => ErrorCode::MethodNotFound as i32,
            RpcError::InvalidParams { .. } => ErrorCode::InvalidParams as i32,
            RpcError::Remote { code, .. } => *code,
            _ => ErrorCode::InternalError as i32,
        }
    }

    /// Short message and optional detail for an outgoing error response.
    ///
    /// Standard codes use their canonical message; the specific reason goes
    /// into `data`.
    pub fn to_error_parts(&self) -> (i32, String, Option<serde_json::Value>) {
        match self {
            RpcError::Remote {
                code,
                message,
                data,
            } => (*code, message.clone(), data.clone()),
            RpcError::MethodNotFound { method } => (
                ErrorCode::MethodNotFound as i32,
                ErrorCode::MethodNotFound.message().to_string(),
                Some(serde_json::Value::String(method.clone())),
            ),
            RpcError::InvocationFailed { message, data } => (
                ErrorCode::InternalError as i32,
                ErrorCode::InternalError.message().to_string(),
                Some(
                    data.clone()
                        .unwrap_or_else(|| serde_json::Value::String(message.clone())),
                ),
            ),
            RpcError::InvalidParams { message } => (
                ErrorCode::InvalidParams as i32,
                ErrorCode::InvalidParams.message().to_string(),
                Some(serde_json::Value::String(message.clone())),
            ),
            RpcError::Protocol(err) => (
                err.code() as i32,
                err.code().message().to_string(),
                Some(serde_json::Value::String(err.to_string())),
            ),
            other => (
                ErrorCode::InternalError as i32,
                ErrorCode::InternalError.message().to_string(),
                Some(serde_json::Value::String(other.to_string())),
            ),
        }
    }

    /// Check if this error ends the connection rather than a single invocation.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, RpcError::ConnectionClosed | RpcError::Io { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RpcError::MethodNotFound {
            method: "nope".into(),
        };
        assert_eq!(err.to_string(), "Method not found: nope");
    }

    #[test]
    fn test_rpc_error_codes() {
        assert_eq!(
            RpcError::MethodNotFound {
                method: "x".into()
            }
            .to_rpc_error_code(),
            -32601
        );
        assert_eq!(RpcError::failed("boom").to_rpc_error_code(), -32603);
        assert_eq!(RpcError::ConnectionClosed.to_rpc_error_code(), -32603);
        assert_eq!(
            RpcError::Remote {
                code: -32001,
                message: "custom".into(),
                data: None
            }
            .to_rpc_error_code(),
            -32001
        );
    }

    #[test]
    fn test_invocation_failure_carries_message_as_data() {
        let (code, message, data) = RpcError::failed("disk on fire").to_error_parts();
        assert_eq!(code, -32603);
        assert_eq!(message, "Internal error");
        assert_eq!(data, Some(serde_json::json!("disk on fire")));
    }

    #[test]
    fn test_no_suitable_factory_lists_reasons() {
        let err = RpcError::NoSuitableFactory {
            kind: "client",
            address: "ftp://host".into(),
            reasons: vec!["tcp: unsupported scheme 'ftp'".into()],
        };
        assert!(err.to_string().contains("unsupported scheme 'ftp'"));
    }

    #[test]
    fn test_connection_fatal_errors() {
        assert!(RpcError::ConnectionClosed.is_connection_fatal());
        assert!(!RpcError::failed("x").is_connection_fatal());
    }
}
