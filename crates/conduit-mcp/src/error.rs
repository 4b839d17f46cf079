//! Error types for MCP runtime operations.

use std::time::Duration;

use thiserror::Error;

use crate::connection::ConnectionState;
use crate::protocol::JsonRpcError;

/// Result type for MCP operations.
pub type Result<T> = std::result::Result<T, McpError>;

/// Error type for MCP operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// The server executable is missing or could not be started.
    #[error("failed to spawn MCP server: {0}")]
    Spawn(String),

    /// Writing to the transport failed (pipe closed, HTTP send failed).
    #[error("write failed: {0}")]
    Write(String),

    /// The transport broke or the server process exited while a request was in flight.
    #[error("transport broken: {0}")]
    Broken(String),

    /// HTTP transport setup or exchange error.
    #[error("transport error: {0}")]
    Transport(String),

    /// Inbound bytes could not be decoded into an envelope.
    #[error("decode error: {0}")]
    Decode(String),

    /// Well-formed envelope that is semantically invalid.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Server returned an error response.
    #[error("server error {code}: {message}")]
    ServerError {
        /// Error code from the server.
        code: i64,
        /// Error message from the server.
        message: String,
        /// Optional additional data.
        data: Option<serde_json::Value>,
    },

    /// No response arrived before the request deadline.
    #[error("'{method}' timed out after {timeout:?}")]
    Timeout {
        /// Method of the request that timed out.
        method: String,
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// A call was attempted while the connection was not `Connected`.
    #[error("server '{server}' is not connected (state: {state})")]
    NotConnected {
        /// Server name.
        server: String,
        /// State at the time of the call.
        state: ConnectionState,
    },

    /// No server is registered under the given name.
    #[error("server '{0}' not found")]
    NotFound(String),

    /// The request was failed because the connection was stopped or restarted.
    #[error("client terminated")]
    ClientTerminated,

    /// A method other than `initialize` was sent before the handshake completed.
    #[error("'{0}' sent before the initialize handshake completed")]
    HandshakeIncomplete(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Application-defined JSON-RPC codes used when runtime errors cross the wire.
pub mod codes {
    /// Named server or tool does not exist.
    pub const NOT_FOUND: i64 = -32001;
    /// Target server is not connected.
    pub const NOT_CONNECTED: i64 = -32002;
    /// Request to the target server timed out.
    pub const TIMEOUT: i64 = -32003;
    /// Operation refused by local policy.
    pub const FORBIDDEN: i64 = -32004;
}

impl McpError {
    /// Create a spawn error.
    pub fn spawn(msg: impl Into<String>) -> Self {
        Self::Spawn(msg.into())
    }

    /// Create a write error.
    pub fn write(msg: impl Into<String>) -> Self {
        Self::Write(msg.into())
    }

    /// Create a broken-transport error.
    pub fn broken(msg: impl Into<String>) -> Self {
        Self::Broken(msg.into())
    }

    /// Create a transport error.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a decode error.
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// Create a protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a server error from an error response.
    pub fn server_error(
        code: i64,
        message: impl Into<String>,
        data: Option<serde_json::Value>,
    ) -> Self {
        Self::ServerError {
            code,
            message: message.into(),
            data,
        }
    }

    /// Whether the error means the transport is unusable.
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            Self::Spawn(_) | Self::Write(_) | Self::Broken(_) | Self::Io(_)
        )
    }

    /// Convert into a JSON-RPC error object for a response envelope.
    pub fn to_rpc_error(&self) -> JsonRpcError {
        match self {
            Self::ServerError {
                code,
                message,
                data,
            } => JsonRpcError::new(*code, message.clone()).with_data(data.clone()),
            Self::NotFound(_) => JsonRpcError::new(codes::NOT_FOUND, self.to_string()),
            Self::NotConnected { .. } | Self::ClientTerminated => {
                JsonRpcError::new(codes::NOT_CONNECTED, self.to_string())
            }
            Self::Timeout { .. } => JsonRpcError::new(codes::TIMEOUT, self.to_string()),
            Self::Decode(_) | Self::Json(_) => {
                JsonRpcError::new(JsonRpcError::INVALID_PARAMS, self.to_string())
            }
            _ => JsonRpcError::new(JsonRpcError::INTERNAL_ERROR, self.to_string()),
        }
    }
}

impl From<JsonRpcError> for McpError {
    fn from(err: JsonRpcError) -> Self {
        Self::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = McpError::spawn("command not found");
        assert!(err.to_string().contains("spawn"));
        assert!(err.to_string().contains("command not found"));

        let err = McpError::server_error(-32600, "Invalid Request", None);
        assert!(err.to_string().contains("-32600"));
        assert!(err.to_string().contains("Invalid Request"));

        let err = McpError::NotConnected {
            server: "files".to_string(),
            state: ConnectionState::Disconnected,
        };
        assert!(err.to_string().contains("files"));
        assert!(err.to_string().contains("disconnected"));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let mcp_err: McpError = json_err.into();
        assert!(matches!(mcp_err, McpError::Json(_)));
    }

    #[test]
    fn test_transport_failure_classification() {
        assert!(McpError::broken("eof").is_transport_failure());
        assert!(McpError::write("pipe").is_transport_failure());
        assert!(!McpError::protocol("bad version").is_transport_failure());
        assert!(!McpError::ClientTerminated.is_transport_failure());
    }

    #[test]
    fn test_rpc_error_mapping() {
        let err = McpError::server_error(-32602, "bad args", Some(serde_json::json!({"x": 1})));
        let rpc = err.to_rpc_error();
        assert_eq!(rpc.code, -32602);
        assert_eq!(rpc.message, "bad args");
        assert!(rpc.data.is_some());

        assert_eq!(
            McpError::NotFound("x".into()).to_rpc_error().code,
            codes::NOT_FOUND
        );
        let timeout = McpError::Timeout {
            method: "tools/call".into(),
            timeout: Duration::from_millis(5),
        };
        assert_eq!(timeout.to_rpc_error().code, codes::TIMEOUT);
    }

    #[test]
    fn test_from_rpc_error() {
        let err: McpError = JsonRpcError::method_not_found("nope").into();
        match err {
            McpError::ServerError { code, message, .. } => {
                assert_eq!(code, JsonRpcError::METHOD_NOT_FOUND);
                assert!(message.contains("nope"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
