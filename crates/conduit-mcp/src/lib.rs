//! MCP (Model Context Protocol) runtime for conduit.
//!
//! This crate supervises connections to MCP servers (child processes over
//! stdio, or HTTP endpoints), correlates their asynchronous responses, and
//! serves the same protocol back to a peer through a [`Dispatcher`].
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Supervisor                                                 │
//! │  - name → ServerHandle registry, idempotent start/stop      │
//! │  - reconnects dropped servers with bounded backoff          │
//! └─────────────────────────────────────────────────────────────┘
//!                           │ one per server
//!                           ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Connection actor (ServerHandle)                            │
//! │  - handshake, pending-request table, deadlines, tool cache  │
//! └─────────────────────────────────────────────────────────────┘
//!                           │
//!                           ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  McpTransport + FrameDecoder                                │
//! │  - newline or Content-Length framing over child stdio       │
//! │  - JSON-RPC over HTTP POST                                  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use conduit_mcp::{McpServerConfig, Supervisor};
//!
//! let supervisor = Supervisor::new();
//! let handle = supervisor
//!     .start(McpServerConfig::new("sqlite", "mcp-server-sqlite").with_arg("--db").with_arg("/tmp/db"))
//!     .await?
//!     .into_handle();
//!
//! for tool in handle.list_tools()? {
//!     println!("Tool: {} - {:?}", tool.name, tool.description);
//! }
//!
//! let result = handle.call_tool("query", Some(json!({"sql": "SELECT 1"}))).await?;
//! println!("Result: {:?}", result.text());
//! ```
//!
//! # Protocol flow
//!
//! 1. Client sends `initialize` with capabilities
//! 2. Server responds with its capabilities
//! 3. Client sends `notifications/initialized`
//! 4. Client fetches `tools/list`; the connection is now `Connected`
//!
//! Nothing but `initialize` may be written to a transport before step 2.

pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod framing;
pub mod observer;
pub mod peer;
pub mod protocol;
pub mod supervisor;
pub mod transport;

// Re-export main types
pub use connection::{
    ConnectionState, McpServerConfig, ServerHandle, ServerStatus, StatusSummary, TransportType,
};
pub use dispatcher::{
    Dispatcher, HandlerResult, MethodHandler, ResourceHandler, ToolBackend, ToolHandler,
};
pub use error::{McpError, Result};
pub use framing::{FrameDecoder, FrameError, Framing};
pub use observer::{ConnectionObserver, NoopObserver, TracingObserver};
pub use peer::{PeerConfig, SupervisorTools};
pub use protocol::{
    CallToolParams, CallToolResult, InitializeParams, InitializeResult, JsonRpcError,
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ListResourcesResult, ListToolsResult,
    ReadResourceResult, ResourceContents, ResourceInfo, ServerCapabilities, ServerInfo,
    ToolContent, ToolInfo, ToolsCapability,
};
pub use supervisor::{ReconnectPolicy, ServerSummary, Started, Supervisor};
pub use transport::{HttpTransportConfig, McpTransport, TransportEvent};
