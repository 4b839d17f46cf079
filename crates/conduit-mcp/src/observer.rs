//! Connection lifecycle events.
//!
//! A [`ConnectionObserver`] is handed to the [`Supervisor`](crate::Supervisor)
//! at construction and shared by every connection it creates, so lifecycle
//! activity can be recorded (metrics, tests) without global state.

use std::time::Duration;

use crate::connection::ConnectionState;

/// Receives lifecycle events from connections. All methods default to no-ops.
pub trait ConnectionObserver: Send + Sync + 'static {
    /// A connection moved between states.
    fn state_changed(&self, _server: &str, _from: ConnectionState, _to: ConnectionState) {}

    /// The supervisor scheduled a reconnect attempt.
    fn reconnect_scheduled(&self, _server: &str, _attempt: u32, _delay: Duration) {}

    /// The supervisor stopped retrying a server.
    fn reconnect_exhausted(&self, _server: &str, _attempts: u32) {}

    /// A response arrived for an id with no pending request (late or unknown).
    fn unmatched_response(&self, _server: &str, _id: i64) {}

    /// An inbound message could not be decoded.
    fn malformed_message(&self, _server: &str, _error: &str) {}

    /// A server-initiated notification was received.
    fn notification(&self, _server: &str, _method: &str) {}
}

/// Observer that records nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ConnectionObserver for NoopObserver {}

/// Observer that reports events through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl ConnectionObserver for TracingObserver {
    fn state_changed(&self, server: &str, from: ConnectionState, to: ConnectionState) {
        tracing::info!(server = %server, %from, %to, "MCP connection state changed");
    }

    fn reconnect_scheduled(&self, server: &str, attempt: u32, delay: Duration) {
        tracing::info!(
            server = %server,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "MCP reconnect scheduled"
        );
    }

    fn reconnect_exhausted(&self, server: &str, attempts: u32) {
        tracing::warn!(
            server = %server,
            attempts,
            "MCP reconnect attempts exhausted, server stays disconnected until restart"
        );
    }

    fn unmatched_response(&self, server: &str, id: i64) {
        tracing::warn!(server = %server, id, "discarding response with no pending request");
    }

    fn malformed_message(&self, server: &str, error: &str) {
        tracing::warn!(server = %server, error = %error, "discarding malformed MCP message");
    }

    fn notification(&self, server: &str, method: &str) {
        tracing::debug!(server = %server, method = %method, "MCP notification received");
    }
}
