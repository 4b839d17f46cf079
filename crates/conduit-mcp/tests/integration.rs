//! Integration tests for the MCP runtime.
//!
//! These tests drive the mock MCP server through the supervisor to verify
//! the full protocol flow, correlation, timeouts and reconnects.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use conduit_mcp::peer::{self, PeerConfig};
use conduit_mcp::protocol::methods;
use conduit_mcp::{
    ConnectionObserver, ConnectionState, Dispatcher, Framing, McpError, McpServerConfig,
    ReconnectPolicy, Started, Supervisor, SupervisorTools,
};
use serde_json::json;

/// Observer that records what the runtime reports.
#[derive(Default)]
struct Recorder {
    transitions: Mutex<Vec<(String, ConnectionState, ConnectionState)>>,
    scheduled: AtomicU32,
    exhausted: AtomicU32,
    unmatched: AtomicU32,
    notifications: Mutex<Vec<String>>,
}

impl ConnectionObserver for Recorder {
    fn state_changed(&self, server: &str, from: ConnectionState, to: ConnectionState) {
        self.transitions
            .lock()
            .unwrap()
            .push((server.to_string(), from, to));
    }

    fn reconnect_scheduled(&self, _server: &str, _attempt: u32, _delay: Duration) {
        self.scheduled.fetch_add(1, Ordering::SeqCst);
    }

    fn reconnect_exhausted(&self, _server: &str, _attempts: u32) {
        self.exhausted.fetch_add(1, Ordering::SeqCst);
    }

    fn unmatched_response(&self, _server: &str, _id: i64) {
        self.unmatched.fetch_add(1, Ordering::SeqCst);
    }

    fn notification(&self, _server: &str, method: &str) {
        self.notifications.lock().unwrap().push(method.to_string());
    }
}

/// Config for the mock server binary with the given flags.
fn mock(name: &str, args: &[&str]) -> McpServerConfig {
    McpServerConfig::new(name, env!("CARGO_BIN_EXE_mock-mcp-server"))
        .with_args(args.iter().map(|a| a.to_string()).collect())
        .with_init_timeout(Duration::from_secs(5))
}

fn supervisor(policy: ReconnectPolicy) -> (Supervisor, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let supervisor = Supervisor::with_policy(policy, recorder.clone());
    (supervisor, recorder)
}

fn fast_retry(max_attempts: u32) -> ReconnectPolicy {
    ReconnectPolicy::default()
        .with_max_attempts(max_attempts)
        .with_delay(Duration::from_millis(100))
}

/// Poll `condition` until it holds or `timeout` elapses.
async fn eventually(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

// ─────────────────────────────────────────────────────────────────────────────
// Handshake
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_connect_and_list_tools() {
    let (supervisor, _) = supervisor(ReconnectPolicy::disabled());
    let handle = supervisor
        .start(mock("stub", &["--tools", "echo"]))
        .await
        .expect("Failed to start")
        .into_handle();

    let names: Vec<String> = handle
        .list_tools()
        .expect("Failed to list tools")
        .into_iter()
        .map(|t| t.name)
        .collect();
    assert_eq!(names, vec!["echo"]);

    let status = handle.get_status();
    assert_eq!(status.state, ConnectionState::Connected);
    assert_eq!(status.tool_count, 1);
    assert_eq!(status.reconnect_attempts, 0);

    let full = handle.status();
    assert_eq!(full.server_info.unwrap().name, "mock-mcp-server");

    let summary = supervisor.list();
    assert_eq!(summary.len(), 1);
    assert_eq!(summary[0].name, "stub");
    assert_eq!(summary[0].tool_count, 1);

    supervisor.shutdown_all().await;
    assert!(supervisor.is_empty());
}

#[tokio::test]
async fn test_silent_server_disconnects_after_init_timeout() {
    let (supervisor, _) = supervisor(ReconnectPolicy::disabled());
    let init_timeout = Duration::from_millis(300);
    let config = mock("silent", &["--silent"]).with_init_timeout(init_timeout);

    let started_at = Instant::now();
    let handle = supervisor.start(config).await.unwrap().into_handle();
    let elapsed = started_at.elapsed();

    assert!(elapsed >= init_timeout, "start returned before the handshake settled");
    assert!(elapsed < init_timeout + Duration::from_secs(2), "start blocked for {elapsed:?}");
    assert_eq!(handle.state(), ConnectionState::Disconnected);
    assert!(handle.status().last_error.unwrap().contains("timed out"));
    assert!(matches!(
        supervisor.call_tool("silent", "echo", None).await,
        Err(McpError::NotConnected { .. })
    ));
}

#[tokio::test]
async fn test_content_length_framing() {
    let (supervisor, _) = supervisor(ReconnectPolicy::disabled());
    let config = mock("framed", &["--framing", "content-length"]).with_framing(Framing::ContentLength);
    supervisor.start(config).await.unwrap();

    let result = supervisor
        .call_tool("framed", "add", Some(json!({"a": 2, "b": 3})))
        .await
        .expect("Failed to call tool");
    assert_eq!(result.text(), Some("5".to_string()));
}

#[tokio::test]
async fn test_bad_version_fails_handshake() {
    let (supervisor, _) = supervisor(ReconnectPolicy::disabled());
    let handle = supervisor
        .start(mock("old", &["--bad-version"]))
        .await
        .unwrap()
        .into_handle();

    assert_eq!(handle.state(), ConnectionState::Disconnected);
    let error = handle.status().last_error.unwrap();
    assert!(error.contains("unsupported JSON-RPC version"), "{error}");
}

// ─────────────────────────────────────────────────────────────────────────────
// Calls
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_call_tools() {
    let (supervisor, _) = supervisor(ReconnectPolicy::disabled());
    let handle = supervisor.start(mock("tools", &[])).await.unwrap().into_handle();

    let result = handle
        .call_tool("echo", Some(json!({"message": "Hello, MCP!"})))
        .await
        .expect("Failed to call tool");
    assert!(!result.is_error());
    assert_eq!(result.text(), Some("Hello, MCP!".to_string()));

    let result = handle.call_tool("nonexistent", None).await.unwrap();
    assert!(result.is_error());

    let err = handle
        .call("no/such/method", None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, McpError::ServerError { code: -32601, .. }));
}

#[tokio::test]
async fn test_resources() {
    let (supervisor, _) = supervisor(ReconnectPolicy::disabled());
    let handle = supervisor.start(mock("res", &[])).await.unwrap().into_handle();

    let resources = handle.list_resources().await.unwrap();
    assert_eq!(resources.len(), 1);
    assert_eq!(resources[0].uri, "mock://readme");

    let read = handle.read_resource("mock://readme").await.unwrap();
    assert_eq!(read.contents[0].text.as_deref(), Some("mock readme"));

    assert!(handle.read_resource("mock://missing").await.is_err());
}

#[tokio::test]
async fn test_out_of_order_responses_reach_their_callers() {
    let (supervisor, _) = supervisor(ReconnectPolicy::disabled());
    let handle = supervisor.start(mock("ooo", &[])).await.unwrap().into_handle();

    let (slow, fast) = tokio::join!(
        handle.call_tool("slow", Some(json!({"delay_ms": 400}))),
        handle.call_tool("echo", Some(json!({"message": "quick"}))),
    );
    assert_eq!(slow.unwrap().text(), Some("Slept for 400 ms".to_string()));
    assert_eq!(fast.unwrap().text(), Some("quick".to_string()));
}

#[tokio::test]
async fn test_timeout_and_late_response_is_discarded() {
    let (supervisor, recorder) = supervisor(ReconnectPolicy::disabled());
    let handle = supervisor.start(mock("late", &[])).await.unwrap().into_handle();

    let timeout = Duration::from_millis(150);
    let started_at = Instant::now();
    let err = handle
        .call_tool_with_timeout("slow", Some(json!({"delay_ms": 600})), Some(timeout))
        .await
        .unwrap_err();
    let elapsed = started_at.elapsed();

    assert!(matches!(err, McpError::Timeout { .. }), "{err:?}");
    assert!(elapsed < Duration::from_secs(1), "timed out after {elapsed:?}");

    assert!(
        eventually(Duration::from_secs(3), || recorder.unmatched.load(Ordering::SeqCst) == 1).await,
        "late response was not reported as unmatched"
    );
    assert_eq!(handle.state(), ConnectionState::Connected);

    let result = handle
        .call_tool("echo", Some(json!({"message": "still here"})))
        .await
        .unwrap();
    assert_eq!(result.text(), Some("still here".to_string()));
}

#[tokio::test]
async fn test_stalled_server_does_not_block_others() {
    let (supervisor, _) = supervisor(ReconnectPolicy::disabled());
    supervisor.start(mock("stalled", &[])).await.unwrap();
    supervisor.start(mock("healthy", &[])).await.unwrap();

    let stalled = supervisor.clone();
    let blocked = tokio::spawn(async move {
        stalled
            .call_tool("stalled", "slow", Some(json!({"delay_ms": 2000})))
            .await
    });

    let started_at = Instant::now();
    let result = supervisor
        .call_tool("healthy", "echo", Some(json!({"message": "ok"})))
        .await
        .unwrap();
    assert_eq!(result.text(), Some("ok".to_string()));
    assert!(started_at.elapsed() < Duration::from_secs(1));

    supervisor.stop("stalled").await.unwrap();
    assert!(matches!(
        blocked.await.unwrap(),
        Err(McpError::ClientTerminated)
    ));
}

#[tokio::test]
async fn test_stop_fails_in_flight_call() {
    let (supervisor, _) = supervisor(ReconnectPolicy::disabled());
    let handle = supervisor.start(mock("victim", &[])).await.unwrap().into_handle();

    let caller = handle.clone();
    let in_flight = tokio::spawn(async move {
        caller
            .call_tool_with_timeout(
                "slow",
                Some(json!({"delay_ms": 5000})),
                Some(Duration::from_secs(10)),
            )
            .await
    });
    tokio::time::sleep(Duration::from_millis(200)).await;

    supervisor.stop("victim").await.unwrap();
    let result = tokio::time::timeout(Duration::from_secs(2), in_flight)
        .await
        .expect("call hung after stop")
        .unwrap();
    assert!(matches!(result, Err(McpError::ClientTerminated)));
    assert_eq!(handle.state(), ConnectionState::Terminated);
    assert!(supervisor.lookup("victim").is_none());
}

#[tokio::test]
async fn test_stop_is_prompt_when_server_stops_reading() {
    let (supervisor, _) = supervisor(ReconnectPolicy::disabled());
    let handle = supervisor
        .start(mock("stall", &["--deaf-after-init"]))
        .await
        .unwrap()
        .into_handle();
    assert_eq!(handle.state(), ConnectionState::Connected);

    // Far larger than a pipe buffer, so the write can never complete.
    let blob = "x".repeat(1 << 20);
    let caller = handle.clone();
    let in_flight = tokio::spawn(async move {
        caller
            .call_tool_with_timeout("echo", Some(json!({"message": blob})), Some(Duration::from_secs(30)))
            .await
    });
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(handle.get_status().state, ConnectionState::Connected);

    tokio::time::timeout(Duration::from_secs(2), supervisor.stop("stall"))
        .await
        .expect("stop hung on a stalled server")
        .unwrap();
    let result = tokio::time::timeout(Duration::from_secs(2), in_flight)
        .await
        .expect("call hung after stop")
        .unwrap();
    assert!(matches!(result, Err(McpError::ClientTerminated)));
    assert_eq!(handle.state(), ConnectionState::Terminated);
}

#[tokio::test]
async fn test_tools_list_changed_refreshes_cache() {
    let (supervisor, recorder) = supervisor(ReconnectPolicy::disabled());
    let handle = supervisor
        .start(mock("dynamic", &["--tools", "echo", "--notify-tools-changed"]))
        .await
        .unwrap()
        .into_handle();
    assert_eq!(handle.get_status().tool_count, 1);

    handle
        .call_tool("echo", Some(json!({"message": "trigger"})))
        .await
        .unwrap();

    assert!(
        eventually(Duration::from_secs(3), || handle.has_tool("added")).await,
        "tool cache was not refreshed"
    );
    assert_eq!(handle.get_status().tool_count, 2);
    assert!(
        recorder
            .notifications
            .lock()
            .unwrap()
            .contains(&methods::TOOLS_LIST_CHANGED.to_string())
    );

    let refreshed = handle.refresh_tools().await.unwrap();
    assert_eq!(refreshed.len(), 2);
}

// ─────────────────────────────────────────────────────────────────────────────
// Supervision
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_concurrent_start_shares_one_connection() {
    let (supervisor, _) = supervisor(ReconnectPolicy::disabled());
    let config = mock("shared", &[]);

    let (a, b) = tokio::join!(supervisor.start(config.clone()), supervisor.start(config));
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.handle().id(), b.handle().id());
    assert_eq!(
        [&a, &b].iter().filter(|s| matches!(s, Started::Spawned(_))).count(),
        1
    );
    assert_eq!(supervisor.len(), 1);
}

#[tokio::test]
async fn test_crash_schedules_exactly_one_reconnect() {
    let (supervisor, recorder) = supervisor(fast_retry(3));
    let handle = supervisor
        .start(mock("flaky", &["--crash-on", "boom"]))
        .await
        .unwrap()
        .into_handle();

    let ok = handle
        .call_tool("echo", Some(json!({"message": "before"})))
        .await
        .unwrap();
    assert_eq!(ok.text(), Some("before".to_string()));

    let err = handle.call_tool("boom", None).await.unwrap_err();
    assert!(
        matches!(err, McpError::Broken(_) | McpError::Timeout { .. }),
        "{err:?}"
    );

    assert!(
        eventually(Duration::from_secs(5), || {
            recorder.scheduled.load(Ordering::SeqCst) >= 1
                && handle.state() == ConnectionState::Connected
        })
        .await,
        "server did not come back"
    );
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(recorder.scheduled.load(Ordering::SeqCst), 1);
    assert_eq!(handle.get_status().reconnect_attempts, 0);

    let transitions = recorder.transitions.lock().unwrap().clone();
    assert!(transitions.contains(&(
        "flaky".to_string(),
        ConnectionState::Connected,
        ConnectionState::Disconnected
    )));
    assert!(transitions.contains(&(
        "flaky".to_string(),
        ConnectionState::Disconnected,
        ConnectionState::Reconnecting
    )));

    let after = handle
        .call_tool("echo", Some(json!({"message": "after"})))
        .await
        .unwrap();
    assert_eq!(after.text(), Some("after".to_string()));
}

async fn exhausted_reconnects_then_restart() {
    let (supervisor, recorder) = supervisor(fast_retry(2));
    let config = mock("dead", &["--silent"]).with_init_timeout(Duration::from_millis(150));
    let handle = supervisor.start(config).await.unwrap().into_handle();

    assert!(
        eventually(Duration::from_secs(5), || recorder.exhausted.load(Ordering::SeqCst) == 1).await,
        "reconnects were never exhausted"
    );
    assert_eq!(recorder.scheduled.load(Ordering::SeqCst), 2);
    let status = handle.get_status();
    assert_eq!(status.state, ConnectionState::Disconnected);
    assert_eq!(status.reconnect_attempts, 2);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(handle.state(), ConnectionState::Disconnected);
    assert!(matches!(
        supervisor.call("dead", methods::TOOLS_LIST, None, None).await,
        Err(McpError::NotConnected { .. })
    ));

    handle.restart().await.unwrap();
    let status = handle.get_status();
    assert_eq!(status.reconnect_attempts, 0);
    assert_eq!(status.state, ConnectionState::Initializing);
    assert_eq!(supervisor.lookup("dead").unwrap().id(), handle.id());
    supervisor.shutdown_all().await;
}

#[tokio::test]
async fn test_exhausted_reconnects_then_restart() {
    exhausted_reconnects_then_restart().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_exhausted_reconnects_then_restart_multi_thread() {
    exhausted_reconnects_then_restart().await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Server side
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_peer_discover_and_route() {
    let (supervisor, _) = supervisor(ReconnectPolicy::disabled());
    supervisor
        .start(mock("mock", &["--tools", "echo", "--peer"]))
        .await
        .unwrap();

    let mut dispatcher = Dispatcher::new("conduit", "test");
    peer::install(&mut dispatcher, supervisor.clone(), PeerConfig::default());

    let response = dispatcher
        .handle_request(1, methods::PEER_DISCOVER, Some(json!({"depth": 1})))
        .await;
    let result = response.result.expect("discover failed");
    let server = &result["servers"][0];
    assert_eq!(server["name"], "mock");
    assert_eq!(server["state"], "connected");
    assert_eq!(server["tools"], json!(["echo"]));
    assert_eq!(server["peers"]["servers"][0]["name"], "leaf");

    let response = dispatcher
        .handle_request(
            2,
            methods::PEER_ROUTE,
            Some(json!({"tool": "echo", "arguments": {"message": "routed"}})),
        )
        .await;
    let result = response.result.expect("route failed");
    assert_eq!(result["server"], "mock");
    assert_eq!(result["result"]["content"][0]["text"], "routed");
}

#[tokio::test]
async fn test_gateway_reexports_downstream_tools() {
    let (supervisor, _) = supervisor(ReconnectPolicy::disabled());
    supervisor
        .start(mock("downstream", &["--tools", "echo,add"]))
        .await
        .unwrap();

    let mut dispatcher = Dispatcher::new("conduit", "test");
    dispatcher.set_backend(Arc::new(SupervisorTools::new(
        supervisor.clone(),
        Duration::from_secs(5),
    )));

    let response = dispatcher.handle_request(1, methods::TOOLS_LIST, None).await;
    let tools = response.result.unwrap()["tools"].clone();
    assert_eq!(tools.as_array().unwrap().len(), 2);

    let response = dispatcher
        .handle_request(
            2,
            methods::TOOLS_CALL,
            Some(json!({"name": "add", "arguments": {"a": 1, "b": 2}})),
        )
        .await;
    assert_eq!(response.result.unwrap()["content"][0]["text"], "3");
}
