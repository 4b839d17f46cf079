//! Mock MCP server for integration testing.
//!
//! Responds to initialize, tools/list, tools/call, resources/list,
//! resources/read and (with `--peer`) peer/discover. Every request is handled
//! on its own thread, so slow tools answer out of order.
//!
//! Usage:
//!   mock-mcp-server [OPTIONS]
//!
//! Options:
//!   --framing F            newline (default) or content-length
//!   --tools A,B,C          Tool names to advertise (default: echo,add,slow,crash)
//!   --silent               Never respond to anything
//!   --delay-ms N           Add N ms delay to all responses
//!   --crash-on TOOL        Exit with code 1 when TOOL is called
//!   --exit-after N         Exit with code 1 after answering N tool calls
//!   --slow-tool T:MS       Add MS delay when tool T is called
//!   --notify-tools-changed After the first tool call, add tool "added" and
//!                          send notifications/tools/list_changed
//!   --bad-version          Answer initialize with jsonrpc "1.0"
//!   --peer                 Advertise the peer extension and answer peer/discover
//!   --deaf-after-init      Stop reading stdin once the first tools/list is answered

use std::env;
use std::io::{BufRead, BufReader, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::{Value, json};

#[derive(Clone, Copy, PartialEq)]
enum Framing {
    Newline,
    ContentLength,
}

/// Server configuration parsed from command line.
struct ServerConfig {
    framing: Framing,
    tools: Vec<String>,
    silent: bool,
    delay_ms: u64,
    crash_on: Option<String>,
    exit_after: Option<u64>,
    slow_tools: Vec<(String, u64)>,
    notify_tools_changed: bool,
    bad_version: bool,
    peer: bool,
    deaf_after_init: bool,
}

impl ServerConfig {
    fn from_args() -> Self {
        let args: Vec<String> = env::args().collect();
        let mut config = Self {
            framing: Framing::Newline,
            tools: ["echo", "add", "slow", "crash"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            silent: false,
            delay_ms: 0,
            crash_on: None,
            exit_after: None,
            slow_tools: Vec::new(),
            notify_tools_changed: false,
            bad_version: false,
            peer: false,
            deaf_after_init: false,
        };

        let mut i = 1;
        while i < args.len() {
            let value = args.get(i + 1).cloned();
            let mut consumed = 1;
            match args[i].as_str() {
                "--framing" => {
                    if let Some(value) = value {
                        config.framing = if value == "content-length" {
                            Framing::ContentLength
                        } else {
                            Framing::Newline
                        };
                        consumed = 2;
                    }
                }
                "--tools" => {
                    if let Some(value) = value {
                        config.tools = value
                            .split(',')
                            .filter(|s| !s.is_empty())
                            .map(|s| s.to_string())
                            .collect();
                        consumed = 2;
                    }
                }
                "--delay-ms" => {
                    if let Some(value) = value {
                        config.delay_ms = value.parse().unwrap_or(0);
                        consumed = 2;
                    }
                }
                "--crash-on" => {
                    if let Some(value) = value {
                        config.crash_on = Some(value);
                        consumed = 2;
                    }
                }
                "--exit-after" => {
                    if let Some(value) = value {
                        config.exit_after = value.parse().ok();
                        consumed = 2;
                    }
                }
                "--slow-tool" => {
                    if let Some(value) = value {
                        if let Some((tool, ms)) = value.split_once(':') {
                            if let Ok(ms) = ms.parse() {
                                config.slow_tools.push((tool.to_string(), ms));
                            }
                        }
                        consumed = 2;
                    }
                }
                "--silent" => config.silent = true,
                "--notify-tools-changed" => config.notify_tools_changed = true,
                "--bad-version" => config.bad_version = true,
                "--peer" => config.peer = true,
                "--deaf-after-init" => config.deaf_after_init = true,
                _ => {}
            }
            i += consumed;
        }

        config
    }

    fn get_tool_delay(&self, tool_name: &str) -> u64 {
        for (tool, ms) in &self.slow_tools {
            if tool == tool_name {
                return *ms;
            }
        }
        0
    }
}

struct Server {
    config: ServerConfig,
    stdout: Mutex<std::io::Stdout>,
    calls_answered: AtomicU64,
    tools_added: AtomicBool,
}

impl Server {
    fn write(&self, message: &Value) {
        let json = message.to_string();
        let mut stdout = self.stdout.lock().unwrap();
        match self.config.framing {
            Framing::Newline => writeln!(stdout, "{}", json).unwrap(),
            Framing::ContentLength => {
                write!(stdout, "Content-Length: {}\r\n\r\n{}", json.len(), json).unwrap()
            }
        }
        stdout.flush().unwrap();
    }

    fn tool_list(&self) -> Value {
        let mut names = self.config.tools.clone();
        if self.tools_added.load(Ordering::SeqCst) {
            names.push("added".to_string());
        }
        let tools: Vec<Value> = names
            .iter()
            .map(|name| {
                json!({
                    "name": name,
                    "description": format!("Mock tool {}", name),
                    "inputSchema": {"type": "object", "properties": {}}
                })
            })
            .collect();
        json!({ "tools": tools })
    }

    fn handle(&self, request: Value) {
        let Some(id) = request.get("id").cloned() else {
            return; // Notification
        };
        let method = request
            .get("method")
            .and_then(|m| m.as_str())
            .unwrap_or("")
            .to_string();
        if method.is_empty() {
            return; // A response to something we never sent
        }
        let params = request.get("params").cloned().unwrap_or(json!({}));

        if self.config.delay_ms > 0 {
            thread::sleep(Duration::from_millis(self.config.delay_ms));
        }

        let result = match method.as_str() {
            "initialize" => {
                let mut capabilities = json!({ "tools": { "listChanged": true }, "resources": {} });
                if self.config.peer {
                    capabilities["experimental"] = json!({ "peer": { "version": 1 } });
                }
                let result = json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": capabilities,
                    "serverInfo": { "name": "mock-mcp-server", "version": "1.0.0" }
                });
                let version = if self.config.bad_version { "1.0" } else { "2.0" };
                self.write(&json!({ "jsonrpc": version, "id": id, "result": result }));
                return;
            }
            "ping" => Ok(json!({})),
            "tools/list" => Ok(self.tool_list()),
            "tools/call" => self.call_tool(&params),
            "resources/list" => Ok(json!({
                "resources": [{ "uri": "mock://readme", "name": "readme", "mimeType": "text/plain" }]
            })),
            "resources/read" => {
                let uri = params.get("uri").and_then(|u| u.as_str()).unwrap_or("");
                if uri == "mock://readme" {
                    Ok(json!({ "contents": [{ "uri": uri, "mimeType": "text/plain", "text": "mock readme" }] }))
                } else {
                    Err(json!({ "code": -32602, "message": format!("Unknown resource: {}", uri) }))
                }
            }
            "peer/discover" if self.config.peer => Ok(json!({
                "servers": [{ "name": "leaf", "state": "connected", "tool_count": 1, "tools": ["leaf_tool"] }]
            })),
            _ => Err(json!({ "code": -32601, "message": format!("Method not found: {}", method) })),
        };

        let response = match result {
            Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
            Err(error) => json!({ "jsonrpc": "2.0", "id": id, "error": error }),
        };
        self.write(&response);

        if method == "tools/call" {
            let answered = self.calls_answered.fetch_add(1, Ordering::SeqCst) + 1;
            if self.config.notify_tools_changed && !self.tools_added.swap(true, Ordering::SeqCst) {
                self.write(&json!({ "jsonrpc": "2.0", "method": "notifications/tools/list_changed" }));
            }
            if self.config.exit_after.is_some_and(|limit| answered >= limit) {
                std::process::exit(1);
            }
        }
    }

    fn call_tool(&self, params: &Value) -> Result<Value, Value> {
        let tool_name = params.get("name").and_then(|v| v.as_str()).unwrap_or("");
        let args = params.get("arguments").cloned().unwrap_or(json!({}));

        // Check if we should crash on this tool
        if self.config.crash_on.as_deref() == Some(tool_name) || tool_name == "crash" {
            std::process::exit(1);
        }

        // Apply tool-specific delay
        let tool_delay = self.config.get_tool_delay(tool_name);
        if tool_delay > 0 {
            thread::sleep(Duration::from_millis(tool_delay));
        }

        match tool_name {
            "echo" => {
                let message = args.get("message").and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!({ "content": [{ "type": "text", "text": message }] }))
            }
            "add" => {
                let a = args.get("a").and_then(|v| v.as_f64()).unwrap_or(0.0);
                let b = args.get("b").and_then(|v| v.as_f64()).unwrap_or(0.0);
                Ok(json!({ "content": [{ "type": "text", "text": format!("{}", a + b) }] }))
            }
            "slow" => {
                let delay = args.get("delay_ms").and_then(|v| v.as_u64()).unwrap_or(1000);
                thread::sleep(Duration::from_millis(delay));
                Ok(json!({ "content": [{ "type": "text", "text": format!("Slept for {} ms", delay) }] }))
            }
            _ => Ok(json!({
                "content": [{ "type": "text", "text": format!("Unknown tool: {}", tool_name) }],
                "isError": true
            })),
        }
    }
}

fn read_message(reader: &mut impl BufRead, framing: Framing) -> Option<String> {
    match framing {
        Framing::Newline => loop {
            let mut line = String::new();
            if reader.read_line(&mut line).ok()? == 0 {
                return None; // EOF
            }
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        },
        Framing::ContentLength => {
            let mut content_length: Option<usize> = None;
            loop {
                let mut header_line = String::new();
                if reader.read_line(&mut header_line).ok()? == 0 {
                    return None; // EOF
                }
                let trimmed = header_line.trim();
                if trimmed.is_empty() {
                    if content_length.is_some() {
                        break;
                    }
                    continue;
                }
                if let Some(len_str) = trimmed.strip_prefix("Content-Length:") {
                    content_length = len_str.trim().parse().ok();
                }
            }
            let mut body = vec![0u8; content_length?];
            reader.read_exact(&mut body).ok()?;
            String::from_utf8(body).ok()
        }
    }
}

fn main() {
    let config = ServerConfig::from_args();
    let framing = config.framing;
    let silent = config.silent;
    let deaf_after_init = config.deaf_after_init;
    let server = Arc::new(Server {
        config,
        stdout: Mutex::new(std::io::stdout()),
        calls_answered: AtomicU64::new(0),
        tools_added: AtomicBool::new(false),
    });

    let stdin = std::io::stdin();
    let mut reader = BufReader::new(stdin.lock());

    while let Some(body) = read_message(&mut reader, framing) {
        if silent {
            continue;
        }
        let Ok(request) = serde_json::from_str::<Value>(&body) else {
            continue;
        };
        if deaf_after_init && request.get("method").and_then(|m| m.as_str()) == Some("tools/list") {
            server.handle(request);
            // Keep stdin open but never drain it again.
            loop {
                thread::sleep(Duration::from_secs(60));
            }
        }
        let server = Arc::clone(&server);
        thread::spawn(move || server.handle(request));
    }
}
