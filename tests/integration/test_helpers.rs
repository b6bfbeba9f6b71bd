//! Shared fixtures: a populated data root, HTTP and stdio servers.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use datagate::config::GlobalConfig;
use datagate::engine::emitter::ToolOutput;
use datagate::mcp::context::ToolContext;
use datagate::mcp::handler::AppState;
use datagate::mcp::tools::{ToolDescriptor, ToolRegistry};
use datagate::mcp::{sse, transport};

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Temporary data root holding a few small files.
pub fn data_root() -> tempfile::TempDir {
    let root = tempfile::tempdir().expect("tempdir");
    let base = root.path();
    std::fs::write(base.join("notes.txt"), "alpha\nbeta\ngamma\ndelta\nepsilon\n").expect("write");
    std::fs::create_dir_all(base.join("logs/archive")).expect("mkdir");
    std::fs::write(
        base.join("logs/app.log"),
        "INFO start\nWARN disk low\nINFO tick\nERROR disk full\n",
    )
    .expect("write");
    std::fs::write(base.join("logs/archive/old.log"), "INFO old\n").expect("write");
    root
}

/// Default configuration rooted at `root`, adjusted by `configure`.
pub fn test_config(root: &tempfile::TempDir, configure: impl FnOnce(&mut GlobalConfig)) -> GlobalConfig {
    let mut config = GlobalConfig::with_data_root(root.path()).expect("config");
    config.http.port = 0;
    config.pool.workers = 2;
    configure(&mut config);
    config
}

/// A running HTTP listener on an ephemeral loopback port.
pub struct TestServer {
    pub base: String,
    pub endpoint: String,
    pub state: Arc<AppState>,
    pub client: reqwest::Client,
    ct: CancellationToken,
    _root: tempfile::TempDir,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.ct.cancel();
    }
}

/// Built-in tools plus `gated`, which yields `items` numbered items but
/// holds back everything after the first until `gate` gets a permit.
pub fn gated_tools(gate: &Arc<Semaphore>, items: usize) -> ToolRegistry {
    let mut tools = ToolRegistry::builtin();
    let gate = Arc::clone(gate);
    tools.register(
        ToolDescriptor::new("gated", "Items released by the test.", json!({ "type": "object" })),
        move |_ctx: ToolContext, _input: Value| {
            let gate = Arc::clone(&gate);
            async move {
                let rest = stream::once(async move {
                    let _permit = gate.acquire().await;
                })
                .flat_map(move |()| stream::iter((1..items).map(|n| Ok(json!({ "n": n })))));
                let all = stream::iter([Ok(json!({ "n": 0 }))]).chain(rest);
                Ok(ToolOutput::items(all.boxed()))
            }
        },
    );
    tools
}

pub async fn spawn_http(configure: impl FnOnce(&mut GlobalConfig)) -> TestServer {
    spawn_http_with(ToolRegistry::builtin(), configure).await
}

pub async fn spawn_http_with(
    tools: ToolRegistry,
    configure: impl FnOnce(&mut GlobalConfig),
) -> TestServer {
    let root = data_root();
    let state = AppState::with_tools(test_config(&root, configure), tools);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral");
    let addr = listener.local_addr().expect("local addr");
    let ct = CancellationToken::new();

    let server_state = Arc::clone(&state);
    let server_ct = ct.clone();
    tokio::spawn(async move {
        let _ = sse::serve_http_on(listener, server_state, server_ct).await;
    });

    let base = format!("http://{addr}");
    TestServer {
        endpoint: format!("{base}{}", state.config.http.path),
        base,
        state,
        client: reqwest::Client::new(),
        ct,
        _root: root,
    }
}

impl TestServer {
    /// POST one JSON-RPC message, optionally inside a session.
    pub async fn post(&self, session: Option<&str>, body: &Value) -> reqwest::Response {
        let mut request = self.client.post(&self.endpoint).json(body);
        if let Some(id) = session {
            request = request.header("Mcp-Session-Id", id);
        }
        request.send().await.expect("post")
    }

    /// Run `initialize` and return the issued session id.
    pub async fn initialize(&self) -> String {
        let response = self.post(None, &request(0, "initialize", json!({}))).await;
        assert_eq!(response.status(), 200);
        response
            .headers()
            .get("mcp-session-id")
            .expect("session header")
            .to_str()
            .expect("ascii")
            .to_owned()
    }
}

/// JSON-RPC request body.
pub fn request(id: i64, method: &str, params: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params })
}

/// `tools/call` request body.
pub fn tool_call(id: i64, name: &str, arguments: Value) -> Value {
    request(id, "tools/call", json!({ "name": name, "arguments": arguments }))
}

/// `id:` values of the SSE events in `text`, in order.
pub fn sse_ids(text: &str) -> Vec<u64> {
    text.lines()
        .filter_map(|line| line.strip_prefix("id:"))
        .filter_map(|id| id.trim().parse().ok())
        .collect()
}

/// `data:` payloads of the SSE events in `text`, in order.
pub fn sse_payloads(text: &str) -> Vec<Value> {
    text.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .filter_map(|data| serde_json::from_str(data.trim()).ok())
        .collect()
}

/// Read an open SSE body until at least `count` events have arrived.
pub async fn read_events(response: &mut reqwest::Response, count: usize) -> String {
    let mut text = String::new();
    while sse_ids(&text).len() < count {
        let chunk = tokio::time::timeout(TIMEOUT, response.chunk())
            .await
            .expect("event in time")
            .expect("body readable")
            .expect("stream still open");
        text.push_str(&String::from_utf8_lossy(&chunk));
    }
    text
}

/// In-memory peer of the local channel.
pub struct StdioClient {
    pub state: Arc<AppState>,
    writer: WriteHalf<DuplexStream>,
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    task: JoinHandle<datagate::Result<()>>,
    _root: tempfile::TempDir,
}

pub fn spawn_stdio(configure: impl FnOnce(&mut GlobalConfig)) -> StdioClient {
    spawn_stdio_with(ToolRegistry::builtin(), configure)
}

pub fn spawn_stdio_with(
    tools: ToolRegistry,
    configure: impl FnOnce(&mut GlobalConfig),
) -> StdioClient {
    let root = data_root();
    let state = AppState::with_tools(test_config(&root, configure), tools);
    let (client, server) = tokio::io::duplex(64 * 1024);
    let (server_read, server_write) = tokio::io::split(server);
    let (client_read, client_write) = tokio::io::split(client);

    let task = tokio::spawn(transport::serve_lines(
        Arc::clone(&state),
        server_read,
        server_write,
        CancellationToken::new(),
    ));
    StdioClient {
        state,
        writer: client_write,
        lines: BufReader::new(client_read).lines(),
        task,
        _root: root,
    }
}

impl StdioClient {
    pub async fn send(&mut self, message: &Value) {
        self.send_raw(&message.to_string()).await;
    }

    pub async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.expect("write");
        self.writer.write_all(b"\n").await.expect("write");
        self.writer.flush().await.expect("flush");
    }

    pub async fn recv(&mut self) -> Value {
        let line = tokio::time::timeout(TIMEOUT, self.lines.next_line())
            .await
            .expect("line in time")
            .expect("readable")
            .expect("server still writing");
        serde_json::from_str(&line).expect("server writes JSON")
    }

    /// Close the input side and wait for the server to finish.
    pub async fn close(mut self) -> Vec<Value> {
        self.writer.shutdown().await.expect("shutdown");
        let mut rest = Vec::new();
        while let Ok(Some(line)) = self.lines.next_line().await {
            rest.push(serde_json::from_str(&line).expect("json"));
        }
        tokio::time::timeout(TIMEOUT, self.task)
            .await
            .expect("server exits")
            .expect("join")
            .expect("clean exit");
        rest
    }
}
