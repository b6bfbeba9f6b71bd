//! Integration tests for the newline-delimited local channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::Semaphore;

use datagate::engine::cache::CacheKey;
use datagate::engine::emitter::ToolOutput;
use datagate::mcp::context::ToolContext;
use datagate::mcp::tools::{ToolDescriptor, ToolRegistry};

use super::test_helpers::{request, spawn_stdio, spawn_stdio_with, tool_call, TIMEOUT};

/// Built-in tools plus `held_count`, a cached computation that cannot
/// finish until `gate` gets a permit.
fn held_count_tools(gate: &Arc<Semaphore>) -> ToolRegistry {
    let mut tools = ToolRegistry::builtin();
    let gate = Arc::clone(gate);
    tools.register(
        ToolDescriptor::new(
            "held_count",
            "Cached count released by the test.",
            json!({ "type": "object" }),
        ),
        move |ctx: ToolContext, _input: Value| {
            let gate = Arc::clone(&gate);
            async move {
                let key = CacheKey::new("held_count", &json!({}));
                let value = ctx
                    .engine
                    .cache
                    .get_or_compute(&key, &ctx.cancel, move |_| async move {
                        let _permit = gate.acquire().await;
                        Ok(json!({ "count": 42 }))
                    })
                    .await?;
                Ok(ToolOutput::Value(Value::clone(&value)))
            }
        },
    );
    tools
}

#[tokio::test]
async fn concurrent_identical_calls_share_one_computation() {
    let gate = Arc::new(Semaphore::new(0));
    let mut client = spawn_stdio_with(held_count_tools(&gate), |_| {});

    client.send(&tool_call(1, "held_count", json!({}))).await;
    client.send(&tool_call(2, "held_count", json!({}))).await;

    let engine = Arc::clone(&client.state.engine);
    tokio::time::timeout(TIMEOUT, async {
        while engine.stats().cache.coalesced < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("second call joined the first computation");
    gate.add_permits(1);

    let mut replies = HashMap::new();
    for _ in 0..2 {
        let reply = client.recv().await;
        let id = reply["id"].as_i64().expect("numeric id");
        replies.insert(id, reply);
    }
    for id in [1, 2] {
        assert_eq!(replies[&id]["result"]["structuredContent"]["count"], 42);
    }

    let cache = engine.stats().cache;
    assert_eq!(cache.misses, 1);
    assert_eq!(cache.coalesced, 1);
    assert_eq!(cache.hits, 0);

    assert!(client.close().await.is_empty());
}

#[tokio::test]
async fn chunks_precede_the_final_response() {
    let mut client = spawn_stdio(|config| {
        config.streaming.inline_threshold_bytes = 0;
        config.streaming.chunk_items = 2;
    });

    client
        .send(&tool_call(9, "read_lines", json!({ "path": "notes.txt", "start": 2 })))
        .await;

    let mut chunks: Vec<Value> = Vec::new();
    let end = loop {
        let message = client.recv().await;
        if message.get("id").is_some() {
            break message;
        }
        assert_eq!(message["method"], "notifications/chunk");
        chunks.push(message);
    };

    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0]["params"]["items"][0]["text"], "beta");
    assert_eq!(chunks[1]["params"]["index"], 1);
    assert_eq!(end["id"], 9);
    assert_eq!(end["result"]["structuredContent"]["totalItems"], 4);
    assert_eq!(end["result"]["structuredContent"]["start"], 2);
    client.close().await;
}

#[tokio::test]
async fn malformed_line_gets_parse_error() {
    let mut client = spawn_stdio(|_| {});

    client.send_raw("{not json").await;
    let reply = client.recv().await;
    assert_eq!(reply["error"]["code"], -32700);
    assert!(reply["id"].is_null());

    client.send(&request(2, "ping", json!({}))).await;
    let reply = client.recv().await;
    assert_eq!(reply["id"], 2);
    assert_eq!(reply["result"], json!({}));
    client.close().await;
}

#[tokio::test]
async fn unknown_method_gets_method_not_found() {
    let mut client = spawn_stdio(|_| {});

    client.send(&request(3, "prompts/list", json!({}))).await;
    let reply = client.recv().await;
    assert_eq!(reply["id"], 3);
    assert_eq!(reply["error"]["code"], -32601);
    client.close().await;
}

#[tokio::test]
async fn initialize_negotiates_on_the_local_session() {
    let mut client = spawn_stdio(|_| {});

    client
        .send(&request(1, "initialize", json!({ "protocolVersion": "2024-11-05" })))
        .await;
    let reply = client.recv().await;
    assert_eq!(reply["result"]["protocolVersion"], "2024-11-05");
    assert_eq!(
        reply["result"]["capabilities"]["experimental"]["chunkedResults"]["notification"],
        "notifications/chunk"
    );

    client.send(&request(2, "tools/list", json!({}))).await;
    let reply = client.recv().await;
    let names: Vec<&str> = reply["result"]["tools"]
        .as_array()
        .expect("tools")
        .iter()
        .filter_map(|tool| tool["name"].as_str())
        .collect();
    assert_eq!(
        names,
        vec!["file_info", "list_files", "read_lines", "read_range", "search"]
    );
    client.close().await;
}

#[tokio::test]
async fn eof_waits_for_inflight_requests() {
    let mut client = spawn_stdio(|_| {});

    client
        .send(&tool_call(1, "search", json!({ "path": "logs/app.log", "pattern": "disk" })))
        .await;
    let rest = client.close().await;

    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0]["id"], 1);
    assert_eq!(rest[0]["result"]["structuredContent"]["totalItems"], 2);
}
