//! Integration tests for the read-only `/health` and `/stats` endpoints.

use serde_json::{json, Value};

use super::test_helpers::{spawn_http, tool_call};

#[tokio::test]
async fn health_reports_running_and_session_count() {
    let server = spawn_http(|_| {}).await;
    server.initialize().await;

    let response = server
        .client
        .get(format!("{}/health", server.base))
        .send()
        .await
        .expect("health");
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.expect("json");
    assert_eq!(body["status"], "ok");
    assert_eq!(body["running"], true);
    assert_eq!(body["sessions"], 1);
}

#[tokio::test]
async fn stats_reflect_traffic_and_cache_use() {
    let server = spawn_http(|_| {}).await;
    let session = server.initialize().await;
    for id in 1..=2 {
        let response = server
            .post(
                Some(&session),
                &tool_call(id, "file_info", json!({ "path": "notes.txt" })),
            )
            .await;
        assert_eq!(response.status(), 200);
    }

    let body: Value = server
        .client
        .get(format!("{}/stats", server.base))
        .send()
        .await
        .expect("stats")
        .json()
        .await
        .expect("json");

    assert_eq!(body["messages"]["messages_received"], 3);
    assert!(body["messages"]["messages_sent"].as_u64().unwrap_or(0) >= 3);
    assert_eq!(body["sessions"]["created"], 1);
    assert_eq!(body["sessions"]["active"], 1);
    assert_eq!(body["cache"]["misses"], 1);
    assert_eq!(body["cache"]["hits"], 1);
    assert!(body["uptimeSeconds"].as_i64().is_some());
    assert!(body["startedAt"].is_string());
}
