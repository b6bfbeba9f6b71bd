//! Browser-origin protection on every network route.

use serde_json::{json, Value};

use super::test_helpers::{request, spawn_http};

#[tokio::test]
async fn foreign_origin_is_forbidden() {
    let server = spawn_http(|_| {}).await;

    let response = server
        .client
        .post(&server.endpoint)
        .header("Origin", "http://evil.example")
        .json(&request(1, "initialize", json!({})))
        .send()
        .await
        .expect("post");
    assert_eq!(response.status(), 403);
    let body: Value = response.json().await.expect("json");
    assert_eq!(body["error"]["code"], -32002);
    assert_eq!(server.state.sessions.len(), 0);

    let health = server
        .client
        .get(format!("{}/health", server.base))
        .header("Origin", "http://evil.example")
        .send()
        .await
        .expect("get");
    assert_eq!(health.status(), 403);
}

#[tokio::test]
async fn loopback_origin_on_any_port_is_admitted() {
    let server = spawn_http(|_| {}).await;

    let response = server
        .client
        .post(&server.endpoint)
        .header("Origin", "http://localhost:5173")
        .json(&request(1, "initialize", json!({})))
        .send()
        .await
        .expect("post");
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn absent_origin_is_admitted() {
    let server = spawn_http(|_| {}).await;
    let response = server.post(None, &request(1, "initialize", json!({}))).await;
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn configured_origin_list_replaces_defaults() {
    let server = spawn_http(|config| {
        config.security.allowed_origins = vec!["https://console.internal:8443".into()];
    })
    .await;
    let allowed = server
        .client
        .post(&server.endpoint)
        .header("Origin", "https://console.internal:8443")
        .json(&request(1, "initialize", json!({})))
        .send()
        .await
        .expect("post");
    assert_eq!(allowed.status(), 200);

    let loopback = server
        .client
        .post(&server.endpoint)
        .header("Origin", "http://localhost")
        .json(&request(2, "initialize", json!({})))
        .send()
        .await
        .expect("post");
    assert_eq!(loopback.status(), 403);
}
