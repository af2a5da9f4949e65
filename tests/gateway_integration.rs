//! HTTP-level integration tests against the real router, with a static key
//! configured and no agents or database attached.

use std::sync::Arc;

use axum_test::TestServer;
use serde_json::json;
use switchboard::config::{
    AgentsConfig, AppConfig, AuditSettings, AuthConfig, LimitsConfig, PersistenceConfig,
    ResilienceConfig, ServerConfig,
};
use switchboard::server::{build_router, build_state};

fn test_config(rate_limit_burst: u32) -> AppConfig {
    AppConfig {
        server: ServerConfig {
            port: 0,
            host: "127.0.0.1".to_owned(),
            metrics_enabled: false,
            cors_enabled: false,
        },
        auth: AuthConfig {
            static_key: Some("dev-key-1".to_owned()),
            static_user_id: Some("dev-user".to_owned()),
            static_org_id: Some("dev-org".to_owned()),
            static_email: Some("dev@example.com".to_owned()),
            static_name: Some("Dev".to_owned()),
            jwks_url: None,
            jwt_issuer: None,
            jwt_default_org: None,
        },
        persistence: PersistenceConfig::default(),
        limits: LimitsConfig {
            rate_limit_rpm: 60,
            rate_limit_burst,
            request_timeout_ms: 5_000,
            body_limit_bytes: 1_048_576,
        },
        resilience: ResilienceConfig {
            breaker_failure_threshold: 5,
            breaker_open_ms: 30_000,
            admission_queue_timeout_ms: 100,
            failover_enabled: true,
            health_interval_ms: 60_000,
            health_timeout_ms: 1_000,
        },
        audit: AuditSettings {
            sink: "none".to_owned(),
            file_path: None,
            queue_capacity: 64,
        },
        agents: AgentsConfig::default(),
    }
}

async fn server_with(config: AppConfig) -> TestServer {
    let state = build_state(Arc::new(config))
        .await
        .expect("state should build without a database");
    TestServer::new(build_router(state)).expect("router should start")
}

fn chat_body() -> serde_json::Value {
    json!({
        "model": "gpt-x",
        "messages": [{"role": "user", "content": "hi"}]
    })
}

#[tokio::test]
async fn health_is_public() {
    let server = server_with(test_config(10)).await;
    let response = server.get("/health").await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["status"], "healthy");
    assert!(body["agents"].is_array());
}

#[tokio::test]
async fn missing_authorization_yields_envelope() {
    let server = server_with(test_config(10)).await;
    let response = server.post("/v1/chat/completions").json(&chat_body()).await;
    response.assert_status(axum::http::StatusCode::UNAUTHORIZED);
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"]["type"], "unauthorized");
    assert_eq!(body["error"]["code"], "missing_header");
}

#[tokio::test]
async fn malformed_authorization_is_distinguished() {
    let server = server_with(test_config(10)).await;
    let response = server
        .post("/v1/chat/completions")
        .add_header("authorization", "Basic dXNlcjpwYXNz")
        .json(&chat_body())
        .await;
    response.assert_status(axum::http::StatusCode::UNAUTHORIZED);
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"]["code"], "malformed_header");
}

#[tokio::test]
async fn wrong_key_is_rejected() {
    let server = server_with(test_config(10)).await;
    let response = server
        .post("/v1/chat/completions")
        .add_header("authorization", "Bearer wrong")
        .json(&chat_body())
        .await;
    response.assert_status(axum::http::StatusCode::UNAUTHORIZED);
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"]["code"], "no_method_matched");
}

#[tokio::test]
async fn models_list_is_openai_shaped() {
    let server = server_with(test_config(10)).await;
    let response = server
        .get("/v1/models")
        .add_header("authorization", "Bearer dev-key-1")
        .await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["object"], "list");
    assert!(body["data"].is_array());
}

#[tokio::test]
async fn chat_without_agents_is_no_agent() {
    let server = server_with(test_config(10)).await;
    let response = server
        .post("/v1/chat/completions")
        .add_header("authorization", "Bearer dev-key-1")
        .json(&chat_body())
        .await;
    response.assert_status(axum::http::StatusCode::SERVICE_UNAVAILABLE);
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"]["type"], "no_agent");
}

#[tokio::test]
async fn invalid_body_is_bad_request() {
    let server = server_with(test_config(10)).await;
    let response = server
        .post("/v1/chat/completions")
        .add_header("authorization", "Bearer dev-key-1")
        .json(&json!({"model": "gpt-x", "messages": []}))
        .await;
    response.assert_status(axum::http::StatusCode::BAD_REQUEST);
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"]["type"], "invalid_request");
    assert_eq!(body["error"]["param"], "messages");
}

#[tokio::test]
async fn burst_exhaustion_returns_retry_after() {
    let server = server_with(test_config(2)).await;
    for _ in 0..2 {
        let response = server
            .post("/v1/chat/completions")
            .add_header("authorization", "Bearer dev-key-1")
            .json(&chat_body())
            .await;
        // Admitted by the limiter, failed later for lack of agents.
        response.assert_status(axum::http::StatusCode::SERVICE_UNAVAILABLE);
    }
    let response = server
        .post("/v1/chat/completions")
        .add_header("authorization", "Bearer dev-key-1")
        .json(&chat_body())
        .await;
    response.assert_status(axum::http::StatusCode::TOO_MANY_REQUESTS);
    let retry_after = response
        .headers()
        .get("retry-after")
        .expect("Retry-After header")
        .to_str()
        .unwrap()
        .parse::<u64>()
        .unwrap();
    assert!(retry_after >= 1);
}

#[tokio::test]
async fn status_is_served_to_platform_admins() {
    // The static-key identity is a platform admin by construction.
    let server = server_with(test_config(10)).await;
    let response = server
        .get("/status")
        .add_header("authorization", "Bearer dev-key-1")
        .await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert!(body["agents"].is_array());
    assert_eq!(body["failover_enabled"], true);
}

#[tokio::test]
async fn admin_roster_requires_a_database() {
    let server = server_with(test_config(10)).await;
    let response = server
        .get("/api/v1/platform/admins")
        .add_header("authorization", "Bearer dev-key-1")
        .await;
    response.assert_status(axum::http::StatusCode::SERVICE_UNAVAILABLE);
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"]["type"], "unavailable");
}
