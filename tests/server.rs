mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum_test::TestServer;
use common::{Behaviour, FakeProvider, ScriptedDriver, registry, reply};
use mcp_chat::AppState;
use mcp_chat::config::{AppConfig, LlmConfig, ServerConfig, StorageConfig, ToolsConfig};
use mcp_chat::llm::OrchestratorSettings;
use mcp_chat::mcp::provider::ToolProvider;
use mcp_chat::mcp::registry::RegistryGate;
use mcp_chat::server::router;
use mcp_chat::session::{ChatService, SqliteSessionDirectory};
use serde_json::{Value, json};

fn test_config() -> AppConfig {
    AppConfig {
        server: ServerConfig {
            port: 0,
            host: "127.0.0.1".into(),
        },
        llm: LlmConfig {
            api_url: "http://127.0.0.1:1/v1/chat/completions".into(),
            model: "test-model".into(),
            api_key: None,
            temperature: 0.7,
            max_tokens: 1024,
            system_prompt: None,
        },
        tools: ToolsConfig {
            servers_file: "missing.json".into(),
            local_provider: "local".into(),
            call_timeout_secs: 5,
            max_tool_rounds: 8,
            search_url: None,
        },
        storage: StorageConfig {
            database_url: "sqlite::memory:".into(),
        },
    }
}

async fn state(driver: Arc<ScriptedDriver>) -> AppState {
    let local: Arc<dyn ToolProvider> =
        FakeProvider::new("local", &[("now", Behaviour::Reply("12:00".into()))]);
    let weather: Arc<dyn ToolProvider> =
        FakeProvider::new("weather", &[("forecast", Behaviour::Reply("sun".into()))]);
    let providers = vec![local, weather];
    let gate = RegistryGate::ready(registry(providers, Duration::from_secs(5)).await);
    let directory = SqliteSessionDirectory::connect("sqlite::memory:").await.unwrap();
    let service = ChatService::start(
        Arc::new(directory),
        driver,
        Arc::new(gate),
        OrchestratorSettings::default(),
    )
    .await
    .unwrap();

    AppState {
        service: Arc::new(service),
        config: Arc::new(test_config()),
    }
}

async fn server(driver: Arc<ScriptedDriver>) -> TestServer {
    TestServer::new(router(state(driver).await)).unwrap()
}

#[tokio::test]
async fn test_session_lifecycle() {
    let server = server(ScriptedDriver::new(vec![])).await;

    let listed: Value = server.get("/api/sessions").await.json();
    assert_eq!(listed["status"], "success");
    assert_eq!(listed["sessions"].as_array().unwrap().len(), 1);
    let original = listed["sessions"][0]["id"].as_i64().unwrap();

    let created = server
        .post("/api/sessions")
        .json(&json!({ "name": "Work" }))
        .await;
    created.assert_status(StatusCode::CREATED);
    let id = created.json::<Value>()["session_id"].as_i64().unwrap();

    let active: Value = server.get("/api/sessions/active").await.json();
    assert_eq!(active["session_id"], id);

    server
        .put(&format!("/api/sessions/{id}"))
        .json(&json!({ "name": "Renamed" }))
        .await
        .assert_status_ok();
    let listed: Value = server.get("/api/sessions").await.json();
    assert_eq!(listed["sessions"][0]["name"], "Renamed");

    server
        .post(&format!("/api/sessions/{original}/switch"))
        .await
        .assert_status_ok();
    let deleted: Value = server.delete(&format!("/api/sessions/{id}")).await.json();
    assert_eq!(deleted["status"], "success");
    assert_eq!(deleted["active_session_id"], original);
}

#[tokio::test]
async fn test_session_errors_map_to_status_codes() {
    let server = server(ScriptedDriver::new(vec![])).await;

    let missing = server
        .put("/api/sessions/999")
        .json(&json!({ "name": "x" }))
        .await;
    missing.assert_status(StatusCode::NOT_FOUND);
    let body: Value = missing.json();
    assert_eq!(body["status"], "error");
    assert_eq!(body["message"], "session 999 not found");

    server
        .post("/api/sessions/999/switch")
        .await
        .assert_status(StatusCode::NOT_FOUND);
    server
        .get("/api/sessions/999/messages")
        .await
        .assert_status(StatusCode::NOT_FOUND);

    let active: Value = server.get("/api/sessions/active").await.json();
    let only = active["session_id"].as_i64().unwrap();
    server
        .delete(&format!("/api/sessions/{only}"))
        .await
        .assert_status(StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_tools_grouped_by_server() {
    let server = server(ScriptedDriver::new(vec![])).await;

    let body: Value = server.get("/api/tools").await.json();
    assert_eq!(body["status"], "success");
    assert_eq!(
        body["tools_by_server"]["local"],
        json!([{ "name": "now", "full_name": "now", "description": "now tool" }])
    );
    assert_eq!(
        body["tools_by_server"]["weather"][0]["full_name"],
        "weather:forecast"
    );
}

#[tokio::test]
async fn test_websocket_streams_turn_and_clear_resets() {
    let state = state(ScriptedDriver::new(vec![reply(&["Hel", "lo"])])).await;
    let server = TestServer::builder()
        .http_transport()
        .build(router(state))
        .unwrap();

    let mut ws = server.get_websocket("/api/ws").await.into_websocket().await;

    ws.send_text(json!({ "message": "  " }).to_string()).await;
    let error: Value = serde_json::from_str(&ws.receive_text().await).unwrap();
    assert_eq!(error, json!({ "error": "message must not be empty" }));

    ws.send_text(json!({ "message": "hi" }).to_string()).await;
    assert_eq!(ws.receive_text().await, "Hel");
    assert_eq!(ws.receive_text().await, "lo");
    assert_eq!(ws.receive_text().await, "[DONE]");

    let active: Value = server.get("/api/sessions/active").await.json();
    let id = active["session_id"].as_i64().unwrap();
    let history: Value = server
        .get(&format!("/api/sessions/{id}/messages"))
        .await
        .json();
    assert_eq!(
        history["messages"],
        json!([
            { "role": "user", "content": "hi" },
            { "role": "assistant", "content": "Hello" },
        ])
    );

    server.post("/api/clear").await.assert_status_ok();
    let history: Value = server
        .get(&format!("/api/sessions/{id}/messages"))
        .await
        .json();
    assert_eq!(history["messages"], json!([]));
}
