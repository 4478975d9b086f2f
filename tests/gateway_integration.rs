//! Integration tests for the OpenAI-compatible gateway.
//!
//! Boots the full stack on ephemeral ports: a mock bot service (plain axum
//! router), the in-process broker, one worker consumer loop, and the gateway
//! itself, then drives it with an HTTP client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::Path;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use tokio::sync::watch;

use agent_relay::bot::{AgentBackend, BotServiceClient};
use agent_relay::broker::MemoryBroker;
use agent_relay::config::{BotConfig, QueueConfig, WorkerConfig};
use agent_relay::gateway::{self, GatewayState};
use agent_relay::queue::TaskQueue;
use agent_relay::worker::WorkerRuntime;

// ---------------------------------------------------------------------------
// Mock bot service
// ---------------------------------------------------------------------------

async fn list_agents() -> Json<Value> {
    Json(json!([
        {"id": "agent-a", "name": "Agent A", "description": "echo agent"}
    ]))
}

async fn create_conversation() -> Json<Value> {
    Json(json!({"id": "conv-1", "status": "active"}))
}

async fn create_message(Path(conversation_id): Path<String>, Json(body): Json<Value>) -> Response {
    let text = body["payload"]["text"].as_str().unwrap_or_default();

    if text.contains("explode") {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"detail": "agent blew up"})),
        )
            .into_response();
    }

    if text.contains("clarify") {
        return Json(json!({
            "conversation": {"id": conversation_id},
            "user_message": {},
            "agent_message": {
                "raw_text": "",
                "content": null,
                "metadata": {
                    "agent_status": "interrupted",
                    "interrupt_payload": {
                        "interrupt_id": "i1",
                        "question": "Which city?",
                        "content": "I need a city to continue."
                    }
                }
            }
        }))
        .into_response();
    }

    Json(json!({
        "conversation": {"id": conversation_id},
        "user_message": {},
        "agent_message": {
            "raw_text": format!("echo: {text}"),
            "content": null,
            "metadata": {
                "agent_status": "active",
                "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
            }
        }
    }))
    .into_response()
}

async fn start_mock_bot() -> SocketAddr {
    let app = Router::new()
        .route("/agents/", get(list_agents))
        .route("/conversations/", post(create_conversation))
        .route("/conversations/{id}/messages", post(create_message));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

// ---------------------------------------------------------------------------
// Stack setup
// ---------------------------------------------------------------------------

async fn start_stack() -> (SocketAddr, watch::Sender<bool>) {
    let bot_addr = start_mock_bot().await;
    let bot_config = BotConfig {
        base_url: format!("http://{bot_addr}"),
        connect_timeout: Duration::from_secs(5),
        request_timeout: None,
    };
    let bot = Arc::new(BotServiceClient::new(&bot_config).unwrap());

    let queue_config = QueueConfig {
        job_ttl: Duration::from_secs(60),
        worker_heartbeat_interval: Duration::from_secs(30),
        stale_after: Duration::from_secs(45),
        completion_wait_timeout: Duration::from_secs(5),
        ..QueueConfig::default()
    };
    let queue = TaskQueue::new(Arc::new(MemoryBroker::new()), queue_config);

    let backend: Arc<dyn AgentBackend> = bot.clone();
    let worker = WorkerRuntime::new(
        queue.clone(),
        backend,
        WorkerConfig {
            concurrency: 1,
            pop_timeout: Duration::from_millis(50),
            soft_timeout: None,
        },
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move { worker.run(shutdown_rx).await });

    let state = Arc::new(GatewayState {
        queue,
        bot,
        default_user_id: "test-user".to_string(),
        default_user_role: None,
    });
    let gateway_addr = gateway::start_server("127.0.0.1:0".parse().unwrap(), state)
        .await
        .unwrap();
    (gateway_addr, shutdown_tx)
}

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn blocking_chat_completion_returns_the_agent_reply() {
    let (addr, _shutdown) = start_stack().await;
    let url = format!("http://{addr}/v1/chat/completions");

    let resp = client()
        .post(&url)
        .json(&json!({
            "model": "agent-a",
            "messages": [{"role": "user", "content": "Hello world"}]
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["model"], "agent-a");
    assert_eq!(body["conversation_id"], "conv-1");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    let content = body["choices"][0]["message"]["content"].as_str().unwrap();
    assert!(
        content.contains("Hello world"),
        "expected echo, got: {content}"
    );
    assert_eq!(body["usage"]["total_tokens"], 15);
}

#[tokio::test]
async fn streaming_chat_completion_emits_sse_frames_and_done() {
    let (addr, _shutdown) = start_stack().await;
    let url = format!("http://{addr}/v1/chat/completions");

    let resp = client()
        .post(&url)
        .json(&json!({
            "model": "agent-a",
            "messages": [{"role": "user", "content": "Stream test"}],
            "stream": true
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    let content_type = resp
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(
        content_type.starts_with("text/event-stream"),
        "expected SSE content type, got {content_type}"
    );

    let text = resp.text().await.unwrap();
    assert!(text.contains("data:"), "expected SSE data lines: {text}");
    assert!(text.contains("[DONE]"), "expected [DONE] sentinel: {text}");
    assert!(
        text.contains("\"role\":\"assistant\""),
        "expected role chunk: {text}"
    );
    assert!(
        text.contains("\"agent_status\":\"completed\""),
        "expected completed status frame: {text}"
    );

    // Reassemble the streamed content from the delta frames.
    let mut full_content = String::new();
    let mut saw_progress_status = false;
    for line in text.lines() {
        if let Some(data) = line.strip_prefix("data:") {
            let data = data.trim();
            if data == "[DONE]" {
                continue;
            }
            if let Ok(frame) = serde_json::from_str::<Value>(data) {
                // Which stage the first frame reports depends on how far the
                // worker got before the subscription attached; any
                // non-terminal stage counts as progress.
                if matches!(
                    frame["agent_status"].as_str(),
                    Some("queued" | "running" | "streaming")
                ) {
                    saw_progress_status = true;
                }
                if let Some(content) = frame["choices"][0]["delta"]["content"].as_str() {
                    full_content.push_str(content);
                }
            }
        }
    }
    assert!(saw_progress_status, "expected a progress status frame: {text}");
    assert!(
        full_content.contains("Stream test"),
        "expected reassembled content to contain 'Stream test', got '{full_content}'"
    );
}

#[tokio::test]
async fn interrupted_agent_surfaces_the_question_in_blocking_mode() {
    let (addr, _shutdown) = start_stack().await;
    let url = format!("http://{addr}/v1/chat/completions");

    let resp = client()
        .post(&url)
        .json(&json!({
            "model": "agent-a",
            "messages": [{"role": "user", "content": "please clarify"}]
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["choices"][0]["message"]["content"], "Which city?");
    assert_eq!(
        body["choices"][0]["message"]["metadata"]["interrupt_payload"]["interrupt_id"],
        "i1"
    );
}

#[tokio::test]
async fn failed_job_maps_to_bad_gateway_with_traceability() {
    let (addr, _shutdown) = start_stack().await;
    let url = format!("http://{addr}/v1/chat/completions");

    let resp = client()
        .post(&url)
        .json(&json!({
            "model": "agent-a",
            "messages": [{"role": "user", "content": "explode now"}]
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 502);
    let body: Value = resp.json().await.unwrap();
    let message = body["error"]["message"].as_str().unwrap();
    assert!(
        message.starts_with("Agent invocation failed:"),
        "unexpected error message: {message}"
    );
    assert_eq!(body["conversation_id"], "conv-1");
    assert!(body["job_id"].as_str().unwrap().starts_with("chatcmpl-"));
}

#[tokio::test]
async fn streaming_failure_emits_an_error_frame_then_done() {
    let (addr, _shutdown) = start_stack().await;
    let url = format!("http://{addr}/v1/chat/completions");

    let resp = client()
        .post(&url)
        .json(&json!({
            "model": "agent-a",
            "messages": [{"role": "user", "content": "explode now"}],
            "stream": true
        }))
        .send()
        .await
        .unwrap();

    // The stream itself opens fine; the failure arrives as a frame.
    assert_eq!(resp.status(), 200);
    let text = resp.text().await.unwrap();
    assert!(
        text.contains("\"error\""),
        "expected an error frame: {text}"
    );
    assert!(text.contains("[DONE]"), "expected [DONE] sentinel: {text}");
}

#[tokio::test]
async fn unknown_model_is_a_404() {
    let (addr, _shutdown) = start_stack().await;
    let url = format!("http://{addr}/v1/chat/completions");

    let resp = client()
        .post(&url)
        .json(&json!({
            "model": "no-such-agent",
            "messages": [{"role": "user", "content": "Hi"}]
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert!(
        body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("no-such-agent")
    );
}

#[tokio::test]
async fn empty_messages_are_rejected() {
    let (addr, _shutdown) = start_stack().await;
    let url = format!("http://{addr}/v1/chat/completions");

    let resp = client()
        .post(&url)
        .json(&json!({"model": "agent-a", "messages": []}))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"]["message"].as_str().unwrap().contains("empty"));
}

#[tokio::test]
async fn request_without_user_message_is_rejected() {
    let (addr, _shutdown) = start_stack().await;
    let url = format!("http://{addr}/v1/chat/completions");

    let resp = client()
        .post(&url)
        .json(&json!({
            "model": "agent-a",
            "messages": [{"role": "system", "content": "be helpful"}]
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn explicit_conversation_id_is_reused() {
    let (addr, _shutdown) = start_stack().await;
    let url = format!("http://{addr}/v1/chat/completions");

    let resp = client()
        .post(&url)
        .json(&json!({
            "model": "agent-a",
            "messages": [{"role": "user", "content": "Hi"}],
            "conversation_id": "conv-existing"
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["conversation_id"], "conv-existing");
}

#[tokio::test]
async fn models_endpoint_lists_registry_agents() {
    let (addr, _shutdown) = start_stack().await;
    let url = format!("http://{addr}/v1/models");

    let resp = client().get(&url).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["object"], "list");
    assert_eq!(body["data"][0]["id"], "agent-a");
    assert_eq!(body["data"][0]["object"], "model");
}

#[tokio::test]
async fn healthz_answers_ok() {
    let (addr, _shutdown) = start_stack().await;
    let url = format!("http://{addr}/healthz");

    let resp = client().get(&url).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
}
