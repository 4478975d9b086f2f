//! HTTP handlers for the OpenAI-compatible surface.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::Sse;
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::error::{BotError, QueueError};
use crate::gateway::GatewayState;
use crate::gateway::openai::{
    ChatCompletionRequest, ChatCompletionResponse, ModelList, Usage, build_prompt,
};
use crate::gateway::sse::{self, FrameContext};
use crate::queue::{EnqueuePayload, QueueEvent};

/// Errors surfaced to HTTP clients, OpenAI error-body shaped.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    /// The bot service is not reachable (yet); the client should retry.
    Unavailable(String),
    /// The job reached a `failed` terminal.
    BadGateway {
        message: String,
        conversation_id: String,
        job_id: String,
    },
    /// The blocking wait elapsed; the job keeps running.
    Timeout {
        conversation_id: String,
        job_id: String,
    },
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            Self::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                error_body(&message, "invalid_request_error"),
            ),
            Self::NotFound(message) => (StatusCode::NOT_FOUND, error_body(&message, "not_found")),
            Self::Unavailable(message) => {
                let body = error_body(&message, "service_unavailable");
                return (
                    StatusCode::SERVICE_UNAVAILABLE,
                    [("Retry-After", "1")],
                    Json(body),
                )
                    .into_response();
            }
            Self::BadGateway {
                message,
                conversation_id,
                job_id,
            } => (
                StatusCode::BAD_GATEWAY,
                json!({
                    "error": {"message": message, "type": "bad_gateway"},
                    "conversation_id": conversation_id,
                    "job_id": job_id,
                }),
            ),
            Self::Timeout {
                conversation_id,
                job_id,
            } => (
                StatusCode::GATEWAY_TIMEOUT,
                json!({
                    "error": {
                        "message": "timed out waiting for the agent to finish",
                        "type": "timeout",
                    },
                    "conversation_id": conversation_id,
                    "job_id": job_id,
                }),
            ),
            Self::Internal(message) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body(&message, "internal_error"),
            ),
        };
        (status, Json(body)).into_response()
    }
}

fn error_body(message: &str, kind: &str) -> Value {
    json!({"error": {"message": message, "type": kind}})
}

pub async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

pub async fn list_models(State(state): State<Arc<GatewayState>>) -> Response {
    match state.bot.list_agents().await {
        Ok(agents) => Json(ModelList::from_agents(agents)).into_response(),
        Err(err) => ApiError::Unavailable(err.to_string()).into_response(),
    }
}

pub async fn chat_completions(
    State(state): State<Arc<GatewayState>>,
    Json(request): Json<ChatCompletionRequest>,
) -> Response {
    match handle_chat(&state, request).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn handle_chat(
    state: &Arc<GatewayState>,
    request: ChatCompletionRequest,
) -> Result<Response, ApiError> {
    if request.model.trim().is_empty() {
        return Err(ApiError::BadRequest("model must not be empty".to_string()));
    }
    if request.messages.is_empty() {
        return Err(ApiError::BadRequest(
            "messages must not be empty".to_string(),
        ));
    }

    state
        .bot
        .ensure_agent(&request.model)
        .await
        .map_err(|err| match err {
            BotError::UnknownAgent(id) => ApiError::NotFound(format!("unknown model '{id}'")),
            other => ApiError::Unavailable(other.to_string()),
        })?;

    let built = build_prompt(&request.messages)
        .map_err(|err| ApiError::BadRequest(err.to_string()))?;

    let user_id = request
        .user
        .clone()
        .filter(|user| !user.trim().is_empty())
        .unwrap_or_else(|| state.default_user_id.clone());
    let user_role = state.default_user_role.clone();

    let conversation_id = match &request.conversation_id {
        Some(id) => id.clone(),
        None => {
            state
                .bot
                .create_conversation(&request.model, &user_id, user_role.as_deref())
                .await
                .map_err(|err| ApiError::Unavailable(err.to_string()))?
                .id
        }
    };

    let payload = EnqueuePayload {
        job_id: format!("chatcmpl-{}", Uuid::new_v4().simple()),
        model: request.model.clone(),
        conversation_id,
        user_id,
        user_role,
        text: built.prompt,
        raw_user_text: Some(built.latest_user_text),
        attachments: None,
        metadata: None,
    };
    state
        .queue
        .enqueue(&payload)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    tracing::info!(
        job_id = %payload.job_id,
        model = %payload.model,
        conversation_id = %payload.conversation_id,
        stream = request.stream,
        "dispatched chat completion"
    );

    if request.stream {
        streaming_response(state, payload).await
    } else {
        blocking_response(state, payload).await
    }
}

/// Hold an SSE response open and forward the job's event stream.
///
/// A client that disconnects early only tears down the subscription; the
/// worker finishes the job regardless, and a reconnect within the TTL can
/// pick the terminal up from the status snapshot.
async fn streaming_response(
    state: &Arc<GatewayState>,
    payload: EnqueuePayload,
) -> Result<Response, ApiError> {
    let events = state
        .queue
        .iter_events(&payload.job_id, true)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    let ctx = FrameContext {
        job_id: payload.job_id,
        model: payload.model,
        conversation_id: payload.conversation_id,
    };
    Ok(Sse::new(sse::event_stream(ctx, events)).into_response())
}

/// Wait for the terminal event and shape it as a single completion body.
async fn blocking_response(
    state: &Arc<GatewayState>,
    payload: EnqueuePayload,
) -> Result<Response, ApiError> {
    let timeout = state.queue.config().completion_wait_timeout;
    let terminal = state
        .queue
        .wait_for_completion(&payload.job_id, timeout)
        .await;
    match terminal {
        Ok(QueueEvent::Completed {
            content,
            metadata,
            usage,
            ..
        }) => {
            let text = content
                .or_else(|| {
                    metadata
                        .as_ref()
                        .and_then(|m| m.get("content"))
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
                .unwrap_or_default();
            let message_metadata = metadata
                .as_ref()
                .and_then(|m| m.get("attachments"))
                .map(|attachments| json!({"attachments": attachments}));
            let usage = Usage::from_event(usage.as_ref());
            Ok(Json(ChatCompletionResponse::new(
                &payload.model,
                &payload.conversation_id,
                text,
                message_metadata,
                usage,
            ))
            .into_response())
        }
        Ok(QueueEvent::Interrupt {
            content, metadata, ..
        }) => Ok(Json(ChatCompletionResponse::new(
            &payload.model,
            &payload.conversation_id,
            content.unwrap_or_default(),
            metadata,
            Usage::default(),
        ))
        .into_response()),
        Ok(QueueEvent::Failed { error, .. }) => Err(ApiError::BadGateway {
            message: error,
            conversation_id: payload.conversation_id,
            job_id: payload.job_id,
        }),
        Ok(other) => Err(ApiError::Internal(format!(
            "unexpected non-terminal event: {other:?}"
        ))),
        Err(QueueError::TerminalWaitTimeout { .. }) => Err(ApiError::Timeout {
            conversation_id: payload.conversation_id,
            job_id: payload.job_id,
        }),
        Err(err) => Err(ApiError::Internal(err.to_string())),
    }
}
