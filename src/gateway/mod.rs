//! OpenAI-compatible HTTP facade over the task queue.
//!
//! The gateway validates and shapes chat-completion requests, enqueues one
//! job per request, and fans the job's event stream back to the client either
//! as SSE frames or as a single blocking response.

mod handlers;
pub mod openai;
mod sse;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};

use crate::bot::BotServiceClient;
use crate::queue::TaskQueue;

pub use sse::{Frame, FrameContext, frames_for};

/// Shared state for the gateway handlers.
pub struct GatewayState {
    pub queue: TaskQueue,
    pub bot: Arc<BotServiceClient>,
    pub default_user_id: String,
    pub default_user_role: Option<String>,
}

/// Build the gateway router.
pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/healthz", get(handlers::health))
        .route("/v1/models", get(handlers::list_models))
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .with_state(state)
}

/// Bind the listener, serve in a background task, and return the bound
/// address. Used by `main` and by the integration tests (which bind port 0).
pub async fn start_server(
    addr: SocketAddr,
    state: Arc<GatewayState>,
) -> std::io::Result<SocketAddr> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound = listener.local_addr()?;
    tracing::info!("gateway listening on {bound}");
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, router(state)).await {
            tracing::error!(error = %err, "gateway server exited");
        }
    });
    Ok(bound)
}
