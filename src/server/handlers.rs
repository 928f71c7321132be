//! Route handlers

use std::convert::Infallible;

use axum::{
    extract::State,
    http::StatusCode,
    response::{sse::Event, sse::KeepAlive, IntoResponse, Response, Sse},
    Json,
};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;

use crate::server::error::ApiError;
use crate::server::AppState;
use crate::service::CompletionStream;
use crate::types::openai::{ChatCompletionRequest, ChatCompletionResponse};

/// Terminates every event stream
pub const DONE_SENTINEL: &str = "[DONE]";

pub async fn root(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "finserve",
        "version": env!("CARGO_PKG_VERSION"),
        "model": state.service.model_id(),
        "backend": state.service.backend_name(),
    }))
}

/// Readiness probe: 200 when the engine is Ready, 503 otherwise
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.service.health();
    let status = if report.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

pub async fn list_models(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.service.list_models())
}

pub async fn chat_completions(
    State(state): State<AppState>,
    Json(req): Json<ChatCompletionRequest>,
) -> Result<Response, ApiError> {
    let stream = req.is_stream();
    let include_usage = req.include_usage();
    let chat = req.into_chat_request(state.service.default_sampling())?;

    if stream {
        let chunks = state.service.complete_stream(chat, include_usage).await?;
        return Ok(Sse::new(sse_events(chunks))
            .keep_alive(KeepAlive::default())
            .into_response());
    }

    let result = tokio::time::timeout(state.request_timeout, state.service.complete(chat))
        .await
        .map_err(|_| {
            tracing::warn!(
                "Chat completion exceeded {}s request timeout",
                state.request_timeout.as_secs()
            );
            ApiError::timeout("Chat request timed out")
        })??;

    Ok(Json(ChatCompletionResponse::from(result)).into_response())
}

/// One `data:` event per chunk, then the done sentinel.
fn sse_events(mut chunks: CompletionStream) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        while let Some(chunk) = chunks.next().await {
            match serde_json::to_string(&chunk) {
                Ok(data) => yield Ok(Event::default().data(data)),
                Err(e) => tracing::error!("Failed to serialize chunk: {}", e),
            }
        }
        yield Ok(Event::default().data(DONE_SENTINEL));
    }
}

/// Composes the prompt for a request without generating
pub async fn debug_prompt(
    State(state): State<AppState>,
    Json(req): Json<ChatCompletionRequest>,
) -> Result<Response, ApiError> {
    let chat = req.into_chat_request(state.service.default_sampling())?;
    let preview = state.service.preview_prompt(&chat).await?;
    Ok(Json(preview).into_response())
}

#[derive(Debug, Default, Deserialize)]
pub struct ReloadRequest {
    #[serde(default)]
    pub force: bool,
}

/// Reloads the engine. A missing body means `force: false`.
pub async fn reload(
    State(state): State<AppState>,
    req: Option<Json<ReloadRequest>>,
) -> Result<Response, ApiError> {
    let force = req.map_or(false, |Json(req)| req.force);
    let snapshot = state.service.reload(force).await?;
    Ok(Json(snapshot).into_response())
}
