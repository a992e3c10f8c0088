//! HTTP route handlers for the conversation tree API.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::tree::core::ids::{ConversationId, NodeId, TangentId};
use crate::tree::core::tangent::Tangent;
use crate::tree::engine::{ConversationView, PathEntry};
use crate::tree::storage::ConversationMeta;

use super::error::ApiError;
use super::sse::stream_reply;
use super::state::AppState;

/// Create the API router with all routes.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route(
            "/api/conversations",
            get(list_conversations).post(create_conversation),
        )
        .route(
            "/api/conversations/{id}",
            patch(rename_conversation).delete(delete_conversation),
        )
        .route("/api/conversations/{id}/path", get(conversation_view))
        .route("/api/conversations/{id}/messages", post(send_message))
        .route(
            "/api/conversations/{id}/nodes/{node_id}/fork",
            post(fork_from_node),
        )
        .route(
            "/api/conversations/{id}/nodes/{node_id}/switch",
            post(switch_to_branch),
        )
        .route(
            "/api/conversations/{id}/nodes/{node_id}/tangents",
            get(list_tangents).post(create_tangent),
        )
        .route(
            "/api/conversations/{id}/tangents/{tangent_id}/replies",
            post(reply_to_tangent),
        )
        .route(
            "/api/conversations/{id}/tangents/{tangent_id}/sub-tangents",
            post(create_sub_tangent),
        )
        .with_state(state)
}

/// Health check endpoint.
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "tangent-tree",
        "model": state.engine.model(),
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Conversation creation request.
#[derive(Debug, Default, Deserialize)]
pub struct CreateConversationRequest {
    /// Optional title; "New Chat" when absent.
    #[serde(default)]
    pub title: Option<String>,
}

/// Conversation rename request.
#[derive(Debug, Deserialize)]
pub struct RenameConversationRequest {
    /// New title.
    pub title: String,
}

/// Conversation list response.
#[derive(Debug, Serialize)]
pub struct ConversationList {
    /// Conversations, most recently active first.
    pub conversations: Vec<ConversationMeta>,
}

/// New message or tangent reply.
#[derive(Debug, Deserialize)]
pub struct MessageRequest {
    /// User text.
    pub text: String,
}

/// Fork request.
#[derive(Debug, Deserialize)]
pub struct ForkRequest {
    /// User text of the fork.
    pub text: String,
    /// Optional branch label.
    #[serde(default)]
    pub branch_name: Option<String>,
}

/// Tangent or sub-tangent creation request.
#[derive(Debug, Deserialize)]
pub struct TangentRequest {
    /// Highlighted span the tangent is anchored to.
    pub highlighted_text: String,
    /// User's opening remark.
    pub text: String,
}

async fn list_conversations(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ConversationList>, ApiError> {
    let conversations = state.engine.list_conversations().await?;
    Ok(Json(ConversationList { conversations }))
}

async fn create_conversation(
    State(state): State<Arc<AppState>>,
    request: Option<Json<CreateConversationRequest>>,
) -> Result<(StatusCode, Json<ConversationMeta>), ApiError> {
    let Json(request) = request.unwrap_or_default();
    let meta = state.engine.create_conversation(request.title).await?;
    Ok((StatusCode::CREATED, Json(meta)))
}

async fn rename_conversation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<ConversationId>,
    Json(request): Json<RenameConversationRequest>,
) -> Result<Json<ConversationMeta>, ApiError> {
    let meta = state.engine.rename_conversation(id, request.title).await?;
    Ok(Json(meta))
}

async fn delete_conversation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<ConversationId>,
) -> Result<StatusCode, ApiError> {
    state.engine.delete_conversation(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn conversation_view(
    State(state): State<Arc<AppState>>,
    Path(id): Path<ConversationId>,
) -> Result<Json<ConversationView>, ApiError> {
    Ok(Json(state.engine.view(id).await?))
}

async fn send_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<ConversationId>,
    Json(request): Json<MessageRequest>,
) -> Result<Response, ApiError> {
    let engine = Arc::clone(&state.engine);
    stream_reply(move |sink, cancel| async move {
        engine
            .send_message(id, request.text, sink.into_sink(), &cancel)
            .await
    })
    .await
}

async fn fork_from_node(
    State(state): State<Arc<AppState>>,
    Path((id, node_id)): Path<(ConversationId, NodeId)>,
    Json(request): Json<ForkRequest>,
) -> Result<Response, ApiError> {
    let engine = Arc::clone(&state.engine);
    stream_reply(move |sink, cancel| async move {
        engine
            .fork_from_node(
                id,
                node_id,
                request.text,
                request.branch_name,
                sink.into_sink(),
                &cancel,
            )
            .await
    })
    .await
}

async fn switch_to_branch(
    State(state): State<Arc<AppState>>,
    Path((id, node_id)): Path<(ConversationId, NodeId)>,
) -> Result<Json<Vec<PathEntry>>, ApiError> {
    Ok(Json(state.engine.switch_to_branch(id, node_id).await?))
}

async fn list_tangents(
    State(state): State<Arc<AppState>>,
    Path((id, node_id)): Path<(ConversationId, NodeId)>,
) -> Result<Json<Vec<Tangent>>, ApiError> {
    Ok(Json(state.engine.tangents(id, node_id).await?))
}

async fn create_tangent(
    State(state): State<Arc<AppState>>,
    Path((id, node_id)): Path<(ConversationId, NodeId)>,
    Json(request): Json<TangentRequest>,
) -> Result<Response, ApiError> {
    let engine = Arc::clone(&state.engine);
    stream_reply(move |sink, cancel| async move {
        engine
            .create_tangent(
                id,
                node_id,
                request.highlighted_text,
                request.text,
                sink.into_sink(),
                &cancel,
            )
            .await
    })
    .await
}

async fn reply_to_tangent(
    State(state): State<Arc<AppState>>,
    Path((id, tangent_id)): Path<(ConversationId, TangentId)>,
    Json(request): Json<MessageRequest>,
) -> Result<Response, ApiError> {
    let engine = Arc::clone(&state.engine);
    stream_reply(move |sink, cancel| async move {
        engine
            .reply_to_tangent(id, tangent_id, request.text, sink.into_sink(), &cancel)
            .await
    })
    .await
}

async fn create_sub_tangent(
    State(state): State<Arc<AppState>>,
    Path((id, tangent_id)): Path<(ConversationId, TangentId)>,
    Json(request): Json<TangentRequest>,
) -> Result<Response, ApiError> {
    let engine = Arc::clone(&state.engine);
    stream_reply(move |sink, cancel| async move {
        engine
            .create_sub_tangent(
                id,
                tangent_id,
                request.highlighted_text,
                request.text,
                sink.into_sink(),
                &cancel,
            )
            .await
    })
    .await
}
