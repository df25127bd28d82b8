//! HTTP + WebSocket surface over the processor.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::chat::content::text_content;
use crate::chat::model::{ChatStatus, MessageRole, NewChat, NewChatMessage};
use crate::chat::title::fallback_chat_title;
use crate::error::DatabaseError;
use crate::processor::Processor;
use crate::stream::StreamEvent;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub processor: Arc<Processor>,
}

/// Build the router for chats, their messages and live streams.
pub fn routes(processor: Arc<Processor>) -> Router {
    let state = AppState { processor };

    Router::new()
        .route("/health", get(health))
        .route("/api/chats", post(create_chat))
        .route("/api/chats/{id}", get(get_chat))
        .route("/api/chats/{id}/messages", get(list_messages).post(send_message))
        .route("/api/chats/{id}/interrupt", post(interrupt_chat))
        .route("/ws/chats/{id}", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn internal_error(e: DatabaseError) -> Response {
    error!(error = %e, "Chat API request failed");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

fn parse_chat_id(id: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(id).map_err(|_| error_response(StatusCode::BAD_REQUEST, "Invalid chat ID"))
}

// ── Health ──────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "chatd"
    }))
}

// ── Chats ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CreateChatRequest {
    message: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    model_config: Option<Value>,
}

async fn create_chat(
    State(state): State<AppState>,
    Json(body): Json<CreateChatRequest>,
) -> Response {
    let message = body.message.trim();
    if message.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "message is required");
    }
    let title = match body.title.as_deref().map(str::trim) {
        Some(t) if !t.is_empty() => t.to_string(),
        _ => fallback_chat_title(message),
    };

    let store = state.processor.store();
    let mut new = NewChat::new(Uuid::nil(), title);
    if let Some(config) = body.model_config {
        new = new.with_model_config(config);
    }

    // Queue only once the first message is in place.
    let result = async {
        let chat = store.insert_chat(new).await?;
        store
            .insert_chat_message(NewChatMessage::new(
                chat.id,
                MessageRole::User,
                text_content(message),
            ))
            .await?;
        store
            .update_chat_status(chat.id, ChatStatus::Pending, None, None)
            .await
    }
    .await;

    match result {
        Ok(chat) => {
            info!(chat_id = %chat.id, "Chat created via API");
            (StatusCode::CREATED, Json(json!(chat))).into_response()
        }
        Err(e) => internal_error(e),
    }
}

async fn get_chat(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let chat_id = match parse_chat_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.processor.store().get_chat_by_id(chat_id).await {
        Ok(Some(chat)) => Json(json!(chat)).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "Chat not found"),
        Err(e) => internal_error(e),
    }
}

async fn list_messages(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let chat_id = match parse_chat_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let store = state.processor.store();
    match store.get_chat_by_id(chat_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "Chat not found"),
        Err(e) => return internal_error(e),
    }
    match store.get_chat_messages(chat_id).await {
        Ok(messages) => Json(json!(messages)).into_response(),
        Err(e) => internal_error(e),
    }
}

#[derive(Deserialize)]
struct SendMessageRequest {
    message: String,
}

async fn send_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<SendMessageRequest>,
) -> Response {
    let chat_id = match parse_chat_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let message = body.message.trim();
    if message.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "message is required");
    }

    let store = state.processor.store();
    let chat = match store.get_chat_by_id(chat_id).await {
        Ok(Some(chat)) => chat,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "Chat not found"),
        Err(e) => return internal_error(e),
    };

    let stored = match store
        .insert_chat_message(NewChatMessage::new(
            chat_id,
            MessageRole::User,
            text_content(message),
        ))
        .await
    {
        Ok(stored) => stored,
        Err(e) => return internal_error(e),
    };
    state
        .processor
        .streams()
        .publish(chat_id, StreamEvent::message(chat_id, stored.clone()));

    if chat.status.is_idle() || chat.status == ChatStatus::Error {
        if let Err(e) = store
            .update_chat_status(chat_id, ChatStatus::Pending, None, None)
            .await
        {
            return internal_error(e);
        }
        debug!(chat_id = %chat_id, from = %chat.status, "Requeued chat for new message");
    }

    (StatusCode::CREATED, Json(json!(stored))).into_response()
}

async fn interrupt_chat(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let chat_id = match parse_chat_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let interrupted = state.processor.interrupt_chat(chat_id);
    Json(json!({ "interrupted": interrupted })).into_response()
}

// ── WebSocket ───────────────────────────────────────────────────────

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    let chat_id = match parse_chat_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    info!(chat_id = %chat_id, "Chat stream client connecting");
    ws.on_upgrade(move |socket| handle_socket(socket, state, chat_id))
}

async fn send_event(socket: &mut WebSocket, event: &StreamEvent) -> bool {
    match serde_json::to_string(event) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to encode stream event");
            true
        }
    }
}

async fn handle_socket(mut socket: WebSocket, state: AppState, chat_id: Uuid) {
    let (snapshot, mut rx, _subscription) = state.processor.streams().subscribe(chat_id);

    // Replay what the running chat produced so far.
    for event in &snapshot {
        if !send_event(&mut socket, event).await {
            debug!(chat_id = %chat_id, "Client disconnected during snapshot");
            return;
        }
    }

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else {
                    debug!(chat_id = %chat_id, "Chat stream closed");
                    break;
                };
                if !send_event(&mut socket, &event).await {
                    debug!(chat_id = %chat_id, "Client disconnected during send");
                    break;
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(chat_id = %chat_id, "Chat stream client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(chat_id = %chat_id, error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }
}
