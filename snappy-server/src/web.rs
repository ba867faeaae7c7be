//! WebSocket transport and the REST API.
//!
//! The WebSocket endpoint (`/ws`) upgrades, then bridges the socket to the
//! regular connection handler via a `DuplexStream`: each text frame is one
//! JSON event line. From the handler's perspective a browser is just another
//! async stream.
//!
//! The REST API under `/api/v1` is the storage-facing side: creating users,
//! groups and messages, moving status forward and reading history. Every
//! write is durable before the response is sent.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::Router;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::{Method, StatusCode, header};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, patch, post};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::connection::helpers::send_to_user;
use crate::delivery::{self, DeliveryStatus};
use crate::error::StoreError;
use crate::event::{OutgoingMessage, ServerEvent, StatusUpdate};
use crate::server::SharedState;
use crate::store::{GroupRecord, MessageRecord, NewMessage, Page, UserRecord};

// ── WebSocket ↔ line bridge ────────────────────────────────────────────

/// A WebSocket bridged as `AsyncRead + AsyncWrite` for the connection
/// handler.
///
/// Uses a `tokio::io::DuplexStream` pair with two background tasks:
/// - **rx task:** reads WebSocket frames, appends `\n`, writes to the bridge
/// - **tx task:** reads from the bridge, splits on `\n`, sends text frames
pub struct WsBridge {
    pub reader: tokio::io::ReadHalf<tokio::io::DuplexStream>,
    pub writer: tokio::io::WriteHalf<tokio::io::DuplexStream>,
}

fn bridge_ws(socket: WebSocket) -> WsBridge {
    let (ws_tx, ws_rx) = tokio::sync::mpsc::channel::<WsMessage>(64);

    // handler_side is what the connection handler reads/writes
    let (handler_side, bridge_side) = tokio::io::duplex(16384);
    let (handler_read, handler_write) = tokio::io::split(handler_side);
    let (mut bridge_read, mut bridge_write) = tokio::io::split(bridge_side);

    // Task 1 owns the socket: frames -> bridge, queued frames -> socket
    tokio::spawn(async move {
        let mut socket = socket;
        let mut ws_rx = ws_rx;
        let ws_send_timeout = tokio::time::Duration::from_secs(30);
        loop {
            tokio::select! {
                frame = socket.recv() => {
                    match frame {
                        Some(Ok(WsMessage::Text(text))) => {
                            let mut bytes = text.as_bytes().to_vec();
                            bytes.push(b'\n');
                            if bridge_write.write_all(&bytes).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(WsMessage::Binary(data))) => {
                            let mut bytes = data.to_vec();
                            if !bytes.ends_with(b"\n") {
                                bytes.push(b'\n');
                            }
                            if bridge_write.write_all(&bytes).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) | None => break,
                        Some(Ok(_)) => {} // Ping/Pong handled by axum
                        Some(Err(_)) => break,
                    }
                }
                msg = ws_rx.recv() => {
                    match msg {
                        Some(ws_msg) => {
                            match tokio::time::timeout(ws_send_timeout, socket.send(ws_msg)).await {
                                Ok(Ok(())) => {}
                                Ok(Err(_)) | Err(_) => {
                                    tracing::debug!("WebSocket send failed or timed out, closing bridge");
                                    break;
                                }
                            }
                        }
                        None => break,
                    }
                }
            }
        }
        let _ = bridge_write.shutdown().await;
        let _ = socket.send(WsMessage::Close(None)).await;
    });

    // Task 2: handler output -> one text frame per line
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        let mut line_buf = Vec::new();
        loop {
            match bridge_read.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    line_buf.extend_from_slice(&buf[..n]);
                    while let Some(pos) = line_buf.iter().position(|b| *b == b'\n') {
                        let line = String::from_utf8_lossy(&line_buf[..pos]).to_string();
                        line_buf.drain(..=pos);
                        if ws_tx.send(WsMessage::Text(line.into())).await.is_err() {
                            return;
                        }
                    }
                }
                Err(_) => break,
            }
        }
    });

    WsBridge {
        reader: handler_read,
        writer: handler_write,
    }
}

impl AsyncRead for WsBridge {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

impl AsyncWrite for WsBridge {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.writer).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.writer).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.writer).poll_shutdown(cx)
    }
}

// ── Axum router ────────────────────────────────────────────────────────

/// Build the axum router with the WebSocket and REST endpoints.
pub fn router(state: Arc<SharedState>) -> Router {
    let cors = {
        let origins = &state.config.cors_origins;
        let allow_origin = if origins.is_empty() {
            AllowOrigin::from(Any)
        } else {
            AllowOrigin::list(origins.iter().filter_map(|o| o.parse().ok()))
        };
        CorsLayer::new()
            .allow_origin(allow_origin)
            .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE])
    };

    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/api/v1/health", get(api_health))
        .route("/api/v1/users", post(api_create_user))
        .route("/api/v1/users/{id}", get(api_user).patch(api_update_user))
        .route("/api/v1/users/{id}/groups", get(api_user_groups))
        .route("/api/v1/groups", post(api_create_group))
        .route("/api/v1/groups/{id}", get(api_group))
        .route("/api/v1/messages", post(api_create_message))
        .route("/api/v1/messages/{id}/status", patch(api_update_status))
        .route("/api/v1/messages/search-by-conversation", post(api_conversation))
        .layer(cors)
        .with_state(state)
}

// ── WebSocket handler ──────────────────────────────────────────────────

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<Arc<SharedState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

async fn handle_ws(socket: WebSocket, state: Arc<SharedState>) {
    let stream = bridge_ws(socket);
    if let Err(e) = crate::connection::handle_generic(stream, state).await {
        tracing::error!("WebSocket connection error: {e}");
    }
}

// ── REST API ───────────────────────────────────────────────────────────

type ApiError = (StatusCode, String);

fn api_error(e: StoreError) -> ApiError {
    match e {
        StoreError::NotFound(_) => (StatusCode::NOT_FOUND, e.to_string()),
        StoreError::Forbidden(_) => (StatusCode::FORBIDDEN, e.to_string()),
        StoreError::Conflict(_) => (StatusCode::CONFLICT, e.to_string()),
        StoreError::Invalid(_) => (StatusCode::BAD_REQUEST, e.to_string()),
        StoreError::Sqlite(ref err) => {
            tracing::error!("Database error: {err}");
            (StatusCode::INTERNAL_SERVER_ERROR, "storage unavailable".to_string())
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    server_name: String,
    connections: usize,
    online_users: usize,
    rooms: usize,
    uptime_secs: u64,
}

async fn api_health(State(state): State<Arc<SharedState>>) -> Json<HealthResponse> {
    let connections = state.connections.lock().len();
    let online_users = state.presence.lock().len();
    let rooms = state.rooms.lock().room_count();
    Json(HealthResponse {
        server_name: state.server_name.clone(),
        connections,
        online_users,
        rooms,
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

#[derive(Deserialize)]
struct CreateUser {
    username: String,
}

async fn api_create_user(
    State(state): State<Arc<SharedState>>,
    Json(body): Json<CreateUser>,
) -> Result<(StatusCode, Json<UserRecord>), ApiError> {
    let user = state.store.create_user(&body.username).map_err(api_error)?;
    tracing::info!(user = %user.id, username = %user.username, "User created");
    Ok((StatusCode::CREATED, Json(user)))
}

async fn api_user(
    Path(id): Path<String>,
    State(state): State<Arc<SharedState>>,
) -> Result<Json<UserRecord>, ApiError> {
    state
        .store
        .user(&id)
        .map_err(api_error)?
        .map(Json)
        .ok_or((StatusCode::NOT_FOUND, format!("user {id} not found")))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateUser {
    is_online: bool,
    #[serde(default)]
    last_seen: Option<i64>,
}

/// Write the persisted presence fields. The online flag is owned by the
/// registry: a write that contradicts it is refused with 409, so only
/// `lastSeen` can actually be changed from here.
async fn api_update_user(
    Path(id): Path<String>,
    State(state): State<Arc<SharedState>>,
    Json(body): Json<UpdateUser>,
) -> Result<Json<UserRecord>, ApiError> {
    {
        // Same lock the connection handlers write presence under
        let presence = state.presence.lock();
        let connected = presence.is_online(&id);
        if body.is_online != connected {
            return Err((
                StatusCode::CONFLICT,
                format!("user {id} is {}", if connected { "connected" } else { "not connected" }),
            ));
        }
        state
            .store
            .set_presence(&id, body.is_online, body.last_seen)
            .map_err(api_error)?;
    }
    state
        .store
        .user(&id)
        .map_err(api_error)?
        .map(Json)
        .ok_or((StatusCode::NOT_FOUND, format!("user {id} not found")))
}

/// Groups the user belongs to, so a client can join their rooms after
/// registering.
async fn api_user_groups(
    Path(id): Path<String>,
    State(state): State<Arc<SharedState>>,
) -> Result<Json<Vec<GroupRecord>>, ApiError> {
    state.store.groups_of(&id).map(Json).map_err(api_error)
}

#[derive(Deserialize)]
struct CreateGroup {
    name: String,
    admin: String,
    #[serde(default)]
    members: Vec<String>,
}

async fn api_create_group(
    State(state): State<Arc<SharedState>>,
    Json(body): Json<CreateGroup>,
) -> Result<(StatusCode, Json<GroupRecord>), ApiError> {
    let group = state
        .store
        .create_group(&body.name, &body.admin, &body.members)
        .map_err(api_error)?;
    tracing::info!(group = %group.id, members = group.members.len(), "Group created");
    Ok((StatusCode::CREATED, Json(group)))
}

async fn api_group(
    Path(id): Path<String>,
    State(state): State<Arc<SharedState>>,
) -> Result<Json<GroupRecord>, ApiError> {
    state
        .store
        .group(&id)
        .map_err(api_error)?
        .map(Json)
        .ok_or((StatusCode::NOT_FOUND, format!("group {id} not found")))
}

async fn api_create_message(
    State(state): State<Arc<SharedState>>,
    Json(body): Json<OutgoingMessage>,
) -> Result<(StatusCode, Json<MessageRecord>), ApiError> {
    if body.from.trim().is_empty() || body.target.id().trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "from and a recipient are required".to_string()));
    }
    if body.msg.trim().is_empty() && body.file_url.is_none() && body.audio_url.is_none() {
        return Err((StatusCode::BAD_REQUEST, "message has no content".to_string()));
    }
    let record = state
        .store
        .insert_message(&NewMessage::from(&body))
        .map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(record)))
}

#[derive(Deserialize)]
struct UpdateStatus {
    status: DeliveryStatus,
}

/// Move a message's status forward. The sender hears about it only when
/// the stored status actually changed.
async fn api_update_status(
    Path(id): Path<String>,
    State(state): State<Arc<SharedState>>,
    Json(body): Json<UpdateStatus>,
) -> Result<Json<MessageRecord>, ApiError> {
    if let Some(advance) = delivery::apply_status(&*state.store, &id, body.status).map_err(api_error)? {
        send_to_user(
            &state,
            &advance.sender,
            &ServerEvent::MsgStatusUpdate(StatusUpdate {
                message_id: advance.message_id,
                status: advance.status,
            }),
        );
    }
    state
        .store
        .message(&id)
        .map_err(api_error)?
        .map(Json)
        .ok_or((StatusCode::NOT_FOUND, format!("message {id} not found")))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConversationQuery {
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    to: Option<String>,
    #[serde(default)]
    group_id: Option<String>,
    /// Id of the oldest message of the previous page.
    #[serde(default)]
    before: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

/// History for a direct pair (`from` + `to`) or a group (`groupId`),
/// oldest first. Status always comes from the store.
async fn api_conversation(
    State(state): State<Arc<SharedState>>,
    Json(query): Json<ConversationQuery>,
) -> Result<Json<Vec<MessageRecord>>, ApiError> {
    let max = state.config.history_limit.max(1);
    let page = Page {
        before: query.before,
        limit: query.limit.unwrap_or(max).clamp(1, max),
    };
    let messages = match (query.from, query.to, query.group_id) {
        (Some(from), Some(to), None) => state.store.conversation(&from, &to, page),
        (None, None, Some(group)) => state.store.group_history(&group, page),
        _ => {
            return Err((
                StatusCode::BAD_REQUEST,
                "expected either from+to or groupId".to_string(),
            ));
        }
    }
    .map_err(api_error)?;
    Ok(Json(messages))
}
