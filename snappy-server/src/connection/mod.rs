//! Per-client connection handler.
//!
//! Each connection gets a [`Connection`] that reads newline-delimited JSON
//! frames, validates them into [`ClientEvent`]s and routes them against the
//! shared state. The handler is split into submodules:
//! - [`registration`]: `add-user` and disconnect cleanup
//! - [`rooms`]: `join-group`
//! - [`messaging`]: `send-msg`, typing, `delete-msg`, `send-reaction`
//! - [`receipts`]: `msg-delivered`, `msg-read`
//! - [`helpers`]: encoding and fan-out

pub mod helpers;
mod messaging;
mod receipts;
mod registration;
mod rooms;

use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::event::{ClientEvent, ServerEvent};
use crate::server::SharedState;

use helpers::send_to_session;

/// State of a single client connection.
pub struct Connection {
    pub id: String,
    /// Identity bound by the last successful `add-user`. The presence
    /// registry stays authoritative: a newer session for the same user
    /// takes over routing while this one stays open.
    pub user_id: Option<String>,
}

impl Connection {
    fn new(id: String) -> Self {
        Self { id, user_id: None }
    }

    pub(crate) fn user_or_dash(&self) -> &str {
        self.user_id.as_deref().unwrap_or("-")
    }
}

/// Handle a plain TCP connection.
pub async fn handle(stream: TcpStream, state: Arc<SharedState>) -> Result<()> {
    let peer = stream.peer_addr()?;
    let session_id = format!("{peer}");
    tracing::info!(%session_id, "New connection (plain)");
    let (reader, writer) = tokio::io::split(stream);
    handle_io(BufReader::new(reader), writer, session_id, state).await
}

/// Handle a generic async stream (WebSocket bridge, in-process tests).
pub async fn handle_generic<S>(stream: S, state: Arc<SharedState>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    static COUNTER: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
    let id = COUNTER.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    let session_id = format!("stream-{id}");
    tracing::info!(%session_id, "New connection (generic stream)");
    let (reader, writer) = tokio::io::split(stream);
    handle_io(BufReader::new(reader), writer, session_id, state).await
}

async fn handle_io<R, W>(
    mut reader: BufReader<R>,
    writer: W,
    session_id: String,
    state: Arc<SharedState>,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut conn = Connection::new(session_id.clone());

    // Channel for sending encoded events TO this client
    let (tx, mut rx) = mpsc::channel::<String>(state.config.send_buffer.max(1));
    state.connections.lock().insert(session_id.clone(), tx);

    let write_session_id = session_id.clone();
    let mut write_half = writer;
    let write_handle = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if let Err(e) = write_half.write_all(line.as_bytes()).await {
                tracing::warn!(session_id = %write_session_id, "Write error: {e}");
                break;
            }
            // Drain whatever else is queued before flushing
            let mut batch_count = 0;
            while let Ok(queued) = rx.try_recv() {
                if let Err(e) = write_half.write_all(queued.as_bytes()).await {
                    tracing::warn!(session_id = %write_session_id, "Write error: {e}");
                    return;
                }
                batch_count += 1;
                if batch_count >= 64 {
                    break;
                }
            }
            if let Err(e) = write_half.flush().await {
                tracing::warn!(session_id = %write_session_id, "Flush error: {e}");
                break;
            }
        }
    });

    let max_line_len = state.config.max_line_len;
    let idle_check = tokio::time::Duration::from_millis(state.config.idle_check_ms.max(1));
    let mut line_buf = String::new();

    // Flood protection: token bucket, refilled at `rate_limit` events/second
    let rate_max = state.config.rate_limit.max(1.0);
    let rate_refill = rate_max;
    let mut rate_tokens = rate_max;
    let mut rate_last = tokio::time::Instant::now();
    let mut rate_warned = false;

    loop {
        // A stuck client is evicted from `connections` by the fan-out helpers
        if !state.connections.lock().contains_key(&session_id) {
            tracing::info!(%session_id, "Send queue overflowed, disconnecting");
            break;
        }

        // A timed-out read leaves any partial frame in `line_buf`; the next
        // read appends to it.
        let read_result = tokio::time::timeout(idle_check, reader.read_line(&mut line_buf)).await;

        match read_result {
            Ok(Ok(0)) | Ok(Err(_)) => break, // EOF or error
            Err(_) => continue,              // idle, re-check eviction
            Ok(Ok(_)) => {}
        }
        let line = std::mem::take(&mut line_buf);

        if line.len() > max_line_len {
            tracing::warn!(%session_id, len = line.len(), "Line too long, dropping");
            send_to_session(
                &state,
                &session_id,
                &ServerEvent::error("line-too-long", format!("frames are limited to {max_line_len} bytes")),
            );
            continue;
        }
        if line.trim().is_empty() {
            continue;
        }

        let event = match ClientEvent::parse(&line) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(%session_id, "Rejected frame: {e}");
                send_to_session(&state, &session_id, &ServerEvent::error(e.code(), e.to_string()));
                continue;
            }
        };

        // Rate limiting (skip before registration)
        if conn.user_id.is_some() {
            let now = tokio::time::Instant::now();
            let elapsed = now.duration_since(rate_last).as_secs_f64();
            rate_tokens = (rate_tokens + elapsed * rate_refill).min(rate_max);
            rate_last = now;
            if rate_tokens < 1.0 {
                tracing::debug!(%session_id, "Rate limited");
                // Warn once per burst
                if !rate_warned {
                    send_to_session(
                        &state,
                        &session_id,
                        &ServerEvent::error("rate-limited", "you are sending events too fast"),
                    );
                    rate_warned = true;
                }
                continue;
            }
            rate_tokens -= 1.0;
            rate_warned = false;
        }

        tracing::debug!(%session_id, event = event.name(), "<- {}", line.trim());

        if !matches!(event, ClientEvent::AddUser(_)) && conn.user_id.is_none() {
            send_to_session(
                &state,
                &session_id,
                &ServerEvent::error("not-registered", "send add-user first"),
            );
            continue;
        }

        match event {
            ClientEvent::AddUser(user_id) => registration::handle_add_user(&mut conn, &state, &user_id),
            ClientEvent::JoinGroup(group_id) => rooms::handle_join_group(&conn, &state, &group_id),
            ClientEvent::SendMsg(message) => messaging::handle_send(&conn, &state, message),
            ClientEvent::Typing(notice) => messaging::handle_typing(&conn, &state, &notice, true),
            ClientEvent::StopTyping(notice) => messaging::handle_typing(&conn, &state, &notice, false),
            ClientEvent::MsgDelivered(ack) => receipts::handle_delivered(&conn, &state, &ack),
            ClientEvent::MsgRead(ack) => receipts::handle_read(&conn, &state, &ack),
            ClientEvent::DeleteMsg(request) => messaging::handle_delete(&conn, &state, &request),
            ClientEvent::SendReaction(request) => messaging::handle_reaction(&conn, &state, &request),
        }
    }

    registration::handle_disconnect(&conn, &state);

    tracing::info!(%session_id, user = conn.user_or_dash(), "Connection closed");
    state.connections.lock().remove(&session_id);

    write_handle.abort();
    Ok(())
}
