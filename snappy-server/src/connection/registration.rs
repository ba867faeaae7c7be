//! Identity binding (`add-user`) and disconnect cleanup.

use std::sync::Arc;

use crate::event::{PresenceChange, ServerEvent};
use crate::server::SharedState;

use super::Connection;
use super::helpers::{broadcast_except, report_store_error, send_to_session};

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn presence_event(user_id: &str, is_online: bool, last_seen: Option<i64>) -> ServerEvent {
    ServerEvent::UserStatusChange(PresenceChange {
        user_id: user_id.to_string(),
        is_online,
        last_seen,
    })
}

pub(super) fn handle_add_user(conn: &mut Connection, state: &Arc<SharedState>, user_id: &str) {
    match state.store.user(user_id) {
        Ok(Some(_)) => {}
        Ok(None) => {
            tracing::warn!(session_id = %conn.id, user = %user_id, "add-user for unknown identity");
            send_to_session(
                state,
                &conn.id,
                &ServerEvent::error("unknown-user", format!("no user {user_id}")),
            );
            return;
        }
        Err(e) => {
            report_store_error(state, conn, "add-user", &e);
            return;
        }
    }

    // Registry mutation and the persisted flag change together, so a late
    // offline write from an old session cannot land after this online one.
    let mut announcements = Vec::new();
    let replaced_session = {
        let mut presence = state.presence.lock();
        let registration = presence.register(user_id, &conn.id);

        if let Some(ref released) = registration.released_user {
            let last_seen = now_ms();
            match state.store.set_presence(released, false, Some(last_seen)) {
                Ok(()) => announcements.push(presence_event(released, false, Some(last_seen))),
                Err(e) => report_store_error(state, conn, "add-user", &e),
            }
        }
        if let Some(ref replaced) = registration.replaced_session {
            tracing::info!(user = %user_id, old_session = %replaced, new_session = %conn.id, "Newer connection takes over user");
        }
        match state.store.set_presence(user_id, true, None) {
            Ok(()) => announcements.push(presence_event(user_id, true, None)),
            Err(e) => report_store_error(state, conn, "add-user", &e),
        }
        registration.replaced_session
    };

    // The old session stays connected but stops receiving group traffic
    if let Some(ref replaced) = replaced_session {
        let left = state.rooms.lock().leave_all(replaced);
        if !left.is_empty() {
            tracing::debug!(old_session = %replaced, rooms = left.len(), "Pruned rooms of replaced session");
        }
    }

    conn.user_id = Some(user_id.to_string());
    tracing::info!(session_id = %conn.id, user = %user_id, "User registered");

    for event in &announcements {
        broadcast_except(state, &conn.id, event);
    }
}

/// Transport closed: release the identity (unless a newer session already
/// took it over), drop room subscriptions.
pub(super) fn handle_disconnect(conn: &Connection, state: &Arc<SharedState>) {
    let announcement = {
        let mut presence = state.presence.lock();
        match presence.unregister(&conn.id) {
            Some(user_id) => {
                let last_seen = now_ms();
                match state.store.set_presence(&user_id, false, Some(last_seen)) {
                    Ok(()) => Some(presence_event(&user_id, false, Some(last_seen))),
                    Err(e) => {
                        tracing::error!(session_id = %conn.id, user = %user_id, "Failed to persist offline flag: {e}");
                        None
                    }
                }
            }
            None => None,
        }
    };

    if let Some(ref event) = announcement {
        broadcast_except(state, &conn.id, event);
    }

    let left = state.rooms.lock().leave_all(&conn.id);
    if !left.is_empty() {
        tracing::debug!(session_id = %conn.id, rooms = left.len(), "Left rooms on disconnect");
    }
}
