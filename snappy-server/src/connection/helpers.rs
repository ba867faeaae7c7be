//! Encoding, fan-out and shared checks for the event handlers.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::error::StoreError;
use crate::event::{ServerEvent, Target};
use crate::server::SharedState;

use super::Connection;

/// One wire frame: the JSON event plus the line terminator.
pub fn encode(event: &ServerEvent) -> Option<String> {
    match serde_json::to_string(event) {
        Ok(mut line) => {
            line.push('\n');
            Some(line)
        }
        Err(e) => {
            tracing::error!("Failed to encode event: {e}");
            None
        }
    }
}

/// Queue a line for one session. A full queue means the client stopped
/// reading; its sender is dropped so the connection loop shuts it down.
fn queue(conns: &mut HashMap<String, mpsc::Sender<String>>, session_id: &str, line: String) -> bool {
    let Some(tx) = conns.get(session_id) else {
        return false;
    };
    match tx.try_send(line) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            tracing::warn!(session_id, "Send buffer full, evicting session");
            conns.remove(session_id);
            false
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

pub fn send_to_session(state: &SharedState, session_id: &str, event: &ServerEvent) -> bool {
    let Some(line) = encode(event) else {
        return false;
    };
    queue(&mut state.connections.lock(), session_id, line)
}

/// Push to the user's live session, if any. Returns false when the user is
/// offline; that is a normal outcome, not an error.
pub fn send_to_user(state: &SharedState, user_id: &str, event: &ServerEvent) -> bool {
    let session = state.presence.lock().lookup(user_id).map(str::to_string);
    match session {
        Some(session_id) => send_to_session(state, &session_id, event),
        None => {
            tracing::debug!(user = %user_id, "Recipient offline, not pushed");
            false
        }
    }
}

/// Send to every connected session except `except_session`.
pub fn broadcast_except(state: &SharedState, except_session: &str, event: &ServerEvent) -> usize {
    let Some(line) = encode(event) else {
        return 0;
    };
    let mut conns = state.connections.lock();
    let targets: Vec<String> = conns
        .keys()
        .filter(|sid| sid.as_str() != except_session)
        .cloned()
        .collect();
    targets
        .iter()
        .filter(|sid| queue(&mut conns, sid, line.clone()))
        .count()
}

/// Send to every session subscribed to `room_id`, optionally skipping one.
pub fn broadcast_to_room(
    state: &SharedState,
    room_id: &str,
    except_session: Option<&str>,
    event: &ServerEvent,
) -> usize {
    let members: Vec<String> = state
        .rooms
        .lock()
        .members(room_id)
        .filter(|sid| Some(*sid) != except_session)
        .map(str::to_string)
        .collect();
    if members.is_empty() {
        return 0;
    }
    let Some(line) = encode(event) else {
        return 0;
    };
    let mut conns = state.connections.lock();
    members
        .iter()
        .filter(|sid| queue(&mut conns, sid, line.clone()))
        .count()
}

/// Resolve `target` and push: the peer's live session for a direct target,
/// every other session in the room for a group.
pub(super) fn fan_out(state: &SharedState, conn: &Connection, target: &Target, event: &ServerEvent) -> usize {
    match target {
        Target::User(to) => usize::from(send_to_user(state, to, event)),
        Target::Group(group) => broadcast_to_room(state, group, Some(&conn.id), event),
    }
}

/// Whether the session currently speaks for `claimed`. Mismatches are
/// dropped with a warning and an `identity-mismatch` error.
pub(super) fn acting_as(state: &SharedState, conn: &Connection, claimed: &str, event_name: &str) -> bool {
    let bound = state.presence.lock().user_of(&conn.id) == Some(claimed);
    if !bound {
        tracing::warn!(
            session_id = %conn.id,
            user = conn.user_or_dash(),
            claimed,
            event = event_name,
            "Payload identity does not match session, dropping"
        );
        send_to_session(
            state,
            &conn.id,
            &ServerEvent::error("identity-mismatch", format!("this session is not {claimed}")),
        );
    }
    bound
}

/// Check `user_id` is on `group_id`'s member list.
pub(super) fn authorize_group(state: &SharedState, conn: &Connection, group_id: &str, user_id: &str) -> bool {
    match state.store.is_group_member(group_id, user_id) {
        Ok(true) => true,
        Ok(false) => {
            tracing::warn!(session_id = %conn.id, user = %user_id, group = %group_id, "Not a group member");
            send_to_session(
                state,
                &conn.id,
                &ServerEvent::error("not-a-member", format!("{user_id} is not a member of {group_id}")),
            );
            false
        }
        Err(e) => {
            report_store_error(state, conn, "group-check", &e);
            false
        }
    }
}

/// Log a failed store call. Rejections (unknown id, not allowed) are
/// reported back to the client; storage failures only get logged and the
/// triggering event is simply not emitted.
pub(super) fn report_store_error(state: &SharedState, conn: &Connection, event_name: &str, err: &StoreError) {
    let code = match err {
        StoreError::Sqlite(e) => {
            tracing::error!(session_id = %conn.id, event = event_name, "Store error: {e}");
            return;
        }
        StoreError::NotFound(_) => "not-found",
        StoreError::Forbidden(_) => "forbidden",
        StoreError::Conflict(_) => "conflict",
        StoreError::Invalid(_) => "invalid",
    };
    tracing::warn!(session_id = %conn.id, event = event_name, "Rejected: {err}");
    send_to_session(state, &conn.id, &ServerEvent::error(code, err.to_string()));
}
