//! `join-group`: subscribe the session to a group's broadcast room.

use std::sync::Arc;

use crate::event::ServerEvent;
use crate::server::SharedState;

use super::Connection;
use super::helpers::{authorize_group, report_store_error, send_to_session};

fn refuse_replaced(state: &SharedState, conn: &Connection, group_id: &str) {
    tracing::warn!(session_id = %conn.id, user = conn.user_or_dash(), group = %group_id, "join-group from a replaced session");
    send_to_session(
        state,
        &conn.id,
        &ServerEvent::error("not-registered", "this session no longer represents a user"),
    );
}

pub(super) fn handle_join_group(conn: &Connection, state: &Arc<SharedState>, group_id: &str) {
    // The registry, not `conn.user_id`: a session taken over by a newer
    // one no longer speaks for the user.
    let Some(user_id) = state.presence.lock().user_of(&conn.id).map(str::to_string) else {
        refuse_replaced(state, conn, group_id);
        return;
    };

    match state.store.group(group_id) {
        Ok(Some(_)) => {}
        Ok(None) => {
            send_to_session(
                state,
                &conn.id,
                &ServerEvent::error("unknown-group", format!("no group {group_id}")),
            );
            return;
        }
        Err(e) => {
            report_store_error(state, conn, "join-group", &e);
            return;
        }
    }
    if !authorize_group(state, conn, group_id, &user_id) {
        return;
    }

    // Re-checked under the registry lock so a takeover in between cannot
    // leave this session subscribed.
    let joined = {
        let presence = state.presence.lock();
        if presence.user_of(&conn.id) != Some(user_id.as_str()) {
            None
        } else {
            Some(state.rooms.lock().join(&conn.id, group_id))
        }
    };
    match joined {
        Some(true) => tracing::debug!(session_id = %conn.id, user = %user_id, group = %group_id, "Joined room"),
        Some(false) => {}
        None => refuse_replaced(state, conn, group_id),
    }
}
