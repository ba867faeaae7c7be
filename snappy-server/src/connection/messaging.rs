//! Message events: send, typing, delete, react.
//!
//! Anything that changes a message is written to the store first. The
//! fan-out only happens once the write returned, and uses the addressing
//! of the stored record rather than the payload's.

use std::sync::Arc;

use crate::event::{
    DeleteRequest, OutgoingMessage, ReactionRequest, ReactionSignal, SentAck, ServerEvent, Target,
    TypingNotice, TypingSignal,
};
use crate::server::SharedState;
use crate::store::NewMessage;

use super::Connection;
use super::helpers::{acting_as, authorize_group, fan_out, report_store_error, send_to_session};

fn reject(state: &SharedState, conn: &Connection, code: &str, message: String) {
    tracing::warn!(session_id = %conn.id, user = conn.user_or_dash(), "{message}");
    send_to_session(state, &conn.id, &ServerEvent::error(code, message));
}

pub(super) fn handle_send(conn: &Connection, state: &Arc<SharedState>, message: OutgoingMessage) {
    if !acting_as(state, conn, &message.from, "send-msg") {
        return;
    }
    if let Target::Group(ref group) = message.target {
        if !authorize_group(state, conn, group, &message.from) {
            return;
        }
    }

    let record = match message.message_id {
        // Already created over HTTP: relay only
        Some(ref id) => match state.store.message(id) {
            Ok(Some(record)) if record.from != message.from || record.target != message.target => {
                reject(state, conn, "invalid", format!("message {id} does not match this conversation"));
                return;
            }
            Ok(Some(record)) if record.deleted => {
                reject(state, conn, "invalid", format!("message {id} was deleted"));
                return;
            }
            Ok(Some(record)) => record,
            Ok(None) => {
                reject(state, conn, "not-found", format!("message {id} not found"));
                return;
            }
            Err(e) => {
                report_store_error(state, conn, "send-msg", &e);
                return;
            }
        },
        None => match state.store.insert_message(&NewMessage::from(&message)) {
            Ok(record) => record,
            Err(e) => {
                report_store_error(state, conn, "send-msg", &e);
                return;
            }
        },
    };

    send_to_session(
        state,
        &conn.id,
        &ServerEvent::MsgSent(SentAck {
            message_id: record.id.clone(),
            status: record.status,
            created_at: record.created_at,
        }),
    );

    let (id, target) = (record.id.clone(), record.target.clone());
    let pushed = fan_out(state, conn, &target, &ServerEvent::MsgReceive(record));
    tracing::debug!(session_id = %conn.id, message_id = %id, to = %target.id(), pushed, "Message routed");
}

/// `typing` / `stop-typing`. Group indicators only go out from sessions
/// subscribed to the room.
pub(super) fn handle_typing(conn: &Connection, state: &Arc<SharedState>, notice: &TypingNotice, started: bool) {
    let event_name = if started { "typing" } else { "stop-typing" };
    if !acting_as(state, conn, &notice.from, event_name) {
        return;
    }

    let group_id = match notice.target {
        Target::Group(ref group) => {
            if !state.rooms.lock().contains(group, &conn.id) {
                tracing::debug!(session_id = %conn.id, group = %group, "Typing in a room not joined, ignored");
                return;
            }
            Some(group.clone())
        }
        Target::User(_) => None,
    };
    let signal = TypingSignal { from: notice.from.clone(), group_id };
    let event = if started {
        ServerEvent::TypingReceive(signal)
    } else {
        ServerEvent::StopTypingReceive(signal)
    };
    fan_out(state, conn, &notice.target, &event);
}

pub(super) fn handle_delete(conn: &Connection, state: &Arc<SharedState>, request: &DeleteRequest) {
    if !acting_as(state, conn, &request.from, "delete-msg") {
        return;
    }

    match state.store.message(&request.message_id) {
        // Non-senders fall through to the store's ownership check
        Ok(Some(existing)) if existing.from == request.from && existing.target != request.target => {
            reject(
                state,
                conn,
                "invalid",
                format!("message {} is not addressed to {}", request.message_id, request.target.id()),
            );
            return;
        }
        Ok(Some(_)) => {}
        Ok(None) => {
            reject(state, conn, "not-found", format!("message {} not found", request.message_id));
            return;
        }
        Err(e) => {
            report_store_error(state, conn, "delete-msg", &e);
            return;
        }
    }

    let record = match state.store.delete_message(&request.message_id, &request.from) {
        Ok(record) => record,
        Err(e) => {
            report_store_error(state, conn, "delete-msg", &e);
            return;
        }
    };

    tracing::info!(session_id = %conn.id, message_id = %record.id, "Message deleted");
    fan_out(state, conn, &record.target, &ServerEvent::MsgDeleteReceive(record.id.clone()));
}

pub(super) fn handle_reaction(conn: &Connection, state: &Arc<SharedState>, request: &ReactionRequest) {
    if !acting_as(state, conn, &request.reactor_id, "send-reaction") {
        return;
    }

    let existing = match state.store.message(&request.message_id) {
        Ok(Some(record)) => record,
        Ok(None) => {
            reject(state, conn, "not-found", format!("message {} not found", request.message_id));
            return;
        }
        Err(e) => {
            report_store_error(state, conn, "send-reaction", &e);
            return;
        }
    };

    // The notification goes to the other side of the conversation
    let counterpart = match existing.target {
        Target::Group(ref group) => Target::Group(group.clone()),
        Target::User(ref to) if *to == request.reactor_id => Target::User(existing.from.clone()),
        Target::User(ref to) => Target::User(to.clone()),
    };
    if counterpart != request.target {
        reject(
            state,
            conn,
            "invalid",
            format!("message {} is not in a conversation with {}", request.message_id, request.target.id()),
        );
        return;
    }

    let outcome = match state.store.toggle_reaction(&request.message_id, &request.reactor_id, &request.emoji) {
        Ok(outcome) => outcome,
        Err(e) => {
            report_store_error(state, conn, "send-reaction", &e);
            return;
        }
    };

    let signal = ReactionSignal {
        message_id: outcome.message.id,
        from: request.reactor_id.clone(),
        emoji: request.emoji.clone(),
        active: outcome.active,
    };
    fan_out(state, conn, &counterpart, &ServerEvent::ReactionReceive(signal));
}
