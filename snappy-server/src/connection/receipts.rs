//! Delivery and read acknowledgements.

use std::sync::Arc;

use crate::delivery;
use crate::event::{DeliveryAck, ReadAck, ServerEvent, StatusUpdate};
use crate::server::SharedState;

use super::Connection;
use super::helpers::{acting_as, report_store_error, send_to_user};

pub(super) fn handle_delivered(conn: &Connection, state: &Arc<SharedState>, ack: &DeliveryAck) {
    if !acting_as(state, conn, &ack.from, "msg-delivered") {
        return;
    }

    match delivery::acknowledge_delivered(&*state.store, &ack.message_id, &ack.from) {
        Ok(Some(advance)) => {
            let notified = send_to_user(
                state,
                &advance.sender,
                &ServerEvent::MsgStatusUpdate(StatusUpdate {
                    message_id: advance.message_id,
                    status: advance.status,
                }),
            );
            tracing::debug!(message_id = %ack.message_id, notified, "Marked delivered");
        }
        Ok(None) => {
            tracing::debug!(message_id = %ack.message_id, "Delivery ack changed nothing");
        }
        Err(e) => report_store_error(state, conn, "msg-delivered", &e),
    }
}

pub(super) fn handle_read(conn: &Connection, state: &Arc<SharedState>, ack: &ReadAck) {
    if !acting_as(state, conn, &ack.from, "msg-read") {
        return;
    }

    match delivery::mark_conversation_read(&*state.store, &ack.to, &ack.from) {
        Ok(Some(receipt)) => {
            let notified = send_to_user(state, &receipt.peer, &ServerEvent::MsgReadReceive(receipt.reader));
            tracing::debug!(peer = %ack.to, reader = %ack.from, count = receipt.count, notified, "Conversation read");
        }
        Ok(None) => {}
        Err(e) => report_store_error(state, conn, "msg-read", &e),
    }
}
