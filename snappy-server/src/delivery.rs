//! Message delivery lifecycle: `sent -> delivered -> read`.
//!
//! Status only moves forward. A late `delivered` acknowledgement for a
//! message that is already `read` is a no-op, so a `read`/`delivered` race
//! between two connections always settles on `read` regardless of arrival
//! order. The comparison happens inside the store's update so the persisted
//! value is the single source of truth; nothing is announced to clients
//! unless the store accepted the transition.
//!
//! Group messages share one status field. Only direct messages advance on a
//! recipient's delivery acknowledgement.

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};
use crate::event::Target;
use crate::store::MessageStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    #[default]
    Sent,
    Delivered,
    Read,
}

impl DeliveryStatus {
    /// Position in the lifecycle, as persisted.
    pub fn rank(self) -> i64 {
        match self {
            DeliveryStatus::Sent => 0,
            DeliveryStatus::Delivered => 1,
            DeliveryStatus::Read => 2,
        }
    }

    pub fn from_rank(rank: i64) -> Option<Self> {
        match rank {
            0 => Some(DeliveryStatus::Sent),
            1 => Some(DeliveryStatus::Delivered),
            2 => Some(DeliveryStatus::Read),
            _ => None,
        }
    }

    /// The status after applying `next`. Never regresses.
    pub fn advance(self, next: DeliveryStatus) -> DeliveryStatus {
        self.max(next)
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Read => "read",
        })
    }
}

/// Result of a persisted status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub message_id: String,
    pub sender: String,
    pub previous: DeliveryStatus,
    pub current: DeliveryStatus,
}

impl StatusChange {
    pub fn advanced(&self) -> bool {
        self.current > self.previous
    }
}

/// A status advance the original sender should hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advance {
    pub message_id: String,
    /// Who to notify.
    pub sender: String,
    pub status: DeliveryStatus,
}

/// A batch read the peer should hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadReceipt {
    /// Who to notify (the author of the messages that were read).
    pub peer: String,
    pub reader: String,
    pub count: usize,
}

/// Apply `status` to a message, e.g. from the HTTP collaborator.
///
/// Returns `None` when the message already was at or beyond `status`.
pub fn apply_status(
    store: &dyn MessageStore,
    message_id: &str,
    status: DeliveryStatus,
) -> StoreResult<Option<Advance>> {
    let change = store.advance_status(message_id, status)?;
    Ok(change.advanced().then(|| Advance {
        message_id: change.message_id,
        sender: change.sender,
        status: change.current,
    }))
}

/// `recipient` acknowledged a pushed message.
///
/// Ignored (`Ok(None)`) for group messages, for acknowledgements from anyone
/// but the addressed recipient, and for messages already delivered or read.
pub fn acknowledge_delivered(
    store: &dyn MessageStore,
    message_id: &str,
    recipient: &str,
) -> StoreResult<Option<Advance>> {
    let record = store
        .message(message_id)?
        .ok_or_else(|| StoreError::NotFound(format!("message {message_id}")))?;

    match record.target {
        Target::Group(ref group) => {
            tracing::debug!(message_id, group = %group, "Delivery ack for group message ignored");
            return Ok(None);
        }
        Target::User(ref to) if to != recipient => {
            tracing::warn!(message_id, recipient, "Delivery ack from someone other than the recipient");
            return Ok(None);
        }
        Target::User(_) => {}
    }
    if record.status >= DeliveryStatus::Delivered {
        return Ok(None);
    }

    apply_status(store, message_id, DeliveryStatus::Delivered)
}

/// `reader` opened the conversation with `peer`: everything `peer` sent to
/// `reader` that is not yet read becomes read in one batch.
///
/// Returns a receipt only when at least one message changed.
pub fn mark_conversation_read(
    store: &dyn MessageStore,
    peer: &str,
    reader: &str,
) -> StoreResult<Option<ReadReceipt>> {
    let count = store.mark_read(peer, reader)?;
    Ok((count > 0).then(|| ReadReceipt {
        peer: peer.to_string(),
        reader: reader.to_string(),
        count,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use DeliveryStatus::*;

    #[test]
    fn advance_is_monotonic() {
        assert_eq!(Sent.advance(Delivered), Delivered);
        assert_eq!(Delivered.advance(Read), Read);
        assert_eq!(Read.advance(Delivered), Read);
        assert_eq!(Read.advance(Sent), Read);
        assert_eq!(Sent.advance(Read), Read);
    }

    #[test]
    fn all_orderings_settle_on_read() {
        let orders = [
            [Sent, Delivered, Read],
            [Sent, Read, Delivered],
            [Delivered, Sent, Read],
            [Delivered, Read, Sent],
            [Read, Sent, Delivered],
            [Read, Delivered, Sent],
        ];
        for order in orders {
            let end = order.iter().fold(Sent, |s, &next| s.advance(next));
            assert_eq!(end, Read, "ordering {order:?}");
        }
    }

    #[test]
    fn rank_round_trips() {
        for status in [Sent, Delivered, Read] {
            assert_eq!(DeliveryStatus::from_rank(status.rank()), Some(status));
        }
        assert_eq!(DeliveryStatus::from_rank(7), None);
    }

    fn status() -> impl Strategy<Value = DeliveryStatus> {
        prop_oneof![Just(Sent), Just(Delivered), Just(Read)]
    }

    proptest! {
        #[test]
        fn never_regresses(steps in proptest::collection::vec(status(), 0..16)) {
            let mut current = Sent;
            for next in &steps {
                let after = current.advance(*next);
                prop_assert!(after >= current);
                current = after;
            }
            let highest = steps.iter().copied().max().unwrap_or(Sent);
            prop_assert_eq!(current, highest);
        }
    }
}
