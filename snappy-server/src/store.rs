//! Durable storage behind the realtime server.
//!
//! [`MessageStore`] is the seam between connection handling and
//! persistence. Every state change a client can observe is written here
//! first; callers announce nothing until a store call has returned `Ok`.
//! [`SqliteStore`] is the production implementation; tests wrap it to
//! inject failures.

use std::path::Path;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::db::Db;
use crate::delivery::{DeliveryStatus, StatusChange};
use crate::error::{StoreError, StoreResult};
use crate::event::{MessageKind, OutgoingMessage, Target};
use crate::msgid;

/// A persisted message as clients see it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: String,
    /// Sender's user id.
    pub from: String,
    #[serde(flatten)]
    pub target: Target,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub message_type: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_meta: Option<serde_json::Value>,
    #[serde(default)]
    pub status: DeliveryStatus,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
    #[serde(default)]
    pub deleted: bool,
    /// Unix milliseconds.
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub reactor_id: String,
    pub emoji: String,
}

/// Everything needed to create a message. The store assigns id, status and
/// timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub from: String,
    pub target: Target,
    pub msg: String,
    pub message_type: MessageKind,
    pub file_url: Option<String>,
    pub audio_url: Option<String>,
    pub reply_to: Option<String>,
    pub link_meta: Option<serde_json::Value>,
}

impl From<&OutgoingMessage> for NewMessage {
    fn from(m: &OutgoingMessage) -> Self {
        NewMessage {
            from: m.from.clone(),
            target: m.target.clone(),
            msg: m.msg.clone(),
            message_type: m.message_type,
            file_url: m.file_url.clone(),
            audio_url: m.audio_url.clone(),
            reply_to: m.reply_to.clone(),
            link_meta: m.link_meta.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub id: String,
    pub username: String,
    pub is_online: bool,
    #[serde(default)]
    pub last_seen: Option<i64>,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupRecord {
    pub id: String,
    pub name: String,
    pub admin: String,
    /// Always includes the admin.
    pub members: Vec<String>,
    pub created_at: i64,
}

/// Outcome of toggling a reaction.
#[derive(Debug, Clone, PartialEq)]
pub struct ReactionOutcome {
    pub message: MessageRecord,
    /// False when the toggle removed the reactor's emoji.
    pub active: bool,
}

/// History paging: the newest `limit` messages older than the message
/// `before` (an id taken from the previous page), returned oldest first.
/// Messages sharing a millisecond are ordered by insertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub before: Option<String>,
    pub limit: usize,
}

impl Page {
    pub fn latest(limit: usize) -> Self {
        Page { before: None, limit }
    }
}

pub trait MessageStore: Send + Sync {
    /// Fails with `Conflict` if the username is taken.
    fn create_user(&self, username: &str) -> StoreResult<UserRecord>;
    fn user(&self, user_id: &str) -> StoreResult<Option<UserRecord>>;
    /// Persist the online flag. `last_seen` is kept when `None`.
    fn set_presence(&self, user_id: &str, online: bool, last_seen: Option<i64>) -> StoreResult<()>;

    fn create_group(&self, name: &str, admin: &str, members: &[String]) -> StoreResult<GroupRecord>;
    fn group(&self, group_id: &str) -> StoreResult<Option<GroupRecord>>;
    fn is_group_member(&self, group_id: &str, user_id: &str) -> StoreResult<bool>;
    /// Every group `user_id` is a member of.
    fn groups_of(&self, user_id: &str) -> StoreResult<Vec<GroupRecord>>;

    /// Persist a new message with status `sent`. Group messages require the
    /// sender to be a member.
    fn insert_message(&self, message: &NewMessage) -> StoreResult<MessageRecord>;
    fn message(&self, message_id: &str) -> StoreResult<Option<MessageRecord>>;
    /// Raise the status if `status` is ahead of the stored one. The
    /// comparison and the write are one step.
    fn advance_status(&self, message_id: &str, status: DeliveryStatus) -> StoreResult<StatusChange>;
    /// Mark everything `sender` sent directly to `reader` as read. Returns
    /// how many messages changed.
    fn mark_read(&self, sender: &str, reader: &str) -> StoreResult<usize>;
    /// Soft delete. Only the sender may delete.
    fn delete_message(&self, message_id: &str, requester: &str) -> StoreResult<MessageRecord>;
    /// Add, replace or withdraw `reactor`'s reaction. Re-sending the same
    /// emoji withdraws it.
    fn toggle_reaction(&self, message_id: &str, reactor: &str, emoji: &str) -> StoreResult<ReactionOutcome>;

    fn conversation(&self, a: &str, b: &str, page: Page) -> StoreResult<Vec<MessageRecord>>;
    fn group_history(&self, group_id: &str, page: Page) -> StoreResult<Vec<MessageRecord>>;
}

/// [`MessageStore`] over a single SQLite connection.
pub struct SqliteStore {
    db: Mutex<Db>,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        Ok(Self::new(Db::open(path)?))
    }

    pub fn open_memory() -> StoreResult<Self> {
        Ok(Self::new(Db::open_memory()?))
    }

    pub fn new(db: Db) -> Self {
        Self { db: Mutex::new(db) }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn resolve_cursor(db: &Db, before: Option<&str>) -> StoreResult<Option<(i64, i64)>> {
    match before {
        Some(id) => db
            .cursor_of(id)?
            .map(Some)
            .ok_or_else(|| StoreError::NotFound(format!("message {id}"))),
        None => Ok(None),
    }
}

fn is_participant(db: &Db, message: &MessageRecord, user: &str) -> StoreResult<bool> {
    Ok(match &message.target {
        Target::User(to) => message.from == user || to == user,
        Target::Group(group) => db.is_group_member(group, user)?,
    })
}

impl MessageStore for SqliteStore {
    fn create_user(&self, username: &str) -> StoreResult<UserRecord> {
        let username = username.trim();
        if username.is_empty() {
            return Err(StoreError::Invalid("username must not be empty".into()));
        }
        let user = UserRecord {
            id: msgid::generate(),
            username: username.to_string(),
            is_online: false,
            last_seen: None,
            created_at: now_ms(),
        };
        self.db.lock().insert_user(&user).map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::Conflict(format!("username {username} is taken"))
            } else {
                e.into()
            }
        })?;
        Ok(user)
    }

    fn user(&self, user_id: &str) -> StoreResult<Option<UserRecord>> {
        Ok(self.db.lock().get_user(user_id)?)
    }

    fn set_presence(&self, user_id: &str, online: bool, last_seen: Option<i64>) -> StoreResult<()> {
        let changed = self.db.lock().update_presence(user_id, online, last_seen)?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("user {user_id}")));
        }
        Ok(())
    }

    fn create_group(&self, name: &str, admin: &str, members: &[String]) -> StoreResult<GroupRecord> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StoreError::Invalid("group name must not be empty".into()));
        }
        if admin.trim().is_empty() {
            return Err(StoreError::Invalid("group admin must not be empty".into()));
        }
        let mut all = vec![admin.to_string()];
        for member in members {
            let member = member.trim();
            if !member.is_empty() && !all.iter().any(|m| m == member) {
                all.push(member.to_string());
            }
        }
        let group = GroupRecord {
            id: msgid::generate(),
            name: name.to_string(),
            admin: admin.to_string(),
            members: all,
            created_at: now_ms(),
        };
        self.db.lock().insert_group(&group)?;
        Ok(group)
    }

    fn group(&self, group_id: &str) -> StoreResult<Option<GroupRecord>> {
        Ok(self.db.lock().get_group(group_id)?)
    }

    fn is_group_member(&self, group_id: &str, user_id: &str) -> StoreResult<bool> {
        Ok(self.db.lock().is_group_member(group_id, user_id)?)
    }

    fn groups_of(&self, user_id: &str) -> StoreResult<Vec<GroupRecord>> {
        Ok(self.db.lock().groups_of(user_id)?)
    }

    fn insert_message(&self, message: &NewMessage) -> StoreResult<MessageRecord> {
        let db = self.db.lock();
        if let Target::Group(ref group) = message.target {
            if db.get_group(group)?.is_none() {
                return Err(StoreError::NotFound(format!("group {group}")));
            }
            if !db.is_group_member(group, &message.from)? {
                return Err(StoreError::Forbidden(format!(
                    "{} is not a member of {group}",
                    message.from
                )));
            }
        }
        if let Some(ref parent) = message.reply_to {
            if db.get_message(parent)?.is_none() {
                return Err(StoreError::Invalid(format!("reply target {parent} does not exist")));
            }
        }

        let created_at = now_ms();
        let record = MessageRecord {
            id: msgid::generate_at(created_at as u64),
            from: message.from.clone(),
            target: message.target.clone(),
            msg: message.msg.clone(),
            message_type: message.message_type,
            file_url: message.file_url.clone(),
            audio_url: message.audio_url.clone(),
            reply_to: message.reply_to.clone(),
            link_meta: message.link_meta.clone(),
            status: DeliveryStatus::Sent,
            reactions: Vec::new(),
            deleted: false,
            created_at,
        };
        db.insert_message(&record)?;
        Ok(record)
    }

    fn message(&self, message_id: &str) -> StoreResult<Option<MessageRecord>> {
        Ok(self.db.lock().get_message(message_id)?)
    }

    fn advance_status(&self, message_id: &str, status: DeliveryStatus) -> StoreResult<StatusChange> {
        let db = self.db.lock();
        let record = db
            .get_message(message_id)?
            .ok_or_else(|| StoreError::NotFound(format!("message {message_id}")))?;
        db.raise_status(message_id, status)?;
        Ok(StatusChange {
            message_id: record.id,
            sender: record.from,
            previous: record.status,
            current: record.status.advance(status),
        })
    }

    fn mark_read(&self, sender: &str, reader: &str) -> StoreResult<usize> {
        Ok(self.db.lock().mark_read(sender, reader)?)
    }

    fn delete_message(&self, message_id: &str, requester: &str) -> StoreResult<MessageRecord> {
        let db = self.db.lock();
        let record = db
            .get_message(message_id)?
            .ok_or_else(|| StoreError::NotFound(format!("message {message_id}")))?;
        if record.from != requester {
            return Err(StoreError::Forbidden(format!(
                "{requester} did not send {message_id}"
            )));
        }
        if !record.deleted {
            db.soft_delete(message_id)?;
        }
        db.get_message(message_id)?
            .ok_or_else(|| StoreError::NotFound(format!("message {message_id}")))
    }

    fn toggle_reaction(&self, message_id: &str, reactor: &str, emoji: &str) -> StoreResult<ReactionOutcome> {
        let db = self.db.lock();
        let record = db
            .get_message(message_id)?
            .ok_or_else(|| StoreError::NotFound(format!("message {message_id}")))?;
        if record.deleted {
            return Err(StoreError::Invalid(format!("message {message_id} was deleted")));
        }
        if !is_participant(&db, &record, reactor)? {
            return Err(StoreError::Forbidden(format!(
                "{reactor} is not part of the conversation"
            )));
        }

        let active = match db.reaction_of(message_id, reactor)? {
            Some(ref current) if current == emoji => {
                db.remove_reaction(message_id, reactor)?;
                false
            }
            _ => {
                db.set_reaction(message_id, reactor, emoji)?;
                true
            }
        };
        let message = db
            .get_message(message_id)?
            .ok_or_else(|| StoreError::NotFound(format!("message {message_id}")))?;
        Ok(ReactionOutcome { message, active })
    }

    fn conversation(&self, a: &str, b: &str, page: Page) -> StoreResult<Vec<MessageRecord>> {
        let db = self.db.lock();
        let before = resolve_cursor(&db, page.before.as_deref())?;
        Ok(db.conversation(a, b, before, page.limit)?)
    }

    fn group_history(&self, group_id: &str, page: Page) -> StoreResult<Vec<MessageRecord>> {
        let db = self.db.lock();
        let before = resolve_cursor(&db, page.before.as_deref())?;
        Ok(db.group_messages(group_id, before, page.limit)?)
    }
}
