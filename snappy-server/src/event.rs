//! Wire protocol: typed events exchanged over a live connection.
//!
//! Every frame is one line of JSON, adjacently tagged:
//! `{"event":"send-msg","data":{...}}`. Inbound frames become a
//! [`ClientEvent`] at the connection boundary and are validated there;
//! business logic never sees a payload with missing ids or ambiguous
//! addressing.
//!
//! The `*-recieve` spellings are part of the protocol existing clients speak
//! and are kept on the wire only.

use serde::{Deserialize, Serialize};

use crate::delivery::DeliveryStatus;
use crate::error::EventError;
use crate::store::MessageRecord;

/// Who a message or signal is addressed to. Direct and group addressing are
/// mutually exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "WireTarget", into = "WireTarget")]
pub enum Target {
    User(String),
    Group(String),
}

impl Target {
    pub fn id(&self) -> &str {
        match self {
            Target::User(id) | Target::Group(id) => id,
        }
    }
}

/// The on-the-wire shape of [`Target`]: `{"to": ..}` or `{"groupId": ..}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
}

impl TryFrom<WireTarget> for Target {
    type Error = EventError;

    fn try_from(raw: WireTarget) -> Result<Self, Self::Error> {
        match (raw.to, raw.group_id) {
            (Some(to), None) => Ok(Target::User(to)),
            (None, Some(group)) => Ok(Target::Group(group)),
            _ => Err(EventError::Addressing),
        }
    }
}

impl From<Target> for WireTarget {
    fn from(target: Target) -> Self {
        match target {
            Target::User(to) => WireTarget { to: Some(to), group_id: None },
            Target::Group(group) => WireTarget { to: None, group_id: Some(group) },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Audio,
    Image,
    File,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Audio => "audio",
            MessageKind::Image => "image",
            MessageKind::File => "file",
        }
    }

    /// Unknown kinds read back from storage degrade to plain text.
    pub fn from_db(s: &str) -> Self {
        match s {
            "audio" => MessageKind::Audio,
            "image" => MessageKind::Image,
            "file" => MessageKind::File,
            _ => MessageKind::Text,
        }
    }
}

// ── Client → server ────────────────────────────────────────────────────

/// Every event a client may emit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// Bind this connection to a user identity.
    AddUser(String),
    /// Subscribe this connection to a group's broadcast room.
    JoinGroup(String),
    SendMsg(OutgoingMessage),
    Typing(TypingNotice),
    StopTyping(TypingNotice),
    MsgDelivered(DeliveryAck),
    MsgRead(ReadAck),
    DeleteMsg(DeleteRequest),
    SendReaction(ReactionRequest),
}

/// Payload of `send-msg`, and the body of `POST /messages`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    pub from: String,
    #[serde(flatten)]
    pub target: Target,
    /// Set when the record was already created through the HTTP API; the
    /// connection then only relays it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
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
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingNotice {
    pub from: String,
    #[serde(flatten)]
    pub target: Target,
}

/// The recipient confirming a pushed message arrived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryAck {
    pub message_id: String,
    /// The acknowledging recipient.
    #[serde(alias = "recipientId")]
    pub from: String,
}

/// The reader opened the conversation with `to`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadAck {
    /// The peer whose messages were read.
    #[serde(alias = "peerId")]
    pub to: String,
    #[serde(alias = "readerId")]
    pub from: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteRequest {
    pub message_id: String,
    pub from: String,
    #[serde(flatten)]
    pub target: Target,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionRequest {
    pub message_id: String,
    #[serde(alias = "from")]
    pub reactor_id: String,
    pub emoji: String,
    #[serde(flatten)]
    pub target: Target,
}

impl ClientEvent {
    /// Parse and validate one inbound frame.
    pub fn parse(line: &str) -> Result<Self, EventError> {
        let event: ClientEvent = serde_json::from_str(line.trim())
            .map_err(|e| EventError::Malformed(e.to_string()))?;
        event.validate()?;
        Ok(event)
    }

    /// Wire name of the event, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::AddUser(_) => "add-user",
            ClientEvent::JoinGroup(_) => "join-group",
            ClientEvent::SendMsg(_) => "send-msg",
            ClientEvent::Typing(_) => "typing",
            ClientEvent::StopTyping(_) => "stop-typing",
            ClientEvent::MsgDelivered(_) => "msg-delivered",
            ClientEvent::MsgRead(_) => "msg-read",
            ClientEvent::DeleteMsg(_) => "delete-msg",
            ClientEvent::SendReaction(_) => "send-reaction",
        }
    }

    fn validate(&self) -> Result<(), EventError> {
        match self {
            ClientEvent::AddUser(user) => require("userId", user),
            ClientEvent::JoinGroup(group) => require("groupId", group),
            ClientEvent::SendMsg(m) => {
                require("from", &m.from)?;
                require_target(&m.target)?;
                if let Some(ref id) = m.message_id {
                    require("messageId", id)?;
                }
                let has_body = !m.msg.trim().is_empty()
                    || m.file_url.is_some()
                    || m.audio_url.is_some();
                if m.message_id.is_none() && !has_body {
                    return Err(EventError::EmptyField("msg"));
                }
                Ok(())
            }
            ClientEvent::Typing(t) | ClientEvent::StopTyping(t) => {
                require("from", &t.from)?;
                require_target(&t.target)
            }
            ClientEvent::MsgDelivered(ack) => {
                require("messageId", &ack.message_id)?;
                require("from", &ack.from)
            }
            ClientEvent::MsgRead(ack) => {
                require("to", &ack.to)?;
                require("from", &ack.from)
            }
            ClientEvent::DeleteMsg(d) => {
                require("messageId", &d.message_id)?;
                require("from", &d.from)?;
                require_target(&d.target)
            }
            ClientEvent::SendReaction(r) => {
                require("messageId", &r.message_id)?;
                require("reactorId", &r.reactor_id)?;
                require("emoji", &r.emoji)?;
                require_target(&r.target)
            }
        }
    }
}

fn require(field: &'static str, value: &str) -> Result<(), EventError> {
    if value.trim().is_empty() {
        Err(EventError::EmptyField(field))
    } else {
        Ok(())
    }
}

fn require_target(target: &Target) -> Result<(), EventError> {
    match target {
        Target::User(id) => require("to", id),
        Target::Group(id) => require("groupId", id),
    }
}

// ── Server → client ────────────────────────────────────────────────────

/// Every event the server pushes to a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    UserStatusChange(PresenceChange),
    #[serde(rename = "msg-recieve")]
    MsgReceive(MessageRecord),
    #[serde(rename = "typing-recieve")]
    TypingReceive(TypingSignal),
    #[serde(rename = "stop-typing-recieve")]
    StopTypingReceive(TypingSignal),
    /// Carries the reader's id, not individual message ids.
    #[serde(rename = "msg-read-recieve")]
    MsgReadReceive(String),
    MsgStatusUpdate(StatusUpdate),
    #[serde(rename = "msg-delete-recieve")]
    MsgDeleteReceive(String),
    #[serde(rename = "reaction-recieve")]
    ReactionReceive(ReactionSignal),
    /// Sent back to the author once the message is durable.
    MsgSent(SentAck),
    Error(ErrorNotice),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceChange {
    pub user_id: String,
    pub is_online: bool,
    /// Unix milliseconds; present when the user went offline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingSignal {
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub message_id: String,
    pub status: DeliveryStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionSignal {
    pub message_id: String,
    pub from: String,
    pub emoji: String,
    /// False when the reactor withdrew this emoji.
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SentAck {
    pub message_id: String,
    pub status: DeliveryStatus,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorNotice {
    pub code: String,
    pub message: String,
}

impl ServerEvent {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        ServerEvent::Error(ErrorNotice {
            code: code.to_string(),
            message: message.into(),
        })
    }
}
