//! Wire events exchanged over the chat socket. Every frame is a JSON object
//! with a `type` tag; field names are camelCase.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{auth::Identity, format::FormatSpan, room::Member};

pub type MessageId = i64;

/// A persisted chat message. The sender is denormalized so history stays
/// readable after profile changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id:         MessageId,
    pub room_id:    String,
    pub sender:     Identity,
    pub body:       String,
    #[serde(default)]
    pub format:     Vec<FormatSpan>,
    pub timestamp:  DateTime<Utc>,
    /// emoji -> user ids in the order they reacted
    #[serde(default)]
    pub reactions:  BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub suppressed: bool,
}

/// What the session manager hands to the store; id and timestamp come back.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender:     Identity,
    pub body:       String,
    pub format:     Vec<FormatSpan>,
    pub suppressed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingUser {
    pub user_id: String,
    pub name:    String,
}

/* ---------------- client -> server ---------------- */

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    JoinRoom {
        room_id: String,
        #[serde(default)]
        live_session: bool,
    },
    LeaveRoom {
        room_id: String,
    },
    SendMessage {
        room_id: String,
        body: String,
        #[serde(default)]
        format: Option<Vec<FormatSpan>>,
        #[serde(default)]
        client_ref: Option<String>,
    },
    AddReaction {
        room_id: String,
        message_id: MessageId,
        emoji: String,
    },
    RemoveReaction {
        room_id: String,
        message_id: MessageId,
        emoji: String,
    },
    TypingStart {
        room_id: String,
    },
    TypingEnd {
        room_id: String,
    },
    MuteUser {
        room_id: String,
        user_id: String,
    },
    UnmuteUser {
        room_id: String,
        user_id: String,
    },
    DjLive {
        room_id: String,
        is_live: bool,
    },
}

impl ClientEvent {
    pub fn room_id(&self) -> &str {
        match self {
            ClientEvent::JoinRoom { room_id, .. }
            | ClientEvent::LeaveRoom { room_id }
            | ClientEvent::SendMessage { room_id, .. }
            | ClientEvent::AddReaction { room_id, .. }
            | ClientEvent::RemoveReaction { room_id, .. }
            | ClientEvent::TypingStart { room_id }
            | ClientEvent::TypingEnd { room_id }
            | ClientEvent::MuteUser { room_id, .. }
            | ClientEvent::UnmuteUser { room_id, .. }
            | ClientEvent::DjLive { room_id, .. } => room_id,
        }
    }

    pub fn client_ref(&self) -> Option<&str> {
        match self {
            ClientEvent::SendMessage { client_ref, .. } => client_ref.as_deref(),
            _ => None,
        }
    }
}

/* ---------------- server -> client ---------------- */

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    RoomJoined {
        room_id: String,
        member_count: usize,
        you: Identity,
        recent_messages: Vec<Message>,
    },
    UserJoined {
        user: Member,
        room_id: String,
        timestamp: DateTime<Utc>,
    },
    UserLeft {
        user_id: String,
        user_name: String,
        room_id: String,
        timestamp: DateTime<Utc>,
    },
    UserCount {
        room_id: String,
        count: usize,
    },
    OnlineUsers {
        room_id: String,
        users: Vec<Member>,
    },
    NewMessage {
        message: Message,
    },
    MessageAck {
        room_id: String,
        client_ref: Option<String>,
        message_id: MessageId,
        timestamp: DateTime<Utc>,
    },
    ReactionAdded {
        room_id: String,
        message_id: MessageId,
        emoji: String,
        user_id: String,
    },
    ReactionRemoved {
        room_id: String,
        message_id: MessageId,
        emoji: String,
        user_id: String,
    },
    TypingUpdate {
        room_id: String,
        users: Vec<TypingUser>,
    },
    MuteUpdate {
        room_id: String,
        user_id: String,
        muted: bool,
    },
    DjStatusUpdate {
        dj_id: String,
        dj_name: String,
        room_id: String,
        is_live: bool,
        timestamp: DateTime<Utc>,
    },
    Error {
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_ref: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn client_events_use_snake_case_tags_and_camel_case_fields() {
        let ev: ClientEvent = serde_json::from_value(json!({
            "type": "send_message",
            "roomId": "dj:42",
            "body": "hi",
            "clientRef": "tmp-1"
        }))
        .unwrap();
        assert_eq!(ev.room_id(), "dj:42");
        assert_eq!(ev.client_ref(), Some("tmp-1"));

        let ev: ClientEvent =
            serde_json::from_value(json!({ "type": "join_room", "roomId": "r1" })).unwrap();
        assert!(matches!(ev, ClientEvent::JoinRoom { live_session: false, .. }));
    }

    #[test]
    fn unknown_event_type_is_rejected() {
        let res = serde_json::from_value::<ClientEvent>(json!({ "type": "nuke", "roomId": "r1" }));
        assert!(res.is_err());
    }

    #[test]
    fn error_event_omits_empty_context() {
        let v = serde_json::to_value(ServerEvent::Error {
            code: "NotInRoom".into(),
            message: "not in room r1".into(),
            room_id: None,
            client_ref: None,
        })
        .unwrap();
        assert_eq!(v, json!({ "type": "error", "code": "NotInRoom", "message": "not in room r1" }));
    }
}
