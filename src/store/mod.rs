//! Message persistence seam.
//!
//! The chat core only needs append-only storage that hands back a unique,
//! room-orderable id plus an authoritative timestamp, a way to read the last
//! page of a room, and in-place reaction updates.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::protocol::{Message, MessageId, NewMessage};

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("message {0} not found")]
    NotFound(MessageId),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionOp {
    Add,
    Remove,
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persists a message, assigning its id and timestamp.
    async fn append(&self, room_id: &str, msg: NewMessage) -> Result<Message, StoreError>;

    /// Up to `limit` most recent messages, oldest first.
    async fn recent(&self, room_id: &str, limit: usize) -> Result<Vec<Message>, StoreError>;

    /// Returns whether the reaction set actually changed.
    async fn react(
        &self,
        room_id: &str,
        message_id: MessageId,
        emoji: &str,
        user_id: &str,
        op: ReactionOp,
    ) -> Result<bool, StoreError>;
}

/// Applies one reaction change to an emoji -> users map, keeping user order.
pub fn apply_reaction(
    reactions: &mut BTreeMap<String, Vec<String>>,
    emoji: &str,
    user_id: &str,
    op: ReactionOp,
) -> bool {
    match op {
        ReactionOp::Add => {
            let users = reactions.entry(emoji.to_string()).or_default();
            if users.iter().any(|u| u == user_id) {
                return false;
            }
            users.push(user_id.to_string());
            true
        }
        ReactionOp::Remove => {
            let Some(users) = reactions.get_mut(emoji) else { return false };
            let before = users.len();
            users.retain(|u| u != user_id);
            let changed = users.len() != before;
            if users.is_empty() {
                reactions.remove(emoji);
            }
            changed
        }
    }
}
