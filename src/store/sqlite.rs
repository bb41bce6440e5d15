use std::{collections::{BTreeMap, HashMap}, str::FromStr};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};

use super::{MessageStore, ReactionOp, StoreError};
use crate::{
    auth::{Identity, Role},
    protocol::{Message, MessageId, NewMessage},
};

const SCHEMA: [&str; 3] = [
    "CREATE TABLE IF NOT EXISTS messages (
        id            INTEGER PRIMARY KEY AUTOINCREMENT,
        room_id       TEXT    NOT NULL,
        sender_id     TEXT    NOT NULL,
        sender_name   TEXT    NOT NULL,
        sender_role   TEXT    NOT NULL,
        sender_avatar TEXT,
        body          TEXT    NOT NULL,
        format        TEXT    NOT NULL DEFAULT '[]',
        suppressed    INTEGER NOT NULL DEFAULT 0,
        created_at    INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS messages_room_id ON messages (room_id, id)",
    "CREATE TABLE IF NOT EXISTS reactions (
        message_id INTEGER NOT NULL REFERENCES messages (id),
        emoji      TEXT    NOT NULL,
        user_id    TEXT    NOT NULL,
        created_at INTEGER NOT NULL,
        PRIMARY KEY (message_id, emoji, user_id)
    )",
];

type MessageRow = (i64, String, String, String, String, Option<String>, String, String, bool, i64);

/// Messages and reactions in SQLite. Ids come from AUTOINCREMENT so they are
/// never reused, even after deletes by an outside retention job.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        // every pooled connection to :memory: would be its own database
        let max = if url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new().max_connections(max).connect_with(opts).await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn ts_from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn decode(row: MessageRow) -> Result<Message, StoreError> {
    let (id, room_id, sender_id, sender_name, role, avatar, body, format, suppressed, created_at) = row;
    let role = Role::from_str(&role).map_err(StoreError::Unavailable)?;
    let format = serde_json::from_str(&format)
        .map_err(|e| StoreError::Unavailable(format!("bad format column on message {id}: {e}")))?;
    Ok(Message {
        id,
        room_id,
        sender: Identity { user_id: sender_id, name: sender_name, role, avatar },
        body,
        format,
        timestamp: ts_from_millis(created_at),
        reactions: BTreeMap::new(),
        suppressed,
    })
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn append(&self, room_id: &str, msg: NewMessage) -> Result<Message, StoreError> {
        let created_at = Utc::now().timestamp_millis();
        let format = serde_json::to_string(&msg.format)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let id = sqlx::query(
            "INSERT INTO messages
                (room_id, sender_id, sender_name, sender_role, sender_avatar, body, format, suppressed, created_at)
             VALUES (?,?,?,?,?,?,?,?,?)",
        )
        .bind(room_id)
        .bind(&msg.sender.user_id)
        .bind(&msg.sender.name)
        .bind(msg.sender.role.as_str())
        .bind(&msg.sender.avatar)
        .bind(&msg.body)
        .bind(&format)
        .bind(msg.suppressed)
        .bind(created_at)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        Ok(Message {
            id,
            room_id: room_id.to_string(),
            sender: msg.sender,
            body: msg.body,
            format: msg.format,
            timestamp: ts_from_millis(created_at),
            reactions: BTreeMap::new(),
            suppressed: msg.suppressed,
        })
    }

    async fn recent(&self, room_id: &str, limit: usize) -> Result<Vec<Message>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows: Vec<MessageRow> = sqlx::query_as(
            "SELECT id, room_id, sender_id, sender_name, sender_role, sender_avatar,
                    body, format, suppressed, created_at
             FROM messages WHERE room_id = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(room_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut page = rows.into_iter().rev().map(decode).collect::<Result<Vec<_>, _>>()?;
        let Some(oldest) = page.first().map(|m| m.id) else { return Ok(page) };

        let reactions: Vec<(i64, String, String)> = sqlx::query_as(
            "SELECT r.message_id, r.emoji, r.user_id
             FROM reactions r JOIN messages m ON m.id = r.message_id
             WHERE m.room_id = ? AND m.id >= ?
             ORDER BY r.rowid",
        )
        .bind(room_id)
        .bind(oldest)
        .fetch_all(&self.pool)
        .await?;

        let mut by_id: HashMap<MessageId, &mut Message> = page.iter_mut().map(|m| (m.id, m)).collect();
        for (message_id, emoji, user_id) in reactions {
            if let Some(m) = by_id.get_mut(&message_id) {
                m.reactions.entry(emoji).or_default().push(user_id);
            }
        }
        Ok(page)
    }

    async fn react(
        &self,
        room_id: &str,
        message_id: MessageId,
        emoji: &str,
        user_id: &str,
        op: ReactionOp,
    ) -> Result<bool, StoreError> {
        let exists: Option<(i64,)> = sqlx::query_as("SELECT id FROM messages WHERE id = ? AND room_id = ?")
            .bind(message_id)
            .bind(room_id)
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_none() {
            return Err(StoreError::NotFound(message_id));
        }

        let res = match op {
            ReactionOp::Add => {
                sqlx::query(
                    "INSERT OR IGNORE INTO reactions (message_id, emoji, user_id, created_at) VALUES (?,?,?,?)",
                )
                .bind(message_id)
                .bind(emoji)
                .bind(user_id)
                .bind(Utc::now().timestamp_millis())
                .execute(&self.pool)
                .await?
            }
            ReactionOp::Remove => {
                sqlx::query("DELETE FROM reactions WHERE message_id = ? AND emoji = ? AND user_id = ?")
                    .bind(message_id)
                    .bind(emoji)
                    .bind(user_id)
                    .execute(&self.pool)
                    .await?
            }
        };
        Ok(res.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> SqliteStore {
        SqliteStore::connect("sqlite::memory:").await.unwrap()
    }

    fn draft(body: &str, role: Role) -> NewMessage {
        NewMessage {
            sender: Identity::new("dj1", "Selecta", role),
            body: body.into(),
            format: crate::format::derive(body),
            suppressed: false,
        }
    }

    #[tokio::test]
    async fn append_then_recent_returns_the_same_message() {
        let store = store().await;
        let saved = store.append("r1", draft("**drop** incoming", Role::Dj)).await.unwrap();
        let page = store.recent("r1", 10).await.unwrap();
        assert_eq!(page, vec![saved]);
    }

    #[tokio::test]
    async fn recent_is_oldest_first_and_limited() {
        let store = store().await;
        for body in ["a", "b", "c"] {
            store.append("r1", draft(body, Role::User)).await.unwrap();
        }
        store.append("other", draft("x", Role::User)).await.unwrap();
        let page = store.recent("r1", 2).await.unwrap();
        assert_eq!(page.iter().map(|m| m.body.as_str()).collect::<Vec<_>>(), ["b", "c"]);
        assert!(page[0].id < page[1].id);
    }

    #[tokio::test]
    async fn reactions_round_trip_through_history() {
        let store = store().await;
        let m = store.append("r1", draft("tune", Role::User)).await.unwrap();

        assert!(store.react("r1", m.id, "🔥", "u1", ReactionOp::Add).await.unwrap());
        assert!(!store.react("r1", m.id, "🔥", "u1", ReactionOp::Add).await.unwrap());
        assert!(store.react("r1", m.id, "🔥", "u2", ReactionOp::Add).await.unwrap());
        assert!(!store.react("r1", m.id, "🎉", "u1", ReactionOp::Remove).await.unwrap());

        let page = store.recent("r1", 1).await.unwrap();
        assert_eq!(page[0].reactions["🔥"], vec!["u1".to_string(), "u2".to_string()]);

        let missing = store.react("other", m.id, "🔥", "u1", ReactionOp::Add).await;
        assert_eq!(missing, Err(StoreError::NotFound(m.id)));
    }
}
