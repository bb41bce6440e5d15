//! In-memory room registry.
//!
//! Each room sits behind its own `parking_lot::Mutex`; nothing awaits while
//! holding it. Lock order is registry map, then room, then the connection
//! table.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::{
    auth::{Identity, Role},
    protocol::TypingUser,
    state::ConnId,
};

/// One joined connection as seen by the room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub user_id:   String,
    pub name:      String,
    pub role:      Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar:    Option<String>,
    pub joined_at: DateTime<Utc>,
}

impl Member {
    pub fn from_identity(who: &Identity) -> Self {
        Self {
            user_id:   who.user_id.clone(),
            name:      who.name.clone(),
            role:      who.role,
            avatar:    who.avatar.clone(),
            joined_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Typing {
    pub user_id:      String,
    pub display_name: String,
    pub last_seen:    Instant,
}

#[derive(Debug, Default)]
pub struct RoomState {
    /// joined connections
    pub conns:      HashMap<ConnId, Member>,
    pub typing:     HashMap<ConnId, Typing>,
    pub muted:      HashSet<String>,
    pub moderators: HashSet<ConnId>,
    /// last count pushed to clients
    pub count:      usize,
    pub live:       bool,
    closed:         bool,
}

impl RoomState {
    pub fn is_joined(&self, conn: &ConnId) -> bool {
        self.conns.contains_key(conn)
    }

    pub fn has_user(&self, user_id: &str) -> bool {
        self.conns.values().any(|m| m.user_id == user_id)
    }

    pub fn distinct_users(&self) -> usize {
        self.conns.values().map(|m| m.user_id.as_str()).collect::<HashSet<_>>().len()
    }

    /// One entry per user; the earliest connection's record wins.
    pub fn online_users(&self) -> Vec<Member> {
        let mut by_user: HashMap<&str, &Member> = HashMap::new();
        for m in self.conns.values() {
            by_user
                .entry(m.user_id.as_str())
                .and_modify(|cur| if m.joined_at < cur.joined_at { *cur = m })
                .or_insert(m);
        }
        let mut users: Vec<Member> = by_user.into_values().cloned().collect();
        users.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then_with(|| a.user_id.cmp(&b.user_id)));
        users
    }

    /// Current typists, deduplicated by user, in a stable order.
    pub fn typing_users(&self) -> Vec<TypingUser> {
        let mut seen = HashSet::new();
        let mut users: Vec<TypingUser> = self
            .typing
            .values()
            .filter(|t| seen.insert(t.user_id.as_str()))
            .map(|t| TypingUser { user_id: t.user_id.clone(), name: t.display_name.clone() })
            .collect();
        users.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        users
    }

    /// Drops typing entries idle for longer than `idle`. Returns whether any went.
    pub fn expire_typing(&mut self, now: Instant, idle: std::time::Duration) -> bool {
        let before = self.typing.len();
        self.typing.retain(|_, t| now.duration_since(t.last_seen) < idle);
        self.typing.len() != before
    }

    /// Forgets a connection entirely. Returns the member record it had.
    pub fn drop_conn(&mut self, conn: &ConnId) -> Option<Member> {
        self.typing.remove(conn);
        self.moderators.remove(conn);
        self.conns.remove(conn)
    }

    pub fn is_vacant(&self) -> bool {
        self.conns.is_empty()
    }

    /// Set once the registry has dropped this room; callers must re-fetch.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

pub type RoomRef = Arc<Mutex<RoomState>>;

#[derive(Clone, Default)]
pub struct Registry {
    rooms: Arc<RwLock<HashMap<String, RoomRef>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, room_id: &str) -> RoomRef {
        if let Some(room) = self.rooms.read().get(room_id) {
            return room.clone();
        }
        self.rooms
            .write()
            .entry(room_id.to_string())
            .or_insert_with(|| {
                tracing::debug!(room = room_id, "room created");
                RoomRef::default()
            })
            .clone()
    }

    pub fn get(&self, room_id: &str) -> Option<RoomRef> {
        self.rooms.read().get(room_id).cloned()
    }

    /// Removes a room only if nobody is joined. Idempotent.
    pub fn remove(&self, room_id: &str) -> bool {
        let mut rooms = self.rooms.write();
        let vacant = match rooms.get(room_id) {
            Some(room) => {
                let mut st = room.lock();
                if st.is_vacant() {
                    st.closed = true;
                }
                st.closed
            }
            None => return false,
        };
        if vacant {
            rooms.remove(room_id);
            tracing::debug!(room = room_id, "room removed");
        }
        vacant
    }

    pub fn room_ids(&self) -> Vec<String> {
        self.rooms.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.rooms.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn member(uid: &str) -> Member {
        Member::from_identity(&Identity::new(uid, uid.to_uppercase(), Role::User))
    }

    #[test]
    fn get_or_create_returns_the_same_room() {
        let reg = Registry::new();
        let a = reg.get_or_create("r1");
        let b = reg.get_or_create("r1");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn remove_is_a_noop_while_members_remain() {
        let reg = Registry::new();
        let room = reg.get_or_create("r1");
        room.lock().conns.insert("c1".into(), member("a"));

        assert!(!reg.remove("r1"));
        assert!(reg.get("r1").is_some());

        room.lock().drop_conn(&"c1".to_string());
        assert!(reg.remove("r1"));
        assert!(room.lock().is_closed());
        assert!(!reg.remove("r1"));
        assert!(reg.is_empty());
    }

    #[test]
    fn users_are_counted_once_across_connections() {
        let mut st = RoomState::default();
        st.conns.insert("c1".into(), member("a"));
        st.conns.insert("c2".into(), member("a"));
        st.conns.insert("c3".into(), member("b"));
        assert_eq!(st.distinct_users(), 2);
        assert_eq!(st.online_users().len(), 2);
        assert!(st.has_user("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn typing_entries_expire_after_idle_window() {
        let mut st = RoomState::default();
        st.typing.insert(
            "c1".into(),
            Typing { user_id: "a".into(), display_name: "A".into(), last_seen: Instant::now() },
        );
        assert!(!st.expire_typing(Instant::now(), Duration::from_secs(4)));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(st.expire_typing(Instant::now(), Duration::from_secs(4)));
        assert!(st.typing_users().is_empty());
    }
}
