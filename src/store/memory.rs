use std::collections::{BTreeMap, HashMap, VecDeque};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use super::{apply_reaction, MessageStore, ReactionOp, StoreError};
use crate::protocol::{Message, MessageId, NewMessage};

/// Per-room ring buffer. Ids are process-wide and strictly increasing; the
/// oldest message in a full room is dropped on append.
pub struct MemoryStore {
    capacity: usize,
    inner:    Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    last_id: MessageId,
    rooms:   HashMap<String, VecDeque<Message>>,
}

impl MemoryStore {
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), inner: Mutex::default() }
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn append(&self, room_id: &str, msg: NewMessage) -> Result<Message, StoreError> {
        let mut inner = self.inner.lock();
        inner.last_id += 1;
        let saved = Message {
            id:         inner.last_id,
            room_id:    room_id.to_string(),
            sender:     msg.sender,
            body:       msg.body,
            format:     msg.format,
            timestamp:  Utc::now(),
            reactions:  BTreeMap::new(),
            suppressed: msg.suppressed,
        };
        let ring = inner.rooms.entry(room_id.to_string()).or_default();
        ring.push_back(saved.clone());
        while ring.len() > self.capacity {
            ring.pop_front();
        }
        Ok(saved)
    }

    async fn recent(&self, room_id: &str, limit: usize) -> Result<Vec<Message>, StoreError> {
        let inner = self.inner.lock();
        let Some(ring) = inner.rooms.get(room_id) else { return Ok(Vec::new()) };
        let skip = ring.len().saturating_sub(limit);
        Ok(ring.iter().skip(skip).cloned().collect())
    }

    async fn react(
        &self,
        room_id: &str,
        message_id: MessageId,
        emoji: &str,
        user_id: &str,
        op: ReactionOp,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        let msg = inner
            .rooms
            .get_mut(room_id)
            .and_then(|ring| ring.iter_mut().find(|m| m.id == message_id))
            .ok_or(StoreError::NotFound(message_id))?;
        Ok(apply_reaction(&mut msg.reactions, emoji, user_id, op))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Identity, Role};

    fn draft(body: &str) -> NewMessage {
        NewMessage {
            sender: Identity::new("a", "A", Role::User),
            body: body.into(),
            format: Vec::new(),
            suppressed: false,
        }
    }

    #[tokio::test]
    async fn ids_increase_across_rooms() {
        let store = MemoryStore::new(10);
        let a = store.append("r1", draft("one")).await.unwrap();
        let b = store.append("r2", draft("two")).await.unwrap();
        let c = store.append("r1", draft("three")).await.unwrap();
        assert!(a.id < b.id && b.id < c.id);

        let recent = store.recent("r1", 10).await.unwrap();
        assert_eq!(recent.iter().map(|m| m.body.as_str()).collect::<Vec<_>>(), ["one", "three"]);
    }

    #[tokio::test]
    async fn ring_keeps_the_newest_page() {
        let store = MemoryStore::new(3);
        for i in 0..5 {
            store.append("r1", draft(&i.to_string())).await.unwrap();
        }
        let recent = store.recent("r1", 2).await.unwrap();
        assert_eq!(recent.iter().map(|m| m.body.as_str()).collect::<Vec<_>>(), ["3", "4"]);
        assert_eq!(store.recent("r1", 50).await.unwrap().len(), 3);
        assert!(store.recent("empty", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reacting_to_an_evicted_message_is_not_found() {
        let store = MemoryStore::new(1);
        let first = store.append("r1", draft("old")).await.unwrap();
        store.append("r1", draft("new")).await.unwrap();
        let res = store.react("r1", first.id, "🔥", "a", ReactionOp::Add).await;
        assert_eq!(res, Err(StoreError::NotFound(first.id)));
    }
}
