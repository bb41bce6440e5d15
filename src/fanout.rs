//! Room-scoped event delivery.
//!
//! Each event is serialized once and pushed onto the outbox of every joined
//! connection. Delivery is fire-and-forget; a closed outbox just means the
//! connection is on its way out. Callers that already hold a room lock use the
//! `&RoomState` variants so per-room FIFO order follows mutation order.

use crate::{
    protocol::ServerEvent,
    room::{Registry, RoomState},
    state::{ConnId, Connections},
};

#[derive(Clone)]
pub struct Fanout {
    conns:    Connections,
    registry: Registry,
}

impl Fanout {
    pub fn new(conns: Connections, registry: Registry) -> Self {
        Self { conns, registry }
    }

    fn encode(ev: &ServerEvent) -> Option<String> {
        serde_json::to_string(ev)
            .map_err(|e| tracing::error!(error = %e, "failed to encode server event"))
            .ok()
    }

    pub fn to_conn(&self, conn: &ConnId, ev: &ServerEvent) -> bool {
        Self::encode(ev).map(|frame| self.conns.send(conn, &frame)).unwrap_or(false)
    }

    pub fn to_room(&self, room: &RoomState, ev: &ServerEvent) -> usize {
        self.deliver(room, ev, None)
    }

    pub fn to_room_except(&self, room: &RoomState, ev: &ServerEvent, except: &ConnId) -> usize {
        self.deliver(room, ev, Some(except))
    }

    /// Looks the room up and delivers under its lock. Unknown room: nobody to tell.
    pub fn to_room_id(&self, room_id: &str, ev: &ServerEvent) -> usize {
        match self.registry.get(room_id) {
            Some(room) => self.to_room(&room.lock(), ev),
            None => 0,
        }
    }

    /// Every live connection, joined anywhere or not.
    pub fn to_all(&self, ev: &ServerEvent) -> usize {
        let Some(frame) = Self::encode(ev) else { return 0 };
        let conns = self.conns.read();
        conns.values().filter(|h| h.outbox.send(frame.clone()).is_ok()).count()
    }

    fn deliver(&self, room: &RoomState, ev: &ServerEvent, except: Option<&ConnId>) -> usize {
        let Some(frame) = Self::encode(ev) else { return 0 };
        let conns = self.conns.read();
        room.conns
            .keys()
            .filter(|id| Some(*id) != except)
            .filter_map(|id| conns.get(id))
            .filter(|h| h.outbox.send(frame.clone()).is_ok())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Identity, Role};
    use crate::room::Member;
    use tokio::sync::mpsc;

    #[test]
    fn except_variant_skips_the_sender() {
        let conns = Connections::default();
        let registry = Registry::new();
        let fanout = Fanout::new(conns.clone(), registry.clone());

        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = conns.insert(Identity::new("a", "A", Role::User), tx_a);
        let b = conns.insert(Identity::new("b", "B", Role::User), tx_b);

        let room = registry.get_or_create("r1");
        {
            let mut st = room.lock();
            for (id, uid) in [(&a, "a"), (&b, "b")] {
                st.conns.insert(id.clone(), Member::from_identity(&Identity::new(uid, uid, Role::User)));
            }
        }

        let ev = ServerEvent::UserCount { room_id: "r1".into(), count: 2 };
        assert_eq!(fanout.to_room_except(&room.lock(), &ev, &a), 1);
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().unwrap().contains("\"user_count\""));

        assert_eq!(fanout.to_room_id("r1", &ev), 2);
        assert_eq!(fanout.to_room_id("nope", &ev), 0);
        assert!(rx_a.try_recv().is_ok());
    }
}
