use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};
use parking_lot::{RwLock, RwLockReadGuard};
use tokio::sync::mpsc;

use crate::{auth::{Authenticator, Identity}, session::ChatCore};

pub type ConnId = String;
/// Pre-serialized JSON frames waiting for the socket writer.
pub type Outbox = mpsc::UnboundedSender<String>;

/* ------------ live connections (transport truth) ------------ */
pub struct ConnHandle {
    pub identity: Identity,
    pub outbox:   Outbox,
    pub rooms:    HashSet<String>,
}

#[derive(Clone, Default)]
pub struct Connections {
    inner: Arc<RwLock<HashMap<ConnId, ConnHandle>>>,
}

impl Connections {
    pub fn insert(&self, identity: Identity, outbox: Outbox) -> ConnId {
        let id = uuid::Uuid::new_v4().to_string();
        self.inner.write().insert(id.clone(), ConnHandle { identity, outbox, rooms: HashSet::new() });
        id
    }

    pub fn remove(&self, conn: &ConnId) -> Option<ConnHandle> {
        self.inner.write().remove(conn)
    }

    pub fn identity(&self, conn: &ConnId) -> Option<Identity> {
        self.inner.read().get(conn).map(|h| h.identity.clone())
    }

    pub fn rooms_of(&self, conn: &ConnId) -> Vec<String> {
        self.inner.read().get(conn).map(|h| h.rooms.iter().cloned().collect()).unwrap_or_default()
    }

    pub fn mark_joined(&self, conn: &ConnId, room_id: &str) {
        if let Some(h) = self.inner.write().get_mut(conn) {
            h.rooms.insert(room_id.to_string());
        }
    }

    pub fn mark_left(&self, conn: &ConnId, room_id: &str) {
        if let Some(h) = self.inner.write().get_mut(conn) {
            h.rooms.remove(room_id);
        }
    }

    /// Queues a frame; false when the connection is gone or its writer closed.
    pub fn send(&self, conn: &ConnId, frame: &str) -> bool {
        self.inner
            .read()
            .get(conn)
            .map(|h| h.outbox.send(frame.to_string()).is_ok())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn read(&self) -> RwLockReadGuard<'_, HashMap<ConnId, ConnHandle>> {
        self.inner.read()
    }
}

/* ------------ what the HTTP layer shares ------------ */
#[derive(Clone)]
pub struct AppState {
    pub core:    Arc<ChatCore>,
    pub auth:    Authenticator,
    pub started: Instant,
    warmed:      Arc<AtomicBool>,
}

impl AppState {
    pub fn new(core: Arc<ChatCore>, auth: Authenticator) -> Self {
        Self { core, auth, started: Instant::now(), warmed: Arc::default() }
    }

    pub fn mark_warm(&self) {
        self.warmed.store(true, Ordering::Release);
    }

    pub fn is_warm(&self) -> bool {
        self.warmed.load(Ordering::Acquire)
    }
}
