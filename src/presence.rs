//! Presence reconciliation.
//!
//! The connection table is the source of truth for who is in a room. Joins
//! and leaves recount under the room lock; the periodic pass below rebuilds
//! each room's roster from the table to heal drift left by connections that
//! vanished without a clean leave.

use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use tokio::time::{self, Instant};
use tracing::{debug, warn};

use crate::{
    auth::Role,
    fanout::Fanout,
    room::{Member, Registry, RoomState},
    session::{online_users, typing_update, user_count, ChatCore},
    state::{ConnHandle, ConnId, Connections},
};

/// Corrections at least this large are logged as warnings.
pub const DRIFT_WARN: usize = 3;

/// Distinct users among the room's connections that the live table agrees are
/// joined. Stores the result; returns it only if it changed.
pub(crate) fn recount(
    st: &mut RoomState,
    room_id: &str,
    live: &HashMap<ConnId, ConnHandle>,
) -> Option<usize> {
    let count = st
        .conns
        .iter()
        .filter(|(id, _)| live.get(*id).is_some_and(|h| h.rooms.contains(room_id)))
        .map(|(_, m)| m.user_id.as_str())
        .collect::<HashSet<_>>()
        .len();
    if count == st.count {
        return None;
    }
    st.count = count;
    Some(count)
}

#[derive(Clone)]
pub struct Reconciler {
    registry: Registry,
    conns:    Connections,
    fanout:   Fanout,
}

impl Reconciler {
    pub fn new(core: &ChatCore) -> Self {
        Self {
            registry: core.registry().clone(),
            conns:    core.connections().clone(),
            fanout:   core.fanout().clone(),
        }
    }

    /// One full pass. Returns how many rooms had their count corrected.
    pub fn reconcile_once(&self) -> usize {
        let mut ids: HashSet<String> = self.registry.room_ids().into_iter().collect();
        ids.extend(self.conns.read().values().flat_map(|h| h.rooms.iter().cloned()));
        ids.iter().filter(|id| self.reconcile_room(id).is_some()).count()
    }

    pub fn reconcile_room(&self, room_id: &str) -> Option<usize> {
        let room = self.registry.get_or_create(room_id);
        let (changed, vacant) = {
            let mut st = room.lock();
            if st.is_closed() {
                return None;
            }
            let before = st.count;
            let (roster_changed, changed) = {
                let live = self.conns.read();
                let roster_changed = rebuild_roster(&mut st, room_id, &live);
                (roster_changed, recount(&mut st, room_id, &live))
            };

            match changed {
                Some(count) => {
                    let drift = before.abs_diff(count);
                    if drift >= DRIFT_WARN {
                        warn!(room = room_id, before, after = count, "member count drifted");
                    } else {
                        debug!(room = room_id, before, after = count, "member count corrected");
                    }
                    self.fanout.to_room(&st, &user_count(room_id, count));
                    self.fanout.to_room(&st, &online_users(room_id, &st));
                }
                None if roster_changed => {
                    self.fanout.to_room(&st, &online_users(room_id, &st));
                }
                None => {}
            }
            (changed, st.is_vacant())
        };

        if vacant {
            self.registry.remove(room_id);
        }
        changed
    }

    /// Drops idle typing entries everywhere. Returns the number of rooms touched.
    pub fn sweep_typing(&self, idle: Duration) -> usize {
        let now = Instant::now();
        let mut touched = 0;
        for id in self.registry.room_ids() {
            let Some(room) = self.registry.get(&id) else { continue };
            let mut st = room.lock();
            if st.expire_typing(now, idle) {
                self.fanout.to_room(&st, &typing_update(&id, &st));
                touched += 1;
            }
        }
        touched
    }
}

/// Makes the room's connection map agree with the live table.
fn rebuild_roster(st: &mut RoomState, room_id: &str, live: &HashMap<ConnId, ConnHandle>) -> bool {
    let ghosts: Vec<ConnId> = st
        .conns
        .keys()
        .filter(|id| !live.get(*id).is_some_and(|h| h.rooms.contains(room_id)))
        .cloned()
        .collect();
    let mut changed = !ghosts.is_empty();
    for id in ghosts {
        st.drop_conn(&id);
        debug!(conn = %id, room = room_id, "dropped ghost connection");
    }

    for (id, h) in live.iter().filter(|(_, h)| h.rooms.contains(room_id)) {
        if st.conns.contains_key(id) {
            continue;
        }
        st.conns.insert(id.clone(), Member::from_identity(&h.identity));
        if h.identity.role == Role::Dj {
            st.moderators.insert(id.clone());
        }
        changed = true;
        debug!(conn = %id, room = room_id, "restored missing connection");
    }
    changed
}

pub async fn task(rec: Reconciler, every: Duration) {
    let mut tick = time::interval(every);
    tick.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        let fixed = rec.reconcile_once();
        if fixed > 0 {
            debug!(rooms = fixed, "presence reconciled");
        }
    }
}

pub async fn typing_task(rec: Reconciler, idle: Duration) {
    let mut tick = time::interval((idle / 2).max(Duration::from_millis(250)));
    loop {
        tick.tick().await;
        rec.sweep_typing(idle);
    }
}
