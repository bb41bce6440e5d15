//! Per-connection chat protocol.
//!
//! Room mutations happen under the room's mutex and never await; only store
//! calls suspend, and those run with the lock released. Every failure is
//! reported to the requesting connection alone.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::{sync::broadcast, time::{self, Instant}};
use tracing::{debug, error, info, warn};

use crate::{
    auth::{Identity, Role},
    config::Config,
    error::ChatError,
    fanout::Fanout,
    format::{self, FormatSpan},
    presence::recount,
    protocol::{ClientEvent, Message, MessageId, NewMessage, ServerEvent},
    room::{Member, Registry, RoomState, Typing},
    state::{ConnId, Connections, Outbox},
    store::{MessageStore, ReactionOp},
};

pub const MAX_ROOM_ID_LEN: usize = 256;
pub const MAX_EMOJI_CHARS: usize = 32;
const LIVE_CHANNEL_CAPACITY: usize = 64;

/// Published whenever a DJ goes live or stops; follower notification
/// subscribes to this.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveStatus {
    pub room_id: String,
    pub dj_id:   String,
    pub dj_name: String,
    pub is_live: bool,
    pub at:      DateTime<Utc>,
}

pub struct ChatCore {
    config:   Config,
    registry: Registry,
    conns:    Connections,
    fanout:   Fanout,
    store:    Arc<dyn MessageStore>,
    live_tx:  broadcast::Sender<LiveStatus>,
}

impl ChatCore {
    pub fn new(config: Config, store: Arc<dyn MessageStore>) -> Self {
        let registry = Registry::new();
        let conns = Connections::default();
        let fanout = Fanout::new(conns.clone(), registry.clone());
        let (live_tx, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
        Self { config, registry, conns, fanout, store, live_tx }
    }

    pub fn config(&self) -> &Config { &self.config }
    pub fn registry(&self) -> &Registry { &self.registry }
    pub fn connections(&self) -> &Connections { &self.conns }
    pub fn fanout(&self) -> &Fanout { &self.fanout }
    pub fn store(&self) -> &Arc<dyn MessageStore> { &self.store }

    pub fn subscribe_live(&self) -> broadcast::Receiver<LiveStatus> {
        self.live_tx.subscribe()
    }

    /* ---------------- connection lifecycle ---------------- */

    pub fn connect(&self, identity: Identity, outbox: Outbox) -> ConnId {
        let user = identity.user_id.clone();
        let conn = self.conns.insert(identity, outbox);
        info!(%conn, %user, "connection attached");
        conn
    }

    /// Same cleanup as leaving every joined room, then the connection is forgotten.
    pub async fn disconnect(&self, conn: &ConnId) {
        for room_id in self.conns.rooms_of(conn) {
            self.leave_room(conn, &room_id);
        }
        if let Some(h) = self.conns.remove(conn) {
            info!(%conn, user = %h.identity.user_id, "connection closed");
        }
    }

    /// Runs one client event; on failure the requester gets an `error` frame.
    pub async fn handle(&self, conn: &ConnId, ev: ClientEvent) -> Result<(), ChatError> {
        let room_id = ev.room_id().to_string();
        let client_ref = ev.client_ref().map(str::to_string);

        let res = self.dispatch(conn, ev).await;
        if let Err(e) = &res {
            debug!(%conn, room = %room_id, code = e.code(), error = %e, "event rejected");
            self.fanout.to_conn(conn, &ServerEvent::Error {
                code: e.code().to_string(),
                message: e.client_message(),
                room_id: Some(room_id),
                client_ref,
            });
        }
        res
    }

    async fn dispatch(&self, conn: &ConnId, ev: ClientEvent) -> Result<(), ChatError> {
        let room_id = ev.room_id();
        if room_id.is_empty() || room_id.len() > MAX_ROOM_ID_LEN {
            return Err(ChatError::InvalidMessage("bad room id".into()));
        }
        match ev {
            ClientEvent::JoinRoom { room_id, live_session } => {
                self.join_room(conn, &room_id, live_session).await
            }
            ClientEvent::LeaveRoom { room_id } => {
                self.identity(conn)?;
                self.leave_room(conn, &room_id);
                Ok(())
            }
            ClientEvent::SendMessage { room_id, body, format, client_ref } => {
                self.send_message(conn, &room_id, &body, format, client_ref).await.map(|_| ())
            }
            ClientEvent::AddReaction { room_id, message_id, emoji } => {
                self.react(conn, &room_id, message_id, &emoji, ReactionOp::Add).await
            }
            ClientEvent::RemoveReaction { room_id, message_id, emoji } => {
                self.react(conn, &room_id, message_id, &emoji, ReactionOp::Remove).await
            }
            ClientEvent::TypingStart { room_id } => self.typing(conn, &room_id, true),
            ClientEvent::TypingEnd { room_id } => self.typing(conn, &room_id, false),
            ClientEvent::MuteUser { room_id, user_id } => self.set_mute(conn, &room_id, &user_id, true),
            ClientEvent::UnmuteUser { room_id, user_id } => self.set_mute(conn, &room_id, &user_id, false),
            ClientEvent::DjLive { room_id, is_live } => self.dj_live(conn, &room_id, is_live),
        }
    }

    fn identity(&self, conn: &ConnId) -> Result<Identity, ChatError> {
        self.conns.identity(conn).ok_or(ChatError::NotAuthenticated)
    }

    /* ---------------- membership ---------------- */

    pub async fn join_room(&self, conn: &ConnId, room_id: &str, live_session: bool) -> Result<(), ChatError> {
        let who = self.identity(conn)?;

        let (count, go_live) = loop {
            let room = self.registry.get_or_create(room_id);
            let mut st = room.lock();
            if st.is_closed() {
                // lost a race with removal of the vacant room
                continue;
            }

            if st.is_joined(conn) {
                debug!(%conn, room = room_id, "duplicate join, resyncing");
                self.fanout.to_conn(conn, &online_users(room_id, &st));
                break (st.count, false);
            }

            let already_present = st.has_user(&who.user_id);
            let member = Member::from_identity(&who);
            st.conns.insert(conn.clone(), member.clone());
            if who.role == Role::Dj {
                st.moderators.insert(conn.clone());
            }
            self.conns.mark_joined(conn, room_id);
            let changed = recount(&mut st, room_id, &self.conns.read());

            if already_present {
                self.fanout.to_conn(conn, &online_users(room_id, &st));
            } else {
                self.fanout.to_room(&st, &online_users(room_id, &st));
                self.fanout.to_room_except(&st, &ServerEvent::UserJoined {
                    user: member,
                    room_id: room_id.to_string(),
                    timestamp: Utc::now(),
                }, conn);
            }
            if let Some(count) = changed {
                self.fanout.to_room(&st, &user_count(room_id, count));
            }

            let go_live = who.role == Role::Dj && (live_session || st.live);
            if go_live {
                st.live = true;
            }
            info!(%conn, room = room_id, user = %who.user_id, count = st.count, "joined room");
            break (st.count, go_live);
        };

        let recent_messages = self.recent_page(room_id).await;
        self.fanout.to_conn(conn, &ServerEvent::RoomJoined {
            room_id: room_id.to_string(),
            member_count: count,
            you: who.clone(),
            recent_messages,
        });

        if go_live {
            self.announce_live(&who, room_id, true);
        }
        Ok(())
    }

    /// History for a join reply. A slow or failing store must not block the join.
    async fn recent_page(&self, room_id: &str) -> Vec<Message> {
        match time::timeout(self.config.send_timeout, self.store.recent(room_id, self.config.history_limit)).await {
            Ok(Ok(page)) => page,
            Ok(Err(e)) => {
                warn!(room = room_id, error = %e, "history fetch failed");
                Vec::new()
            }
            Err(_) => {
                warn!(room = room_id, "history fetch timed out");
                Vec::new()
            }
        }
    }

    /// Idempotent: leaving a room you are not in does nothing.
    pub fn leave_room(&self, conn: &ConnId, room_id: &str) {
        let Some(room) = self.registry.get(room_id) else {
            self.conns.mark_left(conn, room_id);
            return;
        };

        let vacant = {
            let mut st = room.lock();
            self.conns.mark_left(conn, room_id);
            let was_typing = st.typing.contains_key(conn);
            let Some(member) = st.drop_conn(conn) else { return };
            let changed = recount(&mut st, room_id, &self.conns.read());

            if !st.has_user(&member.user_id) {
                self.fanout.to_room(&st, &ServerEvent::UserLeft {
                    user_id: member.user_id.clone(),
                    user_name: member.name.clone(),
                    room_id: room_id.to_string(),
                    timestamp: Utc::now(),
                });
                self.fanout.to_room(&st, &online_users(room_id, &st));
            }
            if let Some(count) = changed {
                self.fanout.to_room(&st, &user_count(room_id, count));
            }
            let expired = st.expire_typing(Instant::now(), self.config.typing_idle);
            if was_typing || expired {
                self.fanout.to_room(&st, &typing_update(room_id, &st));
            }
            info!(%conn, room = room_id, user = %member.user_id, count = st.count, "left room");
            st.is_vacant()
        };

        if vacant {
            self.registry.remove(room_id);
        }
    }

    /* ---------------- messages ---------------- */

    /// Persist first, then broadcast the stored copy to everyone in the room,
    /// sender included.
    pub async fn send_message(
        &self,
        conn: &ConnId,
        room_id: &str,
        body: &str,
        spans: Option<Vec<FormatSpan>>,
        client_ref: Option<String>,
    ) -> Result<Message, ChatError> {
        let who = self.identity(conn)?;

        if body.trim().is_empty() {
            return Err(ChatError::InvalidMessage("message body is empty".into()));
        }
        if body.chars().count() > self.config.max_message_chars {
            return Err(ChatError::InvalidMessage(format!(
                "message longer than {} characters", self.config.max_message_chars
            )));
        }
        let spans = match spans {
            Some(spans) => {
                format::validate(&spans, body).map_err(ChatError::InvalidMessage)?;
                spans
            }
            None => format::derive(body),
        };

        let suppressed = {
            let room = self.registry.get(room_id).ok_or_else(|| not_in_room(room_id))?;
            let mut st = room.lock();
            if !st.is_joined(conn) {
                return Err(not_in_room(room_id));
            }
            if st.typing.remove(conn).is_some() {
                st.expire_typing(Instant::now(), self.config.typing_idle);
                self.fanout.to_room_except(&st, &typing_update(room_id, &st), conn);
            }
            st.muted.contains(&who.user_id)
        };

        let draft = NewMessage { sender: who, body: body.to_string(), format: spans, suppressed };
        let saved = match time::timeout(self.config.send_timeout, self.store.append(room_id, draft)).await {
            Ok(Ok(saved)) => saved,
            Ok(Err(e)) => {
                error!(%conn, room = room_id, error = %e, "message append failed");
                return Err(ChatError::from(e));
            }
            Err(_) => {
                warn!(%conn, room = room_id, "message append timed out");
                return Err(ChatError::SendFailed(
                    "timed out waiting for storage; the message may still be delivered".into(),
                ));
            }
        };

        let ev = ServerEvent::NewMessage { message: saved.clone() };
        match self.registry.get(room_id) {
            Some(room) => {
                let st = room.lock();
                self.fanout.to_room(&st, &ev);
                if !st.is_joined(conn) {
                    self.fanout.to_conn(conn, &ev);
                }
            }
            None => {
                self.fanout.to_conn(conn, &ev);
            }
        }
        self.fanout.to_conn(conn, &ServerEvent::MessageAck {
            room_id: room_id.to_string(),
            client_ref,
            message_id: saved.id,
            timestamp: saved.timestamp,
        });
        debug!(%conn, room = room_id, id = saved.id, suppressed = saved.suppressed, "message sent");
        Ok(saved)
    }

    pub async fn react(
        &self,
        conn: &ConnId,
        room_id: &str,
        message_id: MessageId,
        emoji: &str,
        op: ReactionOp,
    ) -> Result<(), ChatError> {
        let who = self.identity(conn)?;
        let emoji = emoji.trim();
        let n = emoji.chars().count();
        if n == 0 || n > MAX_EMOJI_CHARS {
            return Err(ChatError::InvalidMessage("bad emoji".into()));
        }
        self.require_joined(conn, room_id)?;

        let changed = time::timeout(
            self.config.send_timeout,
            self.store.react(room_id, message_id, emoji, &who.user_id, op),
        )
        .await
        .map_err(|_| ChatError::SendFailed("timed out waiting for storage".into()))??;

        // a no-op change is not worth a frame
        if changed {
            let (room_id, emoji, user_id) = (room_id.to_string(), emoji.to_string(), who.user_id);
            let ev = match op {
                ReactionOp::Add => ServerEvent::ReactionAdded { room_id: room_id.clone(), message_id, emoji, user_id },
                ReactionOp::Remove => ServerEvent::ReactionRemoved { room_id: room_id.clone(), message_id, emoji, user_id },
            };
            self.fanout.to_room_id(&room_id, &ev);
        }
        Ok(())
    }

    /* ---------------- typing / moderation / live ---------------- */

    pub fn typing(&self, conn: &ConnId, room_id: &str, active: bool) -> Result<(), ChatError> {
        let who = self.identity(conn)?;
        let room = self.registry.get(room_id).ok_or_else(|| not_in_room(room_id))?;
        let mut st = room.lock();
        if !st.is_joined(conn) {
            return Err(not_in_room(room_id));
        }

        let now = Instant::now();
        let expired = st.expire_typing(now, self.config.typing_idle);
        let changed = if active {
            let entry = Typing { user_id: who.user_id, display_name: who.name, last_seen: now };
            // a refresh only pushes the expiry out
            st.typing.insert(conn.clone(), entry).is_none()
        } else {
            st.typing.remove(conn).is_some()
        };
        if changed || expired {
            self.fanout.to_room_except(&st, &typing_update(room_id, &st), conn);
        }
        Ok(())
    }

    pub fn set_mute(&self, conn: &ConnId, room_id: &str, target: &str, mute: bool) -> Result<(), ChatError> {
        let who = self.identity(conn)?;
        let room = self.registry.get(room_id).ok_or_else(|| not_in_room(room_id))?;
        let mut st = room.lock();
        if !st.is_joined(conn) {
            return Err(not_in_room(room_id));
        }
        if !st.moderators.contains(conn) {
            return Err(ChatError::Unauthorized("only the room's DJ can mute".into()));
        }
        if target.is_empty() {
            return Err(ChatError::InvalidMessage("no user to mute".into()));
        }

        let changed = if mute { st.muted.insert(target.to_string()) } else { st.muted.remove(target) };
        if changed {
            info!(room = room_id, dj = %who.user_id, muted_user = target, mute, "mute set changed");
            self.fanout.to_room(&st, &ServerEvent::MuteUpdate {
                room_id: room_id.to_string(),
                user_id: target.to_string(),
                muted: mute,
            });
        }
        Ok(())
    }

    pub fn dj_live(&self, conn: &ConnId, room_id: &str, is_live: bool) -> Result<(), ChatError> {
        let who = self.identity(conn)?;
        if who.role != Role::Dj {
            return Err(ChatError::Unauthorized("only DJs can change live status".into()));
        }
        {
            let room = self.registry.get(room_id).ok_or_else(|| not_in_room(room_id))?;
            let mut st = room.lock();
            if !st.is_joined(conn) {
                return Err(not_in_room(room_id));
            }
            st.live = is_live;
        }
        self.announce_live(&who, room_id, is_live);
        Ok(())
    }

    fn announce_live(&self, dj: &Identity, room_id: &str, is_live: bool) {
        let at = Utc::now();
        let ev = ServerEvent::DjStatusUpdate {
            dj_id: dj.user_id.clone(),
            dj_name: dj.name.clone(),
            room_id: room_id.to_string(),
            is_live,
            timestamp: at,
        };
        // global delivery already covers the room
        if self.config.live_status_global {
            self.fanout.to_all(&ev);
        } else {
            self.fanout.to_room_id(room_id, &ev);
        }
        let _ = self.live_tx.send(LiveStatus {
            room_id: room_id.to_string(),
            dj_id: dj.user_id.clone(),
            dj_name: dj.name.clone(),
            is_live,
            at,
        });
        info!(room = room_id, dj = %dj.user_id, is_live, "live status changed");
    }

    fn require_joined(&self, conn: &ConnId, room_id: &str) -> Result<(), ChatError> {
        let joined = self.registry.get(room_id).is_some_and(|room| room.lock().is_joined(conn));
        if joined { Ok(()) } else { Err(not_in_room(room_id)) }
    }
}

fn not_in_room(room_id: &str) -> ChatError {
    ChatError::NotInRoom(room_id.to_string())
}

pub(crate) fn user_count(room_id: &str, count: usize) -> ServerEvent {
    ServerEvent::UserCount { room_id: room_id.to_string(), count }
}

pub(crate) fn online_users(room_id: &str, st: &RoomState) -> ServerEvent {
    ServerEvent::OnlineUsers { room_id: room_id.to_string(), users: st.online_users() }
}

pub(crate) fn typing_update(room_id: &str, st: &RoomState) -> ServerEvent {
    ServerEvent::TypingUpdate { room_id: room_id.to_string(), users: st.typing_users() }
}
