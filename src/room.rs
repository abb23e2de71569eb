//! Collaboration rooms ("jams").
//!
//! A room is a persistent space with a fixed participant list and a shared
//! two-panel view over a pool of sessions. The broker keeps one actor task
//! per live room; joins, leaves, client messages, and registry events all
//! flow through that actor's queue, so every participant observes room
//! events in the same order.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::Response,
};
use dashmap::DashMap;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::{session_cookie, RoomUser};
use crate::peer::{reject, PeerSender};
use crate::protocol::{
    PanelSelection, PanelSide, ParticipantInfo, PoolSessionInfo, RoomClientMessage,
    RoomServerMessage,
};
use crate::registry::{CloseReason, SessionEvent, SessionRegistry};
use crate::server::AppState;
use crate::storage::{PoolEntry, RoomRecord, SharedStorage};

/// Name of the ambient session cookie carrying the user token.
pub const SESSION_COOKIE: &str = "session";

enum RoomCommand {
    Join {
        conn_id: Uuid,
        user: RoomUser,
        sender: PeerSender,
    },
    Leave {
        conn_id: Uuid,
    },
    Client {
        conn_id: Uuid,
        message: RoomClientMessage,
    },
    Registry(SessionEvent),
}

pub struct RoomBroker {
    rooms: DashMap<String, mpsc::UnboundedSender<RoomCommand>>,
    storage: SharedStorage,
    registry: Arc<SessionRegistry>,
}

impl RoomBroker {
    pub fn new(storage: SharedStorage, registry: Arc<SessionRegistry>) -> Arc<Self> {
        Arc::new(Self {
            rooms: DashMap::new(),
            storage,
            registry,
        })
    }

    /// Relay registry events into every live room; each actor decides
    /// whether its room cares.
    pub fn spawn_event_pump(self: &Arc<Self>) {
        let broker = Arc::clone(self);
        tokio::spawn(async move {
            let mut events = broker.registry.subscribe();
            loop {
                match events.recv().await {
                    Ok(event) => {
                        for room in broker.rooms.iter() {
                            let _ = room.value().send(RoomCommand::Registry(event.clone()));
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "room event pump lagged behind the registry bus");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    pub fn connect(&self, room: RoomRecord, user: RoomUser, sender: PeerSender) -> Uuid {
        let conn_id = Uuid::new_v4();
        let tx = self
            .rooms
            .entry(room.room_id.clone())
            .or_insert_with(|| {
                spawn_room_actor(room, self.storage.clone(), self.registry.clone())
            })
            .clone();
        let _ = tx.send(RoomCommand::Join {
            conn_id,
            user,
            sender,
        });
        conn_id
    }

    pub fn disconnect(&self, room_id: &str, conn_id: Uuid) {
        if let Some(tx) = self.rooms.get(room_id) {
            let _ = tx.send(RoomCommand::Leave { conn_id });
        }
    }

    pub fn client_message(&self, room_id: &str, conn_id: Uuid, message: RoomClientMessage) {
        if let Some(tx) = self.rooms.get(room_id) {
            let _ = tx.send(RoomCommand::Client { conn_id, message });
        }
    }
}

// ----------------------------------------------------------------------
// Access rules
// ----------------------------------------------------------------------

/// With two or more distinct users connected, the owner drives the left
/// panel and everyone else the right one. A lone user drives both.
fn panel_write_allowed(is_owner: bool, panel: PanelSide, distinct_users: usize) -> bool {
    if distinct_users < 2 {
        return true;
    }
    match panel {
        PanelSide::Left => is_owner,
        PanelSide::Right => !is_owner,
    }
}

/// Pool entries can be removed by whoever added them or by the room owner.
fn pool_remove_allowed(user_id: &str, added_by: &str, room_owner_id: &str) -> bool {
    user_id == added_by || user_id == room_owner_id
}

/// Status update broadcast when a session closes. A graceful end reads as
/// "closed"; a lost producer stays "offline" with the close reason attached.
fn close_status(reason: CloseReason) -> (&'static str, Option<String>) {
    match reason {
        CloseReason::Graceful => ("closed", None),
        CloseReason::Timeout => ("offline", Some("timeout".to_string())),
        CloseReason::Error => ("offline", Some("error".to_string())),
    }
}

// ----------------------------------------------------------------------
// Room actor
// ----------------------------------------------------------------------

struct Participant {
    user: RoomUser,
    sender: PeerSender,
}

struct RoomActor {
    room: RoomRecord,
    storage: SharedStorage,
    registry: Arc<SessionRegistry>,
    participants: HashMap<Uuid, Participant>,
}

fn spawn_room_actor(
    room: RoomRecord,
    storage: SharedStorage,
    registry: Arc<SessionRegistry>,
) -> mpsc::UnboundedSender<RoomCommand> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut actor = RoomActor {
        room,
        storage,
        registry,
        participants: HashMap::new(),
    };
    tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            match command {
                RoomCommand::Join {
                    conn_id,
                    user,
                    sender,
                } => actor.handle_join(conn_id, user, sender).await,
                RoomCommand::Leave { conn_id } => actor.handle_leave(conn_id),
                RoomCommand::Client { conn_id, message } => {
                    actor.handle_client(conn_id, message).await
                }
                RoomCommand::Registry(event) => actor.handle_registry(event).await,
            }
        }
        debug!("room actor finished");
    });
    tx
}

impl RoomActor {
    fn broadcast(&self, message: &RoomServerMessage) {
        for participant in self.participants.values() {
            participant.sender.send_json(message);
        }
    }

    fn broadcast_except(&self, skip: Uuid, message: &RoomServerMessage) {
        for (conn_id, participant) in &self.participants {
            if *conn_id != skip {
                participant.sender.send_json(message);
            }
        }
    }

    fn distinct_users(&self) -> usize {
        let mut ids: Vec<&str> = self
            .participants
            .values()
            .map(|p| p.user.id.as_str())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids.len()
    }

    fn is_connected(&self, user_id: &str) -> bool {
        self.participants.values().any(|p| p.user.id == user_id)
    }

    async fn handle_join(&mut self, conn_id: Uuid, user: RoomUser, sender: PeerSender) {
        info!(room = %self.room.room_id, user = %user.login, "participant joined");
        self.participants.insert(
            conn_id,
            Participant {
                user: user.clone(),
                sender: sender.clone(),
            },
        );
        self.broadcast_except(
            conn_id,
            &RoomServerMessage::ParticipantUpdate {
                action: "joined".to_string(),
                participant: ParticipantInfo {
                    id: user.id.clone(),
                    login: user.login.clone(),
                    connected: true,
                },
            },
        );
        match self.jam_state().await {
            Ok(state) => sender.send_json(&state),
            Err(e) => {
                warn!(room = %self.room.room_id, error = %e, "failed to build room snapshot");
                sender.send_json(&RoomServerMessage::Error {
                    code: "storage_error".to_string(),
                });
            }
        }
    }

    fn handle_leave(&mut self, conn_id: Uuid) {
        if let Some(participant) = self.participants.remove(&conn_id) {
            info!(room = %self.room.room_id, user = %participant.user.login, "participant left");
            self.broadcast(&RoomServerMessage::ParticipantUpdate {
                action: "left".to_string(),
                participant: ParticipantInfo {
                    id: participant.user.id,
                    login: participant.user.login,
                    connected: false,
                },
            });
        }
    }

    async fn handle_client(&mut self, conn_id: Uuid, message: RoomClientMessage) {
        let Some(participant) = self.participants.get(&conn_id) else {
            return;
        };
        let user = participant.user.clone();
        let sender = participant.sender.clone();

        match message {
            RoomClientMessage::PanelSelect {
                panel,
                session_id,
                terminal_name,
            } => {
                let is_owner = user.id == self.room.owner_id;
                if !panel_write_allowed(is_owner, panel, self.distinct_users()) {
                    sender.send_json(&RoomServerMessage::Error {
                        code: "panel_forbidden".to_string(),
                    });
                    return;
                }
                let selection = Some(PanelSelection {
                    session_id,
                    terminal_name,
                });
                match self
                    .storage
                    .set_shared_panel_state(&self.room.room_id, panel, selection)
                    .await
                {
                    Ok(panels) => self.broadcast(&RoomServerMessage::PanelStateUpdate { panels }),
                    Err(e) => {
                        warn!(room = %self.room.room_id, error = %e, "failed to persist panel state");
                        sender.send_json(&RoomServerMessage::Error {
                            code: "storage_error".to_string(),
                        });
                    }
                }
            }

            RoomClientMessage::AddSession { session_id } => {
                let Some(session) = self.registry.get(&session_id) else {
                    sender.send_json(&RoomServerMessage::Error {
                        code: "session_not_found".to_string(),
                    });
                    return;
                };
                let owned = session
                    .owner()
                    .await
                    .map(|owner| owner.subject == user.id)
                    .unwrap_or(false);
                if !owned {
                    sender.send_json(&RoomServerMessage::Error {
                        code: "not_session_owner".to_string(),
                    });
                    return;
                }
                let pool = self
                    .storage
                    .get_pool(&self.room.room_id)
                    .await
                    .unwrap_or_default();
                if pool.iter().any(|entry| entry.session_id == session_id) {
                    sender.send_json(&RoomServerMessage::Error {
                        code: "duplicate_session".to_string(),
                    });
                    return;
                }
                let handshake = session.control_info().await;
                let entry = PoolEntry {
                    session_id: session_id.clone(),
                    added_by: user.id.clone(),
                    added_by_login: user.login.clone(),
                    hostname: handshake.as_ref().and_then(|h| h.hostname.clone()),
                    working_dir: handshake.as_ref().and_then(|h| h.working_dir.clone()),
                    added_at: chrono::Utc::now().timestamp() as u64,
                    last_status: Some(self.live_status(&session_id).await),
                };
                if let Err(e) = self.storage.add_to_pool(&self.room.room_id, &entry).await {
                    warn!(room = %self.room.room_id, error = %e, "failed to persist pool entry");
                    sender.send_json(&RoomServerMessage::Error {
                        code: "storage_error".to_string(),
                    });
                    return;
                }
                let info = self.pool_session_info(&entry).await;
                self.broadcast(&RoomServerMessage::SessionPoolUpdate {
                    action: "added".to_string(),
                    session: info,
                });
            }

            RoomClientMessage::RemoveSession { session_id } => {
                let pool = self
                    .storage
                    .get_pool(&self.room.room_id)
                    .await
                    .unwrap_or_default();
                let Some(entry) = pool.into_iter().find(|e| e.session_id == session_id) else {
                    sender.send_json(&RoomServerMessage::Error {
                        code: "not_in_pool".to_string(),
                    });
                    return;
                };
                if !pool_remove_allowed(&user.id, &entry.added_by, &self.room.owner_id) {
                    sender.send_json(&RoomServerMessage::Error {
                        code: "remove_forbidden".to_string(),
                    });
                    return;
                }
                if let Err(e) = self
                    .storage
                    .remove_from_pool(&self.room.room_id, &session_id)
                    .await
                {
                    warn!(room = %self.room.room_id, error = %e, "failed to remove pool entry");
                    sender.send_json(&RoomServerMessage::Error {
                        code: "storage_error".to_string(),
                    });
                    return;
                }
                let info = self.pool_session_info(&entry).await;
                self.broadcast(&RoomServerMessage::SessionPoolUpdate {
                    action: "removed".to_string(),
                    session: info,
                });
            }

            RoomClientMessage::CloseTerminal {
                session_id,
                terminal_name,
            } => {
                let Some(session) = self.registry.get(&session_id) else {
                    sender.send_json(&RoomServerMessage::Error {
                        code: "session_not_found".to_string(),
                    });
                    return;
                };
                let owned = session
                    .owner()
                    .await
                    .map(|owner| owner.subject == user.id)
                    .unwrap_or(false);
                if !owned {
                    sender.send_json(&RoomServerMessage::Error {
                        code: "not_session_owner".to_string(),
                    });
                    return;
                }
                if let Err(e) = session.send_close_terminal(&terminal_name, None).await {
                    sender.send_json(&RoomServerMessage::Error {
                        code: e.to_string().replace(' ', "_"),
                    });
                }
            }
        }
    }

    /// Registry events reach every live room; only rooms whose pool holds
    /// the session, or where its owner is connected, notify participants.
    async fn handle_registry(&mut self, event: SessionEvent) {
        if self.participants.is_empty() {
            return;
        }
        let session_id = event.session_id().to_string();
        let pool = self
            .storage
            .get_pool(&self.room.room_id)
            .await
            .unwrap_or_default();
        let in_pool = pool.iter().any(|entry| entry.session_id == session_id);
        let owner_connected = event
            .owner()
            .map(|owner| self.is_connected(&owner.subject))
            .unwrap_or(false);
        if !in_pool && !owner_connected {
            return;
        }

        match event {
            SessionEvent::Online { .. } => {
                if in_pool {
                    let _ = self
                        .storage
                        .mark_pool_session_online(&self.room.room_id, &session_id)
                        .await;
                }
                self.broadcast(&RoomServerMessage::SessionStatusUpdate {
                    session_id,
                    status: "online".to_string(),
                    reason: None,
                });
            }
            SessionEvent::Offline { .. } => {
                self.broadcast(&RoomServerMessage::SessionStatusUpdate {
                    session_id,
                    status: "offline".to_string(),
                    reason: None,
                });
            }
            SessionEvent::Closed { reason, .. } => {
                if in_pool {
                    let _ = self
                        .storage
                        .mark_pool_session_closed(
                            &self.room.room_id,
                            &session_id,
                            reason == CloseReason::Graceful,
                        )
                        .await;
                }
                let (status, reason) = close_status(reason);
                self.broadcast(&RoomServerMessage::SessionStatusUpdate {
                    session_id,
                    status: status.to_string(),
                    reason,
                });
            }
            SessionEvent::TerminalClosed {
                terminal,
                exit_code,
                ..
            } => {
                self.broadcast(&RoomServerMessage::TerminalClosedUpdate {
                    session_id,
                    terminal_name: terminal,
                    exit_code,
                });
            }
        }
    }

    async fn live_status(&self, session_id: &str) -> String {
        match self.registry.get(session_id) {
            Some(session) => {
                if session.has_control().await {
                    "online".to_string()
                } else {
                    "offline".to_string()
                }
            }
            None => "closed".to_string(),
        }
    }

    async fn pool_session_info(&self, entry: &PoolEntry) -> PoolSessionInfo {
        PoolSessionInfo {
            session_id: entry.session_id.clone(),
            status: self.live_status(&entry.session_id).await,
            hostname: entry.hostname.clone(),
            working_dir: entry.working_dir.clone(),
            added_by: Some(entry.added_by_login.clone()),
        }
    }

    async fn jam_state(&self) -> anyhow::Result<RoomServerMessage> {
        let known = self.storage.list_participants(&self.room.room_id).await?;
        let mut participants: Vec<ParticipantInfo> = known
            .into_iter()
            .map(|user| ParticipantInfo {
                connected: self.is_connected(&user.id),
                id: user.id,
                login: user.login,
            })
            .collect();
        participants.sort_by(|a, b| a.login.cmp(&b.login));

        let pool = self.storage.get_pool(&self.room.room_id).await?;
        let mut sessions = Vec::with_capacity(pool.len());
        for entry in &pool {
            sessions.push(self.pool_session_info(entry).await);
        }
        let panels = self.storage.get_shared_panel_state(&self.room.room_id).await?;

        Ok(RoomServerMessage::JamState {
            room_id: self.room.room_id.clone(),
            owner: self.room.owner_login.clone(),
            participants,
            sessions,
            panels,
        })
    }
}

// ----------------------------------------------------------------------
// Endpoint
// ----------------------------------------------------------------------

pub async fn jam_handler(
    ws: WebSocketUpgrade,
    Path(room_id): Path<String>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let cookie = session_cookie(&headers, SESSION_COOKIE);
    ws.max_message_size(state.cfg.max_frame_bytes)
        .on_upgrade(move |socket| handle_jam(socket, room_id, cookie, state))
}

async fn handle_jam(socket: WebSocket, room_id: String, cookie: Option<String>, state: AppState) {
    let (sink, mut stream) = socket.split();
    let sender = PeerSender::spawn(sink, state.cfg.send_queue_depth);

    let (Some(storage), Some(broker)) = (state.storage.as_ref(), state.broker.as_ref()) else {
        reject(&sender, 1011, "rooms are not enabled".to_string());
        return;
    };

    let user = match cookie.as_deref().map(|t| state.verifier.verify_room_user(t)) {
        Some(Ok(user)) => user,
        _ => {
            reject(&sender, 4401, "missing or invalid session".to_string());
            return;
        }
    };

    let room = match storage.get_room(&room_id).await {
        Ok(Some(room)) => room,
        Ok(None) => {
            reject(&sender, 4404, "room not found".to_string());
            return;
        }
        Err(e) => {
            warn!(room = %room_id, error = %e, "room lookup failed");
            reject(&sender, 1011, "storage error".to_string());
            return;
        }
    };

    let member = match storage.is_room_member(&room_id, &user.id).await {
        Ok(member) => member,
        Err(e) => {
            warn!(room = %room_id, error = %e, "membership lookup failed");
            reject(&sender, 1011, "storage error".to_string());
            return;
        }
    };
    if !member {
        // A pending invitation admits the user on first connect.
        match storage.pending_invitation_for(&room_id, &user.login).await {
            Ok(Some(invitation)) => {
                info!(room = %room_id, user = %user.login, "accepting pending invitation");
                let _ = storage.accept_invitation(&room_id, &invitation.id).await;
                let _ = storage.add_participant(&room_id, &user).await;
            }
            _ => {
                reject(&sender, 4403, "not a room member".to_string());
                return;
            }
        }
    }

    let conn_id = broker.connect(room, user.clone(), sender.clone());

    while let Some(frame) = stream.next().await {
        let payload = match frame {
            Ok(Message::Text(text)) => text.into_bytes(),
            Ok(Message::Binary(data)) => data,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(room = %room_id, user = %user.login, error = %e, "room socket error");
                break;
            }
        };
        match RoomClientMessage::parse(&payload) {
            Ok(message) => broker.client_message(&room_id, conn_id, message),
            Err(e) => {
                warn!(room = %room_id, user = %user.login, error = %e, "dropping malformed room frame");
                sender.send_json(&RoomServerMessage::Error {
                    code: "invalid_message".to_string(),
                });
            }
        }
    }

    broker.disconnect(&room_id, conn_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_user_drives_both_panels() {
        assert!(panel_write_allowed(true, PanelSide::Left, 1));
        assert!(panel_write_allowed(true, PanelSide::Right, 1));
        assert!(panel_write_allowed(false, PanelSide::Left, 1));
        assert!(panel_write_allowed(false, PanelSide::Right, 1));
    }

    #[test]
    fn with_peers_owner_gets_left_and_guests_get_right() {
        assert!(panel_write_allowed(true, PanelSide::Left, 2));
        assert!(!panel_write_allowed(true, PanelSide::Right, 2));
        assert!(!panel_write_allowed(false, PanelSide::Left, 2));
        assert!(panel_write_allowed(false, PanelSide::Right, 3));
    }

    #[test]
    fn pool_removal_is_adder_or_owner() {
        assert!(pool_remove_allowed("u1", "u1", "owner"));
        assert!(pool_remove_allowed("owner", "u1", "owner"));
        assert!(!pool_remove_allowed("u2", "u1", "owner"));
    }

    #[test]
    fn only_graceful_close_reads_as_closed() {
        assert_eq!(close_status(CloseReason::Graceful), ("closed", None));
        assert_eq!(
            close_status(CloseReason::Timeout),
            ("offline", Some("timeout".to_string()))
        );
        assert_eq!(
            close_status(CloseReason::Error),
            ("offline", Some("error".to_string()))
        );
    }
}
