//! Session state machine: one producer, many viewers.
//!
//! A session owns its terminals, the pending spawn requests, and the
//! producer reconnect window. All mutable state lives behind one mutex;
//! every socket send is a non-blocking push into that peer's queue, so the
//! lock is never held across I/O. Terminals and viewer states hold only the
//! session id plus ephemeral socket handles; everything else is looked up
//! through the registry.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::Principal;
use crate::config::Config;
use crate::peer::PeerSender;
use crate::protocol::{
    ControlCommand, ControlHandshake, DataHandshake, RelayData, Resize, ViewerReply,
};
use crate::registry::{CloseReason, SessionEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Pending,
    Ready,
    Active,
    Closing,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Pending => "pending",
            SessionState::Ready => "ready",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        }
    }

    fn is_closed(&self) -> bool {
        matches!(self, SessionState::Closing | SessionState::Closed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewerRole {
    Interactive,
    Mirror,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session not found")]
    NotFound,
    #[error("session is closed")]
    Closed,
    #[error("session has no connected producer")]
    NotReady,
    #[error("a control channel is already connected")]
    AlreadyConnected,
    #[error("not the session owner")]
    NotOwner,
    #[error("terminal not found")]
    TerminalNotFound,
}

impl SessionError {
    pub fn close_code(&self) -> u16 {
        match self {
            SessionError::NotFound | SessionError::Closed | SessionError::TerminalNotFound => 4404,
            SessionError::NotReady => 4400,
            SessionError::AlreadyConnected => 4409,
            SessionError::NotOwner => 4403,
        }
    }
}

/// Outcome of a control-channel detach, decided under the session lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlDetach {
    /// Stale socket or already-closed session; nothing to do.
    Ignored,
    /// Producer sent the graceful shutdown close frame; close the session.
    Graceful,
    /// Connection lost; the caller arms the reconnect window.
    Lost,
}

struct ControlChannel {
    sender: PeerSender,
    generation: u64,
}

struct ViewerState {
    sender: PeerSender,
    needs_snapshot: bool,
    pending_snapshot: Option<String>,
    /// Output chunks held back until the snapshot arrives, in arrival order.
    buffered: Vec<Vec<u8>>,
}

struct Terminal {
    name: String,
    data: Option<PeerSender>,
    data_generation: u64,
    handshake: Option<DataHandshake>,
    cols: u16,
    rows: u16,
    creator: Option<Principal>,
    exit_code: Option<i32>,
    interactive: HashMap<Uuid, ViewerState>,
    mirror: HashMap<Uuid, ViewerState>,
}

impl Terminal {
    fn new(name: String, cols: u16, rows: u16, creator: Option<Principal>) -> Self {
        Self {
            name,
            data: None,
            data_generation: 0,
            handshake: None,
            cols,
            rows,
            creator,
            exit_code: None,
            interactive: HashMap::new(),
            mirror: HashMap::new(),
        }
    }

    fn viewers_mut(&mut self) -> impl Iterator<Item = &mut ViewerState> {
        self.interactive.values_mut().chain(self.mirror.values_mut())
    }

    fn viewers(&self) -> impl Iterator<Item = &ViewerState> {
        self.interactive.values().chain(self.mirror.values())
    }
}

struct PendingSpawn {
    cols: u16,
    rows: u16,
    viewer_id: Uuid,
    sender: PeerSender,
    creator: Option<Principal>,
    created_at: Instant,
    notify: oneshot::Sender<Result<String, String>>,
}

struct SessionInner {
    state: SessionState,
    owner: Option<Principal>,
    control: Option<ControlChannel>,
    control_generation: u64,
    last_handshake: Option<ControlHandshake>,
    terminals: HashMap<String, Terminal>,
    pending: HashMap<String, PendingSpawn>,
    reconnect: Option<JoinHandle<()>>,
}

pub struct Session {
    pub id: String,
    created_at: Instant,
    created_wall: DateTime<Utc>,
    cfg: Arc<Config>,
    events: broadcast::Sender<SessionEvent>,
    inner: Mutex<SessionInner>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TerminalStatus {
    pub name: String,
    pub cols: u16,
    pub rows: u16,
    pub interactive: usize,
    pub mirror: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
    #[serde(rename = "createdBy", skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub state: String,
    pub connected: bool,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(rename = "workingDir", skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    pub terminals: Vec<TerminalStatus>,
}

impl Session {
    pub fn new(id: String, cfg: Arc<Config>, events: broadcast::Sender<SessionEvent>) -> Self {
        Self {
            id,
            created_at: Instant::now(),
            created_wall: Utc::now(),
            cfg,
            events,
            inner: Mutex::new(SessionInner {
                state: SessionState::Pending,
                owner: None,
                control: None,
                control_generation: 0,
                last_handshake: None,
                terminals: HashMap::new(),
                pending: HashMap::new(),
                reconnect: None,
            }),
        }
    }

    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    // ------------------------------------------------------------------
    // Control channel
    // ------------------------------------------------------------------

    /// Install the producer control channel. The first authenticated attach
    /// fixes the owner for the life of the session.
    pub async fn attach_control(
        &self,
        principal: Principal,
        sender: PeerSender,
    ) -> Result<u64, SessionError> {
        let mut inner = self.inner.lock().await;
        if inner.state.is_closed() {
            return Err(SessionError::Closed);
        }
        if inner.control.is_some() {
            return Err(SessionError::AlreadyConnected);
        }
        match &inner.owner {
            Some(owner) if owner.subject != principal.subject => {
                return Err(SessionError::NotOwner)
            }
            Some(_) => {}
            None => inner.owner = Some(principal.clone()),
        }
        if let Some(timer) = inner.reconnect.take() {
            timer.abort();
        }
        inner.control_generation += 1;
        let generation = inner.control_generation;
        inner.control = Some(ControlChannel { sender, generation });
        info!(session = %self.id, subject = %principal.subject, "producer control attached");
        Ok(generation)
    }

    pub async fn on_control_handshake(&self, handshake: ControlHandshake) {
        let mut inner = self.inner.lock().await;
        if inner.state.is_closed() {
            return;
        }
        if inner.state == SessionState::Pending {
            inner.state = SessionState::Ready;
        }
        info!(
            session = %self.id,
            version = %handshake.version,
            hostname = handshake.hostname.as_deref().unwrap_or(""),
            "control handshake"
        );
        inner.last_handshake = Some(handshake.clone());
        let owner = inner.owner.clone();
        drop(inner);
        self.emit(SessionEvent::Online {
            session_id: self.id.clone(),
            owner,
            hostname: handshake.hostname,
            working_dir: handshake.working_dir,
        });
    }

    /// Handle the producer control socket going away. A graceful close
    /// (1000, "client shutdown") ends the session; anything else starts the
    /// reconnect window, which the caller arms.
    pub async fn detach_control(&self, generation: u64, code: u16, reason: &str) -> ControlDetach {
        let mut inner = self.inner.lock().await;
        if inner.state.is_closed() {
            return ControlDetach::Ignored;
        }
        match &inner.control {
            Some(control) if control.generation == generation => {}
            _ => return ControlDetach::Ignored,
        }
        inner.control = None;
        let graceful = code == 1000 && reason == "client shutdown";
        let owner = inner.owner.clone();
        drop(inner);
        if graceful {
            info!(session = %self.id, "producer closed gracefully");
            ControlDetach::Graceful
        } else {
            info!(session = %self.id, code, "producer control lost, reconnect window open");
            self.emit(SessionEvent::Offline {
                session_id: self.id.clone(),
                owner,
            });
            ControlDetach::Lost
        }
    }

    pub async fn set_reconnect_timer(&self, handle: JoinHandle<()>) {
        let mut inner = self.inner.lock().await;
        // A control channel may have reattached while the timer was being
        // created; in that case the window no longer applies.
        if inner.control.is_some() || inner.state.is_closed() {
            handle.abort();
            return;
        }
        if let Some(previous) = inner.reconnect.replace(handle) {
            previous.abort();
        }
    }

    pub async fn has_control(&self) -> bool {
        self.inner.lock().await.control.is_some()
    }

    pub async fn owner(&self) -> Option<Principal> {
        self.inner.lock().await.owner.clone()
    }

    pub async fn control_info(&self) -> Option<ControlHandshake> {
        self.inner.lock().await.last_handshake.clone()
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    /// Forward a close request to the producer (room brokers use this).
    pub async fn send_close_terminal(
        &self,
        name: &str,
        signal: Option<i32>,
    ) -> Result<(), SessionError> {
        let inner = self.inner.lock().await;
        let control = inner.control.as_ref().ok_or(SessionError::NotReady)?;
        if !inner.terminals.contains_key(name) {
            return Err(SessionError::TerminalNotFound);
        }
        control.sender.send_json(&ControlCommand::CloseTerminal {
            name: name.to_string(),
            signal,
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Terminal spawn
    // ------------------------------------------------------------------

    /// Ask the producer to start a terminal on behalf of a viewer. Returns
    /// the rendezvous for the producer-assigned name; the setup response is
    /// sent to the viewer when the producer answers (or the request expires).
    pub async fn request_spawn(
        self: &Arc<Self>,
        viewer_id: Uuid,
        sender: PeerSender,
        requested_name: String,
        cols: Option<u16>,
        rows: Option<u16>,
        creator: Option<Principal>,
    ) -> Result<oneshot::Receiver<Result<String, String>>, SessionError> {
        let cols = cols.unwrap_or(self.cfg.default_cols);
        let rows = rows.unwrap_or(self.cfg.default_rows);
        let request_id = Uuid::new_v4().to_string();
        let (notify, rendezvous) = oneshot::channel();

        {
            let mut inner = self.inner.lock().await;
            if inner.state.is_closed() {
                return Err(SessionError::Closed);
            }
            let control = inner.control.as_ref().ok_or(SessionError::NotReady)?;
            control.sender.send_json(&ControlCommand::StartTerminal {
                name: requested_name,
                cols,
                rows,
                request_id: request_id.clone(),
            });
            inner.pending.insert(
                request_id.clone(),
                PendingSpawn {
                    cols,
                    rows,
                    viewer_id,
                    sender,
                    creator,
                    created_at: Instant::now(),
                    notify,
                },
            );
        }

        let session = Arc::clone(self);
        let timeout = self.cfg.spawn_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            session.expire_spawn(&request_id).await;
        });

        Ok(rendezvous)
    }

    /// Producer answered a `start_terminal` request. An unknown request id
    /// is a no-op: the viewer may have disconnected or the request expired.
    pub async fn on_terminal_started(
        &self,
        name: String,
        request_id: &str,
        success: bool,
        error: Option<String>,
    ) {
        let mut inner = self.inner.lock().await;
        let Some(pending) = inner.pending.remove(request_id) else {
            warn!(session = %self.id, request_id, "terminal_started with no pending request");
            return;
        };
        if !success {
            let message = error.unwrap_or_else(|| "terminal spawn failed".to_string());
            warn!(session = %self.id, terminal = %name, error = %message, "terminal spawn failed");
            pending.sender.send_json(&ViewerReply::setup_err(message.clone()));
            let _ = pending.notify.send(Err(message));
            return;
        }
        // The terminal is fresh, so the creating viewer needs no snapshot.
        let viewer = ViewerState {
            sender: pending.sender.clone(),
            needs_snapshot: false,
            pending_snapshot: None,
            buffered: Vec::new(),
        };
        match inner.terminals.get_mut(&name) {
            Some(existing)
                if existing.creator.is_none()
                    && existing.interactive.is_empty()
                    && existing.mirror.is_empty() =>
            {
                // The data channel raced ahead of this reply and left a
                // placeholder; adopt it instead of rejecting the spawn.
                debug!(session = %self.id, terminal = %name, "adopting placeholder terminal");
                existing.cols = pending.cols;
                existing.rows = pending.rows;
                existing.creator = pending.creator;
                existing.interactive.insert(pending.viewer_id, viewer);
                if let Some(data) = &existing.data {
                    data.send_binary(
                        RelayData::Resize(Resize {
                            cols: existing.cols,
                            rows: existing.rows,
                        })
                        .encode(),
                    );
                }
            }
            Some(_) => {
                // Producer-assigned names must be unique within the session.
                let message = format!("terminal '{}' already exists", name);
                warn!(session = %self.id, terminal = %name, "duplicate terminal name from producer");
                pending.sender.send_json(&ViewerReply::setup_err(message.clone()));
                let _ = pending.notify.send(Err(message));
                return;
            }
            None => {
                let mut terminal =
                    Terminal::new(name.clone(), pending.cols, pending.rows, pending.creator);
                terminal.interactive.insert(pending.viewer_id, viewer);
                inner.terminals.insert(name.clone(), terminal);
            }
        }
        if matches!(inner.state, SessionState::Pending | SessionState::Ready) {
            inner.state = SessionState::Active;
        }
        info!(
            session = %self.id,
            terminal = %name,
            elapsed_ms = pending.created_at.elapsed().as_millis() as u64,
            "terminal started"
        );
        pending
            .sender
            .send_json(&ViewerReply::setup_ok(name.clone(), pending.cols, pending.rows));
        let _ = pending.notify.send(Ok(name));
    }

    async fn expire_spawn(&self, request_id: &str) {
        let mut inner = self.inner.lock().await;
        let Some(pending) = inner.pending.remove(request_id) else {
            return;
        };
        warn!(session = %self.id, request_id, "terminal spawn timed out");
        pending.sender.send_json(&ViewerReply::setup_err("spawn timeout"));
        let _ = pending.notify.send(Err("spawn timeout".to_string()));
    }

    // ------------------------------------------------------------------
    // Data channel
    // ------------------------------------------------------------------

    /// Create a placeholder for a data channel that arrived before its
    /// `terminal_started` was processed. Uses the session default geometry.
    pub async fn ensure_terminal(&self, name: &str) -> Result<(), SessionError> {
        let mut inner = self.inner.lock().await;
        if inner.state.is_closed() {
            return Err(SessionError::Closed);
        }
        if !inner.terminals.contains_key(name) {
            debug!(session = %self.id, terminal = %name, "creating placeholder terminal for straggler data channel");
            inner.terminals.insert(
                name.to_string(),
                Terminal::new(
                    name.to_string(),
                    self.cfg.default_cols,
                    self.cfg.default_rows,
                    None,
                ),
            );
            if matches!(inner.state, SessionState::Pending | SessionState::Ready) {
                inner.state = SessionState::Active;
            }
        }
        Ok(())
    }

    pub async fn attach_data(&self, name: &str, sender: PeerSender) -> Result<u64, SessionError> {
        let mut inner = self.inner.lock().await;
        if inner.state.is_closed() {
            return Err(SessionError::Closed);
        }
        let terminal = inner
            .terminals
            .get_mut(name)
            .ok_or(SessionError::TerminalNotFound)?;
        if let Some(previous) = terminal.data.replace(sender) {
            previous.close(1000, "replaced by a new data channel");
        }
        terminal.data_generation += 1;
        debug!(session = %self.id, terminal = %name, "data channel attached");
        Ok(terminal.data_generation)
    }

    /// Producer handshake on the data channel: record it, push the current
    /// geometry back, and (re)issue any snapshot requests viewers are
    /// waiting on.
    pub async fn on_data_handshake(&self, name: &str, handshake: DataHandshake) {
        let mut inner = self.inner.lock().await;
        let Some(terminal) = inner.terminals.get_mut(name) else {
            return;
        };
        terminal.handshake = Some(handshake);
        let Some(data) = terminal.data.clone() else {
            return;
        };
        data.send_binary(
            RelayData::Resize(Resize {
                cols: terminal.cols,
                rows: terminal.rows,
            })
            .encode(),
        );
        for viewer in terminal.viewers() {
            if let Some(request_id) = &viewer.pending_snapshot {
                data.send_binary(
                    RelayData::SnapshotRequest {
                        request_id: request_id.clone(),
                    }
                    .encode(),
                );
            }
        }
    }

    /// Data channel closed without an exit report: tear the terminal down
    /// with the last known exit code.
    pub async fn detach_data(&self, name: &str, generation: u64) {
        let exit_code = {
            let inner = self.inner.lock().await;
            match inner.terminals.get(name) {
                Some(terminal) if terminal.data_generation == generation => {
                    terminal.exit_code.unwrap_or(-1)
                }
                _ => return,
            }
        };
        info!(session = %self.id, terminal = %name, "data channel dropped");
        self.on_terminal_closed(name, exit_code).await;
    }

    // ------------------------------------------------------------------
    // Viewers
    // ------------------------------------------------------------------

    /// Attach a viewer to an existing terminal. The viewer sees nothing
    /// until the snapshot arrives; output in between is buffered.
    pub async fn join_existing(
        &self,
        name: &str,
        viewer_id: Uuid,
        role: ViewerRole,
        sender: PeerSender,
    ) -> Result<(String, u16, u16), SessionError> {
        let mut inner = self.inner.lock().await;
        if inner.state.is_closed() {
            return Err(SessionError::Closed);
        }
        let terminal = inner
            .terminals
            .get_mut(name)
            .ok_or(SessionError::TerminalNotFound)?;
        let request_id = Uuid::new_v4().to_string();
        let viewer = ViewerState {
            sender,
            needs_snapshot: true,
            pending_snapshot: Some(request_id.clone()),
            buffered: Vec::new(),
        };
        // A viewer belongs to exactly one of the two sets.
        terminal.interactive.remove(&viewer_id);
        terminal.mirror.remove(&viewer_id);
        match role {
            ViewerRole::Interactive => terminal.interactive.insert(viewer_id, viewer),
            ViewerRole::Mirror => terminal.mirror.insert(viewer_id, viewer),
        };
        if let Some(data) = &terminal.data {
            data.send_binary(RelayData::SnapshotRequest { request_id }.encode());
        }
        debug!(session = %self.id, terminal = %name, viewer = %viewer_id, role = ?role, "viewer joined");
        Ok((terminal.name.clone(), terminal.cols, terminal.rows))
    }

    /// Deliver a snapshot to the one viewer whose request id matches, then
    /// flush that viewer's buffered output in arrival order.
    pub async fn on_snapshot(&self, name: &str, request_id: &str, screen: Vec<u8>) {
        let mut inner = self.inner.lock().await;
        let Some(terminal) = inner.terminals.get_mut(name) else {
            return;
        };
        let Some(viewer) = terminal
            .viewers_mut()
            .find(|v| v.pending_snapshot.as_deref() == Some(request_id))
        else {
            debug!(session = %self.id, terminal = %name, request_id, "snapshot with no waiting viewer");
            return;
        };
        viewer.sender.send_binary(screen);
        for chunk in viewer.buffered.drain(..) {
            viewer.sender.send_binary(chunk);
        }
        viewer.pending_snapshot = None;
        viewer.needs_snapshot = false;
    }

    /// Fan producer output out to every viewer of the terminal. Viewers
    /// still waiting on a snapshot get the bytes buffered instead.
    pub async fn on_output(&self, name: &str, bytes: Vec<u8>) {
        let mut inner = self.inner.lock().await;
        let Some(terminal) = inner.terminals.get_mut(name) else {
            return;
        };
        for viewer in terminal.viewers_mut() {
            if viewer.needs_snapshot {
                viewer.buffered.push(bytes.clone());
            } else {
                viewer.sender.send_binary(bytes.clone());
            }
        }
    }

    /// Forward viewer input to the producer. Only interactive viewers may
    /// write; mirrors are silently ignored.
    pub async fn on_input(&self, name: &str, viewer_id: Uuid, bytes: Vec<u8>) {
        let inner = self.inner.lock().await;
        let Some(terminal) = inner.terminals.get(name) else {
            return;
        };
        if !terminal.interactive.contains_key(&viewer_id) {
            debug!(session = %self.id, terminal = %name, viewer = %viewer_id, "ignoring input from non-interactive viewer");
            return;
        }
        if let Some(data) = &terminal.data {
            data.send_binary(RelayData::Input(bytes).encode());
        }
    }

    pub async fn on_viewer_resize(&self, name: &str, viewer_id: Uuid, cols: u16, rows: u16) {
        let mut inner = self.inner.lock().await;
        let Some(terminal) = inner.terminals.get_mut(name) else {
            return;
        };
        if !terminal.interactive.contains_key(&viewer_id) {
            debug!(session = %self.id, terminal = %name, viewer = %viewer_id, "ignoring resize from non-interactive viewer");
            return;
        }
        terminal.cols = cols;
        terminal.rows = rows;
        if let Some(data) = &terminal.data {
            data.send_binary(RelayData::Resize(Resize { cols, rows }).encode());
        }
    }

    /// Pause/resume pass-through for interactive viewers.
    pub async fn on_viewer_flow(&self, name: &str, viewer_id: Uuid, pause: bool) {
        let inner = self.inner.lock().await;
        let Some(terminal) = inner.terminals.get(name) else {
            return;
        };
        if !terminal.interactive.contains_key(&viewer_id) {
            return;
        }
        if let Some(data) = &terminal.data {
            let frame = if pause { RelayData::Pause } else { RelayData::Resume };
            data.send_binary(frame.encode());
        }
    }

    /// Remove a viewer from its terminal and drop any spawn request it was
    /// waiting on.
    pub async fn detach_viewer(&self, terminal: Option<&str>, viewer_id: Uuid) {
        let mut inner = self.inner.lock().await;
        if let Some(name) = terminal {
            if let Some(terminal) = inner.terminals.get_mut(name) {
                terminal.interactive.remove(&viewer_id);
                terminal.mirror.remove(&viewer_id);
            }
        }
        inner.pending.retain(|_, pending| pending.viewer_id != viewer_id);
    }

    // ------------------------------------------------------------------
    // Terminal teardown
    // ------------------------------------------------------------------

    /// Producer reported (or the relay inferred) that a terminal ended.
    pub async fn on_terminal_closed(&self, name: &str, exit_code: i32) {
        let removed = {
            let mut inner = self.inner.lock().await;
            let Some(terminal) = inner.terminals.remove(name) else {
                return;
            };
            close_terminal_peers(&terminal, exit_code);
            if inner.terminals.is_empty() && inner.state == SessionState::Active {
                inner.state = SessionState::Ready;
            }
            terminal
        };
        info!(session = %self.id, terminal = %removed.name, exit_code, "terminal closed");
        let owner = self.owner().await;
        self.emit(SessionEvent::TerminalClosed {
            session_id: self.id.clone(),
            owner,
            terminal: removed.name,
            exit_code,
        });
    }

    /// Record the exit code reported on the data channel; the terminal is
    /// torn down when the producer confirms via `terminal_closed` or the
    /// data channel drops.
    pub async fn record_exit(&self, name: &str, exit_code: i32) {
        let mut inner = self.inner.lock().await;
        if let Some(terminal) = inner.terminals.get_mut(name) {
            terminal.exit_code = Some(exit_code);
        }
    }

    // ------------------------------------------------------------------
    // Session teardown
    // ------------------------------------------------------------------

    /// Transition to `Closing` → `Closed`, notifying and disconnecting every
    /// peer. Returns false if the session was already closing.
    pub async fn close(&self, reason: CloseReason) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.state.is_closed() {
            return false;
        }
        inner.state = SessionState::Closing;
        if let Some(timer) = inner.reconnect.take() {
            timer.abort();
        }
        let disconnect = ViewerReply::Disconnect {
            reason: reason.disconnect_reason().to_string(),
        };
        for (_, terminal) in inner.terminals.drain() {
            for viewer in terminal.viewers() {
                viewer.sender.send_json(&disconnect);
                viewer.sender.close(1000, "Session closed");
            }
            if let Some(data) = &terminal.data {
                data.close(1000, "Session closed");
            }
        }
        for (_, pending) in inner.pending.drain() {
            pending.sender.send_json(&disconnect);
            pending.sender.close(1000, "Session closed");
            let _ = pending.notify.send(Err("session closed".to_string()));
        }
        if let Some(control) = inner.control.take() {
            control.sender.close(1000, "Session closed");
        }
        inner.state = SessionState::Closed;
        info!(session = %self.id, reason = reason.as_str(), "session closed");
        true
    }

    pub async fn status(&self) -> SessionStatus {
        let inner = self.inner.lock().await;
        SessionStatus {
            session_id: self.id.clone(),
            state: inner.state.as_str().to_string(),
            connected: inner.control.is_some(),
            created_at: self.created_wall,
            owner: inner.owner.as_ref().map(|o| o.username.clone()),
            hostname: inner.last_handshake.as_ref().and_then(|h| h.hostname.clone()),
            working_dir: inner
                .last_handshake
                .as_ref()
                .and_then(|h| h.working_dir.clone()),
            terminals: inner
                .terminals
                .values()
                .map(|t| TerminalStatus {
                    name: t.name.clone(),
                    cols: t.cols,
                    rows: t.rows,
                    interactive: t.interactive.len(),
                    mirror: t.mirror.len(),
                    shell: t.handshake.as_ref().map(|h| h.shell.clone()),
                    created_by: t.creator.as_ref().map(|c| c.username.clone()),
                })
                .collect(),
        }
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine; rooms are optional.
        let _ = self.events.send(event);
    }
}

/// Tell every viewer the terminal exited and close all of its sockets.
fn close_terminal_peers(terminal: &Terminal, exit_code: i32) {
    let exit = ViewerReply::Exit { code: exit_code };
    for viewer in terminal.viewers() {
        viewer.sender.send_json(&exit);
        viewer.sender.close(1000, "Terminal closed");
    }
    if let Some(data) = &terminal.data {
        data.close(1000, "Terminal closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ProducerData;
    use axum::extract::ws::Message;
    use tokio::sync::mpsc::error::TryRecvError;

    fn test_session() -> (Arc<Session>, broadcast::Receiver<SessionEvent>) {
        let (events, rx) = broadcast::channel(64);
        let session = Arc::new(Session::new(
            "s1".to_string(),
            Arc::new(Config::default()),
            events,
        ));
        (session, rx)
    }

    fn principal(subject: &str) -> Principal {
        Principal {
            subject: subject.to_string(),
            username: format!("{}-name", subject),
        }
    }

    fn drain(rx: &mut tokio::sync::mpsc::Receiver<Message>) -> Vec<Message> {
        let mut frames = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(frame) => frames.push(frame),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        frames
    }

    fn json_of(message: &Message) -> serde_json::Value {
        match message {
            Message::Text(text) => serde_json::from_str(text).unwrap(),
            other => panic!("expected text frame, got {:?}", other),
        }
    }

    /// Last JSON message in a frame list, skipping close frames.
    fn last_json(frames: &[Message]) -> serde_json::Value {
        frames
            .iter()
            .rev()
            .find_map(|frame| match frame {
                Message::Text(text) => Some(serde_json::from_str(text).unwrap()),
                _ => None,
            })
            .expect("no text frame")
    }

    fn close_code(frames: &[Message]) -> Option<u16> {
        frames.iter().rev().find_map(|frame| match frame {
            Message::Close(Some(close)) => Some(close.code),
            _ => None,
        })
    }

    /// Drive a session to the point where terminal `name` exists with one
    /// interactive viewer; returns the control, viewer, and data receivers.
    async fn spawn_terminal(
        session: &Arc<Session>,
        name: &str,
    ) -> (
        tokio::sync::mpsc::Receiver<Message>,
        Uuid,
        tokio::sync::mpsc::Receiver<Message>,
        tokio::sync::mpsc::Receiver<Message>,
    ) {
        let (control, mut control_rx, _) = PeerSender::channel(64);
        session
            .attach_control(principal("owner"), control)
            .await
            .unwrap();
        session
            .on_control_handshake(ControlHandshake {
                version: "1".into(),
                ..Default::default()
            })
            .await;

        let (viewer, mut viewer_rx, _) = PeerSender::channel(64);
        let viewer_id = Uuid::new_v4();
        let rendezvous = session
            .request_spawn(viewer_id, viewer, "x".into(), Some(80), Some(24), None)
            .await
            .unwrap();

        let start = json_of(&drain(&mut control_rx).pop().unwrap());
        assert_eq!(start["type"], "start_terminal");
        let request_id = start["requestId"].as_str().unwrap().to_string();

        session
            .on_terminal_started(name.to_string(), &request_id, true, None)
            .await;
        assert_eq!(rendezvous.await.unwrap().unwrap(), name);

        let response = json_of(&drain(&mut viewer_rx).pop().unwrap());
        assert_eq!(response["type"], "setup_response");
        assert_eq!(response["success"], true);
        assert_eq!(response["name"], name);

        let (data, data_rx, _) = PeerSender::channel(64);
        session.attach_data(name, data).await.unwrap();
        (control_rx, viewer_id, viewer_rx, data_rx)
    }

    #[tokio::test]
    async fn rejects_second_control_channel() {
        let (session, _) = test_session();
        let (first, _rx1, _) = PeerSender::channel(8);
        let (second, _rx2, _) = PeerSender::channel(8);
        session.attach_control(principal("a"), first).await.unwrap();
        assert_eq!(
            session.attach_control(principal("a"), second).await,
            Err(SessionError::AlreadyConnected)
        );
    }

    #[tokio::test]
    async fn owner_is_set_once_and_enforced() {
        let (session, _) = test_session();
        let (first, _rx1, _) = PeerSender::channel(8);
        let generation = session
            .attach_control(principal("alice"), first)
            .await
            .unwrap();
        assert_eq!(session.owner().await.unwrap().subject, "alice");

        assert_eq!(
            session.detach_control(generation, 1006, "").await,
            ControlDetach::Lost
        );

        let (second, _rx2, _) = PeerSender::channel(8);
        assert_eq!(
            session.attach_control(principal("bob"), second).await,
            Err(SessionError::NotOwner)
        );
        // The failed attach must not have changed the owner.
        assert_eq!(session.owner().await.unwrap().subject, "alice");

        let (third, _rx3, _) = PeerSender::channel(8);
        session.attach_control(principal("alice"), third).await.unwrap();
    }

    #[tokio::test]
    async fn handshake_moves_pending_to_ready_and_emits_online() {
        let (session, mut events) = test_session();
        let (control, _rx, _) = PeerSender::channel(8);
        session.attach_control(principal("a"), control).await.unwrap();
        assert_eq!(session.state().await, SessionState::Pending);
        session
            .on_control_handshake(ControlHandshake {
                version: "1".into(),
                hostname: Some("devbox".into()),
                ..Default::default()
            })
            .await;
        assert_eq!(session.state().await, SessionState::Ready);
        match events.try_recv().unwrap() {
            SessionEvent::Online { session_id, hostname, .. } => {
                assert_eq!(session_id, "s1");
                assert_eq!(hostname.as_deref(), Some("devbox"));
            }
            other => panic!("expected Online event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn spawn_creates_terminal_and_attaches_viewer_interactive() {
        let (session, _) = test_session();
        let (_control_rx, viewer_id, _viewer_rx, mut data_rx) =
            spawn_terminal(&session, "7421").await;
        assert_eq!(session.state().await, SessionState::Active);

        // The fresh terminal's creator is interactive: input flows through.
        session.on_input("7421", viewer_id, b"ls\n".to_vec()).await;
        let frames = drain(&mut data_rx);
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            Message::Binary(bytes) => {
                assert_eq!(RelayData::parse(bytes).unwrap(), RelayData::Input(b"ls\n".to_vec()));
            }
            other => panic!("expected binary frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn spawn_failure_reports_error_to_viewer() {
        let (session, _) = test_session();
        let (control, mut control_rx, _) = PeerSender::channel(8);
        session.attach_control(principal("a"), control).await.unwrap();

        let (viewer, mut viewer_rx, _) = PeerSender::channel(8);
        let rendezvous = session
            .request_spawn(Uuid::new_v4(), viewer, "x".into(), None, None, None)
            .await
            .unwrap();
        let start = json_of(&drain(&mut control_rx).pop().unwrap());
        let request_id = start["requestId"].as_str().unwrap().to_string();

        session
            .on_terminal_started("".into(), &request_id, false, Some("no shell".into()))
            .await;
        assert_eq!(rendezvous.await.unwrap().unwrap_err(), "no shell");
        let response = json_of(&drain(&mut viewer_rx).pop().unwrap());
        assert_eq!(response["success"], false);
        assert_eq!(response["error"], "no shell");
        assert_eq!(session.state().await, SessionState::Pending);
    }

    #[tokio::test]
    async fn unknown_request_id_is_a_no_op() {
        let (session, _) = test_session();
        let (control, _rx, _) = PeerSender::channel(8);
        session.attach_control(principal("a"), control).await.unwrap();
        session
            .on_terminal_started("9999".into(), "no-such-request", true, None)
            .await;
        assert!(session.status().await.terminals.is_empty());
    }

    #[tokio::test]
    async fn spawn_requires_live_control() {
        let (session, _) = test_session();
        let (viewer, _rx, _) = PeerSender::channel(8);
        assert!(matches!(
            session
                .request_spawn(Uuid::new_v4(), viewer, "x".into(), None, None, None)
                .await,
            Err(SessionError::NotReady)
        ));
    }

    #[tokio::test]
    async fn mirror_receives_snapshot_then_buffer_then_live() {
        let (session, _) = test_session();
        let (_control_rx, _viewer_id, mut first_rx, mut data_rx) =
            spawn_terminal(&session, "7421").await;

        // Second viewer mirrors; a snapshot request goes to the producer.
        let (mirror, mut mirror_rx, _) = PeerSender::channel(64);
        let mirror_id = Uuid::new_v4();
        session
            .join_existing("7421", mirror_id, ViewerRole::Mirror, mirror)
            .await
            .unwrap();
        let request = drain(&mut data_rx);
        let request_id = match &request[..] {
            [Message::Binary(bytes)] => match RelayData::parse(bytes).unwrap() {
                RelayData::SnapshotRequest { request_id } => request_id,
                other => panic!("expected snapshot request, got {:?}", other),
            },
            other => panic!("expected one frame, got {:?}", other),
        };

        // Output arrives before the snapshot: live for the first viewer,
        // buffered for the mirror.
        session.on_output("7421", b"AAAA".to_vec()).await;
        session.on_output("7421", b"BB".to_vec()).await;
        assert!(drain(&mut mirror_rx).is_empty());

        session
            .on_snapshot("7421", &request_id, b"SCREEN".to_vec())
            .await;
        session.on_output("7421", b"CCC".to_vec()).await;

        let mirror_frames: Vec<Vec<u8>> = drain(&mut mirror_rx)
            .into_iter()
            .map(|m| match m {
                Message::Binary(b) => b,
                other => panic!("expected binary, got {:?}", other),
            })
            .collect();
        assert_eq!(
            mirror_frames,
            vec![b"SCREEN".to_vec(), b"AAAA".to_vec(), b"BB".to_vec(), b"CCC".to_vec()]
        );

        let first_frames: Vec<Vec<u8>> = drain(&mut first_rx)
            .into_iter()
            .map(|m| match m {
                Message::Binary(b) => b,
                other => panic!("expected binary, got {:?}", other),
            })
            .collect();
        assert_eq!(first_frames, vec![b"AAAA".to_vec(), b"BB".to_vec(), b"CCC".to_vec()]);
    }

    #[tokio::test]
    async fn mirror_input_and_resize_are_ignored() {
        let (session, _) = test_session();
        let (_control_rx, _viewer_id, _viewer_rx, mut data_rx) =
            spawn_terminal(&session, "7421").await;

        let (mirror, _mirror_rx, _) = PeerSender::channel(8);
        let mirror_id = Uuid::new_v4();
        session
            .join_existing("7421", mirror_id, ViewerRole::Mirror, mirror)
            .await
            .unwrap();
        drain(&mut data_rx); // discard the snapshot request

        session.on_input("7421", mirror_id, b"rm -rf /\n".to_vec()).await;
        session.on_viewer_resize("7421", mirror_id, 10, 10).await;
        assert!(drain(&mut data_rx).is_empty());
    }

    #[tokio::test]
    async fn interactive_resize_updates_geometry_and_forwards() {
        let (session, _) = test_session();
        let (_control_rx, viewer_id, _viewer_rx, mut data_rx) =
            spawn_terminal(&session, "7421").await;

        session.on_viewer_resize("7421", viewer_id, 132, 43).await;
        let frames = drain(&mut data_rx);
        match &frames[..] {
            [Message::Binary(bytes)] => {
                assert_eq!(
                    RelayData::parse(bytes).unwrap(),
                    RelayData::Resize(Resize { cols: 132, rows: 43 })
                );
            }
            other => panic!("expected one resize frame, got {:?}", other),
        }
        let status = session.status().await;
        assert_eq!(status.terminals[0].cols, 132);
    }

    #[tokio::test]
    async fn data_handshake_answers_with_resize() {
        let (session, _) = test_session();
        let (_control_rx, _viewer_id, _viewer_rx, mut data_rx) =
            spawn_terminal(&session, "7421").await;

        session
            .on_data_handshake(
                "7421",
                DataHandshake {
                    version: "1".into(),
                    shell: "/bin/sh".into(),
                    cols: None,
                    rows: None,
                },
            )
            .await;
        let frames = drain(&mut data_rx);
        match &frames[..] {
            [Message::Binary(bytes)] => {
                assert_eq!(
                    RelayData::parse(bytes).unwrap(),
                    RelayData::Resize(Resize { cols: 80, rows: 24 })
                );
            }
            other => panic!("expected one resize frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn terminal_close_notifies_viewers_and_returns_to_ready() {
        let (session, mut events) = test_session();
        let (_control_rx, _viewer_id, mut viewer_rx, _data_rx) =
            spawn_terminal(&session, "7421").await;
        events.try_recv().unwrap(); // Online

        session.on_terminal_closed("7421", 0).await;
        let frames = drain(&mut viewer_rx);
        let exit = last_json(&frames);
        assert_eq!(exit["type"], "exit");
        assert_eq!(exit["code"], 0);
        assert_eq!(close_code(&frames), Some(1000));
        assert_eq!(session.state().await, SessionState::Ready);
        assert!(matches!(
            events.try_recv().unwrap(),
            SessionEvent::TerminalClosed { exit_code: 0, .. }
        ));
    }

    #[tokio::test]
    async fn close_disconnects_viewers_with_reason() {
        let (session, _) = test_session();
        let (_control_rx, _viewer_id, mut viewer_rx, _data_rx) =
            spawn_terminal(&session, "7421").await;

        assert!(session.close(CloseReason::Graceful).await);
        let frames = drain(&mut viewer_rx);
        let disconnect = last_json(&frames);
        assert_eq!(disconnect["type"], "disconnect");
        assert_eq!(disconnect["reason"], "session_ended");
        assert_eq!(close_code(&frames), Some(1000));
        assert_eq!(session.state().await, SessionState::Closed);

        // Closing twice is a no-op, and a closed session accepts nothing.
        assert!(!session.close(CloseReason::Error).await);
        let (late, _rx, _) = PeerSender::channel(8);
        assert_eq!(
            session.attach_control(principal("owner"), late).await,
            Err(SessionError::Closed)
        );
    }

    #[tokio::test]
    async fn graceful_close_frame_is_recognized() {
        let (session, _) = test_session();
        let (control, _rx, _) = PeerSender::channel(8);
        let generation = session
            .attach_control(principal("a"), control)
            .await
            .unwrap();
        assert_eq!(
            session.detach_control(generation, 1000, "client shutdown").await,
            ControlDetach::Graceful
        );
    }

    #[tokio::test]
    async fn stale_detach_is_ignored() {
        let (session, _) = test_session();
        let (control, _rx, _) = PeerSender::channel(8);
        let generation = session
            .attach_control(principal("a"), control)
            .await
            .unwrap();
        assert_eq!(
            session.detach_control(generation, 1006, "").await,
            ControlDetach::Lost
        );
        let (fresh, _rx2, _) = PeerSender::channel(8);
        session.attach_control(principal("a"), fresh).await.unwrap();
        // The old socket's detach must not clobber the new control channel.
        assert_eq!(
            session.detach_control(generation, 1006, "").await,
            ControlDetach::Ignored
        );
        assert!(session.has_control().await);
    }

    #[tokio::test]
    async fn viewer_disconnect_drops_pending_spawn() {
        let (session, _) = test_session();
        let (control, mut control_rx, _) = PeerSender::channel(8);
        session.attach_control(principal("a"), control).await.unwrap();

        let (viewer, _viewer_rx, _) = PeerSender::channel(8);
        let viewer_id = Uuid::new_v4();
        let _rendezvous = session
            .request_spawn(viewer_id, viewer, "x".into(), None, None, None)
            .await
            .unwrap();
        let start = json_of(&drain(&mut control_rx).pop().unwrap());
        let request_id = start["requestId"].as_str().unwrap().to_string();

        session.detach_viewer(None, viewer_id).await;
        // The late answer finds no pending entry and spawns nothing visible.
        session
            .on_terminal_started("7421".into(), &request_id, true, None)
            .await;
        assert!(session.status().await.terminals.is_empty());
    }

    #[tokio::test]
    async fn straggler_placeholder_is_adopted_on_terminal_started() {
        let (session, _) = test_session();
        let (control, mut control_rx, _) = PeerSender::channel(8);
        session.attach_control(principal("a"), control).await.unwrap();

        let (viewer, mut viewer_rx, _) = PeerSender::channel(8);
        let viewer_id = Uuid::new_v4();
        let rendezvous = session
            .request_spawn(viewer_id, viewer, "x".into(), Some(120), Some(40), None)
            .await
            .unwrap();
        let start = json_of(&drain(&mut control_rx).pop().unwrap());
        let request_id = start["requestId"].as_str().unwrap().to_string();

        // The data channel connects before terminal_started is processed,
        // leaving a placeholder with the default geometry.
        session.ensure_terminal("7421").await.unwrap();
        let (data, mut data_rx, _) = PeerSender::channel(8);
        session.attach_data("7421", data).await.unwrap();

        session
            .on_terminal_started("7421".into(), &request_id, true, None)
            .await;
        assert_eq!(rendezvous.await.unwrap().unwrap(), "7421");

        let response = json_of(&drain(&mut viewer_rx).pop().unwrap());
        assert_eq!(response["success"], true);
        assert_eq!(response["name"], "7421");
        assert_eq!(response["cols"], 120);

        // The placeholder was adopted, not duplicated: one terminal with
        // the requested geometry, pushed to the producer as a resize.
        let status = session.status().await;
        assert_eq!(status.terminals.len(), 1);
        assert_eq!(status.terminals[0].cols, 120);
        assert_eq!(status.terminals[0].interactive, 1);
        let frames = drain(&mut data_rx);
        match frames.last().unwrap() {
            Message::Binary(bytes) => {
                assert_eq!(
                    RelayData::parse(bytes).unwrap(),
                    RelayData::Resize(Resize { cols: 120, rows: 40 })
                );
            }
            other => panic!("expected resize frame, got {:?}", other),
        }

        // The adopting viewer is interactive.
        session.on_input("7421", viewer_id, b"ls\n".to_vec()).await;
        let frames = drain(&mut data_rx);
        assert!(matches!(frames.last(), Some(Message::Binary(_))));
    }

    #[tokio::test]
    async fn close_disconnects_pending_spawn_viewers() {
        let (session, _) = test_session();
        let (control, mut control_rx, _) = PeerSender::channel(8);
        session.attach_control(principal("a"), control).await.unwrap();

        let (viewer, mut viewer_rx, _) = PeerSender::channel(8);
        let rendezvous = session
            .request_spawn(Uuid::new_v4(), viewer, "x".into(), None, None, None)
            .await
            .unwrap();
        drain(&mut control_rx);

        assert!(session.close(CloseReason::Graceful).await);
        assert_eq!(rendezvous.await.unwrap().unwrap_err(), "session closed");

        // A viewer still waiting on its spawn is disconnected and closed
        // like any attached viewer.
        let frames = drain(&mut viewer_rx);
        let disconnect = last_json(&frames);
        assert_eq!(disconnect["type"], "disconnect");
        assert_eq!(disconnect["reason"], "session_ended");
        assert_eq!(close_code(&frames), Some(1000));
    }

    #[tokio::test]
    async fn exit_report_is_used_when_data_channel_drops() {
        let (session, _) = test_session();
        let (_control_rx, _viewer_id, mut viewer_rx, _data_rx) =
            spawn_terminal(&session, "7421").await;

        session.record_exit("7421", 137).await;
        let generation = 1; // first attach
        session.detach_data("7421", generation).await;
        let frames = drain(&mut viewer_rx);
        let exit = last_json(&frames);
        assert_eq!(exit["code"], 137);
        assert!(session.status().await.terminals.is_empty());
    }

    #[tokio::test]
    async fn producer_data_parses_what_session_consumes() {
        // The data endpoint hands ProducerData variants straight to the
        // session; make sure a full producer frame sequence decodes.
        let handshake = ProducerData::parse(
            br#"1{"version":"0.3.0","shell":"/bin/bash","cols":80,"rows":24}"#,
        )
        .unwrap();
        assert!(matches!(handshake, ProducerData::Handshake(_)));
        assert!(matches!(
            ProducerData::parse(b"0output").unwrap(),
            ProducerData::Output(_)
        ));
        assert!(matches!(
            ProducerData::parse(b"20").unwrap(),
            ProducerData::Exit(0)
        ));
    }
}
