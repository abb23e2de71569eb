//! Process-wide session registry.
//!
//! Maps session ids to live sessions, keeps a bounded ring of recently
//! closed ones, and publishes lifecycle events on a broadcast bus that room
//! brokers subscribe to. `close_session` removes the map entry before doing
//! anything else, so exactly one `Closed` event is emitted per session id.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::counter;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::auth::Principal;
use crate::config::Config;
use crate::session::{ControlDetach, Session, SessionState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Graceful,
    Timeout,
    Error,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Graceful => "graceful",
            CloseReason::Timeout => "timeout",
            CloseReason::Error => "error",
        }
    }

    /// Reason string carried in the `disconnect` message viewers receive.
    pub fn disconnect_reason(&self) -> &'static str {
        match self {
            CloseReason::Graceful => "session_ended",
            CloseReason::Timeout => "producer_timeout",
            CloseReason::Error => "session_closed",
        }
    }
}

/// Lifecycle events consumed by room brokers.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Online {
        session_id: String,
        owner: Option<Principal>,
        hostname: Option<String>,
        working_dir: Option<String>,
    },
    Offline {
        session_id: String,
        owner: Option<Principal>,
    },
    Closed {
        session_id: String,
        owner: Option<Principal>,
        reason: CloseReason,
    },
    TerminalClosed {
        session_id: String,
        owner: Option<Principal>,
        terminal: String,
        exit_code: i32,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> &str {
        match self {
            SessionEvent::Online { session_id, .. }
            | SessionEvent::Offline { session_id, .. }
            | SessionEvent::Closed { session_id, .. }
            | SessionEvent::TerminalClosed { session_id, .. } => session_id,
        }
    }

    pub fn owner(&self) -> Option<&Principal> {
        match self {
            SessionEvent::Online { owner, .. }
            | SessionEvent::Offline { owner, .. }
            | SessionEvent::Closed { owner, .. }
            | SessionEvent::TerminalClosed { owner, .. } => owner.as_ref(),
        }
    }
}

/// Record kept after a session is deleted.
#[derive(Debug, Clone, Serialize)]
pub struct ClosedSession {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(rename = "workingDir", skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(rename = "closedAt")]
    pub closed_at: DateTime<Utc>,
    pub reason: String,
}

pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
    closed: Mutex<VecDeque<ClosedSession>>,
    events: broadcast::Sender<SessionEvent>,
    cfg: Arc<Config>,
}

impl SessionRegistry {
    pub fn new(cfg: Arc<Config>) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            sessions: DashMap::new(),
            closed: Mutex::new(VecDeque::new()),
            events,
            cfg,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| entry.clone())
    }

    pub fn get_or_create(&self, id: &str) -> Arc<Session> {
        self.sessions
            .entry(id.to_string())
            .or_insert_with(|| {
                counter!("boardwalk_sessions_opened_total").increment(1);
                debug!(session = %id, "session created");
                Arc::new(Session::new(
                    id.to_string(),
                    self.cfg.clone(),
                    self.events.clone(),
                ))
            })
            .clone()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn recently_closed(&self) -> Vec<ClosedSession> {
        self.closed
            .lock()
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Delete a session: remove it from the map, tear it down, record it in
    /// the closed ring, and emit the `Closed` event. The map removal gates
    /// everything, so repeated calls for the same id emit nothing.
    pub async fn close_session(self: &Arc<Self>, id: &str, reason: CloseReason) {
        let Some((_, session)) = self.sessions.remove(id) else {
            return;
        };
        let owner = session.owner().await;
        let info = session.control_info().await;
        session.close(reason).await;

        let record = ClosedSession {
            session_id: id.to_string(),
            owner: owner.as_ref().map(|o| o.username.clone()),
            hostname: info.as_ref().and_then(|h| h.hostname.clone()),
            working_dir: info.as_ref().and_then(|h| h.working_dir.clone()),
            closed_at: Utc::now(),
            reason: reason.as_str().to_string(),
        };
        if let Ok(mut ring) = self.closed.lock() {
            ring.push_back(record);
            while ring.len() > self.cfg.closed_ring_capacity {
                ring.pop_front();
            }
        }

        counter!("boardwalk_sessions_closed_total").increment(1);
        let _ = self.events.send(SessionEvent::Closed {
            session_id: id.to_string(),
            owner,
            reason,
        });
    }

    /// Handle a control socket going away: close gracefully, or arm the
    /// reconnect window and close with reason `timeout` when it expires.
    pub async fn handle_control_detach(
        self: &Arc<Self>,
        session: &Arc<Session>,
        generation: u64,
        code: u16,
        reason: &str,
    ) {
        match session.detach_control(generation, code, reason).await {
            ControlDetach::Ignored => {}
            ControlDetach::Graceful => {
                self.close_session(&session.id, CloseReason::Graceful).await;
            }
            ControlDetach::Lost => {
                let registry = Arc::clone(self);
                let target = Arc::clone(session);
                let window = self.cfg.producer_reconnect;
                let handle = tokio::spawn(async move {
                    tokio::time::sleep(window).await;
                    if target.has_control().await {
                        return;
                    }
                    info!(session = %target.id, "reconnect window expired");
                    registry.close_session(&target.id, CloseReason::Timeout).await;
                });
                session.set_reconnect_timer(handle).await;
            }
        }
    }

    /// Periodically close sessions past the maximum age and purge any that
    /// somehow reached `Closed` without being deleted.
    pub fn spawn_sweeper(self: &Arc<Self>) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(registry.cfg.sweep_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                registry.sweep().await;
            }
        });
    }

    async fn sweep(self: &Arc<Self>) {
        // Snapshot the map first; shard guards must not be held across await.
        let sessions: Vec<(String, Arc<Session>)> = self
            .sessions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        let mut expired = Vec::new();
        let mut stale = Vec::new();
        for (id, session) in sessions {
            if session.age() > self.cfg.session_max_age {
                expired.push(id);
            } else if session.state().await == SessionState::Closed {
                stale.push(id);
            }
        }
        for id in expired {
            warn!(session = %id, "closing session past max age");
            self.close_session(&id, CloseReason::Timeout).await;
        }
        for id in stale {
            self.close_session(&id, CloseReason::Error).await;
        }
    }
}
