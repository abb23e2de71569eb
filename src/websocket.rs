//! Producer and viewer websocket endpoints.
//!
//! Each handler owns its socket's read loop; every state mutation goes
//! through the session's public API. Close codes used by the relay:
//!
//! - `4400` bad/invalid setup, or no producer connected
//! - `4401` missing/invalid credential (control only)
//! - `4403` not the session owner
//! - `4404` session or terminal not found
//! - `4408` setup timeout
//! - `4409` a live control channel already exists
//! - `1000` normal closure, `1011` slow consumer

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::Response,
};
use futures_util::StreamExt;
use metrics::counter;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::{bearer_token, AuthError};
use crate::peer::{reject, PeerSender};
use crate::protocol::{
    ControlReply, ProducerData, SetupAction, ViewerReply, ViewerRequest,
};
use crate::server::AppState;
use crate::session::{Session, ViewerRole};
use std::sync::Arc;

// ----------------------------------------------------------------------
// Producer control
// ----------------------------------------------------------------------

pub async fn control_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let token = bearer_token(&headers);
    ws.max_message_size(state.cfg.max_frame_bytes)
        .on_upgrade(move |socket| handle_control(socket, session_id, token, state))
}

async fn handle_control(
    socket: WebSocket,
    session_id: String,
    token: Option<String>,
    state: AppState,
) {
    let (sink, mut stream) = socket.split();
    let sender = PeerSender::spawn(sink, state.cfg.send_queue_depth);

    let principal = match token
        .ok_or(AuthError::Missing)
        .and_then(|t| state.verifier.verify_producer(&t))
    {
        Ok(principal) => principal,
        Err(e) => {
            warn!(session = %session_id, error = %e, "producer control rejected");
            reject(&sender, 4401, e.to_string());
            return;
        }
    };

    let session = state.registry.get_or_create(&session_id);
    let generation = match session.attach_control(principal, sender.clone()).await {
        Ok(generation) => generation,
        Err(e) => {
            warn!(session = %session_id, error = %e, "producer control attach failed");
            reject(&sender, e.close_code(), e.to_string());
            return;
        }
    };
    counter!("boardwalk_producers_connected_total").increment(1);

    // 1006-style abnormal closure unless the producer sends a close frame.
    let mut close_code: u16 = 1006;
    let mut close_reason = String::new();
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => dispatch_control(&session, text.as_bytes()).await,
            Ok(Message::Binary(data)) => dispatch_control(&session, &data).await,
            Ok(Message::Close(frame)) => {
                if let Some(frame) = frame {
                    close_code = frame.code;
                    close_reason = frame.reason.to_string();
                } else {
                    close_code = 1005;
                }
                break;
            }
            Ok(_) => {}
            Err(e) => {
                debug!(session = %session_id, error = %e, "producer control socket error");
                break;
            }
        }
    }

    state
        .registry
        .handle_control_detach(&session, generation, close_code, &close_reason)
        .await;
}

async fn dispatch_control(session: &Arc<Session>, payload: &[u8]) {
    match ControlReply::parse(payload) {
        Ok(ControlReply::ControlHandshake(handshake)) => {
            session.on_control_handshake(handshake).await;
        }
        Ok(ControlReply::TerminalStarted {
            name,
            request_id,
            success,
            error,
        }) => {
            session
                .on_terminal_started(name, &request_id, success, error)
                .await;
        }
        Ok(ControlReply::TerminalClosed { name, exit_code }) => {
            session.on_terminal_closed(&name, exit_code).await;
        }
        Err(e) => {
            warn!(session = %session.id, error = %e, "dropping malformed control frame");
        }
    }
}

// ----------------------------------------------------------------------
// Producer terminal data
// ----------------------------------------------------------------------

pub async fn data_handler(
    ws: WebSocketUpgrade,
    Path((session_id, terminal)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Response {
    ws.max_message_size(state.cfg.max_frame_bytes)
        .on_upgrade(move |socket| handle_data(socket, session_id, terminal, state))
}

async fn handle_data(socket: WebSocket, session_id: String, terminal: String, state: AppState) {
    let (sink, mut stream) = socket.split();
    let sender = PeerSender::spawn(sink, state.cfg.send_queue_depth);

    let Some(session) = state.registry.get(&session_id) else {
        reject(&sender, 4404, "session not found".to_string());
        return;
    };
    // Data channels can race their own terminal_started; give stragglers a
    // placeholder with the session default geometry.
    if let Err(e) = session.ensure_terminal(&terminal).await {
        reject(&sender, e.close_code(), e.to_string());
        return;
    }
    let generation = match session.attach_data(&terminal, sender.clone()).await {
        Ok(generation) => generation,
        Err(e) => {
            reject(&sender, e.close_code(), e.to_string());
            return;
        }
    };

    while let Some(frame) = stream.next().await {
        let payload = match frame {
            Ok(Message::Binary(data)) => data,
            Ok(Message::Text(text)) => text.into_bytes(),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(session = %session_id, terminal = %terminal, error = %e, "data socket error");
                break;
            }
        };
        match ProducerData::parse(&payload) {
            Ok(ProducerData::Output(bytes)) => session.on_output(&terminal, bytes).await,
            Ok(ProducerData::Handshake(handshake)) => {
                session.on_data_handshake(&terminal, handshake).await;
            }
            Ok(ProducerData::Exit(code)) => {
                info!(session = %session_id, terminal = %terminal, code, "terminal exit reported");
                session.record_exit(&terminal, code).await;
            }
            Ok(ProducerData::Snapshot(snapshot)) => match snapshot.screen_bytes() {
                Ok(screen) => {
                    session
                        .on_snapshot(&terminal, &snapshot.request_id, screen)
                        .await;
                }
                Err(e) => {
                    warn!(session = %session_id, terminal = %terminal, error = %e, "dropping snapshot with bad screen payload");
                }
            },
            Err(e) => {
                warn!(session = %session_id, terminal = %terminal, error = %e, "dropping malformed data frame");
            }
        }
    }

    session.detach_data(&terminal, generation).await;
}

// ----------------------------------------------------------------------
// Viewer
// ----------------------------------------------------------------------

pub async fn viewer_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    ws.max_message_size(state.cfg.max_frame_bytes)
        .on_upgrade(move |socket| handle_viewer(socket, session_id, state))
}

async fn handle_viewer(socket: WebSocket, session_id: String, state: AppState) {
    let (sink, mut stream) = socket.split();
    let sender = PeerSender::spawn(sink, state.cfg.send_queue_depth);

    let Some(session) = state.registry.get(&session_id) else {
        reject(&sender, 4404, "session not found".to_string());
        return;
    };

    // The first frame must be a setup request, within the setup window.
    let setup = tokio::select! {
        frame = stream.next() => frame,
        _ = tokio::time::sleep(state.cfg.viewer_setup_timeout) => {
            info!(session = %session_id, "viewer setup timed out");
            reject(&sender, 4408, "setup timeout".to_string());
            return;
        }
    };
    let payload = match setup {
        Some(Ok(Message::Text(text))) => text.into_bytes(),
        Some(Ok(Message::Binary(data))) => data,
        _ => {
            reject(&sender, 4400, "expected setup message".to_string());
            return;
        }
    };
    let (action, name, cols, rows, created_by) = match ViewerRequest::parse(&payload) {
        Ok(ViewerRequest::Setup {
            action,
            name,
            cols,
            rows,
            created_by,
        }) => (action, name, cols, rows, created_by),
        Ok(other) => {
            debug!(session = %session_id, message = ?other, "first viewer frame was not setup");
            reject(&sender, 4400, "expected setup message".to_string());
            return;
        }
        Err(e) => {
            reject(&sender, 4400, format!("invalid setup: {}", e));
            return;
        }
    };

    if !session.has_control().await {
        reject(&sender, 4400, "session has no connected producer".to_string());
        return;
    }

    counter!("boardwalk_viewers_connected_total").increment(1);
    let viewer_id = Uuid::new_v4();
    let terminal_exists = session.status().await.terminals.iter().any(|t| t.name == name);

    // Which terminal this socket ends up attached to, if any. A failed
    // spawn leaves the viewer connected but unattached.
    let mut attached: Option<String> = None;

    match action {
        SetupAction::New if terminal_exists => {
            // "new" against an existing name joins it interactively.
            join_with_reply(&session, &name, viewer_id, ViewerRole::Interactive, &sender, &mut attached)
                .await;
        }
        SetupAction::New => {
            match session
                .request_spawn(viewer_id, sender.clone(), name, cols, rows, created_by)
                .await
            {
                Ok(rendezvous) => match rendezvous.await {
                    Ok(Ok(assigned)) => {
                        info!(session = %session_id, terminal = %assigned, viewer = %viewer_id, "viewer attached to fresh terminal");
                        attached = Some(assigned);
                    }
                    Ok(Err(error)) => {
                        debug!(session = %session_id, error = %error, "terminal spawn did not complete");
                    }
                    Err(_) => {
                        // Session tore down while we waited.
                        return;
                    }
                },
                Err(e) => {
                    sender.send_json(&ViewerReply::setup_err(e.to_string()));
                    reject(&sender, e.close_code(), e.to_string());
                    return;
                }
            }
        }
        SetupAction::Mirror => {
            if !terminal_exists {
                sender.send_json(&ViewerReply::setup_err("Terminal not found"));
                reject(&sender, 4404, "terminal not found".to_string());
                return;
            }
            join_with_reply(&session, &name, viewer_id, ViewerRole::Mirror, &sender, &mut attached)
                .await;
        }
    }

    // Steady state: raw bytes or JSON input/resize until the socket closes.
    while let Some(frame) = stream.next().await {
        let message = match frame {
            Ok(message) => message,
            Err(e) => {
                debug!(session = %session_id, viewer = %viewer_id, error = %e, "viewer socket error");
                break;
            }
        };
        let Some(terminal) = attached.as_deref() else {
            // No terminal to route to; drop whatever arrives.
            if matches!(message, Message::Close(_)) {
                break;
            }
            continue;
        };
        match message {
            Message::Binary(bytes) => session.on_input(terminal, viewer_id, bytes).await,
            Message::Text(text) => match ViewerRequest::parse(text.as_bytes()) {
                Ok(ViewerRequest::Input { data }) => {
                    session.on_input(terminal, viewer_id, data.into_bytes()).await;
                }
                Ok(ViewerRequest::Resize { cols, rows }) => {
                    session.on_viewer_resize(terminal, viewer_id, cols, rows).await;
                }
                Ok(ViewerRequest::Pause) => {
                    session.on_viewer_flow(terminal, viewer_id, true).await;
                }
                Ok(ViewerRequest::Resume) => {
                    session.on_viewer_flow(terminal, viewer_id, false).await;
                }
                Ok(ViewerRequest::Setup { .. }) => {
                    debug!(session = %session_id, viewer = %viewer_id, "ignoring repeated setup");
                }
                Err(e) => {
                    warn!(session = %session_id, viewer = %viewer_id, error = %e, "dropping malformed viewer frame");
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    session.detach_viewer(attached.as_deref(), viewer_id).await;
    debug!(session = %session_id, viewer = %viewer_id, "viewer disconnected");
}

async fn join_with_reply(
    session: &Arc<Session>,
    name: &str,
    viewer_id: Uuid,
    role: ViewerRole,
    sender: &PeerSender,
    attached: &mut Option<String>,
) {
    match session
        .join_existing(name, viewer_id, role, sender.clone())
        .await
    {
        Ok((name, cols, rows)) => {
            sender.send_json(&ViewerReply::setup_ok(name.clone(), cols, rows));
            *attached = Some(name);
        }
        Err(e) => {
            sender.send_json(&ViewerReply::setup_err(e.to_string()));
            reject(sender, e.close_code(), e.to_string());
        }
    }
}
