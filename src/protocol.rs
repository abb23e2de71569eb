//! Wire protocol for the three relay channel kinds.
//!
//! ## Terminal data protocol (binary, one websocket per terminal)
//!
//! **Relay → producer:**
//! - `'0'` + data → input to the PTY (keystrokes)
//! - `'1'` + JSON → resize `{"cols": N, "rows": N}`
//! - `'2'` → pause PTY output
//! - `'3'` → resume PTY output
//! - `'4'` + JSON → snapshot request `{"requestId": "..."}`
//!
//! **Producer → relay:**
//! - `'0'` + data → PTY output
//! - `'1'` + JSON → handshake / metadata
//! - `'2'` + JSON → PTY exited (integer exit code)
//! - `'3'` + JSON → snapshot response (base64 screen + cursor)
//!
//! ## Control protocol (JSON, one websocket per session)
//!
//! **Relay → producer:** `start_terminal`, `close_terminal`.
//! **Producer → relay:** `control_handshake`, `terminal_started`,
//! `terminal_closed`.
//!
//! Viewer and room channels carry the JSON message enums below plus raw
//! binary terminal bytes. Decoding fails closed: an empty frame, an unknown
//! prefix, or malformed JSON yields a [`ProtocolError`] and the caller drops
//! the frame.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::Principal;

/// Prefixes for relay → producer messages on the data channel
pub mod to_producer {
    pub const INPUT: u8 = b'0';
    pub const RESIZE: u8 = b'1';
    pub const PAUSE: u8 = b'2';
    pub const RESUME: u8 = b'3';
    pub const SNAPSHOT_REQUEST: u8 = b'4';
}

/// Prefixes for producer → relay messages on the data channel
pub mod from_producer {
    pub const OUTPUT: u8 = b'0';
    pub const HANDSHAKE: u8 = b'1';
    pub const EXIT: u8 = b'2';
    pub const SNAPSHOT: u8 = b'3';
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("empty frame")]
    EmptyFrame,
    #[error("unknown message prefix: {0:#x}")]
    UnknownPrefix(u8),
    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid screen encoding: {0}")]
    Screen(#[from] base64::DecodeError),
}

/// Terminal geometry carried in resize frames
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resize {
    pub cols: u16,
    pub rows: u16,
}

/// Data-channel handshake the producer sends after connecting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataHandshake {
    pub version: String,
    pub shell: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cols: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<u16>,
}

/// Snapshot of a terminal screen at an instant, used to synchronize late
/// joiners. The screen is base64 on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(rename = "requestId")]
    pub request_id: String,
    pub screen: String,
    pub cols: u16,
    pub rows: u16,
    #[serde(rename = "cursorX")]
    pub cursor_x: u16,
    #[serde(rename = "cursorY")]
    pub cursor_y: u16,
}

impl Snapshot {
    pub fn screen_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(BASE64_STANDARD.decode(&self.screen)?)
    }

    pub fn encode_screen(bytes: &[u8]) -> String {
        BASE64_STANDARD.encode(bytes)
    }
}

/// Messages the relay sends on a producer data channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayData {
    Input(Vec<u8>),
    Resize(Resize),
    Pause,
    Resume,
    SnapshotRequest { request_id: String },
}

impl RelayData {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            RelayData::Input(data) => prefixed(to_producer::INPUT, data),
            RelayData::Resize(resize) => {
                // serialization of a two-field struct cannot fail
                let json = serde_json::to_vec(resize).unwrap_or_default();
                prefixed(to_producer::RESIZE, &json)
            }
            RelayData::Pause => vec![to_producer::PAUSE],
            RelayData::Resume => vec![to_producer::RESUME],
            RelayData::SnapshotRequest { request_id } => {
                let json = serde_json::json!({ "requestId": request_id });
                let json = serde_json::to_vec(&json).unwrap_or_default();
                prefixed(to_producer::SNAPSHOT_REQUEST, &json)
            }
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        let (prefix, payload) = split_frame(data)?;
        match prefix {
            to_producer::INPUT => Ok(RelayData::Input(payload.to_vec())),
            to_producer::RESIZE => Ok(RelayData::Resize(serde_json::from_slice(payload)?)),
            to_producer::PAUSE => Ok(RelayData::Pause),
            to_producer::RESUME => Ok(RelayData::Resume),
            to_producer::SNAPSHOT_REQUEST => {
                #[derive(Deserialize)]
                struct Req {
                    #[serde(rename = "requestId")]
                    request_id: String,
                }
                let req: Req = serde_json::from_slice(payload)?;
                Ok(RelayData::SnapshotRequest {
                    request_id: req.request_id,
                })
            }
            other => Err(ProtocolError::UnknownPrefix(other)),
        }
    }
}

/// Messages the relay receives on a producer data channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProducerData {
    Output(Vec<u8>),
    Handshake(DataHandshake),
    Exit(i32),
    Snapshot(Snapshot),
}

impl ProducerData {
    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        let (prefix, payload) = split_frame(data)?;
        match prefix {
            from_producer::OUTPUT => Ok(ProducerData::Output(payload.to_vec())),
            from_producer::HANDSHAKE => Ok(ProducerData::Handshake(serde_json::from_slice(payload)?)),
            from_producer::EXIT => Ok(ProducerData::Exit(serde_json::from_slice(payload)?)),
            from_producer::SNAPSHOT => Ok(ProducerData::Snapshot(serde_json::from_slice(payload)?)),
            other => Err(ProtocolError::UnknownPrefix(other)),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        match self {
            ProducerData::Output(data) => Ok(prefixed(from_producer::OUTPUT, data)),
            ProducerData::Handshake(handshake) => {
                Ok(prefixed(from_producer::HANDSHAKE, &serde_json::to_vec(handshake)?))
            }
            ProducerData::Exit(code) => Ok(prefixed(from_producer::EXIT, &serde_json::to_vec(code)?)),
            ProducerData::Snapshot(snapshot) => {
                Ok(prefixed(from_producer::SNAPSHOT, &serde_json::to_vec(snapshot)?))
            }
        }
    }
}

fn prefixed(prefix: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(1 + payload.len());
    frame.push(prefix);
    frame.extend_from_slice(payload);
    frame
}

fn split_frame(data: &[u8]) -> Result<(u8, &[u8]), ProtocolError> {
    match data.split_first() {
        Some((prefix, payload)) => Ok((*prefix, payload)),
        None => Err(ProtocolError::EmptyFrame),
    }
}

// ============================================================================
// Control channel (JSON, one message per frame)
// ============================================================================

/// Control-channel handshake metadata the producer reports on attach
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlHandshake {
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, rename = "workingDir", skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
}

/// Commands the relay sends on the control channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlCommand {
    StartTerminal {
        name: String,
        cols: u16,
        rows: u16,
        #[serde(rename = "requestId")]
        request_id: String,
    },
    CloseTerminal {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signal: Option<i32>,
    },
}

/// Replies and notifications the producer sends on the control channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlReply {
    ControlHandshake(ControlHandshake),
    TerminalStarted {
        name: String,
        #[serde(rename = "requestId")]
        request_id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    TerminalClosed {
        name: String,
        #[serde(rename = "exitCode")]
        exit_code: i32,
    },
}

impl ControlReply {
    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.is_empty() {
            return Err(ProtocolError::EmptyFrame);
        }
        Ok(serde_json::from_slice(data)?)
    }
}

// ============================================================================
// Viewer channel
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetupAction {
    New,
    Mirror,
}

/// Messages a viewer sends after connecting. The first frame must be
/// `Setup`; afterwards input arrives either as raw binary frames or as
/// `Input` JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ViewerRequest {
    Setup {
        action: SetupAction,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cols: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rows: Option<u16>,
        #[serde(default, rename = "createdBy", skip_serializing_if = "Option::is_none")]
        created_by: Option<Principal>,
    },
    Input {
        data: String,
    },
    Resize {
        cols: u16,
        rows: u16,
    },
    Pause,
    Resume,
}

impl ViewerRequest {
    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.is_empty() {
            return Err(ProtocolError::EmptyFrame);
        }
        Ok(serde_json::from_slice(data)?)
    }
}

/// Control JSON the relay sends to viewers; terminal output is raw binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ViewerReply {
    SetupResponse {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cols: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rows: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Exit {
        code: i32,
    },
    Disconnect {
        reason: String,
    },
}

impl ViewerReply {
    pub fn setup_ok(name: String, cols: u16, rows: u16) -> Self {
        ViewerReply::SetupResponse {
            success: true,
            name: Some(name),
            cols: Some(cols),
            rows: Some(rows),
            error: None,
        }
    }

    pub fn setup_err(error: impl Into<String>) -> Self {
        ViewerReply::SetupResponse {
            success: false,
            name: None,
            cols: None,
            rows: None,
            error: Some(error.into()),
        }
    }
}

// ============================================================================
// Room ("jam") channel
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PanelSide {
    Left,
    Right,
}

/// One panel's selection in the shared two-panel view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PanelSelection {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(default, rename = "terminalName", skip_serializing_if = "Option::is_none")]
    pub terminal_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PanelState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left: Option<PanelSelection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right: Option<PanelSelection>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoomClientMessage {
    PanelSelect {
        panel: PanelSide,
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(default, rename = "terminalName", skip_serializing_if = "Option::is_none")]
        terminal_name: Option<String>,
    },
    AddSession {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    RemoveSession {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    CloseTerminal {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "terminalName")]
        terminal_name: String,
    },
}

impl RoomClientMessage {
    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.is_empty() {
            return Err(ProtocolError::EmptyFrame);
        }
        Ok(serde_json::from_slice(data)?)
    }
}

/// A participant as shown to room clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub id: String,
    pub login: String,
    pub connected: bool,
}

/// A pool session as shown to room clients, enriched with live status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSessionInfo {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, rename = "workingDir", skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, rename = "addedBy", skip_serializing_if = "Option::is_none")]
    pub added_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoomServerMessage {
    JamState {
        #[serde(rename = "roomId")]
        room_id: String,
        owner: String,
        participants: Vec<ParticipantInfo>,
        sessions: Vec<PoolSessionInfo>,
        panels: PanelState,
    },
    ParticipantUpdate {
        action: String,
        participant: ParticipantInfo,
    },
    SessionPoolUpdate {
        action: String,
        session: PoolSessionInfo,
    },
    PanelStateUpdate {
        panels: PanelState,
    },
    SessionStatusUpdate {
        #[serde(rename = "sessionId")]
        session_id: String,
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    TerminalClosedUpdate {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "terminalName")]
        terminal_name: String,
        #[serde(rename = "exitCode")]
        exit_code: i32,
    },
    Error {
        code: String,
    },
}
