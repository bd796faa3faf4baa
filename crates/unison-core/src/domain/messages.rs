//! Wire message types exchanged with display clients.
//!
//! Envelopes are `{ "type": "...", "payload": { ... } }` with camelCase payload
//! fields. Decoding happens once at the transport boundary (see
//! [`MessageCodec`](crate::application::ports::MessageCodec)); everything
//! behind it dispatches on these enums. Pure data — no I/O.

use serde::{Deserialize, Serialize};

use super::identity::{ClientRole, CommandId, PingId};

// ---------------------------------------------------------------------------
// Client → server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ClientMsg {
    // -- Handshake --
    ClientIdentify {
        role: ClientRole,
        #[serde(default)]
        display_name: Option<String>,
        #[serde(default)]
        capabilities: Vec<String>,
    },

    // -- Clock sync --
    ClockSyncResponse {
        ping_id: PingId,
        /// Echo of the ping's `serverTime`.
        server_time: i64,
        client_time: i64,
        response_time: i64,
    },

    // -- Readiness / position --
    SyncReady {
        command_id: CommandId,
        buffer_level: f64,
        #[serde(default)]
        video_duration: Option<f64>,
    },
    SyncReportPosition {
        current_time: f64,
    },

    // -- Controller requests (accepted from `control` clients only) --
    ControlPlay {
        video_url: String,
        #[serde(default)]
        video_time: f64,
    },
    ControlPause,
    ControlResume,
}

impl ClientMsg {
    /// Wire name of the message, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ClientIdentify { .. } => "client_identify",
            Self::ClockSyncResponse { .. } => "clock_sync_response",
            Self::SyncReady { .. } => "sync_ready",
            Self::SyncReportPosition { .. } => "sync_report_position",
            Self::ControlPlay { .. } => "control_play",
            Self::ControlPause => "control_pause",
            Self::ControlResume => "control_resume",
        }
    }
}

// ---------------------------------------------------------------------------
// Server → client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ServerMsg {
    ClockSyncPing {
        ping_id: PingId,
        server_time: i64,
    },
    /// What the server measured from the client's answer to `ping_id`.
    ClockSyncResult {
        ping_id: PingId,
        latency_ms: f64,
        /// `client_clock - server_clock`.
        offset_ms: f64,
    },
    SyncPreload {
        command_id: CommandId,
        video_url: String,
    },
    SyncPlay {
        command_id: CommandId,
        video_url: String,
        /// Playback offset (seconds) the client must be at on `scheduled_time`.
        video_time: f64,
        /// Server clock, epoch milliseconds.
        scheduled_time: i64,
    },
    SyncPause {
        command_id: CommandId,
        scheduled_time: i64,
    },
    SyncCheckPosition,
}

impl ServerMsg {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ClockSyncPing { .. } => "clock_sync_ping",
            Self::ClockSyncResult { .. } => "clock_sync_result",
            Self::SyncPreload { .. } => "sync_preload",
            Self::SyncPlay { .. } => "sync_play",
            Self::SyncPause { .. } => "sync_pause",
            Self::SyncCheckPosition => "sync_check_position",
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed message: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("failed to encode {kind}: {source}")]
    Encode {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}
