// Connection State Model
// Per-stream state machine states, status labels and status snapshots

use serde::Serialize;

use crate::models::Resolution;

/// Connection state of one stream controller.
/// `Stopped` doubles as the disconnected state: nothing is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    #[default]
    Stopped,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl ConnectionState {
    /// Human-readable label for status displays
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Stopped => "Stopped",
            ConnectionState::Connecting => "Connecting…",
            ConnectionState::Connected => "Connected",
            ConnectionState::Reconnecting => "Reconnecting…",
            ConnectionState::Failed => "Error",
        }
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Stopped => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
            ConnectionState::Reconnecting => 3,
            ConnectionState::Failed => 4,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Reconnecting,
            4 => ConnectionState::Failed,
            _ => ConnectionState::Stopped,
        }
    }
}

/// Status label shown while a failed attempt waits for its retry
pub fn retry_status(retry: u32) -> String {
    format!("Error (Retry {retry})")
}

/// Point-in-time view of one stream, used by fleet status queries
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStatus {
    pub name: String,
    pub url: String,
    pub state: ConnectionState,
    pub connected: bool,
    pub running: bool,
    pub recording: bool,
    pub recording_active: bool,
    pub target: Resolution,
    pub detected: Option<Resolution>,
    pub frames: u64,
    pub retries: u32,
}
