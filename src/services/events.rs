// Event Sink
// Notification contract between the supervisors and their callers.
// Events are emitted on whatever task produced them; callers marshal to
// their own context.

use serde::Serialize;
use serde_json::Value;

use crate::models::ConnectionState;

pub const EVENT_STREAM_STATUS: &str = "stream_status";
pub const EVENT_STREAM_RESOLUTION: &str = "stream_resolution";
pub const EVENT_STREAM_ERROR: &str = "stream_error";
pub const EVENT_RECORDING_STARTED: &str = "recording_started";
pub const EVENT_RECORDING_STOPPED: &str = "recording_stopped";
pub const EVENT_RECORDING_RESTARTING: &str = "recording_restarting";

pub trait EventSink: Send + Sync {
    fn emit(&self, event: &str, payload: Value);
}

pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: &str, _payload: Value) {}
}

/// Writes every event to the log; used by the standalone binary
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn emit(&self, event: &str, payload: Value) {
        match event {
            EVENT_STREAM_ERROR | EVENT_RECORDING_RESTARTING => {
                log::warn!("[Event:{event}] {payload}");
            }
            _ => log::info!("[Event:{event}] {payload}"),
        }
    }
}

pub fn emit_event<T: Serialize>(sink: &dyn EventSink, event: &str, payload: &T) {
    if let Ok(value) = serde_json::to_value(payload) {
        sink.emit(event, value);
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent<'a> {
    pub name: &'a str,
    pub state: ConnectionState,
    pub status: &'a str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionEvent<'a> {
    pub name: &'a str,
    pub resolution: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamErrorEvent<'a> {
    pub name: &'a str,
    pub error: String,
    pub retry: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingEvent<'a> {
    pub name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
