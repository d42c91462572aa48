// Settings Model
// Application-wide configuration and the persisted stream list

use serde::{Deserialize, Serialize};

fn default_ffmpeg_path() -> String {
    String::new()
}

fn default_recordings_dir() -> String {
    String::new()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_retention_days() -> u32 {
    30
}

fn default_stream_enabled() -> bool {
    true
}

fn default_stream_width() -> u32 {
    640
}

fn default_stream_height() -> u32 {
    360
}

/// One configured source as stored in settings.json
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamConfig {
    pub name: String,
    pub url: String,
    #[serde(default = "default_stream_enabled")]
    pub enabled: bool,
    #[serde(default = "default_stream_width")]
    pub width: u32,
    #[serde(default = "default_stream_height")]
    pub height: u32,
}

impl StreamConfig {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            enabled: default_stream_enabled(),
            width: default_stream_width(),
            height: default_stream_height(),
        }
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Application settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    // FFmpeg
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,

    // Recordings (empty means <data dir>/recordings)
    #[serde(default = "default_recordings_dir")]
    pub recordings_dir: String,

    // Logging
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_retention_days")]
    pub log_retention_days: u32,

    // Sources
    #[serde(default)]
    pub streams: Vec<StreamConfig>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            recordings_dir: default_recordings_dir(),
            log_level: default_log_level(),
            log_retention_days: default_log_retention_days(),
            streams: Vec::new(),
        }
    }
}
