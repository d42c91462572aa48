// Error Types
// Engine launch, per-attempt and configuration failures

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::services::ProcessExit;

/// Errors raised while locating or starting the FFmpeg executable
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("FFmpeg binary not found ({} locations searched)", .searched.len())]
    BinaryNotFound { searched: Vec<PathBuf> },

    #[error("Failed to start FFmpeg at {path:?}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to capture FFmpeg {0}")]
    MissingPipe(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Missing binaries are fatal at startup; everything else is retried
    pub fn is_binary_missing(&self) -> bool {
        matches!(self, EngineError::BinaryNotFound { .. })
    }
}

/// Why a single preview connect attempt ended
#[derive(Error, Debug)]
pub enum AttemptError {
    #[error(transparent)]
    Launch(#[from] EngineError),

    #[error("FFmpeg {exit} after {frames} frames")]
    Exited { exit: ProcessExit, frames: u64 },

    #[error("FFmpeg {exit} in the middle of a frame ({filled}/{expected} bytes)")]
    ExitedMidFrame {
        exit: ProcessExit,
        filled: usize,
        expected: usize,
    },

    #[error("No frame data for {0:?}")]
    Stalled(Duration),

    #[error("Read error: {0}")]
    Read(#[source] std::io::Error),
}

/// Invalid stream configuration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Stream name must not be empty")]
    EmptyName,

    #[error("Unsupported stream URL for '{name}': {url}")]
    InvalidUrl { name: String, url: String },

    #[error("Invalid frame size for '{name}': {width}x{height}")]
    InvalidSize {
        name: String,
        width: u32,
        height: u32,
    },

    #[error("Duplicate stream name: {0}")]
    DuplicateName(String),
}
