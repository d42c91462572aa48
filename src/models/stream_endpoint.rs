// Stream Endpoint Model
// A configured live source and the protocol class derived from its URL

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::models::StreamConfig;

/// Largest frame edge accepted for preview scaling
const MAX_DIMENSION: u32 = 16_384;

/// Protocol family of a source, decides which FFmpeg input flags apply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolClass {
    Rtmp,
    Rtsp,
    Hls,
}

impl ProtocolClass {
    /// Derive the protocol class from a source URL.
    /// Returns None for schemes the supervisor does not ingest.
    pub fn from_url(url: &str) -> Option<Self> {
        let lower = url.trim().to_ascii_lowercase();

        match lower.split_once("://") {
            Some(("rtmp", _)) | Some(("rtmps", _)) => Some(ProtocolClass::Rtmp),
            Some(("rtsp", _)) | Some(("rtsps", _)) => Some(ProtocolClass::Rtsp),
            Some(("http", _)) | Some(("https", _)) => Some(ProtocolClass::Hls),
            Some(_) => None,
            // Bare playlist paths are read like any other HLS source
            None if lower.ends_with(".m3u8") => Some(ProtocolClass::Hls),
            None => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolClass::Rtmp => "rtmp",
            ProtocolClass::Rtsp => "rtsp",
            ProtocolClass::Hls => "hls",
        }
    }
}

impl fmt::Display for ProtocolClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Frame dimensions, displayed and parsed as `WxH`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Size in bytes of one packed rgb24 frame
    pub fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }

    fn is_valid(&self) -> bool {
        (1..=MAX_DIMENSION).contains(&self.width) && (1..=MAX_DIMENSION).contains(&self.height)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .trim()
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("Expected WxH, got '{s}'"))?;
        let width = w.trim().parse().map_err(|e| format!("Invalid width '{w}': {e}"))?;
        let height = h.trim().parse().map_err(|e| format!("Invalid height '{h}': {e}"))?;
        Ok(Self { width, height })
    }
}

/// A live source as seen by the supervisor.
/// The protocol class is fixed at construction; the target size may change,
/// which always means a full reconnect of the preview pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEndpoint {
    name: String,
    url: String,
    protocol: ProtocolClass,
    size: Resolution,
}

impl StreamEndpoint {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        width: u32,
        height: u32,
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        let url = url.into().trim().to_string();

        if name.trim().is_empty() {
            return Err(ConfigError::EmptyName);
        }

        let protocol = ProtocolClass::from_url(&url).ok_or_else(|| ConfigError::InvalidUrl {
            name: name.clone(),
            url: url.clone(),
        })?;

        let size = Resolution::new(width, height);
        if !size.is_valid() {
            return Err(ConfigError::InvalidSize { name, width, height });
        }

        Ok(Self {
            name,
            url,
            protocol,
            size,
        })
    }

    pub fn from_config(config: &StreamConfig) -> Result<Self, ConfigError> {
        Self::new(config.name.clone(), config.url.clone(), config.width, config.height)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn protocol(&self) -> ProtocolClass {
        self.protocol
    }

    pub fn size(&self) -> Resolution {
        self.size
    }

    pub fn frame_len(&self) -> usize {
        self.size.frame_len()
    }

    /// Update the target size. Returns false when nothing changed.
    pub fn set_size(&mut self, width: u32, height: u32) -> Result<bool, ConfigError> {
        let size = Resolution::new(width, height);
        if !size.is_valid() {
            return Err(ConfigError::InvalidSize {
                name: self.name.clone(),
                width,
                height,
            });
        }
        if size == self.size {
            return Ok(false);
        }
        self.size = size;
        Ok(true)
    }
}
