// Resolution Sniffer
// Reads FFmpeg diagnostics: detects the source video size and keeps recent
// lines for failure reporting

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, OnceLock};

use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::models::Resolution;
use crate::services::{emit_event, EventSink, PipeReader, ResolutionEvent, EVENT_STREAM_RESOLUTION};

/// Number of stderr lines kept for error reporting
pub const RECENT_LINE_LIMIT: usize = 40;

static VIDEO_SIZE_REGEX: OnceLock<Option<Regex>> = OnceLock::new();
const VIDEO_SIZE_PATTERN: &str = r"Video:.*?\b(\d{2,5})x(\d{2,5})\b";

/// Extract `WIDTHxHEIGHT` from an FFmpeg stream-info line
pub fn parse_video_size(line: &str) -> Option<Resolution> {
    let re = VIDEO_SIZE_REGEX
        .get_or_init(|| Regex::new(VIDEO_SIZE_PATTERN).ok())
        .as_ref()?;
    let caps = re.captures(line)?;
    let width = caps.get(1)?.as_str().parse().ok()?;
    let height = caps.get(2)?.as_str().parse().ok()?;
    Some(Resolution::new(width, height))
}

fn is_error_line(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    ["error", "failed", "invalid", "refused", "timed out", "not found", "unauthorized"]
        .iter()
        .any(|marker| lower.contains(marker))
}

/// Bounded history of diagnostic lines
#[derive(Debug, Default, Clone)]
pub struct DiagnosticRing {
    lines: VecDeque<String>,
}

impl DiagnosticRing {
    pub fn new() -> Self {
        Self {
            lines: VecDeque::with_capacity(RECENT_LINE_LIMIT),
        }
    }

    pub fn push(&mut self, line: &str) {
        if self.lines.len() == RECENT_LINE_LIMIT {
            self.lines.pop_front();
        }
        self.lines.push_back(line.to_string());
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    pub fn last_line(&self) -> Option<&str> {
        self.lines.back().map(String::as_str)
    }

    /// Scan newest-first for a known failure cause
    pub fn failure_detail(&self) -> Option<String> {
        for line in self.lines.iter().rev() {
            // Windows socket error codes
            if line.contains("10054") {
                return Some("Connection reset by remote server (10054 - WSAECONNRESET)".to_string());
            }
            if line.contains("10060") {
                return Some("Connection timed out (10060 - WSAETIMEDOUT)".to_string());
            }
            if line.contains("10061") {
                return Some("Connection refused by server (10061 - WSAECONNREFUSED)".to_string());
            }

            if line.contains("Connection refused") {
                return Some("Source refused connection".to_string());
            }
            if line.contains("Connection timed out") {
                return Some("Source connection timed out".to_string());
            }
            if line.contains("Connection reset by peer") {
                return Some("Connection reset by source".to_string());
            }
            if line.contains("401 Unauthorized") {
                return Some("Source rejected credentials (401 Unauthorized)".to_string());
            }
            if line.contains("404 Not Found") {
                return Some("Stream not found on source (404 Not Found)".to_string());
            }
            if line.contains("No route to host") {
                return Some("No route to source host".to_string());
            }
            if line.contains("Name or service not known") || line.contains("Failed to resolve hostname") {
                return Some("Could not resolve source host".to_string());
            }
            if line.contains("Invalid data found when processing input") {
                return Some("Source sent invalid data".to_string());
            }
            if line.contains("Input/output error") {
                return Some("I/O error: network connection lost".to_string());
            }
        }
        None
    }
}

/// Per-attempt resolution detector.
/// Only the first stream-info match of an attempt counts, and it is reported
/// only when it differs from the last value seen for the stream.
#[derive(Debug)]
pub struct ResolutionSniffer {
    name: String,
    detected: Arc<Mutex<Option<Resolution>>>,
    matched: bool,
    ring: DiagnosticRing,
}

impl ResolutionSniffer {
    pub fn new(name: impl Into<String>, detected: Arc<Mutex<Option<Resolution>>>) -> Self {
        Self {
            name: name.into(),
            detected,
            matched: false,
            ring: DiagnosticRing::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Feed one line; returns a resolution when a new value was detected
    pub fn observe(&mut self, line: &str) -> Option<Resolution> {
        self.ring.push(line);

        if self.matched {
            return None;
        }
        let resolution = parse_video_size(line)?;
        self.matched = true;

        let Ok(mut detected) = self.detected.lock() else {
            return None;
        };
        if *detected == Some(resolution) {
            return None;
        }
        *detected = Some(resolution);
        Some(resolution)
    }

    pub fn ring(&self) -> &DiagnosticRing {
        &self.ring
    }

    pub fn failure_detail(&self) -> Option<String> {
        self.ring.failure_detail()
    }
}

/// Read stderr line by line until EOF, calling `on_line` for each non-empty
/// line. Invalid UTF-8 is replaced rather than ending the read.
pub async fn read_diagnostic_lines<F>(stderr: PipeReader, mut on_line: F)
where
    F: FnMut(&str),
{
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let line = text.trim_end();
                if !line.is_empty() {
                    on_line(line);
                }
            }
            Err(e) => {
                log::debug!("FFmpeg stderr read ended: {e}");
                break;
            }
        }
    }
}

/// Drain a preview attempt's stderr through the sniffer.
/// Returns the sniffer so the caller can inspect the recent lines.
pub async fn sniff_diagnostics(
    stderr: PipeReader,
    mut sniffer: ResolutionSniffer,
    events: Arc<dyn EventSink>,
) -> ResolutionSniffer {
    read_diagnostic_lines(stderr, |line| {
        if is_error_line(line) {
            log::warn!("[Stream:{}] FFmpeg: {line}", sniffer.name());
        } else {
            log::trace!("[Stream:{}] FFmpeg: {line}", sniffer.name());
        }

        if let Some(resolution) = sniffer.observe(line) {
            log::info!("[Stream:{}] Detected source resolution {resolution}", sniffer.name());
            emit_event(
                events.as_ref(),
                EVENT_STREAM_RESOLUTION,
                &ResolutionEvent {
                    name: sniffer.name(),
                    resolution: resolution.to_string(),
                },
            );
        }
    })
    .await;

    sniffer
}
