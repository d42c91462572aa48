// Frame Decoder
// Reads fixed-size rgb24 frames from a preview subprocess and hands them
// to a frame sink

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::AttemptError;
use crate::models::Resolution;
use crate::services::{cancellable_sleep, EngineProcess, PipeReader};

/// Pause after an empty read while the subprocess is still alive
pub const ZERO_READ_BACKOFF: Duration = Duration::from_millis(50);

/// Empty reads for this long with a live subprocess count as a stall
pub const STALL_TIMEOUT: Duration = Duration::from_secs(15);

/// Receives decoded frames. The buffer is only valid for the duration of
/// the call; implementations copy what they keep.
pub trait FrameSink: Send + Sync {
    fn on_frame(&self, frame: &[u8], width: u32, height: u32);
}

/// Hands out the sink for each named stream
pub trait FrameSinkFactory: Send + Sync {
    fn sink_for(&self, name: &str) -> Arc<dyn FrameSink>;
}

/// Discards frames (headless runs)
#[derive(Debug, Default, Clone, Copy)]
pub struct NullFrameSink;

impl FrameSink for NullFrameSink {
    fn on_frame(&self, _frame: &[u8], _width: u32, _height: u32) {}
}

impl FrameSinkFactory for NullFrameSink {
    fn sink_for(&self, _name: &str) -> Arc<dyn FrameSink> {
        Arc::new(NullFrameSink)
    }
}

/// A copied frame as delivered to subscribers
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
}

/// Fans frames out to any number of subscribers.
/// Slow subscribers lag and drop frames instead of blocking the decoder.
pub struct BroadcastFrameSink {
    frame_tx: broadcast::Sender<RawFrame>,
}

impl BroadcastFrameSink {
    pub fn new(capacity: usize) -> Self {
        let (frame_tx, _) = broadcast::channel(capacity.max(1));
        Self { frame_tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RawFrame> {
        self.frame_tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.frame_tx.receiver_count()
    }
}

impl FrameSink for BroadcastFrameSink {
    fn on_frame(&self, frame: &[u8], width: u32, height: u32) {
        if self.frame_tx.receiver_count() == 0 {
            return;
        }
        let _ = self.frame_tx.send(RawFrame {
            data: Bytes::copy_from_slice(frame),
            width,
            height,
        });
    }
}

/// One broadcast sink per stream name, created on first use
pub struct FrameHub {
    capacity: usize,
    sinks: Mutex<HashMap<String, Arc<BroadcastFrameSink>>>,
}

impl FrameHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            sinks: Mutex::new(HashMap::new()),
        }
    }

    fn sink(&self, name: &str) -> Arc<BroadcastFrameSink> {
        let mut sinks = match self.sinks.lock() {
            Ok(sinks) => sinks,
            Err(poisoned) => poisoned.into_inner(),
        };
        sinks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(BroadcastFrameSink::new(self.capacity)))
            .clone()
    }

    /// Subscribe to a stream's frames (works before the stream connects)
    pub fn subscribe(&self, name: &str) -> broadcast::Receiver<RawFrame> {
        self.sink(name).subscribe()
    }
}

impl FrameSinkFactory for FrameHub {
    fn sink_for(&self, name: &str) -> Arc<dyn FrameSink> {
        self.sink(name)
    }
}

/// How a decode attempt ended
#[derive(Debug)]
pub enum DecodeEnd {
    /// The attempt's token was cancelled
    Cancelled,
    Failed(AttemptError),
}

/// Per-attempt frame reader. Owns the frame buffer; never delivers a
/// partial frame.
pub struct FrameDecoder {
    name: String,
    size: Resolution,
    buffer: Vec<u8>,
    stall_timeout: Duration,
}

impl FrameDecoder {
    pub fn new(name: impl Into<String>, size: Resolution) -> Self {
        Self {
            name: name.into(),
            size,
            buffer: vec![0; size.frame_len()],
            stall_timeout: STALL_TIMEOUT,
        }
    }

    pub fn with_stall_timeout(mut self, stall_timeout: Duration) -> Self {
        self.stall_timeout = stall_timeout;
        self
    }

    /// Read frames until cancellation or failure.
    /// `on_frame` receives the running frame count after each delivery.
    pub async fn run<F>(
        &mut self,
        reader: &mut PipeReader,
        process: &mut EngineProcess,
        sink: &dyn FrameSink,
        cancel: &CancellationToken,
        mut on_frame: F,
    ) -> DecodeEnd
    where
        F: FnMut(u64),
    {
        let expected = self.buffer.len();
        let mut filled = 0usize;
        let mut frames = 0u64;
        let mut idle_since: Option<Instant> = None;

        loop {
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => return DecodeEnd::Cancelled,
                read = reader.read(&mut self.buffer[filled..]) => read,
            };

            match read {
                Ok(0) => {
                    match process.try_wait() {
                        Ok(Some(exit)) => {
                            log::debug!("[Stream:{}] FFmpeg {exit} after {frames} frames", self.name);
                            let err = if filled > 0 {
                                AttemptError::ExitedMidFrame {
                                    exit,
                                    filled,
                                    expected,
                                }
                            } else {
                                AttemptError::Exited { exit, frames }
                            };
                            return DecodeEnd::Failed(err);
                        }
                        Ok(None) => {}
                        Err(e) => return DecodeEnd::Failed(AttemptError::Read(e)),
                    }

                    let since = *idle_since.get_or_insert_with(Instant::now);
                    if since.elapsed() >= self.stall_timeout {
                        log::warn!(
                            "[Stream:{}] No frame data for {:?}, giving up on attempt",
                            self.name,
                            self.stall_timeout
                        );
                        return DecodeEnd::Failed(AttemptError::Stalled(self.stall_timeout));
                    }

                    if cancellable_sleep(ZERO_READ_BACKOFF, cancel).await {
                        return DecodeEnd::Cancelled;
                    }
                }
                Ok(n) => {
                    idle_since = None;
                    filled += n;
                    if filled == expected {
                        sink.on_frame(&self.buffer, self.size.width, self.size.height);
                        filled = 0;
                        frames += 1;
                        on_frame(frames);
                    }
                }
                Err(e) => return DecodeEnd::Failed(AttemptError::Read(e)),
            }
        }
    }
}
