// Stream Controller
// Per-stream connection state machine: runs preview attempts, retries
// failures with backoff and coordinates the stream's recording supervisor.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{AttemptError, ConfigError};
use crate::models::{retry_status, ConnectionState, Resolution, StreamEndpoint, StreamStatus};
use crate::services::{
    emit_event, redact_url, sniff_diagnostics, DecodeEnd, EngineLauncher, EventSink, FrameDecoder,
    FrameSink, LaunchMode, RecordingSupervisor, ResolutionSniffer, StatusEvent, StreamErrorEvent,
    EVENT_STREAM_ERROR, EVENT_STREAM_STATUS, GRACEFUL_STOP_TIMEOUT,
};

/// Wait after a failed attempt before connecting again
pub const RETRY_BACKOFF: Duration = Duration::from_secs(5);

/// Settle time before the first attempt of an explicit reconnect
pub const RECONNECT_SETTLE: Duration = Duration::from_secs(1);

/// How long to wait for the stderr reader once the attempt is over
const SNIFFER_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Sleep unless cancelled first. Returns true when cancelled.
pub async fn cancellable_sleep(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

/// A failed attempt plus whatever the diagnostics said about it
struct AttemptFailure {
    error: AttemptError,
    detail: Option<String>,
}

impl From<AttemptError> for AttemptFailure {
    fn from(error: AttemptError) -> Self {
        Self { error, detail: None }
    }
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{}: {detail}", self.error),
            None => write!(f, "{}", self.error),
        }
    }
}

struct ConnectLoop {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct ControllerShared {
    name: String,
    endpoint: Arc<RwLock<StreamEndpoint>>,
    launcher: Arc<dyn EngineLauncher>,
    sink: Arc<dyn FrameSink>,
    events: Arc<dyn EventSink>,
    recorder: RecordingSupervisor,
    state: AtomicU8,
    running: AtomicBool,
    frames: AtomicU64,
    retries: AtomicU32,
    detected: Arc<Mutex<Option<Resolution>>>,
}

impl ControllerShared {
    fn endpoint(&self) -> StreamEndpoint {
        match self.endpoint.read() {
            Ok(endpoint) => endpoint.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Update the state and notify. Unchanged states are only re-sent when
    /// they carry a custom status label.
    fn set_state(&self, state: ConnectionState, status: Option<String>) {
        let previous = self.state.swap(state.as_u8(), Ordering::SeqCst);
        if previous == state.as_u8() && status.is_none() {
            return;
        }

        let status = status.unwrap_or_else(|| state.label().to_string());
        log::debug!("[Stream:{}] Status: {status}", self.name);
        emit_event(
            self.events.as_ref(),
            EVENT_STREAM_STATUS,
            &StatusEvent {
                name: &self.name,
                state,
                status: &status,
            },
        );
    }

    fn mark_connected(&self) {
        self.retries.store(0, Ordering::SeqCst);
        log::info!("[Stream:{}] Connected", self.name);
        self.set_state(ConnectionState::Connected, None);

        if self.recorder.is_recording() && !self.recorder.is_active() {
            let recorder = self.recorder.clone();
            tokio::spawn(async move { recorder.resume_if_requested().await });
        }
    }
}

/// Supervises one stream: preview attempts, retries and recording
pub struct StreamController {
    shared: Arc<ControllerShared>,
    control: AsyncMutex<Option<ConnectLoop>>,
}

impl StreamController {
    pub fn new(
        endpoint: StreamEndpoint,
        launcher: Arc<dyn EngineLauncher>,
        sink: Arc<dyn FrameSink>,
        events: Arc<dyn EventSink>,
        recordings_dir: PathBuf,
    ) -> Self {
        let name = endpoint.name().to_string();
        let endpoint = Arc::new(RwLock::new(endpoint));
        let recorder = RecordingSupervisor::new(
            endpoint.clone(),
            launcher.clone(),
            events.clone(),
            recordings_dir,
        );

        Self {
            shared: Arc::new(ControllerShared {
                name,
                endpoint,
                launcher,
                sink,
                events,
                recorder,
                state: AtomicU8::new(ConnectionState::Stopped.as_u8()),
                running: AtomicBool::new(false),
                frames: AtomicU64::new(0),
                retries: AtomicU32::new(0),
                detected: Arc::new(Mutex::new(None)),
            }),
            control: AsyncMutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Begin connecting. No-op if already running.
    pub async fn start(&self) {
        let mut control = self.control.lock().await;
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return;
        }

        log::info!(
            "[Stream:{}] Starting ({})",
            self.shared.name,
            redact_url(self.shared.endpoint().url())
        );
        self.shared.retries.store(0, Ordering::SeqCst);
        self.shared.set_state(ConnectionState::Connecting, None);
        *control = Some(self.spawn_loop(Duration::ZERO));
    }

    /// Stop everything: cancel the attempt, stop recording and clear its
    /// intent. Returns once both subprocesses are gone.
    pub async fn stop(&self) {
        let mut control = self.control.lock().await;
        self.shared.running.store(false, Ordering::SeqCst);

        let teardown = async {
            if let Some(connect) = control.take() {
                connect.cancel.cancel();
                if let Err(e) = connect.task.await {
                    log::warn!("[Stream:{}] Connect task ended abnormally: {e}", self.shared.name);
                }
            }
        };
        tokio::join!(self.shared.recorder.request_stop(), teardown);

        self.shared.set_state(ConnectionState::Stopped, None);
        log::info!("[Stream:{}] Stopped", self.shared.name);
    }

    /// Tear down the current attempt and connect again after a short settle.
    /// Recording intent survives; recording resumes on the next first frame.
    /// Ignored while stopped.
    pub async fn reconnect(&self) {
        let mut control = self.control.lock().await;
        if !self.shared.running.load(Ordering::SeqCst) {
            log::debug!("[Stream:{}] Reconnect ignored, stream is stopped", self.shared.name);
            return;
        }

        log::info!("[Stream:{}] Reconnecting", self.shared.name);
        let teardown = async {
            if let Some(connect) = control.take() {
                connect.cancel.cancel();
                if let Err(e) = connect.task.await {
                    log::warn!("[Stream:{}] Connect task ended abnormally: {e}", self.shared.name);
                }
            }
        };
        tokio::join!(self.shared.recorder.pause(), teardown);

        self.shared.set_state(ConnectionState::Reconnecting, None);
        *control = Some(self.spawn_loop(RECONNECT_SETTLE));
    }

    pub async fn reconnect_now(&self) {
        self.reconnect().await;
    }

    /// Change the preview size. Equal sizes are a no-op; otherwise a
    /// running stream reconnects. Returns whether the size changed.
    pub async fn change_resolution(&self, width: u32, height: u32) -> Result<bool, ConfigError> {
        let changed = match self.shared.endpoint.write() {
            Ok(mut endpoint) => endpoint.set_size(width, height)?,
            Err(poisoned) => poisoned.into_inner().set_size(width, height)?,
        };
        if !changed {
            return Ok(false);
        }

        log::info!("[Stream:{}] Preview size changed to {width}x{height}", self.shared.name);
        if self.shared.running.load(Ordering::SeqCst) {
            self.reconnect().await;
        }
        Ok(true)
    }

    /// Start recording now, or queue it until the stream connects
    pub async fn request_recording_start(&self) {
        if self.is_connected() {
            self.shared.recorder.request_start().await;
            return;
        }

        log::info!("[Stream:{}] Recording queued until the stream connects", self.shared.name);
        self.shared.recorder.queue();
        // The first frame may have landed between the check and the queue
        if self.is_connected() {
            self.shared.recorder.resume_if_requested().await;
        }
    }

    pub async fn request_recording_stop(&self) {
        self.shared.recorder.request_stop().await;
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.state() == ConnectionState::Connected
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Recording intent
    pub fn is_recording(&self) -> bool {
        self.shared.recorder.is_recording()
    }

    pub fn is_recording_active(&self) -> bool {
        self.shared.recorder.is_active()
    }

    /// Frames delivered by the current attempt
    pub fn frames_delivered(&self) -> u64 {
        self.shared.frames.load(Ordering::SeqCst)
    }

    pub fn retry_count(&self) -> u32 {
        self.shared.retries.load(Ordering::SeqCst)
    }

    pub fn detected_resolution(&self) -> Option<Resolution> {
        self.shared.detected.lock().ok().and_then(|detected| *detected)
    }

    pub fn endpoint(&self) -> StreamEndpoint {
        self.shared.endpoint()
    }

    pub fn recorder(&self) -> &RecordingSupervisor {
        &self.shared.recorder
    }

    pub fn status(&self) -> StreamStatus {
        let endpoint = self.shared.endpoint();
        let state = self.state();
        StreamStatus {
            name: self.shared.name.clone(),
            url: redact_url(endpoint.url()),
            state,
            connected: state == ConnectionState::Connected,
            running: self.is_running(),
            recording: self.is_recording(),
            recording_active: self.is_recording_active(),
            target: endpoint.size(),
            detected: self.detected_resolution(),
            frames: self.frames_delivered(),
            retries: self.retry_count(),
        }
    }

    fn spawn_loop(&self, initial_delay: Duration) -> ConnectLoop {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(connect_loop(self.shared.clone(), cancel.clone(), initial_delay));
        ConnectLoop { cancel, task }
    }
}

impl Drop for StreamController {
    fn drop(&mut self) {
        if let Ok(mut control) = self.control.try_lock() {
            if let Some(connect) = control.take() {
                connect.cancel.cancel();
            }
        }
        self.shared.recorder.abort();
    }
}

async fn connect_loop(shared: Arc<ControllerShared>, cancel: CancellationToken, initial_delay: Duration) {
    if !initial_delay.is_zero() && cancellable_sleep(initial_delay, &cancel).await {
        return;
    }

    while !cancel.is_cancelled() {
        shared.set_state(ConnectionState::Connecting, None);

        let failure = match run_attempt(&shared, &cancel).await {
            Ok(()) => break,
            Err(failure) => failure,
        };
        if cancel.is_cancelled() {
            break;
        }

        let retry = shared.retries.fetch_add(1, Ordering::SeqCst) + 1;
        let message = failure.to_string();

        if matches!(failure.error, AttemptError::Launch(_)) {
            log::error!("[Stream:{}] Failed to launch FFmpeg: {message}", shared.name);
            shared.set_state(ConnectionState::Failed, Some(retry_status(retry)));
        } else {
            log::warn!("[Stream:{}] Connection lost: {message}", shared.name);
            shared.set_state(ConnectionState::Reconnecting, Some(retry_status(retry)));
        }

        emit_event(
            shared.events.as_ref(),
            EVENT_STREAM_ERROR,
            &StreamErrorEvent {
                name: &shared.name,
                error: message,
                retry,
            },
        );

        if cancellable_sleep(RETRY_BACKOFF, &cancel).await {
            break;
        }
    }
}

/// One preview attempt. Ok means the attempt was cancelled.
async fn run_attempt(shared: &Arc<ControllerShared>, cancel: &CancellationToken) -> Result<(), AttemptFailure> {
    let endpoint = shared.endpoint();
    shared.frames.store(0, Ordering::SeqCst);

    let mut process = shared
        .launcher
        .launch(&endpoint, &LaunchMode::Preview)
        .map_err(AttemptError::from)?;

    let Some(mut stdout) = process.stdout.take() else {
        process.stop(GRACEFUL_STOP_TIMEOUT).await;
        return Err(AttemptError::Launch(crate::error::EngineError::MissingPipe("stdout")).into());
    };

    let sniffer_task = process.stderr.take().map(|stderr| {
        let sniffer = ResolutionSniffer::new(shared.name.clone(), shared.detected.clone());
        tokio::spawn(sniff_diagnostics(stderr, sniffer, shared.events.clone()))
    });

    let mut decoder = FrameDecoder::new(shared.name.clone(), endpoint.size());
    let end = decoder
        .run(&mut stdout, &mut process, shared.sink.as_ref(), cancel, |count| {
            shared.frames.store(count, Ordering::SeqCst);
            if count == 1 {
                shared.mark_connected();
            }
        })
        .await;

    // Closing our end of stdout first unblocks an FFmpeg stuck on a full pipe
    drop(stdout);
    process.stop(GRACEFUL_STOP_TIMEOUT).await;

    let detail = match sniffer_task {
        Some(mut task) => match tokio::time::timeout(SNIFFER_JOIN_TIMEOUT, &mut task).await {
            Ok(Ok(sniffer)) => sniffer.failure_detail(),
            _ => {
                task.abort();
                None
            }
        },
        None => None,
    };

    match end {
        DecodeEnd::Cancelled => Ok(()),
        DecodeEnd::Failed(error) => Err(AttemptFailure { error, detail }),
    }
}
