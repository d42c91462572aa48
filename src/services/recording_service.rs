// Recording Service
// Supervises the stream-copy recording subprocess of one stream.
// Recording intent (what the user asked for) and activity (whether a
// process is running) are tracked separately; the supervising task
// restarts crashed recordings while intent is set.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Local;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::models::StreamEndpoint;
use crate::services::{
    cancellable_sleep, emit_event, read_diagnostic_lines, recording_file_name, DiagnosticRing,
    EngineLauncher, EventSink, LaunchMode, RecordingEvent, EVENT_RECORDING_RESTARTING,
    EVENT_RECORDING_STARTED, EVENT_RECORDING_STOPPED, GRACEFUL_STOP_TIMEOUT,
};

/// Settle time before restarting a recording that died unexpectedly
pub const RECORDING_RESTART_DELAY: Duration = Duration::from_secs(1);

/// Wait before retrying a recording that could not be launched
pub const RECORDING_SPAWN_RETRY: Duration = Duration::from_secs(5);

/// How long to wait for the stderr reader after the process is gone
const DIAGNOSTIC_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

struct RecordingSession {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

struct RecordingInner {
    name: String,
    endpoint: Arc<RwLock<StreamEndpoint>>,
    launcher: Arc<dyn EngineLauncher>,
    events: Arc<dyn EventSink>,
    recordings_dir: PathBuf,
    intent: AtomicBool,
    active: AtomicBool,
    current_output: Mutex<Option<PathBuf>>,
    session: AsyncMutex<Option<RecordingSession>>,
}

impl RecordingInner {
    fn endpoint(&self) -> StreamEndpoint {
        match self.endpoint.read() {
            Ok(endpoint) => endpoint.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_active(&self, output: Option<PathBuf>) {
        self.active.store(output.is_some(), Ordering::SeqCst);
        if let Ok(mut current) = self.current_output.lock() {
            *current = output;
        }
    }

    fn emit(&self, event: &str, path: Option<&Path>, error: Option<String>) {
        emit_event(
            self.events.as_ref(),
            event,
            &RecordingEvent {
                name: &self.name,
                path: path.map(|p| p.to_string_lossy().to_string()),
                error,
            },
        );
    }
}

/// Recording supervisor for one stream. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct RecordingSupervisor {
    inner: Arc<RecordingInner>,
}

impl RecordingSupervisor {
    pub fn new(
        endpoint: Arc<RwLock<StreamEndpoint>>,
        launcher: Arc<dyn EngineLauncher>,
        events: Arc<dyn EventSink>,
        recordings_dir: PathBuf,
    ) -> Self {
        let name = match endpoint.read() {
            Ok(endpoint) => endpoint.name().to_string(),
            Err(poisoned) => poisoned.into_inner().name().to_string(),
        };

        if let Err(e) = std::fs::create_dir_all(&recordings_dir) {
            log::warn!("[Recording:{name}] Failed to create recordings directory {recordings_dir:?}: {e}");
        }

        Self {
            inner: Arc::new(RecordingInner {
                name,
                endpoint,
                launcher,
                events,
                recordings_dir,
                intent: AtomicBool::new(false),
                active: AtomicBool::new(false),
                current_output: Mutex::new(None),
                session: AsyncMutex::new(None),
            }),
        }
    }

    /// Set recording intent and start a recording process if none is running
    pub async fn request_start(&self) {
        let mut session = self.inner.session.lock().await;
        self.inner.intent.store(true, Ordering::SeqCst);
        self.ensure_session(&mut session);
    }

    /// Clear recording intent, then stop the recording process
    pub async fn request_stop(&self) {
        // Cleared first so the supervising task never mistakes this for a crash
        self.inner.intent.store(false, Ordering::SeqCst);
        self.end_session().await;
    }

    /// Stop the recording process but keep the intent for a later resume
    pub async fn pause(&self) {
        self.end_session().await;
    }

    /// Restart recording if intent is still set
    pub async fn resume_if_requested(&self) {
        let mut session = self.inner.session.lock().await;
        if self.inner.intent.load(Ordering::SeqCst) {
            self.ensure_session(&mut session);
        }
    }

    /// Set intent without starting anything (stream not connected yet)
    pub fn queue(&self) {
        self.inner.intent.store(true, Ordering::SeqCst);
    }

    /// Recording intent
    pub fn is_recording(&self) -> bool {
        self.inner.intent.load(Ordering::SeqCst)
    }

    /// Whether a recording process is currently running
    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub fn current_output(&self) -> Option<PathBuf> {
        self.inner.current_output.lock().ok().and_then(|current| current.clone())
    }

    pub fn recordings_dir(&self) -> &Path {
        &self.inner.recordings_dir
    }

    /// Best-effort synchronous teardown for drop paths
    pub(crate) fn abort(&self) {
        self.inner.intent.store(false, Ordering::SeqCst);
        if let Ok(session) = self.inner.session.try_lock() {
            if let Some(session) = session.as_ref() {
                session.stop.cancel();
            }
        }
    }

    fn ensure_session(&self, session: &mut Option<RecordingSession>) {
        if let Some(existing) = session.as_ref() {
            if !existing.task.is_finished() {
                return;
            }
        }

        let stop = CancellationToken::new();
        let task = tokio::spawn(supervise(self.inner.clone(), stop.clone()));
        *session = Some(RecordingSession { stop, task });
    }

    async fn end_session(&self) {
        let mut session = self.inner.session.lock().await;
        if let Some(session) = session.take() {
            session.stop.cancel();
            if let Err(e) = session.task.await {
                log::warn!("[Recording:{}] Supervisor task ended abnormally: {e}", self.inner.name);
            }
        }
        self.inner.set_active(None);
    }
}

/// Output path for a new recording; adds a counter if the file exists
fn next_output_path(dir: &Path, name: &str) -> PathBuf {
    let file_name = recording_file_name(name, Local::now());
    let path = dir.join(&file_name);
    if !path.exists() {
        return path;
    }

    let stem = file_name.trim_end_matches(".ts");
    (1..)
        .map(|n| dir.join(format!("{stem}_{n}.ts")))
        .find(|candidate| !candidate.exists())
        .unwrap_or(path)
}

async fn supervise(inner: Arc<RecordingInner>, stop: CancellationToken) {
    let name = inner.name.clone();

    loop {
        if stop.is_cancelled() || !inner.intent.load(Ordering::SeqCst) {
            break;
        }

        let endpoint = inner.endpoint();
        if let Err(e) = std::fs::create_dir_all(&inner.recordings_dir) {
            log::warn!("[Recording:{name}] Failed to create recordings directory: {e}");
        }
        let path = next_output_path(&inner.recordings_dir, endpoint.name());

        let mut process = match inner.launcher.launch(&endpoint, &LaunchMode::Record(path.clone())) {
            Ok(process) => process,
            Err(e) => {
                log::error!("[Recording:{name}] Failed to start recording: {e}");
                inner.emit(EVENT_RECORDING_RESTARTING, None, Some(e.to_string()));
                if cancellable_sleep(RECORDING_SPAWN_RETRY, &stop).await {
                    break;
                }
                continue;
            }
        };

        inner.set_active(Some(path.clone()));
        log::info!("[Recording:{name}] Recording to {path:?} (PID {:?})", process.id());
        inner.emit(EVENT_RECORDING_STARTED, Some(path.as_path()), None);

        let ring = Arc::new(Mutex::new(DiagnosticRing::new()));
        let mut drain = process.stderr.take().map(|stderr| {
            let ring = ring.clone();
            let name = name.clone();
            tokio::spawn(read_diagnostic_lines(stderr, move |line| {
                log::debug!("[Recording:{name}] FFmpeg: {line}");
                if let Ok(mut ring) = ring.lock() {
                    ring.push(line);
                }
            }))
        });

        let exit = tokio::select! {
            biased;
            _ = stop.cancelled() => None,
            exit = process.wait() => Some(exit),
        };

        let Some(exit) = exit else {
            // Intentional stop or pause
            process.stop(GRACEFUL_STOP_TIMEOUT).await;
            inner.set_active(None);
            if let Some(drain) = drain.take() {
                drain.abort();
            }
            log::info!("[Recording:{name}] Recording stopped: {path:?}");
            inner.emit(EVENT_RECORDING_STOPPED, Some(path.as_path()), None);
            break;
        };

        inner.set_active(None);
        if let Some(mut drain) = drain.take() {
            if tokio::time::timeout(DIAGNOSTIC_DRAIN_TIMEOUT, &mut drain).await.is_err() {
                drain.abort();
            }
        }

        let mut error = match exit {
            Ok(exit) => format!("FFmpeg {exit}"),
            Err(e) => format!("Failed to wait for FFmpeg: {e}"),
        };
        if let Ok(ring) = ring.lock() {
            if let Some(detail) = ring.failure_detail().or_else(|| ring.last_line().map(str::to_string)) {
                error = format!("{error}: {detail}");
            }
        }

        if !inner.intent.load(Ordering::SeqCst) || stop.is_cancelled() {
            log::info!("[Recording:{name}] Recording process exited: {error}");
            inner.emit(EVENT_RECORDING_STOPPED, Some(path.as_path()), None);
            break;
        }

        log::warn!("[Recording:{name}] Recording ended unexpectedly ({error}), restarting");
        inner.emit(EVENT_RECORDING_RESTARTING, Some(path.as_path()), Some(error));

        if cancellable_sleep(RECORDING_RESTART_DELAY, &stop).await {
            inner.emit(EVENT_RECORDING_STOPPED, Some(path.as_path()), None);
            break;
        }
    }

    inner.set_active(None);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::{wait_until, FakeLauncher, FakeScript, MemoryEventSink};
    use tempfile::TempDir;

    struct Harness {
        launcher: Arc<FakeLauncher>,
        events: Arc<MemoryEventSink>,
        recorder: RecordingSupervisor,
        dir: TempDir,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(FakeLauncher::new());
        let events = Arc::new(MemoryEventSink::default());
        let endpoint = StreamEndpoint::new("Front Door", "rtsp://x", 4, 2).unwrap();
        let recorder = RecordingSupervisor::new(
            Arc::new(RwLock::new(endpoint)),
            launcher.clone(),
            events.clone(),
            dir.path().join("recordings"),
        );
        Harness {
            launcher,
            events,
            recorder,
            dir,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_stop_are_idempotent() {
        let h = harness();
        assert!(h.dir.path().join("recordings").is_dir());

        h.recorder.request_start().await;
        h.recorder.request_start().await;
        assert!(wait_until(|| h.recorder.is_active(), Duration::from_secs(1)).await);
        assert_eq!(h.launcher.record_spawns(), 1);
        assert!(h.recorder.is_recording());

        let output = h.recorder.current_output().unwrap();
        let file_name = output.file_name().unwrap().to_string_lossy().to_string();
        assert!(file_name.starts_with("Front Door_"));
        assert!(file_name.ends_with(".ts"));

        h.recorder.request_stop().await;
        h.recorder.request_stop().await;
        assert!(!h.recorder.is_recording());
        assert!(!h.recorder.is_active());
        assert_eq!(h.launcher.live_records(), 0);
        assert_eq!(h.events.count(EVENT_RECORDING_STARTED), 1);
        assert_eq!(h.events.count(EVENT_RECORDING_STOPPED), 1);
        assert_eq!(h.events.count(EVENT_RECORDING_RESTARTING), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_kill_restarts_recording() {
        let h = harness();
        h.recorder.request_start().await;
        assert!(wait_until(|| h.recorder.is_active(), Duration::from_secs(1)).await);

        h.launcher.kill_last_record();
        assert!(wait_until(|| h.launcher.record_spawns() == 2, Duration::from_secs(5)).await);
        assert!(wait_until(|| h.recorder.is_active(), Duration::from_secs(1)).await);

        assert_eq!(h.events.count(EVENT_RECORDING_RESTARTING), 1);
        assert_eq!(h.launcher.max_live_records(), 1);
        assert!(h.recorder.is_recording());

        h.recorder.request_stop().await;
        assert_eq!(h.launcher.live_records(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_crash_reports_stderr_detail() {
        let h = harness();
        h.launcher.push_record(
            FakeScript::frames_then_exit(0, 1).with_stderr(&["rtsp://x: Connection refused"]),
        );

        let started = tokio::time::Instant::now();
        h.recorder.request_start().await;
        assert!(wait_until(|| h.launcher.record_spawns() == 2, Duration::from_secs(5)).await);
        assert!(started.elapsed() >= RECORDING_RESTART_DELAY);

        let restarting = h.events.named(EVENT_RECORDING_RESTARTING);
        assert_eq!(restarting.len(), 1);
        let error = restarting[0]["error"].as_str().unwrap();
        assert!(error.contains("exited with code 1"));
        assert!(error.contains("Source refused connection"));

        let recordings = h.dir.path().join("recordings");
        let paths = h.launcher.record_paths();
        assert_eq!(paths.len(), 2);
        assert!(paths.iter().all(|path| path.starts_with(&recordings)));

        h.recorder.request_stop().await;
        assert_eq!(h.launcher.live_records(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresponsive_process_is_killed() {
        let h = harness();
        h.launcher.set_default_record(FakeScript::ignore_quit(0));
        h.recorder.request_start().await;
        assert!(wait_until(|| h.recorder.is_active(), Duration::from_secs(1)).await);

        let started = tokio::time::Instant::now();
        h.recorder.request_stop().await;

        assert!(started.elapsed() >= GRACEFUL_STOP_TIMEOUT);
        assert_eq!(h.launcher.live_records(), 0);
        assert_eq!(h.launcher.record_spawns(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_keeps_intent_and_resume_restarts() {
        let h = harness();
        h.recorder.request_start().await;
        assert!(wait_until(|| h.recorder.is_active(), Duration::from_secs(1)).await);

        h.recorder.pause().await;
        assert!(h.recorder.is_recording());
        assert!(!h.recorder.is_active());
        assert_eq!(h.launcher.live_records(), 0);
        assert_eq!(h.events.count(EVENT_RECORDING_RESTARTING), 0);

        h.recorder.resume_if_requested().await;
        assert!(wait_until(|| h.recorder.is_active(), Duration::from_secs(1)).await);
        assert_eq!(h.launcher.record_spawns(), 2);

        h.recorder.request_stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_does_not_spawn() {
        let h = harness();
        h.recorder.queue();
        assert!(h.recorder.is_recording());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.launcher.record_spawns(), 0);

        h.recorder.resume_if_requested().await;
        assert!(wait_until(|| h.recorder.is_active(), Duration::from_secs(1)).await);
        h.recorder.request_stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_launch_failure_is_retried() {
        let h = harness();
        h.launcher.fail_next_launches(1);

        let started = tokio::time::Instant::now();
        h.recorder.request_start().await;
        assert!(wait_until(|| h.recorder.is_active(), Duration::from_secs(10)).await);

        assert!(started.elapsed() >= RECORDING_SPAWN_RETRY);
        assert_eq!(h.launcher.record_spawns(), 1);
        assert_eq!(h.events.count(EVENT_RECORDING_RESTARTING), 1);

        h.recorder.request_stop().await;
    }

    #[test]
    fn test_next_output_path_avoids_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let first = next_output_path(dir.path(), "cam");
        std::fs::write(&first, b"").unwrap();

        let second = next_output_path(dir.path(), "cam");
        assert_ne!(first, second);
        assert!(!second.exists());
    }
}
