// Test Support
// Scripted in-memory FFmpeg stand-in and event capture for async tests

use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{watch, Notify};

use crate::error::EngineError;
use crate::models::{Resolution, StreamEndpoint};
use crate::services::{
    EngineLauncher, EngineProcess, EventSink, LaunchMode, ProcessControl, ProcessExit,
};

const PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Ending {
    /// Exit on its own with this code once the script is done
    Exit(i32),
    /// Keep running until `q`, stdin EOF, or a kill
    RunUntilStopped,
    /// Ignore `q` and stdin EOF; only a kill ends it
    IgnoreQuit,
}

/// What one fake engine run does
#[derive(Debug, Clone)]
pub(crate) struct FakeScript {
    pub stderr_lines: Vec<String>,
    pub frames: usize,
    pub frame_delay: Duration,
    pub trailing_bytes: usize,
    pub close_stdout: bool,
    pub ending: Ending,
}

impl FakeScript {
    pub fn frames_then_exit(frames: usize, code: i32) -> Self {
        Self {
            stderr_lines: Vec::new(),
            frames,
            frame_delay: Duration::ZERO,
            trailing_bytes: 0,
            close_stdout: false,
            ending: Ending::Exit(code),
        }
    }

    pub fn run_until_stopped(frames: usize) -> Self {
        Self {
            ending: Ending::RunUntilStopped,
            ..Self::frames_then_exit(frames, 0)
        }
    }

    pub fn ignore_quit(frames: usize) -> Self {
        Self {
            ending: Ending::IgnoreQuit,
            ..Self::frames_then_exit(frames, 0)
        }
    }

    pub fn with_stderr(mut self, lines: &[&str]) -> Self {
        self.stderr_lines = lines.iter().map(|l| l.to_string()).collect();
        self
    }

    pub fn with_frame_delay(mut self, delay: Duration) -> Self {
        self.frame_delay = delay;
        self
    }

    pub fn with_trailing_bytes(mut self, bytes: usize) -> Self {
        self.trailing_bytes = bytes;
        self
    }

    pub fn with_closed_stdout(mut self) -> Self {
        self.close_stdout = true;
        self
    }
}

#[derive(Default)]
struct ModeCounters {
    spawns: AtomicUsize,
    live: Arc<AtomicUsize>,
    max_live: Arc<AtomicUsize>,
    kills: Mutex<Vec<Arc<Notify>>>,
}

impl ModeCounters {
    fn on_spawn(&self) {
        self.spawns.fetch_add(1, Ordering::SeqCst);
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live.fetch_max(live, Ordering::SeqCst);
    }
}

/// Launcher that runs scripted engines over in-memory pipes
pub(crate) struct FakeLauncher {
    preview_scripts: Mutex<VecDeque<FakeScript>>,
    record_scripts: Mutex<VecDeque<FakeScript>>,
    default_preview: Mutex<FakeScript>,
    default_record: Mutex<FakeScript>,
    preview_by_url: Mutex<HashMap<String, FakeScript>>,
    preview: ModeCounters,
    record: ModeCounters,
    failing_launches: AtomicUsize,
    next_pid: AtomicU32,
    preview_sizes: Mutex<Vec<Resolution>>,
    preview_urls: Mutex<Vec<String>>,
    record_paths: Mutex<Vec<PathBuf>>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self {
            preview_scripts: Mutex::new(VecDeque::new()),
            record_scripts: Mutex::new(VecDeque::new()),
            default_preview: Mutex::new(FakeScript::run_until_stopped(0)),
            default_record: Mutex::new(FakeScript::run_until_stopped(0)),
            preview_by_url: Mutex::new(HashMap::new()),
            preview: ModeCounters::default(),
            record: ModeCounters::default(),
            failing_launches: AtomicUsize::new(0),
            next_pid: AtomicU32::new(1000),
            preview_sizes: Mutex::new(Vec::new()),
            preview_urls: Mutex::new(Vec::new()),
            record_paths: Mutex::new(Vec::new()),
        }
    }

    pub fn push_preview(&self, script: FakeScript) {
        self.preview_scripts.lock().unwrap().push_back(script);
    }

    pub fn push_record(&self, script: FakeScript) {
        self.record_scripts.lock().unwrap().push_back(script);
    }

    pub fn set_default_preview(&self, script: FakeScript) {
        *self.default_preview.lock().unwrap() = script;
    }

    pub fn set_default_record(&self, script: FakeScript) {
        *self.default_record.lock().unwrap() = script;
    }

    /// Script every preview of one source URL
    pub fn set_preview_for_url(&self, url: &str, script: FakeScript) {
        self.preview_by_url.lock().unwrap().insert(url.to_string(), script);
    }

    /// Make the next `count` launches fail with a spawn error
    pub fn fail_next_launches(&self, count: usize) {
        self.failing_launches.store(count, Ordering::SeqCst);
    }

    fn counters(&self, mode: &LaunchMode) -> &ModeCounters {
        match mode {
            LaunchMode::Preview => &self.preview,
            LaunchMode::Record(_) => &self.record,
        }
    }

    pub fn preview_spawns(&self) -> usize {
        self.preview.spawns.load(Ordering::SeqCst)
    }

    pub fn record_spawns(&self) -> usize {
        self.record.spawns.load(Ordering::SeqCst)
    }

    pub fn live_previews(&self) -> usize {
        self.preview.live.load(Ordering::SeqCst)
    }

    pub fn live_records(&self) -> usize {
        self.record.live.load(Ordering::SeqCst)
    }

    pub fn max_live_previews(&self) -> usize {
        self.preview.max_live.load(Ordering::SeqCst)
    }

    pub fn max_live_records(&self) -> usize {
        self.record.max_live.load(Ordering::SeqCst)
    }

    pub fn preview_sizes(&self) -> Vec<Resolution> {
        self.preview_sizes.lock().unwrap().clone()
    }

    pub fn preview_spawns_for(&self, url: &str) -> usize {
        self.preview_urls.lock().unwrap().iter().filter(|u| *u == url).count()
    }

    pub fn record_paths(&self) -> Vec<PathBuf> {
        self.record_paths.lock().unwrap().clone()
    }

    /// Kill the most recent recording engine from outside the supervisor
    pub fn kill_last_record(&self) {
        if let Some(kill) = self.record.kills.lock().unwrap().last() {
            kill.notify_one();
        }
    }

    pub fn kill_last_preview(&self) {
        if let Some(kill) = self.preview.kills.lock().unwrap().last() {
            kill.notify_one();
        }
    }
}

impl EngineLauncher for FakeLauncher {
    fn launch(
        &self,
        endpoint: &StreamEndpoint,
        mode: &LaunchMode,
    ) -> Result<EngineProcess, EngineError> {
        if self
            .failing_launches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(EngineError::Spawn {
                path: PathBuf::from("fake-ffmpeg"),
                source: io::Error::new(io::ErrorKind::PermissionDenied, "scripted failure"),
            });
        }

        let script = match mode {
            LaunchMode::Preview => {
                self.preview_sizes.lock().unwrap().push(endpoint.size());
                self.preview_urls.lock().unwrap().push(endpoint.url().to_string());
                let queued = self.preview_scripts.lock().unwrap().pop_front();
                queued
                    .or_else(|| self.preview_by_url.lock().unwrap().get(endpoint.url()).cloned())
                    .unwrap_or_else(|| self.default_preview.lock().unwrap().clone())
            }
            LaunchMode::Record(path) => {
                self.record_paths.lock().unwrap().push(path.clone());
                self.record_scripts
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or_else(|| self.default_record.lock().unwrap().clone())
            }
        };

        let counters = self.counters(mode);
        counters.on_spawn();
        let kill = Arc::new(Notify::new());
        counters.kills.lock().unwrap().push(kill.clone());

        let (stdin_w, stdin_r) = tokio::io::duplex(PIPE_CAPACITY);
        let (stdout_w, stdout_r) = tokio::io::duplex(PIPE_CAPACITY);
        let (stderr_w, stderr_r) = tokio::io::duplex(PIPE_CAPACITY);
        let (exit_tx, exit_rx) = watch::channel(None);

        let preview = matches!(mode, LaunchMode::Preview);
        tokio::spawn(run_fake_engine(
            script,
            endpoint.frame_len(),
            stdin_r,
            preview.then_some(stdout_w),
            stderr_w,
            kill.clone(),
            exit_tx,
            counters.live.clone(),
        ));

        Ok(EngineProcess::new(
            Some(Box::new(stdin_w)),
            preview.then(|| Box::new(stdout_r) as crate::services::PipeReader),
            Some(Box::new(stderr_r)),
            Box::new(FakeControl {
                pid: self.next_pid.fetch_add(1, Ordering::SeqCst),
                exit_rx,
                kill,
            }),
        ))
    }
}

async fn wait_for_quit(stdin: &mut DuplexStream) {
    let mut buf = [0u8; 64];
    loop {
        match stdin.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) if buf[..n].contains(&b'q') => return,
            Ok(_) => {}
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_fake_engine(
    script: FakeScript,
    frame_len: usize,
    mut stdin: DuplexStream,
    mut stdout: Option<DuplexStream>,
    mut stderr: DuplexStream,
    kill: Arc<Notify>,
    exit_tx: watch::Sender<Option<ProcessExit>>,
    live: Arc<AtomicUsize>,
) {
    if script.close_stdout {
        stdout = None;
    }

    let ending = script.ending;
    let body = async {
        for line in &script.stderr_lines {
            stderr.write_all(format!("{line}\n").as_bytes()).await?;
        }
        if let Some(out) = stdout.as_mut() {
            let frame = vec![0x7f_u8; frame_len];
            for _ in 0..script.frames {
                if !script.frame_delay.is_zero() {
                    tokio::time::sleep(script.frame_delay).await;
                }
                out.write_all(&frame).await?;
            }
            if script.trailing_bytes > 0 {
                out.write_all(&frame[..script.trailing_bytes]).await?;
            }
        }
        Ok::<_, io::Error>(())
    };

    let scripted = async {
        match body.await {
            Ok(()) => match ending {
                Ending::Exit(code) => Some(code),
                _ => std::future::pending().await,
            },
            // Reader went away, like FFmpeg on a broken pipe
            Err(_) => Some(1),
        }
    };

    let quit = async {
        if ending == Ending::IgnoreQuit {
            std::future::pending::<()>().await;
        }
        wait_for_quit(&mut stdin).await;
    };

    let code = tokio::select! {
        code = scripted => code,
        _ = quit => Some(0),
        _ = kill.notified() => None,
    };

    live.fetch_sub(1, Ordering::SeqCst);
    let _ = exit_tx.send(Some(ProcessExit { code }));
}

struct FakeControl {
    pid: u32,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
    kill: Arc<Notify>,
}

#[async_trait]
impl ProcessControl for FakeControl {
    fn id(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn try_wait(&mut self) -> io::Result<Option<ProcessExit>> {
        Ok(*self.exit_rx.borrow())
    }

    async fn wait(&mut self) -> io::Result<ProcessExit> {
        let exit = self
            .exit_rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "fake engine vanished"))?;
        Ok((*exit).unwrap_or(ProcessExit { code: None }))
    }

    fn start_kill(&mut self) -> io::Result<()> {
        self.kill.notify_one();
        Ok(())
    }
}

/// Collects every emitted event
#[derive(Default)]
pub(crate) struct MemoryEventSink {
    events: Mutex<Vec<(String, Value)>>,
}

impl EventSink for MemoryEventSink {
    fn emit(&self, event: &str, payload: Value) {
        self.events.lock().unwrap().push((event.to_string(), payload));
    }
}

impl MemoryEventSink {
    pub fn count(&self, event: &str) -> usize {
        self.events.lock().unwrap().iter().filter(|(e, _)| e == event).count()
    }

    pub fn named(&self, event: &str) -> Vec<Value> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(e, _)| e == event)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    /// Status labels emitted for the stream, in order
    pub fn statuses(&self) -> Vec<String> {
        self.named(crate::services::EVENT_STREAM_STATUS)
            .iter()
            .filter_map(|payload| payload["status"].as_str().map(str::to_string))
            .collect()
    }
}

/// Poll `cond` every 10 ms until it holds or `limit` passes
pub(crate) async fn wait_until<F: FnMut() -> bool>(mut cond: F, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
