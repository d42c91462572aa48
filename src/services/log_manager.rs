// LogManager Service
// File logger for the `log` facade and log retention cleanup

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use chrono::Local;
use log::{LevelFilter, Log, Metadata, Record};

pub const LOG_FILE_NAME: &str = "streamvisor.log";

/// Writes `[date][time][target][level] message` lines to a file and,
/// optionally, to stderr
pub struct FileLogger {
    file: Mutex<File>,
    level: LevelFilter,
    echo_stderr: bool,
}

impl FileLogger {
    pub fn new(log_path: &Path, level: LevelFilter, echo_stderr: bool) -> Result<Self, String> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .map_err(|e| format!("Failed to open log file {log_path:?}: {e}"))?;
        Ok(Self {
            file: Mutex::new(file),
            level,
            echo_stderr,
        })
    }
}

impl Log for FileLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let timestamp = Local::now();
        let line = format!(
            "[{}][{}][{}][{}] {}",
            timestamp.format("%Y-%m-%d"),
            timestamp.format("%H:%M:%S"),
            record.target(),
            record.level(),
            record.args()
        );

        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(file, "{line}");
        }
        if self.echo_stderr {
            eprintln!("{line}");
        }
    }

    fn flush(&self) {
        if let Ok(mut file) = self.file.lock() {
            let _ = file.flush();
        }
    }
}

/// Parse a level name from settings; unknown names fall back to info
pub fn parse_level_filter(level: &str) -> LevelFilter {
    match level.trim().to_ascii_lowercase().as_str() {
        "off" => LevelFilter::Off,
        "error" => LevelFilter::Error,
        "warn" | "warning" => LevelFilter::Warn,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    }
}

/// Install the global logger. Returns the log file path.
pub fn init_logging(log_dir: &Path, level: &str) -> Result<PathBuf, String> {
    fs::create_dir_all(log_dir).map_err(|e| format!("Failed to create log dir: {e}"))?;

    let log_path = log_dir.join(LOG_FILE_NAME);
    let level = parse_level_filter(level);
    let logger = FileLogger::new(&log_path, level, true)?;

    log::set_boxed_logger(Box::new(logger)).map_err(|e| format!("Failed to install logger: {e}"))?;
    log::set_max_level(level);
    Ok(log_path)
}

/// Delete `.log` files older than `retention_days`. Zero keeps everything.
pub fn prune_logs(log_dir: &Path, retention_days: u32) -> Result<usize, String> {
    if retention_days == 0 || !log_dir.exists() {
        return Ok(0);
    }

    let cutoff = SystemTime::now()
        .checked_sub(Duration::from_secs(u64::from(retention_days) * 24 * 60 * 60))
        .unwrap_or(SystemTime::UNIX_EPOCH);

    let entries = fs::read_dir(log_dir).map_err(|e| format!("Failed to read log dir: {e}"))?;
    let mut removed = 0;

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("log") {
            continue;
        }

        let modified = entry
            .metadata()
            .and_then(|metadata| metadata.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        if modified < cutoff {
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => log::warn!("Failed to remove old log {path:?}: {e}"),
            }
        }
    }

    Ok(removed)
}
