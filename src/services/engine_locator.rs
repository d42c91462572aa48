// Engine Locator
// Finds the FFmpeg executable using a fixed search order

use std::path::{Path, PathBuf};

use crate::error::EngineError;

/// Directory name used under the per-user data directory
const APP_DIR_NAME: &str = "streamvisor";

fn binary_name() -> &'static str {
    if cfg!(target_os = "windows") {
        "ffmpeg.exe"
    } else {
        "ffmpeg"
    }
}

/// Prioritized FFmpeg search.
/// Checks in order: custom path, bundled directories, platform install
/// directories, then the process search path.
#[derive(Debug, Clone)]
pub struct EngineLocator {
    custom_path: Option<PathBuf>,
    bundled_dirs: Vec<PathBuf>,
    install_dirs: Vec<PathBuf>,
    search_path: bool,
}

impl EngineLocator {
    /// Create a locator with the platform defaults.
    /// An empty custom path is treated as unset.
    pub fn new(custom_path: Option<&str>) -> Self {
        let custom_path = custom_path
            .map(str::trim)
            .filter(|path| !path.is_empty())
            .map(PathBuf::from);

        Self {
            custom_path,
            bundled_dirs: Self::default_bundled_dirs(),
            install_dirs: Self::default_install_dirs(),
            search_path: true,
        }
    }

    pub fn with_bundled_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.bundled_dirs = dirs;
        self
    }

    pub fn with_install_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.install_dirs = dirs;
        self
    }

    /// Skip the PATH lookup (used where the host PATH must not leak in)
    pub fn without_search_path(mut self) -> Self {
        self.search_path = false;
        self
    }

    /// Directories shipped next to the running executable
    pub fn default_bundled_dirs() -> Vec<PathBuf> {
        let mut dirs = Vec::new();
        if let Ok(exe_path) = std::env::current_exe() {
            if let Some(exe_dir) = exe_path.parent() {
                dirs.push(exe_dir.to_path_buf());
                dirs.push(exe_dir.join("bin"));
            }
        }
        dirs
    }

    /// Conventional install locations for this platform
    pub fn default_install_dirs() -> Vec<PathBuf> {
        let mut dirs = Vec::new();

        if let Some(data_dir) = dirs_next::data_local_dir() {
            dirs.push(data_dir.join(APP_DIR_NAME).join("ffmpeg"));
        }

        if cfg!(target_os = "windows") {
            dirs.push(PathBuf::from(r"C:\Program Files\ffmpeg\bin"));
        } else if cfg!(target_os = "macos") {
            dirs.push(PathBuf::from("/opt/homebrew/bin"));
            dirs.push(PathBuf::from("/usr/local/bin"));
        } else {
            dirs.push(PathBuf::from("/usr/bin"));
            dirs.push(PathBuf::from("/usr/local/bin"));
        }

        dirs
    }

    /// Resolve the FFmpeg executable.
    /// The error lists every location that was checked.
    pub fn locate(&self) -> Result<PathBuf, EngineError> {
        let mut searched = Vec::new();

        if let Some(ref path) = self.custom_path {
            if is_executable_file(path) {
                log::info!("Using custom FFmpeg path: {path:?}");
                return Ok(path.clone());
            }
            log::warn!("Custom FFmpeg path {path:?} does not exist, falling back to auto-detection");
            searched.push(path.clone());
        }

        for dir in self.bundled_dirs.iter().chain(self.install_dirs.iter()) {
            let candidate = dir.join(binary_name());
            if is_executable_file(&candidate) {
                log::info!("Found FFmpeg: {candidate:?}");
                return Ok(candidate);
            }
            searched.push(candidate);
        }

        if self.search_path {
            match which::which(binary_name()) {
                Ok(path) => {
                    log::info!("Found FFmpeg in PATH: {path:?}");
                    return Ok(path);
                }
                Err(_) => searched.push(PathBuf::from(format!("$PATH/{}", binary_name()))),
            }
        }

        log::warn!("FFmpeg binary not found in any location");
        Err(EngineError::BinaryNotFound { searched })
    }
}

fn is_executable_file(path: &Path) -> bool {
    path.is_file()
}
