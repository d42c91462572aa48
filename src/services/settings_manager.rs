// SettingsManager Service
// Loads and persists settings.json in the application data directory

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde_json::Value;

use crate::models::Settings;

const SETTINGS_FILE: &str = "settings.json";
const RECORDINGS_DIR: &str = "recordings";

pub struct SettingsManager {
    settings_path: PathBuf,
    app_data_dir: PathBuf,
    cache: RwLock<Option<Settings>>,
}

impl SettingsManager {
    pub fn new(app_data_dir: PathBuf) -> Self {
        Self {
            settings_path: app_data_dir.join(SETTINGS_FILE),
            app_data_dir,
            cache: RwLock::new(None),
        }
    }

    pub fn settings_path(&self) -> &Path {
        &self.settings_path
    }

    /// Load settings from disk, or create them with defaults.
    /// Keys missing from an older file are filled in and written back.
    pub fn load(&self) -> Result<Settings, String> {
        if let Ok(cache) = self.cache.read() {
            if let Some(ref settings) = *cache {
                return Ok(settings.clone());
            }
        }

        let settings = if self.settings_path.exists() {
            let content = std::fs::read_to_string(&self.settings_path)
                .map_err(|e| format!("Failed to read settings: {e}"))?;

            let mut stored: Value = serde_json::from_str(&content)
                .map_err(|e| format!("Failed to parse settings: {e}"))?;

            let defaults = serde_json::to_value(Settings::default())
                .map_err(|e| format!("Failed to build default settings: {e}"))?;
            let filled = fill_missing_keys(&mut stored, &defaults);

            let settings: Settings = serde_json::from_value(stored)
                .map_err(|e| format!("Failed to parse settings: {e}"))?;

            if filled > 0 {
                log::info!("Added {filled} missing setting(s) to {:?}", self.settings_path);
                self.write_file(&settings)?;
            }
            settings
        } else {
            log::info!("No settings file at {:?}, writing defaults", self.settings_path);
            let defaults = Settings::default();
            self.write_file(&defaults)?;
            defaults
        };

        if let Ok(mut cache) = self.cache.write() {
            *cache = Some(settings.clone());
        }
        Ok(settings)
    }

    pub fn save(&self, settings: &Settings) -> Result<(), String> {
        self.write_file(settings)?;
        if let Ok(mut cache) = self.cache.write() {
            *cache = Some(settings.clone());
        }
        Ok(())
    }

    fn write_file(&self, settings: &Settings) -> Result<(), String> {
        if let Some(parent) = self.settings_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create settings directory: {e}"))?;
        }

        let content = serde_json::to_string_pretty(settings)
            .map_err(|e| format!("Failed to serialize settings: {e}"))?;

        std::fs::write(&self.settings_path, content)
            .map_err(|e| format!("Failed to write settings: {e}"))
    }

    /// Where recordings go: the configured directory, or
    /// `<data dir>/recordings` when none is set
    pub fn recordings_dir(&self, settings: &Settings) -> PathBuf {
        let configured = settings.recordings_dir.trim();
        if configured.is_empty() {
            self.app_data_dir.join(RECORDINGS_DIR)
        } else {
            PathBuf::from(configured)
        }
    }
}

/// Copy top-level keys present in `defaults` but absent from `stored`.
/// Returns the number of keys added.
fn fill_missing_keys(stored: &mut Value, defaults: &Value) -> usize {
    let (Value::Object(stored), Value::Object(defaults)) = (stored, defaults) else {
        return 0;
    };

    let mut added = 0;
    for (key, value) in defaults {
        if !stored.contains_key(key) {
            stored.insert(key.clone(), value.clone());
            added += 1;
        }
    }
    added
}
