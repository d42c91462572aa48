// Fleet Supervisor
// Owns every stream controller: configuration, periodic health sweep and
// bounded shutdown

use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::ConfigError;
use crate::models::{StreamConfig, StreamEndpoint, StreamStatus};
use crate::services::{EngineLauncher, EventSink, FrameSinkFactory, StreamController};

/// Period of the reconnect sweep over non-connected streams
pub const HEALTH_SWEEP_INTERVAL: Duration = Duration::from_secs(180);

/// Upper bound for stopping the whole fleet
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

struct FleetEntry {
    config: StreamConfig,
    controller: Arc<StreamController>,
}

struct HealthSweep {
    cancel: CancellationToken,
    _task: JoinHandle<()>,
}

pub struct FleetSupervisor {
    launcher: Arc<dyn EngineLauncher>,
    sink_factory: Arc<dyn FrameSinkFactory>,
    events: Arc<dyn EventSink>,
    recordings_dir: PathBuf,
    entries: RwLock<Vec<FleetEntry>>,
    sweep: Mutex<Option<HealthSweep>>,
}

impl FleetSupervisor {
    pub fn new(
        launcher: Arc<dyn EngineLauncher>,
        sink_factory: Arc<dyn FrameSinkFactory>,
        events: Arc<dyn EventSink>,
        recordings_dir: PathBuf,
    ) -> Self {
        Self {
            launcher,
            sink_factory,
            events,
            recordings_dir,
            entries: RwLock::new(Vec::new()),
            sweep: Mutex::new(None),
        }
    }

    /// Build a fleet from persisted stream configs. Nothing is started.
    pub fn from_configs(
        configs: &[StreamConfig],
        launcher: Arc<dyn EngineLauncher>,
        sink_factory: Arc<dyn FrameSinkFactory>,
        events: Arc<dyn EventSink>,
        recordings_dir: PathBuf,
    ) -> Result<Self, ConfigError> {
        validate_configs(configs)?;
        let fleet = Self::new(launcher, sink_factory, events, recordings_dir);
        for config in configs {
            fleet.add_stream(config.clone())?;
        }
        Ok(fleet)
    }

    fn read_entries(&self) -> std::sync::RwLockReadGuard<'_, Vec<FleetEntry>> {
        match self.entries.read() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_entries(&self) -> std::sync::RwLockWriteGuard<'_, Vec<FleetEntry>> {
        match self.entries.write() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn build_controller(&self, config: &StreamConfig) -> Result<Arc<StreamController>, ConfigError> {
        let endpoint = StreamEndpoint::from_config(config)?;
        Ok(Arc::new(StreamController::new(
            endpoint,
            self.launcher.clone(),
            self.sink_factory.sink_for(&config.name),
            self.events.clone(),
            self.recordings_dir.clone(),
        )))
    }

    /// Register a stream without starting it
    pub fn add_stream(&self, config: StreamConfig) -> Result<Arc<StreamController>, ConfigError> {
        let controller = self.build_controller(&config)?;

        let mut entries = self.write_entries();
        if entries.iter().any(|entry| entry.config.name == config.name) {
            return Err(ConfigError::DuplicateName(config.name));
        }
        log::info!("[Fleet] Added stream {}", config.name);
        entries.push(FleetEntry {
            config,
            controller: controller.clone(),
        });
        Ok(controller)
    }

    /// Stop and forget a stream. Returns false if it was unknown.
    pub async fn remove_stream(&self, name: &str) -> bool {
        let removed = {
            let mut entries = self.write_entries();
            entries
                .iter()
                .position(|entry| entry.config.name == name)
                .map(|index| entries.remove(index))
        };

        match removed {
            Some(entry) => {
                entry.controller.stop().await;
                log::info!("[Fleet] Removed stream {name}");
                true
            }
            None => false,
        }
    }

    /// Start every enabled stream
    pub async fn start_all(&self) {
        let enabled: Vec<Arc<StreamController>> = self
            .read_entries()
            .iter()
            .filter(|entry| entry.config.enabled)
            .map(|entry| entry.controller.clone())
            .collect();

        log::info!("[Fleet] Starting {} stream(s)", enabled.len());
        join_all(enabled.iter().map(|controller| controller.start())).await;
    }

    pub fn get(&self, name: &str) -> Option<Arc<StreamController>> {
        self.read_entries()
            .iter()
            .find(|entry| entry.config.name == name)
            .map(|entry| entry.controller.clone())
    }

    pub fn names(&self) -> Vec<String> {
        self.read_entries()
            .iter()
            .map(|entry| entry.config.name.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_entries().is_empty()
    }

    pub fn statuses(&self) -> Vec<StreamStatus> {
        self.controllers().iter().map(|controller| controller.status()).collect()
    }

    fn controllers(&self) -> Vec<Arc<StreamController>> {
        self.read_entries()
            .iter()
            .map(|entry| entry.controller.clone())
            .collect()
    }

    /// Reconnect every running stream that is not connected.
    /// Returns how many streams were kicked.
    pub async fn sweep_once(&self) -> usize {
        let stale: Vec<Arc<StreamController>> = self
            .controllers()
            .into_iter()
            .filter(|controller| controller.is_running() && !controller.is_connected())
            .collect();

        if stale.is_empty() {
            log::debug!("[Fleet] Health sweep: all running streams connected");
            return 0;
        }

        for controller in &stale {
            log::info!(
                "[Fleet] Health sweep: {} is {}, reconnecting",
                controller.name(),
                controller.state().label()
            );
        }
        join_all(stale.iter().map(|controller| controller.reconnect())).await;
        stale.len()
    }

    /// Run `sweep_once` every three minutes until shutdown
    pub fn spawn_health_sweep(self: &Arc<Self>) {
        self.spawn_health_sweep_every(HEALTH_SWEEP_INTERVAL);
    }

    pub fn spawn_health_sweep_every(self: &Arc<Self>, period: Duration) {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(health_sweep(Arc::downgrade(self), period, cancel.clone()));

        let previous = match self.sweep.lock() {
            Ok(mut sweep) => sweep.replace(HealthSweep { cancel, _task: task }),
            Err(poisoned) => poisoned.into_inner().replace(HealthSweep { cancel, _task: task }),
        };
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }
    }

    fn cancel_sweep(&self) {
        let sweep = match self.sweep.lock() {
            Ok(mut sweep) => sweep.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(sweep) = sweep {
            sweep.cancel.cancel();
        }
    }

    /// Apply a new stream list: removed streams stop, new ones start when
    /// enabled, URL changes restart, size changes go through
    /// `change_resolution`, and enabled toggles start or stop.
    pub async fn reconfigure(&self, configs: Vec<StreamConfig>) -> Result<(), ConfigError> {
        validate_configs(&configs)?;

        let current: Vec<(StreamConfig, Arc<StreamController>)> = self
            .read_entries()
            .iter()
            .map(|entry| (entry.config.clone(), entry.controller.clone()))
            .collect();

        let mut next = Vec::with_capacity(configs.len());
        let mut to_stop = Vec::new();
        let mut to_start = Vec::new();
        let mut resizes = Vec::new();

        for config in configs {
            let existing = current.iter().find(|(old, _)| old.name == config.name);
            match existing {
                Some((old, controller)) if old.url.trim() == config.url.trim() => {
                    if (old.width, old.height) != (config.width, config.height) {
                        resizes.push((controller.clone(), config.width, config.height));
                    }
                    match (old.enabled, config.enabled) {
                        (true, false) => to_stop.push(controller.clone()),
                        (false, true) => to_start.push(controller.clone()),
                        _ => {}
                    }
                    next.push(FleetEntry {
                        config,
                        controller: controller.clone(),
                    });
                }
                Some((_, controller)) => {
                    log::info!("[Fleet] Source of {} changed, replacing stream", config.name);
                    to_stop.push(controller.clone());
                    let replacement = self.build_controller(&config)?;
                    if config.enabled {
                        to_start.push(replacement.clone());
                    }
                    next.push(FleetEntry {
                        config,
                        controller: replacement,
                    });
                }
                None => {
                    let controller = self.build_controller(&config)?;
                    log::info!("[Fleet] Added stream {}", config.name);
                    if config.enabled {
                        to_start.push(controller.clone());
                    }
                    next.push(FleetEntry { config, controller });
                }
            }
        }

        for (old, controller) in &current {
            if !next.iter().any(|entry| entry.config.name == old.name) {
                log::info!("[Fleet] Removed stream {}", old.name);
                to_stop.push(controller.clone());
            }
        }

        *self.write_entries() = next;

        join_all(to_stop.iter().map(|controller| controller.stop())).await;
        for (controller, width, height) in resizes {
            if let Err(e) = controller.change_resolution(width, height).await {
                log::warn!("[Fleet] Failed to resize {}: {e}", controller.name());
            }
        }
        join_all(to_start.iter().map(|controller| controller.start())).await;

        Ok(())
    }

    /// Stop the sweep and every stream concurrently, bounded by
    /// `SHUTDOWN_TIMEOUT`. Returns the number of abandoned streams.
    pub async fn shutdown(&self) -> usize {
        self.cancel_sweep();

        let controllers = self.controllers();
        log::info!("[Fleet] Shutting down {} stream(s)", controllers.len());

        let deadline = Instant::now() + SHUTDOWN_TIMEOUT;
        let finished = join_all(controllers.iter().map(|controller| async move {
            tokio::time::timeout_at(deadline, controller.stop()).await.is_ok()
        }))
        .await;

        let mut abandoned = 0;
        for (controller, finished) in controllers.iter().zip(finished) {
            if !finished {
                log::warn!(
                    "[Stream:{}] Did not stop within {SHUTDOWN_TIMEOUT:?}, abandoning",
                    controller.name()
                );
                abandoned += 1;
            }
        }

        log::info!("[Fleet] Shutdown complete ({abandoned} abandoned)");
        abandoned
    }
}

impl Drop for FleetSupervisor {
    fn drop(&mut self) {
        self.cancel_sweep();
    }
}

/// Reject a stream list with invalid entries or repeated names
fn validate_configs(configs: &[StreamConfig]) -> Result<(), ConfigError> {
    for (index, config) in configs.iter().enumerate() {
        StreamEndpoint::from_config(config)?;
        if configs[..index].iter().any(|other| other.name == config.name) {
            return Err(ConfigError::DuplicateName(config.name.clone()));
        }
    }
    Ok(())
}

async fn health_sweep(fleet: Weak<FleetSupervisor>, period: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(fleet) = fleet.upgrade() else {
            break;
        };
        let kicked = fleet.sweep_once().await;
        if kicked > 0 {
            log::info!("[Fleet] Health sweep reconnected {kicked} stream(s)");
        }
    }
}
