// Streamvisor
// Headless supervisor: loads settings, starts every enabled stream and runs
// until Ctrl+C or SIGTERM

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::signal;

use streamvisor::services::{
    init_logging, prune_logs, EngineLocator, FfmpegLauncher, FleetSupervisor, LogEventSink,
    NullFrameSink, SettingsManager,
};

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration from environment
    let data_dir = env::var("STREAMVISOR_DATA_DIR").unwrap_or_else(|_| "data".to_string());
    let log_dir = env::var("STREAMVISOR_LOG_DIR").unwrap_or_else(|_| format!("{data_dir}/logs"));
    let env_ffmpeg_path = env::var("STREAMVISOR_FFMPEG_PATH")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    let app_data_dir = PathBuf::from(&data_dir);
    let log_dir_path = PathBuf::from(&log_dir);
    std::fs::create_dir_all(&app_data_dir)?;

    let settings_manager = SettingsManager::new(app_data_dir.clone());
    let settings = settings_manager.load()?;

    let log_path = init_logging(&log_dir_path, &settings.log_level)?;
    log::info!("Streamvisor {} starting", env!("CARGO_PKG_VERSION"));
    log::info!("Data directory: {app_data_dir:?}");
    log::info!("Logging to {log_path:?}");

    match prune_logs(&log_dir_path, settings.log_retention_days) {
        Ok(0) => {}
        Ok(removed) => log::info!("Pruned {removed} old log file(s)"),
        Err(e) => log::warn!("Failed to prune logs: {e}"),
    }

    // Environment override wins over settings
    let custom_path = env_ffmpeg_path.unwrap_or_else(|| settings.ffmpeg_path.clone());
    let ffmpeg_path = match EngineLocator::new(Some(&custom_path)).locate() {
        Ok(path) => path,
        Err(e) => {
            log::error!("{e}");
            if let streamvisor::error::EngineError::BinaryNotFound { searched } = &e {
                for location in searched {
                    log::error!("  searched: {location:?}");
                }
            }
            return Err(e.into());
        }
    };

    let recordings_dir = settings_manager.recordings_dir(&settings);
    log::info!("Recordings directory: {recordings_dir:?}");

    let fleet = Arc::new(FleetSupervisor::from_configs(
        &settings.streams,
        Arc::new(FfmpegLauncher::new(ffmpeg_path)),
        Arc::new(NullFrameSink),
        Arc::new(LogEventSink),
        recordings_dir,
    )?);

    if fleet.is_empty() {
        log::warn!("No streams configured in {:?}", settings_manager.settings_path());
    }

    fleet.start_all().await;
    fleet.spawn_health_sweep();

    shutdown_signal().await;
    log::info!("Shutdown signal received, stopping streams...");

    let abandoned = fleet.shutdown().await;
    if abandoned > 0 {
        log::warn!("{abandoned} stream(s) did not stop cleanly");
    }

    log::info!("Streamvisor stopped");
    log::logger().flush();
    Ok(())
}
