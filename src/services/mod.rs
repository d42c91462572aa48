// Streamvisor Services
// Supervision layer: engine processes, decoding, recording, fleet

mod engine_locator;
mod events;
mod ffmpeg_launcher;
mod fleet_supervisor;
mod frame_decoder;
mod log_manager;
mod recording_service;
mod resolution_sniffer;
mod settings_manager;
mod stream_controller;

#[cfg(test)]
pub(crate) mod test_support;

pub use engine_locator::*;
pub use events::*;
pub use ffmpeg_launcher::*;
pub use fleet_supervisor::*;
pub use frame_decoder::*;
pub use log_manager::*;
pub use recording_service::*;
pub use resolution_sniffer::*;
pub use settings_manager::*;
pub use stream_controller::*;
