// Streamvisor Models
// Data structures shared by the supervision services

mod connection_state;
mod settings;
mod stream_endpoint;

pub use connection_state::*;
pub use settings::*;
pub use stream_endpoint::*;
