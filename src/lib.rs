// Streamvisor Library
// Supervised FFmpeg ingest of live RTMP, RTSP and HLS sources

pub mod error;
pub mod models;
pub mod services;
