//! Default values for configuration

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8088";
pub const DEFAULT_DATA_DIR: &str = "./data";
pub const DEFAULT_HLS_ROOT: &str = "./data/hls";
pub const DEFAULT_STORAGE_BACKEND: &str = "sqlite";
pub const DEFAULT_STREAM_PORT: u16 = 8001;

/// Some receiver firmwares reject unknown user agents on the stream port;
/// this one is known to pass.
pub const DEFAULT_STREAM_USER_AGENT: &str = "VLC/3.0.18 LibVLC/3.0.18";

pub const DEFAULT_FFMPEG_COMMAND: &str = "ffmpeg";
pub const DEFAULT_LOG_RING_LINES: usize = 200;
pub const DEFAULT_DISK_PCT: u8 = 90;
