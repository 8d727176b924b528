use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};

/// Configuration for a listening server.
///
/// `port`, `accept_timeout_ms` and `backlog` may be changed at any time but
/// only take effect on the next `listen()`.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub ip: String,
    pub port: u16,
    /// The accept timeout; bounds the latency of observing a stop request.
    pub accept_timeout_ms: u64,
    pub backlog: u32,
    pub max_frame_size: usize,
    pub read_buffer_size: usize,
    /// Capacity of the serialized event queue feeding the application handler.
    pub event_channel_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            ip: "0.0.0.0".to_string(),
            port: 5555,
            accept_timeout_ms: 500,
            backlog: 10,
            max_frame_size: 1024 * 1024,
            read_buffer_size: 4 * 1024,
            event_channel_capacity: 1024,
        }
    }
}

/// Configuration for a single-connection client.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub max_frame_size: usize,
    pub read_buffer_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            host: "localhost".to_string(),
            port: 5555,
            max_frame_size: 1024 * 1024,
            read_buffer_size: 4 * 1024,
        }
    }
}

fn load_from_file<P: AsRef<Path>, T: for<'de> Deserialize<'de>>(path: P) -> AppResult<T> {
    let path_str = path
        .as_ref()
        .to_str()
        .ok_or(AppError::InvalidValue(format!(
            "config file path: {}",
            path.as_ref().to_string_lossy()
        )))?;
    let config = config::Config::builder()
        .add_source(config::File::with_name(path_str))
        .build()?;
    Ok(config.try_deserialize()?)
}

impl ServerConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<ServerConfig> {
        load_from_file(path)
    }
}

impl ClientConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<ClientConfig> {
        load_from_file(path)
    }
}
