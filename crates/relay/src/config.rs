// Relay server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development.

use std::net::SocketAddr;

use gridsync_common::room::DEFAULT_ROOM_NAME;

pub const DEFAULT_PORT: u16 = 1234;
pub const DEFAULT_MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Log output format for the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Core relay server configuration.
///
/// Constructed via [`RelayConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// URL clients use to reach the relay (e.g. `ws://localhost:1234`).
    pub ws_url: String,
    /// Room joined by connections whose path names no room.
    pub default_room: String,
    /// Largest inbound websocket message accepted, in bytes.
    pub max_frame_bytes: usize,
    /// Log filter directive (e.g. `info`, `gridsync_relay=debug`).
    pub log_filter: String,
    pub log_format: LogFormat,
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `GRIDSYNC_RELAY_HOST` | `0.0.0.0` |
    /// | `GRIDSYNC_RELAY_PORT` (then `WS_PORT`) | `1234` |
    /// | `GRIDSYNC_RELAY_WS_URL` | `ws://localhost:{port}` |
    /// | `GRIDSYNC_RELAY_DEFAULT_ROOM` | `default-room` |
    /// | `GRIDSYNC_RELAY_MAX_FRAME_BYTES` | `4194304` |
    /// | `GRIDSYNC_RELAY_LOG_FILTER` | `info` |
    /// | `GRIDSYNC_RELAY_LOG_FORMAT` | `text` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("GRIDSYNC_RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = env("GRIDSYNC_RELAY_PORT")
            .or_else(|_| env("WS_PORT"))
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_PORT);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let ws_url =
            env("GRIDSYNC_RELAY_WS_URL").unwrap_or_else(|_| format!("ws://localhost:{port}"));

        let default_room = env("GRIDSYNC_RELAY_DEFAULT_ROOM")
            .ok()
            .filter(|room| !room.is_empty())
            .unwrap_or_else(|| DEFAULT_ROOM_NAME.into());

        let max_frame_bytes = env("GRIDSYNC_RELAY_MAX_FRAME_BYTES")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|bytes: &usize| *bytes > 0)
            .unwrap_or(DEFAULT_MAX_FRAME_BYTES);

        let log_filter = env("GRIDSYNC_RELAY_LOG_FILTER").unwrap_or_else(|_| "info".into());

        let log_format = match env("GRIDSYNC_RELAY_LOG_FORMAT") {
            Ok(format) if format.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        Self { listen_addr, ws_url, default_room, max_frame_bytes, log_filter, log_format }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::from_env_fn(|_| Err(std::env::VarError::NotPresent))
    }
}
