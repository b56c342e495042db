//! Client configuration.
//!
//! Defaults match the long-standing behaviour: a fixed 120 second call
//! timeout and a one second reconnect delay. Each value can be overridden from
//! the environment:
//!
//! | Variable                     | Meaning                              |
//! |------------------------------|--------------------------------------|
//! | `RELAYRPC_CALL_TIMEOUT_SECS` | Per-call timeout in seconds          |
//! | `RELAYRPC_RETRY_MS`          | Reconnect delay (`0` disables retry) |
//! | `RELAYRPC_MAX_FRAME_BYTES`   | Largest accepted inbound frame       |

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default per-call timeout in seconds.
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 120;

/// Default delay between reconnect attempts in milliseconds.
pub const DEFAULT_RETRY_MS: u64 = 1_000;

/// Maximum frame size (100MB) to prevent OOM from malicious/buggy peers.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

/// Settings shared by a client and its transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// How long a call waits for its reply.
    pub call_timeout: Duration,
    /// Delay before redialing after a connection is lost. `None` disables reconnect.
    pub retry_delay: Option<Duration>,
    /// Largest inbound frame accepted before the connection is dropped.
    pub max_frame_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS),
            retry_delay: Some(Duration::from_millis(DEFAULT_RETRY_MS)),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl ClientConfig {
    /// Build a configuration from `RELAYRPC_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    ///
    /// Unparseable values are logged and ignored.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(secs) = parse_var::<u64>(&lookup, "RELAYRPC_CALL_TIMEOUT_SECS") {
            config.call_timeout = Duration::from_secs(secs);
        }

        if let Some(ms) = parse_var::<u64>(&lookup, "RELAYRPC_RETRY_MS") {
            config.retry_delay = (ms > 0).then(|| Duration::from_millis(ms));
        }

        if let Some(bytes) = parse_var::<usize>(&lookup, "RELAYRPC_MAX_FRAME_BYTES") {
            config.max_frame_size = bytes;
        }

        config
    }

    /// Override the per-call timeout.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Override the reconnect delay.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    /// Never redial after the connection drops.
    pub fn without_retry(mut self) -> Self {
        self.retry_delay = None;
        self
    }
}

fn parse_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring invalid configuration value");
            None
        }
    }
}

/// Resolve the default socket path for `relayrpc serve`.
///
/// Resolution order:
/// 1. `$XDG_RUNTIME_DIR/relayrpc.sock` (Linux standard)
/// 2. `~/Library/Caches/relayrpc.sock` (macOS)
/// 3. `/tmp/relayrpc.sock` (fallback)
pub fn default_socket_path() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir).join("relayrpc.sock");
    }

    if let Some(cache_dir) = dirs::cache_dir() {
        return cache_dir.join("relayrpc.sock");
    }

    PathBuf::from("/tmp/relayrpc.sock")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.call_timeout, Duration::from_secs(120));
        assert_eq!(config.retry_delay, Some(Duration::from_secs(1)));
        assert_eq!(config.max_frame_size, 100 * 1024 * 1024);
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = ClientConfig::from_lookup(lookup_from(&[
            ("RELAYRPC_CALL_TIMEOUT_SECS", "5"),
            ("RELAYRPC_RETRY_MS", "250"),
            ("RELAYRPC_MAX_FRAME_BYTES", "4096"),
        ]));

        assert_eq!(
            config,
            ClientConfig {
                call_timeout: Duration::from_secs(5),
                retry_delay: Some(Duration::from_millis(250)),
                max_frame_size: 4096,
            }
        );
    }

    #[test]
    fn test_zero_retry_disables_reconnect() {
        let config = ClientConfig::from_lookup(lookup_from(&[("RELAYRPC_RETRY_MS", "0")]));
        assert_eq!(config.retry_delay, None);
    }

    #[test]
    fn test_invalid_values_fall_back_to_defaults() {
        let config = ClientConfig::from_lookup(lookup_from(&[
            ("RELAYRPC_CALL_TIMEOUT_SECS", "soon"),
            ("RELAYRPC_MAX_FRAME_BYTES", "-1"),
        ]));
        assert_eq!(config, ClientConfig::default());
    }

    #[test]
    fn test_builders() {
        let config = ClientConfig::default()
            .with_call_timeout(Duration::from_millis(50))
            .without_retry();
        assert_eq!(config.call_timeout, Duration::from_millis(50));
        assert_eq!(config.retry_delay, None);

        let config = config.with_retry_delay(Duration::from_millis(10));
        assert_eq!(config.retry_delay, Some(Duration::from_millis(10)));
    }

    #[test]
    fn test_default_socket_path_format() {
        let path = default_socket_path();

        assert!(path.is_absolute() || path.starts_with("/tmp"));

        let filename = path.file_name().unwrap().to_str().unwrap();
        assert_eq!(filename, "relayrpc.sock");
    }
}
