//! Server configuration.
//!
//! Environment variables are the sole config source.
//!
//! | Variable                | Default          | Meaning                         |
//! |-------------------------|------------------|---------------------------------|
//! | `BIND_ADDR`             | `0.0.0.0:8080`   | Listen address                  |
//! | `BASE_PATH`             | unset            | URL prefix stripped before the stream key |
//! | `DATA_DIR`              | unset            | File-backed store root; unset → in-memory |
//! | `LONG_POLL_TIMEOUT_MS`  | `30000`          | Long-poll / SSE wait deadline   |
//! | `MAX_BODY_BYTES`        | `10485760`       | Request body cap (413 above)    |
//! | `HANDLE_CACHE_CAPACITY` | `100`            | Append-handle cache size        |
//! | `CURSOR_INTERVAL_SECS`  | `20`             | CDN cursor interval             |
//! | `CURSOR_EPOCH_MS`       | 2024-10-09T00:00Z| CDN cursor epoch (unix millis)  |

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Normalized to a leading slash, no trailing slash; `None` serves
    /// streams at the root.
    pub base_path: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub long_poll_timeout: Duration,
    pub max_body_bytes: usize,
    pub handle_cache_capacity: usize,
    pub cursor_interval_secs: u64,
    pub cursor_epoch_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_addr: "0.0.0.0:8080".to_owned(),
            base_path: None,
            data_dir: None,
            long_poll_timeout: Duration::from_millis(30_000),
            max_body_bytes: 10 * 1024 * 1024,
            handle_cache_capacity: 100,
            cursor_interval_secs: ds_protocol::DEFAULT_CURSOR_INTERVAL_SECS,
            cursor_epoch_ms: ds_protocol::DEFAULT_CURSOR_EPOCH_MS,
        }
    }
}

impl ServerConfig {
    /// Load from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary lookup (test seam).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = ServerConfig::default();
        Ok(ServerConfig {
            bind_addr: lookup("BIND_ADDR").unwrap_or(defaults.bind_addr),
            base_path: lookup("BASE_PATH").and_then(|raw| normalize_base_path(&raw)),
            data_dir: lookup("DATA_DIR").map(PathBuf::from),
            long_poll_timeout: Duration::from_millis(parse_or(
                &lookup,
                "LONG_POLL_TIMEOUT_MS",
                defaults.long_poll_timeout.as_millis() as u64,
            )?),
            max_body_bytes: parse_or(&lookup, "MAX_BODY_BYTES", defaults.max_body_bytes)?,
            handle_cache_capacity: parse_or(
                &lookup,
                "HANDLE_CACHE_CAPACITY",
                defaults.handle_cache_capacity,
            )?,
            cursor_interval_secs: parse_or(
                &lookup,
                "CURSOR_INTERVAL_SECS",
                defaults.cursor_interval_secs,
            )?,
            cursor_epoch_ms: parse_or(&lookup, "CURSOR_EPOCH_MS", defaults.cursor_epoch_ms)?,
        })
    }
}

/// `"v1"`, `"/v1"`, `"/v1/"` all become `"/v1"`; an empty or root prefix
/// means no prefix at all.
fn normalize_base_path(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    Some(format!("/{trimmed}"))
}

fn parse_or<T: std::str::FromStr>(
    lookup: impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_owned(),
            value: raw,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = ServerConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.data_dir, None);
        assert_eq!(config.long_poll_timeout, Duration::from_secs(30));
        assert_eq!(config.handle_cache_capacity, 100);
        assert_eq!(config.cursor_interval_secs, 20);
    }

    #[test]
    fn values_override_defaults() {
        let config = ServerConfig::from_lookup(|key| match key {
            "BIND_ADDR" => Some("127.0.0.1:0".to_owned()),
            "DATA_DIR" => Some("/var/lib/streams".to_owned()),
            "LONG_POLL_TIMEOUT_MS" => Some("1500".to_owned()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:0");
        assert_eq!(config.data_dir, Some(PathBuf::from("/var/lib/streams")));
        assert_eq!(config.long_poll_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn base_path_normalizes_slashes() {
        for raw in ["v1", "/v1", "v1/", "/v1/"] {
            let config = ServerConfig::from_lookup(|key| match key {
                "BASE_PATH" => Some(raw.to_owned()),
                _ => None,
            })
            .unwrap();
            assert_eq!(config.base_path.as_deref(), Some("/v1"), "{raw}");
        }
        for raw in ["", "/", "//"] {
            let config = ServerConfig::from_lookup(|key| match key {
                "BASE_PATH" => Some(raw.to_owned()),
                _ => None,
            })
            .unwrap();
            assert_eq!(config.base_path, None, "{raw:?}");
        }
    }

    #[test]
    fn unparseable_numbers_are_rejected() {
        let err = ServerConfig::from_lookup(|key| match key {
            "MAX_BODY_BYTES" => Some("plenty".to_owned()),
            _ => None,
        });
        assert!(matches!(
            err,
            Err(ConfigError::InvalidValue { key, .. }) if key == "MAX_BODY_BYTES"
        ));
    }
}
