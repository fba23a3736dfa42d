//! Router configuration loading.
//!
//! Environment variables are the sole config source; every knob has a
//! default so a bare `router` starts on `0.0.0.0:8080`.
//!
//! # Variables
//! - `LISTEN_ADDR` (default `0.0.0.0:8080`)
//! - `REQUEST_TIMEOUT_S` (default 60)
//! - `KEEPALIVE_INTERVAL_S` (default 15)
//! - `MAX_BUFFERED_BYTES` (default 268435456 = 256 MiB)
//! - `STREAM_QUEUE_DEPTH` (default 16)
//! - `MAX_CHUNK_SIZE` (default 4194304 = 4 MiB)
//! - `OBJECT_STORE_URL` (optional; advisory, surfaced to operators)
//! - `LOG_FORMAT` (`text` | `json`, default `text`)
//! - `LOG_LEVEL` (default `info`)
//!
//! A malformed value is a startup failure (exit code 1), never a
//! silent fallback.

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Output format for the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(format!("expected \"text\" or \"json\", got {other:?}")),
        }
    }
}

/// Top-level router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub listen_addr: String,
    /// Default per-request deadline; requests may shorten or extend it
    /// via `timeout_s` in the request body.
    pub request_timeout: Duration,
    /// Push-channel ping cadence; two unanswered pings evict a session.
    pub keepalive_interval: Duration,
    /// Pattern A cap on a single buffered upload.
    pub max_buffered_bytes: usize,
    /// Pattern B per-request chunk queue capacity, in records.
    pub stream_queue_depth: usize,
    /// Pattern B cap on a single chunk payload.
    pub max_chunk_size: usize,
    /// Advisory object-store endpoint for pattern C; the router never
    /// dereferences it.
    pub object_store_url: Option<String>,
    pub log_format: LogFormat,
    pub log_level: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_owned(),
            request_timeout: Duration::from_secs(60),
            keepalive_interval: Duration::from_secs(15),
            max_buffered_bytes: 256 * 1024 * 1024,
            stream_queue_depth: 16,
            max_chunk_size: 4 * 1024 * 1024,
            object_store_url: None,
            log_format: LogFormat::Text,
            log_level: "info".to_owned(),
        }
    }
}

/// A config variable failed validation.
#[derive(Debug)]
pub struct ConfigError {
    var: &'static str,
    reason: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {}", self.var, self.reason)
    }
}

impl std::error::Error for ConfigError {}

impl RouterConfig {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Reads the configuration through an arbitrary lookup function.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let request_timeout_s: u64 =
            parse_or("REQUEST_TIMEOUT_S", &lookup, defaults.request_timeout.as_secs())?;
        let keepalive_interval_s: u64 = parse_or(
            "KEEPALIVE_INTERVAL_S",
            &lookup,
            defaults.keepalive_interval.as_secs(),
        )?;
        if request_timeout_s == 0 {
            return Err(ConfigError {
                var: "REQUEST_TIMEOUT_S",
                reason: "must be at least 1".to_owned(),
            });
        }
        if keepalive_interval_s == 0 {
            return Err(ConfigError {
                var: "KEEPALIVE_INTERVAL_S",
                reason: "must be at least 1".to_owned(),
            });
        }

        let stream_queue_depth: usize =
            parse_or("STREAM_QUEUE_DEPTH", &lookup, defaults.stream_queue_depth)?;
        if stream_queue_depth == 0 {
            return Err(ConfigError {
                var: "STREAM_QUEUE_DEPTH",
                reason: "must be at least 1".to_owned(),
            });
        }

        Ok(Self {
            listen_addr: lookup("LISTEN_ADDR").unwrap_or(defaults.listen_addr),
            request_timeout: Duration::from_secs(request_timeout_s),
            keepalive_interval: Duration::from_secs(keepalive_interval_s),
            max_buffered_bytes: parse_or("MAX_BUFFERED_BYTES", &lookup, defaults.max_buffered_bytes)?,
            stream_queue_depth,
            max_chunk_size: parse_or("MAX_CHUNK_SIZE", &lookup, defaults.max_chunk_size)?,
            object_store_url: lookup("OBJECT_STORE_URL").filter(|s| !s.is_empty()),
            log_format: parse_or("LOG_FORMAT", &lookup, defaults.log_format)?,
            log_level: lookup("LOG_LEVEL").unwrap_or(defaults.log_level),
        })
    }
}

fn parse_or<T, F>(var: &'static str, lookup: &F, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError {
            var,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let config = RouterConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:8080");
        assert_eq!(config.request_timeout, Duration::from_secs(60));
        assert_eq!(config.keepalive_interval, Duration::from_secs(15));
        assert_eq!(config.max_buffered_bytes, 256 * 1024 * 1024);
        assert_eq!(config.stream_queue_depth, 16);
        assert_eq!(config.max_chunk_size, 4 * 1024 * 1024);
        assert_eq!(config.object_store_url, None);
        assert_eq!(config.log_format, LogFormat::Text);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn explicit_values_override_defaults() {
        let config = RouterConfig::from_lookup(lookup_from(&[
            ("LISTEN_ADDR", "127.0.0.1:9090"),
            ("REQUEST_TIMEOUT_S", "5"),
            ("KEEPALIVE_INTERVAL_S", "2"),
            ("MAX_BUFFERED_BYTES", "1024"),
            ("STREAM_QUEUE_DEPTH", "4"),
            ("MAX_CHUNK_SIZE", "512"),
            ("OBJECT_STORE_URL", "http://minio:9000"),
            ("LOG_FORMAT", "json"),
            ("LOG_LEVEL", "debug"),
        ]))
        .unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9090");
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.keepalive_interval, Duration::from_secs(2));
        assert_eq!(config.max_buffered_bytes, 1024);
        assert_eq!(config.stream_queue_depth, 4);
        assert_eq!(config.max_chunk_size, 512);
        assert_eq!(config.object_store_url.as_deref(), Some("http://minio:9000"));
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn malformed_number_is_rejected() {
        let err = RouterConfig::from_lookup(lookup_from(&[("MAX_BUFFERED_BYTES", "lots")]))
            .unwrap_err();
        assert!(err.to_string().contains("MAX_BUFFERED_BYTES"));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let err =
            RouterConfig::from_lookup(lookup_from(&[("REQUEST_TIMEOUT_S", "0")])).unwrap_err();
        assert!(err.to_string().contains("REQUEST_TIMEOUT_S"));
    }

    #[test]
    fn unknown_log_format_is_rejected() {
        let err = RouterConfig::from_lookup(lookup_from(&[("LOG_FORMAT", "xml")])).unwrap_err();
        assert!(err.to_string().contains("LOG_FORMAT"));
    }
}
