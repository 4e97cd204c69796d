//! Connection settings.
//!
//! The host hands over a loosely-typed [`ConnectionConfig`] record. It is
//! resolved once, at connection creation, into an immutable [`Settings`]
//! snapshot that the channel and every call issued on it read from.

use crate::error::BridgeError;

use http::uri::Authority;
use serde::Deserialize;
use std::time::Duration;

/// Default keepalive ping timeout.
pub const DEFAULT_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(20);

/// Longest per-call deadline. The `grpc-timeout` header carries at most eight
/// digits per unit, and longer deadlines are clamped to this value.
pub const MAX_REQUEST_TIMEOUT: Duration = Duration::from_secs(99_999_999);

/// Connection configuration as supplied by the host.
///
/// Every field is optional at this level; [`Settings::resolve`] applies the
/// defaults. Unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConnectionConfig {
    /// Target `host[:port]`. Required.
    pub host: Option<String>,
    /// Use plaintext HTTP/2 instead of TLS.
    pub insecure: Option<bool>,
    /// Maximum inbound message size in bytes.
    pub response_size_limit: Option<u64>,
    /// Enable HTTP/2 keepalive pings.
    pub keepalive: Option<bool>,
    /// Keepalive ping interval in seconds.
    pub keepalive_interval: Option<u64>,
    /// Keepalive ping timeout in seconds.
    pub keepalive_timeout: Option<u64>,
    /// Compress outbound messages with the named encoding.
    pub compression: Option<bool>,
    /// Name of the message encoding (`gzip`, `zstd` or `identity`).
    pub compression_name: Option<String>,
    /// Per-call deadline in milliseconds.
    pub request_timeout: Option<u64>,
}

impl ConnectionConfig {
    /// Create a configuration targeting `host` with every other field unset.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: Some(host.into()),
            ..Default::default()
        }
    }

    /// Set the plaintext flag.
    pub fn insecure(mut self, insecure: bool) -> Self {
        self.insecure = Some(insecure);
        self
    }
}

/// Message encoding applied to a connection's calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Gzip,
    Zstd,
}

impl Compression {
    /// Parse an encoding name. `identity` and the empty string mean none.
    pub fn from_name(name: &str) -> Result<Option<Self>, BridgeError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "" | "identity" => Ok(None),
            "gzip" => Ok(Some(Compression::Gzip)),
            "zstd" => Ok(Some(Compression::Zstd)),
            other => Err(BridgeError::Configuration(format!(
                "unsupported compression '{}' (expected 'gzip', 'zstd' or 'identity')",
                other
            ))),
        }
    }

    /// Encoding name as carried in `grpc-encoding`.
    pub fn name(self) -> &'static str {
        match self {
            Compression::Gzip => "gzip",
            Compression::Zstd => "zstd",
        }
    }
}

/// Keepalive behaviour of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keepalive {
    pub enabled: bool,
    /// `None` means no pings are scheduled.
    pub interval: Option<Duration>,
    pub timeout: Duration,
}

impl Keepalive {
    /// The interval to configure on the channel, if pings should be sent at all.
    pub fn ping_interval(&self) -> Option<Duration> {
        if self.enabled { self.interval } else { None }
    }
}

impl Default for Keepalive {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: None,
            timeout: DEFAULT_KEEPALIVE_TIMEOUT,
        }
    }
}

/// Resolved, immutable connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    host: String,
    insecure: bool,
    response_size_limit: Option<usize>,
    keepalive: Keepalive,
    compression: Option<Compression>,
    compress_messages: bool,
    request_timeout: Option<Duration>,
}

impl Settings {
    /// Validate and normalize a host-supplied configuration.
    pub fn resolve(config: &ConnectionConfig) -> Result<Self, BridgeError> {
        let host = normalize_host(config.host.as_deref().unwrap_or_default())?;

        let keepalive_timeout = config
            .keepalive_timeout
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_KEEPALIVE_TIMEOUT);

        let compression = match &config.compression_name {
            Some(name) => Compression::from_name(name)?,
            None => None,
        };

        Ok(Self {
            host,
            insecure: config.insecure.unwrap_or(false),
            response_size_limit: config
                .response_size_limit
                .filter(|limit| *limit > 0)
                .map(|limit| usize::try_from(limit).unwrap_or(usize::MAX)),
            keepalive: Keepalive {
                enabled: config.keepalive.unwrap_or(true),
                interval: config
                    .keepalive_interval
                    .filter(|secs| *secs > 0)
                    .map(Duration::from_secs),
                timeout: keepalive_timeout,
            },
            compression,
            compress_messages: config.compression.unwrap_or(false),
            request_timeout: config
                .request_timeout
                .filter(|millis| *millis > 0)
                .map(|millis| Duration::from_millis(millis).min(MAX_REQUEST_TIMEOUT)),
        })
    }

    /// Target authority, `host[:port]`.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn insecure(&self) -> bool {
        self.insecure
    }

    pub fn response_size_limit(&self) -> Option<usize> {
        self.response_size_limit
    }

    pub fn keepalive(&self) -> Keepalive {
        self.keepalive
    }

    pub fn compression(&self) -> Option<Compression> {
        self.compression
    }

    /// Whether outbound messages are compressed with [`Settings::compression`].
    pub fn compress_messages(&self) -> bool {
        self.compress_messages && self.compression.is_some()
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }

    /// Endpoint URI for the channel, with the scheme chosen by the TLS mode.
    pub fn endpoint_uri(&self) -> String {
        let scheme = if self.insecure { "http" } else { "https" };
        format!("{}://{}", scheme, self.host)
    }
}

fn normalize_host(host: &str) -> Result<String, BridgeError> {
    let host = host.trim();
    let host = host
        .strip_prefix("https://")
        .or_else(|| host.strip_prefix("http://"))
        .unwrap_or(host)
        .trim_end_matches('/');

    if host.is_empty() {
        return Err(BridgeError::Configuration("host is required".to_string()));
    }

    host.parse::<Authority>()
        .map_err(|e| BridgeError::Configuration(format!("invalid host '{}': {}", host, e)))?;

    Ok(host.to_string())
}
