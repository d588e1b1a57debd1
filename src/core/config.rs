use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;
pub const DEFAULT_MAX_PENDING: usize = 10 * 1024 * 1024;
pub const DEFAULT_MAX_CONTROL: usize = 1024;

/// Top-level configuration for the Nimbus broker.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// TCP listen address, e.g. `0.0.0.0:4222`.
    pub bind_address: String,
    #[serde(default)]
    pub ping: PingConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Server-initiated heartbeat settings.
#[derive(Debug, Clone, Deserialize)]
pub struct PingConfig {
    /// Interval between server PINGs. Zero disables heartbeats.
    #[serde(default, with = "humantime_serde")]
    pub interval: Duration,
    /// Close the connection after this many unacknowledged PINGs.
    #[serde(default = "default_max_outstanding")]
    pub max_outstanding: u32,
}

/// Client authentication settings.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AuthConfig {
    /// user -> password. Empty means connections are pre-authorized.
    #[serde(default)]
    pub users: HashMap<String, String>,
    /// Deadline for a connection to authenticate. Zero disables the timer.
    #[serde(default, with = "humantime_serde")]
    pub timeout: Duration,
}

/// Per-connection and per-server resource limits.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Max PUB payload bytes.
    #[serde(default = "default_payload")]
    pub payload: usize,
    /// Max outbound-queue bytes per connection.
    #[serde(default = "default_pending")]
    pub pending: usize,
    /// Max control-line length.
    #[serde(default = "default_control")]
    pub control: usize,
    /// Cap on live connections. Zero means unlimited.
    #[serde(default)]
    pub connections: u32,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TelemetryConfig {
    /// Tracing filter for `nimbus start`, e.g. `info` or `nimbus=debug`.
    pub log_level: Option<String>,
}

fn default_max_outstanding() -> u32 {
    3
}

fn default_payload() -> usize {
    DEFAULT_MAX_PAYLOAD
}

fn default_pending() -> usize {
    DEFAULT_MAX_PENDING
}

fn default_control() -> usize {
    DEFAULT_MAX_CONTROL
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::ZERO,
            max_outstanding: default_max_outstanding(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            payload: default_payload(),
            pending: default_pending(),
            control: default_control(),
            connections: 0,
        }
    }
}

impl Config {
    /// Load configuration from a path resolved via NIMBUS_CONFIG or
    /// defaults to `config/nimbus.toml`.
    pub fn load_from_env() -> Result<Self> {
        Self::load(env_config_path())
    }

    /// Load configuration from a specific file (TOML or JSON based on
    /// extension).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path_ref = path.as_ref();
        let data = fs::read_to_string(path_ref)
            .with_context(|| format!("unable to read config {}", path_ref.display()))?;
        if is_json(path_ref) {
            serde_json::from_str(&data)
                .with_context(|| format!("invalid JSON config {}", path_ref.display()))
        } else {
            toml::from_str(&data)
                .with_context(|| format!("invalid TOML config {}", path_ref.display()))
        }
    }

    /// Validate schema-level invariants before startup.
    pub fn validate(&self) -> Result<()> {
        if self.bind_address.is_empty() {
            bail!("bind_address is required");
        }
        if self.limits.payload == 0 {
            bail!("limits.payload must be > 0");
        }
        if self.limits.pending == 0 {
            bail!("limits.pending must be > 0");
        }
        if self.limits.control == 0 {
            bail!("limits.control must be > 0");
        }
        if !self.ping.interval.is_zero() && self.ping.max_outstanding == 0 {
            bail!("ping.max_outstanding must be > 0 when ping.interval is set");
        }
        Ok(())
    }

    /// True when clients must authenticate before issuing requests.
    pub fn auth_required(&self) -> bool {
        !self.auth.users.is_empty()
    }
}

fn env_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("NIMBUS_CONFIG") {
        PathBuf::from(path)
    } else {
        PathBuf::from("config/nimbus.toml")
    }
}

fn is_json(path: &Path) -> bool {
    matches!(path.extension().and_then(|s| s.to_str()), Some("json"))
}

mod humantime_serde {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
