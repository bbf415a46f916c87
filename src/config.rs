use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::identity::NetworkCredential;

/// Top-level configuration for the connectivity layer.
///
/// Loaded once at startup from a TOML file (see [`LinkConfig::load`]) and
/// handed by value to the components that need it. Every field has a default
/// so a partial or missing file still yields a working configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Human-readable device name sent with every registration.
    pub device_name: String,
    /// Backend host/port for both the HTTP API and the pub/sub session.
    pub backend: BackendConfig,
    /// Ordered credential list, tried first to last with wraparound.
    pub credentials: Vec<NetworkCredential>,
    /// Telemetry tick interval, overridden by the backend config payload.
    pub update_interval_ms: u64,
    pub registration: RegistrationSettings,
    pub timing: TimingConfig,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            device_name: "automata-device".to_string(),
            backend: BackendConfig::default(),
            credentials: Vec::new(),
            update_interval_ms: 9000,
            registration: RegistrationSettings::default(),
            timing: TimingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub host: String,
    pub port: u16,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl BackendConfig {
    /// Base URL of the backend's main HTTP API.
    pub fn api_base(&self) -> String {
        format!("http://{}:{}/api/v1/main", self.host, self.port)
    }
}

/// Retry policy for device registration.
///
/// The delay before attempt `n` is `min(cap_ms, base_ms * 2^n)`. The attempt
/// ceiling is soft: reaching it is logged at error level and optionally trips
/// the restart token, but retries never stop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationSettings {
    pub base_ms: u64,
    pub cap_ms: u64,
    pub max_attempts: u32,
    pub restart_on_ceiling: bool,
}

impl Default for RegistrationSettings {
    fn default() -> Self {
        Self {
            base_ms: 5000,
            cap_ms: 60_000,
            max_attempts: 6,
            restart_on_ceiling: false,
        }
    }
}

/// Fixed operation timeouts and polling cadences, all in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Per-credential association attempt timeout.
    pub associate_timeout_secs: u64,
    /// HTTP request timeout for all backend calls.
    pub http_timeout_secs: u64,
    /// Cooldown after a detected network drop before reconnecting.
    pub cooldown_secs: u64,
    /// Interval between connectivity status polls while connected.
    pub link_poll_secs: u64,
    /// Interval between pub/sub session liveness probes.
    pub session_probe_secs: u64,
    /// Cadence for refreshing the credential list from the backend.
    pub credential_refresh_secs: u64,
    /// Cadence for checking whether a deferred registration is due.
    pub registration_check_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            associate_timeout_secs: 20,
            http_timeout_secs: 5,
            cooldown_secs: 10,
            link_poll_secs: 10,
            session_probe_secs: 15,
            credential_refresh_secs: 3600,
            registration_check_secs: 1,
        }
    }
}

impl TimingConfig {
    pub fn associate_timeout(&self) -> Duration {
        Duration::from_secs(self.associate_timeout_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn link_poll(&self) -> Duration {
        Duration::from_secs(self.link_poll_secs)
    }

    pub fn session_probe(&self) -> Duration {
        Duration::from_secs(self.session_probe_secs)
    }

    pub fn credential_refresh(&self) -> Duration {
        Duration::from_secs(self.credential_refresh_secs)
    }

    pub fn registration_check(&self) -> Duration {
        Duration::from_secs(self.registration_check_secs)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

impl LinkConfig {
    /// Loads configuration from a TOML file, falling back to defaults for
    /// any missing section.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: LinkConfig = toml::from_str(&raw)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Loads from [`LinkConfig::default_path`] if the file exists, otherwise
    /// returns the built-in defaults.
    pub fn load_or_default() -> Self {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path).unwrap_or_else(|e| {
                tracing::warn!("Config load failed ({}), using defaults", e);
                Self::default()
            }),
            _ => Self::default(),
        }
    }

    /// Default configuration location under the platform config directory.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("automata-link").join("config.toml"))
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }
}
