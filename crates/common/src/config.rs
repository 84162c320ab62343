// Configuration model for tunnelkeep
//
// The on-disk format is TOML. Unknown or missing optional keys fall back to
// documented defaults; required keys that are missing or invalid are
// collected into a single aggregated ConfigError, so a config load never
// partially succeeds.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, FieldError};

/// Remote SSH endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteConfig {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub host: String,
    /// SSH server port (default: 22)
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// Path to the private key used for authentication
    #[serde(default = "default_key_path")]
    pub key_path: PathBuf,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            user: String::new(),
            host: String::new(),
            port: default_ssh_port(),
            key_path: default_key_path(),
        }
    }
}

/// Restart policy knobs consumed by the backoff policy and the debouncer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RestartConfig {
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_factor")]
    pub factor: f64,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            factor: default_factor(),
            jitter: default_jitter(),
            debounce_ms: default_debounce_ms(),
        }
    }
}

/// A single `localHost:localPort:remoteHost:remotePort` forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardSpec {
    pub local_host: String,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
}

impl ForwardSpec {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let parts: Vec<&str> = raw.trim().split(':').collect();
        if parts.len() != 4 {
            return Err(format!(
                "expected localHost:localPort:remoteHost:remotePort, got {raw:?}"
            ));
        }
        let local_host = if parts[0].is_empty() {
            "127.0.0.1".to_string()
        } else {
            parts[0].to_string()
        };
        let local_port: u16 = parts[1]
            .parse()
            .map_err(|_| format!("invalid local port {:?}", parts[1]))?;
        if parts[2].is_empty() {
            return Err("remote host must not be empty".to_string());
        }
        let remote_port: u16 = parts[3]
            .parse()
            .map_err(|_| format!("invalid remote port {:?}", parts[3]))?;
        Ok(Self {
            local_host,
            local_port,
            remote_host: parts[2].to_string(),
            remote_port,
        })
    }
}

impl std::fmt::Display for ForwardSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.local_host, self.local_port, self.remote_host, self.remote_port
        )
    }
}

/// Validated operating parameters for the tunnel. Immutable once built;
/// a reload reconstructs the whole value, there is no partial mutation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub local_forwards: Vec<String>,
    #[serde(default = "default_periodic_refresh_sec")]
    pub periodic_refresh_sec: u64,
    #[serde(default = "default_sleep_check_sec")]
    pub sleep_check_sec: u64,
    #[serde(default = "default_sleep_gap_sec")]
    pub sleep_gap_sec: u64,
    #[serde(default = "default_network_poll_sec")]
    pub network_poll_sec: u64,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub restart: RestartConfig,
}

impl Config {
    /// Parse and validate configuration text. All field problems are
    /// aggregated into one error.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let raw: Config = toml::from_str(text)
            .map_err(|e| ConfigError::single("config", &e.to_string()))?;
        raw.validate()?;
        Ok(raw)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        let mut push = |field: &str, reason: String| {
            errors.push(FieldError {
                field: field.to_string(),
                reason,
            });
        };

        if self.remote.user.trim().is_empty() {
            push("remote.user", "is required".to_string());
        }
        if self.remote.host.trim().is_empty() {
            push("remote.host", "is required".to_string());
        }
        if self.remote.port == 0 {
            push("remote.port", "must be in [1, 65535]".to_string());
        }

        if self.restart.min_delay_ms > self.restart.max_delay_ms {
            push(
                "restart.min_delay_ms",
                format!(
                    "must not exceed max_delay_ms ({} > {})",
                    self.restart.min_delay_ms, self.restart.max_delay_ms
                ),
            );
        }
        if self.restart.factor <= 1.0 || !self.restart.factor.is_finite() {
            push("restart.factor", "must be > 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.restart.jitter) {
            push("restart.jitter", "must be within [0, 1]".to_string());
        }

        let forwards = self.forwards_trimmed();
        if forwards.is_empty() {
            push("local_forwards", "at least one forward is required".to_string());
        } else {
            for spec in &forwards {
                if let Err(reason) = ForwardSpec::parse(spec) {
                    push("local_forwards", reason);
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError { errors })
        }
    }

    fn forwards_trimmed(&self) -> Vec<String> {
        self.local_forwards
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Parsed forward specs. Safe to unwrap element parsing after validate().
    pub fn forwards(&self) -> Vec<ForwardSpec> {
        self.forwards_trimmed()
            .iter()
            .filter_map(|s| ForwardSpec::parse(s).ok())
            .collect()
    }

    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.restart.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.restart.max_delay_ms)
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.restart.debounce_ms)
    }

    pub fn periodic_refresh(&self) -> Duration {
        Duration::from_secs(self.periodic_refresh_sec)
    }

    pub fn sleep_check(&self) -> Duration {
        Duration::from_secs(self.sleep_check_sec)
    }

    pub fn sleep_gap(&self) -> Duration {
        Duration::from_secs(self.sleep_gap_sec)
    }

    pub fn network_poll(&self) -> Duration {
        Duration::from_secs(self.network_poll_sec)
    }

    /// Default config file location: `<config_dir>/tunnelkeep/tunnelkeep.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("tunnelkeep").join("tunnelkeep.toml"))
    }
}

// Default value functions

fn default_ssh_port() -> u16 {
    22
}

fn default_key_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ssh")
        .join("id_ed25519")
}

fn default_min_delay_ms() -> u64 {
    2000
}

fn default_max_delay_ms() -> u64 {
    30000
}

fn default_factor() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.2
}

fn default_debounce_ms() -> u64 {
    2000
}

fn default_periodic_refresh_sec() -> u64 {
    3600
}

fn default_sleep_check_sec() -> u64 {
    5
}

fn default_sleep_gap_sec() -> u64 {
    30
}

fn default_network_poll_sec() -> u64 {
    5
}
