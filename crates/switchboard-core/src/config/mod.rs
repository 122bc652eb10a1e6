//! Configuration management with file persistence
//!
//! Settings live in `config.toml` under `$SWITCHBOARD_CONFIG_DIR` (or the
//! platform config directory). A missing file yields defaults; missing
//! sections or fields within a file take their defaults too.

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ErrorCode;
use crate::routing::{DEFAULT_CONTEXT, DEFAULT_REWARD_CEILING, RoutingPreference};

/// Environment variable overriding the config directory
pub const CONFIG_DIR_ENV: &str = "SWITCHBOARD_CONFIG_DIR";

/// Upper bound for `sticky.ttl_secs` and `health.cooldown_secs` (one year)
pub const MAX_DURATION_SECS: u64 = 365 * 24 * 60 * 60;

/// Switchboard configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub routing: RoutingConfig,
    pub sticky: StickyConfig,
    pub health: HealthConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub preference: RoutingPreference,
    /// Raw reward that normalizes to 1.0
    pub reward_ceiling: f64,
    /// Upper bound on backends tried per request (all when unset)
    pub max_attempts: Option<usize>,
    pub default_context: String,
    /// Cost at which the cost factor halves
    pub cost_reference: f64,
    /// Latency at which the latency factor halves
    pub latency_reference_ms: f64,
    /// Record a zero reward for backends that fail an attempt
    pub record_failures: bool,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            preference: RoutingPreference::Balanced,
            reward_ceiling: DEFAULT_REWARD_CEILING,
            max_attempts: None,
            default_context: DEFAULT_CONTEXT.to_string(),
            cost_reference: 0.01,
            latency_reference_ms: 1000.0,
            record_failures: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StickyConfig {
    /// Base affinity duration before success scaling
    pub ttl_secs: u64,
}

impl Default for StickyConfig {
    fn default() -> Self {
        Self { ttl_secs: 600 }
    }
}

impl StickyConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub cooldown_secs: u64,
    /// Disable backends whose attempts fail with one of `auto_disable_codes`
    pub auto_disable: bool,
    pub auto_disable_codes: Vec<ErrorCode>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: 60,
            auto_disable: true,
            auto_disable_codes: vec![
                ErrorCode::QuotaExceeded,
                ErrorCode::RateLimited,
                ErrorCode::ProviderUnavailable,
            ],
        }
    }
}

impl HealthConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

/// Which bandit store implementation to open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sqlite,
    Redis,
}

impl std::str::FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "sqlite" => Ok(Self::Sqlite),
            "redis" => Ok(Self::Redis),
            _ => Err(format!("Unknown store backend: {}", s)),
        }
    }
}

impl std::fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory => write!(f, "memory"),
            Self::Sqlite => write!(f, "sqlite"),
            Self::Redis => write!(f, "redis"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub sqlite_path: Option<PathBuf>,
    pub redis_url: Option<String>,
    pub key_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            sqlite_path: None,
            redis_url: None,
            key_prefix: crate::routing::store::DEFAULT_KEY_PREFIX.to_string(),
        }
    }
}

const KEYS: &[&str] = &[
    "routing.preference",
    "routing.reward_ceiling",
    "routing.max_attempts",
    "routing.default_context",
    "routing.cost_reference",
    "routing.latency_reference_ms",
    "routing.record_failures",
    "sticky.ttl_secs",
    "health.cooldown_secs",
    "health.auto_disable",
    "health.auto_disable_codes",
    "store.backend",
    "store.sqlite_path",
    "store.redis_url",
    "store.key_prefix",
];

fn unknown_key(key: &str) -> anyhow::Error {
    anyhow!(
        "Unknown configuration key: {}. Use `switchboard config list` to see available keys.",
        key
    )
}

fn parse_positive(key: &str, value: &str) -> anyhow::Result<f64> {
    let parsed: f64 = value
        .parse()
        .with_context(|| format!("Invalid {} value: {}", key, value))?;
    if !parsed.is_finite() || parsed <= 0.0 {
        return Err(anyhow!("{} must be a positive number", key));
    }
    Ok(parsed)
}

fn parse_bool(key: &str, value: &str) -> anyhow::Result<bool> {
    value
        .parse()
        .with_context(|| format!("Invalid {} value: {} (expected true or false)", key, value))
}

fn unset(value: &str) -> bool {
    let value = value.trim();
    value.is_empty() || value.eq_ignore_ascii_case("none")
}

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var(CONFIG_DIR_ENV) {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("switchboard")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from the default location
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from a file, or defaults if it does not exist
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default location
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path()?)
    }

    /// Save configuration to a file, creating parent directories
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        self.validate()?;

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let routing = &self.routing;
        if !routing.reward_ceiling.is_finite() || routing.reward_ceiling <= 0.0 {
            return Err(anyhow!("routing.reward_ceiling must be a positive number"));
        }
        if routing.max_attempts == Some(0) {
            return Err(anyhow!("routing.max_attempts must be at least 1"));
        }
        if routing.default_context.is_empty() || routing.default_context.contains(':') {
            return Err(anyhow!(
                "routing.default_context must be non-empty and must not contain ':'"
            ));
        }
        if !routing.cost_reference.is_finite() || routing.cost_reference <= 0.0 {
            return Err(anyhow!("routing.cost_reference must be a positive number"));
        }
        if !routing.latency_reference_ms.is_finite() || routing.latency_reference_ms <= 0.0 {
            return Err(anyhow!("routing.latency_reference_ms must be a positive number"));
        }
        if self.sticky.ttl_secs == 0 || self.sticky.ttl_secs > MAX_DURATION_SECS {
            return Err(anyhow!(
                "sticky.ttl_secs must be between 1 and {}",
                MAX_DURATION_SECS
            ));
        }
        if self.health.cooldown_secs > MAX_DURATION_SECS {
            return Err(anyhow!(
                "health.cooldown_secs must be at most {}",
                MAX_DURATION_SECS
            ));
        }
        Ok(())
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> anyhow::Result<String> {
        let value = match key {
            "routing.preference" => self.routing.preference.to_string(),
            "routing.reward_ceiling" => self.routing.reward_ceiling.to_string(),
            "routing.max_attempts" => self
                .routing
                .max_attempts
                .map_or_else(|| "(all)".to_string(), |n| n.to_string()),
            "routing.default_context" => self.routing.default_context.clone(),
            "routing.cost_reference" => self.routing.cost_reference.to_string(),
            "routing.latency_reference_ms" => self.routing.latency_reference_ms.to_string(),
            "routing.record_failures" => self.routing.record_failures.to_string(),

            "sticky.ttl_secs" => self.sticky.ttl_secs.to_string(),

            "health.cooldown_secs" => self.health.cooldown_secs.to_string(),
            "health.auto_disable" => self.health.auto_disable.to_string(),
            "health.auto_disable_codes" => self
                .health
                .auto_disable_codes
                .iter()
                .map(ErrorCode::as_str)
                .collect::<Vec<_>>()
                .join(", "),

            "store.backend" => self.store.backend.to_string(),
            "store.sqlite_path" => self
                .store
                .sqlite_path
                .as_ref()
                .map_or_else(|| "(not set)".to_string(), |p| p.display().to_string()),
            "store.redis_url" => self
                .store
                .redis_url
                .clone()
                .unwrap_or_else(|| "(not set)".to_string()),
            "store.key_prefix" => self.store.key_prefix.clone(),

            _ => return Err(unknown_key(key)),
        };
        Ok(value)
    }

    /// Set a configuration value by key
    ///
    /// Optional values are cleared with an empty string or `none`.
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        match key {
            "routing.preference" => {
                self.routing.preference = value.parse().map_err(|e: String| {
                    anyhow!("{}. Valid options: balanced, fast, quality, cost", e)
                })?;
            }
            "routing.reward_ceiling" => {
                self.routing.reward_ceiling = parse_positive(key, value)?;
            }
            "routing.max_attempts" => {
                self.routing.max_attempts = if unset(value) {
                    None
                } else {
                    let n: usize = value
                        .parse()
                        .with_context(|| format!("Invalid max_attempts value: {}", value))?;
                    if n == 0 {
                        return Err(anyhow!("routing.max_attempts must be at least 1"));
                    }
                    Some(n)
                };
            }
            "routing.default_context" => {
                if value.is_empty() || value.contains(':') {
                    return Err(anyhow!(
                        "routing.default_context must be non-empty and must not contain ':'"
                    ));
                }
                self.routing.default_context = value.to_string();
            }
            "routing.cost_reference" => {
                self.routing.cost_reference = parse_positive(key, value)?;
            }
            "routing.latency_reference_ms" => {
                self.routing.latency_reference_ms = parse_positive(key, value)?;
            }
            "routing.record_failures" => {
                self.routing.record_failures = parse_bool(key, value)?;
            }

            "sticky.ttl_secs" => {
                let ttl: u64 = value
                    .parse()
                    .with_context(|| format!("Invalid ttl_secs value: {}", value))?;
                if ttl == 0 || ttl > MAX_DURATION_SECS {
                    return Err(anyhow!(
                        "sticky.ttl_secs must be between 1 and {}",
                        MAX_DURATION_SECS
                    ));
                }
                self.sticky.ttl_secs = ttl;
            }

            "health.cooldown_secs" => {
                let cooldown: u64 = value
                    .parse()
                    .with_context(|| format!("Invalid cooldown_secs value: {}", value))?;
                if cooldown > MAX_DURATION_SECS {
                    return Err(anyhow!(
                        "health.cooldown_secs must be at most {}",
                        MAX_DURATION_SECS
                    ));
                }
                self.health.cooldown_secs = cooldown;
            }
            "health.auto_disable" => {
                self.health.auto_disable = parse_bool(key, value)?;
            }
            "health.auto_disable_codes" => {
                self.health.auto_disable_codes = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(|s| s.parse::<ErrorCode>().map_err(|e| anyhow!(e)))
                    .collect::<anyhow::Result<_>>()?;
            }

            "store.backend" => {
                self.store.backend = value.parse().map_err(|e: String| {
                    anyhow!("{}. Valid options: memory, sqlite, redis", e)
                })?;
            }
            "store.sqlite_path" => {
                self.store.sqlite_path = (!unset(value)).then(|| PathBuf::from(value));
            }
            "store.redis_url" => {
                self.store.redis_url = (!unset(value)).then(|| value.to_string());
            }
            "store.key_prefix" => {
                self.store.key_prefix = value.to_string();
            }

            _ => return Err(unknown_key(key)),
        }
        Ok(())
    }

    /// List all configuration keys and their values
    pub fn list(&self) -> anyhow::Result<Vec<(String, String)>> {
        KEYS.iter()
            .map(|key| Ok((key.to_string(), self.get(key)?)))
            .collect()
    }

    /// Reset configuration to defaults by removing the file
    pub fn reset() -> anyhow::Result<()> {
        let path = Self::config_path()?;
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove config file: {}", path.display()))?;
        }
        Ok(())
    }
}
