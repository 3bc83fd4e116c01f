//! Hub configuration file (`hub.toml`).
//!
//! # Configuration File Location
//!
//! [`HubConfig::load`] searches, in order:
//! 1. `EDGEQUAKE_HUB_CONFIG` environment variable
//! 2. `./hub.toml` (current working directory)
//! 3. `~/.edgequake/hub.toml` (user config)
//! 4. Built-in defaults
//!
//! # Example Configuration
//!
//! ```toml
//! [orchestrator]
//! strategy = "round_robin"
//! max_fallback_attempts = 2
//! call_timeout_ms = 20000
//!
//! [cache]
//! max_size = 5000
//! ttl_ms = 600000
//! sweep_interval_ms = 60000
//!
//! [cache_key]
//! prefix = "chat"
//! include_backend = true
//!
//! [circuit_breaker]
//! failure_threshold = 3
//! reset_timeout_ms = 15000
//!
//! [health]
//! interval_ms = 10000
//! degraded_latency_ms = 2000
//! auto_disable = true
//! ```
//!
//! Every section and key is optional. Durations are integer milliseconds;
//! `call_timeout_ms = 0` disables the per-call deadline.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::cache::CacheConfig;
use crate::cache_key::CacheKeyConfig;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::{HubError, Result};
use crate::health::HealthConfig;
use crate::orchestrator::OrchestratorConfig;
use crate::selection::SelectionStrategy;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "EDGEQUAKE_HUB_CONFIG";

/// Root of `hub.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub orchestrator: OrchestratorSection,
    pub cache: CacheSection,
    pub cache_key: CacheKeyConfig,
    pub circuit_breaker: CircuitBreakerSection,
    pub health: HealthSection,
}

/// `[orchestrator]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    pub strategy: SelectionStrategy,
    pub enable_fallback: bool,
    pub max_fallback_attempts: u32,
    pub call_timeout_ms: u64,
    pub health_checks: bool,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        let defaults = OrchestratorConfig::default();
        Self {
            strategy: defaults.strategy,
            enable_fallback: defaults.enable_fallback,
            max_fallback_attempts: defaults.max_fallback_attempts,
            call_timeout_ms: defaults.call_timeout.map_or(0, as_millis),
            health_checks: defaults.health_checks,
        }
    }
}

/// `[cache]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub enabled: bool,
    pub max_size: usize,
    pub ttl_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sweep_interval_ms: Option<u64>,
}

impl Default for CacheSection {
    fn default() -> Self {
        let defaults = CacheConfig::default();
        Self {
            enabled: defaults.enabled,
            max_size: defaults.max_size,
            ttl_ms: as_millis(defaults.default_ttl),
            sweep_interval_ms: defaults.sweep_interval.map(as_millis),
        }
    }
}

/// `[circuit_breaker]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSection {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub reset_timeout_ms: u64,
    pub failure_window_ms: u64,
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerSection {
    fn default() -> Self {
        let defaults = CircuitBreakerConfig::default();
        Self {
            failure_threshold: defaults.failure_threshold,
            success_threshold: defaults.success_threshold,
            reset_timeout_ms: as_millis(defaults.reset_timeout),
            failure_window_ms: as_millis(defaults.failure_window),
            half_open_max_calls: defaults.half_open_max_calls,
        }
    }
}

/// `[health]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSection {
    pub interval_ms: u64,
    pub probe_timeout_ms: u64,
    pub failure_threshold: u32,
    pub recovery_threshold: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded_latency_ms: Option<u64>,
    pub auto_disable: bool,
}

impl Default for HealthSection {
    fn default() -> Self {
        let defaults = HealthConfig::default();
        Self {
            interval_ms: as_millis(defaults.interval),
            probe_timeout_ms: as_millis(defaults.probe_timeout),
            failure_threshold: defaults.failure_threshold,
            recovery_threshold: defaults.recovery_threshold,
            degraded_latency_ms: defaults.degraded_latency.map(as_millis),
            auto_disable: defaults.auto_disable,
        }
    }
}

fn as_millis(d: Duration) -> u64 {
    d.as_millis() as u64
}

impl HubConfig {
    /// Load configuration from the default location.
    ///
    /// An explicit `EDGEQUAKE_HUB_CONFIG` path that does not exist is an
    /// error rather than a silent fallback.
    pub fn load() -> Result<Self> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            if !Path::new(&path).exists() {
                return Err(HubError::Config(format!(
                    "{} points to missing file '{}'",
                    CONFIG_ENV, path
                )));
            }
            return Self::from_file(&path);
        }

        let local_path = Path::new("hub.toml");
        if local_path.exists() {
            return Self::from_file(local_path);
        }

        if let Some(home) = dirs::home_dir() {
            let user_path = home.join(".edgequake").join("hub.toml");
            if user_path.exists() {
                return Self::from_file(&user_path);
            }
        }

        Ok(Self::default())
    }

    /// Load and validate a specific file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            HubError::Config(format!("failed to read '{}': {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: Self = toml::from_str(toml_str)
            .map_err(|e| HubError::Config(format!("failed to parse TOML config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| HubError::Config(e.to_string()))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        std::fs::write(path, self.to_toml()?).map_err(|e| {
            HubError::Config(format!("failed to write '{}': {}", path.display(), e))
        })
    }

    /// Check every section through its runtime config.
    pub fn validate(&self) -> Result<()> {
        self.orchestrator_config().validate()?;
        self.cache_config().validate()?;
        self.circuit_breaker_config().validate()?;
        self.health_config().validate()?;
        if self.cache_key.prefix.is_empty() {
            return Err(HubError::Config("cache_key.prefix must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        let s = &self.orchestrator;
        OrchestratorConfig {
            strategy: s.strategy,
            enable_fallback: s.enable_fallback,
            max_fallback_attempts: s.max_fallback_attempts,
            call_timeout: (s.call_timeout_ms > 0).then(|| Duration::from_millis(s.call_timeout_ms)),
            health_checks: s.health_checks,
        }
    }

    pub fn cache_config(&self) -> CacheConfig {
        let s = &self.cache;
        CacheConfig {
            enabled: s.enabled,
            max_size: s.max_size,
            default_ttl: Duration::from_millis(s.ttl_ms),
            sweep_interval: s
                .sweep_interval_ms
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis),
        }
    }

    pub fn circuit_breaker_config(&self) -> CircuitBreakerConfig {
        let s = &self.circuit_breaker;
        CircuitBreakerConfig {
            failure_threshold: s.failure_threshold,
            success_threshold: s.success_threshold,
            reset_timeout: Duration::from_millis(s.reset_timeout_ms),
            failure_window: Duration::from_millis(s.failure_window_ms),
            half_open_max_calls: s.half_open_max_calls,
        }
    }

    pub fn health_config(&self) -> HealthConfig {
        let s = &self.health;
        HealthConfig {
            interval: Duration::from_millis(s.interval_ms),
            probe_timeout: Duration::from_millis(s.probe_timeout_ms),
            failure_threshold: s.failure_threshold,
            recovery_threshold: s.recovery_threshold,
            degraded_latency: s.degraded_latency_ms.map(Duration::from_millis),
            auto_disable: s.auto_disable,
        }
    }
}
