//! Configuration management for Turnstile.

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{PolicyRule, PolicySet};

/// Prefix for environment variable overrides, e.g. `TURNSTILE__LOG__LEVEL`.
const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,

    /// Named rate limit policies
    #[serde(default)]
    pub policies: HashMap<String, PolicyRule>,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Deadline for a single store operation in milliseconds
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_ms: u64,

    /// How often expired counters are purged, in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            operation_timeout_ms: default_operation_timeout(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl StoreConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn default_operation_timeout() -> u64 {
    250
}

fn default_sweep_interval() -> u64 {
    30
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TurnstileConfig {
    /// Load configuration from a YAML file, layered with environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(TurnstileError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("config file not found: {}", path.display()),
            )));
        }

        Self::build(
            Config::builder().add_source(File::from(path).format(FileFormat::Yaml)),
            env_source(),
        )
    }

    /// Load configuration from a YAML string, layered with environment overrides.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Self::from_yaml_with_env(yaml, env_source())
    }

    fn from_yaml_with_env(yaml: &str, env: Environment) -> Result<Self> {
        Self::build(
            Config::builder().add_source(File::from_str(yaml, FileFormat::Yaml)),
            env,
        )
    }

    /// Load configuration from defaults and environment overrides only.
    pub fn from_env() -> Result<Self> {
        Self::build(Config::builder(), env_source())
    }

    fn build(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
        env: Environment,
    ) -> Result<Self> {
        let config: TurnstileConfig = builder
            .add_source(env)
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| TurnstileError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Check values that serde cannot.
    pub fn validate(&self) -> Result<()> {
        if self.store.operation_timeout_ms == 0 {
            return Err(TurnstileError::Config(
                "store.operation_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.store.sweep_interval_secs == 0 {
            return Err(TurnstileError::Config(
                "store.sweep_interval_secs must be greater than zero".to_string(),
            ));
        }
        self.policy_set().map(|_| ())
    }

    /// Build the validated policy set.
    pub fn policy_set(&self) -> Result<PolicySet> {
        PolicySet::from_rules(&self.policies)
    }
}

/// Environment overrides, e.g. `TURNSTILE__STORE__OPERATION_TIMEOUT_MS=100`.
fn env_source() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .try_parsing(true)
}
