//! Configuration management for registry-ops
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Hard ceiling for any caller-supplied gas limit override
pub const GAS_LIMIT_CEILING: u64 = 10_000_000;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub network: NetworkConfig,
    pub registry: RegistryConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    pub name: String,
    pub chain_id: u64,
    pub rpc_url: String,
    /// Name of the environment variable holding the signer's private key
    #[serde(default = "default_private_key_env")]
    pub private_key_env: String,
    /// Blocks to wait for before a receipt counts as a confirmation
    #[serde(default = "default_confirmations")]
    pub confirmations: usize,
    /// Receipt polling interval
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How long a sent transaction is watched before its watcher gives up.
    /// Never shorter than the lifecycle timeout.
    #[serde(default = "default_watch_timeout_secs")]
    pub watch_timeout_secs: u64,
}

impl NetworkConfig {
    pub fn watch_timeout(&self) -> Duration {
        Duration::from_secs(self.watch_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    pub domain_registry: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub timeout_secs: u64,
    pub tick_ms: u64,
    pub gas_limit_ceiling: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            tick_ms: 1000,
            gas_limit_ceiling: GAS_LIMIT_CEILING,
        }
    }
}

impl LifecycleConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub json: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsConfig {
    /// When set, metrics are written here in Prometheus text format after each run
    pub textfile_path: Option<PathBuf>,
}

fn default_private_key_env() -> String {
    "PRIVATE_KEY".to_string()
}

fn default_confirmations() -> usize {
    1
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_watch_timeout_secs() -> u64 {
    600
}

impl Settings {
    /// Load settings from the configured file
    pub fn load() -> Result<Self> {
        let config_path = env::var("REGISTRY_OPS_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from an explicit path
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::parse(&config_str)
    }

    fn parse(config_str: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.network.rpc_url.is_empty() {
            anyhow::bail!("Network {} has no RPC URL configured", self.network.name);
        }
        if self.registry.domain_registry.is_empty() {
            anyhow::bail!(
                "Network {} has no domain registry address configured",
                self.network.name
            );
        }
        if self.lifecycle.timeout_secs == 0 {
            anyhow::bail!("lifecycle.timeout_secs must be greater than zero");
        }
        if self.lifecycle.tick_ms == 0 {
            anyhow::bail!("lifecycle.tick_ms must be greater than zero");
        }
        if self.lifecycle.gas_limit_ceiling > GAS_LIMIT_CEILING {
            anyhow::bail!(
                "lifecycle.gas_limit_ceiling may not be raised above {}",
                GAS_LIMIT_CEILING
            );
        }
        if self.network.watch_timeout_secs < self.lifecycle.timeout_secs {
            anyhow::bail!(
                "network.watch_timeout_secs ({}) is shorter than lifecycle.timeout_secs ({})",
                self.network.watch_timeout_secs,
                self.lifecycle.timeout_secs
            );
        }
        if self.network.confirmations == 0 {
            tracing::warn!("network.confirmations is 0; treating receipts as final on inclusion");
        }

        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("static regex");

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
