//! Tool configuration.
//!
//! Runner tables and health checks are data. They ship with built-in
//! defaults and can be replaced section by section from a JSON file.
use crate::health::{HealthCheck, HealthConfig};
use crate::runner::{HostedTier, RunnerTable};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_SCHEMA_VERSION: u32 = 1;

/// Environment variable naming a config file.
pub const CONFIG_ENV: &str = "AMI_CI_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub schema_version: u32,
    pub runners: RunnerTable,
    pub health: HealthConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            schema_version: CONFIG_SCHEMA_VERSION,
            runners: RunnerTable::default(),
            health: HealthConfig::default(),
        }
    }
}

/// `<config dir>/ami-ci/config.json`, when the platform has a config dir.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("ami-ci").join("config.json"))
}

/// Resolve and load the effective config.
///
/// Precedence: explicit path, then `AMI_CI_CONFIG`, then the default path if
/// it exists, then built-in defaults. Explicitly named files must exist.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let named = explicit
        .map(Path::to_path_buf)
        .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));
    if let Some(path) = named {
        return load_config_file(&path);
    }
    match default_config_path().filter(|path| path.is_file()) {
        Some(path) => load_config_file(&path),
        None => {
            tracing::debug!("no config file found; using built-in defaults");
            Ok(Config::default())
        }
    }
}

pub fn load_config_file(path: &Path) -> Result<Config> {
    let bytes = fs::read(path).with_context(|| format!("read config {}", path.display()))?;
    let config: Config = serde_json::from_slice(&bytes)
        .with_context(|| format!("parse config JSON {}", path.display()))?;
    validate_config(&config).with_context(|| format!("validate config {}", path.display()))?;
    tracing::debug!(path = %path.display(), "loaded config");
    Ok(config)
}

/// Render the config as pretty JSON, suitable as an editable stub.
pub fn render_config(config: &Config) -> Result<String> {
    serde_json::to_string_pretty(config).context("serialize config")
}

pub fn validate_config(config: &Config) -> Result<()> {
    if config.schema_version != CONFIG_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported config schema_version {}",
            config.schema_version
        ));
    }
    validate_runners(&config.runners)?;
    validate_health(&config.health)?;
    Ok(())
}

fn validate_runners(table: &RunnerTable) -> Result<()> {
    if table.virtualization_feature.trim().is_empty() || table.large_feature.trim().is_empty() {
        return Err(anyhow!("runners feature tags must be non-empty"));
    }
    if table.darwin_group.trim().is_empty() {
        return Err(anyhow!("runners.darwin_group must be non-empty"));
    }
    validate_tier(&table.large, "runners.large")?;
    validate_tier(&table.standard, "runners.standard")?;
    for (system, pool) in &table.virtualization_pools {
        if pool.group.trim().is_empty() || pool.labels.is_empty() {
            return Err(anyhow!(
                "runners.virtualization_pools.{system} needs a group and at least one label"
            ));
        }
    }
    Ok(())
}

fn validate_tier(tier: &HostedTier, label: &str) -> Result<()> {
    if tier.label.trim().is_empty() {
        return Err(anyhow!("{label}.label must be non-empty"));
    }
    Ok(())
}

fn validate_health(health: &HealthConfig) -> Result<()> {
    if health.attempts == 0 {
        return Err(anyhow!("health.attempts must be at least 1"));
    }
    if health.marker.is_some() && health.marker_attempts == 0 {
        return Err(anyhow!("health.marker_attempts must be at least 1"));
    }
    for check in &health.checks {
        if check.service().trim().is_empty() {
            return Err(anyhow!("health checks need a service name"));
        }
        if let HealthCheck::Command { command, .. } = check {
            let argv = shell_words::split(command)
                .with_context(|| format!("parse health command: {command}"))?;
            if argv.is_empty() {
                return Err(anyhow!("health command for {} is empty", check.service()));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
