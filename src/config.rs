use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::traits::ConnectorRegistry;

/// Config file read when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "./config/harvest.toml";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub output: OutputConfig,
    /// `[connectors.<type>.<instance>]` tables, handed untouched to the
    /// registered constructor of `<type>`.
    #[serde(default)]
    pub connectors: BTreeMap<String, BTreeMap<String, Value>>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ArchiveConfig {
    #[serde(default = "default_archive_path")]
    pub path: PathBuf,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            path: default_archive_path(),
            enabled: true,
        }
    }
}

fn default_archive_path() -> PathBuf {
    PathBuf::from("~/.harvest/archives")
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CacheConfig {
    /// Cache directory; caching is disabled when absent.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct OutputConfig {
    #[serde(default)]
    pub json_line: bool,
}

impl Config {
    /// Archive directory with `~` expanded.
    pub fn archive_dir(&self) -> PathBuf {
        expand_home(&self.archive.path)
    }

    /// Cache directory of one connector instance, if caching is configured.
    pub fn cache_dir(&self, connector_type: &str, name: &str) -> Option<PathBuf> {
        self.cache
            .path
            .as_ref()
            .map(|p| expand_home(p).join(connector_type).join(name))
    }

    /// Settings table of `<type>:<name>`.
    pub fn connector_settings(&self, connector_type: &str, name: &str) -> Result<&Value> {
        self.connectors
            .get(connector_type)
            .and_then(|instances| instances.get(name))
            .with_context(|| {
                format!(
                    "No connector configured as [connectors.{}.{}]",
                    connector_type, name
                )
            })
    }

    /// Every configured instance as `(type, name)`, sorted.
    pub fn instances(&self) -> Vec<(&str, &str)> {
        self.connectors
            .iter()
            .flat_map(|(t, instances)| instances.keys().map(move |n| (t.as_str(), n.as_str())))
            .collect()
    }
}

/// Replace a leading `~` with `$HOME`.
pub fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), std::env::var_os("HOME")) {
        (Ok(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => path.to_path_buf(),
    }
}

/// Split a `<type>:<name>` connector label.
pub fn parse_label(label: &str) -> Result<(&str, &str)> {
    match label.split_once(':') {
        Some((t, n)) if !t.is_empty() && !n.is_empty() => Ok((t, n)),
        _ => anyhow::bail!(
            "Invalid connector '{}'. Expected <type>:<name>, e.g. filesystem:docs",
            label
        ),
    }
}

pub fn load_config(path: &Path, registry: &ConnectorRegistry) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config, registry)?;
    Ok(config)
}

pub fn validate(config: &Config, registry: &ConnectorRegistry) -> Result<()> {
    if config.archive.enabled && config.archive.path.as_os_str().is_empty() {
        anyhow::bail!("archive.path must not be empty when archiving is enabled");
    }

    if let Some(path) = &config.cache.path {
        if path.as_os_str().is_empty() {
            anyhow::bail!("cache.path must not be empty");
        }
    }

    for (connector_type, instances) in &config.connectors {
        if !registry.contains(connector_type) {
            anyhow::bail!(
                "Unknown connector type: '{}'. Available: {}",
                connector_type,
                registry.names().join(", ")
            );
        }
        for (name, settings) in instances {
            if name.is_empty() {
                anyhow::bail!("connectors.{} has an instance with an empty name", connector_type);
            }
            if !settings.is_object() {
                anyhow::bail!("connectors.{}.{} must be a table", connector_type, name);
            }
        }
    }

    Ok(())
}
