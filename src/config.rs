use log::info;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::disk::types::MAX_PARTITIONS;
use crate::utils::MIB;

pub const CONFIG_FILE: &str = ".vmtool.toml";

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_REGISTRY: &str = ".vmtool-registry.toml";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk: Option<DiskConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relocate: Option<RelocateConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DiskConfig {
    /// Tables with more entries than this are rejected (capped at 100)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_partitions: Option<usize>,
}

impl DiskConfig {
    pub fn max_partitions(&self) -> usize {
        self.max_partitions
            .unwrap_or(MAX_PARTITIONS)
            .min(MAX_PARTITIONS)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RelocateConfig {
    /// How often a running disk move is polled, e.g. "100ms"
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "humantime_serde"
    )]
    pub poll_interval: Option<Duration>,

    /// Free space that must remain at the destination after the move, bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub space_margin: Option<u64>,

    /// Buffer size for file copies, bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copy_chunk_size: Option<usize>,

    /// Global machine registry file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<PathBuf>,
}

impl RelocateConfig {
    pub fn with_defaults() -> Self {
        Self {
            poll_interval: Some(DEFAULT_POLL_INTERVAL),
            space_margin: Some(MIB),
            copy_chunk_size: Some(MIB as usize),
            registry: Some(PathBuf::from(DEFAULT_REGISTRY)),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval.unwrap_or(DEFAULT_POLL_INTERVAL)
    }

    /// Never below 1 MiB.
    pub fn space_margin(&self) -> u64 {
        self.space_margin.unwrap_or(MIB).max(MIB)
    }

    pub fn copy_chunk_size(&self) -> usize {
        self.copy_chunk_size.unwrap_or(MIB as usize).max(4096)
    }

    pub fn registry(&self) -> PathBuf {
        self.registry
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_REGISTRY))
    }
}

impl AppConfig {
    pub fn load_from_file(path: &str) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn generate_config_file(force: bool) -> anyhow::Result<()> {
        if std::path::Path::new(CONFIG_FILE).exists() && !force {
            anyhow::bail!(
                "Configuration file {} already exists. Use --force to overwrite.",
                CONFIG_FILE
            );
        }

        fs::write(CONFIG_FILE, Self::generate_full_config()?)?;

        info!("Configuration file generated: {}", CONFIG_FILE);
        info!("Please edit this file to customize configuration");
        Ok(())
    }

    pub fn generate_full_config() -> anyhow::Result<String> {
        let config = AppConfig {
            disk: Some(DiskConfig {
                max_partitions: Some(MAX_PARTITIONS),
            }),
            relocate: Some(RelocateConfig::with_defaults()),
        };
        let toml_content = toml::to_string_pretty(&config)?;
        Ok(format!(
            "# vmtool configuration file\n# All fields are optional, command line arguments override config file values\n\n{}",
            toml_content
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_config_round_trips() {
        let text = AppConfig::generate_full_config().expect("generate");
        let parsed: AppConfig = toml::from_str(&text).expect("parse");
        let relocate = parsed.relocate.expect("relocate section");
        assert_eq!(relocate.poll_interval(), Duration::from_millis(100));
        assert_eq!(relocate.space_margin(), MIB);
        assert_eq!(parsed.disk.expect("disk section").max_partitions(), 100);
    }

    #[test]
    fn limits_are_clamped() {
        let parsed: AppConfig = toml::from_str(
            "[disk]\nmax_partitions = 500\n\n[relocate]\nspace_margin = 10\npoll_interval = \"2s\"\n",
        )
        .expect("parse");
        assert_eq!(parsed.disk.expect("disk").max_partitions(), MAX_PARTITIONS);
        let relocate = parsed.relocate.expect("relocate");
        assert_eq!(relocate.space_margin(), MIB);
        assert_eq!(relocate.poll_interval(), Duration::from_secs(2));
    }
}
