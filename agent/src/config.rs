//! Agent configuration file.
//!
//! We use `serde` to parse these options from the TOML config file,
//! and to write the default configuration to the TOML config file.

use std::path::{Path, PathBuf};

use anyhow::Context;
use apmon::{ConfigSource, MonitorSettings};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    /// Where to find the destinations: a configuration file, URLs, or `host[:port] [password]` entries.
    pub sources: Vec<String>,

    /// Cluster of the system monitoring datagrams.
    pub sys_cluster: Option<String>,
    /// Node of the system monitoring datagrams.
    pub sys_node: Option<String>,

    #[serde(default)]
    pub settings: MonitorSettings,

    /// Processes to monitor.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub jobs: Vec<JobConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobConfig {
    pub pid: u32,
    pub workdir: Option<PathBuf>,
    pub cluster: Option<String>,
    pub node: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            sources: vec![String::from("127.0.0.1:8884")],
            sys_cluster: None,
            sys_node: None,
            settings: MonitorSettings {
                sys_monitoring: true,
                general_info: true,
                job_monitoring: true,
                ..Default::default()
            },
            jobs: Vec::new(),
        }
    }
}

impl AgentConfig {
    /// Turns the `sources` into a [`ConfigSource`].
    ///
    /// A single entry that is an existing file is a reloadable configuration file,
    /// anything else is a list of URLs and destinations.
    pub fn source(&self) -> anyhow::Result<ConfigSource> {
        match self.sources.as_slice() {
            [] => Err(anyhow::anyhow!("no source of destinations in the config")),
            [single] if Path::new(single).is_file() => Ok(ConfigSource::File(PathBuf::from(single))),
            entries => Ok(ConfigSource::List(entries.to_vec())),
        }
    }

    pub fn to_toml(&self) -> anyhow::Result<String> {
        toml::to_string_pretty(self).context("could not serialize the config")
    }
}

/// Loads the config file.
///
/// If the file does not exist and `write_default` is true, the default config is written to `path` and returned.
pub fn load(path: &Path, write_default: bool) -> anyhow::Result<AgentConfig> {
    match std::fs::read_to_string(path) {
        Ok(content) => toml::from_str(&content).with_context(|| format!("invalid config file {path:?}")),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && write_default => {
            let config = AgentConfig::default();
            std::fs::write(path, config.to_toml()?)
                .with_context(|| format!("could not write the default config to {path:?}"))?;
            log::info!("Default configuration file written to: {}", path.display());
            Ok(config)
        }
        Err(e) => Err(e).with_context(|| format!("could not read config file {path:?}")),
    }
}
