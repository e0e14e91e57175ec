use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use vnet_core::{NetworkId, NodeConfig};

const CONFIG_FILE_NAME: &str = "vnet-node.toml";

fn default_status_interval() -> Duration {
    Duration::from_secs(30)
}

/// Daemon configuration file.
///
/// ```toml
/// networks = ["8056c2e21c000001"]
/// echo_port = 7
///
/// [node]
/// storage_path = "/var/lib/vnet"
/// udp_port = 9993
/// roots = ["203.0.113.10:9993"]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Networks joined at startup.
    #[serde(default)]
    pub networks: Vec<NetworkId>,

    /// Run a stream echo service on this virtual port once a network is
    /// ready.
    #[serde(default)]
    pub echo_port: Option<u16>,

    /// How often to log a status line.
    #[serde(with = "humantime_serde", default = "default_status_interval")]
    pub status_interval: Duration,

    #[serde(default = "default_node")]
    pub node: NodeConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            networks: Vec::new(),
            echo_port: None,
            status_interval: default_status_interval(),
            node: default_node(),
        }
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("io", "Donovoi", "vnet")
}

fn default_node() -> NodeConfig {
    match project_dirs() {
        Some(proj) => NodeConfig::new(proj.data_dir().join("node")),
        None => NodeConfig::default(),
    }
}

pub fn default_config_path() -> Result<PathBuf> {
    let proj = project_dirs().context("could not determine platform config directory")?;
    Ok(proj.config_dir().join(CONFIG_FILE_NAME))
}

pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;
    }
    Ok(())
}

pub fn load(path: &Path) -> Result<DaemonConfig> {
    if !path.exists() {
        return Ok(DaemonConfig::default());
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config: {}", path.display()))?;
    let cfg: DaemonConfig = toml::from_str(&raw)
        .with_context(|| format!("failed to parse TOML: {}", path.display()))?;
    cfg.node
        .validate()
        .with_context(|| format!("invalid node settings in {}", path.display()))?;
    Ok(cfg)
}

pub fn save(path: &Path, cfg: &DaemonConfig, overwrite: bool) -> Result<()> {
    if path.exists() && !overwrite {
        anyhow::bail!(
            "config already exists at {} (use --force to overwrite)",
            path.display()
        );
    }
    ensure_parent_dir(path)?;
    let raw = toml::to_string_pretty(cfg).context("failed to serialize config to TOML")?;
    fs::write(path, raw).with_context(|| format!("failed to write config: {}", path.display()))?;
    Ok(())
}
