use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::util::xdg;

pub const CONFIG_FILE: &str = "config.toml";

/// User configuration from `$XDG_CONFIG_HOME/devshell/config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Store location; `~` and `$VAR` are expanded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_dir: Option<String>,
    /// Shell spawned by `devshell shell` when `--shell` is not given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_shell: Option<String>,
    /// Never touch the network.
    #[serde(default)]
    pub offline: bool,
}

impl Config {
    pub fn default_path() -> Result<PathBuf> {
        Ok(xdg::config_dir()?.join(CONFIG_FILE))
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&contents).with_context(|| format!("Failed to parse config file {:?}", path))
    }

    /// Store directory with `~` and environment variables expanded.
    pub fn store_dir(&self) -> Result<Option<PathBuf>> {
        self.store_dir
            .as_deref()
            .map(|raw| {
                shellexpand::full(raw)
                    .map(|expanded| PathBuf::from(expanded.as_ref()))
                    .with_context(|| format!("Failed to expand store_dir '{raw}'"))
            })
            .transpose()
    }
}
