use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;

const APP_DIR: &str = "devshell";

fn home_dir() -> Result<PathBuf> {
    directories::BaseDirs::new()
        .context("Failed to get home directory")
        .map(|dirs| dirs.home_dir().to_path_buf())
}

fn xdg_base(variable: &str, fallback: &str) -> Result<PathBuf> {
    match env::var(variable) {
        Ok(value) if !value.trim().is_empty() => Ok(PathBuf::from(value)),
        _ => Ok(home_dir()?.join(fallback)),
    }
}

/// Get the XDG config directory for devshell
///
/// Returns `$XDG_CONFIG_HOME/devshell` or `~/.config/devshell` if not set
pub fn config_dir() -> Result<PathBuf> {
    Ok(xdg_base("XDG_CONFIG_HOME", ".config")?.join(APP_DIR))
}

/// Get the XDG cache directory for devshell
///
/// Returns `$XDG_CACHE_HOME/devshell` or `~/.cache/devshell` if not set
pub fn cache_dir() -> Result<PathBuf> {
    Ok(xdg_base("XDG_CACHE_HOME", ".cache")?.join(APP_DIR))
}
