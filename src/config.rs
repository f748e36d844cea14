use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

fn default_python_exe() -> String {
    "python3".to_string()
}

fn default_api_host() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    17990
}

fn default_cache_ttl_secs() -> u64 {
    3600
}

/// Daemon settings, loaded from `batchline.toml`. Script paths point at the
/// external Python batch programs; the daemon treats them as black boxes.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_python_exe")]
    pub python_exe: String,
    pub update_script: PathBuf,
    pub analysis_script: PathBuf,
    pub working_dir: PathBuf,
    #[serde(default = "default_api_host")]
    pub api_host: String,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

impl Settings {
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("batchline")
            .join("batchline.toml")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {:?}", path))?;
        let settings: Settings =
            toml::from_str(&raw).with_context(|| format!("parsing config file {:?}", path))?;
        Ok(settings)
    }
}
