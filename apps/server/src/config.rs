//! Server configuration.
//!
//! Stored as TOML at `~/.config/chunkferry/server.toml`, or wherever
//! `CHUNKFERRY_CONFIG` points. A missing file is created with defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Environment variable overriding the configuration file path.
pub const CONFIG_ENV: &str = "CHUNKFERRY_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// WebSocket listen port (0 = auto-assign).
    #[serde(default = "default_port")]
    pub port: u16,

    /// Directory holding chunk namespaces, artifacts and the filename index.
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,

    /// Prefix of the URL reported for merged files.
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,

    /// Largest chunk accepted, in bytes.
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: u64,
}

fn home() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".into()))
}

fn default_port() -> u16 {
    3000
}

fn default_storage_root() -> PathBuf {
    home().join(".local").join("share").join("chunkferry")
}

fn default_public_base_url() -> String {
    "http://localhost:3000/files".into()
}

fn default_max_chunk_size() -> u64 {
    chunkferry_store::DEFAULT_MAX_CHUNK_SIZE
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            storage_root: default_storage_root(),
            public_base_url: default_public_base_url(),
            max_chunk_size: default_max_chunk_size(),
        }
    }
}

impl Config {
    /// Loads the configuration, writing a default file if none exists.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&config_path())
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&content)?)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }
}

/// Returns the configuration file path.
fn config_path() -> PathBuf {
    match std::env::var_os(CONFIG_ENV) {
        Some(path) => PathBuf::from(path),
        None => home().join(".config").join("chunkferry").join("server.toml"),
    }
}
