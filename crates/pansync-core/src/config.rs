//! Configuration directory, settings file and token source

use crate::error::TransferError;
use crate::remote::{StaticToken, TokenFile, TokenProvider};
use pansync_types::Settings;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

pub const CONFIG_DIR_ENV: &str = "PANSYNC_CONFIG_DIR";
pub const ACCESS_TOKEN_ENV: &str = "PANSYNC_ACCESS_TOKEN";

/// Files kept in the configuration directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigPaths {
    root: PathBuf,
}

impl ConfigPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `explicit`, else `$PANSYNC_CONFIG_DIR`, else the platform config dir
    pub fn resolve(explicit: Option<PathBuf>) -> Result<Self, TransferError> {
        Self::resolve_with(explicit, std::env::var_os(CONFIG_DIR_ENV).map(PathBuf::from))
    }

    fn resolve_with(explicit: Option<PathBuf>, from_env: Option<PathBuf>) -> Result<Self, TransferError> {
        if let Some(dir) = explicit.or(from_env).filter(|d| !d.as_os_str().is_empty()) {
            return Ok(Self::new(dir));
        }
        let base = dirs::config_dir().ok_or_else(|| {
            TransferError::InvalidInput(format!(
                "no config directory for this platform; set {}",
                CONFIG_DIR_ENV
            ))
        })?;
        Ok(Self::new(base.join("pansync")))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn settings_file(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn hash_cache_file(&self) -> PathBuf {
        self.root.join("hash_cache.json")
    }

    pub fn progress_db(&self) -> PathBuf {
        self.root.join("progress.db")
    }

    pub fn token_file(&self) -> PathBuf {
        self.root.join("token.json")
    }

    pub fn ensure_root(&self) -> Result<(), TransferError> {
        std::fs::create_dir_all(&self.root)?;
        Ok(())
    }
}

/// Load `config.json`. A missing file yields the defaults.
pub fn load_settings(paths: &ConfigPaths) -> Result<Settings, TransferError> {
    let path = paths.settings_file();
    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("No settings at {}, using defaults", path.display());
            return Ok(Settings::default());
        }
        Err(e) => return Err(e.into()),
    };
    serde_json::from_str(&content).map_err(|e| {
        TransferError::Serialization(format!("{}: {}", path.display(), e))
    })
}

pub fn save_settings(paths: &ConfigPaths, settings: &Settings) -> Result<(), TransferError> {
    paths.ensure_root()?;
    let path = paths.settings_file();
    std::fs::write(&path, serde_json::to_string_pretty(settings)?)?;
    info!("Saved settings to {}", path.display());
    Ok(())
}

/// `$PANSYNC_ACCESS_TOKEN` if set, else `token.json` in the config dir
pub fn token_provider(paths: &ConfigPaths) -> Arc<dyn TokenProvider> {
    token_provider_with(std::env::var(ACCESS_TOKEN_ENV).ok(), paths)
}

fn token_provider_with(from_env: Option<String>, paths: &ConfigPaths) -> Arc<dyn TokenProvider> {
    match from_env.filter(|t| !t.trim().is_empty()) {
        Some(token) => {
            debug!("Using access token from {}", ACCESS_TOKEN_ENV);
            Arc::new(StaticToken::new(token.trim()))
        }
        None => Arc::new(TokenFile::new(paths.token_file())),
    }
}
