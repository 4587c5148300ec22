//! Configuration structures and loading logic

use crate::models::AssetCatalog;
use crate::orchestrator::OrchestratorOptions;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main manager configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Root of all model weight files
    pub models_dir: PathBuf,
    pub settings_file: PathBuf,
    /// Catalog to use instead of the built-in one (TOML or JSON)
    pub catalog_file: Option<PathBuf>,
    /// Where fetched provider outputs are written
    pub outputs_dir: PathBuf,
    /// Base URL for quants without an explicit source
    pub download_base_url: Option<String>,
    pub fetch_timeout_secs: u64,
    pub error_preview_chars: usize,
    pub max_normalize_depth: usize,
    pub cancel_timeout_secs: u64,
    pub progress_interval_ms: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            models_dir: default_data_dir().join("models"),
            settings_file: default_data_dir().join("settings.toml"),
            catalog_file: None,
            outputs_dir: default_data_dir().join("outputs"),
            download_base_url: None,
            fetch_timeout_secs: default_fetch_timeout(),
            error_preview_chars: crate::fetch::DEFAULT_ERROR_PREVIEW_CHARS,
            max_normalize_depth: crate::normalize::DEFAULT_MAX_DEPTH,
            cancel_timeout_secs: default_cancel_timeout(),
            progress_interval_ms: default_progress_interval(),
        }
    }
}

impl ManagerConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content).context("Failed to parse TOML config")?
        } else {
            Self::default()
        };

        // Environment variable overrides
        if let Ok(models_dir) = std::env::var("ASSET_MANAGER_MODELS_DIR") {
            config.models_dir = PathBuf::from(models_dir);
        }
        if let Ok(settings_file) = std::env::var("ASSET_MANAGER_SETTINGS_FILE") {
            config.settings_file = PathBuf::from(settings_file);
        }
        if let Ok(base_url) = std::env::var("ASSET_MANAGER_DOWNLOAD_BASE_URL") {
            config.download_base_url = Some(base_url).filter(|url| !url.trim().is_empty());
        }
        if let Ok(timeout) = std::env::var("ASSET_MANAGER_FETCH_TIMEOUT") {
            config.fetch_timeout_secs = timeout
                .parse()
                .context("Invalid ASSET_MANAGER_FETCH_TIMEOUT value")?;
        }

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.fetch_timeout_secs == 0 {
            anyhow::bail!("fetch_timeout_secs must be > 0");
        }
        if self.error_preview_chars == 0 {
            anyhow::bail!("error_preview_chars must be > 0");
        }
        if self.max_normalize_depth == 0 {
            anyhow::bail!("max_normalize_depth must be > 0");
        }
        if self.models_dir.as_os_str().is_empty() {
            anyhow::bail!("models_dir cannot be empty");
        }

        if let Some(url) = &self.download_base_url {
            crate::fetch::parse_remote_url(url)
                .with_context(|| format!("Invalid download_base_url: {}", url))?;
        }

        if let Some(catalog) = &self.catalog_file
            && !catalog.exists()
        {
            anyhow::bail!("Catalog file not found: {:?}", catalog);
        }

        // Ensure settings file directory exists or can be created
        if let Some(parent) = self.settings_file.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Cannot create settings directory: {:?}", parent))?;
        }

        Ok(())
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn orchestrator_options(&self) -> OrchestratorOptions {
        OrchestratorOptions {
            cancel_timeout: Duration::from_secs(self.cancel_timeout_secs),
        }
    }

    /// The configured catalog file, or the built-in catalog
    pub fn load_catalog(&self) -> Result<AssetCatalog> {
        match &self.catalog_file {
            Some(path) => AssetCatalog::from_file(path)
                .with_context(|| format!("Failed to load catalog: {:?}", path)),
            None => Ok(AssetCatalog::builtin()),
        }
    }
}

// Default functions
fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("asset-manager")
}
fn default_fetch_timeout() -> u64 {
    300
}
fn default_cancel_timeout() -> u64 {
    120
}
fn default_progress_interval() -> u64 {
    250
}
