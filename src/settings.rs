//! Persisted application settings: active model and per-model quant selections

use crate::models::QuantSelection;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Settings owned by the external store and mirrored by the orchestrator
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_model_id: Option<String>,
    #[serde(default)]
    pub model_quant_selections: HashMap<String, QuantSelection>,
}

impl AppSettings {
    /// Selection for a model, empty when the user never chose one
    pub fn selection(&self, model_id: &str) -> QuantSelection {
        self.model_quant_selections
            .get(model_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Copy with `patch` applied over these settings
    pub fn merged(&self, patch: &SettingsPatch) -> Self {
        let mut next = self.clone();
        if let Some(active) = &patch.active_model_id {
            next.active_model_id = Some(active.clone());
        }
        if let Some(selections) = &patch.model_quant_selections {
            next.model_quant_selections = selections.clone();
        }
        next
    }
}

/// Partial update; `None` fields are left untouched
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettingsPatch {
    pub active_model_id: Option<String>,
    pub model_quant_selections: Option<HashMap<String, QuantSelection>>,
}

// ============================================================================
// Trait Definitions
// ============================================================================

/// Store that owns the persisted settings
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Current settings; defaults when nothing was saved yet
    async fn get(&self) -> Result<AppSettings>;

    /// Merge `patch` into the stored settings
    async fn save(&self, patch: SettingsPatch) -> Result<()>;
}

// ============================================================================
// Production Implementation
// ============================================================================

#[derive(Debug, Default, Serialize, Deserialize)]
struct SavedSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_updated: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    active_model_id: Option<String>,
    #[serde(default)]
    model_quant_selections: HashMap<String, QuantSelection>,
}

impl SavedSettings {
    fn into_settings(self) -> AppSettings {
        AppSettings {
            active_model_id: self.active_model_id,
            model_quant_selections: self.model_quant_selections,
        }
    }
}

/// TOML file store with atomic writes
pub struct FileSettingsStore {
    path: PathBuf,
    /// Serializes read-modify-write cycles within this process
    write_lock: Mutex<()>,
}

impl FileSettingsStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<AppSettings> {
        if !fs::try_exists(&self.path).await.unwrap_or(false) {
            tracing::debug!(path = ?self.path, "No settings file found, using defaults");
            return Ok(AppSettings::default());
        }

        let content = fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read settings file: {:?}", self.path))?;

        let saved: SavedSettings = toml::from_str(&content).with_context(|| {
            format!(
                "Failed to parse settings file: {:?}. File may be corrupted. \
                Please delete or fix the file manually.",
                self.path
            )
        })?;

        Ok(saved.into_settings())
    }

    async fn write_atomic(&self, content: &str) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Cannot create settings directory: {:?}", parent))?;
        }

        // Atomic write: write to temp file, then rename
        let temp_file = self.path.with_extension("tmp");

        let mut file = fs::File::create(&temp_file)
            .await
            .context("Failed to create temp settings file")?;
        file.write_all(content.as_bytes())
            .await
            .context("Failed to write settings file")?;
        file.sync_all()
            .await
            .context("Failed to sync settings file")?;

        fs::rename(&temp_file, &self.path)
            .await
            .context("Failed to rename temp settings file")?;

        Ok(())
    }
}

#[async_trait]
impl SettingsStore for FileSettingsStore {
    async fn get(&self) -> Result<AppSettings> {
        self.load().await
    }

    async fn save(&self, patch: SettingsPatch) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let settings = self.load().await?.merged(&patch);
        let saved = SavedSettings {
            last_updated: Some(chrono::Utc::now()),
            active_model_id: settings.active_model_id,
            model_quant_selections: settings.model_quant_selections,
        };
        let content =
            toml::to_string_pretty(&saved).context("Failed to serialize settings to TOML")?;

        self.write_atomic(&content).await?;

        tracing::debug!(
            path = ?self.path,
            active_model = ?saved.active_model_id,
            selections = saved.model_quant_selections.len(),
            "Settings saved"
        );

        Ok(())
    }
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================
