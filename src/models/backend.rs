//! Download execution backend
//!
//! The orchestrator only talks to [`DownloadBackend`]. The production
//! implementation, [`LocalDownloadBackend`], streams weight files over HTTP
//! into a models directory and announces progress on a broadcast channel.

use super::catalog::{AssetCatalog, ComponentKind, QuantSelection, ResolvedFile, validate_relative_path};
use super::status::{DownloadProgressEvent, DownloadStatus, FileCheck, normalize_relative_path};
use crate::error::{AssetError, AssetResult};
use crate::fetch::{DEFAULT_ERROR_PREVIEW_CHARS, error_from_response, write_body};
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Capacity of the progress event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Backend that executes transfers and answers disk-presence questions.
///
/// All paths are relative to the models directory and are normalized by the
/// implementation before use.
#[async_trait]
pub trait DownloadBackend: Send + Sync {
    /// Run the transfer of one component file to completion
    async fn start_download(
        &self,
        model_id: &str,
        component: ComponentKind,
        quant_id: Option<&str>,
    ) -> AssetResult<()>;

    /// Ask an in-flight transfer to stop. Confirmation arrives as an event.
    async fn cancel_download(&self, relative_path: &str) -> AssetResult<()>;

    /// Delete a file (and any partial download of it)
    async fn remove_file(&self, relative_path: &str) -> AssetResult<()>;

    /// Presence on disk of each path, in input order
    async fn check_files(&self, relative_paths: &[String]) -> AssetResult<Vec<FileCheck>>;

    /// Last announced status of every known path
    async fn get_all_download_statuses(
        &self,
    ) -> AssetResult<HashMap<String, DownloadProgressEvent>>;

    /// Push channel of progress events
    fn subscribe(&self) -> broadcast::Receiver<DownloadProgressEvent>;
}

// ============================================================================
// Production Implementation
// ============================================================================

/// Streams catalog files from HTTP sources into a models directory
pub struct LocalDownloadBackend {
    models_dir: PathBuf,
    catalog: Arc<AssetCatalog>,
    client: reqwest::Client,
    download_base_url: Option<String>,
    error_preview_chars: usize,
    progress_interval: Duration,
    statuses: DashMap<String, DownloadProgressEvent>,
    active: DashMap<String, CancellationToken>,
    events: broadcast::Sender<DownloadProgressEvent>,
}

impl LocalDownloadBackend {
    pub fn new(models_dir: PathBuf, catalog: Arc<AssetCatalog>, client: reqwest::Client) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            models_dir,
            catalog,
            client,
            download_base_url: None,
            error_preview_chars: DEFAULT_ERROR_PREVIEW_CHARS,
            progress_interval: Duration::from_millis(100),
            statuses: DashMap::new(),
            active: DashMap::new(),
            events,
        }
    }

    /// Base URL used for quants without an explicit source
    pub fn with_download_base_url(mut self, base_url: Option<String>) -> Self {
        self.download_base_url = base_url;
        self
    }

    /// Minimum time between two `downloading` events of one transfer
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn with_error_preview_chars(mut self, chars: usize) -> Self {
        self.error_preview_chars = chars;
        self
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Host path of a relative weight path
    pub fn resolve_path(&self, relative_path: &str) -> AssetResult<PathBuf> {
        validate_relative_path(relative_path)?;
        let mut path = self.models_dir.clone();
        for segment in normalize_relative_path(relative_path).split('/') {
            path.push(segment);
        }
        Ok(path)
    }

    fn source_url(&self, file: &ResolvedFile) -> AssetResult<String> {
        if let Some(url) = &file.url {
            return Ok(url.clone());
        }
        self.download_base_url
            .as_deref()
            .map(|base| format!("{}/{}", base.trim_end_matches('/'), file.relative_path))
            .ok_or_else(|| AssetError::NoDownloadSource(file.relative_path.clone()))
    }

    fn announce(&self, event: DownloadProgressEvent) {
        tracing::debug!(
            path = %event.relative_path,
            status = %event.status,
            downloaded = event.downloaded_bytes,
            total = event.total_bytes,
            "Download progress"
        );
        self.statuses
            .insert(event.relative_path.clone(), event.clone());
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    async fn transfer(
        &self,
        url: &str,
        dest: &Path,
        relative_path: &str,
        approx_size: u64,
        token: &CancellationToken,
    ) -> AssetResult<u64> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let response = tokio::select! {
            _ = token.cancelled() => return Err(AssetError::Canceled(relative_path.to_string())),
            response = self.client.get(url).send() => response?,
        };

        if !response.status().is_success() {
            return Err(error_from_response(response, self.error_preview_chars).await);
        }

        let total = response.content_length().unwrap_or(approx_size);
        let partial = partial_path(dest);
        let mut last_emit = Instant::now();

        self.announce(
            DownloadProgressEvent::new(relative_path, DownloadStatus::Downloading)
                .with_bytes(0, total),
        );

        let written = write_body(response, &partial, Some(token), |written| {
            if last_emit.elapsed() >= self.progress_interval {
                self.announce(
                    DownloadProgressEvent::new(relative_path, DownloadStatus::Downloading)
                        .with_bytes(written, total.max(written)),
                );
                last_emit = Instant::now();
            }
        })
        .await;

        let written = match written {
            Ok(written) => written,
            Err(AssetError::Canceled(_)) => {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(AssetError::Canceled(relative_path.to_string()));
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(e);
            }
        };

        tokio::fs::rename(&partial, dest).await?;

        Ok(written)
    }
}

#[async_trait]
impl DownloadBackend for LocalDownloadBackend {
    async fn start_download(
        &self,
        model_id: &str,
        component: ComponentKind,
        quant_id: Option<&str>,
    ) -> AssetResult<()> {
        let model = self.catalog.model(model_id)?;
        let file = model.resolve_file(component, quant_id, &QuantSelection::default())?;
        let path = file.relative_path.clone();
        let dest = self.resolve_path(&path)?;

        if let Ok(metadata) = tokio::fs::metadata(&dest).await
            && metadata.is_file()
        {
            if looks_truncated(metadata.len(), file.approx_size_bytes) {
                tracing::warn!(
                    model_id = %model_id,
                    path = %path,
                    size = metadata.len(),
                    expected = file.approx_size_bytes,
                    "Existing file is much smaller than expected"
                );
            }
            tracing::info!(model_id = %model_id, path = %path, "File already present");
            self.announce(
                DownloadProgressEvent::new(&path, DownloadStatus::Completed)
                    .with_bytes(metadata.len(), metadata.len()),
            );
            return Ok(());
        }

        let url = self.source_url(&file)?;

        let token = CancellationToken::new();
        match self.active.entry(path.clone()) {
            Entry::Occupied(_) => return Err(AssetError::DownloadInProgress(path)),
            Entry::Vacant(slot) => {
                slot.insert(token.clone());
            }
        }
        let _active = ActiveTransfer {
            active: &self.active,
            path: &path,
        };

        tracing::info!(
            model_id = %model_id,
            component = %component,
            quant = ?file.quant_id,
            path = %path,
            url = %url,
            "Starting download"
        );

        self.announce(
            DownloadProgressEvent::new(&path, DownloadStatus::Queued)
                .with_bytes(0, file.approx_size_bytes),
        );

        match self
            .transfer(&url, &dest, &path, file.approx_size_bytes, &token)
            .await
        {
            Ok(bytes) => {
                tracing::info!(path = %path, bytes = bytes, "Download complete");
                self.announce(
                    DownloadProgressEvent::new(&path, DownloadStatus::Completed)
                        .with_bytes(bytes, bytes),
                );
                Ok(())
            }
            Err(e) if e.is_canceled() => {
                tracing::info!(path = %path, "Download canceled");
                let last = self
                    .statuses
                    .get(&path)
                    .map(|s| (s.downloaded_bytes, s.total_bytes))
                    .unwrap_or_default();
                self.announce(
                    DownloadProgressEvent::new(&path, DownloadStatus::Canceled)
                        .with_bytes(last.0, last.1),
                );
                Err(e)
            }
            Err(e) => {
                tracing::error!(path = %path, error = %e, "Download failed");
                self.announce(
                    DownloadProgressEvent::new(&path, DownloadStatus::Failed)
                        .with_error(e.user_message()),
                );
                Err(e)
            }
        }
    }

    async fn cancel_download(&self, relative_path: &str) -> AssetResult<()> {
        let path = normalize_relative_path(relative_path);
        match self.active.get(&path) {
            Some(token) => {
                token.cancel();
                tracing::info!(path = %path, "Cancellation requested");
            }
            None => tracing::debug!(path = %path, "No active transfer to cancel"),
        }
        Ok(())
    }

    async fn remove_file(&self, relative_path: &str) -> AssetResult<()> {
        let path = normalize_relative_path(relative_path);
        let dest = self.resolve_path(&path)?;

        if let Some(token) = self.active.get(&path) {
            token.cancel();
        }

        match tokio::fs::remove_file(&dest).await {
            Ok(()) => tracing::info!(path = %path, "File removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path, "File already absent");
            }
            Err(e) => return Err(e.into()),
        }
        let _ = tokio::fs::remove_file(partial_path(&dest)).await;

        self.statuses.remove(&path);
        Ok(())
    }

    async fn check_files(&self, relative_paths: &[String]) -> AssetResult<Vec<FileCheck>> {
        let mut checks = Vec::with_capacity(relative_paths.len());
        for relative_path in relative_paths {
            let host_path = self.resolve_path(relative_path)?;
            let exists = tokio::fs::metadata(&host_path)
                .await
                .map(|m| m.is_file())
                .unwrap_or(false);
            checks.push(FileCheck {
                relative_path: normalize_relative_path(relative_path),
                exists,
            });
        }
        Ok(checks)
    }

    async fn get_all_download_statuses(
        &self,
    ) -> AssetResult<HashMap<String, DownloadProgressEvent>> {
        Ok(self
            .statuses
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<DownloadProgressEvent> {
        self.events.subscribe()
    }
}

/// Releases the per-path transfer slot when the transfer ends
struct ActiveTransfer<'a> {
    active: &'a DashMap<String, CancellationToken>,
    path: &'a str,
}

impl Drop for ActiveTransfer<'_> {
    fn drop(&mut self) {
        self.active.remove(self.path);
    }
}

/// Catalog sizes are approximate; only less than half counts as truncated
fn looks_truncated(actual: u64, approx: u64) -> bool {
    approx > 0 && actual.saturating_mul(2) < approx
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================
