//! Download orchestration
//!
//! [`DownloadOrchestrator`] owns the runtime view of model weights: the last
//! known status of every file transfer, the readiness of every catalog model
//! and a mirror of the persisted settings. State lives in `watch` channels and
//! every mutation swaps a whole map, so subscribers never observe a partial
//! update. I/O happens before a swap, never while state is borrowed.

use crate::error::{AssetError, AssetResult};
use crate::models::{
    AssetCatalog, ComponentKind, DownloadBackend, DownloadProgressEvent, DownloadStatus,
    ModelDefinition, ModelFilesCheckResult, normalize_relative_path, validate_relative_path,
};
use crate::settings::{AppSettings, SettingsPatch, SettingsStore};
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

/// Default age after which an unconfirmed cancel is assumed to have happened
pub const DEFAULT_CANCEL_TIMEOUT: Duration = Duration::from_secs(120);

pub type StatusMap = HashMap<String, DownloadProgressEvent>;
pub type FilesMap = HashMap<String, ModelFilesCheckResult>;

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// How long a cancel may stay unconfirmed before reconciliation marks it canceled
    pub cancel_timeout: Duration,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            cancel_timeout: DEFAULT_CANCEL_TIMEOUT,
        }
    }
}

/// Request to fetch one component file of a model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub model_id: String,
    pub component: ComponentKind,
    /// Explicit quant; defaults to the current selection, then the first quant
    pub quant_id: Option<String>,
}

impl DownloadRequest {
    pub fn new(model_id: impl Into<String>, component: ComponentKind) -> Self {
        Self {
            model_id: model_id.into(),
            component,
            quant_id: None,
        }
    }

    pub fn with_quant(mut self, quant_id: impl Into<String>) -> Self {
        self.quant_id = Some(quant_id.into());
        self
    }
}

/// Outcome of a reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// In-flight paths found complete on disk
    pub corrected: Vec<String>,
    /// Paths whose cancel request expired without confirmation
    pub timed_out_cancels: Vec<String>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.corrected.is_empty() && self.timed_out_cancels.is_empty()
    }
}

/// Point-in-time copy of everything a UI renders
#[derive(Debug, Clone)]
pub struct OrchestratorSnapshot {
    pub catalog: Arc<AssetCatalog>,
    pub settings: AppSettings,
    pub download_status_by_path: StatusMap,
    pub files_by_model_id: FilesMap,
    pub loading: bool,
    pub error: Option<String>,
}

impl OrchestratorSnapshot {
    pub fn is_ready(&self, model_id: &str) -> bool {
        self.files_by_model_id
            .get(model_id)
            .is_some_and(|files| files.is_ready)
    }
}

pub struct DownloadOrchestrator {
    catalog: Arc<AssetCatalog>,
    backend: Arc<dyn DownloadBackend>,
    settings_store: Arc<dyn SettingsStore>,
    options: OrchestratorOptions,
    settings: watch::Sender<AppSettings>,
    statuses: watch::Sender<StatusMap>,
    files: watch::Sender<FilesMap>,
    loading: watch::Sender<bool>,
    error: watch::Sender<Option<String>>,
    /// Guard to prevent concurrent hydrate operations
    hydrate_in_progress: AtomicBool,
    pending_cancels: Mutex<HashMap<String, Instant>>,
    /// Paths whose terminal status was cleared by a new download request and
    /// whose new lifecycle the backend has not reported yet
    restarted_paths: Mutex<HashSet<String>>,
}

impl DownloadOrchestrator {
    pub fn new(
        catalog: Arc<AssetCatalog>,
        backend: Arc<dyn DownloadBackend>,
        settings_store: Arc<dyn SettingsStore>,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            catalog,
            backend,
            settings_store,
            options,
            settings: watch::channel(AppSettings::default()).0,
            statuses: watch::channel(StatusMap::new()).0,
            files: watch::channel(FilesMap::new()).0,
            loading: watch::channel(false).0,
            error: watch::channel(None).0,
            hydrate_in_progress: AtomicBool::new(false),
            pending_cancels: Mutex::new(HashMap::new()),
            restarted_paths: Mutex::new(HashSet::new()),
        }
    }

    pub fn catalog(&self) -> &Arc<AssetCatalog> {
        &self.catalog
    }

    pub fn snapshot(&self) -> OrchestratorSnapshot {
        OrchestratorSnapshot {
            catalog: Arc::clone(&self.catalog),
            settings: self.settings.borrow().clone(),
            download_status_by_path: self.statuses.borrow().clone(),
            files_by_model_id: self.files.borrow().clone(),
            loading: *self.loading.borrow(),
            error: self.error.borrow().clone(),
        }
    }

    pub fn subscribe_download_statuses(&self) -> watch::Receiver<StatusMap> {
        self.statuses.subscribe()
    }

    pub fn subscribe_model_files(&self) -> watch::Receiver<FilesMap> {
        self.files.subscribe()
    }

    pub fn subscribe_error(&self) -> watch::Receiver<Option<String>> {
        self.error.subscribe()
    }

    pub fn clear_error(&self) {
        self.error.send_replace(None);
    }

    /// Load settings and backend statuses, then compute readiness of every model.
    ///
    /// Fails fast with [`AssetError::HydrateInProgress`] when another hydrate is
    /// running; state is left untouched in that case.
    pub async fn hydrate(&self) -> AssetResult<()> {
        if self
            .hydrate_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AssetError::HydrateInProgress);
        }

        let _guard = HydrateGuard {
            flag: &self.hydrate_in_progress,
        };

        self.loading.send_replace(true);
        let result = self.hydrate_inner().await;
        self.loading.send_replace(false);

        match &result {
            Ok(()) => self.clear_error(),
            Err(e) => {
                tracing::error!(error = %e, "Hydrate failed");
                self.record_error(e);
            }
        }
        result
    }

    async fn hydrate_inner(&self) -> AssetResult<()> {
        self.sync_settings().await?;

        let statuses = normalize_statuses(self.backend.get_all_download_statuses().await?);
        let known = statuses.len();
        self.statuses.send_replace(statuses);
        self.restarted_paths.lock().await.clear();

        self.refresh_all_model_files().await;

        tracing::info!(
            models = self.catalog.len(),
            statuses = known,
            "Hydrated download state"
        );
        Ok(())
    }

    /// Re-check the files required by one model under its current selection
    pub async fn refresh_model_files(&self, model_id: &str) -> AssetResult<ModelFilesCheckResult> {
        let model = self.catalog.model(model_id)?;
        let settings = self.sync_settings().await?;

        let result = self.check_model(model, &settings).await?;
        self.files.send_modify(|files| {
            files.insert(model.id.clone(), result.clone());
        });
        self.publish_ready_count();

        tracing::debug!(model_id = %model_id, ready = result.is_ready, "Model files refreshed");
        Ok(result)
    }

    /// Re-check every catalog model concurrently and publish the results at once
    pub async fn refresh_all_model_files(&self) {
        let models: Vec<&ModelDefinition> = self.catalog.models().iter().collect();
        self.refresh_models(&models).await;
    }

    /// Bring announced statuses back in line with the backend and the disk.
    ///
    /// In-flight paths whose file exists are forced to `completed`; terminal
    /// statuses are never touched. Cancels unconfirmed for longer than the
    /// cancel timeout are marked `canceled`. A backend terminal left over from
    /// before a retry is ignored until the backend reports the new transfer.
    pub async fn reconcile_download_statuses(&self) -> AssetResult<ReconcileReport> {
        let fetched = normalize_statuses(self.backend.get_all_download_statuses().await?);
        let fetched = self.drop_previous_lifecycles(fetched).await;

        let mut merged = self.statuses.borrow().clone();
        for event in fetched.values() {
            merge_status(&mut merged, event.clone());
        }

        let in_flight: Vec<String> = merged
            .values()
            .filter(|e| e.status.is_in_flight())
            .map(|e| e.relative_path.clone())
            .collect();

        let present: HashMap<String, bool> = if in_flight.is_empty() {
            HashMap::new()
        } else {
            self.backend
                .check_files(&in_flight)
                .await?
                .into_iter()
                .map(|check| (check.relative_path, check.exists))
                .collect()
        };

        let expired = self.expired_cancels().await;

        let mut report = ReconcileReport::default();
        let mut corrections = Vec::new();
        for path in &in_flight {
            let Some(current) = merged.get(path) else {
                continue;
            };
            if present.get(path).copied().unwrap_or(false) {
                corrections.push(current.force_completed());
                report.corrected.push(path.clone());
            } else if expired.contains(path) {
                corrections.push(
                    DownloadProgressEvent::new(path, DownloadStatus::Canceled)
                        .with_bytes(current.downloaded_bytes, current.total_bytes),
                );
                report.timed_out_cancels.push(path.clone());
            }
        }

        self.statuses.send_modify(|statuses| {
            for event in fetched.into_values().chain(corrections) {
                merge_status(statuses, event);
            }
        });

        {
            let statuses = self.statuses.borrow().clone();
            let mut pending = self.pending_cancels.lock().await;
            pending.retain(|path, _| {
                statuses
                    .get(path)
                    .is_some_and(|event| event.status.is_in_flight())
            });
        }

        if !report.is_empty() {
            crate::metrics::record_status_corrected(
                report.corrected.len() + report.timed_out_cancels.len(),
            );
            tracing::info!(
                corrected = ?report.corrected,
                timed_out_cancels = ?report.timed_out_cancels,
                "Reconciled download statuses"
            );
        }

        self.refresh_all_model_files().await;

        Ok(report)
    }

    /// Apply one progress event and refresh every model that can use the file.
    ///
    /// Returns the ids of the refreshed models.
    pub async fn set_download_progress(&self, event: DownloadProgressEvent) -> Vec<String> {
        let event = event.normalized();
        let path = event.relative_path.clone();
        let status = event.status;

        let mut applied = false;
        self.statuses.send_modify(|statuses| {
            applied = merge_status(statuses, event);
        });

        if applied {
            tracing::debug!(path = %path, status = %status, "Download status updated");
        } else {
            tracing::debug!(path = %path, status = %status, "Ignoring stale progress event");
        }

        if applied {
            self.restarted_paths.lock().await.remove(&path);
        }
        if status.is_terminal() {
            self.pending_cancels.lock().await.remove(&path);
        }

        let affected = self.catalog.models_referencing(&path);
        self.refresh_models(&affected).await;

        affected.iter().map(|model| model.id.clone()).collect()
    }

    pub async fn set_active_model(&self, model_id: &str) -> AssetResult<()> {
        self.set_active_model_inner(model_id)
            .await
            .inspect_err(|e| self.record_error(e))
    }

    async fn set_active_model_inner(&self, model_id: &str) -> AssetResult<()> {
        self.catalog.model(model_id)?;

        let mut next = self.settings.borrow().clone();
        next.active_model_id = Some(model_id.to_string());

        self.settings_store
            .save(SettingsPatch {
                active_model_id: next.active_model_id.clone(),
                model_quant_selections: None,
            })
            .await
            .map_err(settings_error)?;
        self.settings.send_replace(next);

        tracing::info!(model_id = %model_id, "Active model changed");

        self.refresh_model_files(model_id).await?;
        Ok(())
    }

    /// Select the quant of one component; only that model's readiness changes
    pub async fn set_model_quant_selection(
        &self,
        model_id: &str,
        component: ComponentKind,
        quant_id: &str,
    ) -> AssetResult<()> {
        self.set_model_quant_selection_inner(model_id, component, quant_id)
            .await
            .inspect_err(|e| self.record_error(e))
    }

    async fn set_model_quant_selection_inner(
        &self,
        model_id: &str,
        component: ComponentKind,
        quant_id: &str,
    ) -> AssetResult<()> {
        let model = self.catalog.model(model_id)?;

        let mut next = self.settings.borrow().clone();
        let selection = next.selection(model_id).with(component, quant_id)?;
        if !model.quants(component).iter().any(|q| q.quant_id == quant_id) {
            return Err(AssetError::UnknownQuant {
                model_id: model_id.to_string(),
                component,
                quant_id: quant_id.to_string(),
            });
        }
        next.model_quant_selections
            .insert(model_id.to_string(), selection);

        self.settings_store
            .save(SettingsPatch {
                active_model_id: None,
                model_quant_selections: Some(next.model_quant_selections.clone()),
            })
            .await
            .map_err(settings_error)?;
        self.settings.send_replace(next);

        tracing::info!(
            model_id = %model_id,
            component = %component,
            quant = %quant_id,
            "Quant selection changed"
        );

        self.refresh_model_files(model_id).await?;
        Ok(())
    }

    /// Start (and await) the transfer of one component file.
    ///
    /// A terminal status for the path is cleared first so the new lifecycle
    /// starts from `queued`. Failures land in the error slot and mark the path
    /// `failed`; cancellation is reported to the caller but not recorded.
    /// A request refused because the path is already transferring leaves
    /// every status as it was.
    ///
    /// Success does not mark the path `completed`: the status moves on with
    /// backend events (see [`Self::spawn_progress_listener`]) or with
    /// [`Self::reconcile_download_statuses`]. Readiness is refreshed right away.
    pub async fn download_model_file(&self, request: DownloadRequest) -> AssetResult<()> {
        let model = self
            .catalog
            .model(&request.model_id)
            .inspect_err(|e| self.record_error(e))?;
        let selection = self.settings.borrow().selection(&model.id);
        let file = model
            .resolve_file(request.component, request.quant_id.as_deref(), &selection)
            .inspect_err(|e| self.record_error(e))?;
        let path = file.relative_path.clone();

        let queued = DownloadProgressEvent::new(&path, DownloadStatus::Queued)
            .with_bytes(0, file.approx_size_bytes);
        let mut previous = None;
        let mut inserted = false;
        self.statuses.send_modify(|statuses| {
            if statuses
                .get(&path)
                .is_some_and(|event| event.status.is_terminal())
            {
                previous = statuses.remove(&path);
            }
            if !statuses.contains_key(&path) {
                statuses.insert(path.clone(), queued.clone());
                inserted = true;
            }
        });
        if previous.is_some() {
            self.restarted_paths.lock().await.insert(path.clone());
        }
        let pending_cancel = self.pending_cancels.lock().await.remove(&path);

        crate::metrics::record_download_started(&model.id, file.component);
        tracing::info!(
            model_id = %model.id,
            component = %file.component,
            quant = ?file.quant_id,
            path = %path,
            "Requesting download"
        );

        match self
            .backend
            .start_download(&model.id, file.component, file.quant_id.as_deref())
            .await
        {
            Ok(()) => {
                crate::metrics::record_download_completed(&model.id, file.component);
                self.refresh_model_files(&model.id).await?;
                Ok(())
            }
            Err(e) if e.is_rejection() => {
                tracing::warn!(model_id = %model.id, path = %path, error = %e, "Download request rejected");
                if inserted {
                    self.statuses.send_modify(|statuses| {
                        if statuses.get(&path) == Some(&queued) {
                            match previous.take() {
                                Some(event) => statuses.insert(path.clone(), event),
                                None => statuses.remove(&path),
                            };
                        }
                    });
                    self.restarted_paths.lock().await.remove(&path);
                }
                if let Some(requested) = pending_cancel {
                    self.pending_cancels
                        .lock()
                        .await
                        .entry(path.clone())
                        .or_insert(requested);
                }
                Err(e)
            }
            Err(e) if e.is_canceled() => {
                tracing::info!(model_id = %model.id, path = %path, "Download canceled");
                self.statuses.send_modify(|statuses| {
                    merge_status(
                        statuses,
                        DownloadProgressEvent::new(&path, DownloadStatus::Canceled),
                    );
                });
                Err(e)
            }
            Err(e) => {
                tracing::error!(
                    model_id = %model.id,
                    path = %path,
                    error = %e,
                    "Download failed"
                );
                crate::metrics::record_download_failed(&model.id, file.component);
                self.statuses.send_modify(|statuses| {
                    merge_status(
                        statuses,
                        DownloadProgressEvent::new(&path, DownloadStatus::Failed)
                            .with_error(e.user_message()),
                    );
                });
                self.record_error(&e);
                Err(e)
            }
        }
    }

    /// Ask the backend to abort a transfer. The local status is left as is
    /// until the backend confirms or reconciliation gives up waiting.
    pub async fn cancel_model_download(&self, relative_path: &str) -> AssetResult<()> {
        let path = normalize_relative_path(relative_path);
        self.pending_cancels
            .lock()
            .await
            .insert(path.clone(), Instant::now());

        tracing::info!(path = %path, "Cancel requested");

        self.backend
            .cancel_download(&path)
            .await
            .inspect_err(|e| self.record_error(e))
    }

    /// Delete a file and refresh the model (and any other model sharing the file)
    pub async fn remove_model_file(&self, model_id: &str, relative_path: &str) -> AssetResult<()> {
        self.remove_model_file_inner(model_id, relative_path)
            .await
            .inspect_err(|e| self.record_error(e))
    }

    async fn remove_model_file_inner(&self, model_id: &str, relative_path: &str) -> AssetResult<()> {
        let owner = self.catalog.model(model_id)?;
        validate_relative_path(relative_path)?;
        let path = normalize_relative_path(relative_path);

        self.backend.remove_file(&path).await?;

        self.statuses.send_modify(|statuses| {
            statuses.remove(&path);
        });
        self.pending_cancels.lock().await.remove(&path);
        self.restarted_paths.lock().await.remove(&path);

        tracing::info!(model_id = %model_id, path = %path, "Model file removed");

        let mut models = self.catalog.models_referencing(&path);
        if !models.iter().any(|model| model.id == owner.id) {
            models.push(owner);
        }
        self.refresh_models(&models).await;
        Ok(())
    }

    /// Feed backend progress events into the orchestrator.
    ///
    /// The task holds a weak reference and ends once the orchestrator is
    /// dropped or the backend channel closes. A lagging receiver has lost
    /// events, so it reconciles instead.
    pub fn spawn_progress_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let mut events = self.backend.subscribe();
        let orchestrator = Arc::downgrade(self);

        tokio::spawn(async move {
            loop {
                let received = events.recv().await;
                let Some(orchestrator) = orchestrator.upgrade() else {
                    break;
                };
                match received {
                    Ok(event) => {
                        orchestrator.set_download_progress(event).await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped = skipped, "Progress listener lagged, reconciling");
                        if let Err(e) = orchestrator.reconcile_download_statuses().await {
                            tracing::warn!(error = %e, "Reconciliation after lag failed");
                        }
                    }
                    Err(RecvError::Closed) => {
                        tracing::debug!("Progress channel closed");
                        break;
                    }
                }
            }
        })
    }

    async fn refresh_models(&self, models: &[&ModelDefinition]) {
        if models.is_empty() {
            return;
        }

        let settings = match self.sync_settings().await {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!(error = %e, "Using cached settings for refresh");
                self.settings.borrow().clone()
            }
        };

        let checks = join_all(models.iter().map(|model| {
            let settings = &settings;
            async move { (*model, self.check_model(model, settings).await) }
        }))
        .await;

        self.files.send_modify(|files| {
            for (model, result) in checks {
                match result {
                    Ok(result) => {
                        files.insert(model.id.clone(), result);
                    }
                    Err(e) => {
                        tracing::warn!(model_id = %model.id, error = %e, "Failed to check model files");
                        // Unverifiable files count as missing
                        files.insert(
                            model.id.clone(),
                            ModelFilesCheckResult::all_missing(
                                &model.id,
                                &model.required_files(&settings.selection(&model.id)),
                            ),
                        );
                    }
                }
            }
        });
        self.publish_ready_count();
    }

    async fn check_model(
        &self,
        model: &ModelDefinition,
        settings: &AppSettings,
    ) -> AssetResult<ModelFilesCheckResult> {
        let paths = model.required_files(&settings.selection(&model.id));
        let files = self.backend.check_files(&paths).await?;
        Ok(ModelFilesCheckResult::new(&model.id, files))
    }

    /// Reload settings from the store into the mirror
    async fn sync_settings(&self) -> AssetResult<AppSettings> {
        let settings = self.settings_store.get().await.map_err(settings_error)?;
        self.settings.send_replace(settings.clone());
        Ok(settings)
    }

    /// Drop backend terminals of restarted paths until the backend reports the
    /// new transfer in flight. A marker ends once the local status is terminal
    /// or gone.
    async fn drop_previous_lifecycles(&self, mut fetched: StatusMap) -> StatusMap {
        let mut restarted = self.restarted_paths.lock().await;
        if restarted.is_empty() {
            return fetched;
        }

        let local = self.statuses.borrow().clone();
        restarted.retain(|path| {
            if local
                .get(path)
                .is_none_or(|event| event.status.is_terminal())
            {
                return false;
            }
            match fetched.get(path).map(|event| event.status) {
                Some(status) if status.is_terminal() => {
                    tracing::debug!(path = %path, status = %status, "Ignoring status from a previous transfer");
                    fetched.remove(path);
                    true
                }
                Some(_) => false,
                None => true,
            }
        });
        fetched
    }

    async fn expired_cancels(&self) -> Vec<String> {
        let pending = self.pending_cancels.lock().await;
        pending
            .iter()
            .filter(|(_, requested)| requested.elapsed() >= self.options.cancel_timeout)
            .map(|(path, _)| path.clone())
            .collect()
    }

    fn publish_ready_count(&self) {
        let ready = self.files.borrow().values().filter(|f| f.is_ready).count();
        crate::metrics::update_ready_models(ready);
    }

    fn record_error(&self, error: &AssetError) {
        self.error.send_replace(Some(error.user_message()));
    }
}

/// RAII guard to ensure hydrate_in_progress flag is cleared on drop
struct HydrateGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for HydrateGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Merge `event` into `statuses`; returns whether it was applied
fn merge_status(statuses: &mut StatusMap, event: DownloadProgressEvent) -> bool {
    match statuses.get(&event.relative_path) {
        Some(current) if !event.supersedes(current) => false,
        _ => {
            statuses.insert(event.relative_path.clone(), event);
            true
        }
    }
}

/// Re-key backend statuses by normalized path, collapsing duplicates
fn normalize_statuses(raw: StatusMap) -> StatusMap {
    let mut statuses = StatusMap::with_capacity(raw.len());
    for (key, mut event) in raw {
        event.relative_path = normalize_relative_path(&key);
        merge_status(&mut statuses, event);
    }
    statuses
}

fn settings_error(e: anyhow::Error) -> AssetError {
    AssetError::Settings(format!("{:#}", e))
}
