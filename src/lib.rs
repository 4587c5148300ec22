//! Asset Manager - model weight and provider output acquisition
//!
//! Normalizes remote provider responses into downloadable artifacts, fetches
//! those artifacts to disk, and orchestrates downloads of large, shareable
//! model weight files against a declarative catalog.

pub mod config;
pub mod error;
pub mod fetch;
pub mod metrics;
pub mod models;
pub mod normalize;
pub mod orchestrator;
pub mod settings;

pub use config::ManagerConfig;
pub use error::{AssetError, AssetResult};
pub use fetch::{ArtifactFetcher, FetchOutcome};
pub use models::{
    AssetCatalog, ComponentKind, DownloadBackend, DownloadProgressEvent, DownloadStatus,
    LocalDownloadBackend, ModelDefinition, ModelFilesCheckResult, QuantSelection,
};
pub use normalize::{ProviderOutputArtifact, normalize_outputs};
pub use orchestrator::{
    DownloadOrchestrator, DownloadRequest, OrchestratorOptions, OrchestratorSnapshot,
    ReconcileReport,
};
pub use settings::{AppSettings, FileSettingsStore, SettingsPatch, SettingsStore};
