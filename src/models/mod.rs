//! Model weight management
//!
//! Provides:
//! - The declarative model catalog and quant resolution
//! - Download status events and readiness results
//! - The download backend trait and its local HTTP implementation

pub mod backend;
pub mod catalog;
pub mod status;

pub use backend::{DownloadBackend, LocalDownloadBackend};
pub use catalog::{
    AssetCatalog, ComponentKind, ModelDefinition, ModelType, Quant, QuantSelection, ResolvedFile,
    VaeFile, validate_relative_path,
};
pub use status::{
    DownloadProgressEvent, DownloadStatus, FileCheck, ModelFilesCheckResult,
    normalize_relative_path,
};
