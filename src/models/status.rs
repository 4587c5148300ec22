//! Download progress and file-presence types
//!
//! Everything here is keyed by the normalized relative path: `/`-separated
//! segments with empty and `.` segments removed, whatever the host separator.

use crate::error::{AssetError, AssetResult};
use serde::{Deserialize, Serialize};

/// Normalize a relative weight path so it can be used as a map key.
///
/// Backslashes become `/`, repeated separators collapse and leading `./` or
/// `/` are dropped. Applying it twice yields the same result.
pub fn normalize_relative_path(path: &str) -> String {
    path.replace('\\', "/")
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Announced state of one file transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Queued,
    Downloading,
    Completed,
    Failed,
    Canceled,
}

impl DownloadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Queued | Self::Downloading)
    }

    /// Position in `queued -> downloading -> terminal`
    fn rank(self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Downloading => 1,
            Self::Completed | Self::Failed | Self::Canceled => 2,
        }
    }
}

impl std::fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Downloading => write!(f, "downloading"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}

/// Progress of a single file, as announced by the download backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadProgressEvent {
    pub relative_path: String,
    pub status: DownloadStatus,
    #[serde(default)]
    pub downloaded_bytes: u64,
    #[serde(default)]
    pub total_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DownloadProgressEvent {
    pub fn new(relative_path: impl Into<String>, status: DownloadStatus) -> Self {
        Self {
            relative_path: relative_path.into(),
            status,
            downloaded_bytes: 0,
            total_bytes: 0,
            error: None,
        }
    }

    pub fn with_bytes(mut self, downloaded_bytes: u64, total_bytes: u64) -> Self {
        self.downloaded_bytes = downloaded_bytes;
        self.total_bytes = total_bytes;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Same event with its path in normalized form
    pub fn normalized(mut self) -> Self {
        self.relative_path = normalize_relative_path(&self.relative_path);
        self
    }

    /// Whether this event should replace `current` for the same path.
    ///
    /// Delivery order is not guaranteed, so the more advanced status wins:
    /// an existing terminal status is never replaced, and among equal ranks the
    /// larger byte count wins.
    pub fn supersedes(&self, current: &DownloadProgressEvent) -> bool {
        if current.status.is_terminal() {
            return false;
        }
        match self.status.rank().cmp(&current.status.rank()) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => self.downloaded_bytes >= current.downloaded_bytes,
        }
    }

    /// Disk confirmed the file landed although no completion was announced
    pub fn force_completed(&self) -> Self {
        let total = self.total_bytes.max(self.downloaded_bytes);
        Self {
            relative_path: self.relative_path.clone(),
            status: DownloadStatus::Completed,
            downloaded_bytes: total,
            total_bytes: total,
            error: None,
        }
    }
}

/// Presence of one required file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCheck {
    pub relative_path: String,
    pub exists: bool,
}

/// Readiness of one model under its current quant selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelFilesCheckResult {
    pub model_id: String,
    pub files: Vec<FileCheck>,
    pub is_ready: bool,
}

impl ModelFilesCheckResult {
    pub fn new(model_id: impl Into<String>, files: Vec<FileCheck>) -> Self {
        let is_ready = !files.is_empty() && files.iter().all(|f| f.exists);
        Self {
            model_id: model_id.into(),
            files,
            is_ready,
        }
    }

    /// Result used when presence could not be determined
    pub fn all_missing(model_id: impl Into<String>, paths: &[String]) -> Self {
        let files = paths
            .iter()
            .map(|p| FileCheck {
                relative_path: p.clone(),
                exists: false,
            })
            .collect();
        Self::new(model_id, files)
    }

    pub fn missing(&self) -> impl Iterator<Item = &str> {
        self.files
            .iter()
            .filter(|f| !f.exists)
            .map(|f| f.relative_path.as_str())
    }

    /// First absent file as [`AssetError::NotFoundOnDisk`]
    pub fn ensure_ready(&self) -> AssetResult<()> {
        match self.missing().next() {
            Some(path) => Err(AssetError::NotFoundOnDisk(path.to_string())),
            None if self.files.is_empty() => {
                Err(AssetError::NotFoundOnDisk(format!("no files for {}", self.model_id)))
            }
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_mixed_separators() {
        assert_eq!(
            normalize_relative_path("text-encoders\\qwen3\\model.gguf"),
            "text-encoders/qwen3/model.gguf"
        );
        assert_eq!(normalize_relative_path("./vae//ae.safetensors"), "vae/ae.safetensors");
        assert_eq!(normalize_relative_path("/shared.gguf"), "shared.gguf");
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let once = normalize_relative_path(".\\a//b\\.\\c.gguf");
        assert_eq!(normalize_relative_path(&once), once);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(DownloadStatus::Queued.to_string(), "queued");
        assert_eq!(DownloadStatus::Downloading.to_string(), "downloading");
        assert_eq!(DownloadStatus::Completed.to_string(), "completed");
        assert_eq!(DownloadStatus::Failed.to_string(), "failed");
        assert_eq!(DownloadStatus::Canceled.to_string(), "canceled");
    }

    #[test]
    fn test_terminal_beats_downloading() {
        let downloading =
            DownloadProgressEvent::new("a.gguf", DownloadStatus::Downloading).with_bytes(50, 100);
        let completed =
            DownloadProgressEvent::new("a.gguf", DownloadStatus::Completed).with_bytes(100, 100);

        assert!(completed.supersedes(&downloading));
        // A late progress event must not resurrect a finished transfer
        assert!(!downloading.supersedes(&completed));
    }

    #[test]
    fn test_terminal_is_never_replaced() {
        let failed = DownloadProgressEvent::new("a.gguf", DownloadStatus::Failed);
        let completed = DownloadProgressEvent::new("a.gguf", DownloadStatus::Completed);
        assert!(!completed.supersedes(&failed));
    }

    #[test]
    fn test_progress_prefers_more_bytes() {
        let older =
            DownloadProgressEvent::new("a.gguf", DownloadStatus::Downloading).with_bytes(10, 100);
        let newer =
            DownloadProgressEvent::new("a.gguf", DownloadStatus::Downloading).with_bytes(40, 100);

        assert!(newer.supersedes(&older));
        assert!(!older.supersedes(&newer));
    }

    #[test]
    fn test_queued_does_not_replace_downloading() {
        let downloading =
            DownloadProgressEvent::new("a.gguf", DownloadStatus::Downloading).with_bytes(10, 100);
        let queued = DownloadProgressEvent::new("a.gguf", DownloadStatus::Queued);
        assert!(!queued.supersedes(&downloading));
    }

    #[test]
    fn test_force_completed_fills_bytes() {
        let event =
            DownloadProgressEvent::new("a.gguf", DownloadStatus::Downloading).with_bytes(70, 100);
        let forced = event.force_completed();
        assert_eq!(forced.status, DownloadStatus::Completed);
        assert_eq!(forced.downloaded_bytes, 100);
        assert_eq!(forced.total_bytes, 100);
    }

    #[test]
    fn test_check_result_readiness() {
        let ready = ModelFilesCheckResult::new(
            "m",
            vec![
                FileCheck {
                    relative_path: "a".into(),
                    exists: true,
                },
                FileCheck {
                    relative_path: "b".into(),
                    exists: true,
                },
            ],
        );
        assert!(ready.is_ready);

        assert!(ready.ensure_ready().is_ok());

        let missing = ModelFilesCheckResult::all_missing("m", &["a".to_string()]);
        assert!(!missing.is_ready);
        assert_eq!(missing.missing().collect::<Vec<_>>(), vec!["a"]);
        assert!(matches!(
            missing.ensure_ready(),
            Err(AssetError::NotFoundOnDisk(path)) if path == "a"
        ));
    }

    #[test]
    fn test_event_serialize() {
        let event = DownloadProgressEvent::new("vae/ae.safetensors", DownloadStatus::Queued);
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"status\":\"queued\""));
        assert!(!json.contains("error"));
    }
}
