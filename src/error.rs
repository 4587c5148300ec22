//! Error types for asset acquisition and download orchestration

use crate::models::ComponentKind;

/// Errors raised by the normalizer, fetcher, catalog, backend and orchestrator
#[derive(Debug, thiserror::Error)]
pub enum AssetError {
    /// Request could not be sent or the body stream broke mid-transfer
    #[error("network error: {0}")]
    Network(String),

    /// Remote answered with a non-success status. `body` is already truncated.
    #[error("remote fetch failed: HTTP {status} {reason}: {body}")]
    RemoteFetch {
        status: u16,
        reason: String,
        body: String,
    },

    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// A required file is absent. Non-fatal: it only makes a model not ready.
    #[error("file not found on disk: {0}")]
    NotFoundOnDisk(String),

    #[error("malformed provider response: {0}")]
    MalformedProviderResponse(String),

    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("unknown quant '{quant_id}' for {component} of model '{model_id}'")]
    UnknownQuant {
        model_id: String,
        component: ComponentKind,
        quant_id: String,
    },

    #[error("invalid selection: {0}")]
    InvalidSelection(String),

    #[error("invalid catalog: {0}")]
    InvalidCatalog(String),

    #[error("invalid relative path '{0}'")]
    InvalidPath(String),

    #[error("no download source configured for {0}")]
    NoDownloadSource(String),

    #[error("download already in progress: {0}")]
    DownloadInProgress(String),

    #[error("download canceled: {0}")]
    Canceled(String),

    #[error("hydrate already in progress")]
    HydrateInProgress,

    #[error("settings store error: {0}")]
    Settings(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AssetError {
    /// Short message suitable for the single visible error slot
    pub fn user_message(&self) -> String {
        match self {
            AssetError::RemoteFetch {
                status,
                reason,
                body,
            } if body.is_empty() => format!("Download failed ({} {})", status, reason),
            AssetError::RemoteFetch {
                status,
                reason,
                body,
            } => format!("Download failed ({} {}): {}", status, reason, body),
            AssetError::Network(msg) => format!("Network error: {}", msg),
            AssetError::Canceled(path) => format!("Download of {} was canceled", path),
            other => other.to_string(),
        }
    }

    /// Cancellation is an expected outcome, not a failure
    pub fn is_canceled(&self) -> bool {
        matches!(self, AssetError::Canceled(_))
    }

    /// The request was refused because another transfer owns the path
    pub fn is_rejection(&self) -> bool {
        matches!(self, AssetError::DownloadInProgress(_))
    }
}

impl From<reqwest::Error> for AssetError {
    fn from(err: reqwest::Error) -> Self {
        AssetError::Network(err.to_string())
    }
}

pub type AssetResult<T> = Result<T, AssetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_fetch_display_carries_status_and_reason() {
        let err = AssetError::RemoteFetch {
            status: 404,
            reason: "Not Found".to_string(),
            body: "not found".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("404"));
        assert!(msg.contains("Not Found"));
        assert!(msg.contains("not found"));
    }

    #[test]
    fn test_user_message_without_body() {
        let err = AssetError::RemoteFetch {
            status: 500,
            reason: "Internal Server Error".to_string(),
            body: String::new(),
        };
        assert_eq!(err.user_message(), "Download failed (500 Internal Server Error)");
    }

    #[test]
    fn test_canceled_is_not_a_failure() {
        assert!(AssetError::Canceled("a.gguf".to_string()).is_canceled());
        assert!(!AssetError::HydrateInProgress.is_canceled());
    }

    #[test]
    fn test_in_progress_is_a_rejection() {
        assert!(AssetError::DownloadInProgress("a.gguf".to_string()).is_rejection());
        assert!(!AssetError::Network("reset".to_string()).is_rejection());
        assert!(!AssetError::Canceled("a.gguf".to_string()).is_rejection());
    }

    #[test]
    fn test_unknown_quant_display() {
        let err = AssetError::UnknownQuant {
            model_id: "flux".to_string(),
            component: ComponentKind::TextEncoder,
            quant_id: "Q9".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "unknown quant 'Q9' for text_encoder of model 'flux'"
        );
    }
}
