//! Remote artifact fetching
//!
//! Materializes a provider output URL as a local file named
//! `{token}-{stem}{ext}` so concurrent or repeated downloads of the same
//! logical name never collide. The body is streamed to a hidden temp file in
//! the target directory and renamed into place once complete.

use crate::error::{AssetError, AssetResult};
use crate::normalize::ProviderOutputArtifact;
use futures::StreamExt;
use reqwest::Url;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Characters of an error body kept for diagnostics
pub const DEFAULT_ERROR_PREVIEW_CHARS: usize = 512;

const DEFAULT_EXTENSION: &str = ".bin";
const ELLIPSIS: &str = "...";

/// Fetches provider artifacts over HTTP
#[derive(Clone)]
pub struct ArtifactFetcher {
    client: reqwest::Client,
    error_preview_chars: usize,
}

/// Result of materializing one artifact
#[derive(Debug)]
pub struct FetchOutcome {
    pub artifact: ProviderOutputArtifact,
    pub result: AssetResult<PathBuf>,
}

impl ArtifactFetcher {
    /// Create a fetcher with its own HTTP client
    pub fn new(timeout: Duration, error_preview_chars: usize) -> AssetResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AssetError::Network(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self::with_client(client, error_preview_chars))
    }

    /// Create a fetcher sharing an existing client
    pub fn with_client(client: reqwest::Client, error_preview_chars: usize) -> Self {
        Self {
            client,
            error_preview_chars,
        }
    }

    /// Download `url` into `dir` and return the absolute path of the new file
    pub async fn fetch_to_dir(&self, url: &str, dir: &Path) -> AssetResult<PathBuf> {
        let url = parse_remote_url(url)?;

        tokio::fs::create_dir_all(dir).await?;

        tracing::debug!(url = %url, dir = ?dir, "Fetching artifact");

        let response = self.client.get(url.clone()).send().await?;
        if !response.status().is_success() {
            let err = error_from_response(response, self.error_preview_chars).await;
            tracing::warn!(url = %url, error = %err, "Artifact fetch failed");
            return Err(err);
        }

        let file_name = output_file_name(&url);
        let dest = std::path::absolute(dir.join(&file_name))?;
        let temp = dir.join(format!(".{}.part", file_name));

        let written = match write_body(response, &temp, None, |_| {}).await {
            Ok(written) => written,
            Err(e) => {
                let _ = tokio::fs::remove_file(&temp).await;
                return Err(e);
            }
        };

        if let Err(e) = tokio::fs::rename(&temp, &dest).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }

        crate::metrics::record_artifact_fetched(written);
        tracing::info!(url = %url, path = ?dest, bytes = written, "Artifact fetched");

        Ok(dest)
    }

    /// Materialize every artifact, isolating failures per artifact
    pub async fn fetch_outputs(
        &self,
        artifacts: &[ProviderOutputArtifact],
        dir: &Path,
    ) -> Vec<FetchOutcome> {
        let mut outcomes = Vec::with_capacity(artifacts.len());
        for artifact in artifacts {
            let result = self.fetch_to_dir(&artifact.provider_path, dir).await;
            outcomes.push(FetchOutcome {
                artifact: artifact.clone(),
                result,
            });
        }
        outcomes
    }
}

/// Accept only absolute http(s) URLs
pub fn parse_remote_url(url: &str) -> AssetResult<Url> {
    let parsed = Url::parse(url.trim()).map_err(|e| AssetError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        scheme => Err(AssetError::InvalidUrl {
            url: url.to_string(),
            reason: format!("unsupported scheme '{}'", scheme),
        }),
    }
}

/// `{token}-{stem}{ext}` derived from the URL path basename
pub fn output_file_name(url: &Url) -> String {
    let basename = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .map(|segment| {
            urlencoding::decode(segment)
                .map(|decoded| decoded.into_owned())
                .unwrap_or_else(|_| segment.to_string())
        })
        .map(|name| sanitize_file_name(&name))
        .unwrap_or_default();

    let path = Path::new(&basename);
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(random_stem);
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty())
        .map(|e| format!(".{}", e))
        .unwrap_or_else(|| DEFAULT_EXTENSION.to_string());

    format!("{}-{}{}", Uuid::new_v4().simple(), stem, extension)
}

fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect::<String>()
        .trim()
        .to_string()
}

fn random_stem() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_string()
}

/// Keep at most `max_chars` characters, marking the cut with an ellipsis
pub fn truncate_preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut preview: String = text.chars().take(max_chars).collect();
    preview.push_str(ELLIPSIS);
    preview
}

/// Build a `RemoteFetch` error, reading no more of the body than the preview needs
pub(crate) async fn error_from_response(
    mut response: reqwest::Response,
    preview_chars: usize,
) -> AssetError {
    let status = response.status();
    let reason = status.canonical_reason().unwrap_or("Unknown").to_string();

    // UTF-8 is at most 4 bytes per char; one extra char decides truncation
    let byte_budget = preview_chars.saturating_add(1).saturating_mul(4);
    let mut buffered = Vec::new();
    while buffered.len() < byte_budget {
        match response.chunk().await {
            Ok(Some(chunk)) => buffered.extend_from_slice(&chunk),
            Ok(None) | Err(_) => break,
        }
    }

    let body = String::from_utf8_lossy(&buffered);
    AssetError::RemoteFetch {
        status: status.as_u16(),
        reason,
        body: truncate_preview(body.trim(), preview_chars),
    }
}

/// Stream a response body into `path`, reporting cumulative bytes.
/// Stops with `Canceled` as soon as `cancel` fires.
pub(crate) async fn write_body<F>(
    response: reqwest::Response,
    path: &Path,
    cancel: Option<&CancellationToken>,
    mut on_progress: F,
) -> AssetResult<u64>
where
    F: FnMut(u64),
{
    let file = tokio::fs::File::create(path).await?;
    let mut file = tokio::io::BufWriter::new(file);
    let mut stream = response.bytes_stream();
    let mut written = 0u64;

    loop {
        let next = match cancel {
            Some(token) => tokio::select! {
                _ = token.cancelled() => {
                    return Err(AssetError::Canceled(path.display().to_string()));
                }
                next = stream.next() => next,
            },
            None => stream.next().await,
        };
        let Some(chunk) = next else { break };
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
        on_progress(written);
    }

    file.flush().await?;
    file.into_inner().sync_all().await?;

    Ok(written)
}
