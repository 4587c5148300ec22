//! Download orchestration over the local backend, a real models directory and
//! an in-process weight server

mod common;

use asset_manager::models::{ModelType, Quant, VaeFile};
use asset_manager::{
    AssetCatalog, AssetError, ComponentKind, DownloadBackend, DownloadOrchestrator,
    DownloadProgressEvent, DownloadRequest, DownloadStatus, FileSettingsStore, LocalDownloadBackend, ModelDefinition,
    OrchestratorOptions, SettingsStore,
};
use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::Path as UrlPath;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

async fn weight(UrlPath(path): UrlPath<String>) -> Response {
    if path.contains("missing") {
        return (StatusCode::NOT_FOUND, "no such weight").into_response();
    }
    format!("weights:{}", path).into_response()
}

/// Sends one chunk, then never finishes
async fn stalled() -> Response {
    let stream = futures::stream::once(async { Ok::<_, std::io::Error>(Bytes::from_static(b"abc")) })
        .chain(futures::stream::pending());
    Body::from_stream(stream).into_response()
}

fn quant(id: &str, path: &str, url: Option<String>) -> Quant {
    Quant {
        quant_id: id.to_string(),
        relative_file_path: path.to_string(),
        approx_size_bytes: 64,
        url,
    }
}

fn catalog(base: &str) -> AssetCatalog {
    let vae = VaeFile {
        relative_file_path: "vae/ae.safetensors".to_string(),
        approx_size_bytes: 32,
        url: None,
    };
    AssetCatalog::new(vec![
        ModelDefinition {
            id: "tiny".to_string(),
            name: "Tiny".to_string(),
            model_type: ModelType::ImageGeneration,
            diffusion: vec![
                quant("Q4", "tiny/diffusion-Q4.gguf", None),
                quant("Q8", "tiny/diffusion-Q8-missing.gguf", None),
                quant(
                    "F16",
                    "tiny/diffusion-F16.gguf",
                    Some(format!("{}/stalled/diffusion-F16.gguf", base)),
                ),
            ],
            text_encoder: vec![quant("Q4", "text-encoders/shared.gguf", None)],
            vae: vae.clone(),
        },
        ModelDefinition {
            id: "other".to_string(),
            name: "Other".to_string(),
            model_type: ModelType::ImageGeneration,
            diffusion: vec![quant("Q4", "other/diffusion-Q4.gguf", None)],
            text_encoder: vec![quant("Q4", "text-encoders/shared.gguf", None)],
            vae,
        },
    ])
    .unwrap()
}

struct Setup {
    _temp_dir: TempDir,
    models_dir: std::path::PathBuf,
    settings_file: std::path::PathBuf,
    backend: Arc<LocalDownloadBackend>,
    orchestrator: Arc<DownloadOrchestrator>,
}

async fn setup() -> Setup {
    let base = common::serve(
        Router::new()
            .route("/weights/{*path}", get(weight))
            .route("/stalled/{*path}", get(stalled)),
    )
    .await;

    let temp_dir = TempDir::new().unwrap();
    let models_dir = temp_dir.path().join("models");
    let settings_file = temp_dir.path().join("settings.toml");
    let catalog = Arc::new(catalog(&base));

    let backend = Arc::new(
        LocalDownloadBackend::new(models_dir.clone(), catalog.clone(), reqwest::Client::new())
            .with_download_base_url(Some(format!("{}/weights", base)))
            .with_progress_interval(Duration::ZERO),
    );
    let orchestrator = Arc::new(DownloadOrchestrator::new(
        catalog,
        backend.clone(),
        Arc::new(FileSettingsStore::new(settings_file.clone())),
        OrchestratorOptions::default(),
    ));
    orchestrator.hydrate().await.unwrap();

    Setup {
        _temp_dir: temp_dir,
        models_dir,
        settings_file,
        backend,
        orchestrator,
    }
}

#[tokio::test]
async fn test_downloading_every_component_makes_model_ready() {
    let s = setup().await;
    let listener = s.orchestrator.spawn_progress_listener();
    assert!(!s.orchestrator.snapshot().is_ready("tiny"));

    for component in [
        ComponentKind::Diffusion,
        ComponentKind::TextEncoder,
        ComponentKind::Vae,
    ] {
        s.orchestrator
            .download_model_file(DownloadRequest::new("tiny", component))
            .await
            .unwrap();
    }

    let snapshot = s.orchestrator.snapshot();
    assert!(snapshot.is_ready("tiny"));
    // The shared encoder and VAE alone do not make the other model ready
    assert!(!snapshot.is_ready("other"));
    assert_eq!(
        std::fs::read_to_string(s.models_dir.join("tiny/diffusion-Q4.gguf")).unwrap(),
        "weights:tiny/diffusion-Q4.gguf"
    );

    let statuses = s.backend.get_all_download_statuses().await.unwrap();
    assert_eq!(statuses.len(), 3);
    assert!(
        statuses
            .values()
            .all(|event| event.status == DownloadStatus::Completed)
    );

    listener.abort();
}

#[tokio::test]
async fn test_reconcile_completes_statuses_after_missed_events() {
    let s = setup().await;

    // No listener: completion events are never applied
    s.orchestrator
        .download_model_file(DownloadRequest::new("other", ComponentKind::Diffusion))
        .await
        .unwrap();

    let report = s.orchestrator.reconcile_download_statuses().await.unwrap();
    assert!(report.corrected.is_empty());
    let event = &s.orchestrator.snapshot().download_status_by_path["other/diffusion-Q4.gguf"];
    assert_eq!(event.status, DownloadStatus::Completed);
    assert_eq!(event.downloaded_bytes, event.total_bytes);
}

#[tokio::test]
async fn test_missing_weight_marks_failed() {
    let s = setup().await;

    let err = s
        .orchestrator
        .download_model_file(DownloadRequest::new("tiny", ComponentKind::Diffusion).with_quant("Q8"))
        .await
        .unwrap_err();
    assert!(matches!(err, AssetError::RemoteFetch { status: 404, .. }));

    let snapshot = s.orchestrator.snapshot();
    let event = &snapshot.download_status_by_path["tiny/diffusion-Q8-missing.gguf"];
    assert_eq!(event.status, DownloadStatus::Failed);
    assert!(event.error.as_deref().unwrap().contains("404"));
    assert!(snapshot.error.is_some());
    assert!(!s.models_dir.join("tiny/diffusion-Q8-missing.gguf").exists());
    assert!(!s.models_dir.join("tiny/diffusion-Q8-missing.gguf.part").exists());
}

#[tokio::test]
async fn test_cancel_stops_transfer_and_cleans_up() {
    let s = setup().await;
    let path = "tiny/diffusion-F16.gguf";
    let mut events = s.backend.subscribe();

    let orchestrator = s.orchestrator.clone();
    let download = tokio::spawn(async move {
        orchestrator
            .download_model_file(DownloadRequest::new("tiny", ComponentKind::Diffusion).with_quant("F16"))
            .await
    });

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.unwrap();
            if event.relative_path == path && event.status == DownloadStatus::Downloading {
                break;
            }
        }
    })
    .await
    .unwrap();

    // A second transfer of the same path is refused
    let err = s
        .backend
        .start_download("tiny", ComponentKind::Diffusion, Some("F16"))
        .await
        .unwrap_err();
    assert!(matches!(err, AssetError::DownloadInProgress(_)));

    s.orchestrator.cancel_model_download(path).await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), download)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(AssetError::Canceled(_))));

    let snapshot = s.orchestrator.snapshot();
    assert_eq!(
        snapshot.download_status_by_path[path].status,
        DownloadStatus::Canceled
    );
    assert!(snapshot.error.is_none());
    assert!(!s.models_dir.join(path).exists());
    assert!(!s.models_dir.join("tiny/diffusion-F16.gguf.part").exists());
}

#[tokio::test]
async fn test_duplicate_request_leaves_live_transfer_alone() {
    let s = setup().await;
    let path = "tiny/diffusion-F16.gguf";
    let mut events = s.backend.subscribe();
    let request = DownloadRequest::new("tiny", ComponentKind::Diffusion).with_quant("F16");

    let orchestrator = s.orchestrator.clone();
    let first = request.clone();
    let download = tokio::spawn(async move { orchestrator.download_model_file(first).await });

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.unwrap();
            if event.relative_path == path && event.status == DownloadStatus::Downloading {
                break;
            }
        }
    })
    .await
    .unwrap();

    let err = s.orchestrator.download_model_file(request).await.unwrap_err();
    assert!(matches!(err, AssetError::DownloadInProgress(_)));

    let snapshot = s.orchestrator.snapshot();
    let event = &snapshot.download_status_by_path[path];
    assert!(event.status.is_in_flight());
    assert!(event.error.is_none());
    assert!(snapshot.error.is_none());

    // Progress of the running transfer still lands
    s.orchestrator
        .set_download_progress(
            DownloadProgressEvent::new(path, DownloadStatus::Downloading).with_bytes(999, 1000),
        )
        .await;
    assert_eq!(
        s.orchestrator.snapshot().download_status_by_path[path].status,
        DownloadStatus::Downloading
    );

    s.orchestrator.cancel_model_download(path).await.unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), download)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(AssetError::Canceled(_))));
    assert_eq!(
        s.orchestrator.snapshot().download_status_by_path[path].status,
        DownloadStatus::Canceled
    );
}

#[tokio::test]
async fn test_remove_file_updates_sharing_models() {
    let s = setup().await;
    for (model, component) in [
        ("other", ComponentKind::Diffusion),
        ("other", ComponentKind::TextEncoder),
        ("other", ComponentKind::Vae),
    ] {
        s.orchestrator
            .download_model_file(DownloadRequest::new(model, component))
            .await
            .unwrap();
    }
    assert!(s.orchestrator.snapshot().is_ready("other"));

    s.orchestrator
        .remove_model_file("tiny", "text-encoders\\shared.gguf")
        .await
        .unwrap();

    assert!(!s.models_dir.join("text-encoders/shared.gguf").exists());
    let snapshot = s.orchestrator.snapshot();
    assert!(!snapshot.is_ready("other"));
    assert!(
        !snapshot
            .download_status_by_path
            .contains_key("text-encoders/shared.gguf")
    );
}

#[tokio::test]
async fn test_selections_survive_restart() {
    let s = setup().await;
    s.orchestrator
        .set_model_quant_selection("tiny", ComponentKind::Diffusion, "Q8")
        .await
        .unwrap();
    s.orchestrator.set_active_model("tiny").await.unwrap();

    let store = FileSettingsStore::new(s.settings_file.clone());
    let settings = store.get().await.unwrap();
    assert_eq!(settings.active_model_id.as_deref(), Some("tiny"));
    assert_eq!(
        settings.selection("tiny").diffusion_quant.as_deref(),
        Some("Q8")
    );

    let files = &s.orchestrator.snapshot().files_by_model_id["tiny"];
    assert!(
        files
            .files
            .iter()
            .any(|f| f.relative_path == "tiny/diffusion-Q8-missing.gguf")
    );
}
