//! Asset Manager - Main entry point

use anyhow::{Context, Result};
use asset_manager::{
    ArtifactFetcher, ComponentKind, DownloadOrchestrator, DownloadRequest, DownloadStatus,
    FileSettingsStore, LocalDownloadBackend, config::ManagerConfig, metrics, normalize,
};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;

#[derive(Parser, Debug)]
#[command(name = "asset-manager")]
#[command(about = "Model weight and provider output manager", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override models directory
    #[arg(long)]
    models_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    log_format: String,

    /// Print Prometheus metrics before exiting
    #[arg(long)]
    metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List catalog models and their readiness
    Models,
    /// Download one component file of a model
    Download {
        model_id: String,
        /// diffusion, text_encoder or vae
        component: ComponentKind,
        /// Quant to fetch (defaults to the current selection)
        #[arg(long)]
        quant: Option<String>,
    },
    /// Select the quant of a model component
    Select {
        model_id: String,
        component: ComponentKind,
        quant: String,
    },
    /// Make a model the active one
    Activate { model_id: String },
    /// Delete a model file
    Remove {
        model_id: String,
        relative_path: String,
    },
    /// Correct download statuses from the disk
    Reconcile,
    /// Normalize a provider JSON response and fetch its outputs
    Fetch {
        /// Provider response file
        response: PathBuf,
        /// Output directory (defaults to the configured outputs_dir)
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    match cli.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .json()
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .init();
        }
    }

    // Load configuration
    let mut config = ManagerConfig::load(cli.config)?;

    // CLI overrides
    if let Some(models_dir) = cli.models_dir {
        config.models_dir = models_dir;
    }

    config.validate()?;

    tracing::debug!(
        models_dir = ?config.models_dir,
        settings_file = ?config.settings_file,
        catalog_file = ?config.catalog_file,
        "Configuration loaded"
    );

    let prometheus_handle = if cli.metrics {
        Some(metrics::setup_metrics()?)
    } else {
        None
    };

    match cli.command {
        Command::Fetch { response, out } => {
            let out = out.unwrap_or_else(|| config.outputs_dir.clone());
            fetch_outputs(&config, &response, &out).await?;
        }
        Command::Models => {
            let orchestrator = open_orchestrator(&config).await?;
            print_models(&orchestrator);
        }
        Command::Download {
            model_id,
            component,
            quant,
        } => {
            let orchestrator = open_orchestrator(&config).await?;
            download(&orchestrator, model_id, component, quant).await?;
        }
        Command::Select {
            model_id,
            component,
            quant,
        } => {
            let orchestrator = open_orchestrator(&config).await?;
            orchestrator
                .set_model_quant_selection(&model_id, component, &quant)
                .await?;
            print_models(&orchestrator);
        }
        Command::Activate { model_id } => {
            let orchestrator = open_orchestrator(&config).await?;
            orchestrator.set_active_model(&model_id).await?;
            if let Some(files) = orchestrator.snapshot().files_by_model_id.get(&model_id)
                && let Err(e) = files.ensure_ready()
            {
                tracing::warn!(model_id = %model_id, error = %e, "Active model is not ready");
            }
            print_models(&orchestrator);
        }
        Command::Remove {
            model_id,
            relative_path,
        } => {
            let orchestrator = open_orchestrator(&config).await?;
            orchestrator
                .remove_model_file(&model_id, &relative_path)
                .await?;
            print_models(&orchestrator);
        }
        Command::Reconcile => {
            let orchestrator = open_orchestrator(&config).await?;
            let report = orchestrator.reconcile_download_statuses().await?;
            println!(
                "corrected: {}, timed out cancels: {}",
                report.corrected.len(),
                report.timed_out_cancels.len()
            );
        }
    }

    if let Some(handle) = prometheus_handle {
        println!("{}", handle.render());
    }

    Ok(())
}

/// Build the orchestrator from configuration and hydrate it
async fn open_orchestrator(config: &ManagerConfig) -> Result<Arc<DownloadOrchestrator>> {
    let catalog = Arc::new(config.load_catalog()?);

    let client = reqwest::Client::builder()
        .connect_timeout(config.fetch_timeout())
        .build()
        .context("Failed to create HTTP client")?;

    let backend = LocalDownloadBackend::new(config.models_dir.clone(), catalog.clone(), client)
        .with_download_base_url(config.download_base_url.clone())
        .with_progress_interval(config.progress_interval())
        .with_error_preview_chars(config.error_preview_chars);

    let settings = FileSettingsStore::new(config.settings_file.clone());

    let orchestrator = Arc::new(DownloadOrchestrator::new(
        catalog,
        Arc::new(backend),
        Arc::new(settings),
        config.orchestrator_options(),
    ));
    orchestrator.hydrate().await?;

    Ok(orchestrator)
}

async fn download(
    orchestrator: &Arc<DownloadOrchestrator>,
    model_id: String,
    component: ComponentKind,
    quant: Option<String>,
) -> Result<()> {
    let snapshot = orchestrator.snapshot();
    let path = snapshot
        .catalog
        .model(&model_id)?
        .resolve_file(component, quant.as_deref(), &snapshot.settings.selection(&model_id))?
        .relative_path;

    let listener = orchestrator.spawn_progress_listener();
    let reporter = tokio::spawn(report_progress(
        orchestrator.subscribe_download_statuses(),
        path.clone(),
    ));

    let mut request = DownloadRequest::new(&model_id, component);
    if let Some(quant) = quant {
        request = request.with_quant(quant);
    }

    let download = orchestrator.download_model_file(request);
    tokio::pin!(download);

    let finished = tokio::select! {
        result = &mut download => Some(result),
        _ = shutdown_signal() => None,
    };
    let result = match finished {
        Some(result) => result,
        None => {
            tracing::info!(path = %path, "Canceling download");
            orchestrator.cancel_model_download(&path).await?;
            download.await
        }
    };

    listener.abort();
    reporter.abort();

    match result {
        Ok(()) => {
            print_models(orchestrator);
            Ok(())
        }
        Err(e) if e.is_canceled() => {
            println!("{} canceled", path);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

async fn report_progress(
    mut statuses: tokio::sync::watch::Receiver<asset_manager::orchestrator::StatusMap>,
    path: String,
) {
    let mut last_percent = None;
    while statuses.changed().await.is_ok() {
        let Some(event) = statuses.borrow_and_update().get(&path).cloned() else {
            continue;
        };
        if event.status != DownloadStatus::Downloading || event.total_bytes == 0 {
            continue;
        }
        let percent = event.downloaded_bytes * 100 / event.total_bytes;
        if last_percent != Some(percent) {
            tracing::info!(
                path = %path,
                downloaded = event.downloaded_bytes,
                total = event.total_bytes,
                "{}%",
                percent
            );
            last_percent = Some(percent);
        }
    }
}

fn print_models(orchestrator: &DownloadOrchestrator) {
    let snapshot = orchestrator.snapshot();
    for model in snapshot.catalog.models() {
        let active = snapshot.settings.active_model_id.as_deref() == Some(model.id.as_str());
        let selection = snapshot.settings.selection(&model.id);
        println!(
            "{}{} ({}) - {} - {:.1} GB",
            if active { "* " } else { "  " },
            model.id,
            model.name,
            if snapshot.is_ready(&model.id) {
                "ready"
            } else {
                "missing files"
            },
            model.selection_size_bytes(&selection) as f64 / 1e9
        );
        if let Some(files) = snapshot.files_by_model_id.get(&model.id) {
            for file in &files.files {
                let status = snapshot
                    .download_status_by_path
                    .get(&file.relative_path)
                    .map(|event| event.status.to_string())
                    .unwrap_or_default();
                println!(
                    "    [{}] {} {}",
                    if file.exists { "x" } else { " " },
                    file.relative_path,
                    status
                );
            }
        }
    }
}

async fn fetch_outputs(config: &ManagerConfig, response: &Path, out: &Path) -> Result<()> {
    let content = tokio::fs::read_to_string(response)
        .await
        .with_context(|| format!("Failed to read provider response: {:?}", response))?;
    let value: serde_json::Value =
        serde_json::from_str(&content).context("Provider response is not valid JSON")?;

    let artifacts = normalize::try_normalize_outputs(&value, config.max_normalize_depth)?;
    if artifacts.is_empty() {
        println!("no outputs found");
        return Ok(());
    }

    let fetcher = ArtifactFetcher::new(config.fetch_timeout(), config.error_preview_chars)?;
    let mut failed = 0;
    for outcome in fetcher.fetch_outputs(&artifacts, out).await {
        match outcome.result {
            Ok(path) => println!("{} -> {}", outcome.artifact.provider_path, path.display()),
            Err(e) => {
                failed += 1;
                tracing::error!(
                    url = %outcome.artifact.provider_path,
                    error = %e,
                    "Failed to fetch output"
                );
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{} of {} outputs failed", failed, artifacts.len());
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM signal");
        },
    }
}
