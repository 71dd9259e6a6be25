//! YouTube metadata snapshot harvester
//!
//! Single binary with two long-running modes:
//! - `harvest`: walk a work list of video locators in checkpointed batches,
//!   rotating API keys when their daily quota runs out
//! - `upload`: watch the results directory and push batch artifacts to a
//!   Hugging Face dataset repository in bulk commits
//!
//! Usage: `snapshot-harvester <harvest|upload> [--config PATH]`

mod config;
mod metrics;
mod status;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use harvest::{FetchClient, HaltReason, Scheduler};
use hub_upload::{HfHub, Uploader};
use key_pool::KeyPool;
use metadata_source::{MetadataSource, YouTubeSource};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::status::{AppState, HealthSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Harvest,
    Upload,
}

impl Mode {
    fn as_str(self) -> &'static str {
        match self {
            Mode::Harvest => "harvest",
            Mode::Upload => "upload",
        }
    }
}

/// Mode is the first argument; `--config PATH` may appear anywhere after it.
fn parse_args(args: &[String]) -> Result<(Mode, Option<&str>)> {
    let mode = match args.get(1).map(String::as_str) {
        Some("harvest") => Mode::Harvest,
        Some("upload") => Mode::Upload,
        Some(other) => anyhow::bail!("unknown mode {other:?}, expected harvest or upload"),
        None => anyhow::bail!("usage: snapshot-harvester <harvest|upload> [--config PATH]"),
    };
    let config_path = match args.iter().position(|a| a == "--config") {
        Some(i) => Some(
            args.get(i + 1)
                .map(String::as_str)
                .context("--config needs a path")?,
        ),
        None => None,
    };
    Ok((mode, config_path))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus = metrics::install_recorder();

    let args: Vec<String> = std::env::args().collect();
    let (mode, cli_config_path) = parse_args(&args)?;
    info!(mode = mode.as_str(), "starting snapshot-harvester");

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            cancel.cancel();
        }
    });

    match mode {
        Mode::Harvest => run_harvest(config, prometheus, cancel).await,
        Mode::Upload => run_upload(config, prometheus, cancel).await,
    }
}

async fn run_harvest(
    config: Config,
    prometheus: PrometheusHandle,
    cancel: CancellationToken,
) -> Result<()> {
    let keys = config.source.api_keys;
    if keys.is_empty() {
        anyhow::bail!("no API keys configured, set YOUTUBE_API_KEYS or source.api_keys_file");
    }

    info!(
        base_url = %config.source.base_url,
        keys = keys.len(),
        batch_size = config.harvest.batch_size,
        concurrency = config.harvest.concurrency,
        work_list = %config.harvest.work_list.display(),
        results_dir = %config.harvest.results_dir.display(),
        "configuration loaded"
    );

    let source: Arc<dyn MetadataSource> = Arc::new(YouTubeSource::new(
        reqwest::Client::new(),
        config.source.base_url.clone(),
        Duration::from_secs(config.source.timeout_secs),
    ));
    let pool = Arc::new(KeyPool::new(keys));
    let client = Arc::new(FetchClient::new(
        source,
        pool.clone(),
        config.harvest.fetch_config(),
    ));
    let scheduler = Scheduler::new(client, config.harvest.scheduler_config())
        .context("invalid harvest settings")?;

    let items = harvest::load_work_list(&config.harvest.work_list)
        .await
        .with_context(|| {
            format!(
                "failed to load work list from {}",
                config.harvest.work_list.display()
            )
        })?;

    let server = match config.status.listen_addr {
        Some(addr) => {
            let state = AppState {
                health: HealthSource::Harvest(pool.clone()),
                prometheus,
            };
            Some(status::serve(addr, state, cancel.clone()).await?)
        }
        None => None,
    };

    let result = scheduler.run(items, cancel.clone()).await;

    cancel.cancel();
    if let Some(server) = server {
        let _ = server.await;
    }

    let report = result.context("harvest run failed")?;
    match &report.halt {
        HaltReason::Storage(msg) => {
            error!(run_id = %report.run_id, error = %msg, "harvest stopped on a storage failure");
            anyhow::bail!("harvest stopped on a storage failure: {msg}");
        }
        HaltReason::PoolExhausted | HaltReason::RotationFailed => {
            warn!(
                run_id = %report.run_id,
                halt = %report.halt,
                successes = report.successes,
                "harvest stopped early, remaining items resume on the next run"
            );
        }
        HaltReason::Completed | HaltReason::Cancelled => {}
    }

    info!("shutdown complete");
    Ok(())
}

async fn run_upload(
    mut config: Config,
    prometheus: PrometheusHandle,
    cancel: CancellationToken,
) -> Result<()> {
    let target = config
        .upload
        .target()
        .context("upload.repo_id is required in upload mode")?;
    let token = config
        .upload
        .token
        .take()
        .context("no hub token configured, set HF_TOKEN or upload.token_file")?;

    info!(
        endpoint = %target.endpoint,
        repo_id = %target.repo_id,
        revision = %target.revision,
        results_dir = %config.upload.results_dir.display(),
        "configuration loaded"
    );

    let hub = Arc::new(HfHub::new(
        reqwest::Client::new(),
        target,
        token,
        Duration::from_secs(config.upload.timeout_secs),
    ));
    let mut uploader = Uploader::new(hub, config.upload.uploader_config())
        .await
        .context("failed to initialise uploader")?;

    let server = match config.status.listen_addr {
        Some(addr) => {
            let state = AppState {
                health: HealthSource::Upload(uploader.status()),
                prometheus,
            };
            Some(status::serve(addr, state, cancel.clone()).await?)
        }
        None => None,
    };

    uploader.run(cancel.clone()).await;

    if let Some(server) = server {
        let _ = server.await;
    }

    info!(
        pending = uploader.pending().len(),
        committed = uploader.committed().len(),
        "shutdown complete"
    );
    Ok(())
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
