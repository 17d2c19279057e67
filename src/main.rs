//! Bulk file relay worker — streams one HTTPS source into an S3-compatible
//! bucket via multipart upload.

use clap::Parser;
use relay_worker::config::{self, WorkerSettings};
use relay_worker::job::TransferJob;
use relay_worker::metrics::{status_router, Metrics};
use relay_worker::source::SourceReader;
use relay_worker::storage::{S3Endpoint, S3ObjectStore};
use relay_worker::transfer::{InMemoryProgressStore, TransferCoordinator};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

fn version_long() -> &'static str {
    static V: std::sync::OnceLock<String> = std::sync::OnceLock::new();
    V.get_or_init(|| {
        format!("{} (built {})", env!("CARGO_PKG_VERSION"), env!("RELAY_BUILD_TIME"))
    })
}

/// Streams a single HTTPS artifact into an S3-compatible bucket.
#[derive(Parser, Debug)]
#[command(name = "relay_worker")]
#[command(version = version_long())]
#[command(author, about, long_about = None)]
struct Cli {
    /// Path to a TOML settings file (region, concurrency, progress table,
    /// status address); environment variables and CLI flags still override it
    #[arg(long)]
    config: Option<String>,

    /// Stable opaque transfer identifier (overrides TRANSFER_ID)
    #[arg(long)]
    transfer_id: Option<String>,

    /// Absolute HTTPS source URL (overrides SOURCE_URL)
    #[arg(long)]
    source_url: Option<String>,

    /// Destination bucket (overrides BUCKET)
    #[arg(long)]
    bucket: Option<String>,

    /// Destination key prefix (overrides KEY_PREFIX)
    #[arg(long)]
    key_prefix: Option<String>,

    /// Explicit destination object key (overrides OBJECT_KEY / key derivation)
    #[arg(long)]
    object_key: Option<String>,

    /// Destination region (overrides AWS_REGION / REGION)
    #[arg(long)]
    region: Option<String>,

    /// Upload Scheduler concurrency bound, clamped to [1, 20]
    #[arg(long)]
    max_concurrent_uploads: Option<usize>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("relay_worker=trace,tower_http=trace")
        } else {
            EnvFilter::new("relay_worker=info,tower_http=info")
        }
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(
        "relay_worker v{} (built {})",
        env!("CARGO_PKG_VERSION"),
        env!("RELAY_BUILD_TIME")
    );

    let mut settings = match &cli.config {
        Some(path) => match WorkerSettings::from_file(path) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, path, "failed to read --config file; falling back to environment");
                WorkerSettings::from_env()
            }
        },
        None => WorkerSettings::from_env(),
    };
    if let Some(region) = cli.region.clone() {
        settings.region = region;
    }
    if let Some(max) = cli.max_concurrent_uploads {
        settings.max_concurrent_uploads.0 = max.clamp(config::MIN_CONCURRENCY, config::MAX_CONCURRENCY);
    }

    let job = resolve_job(&cli, &settings.region)?;
    info!(transfer_id = %job.transfer_id, bucket = %job.bucket, key = %job.object_key, "job resolved");

    let metrics = Arc::new(Metrics::new());
    metrics.process_start_time_seconds.set(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64(),
    );

    let status_listener = TcpListener::bind(settings.status_addr).await?;
    info!(addr = %settings.status_addr, "status surface listening");
    let status_app = status_router(Arc::clone(&metrics));
    tokio::spawn(async move {
        if let Err(e) = axum::serve(status_listener, status_app).await {
            warn!(error = %e, "status server exited");
        }
    });

    let reader = SourceReader::new()?;
    let endpoint = s3_endpoint_from_env();
    let store = S3ObjectStore::new(&settings.region, endpoint).await?;
    let progress_store = Arc::new(InMemoryProgressStore::new());

    let coordinator = TransferCoordinator::with_metrics(
        reader,
        Arc::new(store),
        progress_store,
        Some(Arc::clone(&metrics)),
    );

    let cancel = CancellationToken::new();
    let run_cancel = cancel.clone();
    let mut handle = tokio::spawn(async move { coordinator.run(job, &settings, run_cancel).await });

    tokio::select! {
        joined = &mut handle => {
            return finish(joined?);
        }
        _ = shutdown_signal() => {
            warn!("shutdown signal received, cancelling in-flight transfer");
            cancel.cancel();
        }
    }

    let joined = handle.await?;
    finish(joined)
}

fn finish(result: Result<(), relay_worker::errors::TransferError>) -> Result<(), Box<dyn std::error::Error>> {
    match result {
        Ok(()) => {
            info!("transfer completed successfully");
            Ok(())
        }
        Err(e) => {
            warn!(code = e.code(), "transfer did not complete successfully");
            Err(Box::new(e) as Box<dyn std::error::Error>)
        }
    }
}

fn resolve_job(cli: &Cli, region: &str) -> Result<TransferJob, Box<dyn std::error::Error>> {
    let transfer_id = cli
        .transfer_id
        .clone()
        .or_else(|| std::env::var("TRANSFER_ID").ok())
        .ok_or("missing transfer id (--transfer-id or TRANSFER_ID)")?;

    let source_url_raw = cli
        .source_url
        .clone()
        .or_else(|| std::env::var("SOURCE_URL").ok())
        .ok_or("missing source url (--source-url or SOURCE_URL)")?;

    let bucket = cli
        .bucket
        .clone()
        .or_else(|| std::env::var("BUCKET").ok())
        .ok_or("missing bucket (--bucket or BUCKET)")?;

    let key_prefix = cli.key_prefix.clone().or_else(|| std::env::var("KEY_PREFIX").ok());
    let explicit_key = cli.object_key.clone().or_else(|| std::env::var("OBJECT_KEY").ok());

    let source_url = Url::parse(&source_url_raw)?;
    let object_key = TransferJob::resolve_key(explicit_key.as_deref(), key_prefix.as_deref(), &source_url)?;

    Ok(TransferJob::new(transfer_id, source_url, bucket, object_key, region.to_string())?)
}

fn s3_endpoint_from_env() -> S3Endpoint {
    S3Endpoint {
        endpoint_url: std::env::var("RELAY_S3_ENDPOINT").ok(),
        force_path_style: std::env::var("RELAY_S3_FORCE_PATH_STYLE")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false),
        access_key_id: std::env::var("RELAY_S3_ACCESS_KEY_ID").ok(),
        secret_access_key: std::env::var("RELAY_S3_SECRET_ACCESS_KEY").ok(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
