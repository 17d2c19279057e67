//! Worker configuration: job input (§6.1) and tunables (§6.5) read from the
//! process environment, with CLI overrides layered on top in `main`.

use crate::errors::TransferError;
use crate::job::TransferJob;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tracing::warn;
use url::Url;

/// Upload Scheduler concurrency bounds (§4.D).
pub const MIN_CONCURRENCY: usize = 1;
pub const MAX_CONCURRENCY: usize = 20;
pub const DEFAULT_CONCURRENCY: usize = 10;

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_status_addr() -> SocketAddr {
    "127.0.0.1:9100".parse().unwrap()
}

fn default_progress_table() -> String {
    "transfer-progress".to_string()
}

/// Tunables that are not part of the job's own identity — concurrency,
/// destination region, and the progress-store keyspace name (§6.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    #[serde(default = "default_region")]
    pub region: String,

    #[serde(default)]
    pub max_concurrent_uploads: ConcurrencySetting,

    #[serde(default = "default_progress_table")]
    pub progress_table: String,

    #[serde(default = "default_status_addr")]
    pub status_addr: SocketAddr,
}

/// Newtype so `Default` encodes the documented fallback value directly.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConcurrencySetting(pub usize);

impl Default for ConcurrencySetting {
    fn default() -> Self {
        ConcurrencySetting(DEFAULT_CONCURRENCY)
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            region: default_region(),
            max_concurrent_uploads: ConcurrencySetting::default(),
            progress_table: default_progress_table(),
            status_addr: default_status_addr(),
        }
    }
}

/// Errors reading/parsing an optional TOML settings file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    #[error("failed to read config file {path}: {source}")]
    Io { path: String, source: std::io::Error },
    #[error("failed to parse config file {path}: {source}")]
    Parse { path: String, source: toml::de::Error },
}

impl WorkerSettings {
    /// Load tunables from a TOML file, falling back to built-in defaults for
    /// any field the file omits (every field has a `#[serde(default = ..)]`).
    /// Overridden in turn by environment variables and CLI flags in `main`.
    pub fn from_file(path: &str) -> Result<Self, ConfigFileError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigFileError::Io {
            path: path.to_string(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigFileError::Parse {
            path: path.to_string(),
            source,
        })
    }

    /// Load tunables from the environment. Invalid values fall back to the
    /// documented default with a warning log rather than failing the job —
    /// matching the "non-integer or out-of-range inputs fall back to the
    /// default with a warning log" rule in §4.D.
    pub fn from_env() -> Self {
        let mut settings = Self::default();

        if let Ok(raw) = std::env::var("MAX_CONCURRENT_UPLOADS") {
            match raw.trim().parse::<i64>() {
                Ok(n) if (MIN_CONCURRENCY as i64..=MAX_CONCURRENCY as i64).contains(&n) => {
                    settings.max_concurrent_uploads = ConcurrencySetting(n as usize);
                }
                _ => {
                    warn!(
                        value = %raw,
                        default = DEFAULT_CONCURRENCY,
                        "MAX_CONCURRENT_UPLOADS invalid or out of [1,20] range; using default"
                    );
                }
            }
        }

        if let Ok(region) = std::env::var("AWS_REGION").or_else(|_| std::env::var("REGION")) {
            if !region.trim().is_empty() {
                settings.region = region;
            }
        }

        if let Ok(table) = std::env::var("PROGRESS_TABLE_NAME") {
            if !table.trim().is_empty() {
                settings.progress_table = table;
            }
        }

        if let Ok(addr) = std::env::var("RELAY_STATUS_ADDR") {
            match addr.parse() {
                Ok(parsed) => settings.status_addr = parsed,
                Err(_) => warn!(value = %addr, "RELAY_STATUS_ADDR invalid; using default"),
            }
        }

        settings
    }
}

/// Read the per-invocation job input (§6.1, §6.5) from the process
/// environment.
pub fn job_from_env(region: &str) -> Result<TransferJob, TransferError> {
    let transfer_id = require_env("TRANSFER_ID")?;
    let source_url_raw = require_env("SOURCE_URL")?;
    let bucket = require_env("BUCKET")?;
    let key_prefix = std::env::var("KEY_PREFIX").ok();
    let explicit_key = std::env::var("OBJECT_KEY").ok();

    let source_url = Url::parse(&source_url_raw).map_err(|e| {
        TransferError::config(format!("SOURCE_URL is not a valid URL: {e}"))
    })?;

    let object_key = TransferJob::resolve_key(
        explicit_key.as_deref(),
        key_prefix.as_deref(),
        &source_url,
    )?;

    TransferJob::new(transfer_id, source_url, bucket, object_key, region.to_string())
}

fn require_env(name: &str) -> Result<String, TransferError> {
    std::env::var(name)
        .map_err(|_| TransferError::config(format!("missing required environment variable {name}")))
}
