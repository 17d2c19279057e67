//! Progress Publisher (§4.E) — throttles byte-counter updates into coarse
//! writes against an external progress store, and the `TransferProgress`
//! record (§3) it writes.

use crate::metrics::Metrics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

const BYTE_THRESHOLD: u64 = 100 * 1024 * 1024;

/// Terminal and non-terminal transfer states (§3). No transition leaves a
/// terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransferStatus {
    Pending,
    Starting,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Failed | TransferStatus::Cancelled
        )
    }
}

/// The externally observable record for one transfer (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferProgress {
    pub transfer_id: String,
    pub bytes_transferred: u64,
    /// `-1` when unknown, matching the reader's `totalBytes` convention.
    pub total_bytes: i64,
    pub percentage: u8,
    pub status: TransferStatus,
    pub start_time: DateTime<Utc>,
    pub last_update_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub s3_location: Option<String>,
}

impl TransferProgress {
    pub fn pending(transfer_id: String, now: DateTime<Utc>) -> Self {
        Self {
            transfer_id,
            bytes_transferred: 0,
            total_bytes: -1,
            percentage: 0,
            status: TransferStatus::Pending,
            start_time: now,
            last_update_time: now,
            end_time: None,
            error: None,
            s3_location: None,
        }
    }
}

/// Key-value record store keyed by `transferId`, updated with throttled
/// writes. The production implementation lives outside this core (§1); an
/// in-memory store is provided for tests and as a per-invocation default.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn put(&self, progress: TransferProgress);
    async fn get(&self, transfer_id: &str) -> Option<TransferProgress>;
}

/// A short-lived, per-invocation progress record — not a process-wide
/// singleton. Grounded on the multipart-upload registry's in-memory table
/// shape, reused here for a different key space.
#[derive(Default)]
pub struct InMemoryProgressStore {
    records: RwLock<HashMap<String, TransferProgress>>,
}

impl InMemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProgressStore for InMemoryProgressStore {
    async fn put(&self, progress: TransferProgress) {
        self.records.write().insert(progress.transfer_id.clone(), progress);
    }

    async fn get(&self, transfer_id: &str) -> Option<TransferProgress> {
        self.records.read().get(transfer_id).cloned()
    }
}

struct ThrottleState {
    last_bytes: u64,
    last_pct: u8,
    /// The last `total_bytes` written by `initialize`/`publish`, `-1` when
    /// never learned. `fail`/`cancel` read this instead of hard-coding `-1`
    /// so a terminal write never discards a previously-surfaced size — only
    /// `initialize` and the completion write may change `total_bytes` (§4.E).
    last_total_bytes: i64,
}

/// Translates fine-grained byte-counter updates into coarse external
/// writes. One `Publisher` per transfer.
pub struct Publisher {
    store: Arc<dyn ProgressStore>,
    transfer_id: String,
    start_time: DateTime<Utc>,
    throttle: Mutex<ThrottleState>,
    metrics: Option<Arc<Metrics>>,
}

impl Publisher {
    pub fn new(store: Arc<dyn ProgressStore>, transfer_id: String, start_time: DateTime<Utc>) -> Self {
        Self::with_metrics(store, transfer_id, start_time, None)
    }

    pub fn with_metrics(
        store: Arc<dyn ProgressStore>,
        transfer_id: String,
        start_time: DateTime<Utc>,
        metrics: Option<Arc<Metrics>>,
    ) -> Self {
        Self {
            store,
            transfer_id,
            start_time,
            throttle: Mutex::new(ThrottleState { last_bytes: 0, last_pct: 0, last_total_bytes: -1 }),
            metrics,
        }
    }

    /// Write `totalBytes` exactly once, as early as it is known. Bypasses
    /// throttling so observers see the real size immediately.
    pub async fn initialize(&self, total_bytes: i64, now: DateTime<Utc>) {
        self.throttle.lock().last_total_bytes = total_bytes;
        let progress = TransferProgress {
            transfer_id: self.transfer_id.clone(),
            bytes_transferred: 0,
            total_bytes,
            percentage: 0,
            status: TransferStatus::Starting,
            start_time: self.start_time,
            last_update_time: now,
            end_time: None,
            error: None,
            s3_location: None,
        };
        self.store.put(progress).await;
        self.count_write();
        debug!(transfer_id = %self.transfer_id, total_bytes, "progress initialized");
    }

    /// Issue a throttled write: at most once per 1% or per 100 MiB of
    /// progress. The percentage is computed only after the cheaper
    /// byte-delta check has already failed to trip the threshold, since
    /// this runs on the fast path for every reader chunk.
    pub async fn publish(&self, bytes_transferred: u64, total_bytes: i64, now: DateTime<Utc>) {
        let mut throttle = self.throttle.lock();

        let byte_delta_tripped = bytes_transferred.saturating_sub(throttle.last_bytes) >= BYTE_THRESHOLD;

        let (percentage, pct_tripped) = if total_bytes > 0 {
            let pct = ((bytes_transferred as u128 * 100) / total_bytes as u128).min(100) as u8;
            (pct, pct.saturating_sub(throttle.last_pct) >= 1)
        } else {
            (0, false)
        };

        if !byte_delta_tripped && !pct_tripped {
            return;
        }

        throttle.last_bytes = bytes_transferred;
        throttle.last_pct = percentage;
        // Never overwrite a previously positive total with 0: when the
        // caller hasn't learned a size, the last known value is kept instead.
        let resolved_total = if total_bytes > 0 { total_bytes } else { throttle.last_total_bytes };
        throttle.last_total_bytes = resolved_total;
        drop(throttle);

        let progress = TransferProgress {
            transfer_id: self.transfer_id.clone(),
            bytes_transferred,
            total_bytes: resolved_total,
            percentage,
            status: TransferStatus::InProgress,
            start_time: self.start_time,
            last_update_time: now,
            end_time: None,
            error: None,
            s3_location: None,
        };
        self.store.put(progress).await;
        self.count_write();
    }

    pub async fn complete(&self, total_bytes: i64, location: String, now: DateTime<Utc>) {
        let bytes_transferred = if total_bytes > 0 { total_bytes as u64 } else {
            self.throttle.lock().last_bytes
        };
        let progress = TransferProgress {
            transfer_id: self.transfer_id.clone(),
            bytes_transferred,
            total_bytes,
            percentage: 100,
            status: TransferStatus::Completed,
            start_time: self.start_time,
            last_update_time: now,
            end_time: Some(now),
            error: None,
            s3_location: Some(location),
        };
        self.store.put(progress).await;
        self.count_write();
        info!(transfer_id = %self.transfer_id, "transfer completed");
    }

    pub async fn fail(&self, error_message: String, now: DateTime<Utc>) {
        let truncated: String = error_message.chars().take(1000).collect();
        let last = self.throttle.lock();
        let progress = TransferProgress {
            transfer_id: self.transfer_id.clone(),
            bytes_transferred: last.last_bytes,
            total_bytes: last.last_total_bytes,
            percentage: last.last_pct,
            status: TransferStatus::Failed,
            start_time: self.start_time,
            last_update_time: now,
            end_time: Some(now),
            error: Some(truncated),
            s3_location: None,
        };
        drop(last);
        self.store.put(progress).await;
        self.count_write();
        info!(transfer_id = %self.transfer_id, "transfer failed");
    }

    pub async fn cancel(&self, now: DateTime<Utc>) {
        if let Some(existing) = self.store.get(&self.transfer_id).await {
            if existing.status.is_terminal() {
                return;
            }
        }
        let last = self.throttle.lock();
        let progress = TransferProgress {
            transfer_id: self.transfer_id.clone(),
            bytes_transferred: last.last_bytes,
            total_bytes: last.last_total_bytes,
            percentage: last.last_pct,
            status: TransferStatus::Cancelled,
            start_time: self.start_time,
            last_update_time: now,
            end_time: Some(now),
            error: None,
            s3_location: None,
        };
        drop(last);
        self.store.put(progress).await;
        self.count_write();
        info!(transfer_id = %self.transfer_id, "transfer cancelled");
    }

    fn count_write(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.relay_progress_writes_total.inc();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&Utc)
    }

    #[tokio::test]
    async fn publish_below_thresholds_is_suppressed() {
        let store = Arc::new(InMemoryProgressStore::new());
        let publisher = Publisher::new(store.clone(), "t1".into(), now());
        publisher.initialize(1_000_000_000, now()).await;
        publisher.publish(1024, 1_000_000_000, now()).await;

        let record = store.get("t1").await.unwrap();
        // initialize's write is the only one so far; the tiny publish
        // never crossed the 1% or 100 MiB threshold.
        assert_eq!(record.bytes_transferred, 0);
        assert_eq!(record.total_bytes, 1_000_000_000);
    }

    #[tokio::test]
    async fn publish_past_byte_threshold_writes() {
        let store = Arc::new(InMemoryProgressStore::new());
        let publisher = Publisher::new(store.clone(), "t1".into(), now());
        publisher.initialize(-1, now()).await;
        publisher.publish(100 * 1024 * 1024 + 1, -1, now()).await;

        let record = store.get("t1").await.unwrap();
        assert_eq!(record.bytes_transferred, 100 * 1024 * 1024 + 1);
    }

    #[tokio::test]
    async fn complete_never_overwrites_total_with_zero() {
        let store = Arc::new(InMemoryProgressStore::new());
        let publisher = Publisher::new(store.clone(), "t1".into(), now());
        publisher.initialize(500, now()).await;
        publisher.complete(500, "s3://bucket/key".into(), now()).await;

        let record = store.get("t1").await.unwrap();
        assert_eq!(record.total_bytes, 500);
        assert_eq!(record.percentage, 100);
        assert_eq!(record.status, TransferStatus::Completed);
    }

    #[tokio::test]
    async fn fail_truncates_error_message() {
        let store = Arc::new(InMemoryProgressStore::new());
        let publisher = Publisher::new(store.clone(), "t1".into(), now());
        let huge = "x".repeat(2000);
        publisher.fail(huge, now()).await;

        let record = store.get("t1").await.unwrap();
        assert_eq!(record.error.unwrap().len(), 1000);
        assert_eq!(record.status, TransferStatus::Failed);
    }

    #[tokio::test]
    async fn cancel_is_idempotent_after_terminal_state() {
        let store = Arc::new(InMemoryProgressStore::new());
        let publisher = Publisher::new(store.clone(), "t1".into(), now());
        publisher.complete(100, "loc".into(), now()).await;
        publisher.cancel(now()).await;

        let record = store.get("t1").await.unwrap();
        assert_eq!(record.status, TransferStatus::Completed);
    }

    #[tokio::test]
    async fn fail_preserves_last_known_total_bytes() {
        let store = Arc::new(InMemoryProgressStore::new());
        let publisher = Publisher::new(store.clone(), "t1".into(), now());
        publisher.initialize(2_000, now()).await;
        publisher.fail("source unreachable".into(), now()).await;

        let record = store.get("t1").await.unwrap();
        assert_eq!(record.total_bytes, 2_000);
        assert_eq!(record.status, TransferStatus::Failed);
    }

    #[tokio::test]
    async fn fail_before_total_bytes_known_reports_unknown() {
        let store = Arc::new(InMemoryProgressStore::new());
        let publisher = Publisher::new(store.clone(), "t1".into(), now());
        publisher.fail("source unreachable".into(), now()).await;

        let record = store.get("t1").await.unwrap();
        assert_eq!(record.total_bytes, -1);
    }

    #[tokio::test]
    async fn cancel_preserves_last_known_total_bytes() {
        let store = Arc::new(InMemoryProgressStore::new());
        let publisher = Publisher::new(store.clone(), "t1".into(), now());
        publisher.initialize(4_096, now()).await;
        publisher.publish(100 * 1024 * 1024 + 1, 4_096, now()).await;
        publisher.cancel(now()).await;

        let record = store.get("t1").await.unwrap();
        assert_eq!(record.total_bytes, 4_096);
        assert_eq!(record.status, TransferStatus::Cancelled);
    }
}
