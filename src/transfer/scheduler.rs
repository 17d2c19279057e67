//! Upload Scheduler (§4.D) — keeps the upload pipe full without exceeding
//! the configured concurrency limit, retries transient part failures, and
//! preserves part-number ordering in the receipts handed to `complete`.

use crate::errors::TransferError;
use crate::metrics::Metrics;
use crate::storage::{ObjectStoreClient, PartReceipt};
use crate::transfer::part_buffer::FinishedPart;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Backpressure watermarks (§4.D) — fixed, independent of the configurable
/// hard concurrency bound `C`.
const HIGH_WATER: u32 = 3;
const LOW_WATER: u32 = 1;

/// Per-part retry budget at the Scheduler layer, on top of the
/// Object-Store Client's own SDK-level retries.
const MAX_ATTEMPTS: u32 = 3;

/// Cumulative observable backpressure state, exposed to metrics.
#[derive(Debug, Default)]
pub struct BackpressureStats {
    pub pause_events: AtomicU64,
    pub paused_millis_total: AtomicU64,
}

pub struct Scheduler {
    client: Arc<dyn ObjectStoreClient>,
    bucket: String,
    key: String,
    upload_id: String,
    semaphore: Arc<Semaphore>,
    in_flight: AtomicU32,
    paused: AtomicBool,
    notify: Notify,
    receipts: Mutex<Vec<PartReceipt>>,
    failure: Mutex<Option<TransferError>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    pub backpressure: BackpressureStats,
    metrics: Option<Arc<Metrics>>,
}

impl Scheduler {
    pub fn new(
        client: Arc<dyn ObjectStoreClient>,
        bucket: String,
        key: String,
        upload_id: String,
        concurrency: usize,
        metrics: Option<Arc<Metrics>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            bucket,
            key,
            upload_id,
            semaphore: Arc::new(Semaphore::new(concurrency)),
            in_flight: AtomicU32::new(0),
            paused: AtomicBool::new(false),
            notify: Notify::new(),
            receipts: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            backpressure: BackpressureStats::default(),
            metrics,
        })
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn failed(&self) -> bool {
        self.failure.lock().is_some()
    }

    /// Block the caller (the reader, via the Coordinator) until the
    /// in-flight count has dropped back to the low-water mark, if the
    /// high-water mark has been reached. Hysteresis: once paused, a return
    /// below the high-water mark alone is not enough — the low-water mark
    /// must be reached, so pauses don't flicker at the boundary.
    pub async fn wait_for_capacity(&self) {
        if self.in_flight.load(Ordering::Acquire) < HIGH_WATER && !self.paused.load(Ordering::Acquire) {
            return;
        }

        self.paused.store(true, Ordering::Release);
        let started = Instant::now();
        info!(in_flight = self.in_flight(), "reader paused on backpressure");

        loop {
            self.notify.notified().await;
            if self.in_flight.load(Ordering::Acquire) <= LOW_WATER {
                break;
            }
        }

        self.paused.store(false, Ordering::Release);
        let elapsed = started.elapsed();
        self.backpressure.pause_events.fetch_add(1, Ordering::Relaxed);
        self.backpressure
            .paused_millis_total
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.relay_paused_total.inc();
            metrics.relay_paused_seconds_total.add(elapsed.as_secs_f64());
        }
        info!(paused_for = ?elapsed, "reader resumed");
    }

    /// Dispatch a finished part for upload. Applies the hard concurrency
    /// bound via the semaphore; does nothing if the transfer has already
    /// failed (in-flight parts are left to finish, per §4.D).
    pub async fn dispatch(self: &Arc<Self>, part: FinishedPart) {
        if self.failed() {
            return;
        }

        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .expect("semaphore never closed while scheduler is alive");

        let now_in_flight = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        if let Some(metrics) = &self.metrics {
            metrics.relay_inflight_uploads.set(now_in_flight as f64);
        }

        let scheduler = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let result = scheduler.upload_with_retry(part).await;

            let now_in_flight = scheduler.in_flight.fetch_sub(1, Ordering::AcqRel) - 1;
            if let Some(metrics) = &scheduler.metrics {
                metrics.relay_inflight_uploads.set(now_in_flight as f64);
            }
            scheduler.notify.notify_waiters();
            drop(permit);

            match result {
                Ok(receipt) => scheduler.receipts.lock().push(receipt),
                Err(err) => {
                    let mut failure = scheduler.failure.lock();
                    if failure.is_none() {
                        *failure = Some(err);
                    }
                }
            }
        });

        self.tasks.lock().push(handle);
    }

    async fn upload_with_retry(&self, part: FinishedPart) -> Result<PartReceipt, TransferError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if attempt > 1 {
                let backoff = Duration::from_secs(2u64.pow(attempt - 1));
                tokio::time::sleep(backoff).await;
            }

            let result = self
                .client
                .upload_part(
                    &self.bucket,
                    &self.key,
                    &self.upload_id,
                    part.part_number,
                    part.bytes.clone(),
                )
                .await;

            match result {
                Ok(receipt) => return Ok(receipt),
                Err(err) if attempt < MAX_ATTEMPTS => {
                    if let Some(metrics) = &self.metrics {
                        metrics.relay_part_retries_total.inc();
                    }
                    warn!(
                        part_number = part.part_number,
                        attempt,
                        error = %err,
                        "part upload failed, retrying"
                    );
                }
                Err(err) => {
                    return Err(TransferError::S3Part {
                        phase: "upload_part",
                        status: err.to_string(),
                        part_number: part.part_number,
                        attempt,
                        retryable: false,
                    });
                }
            }
        }
    }

    /// Await every dispatched upload task, then return the receipts sorted
    /// ascending by part number, or the first recorded failure.
    pub async fn finish(self: Arc<Self>) -> Result<Vec<PartReceipt>, TransferError> {
        let handles = std::mem::take(&mut *self.tasks.lock());
        for handle in handles {
            let _ = handle.await;
        }

        if let Some(err) = self.failure.lock().take() {
            return Err(err);
        }

        let mut receipts = self.receipts.lock().clone();
        receipts.sort_by_key(|r| r.part_number);
        Ok(receipts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::PartReceipt;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;

    struct FlakyStore {
        fail_until_attempt: u32,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl ObjectStoreClient for FlakyStore {
        async fn validate_bucket(&self, _bucket: &str) -> Result<(), TransferError> {
            Ok(())
        }
        async fn initiate(&self, _bucket: &str, _key: &str) -> Result<String, TransferError> {
            Ok("upload-1".into())
        }
        async fn upload_part(
            &self,
            _bucket: &str,
            _key: &str,
            _upload_id: &str,
            part_number: u32,
            _bytes: Bytes,
        ) -> Result<PartReceipt, TransferError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) as u32 + 1;
            if attempt < self.fail_until_attempt {
                return Err(TransferError::S3Part {
                    phase: "upload_part",
                    status: "503".into(),
                    part_number,
                    attempt,
                    retryable: true,
                });
            }
            Ok(PartReceipt { part_number, etag: format!("etag-{part_number}") })
        }
        async fn complete(
            &self,
            _bucket: &str,
            _key: &str,
            _upload_id: &str,
            _receipts: Vec<PartReceipt>,
        ) -> Result<String, TransferError> {
            unimplemented!()
        }
        async fn abort(&self, _bucket: &str, _key: &str, _upload_id: &str) {}
    }

    fn part(n: u32) -> FinishedPart {
        FinishedPart { part_number: n, bytes: Bytes::from_static(b"data") }
    }

    #[tokio::test]
    async fn receipts_are_sorted_regardless_of_completion_order() {
        let client: Arc<dyn ObjectStoreClient> = Arc::new(FlakyStore {
            fail_until_attempt: 1,
            attempts: AtomicUsize::new(0),
        });
        let scheduler = Scheduler::new(client, "bucket".into(), "key".into(), "upload-1".into(), 10, None);

        for n in [3, 1, 2] {
            scheduler.dispatch(part(n)).await;
        }

        let receipts = scheduler.finish().await.unwrap();
        let numbers: Vec<u32> = receipts.iter().map(|r| r.part_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn retryable_failure_succeeds_within_budget() {
        let client: Arc<dyn ObjectStoreClient> = Arc::new(FlakyStore {
            fail_until_attempt: 3,
            attempts: AtomicUsize::new(0),
        });
        let scheduler = Scheduler::new(client, "bucket".into(), "key".into(), "upload-1".into(), 4, None);
        scheduler.dispatch(part(1)).await;
        let receipts = scheduler.finish().await.unwrap();
        assert_eq!(receipts.len(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_transfer() {
        let client: Arc<dyn ObjectStoreClient> = Arc::new(FlakyStore {
            fail_until_attempt: 99,
            attempts: AtomicUsize::new(0),
        });
        let scheduler = Scheduler::new(client, "bucket".into(), "key".into(), "upload-1".into(), 4, None);
        scheduler.dispatch(part(1)).await;
        let err = scheduler.finish().await.unwrap_err();
        assert_eq!(err.code(), "S3_PART");
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_configured_bound() {
        struct CountingStore {
            in_flight: Arc<AtomicU32>,
            max_seen: Arc<AtomicU32>,
        }

        #[async_trait]
        impl ObjectStoreClient for CountingStore {
            async fn validate_bucket(&self, _b: &str) -> Result<(), TransferError> {
                Ok(())
            }
            async fn initiate(&self, _b: &str, _k: &str) -> Result<String, TransferError> {
                Ok("upload-1".into())
            }
            async fn upload_part(
                &self,
                _b: &str,
                _k: &str,
                _u: &str,
                part_number: u32,
                _bytes: Bytes,
            ) -> Result<PartReceipt, TransferError> {
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(PartReceipt { part_number, etag: "e".into() })
            }
            async fn complete(
                &self,
                _b: &str,
                _k: &str,
                _u: &str,
                _r: Vec<PartReceipt>,
            ) -> Result<String, TransferError> {
                unimplemented!()
            }
            async fn abort(&self, _b: &str, _k: &str, _u: &str) {}
        }

        let max_seen = Arc::new(AtomicU32::new(0));
        let client: Arc<dyn ObjectStoreClient> = Arc::new(CountingStore {
            in_flight: Arc::new(AtomicU32::new(0)),
            max_seen: Arc::clone(&max_seen),
        });
        let scheduler = Scheduler::new(client, "bucket".into(), "key".into(), "upload-1".into(), 2, None);

        for n in 1..=8 {
            scheduler.dispatch(part(n)).await;
        }
        scheduler.finish().await.unwrap();

        assert!(max_seen.load(Ordering::SeqCst) <= 2);
    }
}
