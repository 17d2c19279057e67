//! Shared harness for the end-to-end scenario tests (spec.md §8).
//!
//! `FakeObjectStore` stands in for the real `S3ObjectStore`: it is the
//! Object-Store Client trait's only non-MinIO implementation, letting the
//! end-to-end tests drive the real `Scheduler`/`PartBuffer`/`Coordinator`
//! without Docker. It reassembles completed parts in the order `complete`
//! receives them so a test can assert byte-for-byte (via MD5) fidelity.

use async_trait::async_trait;
use bytes::Bytes;
use md5::{Digest, Md5};
use parking_lot::Mutex;
use relay_worker::errors::TransferError;
use relay_worker::storage::{ObjectStoreClient, PartReceipt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

/// A part failure rule: fail `part_number` on attempts `1..fail_until`,
/// succeed from `fail_until` onward. `fail_until = u32::MAX` never succeeds.
#[derive(Clone, Copy)]
pub struct PartFailureRule {
    pub part_number: u32,
    pub fail_until_attempt: u32,
}

#[derive(Default)]
pub struct FakeObjectStore {
    parts: Mutex<HashMap<u32, Bytes>>,
    attempts: Mutex<HashMap<u32, u32>>,
    pub completed: Mutex<Option<Vec<PartReceipt>>>,
    pub aborted: AtomicUsize,
    failure_rules: Mutex<Vec<PartFailureRule>>,
    /// Extra per-part artificial latency, keyed by part number — used by
    /// the backpressure/permuted-completion scenarios.
    delays: Mutex<HashMap<u32, std::time::Duration>>,
    upload_counter: AtomicU32,
}

impl FakeObjectStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_failure(self: &Arc<Self>, rule: PartFailureRule) {
        self.failure_rules.lock().push(rule);
    }

    pub fn with_delay(self: &Arc<Self>, part_number: u32, delay: std::time::Duration) {
        self.delays.lock().insert(part_number, delay);
    }

    /// MD5 of the object assembled from the receipts passed to `complete`,
    /// in the order `complete` received them (already sorted ascending by
    /// the Scheduler before the call).
    pub fn assembled_md5(&self) -> Option<String> {
        let completed = self.completed.lock();
        let receipts = completed.as_ref()?;
        let parts = self.parts.lock();
        let mut hasher = Md5::new();
        for receipt in receipts {
            let bytes = parts.get(&receipt.part_number).expect("receipt references unknown part");
            hasher.update(bytes);
        }
        Some(hex::encode(hasher.finalize()))
    }

    pub fn assembled_len(&self) -> u64 {
        let completed = self.completed.lock();
        let Some(receipts) = completed.as_ref() else { return 0 };
        let parts = self.parts.lock();
        receipts
            .iter()
            .map(|r| parts.get(&r.part_number).map(|b| b.len() as u64).unwrap_or(0))
            .sum()
    }
}

#[async_trait]
impl ObjectStoreClient for FakeObjectStore {
    async fn validate_bucket(&self, _bucket: &str) -> Result<(), TransferError> {
        Ok(())
    }

    async fn initiate(&self, _bucket: &str, _key: &str) -> Result<String, TransferError> {
        let n = self.upload_counter.fetch_add(1, Ordering::SeqCst);
        Ok(format!("fake-upload-{n}"))
    }

    async fn upload_part(
        &self,
        _bucket: &str,
        _key: &str,
        _upload_id: &str,
        part_number: u32,
        bytes: Bytes,
    ) -> Result<PartReceipt, TransferError> {
        if let Some(delay) = self.delays.lock().get(&part_number).copied() {
            tokio::time::sleep(delay).await;
        }

        let attempt = {
            let mut attempts = self.attempts.lock();
            let entry = attempts.entry(part_number).or_insert(0);
            *entry += 1;
            *entry
        };

        let rule = self
            .failure_rules
            .lock()
            .iter()
            .find(|r| r.part_number == part_number)
            .copied();

        if let Some(rule) = rule {
            if attempt < rule.fail_until_attempt {
                return Err(TransferError::S3Part {
                    phase: "upload_part",
                    status: "503 simulated".into(),
                    part_number,
                    attempt,
                    retryable: true,
                });
            }
        }

        self.parts.lock().insert(part_number, bytes);
        Ok(PartReceipt { part_number, etag: format!("fake-etag-{part_number}") })
    }

    async fn complete(
        &self,
        bucket: &str,
        key: &str,
        _upload_id: &str,
        receipts: Vec<PartReceipt>,
    ) -> Result<String, TransferError> {
        relay_worker::storage::traits::assert_sorted_ascending(&receipts)?;
        *self.completed.lock() = Some(receipts);
        Ok(format!("s3://{bucket}/{key}"))
    }

    async fn abort(&self, _bucket: &str, _key: &str, _upload_id: &str) {
        self.aborted.fetch_add(1, Ordering::SeqCst);
    }
}

/// Serve `total` bytes of a deterministic pattern (`pattern[i % pattern.len()]`)
/// as a streamed GET/HEAD response so the Source Reader's chunked-read path
/// is exercised exactly as it would be against a real origin.
pub async fn pattern_source_server(total: usize, pattern: &[u8]) -> (MockServer, String) {
    let body: Vec<u8> = (0..total).map(|i| pattern[i % pattern.len()]).collect();
    let server = MockServer::start().await;

    Mock::given(method("HEAD"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-length", total.to_string())
                .insert_header("content-type", "application/octet-stream"),
        )
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/octet-stream")
                .set_body_bytes(body.clone()),
        )
        .mount(&server)
        .await;

    let md5 = {
        let mut hasher = Md5::new();
        hasher.update(&body);
        hex::encode(hasher.finalize())
    };

    (server, md5)
}
