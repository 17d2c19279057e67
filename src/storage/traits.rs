//! Object-Store Client façade (§4.B) — the typed multipart-upload contract
//! the Scheduler and Coordinator depend on. `S3ObjectStore` is the only
//! production implementation; tests substitute an in-memory fake.

use crate::errors::TransferError;
use async_trait::async_trait;
use bytes::Bytes;

pub const MIN_PART_NUMBER: u32 = 1;
pub const MAX_PART_NUMBER: u32 = 10_000;

/// `{partNumber, etag}` — emitted per successful part upload, retained
/// until the manifest is sorted and submitted to `complete` (§3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartReceipt {
    pub part_number: u32,
    pub etag: String,
}

/// Strict, typed façade over the destination's multipart-upload protocol.
/// Implementors own their own per-call timeout and SDK-level retry policy
/// (§4.B); callers never see those attempts, only the final classified
/// error.
#[async_trait]
pub trait ObjectStoreClient: Send + Sync {
    /// `Ok(())` iff the bucket is reachable and writable.
    async fn validate_bucket(&self, bucket: &str) -> Result<(), TransferError>;

    /// Begin a multipart upload, returning its `uploadId`.
    async fn initiate(&self, bucket: &str, key: &str) -> Result<String, TransferError>;

    /// Upload one part. `part_number` must be in `1..=10_000`; `bytes` must
    /// be `5 MiB..=5 GiB` except for the final part of a transfer, which
    /// may be smaller. Returns the destination's ETag for the part.
    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        bytes: Bytes,
    ) -> Result<PartReceipt, TransferError>;

    /// Complete the upload. `receipts` must already be sorted strictly
    /// ascending by `part_number` — this call rejects unsorted manifests
    /// as a permanent error; ordering is the caller's responsibility.
    async fn complete(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        receipts: Vec<PartReceipt>,
    ) -> Result<String, TransferError>;

    /// Idempotent cleanup. Never returns an error to the caller; failures
    /// are logged internally so a leaked multipart upload is observable
    /// without ever blocking the caller's own error path.
    async fn abort(&self, bucket: &str, key: &str, upload_id: &str);
}

/// Receipts must already be sorted; this only verifies the invariant the
/// Scheduler is responsible for upholding before calling `complete`.
pub fn assert_sorted_ascending(receipts: &[PartReceipt]) -> Result<(), TransferError> {
    for window in receipts.windows(2) {
        if window[0].part_number >= window[1].part_number {
            return Err(TransferError::S3Complete {
                phase: "complete",
                status: format!(
                    "receipts not strictly ascending at part {} -> {}",
                    window[0].part_number, window[1].part_number
                ),
                retryable: false,
            });
        }
    }
    Ok(())
}
