//! Transfer Coordinator (§4.F) — wires the Source Reader, Part Buffer,
//! Upload Scheduler, Object-Store Client and Progress Publisher together,
//! running the eight-step choreography and guaranteeing cleanup on every
//! failure path.

use crate::config::WorkerSettings;
use crate::errors::TransferError;
use crate::job::TransferJob;
use crate::metrics::Metrics;
use crate::source::SourceReader;
use crate::storage::ObjectStoreClient;
use crate::transfer::part_buffer::{self, PartBuffer};
use crate::transfer::progress::{Publisher, ProgressStore};
use crate::transfer::scheduler::Scheduler;
use chrono::Utc;
use futures::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Why the streaming pipeline stopped before reaching `complete`.
enum StreamOutcome {
    Failed(TransferError),
    Cancelled,
}

pub struct TransferCoordinator {
    reader: SourceReader,
    store: Arc<dyn ObjectStoreClient>,
    progress_store: Arc<dyn ProgressStore>,
    metrics: Option<Arc<Metrics>>,
}

impl TransferCoordinator {
    pub fn new(
        reader: SourceReader,
        store: Arc<dyn ObjectStoreClient>,
        progress_store: Arc<dyn ProgressStore>,
    ) -> Self {
        Self::with_metrics(reader, store, progress_store, None)
    }

    pub fn with_metrics(
        reader: SourceReader,
        store: Arc<dyn ObjectStoreClient>,
        progress_store: Arc<dyn ProgressStore>,
        metrics: Option<Arc<Metrics>>,
    ) -> Self {
        Self { reader, store, progress_store, metrics }
    }

    /// Run one transfer to completion, failure, or cancellation. Guarantees
    /// that a multipart upload opened at step 5 is always aborted if any
    /// later step fails or is cancelled, and that the progress store
    /// always receives exactly one terminal write.
    pub async fn run(
        &self,
        job: TransferJob,
        settings: &WorkerSettings,
        cancel: CancellationToken,
    ) -> Result<(), TransferError> {
        let publisher = Publisher::with_metrics(
            Arc::clone(&self.progress_store),
            job.transfer_id.clone(),
            Utc::now(),
            self.metrics.clone(),
        );

        match self.run_inner(&job, settings, &publisher, &cancel).await {
            Ok(()) => Ok(()),
            Err((outcome, upload_id)) => {
                if let Some(upload_id) = upload_id {
                    self.store.abort(&job.bucket, &job.object_key, &upload_id).await;
                }
                match outcome {
                    StreamOutcome::Failed(err) => {
                        publisher.fail(err.truncated_message(), Utc::now()).await;
                        warn!(transfer_id = %job.transfer_id, code = err.code(), "transfer failed");
                        Err(err)
                    }
                    StreamOutcome::Cancelled => {
                        publisher.cancel(Utc::now()).await;
                        info!(transfer_id = %job.transfer_id, "transfer cancelled");
                        Err(TransferError::internal("transfer cancelled"))
                    }
                }
            }
        }
    }

    /// Steps 1–7. Failures carry the `uploadId` once it exists (step 5
    /// onward) so the caller can always run step 8's abort.
    async fn run_inner(
        &self,
        job: &TransferJob,
        settings: &WorkerSettings,
        publisher: &Publisher,
        cancel: &CancellationToken,
    ) -> Result<(), (StreamOutcome, Option<String>)> {
        // 1. validateBucket; fail fast.
        self.store
            .validate_bucket(&job.bucket)
            .await
            .map_err(|e| (StreamOutcome::Failed(e), None))?;

        // 2. probe; log content-type warnings; capture totalBytes.
        let probe = self
            .reader
            .probe(&job.source_url)
            .await
            .map_err(|e| (StreamOutcome::Failed(e), None))?;
        if let Some(warning) = &probe.mime_warning {
            warn!(
                transfer_id = %job.transfer_id,
                content_type = %warning.content_type,
                "source content-type outside archive allowlist"
            );
        }

        // 3. initialize publishes totalBytes as soon as it is known.
        if probe.total_bytes > 0 {
            publisher.initialize(probe.total_bytes, Utc::now()).await;
        }

        // 4. choose partSize.
        let part_size = part_buffer::part_size(probe.total_bytes)
            .map_err(|e| (StreamOutcome::Failed(e), None))?;

        // 5. initiate; capture uploadId.
        let upload_id = self
            .store
            .initiate(&job.bucket, &job.object_key)
            .await
            .map_err(|e| (StreamOutcome::Failed(e), None))?;

        info!(transfer_id = %job.transfer_id, upload_id = %upload_id, part_size, "multipart upload initiated");

        // 6-7. drive the pipeline, then complete.
        match self
            .drive_stream(job, settings, &upload_id, probe.total_bytes, part_size, publisher, cancel)
            .await
        {
            Ok(location) => {
                publisher.complete(probe.total_bytes, location, Utc::now()).await;
                Ok(())
            }
            Err(outcome) => Err((outcome, Some(upload_id))),
        }
    }

    /// Step 6: Source Reader → Part Buffer → Upload Scheduler, with
    /// backpressure applied to the reader. Step 7: sort receipts and
    /// complete the upload.
    #[allow(clippy::too_many_arguments)]
    async fn drive_stream(
        &self,
        job: &TransferJob,
        settings: &WorkerSettings,
        upload_id: &str,
        total_bytes: i64,
        part_size: u64,
        publisher: &Publisher,
        cancel: &CancellationToken,
    ) -> Result<String, StreamOutcome> {
        let stream = self
            .reader
            .open(&job.source_url)
            .await
            .map_err(StreamOutcome::Failed)?;
        tokio::pin!(stream);

        let scheduler = Scheduler::new(
            Arc::clone(&self.store),
            job.bucket.clone(),
            job.object_key.clone(),
            upload_id.to_string(),
            settings.max_concurrent_uploads.0,
            self.metrics.clone(),
        );

        let mut buffer = PartBuffer::new(part_size);
        let mut cancelled = false;

        while let Some(chunk) = stream.next().await {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let chunk = chunk.map_err(StreamOutcome::Failed)?;
            if let Some(metrics) = &self.metrics {
                metrics.relay_bytes_transferred_total.inc_by(chunk.len() as u64);
            }
            let finished_parts = buffer.ingest(&chunk);

            for part in finished_parts {
                if scheduler.failed() {
                    break;
                }
                scheduler.wait_for_capacity().await;
                scheduler.dispatch(part).await;
            }

            publisher.publish(buffer.bytes_transferred(), total_bytes, Utc::now()).await;

            if scheduler.failed() {
                break;
            }
        }

        if cancelled {
            // No new parts dispatched; in-flight uploads are left to finish
            // or fail on their own per-call deadline (§5).
            let _ = scheduler.finish().await;
            return Err(StreamOutcome::Cancelled);
        }

        if let Some(tail) = buffer.finish().map_err(StreamOutcome::Failed)? {
            if !scheduler.failed() {
                scheduler.wait_for_capacity().await;
                scheduler.dispatch(tail).await;
            }
        }

        let receipts = scheduler.finish().await.map_err(StreamOutcome::Failed)?;
        self.store
            .complete(&job.bucket, &job.object_key, upload_id, receipts)
            .await
            .map_err(StreamOutcome::Failed)
    }
}
