//! S3-compatible Object-Store Client (§4.B) backed by `aws-sdk-s3`.

use super::traits::{ObjectStoreClient, PartReceipt};
use crate::errors::TransferError;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::retry::RetryConfig;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::complete_multipart_upload::CompleteMultipartUploadError;
use aws_sdk_s3::operation::head_bucket::HeadBucketError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tracing::{debug, instrument, warn};

const PER_CALL_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
const SDK_MAX_ATTEMPTS: u32 = 5;

/// Optional overrides for pointing the client at a non-AWS endpoint, such
/// as a MinIO container used in integration tests.
#[derive(Debug, Clone, Default)]
pub struct S3Endpoint {
    pub endpoint_url: Option<String>,
    pub force_path_style: bool,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

pub struct S3ObjectStore {
    client: Client,
}

impl S3ObjectStore {
    pub async fn new(region: &str, endpoint: S3Endpoint) -> Result<Self, TransferError> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(region.to_string()))
            .retry_config(RetryConfig::standard().with_max_attempts(SDK_MAX_ATTEMPTS));

        if let Some(ref url) = endpoint.endpoint_url {
            loader = loader.endpoint_url(url);
        }

        if let (Some(ref key_id), Some(ref secret)) =
            (&endpoint.access_key_id, &endpoint.secret_access_key)
        {
            let credentials = Credentials::new(key_id, secret, None, None, "relay_worker-config");
            loader = loader.credentials_provider(credentials);
        }

        let sdk_config = loader.load().await;

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(endpoint.force_path_style)
            .build();

        Ok(Self {
            client: Client::from_conf(s3_config),
        })
    }

    async fn with_timeout<F, T>(&self, fut: F) -> Result<T, TransferError>
    where
        F: std::future::Future<Output = Result<T, TransferError>>,
    {
        match tokio::time::timeout(PER_CALL_TIMEOUT, fut).await {
            Ok(result) => result,
            Err(_) => Err(TransferError::S3Init {
                phase: "call",
                status: format!("exceeded {PER_CALL_TIMEOUT:?} per-call deadline"),
                retryable: true,
            }),
        }
    }
}

#[async_trait]
impl ObjectStoreClient for S3ObjectStore {
    #[instrument(skip(self))]
    async fn validate_bucket(&self, bucket: &str) -> Result<(), TransferError> {
        self.with_timeout(async {
            self.client
                .head_bucket()
                .bucket(bucket)
                .send()
                .await
                .map(|_| ())
                .map_err(|e| classify_head_bucket_error(bucket, e))
        })
        .await
    }

    #[instrument(skip(self))]
    async fn initiate(&self, bucket: &str, key: &str) -> Result<String, TransferError> {
        self.with_timeout(async {
            let output = self
                .client
                .create_multipart_upload()
                .bucket(bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| TransferError::S3Init {
                    phase: "initiate",
                    status: e.to_string(),
                    retryable: true,
                })?;

            output.upload_id().map(|id| id.to_string()).ok_or_else(|| {
                TransferError::S3Init {
                    phase: "initiate",
                    status: "destination returned no uploadId".to_string(),
                    retryable: false,
                }
            })
        })
        .await
    }

    #[instrument(skip(self, bytes))]
    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        bytes: Bytes,
    ) -> Result<PartReceipt, TransferError> {
        let len = bytes.len();
        self.with_timeout(async {
            let output = self
                .client
                .upload_part()
                .bucket(bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number as i32)
                .body(ByteStream::from(bytes))
                .send()
                .await
                .map_err(|e| TransferError::S3Part {
                    phase: "upload_part",
                    status: e.to_string(),
                    part_number,
                    attempt: 0,
                    retryable: true,
                })?;

            let etag = output.e_tag().map(|s| s.to_string()).ok_or_else(|| {
                TransferError::S3Part {
                    phase: "upload_part",
                    status: "destination returned no ETag".to_string(),
                    part_number,
                    attempt: 0,
                    retryable: false,
                }
            })?;

            debug!(part_number, bytes = len, "part uploaded");
            Ok(PartReceipt { part_number, etag })
        })
        .await
    }

    #[instrument(skip(self, receipts))]
    async fn complete(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        receipts: Vec<PartReceipt>,
    ) -> Result<String, TransferError> {
        super::traits::assert_sorted_ascending(&receipts)?;

        let completed_parts: Vec<CompletedPart> = receipts
            .into_iter()
            .map(|r| {
                CompletedPart::builder()
                    .part_number(r.part_number as i32)
                    .e_tag(r.etag)
                    .build()
            })
            .collect();

        self.with_timeout(async {
            let upload = CompletedMultipartUpload::builder()
                .set_parts(Some(completed_parts))
                .build();

            let output = self
                .client
                .complete_multipart_upload()
                .bucket(bucket)
                .key(key)
                .upload_id(upload_id)
                .multipart_upload(upload)
                .send()
                .await
                .map_err(|e| classify_complete_error(e))?;

            Ok(output
                .location()
                .map(|s| s.to_string())
                .unwrap_or_else(|| format!("s3://{bucket}/{key}")))
        })
        .await
    }

    #[instrument(skip(self))]
    async fn abort(&self, bucket: &str, key: &str, upload_id: &str) {
        let result = tokio::time::timeout(
            PER_CALL_TIMEOUT,
            self.client
                .abort_multipart_upload()
                .bucket(bucket)
                .key(key)
                .upload_id(upload_id)
                .send(),
        )
        .await;

        match result {
            Ok(Ok(_)) => debug!(upload_id, "multipart upload aborted"),
            Ok(Err(e)) => warn!(upload_id, error = %e, "abort_multipart_upload failed"),
            Err(_) => warn!(upload_id, "abort_multipart_upload timed out"),
        }
    }
}

/// Distinguishes bucket-missing (404) from access-denied (403), mirroring
/// the teacher's `if let SdkError::ServiceError(service_error) = &e { if
/// matches!(service_error.err(), GetObjectError::NoSuchKey(_)) { ... } }`
/// idiom for `get_object`/`NoSuchKey`. `HeadBucketError::NotFound` is the
/// modeled 404 shape; some S3-compatible destinations (MinIO) don't surface
/// a modeled error for a missing bucket, so the raw HTTP status is checked
/// as a fallback.
fn classify_head_bucket_error(bucket: &str, err: SdkError<HeadBucketError>) -> TransferError {
    let missing = if let SdkError::ServiceError(service_error) = &err {
        matches!(service_error.err(), HeadBucketError::NotFound(_))
            || service_error.raw().status().as_u16() == 404
    } else {
        false
    };

    let retryable = matches!(
        &err,
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_)
    );

    TransferError::S3Access {
        bucket: bucket.to_string(),
        missing,
        retryable,
    }
    .tap_log(&err)
}

fn classify_complete_error(err: SdkError<CompleteMultipartUploadError>) -> TransferError {
    TransferError::S3Complete {
        phase: "complete",
        status: err.to_string(),
        retryable: false,
    }
}

trait TapLog {
    fn tap_log(self, err: &impl std::fmt::Display) -> Self;
}

impl TapLog for TransferError {
    fn tap_log(self, err: &impl std::fmt::Display) -> Self {
        warn!(error = %err, code = self.code(), missing = ?self.bucket_missing(), "object-store call failed");
        self
    }
}
