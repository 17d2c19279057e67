//! Transfer error taxonomy.
//!
//! Each variant is classified once, at the boundary where it first surfaces
//! (reader, object-store client, part buffer, or scheduler), and carries a
//! `retryable` hint that is informational only — the core's own retry
//! policy is fixed per component, not driven by this flag.

use thiserror::Error;

/// A classified transfer failure.
#[derive(Debug, Clone, Error)]
pub enum TransferError {
    #[error("Source unreachable: {detail}")]
    UrlFetch { detail: String, retryable: bool },

    #[error("Destination bucket {bucket} not accessible")]
    S3Access {
        bucket: String,
        /// `true` when the destination classified this as bucket-missing
        /// (404/`NotFound`) rather than access-denied (403) — §4.B requires
        /// the two be distinguished even though the user-visible message is
        /// the same either way.
        missing: bool,
        retryable: bool,
    },

    #[error("Upload failed during {phase}: {status}")]
    S3Init { phase: &'static str, status: String, retryable: bool },

    #[error("Upload failed during {phase}: {status}")]
    S3Part {
        phase: &'static str,
        status: String,
        part_number: u32,
        attempt: u32,
        retryable: bool,
    },

    #[error("Upload failed during {phase}: {status}")]
    S3Complete { phase: &'static str, status: String, retryable: bool },

    #[error("Transfer interrupted at {transferred}/{total}")]
    Streaming {
        transferred: u64,
        total: i64,
        retryable: bool,
    },

    #[error("Configuration error: {detail}")]
    Config { detail: String },

    #[error("Source produced no bytes")]
    SourceEmpty,

    #[error("Internal error")]
    Internal { detail: String },
}

impl TransferError {
    /// Short machine-readable tag used in log fields (never shown to users).
    pub fn code(&self) -> &'static str {
        match self {
            TransferError::UrlFetch { .. } => "URL_FETCH",
            TransferError::S3Access { .. } => "S3_ACCESS",
            TransferError::S3Init { .. } => "S3_INIT",
            TransferError::S3Part { .. } => "S3_PART",
            TransferError::S3Complete { .. } => "S3_COMPLETE",
            TransferError::Streaming { .. } => "STREAMING",
            TransferError::Config { .. } => "CONFIG",
            TransferError::SourceEmpty => "SOURCE_EMPTY",
            TransferError::Internal { .. } => "INTERNAL",
        }
    }

    /// Whether this class of error is, in general, worth retrying. The core
    /// never consults this to drive its own fixed retry policy (§4.D, §7) —
    /// it exists purely as a classification hint for logs/metrics.
    pub fn retryable(&self) -> bool {
        match self {
            TransferError::UrlFetch { retryable, .. } => *retryable,
            TransferError::S3Access { retryable, .. } => *retryable,
            TransferError::S3Init { retryable, .. } => *retryable,
            TransferError::S3Part { retryable, .. } => *retryable,
            TransferError::S3Complete { retryable, .. } => *retryable,
            TransferError::Streaming { retryable, .. } => *retryable,
            TransferError::Config { .. } => false,
            TransferError::SourceEmpty => false,
            TransferError::Internal { .. } => false,
        }
    }

    /// For `S3Access`, whether the destination classified this as
    /// bucket-missing rather than access-denied (§4.B). `None` for every
    /// other variant.
    pub fn bucket_missing(&self) -> Option<bool> {
        match self {
            TransferError::S3Access { missing, .. } => Some(*missing),
            _ => None,
        }
    }

    /// User-visible message truncated to the 1000-character limit enforced
    /// on progress-store writes.
    pub fn truncated_message(&self) -> String {
        let msg = self.to_string();
        if msg.len() <= 1000 {
            msg
        } else {
            msg.chars().take(1000).collect()
        }
    }

    pub fn config(detail: impl Into<String>) -> Self {
        TransferError::Config { detail: detail.into() }
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        TransferError::Internal { detail: detail.into() }
    }
}

impl From<reqwest::Error> for TransferError {
    fn from(err: reqwest::Error) -> Self {
        TransferError::UrlFetch {
            detail: err.to_string(),
            retryable: err.is_timeout() || err.is_connect(),
        }
    }
}
