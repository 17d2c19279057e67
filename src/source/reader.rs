//! HTTPS source reader: probes a URL for size/content-type, then opens a
//! streaming body with a read-idle deadline but no overall request deadline
//! (transfers routinely run for hours).

use crate::errors::TransferError;
use bytes::Bytes;
use futures::Stream;
use std::time::Duration;
use tokio_stream::StreamExt as _;
use url::Url;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
const READ_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_REDIRECTS: usize = 5;

/// Content types that a legitimate archive source is expected to report.
/// Anything else is a warning, never a hard failure (§4.A).
pub const ARCHIVE_MIME_ALLOWLIST: &[&str] = &[
    "application/zip",
    "application/x-zip-compressed",
    "application/x-zip",
    "application/octet-stream",
    "multipart/x-zip",
];

/// A content-type outside the archive MIME allowlist, surfaced for logging.
#[derive(Debug, Clone)]
pub struct ArchiveMimeWarning {
    pub content_type: String,
}

/// Result of probing the source URL before opening the stream.
#[derive(Debug, Clone, Default)]
pub struct SourceProbe {
    /// `-1` when the source did not report `Content-Length`.
    pub total_bytes: i64,
    pub content_type: Option<String>,
    pub mime_warning: Option<ArchiveMimeWarning>,
}

/// Opens and streams the body of an arbitrary HTTPS URL.
#[derive(Clone)]
pub struct SourceReader {
    client: reqwest::Client,
}

impl SourceReader {
    pub fn new() -> Result<Self, TransferError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()
            .map_err(|e| TransferError::internal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client })
    }

    /// Learn `Content-Length`/`Content-Type` without buffering the body.
    /// Falls back to a GET whose body is never read when HEAD is rejected
    /// or unsupported by the origin.
    pub async fn probe(&self, url: &Url) -> Result<SourceProbe, TransferError> {
        let head = self.client.head(url.clone()).send().await;

        let response = match head {
            Ok(resp) if resp.status().is_success() => resp,
            _ => {
                let resp = self.client.get(url.clone()).send().await?;
                if !resp.status().is_success() {
                    return Err(TransferError::UrlFetch {
                        detail: format!("HTTP {} probing source", resp.status()),
                        retryable: false,
                    });
                }
                resp
            }
        };

        let total_bytes = response
            .content_length()
            .map(|len| len as i64)
            .unwrap_or(-1);

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let mime_warning = content_type.as_ref().and_then(|ct| {
            let base = ct.split(';').next().unwrap_or(ct).trim();
            if ARCHIVE_MIME_ALLOWLIST.contains(&base) {
                None
            } else {
                Some(ArchiveMimeWarning {
                    content_type: ct.clone(),
                })
            }
        });

        Ok(SourceProbe {
            total_bytes,
            content_type,
            mime_warning,
        })
    }

    /// Begin streaming the body. Never buffers the whole response; each
    /// chunk is bounded by the read-idle deadline, not an overall timeout.
    pub async fn open(
        &self,
        url: &Url,
    ) -> Result<impl Stream<Item = Result<Bytes, TransferError>>, TransferError> {
        let response = self.client.get(url.clone()).send().await?;

        if !response.status().is_success() {
            return Err(TransferError::UrlFetch {
                detail: format!("HTTP {} opening source", response.status()),
                retryable: false,
            });
        }

        let byte_stream = response.bytes_stream().map(|item| item.map_err(TransferError::from));

        let timed = byte_stream.timeout(READ_IDLE_TIMEOUT).map(|item| match item {
            Ok(inner) => inner,
            Err(_elapsed) => Err(TransferError::UrlFetch {
                detail: format!("read-idle deadline of {READ_IDLE_TIMEOUT:?} exceeded"),
                retryable: true,
            }),
        });

        Ok(timed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowlisted_mime_produces_no_warning() {
        let ct = Some("application/zip".to_string());
        let warning = ct.as_ref().and_then(|ct| {
            let base = ct.split(';').next().unwrap_or(ct).trim();
            if ARCHIVE_MIME_ALLOWLIST.contains(&base) {
                None
            } else {
                Some(ArchiveMimeWarning { content_type: ct.clone() })
            }
        });
        assert!(warning.is_none());
    }

    #[test]
    fn unlisted_mime_produces_warning() {
        let ct = Some("text/html; charset=utf-8".to_string());
        let warning = ct.as_ref().and_then(|ct| {
            let base = ct.split(';').next().unwrap_or(ct).trim();
            if ARCHIVE_MIME_ALLOWLIST.contains(&base) {
                None
            } else {
                Some(ArchiveMimeWarning { content_type: ct.clone() })
            }
        });
        assert!(warning.is_some());
    }

}
