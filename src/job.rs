//! `TransferJob` — the immutable input to the streaming transfer engine.
//!
//! A `TransferJob` is handed to the core exactly once by the (out-of-scope)
//! job-submission collaborator and is never mutated afterward.

use crate::errors::TransferError;
use regex::Regex;
use std::sync::OnceLock;
use url::Url;

/// Destination key characters allowed once a key has been constructed or
/// supplied directly (§6.1).
fn key_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9!_.*'()/-]+$").expect("valid regex"))
}

/// Immutable input to the transfer core.
#[derive(Debug, Clone)]
pub struct TransferJob {
    pub transfer_id: String,
    pub source_url: Url,
    pub bucket: String,
    pub object_key: String,
    pub region: String,
}

impl TransferJob {
    /// Build a job from its already-resolved parts, validating the
    /// destination key per §6.1.
    pub fn new(
        transfer_id: String,
        source_url: Url,
        bucket: String,
        object_key: String,
        region: String,
    ) -> Result<Self, TransferError> {
        validate_key(&object_key)?;
        Ok(Self {
            transfer_id,
            source_url,
            bucket,
            object_key,
            region,
        })
    }

    /// Resolve the final object key from an explicit key, or derive it from
    /// `key_prefix` + the source URL's filename per §6.1.
    pub fn resolve_key(explicit_key: Option<&str>, key_prefix: Option<&str>, source_url: &Url) -> Result<String, TransferError> {
        if let Some(key) = explicit_key {
            validate_key(key)?;
            return Ok(key.to_string());
        }

        let filename = filename_from_url(source_url);
        let key = match key_prefix {
            Some(prefix) if !prefix.trim().is_empty() => {
                // Strip exactly one leading and one trailing `/`, never more,
                // so a literal `//releases` or `releases//` isn't silently
                // collapsed beyond what §6.1 asks for.
                let prefix = prefix.trim();
                let prefix = prefix.strip_prefix('/').unwrap_or(prefix);
                let prefix = prefix.strip_suffix('/').unwrap_or(prefix);
                format!("{prefix}/{filename}")
            }
            _ => filename,
        };

        validate_key(&key)?;
        Ok(key)
    }
}

/// Derive the destination filename from the last path segment of the
/// source URL, URL-decoded, falling back to `download.bin` when empty.
fn filename_from_url(url: &Url) -> String {
    let last_segment = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .unwrap_or("");

    let decoded = urlencoding::decode(last_segment)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| last_segment.to_string());

    if decoded.is_empty() {
        "download.bin".to_string()
    } else {
        decoded
    }
}

fn validate_key(key: &str) -> Result<(), TransferError> {
    let len = key.len();
    if len == 0 || len > 1024 {
        return Err(TransferError::config(format!(
            "invalid key: length {len} outside 1..=1024 bytes"
        )));
    }
    if !key_pattern().is_match(key) {
        return Err(TransferError::config(format!(
            "invalid key: {key:?} contains disallowed characters"
        )));
    }
    Ok(())
}
