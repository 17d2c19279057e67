//! Source Reader (§4.A) — opens an HTTPS byte stream for the source URL.

mod reader;

pub use reader::{ArchiveMimeWarning, SourceProbe, SourceReader, ARCHIVE_MIME_ALLOWLIST};
