use crate::checkpoint::PageCursor;
use crate::domain::SourceName;
use crate::error::IngestError;
use crate::evidence::RawFact;

/// One page of canonical facts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub facts: Vec<RawFact>,
    pub next_cursor: Option<PageCursor>,
    pub done: bool,
    pub total_pages: Option<u32>,
}

/// Pagination and record mapping for a single external source.
///
/// Adapters only produce facts; they never touch the evidence store, and
/// fetch errors are returned unchanged.
pub trait SourceAdapter: Send + Sync {
    fn source(&self) -> SourceName;

    /// Everything that determines which records the source returns. A change
    /// invalidates stored checkpoints.
    fn query_fingerprint(&self) -> String;

    fn first_cursor(&self) -> PageCursor;

    fn next_page(&self, cursor: &PageCursor) -> Result<Page, IngestError>;
}

pub(crate) fn expect_page(source: &SourceName, cursor: &PageCursor) -> Result<u32, IngestError> {
    match cursor {
        PageCursor::Page(page) => Ok(*page),
        other => Err(IngestError::InvalidRequest(format!(
            "{source} expects a page cursor, got {other}"
        ))),
    }
}

pub(crate) fn expect_offset(source: &SourceName, cursor: &PageCursor) -> Result<u64, IngestError> {
    match cursor {
        PageCursor::Offset(offset) => Ok(*offset),
        other => Err(IngestError::InvalidRequest(format!(
            "{source} expects an offset cursor, got {other}"
        ))),
    }
}

pub(crate) fn malformed(source: &SourceName, message: impl Into<String>) -> IngestError {
    IngestError::MalformedResponse {
        source_name: source.to_string(),
        message: message.into(),
    }
}
