use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::hash_key;
use crate::domain::{IngestionMode, RunStatus, SourceName};

/// Position in a source's pagination scheme.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PageCursor {
    Page(u32),
    Offset(u64),
    Token(String),
}

impl fmt::Display for PageCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageCursor::Page(page) => write!(f, "page {page}"),
            PageCursor::Offset(offset) => write!(f, "offset {offset}"),
            PageCursor::Token(token) => write!(f, "token {token}"),
        }
    }
}

/// Durable ingestion progress for one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub source: SourceName,
    pub mode: IngestionMode,
    pub query_hash: String,
    /// Next page to fetch; `None` once the source reported it was done.
    pub cursor: Option<PageCursor>,
    pub pages_completed: u32,
    pub items_processed: u64,
    #[serde(default)]
    pub total_pages: Option<u32>,
    pub status: RunStatus,
    #[serde(default)]
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn start(
        source: SourceName,
        mode: IngestionMode,
        query_hash: String,
        cursor: PageCursor,
    ) -> Self {
        Self {
            source,
            mode,
            query_hash,
            cursor: Some(cursor),
            pages_completed: 0,
            items_processed: 0,
            total_pages: None,
            status: RunStatus::Running,
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.cursor.is_none() || self.status == RunStatus::Completed
    }
}

pub fn query_hash(fingerprint: &str) -> String {
    hash_key(fingerprint)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    NoCheckpoint,
    QueryChanged,
    ModeChanged,
    PreviousRunFinished,
}

impl fmt::Display for RestartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RestartReason::NoCheckpoint => "no checkpoint",
            RestartReason::QueryChanged => "query changed",
            RestartReason::ModeChanged => "mode changed",
            RestartReason::PreviousRunFinished => "previous run finished",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResumeDecision {
    Resume(Checkpoint),
    Restart(RestartReason),
}

/// Decides whether a stored checkpoint may be resumed. Anything incompatible
/// with the requested run restarts from the first page.
pub fn decide_resume(
    stored: Option<&Checkpoint>,
    mode: IngestionMode,
    query_hash: &str,
) -> ResumeDecision {
    let Some(checkpoint) = stored else {
        return ResumeDecision::Restart(RestartReason::NoCheckpoint);
    };
    if checkpoint.query_hash != query_hash {
        return ResumeDecision::Restart(RestartReason::QueryChanged);
    }
    if checkpoint.mode != mode {
        return ResumeDecision::Restart(RestartReason::ModeChanged);
    }
    if checkpoint.is_finished() {
        return ResumeDecision::Restart(RestartReason::PreviousRunFinished);
    }
    ResumeDecision::Resume(checkpoint.clone())
}
