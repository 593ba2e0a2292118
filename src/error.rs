use std::path::PathBuf;
use std::time::Duration;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum IngestError {
    #[error("invalid gene symbol: {0}")]
    InvalidGeneSymbol(String),

    #[error("invalid source name: {0}")]
    InvalidSource(String),

    #[error("unknown source: {0}")]
    UnknownSource(String),

    #[error("missing config file genevidence.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("request to {host} failed with status {status}: {message}")]
    FatalFetch {
        host: String,
        status: u16,
        message: String,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("circuit open for {host}; retry in {retry_in:?}")]
    #[diagnostic(help("the upstream failed repeatedly; wait for the cool-down or use another source"))]
    CircuitOpen { host: String, retry_in: Duration },

    #[error("{host} unavailable after {attempts} attempts: {message}")]
    #[diagnostic(help("the upstream may recover; resume the run later"))]
    SourceUnavailable {
        host: String,
        attempts: u32,
        message: String,
    },

    #[error("unexpected response from {source_name}: {message}")]
    MalformedResponse {
        source_name: String,
        message: String,
    },

    #[error("cannot map subject {subject} to a canonical gene: {reason}")]
    Normalization { subject: String, reason: String },

    #[error("cannot merge {incoming} facts into {existing} evidence")]
    MergeMismatch { existing: String, incoming: String },

    #[error("cache error: {0}")]
    Cache(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("ingestion worker for {0} panicked")]
    WorkerPanicked(String),
}

impl IngestError {
    /// Whether a later run of the same operation may succeed without changes.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IngestError::CircuitOpen { .. } | IngestError::SourceUnavailable { .. }
        )
    }

    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            IngestError::FatalFetch { .. }
                | IngestError::CircuitOpen { .. }
                | IngestError::SourceUnavailable { .. }
                | IngestError::MalformedResponse { .. }
        )
    }
}

impl From<serde_json::Error> for IngestError {
    fn from(err: serde_json::Error) -> Self {
        IngestError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for IngestError {
    fn from(err: std::io::Error) -> Self {
        IngestError::Filesystem(err.to_string())
    }
}
