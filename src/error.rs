use crate::partition::IdRange;
use std::time::Duration;
use thiserror::Error;

/// Failure of a single call to the remote API.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("unexpected HTTP status {0}")]
    Status(u16),
    #[error("rate limited by the remote API")]
    RateLimited,
    #[error("API error {code}: {info}")]
    Api { code: String, info: String },
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("authentication failed: {0}")]
    Auth(String),
}

impl FetchError {
    /// Whether retrying the same request can succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, FetchError::Auth(_))
    }
}

/// Terminal failure of one chunk; aborts the run.
#[derive(Debug, Error)]
pub enum ChunkFailure {
    #[error("chunk {chunk} (revisions {ids}) failed after {attempts} attempts: {source}")]
    Exhausted {
        chunk: u64,
        ids: IdRange,
        attempts: u32,
        #[source]
        source: FetchError,
    },
    #[error("chunk {chunk} (revisions {ids}) failed: {source}")]
    Fatal {
        chunk: u64,
        ids: IdRange,
        #[source]
        source: FetchError,
    },
    #[error("chunk {chunk} (revisions {ids}) could not be persisted: {source}")]
    Persist {
        chunk: u64,
        ids: IdRange,
        #[source]
        source: std::io::Error,
    },
    #[error("chunk {chunk} (revisions {ids}) cancelled before completion")]
    Cancelled { chunk: u64, ids: IdRange },
}

impl ChunkFailure {
    pub fn chunk(&self) -> u64 {
        match self {
            ChunkFailure::Exhausted { chunk, .. }
            | ChunkFailure::Fatal { chunk, .. }
            | ChunkFailure::Persist { chunk, .. }
            | ChunkFailure::Cancelled { chunk, .. } => *chunk,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ChunkFailure::Cancelled { .. })
    }
}
