//! Typed error kinds surfaced by the repository API.
//!
//! Internal plumbing mostly propagates `anyhow::Error` the way the rest of
//! this crate does (see `backup::data_blob` for the idiom); at API
//! boundaries those get folded into a `RepoError` so callers can match on
//! the kind a failure belongs to, as required by the check/maintenance/sync
//! pipelines.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RepoError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("corrupted: {0}")]
    Corrupted(String),

    #[error("version mismatch: {0}")]
    VersionMismatch(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("locked: {0}")]
    Locked(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("cancelled")]
    Cancelled,

    #[error("config error: {0}")]
    Config(String),

    #[error("policy violation: {0}")]
    Policy(String),
}

impl From<std::io::Error> for RepoError {
    fn from(err: std::io::Error) -> Self {
        RepoError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for RepoError {
    fn from(err: serde_json::Error) -> Self {
        RepoError::Corrupted(format!("malformed json: {}", err))
    }
}

/// Convert a generic `anyhow::Error` into a `RepoError`, defaulting to
/// `Io` for errors that carry no more specific classification. Call sites
/// that know the failure kind should build the `RepoError` variant
/// directly instead of going through this.
pub fn classify(err: anyhow::Error) -> RepoError {
    RepoError::Io(err.to_string())
}

pub type Result<T> = std::result::Result<T, RepoError>;
