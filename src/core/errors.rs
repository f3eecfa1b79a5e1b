// src/core/errors.rs

//! Defines the error types shared by the cache engine, its stores and the
//! dispatch layer.

use std::sync::Arc;
use thiserror::Error;

/// Failures raised by the cache engine and its stores.
///
/// None of these ever fail a client-facing response: the interceptor reports
/// them through its error callback and carries on without the cache.
#[derive(Error, Debug)]
pub enum CacheError {
    /// A programmer error at an API boundary (bad key, bad store options).
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Entry exceeds the maximum entry size of {limit} bytes")]
    EntryTooLarge { limit: usize },

    #[error("SQLite error: {0}")]
    Sqlite(Arc<rusqlite::Error>),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Background store task failed: {0}")]
    TaskJoin(String),

    #[error("Internal cache error: {0}")]
    Internal(String),
}

// `rusqlite::Error` and `std::io::Error` are not cloneable, so they are
// wrapped in an Arc and cloned by hand.
impl Clone for CacheError {
    fn clone(&self) -> Self {
        match self {
            CacheError::InvalidArgument(s) => CacheError::InvalidArgument(s.clone()),
            CacheError::EntryTooLarge { limit } => CacheError::EntryTooLarge { limit: *limit },
            CacheError::Sqlite(e) => CacheError::Sqlite(Arc::clone(e)),
            CacheError::Serialization(s) => CacheError::Serialization(s.clone()),
            CacheError::Io(e) => CacheError::Io(Arc::clone(e)),
            CacheError::TaskJoin(s) => CacheError::TaskJoin(s.clone()),
            CacheError::Internal(s) => CacheError::Internal(s.clone()),
        }
    }
}

impl From<rusqlite::Error> for CacheError {
    fn from(e: rusqlite::Error) -> Self {
        CacheError::Sqlite(Arc::new(e))
    }
}

impl From<std::io::Error> for CacheError {
    fn from(e: std::io::Error) -> Self {
        CacheError::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Serialization(e.to_string())
    }
}

impl From<tokio::task::JoinError> for CacheError {
    fn from(e: tokio::task::JoinError) -> Self {
        CacheError::TaskJoin(e.to_string())
    }
}

/// Failures surfaced through `DispatchHandler::on_response_error`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Request aborted: {0}")]
    Aborted(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl From<reqwest::Error> for DispatchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            DispatchError::Timeout
        } else {
            DispatchError::Transport(e.to_string())
        }
    }
}
