//! Errors raised inside the middleware chain.
//!
//! A middleware or route handler that fails returns [`Error`] instead of a
//! [`Response`](crate::Response). The error travels back up the chain until a
//! middleware such as [`ErrorHandler`](crate::middleware::ErrorHandler)
//! converts it, or until it reaches [`App`](crate::app::App), which answers
//! with a bare `500`.

use std::time::Duration;

use thiserror::Error;

use crate::kv::StoreError;

/// Failure produced by a middleware or handler.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Timeout after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("{0}")]
    Message(String),
}

impl Error {
    /// Builds an ad-hoc handler failure from any displayable message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}

/// Result type returned by every middleware and route handler.
pub type Result<T, E = Error> = std::result::Result<T, E>;
