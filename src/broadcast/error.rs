//! Broadcaster error types

use thiserror::Error;

/// Errors raised while reading the external state source
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed state document: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("State source unavailable: {0}")]
    Unavailable(String),
}

/// Errors returned by the change broadcaster
#[derive(Error, Debug)]
pub enum BroadcastError {
    #[error("Broadcaster destroyed")]
    Destroyed,

    #[error("Broadcaster already running")]
    AlreadyRunning,

    #[error("Payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type SourceResult<T> = Result<T, SourceError>;

pub type BroadcastResult<T> = Result<T, BroadcastError>;
