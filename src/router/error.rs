//! Router error types

use thiserror::Error;

/// Errors returned by the message router
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RouterError {
    /// The worker has shut down; the command was not accepted
    #[error("Message router stopped")]
    Stopped,
}

/// Result type alias for router operations
pub type RouterResult<T> = Result<T, RouterError>;
