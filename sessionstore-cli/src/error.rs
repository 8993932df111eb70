//! Error types for the session store CLI.

use sessionstore_dynamodb::SessionError;
use thiserror::Error;

/// Result type for CLI operations.
pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug, Error)]
pub enum CliError {
    /// Session store error
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}
