use thiserror::Error;

/// Errors from checkpoint storage backends.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("query error: {0}")]
    Query(String),

    #[error("I/O error: {0}")]
    Io(String),
}
