use sled::transaction::{ConflictableTransactionError, TransactionError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid username: {0}")]
    InvalidUsername(String),

    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("corrupt record: {0}")]
    Codec(#[from] bincode::Error),
}

impl Error {
    pub fn not_found<S: Into<String>>(what: S) -> Self {
        Error::NotFound(what.into())
    }

    pub fn conflict<S: Into<String>>(what: S) -> Self {
        Error::Conflict(what.into())
    }
}

impl From<TransactionError<Error>> for Error {
    fn from(err: TransactionError<Error>) -> Self {
        match err {
            TransactionError::Abort(e) => e,
            TransactionError::Storage(e) => Error::Storage(e),
        }
    }
}

/// Aborts the surrounding sled transaction with `err`.
pub(crate) fn abort<T>(err: Error) -> std::result::Result<T, ConflictableTransactionError<Error>> {
    Err(ConflictableTransactionError::Abort(err))
}
