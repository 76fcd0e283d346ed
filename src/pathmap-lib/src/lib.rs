mod path_utils;
mod types;

pub use path_utils::*;
pub use types::*;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PathDbError {
    #[error("internal error: {0}")]
    Internal(String),
    #[error("db error: {0}")]
    DbError(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("invalid path: {0}")]
    InvalidPath(String),
}

impl PathDbError {
    /// Whether this error reports a missing file on the I/O side. Index
    /// operations never signal a missing entry this way; they return a
    /// value instead.
    pub fn is_not_found(&self) -> bool {
        matches!(self, PathDbError::NotFound(_))
    }
}

pub type PathDbResult<T> = std::result::Result<T, PathDbError>;

impl From<std::io::Error> for PathDbError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            PathDbError::NotFound(err.to_string())
        } else {
            PathDbError::IoError(err.to_string())
        }
    }
}
