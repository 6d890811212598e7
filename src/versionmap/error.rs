//! Version position map error types.

use thiserror::Error;

use crate::storage::StorageError;

#[derive(Error, Debug)]
pub enum VersionMapError {
    #[error("Version position map {name} is not open")]
    NotOpen { name: String },

    #[error("Version position map file already exists: {file_name}")]
    AlreadyExists { file_name: String },

    #[error("Version position map file not found: {file_name}")]
    NotFound { file_name: String },

    #[error("No active atomic operation for a change to version position map {name}")]
    MissingOperation { name: String },

    #[error("Hash {hash} is beyond the addressable page range")]
    InvalidHash { hash: u64 },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type VersionMapResult<T> = Result<T, VersionMapError>;
