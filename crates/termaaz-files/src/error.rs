use thiserror::Error;

use termaaz_shared::types::FileId;

/// Errors produced by the file transfer engine.
#[derive(Error, Debug)]
pub enum FileError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("File {0} is not locally available")]
    NotAvailable(FileId),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, FileError>;
