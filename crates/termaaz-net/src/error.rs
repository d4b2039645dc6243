use thiserror::Error;

/// Errors produced by the networking layer.
#[derive(Error, Debug)]
pub enum NetError {
    /// The engine task is gone; the room was destroyed.
    #[error("Engine command channel closed")]
    EngineClosed,

    /// The transport provider failed to join or leave a topic.
    #[error("Transport error: {0}")]
    Transport(#[source] anyhow::Error),

    /// Setting up local resources (e.g. the download directory) failed.
    #[error("File error: {0}")]
    File(#[from] termaaz_files::FileError),
}
