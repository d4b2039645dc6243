//! # termaaz-files
//!
//! The file transfer engine: a registry of locally and remotely shared
//! files, a sender-side chunker that slices a file into fixed-size
//! pieces, and receiver-side reassembly of chunks that may arrive in
//! any order.

pub mod chunker;
pub mod mime;
pub mod transfer;

mod error;

pub use chunker::{total_chunks_for, FileChunker};
pub use error::FileError;
pub use transfer::{ChunkOutcome, FileManager, TransferStatus};
