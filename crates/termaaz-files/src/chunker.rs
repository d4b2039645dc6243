//! Sender-side chunking: a lazy, finite, non-restartable sequence of
//! fixed-size chunks read sequentially from disk.

use tokio::fs::File;
use tokio::io::AsyncReadExt;

use termaaz_shared::constants::FILE_CHUNK_SIZE;
use termaaz_shared::protocol::ChunkPayload;
use termaaz_shared::types::SharedFile;

use crate::error::{FileError, Result};

/// Number of chunks a file of `size` bytes splits into.
pub fn total_chunks_for(size: u64) -> u32 {
    size.div_ceil(FILE_CHUNK_SIZE as u64) as u32
}

/// Reads a locally available shared file in `FILE_CHUNK_SIZE` pieces.
/// Each chunk is full-size except possibly the last.
pub struct FileChunker {
    file: File,
    file_info: SharedFile,
    total_chunks: u32,
    next_index: u32,
}

impl FileChunker {
    /// Open the chunk source. Fails when the file was never downloaded
    /// or shared locally.
    pub async fn open(file_info: SharedFile) -> Result<Self> {
        if !file_info.is_available {
            return Err(FileError::NotAvailable(file_info.id));
        }
        let file = File::open(&file_info.local_path).await?;
        let total_chunks = total_chunks_for(file_info.size);
        Ok(Self {
            file,
            file_info,
            total_chunks,
            next_index: 0,
        })
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    /// Yield the next chunk, or `None` once the file is exhausted.
    pub async fn next_chunk(&mut self) -> Result<Option<ChunkPayload>> {
        if self.next_index >= self.total_chunks {
            return Ok(None);
        }

        let mut data = vec![0u8; FILE_CHUNK_SIZE];
        let mut filled = 0;
        while filled < data.len() {
            let n = self.file.read(&mut data[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            return Ok(None);
        }
        data.truncate(filled);

        let chunk = ChunkPayload {
            file_id: self.file_info.id.clone(),
            chunk_index: self.next_index,
            total_chunks: self.total_chunks,
            data,
        };
        self.next_index += 1;
        Ok(Some(chunk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    use termaaz_shared::types::{FileId, UserId};

    fn local_file(path: &std::path::Path, size: u64) -> SharedFile {
        SharedFile {
            id: FileId::random(),
            name: "blob.bin".into(),
            size,
            remote_path: path.display().to_string(),
            local_path: path.display().to_string(),
            shared_by: UserId::random(),
            shared_by_name: "alice".into(),
            shared_at: 0,
            mime_type: "application/octet-stream".into(),
            is_directory: false,
            is_available: true,
        }
    }

    #[test]
    fn test_total_chunks_for() {
        assert_eq!(total_chunks_for(0), 0);
        assert_eq!(total_chunks_for(1), 1);
        assert_eq!(total_chunks_for(FILE_CHUNK_SIZE as u64), 1);
        assert_eq!(total_chunks_for(FILE_CHUNK_SIZE as u64 + 1), 2);
        assert_eq!(total_chunks_for(150_000), 3);
    }

    #[tokio::test]
    async fn test_chunk_sizes_and_indices() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.bin");
        let bytes: Vec<u8> = (0..150_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&bytes)
            .unwrap();

        let mut chunker = FileChunker::open(local_file(&path, 150_000)).await.unwrap();
        assert_eq!(chunker.total_chunks(), 3);

        let mut sizes = Vec::new();
        let mut indices = Vec::new();
        while let Some(chunk) = chunker.next_chunk().await.unwrap() {
            sizes.push(chunk.data.len());
            indices.push(chunk.chunk_index);
            assert_eq!(chunk.total_chunks, 3);
        }

        assert_eq!(sizes, vec![65_536, 65_536, 18_928]);
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_unavailable_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.bin");
        let mut info = local_file(&path, 10);
        info.is_available = false;

        assert!(matches!(
            FileChunker::open(info).await,
            Err(FileError::NotAvailable(_))
        ));
    }
}
