//! Shared-file registry and receiver-side reassembly.
//!
//! Chunks arrive keyed by index and may be delivered in any order or
//! more than once. Completion is decided by the set of distinct indices
//! received, never by a call count, so a duplicated chunk can never
//! finalize a transfer with real data missing.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use termaaz_shared::time::now_millis;
use termaaz_shared::types::{FileId, SharedFile, UserId};

use crate::chunker::total_chunks_for;
use crate::error::{FileError, Result};
use crate::mime::mime_type_for;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Pending,
    Transferring,
    Complete,
    Error,
}

/// Transient receiver-side bookkeeping for one incoming file.
#[derive(Debug)]
struct FileTransfer {
    file_info: SharedFile,
    chunks: BTreeMap<u32, Vec<u8>>,
    total_chunks: u32,
    status: TransferStatus,
    save_path: PathBuf,
}

/// What feeding one chunk to the manager produced.
#[derive(Debug)]
pub enum ChunkOutcome {
    /// A new distinct index was stored.
    Progress { received: u32, total: u32 },
    /// A redelivery of an index already held; completion unchanged.
    Duplicate { received: u32, total: u32 },
    /// Every index `0..total` is present and the file was written.
    Complete { file: SharedFile, save_path: PathBuf },
    /// Writing the finished file failed; the transfer is parked in the
    /// error state with no automatic retry.
    Failed { error: FileError },
    /// No transfer is registered under that id.
    Unknown,
}

/// Registry of shared files plus active inbound transfers.
#[derive(Debug)]
pub struct FileManager {
    local_user_id: UserId,
    local_user_name: String,
    shared: HashMap<FileId, SharedFile>,
    transfers: HashMap<FileId, FileTransfer>,
    download_dir: PathBuf,
}

impl FileManager {
    /// Create the manager, making sure the download directory exists.
    pub fn new(
        download_dir: impl Into<PathBuf>,
        local_user_id: UserId,
        local_user_name: impl Into<String>,
    ) -> Result<Self> {
        let download_dir = download_dir.into();
        std::fs::create_dir_all(&download_dir)?;
        Ok(Self {
            local_user_id,
            local_user_name: local_user_name.into(),
            shared: HashMap::new(),
            transfers: HashMap::new(),
            download_dir,
        })
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    // --- Sharing -----------------------------------------------------------

    /// Share a local file or directory: stat it, build the record, and
    /// register it as immediately available.
    pub fn share_local(&mut self, path: impl AsRef<Path>) -> Result<SharedFile> {
        let absolute = std::fs::canonicalize(path.as_ref())?;
        let metadata = std::fs::metadata(&absolute)?;
        let name = absolute
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| absolute.display().to_string());

        let size = if metadata.is_dir() {
            dir_size(&absolute)
        } else {
            metadata.len()
        };

        let file = SharedFile {
            id: FileId::random(),
            name: name.clone(),
            size,
            remote_path: absolute.display().to_string(),
            local_path: absolute.display().to_string(),
            shared_by: self.local_user_id.clone(),
            shared_by_name: self.local_user_name.clone(),
            shared_at: now_millis(),
            mime_type: if metadata.is_dir() {
                "directory".to_string()
            } else {
                mime_type_for(&name).to_string()
            },
            is_directory: metadata.is_dir(),
            is_available: true,
        };

        debug!(file = %file.id, name = %file.name, size, "Sharing local file");
        self.shared.insert(file.id.clone(), file.clone());
        Ok(file)
    }

    /// Register a file another peer advertised. Not available until the
    /// bytes have been fully downloaded.
    pub fn register_remote(&mut self, mut file: SharedFile) -> SharedFile {
        file.is_available = false;
        file.local_path = String::new();
        self.shared.insert(file.id.clone(), file.clone());
        file
    }

    pub fn get(&self, id: &FileId) -> Option<&SharedFile> {
        self.shared.get(id)
    }

    pub fn shared_files(&self) -> Vec<SharedFile> {
        self.shared.values().cloned().collect()
    }

    pub fn set_local_user_name(&mut self, name: impl Into<String>) {
        self.local_user_name = name.into();
    }

    // --- Receiving ----------------------------------------------------------

    /// Allocate the transfer record for a file about to be pulled.
    /// Expected chunk count derives from the advertised size; the save
    /// path lives under the download directory.
    pub fn init_receive(&mut self, file_info: &SharedFile) -> PathBuf {
        let save_path = self.download_dir.join(&file_info.name);
        let transfer = FileTransfer {
            file_info: file_info.clone(),
            chunks: BTreeMap::new(),
            total_chunks: total_chunks_for(file_info.size),
            status: TransferStatus::Pending,
            save_path: save_path.clone(),
        };
        debug!(
            file = %file_info.id,
            total_chunks = transfer.total_chunks,
            save_path = %save_path.display(),
            "Initialized inbound transfer"
        );
        self.transfers.insert(file_info.id.clone(), transfer);
        save_path
    }

    /// Store one chunk. Finalizes (writes the file in index order and
    /// flips the shared record available) once every distinct index has
    /// arrived.
    pub async fn receive_chunk(
        &mut self,
        file_id: &FileId,
        chunk_index: u32,
        data: Vec<u8>,
    ) -> ChunkOutcome {
        let Some(transfer) = self.transfers.get_mut(file_id) else {
            return ChunkOutcome::Unknown;
        };
        if transfer.status == TransferStatus::Error {
            return ChunkOutcome::Unknown;
        }
        transfer.status = TransferStatus::Transferring;

        if transfer.chunks.contains_key(&chunk_index) {
            return ChunkOutcome::Duplicate {
                received: transfer.chunks.len() as u32,
                total: transfer.total_chunks,
            };
        }
        transfer.chunks.insert(chunk_index, data);
        let received = transfer.chunks.len() as u32;

        if received < transfer.total_chunks {
            return ChunkOutcome::Progress {
                received,
                total: transfer.total_chunks,
            };
        }

        match Self::finalize(transfer).await {
            Ok(()) => {
                let transfer = self
                    .transfers
                    .remove(file_id)
                    .expect("transfer present, it was just finalized");
                let save_path = transfer.save_path;

                // The registry copy becomes locally available.
                let file = match self.shared.get_mut(file_id) {
                    Some(shared) => {
                        shared.is_available = true;
                        shared.local_path = save_path.display().to_string();
                        shared.clone()
                    }
                    None => transfer.file_info,
                };
                ChunkOutcome::Complete { file, save_path }
            }
            Err(error) => {
                transfer.status = TransferStatus::Error;
                warn!(file = %file_id, error = %error, "Transfer finalize failed");
                ChunkOutcome::Failed { error }
            }
        }
    }

    /// Write the reassembled file strictly in index order.
    async fn finalize(transfer: &mut FileTransfer) -> Result<()> {
        let mut out = tokio::fs::File::create(&transfer.save_path).await?;
        for index in 0..transfer.total_chunks {
            if let Some(chunk) = transfer.chunks.get(&index) {
                out.write_all(chunk).await?;
            }
        }
        out.flush().await?;
        transfer.status = TransferStatus::Complete;
        Ok(())
    }

    /// Drop in-flight transfers whose sharer has left the room, so a
    /// departed sender never leaves a transfer dangling.
    pub fn cancel_transfers_from(&mut self, user_id: &UserId) -> Vec<FileId> {
        let doomed: Vec<FileId> = self
            .transfers
            .iter()
            .filter(|(_, t)| &t.file_info.shared_by == user_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &doomed {
            self.transfers.remove(id);
            debug!(file = %id, peer = %user_id, "Cancelled orphaned transfer");
        }
        doomed
    }

    pub fn active_transfer_count(&self) -> usize {
        self.transfers.len()
    }
}

fn dir_size(path: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| match entry.metadata() {
            Ok(meta) if meta.is_dir() => dir_size(&entry.path()),
            Ok(meta) => meta.len(),
            Err(_) => 0,
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn manager(dir: &Path) -> FileManager {
        FileManager::new(dir.join("downloads"), UserId::random(), "alice").unwrap()
    }

    fn remote_file(name: &str, size: u64, shared_by: &UserId) -> SharedFile {
        SharedFile {
            id: FileId::random(),
            name: name.into(),
            size,
            remote_path: format!("/remote/{name}"),
            local_path: format!("/remote/{name}"),
            shared_by: shared_by.clone(),
            shared_by_name: "bob".into(),
            shared_at: 1,
            mime_type: mime_type_for(name).to_string(),
            is_directory: false,
            is_available: true,
        }
    }

    #[test]
    fn test_share_local_builds_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"hello world")
            .unwrap();

        let mut manager = manager(dir.path());
        let file = manager.share_local(&path).unwrap();

        assert_eq!(file.name, "notes.txt");
        assert_eq!(file.size, 11);
        assert_eq!(file.mime_type, "text/plain");
        assert!(file.is_available);
        assert!(!file.is_directory);
        assert!(manager.get(&file.id).is_some());
    }

    #[test]
    fn test_share_local_directory_sums_sizes() {
        let dir = tempfile::tempdir().unwrap();
        let shared_dir = dir.path().join("project");
        std::fs::create_dir_all(shared_dir.join("nested")).unwrap();
        std::fs::write(shared_dir.join("a.txt"), b"12345").unwrap();
        std::fs::write(shared_dir.join("nested/b.txt"), b"123").unwrap();

        let mut manager = manager(dir.path());
        let file = manager.share_local(&shared_dir).unwrap();

        assert!(file.is_directory);
        assert_eq!(file.size, 8);
        assert_eq!(file.mime_type, "directory");
    }

    #[test]
    fn test_register_remote_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = manager(dir.path());
        let bob = UserId::random();

        let file = manager.register_remote(remote_file("pic.png", 10, &bob));
        assert!(!file.is_available);
        assert!(file.local_path.is_empty());
    }

    #[tokio::test]
    async fn test_scrambled_chunks_reassemble_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = manager(dir.path());
        let bob = UserId::random();

        let bytes: Vec<u8> = (0..150_000u32).map(|i| (i % 251) as u8).collect();
        let info = manager.register_remote(remote_file("blob.bin", 150_000, &bob));
        let save_path = manager.init_receive(&info);

        let chunks = [
            &bytes[0..65_536],
            &bytes[65_536..131_072],
            &bytes[131_072..150_000],
        ];

        // Delivery order 2, 0, 1.
        for index in [2u32, 0, 1] {
            let outcome = manager
                .receive_chunk(&info.id, index, chunks[index as usize].to_vec())
                .await;
            if index == 1 {
                match outcome {
                    ChunkOutcome::Complete { file, .. } => {
                        assert!(file.is_available);
                        assert_eq!(file.local_path, save_path.display().to_string());
                    }
                    other => panic!("expected completion, got {other:?}"),
                }
            } else {
                assert!(matches!(outcome, ChunkOutcome::Progress { .. }));
            }
        }

        assert_eq!(std::fs::read(&save_path).unwrap(), bytes);
        assert_eq!(manager.active_transfer_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_chunk_never_finalizes_early() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = manager(dir.path());
        let bob = UserId::random();

        let info = manager.register_remote(remote_file("blob.bin", 150_000, &bob));
        manager.init_receive(&info);

        // Three deliveries, but only two distinct indices.
        assert!(matches!(
            manager.receive_chunk(&info.id, 0, vec![1; 65_536]).await,
            ChunkOutcome::Progress {
                received: 1,
                total: 3
            }
        ));
        assert!(matches!(
            manager.receive_chunk(&info.id, 0, vec![1; 65_536]).await,
            ChunkOutcome::Duplicate {
                received: 1,
                total: 3
            }
        ));
        assert!(matches!(
            manager.receive_chunk(&info.id, 1, vec![2; 65_536]).await,
            ChunkOutcome::Progress {
                received: 2,
                total: 3
            }
        ));
        assert_eq!(manager.active_transfer_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_transfer_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = manager(dir.path());
        let outcome = manager
            .receive_chunk(&FileId::new("f00d"), 0, vec![0])
            .await;
        assert!(matches!(outcome, ChunkOutcome::Unknown));
    }

    #[tokio::test]
    async fn test_peer_departure_garbage_collects_transfers() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = manager(dir.path());
        let bob = UserId::random();
        let carol = UserId::random();

        let from_bob = manager.register_remote(remote_file("a.bin", 100, &bob));
        let from_carol = manager.register_remote(remote_file("b.bin", 100, &carol));
        manager.init_receive(&from_bob);
        manager.init_receive(&from_carol);
        assert_eq!(manager.active_transfer_count(), 2);

        let cancelled = manager.cancel_transfers_from(&bob);
        assert_eq!(cancelled, vec![from_bob.id]);
        assert_eq!(manager.active_transfer_count(), 1);
    }
}
