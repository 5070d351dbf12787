//! File transfer coordinator (C9) — server side.
//!
//! Mutation of a single transfer (chunk upload, missing-chunk query,
//! dispatch) is serialized behind a per-transfer `parking_lot::Mutex`
//! keyed by transferId in a `DashMap`, mirroring the corpus' session-table
//! pattern (one lock per logical session, not one lock for the whole
//! table).

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use controledu_core::chunking::{chunk_count, missing_chunks, sha256_hex};
use controledu_core::error::{Error, Result};
use controledu_core::protocol::FileTransferAssignment;
use controledu_core::storage::{Store, TransferResumeRow};
use controledu_core::time::now_timestamp;

struct TransferRecord {
    file_name: String,
    file_size: u64,
    sha256: String,
    chunk_size: u64,
    total_chunks: u32,
    uploaded: HashSet<u32>,
    uploaded_by: String,
    created_at_utc: i64,
}

/// Server-side transfer table plus on-disk chunk storage under
/// `{data_dir}/transfers/{transferId}/{index:08}.chunk` (§6).
pub struct TransferManager {
    root: PathBuf,
    transfers: DashMap<String, Arc<Mutex<TransferRecord>>>,
}

impl TransferManager {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: data_dir.into().join("transfers"),
            transfers: DashMap::new(),
        }
    }

    fn dir_for(&self, transfer_id: &str) -> PathBuf {
        self.root.join(transfer_id)
    }

    fn chunk_path(&self, transfer_id: &str, index: u32) -> PathBuf {
        self.dir_for(transfer_id).join(format!("{index:08}.chunk"))
    }

    /// `InitUpload` (§4.8): allocate a transfer id and the chunk layout.
    pub fn init_upload(
        &self,
        store: &Store,
        file_name: &str,
        file_size: u64,
        sha256: &str,
        chunk_size: u64,
        uploaded_by: &str,
    ) -> Result<(String, u32, i64)> {
        let transfer_id = uuid::Uuid::new_v4().to_string();
        let total_chunks = chunk_count(file_size, chunk_size)?;
        std::fs::create_dir_all(self.dir_for(&transfer_id))?;

        let created_at_utc = now_timestamp();
        let record = TransferRecord {
            file_name: file_name.to_string(),
            file_size,
            sha256: sha256.to_uppercase(),
            chunk_size,
            total_chunks,
            uploaded: HashSet::new(),
            uploaded_by: uploaded_by.to_string(),
            created_at_utc,
        };
        self.transfers.insert(transfer_id.clone(), Arc::new(Mutex::new(record)));

        store.upsert_transfer_resume(&TransferResumeRow {
            transfer_id: transfer_id.clone(),
            file_name: file_name.to_string(),
            sha256: sha256.to_uppercase(),
            chunk_size,
            total_chunks,
            completed_chunks: Vec::new(),
            partial_file_path: None,
            updated_at: created_at_utc,
        })?;

        Ok((transfer_id, total_chunks, created_at_utc))
    }

    /// `UploadChunk` (§4.8): stored only if `header_sha256` matches the
    /// computed hash of `body` and `index` is in range; idempotent on
    /// re-upload of an already-received index.
    pub fn accept_chunk(
        &self,
        store: &Store,
        transfer_id: &str,
        index: u32,
        body: &[u8],
        header_sha256: &str,
    ) -> Result<()> {
        let entry = self
            .transfers
            .get(transfer_id)
            .ok_or_else(|| Error::MalformedPayload(format!("unknown transfer {transfer_id}")))?
            .clone();
        let mut record = entry.lock();

        if index >= record.total_chunks {
            return Err(Error::ChunkIndexOutOfRange {
                index,
                total: record.total_chunks,
            });
        }

        let computed = sha256_hex(body);
        if !computed.eq_ignore_ascii_case(header_sha256) {
            return Err(Error::ChunkHashMismatch { index });
        }

        std::fs::write(self.chunk_path(transfer_id, index), body)?;
        record.uploaded.insert(index);

        let mut completed: Vec<u32> = record.uploaded.iter().copied().collect();
        completed.sort_unstable();
        store.upsert_transfer_resume(&TransferResumeRow {
            transfer_id: transfer_id.to_string(),
            file_name: record.file_name.clone(),
            sha256: record.sha256.clone(),
            chunk_size: record.chunk_size,
            total_chunks: record.total_chunks,
            completed_chunks: completed,
            partial_file_path: None,
            updated_at: now_timestamp(),
        })?;

        Ok(())
    }

    /// Whether every chunk of `transfer_id` has been uploaded.
    pub fn is_complete(&self, transfer_id: &str) -> Result<bool> {
        let entry = self.transfers.get(transfer_id).ok_or_else(|| {
            Error::MalformedPayload(format!("unknown transfer {transfer_id}"))
        })?;
        let record = entry.lock();
        Ok(record.uploaded.len() as u32 == record.total_chunks)
    }

    /// `Missing{transferId, existing}` (§4.8): the gaps in `existing`
    /// intersected with what the server actually has ready to serve.
    pub fn missing_available(&self, transfer_id: &str, existing: &[u32]) -> Result<Vec<u32>> {
        let entry = self.transfers.get(transfer_id).ok_or_else(|| {
            Error::MalformedPayload(format!("unknown transfer {transfer_id}"))
        })?;
        let record = entry.lock();
        let gaps = missing_chunks(record.total_chunks, existing);
        Ok(gaps.into_iter().filter(|i| record.uploaded.contains(i)).collect())
    }

    /// `Chunk{transferId, index}` (§4.8): raw bytes plus their hash for
    /// the `X-Chunk-Sha256` response header.
    pub fn get_chunk(&self, transfer_id: &str, index: u32) -> Result<(Vec<u8>, String)> {
        let entry = self.transfers.get(transfer_id).ok_or_else(|| {
            Error::MalformedPayload(format!("unknown transfer {transfer_id}"))
        })?;
        {
            let record = entry.lock();
            if !record.uploaded.contains(&index) {
                return Err(Error::ChunkIndexOutOfRange {
                    index,
                    total: record.total_chunks,
                });
            }
        }
        let bytes = std::fs::read(self.chunk_path(transfer_id, index))?;
        let hash = sha256_hex(&bytes);
        Ok((bytes, hash))
    }

    /// `Dispatch{transferId, targetClientIds}` (§4.8): only legal once
    /// `uploadedChunks == totalChunks`.
    pub fn dispatch(&self, transfer_id: &str) -> Result<FileTransferAssignment> {
        let entry = self.transfers.get(transfer_id).ok_or_else(|| {
            Error::MalformedPayload(format!("unknown transfer {transfer_id}"))
        })?;
        let record = entry.lock();
        if record.uploaded.len() as u32 != record.total_chunks {
            return Err(Error::ChunkCountMismatch {
                expected: record.total_chunks,
                got: record.uploaded.len() as u32,
            });
        }
        Ok(FileTransferAssignment {
            transfer_id: transfer_id.to_string(),
            file_name: record.file_name.clone(),
            file_size: record.file_size,
            sha256: record.sha256.clone(),
            chunk_size: record.chunk_size,
            total_chunks: record.total_chunks,
        })
    }

    #[allow(dead_code)]
    pub fn uploaded_by(&self, transfer_id: &str) -> Option<String> {
        self.transfers.get(transfer_id).map(|e| e.lock().uploaded_by.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use controledu_core::chunking::sha256_hex as hash_of;

    fn manager() -> (TransferManager, Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (TransferManager::new(dir.path()), Store::open(None).unwrap(), dir)
    }

    #[test]
    fn test_init_upload_then_chunk_roundtrip_and_dispatch() {
        let (mgr, store, _dir) = manager();
        let data = b"hello controledu worksheet contents";
        let full_hash = hash_of(data);

        let (transfer_id, total, _created) = mgr
            .init_upload(&store, "worksheet.txt", data.len() as u64, &full_hash, 16, "teacher")
            .unwrap();
        assert_eq!(total, 3);
        assert!(mgr.dispatch(&transfer_id).is_err());

        for (i, chunk) in data.chunks(16).enumerate() {
            let h = hash_of(chunk);
            mgr.accept_chunk(&store, &transfer_id, i as u32, chunk, &h).unwrap();
        }
        assert!(mgr.is_complete(&transfer_id).unwrap());

        let assignment = mgr.dispatch(&transfer_id).unwrap();
        assert_eq!(assignment.total_chunks, 3);

        let (bytes, hash) = mgr.get_chunk(&transfer_id, 0).unwrap();
        assert_eq!(bytes, &data[0..16]);
        assert_eq!(hash, hash_of(&data[0..16]));
    }

    #[test]
    fn test_accept_chunk_rejects_bad_hash() {
        let (mgr, store, _dir) = manager();
        let data = b"0123456789abcdef";
        let (transfer_id, _total, _created) = mgr
            .init_upload(&store, "f.bin", data.len() as u64, &hash_of(data), 16, "teacher")
            .unwrap();
        assert!(mgr.accept_chunk(&store, &transfer_id, 0, data, "deadbeef").is_err());
    }

    #[test]
    fn test_missing_available_intersects_with_server_holdings() {
        let (mgr, store, _dir) = manager();
        let data = vec![0u8; 64];
        let (transfer_id, total, _created) = mgr
            .init_upload(&store, "f.bin", data.len() as u64, &hash_of(&data), 16, "teacher")
            .unwrap();
        assert_eq!(total, 4);
        for i in [0u32, 2, 3] {
            let chunk = &data[(i as usize) * 16..(i as usize + 1) * 16];
            mgr.accept_chunk(&store, &transfer_id, i, chunk, &hash_of(chunk)).unwrap();
        }
        // Server has 0,2,3. Requester already has 0. So missing-available = {2,3}.
        let missing = mgr.missing_available(&transfer_id, &[0]).unwrap();
        assert_eq!(missing, vec![2, 3]);
    }
}
