//! # Hashing & chunking (C1)
//!
//! Content-addressed fixed-size chunking used by the file transfer
//! coordinator, plus the resume bookkeeping each side of a transfer keeps.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         FILE CHUNKING                                   │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │  1. Split into fixed-size chunks (default 256 KiB)                      │
//! │  2. SHA-256 hash each chunk                                             │
//! │  3. SHA-256 hash full file                                              │
//! │  4. Build ChunkManifest with ordered ChunkRef list                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Default chunk size: 256 KiB.
pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

/// Uppercase hex-encoded SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode_upper(Sha256::digest(bytes))
}

/// `ceil(size / chunk_size)`. `chunk_size` must be > 0.
pub fn chunk_count(size: u64, chunk_size: u64) -> Result<u32> {
    if chunk_size == 0 {
        return Err(Error::MalformedPayload("chunk size must be > 0".into()));
    }
    if size == 0 {
        return Ok(0);
    }
    Ok((size.div_ceil(chunk_size)) as u32)
}

/// Ordered-ascending `[0, total) \ (existing ∩ [0, total))`.
///
/// Values in `existing` outside `[0, total)` are ignored.
pub fn missing_chunks(total: u32, existing: &[u32]) -> Vec<u32> {
    let have: std::collections::HashSet<u32> =
        existing.iter().copied().filter(|&i| i < total).collect();
    (0..total).filter(|i| !have.contains(i)).collect()
}

// ---------------------------------------------------------------------------
// Manifest / chunk types
// ---------------------------------------------------------------------------

/// A reference to a single chunk within a manifest (metadata only, no data).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRef {
    /// Zero-based position within the file.
    pub chunk_index: u32,
    /// Size of this chunk in bytes.
    pub size: usize,
    /// Uppercase hex-encoded SHA-256 of the chunk data.
    pub hash: String,
}

/// Manifest describing how a file was chunked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkManifest {
    /// Opaque transfer identifier this manifest belongs to.
    pub transfer_id: String,
    /// Original filename.
    pub file_name: String,
    /// Total file size in bytes.
    pub file_size: u64,
    /// Chunk size used for splitting (bytes).
    pub chunk_size: u64,
    /// Total number of chunks.
    pub total_chunks: u32,
    /// Ordered list of chunk references.
    pub chunks: Vec<ChunkRef>,
    /// Uppercase hex-encoded SHA-256 of the entire file.
    pub sha256: String,
}

/// A single chunk with its data payload.
#[derive(Debug, Clone)]
pub struct FileChunk {
    /// Zero-based position within the file.
    pub chunk_index: u32,
    /// The raw chunk bytes.
    pub data: Vec<u8>,
}

/// Split file data into content-addressed chunks.
pub fn chunk_file(
    transfer_id: &str,
    file_name: &str,
    data: &[u8],
    chunk_size: usize,
) -> Result<(ChunkManifest, Vec<FileChunk>)> {
    if chunk_size == 0 {
        return Err(Error::MalformedPayload("chunk size must be > 0".into()));
    }

    let sha256 = sha256_hex(data);
    let file_size = data.len() as u64;
    let total_chunks = chunk_count(file_size, chunk_size as u64)?;

    let mut chunks = Vec::with_capacity(total_chunks as usize);
    let mut chunk_refs = Vec::with_capacity(total_chunks as usize);

    for (i, window) in data.chunks(chunk_size).enumerate() {
        let hash = sha256_hex(window);
        let chunk_index = i as u32;

        chunk_refs.push(ChunkRef {
            chunk_index,
            size: window.len(),
            hash,
        });
        chunks.push(FileChunk {
            chunk_index,
            data: window.to_vec(),
        });
    }

    let manifest = ChunkManifest {
        transfer_id: transfer_id.to_string(),
        file_name: file_name.to_string(),
        file_size,
        chunk_size: chunk_size as u64,
        total_chunks,
        chunks: chunk_refs,
        sha256,
    };

    Ok((manifest, chunks))
}

/// Reassemble a file from its manifest and chunks (any order; sorted
/// internally). Verifies each chunk hash and the final file hash.
pub fn reassemble_file(manifest: &ChunkManifest, chunks: &[FileChunk]) -> Result<Vec<u8>> {
    if chunks.len() != manifest.total_chunks as usize {
        return Err(Error::ChunkCountMismatch {
            expected: manifest.total_chunks,
            got: chunks.len() as u32,
        });
    }

    if manifest.total_chunks == 0 {
        let hash = sha256_hex(&[]);
        if hash != manifest.sha256 {
            return Err(Error::FileHashMismatch);
        }
        return Ok(Vec::new());
    }

    let mut sorted: Vec<&FileChunk> = chunks.iter().collect();
    sorted.sort_by_key(|c| c.chunk_index);

    for (i, chunk) in sorted.iter().enumerate() {
        if chunk.chunk_index != i as u32 {
            return Err(Error::ChunkGap {
                expected: i as u32,
                found: chunk.chunk_index,
            });
        }
    }

    let mut result = Vec::with_capacity(manifest.file_size as usize);
    for (i, chunk) in sorted.iter().enumerate() {
        let expected = &manifest.chunks[i];
        if !verify_chunk_hash(&chunk.data, &expected.hash) {
            return Err(Error::ChunkHashMismatch {
                index: chunk.chunk_index,
            });
        }
        result.extend_from_slice(&chunk.data);
    }

    let final_hash = sha256_hex(&result);
    if final_hash != manifest.sha256 {
        return Err(Error::FileHashMismatch);
    }

    Ok(result)
}

/// Verify a chunk's data matches its declared (uppercase hex) hash.
pub fn verify_chunk_hash(data: &[u8], expected_hash: &str) -> bool {
    sha256_hex(data) == expected_hash
}

// ---------------------------------------------------------------------------
// Resume state machine
// ---------------------------------------------------------------------------

/// Tracks which chunk indexes of a single transfer have been completed.
///
/// Wraps a boolean array of length `total`; never shrinks once constructed.
#[derive(Debug, Clone)]
pub struct ChunkResumeState {
    total: u32,
    completed: Vec<bool>,
}

impl ChunkResumeState {
    /// New resume state for a transfer of `total` chunks, nothing completed.
    pub fn new(total: u32) -> Self {
        Self {
            total,
            completed: vec![false; total as usize],
        }
    }

    /// Mark `index` completed. Bounds-checked; out-of-range indexes are
    /// rejected rather than silently ignored.
    pub fn mark_completed(&mut self, index: u32) -> Result<()> {
        if index >= self.total {
            return Err(Error::ChunkIndexOutOfRange {
                index,
                total: self.total,
            });
        }
        self.completed[index as usize] = true;
        Ok(())
    }

    /// True once every chunk in `[0, total)` has been marked completed.
    pub fn is_complete(&self) -> bool {
        self.total == 0 || self.completed.iter().all(|&c| c)
    }

    /// Number of chunks marked completed so far.
    pub fn completed_count(&self) -> u32 {
        self.completed.iter().filter(|&&c| c).count() as u32
    }

    /// Ordered-ascending indexes not yet marked completed.
    pub fn missing_chunks(&self) -> Vec<u32> {
        (0..self.total)
            .filter(|&i| !self.completed[i as usize])
            .collect()
    }

    /// Total chunk count this resume state was constructed with.
    pub fn total(&self) -> u32 {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_and_reassemble_round_trip() {
        let data = b"Hello, Controledu! This is a test file for chunking.";
        let (manifest, chunks) = chunk_file("t-1", "test.txt", data, 16).unwrap();

        assert_eq!(manifest.transfer_id, "t-1");
        assert_eq!(manifest.file_size, data.len() as u64);
        assert_eq!(manifest.total_chunks, 4);
        assert_eq!(chunks.len(), 4);

        let reassembled = reassemble_file(&manifest, &chunks).unwrap();
        assert_eq!(reassembled, data);
    }

    #[test]
    fn test_empty_file() {
        let (manifest, chunks) = chunk_file("t-empty", "empty.bin", b"", DEFAULT_CHUNK_SIZE).unwrap();
        assert_eq!(manifest.total_chunks, 0);
        assert!(chunks.is_empty());
        assert!(reassemble_file(&manifest, &chunks).unwrap().is_empty());
    }

    #[test]
    fn test_exact_chunk_boundary() {
        let data = vec![0xABu8; 32];
        let (manifest, chunks) = chunk_file("t-exact", "exact.bin", &data, 16).unwrap();
        assert_eq!(manifest.total_chunks, 2);
        assert_eq!(chunks[0].data.len(), 16);
        assert_eq!(reassemble_file(&manifest, &chunks).unwrap(), data);
    }

    #[test]
    fn test_large_file_four_chunks() {
        let data = vec![0x42u8; 1024 * 1024];
        let (manifest, chunks) = chunk_file("t-large", "large.bin", &data, DEFAULT_CHUNK_SIZE).unwrap();
        assert_eq!(manifest.total_chunks, 4);
        assert_eq!(reassemble_file(&manifest, &chunks).unwrap(), data);
    }

    #[test]
    fn test_corrupt_chunk_detected() {
        let data = b"Hello, Controledu! This is a test file for chunking.";
        let (manifest, mut chunks) = chunk_file("t-corrupt", "test.txt", data, 16).unwrap();
        chunks[0].data[0] ^= 0xFF;

        match reassemble_file(&manifest, &chunks) {
            Err(Error::ChunkHashMismatch { index: 0 }) => {}
            other => panic!("expected ChunkHashMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_chunk_detected() {
        let data = b"Hello, Controledu! This is a test file for chunking.";
        let (manifest, mut chunks) = chunk_file("t-missing", "test.txt", data, 16).unwrap();
        chunks.remove(1);

        match reassemble_file(&manifest, &chunks) {
            Err(Error::ChunkCountMismatch { expected: 4, got: 3 }) => {}
            other => panic!("expected ChunkCountMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_chunks_out_of_order_reassembly() {
        let data = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ012345";
        let (manifest, mut chunks) = chunk_file("t-order", "alpha.txt", data, 8).unwrap();
        chunks.reverse();
        assert_eq!(reassemble_file(&manifest, &chunks).unwrap(), data);
    }

    #[test]
    fn test_content_addressing_same_bytes_same_hash() {
        let (m1, c1) = chunk_file("t-a", "a.txt", b"identical content", DEFAULT_CHUNK_SIZE).unwrap();
        let (m2, c2) = chunk_file("t-b", "b.txt", b"identical content", DEFAULT_CHUNK_SIZE).unwrap();
        assert_eq!(c1[0].data, c2[0].data);
        assert_eq!(m1.sha256, m2.sha256);
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        assert!(chunk_file("bad", "bad.txt", b"data", 0).is_err());
    }

    #[test]
    fn test_manifest_serialization_round_trip() {
        let (manifest, _) = chunk_file("t-ser", "ser.txt", b"serialize me", 8).unwrap();
        let json = serde_json::to_string(&manifest).unwrap();
        let back: ChunkManifest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.transfer_id, manifest.transfer_id);
        assert_eq!(back.sha256, manifest.sha256);
    }

    #[test]
    fn test_chunk_count() {
        assert_eq!(chunk_count(0, 16).unwrap(), 0);
        assert_eq!(chunk_count(1, 16).unwrap(), 1);
        assert_eq!(chunk_count(16, 16).unwrap(), 1);
        assert_eq!(chunk_count(17, 16).unwrap(), 2);
        assert!(chunk_count(17, 0).is_err());
    }

    /// Seed scenario 3: total=8, existing=[0,2,3,7] → missing=[1,4,5,6].
    #[test]
    fn test_missing_chunks_seed_scenario() {
        assert_eq!(missing_chunks(8, &[0, 2, 3, 7]), vec![1, 4, 5, 6]);
    }

    #[test]
    fn test_missing_chunks_ignores_out_of_range() {
        assert_eq!(missing_chunks(4, &[0, 1, 99]), vec![2, 3]);
    }

    #[test]
    fn test_resume_state_lifecycle() {
        let mut state = ChunkResumeState::new(4);
        assert!(!state.is_complete());
        assert_eq!(state.missing_chunks(), vec![0, 1, 2, 3]);

        state.mark_completed(0).unwrap();
        state.mark_completed(2).unwrap();
        assert_eq!(state.completed_count(), 2);
        assert_eq!(state.missing_chunks(), vec![1, 3]);
        assert!(!state.is_complete());

        state.mark_completed(1).unwrap();
        state.mark_completed(3).unwrap();
        assert!(state.is_complete());
        assert!(state.missing_chunks().is_empty());
    }

    #[test]
    fn test_resume_state_rejects_out_of_range() {
        let mut state = ChunkResumeState::new(2);
        assert!(state.mark_completed(5).is_err());
    }

    #[test]
    fn test_resume_state_is_complete_iff_missing_empty() {
        let mut state = ChunkResumeState::new(3);
        for i in 0..3 {
            assert_eq!(state.is_complete(), state.missing_chunks().is_empty());
            state.mark_completed(i).unwrap();
        }
        assert!(state.is_complete());
        assert!(state.missing_chunks().is_empty());
    }
}
