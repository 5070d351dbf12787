//! Resumable chunk download client (C9), student side.
//!
//! Downloads one missing chunk per [`advance`] call so the cooperative
//! main loop (§4.10) never blocks on a whole-file transfer; progress is
//! persisted to [`TransferResumeRow`] after every chunk so a restart
//! resumes instead of re-downloading.

use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use controledu_core::chunking::sha256_hex;
use controledu_core::error::{Error, Result};
use controledu_core::protocol::{FileTransferAssignment, MissingChunksRequest, MissingChunksResponse};
use controledu_core::storage::{Store, TransferResumeRow};
use controledu_core::time::now_timestamp;

const CLIENT_ID_HEADER: &str = "X-Controledu-ClientId";
const TOKEN_HEADER: &str = "X-Controledu-Token";
const CHUNK_SHA_HEADER: &str = "X-Chunk-Sha256";

pub struct TransferClient {
    http: reqwest::Client,
    base_url: String,
    client_id: String,
    token: String,
}

/// What one [`advance`] call accomplished, for the caller to turn into
/// a `ReportFileProgress` hub call.
pub enum AdvanceOutcome {
    Progress { completed_chunks: u32, total_chunks: u32 },
    Complete { final_path: PathBuf },
    Error(String),
}

impl TransferClient {
    pub fn new(base_url: String, client_id: String, token: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            client_id,
            token,
        }
    }

    async fn missing(&self, transfer_id: &str, existing: &[u32]) -> Result<Vec<u32>> {
        let url = format!(
            "{}/api/files/{}/missing",
            self.base_url.trim_end_matches('/'),
            transfer_id
        );
        let response = self
            .http
            .post(&url)
            .header(CLIENT_ID_HEADER, &self.client_id)
            .header(TOKEN_HEADER, &self.token)
            .json(&MissingChunksRequest {
                existing: existing.to_vec(),
            })
            .send()
            .await
            .map_err(|err| Error::Timeout(err.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::InvalidToken);
        }

        let body: MissingChunksResponse = response
            .json()
            .await
            .map_err(|err| Error::MalformedPayload(err.to_string()))?;
        Ok(body.missing)
    }

    async fn fetch_chunk(&self, transfer_id: &str, index: u32) -> Result<Vec<u8>> {
        let url = format!(
            "{}/api/files/{}/chunk/{}",
            self.base_url.trim_end_matches('/'),
            transfer_id,
            index
        );
        let response = self
            .http
            .get(&url)
            .header(CLIENT_ID_HEADER, &self.client_id)
            .header(TOKEN_HEADER, &self.token)
            .send()
            .await
            .map_err(|err| Error::Timeout(err.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::InvalidToken);
        }

        let declared_sha256 = response
            .headers()
            .get(CHUNK_SHA_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| Error::MalformedPayload("missing chunk hash header".into()))?;

        let body = response
            .bytes()
            .await
            .map_err(|err| Error::MalformedPayload(err.to_string()))?
            .to_vec();

        if sha256_hex(&body) != declared_sha256.to_uppercase() {
            return Err(Error::ChunkHashMismatch { index });
        }

        Ok(body)
    }
}

/// Resolve (or create) the partial file and resume state for
/// `assignment`, loading any prior progress from `store`.
pub fn resume_or_start(store: &Store, assignment: &FileTransferAssignment, downloads_dir: &Path) -> Result<(PathBuf, Vec<u32>)> {
    std::fs::create_dir_all(downloads_dir)?;
    let partial_path = downloads_dir.join(format!("{}.partial", assignment.transfer_id));

    if let Some(row) = store.get_transfer_resume(&assignment.transfer_id)? {
        return Ok((partial_path, row.completed_chunks));
    }

    let file = std::fs::File::create(&partial_path)?;
    file.set_len(assignment.file_size)?;

    store.upsert_transfer_resume(&TransferResumeRow {
        transfer_id: assignment.transfer_id.clone(),
        file_name: assignment.file_name.clone(),
        sha256: assignment.sha256.clone(),
        chunk_size: assignment.chunk_size,
        total_chunks: assignment.total_chunks,
        completed_chunks: Vec::new(),
        partial_file_path: Some(partial_path.to_string_lossy().to_string()),
        updated_at: now_timestamp(),
    })?;

    Ok((partial_path, Vec::new()))
}

/// Download and persist exactly one missing chunk (or finalize, if none
/// remain). Bounded to at most one network round trip so it fits inside
/// one main-loop iteration.
pub async fn advance(
    client: &TransferClient,
    store: &Store,
    assignment: &FileTransferAssignment,
    partial_path: &Path,
    completed_chunks: &mut Vec<u32>,
) -> AdvanceOutcome {
    let missing = match client.missing(&assignment.transfer_id, completed_chunks).await {
        Ok(missing) => missing,
        Err(err) => return AdvanceOutcome::Error(err.to_string()),
    };

    let Some(&index) = missing.first() else {
        return finalize(store, assignment, partial_path).unwrap_or_else(|err| AdvanceOutcome::Error(err.to_string()));
    };

    let bytes = match client.fetch_chunk(&assignment.transfer_id, index).await {
        Ok(bytes) => bytes,
        Err(err) => return AdvanceOutcome::Error(err.to_string()),
    };

    if let Err(err) = write_chunk_at_offset(partial_path, index, assignment.chunk_size, &bytes) {
        return AdvanceOutcome::Error(err.to_string());
    }

    completed_chunks.push(index);
    let _ = store.upsert_transfer_resume(&TransferResumeRow {
        transfer_id: assignment.transfer_id.clone(),
        file_name: assignment.file_name.clone(),
        sha256: assignment.sha256.clone(),
        chunk_size: assignment.chunk_size,
        total_chunks: assignment.total_chunks,
        completed_chunks: completed_chunks.clone(),
        partial_file_path: Some(partial_path.to_string_lossy().to_string()),
        updated_at: now_timestamp(),
    });

    AdvanceOutcome::Progress {
        completed_chunks: completed_chunks.len() as u32,
        total_chunks: assignment.total_chunks,
    }
}

fn write_chunk_at_offset(partial_path: &Path, index: u32, chunk_size: u64, bytes: &[u8]) -> Result<()> {
    let mut file = std::fs::OpenOptions::new().write(true).open(partial_path)?;
    file.seek(SeekFrom::Start(index as u64 * chunk_size))?;
    file.write_all(bytes)?;
    Ok(())
}

/// Verify the whole-file hash and promote the partial file to its final
/// name, per §4.8's "full file's SHA-256 MUST equal the manifest sha256
/// before the partial-file is promoted" invariant.
fn finalize(store: &Store, assignment: &FileTransferAssignment, partial_path: &Path) -> Result<AdvanceOutcome> {
    let data = std::fs::read(partial_path)?;
    let actual = sha256_hex(&data);
    if actual != assignment.sha256 {
        return Ok(AdvanceOutcome::Error(format!(
            "whole-file hash mismatch: expected {} got {actual}",
            assignment.sha256
        )));
    }

    let final_path = partial_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(&assignment.file_name);
    std::fs::rename(partial_path, &final_path)?;
    store.delete_transfer_resume(&assignment.transfer_id)?;

    Ok(AdvanceOutcome::Complete { final_path })
}
