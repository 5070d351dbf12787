//! # Durable store (C3)
//!
//! SQLite-backed store exposing five families: settings key/value,
//! at-most-one student binding, paired-clients, append-only audit log,
//! and per-transfer resume state. All writes go through a single mutex'd
//! connection and each public method is one transaction.

use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::time::now_timestamp;

use super::schema;

/// Durable store handle. Cheaply cloneable; all clones share one
/// connection behind a mutex.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

/// A paired student device, as persisted on the hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairedClient {
    pub client_id: String,
    pub token: String,
    pub host_name: String,
    pub user_name: String,
    pub os_description: String,
    pub local_ip: Option<String>,
    pub created_at: i64,
    pub token_expires_at: i64,
}

/// The agent's local record of which server it is bound to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudentBinding {
    pub server_id: String,
    pub server_name: String,
    pub server_base_url: String,
    pub server_fingerprint: String,
    pub client_id: String,
    /// Opaque blob produced by a [`crate::secret_store::SecretProtector`].
    pub protected_token: Vec<u8>,
    pub updated_at: i64,
}

/// One append-only audit log row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub timestamp: i64,
    pub action: String,
    pub actor: String,
    pub details: Option<String>,
}

/// Per-transfer resume bookkeeping, persisted so an interrupted transfer
/// can resume after a process restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferResumeRow {
    pub transfer_id: String,
    pub file_name: String,
    pub sha256: String,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub completed_chunks: Vec<u32>,
    pub partial_file_path: Option<String>,
    pub updated_at: i64,
}

impl Store {
    /// Open (or create) the store at `path`. `None` opens an in-memory
    /// database, used in tests and for the agent's dev fallback.
    pub fn open(path: Option<&str>) -> Result<Self> {
        let conn = match path {
            Some(p) => Connection::open(p)?,
            None => Connection::open_in_memory()?,
        };
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock();
        let version: Option<i32> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .optional()?;

        match version {
            None => {
                conn.execute_batch(schema::CREATE_TABLES)?;
                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?1)",
                    params![schema::SCHEMA_VERSION],
                )?;
                tracing::info!(version = schema::SCHEMA_VERSION, "store schema created");
            }
            Some(v) if v < schema::SCHEMA_VERSION => {
                tracing::info!(from = v, to = schema::SCHEMA_VERSION, "migrating store schema");
                if v < 2 {
                    conn.execute_batch(schema::MIGRATE_V1_TO_V2)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // (a) settings key/value
    // ------------------------------------------------------------------

    /// Persist a JSON-encoded setting. Overwrites any prior value.
    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, now_timestamp()],
        )?;
        Ok(())
    }

    /// Fetch a setting's raw JSON value, if present.
    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row("SELECT value FROM settings WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?)
    }

    // ------------------------------------------------------------------
    // (b) at-most-one student binding
    // ------------------------------------------------------------------

    /// Replace the single student binding row.
    pub fn set_student_binding(&self, binding: &StudentBinding) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO student_binding
                (id, server_id, server_name, server_base_url, server_fingerprint,
                 client_id, protected_token, updated_at)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                server_id = excluded.server_id,
                server_name = excluded.server_name,
                server_base_url = excluded.server_base_url,
                server_fingerprint = excluded.server_fingerprint,
                client_id = excluded.client_id,
                protected_token = excluded.protected_token,
                updated_at = excluded.updated_at",
            params![
                binding.server_id,
                binding.server_name,
                binding.server_base_url,
                binding.server_fingerprint,
                binding.client_id,
                binding.protected_token,
                binding.updated_at,
            ],
        )?;
        Ok(())
    }

    /// Fetch the student binding, if the device has ever been paired.
    pub fn get_student_binding(&self) -> Result<Option<StudentBinding>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT server_id, server_name, server_base_url, server_fingerprint,
                        client_id, protected_token, updated_at
                 FROM student_binding WHERE id = 1",
                [],
                |row| {
                    Ok(StudentBinding {
                        server_id: row.get(0)?,
                        server_name: row.get(1)?,
                        server_base_url: row.get(2)?,
                        server_fingerprint: row.get(3)?,
                        client_id: row.get(4)?,
                        protected_token: row.get(5)?,
                        updated_at: row.get(6)?,
                    })
                },
            )
            .optional()?)
    }

    /// Clear the student binding (unpair).
    pub fn clear_student_binding(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM student_binding WHERE id = 1", [])?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // (c) paired clients
    // ------------------------------------------------------------------

    /// Insert or replace a paired client row (re-pair replaces the token).
    pub fn upsert_paired_client(&self, client: &PairedClient) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO paired_clients
                (client_id, token, host_name, user_name, os_description,
                 local_ip, created_at, token_expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(client_id) DO UPDATE SET
                token = excluded.token,
                host_name = excluded.host_name,
                user_name = excluded.user_name,
                os_description = excluded.os_description,
                local_ip = excluded.local_ip,
                token_expires_at = excluded.token_expires_at",
            params![
                client.client_id,
                client.token,
                client.host_name,
                client.user_name,
                client.os_description,
                client.local_ip,
                client.created_at,
                client.token_expires_at,
            ],
        )?;
        Ok(())
    }

    /// Fetch a paired client by id.
    pub fn get_paired_client(&self, client_id: &str) -> Result<Option<PairedClient>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT client_id, token, host_name, user_name, os_description,
                        local_ip, created_at, token_expires_at
                 FROM paired_clients WHERE client_id = ?1",
                params![client_id],
                Self::row_to_paired_client,
            )
            .optional()?)
    }

    /// List every paired client.
    pub fn list_paired_clients(&self) -> Result<Vec<PairedClient>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT client_id, token, host_name, user_name, os_description,
                    local_ip, created_at, token_expires_at
             FROM paired_clients ORDER BY created_at",
        )?;
        let rows = stmt
            .query_map([], Self::row_to_paired_client)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Delete a paired client (teacher-initiated revocation).
    pub fn delete_paired_client(&self, client_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "DELETE FROM paired_clients WHERE client_id = ?1",
            params![client_id],
        )?;
        Ok(changed > 0)
    }

    /// Validate `{clientId, token}` against the paired-client store and
    /// the token's expiry. Both checks run together so no distinction
    /// between "unknown client" and "expired token" is observable in
    /// timing.
    pub fn validate_token(&self, client_id: &str, token: &str) -> Result<bool> {
        match self.get_paired_client(client_id)? {
            Some(c) => {
                let token_ok = constant_time_eq(c.token.as_bytes(), token.as_bytes());
                let not_expired = now_timestamp() < c.token_expires_at;
                Ok(token_ok && not_expired)
            }
            None => Ok(false),
        }
    }

    fn row_to_paired_client(row: &rusqlite::Row) -> rusqlite::Result<PairedClient> {
        Ok(PairedClient {
            client_id: row.get(0)?,
            token: row.get(1)?,
            host_name: row.get(2)?,
            user_name: row.get(3)?,
            os_description: row.get(4)?,
            local_ip: row.get(5)?,
            created_at: row.get(6)?,
            token_expires_at: row.get(7)?,
        })
    }

    // ------------------------------------------------------------------
    // (d) append-only audit log
    // ------------------------------------------------------------------

    /// Append one audit entry.
    pub fn append_audit(&self, action: &str, actor: &str, details: Option<&str>) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO audit_log (timestamp, action, actor, details) VALUES (?1, ?2, ?3, ?4)",
            params![now_timestamp(), action, actor, details],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// List audit entries in timestamp order, most recent last, capped at
    /// `limit`.
    pub fn list_audit(&self, limit: u32) -> Result<Vec<AuditEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, action, actor, details
             FROM audit_log ORDER BY timestamp DESC LIMIT ?1",
        )?;
        let mut rows = stmt
            .query_map(params![limit], |row| {
                Ok(AuditEntry {
                    id: row.get(0)?,
                    timestamp: row.get(1)?,
                    action: row.get(2)?,
                    actor: row.get(3)?,
                    details: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.reverse();
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // (e) per-transfer resume state
    // ------------------------------------------------------------------

    /// Insert or update a transfer's resume state.
    pub fn upsert_transfer_resume(&self, row: &TransferResumeRow) -> Result<()> {
        let conn = self.conn.lock();
        let completed_json = serde_json::to_string(&row.completed_chunks)?;
        conn.execute(
            "INSERT INTO transfer_resume
                (transfer_id, file_name, sha256, chunk_size, total_chunks,
                 completed_chunks_json, partial_file_path, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(transfer_id) DO UPDATE SET
                completed_chunks_json = excluded.completed_chunks_json,
                partial_file_path = excluded.partial_file_path,
                updated_at = excluded.updated_at",
            params![
                row.transfer_id,
                row.file_name,
                row.sha256,
                row.chunk_size,
                row.total_chunks,
                completed_json,
                row.partial_file_path,
                row.updated_at,
            ],
        )?;
        Ok(())
    }

    /// Fetch resume state for a transfer, if any.
    pub fn get_transfer_resume(&self, transfer_id: &str) -> Result<Option<TransferResumeRow>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT transfer_id, file_name, sha256, chunk_size, total_chunks,
                        completed_chunks_json, partial_file_path, updated_at
                 FROM transfer_resume WHERE transfer_id = ?1",
                params![transfer_id],
                |row| {
                    let completed_json: String = row.get(5)?;
                    Ok((row, completed_json))
                },
            )
            .optional()?;

        let Some((row, completed_json)) = row else {
            return Ok(None);
        };
        let completed_chunks: Vec<u32> = serde_json::from_str(&completed_json)?;
        Ok(Some(TransferResumeRow {
            transfer_id: row.get(0)?,
            file_name: row.get(1)?,
            sha256: row.get(2)?,
            chunk_size: row.get(3)?,
            total_chunks: row.get(4)?,
            completed_chunks,
            partial_file_path: row.get(6)?,
            updated_at: row.get(7)?,
        }))
    }

    /// Delete a transfer's resume state once the transfer completes.
    pub fn delete_transfer_resume(&self, transfer_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM transfer_resume WHERE transfer_id = ?1",
            params![transfer_id],
        )?;
        Ok(())
    }
}

/// Constant-time byte comparison (for token validation).
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Store {
        Store::open(None).unwrap()
    }

    #[test]
    fn test_settings_round_trip() {
        let s = store();
        assert!(s.get_setting("foo").unwrap().is_none());
        s.set_setting("foo", "\"bar\"").unwrap();
        assert_eq!(s.get_setting("foo").unwrap().unwrap(), "\"bar\"");
    }

    #[test]
    fn test_student_binding_at_most_one() {
        let s = store();
        assert!(s.get_student_binding().unwrap().is_none());

        let binding = StudentBinding {
            server_id: "srv-1".into(),
            server_name: "Room 204".into(),
            server_base_url: "http://192.168.1.5:40556".into(),
            server_fingerprint: "ABCDEF".into(),
            client_id: "client-1".into(),
            protected_token: vec![1, 2, 3],
            updated_at: now_timestamp(),
        };
        s.set_student_binding(&binding).unwrap();
        assert_eq!(s.get_student_binding().unwrap().unwrap().client_id, "client-1");

        let rebind = StudentBinding {
            client_id: "client-2".into(),
            ..binding
        };
        s.set_student_binding(&rebind).unwrap();
        assert_eq!(s.get_student_binding().unwrap().unwrap().client_id, "client-2");

        s.clear_student_binding().unwrap();
        assert!(s.get_student_binding().unwrap().is_none());
    }

    #[test]
    fn test_paired_client_lifecycle_and_token_validation() {
        let s = store();
        let client = PairedClient {
            client_id: "c1".into(),
            token: "supersecrettoken".into(),
            host_name: "LAPTOP-1".into(),
            user_name: "alice".into(),
            os_description: "Windows 11".into(),
            local_ip: Some("192.168.1.42".into()),
            created_at: now_timestamp(),
            token_expires_at: now_timestamp() + 3600,
        };
        s.upsert_paired_client(&client).unwrap();

        assert!(s.validate_token("c1", "supersecrettoken").unwrap());
        assert!(!s.validate_token("c1", "wrong").unwrap());
        assert!(!s.validate_token("nonexistent", "supersecrettoken").unwrap());

        assert_eq!(s.list_paired_clients().unwrap().len(), 1);
        assert!(s.delete_paired_client("c1").unwrap());
        assert!(!s.delete_paired_client("c1").unwrap());
        assert!(!s.validate_token("c1", "supersecrettoken").unwrap());
    }

    #[test]
    fn test_token_expiry_fails_validation() {
        let s = store();
        let client = PairedClient {
            client_id: "expired".into(),
            token: "tok".into(),
            host_name: "h".into(),
            user_name: "u".into(),
            os_description: "o".into(),
            local_ip: None,
            created_at: now_timestamp() - 7200,
            token_expires_at: now_timestamp() - 3600,
        };
        s.upsert_paired_client(&client).unwrap();
        assert!(!s.validate_token("expired", "tok").unwrap());
    }

    #[test]
    fn test_audit_log_append_only_and_ordered() {
        let s = store();
        s.append_audit("pair", "teacher", None).unwrap();
        s.append_audit("unpair", "teacher", Some("revoked")).unwrap();
        let entries = s.list_audit(10).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].action, "pair");
        assert_eq!(entries[1].action, "unpair");
        assert_eq!(entries[1].details.as_deref(), Some("revoked"));
    }

    #[test]
    fn test_transfer_resume_round_trip() {
        let s = store();
        assert!(s.get_transfer_resume("t1").unwrap().is_none());

        let row = TransferResumeRow {
            transfer_id: "t1".into(),
            file_name: "worksheet.pdf".into(),
            sha256: "ABCD".into(),
            chunk_size: 262144,
            total_chunks: 8,
            completed_chunks: vec![0, 2, 3, 7],
            partial_file_path: Some("/tmp/t1.part".into()),
            updated_at: now_timestamp(),
        };
        s.upsert_transfer_resume(&row).unwrap();

        let fetched = s.get_transfer_resume("t1").unwrap().unwrap();
        assert_eq!(fetched.completed_chunks, vec![0, 2, 3, 7]);

        s.delete_transfer_resume("t1").unwrap();
        assert!(s.get_transfer_resume("t1").unwrap().is_none());
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }
}
