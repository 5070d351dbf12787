//! # Database Schema
//!
//! SQL schema definitions for the durable store (C3), shared by the hub
//! and the student agent. Each binary populates only the families it
//! needs: the hub uses `paired_clients` and `transfer_resume`, the agent
//! uses `student_binding`; both use `settings` and `audit_log`.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         DATABASE SCHEMA                                 │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │  settings          key/value, string values, JSON-encoded               │
//! │  student_binding   at-most-one row (agent side)                         │
//! │  paired_clients    keyed by client_id, unique (hub side)                │
//! │  audit_log         append-only, indexed by timestamp                    │
//! │  transfer_resume   per-transfer resume state, keyed by transfer_id      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 2;

/// SQL to create all tables (fresh database).
pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY
);

-- Key/value settings store (JSON-encoded values)
CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);

-- At-most-one student binding (agent side): which server this device is paired to
CREATE TABLE IF NOT EXISTS student_binding (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    server_id TEXT NOT NULL,
    server_name TEXT NOT NULL,
    server_base_url TEXT NOT NULL,
    server_fingerprint TEXT NOT NULL,
    client_id TEXT NOT NULL,
    protected_token BLOB NOT NULL,
    updated_at INTEGER NOT NULL
);

-- Paired clients (hub side): one row per paired student device
CREATE TABLE IF NOT EXISTS paired_clients (
    client_id TEXT PRIMARY KEY,
    token TEXT NOT NULL,
    host_name TEXT NOT NULL,
    user_name TEXT NOT NULL,
    os_description TEXT NOT NULL,
    local_ip TEXT,
    created_at INTEGER NOT NULL,
    token_expires_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_paired_clients_expiry ON paired_clients(token_expires_at);

-- Append-only audit log
CREATE TABLE IF NOT EXISTS audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp INTEGER NOT NULL,
    action TEXT NOT NULL,
    actor TEXT NOT NULL,
    details TEXT
);
CREATE INDEX IF NOT EXISTS idx_audit_log_timestamp ON audit_log(timestamp);

-- Per-transfer resume state (hub side bookkeeping for in-flight transfers)
CREATE TABLE IF NOT EXISTS transfer_resume (
    transfer_id TEXT PRIMARY KEY,
    file_name TEXT NOT NULL,
    sha256 TEXT NOT NULL,
    chunk_size INTEGER NOT NULL,
    total_chunks INTEGER NOT NULL,
    completed_chunks_json TEXT NOT NULL DEFAULT '[]',
    updated_at INTEGER NOT NULL
);
"#;

/// Migration SQL from schema version 1 → 2.
///
/// Adds the partial-file path column to `transfer_resume` so the agent
/// side of a resumed download can locate its in-progress file without a
/// second lookup table.
pub const MIGRATE_V1_TO_V2: &str = r#"
ALTER TABLE transfer_resume ADD COLUMN partial_file_path TEXT;

UPDATE schema_version SET version = 2;
"#;
