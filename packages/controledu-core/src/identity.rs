//! # Server identity (part of C8)
//!
//! The teacher server's stable identity: a random opaque id minted once on
//! first run and persisted forever after, plus a human display name and a
//! fingerprint derived from the id so a student can sanity-check it is
//! still talking to the same server across reconnects.

use serde::{Deserialize, Serialize};

use crate::chunking::sha256_hex;
use crate::time::now_iso8601;

/// Stable identity of a teacher server, created once on first run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerIdentity {
    pub server_id: String,
    pub display_name: String,
    pub fingerprint: String,
    pub created_at_utc: String,
}

impl ServerIdentity {
    /// Mint a brand-new identity. `display_name` is whatever the teacher
    /// chose (or a hostname-derived default); it is not used in the
    /// fingerprint so renaming the server never changes its fingerprint.
    pub fn generate(display_name: impl Into<String>) -> Self {
        let server_id = uuid::Uuid::new_v4().to_string();
        let fingerprint = fingerprint_of(&server_id);
        Self {
            server_id,
            display_name: display_name.into(),
            fingerprint,
            created_at_utc: now_iso8601(),
        }
    }

    /// Rebuild an identity from its persisted fields, recomputing the
    /// fingerprint (it is derived, never stored as an independent value
    /// that could drift from `server_id`).
    pub fn from_persisted(server_id: String, display_name: String, created_at_utc: String) -> Self {
        let fingerprint = fingerprint_of(&server_id);
        Self {
            server_id,
            display_name,
            fingerprint,
            created_at_utc,
        }
    }
}

/// `fingerprint = SHA-256(serverId hex)`, per the data model.
fn fingerprint_of(server_id: &str) -> String {
    sha256_hex(server_id.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_produces_matching_fingerprint() {
        let identity = ServerIdentity::generate("Room 204");
        assert_eq!(identity.fingerprint, fingerprint_of(&identity.server_id));
        assert_eq!(identity.display_name, "Room 204");
    }

    #[test]
    fn test_fingerprint_is_stable_across_renames() {
        let a = ServerIdentity::from_persisted("srv-1".into(), "Room 204".into(), "2026-01-01T00:00:00Z".into());
        let b = ServerIdentity::from_persisted("srv-1".into(), "Room 205".into(), "2026-01-01T00:00:00Z".into());
        assert_eq!(a.fingerprint, b.fingerprint);
        assert_ne!(a.display_name, b.display_name);
    }

    #[test]
    fn test_distinct_ids_produce_distinct_fingerprints() {
        let a = ServerIdentity::generate("A");
        let b = ServerIdentity::generate("B");
        assert_ne!(a.server_id, b.server_id);
        assert_ne!(a.fingerprint, b.fingerprint);
    }
}
