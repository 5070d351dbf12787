//! # Error Handling
//!
//! One error enum for the whole core crate, organized into numbered ranges
//! that mirror the error-handling taxonomy: Transient network,
//! Authentication, Protocol, Integrity, Policy, External degradation, Fatal.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           ERROR HIERARCHY                                │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │  Error (top-level)                                                      │
//! │  ├── Transient (100-199)    - reconnect with backoff, no user surface   │
//! │  ├── Authentication (200-299) - invalid/expired token, 401 on HTTP      │
//! │  ├── Protocol (300-399)     - bad payload, clientId mismatch            │
//! │  ├── Integrity (400-499)    - chunk/file hash mismatch                  │
//! │  ├── Policy (500-599)       - detector disabled, whitelist hit          │
//! │  ├── External (600-699)     - ML model missing, capture unavailable     │
//! │  └── Fatal (900-999)        - unrecoverable at process startup          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Result type alias used throughout the core crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the control plane and detection pipeline.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Transient network (100-199)
    // ========================================================================
    /// The hub connection dropped and a reconnect is in progress.
    #[error("hub connection lost: {0}")]
    HubDisconnected(String),

    /// A discovery probe produced no replies within its timeout.
    #[error("discovery probe timed out")]
    DiscoveryTimeout,

    /// An outbound request exceeded its bounded timeout.
    #[error("operation timed out: {0}")]
    Timeout(String),

    // ========================================================================
    // Authentication (200-299)
    // ========================================================================
    /// clientId/token pair did not match a paired client, or the token expired.
    #[error("invalid or expired token")]
    InvalidToken,

    /// Pairing PIN was unknown, already consumed, or expired.
    #[error("pairing pin is invalid or expired")]
    InvalidPairingPin,

    // ========================================================================
    // Protocol (300-399)
    // ========================================================================
    /// A hub call's clientId did not match the connection's bound clientId.
    #[error("clientId mismatch on hub call")]
    ClientIdMismatch,

    /// A wire payload failed to decode into its expected shape.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// A method was invoked on a connection that never registered.
    #[error("hub call before registration")]
    NotRegistered,

    // ========================================================================
    // Integrity (400-499)
    // ========================================================================
    /// An uploaded chunk's computed hash did not match its declared header.
    #[error("chunk hash mismatch at index {index}")]
    ChunkHashMismatch {
        /// Chunk index that failed verification.
        index: u32,
    },

    /// The reassembled file's SHA-256 did not match the transfer's manifest.
    #[error("reassembled file hash mismatch")]
    FileHashMismatch,

    /// A chunk index fell outside [0, totalChunks).
    #[error("chunk index {index} out of range (total {total})")]
    ChunkIndexOutOfRange {
        /// Offending index.
        index: u32,
        /// Declared chunk count.
        total: u32,
    },

    /// Reassembly was given a different number of chunks than the manifest declares.
    #[error("expected {expected} chunks, got {got}")]
    ChunkCountMismatch {
        /// Chunks declared by the manifest.
        expected: u32,
        /// Chunks actually supplied.
        got: u32,
    },

    /// Reassembly found a gap in the chunk index sequence.
    #[error("missing chunk at index {expected}, found index {found}")]
    ChunkGap {
        /// Index that should have been present next.
        expected: u32,
        /// Index that was actually found.
        found: u32,
    },

    // ========================================================================
    // Policy (500-599)
    // ========================================================================
    /// Requested remote-control transition is not legal from the session's
    /// current state.
    #[error("illegal remote-control transition from {from:?}")]
    IllegalStateTransition {
        /// The state the session was in when the transition was attempted.
        from: String,
    },

    /// A second remote-control session was requested while one is already
    /// active for the same student.
    #[error("a remote-control session already exists for this student")]
    RemoteControlSessionExists,

    // ========================================================================
    // External degradation (600-699)
    // ========================================================================
    /// The secret protector could not reach the platform's user-bound
    /// encryption service and fell back to a degraded mode.
    #[error("secret protector unavailable: {0}")]
    SecretProtectorUnavailable(String),

    /// An ML detector's model artifact was missing or invalid; it disabled
    /// itself rather than erroring.
    #[error("ml detector disabled: {0}")]
    MlDetectorDisabled(String),

    /// JPEG decode failed during the frame-change filter.
    #[error("frame decode failed: {0}")]
    FrameDecodeFailed(String),

    // ========================================================================
    // Fatal (900-999)
    // ========================================================================
    /// The durable store could not be opened or migrated.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A required network port was already bound by another process.
    #[error("failed to bind {0}")]
    PortBindFailed(String),

    /// Catch-all for invariants that should be unreachable in normal operation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Numeric error code for logging and audit entries.
    ///
    /// Ranges: 1xx transient, 2xx authentication, 3xx protocol, 4xx
    /// integrity, 5xx policy, 6xx external degradation, 9xx fatal.
    pub fn code(&self) -> i32 {
        match self {
            Error::HubDisconnected(_) => 100,
            Error::DiscoveryTimeout => 101,
            Error::Timeout(_) => 102,

            Error::InvalidToken => 200,
            Error::InvalidPairingPin => 201,

            Error::ClientIdMismatch => 300,
            Error::MalformedPayload(_) => 301,
            Error::NotRegistered => 302,

            Error::ChunkHashMismatch { .. } => 400,
            Error::FileHashMismatch => 401,
            Error::ChunkIndexOutOfRange { .. } => 402,
            Error::ChunkCountMismatch { .. } => 403,
            Error::ChunkGap { .. } => 404,

            Error::IllegalStateTransition { .. } => 500,
            Error::RemoteControlSessionExists => 501,

            Error::SecretProtectorUnavailable(_) => 600,
            Error::MlDetectorDisabled(_) => 601,
            Error::FrameDecodeFailed(_) => 602,

            Error::StorageUnavailable(_) => 900,
            Error::PortBindFailed(_) => 901,
            Error::Internal(_) => 999,
        }
    }

    /// Whether local recovery (retry, reconnect, re-register) is expected
    /// to resolve this error without user action.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::HubDisconnected(_)
                | Error::DiscoveryTimeout
                | Error::Timeout(_)
                | Error::InvalidToken
        )
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::StorageUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::MalformedPayload(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::StorageUnavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::HubDisconnected("x".into()).code(), 100);
        assert_eq!(Error::InvalidToken.code(), 200);
        assert_eq!(Error::ClientIdMismatch.code(), 300);
        assert_eq!(Error::FileHashMismatch.code(), 401);
        assert_eq!(Error::RemoteControlSessionExists.code(), 501);
        assert_eq!(Error::MlDetectorDisabled("x".into()).code(), 601);
        assert_eq!(Error::Internal("x".into()).code(), 999);
    }

    #[test]
    fn test_recoverable_errors() {
        assert!(Error::Timeout("x".into()).is_recoverable());
        assert!(Error::InvalidToken.is_recoverable());
        assert!(!Error::ClientIdMismatch.is_recoverable());
        assert!(!Error::FileHashMismatch.is_recoverable());
    }
}
