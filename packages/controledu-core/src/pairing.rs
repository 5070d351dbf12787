//! # Pairing & identity (C8)
//!
//! One-time PIN issuance and single-shot consumption, plus clientId/token
//! minting for a freshly paired device. The PIN table is a concurrent map
//! keyed by the 6-digit code; `try_consume` is the only way a PIN leaves
//! the table, and it removes-and-returns atomically so the same code can
//! never be consumed twice.

use dashmap::DashMap;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::time::now_timestamp;

/// Maximum lifetime of an issued pairing PIN, in seconds.
pub const PIN_LIFETIME_SECONDS: i64 = 60;

/// A short-lived, one-shot pairing code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingPin {
    pub pin: String,
    pub expires_at_utc: i64,
}

/// Concurrent table of outstanding pairing PINs.
#[derive(Default)]
pub struct PinTable {
    pins: DashMap<String, i64>,
}

impl PinTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a uniformly-distributed 6-digit decimal PIN with a lifetime
    /// of [`PIN_LIFETIME_SECONDS`].
    pub fn generate(&self) -> PairingPin {
        let mut bytes = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut bytes);
        let code = u32::from_be_bytes(bytes) % 1_000_000;
        let pin = format!("{code:06}");
        let expires_at_utc = now_timestamp() + PIN_LIFETIME_SECONDS;
        self.pins.insert(pin.clone(), expires_at_utc);
        PairingPin { pin, expires_at_utc }
    }

    /// Single-shot atomic check-and-remove. Returns `true` exactly once
    /// per valid, unexpired PIN; any later call with the same code (or a
    /// call after expiry) returns `false`.
    pub fn try_consume(&self, pin: &str) -> bool {
        match self.pins.remove(pin) {
            Some((_, expires_at_utc)) => expires_at_utc > now_timestamp(),
            None => false,
        }
    }

    /// Drop expired entries so the table does not grow unbounded across a
    /// long-running server session. Safe to call on any cadence; never
    /// required for correctness since `try_consume` already re-checks
    /// expiry.
    pub fn sweep_expired(&self) {
        let now = now_timestamp();
        self.pins.retain(|_, expires_at_utc| *expires_at_utc > now);
    }
}

/// Mint a fresh 128-bit clientId, hex-encoded.
pub fn mint_client_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Mint a fresh 256-bit token, hex-encoded (≥ 32 bytes entropy per the
/// data model's `PairedClient.token` invariant).
pub fn mint_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pin_is_six_digits() {
        let table = PinTable::new();
        let pin = table.generate();
        assert_eq!(pin.pin.len(), 6);
        assert!(pin.pin.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_try_consume_is_single_shot() {
        let table = PinTable::new();
        let pin = table.generate();
        assert!(table.try_consume(&pin.pin));
        assert!(!table.try_consume(&pin.pin));
    }

    #[test]
    fn test_try_consume_unknown_pin_fails() {
        let table = PinTable::new();
        assert!(!table.try_consume("000000"));
    }

    #[test]
    fn test_expired_pin_fails_even_before_sweep() {
        let table = PinTable::new();
        let pin = table.generate();
        table.pins.insert(pin.pin.clone(), now_timestamp() - 1);
        assert!(!table.try_consume(&pin.pin));
    }

    #[test]
    fn test_sweep_expired_removes_only_expired() {
        let table = PinTable::new();
        let live = table.generate();
        let dead = table.generate();
        table.pins.insert(dead.pin.clone(), now_timestamp() - 10);
        table.sweep_expired();
        assert_eq!(table.pins.len(), 1);
        assert!(table.pins.contains_key(&live.pin));
    }

    #[test]
    fn test_mint_client_id_and_token_are_unique_and_sized() {
        let id1 = mint_client_id();
        let id2 = mint_client_id();
        assert_ne!(id1, id2);
        assert_eq!(id1.len(), 32); // 16 bytes hex-encoded

        let t1 = mint_token();
        let t2 = mint_token();
        assert_ne!(t1, t2);
        assert_eq!(t1.len(), 64); // 32 bytes hex-encoded
    }
}
