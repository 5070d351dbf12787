//! # Secret protector (C2)
//!
//! Opaque per-user encryption of the paired-client binding token.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      SECRET PROTECTOR                                   │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │  protect(plain)   -> opaque byte blob                                   │
//! │  unprotect(opaque) -> plain bytes                                       │
//! │                                                                         │
//! │  Windows: DPAPI, CRYPTPROTECT_UI_FORBIDDEN, user-scoped (not machine-   │
//! │           scoped) so copying the data directory to another account     │
//! │           fails closed.                                                │
//! │  Elsewhere: identity passthrough, name() marks it as non-opaque so     │
//! │             callers can refuse it in production.                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use crate::error::Result;

/// Platform secret-protection contract used to seal the paired-client
/// binding token before it touches disk.
///
/// `unprotect(protect(plain)) == plain` must hold for any implementation.
pub trait SecretProtector: Send + Sync {
    /// Seal `plain` into an opaque blob only this user/account can open.
    fn protect(&self, plain: &[u8]) -> Result<Vec<u8>>;

    /// Open a blob previously produced by [`protect`](Self::protect).
    fn unprotect(&self, opaque: &[u8]) -> Result<Vec<u8>>;

    /// Identifies the implementation so callers can refuse a non-opaque
    /// protector in production (e.g. `"identity"` is never acceptable
    /// outside of development).
    fn name(&self) -> &'static str;

    /// Whether this implementation actually provides confidentiality.
    fn is_opaque(&self) -> bool {
        self.name() != "identity"
    }
}

/// Identity protector: stores bytes unchanged. Acceptable for non-Windows
/// development only; [`SecretProtector::is_opaque`] returns `false`.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityProtector;

impl SecretProtector for IdentityProtector {
    fn protect(&self, plain: &[u8]) -> Result<Vec<u8>> {
        Ok(plain.to_vec())
    }

    fn unprotect(&self, opaque: &[u8]) -> Result<Vec<u8>> {
        Ok(opaque.to_vec())
    }

    fn name(&self) -> &'static str {
        "identity"
    }
}

/// Picks the best protector available on this platform: DPAPI on Windows,
/// the identity passthrough everywhere else.
pub fn platform_protector() -> Box<dyn SecretProtector> {
    #[cfg(target_os = "windows")]
    {
        Box::new(windows::DpapiProtector)
    }
    #[cfg(not(target_os = "windows"))]
    {
        Box::new(IdentityProtector)
    }
}

#[cfg(target_os = "windows")]
mod windows {
    use super::SecretProtector;
    use crate::error::{Error, Result};
    use std::ptr;
    use windows_sys::Win32::Foundation::{LocalFree, FALSE};
    use windows_sys::Win32::Security::Cryptography::{
        CryptProtectData, CryptUnprotectData, CRYPTOAPI_BLOB as CRYPT_INTEGER_BLOB,
        CRYPTPROTECT_UI_FORBIDDEN,
    };

    /// DPAPI-backed protector, scoped to the current Windows user (not
    /// machine-wide) so the ciphertext cannot be opened after the data
    /// directory is moved to another account.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct DpapiProtector;

    fn blob_of(data: &mut [u8]) -> CRYPT_INTEGER_BLOB {
        CRYPT_INTEGER_BLOB {
            cbData: data.len() as u32,
            pbData: data.as_mut_ptr(),
        }
    }

    impl SecretProtector for DpapiProtector {
        fn protect(&self, plain: &[u8]) -> Result<Vec<u8>> {
            let mut input = plain.to_vec();
            let mut in_blob = blob_of(&mut input);
            let mut out_blob = CRYPT_INTEGER_BLOB {
                cbData: 0,
                pbData: ptr::null_mut(),
            };

            // SAFETY: in_blob/out_blob point to valid, live memory for the
            // duration of this call; the output buffer is freed via
            // LocalFree immediately below.
            let ok = unsafe {
                CryptProtectData(
                    &mut in_blob,
                    ptr::null(),
                    ptr::null_mut(),
                    ptr::null_mut(),
                    ptr::null_mut(),
                    CRYPTPROTECT_UI_FORBIDDEN,
                    &mut out_blob,
                )
            };

            if ok == FALSE {
                return Err(Error::SecretProtectorUnavailable(
                    "CryptProtectData failed".into(),
                ));
            }

            let sealed =
                unsafe { std::slice::from_raw_parts(out_blob.pbData, out_blob.cbData as usize) }
                    .to_vec();
            unsafe { LocalFree(out_blob.pbData as isize) };

            Ok(sealed)
        }

        fn unprotect(&self, opaque: &[u8]) -> Result<Vec<u8>> {
            let mut input = opaque.to_vec();
            let mut in_blob = blob_of(&mut input);
            let mut out_blob = CRYPT_INTEGER_BLOB {
                cbData: 0,
                pbData: ptr::null_mut(),
            };

            // SAFETY: same invariants as `protect`.
            let ok = unsafe {
                CryptUnprotectData(
                    &mut in_blob,
                    ptr::null_mut(),
                    ptr::null_mut(),
                    ptr::null_mut(),
                    ptr::null_mut(),
                    CRYPTPROTECT_UI_FORBIDDEN,
                    &mut out_blob,
                )
            };

            if ok == FALSE {
                return Err(Error::SecretProtectorUnavailable(
                    "CryptUnprotectData failed".into(),
                ));
            }

            let plain =
                unsafe { std::slice::from_raw_parts(out_blob.pbData, out_blob.cbData as usize) }
                    .to_vec();
            unsafe { LocalFree(out_blob.pbData as isize) };

            Ok(plain)
        }

        fn name(&self) -> &'static str {
            "dpapi"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_round_trip() {
        let protector = IdentityProtector;
        let plain = b"super-secret-token";
        let opaque = protector.protect(plain).unwrap();
        assert_eq!(protector.unprotect(&opaque).unwrap(), plain);
    }

    #[test]
    fn test_identity_is_not_opaque() {
        let protector = IdentityProtector;
        assert_eq!(protector.name(), "identity");
        assert!(!protector.is_opaque());
    }

    #[test]
    fn test_platform_protector_round_trip() {
        let protector = platform_protector();
        let plain = b"round trip me";
        let opaque = protector.protect(plain).unwrap();
        assert_eq!(protector.unprotect(&opaque).unwrap(), plain);
    }
}
