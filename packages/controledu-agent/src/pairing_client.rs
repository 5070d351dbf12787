//! Pairing HTTP client (C8), student side.
//!
//! Completes a one-time PIN against a discovered or manually-entered
//! server and turns the response into a [`StudentBinding`] sealed by the
//! platform [`SecretProtector`].

use controledu_core::error::{Error, Result};
use controledu_core::protocol::{PairingRequest, PairingResponse};
use controledu_core::secret_store::SecretProtector;
use controledu_core::storage::StudentBinding;
use controledu_core::time::now_timestamp;
use zeroize::Zeroize;

pub struct PairingClient {
    http: reqwest::Client,
}

impl PairingClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    /// POST `/api/pairing/complete` against `base_url` and seal the
    /// returned token with `protector`.
    pub async fn complete(
        &self,
        base_url: &str,
        pin: &str,
        host_name: &str,
        user_name: &str,
        os_description: &str,
        local_ip: Option<String>,
        protector: &dyn SecretProtector,
    ) -> Result<StudentBinding> {
        let request = PairingRequest {
            pin: pin.to_string(),
            host_name: host_name.to_string(),
            user_name: user_name.to_string(),
            os_description: os_description.to_string(),
            local_ip,
        };

        let url = format!("{}/api/pairing/complete", base_url.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|err| Error::Timeout(err.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::InvalidPairingPin);
        }

        let mut body: PairingResponse = response
            .json()
            .await
            .map_err(|err| Error::MalformedPayload(err.to_string()))?;

        let protected_token = protector.protect(body.token.as_bytes())?;
        body.token.zeroize();

        // `body.base_url` is the hub's own idea of its address, which it
        // cannot always know (e.g. it may be bound to a wildcard
        // address). `base_url` is the address that actually reached it
        // for this call, so it is what future reconnects must reuse.
        Ok(StudentBinding {
            server_id: body.server_id,
            server_name: body.server_name,
            server_base_url: base_url.to_string(),
            server_fingerprint: body.fingerprint,
            client_id: body.client_id,
            protected_token,
            updated_at: now_timestamp(),
        })
    }
}

impl Default for PairingClient {
    fn default() -> Self {
        Self::new()
    }
}
