//! HMAC-SHA256 signatures over the injected identity headers
//!
//! The backend recomputes the signature with the shared secret to check that
//! the identity headers were set by the proxy and not by a client.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("signing secret is empty")]
    EmptySecret,

    #[error("failed to initialize HMAC")]
    HmacInitFailed,
}

/// Signs `customer_id + "\n" + hostname` with a shared secret
#[derive(Clone)]
pub struct RequestSigner {
    mac: HmacSha256,
}

impl std::fmt::Debug for RequestSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestSigner").finish_non_exhaustive()
    }
}

impl RequestSigner {
    pub fn new(secret: &str) -> Result<Self, SigningError> {
        if secret.is_empty() {
            return Err(SigningError::EmptySecret);
        }
        let mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|_| SigningError::HmacInitFailed)?;
        Ok(Self { mac })
    }

    /// Signer for an optional secret; no secret (or an empty one) disables signing
    pub fn from_secret(secret: Option<&str>) -> Result<Option<Self>, SigningError> {
        match secret {
            Some(secret) if !secret.is_empty() => Self::new(secret).map(Some),
            _ => Ok(None),
        }
    }

    /// Lowercase hex signature. Unmapped hostnames sign an empty customer ID.
    pub fn sign(&self, customer_id: &str, hostname: &str) -> String {
        let mut mac = self.mac.clone();
        Self::feed(&mut mac, customer_id, hostname);
        hex::encode(mac.finalize().into_bytes())
    }

    /// Constant-time check of a hex signature
    pub fn verify(&self, customer_id: &str, hostname: &str, signature: &str) -> bool {
        let Ok(provided) = hex::decode(signature) else {
            return false;
        };
        let mut mac = self.mac.clone();
        Self::feed(&mut mac, customer_id, hostname);
        mac.verify_slice(&provided).is_ok()
    }

    fn feed(mac: &mut HmacSha256, customer_id: &str, hostname: &str) {
        mac.update(customer_id.as_bytes());
        mac.update(b"\n");
        mac.update(hostname.as_bytes());
    }
}
