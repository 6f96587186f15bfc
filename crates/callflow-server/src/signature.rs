//! Webhook signature verification.
//!
//! The provider signs `"{timestamp}.{raw_body}"` with HMAC-SHA256 and sends
//! `X-Callflow-Signature: sha256=<hex>` alongside `X-Callflow-Timestamp`
//! (unix seconds). Verification fails closed: with no secret configured,
//! nothing is accepted.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-callflow-signature";
pub const TIMESTAMP_HEADER: &str = "x-callflow-timestamp";

const SCHEME_PREFIX: &str = "sha256=";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("no webhook signing secret is configured")]
    NoSecret,
    #[error("missing {0} header")]
    MissingHeader(&'static str),
    #[error("malformed {0} header")]
    Malformed(&'static str),
    #[error("timestamp is outside the accepted window")]
    Expired,
    #[error("signature does not match")]
    Mismatch,
}

pub struct WebhookVerifier {
    secret: Option<Vec<u8>>,
    tolerance: Duration,
}

impl std::fmt::Debug for WebhookVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookVerifier")
            .field("secret", &self.secret.as_ref().map(|_| "[REDACTED]"))
            .field("tolerance", &self.tolerance)
            .finish()
    }
}

impl WebhookVerifier {
    /// An empty secret counts as no secret.
    pub fn new(secret: Option<&str>, tolerance: Duration) -> Self {
        Self {
            secret: secret
                .filter(|s| !s.is_empty())
                .map(|s| s.as_bytes().to_vec()),
            tolerance,
        }
    }

    /// Checks one delivery.
    ///
    /// `now_unix` is the receiver's clock in unix seconds.
    pub fn verify(
        &self,
        timestamp: Option<&str>,
        signature: Option<&str>,
        body: &[u8],
        now_unix: i64,
    ) -> Result<(), SignatureError> {
        let secret = self.secret.as_deref().ok_or(SignatureError::NoSecret)?;
        let timestamp = timestamp.ok_or(SignatureError::MissingHeader(TIMESTAMP_HEADER))?;
        let signature = signature.ok_or(SignatureError::MissingHeader(SIGNATURE_HEADER))?;

        let sent_at: i64 = timestamp
            .trim()
            .parse()
            .map_err(|_| SignatureError::Malformed(TIMESTAMP_HEADER))?;
        if now_unix.abs_diff(sent_at) > self.tolerance.as_secs() {
            return Err(SignatureError::Expired);
        }

        let expected = signature
            .trim()
            .strip_prefix(SCHEME_PREFIX)
            .and_then(|hex_sig| hex::decode(hex_sig).ok())
            .ok_or(SignatureError::Malformed(SIGNATURE_HEADER))?;

        let mac = mac_for(secret, timestamp.trim(), body)?;
        // verify_slice compares in constant time.
        mac.verify_slice(&expected)
            .map_err(|_| SignatureError::Mismatch)
    }
}

/// Produces the `X-Callflow-Signature` value for a body.
pub fn sign(secret: &str, timestamp: i64, body: &[u8]) -> Result<String, SignatureError> {
    let mac = mac_for(secret.as_bytes(), &timestamp.to_string(), body)?;
    Ok(format!(
        "{SCHEME_PREFIX}{}",
        hex::encode(mac.finalize().into_bytes())
    ))
}

fn mac_for(secret: &[u8], timestamp: &str, body: &[u8]) -> Result<HmacSha256, SignatureError> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| SignatureError::NoSecret)?;
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);
    Ok(mac)
}
