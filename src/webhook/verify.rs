//! Webhook signature verification.
//!
//! Providers sign each delivery with HMAC-SHA256 over `{timestamp}.{body}`
//! and send a `t=...,v1=...` header. Verification rejects skewed timestamps
//! before touching the signature and compares digests in constant time.

use crate::error::{PaygateError, Result};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Verifier bound to one endpoint secret.
///
/// The secret is held as a [`SecretString`] so it never appears in debug
/// output.
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: SecretString,
    tolerance_seconds: i64,
}

impl SignatureVerifier {
    #[must_use]
    pub fn new(secret: impl Into<SecretString>, tolerance_seconds: i64) -> Self {
        Self {
            secret: secret.into(),
            tolerance_seconds,
        }
    }

    /// Verify `signature_header` against the raw request body.
    ///
    /// Returns the signed timestamp on success so callers can log it.
    pub fn verify(&self, payload: &[u8], signature_header: &str, now: i64) -> Result<i64> {
        let parts = parse_signature_header(signature_header)?;

        if (now - parts.timestamp).abs() > self.tolerance_seconds {
            return Err(PaygateError::validation("webhook timestamp outside tolerance"));
        }

        let mut mac = HmacSha256::new_from_slice(self.secret.expose_secret().as_bytes())
            .map_err(|_| PaygateError::internal("webhook secret rejected by HMAC"))?;
        mac.update(parts.timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        let expected = mac.finalize().into_bytes();

        let provided = hex::decode(&parts.signature)
            .map_err(|_| PaygateError::validation("malformed webhook signature"))?;

        if expected.ct_eq(provided.as_slice()).unwrap_u8() != 1 {
            return Err(PaygateError::validation("webhook signature mismatch"));
        }

        Ok(parts.timestamp)
    }
}

struct SignatureParts {
    timestamp: i64,
    signature: String,
}

fn parse_signature_header(header: &str) -> Result<SignatureParts> {
    let mut timestamp = None;
    let mut signature = None;

    for part in header.split(',') {
        let Some((key, value)) = part.split_once('=') else {
            return Err(PaygateError::validation("malformed signature header"));
        };
        match key.trim() {
            "t" => timestamp = value.parse().ok(),
            "v1" => signature = Some(value.to_string()),
            // Ignore other scheme versions.
            _ => {}
        }
    }

    Ok(SignatureParts {
        timestamp: timestamp
            .ok_or_else(|| PaygateError::validation("missing timestamp in signature header"))?,
        signature: signature
            .ok_or_else(|| PaygateError::validation("missing v1 signature in header"))?,
    })
}

/// Sign a payload the way the provider would. For tests and local tooling.
#[must_use]
pub fn sign_payload(secret: &str, payload: &[u8], timestamp: i64) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes()))
}
