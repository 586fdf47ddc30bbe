//! Shared-secret request signing.
//!
//! A signature is `hex(sha256(secret || decimal_timestamp))`. It is accepted
//! only while the timestamp lies within a tolerance window around the time
//! of receipt, and the digest comparison runs in constant time.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::bundle::unix_now;

/// Default accepted clock skew between peers, in seconds.
pub const DEFAULT_TIMESTAMP_TOLERANCE: i64 = 30;

/// Reasons an authentication attempt is refused
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthFailure {
    #[error("timestamp {timestamp} outside tolerance (now {now}, tolerance {tolerance}s)")]
    StaleTimestamp {
        timestamp: i64,
        now: i64,
        tolerance: i64,
    },

    #[error("signature mismatch")]
    BadSignature,
}

/// Signs and verifies timestamped tokens with a shared secret.
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: String,
    tolerance_secs: i64,
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("secret", &"<redacted>")
            .field("tolerance_secs", &self.tolerance_secs)
            .finish()
    }
}

impl SignatureVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            tolerance_secs: DEFAULT_TIMESTAMP_TOLERANCE,
        }
    }

    pub fn with_tolerance(mut self, tolerance_secs: i64) -> Self {
        self.tolerance_secs = tolerance_secs.max(0);
        self
    }

    pub fn tolerance_secs(&self) -> i64 {
        self.tolerance_secs
    }

    /// Produce the signature for `timestamp`.
    pub fn sign(&self, timestamp: i64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.secret.as_bytes());
        hasher.update(timestamp.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Verify `signature` for `timestamp` against the current clock.
    pub fn verify(&self, signature: &str, timestamp: i64) -> Result<(), AuthFailure> {
        self.verify_at(signature, timestamp, unix_now())
    }

    /// Verify against an explicit receipt time.
    pub fn verify_at(&self, signature: &str, timestamp: i64, now: i64) -> Result<(), AuthFailure> {
        if now.abs_diff(timestamp) > self.tolerance_secs.unsigned_abs() {
            return Err(AuthFailure::StaleTimestamp {
                timestamp,
                now,
                tolerance: self.tolerance_secs,
            });
        }

        let expected = self.sign(timestamp);
        let provided = signature.trim().to_ascii_lowercase();
        if expected.as_bytes().ct_eq(provided.as_bytes()).into() {
            Ok(())
        } else {
            Err(AuthFailure::BadSignature)
        }
    }
}
