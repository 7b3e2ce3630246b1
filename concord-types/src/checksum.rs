//! Content checksums.
//!
//! Payloads are hashed over their compact JSON rendering. `serde_json`
//! keeps object keys sorted, so two structurally equal values always
//! produce the same digest regardless of how they were built.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// SHA-256 of the canonical JSON form of `value`, hex encoded.
#[must_use]
pub fn checksum(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Checksum of an optional payload; `None` hashes like JSON `null`.
#[must_use]
pub fn checksum_opt(value: Option<&Value>) -> String {
    checksum(value.unwrap_or(&Value::Null))
}
