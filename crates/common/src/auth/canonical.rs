//! Canonical JSON form used for signing.
//!
//! Devices and the ingestion gateway both sign the RFC 8785 (JCS) form of
//! the envelope: object keys sorted by UTF-16 code units, no insignificant
//! whitespace, ECMAScript number formatting and minimal string escaping.
//! The signed message is `timestamp + "." + canonical_json`.

use crate::auth::SignatureService;
use crate::domain::{DomainError, DomainResult};
use serde::Serialize;
use serde_json_canonicalizer::to_vec as canonicalize;

/// Serialize any value into its canonical JSON string.
pub fn canonical_json<T: Serialize>(value: &T) -> DomainResult<String> {
    let bytes = canonicalize(value)
        .map_err(|e| DomainError::SchemaViolation(format!("cannot canonicalize payload: {}", e)))?;

    String::from_utf8(bytes)
        .map_err(|e| DomainError::SchemaViolation(format!("canonical payload is not UTF-8: {}", e)))
}

/// Sign a payload the way a device does before submission.
pub fn sign_payload<T: Serialize>(
    signer: &dyn SignatureService,
    secret: &str,
    timestamp: &str,
    payload: &T,
) -> DomainResult<String> {
    let canonical = canonical_json(payload)?;
    signer.compute(secret, timestamp, &canonical)
}
