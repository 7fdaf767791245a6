use crate::domain::DomainResult;

/// Message authentication for device submissions.
///
/// Signatures are base64 encoded and cover `timestamp + "." + payload`.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
pub trait SignatureService: Send + Sync {
    /// Compute the signature a device holding `secret` would send.
    fn compute(&self, secret: &str, timestamp: &str, payload: &str) -> DomainResult<String>;

    /// Compare two encoded signatures without leaking where they differ.
    ///
    /// Never fails: malformed input simply does not verify.
    fn verify(&self, expected: &str, computed: &str) -> bool;
}
