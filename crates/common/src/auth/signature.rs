use crate::auth::SignatureService;
use crate::domain::{DomainError, DomainResult};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 implementation of SignatureService
#[derive(Default, Clone)]
pub struct HmacSignatureService;

impl HmacSignatureService {
    pub fn new() -> Self {
        Self
    }
}

impl SignatureService for HmacSignatureService {
    fn compute(&self, secret: &str, timestamp: &str, payload: &str) -> DomainResult<String> {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| DomainError::Crypto(e.to_string()))?;

        mac.update(timestamp.as_bytes());
        mac.update(b".");
        mac.update(payload.as_bytes());

        Ok(STANDARD.encode(mac.finalize().into_bytes()))
    }

    fn verify(&self, expected: &str, computed: &str) -> bool {
        if expected.is_empty() || computed.is_empty() {
            return false;
        }

        // Cheap reject only; the real comparison happens on decoded bytes
        if expected.len() != computed.len() {
            return false;
        }

        let (Ok(expected), Ok(computed)) = (STANDARD.decode(expected), STANDARD.decode(computed))
        else {
            return false;
        };

        if expected.len() != computed.len() {
            return false;
        }

        expected.as_slice().ct_eq(computed.as_slice()).into()
    }
}
