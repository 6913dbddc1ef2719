//! HMAC-SHA256 signatures and constant-time comparison for webhook
//! authentication.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Signature validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    /// Missing or empty signature header.
    #[error("signature header missing")]
    MissingSignature,
    /// Invalid signature format.
    #[error("invalid signature format: {0}")]
    InvalidFormat(String),
    /// Signature verification failed.
    #[error("signature mismatch")]
    VerificationFailed,
    /// Invalid secret key.
    #[error("invalid secret key")]
    InvalidSecret,
}

/// Validates a GitHub-style `sha256=<hex>` signature over `payload`.
///
/// Raw 64-character hex is accepted as well.
///
/// # Errors
///
/// Returns the reason the signature was not accepted.
pub fn validate_signature(
    payload: &[u8],
    signature: &str,
    secret: &[u8],
) -> Result<(), SignatureError> {
    if signature.is_empty() {
        return Err(SignatureError::MissingSignature);
    }

    if secret.is_empty() {
        return Err(SignatureError::InvalidSecret);
    }

    let hex_signature = parse_signature_format(signature)?;
    let expected_signature = generate_hmac_hex(payload, secret)?;

    if timing_safe_eq(hex_signature.to_ascii_lowercase().as_bytes(), expected_signature.as_bytes()) {
        Ok(())
    } else {
        Err(SignatureError::VerificationFailed)
    }
}

/// Generates an HMAC-SHA256 signature as lowercase hex.
///
/// # Errors
///
/// Returns `SignatureError::InvalidSecret` if the key is rejected.
pub fn generate_hmac_hex(payload: &[u8], secret: &[u8]) -> Result<String, SignatureError> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| SignatureError::InvalidSecret)?;

    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Strips the `sha256=` prefix; bare hex must be a full 64-character digest.
fn parse_signature_format(signature: &str) -> Result<&str, SignatureError> {
    if let Some(hex) = signature.strip_prefix("sha256=") {
        return Ok(hex);
    }

    if signature.len() == 64 && signature.chars().all(|c| c.is_ascii_hexdigit()) {
        return Ok(signature);
    }

    Err(SignatureError::InvalidFormat(
        "expected 'sha256=<hex>' or 64 hex characters".to_string(),
    ))
}

/// Constant-time byte comparison.
///
/// Length differences return early; lengths are not secret here.
pub fn timing_safe_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (a_byte, b_byte) in a.iter().zip(b.iter()) {
        result |= a_byte ^ b_byte;
    }

    result == 0
}
