//! # Webhook Verification
//!
//! Messenger webhook checks: the `hub.verify_token` handshake and the
//! `X-Hub-Signature-256` HMAC-SHA256 body signature. All comparisons are constant time.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the Messenger body signature
pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";
const SIGNATURE_PREFIX: &str = "sha256=";

/// Errors that can occur during webhook signature verification
#[derive(Debug, thiserror::Error)]
pub enum VerificationError {
    #[error("Missing required signature header: {header}")]
    MissingSignature { header: String },

    #[error("Invalid signature format: {header}")]
    InvalidSignatureFormat { header: String },

    #[error("Signature verification failed")]
    VerificationFailed,
}

/// Result type for webhook verification
pub type VerificationResult<T> = Result<T, VerificationError>;

/// Verifies an `X-Hub-Signature-256: sha256=<hex>` header against the raw body.
pub fn verify_hub_signature(
    body: &[u8],
    signature_header: &str,
    secret: &str,
) -> VerificationResult<()> {
    debug!(body_size = body.len(), "Starting hub signature verification");

    if signature_header.is_empty() {
        return Err(VerificationError::MissingSignature {
            header: "X-Hub-Signature-256".to_string(),
        });
    }

    let Some(provided_hex) = signature_header.strip_prefix(SIGNATURE_PREFIX) else {
        return Err(VerificationError::InvalidSignatureFormat {
            header: "X-Hub-Signature-256 must start with 'sha256='".to_string(),
        });
    };

    let provided_bytes =
        hex::decode(provided_hex).map_err(|_| VerificationError::InvalidSignatureFormat {
            header: "X-Hub-Signature-256 contains invalid hex".to_string(),
        })?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| VerificationError::VerificationFailed)?;
    mac.update(body);
    let expected_bytes = mac.finalize().into_bytes();

    let expected: &[u8] = expected_bytes.as_ref();
    if expected.ct_eq(&provided_bytes[..]).into() {
        Ok(())
    } else {
        Err(VerificationError::VerificationFailed)
    }
}

/// Constant-time check of the subscription handshake token.
pub fn verify_token_matches(provided: &str, expected: &str) -> bool {
    !expected.is_empty() && provided.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// Signature header value for `body` under `secret`.
pub fn sign_body(body: &[u8], secret: &str) -> VerificationResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| VerificationError::VerificationFailed)?;
    mac.update(body);
    Ok(format!(
        "{}{}",
        SIGNATURE_PREFIX,
        hex::encode(mac.finalize().into_bytes())
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "messenger-app-secret";

    #[test]
    fn test_signature_verification_success() {
        let body = br#"{"object":"page","entry":[]}"#;
        let header = sign_body(body, SECRET).unwrap();
        assert!(verify_hub_signature(body, &header, SECRET).is_ok());
    }

    #[test]
    fn test_signature_verification_invalid_signature() {
        let body = br#"{"object":"page"}"#;
        let header = sign_body(b"something else", SECRET).unwrap();
        assert!(matches!(
            verify_hub_signature(body, &header, SECRET),
            Err(VerificationError::VerificationFailed)
        ));
    }

    #[test]
    fn test_signature_verification_wrong_secret() {
        let body = b"payload";
        let header = sign_body(body, "other-secret").unwrap();
        assert!(verify_hub_signature(body, &header, SECRET).is_err());
    }

    #[test]
    fn test_signature_verification_missing_signature() {
        assert!(matches!(
            verify_hub_signature(b"payload", "", SECRET),
            Err(VerificationError::MissingSignature { .. })
        ));
    }

    #[test]
    fn test_signature_verification_invalid_format() {
        assert!(matches!(
            verify_hub_signature(b"payload", "sha1=abcd", SECRET),
            Err(VerificationError::InvalidSignatureFormat { .. })
        ));
        assert!(matches!(
            verify_hub_signature(b"payload", "sha256=not-hex", SECRET),
            Err(VerificationError::InvalidSignatureFormat { .. })
        ));
    }

    #[test]
    fn test_verify_token() {
        assert!(verify_token_matches("token-123", "token-123"));
        assert!(!verify_token_matches("token-124", "token-123"));
        assert!(!verify_token_matches("token", "token-123"));
        assert!(!verify_token_matches("", ""));
    }
}
