//! Credential encryption using AES-256-GCM.
//!
//! OAuth secrets are stored as a single string `base64(iv):base64(tag):base64(ciphertext)`.
//! The key is derived once per process with scrypt from the shared application secret and a
//! fixed salt, so every stored value depends on that secret: rotating it means re-encrypting
//! everything (see the `rotate_credentials_key` binary).
//!
//! Each use case binds its own additional authenticated data ([`CredentialPurpose`]), so a
//! value encrypted for one purpose never decrypts as another.

use aes_gcm::{
    AesGcm, Key, KeyInit, Nonce,
    aead::{Aead, Payload, consts::U16},
    aes::Aes256,
};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use rand::{RngCore, rngs::OsRng};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// AES-256-GCM with a 16-byte IV.
type Aes256Gcm16 = AesGcm<Aes256, U16>;

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 16;
pub const TAG_LEN: usize = 16;

const KEY_SALT: &[u8] = b"wellness-coach-credentials";
const SCRYPT_LOG_N: u8 = 14;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;

/// Crypto error types
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("malformed encrypted value: missing {missing} segment")]
    MalformedCiphertext { missing: &'static str },
    #[error("malformed encrypted value: expected 3 segments, found {found}")]
    TooManySegments { found: usize },
    #[error("malformed encrypted value: {segment} segment is not valid base64")]
    InvalidEncoding { segment: &'static str },
    #[error("invalid IV length: expected 16 bytes, got {0}")]
    InvalidIvLength(usize),
    #[error("invalid auth tag length: expected 16 bytes, got {0}")]
    InvalidTagLength(usize),
    #[error("authentication failed: value was tampered with or encrypted under a different key")]
    AuthenticationFailed,
    #[error("decrypted value is not valid UTF-8")]
    InvalidUtf8,
}

/// The use case an encrypted value belongs to. Its label is bound as AAD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialPurpose {
    GmailRefreshToken,
    GoogleChatRefreshToken,
    FitbitAccessToken,
    FitbitRefreshToken,
}

impl CredentialPurpose {
    pub fn aad(self) -> &'static str {
        match self {
            Self::GmailRefreshToken => "gmail-refresh-token",
            Self::GoogleChatRefreshToken => "google-chat-refresh-token",
            Self::FitbitAccessToken => "fitbit-access-token",
            Self::FitbitRefreshToken => "fitbit-refresh-token",
        }
    }
}

/// Derived key material, wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey([u8; KEY_LEN]);

impl DerivedKey {
    /// Wraps raw key bytes (tests and rotation tooling).
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DerivedKey([REDACTED])")
    }
}

/// Derives the process-wide encryption key from the application secret.
pub fn derive_key(secret: &str) -> Result<DerivedKey, CryptoError> {
    let params = scrypt::Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, KEY_LEN)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

    let mut key = [0u8; KEY_LEN];
    scrypt::scrypt(secret.as_bytes(), KEY_SALT, &params, &mut key)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

    let derived = DerivedKey(key);
    key.zeroize();
    Ok(derived)
}

/// Encrypts and decrypts stored OAuth credentials.
#[derive(Clone, Debug)]
pub struct CredentialCipher {
    key: DerivedKey,
}

impl CredentialCipher {
    pub fn new(key: DerivedKey) -> Self {
        Self { key }
    }

    /// Derives the key from `secret` with scrypt. This is deliberately slow; call it once.
    pub fn from_secret(secret: &str) -> Result<Self, CryptoError> {
        derive_key(secret).map(Self::new)
    }

    fn cipher(&self) -> Aes256Gcm16 {
        Aes256Gcm16::new(Key::<Aes256Gcm16>::from_slice(self.key.as_bytes()))
    }

    /// Encrypts `plaintext`, returning `iv:tag:ciphertext` in base64.
    pub fn encrypt(&self, purpose: CredentialPurpose, plaintext: &str) -> Result<String, CryptoError> {
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);

        let mut sealed = self
            .cipher()
            .encrypt(
                Nonce::<U16>::from_slice(&iv),
                Payload {
                    msg: plaintext.as_bytes(),
                    aad: purpose.aad().as_bytes(),
                },
            )
            .map_err(|_| CryptoError::EncryptionFailed)?;

        // aes-gcm appends the tag; the stored format keeps it as its own segment.
        let tag = sealed.split_off(sealed.len() - TAG_LEN);

        Ok(format!(
            "{}:{}:{}",
            STANDARD.encode(iv),
            STANDARD.encode(tag),
            STANDARD.encode(sealed)
        ))
    }

    /// Decrypts an `iv:tag:ciphertext` value. Fails closed on any malformation or tag mismatch.
    pub fn decrypt(&self, purpose: CredentialPurpose, stored: &str) -> Result<String, CryptoError> {
        let (iv, tag, ciphertext) = split_segments(stored)?;

        if iv.len() != IV_LEN {
            return Err(CryptoError::InvalidIvLength(iv.len()));
        }
        if tag.len() != TAG_LEN {
            return Err(CryptoError::InvalidTagLength(tag.len()));
        }

        let mut sealed = ciphertext;
        sealed.extend_from_slice(&tag);

        let plaintext = self
            .cipher()
            .decrypt(
                Nonce::<U16>::from_slice(&iv),
                Payload {
                    msg: &sealed,
                    aad: purpose.aad().as_bytes(),
                },
            )
            .map_err(|_| CryptoError::AuthenticationFailed)?;

        String::from_utf8(plaintext).map_err(|_| CryptoError::InvalidUtf8)
    }
}

/// Whether `value` has the shape of an encrypted credential (three base64 segments).
pub fn looks_encrypted(value: &str) -> bool {
    split_segments(value).is_ok()
}

fn split_segments(stored: &str) -> Result<(Vec<u8>, Vec<u8>, Vec<u8>), CryptoError> {
    let parts: Vec<&str> = stored.split(':').collect();
    if parts.len() > 3 {
        return Err(CryptoError::TooManySegments { found: parts.len() });
    }

    // An empty ciphertext segment is legitimate (empty plaintext); empty IV or tag is not.
    let (iv, tag, ciphertext) = match parts.as_slice() {
        [iv, tag, ciphertext] if !iv.is_empty() && !tag.is_empty() => (*iv, *tag, *ciphertext),
        [iv, ..] if iv.is_empty() => {
            return Err(CryptoError::MalformedCiphertext { missing: "iv" });
        }
        [_] | [_, ""] | [_, "", _] => {
            return Err(CryptoError::MalformedCiphertext {
                missing: "auth tag",
            });
        }
        _ => {
            return Err(CryptoError::MalformedCiphertext {
                missing: "ciphertext",
            });
        }
    };

    let decode = |raw: &str, segment: &'static str| {
        STANDARD
            .decode(raw)
            .map_err(|_| CryptoError::InvalidEncoding { segment })
    };

    Ok((
        decode(iv, "iv")?,
        decode(tag, "auth tag")?,
        decode(ciphertext, "ciphertext")?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cipher() -> CredentialCipher {
        CredentialCipher::new(DerivedKey::from_bytes([7u8; KEY_LEN]))
    }

    fn tamper_segment(stored: &str, index: usize) -> String {
        let mut parts: Vec<String> = stored.split(':').map(str::to_string).collect();
        let mut bytes = STANDARD.decode(&parts[index]).unwrap();
        bytes[0] ^= 0x01;
        parts[index] = STANDARD.encode(bytes);
        parts.join(":")
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let cipher = test_cipher();
        for plaintext in ["1//0gRefreshToken", "", "ünïcødé ✓", &"x".repeat(4096)] {
            let stored = cipher
                .encrypt(CredentialPurpose::GmailRefreshToken, plaintext)
                .unwrap();
            let decrypted = cipher
                .decrypt(CredentialPurpose::GmailRefreshToken, &stored)
                .unwrap();
            assert_eq!(decrypted, plaintext);
        }
    }

    #[test]
    fn test_format_is_three_base64_segments() {
        let stored = test_cipher()
            .encrypt(CredentialPurpose::FitbitAccessToken, "token")
            .unwrap();
        let parts: Vec<&str> = stored.split(':').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(STANDARD.decode(parts[0]).unwrap().len(), IV_LEN);
        assert_eq!(STANDARD.decode(parts[1]).unwrap().len(), TAG_LEN);
        assert_eq!(STANDARD.decode(parts[2]).unwrap().len(), "token".len());
    }

    #[test]
    fn test_iv_is_fresh_per_encryption() {
        let cipher = test_cipher();
        let a = cipher
            .encrypt(CredentialPurpose::GmailRefreshToken, "same")
            .unwrap();
        let b = cipher
            .encrypt(CredentialPurpose::GmailRefreshToken, "same")
            .unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_different_purpose_fails() {
        let cipher = test_cipher();
        let stored = cipher
            .encrypt(CredentialPurpose::GmailRefreshToken, "secret")
            .unwrap();
        let result = cipher.decrypt(CredentialPurpose::GoogleChatRefreshToken, &stored);
        assert!(matches!(result, Err(CryptoError::AuthenticationFailed)));
    }

    #[test]
    fn test_tampered_segments_fail() {
        let cipher = test_cipher();
        let stored = cipher
            .encrypt(CredentialPurpose::FitbitRefreshToken, "refresh-me")
            .unwrap();
        for index in 0..3 {
            let tampered = tamper_segment(&stored, index);
            assert!(matches!(
                cipher.decrypt(CredentialPurpose::FitbitRefreshToken, &tampered),
                Err(CryptoError::AuthenticationFailed)
            ));
        }
    }

    #[test]
    fn test_missing_segments_name_the_gap() {
        let cipher = test_cipher();
        let cases = [
            ("", "iv"),
            ("abc", "auth tag"),
            ("AAAA:BBBB", "ciphertext"),
            ("AAAA::CCCC", "auth tag"),
        ];
        for (input, expected) in cases {
            match cipher.decrypt(CredentialPurpose::GmailRefreshToken, input) {
                Err(CryptoError::MalformedCiphertext { missing }) => assert_eq!(missing, expected),
                other => panic!("unexpected result for {input:?}: {other:?}"),
            }
        }
    }

    #[test]
    fn test_extra_segments_rejected() {
        let result = test_cipher().decrypt(CredentialPurpose::GmailRefreshToken, "a:b:c:d");
        assert!(matches!(
            result,
            Err(CryptoError::TooManySegments { found: 4 })
        ));
    }

    #[test]
    fn test_wrong_iv_length_rejected() {
        let stored = format!(
            "{}:{}:{}",
            STANDARD.encode([0u8; 12]),
            STANDARD.encode([0u8; TAG_LEN]),
            STANDARD.encode(b"abc")
        );
        assert!(matches!(
            test_cipher().decrypt(CredentialPurpose::GmailRefreshToken, &stored),
            Err(CryptoError::InvalidIvLength(12))
        ));
    }

    #[test]
    fn test_plaintext_is_not_mistaken_for_ciphertext() {
        assert!(!looks_encrypted("ya29.plain-access-token"));
        let stored = test_cipher()
            .encrypt(CredentialPurpose::GmailRefreshToken, "x")
            .unwrap();
        assert!(looks_encrypted(&stored));
    }

    #[test]
    fn test_key_derivation_is_deterministic() {
        let secret = "a-sufficiently-long-shared-application-secret";
        let a = derive_key(secret).unwrap();
        let b = derive_key(secret).unwrap();
        let c = derive_key("another-sufficiently-long-application-secret").unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), c.as_bytes());
    }

    #[test]
    fn test_value_from_other_secret_fails() {
        let first = CredentialCipher::from_secret("first-secret-value-that-is-long-enough").unwrap();
        let second =
            CredentialCipher::from_secret("second-secret-value-that-is-long-enough").unwrap();
        let stored = first
            .encrypt(CredentialPurpose::GmailRefreshToken, "token")
            .unwrap();
        assert!(matches!(
            second.decrypt(CredentialPurpose::GmailRefreshToken, &stored),
            Err(CryptoError::AuthenticationFailed)
        ));
    }
}
