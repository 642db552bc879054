//! Credential encryption and authorization-code generation
//!
//! Two unrelated but small cryptographic concerns live here: encrypting the
//! IMAP credential blob at rest (`spec.md` §3's "encrypted credential blob",
//! algorithm unspecified — resolved in `DESIGN.md`), and generating
//! high-entropy, URL-safe authorization codes (`spec.md` §4.F).

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chacha20poly1305::aead::Aead;
use chacha20poly1305::{Key, KeyInit, XChaCha20Poly1305, XNonce};
use rand::RngCore;
use rand::rngs::OsRng;
use secrecy::{ExposeSecret, SecretString};

use crate::errors::{AppError, AppResult};
use crate::models::Credentials;

/// Number of random bytes backing an authorization code.
///
/// 24 bytes = 192 bits of entropy, comfortably over the ≥128-bit floor
/// `spec.md` §4.F requires; base64 URL-safe encoding keeps it transport-safe.
const AUTH_CODE_RANDOM_BYTES: usize = 24;

/// Generate a cryptographically-random, URL-safe authorization code.
pub fn generate_authorization_code() -> String {
    let mut bytes = [0u8; AUTH_CODE_RANDOM_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Symmetric key used to encrypt credential blobs at rest.
///
/// Held only by the process; derived from `CREDENTIAL_ENCRYPTION_KEY` (32
/// raw bytes, base64 URL-safe encoded) so it can be rotated without a code
/// change. Falls back to an ephemeral random key in non-production
/// environments so the bridge still runs without prior setup.
#[derive(Clone)]
pub struct CredentialCipher {
    cipher: XChaCha20Poly1305,
}

impl CredentialCipher {
    pub fn from_env() -> AppResult<Self> {
        let key_bytes = match std::env::var("CREDENTIAL_ENCRYPTION_KEY") {
            Ok(encoded) => {
                let decoded = URL_SAFE_NO_PAD.decode(encoded.trim()).map_err(|e| {
                    AppError::InvalidRequest(format!("invalid CREDENTIAL_ENCRYPTION_KEY: {e}"))
                })?;
                if decoded.len() != 32 {
                    return Err(AppError::InvalidRequest(
                        "CREDENTIAL_ENCRYPTION_KEY must decode to 32 bytes".to_owned(),
                    ));
                }
                decoded
            }
            Err(_) => {
                tracing::warn!(
                    "CREDENTIAL_ENCRYPTION_KEY not set; using an ephemeral key for this process only"
                );
                let mut random_key = vec![0u8; 32];
                OsRng.fill_bytes(&mut random_key);
                random_key
            }
        };
        let key = Key::from_slice(&key_bytes);
        Ok(Self {
            cipher: XChaCha20Poly1305::new(key),
        })
    }

    /// Encrypt `username:password` into a self-describing blob (nonce ||
    /// ciphertext). The blob is opaque to every component except this one.
    pub fn encrypt(&self, credentials: &Credentials) -> AppResult<Vec<u8>> {
        let mut nonce_bytes = [0u8; 24];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = XNonce::from_slice(&nonce_bytes);
        let plaintext = format!(
            "{}:{}",
            credentials.username,
            credentials.password.expose_secret()
        );
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| AppError::Internal("credential encryption failed".to_owned()))?;
        let mut blob = Vec::with_capacity(nonce_bytes.len() + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    pub fn decrypt(&self, blob: &[u8]) -> AppResult<Credentials> {
        if blob.len() < 24 {
            return Err(AppError::Internal("credential blob truncated".to_owned()));
        }
        let (nonce_bytes, ciphertext) = blob.split_at(24);
        let nonce = XNonce::from_slice(nonce_bytes);
        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| AppError::Internal("credential decryption failed".to_owned()))?;
        let plaintext = String::from_utf8(plaintext)
            .map_err(|_| AppError::Internal("decrypted credential is not utf8".to_owned()))?;
        let (username, password) = plaintext
            .split_once(':')
            .ok_or_else(|| AppError::Internal("decrypted credential is malformed".to_owned()))?;
        Ok(Credentials {
            username: username.to_owned(),
            password: SecretString::new(password.to_owned().into()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorization_codes_are_unique_and_url_safe() {
        let a = generate_authorization_code();
        let b = generate_authorization_code();
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        // 24 random bytes without padding encode to 32 base64 characters.
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn encrypt_then_decrypt_round_trips() {
        let cipher = CredentialCipher {
            cipher: XChaCha20Poly1305::new(Key::from_slice(&[7u8; 32])),
        };
        let creds = Credentials {
            username: "user@example.test".to_owned(),
            password: SecretString::new("hunter2".to_owned().into()),
        };
        let blob = cipher.encrypt(&creds).expect("encrypts");
        let decoded = cipher.decrypt(&blob).expect("decrypts");
        assert_eq!(decoded.username, "user@example.test");
        assert_eq!(decoded.password.expose_secret(), "hunter2");
    }

    #[test]
    fn decrypt_rejects_truncated_blob() {
        let cipher = CredentialCipher {
            cipher: XChaCha20Poly1305::new(Key::from_slice(&[7u8; 32])),
        };
        assert!(cipher.decrypt(&[1, 2, 3]).is_err());
    }
}
