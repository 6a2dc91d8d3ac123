// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Key sealing for stored provider credentials.
//!
//! API keys are sealed with AES-256-GCM before they touch the database and
//! unsealed only inside [`crate::CredentialStore::resolve`].  The primitive
//! is injected behind [`KeyProtector`] so tests and alternative deployments
//! can substitute their own sealing scheme.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use thiserror::Error;

/// Errors that can occur during sealing or unsealing.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Invalid key format or length.
    #[error("invalid key: {message}")]
    InvalidKey { message: String },

    /// Sealing failed.
    #[error("sealing failed: {message}")]
    SealFailed { message: String },

    /// Unsealing failed (wrong key or tampered ciphertext).
    #[error("unsealing failed: {message}")]
    UnsealFailed { message: String },

    /// Stored blob is not a valid sealed value.
    #[error("invalid sealed data: {message}")]
    InvalidCiphertext { message: String },
}

/// Seals and unseals credential plaintext.
///
/// Implementations must never emit key material or ciphertext through logs.
pub trait KeyProtector: Send + Sync {
    fn seal(&self, plaintext: &str) -> Result<Vec<u8>, CryptoError>;
    fn unseal(&self, sealed: &[u8]) -> Result<String, CryptoError>;
}

/// AES-256-GCM protector.  Sealed layout: 12-byte nonce followed by the
/// ciphertext (which includes the GCM tag).
pub struct Aes256GcmProtector {
    cipher: Aes256Gcm,
}

impl Aes256GcmProtector {
    /// Build a protector from a base64-encoded 32-byte key.
    pub fn from_base64_key(key_b64: &str) -> Result<Self, CryptoError> {
        let key_bytes = BASE64.decode(key_b64).map_err(|e| CryptoError::InvalidKey {
            message: format!("invalid base64 key: {e}"),
        })?;
        if key_bytes.len() != 32 {
            return Err(CryptoError::InvalidKey {
                message: "key must be 32 bytes".to_string(),
            });
        }
        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    /// Generate a fresh random key, base64-encoded.
    pub fn generate_key_b64() -> String {
        let mut key_bytes = [0u8; 32];
        OsRng.fill_bytes(&mut key_bytes);
        BASE64.encode(key_bytes)
    }

    /// Read the key file at `path`, creating it with a fresh key (mode 0600)
    /// when absent.
    pub fn load_or_create(path: &std::path::Path) -> Result<Self, CryptoError> {
        let key_b64 = if path.is_file() {
            std::fs::read_to_string(path)
                .map_err(|e| CryptoError::InvalidKey {
                    message: format!("reading {}: {e}", path.display()),
                })?
                .trim()
                .to_string()
        } else {
            let key = Self::generate_key_b64();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| CryptoError::InvalidKey {
                    message: format!("creating {}: {e}", parent.display()),
                })?;
            }
            std::fs::write(path, &key).map_err(|e| CryptoError::InvalidKey {
                message: format!("writing {}: {e}", path.display()),
            })?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
            }
            key
        };
        Self::from_base64_key(&key_b64)
    }
}

impl KeyProtector for Aes256GcmProtector {
    fn seal(&self, plaintext: &str) -> Result<Vec<u8>, CryptoError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| CryptoError::SealFailed {
                message: e.to_string(),
            })?;

        let mut sealed = Vec::with_capacity(12 + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn unseal(&self, sealed: &[u8]) -> Result<String, CryptoError> {
        if sealed.len() < 12 {
            return Err(CryptoError::InvalidCiphertext {
                message: "sealed data too short".to_string(),
            });
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext =
            self.cipher
                .decrypt(nonce, ciphertext)
                .map_err(|e| CryptoError::UnsealFailed {
                    message: e.to_string(),
                })?;
        String::from_utf8(plaintext).map_err(|e| CryptoError::InvalidCiphertext {
            message: e.to_string(),
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn protector() -> Aes256GcmProtector {
        Aes256GcmProtector::from_base64_key(&Aes256GcmProtector::generate_key_b64()).unwrap()
    }

    #[test]
    fn seal_unseal_roundtrip() {
        let p = protector();
        let sealed = p.seal("sk-test-abcdef").unwrap();
        assert_ne!(sealed, b"sk-test-abcdef");
        assert_eq!(p.unseal(&sealed).unwrap(), "sk-test-abcdef");
    }

    #[test]
    fn sealing_is_nondeterministic() {
        let p = protector();
        let a = p.seal("same").unwrap();
        let b = p.seal("same").unwrap();
        assert_ne!(a, b, "fresh nonce per seal");
    }

    #[test]
    fn unseal_with_wrong_key_fails() {
        let a = protector();
        let b = protector();
        let sealed = a.seal("secret").unwrap();
        assert!(matches!(
            b.unseal(&sealed),
            Err(CryptoError::UnsealFailed { .. })
        ));
    }

    #[test]
    fn unseal_truncated_blob_fails() {
        let p = protector();
        assert!(matches!(
            p.unseal(&[1, 2, 3]),
            Err(CryptoError::InvalidCiphertext { .. })
        ));
    }

    #[test]
    fn invalid_base64_key_rejected() {
        assert!(matches!(
            Aes256GcmProtector::from_base64_key("not base64 at all!"),
            Err(CryptoError::InvalidKey { .. })
        ));
    }

    #[test]
    fn short_key_rejected() {
        let short = base64::engine::general_purpose::STANDARD.encode([0u8; 16]);
        assert!(matches!(
            Aes256GcmProtector::from_base64_key(&short),
            Err(CryptoError::InvalidKey { .. })
        ));
    }

    #[test]
    fn load_or_create_persists_and_reloads_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seal.key");
        let first = Aes256GcmProtector::load_or_create(&path).unwrap();
        let sealed = first.seal("value").unwrap();
        // A second load must reuse the same key material.
        let second = Aes256GcmProtector::load_or_create(&path).unwrap();
        assert_eq!(second.unseal(&sealed).unwrap(), "value");
    }
}
