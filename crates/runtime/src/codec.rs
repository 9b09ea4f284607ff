//! Symmetric sealing of token payloads.
//!
//! Tokens are XChaCha20-Poly1305 ciphertexts under a single daemon key:
//! confidential, and any modification fails authentication. Rotating the key
//! invalidates every outstanding token.

use crate::{Error, Result};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::RngCore;
use std::io::Write;
use std::path::Path;

pub const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 24;
const TAG_LEN: usize = 16;
const TOKEN_PREFIX: &str = "gh1.";
const AAD: &[u8] = b"gatehouse token v1";

/// Seals and opens token payloads.
pub struct TokenCodec {
    cipher: XChaCha20Poly1305,
}

impl std::fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCodec").finish_non_exhaustive()
    }
}

impl TokenCodec {
    pub fn new(key: &[u8; KEY_LEN]) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    /// A codec with a fresh random key that is never written anywhere.
    pub fn ephemeral() -> Self {
        Self::new(&random_key())
    }

    /// Load the key file, creating it on first start.
    pub fn load_or_create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            let encoded = std::fs::read_to_string(path)?;
            return Ok(Self::new(&decode_key(encoded.trim())?));
        }

        let key = random_key();
        write_key(path, &key)?;
        tracing::info!(path = %path.display(), "created token key");
        Ok(Self::new(&key))
    }

    /// Replace the key file with a new key. Every token sealed under the old
    /// key stops opening.
    pub fn reset(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        tracing::warn!(path = %path.display(), "token key reset; outstanding tokens are invalid");
        Self::load_or_create(path)
    }

    /// Encrypt `plaintext` into a printable token string.
    pub fn seal(&self, plaintext: &[u8]) -> Result<String> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: AAD,
                },
            )
            .map_err(|e| Error::Crypto(e.to_string()))?;

        let mut raw = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        raw.extend_from_slice(&nonce);
        raw.extend_from_slice(&ciphertext);
        Ok(format!("{TOKEN_PREFIX}{}", URL_SAFE_NO_PAD.encode(raw)))
    }

    /// Decrypt a token string. `None` if it was not sealed by this key or was
    /// altered in any way.
    pub fn open(&self, token: &str) -> Option<Vec<u8>> {
        let encoded = token.strip_prefix(TOKEN_PREFIX)?;
        let raw = URL_SAFE_NO_PAD.decode(encoded).ok()?;
        if raw.len() < NONCE_LEN + TAG_LEN {
            return None;
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        self.cipher
            .decrypt(
                XNonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: AAD,
                },
            )
            .ok()
    }
}

fn random_key() -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

fn decode_key(encoded: &str) -> Result<[u8; KEY_LEN]> {
    let bytes = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|e| Error::KeyMaterial(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| Error::KeyMaterial(format!("expected {KEY_LEN} bytes, got {}", b.len())))
}

fn write_key(path: &Path, key: &[u8; KEY_LEN]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    file.write_all(URL_SAFE_NO_PAD.encode(key).as_bytes())?;
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_then_open() {
        let codec = TokenCodec::ephemeral();
        let token = codec.seal(b"payload").unwrap();
        assert!(token.starts_with(TOKEN_PREFIX));
        assert_eq!(codec.open(&token).unwrap(), b"payload");
    }

    #[test]
    fn tampering_is_detected() {
        let codec = TokenCodec::ephemeral();
        let token = codec.seal(b"payload").unwrap();

        let mut raw = URL_SAFE_NO_PAD
            .decode(token.strip_prefix(TOKEN_PREFIX).unwrap())
            .unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let tampered = format!("{TOKEN_PREFIX}{}", URL_SAFE_NO_PAD.encode(raw));

        assert!(codec.open(&tampered).is_none());
        assert!(codec.open("gh1.").is_none());
        assert!(codec.open("not a token").is_none());
    }

    #[test]
    fn other_keys_cannot_open() {
        let token = TokenCodec::ephemeral().seal(b"payload").unwrap();
        assert!(TokenCodec::ephemeral().open(&token).is_none());
    }

    #[test]
    fn key_file_persists_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join(".secret");

        let token = TokenCodec::load_or_create(&path).unwrap().seal(b"x").unwrap();
        let reloaded = TokenCodec::load_or_create(&path).unwrap();
        assert_eq!(reloaded.open(&token).unwrap(), b"x");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn reset_invalidates_outstanding_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".secret");

        let token = TokenCodec::load_or_create(&path).unwrap().seal(b"x").unwrap();
        let reset = TokenCodec::reset(&path).unwrap();
        assert!(reset.open(&token).is_none());
    }

    #[test]
    fn rejects_short_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".secret");
        std::fs::write(&path, URL_SAFE_NO_PAD.encode([1u8; 8])).unwrap();
        assert!(matches!(
            TokenCodec::load_or_create(&path),
            Err(Error::KeyMaterial(_))
        ));
    }
}
