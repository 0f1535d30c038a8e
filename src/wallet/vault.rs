//! At-rest encryption of custodial keys
//!
//! One process-wide 32-byte key, loaded at startup and never changed. Blobs
//! are `nonce (24 bytes) || XChaCha20-Poly1305 ciphertext`.

use crate::config::KeyMaterial;
use crate::error::{Error, Result, WalletError};
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use chacha20poly1305::aead::Aead;
use chacha20poly1305::{Key, KeyInit, XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;
use secrecy::ExposeSecret;
use std::fmt;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use zeroize::Zeroizing;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 24;

pub struct Vault {
    cipher: XChaCha20Poly1305,
}

impl fmt::Debug for Vault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vault").field("key", &"[REDACTED]").finish()
    }
}

impl Vault {
    pub fn from_key_bytes(key: &[u8]) -> Result<Self> {
        if key.len() != KEY_LEN {
            return Err(Error::Config(format!(
                "encryption key must be {} bytes, got {}",
                KEY_LEN,
                key.len()
            )));
        }
        Ok(Self {
            cipher: XChaCha20Poly1305::new(Key::from_slice(key)),
        })
    }

    /// Accepts standard or URL-safe base64, padded or not, so Fernet-style
    /// keys can be reused.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let encoded = encoded.trim();
        let decoded = [&STANDARD, &URL_SAFE, &STANDARD_NO_PAD, &URL_SAFE_NO_PAD]
            .iter()
            .find_map(|engine| engine.decode(encoded).ok())
            .map(Zeroizing::new)
            .ok_or_else(|| Error::Config("ENCRYPT_KEY is not valid base64".to_string()))?;
        Self::from_key_bytes(&decoded)
    }

    /// Resolve the configured key material, generating a key file on first use.
    pub async fn load(material: &KeyMaterial) -> Result<Self> {
        match material {
            KeyMaterial::Inline(secret) => Self::from_base64(secret.expose_secret()),
            KeyMaterial::File(path) => Self::load_or_create_file(path).await,
        }
    }

    async fn load_or_create_file(path: &Path) -> Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => {
                let contents = Zeroizing::new(contents);
                Self::from_base64(&contents)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let key = Self::generate_key();
                let encoded = Zeroizing::new(URL_SAFE.encode(&*key));

                let mut options = tokio::fs::OpenOptions::new();
                options.write(true).create_new(true);
                #[cfg(unix)]
                options.mode(0o600);
                let mut file = options.open(path).await.map_err(|e| {
                    Error::Config(format!("cannot create key file {}: {}", path.display(), e))
                })?;
                file.write_all(encoded.as_bytes())
                    .await
                    .map_err(|e| Error::Config(format!("cannot write key file: {}", e)))?;
                file.flush()
                    .await
                    .map_err(|e| Error::Config(format!("cannot write key file: {}", e)))?;

                tracing::warn!(
                    path = %path.display(),
                    "Generated new encryption key file, back it up or existing wallets become unrecoverable"
                );
                Self::from_key_bytes(&*key)
            }
            Err(e) => Err(Error::Config(format!(
                "cannot read key file {}: {}",
                path.display(),
                e
            ))),
        }
    }

    pub fn generate_key() -> Zeroizing<[u8; KEY_LEN]> {
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        OsRng.fill_bytes(&mut key[..]);
        key
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> std::result::Result<Vec<u8>, WalletError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|_| WalletError::Signing("key encryption failed".to_string()))?;
        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    pub fn decrypt(&self, blob: &[u8]) -> std::result::Result<Zeroizing<Vec<u8>>, WalletError> {
        if blob.len() <= NONCE_LEN {
            return Err(WalletError::DecryptionFailed);
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        self.cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map(Zeroizing::new)
            .map_err(|_| WalletError::DecryptionFailed)
    }
}
