//! Password-protected keystore (Web3 Secret Storage) import and export,
//! plus mnemonic derivation.

use crate::error::WalletError;
use alloy::signers::local::coins_bip39::English;
use alloy::signers::local::{MnemonicBuilder, PrivateKeySigner};
use secrecy::{ExposeSecret, SecretString};
use zeroize::Zeroizing;

/// BIP-44 path of the first Ethereum account
pub const DEFAULT_DERIVATION_PATH: &str = "m/44'/60'/0'/0/0";

/// Encrypt raw key bytes under `password` and return the keystore JSON.
///
/// The scrypt KDF is CPU heavy, so the work runs on the blocking pool.
pub async fn encrypt_keystore(
    private_key: Zeroizing<Vec<u8>>,
    password: SecretString,
) -> Result<String, WalletError> {
    tokio::task::spawn_blocking(move || {
        let dir = tempfile::tempdir().map_err(|e| WalletError::Keystore(e.to_string()))?;
        let name = uuid::Uuid::new_v4().to_string();
        PrivateKeySigner::encrypt_keystore(
            dir.path(),
            &mut rand::thread_rng(),
            &private_key[..],
            password.expose_secret().as_bytes(),
            Some(&name),
        )
        .map_err(|e| WalletError::Keystore(e.to_string()))?;
        std::fs::read_to_string(dir.path().join(&name))
            .map_err(|e| WalletError::Keystore(e.to_string()))
    })
    .await
    .map_err(|e| WalletError::Keystore(format!("keystore task failed: {}", e)))?
}

/// Decrypt keystore JSON with `password`.
pub async fn decrypt_keystore(
    json: String,
    password: SecretString,
) -> Result<PrivateKeySigner, WalletError> {
    tokio::task::spawn_blocking(move || {
        serde_json::from_str::<serde_json::Value>(&json)
            .map_err(|e| WalletError::Keystore(format!("keystore is not valid JSON: {}", e)))?;
        let dir = tempfile::tempdir().map_err(|e| WalletError::Keystore(e.to_string()))?;
        let path = dir.path().join("keystore.json");
        std::fs::write(&path, json.as_bytes()).map_err(|e| WalletError::Keystore(e.to_string()))?;
        PrivateKeySigner::decrypt_keystore(&path, password.expose_secret().as_bytes())
            .map_err(|_| WalletError::Keystore("wrong password or corrupt keystore".to_string()))
    })
    .await
    .map_err(|e| WalletError::Keystore(format!("keystore task failed: {}", e)))?
}

/// Derive the signer at `path` from an English BIP-39 phrase.
pub fn signer_from_mnemonic(
    phrase: &SecretString,
    path: Option<&str>,
    passphrase: Option<&SecretString>,
) -> Result<PrivateKeySigner, WalletError> {
    let mut builder = MnemonicBuilder::<English>::default()
        .phrase(phrase.expose_secret().trim())
        .derivation_path(path.unwrap_or(DEFAULT_DERIVATION_PATH))
        .map_err(|e| WalletError::InvalidKey(format!("invalid derivation path: {}", e)))?;
    if let Some(passphrase) = passphrase {
        builder = builder.password(passphrase.expose_secret());
    }
    builder
        .build()
        .map_err(|_| WalletError::InvalidKey("invalid mnemonic phrase".to_string()))
}
