//! Transient signing wallet
//!
//! SECURITY: a `SecureWallet` exists only while one signing operation runs.
//! - Built from key bytes the vault just decrypted, dropped right after
//! - Never serialized, never logged (manual `Debug`)
//! - Verification helpers work from public data only

use crate::error::WalletError;
use alloy::dyn_abi::TypedData;
use alloy::eips::eip2718::Encodable2718;
use alloy::hex;
use alloy::network::{EthereumWallet, TransactionBuilder};
use alloy::primitives::{Address, Signature, B256};
use alloy::rpc::types::TransactionRequest;
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use zeroize::Zeroizing;

pub struct SecureWallet {
    signer: PrivateKeySigner,
    address: Address,
}

impl SecureWallet {
    /// Fresh random key
    pub fn random() -> Self {
        Self::from_signer(PrivateKeySigner::random())
    }

    pub fn from_signer(signer: PrivateKeySigner) -> Self {
        let address = signer.address();
        Self { signer, address }
    }

    /// Create a wallet from raw 32-byte key material
    pub fn from_bytes(key: &[u8]) -> Result<Self, WalletError> {
        let key = B256::try_from(key)
            .map_err(|_| WalletError::InvalidKey("private key must be 32 bytes".to_string()))?;
        let signer = PrivateKeySigner::from_bytes(&key)
            .map_err(|_| WalletError::InvalidKey("not a valid secp256k1 scalar".to_string()))?;
        Ok(Self::from_signer(signer))
    }

    /// Create a wallet from a hex-encoded private key, with or without `0x`.
    pub fn from_hex(key_hex: &str) -> Result<Self, WalletError> {
        let key_hex = key_hex.trim();
        let key_hex = key_hex.strip_prefix("0x").unwrap_or(key_hex);
        let bytes = Zeroizing::new(
            hex::decode(key_hex)
                .map_err(|_| WalletError::InvalidKey("private key is not valid hex".to_string()))?,
        );
        Self::from_bytes(&bytes)
    }

    /// Get the public address (safe to share)
    pub fn address(&self) -> Address {
        self.address
    }

    /// Raw key bytes, for re-encryption at rest or export.
    pub fn secret_bytes(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(self.signer.to_bytes().to_vec())
    }

    /// EIP-191 personal message signature
    pub fn sign_message(&self, message: &[u8]) -> Result<Signature, WalletError> {
        self.signer
            .sign_message_sync(message)
            .map_err(|e| WalletError::Signing(e.to_string()))
    }

    /// EIP-712 structured data signature
    pub fn sign_typed_data(&self, typed: &TypedData) -> Result<(Signature, B256), WalletError> {
        let hash = typed
            .eip712_signing_hash()
            .map_err(|e| WalletError::Signing(format!("invalid typed data: {}", e)))?;
        let signature = self
            .signer
            .sign_hash_sync(&hash)
            .map_err(|e| WalletError::Signing(e.to_string()))?;
        Ok((signature, hash))
    }

    /// Sign a fully populated EIP-1559 request and return the raw envelope.
    pub async fn sign_transaction(&self, tx: TransactionRequest) -> Result<Vec<u8>, WalletError> {
        let wallet = EthereumWallet::from(self.signer.clone());
        let envelope = tx
            .with_from(self.address)
            .build(&wallet)
            .await
            .map_err(|e| WalletError::Signing(e.to_string()))?;
        Ok(envelope.encoded_2718())
    }
}

// Implement Debug manually to avoid exposing the signer
impl std::fmt::Debug for SecureWallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureWallet")
            .field("address", &self.address)
            .field("signer", &"[REDACTED]")
            .finish()
    }
}

/// Parse a 65-byte `r || s || v` signature from hex.
pub fn parse_signature(signature: &str) -> Result<Signature, WalletError> {
    let raw = signature.trim();
    let bytes = hex::decode(raw.strip_prefix("0x").unwrap_or(raw))
        .map_err(|_| WalletError::Signing("signature is not valid hex".to_string()))?;
    Signature::try_from(bytes.as_slice())
        .map_err(|e| WalletError::Signing(format!("malformed signature: {}", e)))
}

/// Recover the signer of an EIP-191 personal message.
pub fn recover_message_signer(message: &[u8], signature: &str) -> Result<Address, WalletError> {
    parse_signature(signature)?
        .recover_address_from_msg(message)
        .map_err(|e| WalletError::Signing(format!("recovery failed: {}", e)))
}

/// Recover the signer of EIP-712 typed data.
pub fn recover_typed_data_signer(typed: &TypedData, signature: &str) -> Result<Address, WalletError> {
    let hash = typed
        .eip712_signing_hash()
        .map_err(|e| WalletError::Signing(format!("invalid typed data: {}", e)))?;
    parse_signature(signature)?
        .recover_address_from_prehash(&hash)
        .map_err(|e| WalletError::Signing(format!("recovery failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::consensus::{Transaction, TxEnvelope};
    use alloy::eips::eip2718::Decodable2718;
    use alloy::primitives::{address, U256};

    // Test private key (DO NOT use in production!)
    const TEST_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    pub(crate) fn mail_typed_data() -> TypedData {
        serde_json::from_value(serde_json::json!({
            "types": {
                "EIP712Domain": [
                    { "name": "name", "type": "string" },
                    { "name": "version", "type": "string" },
                    { "name": "chainId", "type": "uint256" }
                ],
                "Mail": [
                    { "name": "from", "type": "address" },
                    { "name": "contents", "type": "string" }
                ]
            },
            "primaryType": "Mail",
            "domain": { "name": "Ether Mail", "version": "1", "chainId": 1 },
            "message": {
                "from": "0xCD2a3d9F938E13CD947Ec05AbC7FE734Df8DD826",
                "contents": "Hello, Bob!"
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_wallet_from_hex() {
        let wallet = SecureWallet::from_hex(TEST_KEY).unwrap();
        assert_eq!(
            wallet.address(),
            address!("0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266")
        );
        assert_eq!(hex::encode(&*wallet.secret_bytes()), TEST_KEY.trim_start_matches("0x"));
        assert!(SecureWallet::from_hex("0x1234").is_err());
        assert!(SecureWallet::from_hex("zz").is_err());
    }

    #[test]
    fn test_debug_redacts_key() {
        let wallet = SecureWallet::from_hex(TEST_KEY).unwrap();
        let debug_str = format!("{:?}", wallet);
        assert!(!debug_str.contains("ac0974bec"));
        assert!(debug_str.contains("[REDACTED]"));
    }

    #[test]
    fn message_signatures_recover_to_the_signer() {
        let wallet = SecureWallet::random();
        let signature = wallet.sign_message(b"gm").unwrap();
        let encoded = hex::encode_prefixed(signature.as_bytes());

        assert_eq!(recover_message_signer(b"gm", &encoded).unwrap(), wallet.address());
        assert_ne!(recover_message_signer(b"gn", &encoded).unwrap(), wallet.address());
        assert!(recover_message_signer(b"gm", "0xdead").is_err());
    }

    #[test]
    fn typed_data_signatures_recover_to_the_signer() {
        let wallet = SecureWallet::random();
        let typed = mail_typed_data();
        let (signature, hash) = wallet.sign_typed_data(&typed).unwrap();
        assert_eq!(hash, typed.eip712_signing_hash().unwrap());

        let encoded = hex::encode(signature.as_bytes());
        assert_eq!(recover_typed_data_signer(&typed, &encoded).unwrap(), wallet.address());
    }

    #[tokio::test]
    async fn signed_transaction_carries_request_fields() {
        let wallet = SecureWallet::from_hex(TEST_KEY).unwrap();
        let to = address!("0x000000000000000000000000000000000000dEaD");
        let request = TransactionRequest::default()
            .with_to(to)
            .with_value(U256::from(1_000u64))
            .with_nonce(7)
            .with_gas_limit(21_000)
            .with_max_fee_per_gas(3_000_000_000)
            .with_max_priority_fee_per_gas(1_000_000_000)
            .with_chain_id(11155111);

        let raw = wallet.sign_transaction(request).await.unwrap();
        let envelope = TxEnvelope::decode_2718(&mut raw.as_slice()).unwrap();
        assert!(envelope.is_eip1559());
        assert_eq!(envelope.nonce(), 7);
        assert_eq!(envelope.to(), Some(to));
        assert_eq!(envelope.value(), U256::from(1_000u64));
        assert_eq!(envelope.chain_id(), Some(11155111));
    }
}
