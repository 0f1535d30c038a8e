//! Custodial wallet management
//!
//! This module handles private key custody and transaction signing for many
//! agents. Keys are encrypted at rest by the [`Vault`] and only decrypted into
//! a [`SecureWallet`] for the duration of one signing operation.
//!
//! SECURITY:
//! - Plaintext keys never leave this module except through the guarded export
//! - Sends from one address are serialized from nonce fetch to broadcast
//! - Every chain round-trip goes through the [`ChainClient`] seam

mod keystore;
mod signer;
mod simulator;
mod vault;

pub use keystore::{decrypt_keystore, encrypt_keystore, signer_from_mnemonic, DEFAULT_DERIVATION_PATH};
pub use signer::{parse_signature, recover_message_signer, recover_typed_data_signer, SecureWallet};
pub use simulator::{
    estimate_transfer_gas, quote_fees, simulate_transfer, FeeQuote, TransferSimulation,
    BASE_FEE_HEADROOM, TRANSFER_GAS,
};
pub use vault::Vault;

use crate::clock::Clock;
use crate::config::TransferGuard;
use crate::error::{Error, Result, WalletError};
use crate::rpc::ChainClient;
use crate::store::{NewWallet, Store, TenantId, WalletRecord};
use crate::units::{ser_eth, wei_to_gwei};
use alloy::dyn_abi::{DynSolType, DynSolValue, TypedData};
use alloy::hex;
use alloy::network::TransactionBuilder;
use alloy::primitives::{eip191_hash_message, keccak256, Address, B256, U256};
use alloy::rpc::types::TransactionRequest;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell, RwLock};
use url::Url;

/// Fresh keys are regenerated at most this many times on address collision.
const MAX_KEYGEN_ATTEMPTS: usize = 8;

/// Balance polling step while waiting for faucet funds
const FAUCET_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Where imported key material comes from
pub enum WalletSource {
    /// Hex private key, `0x` optional
    PrivateKey(SecretString),
    Mnemonic {
        phrase: SecretString,
        derivation_path: Option<String>,
        passphrase: Option<SecretString>,
    },
    /// Web3 Secret Storage JSON
    Keystore { json: String, password: SecretString },
}

impl WalletSource {
    fn label(&self) -> &'static str {
        match self {
            WalletSource::PrivateKey(_) => "private_key",
            WalletSource::Mnemonic { .. } => "mnemonic",
            WalletSource::Keystore { .. } => "keystore",
        }
    }
}

impl std::fmt::Debug for WalletSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("WalletSource").field(&self.label()).finish()
    }
}

/// Public view of a custodial wallet
#[derive(Debug, Clone, Serialize)]
pub struct WalletInfo {
    pub agent_id: String,
    pub address: Address,
    pub chain_id: u64,
    pub last_nonce: Option<u64>,
    pub created_at: DateTime<Utc>,
}

impl From<&WalletRecord> for WalletInfo {
    fn from(record: &WalletRecord) -> Self {
        Self {
            agent_id: record.agent_id.clone(),
            address: record.address,
            chain_id: record.chain_id,
            last_nonce: record.last_nonce,
            created_at: record.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Balance {
    pub agent_id: String,
    pub address: Address,
    #[serde(rename = "balance_eth", serialize_with = "ser_eth")]
    pub wei: U256,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    pub chain_id: u64,
    pub rpc_url: String,
    pub client_version: Option<String>,
    pub latest_block_number: u64,
    pub latest_block_timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_fee_per_gas_gwei: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_priority_fee_per_gas_gwei: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_gas_price_gwei: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Erc20Metadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decimals: Option<u8>,
}

impl Erc20Metadata {
    fn is_empty(&self) -> bool {
        self.symbol.is_none() && self.name.is_none() && self.decimals.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ContractInspection {
    pub address: Address,
    pub is_contract: bool,
    #[serde(rename = "balance_eth", serialize_with = "ser_eth")]
    pub balance_wei: U256,
    pub bytecode_length: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytecode_hash: Option<B256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub erc20_metadata: Option<Erc20Metadata>,
}

/// Confirmed transfer
#[derive(Debug, Clone, Serialize)]
pub struct TransferReceipt {
    pub tx_hash: B256,
    pub from: Address,
    pub to: Address,
    #[serde(rename = "amount_eth", serialize_with = "ser_eth")]
    pub amount_wei: U256,
    pub nonce: u64,
    pub block_number: Option<u64>,
    pub gas_used: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SignedMessage {
    pub address: Address,
    pub signature: String,
    pub message_hash: B256,
}

#[derive(Debug, Clone, Serialize)]
pub struct SignatureCheck {
    pub valid: bool,
    pub recovered_address: Address,
}

#[derive(Debug, Clone, Serialize)]
pub struct FaucetOutcome {
    pub ok: bool,
    /// HTTP status, present when the faucet refused the request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(rename = "start_balance_eth", serialize_with = "ser_eth")]
    pub start_balance_wei: U256,
    #[serde(rename = "end_balance_eth", serialize_with = "ser_eth")]
    pub end_balance_wei: U256,
}

/// Parse a recipient, rejecting malformed and zero addresses.
pub fn parse_recipient(raw: &str) -> std::result::Result<Address, WalletError> {
    match Address::from_str(raw.trim()) {
        Ok(address) if address != Address::ZERO => Ok(address),
        _ => Err(WalletError::InvalidRecipient(raw.to_string())),
    }
}

type WalletKey = (TenantId, String);

/// Next nonce handed out for an address, guarded per address
type NonceSlot = Arc<Mutex<Option<u64>>>;

pub struct WalletManager {
    store: Store,
    chain: Arc<dyn ChainClient>,
    vault: Arc<Vault>,
    guard: TransferGuard,
    clock: Arc<dyn Clock>,
    receipt_timeout: Duration,
    faucet_url: Option<Url>,
    http: reqwest::Client,
    /// Read-through cache over the store, never authoritative
    cache: RwLock<HashMap<WalletKey, WalletRecord>>,
    nonce_slots: Mutex<HashMap<Address, NonceSlot>>,
    chain_id: OnceCell<u64>,
}

impl std::fmt::Debug for WalletManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletManager")
            .field("chain", &self.chain)
            .field("vault", &self.vault)
            .field("receipt_timeout", &self.receipt_timeout)
            .finish_non_exhaustive()
    }
}

impl WalletManager {
    pub fn new(
        store: Store,
        chain: Arc<dyn ChainClient>,
        vault: Arc<Vault>,
        guard: TransferGuard,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            chain,
            vault,
            guard,
            clock,
            receipt_timeout: Duration::from_secs(120),
            faucet_url: None,
            http: reqwest::Client::new(),
            cache: RwLock::new(HashMap::new()),
            nonce_slots: Mutex::new(HashMap::new()),
            chain_id: OnceCell::new(),
        }
    }

    pub fn with_receipt_timeout(mut self, timeout: Duration) -> Self {
        self.receipt_timeout = timeout;
        self
    }

    pub fn with_faucet_url(mut self, url: Option<Url>) -> Self {
        self.faucet_url = url;
        self
    }

    pub fn chain(&self) -> &Arc<dyn ChainClient> {
        &self.chain
    }

    async fn chain_id(&self) -> Result<u64> {
        self.chain_id
            .get_or_try_init(|| async { self.chain.chain_id().await })
            .await
            .copied()
    }

    // ---------------------------------------------------------------------
    // Cache + store

    async fn wallet_record(&self, tenant: &TenantId, agent_id: &str) -> Result<WalletRecord> {
        let key = (tenant.clone(), agent_id.to_string());
        if let Some(record) = self.cache.read().await.get(&key) {
            return Ok(record.clone());
        }
        let record = self
            .store
            .get_wallet(tenant, agent_id)
            .await?
            .ok_or_else(|| Error::not_found("wallet", agent_id))?;
        self.cache.write().await.insert(key, record.clone());
        Ok(record)
    }

    async fn cache_record(&self, record: &WalletRecord) {
        self.cache.write().await.insert(
            (record.tenant_id.clone(), record.agent_id.clone()),
            record.clone(),
        );
    }

    /// Decrypt the agent's key and check it still derives the stored address.
    fn unlock(&self, record: &WalletRecord) -> std::result::Result<SecureWallet, WalletError> {
        let key = self.vault.decrypt(&record.encrypted_privkey)?;
        let wallet = SecureWallet::from_bytes(&key)?;
        if wallet.address() != record.address {
            tracing::error!(
                agent_id = %record.agent_id,
                address = %record.address,
                "Decrypted key does not derive the stored address"
            );
            return Err(WalletError::KeyMismatch {
                address: record.address.to_checksum(None),
            });
        }
        Ok(wallet)
    }

    async fn store_wallet(
        &self,
        tenant: &TenantId,
        agent_id: &str,
        wallet: &SecureWallet,
        rotate: bool,
        event: &str,
    ) -> Result<WalletInfo> {
        let chain_id = self.chain_id().await?;
        let encrypted_privkey = self.vault.encrypt(&wallet.secret_bytes())?;
        let new = NewWallet {
            agent_id: agent_id.to_string(),
            address: wallet.address(),
            encrypted_privkey,
            chain_id,
            metadata: serde_json::json!({ "source": event }),
        };
        let record = self
            .store
            .upsert_wallet(tenant, &new, rotate, self.clock.now())
            .await?;
        self.cache_record(&record).await;
        if rotate {
            self.nonce_slots.lock().await.remove(&record.address);
        }

        tracing::info!(
            tenant = %tenant,
            agent_id = %agent_id,
            address = %record.address,
            event,
            "Wallet stored"
        );
        Ok(WalletInfo::from(&record))
    }

    // ---------------------------------------------------------------------
    // Lifecycle

    /// Generate and persist a fresh key for `agent_id`.
    pub async fn create_wallet(&self, tenant: &TenantId, agent_id: &str) -> Result<WalletInfo> {
        validate_agent_id(agent_id)?;
        if self.store.get_wallet(tenant, agent_id).await?.is_some() {
            return Err(Error::already_exists("wallet", agent_id));
        }
        self.chain.ensure_connection().await?;

        for _ in 0..MAX_KEYGEN_ATTEMPTS {
            let wallet = SecureWallet::random();
            if self.store.wallet_address_taken(tenant, wallet.address()).await? {
                tracing::warn!(address = %wallet.address(), "Generated address already custodied, regenerating");
                continue;
            }
            return self.store_wallet(tenant, agent_id, &wallet, false, "created").await;
        }
        Err(Error::Wallet(WalletError::InvalidKey(
            "could not generate an unused address".to_string(),
        )))
    }

    /// Import existing key material. Replacing an agent's wallet requires
    /// `rotate`.
    pub async fn import_wallet(
        &self,
        tenant: &TenantId,
        agent_id: &str,
        source: WalletSource,
        rotate: bool,
    ) -> Result<WalletInfo> {
        validate_agent_id(agent_id)?;
        if !rotate && self.store.get_wallet(tenant, agent_id).await?.is_some() {
            return Err(Error::already_exists("wallet", agent_id));
        }

        let event = format!("imported_from_{}", source.label());
        let wallet = match source {
            WalletSource::PrivateKey(key) => SecureWallet::from_hex(key.expose_secret())?,
            WalletSource::Mnemonic {
                phrase,
                derivation_path,
                passphrase,
            } => SecureWallet::from_signer(signer_from_mnemonic(
                &phrase,
                derivation_path.as_deref(),
                passphrase.as_ref(),
            )?),
            WalletSource::Keystore { json, password } => {
                SecureWallet::from_signer(decrypt_keystore(json, password).await?)
            }
        };
        self.store_wallet(tenant, agent_id, &wallet, rotate, &event).await
    }

    /// Every custodied wallet in the tenant, keyed by agent.
    pub async fn list_wallets(&self, tenant: &TenantId) -> Result<Vec<WalletInfo>> {
        let records = self.store.list_wallets(tenant).await?;
        let mut cache = self.cache.write().await;
        for record in &records {
            cache.insert((tenant.clone(), record.agent_id.clone()), record.clone());
        }
        Ok(records.iter().map(WalletInfo::from).collect())
    }

    pub async fn wallet(&self, tenant: &TenantId, agent_id: &str) -> Result<WalletInfo> {
        Ok(WalletInfo::from(&self.wallet_record(tenant, agent_id).await?))
    }

    // ---------------------------------------------------------------------
    // Chain reads

    pub async fn query_balance(&self, tenant: &TenantId, agent_id: &str) -> Result<Balance> {
        let record = self.wallet_record(tenant, agent_id).await?;
        let wei = self.chain.get_balance(record.address).await?;
        tracing::debug!(agent_id = %agent_id, balance_wei = %wei, "Balance queried");
        Ok(Balance {
            agent_id: agent_id.to_string(),
            address: record.address,
            wei,
        })
    }

    pub async fn provider_status(&self) -> Result<ProviderStatus> {
        let rpc_url = self.chain.ensure_connection().await?;
        let chain_id = self.chain.chain_id().await?;
        let block = self.chain.get_block_latest().await?;
        let priority = match self.chain.max_priority_fee().await {
            Ok(fee) => Some(fee),
            Err(e) => {
                tracing::debug!(error = %e, "Priority fee estimate unavailable");
                None
            }
        };
        let client_version = self.chain.client_version().await.ok();

        let base_fee_gwei = block.base_fee_per_gas.map(wei_to_gwei);
        let priority_gwei = priority.map(wei_to_gwei);
        Ok(ProviderStatus {
            chain_id,
            rpc_url,
            client_version,
            latest_block_number: block.number,
            latest_block_timestamp: block.timestamp,
            base_fee_per_gas_gwei: base_fee_gwei,
            max_priority_fee_per_gas_gwei: priority_gwei,
            estimated_gas_price_gwei: base_fee_gwei.map(|base| base + priority_gwei.unwrap_or(0.0)),
        })
    }

    /// Read-only look at an address: code, balance and ERC-20 metadata when
    /// the contract answers the standard view calls.
    pub async fn inspect_contract(&self, address: &str) -> Result<ContractInspection> {
        let address = Address::from_str(address.trim())
            .map_err(|_| Error::InvalidArgument(format!("invalid contract address: {}", address)))?;
        let code = self.chain.get_code(address).await?;
        let balance_wei = self.chain.get_balance(address).await?;
        let is_contract = code.iter().any(|b| *b != 0);

        let mut inspection = ContractInspection {
            address,
            is_contract,
            balance_wei,
            bytecode_length: code.len(),
            bytecode_hash: None,
            erc20_metadata: None,
        };
        if !is_contract {
            return Ok(inspection);
        }
        inspection.bytecode_hash = Some(keccak256(&code));

        let mut metadata = Erc20Metadata::default();
        for field in ["symbol()", "name()", "decimals()"] {
            let raw = match self.chain.call_contract_function(address, field).await {
                Ok(raw) => raw,
                Err(e) => {
                    tracing::debug!(%address, field, error = %e, "Metadata call failed, skipping");
                    continue;
                }
            };
            match field {
                "decimals()" => metadata.decimals = decode_decimals(&raw),
                "symbol()" => metadata.symbol = decode_text(&raw),
                _ => metadata.name = decode_text(&raw),
            }
        }
        if !metadata.is_empty() {
            inspection.erc20_metadata = Some(metadata);
        }
        Ok(inspection)
    }

    // ---------------------------------------------------------------------
    // Transfers

    pub async fn simulate_transfer(
        &self,
        tenant: &TenantId,
        agent_id: &str,
        to: &str,
        amount_wei: U256,
    ) -> Result<TransferSimulation> {
        let record = self.wallet_record(tenant, agent_id).await?;
        if amount_wei.is_zero() {
            return Err(WalletError::InvalidAmount.into());
        }
        let to = parse_recipient(to)?;
        simulate_transfer(self.chain.as_ref(), record.address, to, amount_wei).await
    }

    async fn nonce_slot(&self, address: Address) -> NonceSlot {
        self.nonce_slots
            .lock()
            .await
            .entry(address)
            .or_default()
            .clone()
    }

    /// Sign, broadcast and confirm a native transfer.
    ///
    /// The per-address slot is held from nonce fetch through broadcast so
    /// concurrent sends from one wallet get consecutive nonces. The receipt
    /// wait happens after the slot is released.
    pub async fn execute_transfer(
        &self,
        tenant: &TenantId,
        agent_id: &str,
        to: &str,
        amount_wei: U256,
        confirmation_code: Option<&str>,
    ) -> Result<TransferReceipt> {
        let record = self.wallet_record(tenant, agent_id).await?;
        let wallet = self.unlock(&record)?;
        if amount_wei.is_zero() {
            return Err(WalletError::InvalidAmount.into());
        }
        let to = parse_recipient(to)?;
        self.guard.check_transfer(amount_wei, confirmation_code)?;

        let from = record.address;
        let slot = self.nonce_slot(from).await;
        let (tx_hash, nonce) = {
            let mut next = slot.lock().await;

            let chain_nonce = self.chain.get_nonce(from).await?;
            let nonce = next.map_or(chain_nonce, |cached| cached.max(chain_nonce));
            let fees = quote_fees(self.chain.as_ref()).await?;

            let request = TransactionRequest::default()
                .with_from(from)
                .with_to(to)
                .with_value(amount_wei)
                .with_nonce(nonce)
                .with_chain_id(record.chain_id)
                .with_max_fee_per_gas(fees.max_fee_per_gas)
                .with_max_priority_fee_per_gas(fees.max_priority_fee_per_gas);
            let gas = estimate_transfer_gas(self.chain.as_ref(), &request).await?;

            let balance = self.chain.get_balance(from).await?;
            let required = amount_wei.saturating_add(fees.max_cost(gas));
            if balance < required {
                return Err(WalletError::InsufficientFunds {
                    required: required.to_string(),
                    available: balance.to_string(),
                }
                .into());
            }

            let raw = wallet.sign_transaction(request.with_gas_limit(gas)).await?;
            let tx_hash = self.chain.send_raw_transaction(&raw).await?;
            *next = Some(nonce + 1);
            (tx_hash, nonce)
        };
        drop(wallet);

        tracing::info!(
            agent_id = %agent_id,
            %from,
            %to,
            nonce,
            tx_hash = %tx_hash,
            "Transfer broadcast"
        );

        let receipt = self
            .chain
            .wait_for_receipt(tx_hash, self.receipt_timeout)
            .await?
            .ok_or_else(|| WalletError::ReceiptTimeout {
                tx_hash: tx_hash.to_string(),
                timeout_secs: self.receipt_timeout.as_secs(),
            })?;
        if !receipt.success {
            tracing::error!(agent_id = %agent_id, tx_hash = %tx_hash, "Transfer reverted");
            return Err(WalletError::Reverted {
                tx_hash: tx_hash.to_string(),
            }
            .into());
        }

        let now = self.clock.now();
        self.store
            .record_wallet_nonce(tenant, agent_id, nonce + 1, now)
            .await?;
        if let Some(cached) = self
            .cache
            .write()
            .await
            .get_mut(&(tenant.clone(), agent_id.to_string()))
        {
            cached.last_nonce = Some(cached.last_nonce.map_or(nonce + 1, |n| n.max(nonce + 1)));
            cached.updated_at = now;
        }

        tracing::info!(
            agent_id = %agent_id,
            tx_hash = %tx_hash,
            block_number = ?receipt.block_number,
            "Transfer successful"
        );
        Ok(TransferReceipt {
            tx_hash,
            from,
            to,
            amount_wei,
            nonce,
            block_number: receipt.block_number,
            gas_used: receipt.gas_used,
        })
    }

    /// Poll a faucet for test funds and wait, bounded by `timeout`, for the
    /// balance to move.
    pub async fn request_faucet_funds(
        &self,
        tenant: &TenantId,
        agent_id: &str,
        amount_eth: Option<&str>,
        timeout: Duration,
    ) -> Result<FaucetOutcome> {
        let url = self
            .faucet_url
            .clone()
            .ok_or_else(|| WalletError::Faucet("AGENTVAULT_FAUCET_URL not configured".to_string()))?;
        let record = self.wallet_record(tenant, agent_id).await?;

        let mut payload = serde_json::json!({ "address": record.address });
        if let Some(amount) = amount_eth {
            payload["amount_eth"] = serde_json::Value::String(amount.to_string());
        }
        let response = self
            .http
            .post(url)
            .timeout(Duration::from_secs(30))
            .json(&payload)
            .send()
            .await
            .map_err(|e| WalletError::Faucet(e.to_string()))?;
        let status = response.status().as_u16();

        let start = self.chain.get_balance(record.address).await?;
        if !matches!(status, 200 | 201 | 202) {
            tracing::warn!(agent_id = %agent_id, status, "Faucet refused request");
            return Ok(FaucetOutcome {
                ok: false,
                status: Some(status),
                start_balance_wei: start,
                end_balance_wei: start,
            });
        }

        let deadline = tokio::time::Instant::now() + timeout;
        let mut end = start;
        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(FAUCET_POLL_INTERVAL).await;
            end = self.chain.get_balance(record.address).await?;
            if end > start {
                break;
            }
        }
        Ok(FaucetOutcome {
            ok: end > start,
            status: None,
            start_balance_wei: start,
            end_balance_wei: end,
        })
    }

    // ---------------------------------------------------------------------
    // Export

    /// Re-encrypt the agent's key under `passphrase` as keystore JSON.
    pub async fn export_wallet_keystore(
        &self,
        tenant: &TenantId,
        agent_id: &str,
        passphrase: SecretString,
    ) -> Result<String> {
        let record = self.wallet_record(tenant, agent_id).await?;
        let wallet = self.unlock(&record)?;
        let json = encrypt_keystore(wallet.secret_bytes(), passphrase).await?;
        tracing::info!(agent_id = %agent_id, "Wallet exported as keystore");
        Ok(json)
    }

    /// Plaintext hex key. Requires the server opt-in and the export code.
    pub async fn export_wallet_private_key(
        &self,
        tenant: &TenantId,
        agent_id: &str,
        confirmation_code: Option<&str>,
    ) -> Result<SecretString> {
        self.guard.check_plaintext_export(confirmation_code)?;
        let record = self.wallet_record(tenant, agent_id).await?;
        let wallet = self.unlock(&record)?;
        tracing::warn!(agent_id = %agent_id, "Plaintext private key exported");
        Ok(SecretString::from(hex::encode_prefixed(&*wallet.secret_bytes())))
    }

    // ---------------------------------------------------------------------
    // Signatures

    pub async fn sign_message(
        &self,
        tenant: &TenantId,
        agent_id: &str,
        message: &str,
    ) -> Result<SignedMessage> {
        let record = self.wallet_record(tenant, agent_id).await?;
        let wallet = self.unlock(&record)?;
        let signature = wallet.sign_message(message.as_bytes())?;
        Ok(SignedMessage {
            address: record.address,
            signature: hex::encode_prefixed(signature.as_bytes()),
            message_hash: eip191_hash_message(message.as_bytes()),
        })
    }

    pub async fn sign_typed_data(
        &self,
        tenant: &TenantId,
        agent_id: &str,
        typed_data: &TypedData,
    ) -> Result<SignedMessage> {
        let record = self.wallet_record(tenant, agent_id).await?;
        let wallet = self.unlock(&record)?;
        let (signature, message_hash) = wallet.sign_typed_data(typed_data)?;
        Ok(SignedMessage {
            address: record.address,
            signature: hex::encode_prefixed(signature.as_bytes()),
            message_hash,
        })
    }
}

/// Check a personal-message signature against `address`. Needs no custody.
pub fn verify_message(address: &str, message: &str, signature: &str) -> Result<SignatureCheck> {
    let expected = parse_recipient(address)?;
    let recovered = recover_message_signer(message.as_bytes(), signature)?;
    Ok(SignatureCheck {
        valid: recovered == expected,
        recovered_address: recovered,
    })
}

/// Check an EIP-712 signature against `address`. Needs no custody.
pub fn verify_typed_data(
    address: &str,
    typed_data: &TypedData,
    signature: &str,
) -> Result<SignatureCheck> {
    let expected = parse_recipient(address)?;
    let recovered = recover_typed_data_signer(typed_data, signature)?;
    Ok(SignatureCheck {
        valid: recovered == expected,
        recovered_address: recovered,
    })
}

fn validate_agent_id(agent_id: &str) -> Result<()> {
    if agent_id.trim().is_empty() {
        return Err(Error::InvalidArgument("agent_id must not be empty".to_string()));
    }
    Ok(())
}

/// ABI `string`, or a null-padded `bytes32` as some older tokens return.
fn decode_text(raw: &[u8]) -> Option<String> {
    if let Ok(DynSolValue::String(text)) = DynSolType::String.abi_decode(raw) {
        return Some(text);
    }
    if raw.len() == 32 {
        let trimmed: Vec<u8> = raw.iter().copied().take_while(|b| *b != 0).collect();
        return String::from_utf8(trimmed).ok().filter(|s| !s.is_empty());
    }
    None
}

fn decode_decimals(raw: &[u8]) -> Option<u8> {
    match DynSolType::Uint(256).abi_decode(raw) {
        Ok(DynSolValue::Uint(value, _)) => u8::try_from(value).ok(),
        _ => None,
    }
}
