//! Error types for the agent wallet control plane

use thiserror::Error;

/// Failures raised by the custodial wallet manager.
///
/// None of these carry key material, passphrases or confirmation codes.
#[derive(Error, Debug)]
pub enum WalletError {
    #[error("Decryption failed, check the encryption key")]
    DecryptionFailed,

    #[error("Decrypted key does not match stored address {address}")]
    KeyMismatch { address: String },

    #[error("Amount must be positive")]
    InvalidAmount,

    #[error("Invalid recipient address: {0}")]
    InvalidRecipient(String),

    #[error("Invalid private key: {0}")]
    InvalidKey(String),

    #[error("Keystore error: {0}")]
    Keystore(String),

    #[error("Insufficient funds: required {required} wei, available {available} wei")]
    InsufficientFunds { required: String, available: String },

    #[error("Transfer of {amount} ETH exceeds limit of {threshold} ETH, confirmation code required")]
    ConfirmationRequired { amount: String, threshold: String },

    #[error("Transaction {tx_hash} reverted on-chain")]
    Reverted { tx_hash: String },

    #[error("Transaction {tx_hash} not confirmed within {timeout_secs}s")]
    ReceiptTimeout { tx_hash: String, timeout_secs: u64 },

    #[error("Export forbidden: {0}")]
    ExportForbidden(String),

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Faucet request failed: {0}")]
    Faucet(String),
}

impl WalletError {
    fn kind(&self) -> &'static str {
        match self {
            WalletError::DecryptionFailed => "wallet.decryption_failed",
            WalletError::KeyMismatch { .. } => "wallet.key_mismatch",
            WalletError::InvalidAmount => "wallet.invalid_amount",
            WalletError::InvalidRecipient(_) => "wallet.invalid_recipient",
            WalletError::InvalidKey(_) => "wallet.invalid_key",
            WalletError::Keystore(_) => "wallet.keystore",
            WalletError::InsufficientFunds { .. } => "wallet.insufficient_funds",
            WalletError::ConfirmationRequired { .. } => "wallet.confirmation_required",
            WalletError::Reverted { .. } => "wallet.reverted",
            WalletError::ReceiptTimeout { .. } => "wallet.receipt_timeout",
            WalletError::ExportForbidden(_) => "wallet.export_forbidden",
            WalletError::Signing(_) => "wallet.signing",
            WalletError::Faucet(_) => "wallet.faucet",
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Wallet error: {0}")]
    Wallet(#[from] WalletError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Rate limit exceeded for tool '{tool}' (agent={agent_id})")]
    RateLimit { tool: String, agent_id: String },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} already exists: {id}")]
    AlreadyExists { kind: &'static str, id: String },

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn already_exists(kind: &'static str, id: impl Into<String>) -> Self {
        Error::AlreadyExists {
            kind,
            id: id.into(),
        }
    }

    /// Hash of a transaction that reached the network even though the call
    /// failed. A timed-out receipt may still be mined, a reverted one was.
    pub fn broadcast_tx_hash(&self) -> Option<&str> {
        match self {
            Error::Wallet(WalletError::ReceiptTimeout { tx_hash, .. })
            | Error::Wallet(WalletError::Reverted { tx_hash }) => Some(tx_hash),
            _ => None,
        }
    }

    /// Stable tag recorded alongside audit events.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Wallet(e) => e.kind(),
            Error::Config(_) => "config",
            Error::RateLimit { .. } => "rate_limit",
            Error::NotFound { .. } => "not_found",
            Error::AlreadyExists { .. } => "already_exists",
            Error::Rpc(_) => "rpc",
            Error::InvalidArgument(_) => "invalid_argument",
            Error::Storage(_) => "storage",
            Error::Json(_) => "json",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
