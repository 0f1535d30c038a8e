//! Configuration for the agent wallet control plane

pub mod rpc;

use crate::error::WalletError;
use alloy::primitives::utils::{format_ether, parse_ether};
use alloy::primitives::U256;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use std::path::PathBuf;
use url::Url;

// Re-export RPC config
pub use rpc::RpcConfig;

/// Environment variable names
mod env_vars {
    pub const DATABASE_URL: &str = "VAULTPILOT_DATABASE_URL";
    pub const POLICY_PATH: &str = "VAULTPILOT_POLICY_PATH";
    pub const ENCRYPT_KEY: &str = "ENCRYPT_KEY";
    pub const KEY_FILE: &str = "AGENTVAULT_KEY_FILE";
    pub const TENANT: &str = "AGENTVAULT_TENANT";
    pub const MAX_TX_ETH: &str = "AGENTVAULT_MAX_TX_ETH";
    pub const TX_CONFIRM_CODE: &str = "AGENTVAULT_TX_CONFIRM_CODE";
    pub const ALLOW_PLAINTEXT_EXPORT: &str = "AGENTVAULT_ALLOW_PLAINTEXT_EXPORT";
    pub const EXPORT_CODE: &str = "AGENTVAULT_EXPORT_CODE";
    pub const FAUCET_URL: &str = "AGENTVAULT_FAUCET_URL";
}

pub const DEFAULT_DATABASE_URL: &str = "sqlite://agentvault.db?mode=rwc";
pub const DEFAULT_POLICY_PATH: &str = "vaultpilot_policy.yml";
pub const DEFAULT_KEY_FILE: &str = "agentvault.key";
pub const DEFAULT_TENANT: &str = "default";

/// Where the process-wide symmetric key comes from
#[derive(Debug, Clone)]
pub enum KeyMaterial {
    /// Base64 key passed explicitly (ENCRYPT_KEY)
    Inline(SecretString),
    /// Key file, generated on first start when absent
    File(PathBuf),
}

/// Server-side secrets gating large transfers and plaintext key export
#[derive(Debug, Clone, Default)]
pub struct TransferGuard {
    /// Transfers above this amount need the confirmation code
    pub max_tx_wei: Option<U256>,
    pub confirm_code: Option<SecretString>,
    /// Plaintext export opt-in
    pub allow_plaintext_export: bool,
    pub export_code: Option<SecretString>,
}

impl TransferGuard {
    /// Amount must be within the threshold, or the caller must present the
    /// configured confirmation code. No threshold means no limit.
    pub fn check_transfer(
        &self,
        amount_wei: U256,
        confirmation_code: Option<&str>,
    ) -> Result<(), WalletError> {
        let Some(threshold) = self.max_tx_wei else {
            return Ok(());
        };
        if amount_wei <= threshold {
            return Ok(());
        }
        if codes_match(self.confirm_code.as_ref(), confirmation_code) {
            return Ok(());
        }
        Err(WalletError::ConfirmationRequired {
            amount: format_ether(amount_wei),
            threshold: format_ether(threshold),
        })
    }

    /// Both the opt-in flag and a matching export code are required.
    pub fn check_plaintext_export(&self, confirmation_code: Option<&str>) -> Result<(), WalletError> {
        if !self.allow_plaintext_export {
            return Err(WalletError::ExportForbidden(
                "plaintext export disabled, set AGENTVAULT_ALLOW_PLAINTEXT_EXPORT=1 to enable"
                    .to_string(),
            ));
        }
        if !codes_match(self.export_code.as_ref(), confirmation_code) {
            return Err(WalletError::ExportForbidden(
                "plaintext export requires a valid confirmation code".to_string(),
            ));
        }
        Ok(())
    }
}

fn codes_match(expected: Option<&SecretString>, supplied: Option<&str>) -> bool {
    match (expected, supplied) {
        (Some(expected), Some(supplied)) => {
            let expected = expected.expose_secret().as_bytes();
            let supplied = supplied.as_bytes();
            // length leaks, contents do not
            expected.len() == supplied.len()
                && expected
                    .iter()
                    .zip(supplied)
                    .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                    == 0
        }
        _ => false,
    }
}

/// Main configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub key_material: KeyMaterial,
    pub rpc: RpcConfig,
    pub guard: TransferGuard,
    pub faucet_url: Option<Url>,
    /// Rate-limit rules file (YAML or JSON)
    pub policy_path: PathBuf,
    pub default_tenant: String,
}

impl AppConfig {
    /// Load from the process environment (after `.env`, if present).
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let key_material = match var(env_vars::ENCRYPT_KEY) {
            Some(key) => KeyMaterial::Inline(SecretString::from(key)),
            None => KeyMaterial::File(PathBuf::from(
                var(env_vars::KEY_FILE).unwrap_or_else(|| DEFAULT_KEY_FILE.to_string()),
            )),
        };

        let max_tx_wei = var(env_vars::MAX_TX_ETH).and_then(|raw| match parse_ether(raw.trim()) {
            Ok(wei) => Some(wei),
            Err(e) => {
                tracing::warn!(value = %raw, error = %e, "Invalid AGENTVAULT_MAX_TX_ETH, spend limit disabled");
                None
            }
        });

        let faucet_url = var(env_vars::FAUCET_URL).and_then(|raw| match Url::parse(&raw) {
            Ok(url) => Some(url),
            Err(e) => {
                tracing::warn!(error = %e, "Invalid AGENTVAULT_FAUCET_URL, faucet disabled");
                None
            }
        });

        Self {
            database_url: var(env_vars::DATABASE_URL)
                .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            key_material,
            rpc: RpcConfig::from_lookup(&lookup),
            guard: TransferGuard {
                max_tx_wei,
                confirm_code: var(env_vars::TX_CONFIRM_CODE).map(SecretString::from),
                allow_plaintext_export: var(env_vars::ALLOW_PLAINTEXT_EXPORT).as_deref()
                    == Some("1"),
                export_code: var(env_vars::EXPORT_CODE).map(SecretString::from),
            },
            faucet_url,
            policy_path: PathBuf::from(
                var(env_vars::POLICY_PATH).unwrap_or_else(|| DEFAULT_POLICY_PATH.to_string()),
            ),
            default_tenant: var(env_vars::TENANT).unwrap_or_else(|| DEFAULT_TENANT.to_string()),
        }
    }

    /// Printable view with secrets reduced to presence flags.
    pub fn summary(&self) -> ConfigSummary {
        ConfigSummary {
            database_url: self.database_url.clone(),
            key_source: match &self.key_material {
                KeyMaterial::Inline(_) => "ENCRYPT_KEY".to_string(),
                KeyMaterial::File(path) => path.display().to_string(),
            },
            rpc_endpoints: self.rpc.urls().iter().map(|u| redact_url(u)).collect(),
            rpc_retry_attempts: self.rpc.retry.attempts,
            receipt_timeout_secs: self.rpc.receipt_timeout.as_secs(),
            max_tx_eth: self.guard.max_tx_wei.map(format_ether),
            tx_confirm_code_configured: self.guard.confirm_code.is_some(),
            plaintext_export_enabled: self.guard.allow_plaintext_export,
            export_code_configured: self.guard.export_code.is_some(),
            faucet_configured: self.faucet_url.is_some(),
            policy_path: self.policy_path.display().to_string(),
            default_tenant: self.default_tenant.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigSummary {
    pub database_url: String,
    pub key_source: String,
    pub rpc_endpoints: Vec<String>,
    pub rpc_retry_attempts: usize,
    pub receipt_timeout_secs: u64,
    pub max_tx_eth: Option<String>,
    pub tx_confirm_code_configured: bool,
    pub plaintext_export_enabled: bool,
    pub export_code_configured: bool,
    pub faucet_configured: bool,
    pub policy_path: String,
    pub default_tenant: String,
}

/// Hide provider API keys embedded in endpoint paths.
fn redact_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(url) if url.path().len() > 1 => {
            format!("{}://{}/…", url.scheme(), url.host_str().unwrap_or_default())
        }
        Ok(url) => url.to_string().trim_end_matches('/').to_string(),
        Err(_) => "<invalid url>".to_string(),
    }
}
