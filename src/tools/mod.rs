//! Public operation surface
//!
//! One method per externally invokable tool. Every method runs through
//! [`PolicyEngine::run_with_policy`], so each call is rate limited per agent
//! and leaves an audit event with its secrets masked.
//!
//! SECURITY NOTE:
//! - Key material, passphrases and confirmation codes are redacted from
//!   request snapshots before they reach the event log
//! - Plaintext key exports are never written to the event log

use crate::error::Result;
use crate::policy::{PolicyConfig, PolicyEngine, ToolCall, REDACTED};
use crate::store::{EventRecord, StrategyRun, TenantId, ToolUsage};
use crate::strategy::{NewStrategy, OneShotReport, Strategy, StrategyEngine, TickReport, TipOutcome};
use crate::units::parse_eth;
use crate::wallet::{
    self, parse_recipient, Balance, ContractInspection, FaucetOutcome, ProviderStatus,
    SignatureCheck, SignedMessage, TransferReceipt, TransferSimulation, WalletInfo, WalletManager,
    WalletSource,
};
use alloy::dyn_abi::TypedData;
use alloy::primitives::Address;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub const TOOL_CREATE_WALLET: &str = "create_wallet";
pub const TOOL_IMPORT_WALLET_PRIVATE_KEY: &str = "import_wallet_private_key";
pub const TOOL_IMPORT_WALLET_MNEMONIC: &str = "import_wallet_mnemonic";
pub const TOOL_IMPORT_WALLET_KEYSTORE: &str = "import_wallet_keystore";
pub const TOOL_LIST_WALLETS: &str = "list_wallets";
pub const TOOL_EXPORT_WALLET_KEYSTORE: &str = "export_wallet_keystore";
pub const TOOL_EXPORT_WALLET_PRIVATE_KEY: &str = "export_wallet_private_key";
pub const TOOL_SIGN_MESSAGE: &str = "sign_message";
pub const TOOL_SIGN_TYPED_DATA: &str = "sign_typed_data";
pub const TOOL_VERIFY_MESSAGE: &str = "verify_message";
pub const TOOL_VERIFY_TYPED_DATA: &str = "verify_typed_data";
pub const TOOL_QUERY_BALANCE: &str = "query_balance";
pub const TOOL_SIMULATE_TRANSFER: &str = "simulate_transfer";
pub const TOOL_EXECUTE_TRANSFER: &str = "execute_transfer";
pub const TOOL_PROVIDER_STATUS: &str = "provider_status";
pub const TOOL_INSPECT_CONTRACT: &str = "inspect_contract";
pub const TOOL_REQUEST_FAUCET_FUNDS: &str = "request_faucet_funds";
pub const TOOL_CREATE_STRATEGY: &str = "create_strategy";
pub const TOOL_START_STRATEGY: &str = "start_strategy";
pub const TOOL_STOP_STRATEGY: &str = "stop_strategy";
pub const TOOL_TICK_STRATEGY: &str = "tick_strategy";
pub const TOOL_STRATEGY_STATUS: &str = "strategy_status";
pub const TOOL_LIST_STRATEGIES: &str = "list_strategies";
pub const TOOL_DELETE_STRATEGY: &str = "delete_strategy";
pub const TOOL_STRATEGY_RUNS: &str = "strategy_runs";
pub const TOOL_SEND_WHEN_GAS_BELOW: &str = "send_when_gas_below";
pub const TOOL_DCA_ONCE: &str = "dca_once";
pub const TOOL_SCHEDULED_SEND_ONCE: &str = "scheduled_send_once";
pub const TOOL_MICRO_TIP_EQUAL: &str = "micro_tip_equal";
pub const TOOL_MICRO_TIP_AMOUNTS: &str = "micro_tip_amounts";

/// Request fields that never reach the event log
const SECRET_FIELDS: &[&str] = &[
    "private_key",
    "mnemonic",
    "passphrase",
    "password",
    "confirmation_code",
    "keystore_json",
];

/// Signing payloads are the caller's data, only their presence is logged
const SIGN_MESSAGE_SECRETS: &[&str] = &["message"];
const SIGN_TYPED_DATA_SECRETS: &[&str] = &["typed_data"];

/// Plaintext key handed back to the caller. Serializes without the key.
pub struct PrivateKeyExport {
    pub agent_id: String,
    pub private_key: SecretString,
}

impl std::fmt::Debug for PrivateKeyExport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateKeyExport")
            .field("agent_id", &self.agent_id)
            .field("private_key", &REDACTED)
            .finish()
    }
}

impl Serialize for PrivateKeyExport {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("PrivateKeyExport", 2)?;
        state.serialize_field("agent_id", &self.agent_id)?;
        state.serialize_field("private_key", REDACTED)?;
        state.end()
    }
}

/// Web3 Secret Storage JSON for one agent's key
#[derive(Debug, Clone, Serialize)]
pub struct KeystoreExport {
    pub agent_id: String,
    pub keystore_json: String,
}

/// Inputs for `create_strategy`, amounts in ETH
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateStrategyRequest {
    pub label: String,
    pub agent_id: String,
    pub to_address: String,
    pub amount_eth: String,
    pub interval_seconds: u64,
    #[serde(default)]
    pub max_base_fee_gwei: Option<f64>,
    #[serde(default)]
    pub daily_cap_eth: Option<String>,
    #[serde(default)]
    pub config: Option<serde_json::Value>,
}

impl CreateStrategyRequest {
    fn into_new_strategy(self) -> Result<NewStrategy> {
        Ok(NewStrategy {
            to_address: parse_recipient(&self.to_address)?,
            amount_wei: parse_eth(&self.amount_eth)?,
            daily_cap_wei: self.daily_cap_eth.as_deref().map(parse_eth).transpose()?,
            label: self.label,
            agent_id: self.agent_id,
            interval_seconds: self.interval_seconds,
            max_base_fee_gwei: self.max_base_fee_gwei,
            config: self.config.unwrap_or_else(|| json!({})),
        })
    }
}

/// The audited tool surface over one set of managers
#[derive(Debug, Clone)]
pub struct Tools {
    wallets: Arc<WalletManager>,
    strategies: Arc<StrategyEngine>,
    policy: Arc<PolicyEngine>,
}

impl Tools {
    pub fn new(
        wallets: Arc<WalletManager>,
        strategies: Arc<StrategyEngine>,
        policy: Arc<PolicyEngine>,
    ) -> Self {
        Self {
            wallets,
            strategies,
            policy,
        }
    }

    pub fn policy(&self) -> &Arc<PolicyEngine> {
        &self.policy
    }

    // ---------------------------------------------------------------------
    // Wallets

    pub async fn create_wallet(&self, tenant: &TenantId, agent_id: &str) -> Result<WalletInfo> {
        let call = ToolCall::new(tenant, TOOL_CREATE_WALLET, Some(agent_id))
            .request(json!({ "agent_id": agent_id }), SECRET_FIELDS);
        self.policy
            .run_with_policy(call, || self.wallets.create_wallet(tenant, agent_id))
            .await
    }

    pub async fn import_wallet_private_key(
        &self,
        tenant: &TenantId,
        agent_id: &str,
        private_key: SecretString,
        rotate: bool,
    ) -> Result<WalletInfo> {
        let call = ToolCall::new(tenant, TOOL_IMPORT_WALLET_PRIVATE_KEY, Some(agent_id)).request(
            json!({
                "agent_id": agent_id,
                "private_key": private_key.expose_secret(),
                "rotate": rotate,
            }),
            SECRET_FIELDS,
        );
        self.policy
            .run_with_policy(call, || {
                self.wallets
                    .import_wallet(tenant, agent_id, WalletSource::PrivateKey(private_key), rotate)
            })
            .await
    }

    pub async fn import_wallet_mnemonic(
        &self,
        tenant: &TenantId,
        agent_id: &str,
        mnemonic: SecretString,
        derivation_path: Option<String>,
        passphrase: Option<SecretString>,
        rotate: bool,
    ) -> Result<WalletInfo> {
        let call = ToolCall::new(tenant, TOOL_IMPORT_WALLET_MNEMONIC, Some(agent_id)).request(
            json!({
                "agent_id": agent_id,
                "mnemonic": mnemonic.expose_secret(),
                "derivation_path": derivation_path,
                "passphrase": passphrase.as_ref().map(|p| p.expose_secret()),
                "rotate": rotate,
            }),
            SECRET_FIELDS,
        );
        let source = WalletSource::Mnemonic {
            phrase: mnemonic,
            derivation_path,
            passphrase,
        };
        self.policy
            .run_with_policy(call, || {
                self.wallets.import_wallet(tenant, agent_id, source, rotate)
            })
            .await
    }

    pub async fn import_wallet_keystore(
        &self,
        tenant: &TenantId,
        agent_id: &str,
        keystore_json: String,
        password: SecretString,
        rotate: bool,
    ) -> Result<WalletInfo> {
        let call = ToolCall::new(tenant, TOOL_IMPORT_WALLET_KEYSTORE, Some(agent_id)).request(
            json!({
                "agent_id": agent_id,
                "keystore_json": keystore_json,
                "password": password.expose_secret(),
                "rotate": rotate,
            }),
            SECRET_FIELDS,
        );
        let source = WalletSource::Keystore {
            json: keystore_json,
            password,
        };
        self.policy
            .run_with_policy(call, || {
                self.wallets.import_wallet(tenant, agent_id, source, rotate)
            })
            .await
    }

    /// Agent id to address for every wallet in the tenant
    pub async fn list_wallets(&self, tenant: &TenantId) -> Result<BTreeMap<String, Address>> {
        let call = ToolCall::new(tenant, TOOL_LIST_WALLETS, None);
        self.policy
            .run_with_policy(call, || async {
                Ok(self
                    .wallets
                    .list_wallets(tenant)
                    .await?
                    .into_iter()
                    .map(|w| (w.agent_id, w.address))
                    .collect())
            })
            .await
    }

    pub async fn export_wallet_keystore(
        &self,
        tenant: &TenantId,
        agent_id: &str,
        passphrase: SecretString,
    ) -> Result<KeystoreExport> {
        let call = ToolCall::new(tenant, TOOL_EXPORT_WALLET_KEYSTORE, Some(agent_id))
            .request(
                json!({ "agent_id": agent_id, "passphrase": passphrase.expose_secret() }),
                SECRET_FIELDS,
            )
            .redact_response();
        self.policy
            .run_with_policy(call, || async {
                let keystore_json = self
                    .wallets
                    .export_wallet_keystore(tenant, agent_id, passphrase)
                    .await?;
                Ok(KeystoreExport {
                    agent_id: agent_id.to_string(),
                    keystore_json,
                })
            })
            .await
    }

    pub async fn export_wallet_private_key(
        &self,
        tenant: &TenantId,
        agent_id: &str,
        confirmation_code: Option<&str>,
    ) -> Result<PrivateKeyExport> {
        let call = ToolCall::new(tenant, TOOL_EXPORT_WALLET_PRIVATE_KEY, Some(agent_id))
            .request(
                json!({ "agent_id": agent_id, "confirmation_code": confirmation_code }),
                SECRET_FIELDS,
            )
            .redact_response();
        self.policy
            .run_with_policy(call, || async {
                let private_key = self
                    .wallets
                    .export_wallet_private_key(tenant, agent_id, confirmation_code)
                    .await?;
                Ok(PrivateKeyExport {
                    agent_id: agent_id.to_string(),
                    private_key,
                })
            })
            .await
    }

    // ---------------------------------------------------------------------
    // Signatures

    pub async fn sign_message(
        &self,
        tenant: &TenantId,
        agent_id: &str,
        message: &str,
    ) -> Result<SignedMessage> {
        let call = ToolCall::new(tenant, TOOL_SIGN_MESSAGE, Some(agent_id))
            .request(json!({ "agent_id": agent_id, "message": message }), SIGN_MESSAGE_SECRETS);
        self.policy
            .run_with_policy(call, || self.wallets.sign_message(tenant, agent_id, message))
            .await
    }

    pub async fn sign_typed_data(
        &self,
        tenant: &TenantId,
        agent_id: &str,
        typed_data: &TypedData,
    ) -> Result<SignedMessage> {
        let call = ToolCall::new(tenant, TOOL_SIGN_TYPED_DATA, Some(agent_id)).request(
            json!({
                "agent_id": agent_id,
                "primary_type": typed_data.primary_type,
                "typed_data": &typed_data.message,
            }),
            SIGN_TYPED_DATA_SECRETS,
        );
        self.policy
            .run_with_policy(call, || {
                self.wallets.sign_typed_data(tenant, agent_id, typed_data)
            })
            .await
    }

    pub async fn verify_message(
        &self,
        tenant: &TenantId,
        address: &str,
        message: &str,
        signature: &str,
    ) -> Result<SignatureCheck> {
        let call = ToolCall::new(tenant, TOOL_VERIFY_MESSAGE, None).request(
            json!({ "address": address, "message": message, "signature": signature }),
            SECRET_FIELDS,
        );
        self.policy
            .run_with_policy(call, || async {
                wallet::verify_message(address, message, signature)
            })
            .await
    }

    pub async fn verify_typed_data(
        &self,
        tenant: &TenantId,
        address: &str,
        typed_data: &TypedData,
        signature: &str,
    ) -> Result<SignatureCheck> {
        let call = ToolCall::new(tenant, TOOL_VERIFY_TYPED_DATA, None).request(
            json!({
                "address": address,
                "primary_type": typed_data.primary_type,
                "signature": signature,
            }),
            SECRET_FIELDS,
        );
        self.policy
            .run_with_policy(call, || async {
                wallet::verify_typed_data(address, typed_data, signature)
            })
            .await
    }

    // ---------------------------------------------------------------------
    // Chain

    pub async fn query_balance(&self, tenant: &TenantId, agent_id: &str) -> Result<Balance> {
        let call = ToolCall::new(tenant, TOOL_QUERY_BALANCE, Some(agent_id))
            .request(json!({ "agent_id": agent_id }), SECRET_FIELDS);
        self.policy
            .run_with_policy(call, || self.wallets.query_balance(tenant, agent_id))
            .await
    }

    pub async fn simulate_transfer(
        &self,
        tenant: &TenantId,
        agent_id: &str,
        to: &str,
        amount_eth: &str,
    ) -> Result<TransferSimulation> {
        let call = ToolCall::new(tenant, TOOL_SIMULATE_TRANSFER, Some(agent_id)).request(
            json!({ "agent_id": agent_id, "to": to, "amount_eth": amount_eth }),
            SECRET_FIELDS,
        );
        self.policy
            .run_with_policy(call, || async {
                let amount_wei = parse_eth(amount_eth)?;
                self.wallets
                    .simulate_transfer(tenant, agent_id, to, amount_wei)
                    .await
            })
            .await
    }

    pub async fn execute_transfer(
        &self,
        tenant: &TenantId,
        agent_id: &str,
        to: &str,
        amount_eth: &str,
        confirmation_code: Option<&str>,
    ) -> Result<TransferReceipt> {
        let call = ToolCall::new(tenant, TOOL_EXECUTE_TRANSFER, Some(agent_id)).request(
            json!({
                "agent_id": agent_id,
                "to": to,
                "amount_eth": amount_eth,
                "confirmation_code": confirmation_code,
            }),
            SECRET_FIELDS,
        );
        self.policy
            .run_with_policy(call, || async {
                let amount_wei = parse_eth(amount_eth)?;
                self.wallets
                    .execute_transfer(tenant, agent_id, to, amount_wei, confirmation_code)
                    .await
            })
            .await
    }

    pub async fn provider_status(&self, tenant: &TenantId) -> Result<ProviderStatus> {
        let call = ToolCall::new(tenant, TOOL_PROVIDER_STATUS, None);
        self.policy
            .run_with_policy(call, || self.wallets.provider_status())
            .await
    }

    pub async fn inspect_contract(
        &self,
        tenant: &TenantId,
        address: &str,
    ) -> Result<ContractInspection> {
        let call = ToolCall::new(tenant, TOOL_INSPECT_CONTRACT, None)
            .request(json!({ "address": address }), SECRET_FIELDS);
        self.policy
            .run_with_policy(call, || self.wallets.inspect_contract(address))
            .await
    }

    pub async fn request_faucet_funds(
        &self,
        tenant: &TenantId,
        agent_id: &str,
        amount_eth: Option<&str>,
        timeout: Duration,
    ) -> Result<FaucetOutcome> {
        let call = ToolCall::new(tenant, TOOL_REQUEST_FAUCET_FUNDS, Some(agent_id)).request(
            json!({
                "agent_id": agent_id,
                "amount_eth": amount_eth,
                "timeout_seconds": timeout.as_secs(),
            }),
            SECRET_FIELDS,
        );
        self.policy
            .run_with_policy(call, || {
                self.wallets
                    .request_faucet_funds(tenant, agent_id, amount_eth, timeout)
            })
            .await
    }

    // ---------------------------------------------------------------------
    // Strategies

    pub async fn create_strategy(
        &self,
        tenant: &TenantId,
        request: CreateStrategyRequest,
    ) -> Result<Strategy> {
        let snapshot = serde_json::to_value(&request)?;
        let agent_id = request.agent_id.clone();
        let call = ToolCall::new(tenant, TOOL_CREATE_STRATEGY, Some(&agent_id))
            .request(snapshot, SECRET_FIELDS);
        self.policy
            .run_with_policy(call, || async {
                self.strategies
                    .create(tenant, request.into_new_strategy()?)
                    .await
            })
            .await
    }

    pub async fn start_strategy(&self, tenant: &TenantId, label: &str) -> Result<Strategy> {
        let call = ToolCall::new(tenant, TOOL_START_STRATEGY, None)
            .request(json!({ "label": label }), SECRET_FIELDS);
        self.policy
            .run_with_policy(call, || self.strategies.start(tenant, label))
            .await
    }

    pub async fn stop_strategy(&self, tenant: &TenantId, label: &str) -> Result<Strategy> {
        let call = ToolCall::new(tenant, TOOL_STOP_STRATEGY, None)
            .request(json!({ "label": label }), SECRET_FIELDS);
        self.policy
            .run_with_policy(call, || self.strategies.stop(tenant, label))
            .await
    }

    pub async fn tick_strategy(
        &self,
        tenant: &TenantId,
        label: &str,
        dry_run: bool,
        confirmation_code: Option<&str>,
    ) -> Result<TickReport> {
        let call = ToolCall::new(tenant, TOOL_TICK_STRATEGY, None).request(
            json!({
                "label": label,
                "dry_run": dry_run,
                "confirmation_code": confirmation_code,
            }),
            SECRET_FIELDS,
        );
        self.policy
            .run_with_policy(call, || {
                self.strategies.tick(tenant, label, dry_run, confirmation_code)
            })
            .await
    }

    pub async fn strategy_status(&self, tenant: &TenantId, label: &str) -> Result<Strategy> {
        let call = ToolCall::new(tenant, TOOL_STRATEGY_STATUS, None)
            .request(json!({ "label": label }), SECRET_FIELDS);
        self.policy
            .run_with_policy(call, || self.strategies.status(tenant, label))
            .await
    }

    /// All strategies in the tenant, or only those funded by `agent_id`
    pub async fn list_strategies(
        &self,
        tenant: &TenantId,
        agent_id: Option<&str>,
    ) -> Result<Vec<Strategy>> {
        let call = ToolCall::new(tenant, TOOL_LIST_STRATEGIES, agent_id)
            .request(json!({ "agent_id": agent_id }), SECRET_FIELDS);
        self.policy
            .run_with_policy(call, || async {
                match agent_id {
                    Some(agent_id) => self.strategies.list_for_agent(tenant, agent_id).await,
                    None => self.strategies.list(tenant).await,
                }
            })
            .await
    }

    pub async fn delete_strategy(&self, tenant: &TenantId, label: &str) -> Result<Strategy> {
        let call = ToolCall::new(tenant, TOOL_DELETE_STRATEGY, None)
            .request(json!({ "label": label }), SECRET_FIELDS);
        self.policy
            .run_with_policy(call, || self.strategies.delete(tenant, label))
            .await
    }

    pub async fn strategy_runs(
        &self,
        tenant: &TenantId,
        label: &str,
        limit: u32,
    ) -> Result<Vec<StrategyRun>> {
        let call = ToolCall::new(tenant, TOOL_STRATEGY_RUNS, None)
            .request(json!({ "label": label, "limit": limit }), SECRET_FIELDS);
        self.policy
            .run_with_policy(call, || self.strategies.runs(tenant, label, limit))
            .await
    }

    // ---------------------------------------------------------------------
    // One-shot payments

    #[allow(clippy::too_many_arguments)]
    pub async fn send_when_gas_below(
        &self,
        tenant: &TenantId,
        agent_id: &str,
        to: &str,
        amount_eth: &str,
        max_base_fee_gwei: f64,
        dry_run: bool,
        confirmation_code: Option<&str>,
    ) -> Result<OneShotReport> {
        let call = ToolCall::new(tenant, TOOL_SEND_WHEN_GAS_BELOW, Some(agent_id)).request(
            json!({
                "agent_id": agent_id,
                "to": to,
                "amount_eth": amount_eth,
                "max_base_fee_gwei": max_base_fee_gwei,
                "dry_run": dry_run,
                "confirmation_code": confirmation_code,
            }),
            SECRET_FIELDS,
        );
        self.policy
            .run_with_policy(call, || async {
                let amount_wei = parse_eth(amount_eth)?;
                self.strategies
                    .send_when_gas_below(
                        tenant,
                        agent_id,
                        to,
                        amount_wei,
                        max_base_fee_gwei,
                        dry_run,
                        confirmation_code,
                    )
                    .await
            })
            .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn dca_once(
        &self,
        tenant: &TenantId,
        agent_id: &str,
        to: &str,
        amount_eth: &str,
        max_base_fee_gwei: Option<f64>,
        dry_run: bool,
        confirmation_code: Option<&str>,
    ) -> Result<OneShotReport> {
        let call = ToolCall::new(tenant, TOOL_DCA_ONCE, Some(agent_id)).request(
            json!({
                "agent_id": agent_id,
                "to": to,
                "amount_eth": amount_eth,
                "max_base_fee_gwei": max_base_fee_gwei,
                "dry_run": dry_run,
                "confirmation_code": confirmation_code,
            }),
            SECRET_FIELDS,
        );
        self.policy
            .run_with_policy(call, || async {
                let amount_wei = parse_eth(amount_eth)?;
                self.strategies
                    .dca_once(
                        tenant,
                        agent_id,
                        to,
                        amount_wei,
                        max_base_fee_gwei,
                        dry_run,
                        confirmation_code,
                    )
                    .await
            })
            .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn scheduled_send_once(
        &self,
        tenant: &TenantId,
        agent_id: &str,
        to: &str,
        amount_eth: &str,
        send_at: DateTime<Utc>,
        dry_run: bool,
        confirmation_code: Option<&str>,
    ) -> Result<OneShotReport> {
        let call = ToolCall::new(tenant, TOOL_SCHEDULED_SEND_ONCE, Some(agent_id)).request(
            json!({
                "agent_id": agent_id,
                "to": to,
                "amount_eth": amount_eth,
                "send_at": send_at,
                "dry_run": dry_run,
                "confirmation_code": confirmation_code,
            }),
            SECRET_FIELDS,
        );
        self.policy
            .run_with_policy(call, || async {
                let amount_wei = parse_eth(amount_eth)?;
                self.strategies
                    .scheduled_send_once(
                        tenant,
                        agent_id,
                        to,
                        amount_wei,
                        send_at,
                        dry_run,
                        confirmation_code,
                    )
                    .await
            })
            .await
    }

    /// Split `total_eth` equally across `recipients`
    pub async fn micro_tip_equal(
        &self,
        tenant: &TenantId,
        agent_id: &str,
        recipients: &[String],
        total_eth: &str,
        dry_run: bool,
        confirmation_code: Option<&str>,
    ) -> Result<TipOutcome> {
        let call = ToolCall::new(tenant, TOOL_MICRO_TIP_EQUAL, Some(agent_id)).request(
            json!({
                "agent_id": agent_id,
                "recipients": recipients,
                "total_eth": total_eth,
                "dry_run": dry_run,
                "confirmation_code": confirmation_code,
            }),
            SECRET_FIELDS,
        );
        self.policy
            .run_with_policy(call, || async {
                let total_wei = parse_eth(total_eth)?;
                self.strategies
                    .micro_tip_equal(
                        tenant,
                        agent_id,
                        recipients,
                        total_wei,
                        dry_run,
                        confirmation_code,
                    )
                    .await
            })
            .await
    }

    /// Tip each recipient its own amount, keyed recipient to ETH amount
    pub async fn micro_tip_amounts(
        &self,
        tenant: &TenantId,
        agent_id: &str,
        amounts_eth: &BTreeMap<String, String>,
        dry_run: bool,
        confirmation_code: Option<&str>,
    ) -> Result<TipOutcome> {
        let call = ToolCall::new(tenant, TOOL_MICRO_TIP_AMOUNTS, Some(agent_id)).request(
            json!({
                "agent_id": agent_id,
                "amounts_eth": amounts_eth,
                "dry_run": dry_run,
                "confirmation_code": confirmation_code,
            }),
            SECRET_FIELDS,
        );
        self.policy
            .run_with_policy(call, || async {
                let items = amounts_eth
                    .iter()
                    .map(|(to, amount)| Ok((to.clone(), parse_eth(amount)?)))
                    .collect::<Result<Vec<_>>>()?;
                self.strategies
                    .micro_tip_amounts(tenant, agent_id, &items, dry_run, confirmation_code)
                    .await
            })
            .await
    }

    // ---------------------------------------------------------------------
    // Policy introspection, not audited

    pub async fn policy_rules(&self) -> Arc<PolicyConfig> {
        self.policy.config().await
    }

    pub async fn recent_events(&self, tenant: &TenantId, limit: u32) -> Result<Vec<EventRecord>> {
        self.policy.recent_events(tenant, limit).await
    }

    pub async fn usage_summary(
        &self,
        tenant: &TenantId,
        since: DateTime<Utc>,
    ) -> Result<Vec<ToolUsage>> {
        self.policy.usage_summary(tenant, since).await
    }
}
