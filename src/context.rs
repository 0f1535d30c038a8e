//! Application context wiring
//!
//! Everything the tool surface needs is built once here and passed around
//! explicitly.

use crate::clock::{Clock, SystemClock};
use crate::config::AppConfig;
use crate::error::Result;
use crate::policy::PolicyEngine;
use crate::rpc::{ChainClient, RpcAdapter};
use crate::store::{Store, TenantId};
use crate::strategy::{StrategyEngine, StrategyScheduler};
use crate::tools::Tools;
use crate::wallet::{Vault, WalletManager};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AppContext {
    pub store: Store,
    pub chain: Arc<dyn ChainClient>,
    pub wallets: Arc<WalletManager>,
    pub strategies: Arc<StrategyEngine>,
    pub policy: Arc<PolicyEngine>,
    pub tools: Tools,
    pub default_tenant: TenantId,
}

impl AppContext {
    /// Connect the store, load the vault key and policy file, and build the
    /// RPC adapter from `config`.
    pub async fn from_config(config: &AppConfig) -> Result<Self> {
        let chain: Arc<dyn ChainClient> = Arc::new(RpcAdapter::new(&config.rpc)?);
        Self::with_chain(config, chain, Arc::new(SystemClock)).await
    }

    /// Same as [`from_config`](Self::from_config) over a caller-supplied chain
    /// client and clock.
    pub async fn with_chain(
        config: &AppConfig,
        chain: Arc<dyn ChainClient>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let store = Store::connect(&config.database_url).await?;
        let vault = Arc::new(Vault::load(&config.key_material).await?);

        let wallets = Arc::new(
            WalletManager::new(
                store.clone(),
                chain.clone(),
                vault,
                config.guard.clone(),
                clock.clone(),
            )
            .with_receipt_timeout(config.rpc.receipt_timeout)
            .with_faucet_url(config.faucet_url.clone()),
        );
        let strategies = Arc::new(StrategyEngine::new(store.clone(), wallets.clone(), clock.clone()));
        let policy = Arc::new(
            PolicyEngine::from_file(store.clone(), config.policy_path.clone(), clock).await?,
        );
        let tools = Tools::new(wallets.clone(), strategies.clone(), policy.clone());

        tracing::info!(
            rpc = %chain.current_endpoint(),
            policy = %config.policy_path.display(),
            "Application context ready"
        );

        Ok(Self {
            store,
            chain,
            wallets,
            strategies,
            policy,
            tools,
            default_tenant: TenantId::new(config.default_tenant.clone()),
        })
    }

    pub fn scheduler(&self, tenant: TenantId, poll_interval: Duration) -> StrategyScheduler {
        StrategyScheduler::new(self.strategies.clone(), tenant, poll_interval)
    }
}
