//! Recurring payment automation
//!
//! A strategy moves through `disabled -> waiting -> due -> executing ->
//! waiting`. [`StrategyEngine::tick`] is the only operation that advances a
//! strategy's schedule or spend accounting. Ticks for one label are
//! serialized, so concurrent triggers never double-spend.

mod model;
mod oneshot;
mod scheduler;

pub use model::{NewStrategy, Strategy, StrategyKind};
pub use oneshot::{OneShotReport, TipOutcome, TipTransfer};
pub use scheduler::StrategyScheduler;

use crate::clock::Clock;
use crate::error::{Error, Result, WalletError};
use crate::store::{NewStrategyRun, Store, StrategyRun, TenantId};
use crate::units::{ser_eth, wei_to_gwei};
use crate::wallet::{TransferSimulation, WalletManager};
use alloy::primitives::{B256, U256};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Why a due strategy did not send
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum WaitReason {
    NotDue {
        seconds_remaining: f64,
    },
    GasAboveThreshold {
        base_fee_gwei: f64,
        max_base_fee_gwei: f64,
    },
    DailyCapReached {
        #[serde(rename = "spent_today_eth", serialize_with = "ser_eth")]
        spent_today: U256,
        #[serde(rename = "daily_cap_eth", serialize_with = "ser_eth")]
        daily_cap: U256,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    InsufficientFunds,
}

/// Result of one tick. Soft failures are outcomes, not errors.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TickOutcome {
    Paused,
    Wait {
        #[serde(flatten)]
        reason: WaitReason,
    },
    Abort {
        reason: AbortReason,
        simulation: TransferSimulation,
    },
    Simulation {
        simulation: TransferSimulation,
    },
    Sent {
        tx_hash: B256,
    },
}

impl TickOutcome {
    /// Tag stored in the run history
    fn run_result(&self) -> &'static str {
        match self {
            TickOutcome::Paused => "paused",
            TickOutcome::Wait {
                reason: WaitReason::NotDue { .. },
            } => "wait",
            TickOutcome::Wait {
                reason: WaitReason::GasAboveThreshold { .. },
            } => "wait_gas_above_threshold",
            TickOutcome::Wait {
                reason: WaitReason::DailyCapReached { .. },
            } => "wait_daily_cap_reached",
            TickOutcome::Abort { .. } => "abort_insufficient_funds",
            TickOutcome::Simulation { .. } => "simulation",
            TickOutcome::Sent { .. } => "sent",
        }
    }

    fn run_record(&self) -> Result<NewStrategyRun> {
        let tx_hash = match self {
            TickOutcome::Sent { tx_hash } => Some(*tx_hash),
            _ => None,
        };
        Ok(NewStrategyRun {
            result: self.run_result(),
            tx_hash,
            detail: serde_json::to_value(self)?,
        })
    }
}

/// Tick outcome plus the strategy as it stands afterwards
#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    #[serde(flatten)]
    pub outcome: TickOutcome,
    pub strategy: Strategy,
}

impl TickReport {
    pub fn outcome_name(&self) -> &'static str {
        self.outcome.run_result()
    }
}

type StrategyKey = (TenantId, String);

pub struct StrategyEngine {
    store: Store,
    wallets: Arc<WalletManager>,
    clock: Arc<dyn Clock>,
    locks: Mutex<HashMap<StrategyKey, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for StrategyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyEngine").finish_non_exhaustive()
    }
}

impl StrategyEngine {
    pub fn new(store: Store, wallets: Arc<WalletManager>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            wallets,
            clock,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn label_lock(&self, tenant: &TenantId, label: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry((tenant.clone(), label.to_string()))
            .or_default()
            .clone()
    }

    async fn load(&self, tenant: &TenantId, label: &str) -> Result<Strategy> {
        self.store
            .get_strategy(tenant, label)
            .await?
            .ok_or_else(|| Error::not_found("strategy", label))
    }

    /// Register a new, disabled strategy. The funding wallet must exist.
    pub async fn create(&self, tenant: &TenantId, strategy: NewStrategy) -> Result<Strategy> {
        strategy.validate(self.clock.now())?;
        self.wallets.wallet(tenant, &strategy.agent_id).await?;
        let created = self
            .store
            .insert_strategy(tenant, &strategy, self.clock.now())
            .await?;
        tracing::info!(
            tenant = %tenant,
            label = %created.label,
            agent_id = %created.agent_id,
            interval_seconds = created.interval_seconds,
            "Strategy created"
        );
        Ok(created)
    }

    /// Enable and schedule the first run one interval from now.
    pub async fn start(&self, tenant: &TenantId, label: &str) -> Result<Strategy> {
        let lock = self.label_lock(tenant, label).await;
        let _guard = lock.lock().await;
        let mut strategy = self.load(tenant, label).await?;
        let now = self.clock.now();
        strategy.enabled = true;
        strategy.schedule_next(now)?;
        self.store.save_strategy_state(&strategy, None, now).await?;
        tracing::info!(tenant = %tenant, label, next_run_at = ?strategy.next_run_at, "Strategy started");
        Ok(strategy)
    }

    /// Disable. The schedule is kept for inspection.
    pub async fn stop(&self, tenant: &TenantId, label: &str) -> Result<Strategy> {
        let lock = self.label_lock(tenant, label).await;
        let _guard = lock.lock().await;
        let mut strategy = self.load(tenant, label).await?;
        let now = self.clock.now();
        strategy.enabled = false;
        self.store.save_strategy_state(&strategy, None, now).await?;
        tracing::info!(tenant = %tenant, label, "Strategy stopped");
        Ok(strategy)
    }

    pub async fn delete(&self, tenant: &TenantId, label: &str) -> Result<Strategy> {
        let lock = self.label_lock(tenant, label).await;
        let _guard = lock.lock().await;
        let deleted = self
            .store
            .delete_strategy(tenant, label)
            .await?
            .ok_or_else(|| Error::not_found("strategy", label))?;
        self.locks
            .lock()
            .await
            .remove(&(tenant.clone(), label.to_string()));
        tracing::info!(tenant = %tenant, label, "Strategy deleted");
        Ok(deleted)
    }

    pub async fn status(&self, tenant: &TenantId, label: &str) -> Result<Strategy> {
        self.load(tenant, label).await
    }

    pub async fn list(&self, tenant: &TenantId) -> Result<Vec<Strategy>> {
        self.store.list_strategies(tenant, None).await
    }

    pub async fn list_for_agent(&self, tenant: &TenantId, agent_id: &str) -> Result<Vec<Strategy>> {
        self.store.list_strategies(tenant, Some(agent_id)).await
    }

    /// Run history, newest first
    pub async fn runs(&self, tenant: &TenantId, label: &str, limit: u32) -> Result<Vec<StrategyRun>> {
        self.load(tenant, label).await?;
        self.store.strategy_runs(tenant, label, limit).await
    }

    /// Labels of enabled strategies whose schedule has come up
    pub async fn due_labels(&self, tenant: &TenantId) -> Result<Vec<String>> {
        Ok(self
            .store
            .due_strategies(tenant, self.clock.now())
            .await?
            .into_iter()
            .map(|s| s.label)
            .collect())
    }

    /// Advance one strategy.
    ///
    /// Every branch past the due check consumes the schedule slot and appends
    /// a run record. Execution failures are recorded, rescheduled and then
    /// returned as errors.
    pub async fn tick(
        &self,
        tenant: &TenantId,
        label: &str,
        dry_run: bool,
        confirmation_code: Option<&str>,
    ) -> Result<TickReport> {
        let lock = self.label_lock(tenant, label).await;
        let _guard = lock.lock().await;

        let mut strategy = self.load(tenant, label).await?;
        if !strategy.enabled {
            return Ok(TickReport {
                outcome: TickOutcome::Paused,
                strategy,
            });
        }

        let now = self.clock.now();
        strategy.reset_daily_if_needed(now);
        if !strategy.is_due(now) {
            let seconds_remaining = strategy.seconds_until_due(now);
            return Ok(TickReport {
                outcome: TickOutcome::Wait {
                    reason: WaitReason::NotDue { seconds_remaining },
                },
                strategy,
            });
        }

        if let Some(ceiling) = strategy.max_base_fee_gwei {
            if let (_, Some(reason)) = self.gas_gate(ceiling).await? {
                return self.finish(strategy, TickOutcome::Wait { reason }, now).await;
            }
        }

        let to = strategy.to_address.to_string();
        let simulation = self
            .wallets
            .simulate_transfer(tenant, &strategy.agent_id, &to, strategy.amount_wei)
            .await?;
        if simulation.insufficient_funds {
            tracing::warn!(tenant = %tenant, label, "Strategy wallet cannot cover the transfer");
            let outcome = TickOutcome::Abort {
                reason: AbortReason::InsufficientFunds,
                simulation,
            };
            return self.finish(strategy, outcome, now).await;
        }

        if let Some(daily_cap) = strategy.daily_cap_wei.filter(|_| strategy.would_exceed_daily_cap()) {
            let outcome = TickOutcome::Wait {
                reason: WaitReason::DailyCapReached {
                    spent_today: strategy.spent_today_wei,
                    daily_cap,
                },
            };
            return self.finish(strategy, outcome, now).await;
        }

        if dry_run {
            return self
                .finish(strategy, TickOutcome::Simulation { simulation }, now)
                .await;
        }

        match self
            .wallets
            .execute_transfer(
                tenant,
                &strategy.agent_id,
                &to,
                strategy.amount_wei,
                confirmation_code,
            )
            .await
        {
            Ok(receipt) => {
                strategy.last_tx_hash = Some(receipt.tx_hash);
                strategy.last_run_at = Some(now);
                strategy.spent_today_wei = strategy.spent_today_wei.saturating_add(strategy.amount_wei);
                tracing::info!(
                    tenant = %tenant,
                    label,
                    tx_hash = %receipt.tx_hash,
                    "Strategy payment sent"
                );
                self.finish(
                    strategy,
                    TickOutcome::Sent {
                        tx_hash: receipt.tx_hash,
                    },
                    now,
                )
                .await
            }
            Err(e) => {
                tracing::error!(tenant = %tenant, label, error = %e, "Strategy payment failed");
                let tx_hash = e.broadcast_tx_hash().and_then(|hash| hash.parse::<B256>().ok());
                if let Some(hash) = tx_hash {
                    strategy.last_tx_hash = Some(hash);
                    strategy.last_run_at = Some(now);
                }
                // an unconfirmed transfer may still be mined, so it counts
                if matches!(e, Error::Wallet(WalletError::ReceiptTimeout { .. })) {
                    strategy.spent_today_wei =
                        strategy.spent_today_wei.saturating_add(strategy.amount_wei);
                }
                strategy.schedule_next(now)?;
                let run = NewStrategyRun {
                    result: "error",
                    tx_hash,
                    detail: serde_json::json!({
                        "kind": e.kind(),
                        "error": e.to_string(),
                        "tx_hash": tx_hash,
                    }),
                };
                self.store.save_strategy_state(&strategy, Some(&run), now).await?;
                Err(e)
            }
        }
    }

    /// Latest base fee in gwei
    async fn base_fee_gwei(&self) -> Result<f64> {
        let block = self.wallets.chain().get_block_latest().await?;
        Ok(wei_to_gwei(block.base_fee_per_gas.unwrap_or(0)))
    }

    /// Current base fee, plus the reason to wait when it is above `ceiling`.
    async fn gas_gate(&self, ceiling: f64) -> Result<(f64, Option<WaitReason>)> {
        let base_fee_gwei = self.base_fee_gwei().await?;
        let wait = (base_fee_gwei > ceiling).then_some(WaitReason::GasAboveThreshold {
            base_fee_gwei,
            max_base_fee_gwei: ceiling,
        });
        Ok((base_fee_gwei, wait))
    }

    /// Reschedule, persist with a run record, and report.
    async fn finish(
        &self,
        mut strategy: Strategy,
        outcome: TickOutcome,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<TickReport> {
        strategy.schedule_next(now)?;
        let run = outcome.run_record()?;
        self.store.save_strategy_state(&strategy, Some(&run), now).await?;
        tracing::debug!(label = %strategy.label, result = run.result, "Strategy ticked");
        Ok(TickReport { outcome, strategy })
    }
}
