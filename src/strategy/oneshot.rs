//! Stateless one-shot payments
//!
//! Same gas gate, funding check and dry-run handling as a strategy tick, but
//! nothing is persisted: no strategy row, no schedule, no run history.

use super::model::check_base_fee_ceiling;
use super::{AbortReason, StrategyEngine, TickOutcome, WaitReason};
use crate::error::{Error, Result, WalletError};
use crate::store::TenantId;
use crate::units::ser_eth;
use crate::wallet::TransferSimulation;
use alloy::primitives::{Address, B256, U256};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Upper bound on recipients in one tip batch
pub const MAX_TIP_RECIPIENTS: usize = 50;

/// Outcome of a one-shot transfer. `base_fee_gwei` is the fee the gas gate
/// saw when it let the transfer through.
#[derive(Debug, Clone, Serialize)]
pub struct OneShotReport {
    #[serde(flatten)]
    pub outcome: TickOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_fee_gwei: Option<f64>,
}

impl OneShotReport {
    fn new(outcome: TickOutcome) -> Self {
        Self {
            outcome,
            base_fee_gwei: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TipTransfer {
    pub to: Address,
    #[serde(rename = "amount_eth", serialize_with = "ser_eth")]
    pub amount_wei: U256,
    pub tx_hash: Option<B256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of a tip batch. Transfers go out in order and the batch stops at
/// the first failure once something has been broadcast.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TipOutcome {
    Abort {
        reason: AbortReason,
        #[serde(rename = "required_eth", serialize_with = "ser_eth")]
        required: U256,
        simulations: Vec<TransferSimulation>,
    },
    Simulation {
        simulations: Vec<TransferSimulation>,
    },
    Sent {
        transfers: Vec<TipTransfer>,
    },
    Partial {
        transfers: Vec<TipTransfer>,
    },
}

impl StrategyEngine {
    /// Send once the base fee is at or below `max_base_fee_gwei`, otherwise
    /// report a gas wait.
    #[allow(clippy::too_many_arguments)]
    pub async fn send_when_gas_below(
        &self,
        tenant: &TenantId,
        agent_id: &str,
        to: &str,
        amount_wei: U256,
        max_base_fee_gwei: f64,
        dry_run: bool,
        confirmation_code: Option<&str>,
    ) -> Result<OneShotReport> {
        check_base_fee_ceiling(max_base_fee_gwei)?;
        self.send_once(
            tenant,
            agent_id,
            to,
            amount_wei,
            Some(max_base_fee_gwei),
            dry_run,
            confirmation_code,
        )
        .await
    }

    /// A single dollar-cost-averaging payment with an optional gas ceiling
    #[allow(clippy::too_many_arguments)]
    pub async fn dca_once(
        &self,
        tenant: &TenantId,
        agent_id: &str,
        to: &str,
        amount_wei: U256,
        max_base_fee_gwei: Option<f64>,
        dry_run: bool,
        confirmation_code: Option<&str>,
    ) -> Result<OneShotReport> {
        if let Some(ceiling) = max_base_fee_gwei {
            check_base_fee_ceiling(ceiling)?;
        }
        self.send_once(
            tenant,
            agent_id,
            to,
            amount_wei,
            max_base_fee_gwei,
            dry_run,
            confirmation_code,
        )
        .await
    }

    /// Send once `send_at` has passed. Earlier calls report how long is left.
    #[allow(clippy::too_many_arguments)]
    pub async fn scheduled_send_once(
        &self,
        tenant: &TenantId,
        agent_id: &str,
        to: &str,
        amount_wei: U256,
        send_at: DateTime<Utc>,
        dry_run: bool,
        confirmation_code: Option<&str>,
    ) -> Result<OneShotReport> {
        let now = self.clock.now();
        if now < send_at {
            let seconds_remaining = (send_at - now).num_milliseconds().max(0) as f64 / 1000.0;
            return Ok(OneShotReport::new(TickOutcome::Wait {
                reason: WaitReason::NotDue { seconds_remaining },
            }));
        }
        self.send_once(tenant, agent_id, to, amount_wei, None, dry_run, confirmation_code)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_once(
        &self,
        tenant: &TenantId,
        agent_id: &str,
        to: &str,
        amount_wei: U256,
        max_base_fee_gwei: Option<f64>,
        dry_run: bool,
        confirmation_code: Option<&str>,
    ) -> Result<OneShotReport> {
        let mut base_fee_gwei = None;
        if let Some(ceiling) = max_base_fee_gwei {
            match self.gas_gate(ceiling).await? {
                (_, Some(reason)) => {
                    return Ok(OneShotReport::new(TickOutcome::Wait { reason }));
                }
                (current, None) => base_fee_gwei = Some(current),
            }
        }

        let simulation = self
            .wallets
            .simulate_transfer(tenant, agent_id, to, amount_wei)
            .await?;
        let outcome = if simulation.insufficient_funds {
            tracing::warn!(tenant = %tenant, agent_id, "Wallet cannot cover one-shot transfer");
            TickOutcome::Abort {
                reason: AbortReason::InsufficientFunds,
                simulation,
            }
        } else if dry_run {
            TickOutcome::Simulation { simulation }
        } else {
            let receipt = self
                .wallets
                .execute_transfer(tenant, agent_id, to, amount_wei, confirmation_code)
                .await?;
            tracing::info!(tenant = %tenant, agent_id, tx_hash = %receipt.tx_hash, "One-shot payment sent");
            TickOutcome::Sent {
                tx_hash: receipt.tx_hash,
            }
        };
        Ok(OneShotReport {
            outcome,
            base_fee_gwei,
        })
    }

    /// Split `total_wei` equally across `recipients`. Wei left over by the
    /// division goes to the first recipient.
    pub async fn micro_tip_equal(
        &self,
        tenant: &TenantId,
        agent_id: &str,
        recipients: &[String],
        total_wei: U256,
        dry_run: bool,
        confirmation_code: Option<&str>,
    ) -> Result<TipOutcome> {
        if recipients.is_empty() {
            return Err(Error::InvalidArgument("at least one recipient is required".to_string()));
        }
        let count = U256::from(recipients.len());
        let share = total_wei / count;
        if share.is_zero() {
            return Err(WalletError::InvalidAmount.into());
        }
        let remainder = total_wei % count;
        let items: Vec<(String, U256)> = recipients
            .iter()
            .enumerate()
            .map(|(i, to)| {
                let amount = if i == 0 { share + remainder } else { share };
                (to.clone(), amount)
            })
            .collect();
        self.micro_tip_amounts(tenant, agent_id, &items, dry_run, confirmation_code)
            .await
    }

    /// Send each `(recipient, amount)` in order, after checking the wallet
    /// covers the whole batch.
    pub async fn micro_tip_amounts(
        &self,
        tenant: &TenantId,
        agent_id: &str,
        items: &[(String, U256)],
        dry_run: bool,
        confirmation_code: Option<&str>,
    ) -> Result<TipOutcome> {
        if items.is_empty() {
            return Err(Error::InvalidArgument("at least one recipient is required".to_string()));
        }
        if items.len() > MAX_TIP_RECIPIENTS {
            return Err(Error::InvalidArgument(format!(
                "at most {} recipients per batch",
                MAX_TIP_RECIPIENTS
            )));
        }

        let mut simulations = Vec::with_capacity(items.len());
        for (to, amount) in items {
            simulations.push(
                self.wallets
                    .simulate_transfer(tenant, agent_id, to, *amount)
                    .await?,
            );
        }
        let required = simulations
            .iter()
            .fold(U256::ZERO, |acc, s| acc.saturating_add(s.estimated_total_wei));
        let balance = simulations.first().map(|s| s.balance_wei).unwrap_or_default();
        if required > balance {
            tracing::warn!(tenant = %tenant, agent_id, recipients = items.len(), "Wallet cannot cover tip batch");
            return Ok(TipOutcome::Abort {
                reason: AbortReason::InsufficientFunds,
                required,
                simulations,
            });
        }
        if dry_run {
            return Ok(TipOutcome::Simulation { simulations });
        }

        let mut transfers = Vec::with_capacity(items.len());
        for ((to, amount), simulation) in items.iter().zip(&simulations) {
            match self
                .wallets
                .execute_transfer(tenant, agent_id, to, *amount, confirmation_code)
                .await
            {
                Ok(receipt) => transfers.push(TipTransfer {
                    to: simulation.to,
                    amount_wei: *amount,
                    tx_hash: Some(receipt.tx_hash),
                    error: None,
                }),
                Err(e) => {
                    let tx_hash = e.broadcast_tx_hash().and_then(|hash| hash.parse::<B256>().ok());
                    if transfers.is_empty() && tx_hash.is_none() {
                        return Err(e);
                    }
                    tracing::error!(tenant = %tenant, agent_id, to = %simulation.to, error = %e, "Tip batch stopped");
                    transfers.push(TipTransfer {
                        to: simulation.to,
                        amount_wei: *amount,
                        tx_hash,
                        error: Some(e.to_string()),
                    });
                    return Ok(TipOutcome::Partial { transfers });
                }
            }
        }
        tracing::info!(tenant = %tenant, agent_id, recipients = transfers.len(), "Tip batch sent");
        Ok(TipOutcome::Sent { transfers })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::config::TransferGuard;
    use crate::store::Store;
    use crate::test_support::{ManualClock, MockChain};
    use crate::wallet::{Vault, WalletManager};
    use alloy::primitives::utils::parse_ether;
    use chrono::TimeZone;
    use std::sync::Arc;

    const GWEI: u128 = 1_000_000_000;
    const DEAD: &str = "0x000000000000000000000000000000000000dEaD";
    const BEEF: &str = "0x000000000000000000000000000000000000bEEF";
    const CAFE: &str = "0x000000000000000000000000000000000000cafE";

    struct Harness {
        chain: Arc<MockChain>,
        clock: Arc<ManualClock>,
        engine: StrategyEngine,
        tenant: TenantId,
        funder: Address,
    }

    async fn harness() -> Harness {
        let chain = Arc::new(MockChain::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
        ));
        let store = Store::in_memory().await.unwrap();
        let vault = Arc::new(Vault::from_key_bytes(&[9u8; 32]).unwrap());
        let wallets = Arc::new(WalletManager::new(
            store.clone(),
            chain.clone(),
            vault,
            TransferGuard::default(),
            clock.clone(),
        ));
        let tenant = TenantId::from("t1");
        let funder = wallets.create_wallet(&tenant, "tipper").await.unwrap().address;
        Harness {
            chain,
            clock: clock.clone(),
            engine: StrategyEngine::new(store, wallets, clock),
            tenant,
            funder,
        }
    }

    fn eth(raw: &str) -> U256 {
        parse_ether(raw).unwrap()
    }

    #[tokio::test]
    async fn gas_gate_waits_then_sends() {
        let h = harness().await;
        h.chain.set_balance(h.funder, eth("1"));
        h.chain.set_base_fee(40 * GWEI);

        let report = h
            .engine
            .send_when_gas_below(&h.tenant, "tipper", DEAD, eth("0.01"), 20.0, false, None)
            .await
            .unwrap();
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["action"], "wait");
        assert_eq!(json["reason"], "gas_above_threshold");
        assert_eq!(json["base_fee_gwei"], 40.0);
        assert_eq!(h.chain.sent_count(), 0);

        h.chain.set_base_fee(10 * GWEI);
        let report = h
            .engine
            .send_when_gas_below(&h.tenant, "tipper", DEAD, eth("0.01"), 20.0, false, None)
            .await
            .unwrap();
        assert!(matches!(report.outcome, TickOutcome::Sent { .. }), "{:?}", report.outcome);
        assert_eq!(report.base_fee_gwei, Some(10.0));
        assert_eq!(h.chain.sent_count(), 1);

        let err = h
            .engine
            .send_when_gas_below(&h.tenant, "tipper", DEAD, eth("0.01"), f64::NAN, false, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn dca_once_aborts_when_underfunded_and_simulates_on_dry_run() {
        let h = harness().await;
        h.chain.set_balance(h.funder, eth("0.001"));

        let report = h
            .engine
            .dca_once(&h.tenant, "tipper", DEAD, eth("0.5"), None, false, None)
            .await
            .unwrap();
        assert!(matches!(
            report.outcome,
            TickOutcome::Abort {
                reason: AbortReason::InsufficientFunds,
                ..
            }
        ));

        h.chain.set_balance(h.funder, eth("1"));
        let report = h
            .engine
            .dca_once(&h.tenant, "tipper", DEAD, eth("0.5"), Some(100.0), true, None)
            .await
            .unwrap();
        assert!(matches!(report.outcome, TickOutcome::Simulation { .. }));
        assert_eq!(h.chain.sent_count(), 0);
    }

    #[tokio::test]
    async fn scheduled_send_waits_for_its_time() {
        let h = harness().await;
        h.chain.set_balance(h.funder, eth("1"));
        let send_at = h.clock.now() + chrono::Duration::seconds(90);

        let report = h
            .engine
            .scheduled_send_once(&h.tenant, "tipper", DEAD, eth("0.01"), send_at, false, None)
            .await
            .unwrap();
        match report.outcome {
            TickOutcome::Wait {
                reason: WaitReason::NotDue { seconds_remaining },
            } => assert_eq!(seconds_remaining, 90.0),
            other => panic!("unexpected outcome {:?}", other),
        }

        h.clock.advance(chrono::Duration::seconds(90));
        let report = h
            .engine
            .scheduled_send_once(&h.tenant, "tipper", DEAD, eth("0.01"), send_at, false, None)
            .await
            .unwrap();
        assert!(matches!(report.outcome, TickOutcome::Sent { .. }));
        assert_eq!(h.chain.sent_count(), 1);
        assert!(h.engine.list(&h.tenant).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn equal_tips_split_the_total() {
        let h = harness().await;
        h.chain.set_balance(h.funder, eth("1"));
        let recipients = vec![DEAD.to_string(), BEEF.to_string(), CAFE.to_string()];
        let total = U256::from(10_000_000_000_000_001u64);

        match h
            .engine
            .micro_tip_equal(&h.tenant, "tipper", &recipients, total, true, None)
            .await
            .unwrap()
        {
            TipOutcome::Simulation { simulations } => {
                let amounts: Vec<U256> = simulations.iter().map(|s| s.amount_wei).collect();
                assert_eq!(amounts[1], U256::from(3_333_333_333_333_333u64));
                assert_eq!(amounts[2], amounts[1]);
                assert_eq!(amounts.iter().fold(U256::ZERO, |a, b| a + b), total);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(h.chain.sent_count(), 0);

        match h
            .engine
            .micro_tip_equal(&h.tenant, "tipper", &recipients, total, false, None)
            .await
            .unwrap()
        {
            TipOutcome::Sent { transfers } => {
                assert_eq!(transfers.len(), 3);
                assert!(transfers.iter().all(|t| t.tx_hash.is_some() && t.error.is_none()));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(h.chain.broadcast_nonces(h.funder), vec![0, 1, 2]);

        let err = h
            .engine
            .micro_tip_equal(&h.tenant, "tipper", &recipients, U256::from(2u64), false, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "wallet.invalid_amount");
    }

    #[tokio::test]
    async fn tip_batch_aborts_before_sending_anything_it_cannot_cover() {
        let h = harness().await;
        h.chain.set_balance(h.funder, eth("0.015"));
        let items = vec![
            (DEAD.to_string(), eth("0.01")),
            (BEEF.to_string(), eth("0.01")),
        ];

        let outcome = h
            .engine
            .micro_tip_amounts(&h.tenant, "tipper", &items, false, None)
            .await
            .unwrap();
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["action"], "abort");
        assert_eq!(json["reason"], "insufficient_funds");
        assert_eq!(h.chain.sent_count(), 0);

        let err = h
            .engine
            .micro_tip_amounts(&h.tenant, "tipper", &[], false, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
