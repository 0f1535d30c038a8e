//! Transfer simulation before signing
//!
//! Prices a native transfer against current chain conditions:
//! - Priority fee from the node's estimate
//! - Max fee with headroom over the base fee
//! - Gas from `eth_estimateGas`, falling back to the intrinsic cost when the
//!   node refuses to estimate for an underfunded sender
//!
//! SECURITY NOTE:
//! - This module is read-only, it never signs, broadcasts, or touches nonces
//! - Simulation uses the wallet's public address only

use crate::error::{Error, Result};
use crate::rpc::ChainClient;
use crate::units::ser_eth;
use alloy::network::TransactionBuilder;
use alloy::primitives::{Address, U256};
use alloy::rpc::types::TransactionRequest;
use serde::Serialize;

/// Multiplier on the current base fee when computing `max_fee_per_gas`.
pub const BASE_FEE_HEADROOM: u128 = 2;

/// Intrinsic gas of a plain value transfer
pub const TRANSFER_GAS: u64 = 21_000;

/// EIP-1559 fee parameters for the next transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FeeQuote {
    pub base_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
    pub max_fee_per_gas: u128,
}

impl FeeQuote {
    pub fn new(base_fee_per_gas: u128, max_priority_fee_per_gas: u128) -> Self {
        Self {
            base_fee_per_gas,
            max_priority_fee_per_gas,
            max_fee_per_gas: base_fee_per_gas
                .saturating_mul(BASE_FEE_HEADROOM)
                .saturating_add(max_priority_fee_per_gas),
        }
    }

    /// Worst-case fee for `gas` units
    pub fn max_cost(&self, gas: u64) -> U256 {
        U256::from(gas) * U256::from(self.max_fee_per_gas)
    }
}

/// Fetch the latest base fee and priority fee estimate.
pub async fn quote_fees(chain: &dyn ChainClient) -> Result<FeeQuote> {
    let block = chain.get_block_latest().await?;
    let priority = chain.max_priority_fee().await?;
    Ok(FeeQuote::new(block.base_fee_per_gas.unwrap_or(0), priority))
}

/// Priced transfer, with no side effects on chain
#[derive(Debug, Clone, Serialize)]
pub struct TransferSimulation {
    pub from: Address,
    pub to: Address,
    #[serde(rename = "amount_eth", serialize_with = "ser_eth")]
    pub amount_wei: U256,
    pub gas: u64,
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
    #[serde(rename = "estimated_fee_eth", serialize_with = "ser_eth")]
    pub estimated_fee_wei: U256,
    #[serde(rename = "estimated_total_eth", serialize_with = "ser_eth")]
    pub estimated_total_wei: U256,
    #[serde(rename = "balance_eth", serialize_with = "ser_eth")]
    pub balance_wei: U256,
    pub insufficient_funds: bool,
}

/// Estimate gas for a value transfer.
///
/// Nodes reject estimation outright when the sender cannot cover the value;
/// that case prices the intrinsic cost instead of failing.
pub async fn estimate_transfer_gas(chain: &dyn ChainClient, tx: &TransactionRequest) -> Result<u64> {
    match chain.estimate_gas(tx).await {
        Ok(gas) => Ok(gas),
        Err(Error::Rpc(message)) if message.to_lowercase().contains("insufficient funds") => {
            tracing::debug!(%message, "Gas estimation refused for underfunded sender, using intrinsic cost");
            Ok(TRANSFER_GAS)
        }
        Err(e) => Err(e),
    }
}

/// Price a transfer of `amount_wei` from `from` to `to`.
pub async fn simulate_transfer(
    chain: &dyn ChainClient,
    from: Address,
    to: Address,
    amount_wei: U256,
) -> Result<TransferSimulation> {
    let fees = quote_fees(chain).await?;
    let request = TransactionRequest::default()
        .with_from(from)
        .with_to(to)
        .with_value(amount_wei);
    let gas = estimate_transfer_gas(chain, &request).await?;
    let balance = chain.get_balance(from).await?;

    let estimated_fee_wei = fees.max_cost(gas);
    let estimated_total_wei = amount_wei.saturating_add(estimated_fee_wei);

    Ok(TransferSimulation {
        from,
        to,
        amount_wei,
        gas,
        max_fee_per_gas: fees.max_fee_per_gas,
        max_priority_fee_per_gas: fees.max_priority_fee_per_gas,
        estimated_fee_wei,
        estimated_total_wei,
        balance_wei: balance,
        insufficient_funds: balance < estimated_total_wei,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockChain;
    use alloy::primitives::address;
    use alloy::primitives::utils::parse_ether;

    const GWEI: u128 = 1_000_000_000;

    #[test]
    fn max_fee_doubles_base_and_adds_tip() {
        let quote = FeeQuote::new(50 * GWEI, 2 * GWEI);
        assert_eq!(quote.max_fee_per_gas, 102 * GWEI);
        assert_eq!(quote.max_cost(21_000), U256::from(21_000u64 * 102 * GWEI as u64));
    }

    #[tokio::test]
    async fn unfunded_wallet_is_flagged() {
        let chain = MockChain::new().with_base_fee(GWEI);
        let from = address!("0x1000000000000000000000000000000000000001");
        let to = address!("0x2000000000000000000000000000000000000002");

        let sim = simulate_transfer(&chain, from, to, parse_ether("0.01").unwrap())
            .await
            .unwrap();
        assert!(sim.insufficient_funds);
        assert_eq!(sim.gas, TRANSFER_GAS);
        assert_eq!(sim.estimated_total_wei, sim.amount_wei + sim.estimated_fee_wei);

        let json = serde_json::to_value(&sim).unwrap();
        assert_eq!(json["amount_eth"], "0.010000000000000000");
    }

    #[tokio::test]
    async fn funded_wallet_passes() {
        let from = address!("0x1000000000000000000000000000000000000001");
        let chain = MockChain::new()
            .with_base_fee(GWEI)
            .with_balance(from, parse_ether("1").unwrap());
        let to = address!("0x2000000000000000000000000000000000000002");

        let sim = simulate_transfer(&chain, from, to, parse_ether("0.01").unwrap())
            .await
            .unwrap();
        assert!(!sim.insufficient_funds);
        assert_eq!(sim.max_fee_per_gas, 2 * GWEI + chain.priority_fee());
    }
}
