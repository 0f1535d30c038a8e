//! Ether denomination helpers

use crate::error::WalletError;
use alloy::primitives::utils::{format_ether, format_units, parse_ether};
use alloy::primitives::U256;
use serde::Serializer;

/// Parse a decimal ETH amount, e.g. `"0.01"`, into wei. Must be positive.
pub fn parse_eth(amount: &str) -> Result<U256, WalletError> {
    let amount = amount.trim();
    if amount.starts_with('-') {
        return Err(WalletError::InvalidAmount);
    }
    let wei = parse_ether(amount).map_err(|_| WalletError::InvalidAmount)?;
    if wei.is_zero() {
        return Err(WalletError::InvalidAmount);
    }
    Ok(wei)
}

pub fn wei_to_gwei(wei: u128) -> f64 {
    format_units(U256::from(wei), "gwei")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(wei as f64 / 1e9)
}

pub(crate) fn ser_eth<S: Serializer>(wei: &U256, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&format_ether(*wei))
}

pub(crate) fn ser_opt_eth<S: Serializer>(wei: &Option<U256>, s: S) -> Result<S::Ok, S::Error> {
    match wei {
        Some(wei) => s.serialize_some(&format_ether(*wei)),
        None => s.serialize_none(),
    }
}
