//! Recurring payment aggregate

use crate::error::{Error, Result};
use crate::store::TenantId;
use crate::units::{ser_eth, ser_opt_eth};
use alloy::primitives::{Address, B256, U256};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

/// Only dollar-cost-averaging strategies exist today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Dca,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Dca => "dca",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "dca" => Ok(StrategyKind::Dca),
            other => Err(Error::InvalidArgument(format!("unknown strategy kind '{}'", other))),
        }
    }
}

/// A recurring transfer from an agent wallet, with its schedule and spend
/// tracking. Amounts are held in wei and rendered in ETH.
#[derive(Debug, Clone, Serialize)]
pub struct Strategy {
    #[serde(skip)]
    pub id: i64,
    pub tenant_id: TenantId,
    pub label: String,
    pub agent_id: String,
    pub kind: StrategyKind,
    pub to_address: Address,
    #[serde(rename = "amount_eth", serialize_with = "ser_eth")]
    pub amount_wei: U256,
    pub interval_seconds: u64,
    pub enabled: bool,
    pub max_base_fee_gwei: Option<f64>,
    #[serde(rename = "daily_cap_eth", serialize_with = "ser_opt_eth")]
    pub daily_cap_wei: Option<U256>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_tx_hash: Option<B256>,
    /// UTC day `spent_today_wei` accumulates for
    pub spent_day: Option<NaiveDate>,
    #[serde(rename = "spent_today_eth", serialize_with = "ser_eth")]
    pub spent_today_wei: U256,
    pub config: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Strategy {
    /// Enabled and past its scheduled time. A strategy with no schedule is due.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run_at.map_or(true, |next| now >= next)
    }

    pub fn seconds_until_due(&self, now: DateTime<Utc>) -> f64 {
        self.next_run_at
            .map(|next| (next - now).num_milliseconds().max(0) as f64 / 1000.0)
            .unwrap_or(0.0)
    }

    /// Move the schedule one interval past `now`.
    pub fn schedule_next(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.next_run_at = Some(interval_after(now, self.interval_seconds)?);
        Ok(())
    }

    /// Zero the daily accumulator when `now` falls on a different UTC day
    /// than the stored marker. Returns whether anything changed.
    pub fn reset_daily_if_needed(&mut self, now: DateTime<Utc>) -> bool {
        let today = now.date_naive();
        if self.spent_day == Some(today) {
            return false;
        }
        self.spent_day = Some(today);
        self.spent_today_wei = U256::ZERO;
        true
    }

    pub fn would_exceed_daily_cap(&self) -> bool {
        match self.daily_cap_wei {
            Some(cap) => self.spent_today_wei.saturating_add(self.amount_wei) > cap,
            None => false,
        }
    }
}

pub(crate) fn check_base_fee_ceiling(ceiling: f64) -> Result<()> {
    if !ceiling.is_finite() || ceiling < 0.0 {
        return Err(Error::InvalidArgument(
            "max_base_fee_gwei must be a non-negative number".to_string(),
        ));
    }
    Ok(())
}

/// `now + seconds`, or `InvalidArgument` when that leaves chrono's range.
fn interval_after(now: DateTime<Utc>, seconds: u64) -> Result<DateTime<Utc>> {
    i64::try_from(seconds)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .and_then(|interval| now.checked_add_signed(interval))
        .ok_or_else(|| {
            Error::InvalidArgument(format!("interval_seconds {} is out of range", seconds))
        })
}

/// Parameters for creating a strategy. New strategies start disabled.
#[derive(Debug, Clone)]
pub struct NewStrategy {
    pub label: String,
    pub agent_id: String,
    pub to_address: Address,
    pub amount_wei: U256,
    pub interval_seconds: u64,
    pub max_base_fee_gwei: Option<f64>,
    pub daily_cap_wei: Option<U256>,
    pub config: serde_json::Value,
}

impl NewStrategy {
    /// Reject parameters that could never be scheduled or sent. `now` bounds
    /// the interval so the first schedule is representable.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<()> {
        if self.label.trim().is_empty() {
            return Err(Error::InvalidArgument("strategy label must not be empty".to_string()));
        }
        if self.agent_id.trim().is_empty() {
            return Err(Error::InvalidArgument("agent_id must not be empty".to_string()));
        }
        if self.to_address == Address::ZERO {
            return Err(Error::InvalidArgument("recipient must not be the zero address".to_string()));
        }
        if self.amount_wei.is_zero() {
            return Err(Error::InvalidArgument("amount must be positive".to_string()));
        }
        if self.interval_seconds == 0 {
            return Err(Error::InvalidArgument("interval_seconds must be positive".to_string()));
        }
        interval_after(now, self.interval_seconds)?;
        if let Some(ceiling) = self.max_base_fee_gwei {
            check_base_fee_ceiling(ceiling)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;
    use alloy::primitives::utils::parse_ether;
    use chrono::TimeZone;

    fn strategy() -> Strategy {
        let created = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        Strategy {
            id: 1,
            tenant_id: TenantId::from("t"),
            label: "dca".to_string(),
            agent_id: "bot".to_string(),
            kind: StrategyKind::Dca,
            to_address: address!("0x000000000000000000000000000000000000dEaD"),
            amount_wei: parse_ether("0.001").unwrap(),
            interval_seconds: 60,
            enabled: true,
            max_base_fee_gwei: None,
            daily_cap_wei: Some(parse_ether("0.002").unwrap()),
            next_run_at: None,
            last_run_at: None,
            last_tx_hash: None,
            spent_day: None,
            spent_today_wei: U256::ZERO,
            config: serde_json::json!({}),
            created_at: created,
            updated_at: created,
        }
    }

    #[test]
    fn unscheduled_enabled_strategy_is_due() {
        let mut s = strategy();
        let now = s.created_at;
        assert!(s.is_due(now));
        s.schedule_next(now).unwrap();
        assert!(!s.is_due(now));
        assert_eq!(s.seconds_until_due(now), 60.0);
        assert!(s.is_due(now + chrono::Duration::seconds(60)));
        s.enabled = false;
        assert!(!s.is_due(now + chrono::Duration::seconds(600)));
    }

    #[test]
    fn daily_accumulator_resets_on_new_utc_day() {
        let mut s = strategy();
        let day_one = s.created_at;
        assert!(s.reset_daily_if_needed(day_one));
        s.spent_today_wei = parse_ether("0.002").unwrap();
        assert!(s.would_exceed_daily_cap());

        assert!(!s.reset_daily_if_needed(day_one + chrono::Duration::hours(11)));
        assert_eq!(s.spent_today_wei, parse_ether("0.002").unwrap());

        assert!(s.reset_daily_if_needed(day_one + chrono::Duration::hours(12)));
        assert!(s.spent_today_wei.is_zero());
        assert!(!s.would_exceed_daily_cap());
    }

    #[test]
    fn serializes_amounts_in_eth() {
        let value = serde_json::to_value(strategy()).unwrap();
        assert_eq!(value["amount_eth"], "0.001000000000000000");
        assert_eq!(value["daily_cap_eth"], "0.002000000000000000");
        assert_eq!(value["kind"], "dca");
        assert!(value.get("id").is_none());
    }

    #[test]
    fn validation_rejects_degenerate_parameters() {
        let valid = NewStrategy {
            label: "weekly".to_string(),
            agent_id: "bot".to_string(),
            to_address: address!("0x000000000000000000000000000000000000dEaD"),
            amount_wei: U256::from(1u64),
            interval_seconds: 60,
            max_base_fee_gwei: Some(30.0),
            daily_cap_wei: None,
            config: serde_json::json!({}),
        };
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        assert!(valid.validate(now).is_ok());

        let mut bad = valid.clone();
        bad.amount_wei = U256::ZERO;
        assert!(bad.validate(now).is_err());

        let mut bad = valid.clone();
        bad.interval_seconds = 0;
        assert!(bad.validate(now).is_err());

        let mut bad = valid.clone();
        bad.label = "  ".to_string();
        assert!(bad.validate(now).is_err());

        let mut bad = valid;
        bad.max_base_fee_gwei = Some(f64::NAN);
        assert!(bad.validate(now).is_err());
    }

    #[test]
    fn huge_intervals_are_rejected_instead_of_overflowing() {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let mut new = NewStrategy {
            label: "forever".to_string(),
            agent_id: "bot".to_string(),
            to_address: address!("0x000000000000000000000000000000000000dEaD"),
            amount_wei: U256::from(1u64),
            interval_seconds: u64::MAX,
            max_base_fee_gwei: None,
            daily_cap_wei: None,
            config: serde_json::json!({}),
        };
        for interval in [u64::MAX, i64::MAX as u64, 400_000 * 365 * 86_400] {
            new.interval_seconds = interval;
            assert!(matches!(new.validate(now), Err(Error::InvalidArgument(_))), "{}", interval);
        }
        new.interval_seconds = 10 * 365 * 86_400;
        assert!(new.validate(now).is_ok());

        let mut s = strategy();
        s.interval_seconds = u64::MAX;
        assert!(matches!(s.schedule_next(now), Err(Error::InvalidArgument(_))));
        assert_eq!(s.next_run_at, None);
    }
}
