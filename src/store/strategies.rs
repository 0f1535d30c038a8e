use super::{format_ts, parse_opt_ts, parse_ts, parse_wei, unique_violation, Store, TenantId};
use crate::error::{Error, Result};
use crate::strategy::{NewStrategy, Strategy, StrategyKind};
use alloy::primitives::{Address, B256};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::str::FromStr;

const STRATEGY_COLUMNS: &str = "id, tenant_id, label, agent_id, kind, to_address, amount_wei, \
     interval_seconds, enabled, max_base_fee_gwei, daily_cap_wei, next_run_at, last_run_at, \
     last_tx_hash, spent_day, spent_today_wei, config, created_at, updated_at";

/// Immutable record of one tick outcome
#[derive(Debug, Clone, Serialize)]
pub struct StrategyRun {
    pub id: i64,
    pub strategy_id: i64,
    pub run_at: DateTime<Utc>,
    pub result: String,
    pub tx_hash: Option<String>,
    pub detail: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct NewStrategyRun {
    pub result: &'static str,
    pub tx_hash: Option<B256>,
    pub detail: serde_json::Value,
}

/// The single mapping from a `strategies` row to the aggregate.
fn strategy_from_row(row: &SqliteRow) -> Result<Strategy> {
    let corrupt = |field: &str, e: String| Error::InvalidArgument(format!("corrupt strategy {}: {}", field, e));

    let to_address: String = row.try_get("to_address")?;
    let interval: i64 = row.try_get("interval_seconds")?;
    let daily_cap: Option<String> = row.try_get("daily_cap_wei")?;
    let last_tx_hash: Option<String> = row.try_get("last_tx_hash")?;
    let spent_day: Option<String> = row.try_get("spent_day")?;
    let spent_today: String = row.try_get("spent_today_wei")?;
    let amount: String = row.try_get("amount_wei")?;
    let config: String = row.try_get("config")?;
    let kind: String = row.try_get("kind")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(Strategy {
        id: row.try_get("id")?,
        tenant_id: TenantId::new(row.try_get::<String, _>("tenant_id")?),
        label: row.try_get("label")?,
        agent_id: row.try_get("agent_id")?,
        kind: StrategyKind::parse(&kind)?,
        to_address: Address::from_str(&to_address).map_err(|e| corrupt("to_address", e.to_string()))?,
        amount_wei: parse_wei(&amount)?,
        interval_seconds: u64::try_from(interval)
            .map_err(|e| corrupt("interval_seconds", e.to_string()))?,
        enabled: row.try_get("enabled")?,
        max_base_fee_gwei: row.try_get("max_base_fee_gwei")?,
        daily_cap_wei: daily_cap.as_deref().map(parse_wei).transpose()?,
        next_run_at: parse_opt_ts(row.try_get("next_run_at")?)?,
        last_run_at: parse_opt_ts(row.try_get("last_run_at")?)?,
        last_tx_hash: last_tx_hash
            .as_deref()
            .map(B256::from_str)
            .transpose()
            .map_err(|e| corrupt("last_tx_hash", e.to_string()))?,
        spent_day: spent_day
            .as_deref()
            .map(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d"))
            .transpose()
            .map_err(|e| corrupt("spent_day", e.to_string()))?,
        spent_today_wei: parse_wei(&spent_today)?,
        config: serde_json::from_str(&config)?,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

fn run_from_row(row: &SqliteRow) -> Result<StrategyRun> {
    let run_at: String = row.try_get("run_at")?;
    let detail: Option<String> = row.try_get("detail")?;
    Ok(StrategyRun {
        id: row.try_get("id")?,
        strategy_id: row.try_get("strategy_id")?,
        run_at: parse_ts(&run_at)?,
        result: row.try_get("result")?,
        tx_hash: row.try_get("tx_hash")?,
        detail: match detail {
            Some(raw) => serde_json::from_str(&raw)?,
            None => serde_json::Value::Null,
        },
    })
}

impl Store {
    pub async fn insert_strategy(
        &self,
        tenant: &TenantId,
        strategy: &NewStrategy,
        now: DateTime<Utc>,
    ) -> Result<Strategy> {
        let interval = i64::try_from(strategy.interval_seconds).map_err(|_| {
            Error::InvalidArgument(format!(
                "interval_seconds {} is out of range",
                strategy.interval_seconds
            ))
        })?;
        let now = format_ts(&now);
        sqlx::query(
            r#"
            INSERT INTO strategies (tenant_id, label, agent_id, kind, to_address, amount_wei,
                                    interval_seconds, enabled, max_base_fee_gwei, daily_cap_wei,
                                    spent_today_wei, config, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?, '0', ?, ?, ?)
            "#,
        )
        .bind(tenant.as_str())
        .bind(&strategy.label)
        .bind(&strategy.agent_id)
        .bind(StrategyKind::Dca.as_str())
        .bind(strategy.to_address.to_checksum(None))
        .bind(strategy.amount_wei.to_string())
        .bind(interval)
        .bind(strategy.max_base_fee_gwei)
        .bind(strategy.daily_cap_wei.map(|cap| cap.to_string()))
        .bind(serde_json::to_string(&strategy.config)?)
        .bind(&now)
        .bind(&now)
        .execute(self.pool())
        .await
        .map_err(|e| unique_violation(e, "strategy", &strategy.label))?;

        self.get_strategy(tenant, &strategy.label)
            .await?
            .ok_or_else(|| Error::not_found("strategy", &strategy.label))
    }

    pub async fn get_strategy(&self, tenant: &TenantId, label: &str) -> Result<Option<Strategy>> {
        let sql = format!(
            "SELECT {} FROM strategies WHERE tenant_id = ? AND label = ?",
            STRATEGY_COLUMNS
        );
        sqlx::query(&sql)
            .bind(tenant.as_str())
            .bind(label)
            .fetch_optional(self.pool())
            .await?
            .as_ref()
            .map(strategy_from_row)
            .transpose()
    }

    /// All strategies in the tenant, optionally only those funded by `agent_id`.
    pub async fn list_strategies(
        &self,
        tenant: &TenantId,
        agent_id: Option<&str>,
    ) -> Result<Vec<Strategy>> {
        let sql = format!(
            "SELECT {} FROM strategies WHERE tenant_id = ? AND (? IS NULL OR agent_id = ?) ORDER BY label",
            STRATEGY_COLUMNS
        );
        sqlx::query(&sql)
            .bind(tenant.as_str())
            .bind(agent_id)
            .bind(agent_id)
            .fetch_all(self.pool())
            .await?
            .iter()
            .map(strategy_from_row)
            .collect()
    }

    /// Enabled strategies whose schedule has come up.
    pub async fn due_strategies(&self, tenant: &TenantId, now: DateTime<Utc>) -> Result<Vec<Strategy>> {
        let sql = format!(
            "SELECT {} FROM strategies \
             WHERE tenant_id = ? AND enabled = 1 AND (next_run_at IS NULL OR next_run_at <= ?) \
             ORDER BY next_run_at",
            STRATEGY_COLUMNS
        );
        sqlx::query(&sql)
            .bind(tenant.as_str())
            .bind(format_ts(&now))
            .fetch_all(self.pool())
            .await?
            .iter()
            .map(strategy_from_row)
            .collect()
    }

    /// Persist the mutable schedule and spend fields of `strategy`, together
    /// with an optional run record, in one transaction.
    pub async fn save_strategy_state(
        &self,
        strategy: &Strategy,
        run: Option<&NewStrategyRun>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let now = format_ts(&now);
        let mut tx = self.pool().begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE strategies
            SET enabled = ?, next_run_at = ?, last_run_at = ?, last_tx_hash = ?,
                spent_day = ?, spent_today_wei = ?, updated_at = ?
            WHERE id = ? AND tenant_id = ?
            "#,
        )
        .bind(strategy.enabled)
        .bind(strategy.next_run_at.as_ref().map(format_ts))
        .bind(strategy.last_run_at.as_ref().map(format_ts))
        .bind(strategy.last_tx_hash.map(|h| h.to_string()))
        .bind(strategy.spent_day.map(|d| d.format("%Y-%m-%d").to_string()))
        .bind(strategy.spent_today_wei.to_string())
        .bind(&now)
        .bind(strategy.id)
        .bind(strategy.tenant_id.as_str())
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("strategy", &strategy.label));
        }

        if let Some(run) = run {
            sqlx::query(
                "INSERT INTO strategy_runs (strategy_id, run_at, result, tx_hash, detail) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(strategy.id)
            .bind(&now)
            .bind(run.result)
            .bind(run.tx_hash.map(|h| h.to_string()))
            .bind(serde_json::to_string(&run.detail)?)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Remove a strategy and its run history. Returns the deleted strategy.
    pub async fn delete_strategy(&self, tenant: &TenantId, label: &str) -> Result<Option<Strategy>> {
        let Some(strategy) = self.get_strategy(tenant, label).await? else {
            return Ok(None);
        };
        let mut tx = self.pool().begin().await?;
        sqlx::query("DELETE FROM strategy_runs WHERE strategy_id = ?")
            .bind(strategy.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM strategies WHERE id = ? AND tenant_id = ?")
            .bind(strategy.id)
            .bind(tenant.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(Some(strategy))
    }

    /// Most recent runs first.
    pub async fn strategy_runs(
        &self,
        tenant: &TenantId,
        label: &str,
        limit: u32,
    ) -> Result<Vec<StrategyRun>> {
        sqlx::query(
            r#"
            SELECT r.id, r.strategy_id, r.run_at, r.result, r.tx_hash, r.detail
            FROM strategy_runs r
            JOIN strategies s ON s.id = r.strategy_id
            WHERE s.tenant_id = ? AND s.label = ?
            ORDER BY r.id DESC
            LIMIT ?
            "#,
        )
        .bind(tenant.as_str())
        .bind(label)
        .bind(i64::from(limit))
        .fetch_all(self.pool())
        .await?
        .iter()
        .map(run_from_row)
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::utils::parse_ether;
    use alloy::primitives::{address, U256};
    use chrono::TimeZone;

    fn dca(label: &str, agent_id: &str) -> NewStrategy {
        NewStrategy {
            label: label.to_string(),
            agent_id: agent_id.to_string(),
            to_address: address!("0x000000000000000000000000000000000000dEaD"),
            amount_wei: parse_ether("0.001").unwrap(),
            interval_seconds: 60,
            max_base_fee_gwei: Some(25.5),
            daily_cap_wei: Some(parse_ether("0.01").unwrap()),
            config: serde_json::json!({ "note": "weekly" }),
        }
    }

    #[tokio::test]
    async fn strategy_round_trips_through_the_store() {
        let store = Store::in_memory().await.unwrap();
        let tenant = TenantId::from("t");
        let now = Utc.with_ymd_and_hms(2025, 5, 1, 8, 0, 0).unwrap();

        let mut s = store.insert_strategy(&tenant, &dca("weekly", "bot"), now).await.unwrap();
        assert!(!s.enabled);
        assert_eq!(s.max_base_fee_gwei, Some(25.5));
        assert_eq!(s.config["note"], "weekly");

        s.enabled = true;
        s.reset_daily_if_needed(now);
        s.spent_today_wei = parse_ether("0.003").unwrap();
        s.last_tx_hash = Some(B256::repeat_byte(0xab));
        s.last_run_at = Some(now);
        s.schedule_next(now).unwrap();
        let run = NewStrategyRun {
            result: "sent",
            tx_hash: s.last_tx_hash,
            detail: serde_json::json!({ "amount_eth": "0.001" }),
        };
        store.save_strategy_state(&s, Some(&run), now).await.unwrap();

        let loaded = store.get_strategy(&tenant, "weekly").await.unwrap().unwrap();
        assert!(loaded.enabled);
        assert_eq!(loaded.spent_today_wei, parse_ether("0.003").unwrap());
        assert_eq!(loaded.spent_day, Some(now.date_naive()));
        assert_eq!(loaded.next_run_at, Some(now + chrono::Duration::seconds(60)));
        assert_eq!(loaded.last_tx_hash, Some(B256::repeat_byte(0xab)));

        let runs = store.strategy_runs(&tenant, "weekly", 10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].result, "sent");
        assert_eq!(runs[0].tx_hash, Some(B256::repeat_byte(0xab).to_string()));
    }

    #[tokio::test]
    async fn labels_are_unique_per_tenant() {
        let store = Store::in_memory().await.unwrap();
        let now = Utc::now();
        store.insert_strategy(&TenantId::from("a"), &dca("x", "bot"), now).await.unwrap();
        let err = store
            .insert_strategy(&TenantId::from("a"), &dca("x", "other"), now)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "already_exists");
        store.insert_strategy(&TenantId::from("b"), &dca("x", "bot"), now).await.unwrap();
    }

    #[tokio::test]
    async fn due_and_agent_filters() {
        let store = Store::in_memory().await.unwrap();
        let tenant = TenantId::from("t");
        let now = Utc.with_ymd_and_hms(2025, 5, 1, 8, 0, 0).unwrap();

        let mut early = store.insert_strategy(&tenant, &dca("early", "a"), now).await.unwrap();
        let mut late = store.insert_strategy(&tenant, &dca("late", "b"), now).await.unwrap();
        store.insert_strategy(&tenant, &dca("off", "a"), now).await.unwrap();

        early.enabled = true;
        early.next_run_at = Some(now - chrono::Duration::seconds(1));
        late.enabled = true;
        late.next_run_at = Some(now + chrono::Duration::seconds(30));
        store.save_strategy_state(&early, None, now).await.unwrap();
        store.save_strategy_state(&late, None, now).await.unwrap();

        let due: Vec<String> = store
            .due_strategies(&tenant, now)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.label)
            .collect();
        assert_eq!(due, vec!["early".to_string()]);

        assert_eq!(store.list_strategies(&tenant, Some("a")).await.unwrap().len(), 2);
        assert_eq!(store.list_strategies(&tenant, None).await.unwrap().len(), 3);
        assert!(store.list_strategies(&TenantId::from("other"), None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_removes_strategy_and_runs() {
        let store = Store::in_memory().await.unwrap();
        let tenant = TenantId::from("t");
        let now = Utc::now();
        let s = store.insert_strategy(&tenant, &dca("gone", "bot"), now).await.unwrap();
        let run = NewStrategyRun {
            result: "simulation",
            tx_hash: None,
            detail: serde_json::Value::Null,
        };
        store.save_strategy_state(&s, Some(&run), now).await.unwrap();

        let deleted = store.delete_strategy(&tenant, "gone").await.unwrap().unwrap();
        assert_eq!(deleted.amount_wei, parse_ether("0.001").unwrap());
        assert!(store.get_strategy(&tenant, "gone").await.unwrap().is_none());
        assert!(store.strategy_runs(&tenant, "gone", 5).await.unwrap().is_empty());
        assert!(store.delete_strategy(&tenant, "gone").await.unwrap().is_none());
        assert_eq!(deleted.spent_today_wei, U256::ZERO);
    }
}
