//! SQLite persistence
//!
//! The store is the source of truth for wallets, strategies, strategy runs and
//! audit events. Every query is scoped to a tenant. Timestamps are stored as
//! fixed-width RFC 3339 UTC strings so they compare lexicographically.

mod events;
mod strategies;
mod wallets;

pub use events::{EventRecord, EventStatus, NewEvent, ToolUsage};
pub use strategies::{NewStrategyRun, StrategyRun};
pub use wallets::{NewWallet, WalletRecord};

use crate::error::{Error, Result};
use alloy::primitives::U256;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::fmt;
use std::str::FromStr;

/// Isolation boundary for wallets, strategies and events
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS wallets (
        id                INTEGER PRIMARY KEY AUTOINCREMENT,
        tenant_id         TEXT NOT NULL,
        agent_id          TEXT NOT NULL,
        address           TEXT NOT NULL,
        encrypted_privkey BLOB NOT NULL,
        chain_id          INTEGER NOT NULL,
        last_nonce        INTEGER,
        metadata          TEXT NOT NULL DEFAULT '{}',
        created_at        TEXT NOT NULL,
        updated_at        TEXT NOT NULL,
        UNIQUE (tenant_id, agent_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS strategies (
        id                INTEGER PRIMARY KEY AUTOINCREMENT,
        tenant_id         TEXT NOT NULL,
        label             TEXT NOT NULL,
        agent_id          TEXT NOT NULL,
        kind              TEXT NOT NULL DEFAULT 'dca',
        to_address        TEXT NOT NULL,
        amount_wei        TEXT NOT NULL,
        interval_seconds  INTEGER NOT NULL,
        enabled           INTEGER NOT NULL DEFAULT 0,
        max_base_fee_gwei REAL,
        daily_cap_wei     TEXT,
        next_run_at       TEXT,
        last_run_at       TEXT,
        last_tx_hash      TEXT,
        spent_day         TEXT,
        spent_today_wei   TEXT NOT NULL DEFAULT '0',
        config            TEXT NOT NULL DEFAULT '{}',
        created_at        TEXT NOT NULL,
        updated_at        TEXT NOT NULL,
        UNIQUE (tenant_id, label)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS strategy_runs (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        strategy_id INTEGER NOT NULL,
        run_at      TEXT NOT NULL,
        result      TEXT NOT NULL,
        tx_hash     TEXT,
        detail      TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_strategy_runs_strategy ON strategy_runs (strategy_id, run_at)",
    r#"
    CREATE TABLE IF NOT EXISTS events (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        tenant_id        TEXT NOT NULL,
        occurred_at      TEXT NOT NULL,
        tool_name        TEXT NOT NULL,
        agent_id         TEXT,
        status           TEXT NOT NULL,
        request_payload  TEXT,
        response_payload TEXT,
        error_message    TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_events_window ON events (tenant_id, tool_name, agent_id, occurred_at)",
];

/// Handle to the relational store
#[derive(Clone)]
pub struct Store {
    pool: Pool<Sqlite>,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    /// Open (creating if missing) and bootstrap the schema.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| Error::Config(format!("invalid database url: {}", e)))?
            .create_if_missing(true);

        // an in-memory database lives and dies with its single connection
        let in_memory = database_url.contains(":memory:");
        let mut pool_options = SqlitePoolOptions::new().max_connections(if in_memory { 1 } else { 5 });
        if in_memory {
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        }
        let pool = pool_options.connect_with(options).await?;

        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        tracing::debug!(target: "store", "Schema ready");
        Ok(Self { pool })
    }

    /// Private in-memory database
    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:").await
    }

    pub(crate) fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

pub(crate) fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| Error::InvalidArgument(format!("corrupt timestamp '{}': {}", raw, e)))
}

pub(crate) fn parse_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

pub(crate) fn parse_wei(raw: &str) -> Result<U256> {
    U256::from_str_radix(raw, 10)
        .map_err(|e| Error::InvalidArgument(format!("corrupt amount '{}': {}", raw, e)))
}

/// Map a UNIQUE constraint violation to `AlreadyExists`.
pub(crate) fn unique_violation(err: sqlx::Error, kind: &'static str, id: &str) -> Error {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => Error::already_exists(kind, id),
        _ => Error::Storage(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn timestamps_sort_lexicographically() {
        let early = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let late = early + chrono::Duration::milliseconds(1500);
        let (a, b) = (format_ts(&early), format_ts(&late));
        assert_eq!(a, "2024-01-02T03:04:05.000000Z");
        assert!(a < b);
        assert_eq!(parse_ts(&b).unwrap(), late);
    }

    #[test]
    fn corrupt_amounts_are_reported() {
        assert_eq!(parse_wei("1000").unwrap(), U256::from(1000u64));
        assert!(parse_wei("1e18").is_err());
    }

    #[tokio::test]
    async fn schema_bootstrap_is_idempotent() {
        let store = Store::in_memory().await.unwrap();
        for statement in SCHEMA {
            sqlx::query(statement).execute(store.pool()).await.unwrap();
        }
    }
}
