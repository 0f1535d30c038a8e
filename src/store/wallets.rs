use super::{format_ts, parse_ts, unique_violation, Store, TenantId};
use crate::error::{Error, Result};
use alloy::primitives::Address;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::fmt;
use std::str::FromStr;

const WALLET_COLUMNS: &str = "id, tenant_id, agent_id, address, encrypted_privkey, chain_id, \
     last_nonce, metadata, created_at, updated_at";

/// Persisted custodial wallet
#[derive(Clone)]
pub struct WalletRecord {
    pub id: i64,
    pub tenant_id: TenantId,
    pub agent_id: String,
    pub address: Address,
    /// Vault ciphertext, never the raw key
    pub encrypted_privkey: Vec<u8>,
    pub chain_id: u64,
    /// Next nonce known to be free after the last confirmed send
    pub last_nonce: Option<u64>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl fmt::Debug for WalletRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalletRecord")
            .field("tenant_id", &self.tenant_id)
            .field("agent_id", &self.agent_id)
            .field("address", &self.address)
            .field("encrypted_privkey", &"[REDACTED]")
            .field("chain_id", &self.chain_id)
            .field("last_nonce", &self.last_nonce)
            .finish()
    }
}

/// Wallet about to be created or rotated in
pub struct NewWallet {
    pub agent_id: String,
    pub address: Address,
    pub encrypted_privkey: Vec<u8>,
    pub chain_id: u64,
    pub metadata: serde_json::Value,
}

fn wallet_from_row(row: &SqliteRow) -> Result<WalletRecord> {
    let address: String = row.try_get("address")?;
    let metadata: String = row.try_get("metadata")?;
    let chain_id: i64 = row.try_get("chain_id")?;
    let last_nonce: Option<i64> = row.try_get("last_nonce")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    Ok(WalletRecord {
        id: row.try_get("id")?,
        tenant_id: TenantId::new(row.try_get::<String, _>("tenant_id")?),
        agent_id: row.try_get("agent_id")?,
        address: Address::from_str(&address)
            .map_err(|e| Error::InvalidArgument(format!("corrupt wallet address: {}", e)))?,
        encrypted_privkey: row.try_get("encrypted_privkey")?,
        chain_id: u64::try_from(chain_id)
            .map_err(|_| Error::InvalidArgument(format!("negative chain id {}", chain_id)))?,
        last_nonce: last_nonce.map(|n| n.max(0) as u64),
        metadata: serde_json::from_str(&metadata)?,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

impl Store {
    /// Insert a wallet, or replace the existing one for the agent when
    /// `rotate` is set. Rotation resets the stored nonce.
    pub async fn upsert_wallet(
        &self,
        tenant: &TenantId,
        wallet: &NewWallet,
        rotate: bool,
        now: DateTime<Utc>,
    ) -> Result<WalletRecord> {
        let now = format_ts(&now);
        let metadata = serde_json::to_string(&wallet.metadata)?;
        let mut tx = self.pool().begin().await?;

        let existing: Option<i64> =
            sqlx::query_scalar("SELECT id FROM wallets WHERE tenant_id = ? AND agent_id = ?")
                .bind(tenant.as_str())
                .bind(&wallet.agent_id)
                .fetch_optional(&mut *tx)
                .await?;

        match existing {
            Some(_) if !rotate => {
                return Err(Error::already_exists("wallet", &wallet.agent_id));
            }
            Some(id) => {
                sqlx::query(
                    r#"
                    UPDATE wallets
                    SET address = ?, encrypted_privkey = ?, chain_id = ?, last_nonce = NULL,
                        metadata = ?, updated_at = ?
                    WHERE id = ?
                    "#,
                )
                .bind(wallet.address.to_checksum(None))
                .bind(&wallet.encrypted_privkey)
                .bind(wallet.chain_id as i64)
                .bind(&metadata)
                .bind(&now)
                .bind(id)
                .execute(&mut *tx)
                .await?;
            }
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO wallets (tenant_id, agent_id, address, encrypted_privkey, chain_id,
                                         last_nonce, metadata, created_at, updated_at)
                    VALUES (?, ?, ?, ?, ?, NULL, ?, ?, ?)
                    "#,
                )
                .bind(tenant.as_str())
                .bind(&wallet.agent_id)
                .bind(wallet.address.to_checksum(None))
                .bind(&wallet.encrypted_privkey)
                .bind(wallet.chain_id as i64)
                .bind(&metadata)
                .bind(&now)
                .bind(&now)
                .execute(&mut *tx)
                .await
                .map_err(|e| unique_violation(e, "wallet", &wallet.agent_id))?;
            }
        }
        tx.commit().await?;

        self.get_wallet(tenant, &wallet.agent_id)
            .await?
            .ok_or_else(|| Error::not_found("wallet", &wallet.agent_id))
    }

    pub async fn get_wallet(&self, tenant: &TenantId, agent_id: &str) -> Result<Option<WalletRecord>> {
        let sql = format!(
            "SELECT {} FROM wallets WHERE tenant_id = ? AND agent_id = ?",
            WALLET_COLUMNS
        );
        sqlx::query(&sql)
            .bind(tenant.as_str())
            .bind(agent_id)
            .fetch_optional(self.pool())
            .await?
            .as_ref()
            .map(wallet_from_row)
            .transpose()
    }

    pub async fn list_wallets(&self, tenant: &TenantId) -> Result<Vec<WalletRecord>> {
        let sql = format!(
            "SELECT {} FROM wallets WHERE tenant_id = ? ORDER BY agent_id",
            WALLET_COLUMNS
        );
        sqlx::query(&sql)
            .bind(tenant.as_str())
            .fetch_all(self.pool())
            .await?
            .iter()
            .map(wallet_from_row)
            .collect()
    }

    pub async fn wallet_address_taken(&self, tenant: &TenantId, address: Address) -> Result<bool> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(1) FROM wallets WHERE tenant_id = ? AND address = ?")
                .bind(tenant.as_str())
                .bind(address.to_checksum(None))
                .fetch_one(self.pool())
                .await?;
        Ok(count > 0)
    }

    /// Record the next free nonce after a confirmed send. The stored value
    /// never moves backwards.
    pub async fn record_wallet_nonce(
        &self,
        tenant: &TenantId,
        agent_id: &str,
        next_nonce: u64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE wallets
            SET last_nonce = MAX(COALESCE(last_nonce, 0), ?), updated_at = ?
            WHERE tenant_id = ? AND agent_id = ?
            "#,
        )
        .bind(next_nonce as i64)
        .bind(format_ts(&now))
        .bind(tenant.as_str())
        .bind(agent_id)
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("wallet", agent_id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;

    fn new_wallet(agent_id: &str, address: Address) -> NewWallet {
        NewWallet {
            agent_id: agent_id.to_string(),
            address,
            encrypted_privkey: vec![1, 2, 3],
            chain_id: 11155111,
            metadata: serde_json::json!({ "source": "test" }),
        }
    }

    #[tokio::test]
    async fn insert_then_reject_duplicate_unless_rotating() {
        let store = Store::in_memory().await.unwrap();
        let tenant = TenantId::from("acme");
        let first = address!("0x1111111111111111111111111111111111111111");
        let second = address!("0x2222222222222222222222222222222222222222");

        let record = store
            .upsert_wallet(&tenant, &new_wallet("bot", first), false, Utc::now())
            .await
            .unwrap();
        assert_eq!(record.address, first);
        assert_eq!(record.metadata["source"], "test");

        let err = store
            .upsert_wallet(&tenant, &new_wallet("bot", second), false, Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "already_exists");

        store.record_wallet_nonce(&tenant, "bot", 4, Utc::now()).await.unwrap();
        let rotated = store
            .upsert_wallet(&tenant, &new_wallet("bot", second), true, Utc::now())
            .await
            .unwrap();
        assert_eq!(rotated.address, second);
        assert_eq!(rotated.last_nonce, None);
        assert_eq!(rotated.id, record.id);
    }

    #[tokio::test]
    async fn tenants_do_not_see_each_other() {
        let store = Store::in_memory().await.unwrap();
        let a = TenantId::from("a");
        let b = TenantId::from("b");
        let addr = address!("0x1111111111111111111111111111111111111111");

        store.upsert_wallet(&a, &new_wallet("bot", addr), false, Utc::now()).await.unwrap();
        // same agent id in another tenant is a different wallet
        store.upsert_wallet(&b, &new_wallet("bot", addr), false, Utc::now()).await.unwrap();

        assert_eq!(store.list_wallets(&a).await.unwrap().len(), 1);
        assert!(store.get_wallet(&TenantId::from("c"), "bot").await.unwrap().is_none());
        assert!(store.wallet_address_taken(&a, addr).await.unwrap());
        assert!(!store.wallet_address_taken(&TenantId::from("c"), addr).await.unwrap());
    }

    #[tokio::test]
    async fn stored_nonce_is_monotonic() {
        let store = Store::in_memory().await.unwrap();
        let tenant = TenantId::from("t");
        let addr = address!("0x1111111111111111111111111111111111111111");
        store.upsert_wallet(&tenant, &new_wallet("bot", addr), false, Utc::now()).await.unwrap();

        store.record_wallet_nonce(&tenant, "bot", 7, Utc::now()).await.unwrap();
        store.record_wallet_nonce(&tenant, "bot", 5, Utc::now()).await.unwrap();
        let record = store.get_wallet(&tenant, "bot").await.unwrap().unwrap();
        assert_eq!(record.last_nonce, Some(7));

        let err = store.record_wallet_nonce(&tenant, "ghost", 1, Utc::now()).await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }
}
