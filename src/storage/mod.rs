//! Persistence layer.
//!
//! SQLite-backed durable store for sweeps and scanned wallet tokens.
//! Sweeps are stored whole as JSON documents with indexed columns for
//! status-driven queries. Status transitions go through a conditional
//! update keyed on the expected current status, which serializes
//! concurrent transition attempts without an in-process lock — a lost
//! race surfaces as `rows_affected == 0`, never as a lost update.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use tracing::debug;

use crate::types::{Chain, Sweep, SweepStatus, WalletToken};

pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create tables. Idempotent.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sweeps (
                id         TEXT PRIMARY KEY,
                wallet     TEXT NOT NULL,
                status     TEXT NOT NULL,
                data       TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create sweeps table")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sweeps_status ON sweeps (status)")
            .execute(&self.pool)
            .await
            .context("Failed to create sweeps index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS wallet_tokens (
                owner         TEXT NOT NULL,
                chain         TEXT NOT NULL,
                token_address TEXT NOT NULL,
                data          TEXT NOT NULL,
                scanned_at    INTEGER NOT NULL,
                PRIMARY KEY (owner, chain, token_address)
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create wallet_tokens table")?;
        Ok(())
    }

    // -- Sweeps -----------------------------------------------------------

    /// Insert a freshly created sweep.
    pub async fn insert_sweep(&self, sweep: &Sweep) -> Result<()> {
        let data = serde_json::to_string(sweep).context("Failed to serialise sweep")?;
        sqlx::query(
            "INSERT INTO sweeps (id, wallet, status, data, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
        )
        .bind(&sweep.id)
        .bind(&sweep.wallet)
        .bind(sweep.status.to_string())
        .bind(&data)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await
        .context("Failed to insert sweep")?;

        debug!(sweep_id = %sweep.id, wallet = %sweep.wallet, "Sweep created");
        Ok(())
    }

    /// Persist sweep detail (legs, tx hashes, error text) without a status
    /// change. Status transitions must use `transition_sweep`.
    pub async fn save_sweep(&self, sweep: &Sweep) -> Result<()> {
        let data = serde_json::to_string(sweep).context("Failed to serialise sweep")?;
        sqlx::query("UPDATE sweeps SET data = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(&data)
            .bind(Utc::now().timestamp_millis())
            .bind(&sweep.id)
            .execute(&self.pool)
            .await
            .context("Failed to save sweep")?;
        Ok(())
    }

    pub async fn get_sweep(&self, id: &str) -> Result<Option<Sweep>> {
        let row = sqlx::query("SELECT data FROM sweeps WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to read sweep")?;

        row.map(|r| {
            let data: String = r.get("data");
            serde_json::from_str(&data).context("Corrupt sweep record")
        })
        .transpose()
    }

    /// Conditionally persist a sweep whose status changed.
    ///
    /// Returns false when the row is no longer in `expected` status — a
    /// concurrent transition won the race and this one must not apply.
    pub async fn transition_sweep(&self, sweep: &Sweep, expected: SweepStatus) -> Result<bool> {
        let data = serde_json::to_string(sweep).context("Failed to serialise sweep")?;
        let updated = sqlx::query(
            "UPDATE sweeps SET status = ?1, data = ?2, updated_at = ?3
             WHERE id = ?4 AND status = ?5",
        )
        .bind(sweep.status.to_string())
        .bind(&data)
        .bind(Utc::now().timestamp_millis())
        .bind(&sweep.id)
        .bind(expected.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to transition sweep")?
        .rows_affected();

        debug!(
            sweep_id = %sweep.id,
            from = %expected,
            to = %sweep.status,
            applied = updated == 1,
            "Sweep transition"
        );
        Ok(updated == 1)
    }

    pub async fn sweeps_with_status(&self, status: SweepStatus) -> Result<Vec<Sweep>> {
        let rows = sqlx::query("SELECT data FROM sweeps WHERE status = ?1 ORDER BY created_at")
            .bind(status.to_string())
            .fetch_all(&self.pool)
            .await
            .context("Failed to list sweeps")?;

        rows.iter()
            .map(|r| {
                let data: String = r.get("data");
                serde_json::from_str(&data).context("Corrupt sweep record")
            })
            .collect()
    }

    // -- Wallet tokens ----------------------------------------------------

    /// Replace one (owner, chain) snapshot with a fresh scan. The primary
    /// key on (owner, chain, token_address) keeps dust rows unique per
    /// scan cycle.
    pub async fn replace_wallet_tokens(
        &self,
        owner: &str,
        chain: Chain,
        tokens: &[WalletToken],
    ) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await.context("Failed to begin tx")?;

        sqlx::query("DELETE FROM wallet_tokens WHERE owner = ?1 AND chain = ?2")
            .bind(owner)
            .bind(chain.to_string())
            .execute(&mut *tx)
            .await
            .context("Failed to clear previous scan")?;

        for token in tokens {
            let data = serde_json::to_string(token).context("Failed to serialise token")?;
            sqlx::query(
                "INSERT INTO wallet_tokens (owner, chain, token_address, data, scanned_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (owner, chain, token_address) DO UPDATE
                 SET data = excluded.data, scanned_at = excluded.scanned_at",
            )
            .bind(owner)
            .bind(chain.to_string())
            .bind(&token.address)
            .bind(&data)
            .bind(now)
            .execute(&mut *tx)
            .await
            .context("Failed to insert wallet token")?;
        }

        tx.commit().await.context("Failed to commit scan snapshot")?;
        debug!(owner, %chain, tokens = tokens.len(), "Wallet token snapshot stored");
        Ok(())
    }

    /// Distinct (chain, token) pairs across all scanned wallets, the set
    /// the background price refresh keeps warm.
    pub async fn tracked_tokens(&self) -> Result<Vec<(Chain, String)>> {
        let rows = sqlx::query("SELECT DISTINCT chain, token_address FROM wallet_tokens")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list tracked tokens")?;

        rows.iter()
            .map(|r| {
                let chain: String = r.get("chain");
                Ok((chain.parse()?, r.get::<String, _>("token_address")))
            })
            .collect()
    }

    pub async fn wallet_tokens(&self, owner: &str) -> Result<Vec<WalletToken>> {
        let rows = sqlx::query(
            "SELECT data FROM wallet_tokens WHERE owner = ?1 ORDER BY chain, token_address",
        )
        .bind(owner)
        .fetch_all(&self.pool)
        .await
        .context("Failed to read wallet tokens")?;

        rows.iter()
            .map(|r| {
                let data: String = r.get("data");
                serde_json::from_str(&data).context("Corrupt wallet token record")
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_store() -> Store {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = Store::new(pool);
        store.migrate().await.unwrap();
        store
    }

    fn token(address: &str, value_usd: Decimal) -> WalletToken {
        WalletToken {
            chain: Chain::Ethereum,
            address: address.to_string(),
            symbol: "TKN".into(),
            decimals: 18,
            raw_balance: 1,
            formatted_balance: dec!(1),
            value_usd,
            is_dust: value_usd > Decimal::ZERO && value_usd < dec!(1),
        }
    }

    #[tokio::test]
    async fn test_sweep_roundtrip() {
        let store = test_store().await;
        let sweep = Sweep::new("0xwallet", "USDC", Chain::Base);
        store.insert_sweep(&sweep).await.unwrap();

        let loaded = store.get_sweep(&sweep.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, sweep.id);
        assert_eq!(loaded.status, SweepStatus::Pending);
        assert_eq!(loaded.output_token, "USDC");
    }

    #[tokio::test]
    async fn test_get_missing_sweep() {
        let store = test_store().await;
        assert!(store.get_sweep("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_conditional_transition_applies_once() {
        let store = test_store().await;
        let mut sweep = Sweep::new("0xwallet", "USDC", Chain::Base);
        store.insert_sweep(&sweep).await.unwrap();

        sweep.status = SweepStatus::Quoting;
        assert!(store
            .transition_sweep(&sweep, SweepStatus::Pending)
            .await
            .unwrap());

        // A second transition still expecting Pending lost the race.
        let mut stale = sweep.clone();
        stale.status = SweepStatus::Cancelled;
        assert!(!store
            .transition_sweep(&stale, SweepStatus::Pending)
            .await
            .unwrap());

        let loaded = store.get_sweep(&sweep.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, SweepStatus::Quoting);
    }

    #[tokio::test]
    async fn test_sweeps_with_status() {
        let store = test_store().await;
        let mut a = Sweep::new("0xw1", "USDC", Chain::Base);
        let b = Sweep::new("0xw2", "USDC", Chain::Base);
        store.insert_sweep(&a).await.unwrap();
        store.insert_sweep(&b).await.unwrap();

        a.status = SweepStatus::Quoting;
        store.transition_sweep(&a, SweepStatus::Pending).await.unwrap();

        let pending = store.sweeps_with_status(SweepStatus::Pending).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, b.id);
    }

    #[tokio::test]
    async fn test_scan_snapshot_supersedes_previous() {
        let store = test_store().await;
        store
            .replace_wallet_tokens(
                "0xowner",
                Chain::Ethereum,
                &[token("0xa", dec!(0.5)), token("0xb", dec!(3))],
            )
            .await
            .unwrap();

        // Next scan: 0xb is gone, 0xc appeared.
        store
            .replace_wallet_tokens(
                "0xowner",
                Chain::Ethereum,
                &[token("0xa", dec!(0.6)), token("0xc", dec!(0.1))],
            )
            .await
            .unwrap();

        let tokens = store.wallet_tokens("0xowner").await.unwrap();
        let addresses: Vec<_> = tokens.iter().map(|t| t.address.as_str()).collect();
        assert_eq!(addresses, vec!["0xa", "0xc"]);
        assert_eq!(tokens[0].value_usd, dec!(0.6));
    }

    #[tokio::test]
    async fn test_scan_snapshot_scoped_to_chain() {
        let store = test_store().await;
        store
            .replace_wallet_tokens("0xowner", Chain::Ethereum, &[token("0xa", dec!(0.5))])
            .await
            .unwrap();

        let mut sol = token("MintA", dec!(0.2));
        sol.chain = Chain::Solana;
        store
            .replace_wallet_tokens("0xowner", Chain::Solana, &[sol])
            .await
            .unwrap();

        // Re-scanning Ethereum leaves the Solana snapshot untouched.
        store
            .replace_wallet_tokens("0xowner", Chain::Ethereum, &[])
            .await
            .unwrap();

        let tokens = store.wallet_tokens("0xowner").await.unwrap();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].chain, Chain::Solana);
    }
}
