//! Chain scanners.
//!
//! Defines the `ChainScanner` trait with one implementation per chain
//! family (account-model vs token-account), plus the wallet-level fan-out
//! that aggregates per-chain results. New chains are added by implementing
//! the trait, never by branching on chain id inside shared logic.

pub mod evm;
pub mod solana;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, warn};

use crate::oracle::PriceOracle;
use crate::types::{Chain, ChainBalance, SweepError, WalletToken};

/// Abstraction over per-chain balance scanning.
///
/// Implementors fetch raw holdings from a chain-specific indexing
/// provider, value them through the oracle, and classify dust.
#[async_trait]
pub trait ChainScanner: Send + Sync {
    /// The chain this scanner covers.
    fn chain(&self) -> Chain;

    /// Scan one wallet's balances on this chain.
    async fn scan(&self, wallet_address: &str) -> Result<ChainBalance>;
}

/// A token balance as fetched from the indexing provider, before
/// valuation.
#[derive(Debug, Clone)]
pub struct RawTokenBalance {
    pub address: String,
    pub symbol: String,
    pub decimals: u8,
    pub raw_balance: u128,
}

// ---------------------------------------------------------------------------
// Shared valuation
// ---------------------------------------------------------------------------

/// Value raw holdings through the oracle and classify dust.
///
/// Prices resolve concurrently. A token with no resolvable price gets
/// `value_usd = 0` and is excluded from dust computation — never silently
/// counted as dust.
pub(crate) async fn classify_tokens(
    oracle: &PriceOracle,
    chain: Chain,
    raw: Vec<RawTokenBalance>,
    dust_threshold_usd: Decimal,
) -> Vec<WalletToken> {
    let valuations = raw.into_iter().map(|t| async move {
        let formatted_balance = WalletToken::format_units(t.raw_balance, t.decimals);
        let value_usd = match oracle.validated_price(&t.address, chain).await {
            Ok(price) => formatted_balance * price.price_usd,
            Err(SweepError::PriceUnavailable { .. }) => Decimal::ZERO,
            Err(e) => {
                warn!(token = %t.address, %chain, error = %e, "Price resolution failed");
                Decimal::ZERO
            }
        };
        let is_dust = value_usd > Decimal::ZERO && value_usd < dust_threshold_usd;

        WalletToken {
            chain,
            address: t.address,
            symbol: t.symbol,
            decimals: t.decimals,
            raw_balance: t.raw_balance,
            formatted_balance,
            value_usd,
            is_dust,
        }
    });
    join_all(valuations).await
}

/// USD value of a native balance, priced via the wrapped-native token.
/// Unresolvable native price degrades to zero rather than failing a scan.
pub(crate) async fn native_value_usd(
    oracle: &PriceOracle,
    chain: Chain,
    native_balance: Decimal,
) -> Decimal {
    match oracle
        .validated_price(chain.wrapped_native_token(), chain)
        .await
    {
        Ok(price) => native_balance * price.price_usd,
        Err(_) => Decimal::ZERO,
    }
}

// ---------------------------------------------------------------------------
// Wallet-level fan-out
// ---------------------------------------------------------------------------

/// A chain whose scan failed, surfaced as data rather than a fatal error.
#[derive(Debug, Clone)]
pub struct ScanFailure {
    pub chain: Chain,
    pub message: String,
}

/// Aggregate result of scanning one wallet across all configured chains.
/// Partial data is first-class: `errors` lists chains that failed.
#[derive(Debug, Clone)]
pub struct ScanReport {
    pub balances: Vec<ChainBalance>,
    pub errors: Vec<ScanFailure>,
    pub scanned_at: DateTime<Utc>,
}

impl ScanReport {
    /// All dust tokens across chains, the candidate set for a sweep.
    pub fn dust_tokens(&self) -> Vec<&WalletToken> {
        self.balances
            .iter()
            .flat_map(|b| b.tokens.iter().filter(|t| t.is_dust))
            .collect()
    }

    pub fn total_dust_value_usd(&self) -> Decimal {
        self.balances.iter().map(|b| b.dust_value_usd).sum()
    }

    pub fn total_value_usd(&self) -> Decimal {
        self.balances.iter().map(|b| b.total_value_usd).sum()
    }
}

/// Fans one wallet scan out across every configured chain concurrently.
pub struct WalletScanner {
    scanners: Vec<Arc<dyn ChainScanner>>,
}

impl WalletScanner {
    pub fn new(scanners: Vec<Arc<dyn ChainScanner>>) -> Self {
        Self { scanners }
    }

    /// Scan all chains for one wallet. Never fails: a chain's outage
    /// becomes an error entry while the other chains still report.
    pub async fn scan_all(&self, wallet_address: &str) -> ScanReport {
        info!(wallet = wallet_address, chains = self.scanners.len(), "Starting wallet scan");

        let scans = self.scanners.iter().map(|scanner| {
            let scanner = scanner.clone();
            async move { (scanner.chain(), scanner.scan(wallet_address).await) }
        });
        let results = join_all(scans).await;

        let mut balances = Vec::new();
        let mut errors = Vec::new();
        for (chain, result) in results {
            match result {
                Ok(balance) => balances.push(balance),
                Err(e) => {
                    warn!(%chain, error = %e, "Chain scan failed, continuing without");
                    errors.push(ScanFailure {
                        chain,
                        message: e.to_string(),
                    });
                }
            }
        }

        let report = ScanReport {
            balances,
            errors,
            scanned_at: Utc::now(),
        };

        info!(
            wallet = wallet_address,
            chains_ok = report.balances.len(),
            chains_failed = report.errors.len(),
            dust_tokens = report.dust_tokens().len(),
            dust_value = %report.total_dust_value_usd(),
            "Wallet scan complete"
        );

        report
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
