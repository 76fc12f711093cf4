//! Price oracle.
//!
//! Multi-source price resolver with confidence scoring and a keyed TTL
//! cache. All configured sources are queried concurrently under a short
//! per-source timeout; survivors are combined into a deviation-weighted
//! median so that a single manipulated source cannot drag the resolved
//! price. Confidence is a pure function of source agreement and liquidity
//! depth — a price with one source or thin liquidity is never HIGH.

pub mod sources;

use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::OracleConfig;
use crate::types::{Chain, PriceConfidence, PriceObservation, SweepError, ValidatedPrice};

use sources::PriceSource;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Tunables for resolution and trust scoring. Thresholds gate the
/// mechanism; their values come from configuration.
#[derive(Debug, Clone)]
pub struct OracleSettings {
    pub cache_ttl: Duration,
    pub source_timeout: Duration,
    pub high_max_deviation_pct: Decimal,
    pub medium_max_deviation_pct: Decimal,
    pub liquidity_floor_usd: Decimal,
    pub volume_floor_usd: Decimal,
}

impl OracleSettings {
    pub fn from_config(cfg: &OracleConfig) -> Self {
        Self {
            cache_ttl: Duration::from_secs(cfg.cache_ttl_secs),
            source_timeout: Duration::from_millis(cfg.source_timeout_ms),
            high_max_deviation_pct: cfg.high_max_deviation_pct,
            medium_max_deviation_pct: cfg.medium_max_deviation_pct,
            liquidity_floor_usd: cfg.liquidity_floor_usd,
            volume_floor_usd: cfg.volume_floor_usd,
        }
    }
}

impl Default for OracleSettings {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(45),
            source_timeout: Duration::from_millis(1_500),
            high_max_deviation_pct: dec!(1.5),
            medium_max_deviation_pct: dec!(5.0),
            liquidity_floor_usd: dec!(10_000),
            volume_floor_usd: dec!(50_000),
        }
    }
}

// ---------------------------------------------------------------------------
// Oracle
// ---------------------------------------------------------------------------

struct CachedPrice {
    price: ValidatedPrice,
    inserted_at: Instant,
}

/// Multi-source price resolver with a (token, chain)-keyed cache.
///
/// The cache is consulted before any network call; stale entries are
/// refreshed lazily on read, not proactively. Entry operations are atomic,
/// so concurrent resolvers never need an external lock.
pub struct PriceOracle {
    sources: Vec<Arc<dyn PriceSource>>,
    cache: DashMap<(String, Chain), CachedPrice>,
    settings: OracleSettings,
}

impl PriceOracle {
    pub fn new(sources: Vec<Arc<dyn PriceSource>>, settings: OracleSettings) -> Self {
        Self {
            sources,
            cache: DashMap::new(),
            settings,
        }
    }

    /// Resolve a trust-scored price, serving from cache while fresh.
    ///
    /// Fails with `PriceUnavailable` only when every upstream source
    /// errored, timed out, or returned a non-positive price.
    pub async fn validated_price(
        &self,
        token: &str,
        chain: Chain,
    ) -> Result<ValidatedPrice, SweepError> {
        let key = (token.to_lowercase(), chain);
        if let Some(hit) = self.cache.get(&key) {
            if hit.inserted_at.elapsed() < self.settings.cache_ttl {
                return Ok(hit.price.clone());
            }
        }
        // Stale or absent: resolve and overwrite. Concurrent resolvers may
        // both fetch; the cache insert is atomic and last-writer-wins.
        self.refresh(token, chain).await
    }

    /// Resolve from upstream sources, bypassing the cache, and store the
    /// result. Used by the background price-refresh job.
    pub async fn refresh(&self, token: &str, chain: Chain) -> Result<ValidatedPrice, SweepError> {
        let price = self.resolve(token, chain).await?;
        self.cache.insert(
            (token.to_lowercase(), chain),
            CachedPrice {
                price: price.clone(),
                inserted_at: Instant::now(),
            },
        );
        Ok(price)
    }

    async fn resolve(&self, token: &str, chain: Chain) -> Result<ValidatedPrice, SweepError> {
        let applicable: Vec<_> = self
            .sources
            .iter()
            .filter(|s| s.supports(chain))
            .cloned()
            .collect();

        let fetches = applicable.iter().map(|source| {
            let source = source.clone();
            async move {
                let name = source.name().to_string();
                let result =
                    tokio::time::timeout(self.settings.source_timeout, source.fetch(token, chain))
                        .await;
                (name, result)
            }
        });
        let results = join_all(fetches).await;

        let now = Utc::now();
        let mut observations: Vec<PriceObservation> = Vec::new();
        let mut liquidity_usd: Option<Decimal> = None;
        let mut volume_24h: Option<Decimal> = None;

        for (name, result) in results {
            match result {
                Ok(Ok(sp)) if sp.price_usd > Decimal::ZERO => {
                    if let Some(l) = sp.liquidity_usd {
                        liquidity_usd = Some(liquidity_usd.map_or(l, |cur| cur.max(l)));
                    }
                    if let Some(v) = sp.volume_24h {
                        volume_24h = Some(volume_24h.map_or(v, |cur| cur.max(v)));
                    }
                    observations.push(PriceObservation {
                        source: name,
                        price_usd: sp.price_usd,
                        observed_at: now,
                    });
                }
                Ok(Ok(sp)) => {
                    warn!(source = %name, token, %chain, price = %sp.price_usd,
                        "Discarding non-positive price");
                }
                Ok(Err(e)) => {
                    warn!(source = %name, token, %chain, error = %e, "Price source failed");
                }
                Err(_) => {
                    warn!(source = %name, token, %chain, "Price source timed out");
                }
            }
        }

        if observations.is_empty() {
            return Err(SweepError::PriceUnavailable {
                token: token.to_string(),
                chain,
            });
        }

        let prices: Vec<Decimal> = observations.iter().map(|o| o.price_usd).collect();
        let price_usd = deviation_weighted_median(&prices);
        let confidence = self.score(&prices, liquidity_usd, volume_24h);

        debug!(
            token,
            %chain,
            %price_usd,
            confidence = %confidence,
            sources = observations.len(),
            "Price resolved"
        );

        Ok(ValidatedPrice {
            token: token.to_string(),
            chain,
            price_usd,
            confidence,
            sources: observations,
            liquidity_usd: liquidity_usd.unwrap_or(Decimal::ZERO),
            volume_24h: volume_24h.unwrap_or(Decimal::ZERO),
            updated_at: now,
        })
    }

    /// Confidence tiering from source agreement and liquidity evidence.
    fn score(
        &self,
        prices: &[Decimal],
        liquidity_usd: Option<Decimal>,
        volume_24h: Option<Decimal>,
    ) -> PriceConfidence {
        if prices.len() == 1 {
            // A single source known to sit below the liquidity floor is not
            // trusted at all; a single source with no liquidity evidence is
            // merely LOW.
            return match liquidity_usd {
                Some(l) if l < self.settings.liquidity_floor_usd => PriceConfidence::Untrusted,
                _ => PriceConfidence::Low,
            };
        }

        let max_dev = max_pairwise_deviation_pct(prices);
        let depth_ok = liquidity_usd
            .map(|l| l >= self.settings.liquidity_floor_usd)
            .unwrap_or(false)
            && volume_24h
                .map(|v| v >= self.settings.volume_floor_usd)
                .unwrap_or(false);

        if max_dev <= self.settings.high_max_deviation_pct && depth_ok {
            PriceConfidence::High
        } else if max_dev <= self.settings.medium_max_deviation_pct {
            PriceConfidence::Medium
        } else {
            PriceConfidence::Low
        }
    }
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Maximum relative deviation (percent) over all source pairs.
pub fn max_pairwise_deviation_pct(prices: &[Decimal]) -> Decimal {
    let mut max_dev = Decimal::ZERO;
    for i in 0..prices.len() {
        for j in (i + 1)..prices.len() {
            let mean = (prices[i] + prices[j]) / dec!(2);
            if mean.is_zero() {
                continue;
            }
            let dev = (prices[i] - prices[j]).abs() / mean * dec!(100);
            max_dev = max_dev.max(dev);
        }
    }
    max_dev
}

/// Median weighted by agreement with the plain median, so one outlier
/// source barely moves the result (a naive average would).
pub fn deviation_weighted_median(prices: &[Decimal]) -> Decimal {
    debug_assert!(!prices.is_empty());
    if prices.len() == 1 {
        return prices[0];
    }

    let mut sorted = prices.to_vec();
    sorted.sort();

    let mid = sorted.len() / 2;
    let median = if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / dec!(2)
    } else {
        sorted[mid]
    };
    if median.is_zero() {
        return median;
    }

    let weights: Vec<Decimal> = sorted
        .iter()
        .map(|p| Decimal::ONE / (Decimal::ONE + (*p - median).abs() / median))
        .collect();
    let total: Decimal = weights.iter().copied().sum();
    let threshold = total / dec!(2);

    let mut cumulative = Decimal::ZERO;
    for (price, weight) in sorted.iter().zip(&weights) {
        cumulative += *weight;
        if cumulative >= threshold {
            return *price;
        }
    }
    median
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
