//! Upstream price sources.
//!
//! Defines the `PriceSource` trait and clients for the configured
//! providers. Each source returns a single raw observation; agreement
//! checking and trust scoring happen in the oracle itself.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use std::collections::HashMap;
use tracing::debug;

use crate::types::{Chain, SourcePrice};

/// Abstraction over external price providers.
///
/// A source that cannot serve a chain reports it via `supports`; a source
/// that errors or times out is simply discarded for that resolution.
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Source name for logging and audit trails.
    fn name(&self) -> &str;

    /// Whether this source covers the given chain at all.
    fn supports(&self, chain: Chain) -> bool;

    /// Fetch the current USD price for a token.
    async fn fetch(&self, token: &str, chain: Chain) -> Result<SourcePrice>;
}

// ---------------------------------------------------------------------------
// CoinGecko
// ---------------------------------------------------------------------------

const COINGECKO_API_URL: &str = "https://api.coingecko.com/api/v3";

#[derive(Debug, Deserialize)]
struct CoinGeckoEntry {
    usd: Option<f64>,
    #[serde(rename = "usd_24h_vol")]
    usd_24h_vol: Option<f64>,
}

/// CoinGecko token-price endpoint. Broad coverage, volume data, no
/// per-pool liquidity.
pub struct CoinGeckoSource {
    http: Client,
    api_key: Option<Secret<String>>,
}

impl CoinGeckoSource {
    pub fn new(api_key: Option<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("Failed to build CoinGecko HTTP client")?;
        Ok(Self {
            http,
            api_key: api_key.map(Secret::new),
        })
    }

    /// CoinGecko asset-platform identifier for a chain.
    pub fn platform_id(chain: Chain) -> &'static str {
        match chain {
            Chain::Ethereum => "ethereum",
            Chain::Polygon => "polygon-pos",
            Chain::Arbitrum => "arbitrum-one",
            Chain::Base => "base",
            Chain::Solana => "solana",
        }
    }
}

#[async_trait]
impl PriceSource for CoinGeckoSource {
    fn name(&self) -> &str {
        "coingecko"
    }

    fn supports(&self, _chain: Chain) -> bool {
        true
    }

    async fn fetch(&self, token: &str, chain: Chain) -> Result<SourcePrice> {
        let url = format!(
            "{COINGECKO_API_URL}/simple/token_price/{}",
            Self::platform_id(chain)
        );

        let mut req = self.http.get(&url).query(&[
            ("contract_addresses", token),
            ("vs_currencies", "usd"),
            ("include_24hr_vol", "true"),
        ]);
        if let Some(key) = &self.api_key {
            req = req.header("x-cg-demo-api-key", key.expose_secret());
        }

        let resp = req.send().await.context("CoinGecko request failed")?;
        if !resp.status().is_success() {
            anyhow::bail!("CoinGecko error {}", resp.status());
        }

        let body: HashMap<String, CoinGeckoEntry> = resp
            .json()
            .await
            .context("Failed to parse CoinGecko response")?;

        // Response keys are lowercased contract addresses.
        let entry = body
            .get(&token.to_lowercase())
            .or_else(|| body.get(token))
            .ok_or_else(|| anyhow::anyhow!("CoinGecko has no entry for {token}"))?;

        let price = entry
            .usd
            .and_then(|p| Decimal::try_from(p).ok())
            .ok_or_else(|| anyhow::anyhow!("CoinGecko has no USD price for {token}"))?;

        debug!(token, %chain, %price, "CoinGecko price");
        Ok(SourcePrice {
            price_usd: price,
            liquidity_usd: None,
            volume_24h: entry.usd_24h_vol.and_then(|v| Decimal::try_from(v).ok()),
        })
    }
}

// ---------------------------------------------------------------------------
// DexScreener
// ---------------------------------------------------------------------------

const DEXSCREENER_API_URL: &str = "https://api.dexscreener.com/latest/dex";

#[derive(Debug, Deserialize)]
struct DexScreenerResponse {
    pairs: Option<Vec<DexScreenerPair>>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DexScreenerPair {
    #[serde(rename = "chainId")]
    pub chain_id: String,
    #[serde(rename = "priceUsd")]
    pub price_usd: Option<String>,
    #[serde(default)]
    pub liquidity: Option<DexScreenerLiquidity>,
    #[serde(default)]
    pub volume: Option<DexScreenerVolume>,
    #[serde(rename = "baseToken")]
    pub base_token: DexScreenerToken,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DexScreenerLiquidity {
    pub usd: Option<f64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DexScreenerVolume {
    pub h24: Option<f64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DexScreenerToken {
    pub address: String,
    pub symbol: String,
}

/// DexScreener pair lookup. The only configured source that reports
/// per-pool liquidity, which the confidence gate depends on.
pub struct DexScreenerSource {
    http: Client,
}

impl DexScreenerSource {
    pub fn new() -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("Failed to build DexScreener HTTP client")?;
        Ok(Self { http })
    }

    /// Pick the deepest pair quoting the token as base asset on the
    /// requested chain.
    pub fn best_pair(
        pairs: &[DexScreenerPair],
        chain: Chain,
        token: &str,
    ) -> Option<DexScreenerPair> {
        pairs
            .iter()
            .filter(|p| p.chain_id == chain.to_string())
            .filter(|p| p.base_token.address.eq_ignore_ascii_case(token))
            .max_by(|a, b| {
                let la = a.liquidity.as_ref().and_then(|l| l.usd).unwrap_or(0.0);
                let lb = b.liquidity.as_ref().and_then(|l| l.usd).unwrap_or(0.0);
                la.partial_cmp(&lb).unwrap_or(std::cmp::Ordering::Equal)
            })
            .cloned()
    }
}

#[async_trait]
impl PriceSource for DexScreenerSource {
    fn name(&self) -> &str {
        "dexscreener"
    }

    fn supports(&self, _chain: Chain) -> bool {
        true
    }

    async fn fetch(&self, token: &str, chain: Chain) -> Result<SourcePrice> {
        let url = format!(
            "{DEXSCREENER_API_URL}/tokens/{}",
            urlencoding::encode(token)
        );

        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .context("DexScreener request failed")?;
        if !resp.status().is_success() {
            anyhow::bail!("DexScreener error {}", resp.status());
        }

        let body: DexScreenerResponse = resp
            .json()
            .await
            .context("Failed to parse DexScreener response")?;

        let pair = Self::best_pair(&body.pairs.unwrap_or_default(), chain, token)
            .ok_or_else(|| anyhow::anyhow!("DexScreener has no pair for {token} on {chain}"))?;

        let price = pair
            .price_usd
            .as_deref()
            .and_then(|p| p.parse::<Decimal>().ok())
            .ok_or_else(|| anyhow::anyhow!("DexScreener pair has no USD price"))?;

        debug!(token, %chain, %price, "DexScreener price");
        Ok(SourcePrice {
            price_usd: price,
            liquidity_usd: pair
                .liquidity
                .and_then(|l| l.usd)
                .and_then(|v| Decimal::try_from(v).ok()),
            volume_24h: pair
                .volume
                .and_then(|v| v.h24)
                .and_then(|v| Decimal::try_from(v).ok()),
        })
    }
}

// ---------------------------------------------------------------------------
// Jupiter (token-account chains)
// ---------------------------------------------------------------------------

const JUPITER_PRICE_URL: &str = "https://lite-api.jup.ag/price/v2";

#[derive(Debug, Deserialize)]
struct JupiterPriceResponse {
    data: HashMap<String, Option<JupiterPriceEntry>>,
}

#[derive(Debug, Deserialize)]
struct JupiterPriceEntry {
    price: Option<String>,
}

/// Jupiter price endpoint for mints on token-account chains.
pub struct JupiterPriceSource {
    http: Client,
}

impl JupiterPriceSource {
    pub fn new() -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("Failed to build Jupiter HTTP client")?;
        Ok(Self { http })
    }
}

#[async_trait]
impl PriceSource for JupiterPriceSource {
    fn name(&self) -> &str {
        "jupiter"
    }

    fn supports(&self, chain: Chain) -> bool {
        chain == Chain::Solana
    }

    async fn fetch(&self, token: &str, chain: Chain) -> Result<SourcePrice> {
        if chain != Chain::Solana {
            anyhow::bail!("Jupiter only prices Solana mints");
        }

        let resp = self
            .http
            .get(JUPITER_PRICE_URL)
            .query(&[("ids", token)])
            .send()
            .await
            .context("Jupiter price request failed")?;
        if !resp.status().is_success() {
            anyhow::bail!("Jupiter price error {}", resp.status());
        }

        let body: JupiterPriceResponse = resp
            .json()
            .await
            .context("Failed to parse Jupiter price response")?;

        let price = body
            .data
            .get(token)
            .and_then(|e| e.as_ref())
            .and_then(|e| e.price.as_deref())
            .and_then(|p| p.parse::<Decimal>().ok())
            .ok_or_else(|| anyhow::anyhow!("Jupiter has no price for {token}"))?;

        debug!(token, %price, "Jupiter price");
        Ok(SourcePrice {
            price_usd: price,
            liquidity_usd: None,
            volume_24h: None,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
