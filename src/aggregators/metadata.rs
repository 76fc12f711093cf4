//! Best-effort token metadata cache.
//!
//! Looks display metadata (symbol) up once per token address and keeps it
//! in an in-process map. A miss or provider outage downgrades display
//! fields only — quote selection never depends on metadata being present.

use anyhow::{Context, Result};
use dashmap::DashMap;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::types::Chain;

const DEXSCREENER_TOKENS_URL: &str = "https://api.dexscreener.com/latest/dex/tokens";

#[derive(Debug, Clone)]
pub struct TokenMeta {
    pub symbol: String,
}

#[derive(Debug, Deserialize)]
struct TokensResponse {
    pairs: Option<Vec<PairEntry>>,
}

#[derive(Debug, Deserialize)]
struct PairEntry {
    #[serde(rename = "chainId")]
    chain_id: String,
    #[serde(rename = "baseToken")]
    base_token: BaseToken,
}

#[derive(Debug, Deserialize)]
struct BaseToken {
    address: String,
    symbol: String,
}

/// Per-address metadata cache shared by the selector and display layers.
pub struct TokenMetadataCache {
    http: Client,
    cache: DashMap<String, TokenMeta>,
    lookups_enabled: bool,
}

impl TokenMetadataCache {
    pub fn new() -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(5))
            .build()
            .context("Failed to build metadata HTTP client")?;
        Ok(Self {
            http,
            cache: DashMap::new(),
            lookups_enabled: true,
        })
    }

    /// A cache that only serves seeded entries, for deployments (and
    /// tests) where outbound metadata lookups are unwanted.
    pub fn cache_only() -> Self {
        Self {
            http: Client::new(),
            cache: DashMap::new(),
            lookups_enabled: false,
        }
    }

    /// Resolve display metadata for a token. Never errors: a failed lookup
    /// is `None` and will be retried on a later call.
    pub async fn lookup(&self, chain: Chain, address: &str) -> Option<TokenMeta> {
        let key = format!("{chain}:{}", address.to_lowercase());
        if let Some(hit) = self.cache.get(&key) {
            return Some(hit.clone());
        }
        if !self.lookups_enabled {
            return None;
        }

        match self.fetch(chain, address).await {
            Ok(Some(meta)) => {
                self.cache.insert(key, meta.clone());
                Some(meta)
            }
            Ok(None) => None,
            Err(e) => {
                debug!(token = address, %chain, error = %e, "Metadata lookup failed");
                None
            }
        }
    }

    /// Seed an entry directly, e.g. from indexer scan results that already
    /// carry symbols.
    pub fn seed(&self, chain: Chain, address: &str, symbol: &str) {
        let key = format!("{chain}:{}", address.to_lowercase());
        self.cache.entry(key).or_insert_with(|| TokenMeta {
            symbol: symbol.to_string(),
        });
    }

    async fn fetch(&self, chain: Chain, address: &str) -> Result<Option<TokenMeta>> {
        let url = format!(
            "{DEXSCREENER_TOKENS_URL}/{}",
            urlencoding::encode(address)
        );
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .context("Metadata request failed")?;
        if !resp.status().is_success() {
            anyhow::bail!("Metadata provider error {}", resp.status());
        }

        let body: TokensResponse = resp
            .json()
            .await
            .context("Failed to parse metadata response")?;

        Ok(body.pairs.unwrap_or_default().into_iter().find_map(|p| {
            (p.chain_id == chain.to_string()
                && p.base_token.address.eq_ignore_ascii_case(address))
            .then(|| TokenMeta {
                symbol: p.base_token.symbol,
            })
        }))
    }
}
