//! Account-model (EVM) chain scanner.
//!
//! Fetches ERC-20 holdings from an indexing provider's token API
//! (`getTokensForOwner` style), paginating until a short page is returned,
//! filters out non-fungible and metadata-less entries, fetches the native
//! balance over JSON-RPC, and values everything through the oracle.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::{AppConfig, EvmChainConfig};
use crate::oracle::PriceOracle;
use crate::scanners::{classify_tokens, native_value_usd, ChainScanner, RawTokenBalance};
use crate::types::{Chain, ChainBalance, WalletToken};

/// Full pages have this many entries; a shorter page ends pagination.
const PAGE_SIZE: usize = 100;

// ---------------------------------------------------------------------------
// Indexer wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct TokensForOwnerResponse {
    #[serde(default)]
    tokens: Vec<OwnedToken>,
    #[serde(default, rename = "pageKey")]
    page_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OwnedToken {
    #[serde(rename = "contractAddress")]
    contract_address: String,
    #[serde(default)]
    symbol: Option<String>,
    /// Absent for NFTs and broken contracts; such entries are skipped.
    #[serde(default)]
    decimals: Option<u8>,
    #[serde(default, rename = "rawBalance")]
    raw_balance: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    result: Option<String>,
}

// ---------------------------------------------------------------------------
// Scanner
// ---------------------------------------------------------------------------

pub struct EvmScanner {
    chain: Chain,
    http: Client,
    indexer_url: String,
    rpc_url: String,
    api_key: Option<Secret<String>>,
    oracle: Arc<PriceOracle>,
    dust_threshold_usd: Decimal,
}

impl EvmScanner {
    pub fn new(
        cfg: &EvmChainConfig,
        oracle: Arc<PriceOracle>,
        dust_threshold_usd: Decimal,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to build EVM scanner HTTP client")?;

        let api_key = match &cfg.api_key_env {
            Some(env) => Some(Secret::new(AppConfig::resolve_env(env)?)),
            None => None,
        };

        Ok(Self {
            chain: cfg.chain,
            http,
            indexer_url: cfg.indexer_url.clone(),
            rpc_url: cfg.rpc_url.clone(),
            api_key,
            oracle,
            dust_threshold_usd,
        })
    }

    /// Provider endpoints carry the key as a path segment.
    fn keyed_url(&self, base: &str) -> String {
        match &self.api_key {
            Some(key) => format!("{base}/{}", key.expose_secret()),
            None => base.to_string(),
        }
    }

    async fn fetch_token_page(
        &self,
        owner: &str,
        page_key: Option<&str>,
    ) -> Result<TokensForOwnerResponse> {
        let url = format!("{}/getTokensForOwner", self.keyed_url(&self.indexer_url));

        let mut query = vec![
            ("owner", owner.to_string()),
            ("pageSize", PAGE_SIZE.to_string()),
        ];
        if let Some(key) = page_key {
            query.push(("pageKey", key.to_string()));
        }

        let resp = self
            .http
            .get(&url)
            .query(&query)
            .send()
            .await
            .context("Token indexer request failed")?;

        if !resp.status().is_success() {
            anyhow::bail!("Token indexer error {} on {}", resp.status(), self.chain);
        }

        resp.json()
            .await
            .context("Failed to parse token indexer response")
    }

    /// Paginate through the owner's holdings until a short page.
    async fn fetch_all_tokens(&self, owner: &str) -> Result<Vec<RawTokenBalance>> {
        let mut raw = Vec::new();
        let mut page_key: Option<String> = None;
        let mut pages = 0u32;

        loop {
            let page = self.fetch_token_page(owner, page_key.as_deref()).await?;
            pages += 1;
            let page_len = page.tokens.len();

            raw.extend(page.tokens.iter().filter_map(Self::convert));

            page_key = page.page_key;
            if page_key.is_none() || page_len < PAGE_SIZE {
                break;
            }
        }

        debug!(owner, chain = %self.chain, pages, tokens = raw.len(), "Token pages fetched");
        Ok(raw)
    }

    /// Convert an indexer entry, skipping non-fungible or unusable rows.
    fn convert(token: &OwnedToken) -> Option<RawTokenBalance> {
        let decimals = token.decimals?;
        let raw_balance = parse_amount(token.raw_balance.as_deref()?)?;
        if raw_balance == 0 {
            return None;
        }

        Some(RawTokenBalance {
            address: token.contract_address.to_lowercase(),
            symbol: token
                .symbol
                .clone()
                .unwrap_or_else(|| short_address(&token.contract_address)),
            decimals,
            raw_balance,
        })
    }

    async fn fetch_native_balance(&self, owner: &str) -> Result<u128> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_getBalance",
            "params": [owner, "latest"],
        });

        let resp = self
            .http
            .post(self.keyed_url(&self.rpc_url))
            .json(&body)
            .send()
            .await
            .context("eth_getBalance request failed")?;

        if !resp.status().is_success() {
            anyhow::bail!("RPC error {} on {}", resp.status(), self.chain);
        }

        let rpc: JsonRpcResponse = resp
            .json()
            .await
            .context("Failed to parse eth_getBalance response")?;
        let hex = rpc
            .result
            .ok_or_else(|| anyhow::anyhow!("eth_getBalance returned no result"))?;

        parse_amount(&hex).ok_or_else(|| anyhow::anyhow!("Unparseable balance: {hex}"))
    }
}

/// Parse a hex (`0x…`) or decimal amount string.
fn parse_amount(s: &str) -> Option<u128> {
    if let Some(hex) = s.strip_prefix("0x") {
        u128::from_str_radix(hex, 16).ok()
    } else {
        s.parse::<u128>().ok()
    }
}

/// Fallback display symbol when the indexer has no metadata.
fn short_address(address: &str) -> String {
    let trimmed = address.trim_start_matches("0x");
    format!("{}…", &trimmed[..trimmed.len().min(4)])
}

#[async_trait]
impl ChainScanner for EvmScanner {
    fn chain(&self) -> Chain {
        self.chain
    }

    async fn scan(&self, wallet_address: &str) -> Result<ChainBalance> {
        let (tokens, native_raw) = tokio::join!(
            self.fetch_all_tokens(wallet_address),
            self.fetch_native_balance(wallet_address),
        );
        let raw = tokens?;
        let native_raw = native_raw?;

        let classified =
            classify_tokens(&self.oracle, self.chain, raw, self.dust_threshold_usd).await;

        let native_balance = WalletToken::format_units(native_raw, self.chain.native_decimals());
        let native_usd = native_value_usd(&self.oracle, self.chain, native_balance).await;

        let balance =
            ChainBalance::from_tokens(self.chain, classified, native_balance, native_usd);

        info!(
            wallet = wallet_address,
            chain = %self.chain,
            tokens = balance.tokens.len(),
            dust = balance.dust_token_count,
            total_usd = %balance.total_value_usd,
            "Chain scan complete"
        );
        Ok(balance)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_amount_hex() {
        assert_eq!(parse_amount("0x0"), Some(0));
        assert_eq!(parse_amount("0xde0b6b3a7640000"), Some(1_000_000_000_000_000_000));
    }

    #[test]
    fn test_parse_amount_decimal() {
        assert_eq!(parse_amount("123456"), Some(123_456));
    }

    #[test]
    fn test_parse_amount_garbage() {
        assert_eq!(parse_amount("not-a-number"), None);
        assert_eq!(parse_amount("0xzz"), None);
    }

    fn owned(
        address: &str,
        symbol: Option<&str>,
        decimals: Option<u8>,
        raw: Option<&str>,
    ) -> OwnedToken {
        OwnedToken {
            contract_address: address.to_string(),
            symbol: symbol.map(String::from),
            decimals,
            raw_balance: raw.map(String::from),
        }
    }

    #[test]
    fn test_convert_valid_token() {
        let t = owned("0xAbC123", Some("USDC"), Some(6), Some("300000"));
        let raw = EvmScanner::convert(&t).unwrap();
        assert_eq!(raw.address, "0xabc123");
        assert_eq!(raw.symbol, "USDC");
        assert_eq!(raw.raw_balance, 300_000);
    }

    #[test]
    fn test_convert_skips_missing_decimals() {
        // NFT-ish entries have no decimals.
        let t = owned("0xnft", Some("APE"), None, Some("1"));
        assert!(EvmScanner::convert(&t).is_none());
    }

    #[test]
    fn test_convert_skips_zero_balance() {
        let t = owned("0xabc", Some("TKN"), Some(18), Some("0"));
        assert!(EvmScanner::convert(&t).is_none());
    }

    #[test]
    fn test_convert_skips_unparseable_balance() {
        let t = owned("0xabc", Some("TKN"), Some(18), Some("??"));
        assert!(EvmScanner::convert(&t).is_none());
    }

    #[test]
    fn test_convert_fallback_symbol() {
        let t = owned("0xDeadBeef", None, Some(18), Some("5"));
        let raw = EvmScanner::convert(&t).unwrap();
        assert_eq!(raw.symbol, "Dead…");
    }

    #[test]
    fn test_tokens_for_owner_parsing() {
        let json = r#"{
            "tokens": [
                {"contractAddress": "0xabc", "symbol": "DUST", "decimals": 8, "rawBalance": "42"}
            ],
            "pageKey": "next-page"
        }"#;
        let resp: TokensForOwnerResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.tokens.len(), 1);
        assert_eq!(resp.page_key.as_deref(), Some("next-page"));
    }
}
