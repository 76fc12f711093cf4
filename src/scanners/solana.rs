//! Token-account (Solana) chain scanner.
//!
//! Fetches SPL token accounts by owner over JSON-RPC with `jsonParsed`
//! encoding, filters NFT-shaped accounts (zero decimals, unit amount) and
//! empty accounts, and fetches the lamport balance. Token accounts carry
//! no symbol on-chain; display fields use a shortened mint and are
//! decorated downstream by the metadata cache.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::{AppConfig, SolanaChainConfig};
use crate::oracle::PriceOracle;
use crate::scanners::{classify_tokens, native_value_usd, ChainScanner, RawTokenBalance};
use crate::types::{Chain, ChainBalance, WalletToken};

const TOKEN_PROGRAM_ID: &str = "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA";

// ---------------------------------------------------------------------------
// RPC wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct TokenAccountsResult {
    value: Vec<TokenAccountEntry>,
}

#[derive(Debug, Deserialize)]
struct TokenAccountEntry {
    account: TokenAccount,
}

#[derive(Debug, Deserialize)]
struct TokenAccount {
    data: TokenAccountData,
}

#[derive(Debug, Deserialize)]
struct TokenAccountData {
    parsed: ParsedData,
}

#[derive(Debug, Deserialize)]
struct ParsedData {
    info: TokenInfo,
}

#[derive(Debug, Deserialize)]
struct TokenInfo {
    mint: String,
    #[serde(rename = "tokenAmount")]
    token_amount: TokenAmount,
}

#[derive(Debug, Deserialize)]
struct TokenAmount {
    /// Base-unit amount as a decimal string.
    amount: String,
    decimals: u8,
}

#[derive(Debug, Deserialize)]
struct BalanceResult {
    value: u64,
}

// ---------------------------------------------------------------------------
// Scanner
// ---------------------------------------------------------------------------

pub struct SolanaScanner {
    http: Client,
    rpc_url: String,
    api_key: Option<Secret<String>>,
    oracle: Arc<PriceOracle>,
    dust_threshold_usd: Decimal,
}

impl SolanaScanner {
    pub fn new(
        cfg: &SolanaChainConfig,
        oracle: Arc<PriceOracle>,
        dust_threshold_usd: Decimal,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to build Solana scanner HTTP client")?;

        let api_key = match &cfg.api_key_env {
            Some(env) => Some(Secret::new(AppConfig::resolve_env(env)?)),
            None => None,
        };

        Ok(Self {
            http,
            rpc_url: cfg.rpc_url.clone(),
            api_key,
            oracle,
            dust_threshold_usd,
        })
    }

    async fn rpc<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let mut req = self.http.post(&self.rpc_url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.query(&[("api-key", key.expose_secret())]);
        }

        let resp = req
            .send()
            .await
            .with_context(|| format!("Solana RPC {method} request failed"))?;

        if !resp.status().is_success() {
            anyhow::bail!("Solana RPC error {} for {method}", resp.status());
        }

        let rpc: RpcResponse<T> = resp
            .json()
            .await
            .with_context(|| format!("Failed to parse Solana RPC {method} response"))?;
        rpc.result
            .ok_or_else(|| anyhow::anyhow!("Solana RPC {method} returned no result"))
    }

    async fn fetch_token_accounts(&self, owner: &str) -> Result<Vec<RawTokenBalance>> {
        let result: TokenAccountsResult = self
            .rpc(
                "getTokenAccountsByOwner",
                json!([
                    owner,
                    { "programId": TOKEN_PROGRAM_ID },
                    { "encoding": "jsonParsed" },
                ]),
            )
            .await?;

        let raw: Vec<RawTokenBalance> = result
            .value
            .iter()
            .filter_map(|entry| Self::convert(&entry.account.data.parsed.info))
            .collect();

        debug!(owner, accounts = result.value.len(), kept = raw.len(), "Token accounts fetched");
        Ok(raw)
    }

    /// Convert a parsed token account, skipping empty and NFT-shaped ones.
    fn convert(info: &TokenInfo) -> Option<RawTokenBalance> {
        let raw_balance = info.token_amount.amount.parse::<u128>().ok()?;
        if raw_balance == 0 {
            return None;
        }
        // Zero decimals with a unit amount is the NFT shape.
        if info.token_amount.decimals == 0 && raw_balance == 1 {
            return None;
        }

        Some(RawTokenBalance {
            address: info.mint.clone(),
            symbol: short_mint(&info.mint),
            decimals: info.token_amount.decimals,
            raw_balance,
        })
    }

    async fn fetch_lamports(&self, owner: &str) -> Result<u64> {
        let result: BalanceResult = self.rpc("getBalance", json!([owner])).await?;
        Ok(result.value)
    }
}

/// Shortened mint used as a display symbol when no metadata is known.
fn short_mint(mint: &str) -> String {
    format!("{}…", &mint[..mint.len().min(4)])
}

#[async_trait]
impl ChainScanner for SolanaScanner {
    fn chain(&self) -> Chain {
        Chain::Solana
    }

    async fn scan(&self, wallet_address: &str) -> Result<ChainBalance> {
        let (accounts, lamports) = tokio::join!(
            self.fetch_token_accounts(wallet_address),
            self.fetch_lamports(wallet_address),
        );
        let raw = accounts?;
        let lamports = lamports?;

        let classified =
            classify_tokens(&self.oracle, Chain::Solana, raw, self.dust_threshold_usd).await;

        let native_balance =
            WalletToken::format_units(lamports as u128, Chain::Solana.native_decimals());
        let native_usd = native_value_usd(&self.oracle, Chain::Solana, native_balance).await;

        let balance =
            ChainBalance::from_tokens(Chain::Solana, classified, native_balance, native_usd);

        info!(
            wallet = wallet_address,
            tokens = balance.tokens.len(),
            dust = balance.dust_token_count,
            total_usd = %balance.total_value_usd,
            "Solana scan complete"
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

    fn info(mint: &str, amount: &str, decimals: u8) -> TokenInfo {
        TokenInfo {
            mint: mint.to_string(),
            token_amount: TokenAmount {
                amount: amount.to_string(),
                decimals,
            },
        }
    }

    #[test]
    fn test_convert_valid_account() {
        let raw = SolanaScanner::convert(&info("BonkMint111", "250000", 5)).unwrap();
        assert_eq!(raw.address, "BonkMint111");
        assert_eq!(raw.raw_balance, 250_000);
        assert_eq!(raw.decimals, 5);
        assert_eq!(raw.symbol, "Bonk…");
    }

    #[test]
    fn test_convert_skips_empty_account() {
        assert!(SolanaScanner::convert(&info("Mint", "0", 6)).is_none());
    }

    #[test]
    fn test_convert_skips_nft_shape() {
        assert!(SolanaScanner::convert(&info("NftMint", "1", 0)).is_none());
    }

    #[test]
    fn test_convert_keeps_zero_decimal_fungible() {
        // Whole-unit tokens (decimals 0, amount > 1) are fungible.
        assert!(SolanaScanner::convert(&info("Mint", "37", 0)).is_some());
    }

    #[test]
    fn test_token_accounts_parsing() {
        let json = r#"{
            "result": {
                "value": [{
                    "account": {
                        "data": {
                            "parsed": {
                                "info": {
                                    "mint": "So11111111111111111111111111111111111111112",
                                    "tokenAmount": {"amount": "5000", "decimals": 9}
                                }
                            }
                        }
                    }
                }]
            }
        }"#;
        let resp: RpcResponse<TokenAccountsResult> = serde_json::from_str(json).unwrap();
        let result = resp.result.unwrap();
        assert_eq!(result.value.len(), 1);
        assert_eq!(result.value[0].account.data.parsed.info.token_amount.decimals, 9);
    }
}
