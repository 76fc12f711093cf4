//! 0x swap aggregator adapter (account-model chains).
//!
//! Uses the v2 allowance-holder API: `/price` for previews and `/quote`
//! when executable calldata is requested. A `liquidityAvailable: false`
//! response is "no route", not an error.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::aggregators::QuoteAggregator;
use crate::oracle::PriceOracle;
use crate::types::{Chain, ChainFamily, DexQuote, QuoteKind, QuoteRequest, WalletToken};

const ZEROX_API_URL: &str = "https://api.0x.org/swap/allowance-holder";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct ZeroExResponse {
    #[serde(default = "default_true", rename = "liquidityAvailable")]
    liquidity_available: bool,
    #[serde(default, rename = "buyAmount")]
    buy_amount: Option<String>,
    #[serde(default, rename = "estimatedPriceImpact")]
    estimated_price_impact: Option<String>,
    /// Network fee in wei of the chain's native asset.
    #[serde(default, rename = "totalNetworkFee")]
    total_network_fee: Option<String>,
    #[serde(default)]
    route: Option<ZeroExRoute>,
    #[serde(default)]
    transaction: Option<ZeroExTransaction>,
}

#[derive(Debug, Deserialize)]
struct ZeroExRoute {
    #[serde(default)]
    fills: Vec<ZeroExFill>,
}

#[derive(Debug, Deserialize)]
struct ZeroExFill {
    source: String,
}

#[derive(Debug, Deserialize)]
struct ZeroExTransaction {
    data: String,
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

pub struct ZeroExAggregator {
    http: Client,
    api_key: Secret<String>,
    oracle: Arc<PriceOracle>,
    quote_ttl_secs: u64,
}

impl ZeroExAggregator {
    pub fn new(api_key: String, oracle: Arc<PriceOracle>, quote_ttl_secs: u64) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .context("Failed to build 0x HTTP client")?;
        Ok(Self {
            http,
            api_key: Secret::new(api_key),
            oracle,
            quote_ttl_secs,
        })
    }

    fn chain_id(chain: Chain) -> Option<u64> {
        match chain {
            Chain::Ethereum => Some(1),
            Chain::Polygon => Some(137),
            Chain::Arbitrum => Some(42161),
            Chain::Base => Some(8453),
            Chain::Solana => None,
        }
    }

    /// Slippage tolerance in percent to basis points.
    fn slippage_bps(tolerance_pct: Decimal) -> u32 {
        (tolerance_pct * Decimal::ONE_HUNDRED)
            .round()
            .to_u32()
            .unwrap_or(50)
    }

    /// Network fee in wei to USD via the native-asset price. Degrades to
    /// zero when the native price is unavailable.
    async fn network_fee_usd(&self, chain: Chain, fee_wei: Option<&str>) -> Decimal {
        let Some(raw) = fee_wei.and_then(|f| f.parse::<u128>().ok()) else {
            return Decimal::ZERO;
        };
        let fee_native = WalletToken::format_units(raw, chain.native_decimals());
        match self
            .oracle
            .validated_price(chain.wrapped_native_token(), chain)
            .await
        {
            Ok(price) => fee_native * price.price_usd,
            Err(e) => {
                debug!(%chain, error = %e, "Native price unavailable for gas conversion");
                Decimal::ZERO
            }
        }
    }
}

#[async_trait]
impl QuoteAggregator for ZeroExAggregator {
    fn name(&self) -> &str {
        "zerox"
    }

    fn is_available(&self, chain: Chain) -> bool {
        chain.family() == ChainFamily::Account
    }

    async fn get_quote(&self, request: &QuoteRequest) -> Result<Option<DexQuote>> {
        let Some(chain_id) = Self::chain_id(request.chain) else {
            return Ok(None);
        };
        // Same-chain swaps only; bridge legs belong to bridge adapters.
        if request.dest_chain.is_some_and(|d| d != request.chain) {
            return Ok(None);
        }

        let endpoint = if request.include_execution_data {
            "quote"
        } else {
            "price"
        };
        let url = format!("{ZEROX_API_URL}/{endpoint}");

        let resp = self
            .http
            .get(&url)
            .header("0x-api-key", self.api_key.expose_secret())
            .header("0x-version", "v2")
            .query(&[
                ("chainId", chain_id.to_string()),
                ("sellToken", request.input_token.clone()),
                ("buyToken", request.output_token.clone()),
                ("sellAmount", request.input_amount.to_string()),
                ("taker", request.user_address.clone()),
                (
                    "slippageBps",
                    Self::slippage_bps(request.slippage_tolerance).to_string(),
                ),
            ])
            .send()
            .await
            .context("0x request failed")?;

        match resp.status() {
            s if s.is_success() => {}
            // Unservable pair/params: a valid negative outcome.
            StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND | StatusCode::UNPROCESSABLE_ENTITY => {
                debug!(chain = %request.chain, input = %request.input_token, "0x cannot serve pair");
                return Ok(None);
            }
            s => anyhow::bail!("0x error {s}"),
        }

        let body: ZeroExResponse = resp.json().await.context("Failed to parse 0x response")?;
        if !body.liquidity_available {
            return Ok(None);
        }
        let Some(output_amount) = body.buy_amount.as_deref().and_then(|a| a.parse::<u128>().ok())
        else {
            warn!(chain = %request.chain, "0x response missing buyAmount");
            return Ok(None);
        };

        let estimated_gas_usd = self
            .network_fee_usd(request.chain, body.total_network_fee.as_deref())
            .await;
        let price_impact_pct = body
            .estimated_price_impact
            .as_deref()
            .and_then(|p| p.parse::<Decimal>().ok())
            .unwrap_or(Decimal::ZERO);
        let route = body
            .route
            .map(|r| {
                r.fills
                    .iter()
                    .map(|f| f.source.as_str())
                    .collect::<Vec<_>>()
                    .join(" + ")
            })
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| "0x".to_string());

        Ok(Some(DexQuote {
            aggregator: self.name().to_string(),
            chain: request.chain,
            kind: QuoteKind::Swap,
            input_token: request.input_token.clone(),
            output_token: request.output_token.clone(),
            input_amount: request.input_amount,
            output_amount,
            output_value_usd: Decimal::ZERO,
            price_impact_pct,
            estimated_gas_usd,
            slippage_tolerance: request.slippage_tolerance,
            expires_at: Utc::now().timestamp() + self.quote_ttl_secs as i64,
            route,
            input_symbol: None,
            output_symbol: None,
            calldata: body.transaction.map(|t| t.data),
        }))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
