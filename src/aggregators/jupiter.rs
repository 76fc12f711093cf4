//! Jupiter swap aggregator adapter (token-account chains).
//!
//! `/quote` for route discovery, `/swap` to materialize the signed-payload
//! transaction when execution data is requested. The raw quote response is
//! kept as-is because `/swap` expects it verbatim.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

use crate::aggregators::QuoteAggregator;
use crate::oracle::PriceOracle;
use crate::types::{Chain, DexQuote, QuoteKind, QuoteRequest, WalletToken};

const JUPITER_SWAP_URL: &str = "https://lite-api.jup.ag/swap/v1";

/// Flat signature + priority fee estimate used for gas costing; Solana
/// fees are effectively constant at dust scale.
const FEE_LAMPORTS: u64 = 10_000;

pub struct JupiterAggregator {
    http: Client,
    oracle: Arc<PriceOracle>,
    quote_ttl_secs: u64,
}

impl JupiterAggregator {
    pub fn new(oracle: Arc<PriceOracle>, quote_ttl_secs: u64) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .context("Failed to build Jupiter HTTP client")?;
        Ok(Self {
            http,
            oracle,
            quote_ttl_secs,
        })
    }

    fn slippage_bps(tolerance_pct: Decimal) -> u32 {
        (tolerance_pct * Decimal::ONE_HUNDRED)
            .round()
            .to_u32()
            .unwrap_or(50)
    }

    /// Route labels from the quote's `routePlan`, for display.
    fn route_description(quote: &Value) -> String {
        let labels: Vec<&str> = quote["routePlan"]
            .as_array()
            .map(|plan| {
                plan.iter()
                    .filter_map(|step| step["swapInfo"]["label"].as_str())
                    .collect()
            })
            .unwrap_or_default();
        if labels.is_empty() {
            "jupiter".to_string()
        } else {
            labels.join(" -> ")
        }
    }

    async fn fee_usd(&self) -> Decimal {
        let fee_sol =
            WalletToken::format_units(FEE_LAMPORTS as u128, Chain::Solana.native_decimals());
        match self
            .oracle
            .validated_price(Chain::Solana.wrapped_native_token(), Chain::Solana)
            .await
        {
            Ok(price) => fee_sol * price.price_usd,
            Err(_) => Decimal::ZERO,
        }
    }

    /// Exchange the raw quote for an executable transaction payload.
    async fn fetch_swap_transaction(&self, quote: &Value, user: &str) -> Result<String> {
        let resp = self
            .http
            .post(format!("{JUPITER_SWAP_URL}/swap"))
            .json(&json!({
                "quoteResponse": quote,
                "userPublicKey": user,
            }))
            .send()
            .await
            .context("Jupiter swap request failed")?;

        if !resp.status().is_success() {
            anyhow::bail!("Jupiter swap error {}", resp.status());
        }

        let body: Value = resp
            .json()
            .await
            .context("Failed to parse Jupiter swap response")?;
        body["swapTransaction"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| anyhow::anyhow!("Jupiter swap response missing transaction"))
    }
}

#[async_trait]
impl QuoteAggregator for JupiterAggregator {
    fn name(&self) -> &str {
        "jupiter"
    }

    fn is_available(&self, chain: Chain) -> bool {
        chain == Chain::Solana
    }

    async fn get_quote(&self, request: &QuoteRequest) -> Result<Option<DexQuote>> {
        if request.chain != Chain::Solana {
            return Ok(None);
        }
        if request.dest_chain.is_some_and(|d| d != request.chain) {
            return Ok(None);
        }

        let resp = self
            .http
            .get(format!("{JUPITER_SWAP_URL}/quote"))
            .query(&[
                ("inputMint", request.input_token.clone()),
                ("outputMint", request.output_token.clone()),
                ("amount", request.input_amount.to_string()),
                (
                    "slippageBps",
                    Self::slippage_bps(request.slippage_tolerance).to_string(),
                ),
            ])
            .send()
            .await
            .context("Jupiter quote request failed")?;

        match resp.status() {
            s if s.is_success() => {}
            // No route / bad pair: valid negative outcome.
            StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND => {
                debug!(input = %request.input_token, "Jupiter has no route");
                return Ok(None);
            }
            s => anyhow::bail!("Jupiter quote error {s}"),
        }

        let raw: Value = resp
            .json()
            .await
            .context("Failed to parse Jupiter quote response")?;

        let Some(output_amount) = raw["outAmount"].as_str().and_then(|a| a.parse::<u128>().ok())
        else {
            debug!(input = %request.input_token, "Jupiter quote missing outAmount");
            return Ok(None);
        };
        let price_impact_pct = raw["priceImpactPct"]
            .as_str()
            .and_then(|p| p.parse::<Decimal>().ok())
            .map(|p| p * Decimal::ONE_HUNDRED)
            .unwrap_or(Decimal::ZERO);

        let calldata = if request.include_execution_data {
            Some(
                self.fetch_swap_transaction(&raw, &request.user_address)
                    .await?,
            )
        } else {
            None
        };

        Ok(Some(DexQuote {
            aggregator: self.name().to_string(),
            chain: Chain::Solana,
            kind: QuoteKind::Swap,
            input_token: request.input_token.clone(),
            output_token: request.output_token.clone(),
            input_amount: request.input_amount,
            output_amount,
            output_value_usd: Decimal::ZERO,
            price_impact_pct,
            estimated_gas_usd: self.fee_usd().await,
            slippage_tolerance: request.slippage_tolerance,
            expires_at: Utc::now().timestamp() + self.quote_ttl_secs as i64,
            route: Self::route_description(&raw),
            input_symbol: None,
            output_symbol: None,
            calldata,
        }))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
