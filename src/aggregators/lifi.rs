//! LI.FI bridge aggregator adapter (cross-chain legs).
//!
//! Serves requests whose destination chain differs from the source; the
//! returned quote carries `QuoteKind::Bridge` and provider route metadata.
//! Same-chain requests belong to the swap adapters and get `None` here.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::debug;

use crate::aggregators::QuoteAggregator;
use crate::types::{Chain, DexQuote, QuoteKind, QuoteRequest};

const LIFI_API_URL: &str = "https://li.quest/v1";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct LiFiQuoteResponse {
    #[serde(default, rename = "toolDetails")]
    tool_details: Option<LiFiTool>,
    estimate: LiFiEstimate,
    #[serde(default, rename = "transactionRequest")]
    transaction_request: Option<LiFiTransaction>,
}

#[derive(Debug, Deserialize)]
struct LiFiTool {
    name: String,
}

#[derive(Debug, Deserialize)]
struct LiFiEstimate {
    #[serde(rename = "toAmount")]
    to_amount: String,
    #[serde(default, rename = "toAmountUSD")]
    to_amount_usd: Option<String>,
    #[serde(default, rename = "gasCosts")]
    gas_costs: Vec<LiFiGasCost>,
}

#[derive(Debug, Deserialize)]
struct LiFiGasCost {
    #[serde(default, rename = "amountUSD")]
    amount_usd: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LiFiTransaction {
    data: String,
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

pub struct LiFiAggregator {
    http: Client,
    quote_ttl_secs: u64,
}

impl LiFiAggregator {
    pub fn new(quote_ttl_secs: u64) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(20))
            .build()
            .context("Failed to build LI.FI HTTP client")?;
        Ok(Self {
            http,
            quote_ttl_secs,
        })
    }

    /// LI.FI chain keys: numeric ids for EVM chains, a symbol for Solana.
    fn chain_key(chain: Chain) -> &'static str {
        match chain {
            Chain::Ethereum => "1",
            Chain::Polygon => "137",
            Chain::Arbitrum => "42161",
            Chain::Base => "8453",
            Chain::Solana => "SOL",
        }
    }

    fn total_gas_usd(estimate: &LiFiEstimate) -> Decimal {
        estimate
            .gas_costs
            .iter()
            .filter_map(|g| g.amount_usd.as_deref())
            .filter_map(|v| v.parse::<Decimal>().ok())
            .sum()
    }
}

#[async_trait]
impl QuoteAggregator for LiFiAggregator {
    fn name(&self) -> &str {
        "lifi"
    }

    fn is_available(&self, _chain: Chain) -> bool {
        true
    }

    async fn get_quote(&self, request: &QuoteRequest) -> Result<Option<DexQuote>> {
        // Bridge adapter: only cross-chain requests.
        let Some(dest_chain) = request.dest_chain.filter(|d| *d != request.chain) else {
            return Ok(None);
        };

        let slippage_fraction = request.slippage_tolerance / Decimal::ONE_HUNDRED;
        let resp = self
            .http
            .get(format!("{LIFI_API_URL}/quote"))
            .query(&[
                ("fromChain", Self::chain_key(request.chain).to_string()),
                ("toChain", Self::chain_key(dest_chain).to_string()),
                ("fromToken", request.input_token.clone()),
                ("toToken", request.output_token.clone()),
                ("fromAmount", request.input_amount.to_string()),
                ("fromAddress", request.user_address.clone()),
                ("slippage", slippage_fraction.to_string()),
            ])
            .send()
            .await
            .context("LI.FI quote request failed")?;

        match resp.status() {
            s if s.is_success() => {}
            // No bridge route for this pair: valid negative outcome.
            StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND => {
                debug!(
                    from = %request.chain,
                    to = %dest_chain,
                    "LI.FI has no bridge route"
                );
                return Ok(None);
            }
            s => anyhow::bail!("LI.FI error {s}"),
        }

        let body: LiFiQuoteResponse = resp
            .json()
            .await
            .context("Failed to parse LI.FI response")?;

        let Some(output_amount) = body.estimate.to_amount.parse::<u128>().ok() else {
            debug!("LI.FI quote has unparseable toAmount");
            return Ok(None);
        };
        let output_value_usd = body
            .estimate
            .to_amount_usd
            .as_deref()
            .and_then(|v| v.parse::<Decimal>().ok())
            .unwrap_or(Decimal::ZERO);

        let tool = body
            .tool_details
            .map(|t| t.name)
            .unwrap_or_else(|| "lifi".to_string());

        Ok(Some(DexQuote {
            aggregator: self.name().to_string(),
            chain: request.chain,
            kind: QuoteKind::Bridge { dest_chain },
            input_token: request.input_token.clone(),
            output_token: request.output_token.clone(),
            input_amount: request.input_amount,
            output_amount,
            output_value_usd,
            price_impact_pct: Decimal::ZERO,
            estimated_gas_usd: Self::total_gas_usd(&body.estimate),
            slippage_tolerance: request.slippage_tolerance,
            expires_at: Utc::now().timestamp() + self.quote_ttl_secs as i64,
            route: format!("{} -> {} via {tool}", request.chain, dest_chain),
            input_symbol: None,
            output_symbol: None,
            calldata: if request.include_execution_data {
                body.transaction_request.map(|t| t.data)
            } else {
                None
            },
        }))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
