//! Quote aggregation.
//!
//! Defines the `QuoteAggregator` trait and provides adapters for the
//! configured swap and bridge providers, plus the selector that fans a
//! request out to every available adapter and picks the best quote by
//! output value net of gas.

pub mod jupiter;
pub mod lifi;
pub mod metadata;
pub mod zerox;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::oracle::PriceOracle;
use crate::types::{Chain, DexQuote, QuoteKind, QuoteRequest, WalletToken};

use metadata::TokenMetadataCache;

/// Abstraction over external swap/bridge quote providers.
///
/// `Ok(None)` means the adapter cannot serve this pair or chain — a valid
/// negative outcome. An `Err` is a transient failure of an otherwise
/// capable adapter; callers retry it rather than treating it as "no
/// route".
#[async_trait]
pub trait QuoteAggregator: Send + Sync {
    /// Adapter name for logging and identification.
    fn name(&self) -> &str;

    /// Whether this adapter serves the given source chain.
    fn is_available(&self, chain: Chain) -> bool;

    /// Fetch a quote for the request, or `None` if unservable.
    async fn get_quote(&self, request: &QuoteRequest) -> Result<Option<DexQuote>>;
}

// ---------------------------------------------------------------------------
// Selector
// ---------------------------------------------------------------------------

/// Fans a quote request out across all available adapters and picks the
/// winner: maximum output value net of estimated gas, ties broken toward
/// the lowest price impact.
pub struct QuoteSelector {
    aggregators: Vec<Arc<dyn QuoteAggregator>>,
    oracle: Arc<PriceOracle>,
    metadata: Arc<TokenMetadataCache>,
}

impl QuoteSelector {
    pub fn new(
        aggregators: Vec<Arc<dyn QuoteAggregator>>,
        oracle: Arc<PriceOracle>,
        metadata: Arc<TokenMetadataCache>,
    ) -> Self {
        Self {
            aggregators,
            oracle,
            metadata,
        }
    }

    /// Query every available adapter concurrently and return the best
    /// quote, or `None` when no adapter can serve the pair.
    ///
    /// The fan-out always previews (no execution data); when the caller
    /// asked for execution data, the winning adapter is re-asked to
    /// materialize calldata bound to the quoted route.
    pub async fn best_quote(&self, request: &QuoteRequest) -> Result<Option<DexQuote>> {
        let available: Vec<_> = self
            .aggregators
            .iter()
            .filter(|a| a.is_available(request.chain))
            .cloned()
            .collect();

        if available.is_empty() {
            debug!(chain = %request.chain, "No aggregator available");
            return Ok(None);
        }

        let preview = QuoteRequest {
            include_execution_data: false,
            ..request.clone()
        };
        let fetches = available.iter().map(|adapter| {
            let adapter = adapter.clone();
            let preview = preview.clone();
            async move { (adapter.name().to_string(), adapter.get_quote(&preview).await) }
        });

        let mut quotes = Vec::new();
        for (name, result) in join_all(fetches).await {
            match result {
                Ok(Some(quote)) => quotes.push(quote),
                Ok(None) => debug!(adapter = %name, "No route from adapter"),
                Err(e) => warn!(adapter = %name, error = %e, "Adapter quote failed"),
            }
        }

        if quotes.is_empty() {
            return Ok(None);
        }

        for quote in &mut quotes {
            self.decorate(quote, request).await;
        }

        quotes.sort_by(|a, b| {
            b.net_output_usd()
                .cmp(&a.net_output_usd())
                .then(a.price_impact_pct.cmp(&b.price_impact_pct))
                .then(b.output_amount.cmp(&a.output_amount))
        });
        let mut winner = quotes.swap_remove(0);

        info!(
            adapter = %winner.aggregator,
            chain = %winner.chain,
            net_usd = %winner.net_output_usd(),
            candidates = quotes.len() + 1,
            "Quote selected"
        );

        if request.include_execution_data && !winner.has_execution_data() {
            winner = self.materialize(winner, request).await;
        }

        Ok(Some(winner))
    }

    /// Re-ask the winning adapter for an executable quote. Falls back to
    /// the preview quote on failure; executability is enforced later, at
    /// the submission boundary.
    async fn materialize(&self, winner: DexQuote, request: &QuoteRequest) -> DexQuote {
        let Some(adapter) = self
            .aggregators
            .iter()
            .find(|a| a.name() == winner.aggregator)
        else {
            return winner;
        };

        let executable = QuoteRequest {
            include_execution_data: true,
            ..request.clone()
        };
        match adapter.get_quote(&executable).await {
            Ok(Some(mut quote)) if quote.has_execution_data() => {
                quote.input_symbol = winner.input_symbol.clone();
                quote.output_symbol = winner.output_symbol.clone();
                if quote.output_value_usd.is_zero() {
                    quote.output_value_usd = winner.output_value_usd;
                }
                quote
            }
            Ok(_) => {
                warn!(adapter = %winner.aggregator, "Adapter returned no execution data");
                winner
            }
            Err(e) => {
                warn!(adapter = %winner.aggregator, error = %e, "Execution-data fetch failed");
                winner
            }
        }
    }

    /// Best-effort decoration: USD value of the output (for ranking) and
    /// display symbols. Absence of either never blocks selection.
    async fn decorate(&self, quote: &mut DexQuote, request: &QuoteRequest) {
        if quote.output_value_usd.is_zero() {
            if let Some(decimals) = request.output_decimals {
                let value_chain = match quote.kind {
                    QuoteKind::Bridge { dest_chain } => dest_chain,
                    QuoteKind::Swap => quote.chain,
                };
                if let Ok(price) = self
                    .oracle
                    .validated_price(&quote.output_token, value_chain)
                    .await
                {
                    let formatted = WalletToken::format_units(quote.output_amount, decimals);
                    quote.output_value_usd = formatted * price.price_usd;
                }
            }
        }

        if quote.input_symbol.is_none() {
            quote.input_symbol = self
                .metadata
                .lookup(quote.chain, &quote.input_token)
                .await
                .map(|m| m.symbol);
        }
        if quote.output_symbol.is_none() {
            let chain = match quote.kind {
                QuoteKind::Bridge { dest_chain } => dest_chain,
                QuoteKind::Swap => quote.chain,
            };
            quote.output_symbol = self
                .metadata
                .lookup(chain, &quote.output_token)
                .await
                .map(|m| m.symbol);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
