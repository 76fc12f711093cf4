//! Mock chain infrastructure for integration testing.
//!
//! Provides deterministic `SettlementTarget` and `QuoteAggregator`
//! implementations that are fully controllable from test code — scripted
//! receipts per chain, a broadcast counter for idempotency assertions,
//! and quotes with configurable expiry. All state is in-memory.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal_macros::dec;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use duster::aggregators::QuoteAggregator;
use duster::settlement::SettlementTarget;
use duster::types::{
    Chain, DexQuote, QuoteKind, QuoteRequest, ReceiptStatus, TxReceipt,
};

// ---------------------------------------------------------------------------
// Settlement mock
// ---------------------------------------------------------------------------

/// In-memory settlement target with per-chain scripted receipts.
pub struct MockSettlement {
    submit_count: AtomicUsize,
    next_tx: AtomicUsize,
    receipts: Mutex<HashMap<Chain, ReceiptStatus>>,
    failing_chains: Mutex<HashSet<Chain>>,
}

impl MockSettlement {
    pub fn new() -> Self {
        Self {
            submit_count: AtomicUsize::new(0),
            next_tx: AtomicUsize::new(0),
            receipts: Mutex::new(HashMap::new()),
            failing_chains: Mutex::new(HashSet::new()),
        }
    }

    /// Script the receipt status every poll on `chain` will observe.
    pub fn set_receipt(&self, chain: Chain, status: ReceiptStatus) {
        self.receipts.lock().unwrap().insert(chain, status);
    }

    /// Make broadcasts on `chain` fail (transient RPC outage).
    pub fn fail_submits_on(&self, chain: Chain) {
        self.failing_chains.lock().unwrap().insert(chain);
    }

    pub fn clear_submit_failures(&self) {
        self.failing_chains.lock().unwrap().clear();
    }

    /// Total successful broadcasts, for exactly-once assertions.
    pub fn submit_count(&self) -> usize {
        self.submit_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SettlementTarget for MockSettlement {
    async fn submit(&self, chain: Chain, _calldata: &str, _signer_context: &str) -> Result<String> {
        if self.failing_chains.lock().unwrap().contains(&chain) {
            return Err(anyhow!("RPC unavailable on {chain}"));
        }
        self.submit_count.fetch_add(1, Ordering::SeqCst);
        let n = self.next_tx.fetch_add(1, Ordering::SeqCst);
        Ok(format!("0xmock{chain}{n}"))
    }

    async fn receipt(&self, chain: Chain, _tx_hash: &str) -> Result<TxReceipt> {
        let status = self
            .receipts
            .lock()
            .unwrap()
            .get(&chain)
            .copied()
            .unwrap_or(ReceiptStatus::Pending);
        Ok(TxReceipt {
            status,
            details: match status {
                ReceiptStatus::Reverted => Some("mock revert".into()),
                _ => None,
            },
        })
    }
}

// ---------------------------------------------------------------------------
// Aggregator mock
// ---------------------------------------------------------------------------

/// Quote adapter returning deterministic quotes for every request, with
/// calldata bound whenever execution data is requested.
pub struct MockAggregator {
    pub name: String,
    pub quote_ttl_secs: i64,
    /// Output amount as a fraction of input, in basis points.
    pub output_bps: u128,
    /// When set, bridge quotes land this token instead of the requested
    /// one, forcing a dependent destination-chain deposit leg.
    pub bridge_intermediate: Option<String>,
}

impl MockAggregator {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            quote_ttl_secs: 120,
            output_bps: 9_900,
            bridge_intermediate: None,
        }
    }
}

#[async_trait]
impl QuoteAggregator for MockAggregator {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_available(&self, _chain: Chain) -> bool {
        true
    }

    async fn get_quote(&self, request: &QuoteRequest) -> Result<Option<DexQuote>> {
        let kind = match request.dest_chain.filter(|d| *d != request.chain) {
            Some(dest_chain) => QuoteKind::Bridge { dest_chain },
            None => QuoteKind::Swap,
        };
        let output_token = match (&kind, &self.bridge_intermediate) {
            (QuoteKind::Bridge { .. }, Some(intermediate)) => intermediate.clone(),
            _ => request.output_token.clone(),
        };
        Ok(Some(DexQuote {
            aggregator: self.name.clone(),
            chain: request.chain,
            kind,
            input_token: request.input_token.clone(),
            output_token,
            input_amount: request.input_amount,
            output_amount: request.input_amount * self.output_bps / 10_000,
            output_value_usd: dec!(0.50),
            price_impact_pct: dec!(0.15),
            estimated_gas_usd: dec!(0.03),
            slippage_tolerance: request.slippage_tolerance,
            expires_at: Utc::now().timestamp() + self.quote_ttl_secs,
            route: format!("{} mock route", self.name),
            input_symbol: None,
            output_symbol: None,
            calldata: request
                .include_execution_data
                .then(|| format!("0xcalldata:{}:{}", request.chain, request.input_token)),
        }))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_settlement_scripted_receipts() {
        let settlement = MockSettlement::new();
        settlement.set_receipt(Chain::Base, ReceiptStatus::Confirmed);

        let tx = settlement.submit(Chain::Base, "0xdata", "0xwallet").await.unwrap();
        let receipt = settlement.receipt(Chain::Base, &tx).await.unwrap();
        assert_eq!(receipt.status, ReceiptStatus::Confirmed);

        // Unscripted chains stay pending.
        let receipt = settlement.receipt(Chain::Polygon, "0xother").await.unwrap();
        assert_eq!(receipt.status, ReceiptStatus::Pending);
    }

    #[tokio::test]
    async fn test_mock_settlement_counts_submits() {
        let settlement = MockSettlement::new();
        settlement.submit(Chain::Base, "0xa", "0xw").await.unwrap();
        settlement.submit(Chain::Ethereum, "0xb", "0xw").await.unwrap();
        assert_eq!(settlement.submit_count(), 2);
    }

    #[tokio::test]
    async fn test_mock_settlement_forced_failure() {
        let settlement = MockSettlement::new();
        settlement.fail_submits_on(Chain::Polygon);

        assert!(settlement.submit(Chain::Polygon, "0xa", "0xw").await.is_err());
        assert_eq!(settlement.submit_count(), 0);

        settlement.clear_submit_failures();
        assert!(settlement.submit(Chain::Polygon, "0xa", "0xw").await.is_ok());
    }

    #[tokio::test]
    async fn test_mock_aggregator_binds_calldata_on_request() {
        let adapter = MockAggregator::new("mock");
        let mut request = QuoteRequest {
            chain: Chain::Ethereum,
            dest_chain: Some(Chain::Base),
            input_token: "0xdust".into(),
            output_token: "0xusdc".into(),
            input_amount: 10_000,
            output_decimals: Some(6),
            slippage_tolerance: dec!(0.5),
            user_address: "0xwallet".into(),
            include_execution_data: false,
        };

        let preview = adapter.get_quote(&request).await.unwrap().unwrap();
        assert!(preview.calldata.is_none());
        assert!(matches!(preview.kind, QuoteKind::Bridge { .. }));
        assert_eq!(preview.output_amount, 9_900);

        request.include_execution_data = true;
        let executable = adapter.get_quote(&request).await.unwrap().unwrap();
        assert!(executable.calldata.is_some());
    }
}
