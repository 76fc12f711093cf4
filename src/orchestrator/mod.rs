//! Sweep orchestrator.
//!
//! Owns the Sweep lifecycle: Pending -> Quoting -> Signing -> Submitted
//! -> Confirmed/Failed, with Cancelled reachable only before submission.
//! Every transition reads the current status, validates the edge, and
//! writes through a conditional store update keyed on the expected status,
//! so concurrent transition attempts on one sweep serialize instead of
//! losing updates. Money-moving work is never done inline: submission
//! enqueues execution jobs that carry the exact quote snapshot the user
//! approved.

pub mod jobs;

use chrono::Utc;
use futures::future::join_all;
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::aggregators::QuoteSelector;
use crate::config::{AggregatorsConfig, QueueConfig};
use crate::gate::PaymentGate;
use crate::queue::{JobQueue, QueueName};
use crate::storage::Store;
use crate::types::{
    PaymentAuthorization, QuoteKind, QuoteRequest, Sweep, SweepError, SweepInput, SweepLeg,
    SweepStatus,
};

use jobs::{execution_identity, tracking_identity, ExecuteLegPayload, TrackLegPayload};

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub default_slippage_pct: Decimal,
    /// Initial delay before the first settlement poll of a swap leg.
    pub swap_track_delay: Duration,
    /// Initial delay for bridge legs; bridge finality is slower.
    pub bridge_track_delay: Duration,
    /// A leg still unconfirmed after this many polls is failed.
    pub max_track_polls: u32,
    /// Terminal jobs older than this are pruned on the scheduler tick.
    pub job_retention: Duration,
}

impl OrchestratorSettings {
    pub fn from_config(queue: &QueueConfig, aggregators: &AggregatorsConfig) -> Self {
        Self {
            default_slippage_pct: aggregators.default_slippage_pct,
            swap_track_delay: Duration::from_secs(queue.swap_track_delay_secs),
            bridge_track_delay: Duration::from_secs(queue.bridge_track_delay_secs),
            max_track_polls: queue.max_track_polls,
            job_retention: Duration::from_secs(queue.retention_hours * 3600),
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            default_slippage_pct: rust_decimal_macros::dec!(0.5),
            swap_track_delay: Duration::from_secs(5),
            bridge_track_delay: Duration::from_secs(30),
            max_track_polls: 40,
            job_retention: Duration::from_secs(72 * 3600),
        }
    }
}

/// What the user is shown before signing.
#[derive(Debug, Clone)]
pub struct QuoteSummary {
    pub input_value_usd: Decimal,
    pub output_value_usd: Decimal,
    pub total_gas_usd: Decimal,
    pub legs: usize,
    /// Earliest leg deadline; the signature must arrive before it.
    pub expires_at: i64,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct SweepOrchestrator {
    store: Arc<Store>,
    queue: Arc<JobQueue>,
    selector: Arc<QuoteSelector>,
    gate: Arc<PaymentGate>,
    settings: OrchestratorSettings,
}

impl SweepOrchestrator {
    pub fn new(
        store: Arc<Store>,
        queue: Arc<JobQueue>,
        selector: Arc<QuoteSelector>,
        gate: Arc<PaymentGate>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            store,
            queue,
            selector,
            gate,
            settings,
        }
    }

    // -- Creation ---------------------------------------------------------

    /// Create a sweep from a selected dust set. Validation failures reject
    /// synchronously; nothing is persisted for an invalid request.
    pub async fn create_sweep(
        &self,
        wallet: &str,
        inputs: Vec<SweepInput>,
        output_token: &str,
        output_chain: crate::types::Chain,
        output_decimals: Option<u8>,
    ) -> Result<Sweep, SweepError> {
        if wallet.is_empty() || output_token.is_empty() {
            return Err(SweepError::EmptySweep);
        }
        if inputs.is_empty() || inputs.iter().any(|i| i.amount == 0) {
            return Err(SweepError::EmptySweep);
        }

        let mut sweep = Sweep::new(wallet, output_token, output_chain);
        sweep.output_decimals = output_decimals;
        sweep.inputs = inputs;

        self.store
            .insert_sweep(&sweep)
            .await
            .map_err(|e| SweepError::Storage(e.to_string()))?;

        info!(
            sweep_id = %sweep.id,
            wallet,
            inputs = sweep.inputs.len(),
            input_usd = %sweep.input_value_usd(),
            "Sweep created"
        );
        Ok(sweep)
    }

    // -- Pending -> Quoting -----------------------------------------------

    /// Request quotes for every input and persist the chosen set.
    pub async fn request_quotes(&self, sweep_id: &str) -> Result<Sweep, SweepError> {
        let mut sweep = self.load(sweep_id).await?;
        self.check_edge(&sweep, SweepStatus::Quoting)?;

        let legs = self.quote_legs(&sweep).await?;

        sweep.legs = legs;
        sweep.status = SweepStatus::Quoting;
        sweep.updated_at = Utc::now();
        self.apply(&sweep, SweepStatus::Pending).await?;

        info!(sweep_id = %sweep.id, legs = sweep.legs.len(), "Sweep quoted");
        Ok(sweep)
    }

    /// Refresh the quotes of a sweep that expired while quoting. Stays in
    /// Quoting; the old quote set is discarded wholesale.
    pub async fn re_quote(&self, sweep_id: &str) -> Result<Sweep, SweepError> {
        let mut sweep = self.load(sweep_id).await?;
        if sweep.status != SweepStatus::Quoting {
            return Err(SweepError::InvalidTransition {
                from: sweep.status,
                to: SweepStatus::Quoting,
            });
        }

        sweep.legs = self.quote_legs(&sweep).await?;
        sweep.updated_at = Utc::now();
        self.apply(&sweep, SweepStatus::Quoting).await?;
        Ok(sweep)
    }

    /// Gather one leg per input, plus a dependent destination-chain leg
    /// behind any bridge that lands in an intermediate token.
    async fn quote_legs(&self, sweep: &Sweep) -> Result<Vec<SweepLeg>, SweepError> {
        let requests: Vec<QuoteRequest> = sweep
            .inputs
            .iter()
            .map(|input| QuoteRequest {
                chain: input.chain,
                dest_chain: (input.chain != sweep.output_chain).then_some(sweep.output_chain),
                input_token: input.token.clone(),
                output_token: sweep.output_token.clone(),
                input_amount: input.amount,
                output_decimals: sweep.output_decimals,
                slippage_tolerance: self.settings.default_slippage_pct,
                user_address: sweep.wallet.clone(),
                include_execution_data: true,
            })
            .collect();

        let results = join_all(requests.iter().map(|r| self.selector.best_quote(r))).await;

        let mut legs: Vec<SweepLeg> = Vec::new();
        for (input, result) in sweep.inputs.iter().zip(results) {
            match result {
                Ok(Some(quote)) => legs.push(SweepLeg::new(quote)),
                Ok(None) => {
                    // Unroutable inputs are dropped from the sweep, not
                    // fatal for the routable remainder.
                    warn!(
                        sweep_id = %sweep.id,
                        token = %input.token,
                        chain = %input.chain,
                        "No route for input, dropping from sweep"
                    );
                }
                Err(e) => return Err(SweepError::Aggregator(e.to_string())),
            }
        }

        if legs.is_empty() {
            let first = &sweep.inputs[0];
            return Err(SweepError::NoRoute {
                chain: first.chain,
                input: first.token.clone(),
                output: sweep.output_token.clone(),
            });
        }

        // Bridges that deliver an intermediate token need a dependent
        // deposit swap on the destination chain, enqueued only after the
        // bridge leg confirms.
        let mut dependents: Vec<SweepLeg> = Vec::new();
        for (idx, leg) in legs.iter().enumerate() {
            let QuoteKind::Bridge { dest_chain } = leg.quote.kind else {
                continue;
            };
            if leg.quote.output_token == sweep.output_token {
                continue;
            }

            let deposit = QuoteRequest {
                chain: dest_chain,
                dest_chain: None,
                input_token: leg.quote.output_token.clone(),
                output_token: sweep.output_token.clone(),
                input_amount: leg.quote.output_amount,
                output_decimals: sweep.output_decimals,
                slippage_tolerance: self.settings.default_slippage_pct,
                user_address: sweep.wallet.clone(),
                include_execution_data: true,
            };
            match self.selector.best_quote(&deposit).await {
                Ok(Some(quote)) => {
                    let mut dep = SweepLeg::new(quote);
                    dep.depends_on = Some(idx);
                    dependents.push(dep);
                }
                Ok(None) => {
                    return Err(SweepError::NoRoute {
                        chain: dest_chain,
                        input: leg.quote.output_token.clone(),
                        output: sweep.output_token.clone(),
                    })
                }
                Err(e) => return Err(SweepError::Aggregator(e.to_string())),
            }
        }
        legs.extend(dependents);

        Ok(legs)
    }

    /// Aggregate view of the persisted quote set.
    pub fn quote_summary(sweep: &Sweep) -> QuoteSummary {
        QuoteSummary {
            input_value_usd: sweep.input_value_usd(),
            output_value_usd: sweep.legs.iter().map(|l| l.quote.output_value_usd).sum(),
            total_gas_usd: sweep.legs.iter().map(|l| l.quote.estimated_gas_usd).sum(),
            legs: sweep.legs.len(),
            expires_at: sweep
                .legs
                .iter()
                .map(|l| l.quote.expires_at)
                .min()
                .unwrap_or(0),
        }
    }

    // -- Quoting -> Signing -----------------------------------------------

    /// Move to Signing, rejecting a quote set that has already expired —
    /// a stale quote must be re-quoted, never presented for signature.
    pub async fn begin_signing(&self, sweep_id: &str) -> Result<Sweep, SweepError> {
        let mut sweep = self.load(sweep_id).await?;
        self.check_edge(&sweep, SweepStatus::Signing)?;
        self.reject_expired(&sweep)?;

        sweep.status = SweepStatus::Signing;
        sweep.updated_at = Utc::now();
        self.apply(&sweep, SweepStatus::Quoting).await?;
        Ok(sweep)
    }

    // -- Signing -> Submitted ---------------------------------------------

    /// Accept a signed authorization and enqueue execution.
    ///
    /// Order matters: admission and validation reject synchronously before
    /// any state mutation; the status flips to Submitted before any job is
    /// enqueued, so an execution job can never observe an unsigned sweep.
    pub async fn submit(
        &self,
        sweep_id: &str,
        auth: &PaymentAuthorization,
    ) -> Result<Sweep, SweepError> {
        let mut sweep = self.load(sweep_id).await?;
        self.check_edge(&sweep, SweepStatus::Submitted)?;

        self.gate.admit(auth, Utc::now())?;
        self.reject_expired(&sweep)?;
        if sweep.legs.iter().any(|l| !l.quote.has_execution_data()) {
            return Err(SweepError::MissingExecutionData);
        }

        sweep.status = SweepStatus::Submitted;
        sweep.updated_at = Utc::now();
        self.apply(&sweep, SweepStatus::Signing).await?;

        for (idx, leg) in sweep.legs.iter().enumerate() {
            // Dependent legs wait for their prerequisite to confirm.
            if leg.depends_on.is_some() {
                continue;
            }
            self.queue
                .enqueue(
                    QueueName::Execution,
                    &execution_identity(&sweep.id, idx),
                    json!(ExecuteLegPayload {
                        sweep_id: sweep.id.clone(),
                        leg_index: idx,
                    }),
                )
                .await
                .map_err(|e| SweepError::Storage(e.to_string()))?;
        }

        info!(
            sweep_id = %sweep.id,
            legs = sweep.legs.len(),
            "Sweep submitted, execution enqueued"
        );
        Ok(sweep)
    }

    // -- Cancellation -----------------------------------------------------

    /// User-initiated cancel; only reachable before submission.
    pub async fn cancel(&self, sweep_id: &str) -> Result<Sweep, SweepError> {
        let mut sweep = self.load(sweep_id).await?;
        self.check_edge(&sweep, SweepStatus::Cancelled)?;

        let expected = sweep.status;
        sweep.status = SweepStatus::Cancelled;
        sweep.updated_at = Utc::now();
        sweep.completed_at = Some(sweep.updated_at);
        self.apply(&sweep, expected).await?;

        info!(sweep_id = %sweep.id, "Sweep cancelled");
        Ok(sweep)
    }

    // -- Completion -------------------------------------------------------

    /// Wait until the sweep reaches a terminal status. A timeout does not
    /// cancel anything — tracking continues and state still lands.
    pub async fn await_settlement(
        &self,
        sweep_id: &str,
        timeout: Duration,
    ) -> Result<Sweep, SweepError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let sweep = self.load(sweep_id).await?;
            if sweep.status.is_terminal() {
                return Ok(sweep);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(SweepError::Timeout {
                    job_id: sweep_id.to_string(),
                });
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    // -- Scheduler --------------------------------------------------------

    /// One background pass: re-drive settlement tracking for in-flight
    /// legs and prune terminal jobs and expired nonces. Tracking jobs are
    /// single-attempt by policy; this is the external re-drive loop.
    pub async fn tick(&self) -> Result<(), SweepError> {
        let submitted = self
            .store
            .sweeps_with_status(SweepStatus::Submitted)
            .await
            .map_err(|e| SweepError::Storage(e.to_string()))?;

        for sweep in submitted {
            for (idx, leg) in sweep.legs.iter().enumerate() {
                if leg.status != crate::types::LegStatus::Submitted || leg.tx_hash.is_none() {
                    continue;
                }
                let identity = tracking_identity(&sweep.id, idx);
                let existing = self
                    .queue
                    .get(QueueName::Tracking, &identity)
                    .await
                    .map_err(|e| SweepError::Storage(e.to_string()))?;

                let polls = match &existing {
                    Some(job) if !job.status.is_terminal() => continue,
                    Some(job) => job.payload["polls"].as_u64().unwrap_or(0) as u32 + 1,
                    None => 1,
                };

                self.queue
                    .enqueue_delayed(
                        QueueName::Tracking,
                        &identity,
                        json!(TrackLegPayload {
                            sweep_id: sweep.id.clone(),
                            leg_index: idx,
                            polls,
                        }),
                        self.settings.swap_track_delay,
                    )
                    .await
                    .map_err(|e| SweepError::Storage(e.to_string()))?;
            }
        }

        // Keep prices warm for every token the scanners have seen; the
        // deterministic identity makes this a cheap no-op while a refresh
        // is still in flight.
        let tracked = self
            .store
            .tracked_tokens()
            .await
            .map_err(|e| SweepError::Storage(e.to_string()))?;
        for (chain, token) in tracked {
            self.queue
                .enqueue(
                    QueueName::Prices,
                    &jobs::price_identity(chain, &token),
                    json!(jobs::RefreshPricePayload { token, chain }),
                )
                .await
                .map_err(|e| SweepError::Storage(e.to_string()))?;
        }

        self.queue
            .prune(self.settings.job_retention)
            .await
            .map_err(|e| SweepError::Storage(e.to_string()))?;
        self.gate.prune_expired(Utc::now());
        Ok(())
    }

    // -- Internals --------------------------------------------------------

    async fn load(&self, sweep_id: &str) -> Result<Sweep, SweepError> {
        self.store
            .get_sweep(sweep_id)
            .await
            .map_err(|e| SweepError::Storage(e.to_string()))?
            .ok_or_else(|| SweepError::SweepNotFound(sweep_id.to_string()))
    }

    fn check_edge(&self, sweep: &Sweep, to: SweepStatus) -> Result<(), SweepError> {
        if !sweep.status.allows_transition_to(to) {
            return Err(SweepError::InvalidTransition {
                from: sweep.status,
                to,
            });
        }
        Ok(())
    }

    fn reject_expired(&self, sweep: &Sweep) -> Result<(), SweepError> {
        let now = Utc::now();
        if let Some(expired) = sweep.legs.iter().find(|l| l.quote.is_expired(now)) {
            return Err(SweepError::QuoteExpired {
                aggregator: expired.quote.aggregator.clone(),
                expires_at: expired.quote.expires_at,
            });
        }
        Ok(())
    }

    async fn apply(&self, sweep: &Sweep, expected: SweepStatus) -> Result<(), SweepError> {
        let applied = self
            .store
            .transition_sweep(sweep, expected)
            .await
            .map_err(|e| SweepError::Storage(e.to_string()))?;
        if !applied {
            // A concurrent transition won; surface it as an illegal edge
            // from the caller's point of view.
            return Err(SweepError::InvalidTransition {
                from: expected,
                to: sweep.status,
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregators::metadata::TokenMetadataCache;
    use crate::aggregators::QuoteAggregator;
    use crate::config::QueueConfig;
    use crate::gate::{AllowAllVerifier, PaymentGate};
    use crate::oracle::{OracleSettings, PriceOracle};
    use crate::types::{Chain, DexQuote, LegStatus};
    use anyhow::Result as AnyResult;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use sqlx::sqlite::SqlitePoolOptions;

    /// Stub adapter: serves every chain, binds calldata only when asked
    /// for execution data, quotes expire `ttl_offset_secs` from now.
    struct StubAggregator {
        ttl_offset_secs: i64,
        provide_calldata: bool,
        no_route: bool,
    }

    #[async_trait]
    impl QuoteAggregator for StubAggregator {
        fn name(&self) -> &str {
            "stub"
        }

        fn is_available(&self, _chain: Chain) -> bool {
            true
        }

        async fn get_quote(&self, request: &QuoteRequest) -> AnyResult<Option<DexQuote>> {
            if self.no_route {
                return Ok(None);
            }
            let kind = match request.dest_chain.filter(|d| *d != request.chain) {
                Some(dest_chain) => QuoteKind::Bridge { dest_chain },
                None => QuoteKind::Swap,
            };
            Ok(Some(DexQuote {
                aggregator: "stub".into(),
                chain: request.chain,
                kind,
                input_token: request.input_token.clone(),
                output_token: request.output_token.clone(),
                input_amount: request.input_amount,
                output_amount: request.input_amount - request.input_amount / 100,
                output_value_usd: dec!(0.50),
                price_impact_pct: dec!(0.1),
                estimated_gas_usd: dec!(0.02),
                slippage_tolerance: request.slippage_tolerance,
                expires_at: Utc::now().timestamp() + self.ttl_offset_secs,
                route: "stub".into(),
                input_symbol: None,
                output_symbol: None,
                calldata: (self.provide_calldata && request.include_execution_data)
                    .then(|| "0xsigned".to_string()),
            }))
        }
    }

    async fn orchestrator(stub: StubAggregator) -> (SweepOrchestrator, Arc<Store>, Arc<JobQueue>) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = Arc::new(Store::new(pool.clone()));
        store.migrate().await.unwrap();
        let cfg: QueueConfig = toml::from_str("").unwrap();
        let queue = Arc::new(JobQueue::new(pool, &cfg));
        queue.migrate().await.unwrap();

        let selector = Arc::new(QuoteSelector::new(
            vec![Arc::new(stub)],
            Arc::new(PriceOracle::new(vec![], OracleSettings::default())),
            Arc::new(TokenMetadataCache::cache_only()),
        ));
        let gate = Arc::new(PaymentGate::new(Arc::new(AllowAllVerifier), true));

        let orch = SweepOrchestrator::new(
            store.clone(),
            queue.clone(),
            selector,
            gate,
            OrchestratorSettings::default(),
        );
        (orch, store, queue)
    }

    fn good_stub() -> StubAggregator {
        StubAggregator {
            ttl_offset_secs: 120,
            provide_calldata: true,
            no_route: false,
        }
    }

    fn inputs() -> Vec<SweepInput> {
        vec![SweepInput {
            chain: Chain::Ethereum,
            token: "0xdust".into(),
            symbol: "DUST".into(),
            amount: 300_000,
            value_usd: dec!(0.30),
        }]
    }

    fn auth(nonce: &str) -> PaymentAuthorization {
        let now = Utc::now().timestamp();
        PaymentAuthorization {
            wallet: "0xwallet".into(),
            nonce: nonce.into(),
            valid_after: now - 10,
            valid_before: now + 300,
            signature: "0xsig".into(),
        }
    }

    #[tokio::test]
    async fn test_create_rejects_empty_inputs() {
        let (orch, _, _) = orchestrator(good_stub()).await;
        let err = orch
            .create_sweep("0xwallet", vec![], "0xusdc", Chain::Base, Some(6))
            .await
            .unwrap_err();
        assert!(matches!(err, SweepError::EmptySweep));
    }

    #[tokio::test]
    async fn test_create_rejects_zero_amount() {
        let (orch, _, _) = orchestrator(good_stub()).await;
        let mut bad = inputs();
        bad[0].amount = 0;
        let err = orch
            .create_sweep("0xwallet", bad, "0xusdc", Chain::Base, Some(6))
            .await
            .unwrap_err();
        assert!(matches!(err, SweepError::EmptySweep));
    }

    #[tokio::test]
    async fn test_happy_path_to_submitted() {
        let (orch, store, queue) = orchestrator(good_stub()).await;
        let sweep = orch
            .create_sweep("0xwallet", inputs(), "0xusdc", Chain::Base, Some(6))
            .await
            .unwrap();

        let sweep = orch.request_quotes(&sweep.id).await.unwrap();
        assert_eq!(sweep.status, SweepStatus::Quoting);
        // Cross-chain input: a bridge leg lands the output token directly.
        assert_eq!(sweep.legs.len(), 1);
        assert!(matches!(
            sweep.legs[0].quote.kind,
            QuoteKind::Bridge { dest_chain: Chain::Base }
        ));

        let sweep = orch.begin_signing(&sweep.id).await.unwrap();
        assert_eq!(sweep.status, SweepStatus::Signing);

        let sweep = orch.submit(&sweep.id, &auth("n1")).await.unwrap();
        assert_eq!(sweep.status, SweepStatus::Submitted);

        let stored = store.get_sweep(&sweep.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SweepStatus::Submitted);
        assert_eq!(queue.open_count(QueueName::Execution).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_quote_summary_aggregates() {
        let (orch, _, _) = orchestrator(good_stub()).await;
        let sweep = orch
            .create_sweep("0xwallet", inputs(), "0xusdc", Chain::Base, Some(6))
            .await
            .unwrap();
        let sweep = orch.request_quotes(&sweep.id).await.unwrap();

        let summary = SweepOrchestrator::quote_summary(&sweep);
        assert_eq!(summary.legs, 1);
        assert_eq!(summary.input_value_usd, dec!(0.30));
        assert_eq!(summary.total_gas_usd, dec!(0.02));
        assert!(summary.expires_at > Utc::now().timestamp());
    }

    #[tokio::test]
    async fn test_expired_quote_rejected_at_signing() {
        let (orch, store, _) = orchestrator(StubAggregator {
            ttl_offset_secs: -5,
            provide_calldata: true,
            no_route: false,
        })
        .await;
        let sweep = orch
            .create_sweep("0xwallet", inputs(), "0xusdc", Chain::Base, Some(6))
            .await
            .unwrap();
        orch.request_quotes(&sweep.id).await.unwrap();

        let err = orch.begin_signing(&sweep.id).await.unwrap_err();
        assert!(matches!(err, SweepError::QuoteExpired { .. }));

        // The sweep stays in Quoting for a re-quote, never executes stale.
        let stored = store.get_sweep(&sweep.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SweepStatus::Quoting);
    }

    #[tokio::test]
    async fn test_re_quote_replaces_expired_legs() {
        let (orch, _, _) = orchestrator(StubAggregator {
            ttl_offset_secs: -5,
            provide_calldata: true,
            no_route: false,
        })
        .await;
        let sweep = orch
            .create_sweep("0xwallet", inputs(), "0xusdc", Chain::Base, Some(6))
            .await
            .unwrap();
        orch.request_quotes(&sweep.id).await.unwrap();
        assert!(orch.begin_signing(&sweep.id).await.is_err());

        // The stub still quotes in the past, but re_quote itself succeeds
        // and rebuilds the leg set in place.
        let sweep = orch.re_quote(&sweep.id).await.unwrap();
        assert_eq!(sweep.status, SweepStatus::Quoting);
        assert_eq!(sweep.legs.len(), 1);
    }

    #[tokio::test]
    async fn test_no_route_leaves_sweep_pending() {
        let (orch, store, _) = orchestrator(StubAggregator {
            ttl_offset_secs: 120,
            provide_calldata: true,
            no_route: true,
        })
        .await;
        let sweep = orch
            .create_sweep("0xwallet", inputs(), "0xusdc", Chain::Base, Some(6))
            .await
            .unwrap();

        let err = orch.request_quotes(&sweep.id).await.unwrap_err();
        assert!(matches!(err, SweepError::NoRoute { .. }));

        let stored = store.get_sweep(&sweep.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SweepStatus::Pending);
    }

    #[tokio::test]
    async fn test_submit_out_of_order_rejected() {
        let (orch, _, queue) = orchestrator(good_stub()).await;
        let sweep = orch
            .create_sweep("0xwallet", inputs(), "0xusdc", Chain::Base, Some(6))
            .await
            .unwrap();

        let err = orch.submit(&sweep.id, &auth("n1")).await.unwrap_err();
        assert!(matches!(err, SweepError::InvalidTransition { .. }));
        assert_eq!(queue.open_count(QueueName::Execution).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_missing_execution_data_rejected_at_submit() {
        let (orch, store, queue) = orchestrator(StubAggregator {
            ttl_offset_secs: 120,
            provide_calldata: false,
            no_route: false,
        })
        .await;
        let sweep = orch
            .create_sweep("0xwallet", inputs(), "0xusdc", Chain::Base, Some(6))
            .await
            .unwrap();
        orch.request_quotes(&sweep.id).await.unwrap();
        orch.begin_signing(&sweep.id).await.unwrap();

        let err = orch.submit(&sweep.id, &auth("n1")).await.unwrap_err();
        assert!(matches!(err, SweepError::MissingExecutionData));

        // Rejected synchronously: no state mutation, no jobs.
        let stored = store.get_sweep(&sweep.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SweepStatus::Signing);
        assert_eq!(queue.open_count(QueueName::Execution).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_nonce_replay_rejected_across_sweeps() {
        let (orch, store, _) = orchestrator(good_stub()).await;

        let first = orch
            .create_sweep("0xwallet", inputs(), "0xusdc", Chain::Base, Some(6))
            .await
            .unwrap();
        orch.request_quotes(&first.id).await.unwrap();
        orch.begin_signing(&first.id).await.unwrap();
        orch.submit(&first.id, &auth("shared-nonce")).await.unwrap();

        let second = orch
            .create_sweep("0xwallet", inputs(), "0xusdc", Chain::Base, Some(6))
            .await
            .unwrap();
        orch.request_quotes(&second.id).await.unwrap();
        orch.begin_signing(&second.id).await.unwrap();

        let err = orch
            .submit(&second.id, &auth("shared-nonce"))
            .await
            .unwrap_err();
        assert!(matches!(err, SweepError::NonceAlreadyUsed(_)));

        let stored = store.get_sweep(&second.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SweepStatus::Signing);
    }

    #[tokio::test]
    async fn test_cancel_before_submission() {
        let (orch, _, _) = orchestrator(good_stub()).await;
        let sweep = orch
            .create_sweep("0xwallet", inputs(), "0xusdc", Chain::Base, Some(6))
            .await
            .unwrap();
        orch.request_quotes(&sweep.id).await.unwrap();

        let sweep = orch.cancel(&sweep.id).await.unwrap();
        assert_eq!(sweep.status, SweepStatus::Cancelled);
        assert!(sweep.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_cancel_after_submission_rejected() {
        let (orch, _, _) = orchestrator(good_stub()).await;
        let sweep = orch
            .create_sweep("0xwallet", inputs(), "0xusdc", Chain::Base, Some(6))
            .await
            .unwrap();
        orch.request_quotes(&sweep.id).await.unwrap();
        orch.begin_signing(&sweep.id).await.unwrap();
        orch.submit(&sweep.id, &auth("n1")).await.unwrap();

        let err = orch.cancel(&sweep.id).await.unwrap_err();
        assert!(matches!(
            err,
            SweepError::InvalidTransition {
                from: SweepStatus::Submitted,
                to: SweepStatus::Cancelled,
            }
        ));
    }

    #[tokio::test]
    async fn test_same_chain_input_gets_swap_leg() {
        let (orch, _, _) = orchestrator(good_stub()).await;
        let mut same_chain = inputs();
        same_chain[0].chain = Chain::Base;
        let sweep = orch
            .create_sweep("0xwallet", same_chain, "0xusdc", Chain::Base, Some(6))
            .await
            .unwrap();

        let sweep = orch.request_quotes(&sweep.id).await.unwrap();
        assert_eq!(sweep.legs.len(), 1);
        assert_eq!(sweep.legs[0].quote.kind, QuoteKind::Swap);
    }

    #[tokio::test]
    async fn test_legs_status_start_pending() {
        let (orch, _, _) = orchestrator(good_stub()).await;
        let sweep = orch
            .create_sweep("0xwallet", inputs(), "0xusdc", Chain::Base, Some(6))
            .await
            .unwrap();
        let sweep = orch.request_quotes(&sweep.id).await.unwrap();
        assert!(sweep.legs.iter().all(|l| l.status == LegStatus::Pending));
    }
}
