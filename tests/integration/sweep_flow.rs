//! End-to-end sweep lifecycle tests.
//!
//! Drive the full create -> quote -> sign -> submit -> execute -> track
//! pipeline against the in-memory mock chain, asserting the state-machine
//! and partial-failure semantics a real deployment depends on.

use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

use duster::aggregators::metadata::TokenMetadataCache;
use duster::aggregators::{QuoteAggregator, QuoteSelector};
use duster::config::QueueConfig;
use duster::gate::{AllowAllVerifier, PaymentGate};
use duster::oracle::{OracleSettings, PriceOracle};
use duster::orchestrator::jobs::{execution_identity, EngineJobHandler};
use duster::orchestrator::{OrchestratorSettings, SweepOrchestrator};
use duster::queue::{JobQueue, QueueName};
use duster::storage::Store;
use duster::types::{
    Chain, LegStatus, PaymentAuthorization, ReceiptStatus, SweepError, SweepInput, SweepStatus,
};

use crate::mock_chain::{MockAggregator, MockSettlement};

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    orchestrator: SweepOrchestrator,
    handler: EngineJobHandler,
    store: Arc<Store>,
    queue: Arc<JobQueue>,
    settlement: Arc<MockSettlement>,
}

impl Harness {
    async fn new(aggregators: Vec<Arc<dyn QuoteAggregator>>, max_track_polls: u32) -> Self {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = Arc::new(Store::new(pool.clone()));
        store.migrate().await.unwrap();
        let queue_cfg: QueueConfig = toml::from_str("").unwrap();
        let queue = Arc::new(JobQueue::new(pool, &queue_cfg));
        queue.migrate().await.unwrap();

        let oracle = Arc::new(PriceOracle::new(vec![], OracleSettings::default()));
        let selector = Arc::new(QuoteSelector::new(
            aggregators,
            oracle.clone(),
            Arc::new(TokenMetadataCache::cache_only()),
        ));
        let gate = Arc::new(PaymentGate::new(Arc::new(AllowAllVerifier), true));
        let settings = OrchestratorSettings {
            swap_track_delay: Duration::ZERO,
            bridge_track_delay: Duration::ZERO,
            max_track_polls,
            ..OrchestratorSettings::default()
        };

        let settlement = Arc::new(MockSettlement::new());
        let orchestrator = SweepOrchestrator::new(
            store.clone(),
            queue.clone(),
            selector,
            gate,
            settings.clone(),
        );
        let handler = EngineJobHandler::new(
            store.clone(),
            queue.clone(),
            settlement.clone(),
            oracle,
            settings,
        );

        Self {
            orchestrator,
            handler,
            store,
            queue,
            settlement,
        }
    }

    /// Worker passes until the queue has nothing due.
    async fn run_until_idle(&self) {
        while self.queue.run_due(&self.handler, 16).await.unwrap() > 0 {}
    }

    /// create -> quote -> sign -> submit with a fresh nonce.
    async fn submitted_sweep(&self, inputs: Vec<SweepInput>, nonce: &str) -> String {
        let sweep = self
            .orchestrator
            .create_sweep("0xwallet", inputs, "0xusdc", Chain::Base, Some(6))
            .await
            .unwrap();
        self.orchestrator.request_quotes(&sweep.id).await.unwrap();
        self.orchestrator.begin_signing(&sweep.id).await.unwrap();
        self.orchestrator.submit(&sweep.id, &auth(nonce)).await.unwrap();
        sweep.id
    }
}

fn auth(nonce: &str) -> PaymentAuthorization {
    let now = chrono::Utc::now().timestamp();
    PaymentAuthorization {
        wallet: "0xwallet".into(),
        nonce: nonce.into(),
        valid_after: now - 10,
        valid_before: now + 600,
        signature: "0xsig".into(),
    }
}

fn input(chain: Chain, token: &str, amount: u128) -> SweepInput {
    SweepInput {
        chain,
        token: token.into(),
        symbol: token.trim_start_matches("0x").to_uppercase(),
        amount,
        value_usd: dec!(0.50),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_single_chain_sweep_confirms() {
    let h = Harness::new(vec![Arc::new(MockAggregator::new("mock"))], 40).await;
    h.settlement.set_receipt(Chain::Base, ReceiptStatus::Confirmed);

    let id = h
        .submitted_sweep(vec![input(Chain::Base, "0xdust", 300_000)], "n1")
        .await;
    h.run_until_idle().await;

    let sweep = h
        .orchestrator
        .await_settlement(&id, Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(sweep.status, SweepStatus::Confirmed);
    assert_eq!(sweep.legs.len(), 1);
    assert_eq!(sweep.legs[0].status, LegStatus::Confirmed);
    assert_eq!(sweep.output_amount, Some(297_000));
    assert_eq!(sweep.fee_paid_usd, dec!(0.03));
    assert!(sweep.completed_at.is_some());
    assert_eq!(h.settlement.submit_count(), 1);
}

#[tokio::test]
async fn test_partial_failure_keeps_settled_leg() {
    // Two-chain consolidation: the Ethereum bridge leg confirms, the
    // Polygon leg never does and times out. The sweep fails overall but
    // the settled leg is not rolled back.
    let h = Harness::new(vec![Arc::new(MockAggregator::new("mock"))], 1).await;
    h.settlement.set_receipt(Chain::Ethereum, ReceiptStatus::Confirmed);
    h.settlement.set_receipt(Chain::Polygon, ReceiptStatus::Pending);

    let id = h
        .submitted_sweep(
            vec![
                input(Chain::Ethereum, "0xdust_a", 300_000),
                input(Chain::Polygon, "0xdust_b", 400_000),
            ],
            "n1",
        )
        .await;
    h.run_until_idle().await;

    let sweep = h.store.get_sweep(&id).await.unwrap().unwrap();
    assert_eq!(sweep.status, SweepStatus::Failed);

    let eth_leg = sweep.legs.iter().find(|l| l.chain == Chain::Ethereum).unwrap();
    let pol_leg = sweep.legs.iter().find(|l| l.chain == Chain::Polygon).unwrap();
    assert_eq!(eth_leg.status, LegStatus::Confirmed);
    assert_eq!(pol_leg.status, LegStatus::Failed);
    assert!(pol_leg.error.as_deref().unwrap().contains("timeout"));
    assert!(sweep.error.as_deref().unwrap().contains("1 of 2"));
}

#[tokio::test]
async fn test_redelivered_execution_broadcasts_once() {
    let h = Harness::new(vec![Arc::new(MockAggregator::new("mock"))], 40).await;
    h.settlement.set_receipt(Chain::Base, ReceiptStatus::Confirmed);

    let id = h
        .submitted_sweep(vec![input(Chain::Base, "0xdust", 300_000)], "n1")
        .await;
    h.run_until_idle().await;
    assert_eq!(h.settlement.submit_count(), 1);

    // Re-driving the same execution identity revives the job, but the
    // handler sees the leg already settled and broadcasts nothing.
    h.queue
        .enqueue(
            QueueName::Execution,
            &execution_identity(&id, 0),
            serde_json::json!({"sweep_id": id, "leg_index": 0}),
        )
        .await
        .unwrap();
    h.run_until_idle().await;

    assert_eq!(h.settlement.submit_count(), 1);
    let sweep = h.store.get_sweep(&id).await.unwrap().unwrap();
    assert_eq!(sweep.status, SweepStatus::Confirmed);
}

#[tokio::test]
async fn test_transient_broadcast_failure_retries() {
    let h = Harness::new(vec![Arc::new(MockAggregator::new("mock"))], 40).await;
    h.settlement.set_receipt(Chain::Base, ReceiptStatus::Confirmed);
    h.settlement.fail_submits_on(Chain::Base);

    let id = h
        .submitted_sweep(vec![input(Chain::Base, "0xdust", 300_000)], "n1")
        .await;
    h.run_until_idle().await;

    // First attempt failed; the job is waiting out its backoff and the
    // leg is untouched.
    assert_eq!(h.settlement.submit_count(), 0);
    let sweep = h.store.get_sweep(&id).await.unwrap().unwrap();
    assert_eq!(sweep.status, SweepStatus::Submitted);
    assert_eq!(sweep.legs[0].status, LegStatus::Pending);

    // Outage ends; after the backoff the retry goes through.
    h.settlement.clear_submit_failures();
    tokio::time::sleep(Duration::from_millis(2_200)).await;
    h.run_until_idle().await;

    let sweep = h
        .orchestrator
        .await_settlement(&id, Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(sweep.status, SweepStatus::Confirmed);
    assert_eq!(h.settlement.submit_count(), 1);
}

#[tokio::test]
async fn test_scheduler_redrives_tracking_until_ceiling() {
    let h = Harness::new(vec![Arc::new(MockAggregator::new("mock"))], 3).await;
    h.settlement.set_receipt(Chain::Base, ReceiptStatus::Pending);

    let id = h
        .submitted_sweep(vec![input(Chain::Base, "0xdust", 300_000)], "n1")
        .await;

    // Poll 1 (from execution), then two scheduler re-drives.
    h.run_until_idle().await;
    for _ in 0..2 {
        h.orchestrator.tick().await.unwrap();
        h.run_until_idle().await;
    }

    let sweep = h.store.get_sweep(&id).await.unwrap().unwrap();
    assert_eq!(sweep.status, SweepStatus::Failed);
    assert!(sweep.legs[0].error.as_deref().unwrap().contains("timeout"));
}

#[tokio::test]
async fn test_bridge_with_dependent_deposit_confirms_in_order() {
    // The bridge lands an intermediate token, so a destination-chain
    // deposit leg exists and may only run after the bridge confirms.
    let mut aggregator = MockAggregator::new("mock");
    aggregator.bridge_intermediate = Some("0xbridged".into());
    let h = Harness::new(vec![Arc::new(aggregator)], 40).await;
    h.settlement.set_receipt(Chain::Ethereum, ReceiptStatus::Confirmed);
    h.settlement.set_receipt(Chain::Base, ReceiptStatus::Confirmed);

    let id = h
        .submitted_sweep(vec![input(Chain::Ethereum, "0xdust", 300_000)], "n1")
        .await;

    // Only the bridge leg is enqueued at submission.
    let sweep = h.store.get_sweep(&id).await.unwrap().unwrap();
    assert_eq!(sweep.legs.len(), 2);
    assert_eq!(sweep.legs[1].depends_on, Some(0));
    assert_eq!(h.queue.open_count(QueueName::Execution).await.unwrap(), 1);

    h.run_until_idle().await;

    let sweep = h
        .orchestrator
        .await_settlement(&id, Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(sweep.status, SweepStatus::Confirmed);
    assert!(sweep.legs.iter().all(|l| l.status == LegStatus::Confirmed));
    assert_eq!(h.settlement.submit_count(), 2);
}

#[tokio::test]
async fn test_expired_quotes_never_reach_submission() {
    let mut aggregator = MockAggregator::new("mock");
    aggregator.quote_ttl_secs = -5;
    let h = Harness::new(vec![Arc::new(aggregator)], 40).await;

    let sweep = h
        .orchestrator
        .create_sweep(
            "0xwallet",
            vec![input(Chain::Base, "0xdust", 300_000)],
            "0xusdc",
            Chain::Base,
            Some(6),
        )
        .await
        .unwrap();
    h.orchestrator.request_quotes(&sweep.id).await.unwrap();

    let err = h.orchestrator.begin_signing(&sweep.id).await.unwrap_err();
    assert!(matches!(err, SweepError::QuoteExpired { .. }));

    // Nothing was enqueued and no broadcast happened.
    assert_eq!(h.queue.open_count(QueueName::Execution).await.unwrap(), 0);
    assert_eq!(h.settlement.submit_count(), 0);
}
