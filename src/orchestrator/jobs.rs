//! Orchestrator job payloads and the queue handler.
//!
//! Execution jobs broadcast a leg's bound calldata; tracking jobs poll the
//! settlement target and fold per-leg outcomes into the sweep aggregate;
//! price jobs refresh the oracle cache. Job identities derive from
//! (sweep, leg) so redelivery of the same logical work dedups in the
//! queue, and handlers are written to be safe under at-least-once
//! delivery anyway.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

use crate::oracle::PriceOracle;
use crate::orchestrator::OrchestratorSettings;
use crate::queue::{JobHandler, JobQueue, JobRecord, QueueName};
use crate::settlement::SettlementTarget;
use crate::storage::Store;
use crate::types::{
    Chain, LegStatus, QuoteKind, ReceiptStatus, Sweep, SweepError, SweepStatus,
};

// ---------------------------------------------------------------------------
// Payloads and identities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteLegPayload {
    pub sweep_id: String,
    pub leg_index: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackLegPayload {
    pub sweep_id: String,
    pub leg_index: usize,
    /// How many polls this leg has seen, across re-drives.
    pub polls: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshPricePayload {
    pub token: String,
    pub chain: Chain,
}

pub fn execution_identity(sweep_id: &str, leg_index: usize) -> String {
    format!("exec:{sweep_id}:{leg_index}")
}

pub fn tracking_identity(sweep_id: &str, leg_index: usize) -> String {
    format!("track:{sweep_id}:{leg_index}")
}

pub fn price_identity(chain: Chain, token: &str) -> String {
    format!("price:{chain}:{}", token.to_lowercase())
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// Executes queued work for all three queues. One instance is shared by
/// the worker loop; jobs for the same sweep run sequentially within it.
pub struct EngineJobHandler {
    store: Arc<Store>,
    queue: Arc<JobQueue>,
    settlement: Arc<dyn SettlementTarget>,
    oracle: Arc<PriceOracle>,
    settings: OrchestratorSettings,
}

impl EngineJobHandler {
    pub fn new(
        store: Arc<Store>,
        queue: Arc<JobQueue>,
        settlement: Arc<dyn SettlementTarget>,
        oracle: Arc<PriceOracle>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            store,
            queue,
            settlement,
            oracle,
            settings,
        }
    }

    // -- Execution --------------------------------------------------------

    /// Broadcast one leg's bound calldata and schedule its tracking.
    async fn execute_leg(&self, payload: ExecuteLegPayload) -> Result<Value> {
        let mut sweep = self.load_sweep(&payload.sweep_id).await?;
        let leg = sweep
            .legs
            .get(payload.leg_index)
            .with_context(|| format!("Sweep {} has no leg {}", sweep.id, payload.leg_index))?;

        // At-least-once delivery: a leg past Pending is already handled.
        if leg.status != LegStatus::Pending {
            return Ok(json!({ "status": "noop", "leg_status": leg.status.to_string() }));
        }

        let calldata = leg
            .quote
            .calldata
            .clone()
            .ok_or(SweepError::MissingExecutionData)?;
        let is_bridge = matches!(leg.quote.kind, QuoteKind::Bridge { .. });
        let chain = leg.chain;

        // A failed broadcast surfaces as Err and is retried by the
        // execution queue's backoff policy.
        let tx_hash = self
            .settlement
            .submit(chain, &calldata, &sweep.wallet)
            .await?;

        let leg = &mut sweep.legs[payload.leg_index];
        leg.status = LegStatus::Submitted;
        leg.tx_hash = Some(tx_hash.clone());
        sweep.updated_at = Utc::now();
        self.store.save_sweep(&sweep).await?;

        let delay = if is_bridge {
            self.settings.bridge_track_delay
        } else {
            self.settings.swap_track_delay
        };
        self.queue
            .enqueue_delayed(
                QueueName::Tracking,
                &tracking_identity(&sweep.id, payload.leg_index),
                json!(TrackLegPayload {
                    sweep_id: sweep.id.clone(),
                    leg_index: payload.leg_index,
                    polls: 1,
                }),
                delay,
            )
            .await?;

        info!(
            sweep_id = %sweep.id,
            leg = payload.leg_index,
            %chain,
            tx_hash = %tx_hash,
            bridge = is_bridge,
            "Leg submitted"
        );
        Ok(json!({ "status": "submitted", "tx_hash": tx_hash }))
    }

    // -- Tracking ---------------------------------------------------------

    /// Poll one submitted leg. Single-attempt by queue policy; the
    /// scheduler re-drives it while the receipt stays pending.
    async fn track_leg(&self, payload: TrackLegPayload) -> Result<Value> {
        let mut sweep = self.load_sweep(&payload.sweep_id).await?;
        let leg = sweep
            .legs
            .get(payload.leg_index)
            .with_context(|| format!("Sweep {} has no leg {}", sweep.id, payload.leg_index))?;

        if leg.status != LegStatus::Submitted {
            return Ok(json!({ "status": "noop", "leg_status": leg.status.to_string() }));
        }
        let tx_hash = leg
            .tx_hash
            .clone()
            .with_context(|| format!("Submitted leg {} has no tx hash", payload.leg_index))?;

        let receipt = self.settlement.receipt(leg.chain, &tx_hash).await?;

        match receipt.status {
            ReceiptStatus::Pending => {
                if payload.polls >= self.settings.max_track_polls {
                    warn!(
                        sweep_id = %sweep.id,
                        leg = payload.leg_index,
                        polls = payload.polls,
                        "Leg confirmation timed out"
                    );
                    self.fail_leg(&mut sweep, payload.leg_index, "confirmation timeout")
                        .await?;
                    Ok(json!({ "status": "timeout", "polls": payload.polls }))
                } else {
                    Ok(json!({ "status": "pending", "polls": payload.polls }))
                }
            }
            ReceiptStatus::Confirmed => {
                sweep.legs[payload.leg_index].status = LegStatus::Confirmed;
                info!(
                    sweep_id = %sweep.id,
                    leg = payload.leg_index,
                    tx_hash = %tx_hash,
                    "Leg confirmed"
                );

                self.enqueue_dependents(&sweep, payload.leg_index).await?;
                self.finalize(&mut sweep).await?;
                Ok(json!({ "status": "confirmed" }))
            }
            ReceiptStatus::Reverted => {
                let detail = receipt
                    .details
                    .unwrap_or_else(|| "execution reverted".into());
                warn!(
                    sweep_id = %sweep.id,
                    leg = payload.leg_index,
                    tx_hash = %tx_hash,
                    detail = %detail,
                    "Leg reverted"
                );
                self.fail_leg(&mut sweep, payload.leg_index, &detail).await?;
                Ok(json!({ "status": "reverted" }))
            }
        }
    }

    /// Execution for legs gated on this one becomes eligible now.
    async fn enqueue_dependents(&self, sweep: &Sweep, confirmed_index: usize) -> Result<()> {
        for (idx, leg) in sweep.legs.iter().enumerate() {
            if leg.depends_on == Some(confirmed_index) && leg.status == LegStatus::Pending {
                self.queue
                    .enqueue(
                        QueueName::Execution,
                        &execution_identity(&sweep.id, idx),
                        json!(ExecuteLegPayload {
                            sweep_id: sweep.id.clone(),
                            leg_index: idx,
                        }),
                    )
                    .await?;
                info!(sweep_id = %sweep.id, leg = idx, after = confirmed_index, "Dependent leg enqueued");
            }
        }
        Ok(())
    }

    async fn fail_leg(&self, sweep: &mut Sweep, leg_index: usize, detail: &str) -> Result<()> {
        sweep.legs[leg_index].status = LegStatus::Failed;
        sweep.legs[leg_index].error = Some(detail.to_string());

        // Legs waiting on a failed prerequisite can never run.
        let failed_indices: Vec<usize> = sweep
            .legs
            .iter()
            .enumerate()
            .filter(|(_, l)| l.status == LegStatus::Failed)
            .map(|(i, _)| i)
            .collect();
        for leg in sweep.legs.iter_mut() {
            if leg.status == LegStatus::Pending
                && leg.depends_on.is_some_and(|d| failed_indices.contains(&d))
            {
                leg.status = LegStatus::Failed;
                leg.error = Some("prerequisite leg failed".into());
            }
        }

        self.finalize(sweep).await
    }

    /// Fold leg outcomes into the sweep aggregate. Confirmed only when
    /// every leg confirmed; Failed as soon as any leg failed and nothing
    /// is still in flight. Settled legs are never rolled back.
    async fn finalize(&self, sweep: &mut Sweep) -> Result<()> {
        let total = sweep.legs.len();
        let (confirmed, failed) = sweep.leg_tally();
        let in_flight = total - confirmed - failed;

        sweep.updated_at = Utc::now();

        if confirmed == total {
            sweep.status = SweepStatus::Confirmed;
            sweep.completed_at = Some(sweep.updated_at);
            sweep.output_amount = Some(
                sweep
                    .legs
                    .iter()
                    .filter(|l| l.quote.output_token == sweep.output_token)
                    .map(|l| l.quote.output_amount)
                    .sum(),
            );
            sweep.fee_paid_usd = sweep.legs.iter().map(|l| l.quote.estimated_gas_usd).sum();

            if !self.store.transition_sweep(sweep, SweepStatus::Submitted).await? {
                warn!(sweep_id = %sweep.id, "Sweep already finalized elsewhere");
            } else {
                info!(sweep_id = %sweep.id, legs = total, "Sweep confirmed");
            }
        } else if failed > 0 && in_flight == 0 {
            sweep.status = SweepStatus::Failed;
            sweep.completed_at = Some(sweep.updated_at);
            sweep.error = Some(format!("{confirmed} of {total} legs confirmed, {failed} failed"));

            if !self.store.transition_sweep(sweep, SweepStatus::Submitted).await? {
                warn!(sweep_id = %sweep.id, "Sweep already finalized elsewhere");
            } else {
                warn!(
                    sweep_id = %sweep.id,
                    confirmed,
                    failed,
                    "Sweep failed with partial settlement"
                );
            }
        } else {
            // Still in flight: persist leg detail without a status change.
            self.store.save_sweep(sweep).await?;
        }
        Ok(())
    }

    // -- Prices -----------------------------------------------------------

    async fn refresh_price(&self, payload: RefreshPricePayload) -> Result<Value> {
        let price = self.oracle.refresh(&payload.token, payload.chain).await?;
        Ok(json!({
            "price_usd": price.price_usd,
            "confidence": price.confidence.to_string(),
        }))
    }

    async fn load_sweep(&self, sweep_id: &str) -> Result<Sweep> {
        self.store
            .get_sweep(sweep_id)
            .await?
            .ok_or_else(|| SweepError::SweepNotFound(sweep_id.to_string()).into())
    }
}

#[async_trait::async_trait]
impl JobHandler for EngineJobHandler {
    async fn handle(&self, job: &JobRecord) -> Result<Value> {
        match job.queue {
            QueueName::Execution => {
                let payload: ExecuteLegPayload =
                    serde_json::from_value(job.payload.clone()).context("Bad execution payload")?;
                self.execute_leg(payload).await
            }
            QueueName::Tracking => {
                let payload: TrackLegPayload =
                    serde_json::from_value(job.payload.clone()).context("Bad tracking payload")?;
                self.track_leg(payload).await
            }
            QueueName::Prices => {
                let payload: RefreshPricePayload =
                    serde_json::from_value(job.payload.clone()).context("Bad price payload")?;
                self.refresh_price(payload).await
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
