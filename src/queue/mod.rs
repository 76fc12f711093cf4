//! Durable job queue.
//!
//! SQLite-backed, at-least-once task queue with typed queues, per-queue
//! retry policy with exponential backoff, and deduplication by
//! deterministic job identity. Enqueue is idempotent: the same identity
//! while a job is pending or running is a no-op, and a terminal job with
//! that identity is revived instead — the scheduler uses revival to
//! re-drive settlement tracking.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::types::SweepError;

/// How often `await_job` re-reads the store while waiting.
const AWAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Backoff doubling is capped at this exponent to keep delays sane.
const MAX_BACKOFF_EXPONENT: u32 = 10;

// ---------------------------------------------------------------------------
// Queues and policies
// ---------------------------------------------------------------------------

/// The typed queues the engine uses. Each carries its own retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueName {
    /// Background price refresh: few attempts, fast backoff.
    Prices,
    /// Money-moving execution: a failed broadcast is recoverable, so the
    /// attempt ceiling is higher.
    Execution,
    /// Settlement tracking: single attempt, re-driven by the scheduler so
    /// backoff never compounds with chain confirmation latency.
    Tracking,
}

impl QueueName {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Prices => "prices",
            QueueName::Execution => "execution",
            QueueName::Tracking => "tracking",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for QueueName {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prices" => Ok(QueueName::Prices),
            "execution" => Ok(QueueName::Execution),
            "tracking" => Ok(QueueName::Tracking),
            _ => Err(anyhow::anyhow!("Unknown queue: {s}")),
        }
    }
}

/// Retry behaviour for one queue.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl RetryPolicy {
    /// Exponential backoff: base doubles per prior attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
        self.backoff_base * 2u32.pow(exponent)
    }
}

#[derive(Debug, Clone)]
pub struct QueuePolicies {
    pub prices: RetryPolicy,
    pub execution: RetryPolicy,
    pub tracking: RetryPolicy,
}

impl QueuePolicies {
    pub fn from_config(cfg: &QueueConfig) -> Self {
        Self {
            prices: RetryPolicy {
                max_attempts: cfg.price_attempts,
                backoff_base: Duration::from_secs(1),
            },
            execution: RetryPolicy {
                max_attempts: cfg.execution_attempts,
                backoff_base: Duration::from_secs(2),
            },
            tracking: RetryPolicy {
                max_attempts: 1,
                backoff_base: Duration::ZERO,
            },
        }
    }

    fn for_queue(&self, queue: QueueName) -> &RetryPolicy {
        match queue {
            QueueName::Prices => &self.prices,
            QueueName::Execution => &self.execution,
            QueueName::Tracking => &self.tracking,
        }
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::str::FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            _ => Err(anyhow::anyhow!("Unknown job status: {s}")),
        }
    }
}

/// One persisted unit of work. Identity (`queue`, `job_id`) derives from
/// business keys so identical logical work dedups.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub queue: QueueName,
    pub job_id: String,
    pub payload: Value,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub result: Option<Value>,
    pub next_run_at: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Handle returned by enqueue, usable with `await_job`.
#[derive(Debug, Clone)]
pub struct JobHandle {
    pub queue: QueueName,
    pub job_id: String,
}

/// Terminal result of a job.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Completed(Value),
    Failed(String),
}

/// Work executor plugged into `run_due`.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &JobRecord) -> Result<Value>;
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

pub struct JobQueue {
    pool: SqlitePool,
    policies: QueuePolicies,
}

impl JobQueue {
    pub fn new(pool: SqlitePool, cfg: &QueueConfig) -> Self {
        Self {
            pool,
            policies: QueuePolicies::from_config(cfg),
        }
    }

    /// Create the jobs table. Idempotent.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                queue           TEXT NOT NULL,
                job_id          TEXT NOT NULL,
                payload         TEXT NOT NULL,
                status          TEXT NOT NULL DEFAULT 'pending',
                attempts        INTEGER NOT NULL DEFAULT 0,
                max_attempts    INTEGER NOT NULL,
                last_error      TEXT,
                result          TEXT,
                next_run_at     INTEGER NOT NULL,
                created_at      INTEGER NOT NULL,
                updated_at      INTEGER NOT NULL,
                PRIMARY KEY (queue, job_id)
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create jobs table")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_due ON jobs (status, next_run_at)")
            .execute(&self.pool)
            .await
            .context("Failed to create jobs index")?;
        Ok(())
    }

    /// Enqueue immediately. See `enqueue_delayed`.
    pub async fn enqueue(
        &self,
        queue: QueueName,
        identity: &str,
        payload: Value,
    ) -> Result<JobHandle> {
        self.enqueue_delayed(queue, identity, payload, Duration::ZERO)
            .await
    }

    /// Enqueue with an initial delay.
    ///
    /// Idempotent under identical identity: while a job with this identity
    /// is pending or running nothing changes; a terminal job is revived
    /// with a fresh attempt budget and the new payload.
    pub async fn enqueue_delayed(
        &self,
        queue: QueueName,
        identity: &str,
        payload: Value,
        delay: Duration,
    ) -> Result<JobHandle> {
        let policy = self.policies.for_queue(queue);
        let now = Utc::now().timestamp_millis();
        let next_run_at = now + delay.as_millis() as i64;
        let payload_json = payload.to_string();

        let inserted = sqlx::query(
            r#"
            INSERT INTO jobs
                (queue, job_id, payload, status, attempts, max_attempts,
                 next_run_at, created_at, updated_at)
            VALUES (?1, ?2, ?3, 'pending', 0, ?4, ?5, ?6, ?6)
            ON CONFLICT (queue, job_id) DO NOTHING
            "#,
        )
        .bind(queue.as_str())
        .bind(identity)
        .bind(&payload_json)
        .bind(policy.max_attempts as i64)
        .bind(next_run_at)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to enqueue job")?
        .rows_affected();

        if inserted == 0 {
            // Identity exists. Revive only if terminal; in-flight work is
            // left untouched so the same logical operation never doubles.
            let revived = sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'pending', attempts = 0, payload = ?1,
                    last_error = NULL, result = NULL, next_run_at = ?2,
                    updated_at = ?3
                WHERE queue = ?4 AND job_id = ?5
                  AND status IN ('completed', 'failed')
                "#,
            )
            .bind(&payload_json)
            .bind(next_run_at)
            .bind(now)
            .bind(queue.as_str())
            .bind(identity)
            .execute(&self.pool)
            .await
            .context("Failed to revive job")?
            .rows_affected();

            if revived > 0 {
                debug!(%queue, job_id = identity, "Terminal job revived");
            } else {
                debug!(%queue, job_id = identity, "Enqueue deduplicated against in-flight job");
            }
        } else {
            debug!(%queue, job_id = identity, delay_ms = delay.as_millis() as u64, "Job enqueued");
        }

        Ok(JobHandle {
            queue,
            job_id: identity.to_string(),
        })
    }

    /// Read a job by identity.
    pub async fn get(&self, queue: QueueName, job_id: &str) -> Result<Option<JobRecord>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE queue = ?1 AND job_id = ?2")
            .bind(queue.as_str())
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to read job")?;
        row.map(|r| job_from_row(&r)).transpose()
    }

    /// Wait for a job to reach a terminal state.
    ///
    /// A timeout does not cancel the underlying job — it may still finish
    /// later and its effects still land.
    pub async fn await_job(
        &self,
        queue: QueueName,
        job_id: &str,
        timeout: Duration,
    ) -> Result<JobOutcome, SweepError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let job = self
                .get(queue, job_id)
                .await
                .map_err(|e| SweepError::Storage(e.to_string()))?;

            if let Some(job) = job {
                match job.status {
                    JobStatus::Completed => {
                        return Ok(JobOutcome::Completed(job.result.unwrap_or(Value::Null)))
                    }
                    JobStatus::Failed => {
                        return Ok(JobOutcome::Failed(
                            job.last_error.unwrap_or_else(|| "unknown failure".into()),
                        ))
                    }
                    _ => {}
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(SweepError::Timeout {
                    job_id: job_id.to_string(),
                });
            }
            tokio::time::sleep(AWAIT_POLL_INTERVAL).await;
        }
    }

    /// Claim due jobs and run them through the handler.
    ///
    /// Claimed jobs run sequentially; jobs touching the same sweep are
    /// thereby serialized within one worker. Returns how many jobs ran.
    pub async fn run_due(&self, handler: &dyn JobHandler, limit: u32) -> Result<usize> {
        let now = Utc::now().timestamp_millis();

        let rows = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'running', attempts = attempts + 1, updated_at = ?1
            WHERE (queue, job_id) IN (
                SELECT queue, job_id FROM jobs
                WHERE status = 'pending' AND next_run_at <= ?1
                ORDER BY next_run_at
                LIMIT ?2
            )
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to claim due jobs")?;

        let mut ran = 0usize;
        for row in &rows {
            let job = job_from_row(row)?;
            ran += 1;

            match handler.handle(&job).await {
                Ok(result) => self.complete(&job, result).await?,
                Err(e) => self.fail_or_retry(&job, &e.to_string()).await?,
            }
        }
        Ok(ran)
    }

    async fn complete(&self, job: &JobRecord, result: Value) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET status = 'completed', result = ?1, updated_at = ?2
             WHERE queue = ?3 AND job_id = ?4",
        )
        .bind(result.to_string())
        .bind(Utc::now().timestamp_millis())
        .bind(job.queue.as_str())
        .bind(&job.job_id)
        .execute(&self.pool)
        .await
        .context("Failed to complete job")?;

        debug!(queue = %job.queue, job_id = %job.job_id, "Job completed");
        Ok(())
    }

    async fn fail_or_retry(&self, job: &JobRecord, error: &str) -> Result<()> {
        let now = Utc::now().timestamp_millis();

        if job.attempts >= job.max_attempts {
            sqlx::query(
                "UPDATE jobs SET status = 'failed', last_error = ?1, updated_at = ?2
                 WHERE queue = ?3 AND job_id = ?4",
            )
            .bind(error)
            .bind(now)
            .bind(job.queue.as_str())
            .bind(&job.job_id)
            .execute(&self.pool)
            .await
            .context("Failed to mark job failed")?;

            warn!(
                queue = %job.queue,
                job_id = %job.job_id,
                attempts = job.attempts,
                error,
                "Job failed permanently"
            );
        } else {
            let policy = self.policies.for_queue(job.queue);
            let backoff = policy.backoff(job.attempts);

            sqlx::query(
                "UPDATE jobs SET status = 'pending', last_error = ?1,
                        next_run_at = ?2, updated_at = ?3
                 WHERE queue = ?4 AND job_id = ?5",
            )
            .bind(error)
            .bind(now + backoff.as_millis() as i64)
            .bind(now)
            .bind(job.queue.as_str())
            .bind(&job.job_id)
            .execute(&self.pool)
            .await
            .context("Failed to schedule job retry")?;

            debug!(
                queue = %job.queue,
                job_id = %job.job_id,
                attempt = job.attempts,
                backoff_ms = backoff.as_millis() as u64,
                error,
                "Job retry scheduled"
            );
        }
        Ok(())
    }

    /// Drop terminal jobs older than the retention window. A capacity/age
    /// policy, not a correctness requirement.
    pub async fn prune(&self, retention: Duration) -> Result<u64> {
        let cutoff = Utc::now().timestamp_millis() - retention.as_millis() as i64;
        let pruned = sqlx::query(
            "DELETE FROM jobs WHERE status IN ('completed', 'failed') AND updated_at <= ?1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .context("Failed to prune jobs")?
        .rows_affected();

        if pruned > 0 {
            info!(pruned, "Pruned terminal jobs");
        }
        Ok(pruned)
    }

    /// Pending + running job count for one queue.
    pub async fn open_count(&self, queue: QueueName) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM jobs
             WHERE queue = ?1 AND status IN ('pending', 'running')",
        )
        .bind(queue.as_str())
        .fetch_one(&self.pool)
        .await
        .context("Failed to count jobs")?;
        Ok(row.get::<i64, _>("n"))
    }
}

fn job_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<JobRecord> {
    let payload: String = row.get("payload");
    let result: Option<String> = row.get("result");
    let queue: String = row.get("queue");
    let status: String = row.get("status");

    Ok(JobRecord {
        queue: queue.parse()?,
        job_id: row.get("job_id"),
        payload: serde_json::from_str(&payload).context("Corrupt job payload")?,
        status: status.parse()?,
        attempts: row.get::<i64, _>("attempts") as u32,
        max_attempts: row.get::<i64, _>("max_attempts") as u32,
        last_error: row.get("last_error"),
        result: result
            .map(|r| serde_json::from_str(&r).context("Corrupt job result"))
            .transpose()?,
        next_run_at: row.get("next_run_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
