//! Scheduler client (§4.5): timers, cron jobs, and the background loop that turns due
//! timers/job-runs into outbox messages under a fenced lease.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use cron::Schedule;
use relay_lease::{Lease, LeaseFactory};
use relay_schemas::SchemaCompletion;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::owner::new_owner_token;
use crate::registry::StartupLatch;
use crate::store::{SelectionStrategy, Store, StoreCursor, StoreProvider};

/// Left-pads a bare 5-field (minute-granularity) cron expression with a literal `0`
/// seconds field so callers can supply either 5- or 6-field expressions. Selected by
/// counting whitespace-separated fields, per §4.5.
pub fn normalize_cron(expr: &str) -> Result<String> {
    let field_count = expr.split_whitespace().count();
    match field_count {
        5 => Ok(format!("0 {expr}")),
        6 => Ok(expr.to_string()),
        other => Err(anyhow!("cron expression must have 5 or 6 fields, got {other}: {expr}")),
    }
}

/// Parse (normalizing if needed) and compute the next occurrence strictly after `after`.
pub fn next_occurrence(cron_expr: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let normalized = normalize_cron(cron_expr)?;
    let schedule = Schedule::from_str(&normalized).with_context(|| format!("invalid cron expression: {cron_expr}"))?;
    schedule
        .after(&after)
        .next()
        .ok_or_else(|| anyhow!("cron expression {cron_expr} has no future occurrence"))
}

pub struct SchedulerClient {
    pool: PgPool,
}

impl SchedulerClient {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn schedule_timer(
        &self,
        topic: &str,
        payload: serde_json::Value,
        due_time_utc: DateTime<Utc>,
        correlation_id: Option<Uuid>,
    ) -> Result<i64> {
        relay_db::timers::schedule(&self.pool, topic, payload, due_time_utc, correlation_id).await
    }

    pub async fn cancel_timer(&self, id: i64) -> Result<bool> {
        relay_db::timers::cancel(&self.pool, id).await
    }

    pub async fn create_or_update_job(
        &self,
        name: &str,
        topic: &str,
        cron_schedule: &str,
        payload: Option<serde_json::Value>,
    ) -> Result<i64> {
        let normalized = normalize_cron(cron_schedule)?;
        let next_due = next_occurrence(&normalized, Utc::now())?;
        relay_db::jobs::create_or_update(&self.pool, name, topic, &normalized, payload, next_due).await
    }

    pub async fn delete_job(&self, name: &str) -> Result<bool> {
        relay_db::jobs::delete(&self.pool, name).await
    }

    pub async fn trigger_job(&self, name: &str) -> Result<i64> {
        relay_db::jobs::trigger_now(&self.pool, name).await
    }
}

pub struct SchedulerLoopConfig {
    pub lease_resource: String,
    pub lease_duration: StdDuration,
    pub claim_batch_size: i64,
    pub claim_lease_seconds: i64,
    pub min_sleep: StdDuration,
    pub max_sleep: StdDuration,
}

impl Default for SchedulerLoopConfig {
    fn default() -> Self {
        Self {
            lease_resource: "scheduler:run".to_string(),
            lease_duration: StdDuration::from_secs(30),
            claim_batch_size: 100,
            claim_lease_seconds: 30,
            min_sleep: StdDuration::from_millis(100),
            max_sleep: StdDuration::from_secs(30),
        }
    }
}

/// One pass through steps 3-7 of §4.5, run inside a single transaction fenced by
/// `scheduler_state.current_fencing_token`.
///
/// Each store has its own `scheduler_state` row, so the fencing token this loop's
/// lease carries is meaningful per store independently; which store a given tick
/// operates on is chosen the same way `OutboxService`/`InboxDispatcher` choose theirs
/// (§4.7), via `cursor`.
pub struct SchedulerLoop {
    cursor: StoreCursor,
    lease_factory: LeaseFactory,
    schema_completion: Arc<dyn SchemaCompletion>,
    startup_latch: Arc<StartupLatch>,
    config: SchedulerLoopConfig,
}

impl SchedulerLoop {
    pub fn new(
        provider: Arc<dyn StoreProvider>,
        strategy: Box<dyn SelectionStrategy>,
        lease_factory: LeaseFactory,
        schema_completion: Arc<dyn SchemaCompletion>,
        startup_latch: Arc<StartupLatch>,
        config: SchedulerLoopConfig,
    ) -> Self {
        Self { cursor: StoreCursor::new(provider, strategy), lease_factory, schema_completion, startup_latch, config }
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        self.startup_latch.wait_ready().await;
        self.schema_completion.schema_deployment_completed().await;

        loop {
            if cancel.is_cancelled() {
                tracing::info!("scheduler loop cancelled");
                return;
            }

            let lease = match self
                .lease_factory
                .acquire(&self.config.lease_resource, self.config.lease_duration, None)
                .await
            {
                Ok(Some(lease)) => lease,
                Ok(None) => {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(self.config.min_sleep.max(StdDuration::from_secs(1))) => {}
                    }
                    continue;
                }
                Err(err) => {
                    tracing::error!(error = %err, "scheduler lease acquire failed");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(StdDuration::from_secs(1)) => {}
                    }
                    continue;
                }
            };

            let Some(store) = self.cursor.pick().await else {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(self.config.min_sleep.max(StdDuration::from_secs(1))) => {}
                }
                continue;
            };

            let sleep_for = match self.run_fenced_tick(&lease, &store).await {
                Ok((next, claimed)) => {
                    self.cursor.record(&store.identifier, claimed).await;
                    next
                }
                Err(err) => {
                    tracing::error!(error = %err, store = %store.identifier, "scheduler tick failed, continuing");
                    self.config.min_sleep
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
    }

    /// Runs one fenced tick and returns how long to sleep before the next one.
    ///
    /// Every write this tick makes is fenced against `scheduler_state.current_fencing_token`
    /// (§4.5): `advance()` raises it to this lease's token first, and the two claim
    /// statements each re-check `fencing_token >= current_fencing_token` at the moment
    /// they run, so a lease lost mid-tick to a newer instance (which would have
    /// advanced the counter past ours) can claim nothing even without sharing a
    /// transaction with `advance()`. `throw_if_lost` additionally short-circuits the
    /// tick as soon as the background renewer observes the loss, rather than relying
    /// solely on the claim guard to no-op stale work.
    async fn run_fenced_tick(&self, lease: &Lease, store: &Store) -> Result<(StdDuration, usize)> {
        lease.throw_if_lost()?;
        let fencing_token = lease.fencing_token();
        let pool = &store.pool;

        let advanced = relay_db::scheduler_state::advance(pool, fencing_token)
            .await
            .context("scheduler_state advance failed")?;
        if !advanced {
            tracing::warn!(fencing_token, store = %store.identifier, "stale scheduler fencing token, skipping tick");
            return Ok((self.config.min_sleep, 0));
        }

        // Reap is independent of claim/fencing (§4.1): any process may restore rows
        // whose lease expired without a terminal transition, timer/job-run crashes
        // included. Run it here since the scheduler loop is the only background loop
        // that otherwise touches these two tables.
        if let Err(err) = relay_db::timers::reap_expired(pool).await {
            tracing::error!(error = %err, "timer reap_expired failed");
        }
        if let Err(err) = relay_db::jobs::reap_expired(pool).await {
            tracing::error!(error = %err, "job_run reap_expired failed");
        }

        let owner_token = new_owner_token();

        let mut txn = pool.begin().await.context("scheduler tick begin failed")?;
        let due_jobs = relay_db::jobs::due_jobs(&mut txn).await?;
        for job in &due_jobs {
            if relay_db::jobs::insert_run(&mut txn, job.id, Utc::now()).await?.is_some() {
                let next_due = next_occurrence(&job.cron_schedule, Utc::now())?;
                relay_db::jobs::advance_next_due_time(&mut txn, job.id, next_due).await?;
            }
        }
        txn.commit().await.context("scheduler tick (jobs) commit failed")?;

        lease.throw_if_lost()?;
        let claimed_timers = relay_db::timers::claim_due(
            pool,
            self.config.claim_batch_size,
            owner_token,
            self.config.claim_lease_seconds,
            fencing_token,
        )
        .await
        .context("scheduler claim_due timers failed")?;
        if !claimed_timers.is_empty() {
            // Enqueue onto the outbox and ack the timer in one transaction (§4.5 step 5)
            // so a crash never leaves a dispatched timer claimable again; the outbox
            // message's deterministic `message_id` also makes a retried enqueue a no-op.
            let mut txn = pool.begin().await.context("scheduler timer dispatch begin failed")?;
            for timer in &claimed_timers {
                let message_id = format!("timer:{}", timer.id);
                relay_db::outbox::enqueue(
                    &mut *txn,
                    &timer.topic,
                    timer.payload.clone(),
                    &message_id,
                    timer.correlation_id,
                    None,
                )
                .await
                .context("scheduler timer->outbox enqueue failed")?;
            }
            let ids: Vec<i64> = claimed_timers.iter().map(|t| t.id).collect();
            relay_db::timers::ack(&mut *txn, owner_token, &ids).await?;
            txn.commit().await.context("scheduler timer dispatch commit failed")?;
        }

        lease.throw_if_lost()?;
        let claimed_runs = relay_db::jobs::claim_due_runs(
            pool,
            self.config.claim_batch_size,
            owner_token,
            self.config.claim_lease_seconds,
            fencing_token,
        )
        .await
        .context("scheduler claim_due_runs failed")?;
        if !claimed_runs.is_empty() {
            let mut txn = pool.begin().await.context("scheduler job_run dispatch begin failed")?;
            for run in &claimed_runs {
                let message_id = format!("job-run:{}", run.id);
                let topic = format!("job-run:{}", run.job_id);
                relay_db::outbox::enqueue(&mut *txn, &topic, serde_json::json!({"job_run_id": run.id}), &message_id, None, None)
                    .await
                    .context("scheduler job_run->outbox enqueue failed")?;
            }
            let ids: Vec<i64> = claimed_runs.iter().map(|r| r.id).collect();
            relay_db::jobs::ack(&mut *txn, owner_token, &ids).await?;
            txn.commit().await.context("scheduler job_run dispatch commit failed")?;
        }

        let next_timer = relay_db::timers::earliest_due(pool).await?;
        let next_run = relay_db::jobs::earliest_pending(pool).await?;
        let next_job = relay_db::jobs::earliest_next_due_time(pool).await?;
        let earliest = [next_timer, next_run, next_job].into_iter().flatten().min();

        let now = Utc::now();
        let sleep_secs = match earliest {
            Some(t) => (t - now).num_milliseconds().max(0) as f64 / 1000.0,
            None => self.config.max_sleep.as_secs_f64(),
        };
        let sleep_secs = sleep_secs.clamp(self.config.min_sleep.as_secs_f64(), self.config.max_sleep.as_secs_f64());
        let claimed = claimed_timers.len() + claimed_runs.len();
        Ok((StdDuration::from_secs_f64(sleep_secs), claimed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_field_cron_is_left_padded_with_a_zero_seconds_field() {
        assert_eq!(normalize_cron("*/5 * * * *").unwrap(), "0 */5 * * * *");
    }

    #[test]
    fn six_field_cron_passes_through_unchanged() {
        assert_eq!(normalize_cron("*/30 * * * * *").unwrap(), "*/30 * * * * *");
    }

    #[test]
    fn malformed_field_count_is_rejected() {
        assert!(normalize_cron("* * *").is_err());
    }

    #[test]
    fn five_field_cron_advances_by_whole_minutes() {
        let start = Utc::now();
        let next = next_occurrence("*/5 * * * *", start).unwrap();
        assert_eq!(next.timestamp() % 60, 0, "5-field cron must land on a minute boundary");
        assert!(next > start);
    }

    #[test]
    fn six_field_cron_can_advance_by_seconds() {
        let start = Utc::now();
        let next = next_occurrence("*/10 * * * * *", start).unwrap();
        assert!(next > start);
        assert!((next - start).num_seconds() <= 10);
    }
}
