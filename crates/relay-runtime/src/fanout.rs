//! Fanout coordination (§4.6): plans due per-shard slices from an application-supplied
//! candidate stream and dispatches them onto the outbox.

use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use relay_lease::LeaseFactory;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanoutSlice {
    pub topic: String,
    pub shard_key: String,
    pub work_key: String,
    pub window_start: Option<DateTime<Utc>>,
}

/// Supplies the full set of `(shard_key, work_key)` candidates for a topic; the base
/// planner filters these down to the ones actually due per policy cadence + cursor.
#[async_trait]
pub trait FanoutCandidateSource: Send + Sync {
    async fn enumerate_candidates(&self, topic: &str, work_key: Option<&str>) -> Result<Vec<(String, String)>>;
}

pub struct FanoutPlanner {
    pool: PgPool,
    candidates: std::sync::Arc<dyn FanoutCandidateSource>,
}

impl FanoutPlanner {
    pub fn new(pool: PgPool, candidates: std::sync::Arc<dyn FanoutCandidateSource>) -> Self {
        Self { pool, candidates }
    }

    /// Emits a slice for every `(shard_key, work_key)` candidate whose cursor has aged
    /// past `every_seconds + rand(0, jitter_seconds)` (§4.6, scenario 6). Policy is
    /// looked up per-candidate `work_key`, since `FanoutPolicy` is keyed `(topic,
    /// work_key)` and a single candidate stream may span several work keys.
    pub async fn get_due_slices(&self, topic: &str, work_key: Option<&str>) -> Result<Vec<FanoutSlice>> {
        let candidates = self.candidates.enumerate_candidates(topic, work_key).await?;
        let now = Utc::now();
        let mut due = Vec::new();

        for (shard_key, candidate_work_key) in candidates {
            let Some(policy) = relay_db::fanout::load_policy(&self.pool, topic, &candidate_work_key)
                .await
                .context("fanout load_policy failed")?
            else {
                tracing::warn!(topic, work_key = %candidate_work_key, "no fanout policy registered, skipping candidate");
                continue;
            };

            let cursor = relay_db::fanout::load_cursor(&self.pool, topic, &candidate_work_key, &shard_key)
                .await
                .context("fanout load_cursor failed")?;

            let jitter = if policy.jitter_seconds > 0 {
                rand::thread_rng().gen_range(0..policy.jitter_seconds)
            } else {
                0
            };
            let threshold = chrono::Duration::seconds((policy.default_every_seconds + jitter) as i64);

            let is_due = match cursor {
                Some(last_completed) => now - last_completed >= threshold,
                None => true,
            };

            if is_due {
                due.push(FanoutSlice {
                    topic: topic.to_string(),
                    shard_key,
                    work_key: candidate_work_key,
                    window_start: cursor,
                });
            }
        }

        Ok(due)
    }
}

pub struct FanoutCoordinator {
    pool: PgPool,
    lease_factory: LeaseFactory,
    planner: FanoutPlanner,
}

impl FanoutCoordinator {
    pub fn new(pool: PgPool, lease_factory: LeaseFactory, planner: FanoutPlanner) -> Self {
        Self { pool, lease_factory, planner }
    }

    /// Acquires the per-topic[:work_key] lease, plans slices, dispatches each as an
    /// outbox message, and advances each slice's cursor. Returns the dispatched count,
    /// or `0` if the lease could not be acquired this tick.
    pub async fn run(&self, topic: &str, work_key: Option<&str>) -> Result<usize> {
        let resource_name = match work_key {
            Some(key) => format!("fanout:{topic}:{key}"),
            None => format!("fanout:{topic}"),
        };

        let Some(_lease) = self
            .lease_factory
            .acquire(&resource_name, StdDuration::from_secs(90), None)
            .await?
        else {
            tracing::debug!(resource = %resource_name, "fanout coordinator lease unavailable this tick");
            return Ok(0);
        };

        let slices = self.planner.get_due_slices(topic, work_key).await?;
        let outbox_topic = match work_key {
            Some(key) => format!("fanout:{topic}:{key}"),
            None => format!("fanout:{topic}:default"),
        };

        let now = Utc::now();
        for slice in &slices {
            let message_id = format!("fanout:{}:{}:{}:{}", slice.topic, slice.shard_key, slice.work_key, now.timestamp_millis());
            let payload = serde_json::to_value(slice).context("serialize fanout slice failed")?;
            relay_db::outbox::enqueue(&self.pool, &outbox_topic, payload, &message_id, None, None)
                .await
                .context("fanout slice enqueue failed")?;
            relay_db::fanout::advance_cursor(&self.pool, &slice.topic, &slice.work_key, &slice.shard_key, now)
                .await
                .context("fanout advance_cursor failed")?;
        }

        Ok(slices.len())
    }
}

/// Startup registration for one `(topic, work_key, cron, default_every_seconds,
/// jitter_seconds)` tuple (§4.6 "Job registration"): upserts the coordination cron job
/// and the fanout policy row exactly once.
pub struct FanoutTopicOptions {
    pub topic: String,
    pub work_key: Option<String>,
    pub cron_schedule: String,
    pub default_every_seconds: i32,
    pub jitter_seconds: i32,
}

pub async fn register_fanout_topic(
    pool: &PgPool,
    scheduler: &crate::scheduler::SchedulerClient,
    once: &crate::registry::OnceExecutionRegistry,
    options: &FanoutTopicOptions,
) -> Result<()> {
    let job_name = match &options.work_key {
        Some(key) => format!("fanout-{}-{}", options.topic, key),
        None => format!("fanout-{}", options.topic),
    };

    if !once.try_execute_once(&format!("register_fanout_topic:{job_name}")) {
        return Ok(());
    }

    scheduler
        .create_or_update_job(&job_name, "fanout.coordinate", &options.cron_schedule, Some(serde_json::json!({
            "topic": options.topic,
            "work_key": options.work_key,
        })))
        .await
        .context("fanout job upsert failed")?;

    relay_db::fanout::upsert_policy(
        pool,
        &options.topic,
        options.work_key.as_deref().unwrap_or("default"),
        options.default_every_seconds,
        options.jitter_seconds,
    )
    .await
    .context("fanout policy upsert failed")?;

    Ok(())
}

/// `OutboxHandler` for the well-known `"fanout.coordinate"` topic: resolves a
/// coordinator keyed by `"{topic}[:{workKey}]"` from a registry and invokes it.
pub struct FanoutCoordinateHandler {
    coordinators: std::collections::HashMap<String, std::sync::Arc<FanoutCoordinator>>,
}

impl FanoutCoordinateHandler {
    pub fn new(coordinators: std::collections::HashMap<String, std::sync::Arc<FanoutCoordinator>>) -> Self {
        Self { coordinators }
    }
}

#[async_trait]
impl relay_schemas::OutboxHandler for FanoutCoordinateHandler {
    fn topic(&self) -> &str {
        "fanout.coordinate"
    }

    async fn handle(&self, message: relay_schemas::OutboundMessage) -> relay_schemas::HandlerOutcome {
        let topic = message.payload.get("topic").and_then(|v| v.as_str());
        let work_key = message.payload.get("work_key").and_then(|v| v.as_str());

        let Some(topic) = topic else {
            return relay_schemas::HandlerOutcome::Permanent(anyhow::anyhow!("fanout.coordinate payload missing topic"));
        };

        let key = match work_key {
            Some(k) => format!("{topic}:{k}"),
            None => topic.to_string(),
        };

        let Some(coordinator) = self.coordinators.get(&key) else {
            return relay_schemas::HandlerOutcome::Permanent(anyhow::anyhow!("no fanout coordinator registered for {key}"));
        };

        match coordinator.run(topic, work_key).await {
            Ok(_) => relay_schemas::HandlerOutcome::Ack,
            Err(err) => relay_schemas::HandlerOutcome::Retry(err),
        }
    }
}
