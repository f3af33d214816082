//! Background dispatch loop for the outbox (§4.3): claim a batch, route each row to
//! its registered [`OutboxHandler`] by topic, and finalize via ack/abandon/fail.
//!
//! `OutboxService::enqueue` is a thin pass-through to `relay_db::outbox::enqueue` kept
//! here so application code depends on `relay-runtime` rather than reaching into
//! `relay-db` directly; the claim/dispatch loop is the part that actually needs this
//! crate's `runtime-claim` feature activation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use relay_schemas::{HandlerOutcome, OutboundMessage, OutboxHandler};
use serde_json::Value;
use sqlx::{Executor, PgPool, Postgres};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backoff::default_backoff_seconds;
use crate::owner::new_owner_token;
use crate::store::{SelectionStrategy, StoreCursor, StoreProvider};

/// Registered `OutboxHandler`s keyed by topic, resolved per claimed row.
#[derive(Default)]
pub struct OutboxHandlerRegistry {
    handlers: HashMap<String, Arc<dyn OutboxHandler>>,
}

impl OutboxHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn OutboxHandler>) {
        self.handlers.insert(handler.topic().to_string(), handler);
    }

    pub fn get(&self, topic: &str) -> Option<Arc<dyn OutboxHandler>> {
        self.handlers.get(topic).cloned()
    }
}

pub struct OutboxServiceConfig {
    pub batch_size: i64,
    pub lease_seconds: i64,
    pub poll_interval: StdDuration,
    pub max_attempts: i32,
}

impl Default for OutboxServiceConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            lease_seconds: 30,
            poll_interval: StdDuration::from_secs(5),
            max_attempts: 10,
        }
    }
}

pub struct OutboxService {
    cursor: StoreCursor,
    handlers: Arc<OutboxHandlerRegistry>,
    config: OutboxServiceConfig,
}

impl OutboxService {
    /// `provider`/`strategy` drive which store this service's claim loop polls each
    /// tick (§4.7); a single-store deployment just wraps one pool in a
    /// [`crate::store::StaticStoreProvider`].
    pub fn new(
        provider: Arc<dyn StoreProvider>,
        strategy: Box<dyn SelectionStrategy>,
        handlers: Arc<OutboxHandlerRegistry>,
        config: OutboxServiceConfig,
    ) -> Self {
        Self { cursor: StoreCursor::new(provider, strategy), handlers, config }
    }

    /// Append a Ready row. Participates in the caller's transaction when `executor`
    /// carries one.
    pub async fn enqueue<'e, E>(
        &self,
        executor: E,
        topic: &str,
        payload: Value,
        message_id: &str,
        correlation_id: Option<Uuid>,
        due_time_utc: Option<DateTime<Utc>>,
    ) -> Result<Option<i64>>
    where
        E: Executor<'e, Database = Postgres>,
    {
        relay_db::outbox::enqueue(executor, topic, payload, message_id, correlation_id, due_time_utc).await
    }

    /// Picks the next store via the configured [`SelectionStrategy`], claims,
    /// dispatches, and finalizes one batch against it. Returns the number of rows
    /// claimed (0, with no store touched, if the provider currently has none).
    pub async fn run_once(&self) -> Result<usize> {
        let Some(store) = self.cursor.pick().await else {
            return Ok(0);
        };

        let owner_token = new_owner_token();
        let claimed = relay_db::outbox::claim_batch(
            &store.pool,
            self.config.batch_size,
            owner_token,
            self.config.lease_seconds,
        )
        .await
        .context("outbox claim_batch failed")?;

        for row in &claimed {
            self.dispatch_one(&store.pool, owner_token, row).await;
        }

        self.cursor.record(&store.identifier, claimed.len()).await;
        Ok(claimed.len())
    }

    async fn dispatch_one(&self, pool: &PgPool, owner_token: Uuid, row: &relay_db::outbox::OutboxRow) {
        let Some(handler) = self.handlers.get(&row.topic) else {
            tracing::warn!(topic = %row.topic, id = row.id, "no outbox handler registered for topic");
            if let Err(err) = relay_db::outbox::fail(pool, owner_token, &[row.id], "no handler for topic").await {
                tracing::error!(id = row.id, error = %err, "outbox fail (no handler) failed");
            }
            return;
        };

        let message = OutboundMessage {
            id: row.id,
            topic: row.topic.clone(),
            payload: row.payload.clone(),
            correlation_id: row.correlation_id,
        };

        let outcome = handler.handle(message).await;
        match outcome {
            HandlerOutcome::Ack => {
                if let Err(err) = relay_db::outbox::ack(pool, owner_token, &[row.id]).await {
                    tracing::error!(id = row.id, error = %err, "outbox ack failed");
                } else {
                    self.record_join_completion(pool, row.id, true).await;
                }
            }
            HandlerOutcome::Permanent(err) => {
                tracing::warn!(id = row.id, error = %err, "outbox handler declared permanent failure");
                if let Err(err) = relay_db::outbox::fail(pool, owner_token, &[row.id], &err.to_string()).await {
                    tracing::error!(id = row.id, error = %err, "outbox fail failed");
                } else {
                    self.record_join_completion(pool, row.id, false).await;
                }
            }
            HandlerOutcome::Retry(err) => {
                if row.retry_count + 1 >= self.config.max_attempts {
                    tracing::warn!(id = row.id, error = %err, "outbox handler exhausted retries");
                    if let Err(err) =
                        relay_db::outbox::fail(pool, owner_token, &[row.id], "Maximum retry attempts exceeded").await
                    {
                        tracing::error!(id = row.id, error = %err, "outbox fail (max attempts) failed");
                    } else {
                        self.record_join_completion(pool, row.id, false).await;
                    }
                } else {
                    let delay = default_backoff_seconds(row.retry_count);
                    if let Err(abandon_err) =
                        relay_db::outbox::abandon(pool, owner_token, &[row.id], Some(&err.to_string()), delay).await
                    {
                        tracing::error!(id = row.id, error = %abandon_err, "outbox abandon failed");
                    }
                }
            }
        }
    }

    /// Increments the matching `OutboxJoin` member's counter if `outbox_message_id`
    /// belongs to one (§4.3 "JoinStore (optional sidecar)"). A no-op for messages
    /// that were never registered as a join member.
    async fn record_join_completion(&self, pool: &PgPool, outbox_message_id: i64, succeeded: bool) {
        if let Err(err) = relay_db::outbox_join::record_member_completion(pool, outbox_message_id, succeeded).await {
            tracing::error!(id = outbox_message_id, error = %err, "outbox_join record_member_completion failed");
        }
    }

    /// Reaps expired in-progress rows across every store the provider currently
    /// knows about, not just the one the claim loop last polled.
    pub async fn reap_expired(&self) -> Result<usize> {
        let mut total = 0;
        for store in self.cursor.snapshot().await {
            total += relay_db::outbox::reap_expired(&store.pool).await?.len();
        }
        Ok(total)
    }

    /// Run the poll→dispatch→reap loop until `cancel` fires.
    pub async fn run_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("outbox service loop cancelled");
                    return;
                }
                _ = ticker.tick() => {}
            }

            match self.run_once().await {
                Ok(n) if n > 0 => tracing::debug!(claimed = n, "outbox batch dispatched"),
                Ok(_) => {}
                Err(err) => tracing::error!(error = %err, "outbox run_once failed"),
            }

            if let Err(err) = self.reap_expired().await {
                tracing::error!(error = %err, "outbox reap_expired failed");
            }
        }
    }
}
