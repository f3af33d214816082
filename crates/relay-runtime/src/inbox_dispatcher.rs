//! Inbox `RunOnce` batch execution (§4.4): claim, resolve handler by topic, invoke,
//! finalize. Optionally lease-gated per tenant so only one process handles a given
//! store's inbox at a time; a tenant whose lease is unavailable is skipped for this
//! tick rather than blocking the whole poll cycle.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use relay_lease::LeaseFactory;
use relay_schemas::{HandlerOutcome, InboundMessage, InboxHandlerResolver};
use sqlx::PgPool;

use crate::backoff::default_backoff_seconds;
use crate::owner::new_owner_token;
use crate::store::{SelectionStrategy, StoreCursor, StoreProvider};

pub struct InboxDispatcherConfig {
    pub batch_size: i64,
    pub lease_seconds: i64,
    pub max_attempts: i32,
    pub poll_interval: StdDuration,
    /// Resource name for the per-tenant processing lease; `None` skips lease gating
    /// (e.g. a single-process deployment with no contention to fence against).
    pub tenant_lease_resource: Option<String>,
}

impl Default for InboxDispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            lease_seconds: 30,
            max_attempts: 3,
            poll_interval: StdDuration::from_millis(250),
            tenant_lease_resource: Some("inbox-processing".to_string()),
        }
    }
}

pub struct InboxDispatcher {
    /// Pool ingestion (`enqueue`/`already_processed`/`revive`) writes against — these
    /// are synchronous, caller-addressed operations against the primary store, not
    /// part of the per-store dispatch loop.
    pool: PgPool,
    /// Drives which store the claim loop polls each tick (§4.7); defaults to a
    /// single-store provider wrapping `pool` when the host has no discovery mechanism.
    cursor: StoreCursor,
    resolver: Arc<dyn InboxHandlerResolver>,
    lease_factory: Option<LeaseFactory>,
    config: InboxDispatcherConfig,
}

impl InboxDispatcher {
    pub fn new(
        pool: PgPool,
        provider: Arc<dyn StoreProvider>,
        strategy: Box<dyn SelectionStrategy>,
        resolver: Arc<dyn InboxHandlerResolver>,
        lease_factory: Option<LeaseFactory>,
        config: InboxDispatcherConfig,
    ) -> Self {
        Self { pool, cursor: StoreCursor::new(provider, strategy), resolver, lease_factory, config }
    }

    pub async fn enqueue(
        &self,
        source: &str,
        message_id: &str,
        topic: &str,
        payload: serde_json::Value,
        hash: Option<&str>,
        due_time_utc: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<bool> {
        relay_db::inbox::enqueue(&self.pool, source, message_id, topic, payload, hash, due_time_utc).await
    }

    pub async fn already_processed(&self, message_id: &str, source: &str) -> Result<bool> {
        relay_db::inbox::already_seen(&self.pool, source, message_id).await
    }

    /// Picks the next store via the configured [`SelectionStrategy`], claims up to
    /// `batch_size` rows from it, invokes handlers, and finalizes. Returns the number
    /// of rows claimed (0 if a configured tenant lease could not be acquired this tick
    /// — a deliberate skip, not an error — or if the provider currently has no store).
    pub async fn run_once(&self) -> Result<usize> {
        let _lease = match &self.config.tenant_lease_resource {
            Some(resource) => {
                let factory = self
                    .lease_factory
                    .as_ref()
                    .context("tenant_lease_resource configured without a lease factory")?;
                match factory
                    .acquire(resource, StdDuration::from_secs(self.config.lease_seconds as u64), None)
                    .await?
                {
                    Some(lease) => Some(lease),
                    None => {
                        tracing::debug!(resource, "inbox processing lease unavailable this tick, skipping");
                        return Ok(0);
                    }
                }
            }
            None => None,
        };

        let Some(store) = self.cursor.pick().await else {
            return Ok(0);
        };

        let owner_token = new_owner_token();
        let claimed = relay_db::inbox::claim_batch(
            &store.pool,
            self.config.batch_size,
            owner_token,
            self.config.lease_seconds,
        )
        .await
        .context("inbox claim_batch failed")?;

        for row in &claimed {
            self.dispatch_one(&store.pool, owner_token, row).await;
        }

        self.cursor.record(&store.identifier, claimed.len()).await;
        Ok(claimed.len())
    }

    async fn dispatch_one(&self, pool: &PgPool, owner_token: uuid::Uuid, row: &relay_db::inbox::InboxRow) {
        let Some(handler) = self.resolver.get_handler(&row.topic) else {
            tracing::warn!(topic = %row.topic, source = %row.source, message_id = %row.message_id, "no inbox handler registered for topic");
            if let Err(err) =
                relay_db::inbox::fail(pool, owner_token, &row.source, &row.message_id, "no handler for topic").await
            {
                tracing::error!(error = %err, "inbox fail (no handler) failed");
            }
            return;
        };

        let message = InboundMessage {
            message_id: row.message_id.clone(),
            source: row.source.clone(),
            topic: row.topic.clone(),
            payload: row.payload.clone(),
            attempts: row.attempts,
        };

        let outcome = handler.handle(message).await;
        match outcome {
            HandlerOutcome::Ack => {
                if let Err(err) = relay_db::inbox::ack(pool, owner_token, &row.source, &row.message_id).await {
                    tracing::error!(error = %err, "inbox ack failed");
                }
            }
            HandlerOutcome::Permanent(err) => {
                tracing::warn!(source = %row.source, message_id = %row.message_id, error = %err, "inbox handler declared permanent failure");
                if let Err(err) =
                    relay_db::inbox::fail(pool, owner_token, &row.source, &row.message_id, &err.to_string()).await
                {
                    tracing::error!(error = %err, "inbox fail failed");
                }
            }
            HandlerOutcome::Retry(err) => {
                if row.attempts >= self.config.max_attempts {
                    if let Err(err) = relay_db::inbox::fail(
                        pool,
                        owner_token,
                        &row.source,
                        &row.message_id,
                        "Maximum retry attempts exceeded",
                    )
                    .await
                    {
                        tracing::error!(error = %err, "inbox fail (max attempts) failed");
                    }
                } else {
                    let delay = default_backoff_seconds(row.attempts);
                    if let Err(abandon_err) = relay_db::inbox::abandon(
                        pool,
                        owner_token,
                        &row.source,
                        &row.message_id,
                        Some(&err.to_string()),
                        delay,
                    )
                    .await
                    {
                        tracing::error!(error = %abandon_err, "inbox abandon failed");
                    }
                }
            }
        }
    }

    /// Reaps expired in-progress rows across every store the provider currently
    /// knows about, not just the one the claim loop last polled.
    pub async fn reap_expired(&self) -> Result<i64> {
        let mut total = 0;
        for store in self.cursor.snapshot().await {
            total += relay_db::inbox::reap_expired(&store.pool).await?;
        }
        Ok(total)
    }

    /// Transition Dead → Seen; emits `inbox.message.revived` via `audit` if supplied.
    pub async fn revive(
        &self,
        source: &str,
        message_id: &str,
        reason: Option<&str>,
        delay_seconds: i64,
        audit: Option<&dyn relay_schemas::AuditWriter>,
    ) -> Result<bool> {
        // Snapshot the prior error before revive clears the row's retry lineage, so
        // the audit event records what actually killed the message.
        let Some(prior) = relay_db::inbox::find_by_key(&self.pool, source, message_id).await? else {
            return Ok(false);
        };

        let normalized_reason = reason.map(str::trim).filter(|r| !r.is_empty());
        let revived =
            relay_db::inbox::revive(&self.pool, source, message_id, normalized_reason, delay_seconds).await?;

        if revived {
            if let Some(audit) = audit {
                let tags = vec![
                    ("messageKey", message_id.to_string()),
                    ("inboxMessageId", message_id.to_string()),
                ];
                let detail = serde_json::json!({
                    "source": source,
                    "message_id": message_id,
                    "reason": normalized_reason,
                    "prior_error": prior.last_error,
                    "prior_attempts": prior.attempts,
                });
                if let Err(err) = audit.append("inbox.message.revived", tags, detail).await {
                    tracing::warn!(error = %err, "audit append for inbox.message.revived failed");
                }
            }
        }

        Ok(revived)
    }

    pub async fn run_loop(self: Arc<Self>, cancel: tokio_util::sync::CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("inbox dispatcher loop cancelled");
                    return;
                }
                _ = ticker.tick() => {}
            }

            match self.run_once().await {
                Ok(n) if n > 0 => tracing::debug!(claimed = n, "inbox batch dispatched"),
                Ok(_) => {}
                Err(err) => tracing::error!(error = %err, "inbox run_once failed"),
            }

            if let Err(err) = self.reap_expired().await {
                tracing::error!(error = %err, "inbox reap_expired failed");
            }
        }
    }
}
