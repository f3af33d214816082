//! Renewable, fenced distributed locks backed by a single `distributed_lock` table.
//!
//! A [`Lease`] is won via [`LeaseFactory::acquire`], renews itself in the background
//! at half its duration, and exposes [`Lease::throw_if_lost`] so callers can check
//! ownership at every suspension point inside a lease-guarded critical section.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use relay_schemas::LostLeaseError;
use sqlx::{PgPool, Row};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Unique per-acquisition identity. Two concurrent acquire attempts can never end up
/// holding the same lease with the same owner token for overlapping time ranges.
pub type OwnerToken = Uuid;

/// Strictly monotonic per-resource generation counter.
pub type FencingToken = i64;

/// Produces leases against a single Postgres pool. One factory is typically shared
/// process-wide; it carries no mutable state beyond the pool handle.
#[derive(Clone)]
pub struct LeaseFactory {
    pool: PgPool,
    table: String,
    /// Fraction of the lease duration at which the background renewer fires.
    renew_fraction: f64,
}

impl LeaseFactory {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            table: "distributed_lock".to_string(),
            renew_fraction: 0.5,
        }
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    /// Attempt to acquire `resource_name` for `duration`. Returns `None` if another
    /// owner currently holds an unexpired lease on the same resource.
    pub async fn acquire(
        &self,
        resource_name: &str,
        duration: StdDuration,
        context_json: Option<serde_json::Value>,
    ) -> Result<Option<Lease>> {
        let owner_token = Uuid::new_v4();
        let seconds = duration.as_secs_f64();

        let sql = format!(
            r#"
            with upsert as (
                insert into {table} (resource_name, owner_token, fencing_token, acquired_at_utc, expires_at_utc, context_json)
                values ($1, $2, 1, now(), now() + ($3 || ' seconds')::interval, $4)
                on conflict (resource_name) do update
                    set owner_token     = excluded.owner_token,
                        fencing_token   = {table}.fencing_token + 1,
                        acquired_at_utc = now(),
                        expires_at_utc  = now() + ($3 || ' seconds')::interval,
                        context_json    = excluded.context_json
                    where {table}.expires_at_utc <= now()
                returning resource_name, owner_token, fencing_token, acquired_at_utc, expires_at_utc
            )
            select * from upsert
            "#,
            table = self.table
        );

        let row = sqlx::query(&sql)
            .bind(resource_name)
            .bind(owner_token)
            .bind(seconds.to_string())
            .bind(context_json)
            .fetch_optional(&self.pool)
            .await
            .context("lease acquire failed")?;

        let Some(row) = row else { return Ok(None) };

        let fencing_token: FencingToken = row.try_get("fencing_token")?;
        let expires_at_utc: DateTime<Utc> = row.try_get("expires_at_utc")?;

        Ok(Some(Lease::spawn(
            self.pool.clone(),
            self.table.clone(),
            resource_name.to_string(),
            owner_token,
            fencing_token,
            expires_at_utc,
            duration,
            self.renew_fraction,
        )))
    }

    /// Read the current state of `resource_name` without attempting to acquire it.
    /// Used by operator-facing status surfaces; returns `None` if nobody currently
    /// holds (or has ever held) the resource.
    pub async fn inspect(&self, resource_name: &str) -> Result<Option<LeaseSnapshot>> {
        let sql = format!(
            "select resource_name, owner_token, fencing_token, expires_at_utc from {} where resource_name = $1",
            self.table
        );
        let row = sqlx::query(&sql)
            .bind(resource_name)
            .fetch_optional(&self.pool)
            .await
            .context("lease inspect failed")?;

        let Some(row) = row else { return Ok(None) };
        Ok(Some(LeaseSnapshot {
            resource_name: row.try_get("resource_name")?,
            owner_token: row.try_get("owner_token")?,
            fencing_token: row.try_get("fencing_token")?,
            expires_at_utc: row.try_get("expires_at_utc")?,
        }))
    }
}

/// Point-in-time read of a `distributed_lock` row, for operator inspection.
#[derive(Debug, Clone)]
pub struct LeaseSnapshot {
    pub resource_name: String,
    pub owner_token: OwnerToken,
    pub fencing_token: FencingToken,
    pub expires_at_utc: DateTime<Utc>,
}

impl LeaseSnapshot {
    pub fn is_held(&self) -> bool {
        self.expires_at_utc > Utc::now()
    }
}

struct Shared {
    pool: PgPool,
    table: String,
    resource_name: String,
    owner_token: OwnerToken,
    lost: AtomicBool,
    fencing_token: AtomicI64,
    released: AtomicBool,
}

/// A held, renewable lease. Dropping it stops the renewer and best-effort releases
/// the row; callers that need to block on release should call [`Lease::release`]
/// explicitly instead.
pub struct Lease {
    shared: Arc<Shared>,
    cancellation: CancellationToken,
    renewer: Option<tokio::task::JoinHandle<()>>,
}

impl Lease {
    #[allow(clippy::too_many_arguments)]
    fn spawn(
        pool: PgPool,
        table: String,
        resource_name: String,
        owner_token: OwnerToken,
        fencing_token: FencingToken,
        expires_at_utc: DateTime<Utc>,
        duration: StdDuration,
        renew_fraction: f64,
    ) -> Self {
        let shared = Arc::new(Shared {
            pool,
            table,
            resource_name,
            owner_token,
            lost: AtomicBool::new(false),
            fencing_token: AtomicI64::new(fencing_token),
            released: AtomicBool::new(false),
        });
        let cancellation = CancellationToken::new();

        let renew_every = duration.mul_f64(renew_fraction.clamp(0.05, 0.95));
        let renewer = tokio::spawn(renew_loop(
            shared.clone(),
            cancellation.clone(),
            renew_every,
            duration,
            expires_at_utc,
        ));

        Self {
            shared,
            cancellation,
            renewer: Some(renewer),
        }
    }

    pub fn resource_name(&self) -> &str {
        &self.shared.resource_name
    }

    pub fn owner_token(&self) -> OwnerToken {
        self.shared.owner_token
    }

    pub fn fencing_token(&self) -> FencingToken {
        self.shared.fencing_token.load(Ordering::SeqCst)
    }

    pub fn cancellation_signal(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Returns `Err` once the renewer has observed that this lease is no longer held.
    pub fn throw_if_lost(&self) -> Result<(), LostLeaseError> {
        if self.shared.lost.load(Ordering::SeqCst) {
            Err(LostLeaseError {
                resource_name: self.shared.resource_name.clone(),
            })
        } else {
            Ok(())
        }
    }

    /// Explicitly release the lease row and stop the renewer. Safe to call more than
    /// once; safe to call after the lease has already been lost.
    pub async fn release(&mut self) {
        if self.shared.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancellation.cancel();
        if let Some(handle) = self.renewer.take() {
            let _ = handle.await;
        }
        let sql = format!(
            "delete from {} where resource_name = $1 and owner_token = $2",
            self.shared.table
        );
        let _ = sqlx::query(&sql)
            .bind(&self.shared.resource_name)
            .bind(self.shared.owner_token)
            .execute(&self.shared.pool)
            .await;
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.shared.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancellation.cancel();
        if let Some(handle) = self.renewer.take() {
            handle.abort();
        }
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let sql = format!(
                "delete from {} where resource_name = $1 and owner_token = $2",
                shared.table
            );
            let _ = sqlx::query(&sql)
                .bind(&shared.resource_name)
                .bind(shared.owner_token)
                .execute(&shared.pool)
                .await;
        });
    }
}

async fn renew_loop(
    shared: Arc<Shared>,
    cancellation: CancellationToken,
    renew_every: StdDuration,
    duration: StdDuration,
    _initial_expiry: DateTime<Utc>,
) {
    let mut interval = tokio::time::interval(renew_every.max(StdDuration::from_millis(10)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancellation.cancelled() => return,
            _ = interval.tick() => {}
        }

        let seconds = duration.as_secs_f64().to_string();
        let sql = format!(
            "update {} set expires_at_utc = now() + ($3 || ' seconds')::interval \
             where resource_name = $1 and owner_token = $2 returning expires_at_utc",
            shared.table
        );
        let result = sqlx::query(&sql)
            .bind(&shared.resource_name)
            .bind(shared.owner_token)
            .bind(&seconds)
            .fetch_optional(&shared.pool)
            .await;

        match result {
            Ok(Some(_row)) => {}
            Ok(None) => {
                tracing::warn!(resource = %shared.resource_name, "lease renewal found no owned row, marking lost");
                shared.lost.store(true, Ordering::SeqCst);
                cancellation.cancel();
                return;
            }
            Err(err) => {
                tracing::warn!(resource = %shared.resource_name, error = %err, "lease renewal query failed, marking lost");
                shared.lost.store(true, Ordering::SeqCst);
                cancellation.cancel();
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_testkit::db::{connect_test_pool, migrate, truncate_all};

    #[tokio::test]
    async fn concurrent_acquire_yields_disjoint_owner_and_strictly_increasing_fencing_tokens() {
        let pool = match connect_test_pool().await {
            Ok(pool) => pool,
            Err(_) => return,
        };
        migrate(&pool).await.unwrap();
        truncate_all(&pool).await.unwrap();

        let factory = LeaseFactory::new(pool.clone());
        let first = factory
            .acquire("scheduler:run", StdDuration::from_millis(50), None)
            .await
            .unwrap()
            .expect("first acquire should win");
        assert_eq!(first.fencing_token(), 1);

        let blocked = factory
            .acquire("scheduler:run", StdDuration::from_secs(5), None)
            .await
            .unwrap();
        assert!(blocked.is_none(), "second acquirer must not win while the first lease is live");

        tokio::time::sleep(StdDuration::from_millis(80)).await;

        let second = factory
            .acquire("scheduler:run", StdDuration::from_secs(5), None)
            .await
            .unwrap()
            .expect("acquire after expiry should win");
        assert!(second.fencing_token() > first.fencing_token());
        assert_ne!(second.owner_token(), first.owner_token());
    }
}
