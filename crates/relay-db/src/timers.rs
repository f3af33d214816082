use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{Executor, PgPool, Postgres, Row};
use uuid::Uuid;

use crate::queue::{QueueTableSpec, Status};

const SPEC: QueueTableSpec = QueueTableSpec {
    table: "timers",
    id_column: "id",
    due_time_column: Some("due_time_utc"),
    order_by_fallback: "due_time_utc asc, id asc",
};

#[derive(Debug, Clone)]
pub struct TimerRow {
    pub id: i64,
    pub topic: String,
    pub payload: Value,
    pub due_time_utc: DateTime<Utc>,
    pub correlation_id: Option<Uuid>,
    pub status: Status,
    pub locked_until_utc: Option<DateTime<Utc>>,
    pub owner_token: Option<Uuid>,
    pub retry_count: i32,
    pub last_error: Option<String>,
}

const COLUMNS: &str = "id, topic, payload, due_time_utc, correlation_id, status, \
    locked_until_utc, owner_token, retry_count, last_error";

fn row_to_timer(row: sqlx::postgres::PgRow) -> Result<TimerRow, sqlx::Error> {
    let status: i16 = row.try_get("status")?;
    Ok(TimerRow {
        id: row.try_get("id")?,
        topic: row.try_get("topic")?,
        payload: row.try_get("payload")?,
        due_time_utc: row.try_get("due_time_utc")?,
        correlation_id: row.try_get("correlation_id")?,
        status: Status::from_i16(status),
        locked_until_utc: row.try_get("locked_until_utc")?,
        owner_token: row.try_get("owner_token")?,
        retry_count: row.try_get("retry_count")?,
        last_error: row.try_get("last_error")?,
    })
}

pub async fn schedule<'e, E>(
    executor: E,
    topic: &str,
    payload: Value,
    due_time_utc: DateTime<Utc>,
    correlation_id: Option<Uuid>,
) -> Result<i64>
where
    E: Executor<'e, Database = Postgres>,
{
    let (id,): (i64,) = sqlx::query_as(
        r#"
        insert into timers (topic, payload, due_time_utc, correlation_id, status)
        values ($1, $2, $3, $4, 0)
        returning id
        "#,
    )
    .bind(topic)
    .bind(payload)
    .bind(due_time_utc)
    .bind(correlation_id)
    .fetch_one(executor)
    .await
    .context("timer schedule failed")?;
    Ok(id)
}

pub async fn cancel(pool: &PgPool, id: i64) -> Result<bool> {
    let row: Option<(i64,)> = sqlx::query_as(&format!(
        "delete from timers where id = $1 and status = {ready} returning id",
        ready = Status::Ready.as_i16(),
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("timer cancel failed")?;
    Ok(row.is_some())
}

/// `fencing_token` must be the caller's current scheduler lease fencing token; the
/// claim only succeeds if it is still `>=` `scheduler_state.current_fencing_token`
/// (§4.5's stale-scheduler guard), so a scheduler instance superseded by a newer one
/// between its own `advance()` call and this claim cannot dispatch the same timer
/// twice.
#[cfg(feature = "runtime-claim")]
pub async fn claim_due(
    pool: &PgPool,
    batch_size: i64,
    owner_token: Uuid,
    lease_seconds: i64,
    fencing_token: i64,
) -> Result<Vec<TimerRow>> {
    if batch_size <= 0 {
        return Ok(Vec::new());
    }
    let sql = SPEC.claim_sql_fenced();
    let claimed: Vec<(i64,)> = sqlx::query_as(&sql)
        .bind(batch_size)
        .bind(owner_token)
        .bind(lease_seconds.to_string())
        .bind(fencing_token)
        .fetch_all(pool)
        .await
        .context("timer claim_due failed")?;
    if claimed.is_empty() {
        return Ok(Vec::new());
    }
    let ids: Vec<i64> = claimed.into_iter().map(|(id,)| id).collect();
    let sql = format!("select {COLUMNS} from timers where id = any($1) order by id asc");
    let rows = sqlx::query(&sql)
        .bind(&ids)
        .fetch_all(pool)
        .await
        .context("timer fetch claimed rows failed")?;
    rows.into_iter().map(|r| row_to_timer(r).map_err(Into::into)).collect()
}

/// Generic over `Executor` so a timer can be acked in the same transaction as the
/// outbox message it produced (§4.5 step 5: "enqueue ... in the same transaction;
/// Ack the timer").
pub async fn ack<'e, E>(executor: E, owner_token: Uuid, ids: &[i64]) -> Result<Vec<i64>>
where
    E: Executor<'e, Database = Postgres>,
{
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let sql = SPEC.ack_sql();
    let rows: Vec<(i64,)> = sqlx::query_as(&sql)
        .bind(ids)
        .bind(owner_token)
        .fetch_all(executor)
        .await
        .context("timer ack failed")?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

pub async fn abandon(
    pool: &PgPool,
    owner_token: Uuid,
    ids: &[i64],
    last_error: Option<&str>,
    delay_seconds: i64,
) -> Result<Vec<i64>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    if delay_seconds < 0 {
        return Err(anyhow!("delay_seconds must be >= 0"));
    }
    let sql = SPEC.abandon_sql();
    let rows: Vec<(i64,)> = sqlx::query_as(&sql)
        .bind(ids)
        .bind(owner_token)
        .bind(last_error)
        .bind(delay_seconds)
        .fetch_all(pool)
        .await
        .context("timer abandon failed")?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

pub async fn fail(pool: &PgPool, owner_token: Uuid, ids: &[i64], reason: &str) -> Result<Vec<i64>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let sql = SPEC.fail_sql();
    let rows: Vec<(i64,)> = sqlx::query_as(&sql)
        .bind(ids)
        .bind(owner_token)
        .bind(reason)
        .fetch_all(pool)
        .await
        .context("timer fail failed")?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

pub async fn reap_expired(pool: &PgPool) -> Result<Vec<i64>> {
    let sql = SPEC.reap_sql();
    let rows: Vec<(i64,)> = sqlx::query_as(&sql)
        .fetch_all(pool)
        .await
        .context("timer reap_expired failed")?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Earliest still-pending due time, used by the scheduler loop to size its sleep.
pub async fn earliest_due(pool: &PgPool) -> Result<Option<DateTime<Utc>>> {
    let row: Option<(Option<DateTime<Utc>>,)> = sqlx::query_as(&format!(
        "select min(due_time_utc) from timers where status = {ready}",
        ready = Status::Ready.as_i16(),
    ))
    .fetch_optional(pool)
    .await
    .context("timer earliest_due failed")?;
    Ok(row.and_then(|(t,)| t))
}
