use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{Executor, PgPool, Postgres, Row};
use uuid::Uuid;

use crate::queue::{QueueTableSpec, Status};

const SPEC: QueueTableSpec = QueueTableSpec {
    table: "outbox",
    id_column: "id",
    due_time_column: Some("due_time_utc"),
    order_by_fallback: "created_at_utc asc, id asc",
};

#[derive(Debug, Clone)]
pub struct OutboxRow {
    pub id: i64,
    pub topic: String,
    pub payload: Value,
    pub correlation_id: Option<Uuid>,
    pub message_id: String,
    pub created_at_utc: DateTime<Utc>,
    pub due_time_utc: Option<DateTime<Utc>>,
    pub status: Status,
    pub locked_until_utc: Option<DateTime<Utc>>,
    pub owner_token: Option<Uuid>,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub processed_at_utc: Option<DateTime<Utc>>,
    pub processed_by: Option<String>,
}

fn row_to_outbox(row: sqlx::postgres::PgRow) -> Result<OutboxRow, sqlx::Error> {
    let status: i16 = row.try_get("status")?;
    Ok(OutboxRow {
        id: row.try_get("id")?,
        topic: row.try_get("topic")?,
        payload: row.try_get("payload")?,
        correlation_id: row.try_get("correlation_id")?,
        message_id: row.try_get("message_id")?,
        created_at_utc: row.try_get("created_at_utc")?,
        due_time_utc: row.try_get("due_time_utc")?,
        status: Status::from_i16(status),
        locked_until_utc: row.try_get("locked_until_utc")?,
        owner_token: row.try_get("owner_token")?,
        retry_count: row.try_get("retry_count")?,
        last_error: row.try_get("last_error")?,
        processed_at_utc: row.try_get("processed_at_utc")?,
        processed_by: row.try_get("processed_by")?,
    })
}

const COLUMNS: &str = "id, topic, payload, correlation_id, message_id, created_at_utc, \
    due_time_utc, status, locked_until_utc, owner_token, retry_count, last_error, \
    processed_at_utc, processed_by";

/// Append a Ready message. Participates in the caller's transaction when `executor`
/// is a `Transaction`/`PgConnection` instead of the pool, so the enqueue commits (or
/// rolls back) atomically with whatever business state produced it.
///
/// Idempotent on `message_id`: a repeat enqueue with the same id returns `Ok(None)`
/// without creating a second row.
pub async fn enqueue<'e, E>(
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
    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        insert into outbox (topic, payload, correlation_id, message_id, due_time_utc, status)
        values ($1, $2, $3, $4, $5, 0)
        on conflict (message_id) do nothing
        returning id
        "#,
    )
    .bind(topic)
    .bind(payload)
    .bind(correlation_id)
    .bind(message_id)
    .bind(due_time_utc)
    .fetch_optional(executor)
    .await
    .context("outbox enqueue failed")?;

    Ok(row.map(|(id,)| id))
}

/// Claim up to `batch_size` Ready rows for `owner_token`, holding them for
/// `lease_seconds`. Only callable from the crate compiled with `runtime-claim`.
#[cfg(feature = "runtime-claim")]
pub async fn claim_batch(
    pool: &PgPool,
    batch_size: i64,
    owner_token: Uuid,
    lease_seconds: i64,
) -> Result<Vec<OutboxRow>> {
    if batch_size <= 0 {
        return Ok(Vec::new());
    }

    let sql = SPEC.claim_sql();
    let claimed_ids: Vec<(i64,)> = sqlx::query_as(&sql)
        .bind(batch_size)
        .bind(owner_token)
        .bind(lease_seconds.to_string())
        .fetch_all(pool)
        .await
        .context("outbox claim_batch failed")?;

    if claimed_ids.is_empty() {
        return Ok(Vec::new());
    }
    let ids: Vec<i64> = claimed_ids.into_iter().map(|(id,)| id).collect();
    fetch_by_ids(pool, &ids).await
}

async fn fetch_by_ids(pool: &PgPool, ids: &[i64]) -> Result<Vec<OutboxRow>> {
    let sql = format!("select {COLUMNS} from outbox where id = any($1) order by id asc");
    let rows = sqlx::query(&sql)
        .bind(ids)
        .fetch_all(pool)
        .await
        .context("outbox fetch_by_ids failed")?;
    rows.into_iter().map(|r| row_to_outbox(r).map_err(Into::into)).collect()
}

pub async fn ack(pool: &PgPool, owner_token: Uuid, ids: &[i64]) -> Result<Vec<i64>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let rows: Vec<(i64,)> = sqlx::query_as(&format!(
        r#"
        update outbox
           set status = {done},
               owner_token = null,
               locked_until_utc = null,
               processed_at_utc = now(),
               processed_by = $2::text
         where id = any($1)
           and owner_token = $2
           and status = {in_progress}
        returning id
        "#,
        done = Status::Done.as_i16(),
        in_progress = Status::InProgress.as_i16(),
    ))
    .bind(ids)
    .bind(owner_token)
    .fetch_all(pool)
    .await
    .context("outbox ack failed")?;
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
        .context("outbox abandon failed")?;
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
        .context("outbox fail failed")?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Restore rows abandoned by a crashed worker (lease expired without a terminal
/// transition). Safe to call on a schedule independent of claim.
pub async fn reap_expired(pool: &PgPool) -> Result<Vec<i64>> {
    let sql = SPEC.reap_sql();
    let rows: Vec<(i64,)> = sqlx::query_as(&sql)
        .fetch_all(pool)
        .await
        .context("outbox reap_expired failed")?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Rows that have not reached a terminal state, for recovery/inspection tooling.
pub async fn list_unacked(pool: &PgPool, limit: i64) -> Result<Vec<OutboxRow>> {
    let sql = format!(
        "select {COLUMNS} from outbox where status <> {done} order by id asc limit $1",
        done = Status::Done.as_i16()
    );
    let rows = sqlx::query(&sql)
        .bind(limit)
        .fetch_all(pool)
        .await
        .context("outbox list_unacked failed")?;
    rows.into_iter().map(|r| row_to_outbox(r).map_err(Into::into)).collect()
}

pub async fn fetch_by_message_id(pool: &PgPool, message_id: &str) -> Result<Option<OutboxRow>> {
    let sql = format!("select {COLUMNS} from outbox where message_id = $1");
    let row = sqlx::query(&sql)
        .bind(message_id)
        .fetch_optional(pool)
        .await
        .context("outbox fetch_by_message_id failed")?;
    row.map(row_to_outbox).transpose().map_err(Into::into)
}
