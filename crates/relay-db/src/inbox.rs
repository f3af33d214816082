use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::queue::{QueueTableSpec, Status};

const SPEC: QueueTableSpec = QueueTableSpec {
    table: "inbox",
    id_column: "message_id",
    due_time_column: Some("due_time_utc"),
    order_by_fallback: "first_seen_utc asc",
};

/// Inbox status values read the same as the shared `queue::Status` enum but are
/// named for what they mean in this table (`Dead` instead of `Failed`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxStatus {
    Seen,
    Processing,
    Done,
    Dead,
}

impl InboxStatus {
    fn from_status(s: Status) -> Self {
        match s {
            Status::Ready => InboxStatus::Seen,
            Status::InProgress => InboxStatus::Processing,
            Status::Done => InboxStatus::Done,
            Status::Failed => InboxStatus::Dead,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InboxRow {
    pub source: String,
    pub message_id: String,
    pub topic: String,
    pub payload: Value,
    pub hash: Option<String>,
    pub first_seen_utc: DateTime<Utc>,
    pub last_seen_utc: DateTime<Utc>,
    pub attempts: i32,
    pub status: InboxStatus,
    pub last_error: Option<String>,
    pub due_time_utc: Option<DateTime<Utc>>,
    pub locked_until_utc: Option<DateTime<Utc>>,
    pub owner_token: Option<Uuid>,
}

const COLUMNS: &str = "source, message_id, topic, payload, hash, first_seen_utc, \
    last_seen_utc, attempts, status, last_error, due_time_utc, locked_until_utc, owner_token";

fn row_to_inbox(row: sqlx::postgres::PgRow) -> Result<InboxRow, sqlx::Error> {
    let status: i16 = row.try_get("status")?;
    Ok(InboxRow {
        source: row.try_get("source")?,
        message_id: row.try_get("message_id")?,
        topic: row.try_get("topic")?,
        payload: row.try_get("payload")?,
        hash: row.try_get("hash")?,
        first_seen_utc: row.try_get("first_seen_utc")?,
        last_seen_utc: row.try_get("last_seen_utc")?,
        attempts: row.try_get("attempts")?,
        status: InboxStatus::from_status(Status::from_i16(status)),
        last_error: row.try_get("last_error")?,
        due_time_utc: row.try_get("due_time_utc")?,
        locked_until_utc: row.try_get("locked_until_utc")?,
        owner_token: row.try_get("owner_token")?,
    })
}

/// Idempotent on `(source, message_id)`: a re-enqueue of the same pair is a no-op
/// and returns `Ok(false)`.
pub async fn enqueue(
    pool: &PgPool,
    source: &str,
    message_id: &str,
    topic: &str,
    payload: Value,
    hash: Option<&str>,
    due_time_utc: Option<DateTime<Utc>>,
) -> Result<bool> {
    let row: Option<(String,)> = sqlx::query_as(
        r#"
        insert into inbox (source, message_id, topic, payload, hash, due_time_utc, status)
        values ($1, $2, $3, $4, $5, $6, 0)
        on conflict (source, message_id) do nothing
        returning message_id
        "#,
    )
    .bind(source)
    .bind(message_id)
    .bind(topic)
    .bind(payload)
    .bind(hash)
    .bind(due_time_utc)
    .fetch_optional(pool)
    .await
    .context("inbox enqueue failed")?;

    Ok(row.is_some())
}

/// Fetch the full row for `(source, message_id)`, used by revive to snapshot the
/// prior error before it is overwritten.
pub async fn find_by_key(pool: &PgPool, source: &str, message_id: &str) -> Result<Option<InboxRow>> {
    let sql = format!("select {COLUMNS} from inbox where source = $1 and message_id = $2");
    let row = sqlx::query(&sql)
        .bind(source)
        .bind(message_id)
        .fetch_optional(pool)
        .await
        .context("inbox find_by_key failed")?;
    row.map(row_to_inbox).transpose().map_err(Into::into)
}

pub async fn already_seen(pool: &PgPool, source: &str, message_id: &str) -> Result<bool> {
    let row: Option<(String,)> = sqlx::query_as(
        "select message_id from inbox where source = $1 and message_id = $2",
    )
    .bind(source)
    .bind(message_id)
    .fetch_optional(pool)
    .await
    .context("inbox already_seen failed")?;
    Ok(row.is_some())
}

/// Claim up to `batch_size` Seen rows. Callable only under `runtime-claim`.
#[cfg(feature = "runtime-claim")]
pub async fn claim_batch(
    pool: &PgPool,
    batch_size: i64,
    owner_token: Uuid,
    lease_seconds: i64,
) -> Result<Vec<InboxRow>> {
    if batch_size <= 0 {
        return Ok(Vec::new());
    }

    // Inbox's primary key is the composite (source, message_id), unlike the other
    // three queues' single bigint id, so claim uses its own CTE instead of the
    // shared single-column template.
    let claimed: Vec<(String, String)> = sqlx::query_as(
        r#"
        with to_claim as (
            select source, message_id
            from inbox
            where status = 0
              and (locked_until_utc is null or locked_until_utc <= now())
              and (due_time_utc is null or due_time_utc <= now())
            order by due_time_utc nulls first, first_seen_utc asc
            limit $1
            for update skip locked
        )
        update inbox
           set status = 1,
               owner_token = $2,
               locked_until_utc = now() + ($3 || ' seconds')::interval
         where (source, message_id) in (select source, message_id from to_claim)
        returning source, message_id
        "#,
    )
    .bind(batch_size)
    .bind(owner_token)
    .bind(lease_seconds.to_string())
    .fetch_all(pool)
    .await
    .context("inbox claim_batch failed")?;

    if claimed.is_empty() {
        return Ok(Vec::new());
    }

    // attempts is incremented once per successful claim, distinct from the shared
    // retry_count concept used by the other queues (inbox has no retry_count column).
    let sources: Vec<String> = claimed.iter().map(|(s, _)| s.clone()).collect();
    let ids: Vec<String> = claimed.iter().map(|(_, m)| m.clone()).collect();

    sqlx::query(
        "update inbox set attempts = attempts + 1, last_seen_utc = now() \
         where (source, message_id) in (select * from unnest($1::text[], $2::text[]))",
    )
    .bind(&sources)
    .bind(&ids)
    .execute(pool)
    .await
    .context("inbox claim_batch attempts bump failed")?;

    let sql = format!(
        "select {COLUMNS} from inbox where (source, message_id) in (select * from unnest($1::text[], $2::text[]))"
    );
    let rows = sqlx::query(&sql)
        .bind(&sources)
        .bind(&ids)
        .fetch_all(pool)
        .await
        .context("inbox fetch claimed rows failed")?;
    rows.into_iter().map(|r| row_to_inbox(r).map_err(Into::into)).collect()
}

pub async fn ack(pool: &PgPool, owner_token: Uuid, source: &str, message_id: &str) -> Result<bool> {
    let row: Option<(String,)> = sqlx::query_as(&format!(
        r#"
        update inbox
           set status = {done}, owner_token = null, locked_until_utc = null
         where source = $1 and message_id = $2
           and owner_token = $3 and status = {in_progress}
        returning message_id
        "#,
        done = Status::Done.as_i16(),
        in_progress = Status::InProgress.as_i16(),
    ))
    .bind(source)
    .bind(message_id)
    .bind(owner_token)
    .fetch_optional(pool)
    .await
    .context("inbox ack failed")?;
    Ok(row.is_some())
}

pub async fn abandon(
    pool: &PgPool,
    owner_token: Uuid,
    source: &str,
    message_id: &str,
    last_error: Option<&str>,
    delay_seconds: i64,
) -> Result<bool> {
    if delay_seconds < 0 {
        return Err(anyhow!("delay_seconds must be >= 0"));
    }
    let row: Option<(String,)> = sqlx::query_as(&format!(
        r#"
        update inbox
           set status = {ready},
               owner_token = null,
               locked_until_utc = null,
               last_error = coalesce($4, last_error),
               due_time_utc = case when $5 > 0 then now() + ($5 || ' seconds')::interval else due_time_utc end
         where source = $1 and message_id = $2
           and owner_token = $3 and status = {in_progress}
        returning message_id
        "#,
        ready = Status::Ready.as_i16(),
        in_progress = Status::InProgress.as_i16(),
    ))
    .bind(source)
    .bind(message_id)
    .bind(owner_token)
    .bind(last_error)
    .bind(delay_seconds)
    .fetch_optional(pool)
    .await
    .context("inbox abandon failed")?;
    Ok(row.is_some())
}

pub async fn fail(pool: &PgPool, owner_token: Uuid, source: &str, message_id: &str, reason: &str) -> Result<bool> {
    let row: Option<(String,)> = sqlx::query_as(&format!(
        r#"
        update inbox
           set status = {dead}, owner_token = null, locked_until_utc = null, last_error = $4
         where source = $1 and message_id = $2
           and owner_token = $3 and status = {in_progress}
        returning message_id
        "#,
        dead = Status::Failed.as_i16(),
        in_progress = Status::InProgress.as_i16(),
    ))
    .bind(source)
    .bind(message_id)
    .bind(owner_token)
    .bind(reason)
    .fetch_optional(pool)
    .await
    .context("inbox fail failed")?;
    Ok(row.is_some())
}

pub async fn reap_expired(pool: &PgPool) -> Result<i64> {
    let sql = SPEC.reap_sql();
    let rows: Vec<(String,)> = sqlx::query_as(&sql)
        .fetch_all(pool)
        .await
        .context("inbox reap_expired failed")?;
    Ok(rows.len() as i64)
}

/// Revive Dead rows back to Seen so they will be claimed again.
pub async fn revive(
    pool: &PgPool,
    source: &str,
    message_id: &str,
    reason: Option<&str>,
    delay_seconds: i64,
) -> Result<bool> {
    if delay_seconds < 0 {
        return Err(anyhow!("delay_seconds must be >= 0"));
    }
    let row: Option<(String,)> = sqlx::query_as(&format!(
        r#"
        update inbox
           set status = {ready},
               last_error = coalesce($3, last_error),
               due_time_utc = case when $4 > 0 then now() + ($4 || ' seconds')::interval else null end
         where source = $1 and message_id = $2 and status = {dead}
        returning message_id
        "#,
        ready = Status::Ready.as_i16(),
        dead = Status::Failed.as_i16(),
    ))
    .bind(source)
    .bind(message_id)
    .bind(reason)
    .bind(delay_seconds)
    .fetch_optional(pool)
    .await
    .context("inbox revive failed")?;
    Ok(row.is_some())
}
