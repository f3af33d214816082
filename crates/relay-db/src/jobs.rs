use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{Executor, PgPool, Postgres, Row};
use uuid::Uuid;

use crate::queue::{QueueTableSpec, Status};

const JOB_RUN_SPEC: QueueTableSpec = QueueTableSpec {
    table: "job_runs",
    id_column: "id",
    due_time_column: Some("scheduled_time_utc"),
    order_by_fallback: "scheduled_time_utc asc, id asc",
};

#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: i64,
    pub job_name: String,
    pub topic: String,
    pub payload: Option<Value>,
    pub cron_schedule: String,
    pub is_enabled: bool,
    pub next_due_time_utc: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct JobRunRow {
    pub id: i64,
    pub job_id: i64,
    pub scheduled_time_utc: DateTime<Utc>,
    pub status: Status,
    pub locked_until_utc: Option<DateTime<Utc>>,
    pub owner_token: Option<Uuid>,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub start_time_utc: Option<DateTime<Utc>>,
    pub end_time_utc: Option<DateTime<Utc>>,
}

fn row_to_job(row: sqlx::postgres::PgRow) -> Result<JobRow, sqlx::Error> {
    Ok(JobRow {
        id: row.try_get("id")?,
        job_name: row.try_get("job_name")?,
        topic: row.try_get("topic")?,
        payload: row.try_get("payload")?,
        cron_schedule: row.try_get("cron_schedule")?,
        is_enabled: row.try_get("is_enabled")?,
        next_due_time_utc: row.try_get("next_due_time_utc")?,
    })
}

fn row_to_job_run(row: sqlx::postgres::PgRow) -> Result<JobRunRow, sqlx::Error> {
    let status: i16 = row.try_get("status")?;
    Ok(JobRunRow {
        id: row.try_get("id")?,
        job_id: row.try_get("job_id")?,
        scheduled_time_utc: row.try_get("scheduled_time_utc")?,
        status: Status::from_i16(status),
        locked_until_utc: row.try_get("locked_until_utc")?,
        owner_token: row.try_get("owner_token")?,
        retry_count: row.try_get("retry_count")?,
        last_error: row.try_get("last_error")?,
        start_time_utc: row.try_get("start_time_utc")?,
        end_time_utc: row.try_get("end_time_utc")?,
    })
}

/// Idempotent on `job_name`: a second call with the same name updates the existing
/// row's topic/cron/payload rather than creating a duplicate.
pub async fn create_or_update(
    pool: &PgPool,
    job_name: &str,
    topic: &str,
    cron_schedule: &str,
    payload: Option<Value>,
    next_due_time_utc: DateTime<Utc>,
) -> Result<i64> {
    let (id,): (i64,) = sqlx::query_as(
        r#"
        insert into jobs (job_name, topic, payload, cron_schedule, is_enabled, next_due_time_utc)
        values ($1, $2, $3, $4, true, $5)
        on conflict (job_name) do update
            set topic = excluded.topic,
                payload = excluded.payload,
                cron_schedule = excluded.cron_schedule,
                is_enabled = true
        returning id
        "#,
    )
    .bind(job_name)
    .bind(topic)
    .bind(payload)
    .bind(cron_schedule)
    .bind(next_due_time_utc)
    .fetch_one(pool)
    .await
    .context("job create_or_update failed")?;
    Ok(id)
}

pub async fn delete(pool: &PgPool, job_name: &str) -> Result<bool> {
    let row: Option<(i64,)> = sqlx::query_as("delete from jobs where job_name = $1 returning id")
        .bind(job_name)
        .fetch_optional(pool)
        .await
        .context("job delete failed")?;
    Ok(row.is_some())
}

pub async fn find_by_name(pool: &PgPool, job_name: &str) -> Result<Option<JobRow>> {
    let row = sqlx::query(
        "select id, job_name, topic, payload, cron_schedule, is_enabled, next_due_time_utc \
         from jobs where job_name = $1",
    )
    .bind(job_name)
    .fetch_optional(pool)
    .await
    .context("job find_by_name failed")?;
    row.map(row_to_job).transpose().map_err(Into::into)
}

/// Jobs whose `next_due_time_utc` has arrived, locked for the caller's transaction so
/// two concurrent scheduler instances don't both advance the same job.
pub async fn due_jobs<'c>(
    txn: &mut sqlx::Transaction<'c, sqlx::Postgres>,
) -> Result<Vec<JobRow>> {
    let rows = sqlx::query(
        r#"
        select id, job_name, topic, payload, cron_schedule, is_enabled, next_due_time_utc
        from jobs
        where is_enabled and next_due_time_utc <= now()
        order by id asc
        for update skip locked
        "#,
    )
    .fetch_all(&mut **txn)
    .await
    .context("job due_jobs failed")?;
    rows.into_iter().map(|r| row_to_job(r).map_err(Into::into)).collect()
}

pub async fn advance_next_due_time<'c>(
    txn: &mut sqlx::Transaction<'c, sqlx::Postgres>,
    job_id: i64,
    next_due_time_utc: DateTime<Utc>,
) -> Result<()> {
    sqlx::query("update jobs set next_due_time_utc = $2 where id = $1")
        .bind(job_id)
        .bind(next_due_time_utc)
        .execute(&mut **txn)
        .await
        .context("job advance_next_due_time failed")?;
    Ok(())
}

/// Insert exactly one run for `(job_id, scheduled_time_utc)`; a repeat tick for the
/// same scheduled time is a no-op.
pub async fn insert_run<'c>(
    txn: &mut sqlx::Transaction<'c, sqlx::Postgres>,
    job_id: i64,
    scheduled_time_utc: DateTime<Utc>,
) -> Result<Option<i64>> {
    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        insert into job_runs (job_id, scheduled_time_utc, status)
        values ($1, $2, 0)
        on conflict (job_id, scheduled_time_utc) do nothing
        returning id
        "#,
    )
    .bind(job_id)
    .bind(scheduled_time_utc)
    .fetch_optional(&mut **txn)
    .await
    .context("job_run insert_run failed")?;
    Ok(row.map(|(id,)| id))
}

/// See `timers::claim_due`'s doc comment for the `fencing_token` contract — identical
/// stale-scheduler guard, applied to `job_runs` instead of `timers`.
#[cfg(feature = "runtime-claim")]
pub async fn claim_due_runs(
    pool: &PgPool,
    batch_size: i64,
    owner_token: Uuid,
    lease_seconds: i64,
    fencing_token: i64,
) -> Result<Vec<JobRunRow>> {
    if batch_size <= 0 {
        return Ok(Vec::new());
    }
    let sql = JOB_RUN_SPEC.claim_sql_fenced();
    let claimed: Vec<(i64,)> = sqlx::query_as(&sql)
        .bind(batch_size)
        .bind(owner_token)
        .bind(lease_seconds.to_string())
        .bind(fencing_token)
        .fetch_all(pool)
        .await
        .context("job_run claim_due_runs failed")?;
    if claimed.is_empty() {
        return Ok(Vec::new());
    }
    let ids: Vec<i64> = claimed.into_iter().map(|(id,)| id).collect();
    let rows = sqlx::query(
        "select id, job_id, scheduled_time_utc, status, locked_until_utc, owner_token, \
         retry_count, last_error, start_time_utc, end_time_utc \
         from job_runs where id = any($1) order by id asc",
    )
    .bind(&ids)
    .fetch_all(pool)
    .await
    .context("job_run fetch claimed rows failed")?;
    rows.into_iter().map(|r| row_to_job_run(r).map_err(Into::into)).collect()
}

/// Generic over `Executor` so a job-run can be acked in the same transaction as the
/// outbox message it produced, mirroring `timers::ack`.
pub async fn ack<'e, E>(executor: E, owner_token: Uuid, ids: &[i64]) -> Result<Vec<i64>>
where
    E: Executor<'e, Database = Postgres>,
{
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let rows: Vec<(i64,)> = sqlx::query_as(&format!(
        r#"
        update job_runs
           set status = {done}, owner_token = null, locked_until_utc = null, end_time_utc = now()
         where id = any($1) and owner_token = $2 and status = {in_progress}
        returning id
        "#,
        done = Status::Done.as_i16(),
        in_progress = Status::InProgress.as_i16(),
    ))
    .bind(ids)
    .bind(owner_token)
    .fetch_all(executor)
    .await
    .context("job_run ack failed")?;
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
    let sql = JOB_RUN_SPEC.abandon_sql();
    let rows: Vec<(i64,)> = sqlx::query_as(&sql)
        .bind(ids)
        .bind(owner_token)
        .bind(last_error)
        .bind(delay_seconds)
        .fetch_all(pool)
        .await
        .context("job_run abandon failed")?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

pub async fn fail(pool: &PgPool, owner_token: Uuid, ids: &[i64], reason: &str) -> Result<Vec<i64>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let sql = JOB_RUN_SPEC.fail_sql();
    let rows: Vec<(i64,)> = sqlx::query_as(&sql)
        .bind(ids)
        .bind(owner_token)
        .bind(reason)
        .fetch_all(pool)
        .await
        .context("job_run fail failed")?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

pub async fn reap_expired(pool: &PgPool) -> Result<Vec<i64>> {
    let sql = JOB_RUN_SPEC.reap_sql();
    let rows: Vec<(i64,)> = sqlx::query_as(&sql)
        .fetch_all(pool)
        .await
        .context("job_run reap_expired failed")?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

pub async fn earliest_pending(pool: &PgPool) -> Result<Option<DateTime<Utc>>> {
    let row: Option<(Option<DateTime<Utc>>,)> = sqlx::query_as(&format!(
        "select min(scheduled_time_utc) from job_runs where status = {ready}",
        ready = Status::Ready.as_i16(),
    ))
    .fetch_optional(pool)
    .await
    .context("job_run earliest_pending failed")?;
    Ok(row.and_then(|(t,)| t))
}

/// Earliest `next_due_time_utc` across all enabled jobs, regardless of whether a
/// `JobRun` has been materialized for it yet. §4.5 step 7 folds this into the
/// scheduler's next-wake-up computation so the loop doesn't oversleep past a job
/// that's about to come due but hasn't produced a run row yet.
pub async fn earliest_next_due_time(pool: &PgPool) -> Result<Option<DateTime<Utc>>> {
    let row: Option<(Option<DateTime<Utc>>,)> =
        sqlx::query_as("select min(next_due_time_utc) from jobs where is_enabled")
            .fetch_optional(pool)
            .await
            .context("job earliest_next_due_time failed")?;
    Ok(row.and_then(|(t,)| t))
}

/// Trigger an immediate out-of-band run regardless of the job's own cron cadence.
pub async fn trigger_now(pool: &PgPool, job_name: &str) -> Result<i64> {
    let job = find_by_name(pool, job_name)
        .await?
        .ok_or_else(|| anyhow!("no job named {job_name}"))?;
    let mut txn = pool.begin().await.context("trigger_now begin failed")?;
    let now = Utc::now();
    let id = loop {
        if let Some(id) = insert_run(&mut txn, job.id, now).await? {
            break id;
        }
        // scheduled_time_utc collided with an existing run at the same instant;
        // nudge by a microsecond so manual triggers never silently no-op.
        let bumped = now + chrono::Duration::microseconds(1);
        if let Some(id) = insert_run(&mut txn, job.id, bumped).await? {
            break id;
        }
        return Err(anyhow!("could not create trigger run for {job_name}"));
    };
    txn.commit().await.context("trigger_now commit failed")?;
    Ok(id)
}
