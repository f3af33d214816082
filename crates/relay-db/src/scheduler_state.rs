use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

/// Conditionally advance the scheduler's fencing token: the write only applies if
/// `new_fencing_token >= CurrentFencingToken`, so a stale scheduler instance that
/// lost its lease and somehow still issues writes cannot roll state backwards.
pub async fn advance(pool: &PgPool, new_fencing_token: i64) -> Result<bool> {
    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        update scheduler_state
           set current_fencing_token = $1,
               last_run_at_utc = now()
         where id = 1 and $1 >= current_fencing_token
        returning id
        "#,
    )
    .bind(new_fencing_token)
    .fetch_optional(pool)
    .await
    .context("scheduler_state advance failed")?;
    Ok(row.is_some())
}

#[derive(Debug, Clone)]
pub struct SchedulerState {
    pub current_fencing_token: i64,
    pub last_run_at_utc: Option<DateTime<Utc>>,
}

pub async fn load(pool: &PgPool) -> Result<SchedulerState> {
    let row = sqlx::query("select current_fencing_token, last_run_at_utc from scheduler_state where id = 1")
        .fetch_one(pool)
        .await
        .context("scheduler_state load failed")?;
    Ok(SchedulerState {
        current_fencing_token: row.try_get("current_fencing_token")?,
        last_run_at_utc: row.try_get("last_run_at_utc")?,
    })
}
