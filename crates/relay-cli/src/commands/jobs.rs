//! `relay scheduler job` / `relay scheduler trigger`

use anyhow::Result;
use sqlx::PgPool;

pub async fn create_or_update(
    pool: &PgPool,
    job_name: &str,
    topic: &str,
    cron_schedule: &str,
    payload: Option<serde_json::Value>,
) -> Result<()> {
    let normalized = relay_runtime::normalize_cron(cron_schedule)?;
    let next_due_time_utc = relay_runtime::next_occurrence(&normalized, chrono::Utc::now())?;
    let id = relay_db::jobs::create_or_update(pool, job_name, topic, &normalized, payload, next_due_time_utc).await?;
    println!("job_id={id} next_due_time_utc={next_due_time_utc}");
    Ok(())
}

pub async fn trigger(pool: &PgPool, job_name: &str) -> Result<()> {
    let run_id = relay_db::jobs::trigger_now(pool, job_name).await?;
    println!("run_id={run_id}");
    Ok(())
}
