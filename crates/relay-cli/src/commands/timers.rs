//! `relay scheduler timer`

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

pub async fn schedule(
    pool: &PgPool,
    topic: &str,
    payload: serde_json::Value,
    due_time_utc: DateTime<Utc>,
    correlation_id: Option<Uuid>,
) -> Result<()> {
    let id = relay_db::timers::schedule(pool, topic, payload, due_time_utc, correlation_id).await?;
    println!("timer_id={id}");
    Ok(())
}
