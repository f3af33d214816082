//! `relay inbox enqueue` / `relay inbox revive`

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

pub async fn enqueue(
    pool: &PgPool,
    source: &str,
    message_id: &str,
    topic: &str,
    payload: serde_json::Value,
    hash: Option<String>,
    due_time_utc: Option<DateTime<Utc>>,
) -> Result<()> {
    let enqueued = relay_db::inbox::enqueue(pool, source, message_id, topic, payload, hash.as_deref(), due_time_utc).await?;
    println!("enqueued={enqueued}");
    Ok(())
}

pub async fn revive(pool: &PgPool, source: &str, message_id: &str, reason: Option<String>, delay_seconds: i64) -> Result<()> {
    let revived = relay_db::inbox::revive(pool, source, message_id, reason.as_deref(), delay_seconds).await?;
    println!("revived={revived}");
    Ok(())
}
