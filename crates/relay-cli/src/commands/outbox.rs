//! `relay outbox enqueue`

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

pub async fn enqueue(
    pool: &PgPool,
    topic: &str,
    message_id: &str,
    payload: serde_json::Value,
    correlation_id: Option<Uuid>,
    due_time_utc: Option<DateTime<Utc>>,
) -> Result<()> {
    let id = relay_db::outbox::enqueue(pool, topic, payload, message_id, correlation_id, due_time_utc).await?;
    match id {
        Some(id) => println!("enqueued=true id={id}"),
        None => println!("enqueued=false reason=duplicate_message_id"),
    }
    Ok(())
}
