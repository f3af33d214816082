use anyhow::Context;
use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

#[derive(Debug, Clone)]
pub struct FanoutPolicyRow {
    pub fanout_topic: String,
    pub work_key: String,
    pub default_every_seconds: i32,
    pub jitter_seconds: i32,
}

pub async fn upsert_policy(
    pool: &PgPool,
    fanout_topic: &str,
    work_key: &str,
    default_every_seconds: i32,
    jitter_seconds: i32,
) -> Result<()> {
    sqlx::query(
        r#"
        insert into fanout_policy (fanout_topic, work_key, default_every_seconds, jitter_seconds)
        values ($1, $2, $3, $4)
        on conflict (fanout_topic, work_key) do update
            set default_every_seconds = excluded.default_every_seconds,
                jitter_seconds = excluded.jitter_seconds
        "#,
    )
    .bind(fanout_topic)
    .bind(work_key)
    .bind(default_every_seconds)
    .bind(jitter_seconds)
    .execute(pool)
    .await
    .context("fanout upsert_policy failed")?;
    Ok(())
}

pub async fn load_policy(pool: &PgPool, fanout_topic: &str, work_key: &str) -> Result<Option<FanoutPolicyRow>> {
    let row = sqlx::query(
        "select fanout_topic, work_key, default_every_seconds, jitter_seconds \
         from fanout_policy where fanout_topic = $1 and work_key = $2",
    )
    .bind(fanout_topic)
    .bind(work_key)
    .fetch_optional(pool)
    .await
    .context("fanout load_policy failed")?;
    row.map(|r| {
        Ok(FanoutPolicyRow {
            fanout_topic: r.try_get("fanout_topic")?,
            work_key: r.try_get("work_key")?,
            default_every_seconds: r.try_get("default_every_seconds")?,
            jitter_seconds: r.try_get("jitter_seconds")?,
        })
    })
    .transpose()
}

pub async fn load_cursor(
    pool: &PgPool,
    fanout_topic: &str,
    work_key: &str,
    shard_key: &str,
) -> Result<Option<DateTime<Utc>>> {
    let row: Option<(Option<DateTime<Utc>>,)> = sqlx::query_as(
        "select last_completed_at_utc from fanout_cursor \
         where fanout_topic = $1 and work_key = $2 and shard_key = $3",
    )
    .bind(fanout_topic)
    .bind(work_key)
    .bind(shard_key)
    .fetch_optional(pool)
    .await
    .context("fanout load_cursor failed")?;
    Ok(row.and_then(|(t,)| t))
}

pub async fn advance_cursor(
    pool: &PgPool,
    fanout_topic: &str,
    work_key: &str,
    shard_key: &str,
    completed_at_utc: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        insert into fanout_cursor (fanout_topic, work_key, shard_key, last_completed_at_utc)
        values ($1, $2, $3, $4)
        on conflict (fanout_topic, work_key, shard_key) do update
            set last_completed_at_utc = excluded.last_completed_at_utc
        "#,
    )
    .bind(fanout_topic)
    .bind(work_key)
    .bind(shard_key)
    .bind(completed_at_utc)
    .execute(pool)
    .await
    .context("fanout advance_cursor failed")?;
    Ok(())
}
