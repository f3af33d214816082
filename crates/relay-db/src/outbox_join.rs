//! Sidecar that lets a caller track completion of a fan-out group of outbox
//! messages (e.g. "all N shard slices for this fanout round"). Ack/Fail of a member
//! message increments the matching join counter exactly once, guarded by each
//! member row's own `completed_at_utc IS NULL -> NOT NULL` transition rather than a
//! time-based debounce window.

use anyhow::Context;
use anyhow::Result;
use sqlx::{PgPool, Row};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinStatus {
    Pending,
    Completed,
    Failed,
}

impl JoinStatus {
    fn from_i16(v: i16) -> Self {
        match v {
            1 => JoinStatus::Completed,
            2 => JoinStatus::Failed,
            _ => JoinStatus::Pending,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JoinRow {
    pub id: i64,
    pub expected_steps: i32,
    pub completed_steps: i32,
    pub failed_steps: i32,
    pub status: JoinStatus,
}

pub async fn create(pool: &PgPool, expected_steps: i32, member_outbox_ids: &[i64]) -> Result<i64> {
    let mut txn = pool.begin().await.context("outbox_join create begin failed")?;
    let (join_id,): (i64,) = sqlx::query_as(
        "insert into outbox_join (expected_steps, completed_steps, failed_steps, status) \
         values ($1, 0, 0, 0) returning id",
    )
    .bind(expected_steps)
    .fetch_one(&mut *txn)
    .await
    .context("outbox_join insert failed")?;

    for outbox_id in member_outbox_ids {
        sqlx::query(
            "insert into outbox_join_member (join_id, outbox_message_id) values ($1, $2)",
        )
        .bind(join_id)
        .bind(outbox_id)
        .execute(&mut *txn)
        .await
        .context("outbox_join_member insert failed")?;
    }

    txn.commit().await.context("outbox_join create commit failed")?;
    Ok(join_id)
}

/// Record that `outbox_message_id` completed (successfully or not) within its join,
/// if it belongs to one. Each member can only ever count once.
pub async fn record_member_completion(pool: &PgPool, outbox_message_id: i64, succeeded: bool) -> Result<()> {
    let mut txn = pool.begin().await.context("record_member_completion begin failed")?;

    let member: Option<(i64,)> = sqlx::query_as(
        "update outbox_join_member set completed_at_utc = now() \
         where outbox_message_id = $1 and completed_at_utc is null \
         returning join_id",
    )
    .bind(outbox_message_id)
    .fetch_optional(&mut *txn)
    .await
    .context("outbox_join_member completion update failed")?;

    let Some((join_id,)) = member else {
        txn.commit().await?;
        return Ok(());
    };

    let counter_column = if succeeded { "completed_steps" } else { "failed_steps" };
    sqlx::query(&format!(
        "update outbox_join set {counter_column} = {counter_column} + 1 where id = $1"
    ))
    .bind(join_id)
    .execute(&mut *txn)
    .await
    .context("outbox_join counter update failed")?;

    sqlx::query(
        r#"
        update outbox_join
           set status = case
               when failed_steps > 0 then 2
               when completed_steps >= expected_steps then 1
               else 0
           end
         where id = $1
        "#,
    )
    .bind(join_id)
    .execute(&mut *txn)
    .await
    .context("outbox_join status update failed")?;

    txn.commit().await.context("record_member_completion commit failed")?;
    Ok(())
}

pub async fn load(pool: &PgPool, join_id: i64) -> Result<Option<JoinRow>> {
    let row = sqlx::query(
        "select id, expected_steps, completed_steps, failed_steps, status from outbox_join where id = $1",
    )
    .bind(join_id)
    .fetch_optional(pool)
    .await
    .context("outbox_join load failed")?;
    row.map(|r| {
        let status: i16 = r.try_get("status")?;
        Ok(JoinRow {
            id: r.try_get("id")?,
            expected_steps: r.try_get("expected_steps")?,
            completed_steps: r.try_get("completed_steps")?,
            failed_steps: r.try_get("failed_steps")?,
            status: JoinStatus::from_i16(status),
        })
    })
    .transpose()
}
