use anyhow::{Context, Result};
use sqlx::PgPool;

pub use relay_db::migrate;

/// Connect using `RELAY_DATABASE_URL`. Scenario tests that need a live database call
/// this at the top of the test body and return early (treating "no database
/// configured" as a skip, not a failure) when it errors, matching how these tests run
/// both in CI (with a database) and on a bare developer machine.
pub async fn connect_test_pool() -> Result<PgPool> {
    relay_db::connect_from_env().await
}

/// Wipe every core table between tests sharing a database. Order matters because of
/// the `job_runs -> jobs` and `outbox_join_member -> outbox_join`/`outbox` foreign
/// keys.
pub async fn truncate_all(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        truncate table
            outbox_join_member,
            outbox_join,
            outbox,
            inbox,
            job_runs,
            jobs,
            timers,
            scheduler_state,
            distributed_lock,
            fanout_cursor,
            fanout_policy
        "#,
    )
    .execute(pool)
    .await
    .context("truncate_all failed")?;

    sqlx::query("insert into scheduler_state (id, current_fencing_token) values (1, 0)")
        .execute(pool)
        .await
        .context("truncate_all reseed scheduler_state failed")?;

    Ok(())
}
