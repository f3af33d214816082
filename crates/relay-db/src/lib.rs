// crates/relay-db/src/lib.rs
use anyhow::Context;
use anyhow::Result;
use sqlx::{postgres::PgPoolOptions, PgPool};

pub const ENV_DB_URL: &str = "RELAY_DATABASE_URL";

pub mod fanout;
pub mod inbox;
pub mod jobs;
pub mod outbox;
pub mod outbox_join;
pub mod queue;
pub mod scheduler_state;
pub mod timers;

pub use queue::Status;

/// Connect to Postgres using RELAY_DATABASE_URL.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .context("failed to connect to Postgres")?;

    Ok(pool)
}

/// Test helper used by integration tests:
/// - Connect using RELAY_DATABASE_URL
/// - Ensure migrations are applied
pub async fn testkit_db_pool() -> Result<PgPool> {
    let pool = connect_from_env().await?;
    migrate(&pool).await?;
    Ok(pool)
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

/// Simple status query (connectivity + schema presence).
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as::<_, (i32,)>("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;
    let ok = one == 1;

    let (exists,): (bool,) = sqlx::query_as::<_, (bool,)>(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema='public' and table_name='outbox'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok,
        has_core_tables: exists,
    })
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_core_tables: bool,
}

/// Ready/in-flight row counts for one queue table, used by operator status surfaces.
#[derive(Debug, Clone, Copy, Default, serde::Serialize, serde::Deserialize)]
pub struct QueueDepth {
    pub ready: i64,
    pub in_progress: i64,
    pub failed: i64,
}

async fn queue_depth(pool: &PgPool, table: &str) -> Result<QueueDepth> {
    let sql = format!(
        "select \
           count(*) filter (where status = 0) as ready, \
           count(*) filter (where status = 1) as in_progress, \
           count(*) filter (where status = 3) as failed \
         from {table}"
    );
    let (ready, in_progress, failed): (i64, i64, i64) =
        sqlx::query_as(&sql).fetch_one(pool).await.with_context(|| format!("queue_depth({table}) failed"))?;
    Ok(QueueDepth { ready, in_progress, failed })
}

/// Depth summary across every queue table, for `/v1/status` surfaces (§4.7, §6).
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct QueueDepthSummary {
    pub outbox: QueueDepth,
    pub inbox: QueueDepth,
    pub timers: QueueDepth,
    pub job_runs: QueueDepth,
}

pub async fn queue_depth_summary(pool: &PgPool) -> Result<QueueDepthSummary> {
    Ok(QueueDepthSummary {
        outbox: queue_depth(pool, "outbox").await?,
        inbox: queue_depth(pool, "inbox").await?,
        timers: queue_depth(pool, "timers").await?,
        job_runs: queue_depth(pool, "job_runs").await?,
    })
}

/// Detect a Postgres unique constraint violation by name. Useful for turning a
/// specific `ON CONFLICT`-less race into a typed outcome instead of a bare error.
pub fn is_unique_constraint_violation(err: &sqlx::Error, constraint: &str) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.constraint() == Some(constraint)
                || (db_err.code().as_deref() == Some("23505") && db_err.constraint() == Some(constraint))
        }
        _ => false,
    }
}
