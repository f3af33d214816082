//! Exercises `relay scheduler job` + `relay scheduler trigger` against a live database.

use assert_cmd::Command;
use predicates::str::contains;

#[tokio::test]
async fn scheduler_job_then_trigger_creates_a_run() {
    let pool = match relay_testkit::connect_test_pool().await {
        Ok(pool) => pool,
        Err(_) => return,
    };
    relay_testkit::migrate(&pool).await.unwrap();
    relay_testkit::truncate_all(&pool).await.unwrap();

    let db_url = std::env::var("RELAY_DATABASE_URL").unwrap();

    Command::cargo_bin("relay")
        .unwrap()
        .env("RELAY_DATABASE_URL", &db_url)
        .args(["scheduler", "job", "--name", "nightly-rollup", "--topic", "jobs.rollup", "--cron", "0 0 * * *"])
        .assert()
        .success()
        .stdout(contains("job_id="));

    Command::cargo_bin("relay")
        .unwrap()
        .env("RELAY_DATABASE_URL", &db_url)
        .args(["scheduler", "trigger", "--name", "nightly-rollup"])
        .assert()
        .success()
        .stdout(contains("run_id="));
}

#[tokio::test]
async fn lease_status_reports_not_held_for_an_unknown_resource() {
    let pool = match relay_testkit::connect_test_pool().await {
        Ok(pool) => pool,
        Err(_) => return,
    };
    relay_testkit::migrate(&pool).await.unwrap();
    relay_testkit::truncate_all(&pool).await.unwrap();

    let db_url = std::env::var("RELAY_DATABASE_URL").unwrap();

    Command::cargo_bin("relay")
        .unwrap()
        .env("RELAY_DATABASE_URL", &db_url)
        .args(["lease", "status", "--resource", "scheduler:run"])
        .assert()
        .success()
        .stdout(contains("held=false"));
}
