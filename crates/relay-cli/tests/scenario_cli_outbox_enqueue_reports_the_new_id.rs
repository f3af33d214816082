//! Exercises `relay outbox enqueue` against a live database, skipping (not failing)
//! when none is configured — the same convention every other crate's scenario tests use.

use assert_cmd::Command;
use predicates::str::contains;

#[tokio::test]
async fn outbox_enqueue_reports_the_new_id() {
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
        .args([
            "outbox",
            "enqueue",
            "--topic",
            "orders.created",
            "--message-id",
            "order-1",
            "--payload",
            r#"{"order_id": 1}"#,
        ])
        .assert()
        .success()
        .stdout(contains("enqueued=true"));
}

#[tokio::test]
async fn outbox_enqueue_is_idempotent_on_message_id() {
    let pool = match relay_testkit::connect_test_pool().await {
        Ok(pool) => pool,
        Err(_) => return,
    };
    relay_testkit::migrate(&pool).await.unwrap();
    relay_testkit::truncate_all(&pool).await.unwrap();

    let db_url = std::env::var("RELAY_DATABASE_URL").unwrap();

    let args = [
        "outbox",
        "enqueue",
        "--topic",
        "orders.created",
        "--message-id",
        "order-dup",
        "--payload",
        r#"{"order_id": 2}"#,
    ];

    Command::cargo_bin("relay").unwrap().env("RELAY_DATABASE_URL", &db_url).args(args).assert().success();

    Command::cargo_bin("relay")
        .unwrap()
        .env("RELAY_DATABASE_URL", &db_url)
        .args(args)
        .assert()
        .success()
        .stdout(contains("enqueued=false"));
}
