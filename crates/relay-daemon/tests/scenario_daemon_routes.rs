//! In-process scenario tests for relay-daemon HTTP endpoints.
//!
//! These tests spin up the Axum router **without** binding a TCP socket.
//! Each test calls `routes::build_router` and drives it via
//! `tower::ServiceExt::oneshot` — no network I/O required. They still need a
//! live database (every route touches `relay-db`), so each one connects via
//! `relay_testkit::connect_test_pool` and returns early — a skip, not a
//! failure — when no database is configured.

use std::sync::Arc;

use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use relay_daemon::{routes, state};
use relay_testkit::{connect_test_pool, migrate, truncate_all};
use tower::ServiceExt; // oneshot

async fn make_router() -> Option<axum::Router> {
    let pool = connect_test_pool().await.ok()?;
    migrate(&pool).await.unwrap();
    truncate_all(&pool).await.unwrap();
    let st = Arc::new(state::AppState::new(pool));
    Some(routes::build_router(st))
}

async fn call(router: axum::Router, req: Request<axum::body::Body>) -> (StatusCode, bytes::Bytes) {
    let resp = router.oneshot(req).await.expect("oneshot failed");
    let status = resp.status();
    let body = resp.into_body().collect().await.expect("body collect failed").to_bytes();
    (status, body)
}

fn parse_json(b: bytes::Bytes) -> serde_json::Value {
    serde_json::from_slice(&b).expect("body is not valid JSON")
}

#[tokio::test]
async fn health_returns_200_ok_true() {
    let Some(router) = make_router().await else { return };
    let req = Request::builder().method("GET").uri("/v1/health").body(axum::body::Body::empty()).unwrap();

    let (status, body) = call(router, req).await;
    assert_eq!(status, StatusCode::OK);

    let json = parse_json(body);
    assert_eq!(json["ok"], true);
    assert_eq!(json["service"], "relay-daemon");
}

#[tokio::test]
async fn status_reports_zero_queue_depth_on_a_clean_database() {
    let Some(router) = make_router().await else { return };
    let req = Request::builder().method("GET").uri("/v1/status").body(axum::body::Body::empty()).unwrap();

    let (status, body) = call(router, req).await;
    assert_eq!(status, StatusCode::OK);

    let json = parse_json(body);
    assert_eq!(json["queue_depth"]["outbox"]["ready"], 0);
    assert_eq!(json["queue_depth"]["inbox"]["ready"], 0);
}

#[tokio::test]
async fn outbox_enqueue_then_status_reflects_one_ready_row() {
    let Some(router) = make_router().await else { return };

    let body = serde_json::json!({
        "topic": "orders.created",
        "payload": {"order_id": 1},
        "message_id": "order-1",
        "correlation_id": null,
        "due_time_utc": null,
    });
    let req = Request::builder()
        .method("POST")
        .uri("/v1/outbox/enqueue")
        .header("content-type", "application/json")
        .body(axum::body::Body::from(body.to_string()))
        .unwrap();
    let (status, resp_body) = call(router.clone(), req).await;
    assert_eq!(status, StatusCode::OK);
    assert!(parse_json(resp_body)["id"].is_i64());

    let req = Request::builder().method("GET").uri("/v1/status").body(axum::body::Body::empty()).unwrap();
    let (status, body) = call(router, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse_json(body)["queue_depth"]["outbox"]["ready"], 1);
}

#[tokio::test]
async fn inbox_enqueue_is_idempotent_on_source_and_message_id() {
    let Some(router) = make_router().await else { return };

    let body = serde_json::json!({
        "source": "webhook",
        "message_id": "evt-1",
        "topic": "payments.captured",
        "payload": {"amount": 100},
        "hash": null,
        "due_time_utc": null,
    });
    let req1 = Request::builder()
        .method("POST")
        .uri("/v1/inbox/enqueue")
        .header("content-type", "application/json")
        .body(axum::body::Body::from(body.to_string()))
        .unwrap();
    let (status, resp_body) = call(router.clone(), req1).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse_json(resp_body)["enqueued"], true);

    let req2 = Request::builder()
        .method("POST")
        .uri("/v1/inbox/enqueue")
        .header("content-type", "application/json")
        .body(axum::body::Body::from(body.to_string()))
        .unwrap();
    let (status, resp_body) = call(router, req2).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse_json(resp_body)["enqueued"], false);
}

#[tokio::test]
async fn scheduler_create_job_then_trigger_now_creates_a_run() {
    let Some(router) = make_router().await else { return };

    let create_body = serde_json::json!({
        "job_name": "nightly-rollup",
        "topic": "jobs.rollup",
        "cron_schedule": "0 0 * * *",
        "payload": null,
    });
    let req = Request::builder()
        .method("POST")
        .uri("/v1/scheduler/jobs")
        .header("content-type", "application/json")
        .body(axum::body::Body::from(create_body.to_string()))
        .unwrap();
    let (status, _body) = call(router.clone(), req).await;
    assert_eq!(status, StatusCode::OK);

    let req = Request::builder()
        .method("POST")
        .uri("/v1/scheduler/jobs/nightly-rollup/trigger")
        .body(axum::body::Body::empty())
        .unwrap();
    let (status, body) = call(router, req).await;
    assert_eq!(status, StatusCode::OK);
    assert!(parse_json(body)["id"].is_i64());
}

#[tokio::test]
async fn lease_status_reports_not_held_for_an_unknown_resource() {
    let Some(router) = make_router().await else { return };
    let req = Request::builder().method("GET").uri("/v1/lease/scheduler:run").body(axum::body::Body::empty()).unwrap();

    let (status, body) = call(router, req).await;
    assert_eq!(status, StatusCode::OK);
    let json = parse_json(body);
    assert_eq!(json["held"], false);
    assert!(json["fencing_token"].is_null());
}
