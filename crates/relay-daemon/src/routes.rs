//! Axum router and all HTTP handlers for relay-daemon.
//!
//! `build_router` is the single entry point; `main.rs` calls it and attaches
//! middleware layers.  All handlers are `pub(crate)` so the scenario tests in
//! `tests/` can compose the router directly.

use std::{convert::Infallible, sync::Arc};

use axum::{
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::info;

use crate::{
    api_types::{
        CreateJobRequest, EnqueueInboxRequest, EnqueueInboxResponse, EnqueueOutboxRequest,
        EnqueueOutboxResponse, HealthResponse, JobResponse, LeaseStatusResponse, RefusedResponse,
        ReviveInboxRequest, ReviveInboxResponse, ScheduleTimerRequest, StatusResponse,
        TimerResponse,
    },
    state::{uptime_secs, AppState, BusMsg},
};

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the complete application router wired to the given shared state.
///
/// Middleware layers (CORS, tracing) are **not** applied here; `main.rs`
/// attaches them after this call so tests can use the bare router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/status", get(status_handler))
        .route("/v1/stream", get(stream))
        .route("/v1/outbox/enqueue", post(outbox_enqueue))
        .route("/v1/inbox/enqueue", post(inbox_enqueue))
        .route("/v1/inbox/revive", post(inbox_revive))
        .route("/v1/scheduler/jobs", post(scheduler_create_job))
        .route("/v1/scheduler/jobs/:name/trigger", post(scheduler_trigger_job))
        .route("/v1/scheduler/timers", post(scheduler_schedule_timer))
        .route("/v1/lease/:resource", get(lease_status))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// GET /v1/health
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: st.build.service,
            version: st.build.version,
        }),
    )
}

// ---------------------------------------------------------------------------
// GET /v1/status
// ---------------------------------------------------------------------------

pub(crate) async fn status_handler(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    let snap = st.status.read().await.clone();
    let resp = StatusResponse {
        daemon_uptime_secs: uptime_secs(),
        queue_depth: snap.queue_depth.into(),
    };
    (StatusCode::OK, Json(resp))
}

// ---------------------------------------------------------------------------
// POST /v1/outbox/enqueue
// ---------------------------------------------------------------------------

pub(crate) async fn outbox_enqueue(
    State(st): State<Arc<AppState>>,
    Json(body): Json<EnqueueOutboxRequest>,
) -> Response {
    let result = relay_db::outbox::enqueue(
        &st.pool,
        &body.topic,
        body.payload,
        &body.message_id,
        body.correlation_id,
        body.due_time_utc,
    )
    .await;

    match result {
        Ok(id) => {
            info!(topic = %body.topic, message_id = %body.message_id, "outbox/enqueue");
            (StatusCode::OK, Json(EnqueueOutboxResponse { id })).into_response()
        }
        Err(err) => {
            (StatusCode::BAD_REQUEST, Json(RefusedResponse { error: err.to_string() })).into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// POST /v1/inbox/enqueue
// ---------------------------------------------------------------------------

pub(crate) async fn inbox_enqueue(
    State(st): State<Arc<AppState>>,
    Json(body): Json<EnqueueInboxRequest>,
) -> Response {
    let result = relay_db::inbox::enqueue(
        &st.pool,
        &body.source,
        &body.message_id,
        &body.topic,
        body.payload,
        body.hash.as_deref(),
        body.due_time_utc,
    )
    .await;

    match result {
        Ok(enqueued) => {
            info!(source = %body.source, message_id = %body.message_id, enqueued, "inbox/enqueue");
            (StatusCode::OK, Json(EnqueueInboxResponse { enqueued })).into_response()
        }
        Err(err) => {
            (StatusCode::BAD_REQUEST, Json(RefusedResponse { error: err.to_string() })).into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// POST /v1/inbox/revive
// ---------------------------------------------------------------------------

pub(crate) async fn inbox_revive(
    State(st): State<Arc<AppState>>,
    Json(body): Json<ReviveInboxRequest>,
) -> Response {
    let result = relay_db::inbox::revive(
        &st.pool,
        &body.source,
        &body.message_id,
        None,
        body.delay_seconds,
    )
    .await;

    match result {
        Ok(revived) => {
            info!(source = %body.source, message_id = %body.message_id, revived, "inbox/revive");
            let _ = st.bus.send(BusMsg::LogLine {
                level: "INFO".to_string(),
                msg: format!("inbox message revived: {}/{}", body.source, body.message_id),
            });
            (StatusCode::OK, Json(ReviveInboxResponse { revived })).into_response()
        }
        Err(err) => {
            (StatusCode::BAD_REQUEST, Json(RefusedResponse { error: err.to_string() })).into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// POST /v1/scheduler/jobs
// ---------------------------------------------------------------------------

pub(crate) async fn scheduler_create_job(
    State(st): State<Arc<AppState>>,
    Json(body): Json<CreateJobRequest>,
) -> Response {
    let normalized = match relay_runtime::normalize_cron(&body.cron_schedule) {
        Ok(n) => n,
        Err(err) => {
            return (StatusCode::BAD_REQUEST, Json(RefusedResponse { error: err.to_string() })).into_response()
        }
    };
    let next_due_time_utc = match relay_runtime::next_occurrence(&normalized, chrono::Utc::now()) {
        Ok(t) => t,
        Err(err) => {
            return (StatusCode::BAD_REQUEST, Json(RefusedResponse { error: err.to_string() })).into_response()
        }
    };

    let result = relay_db::jobs::create_or_update(
        &st.pool,
        &body.job_name,
        &body.topic,
        &normalized,
        body.payload,
        next_due_time_utc,
    )
    .await;

    match result {
        Ok(id) => {
            info!(job_name = %body.job_name, "scheduler/jobs create");
            (StatusCode::OK, Json(JobResponse { id })).into_response()
        }
        Err(err) => {
            (StatusCode::BAD_REQUEST, Json(RefusedResponse { error: err.to_string() })).into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// POST /v1/scheduler/jobs/:name/trigger
// ---------------------------------------------------------------------------

pub(crate) async fn scheduler_trigger_job(State(st): State<Arc<AppState>>, Path(name): Path<String>) -> Response {
    match relay_db::jobs::trigger_now(&st.pool, &name).await {
        Ok(id) => {
            info!(job_name = %name, run_id = id, "scheduler/jobs trigger");
            (StatusCode::OK, Json(JobResponse { id })).into_response()
        }
        Err(err) => {
            (StatusCode::NOT_FOUND, Json(RefusedResponse { error: err.to_string() })).into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// POST /v1/scheduler/timers
// ---------------------------------------------------------------------------

pub(crate) async fn scheduler_schedule_timer(
    State(st): State<Arc<AppState>>,
    Json(body): Json<ScheduleTimerRequest>,
) -> Response {
    let result = relay_db::timers::schedule(
        &st.pool,
        &body.topic,
        body.payload,
        body.due_time_utc,
        body.correlation_id,
    )
    .await;

    match result {
        Ok(id) => (StatusCode::OK, Json(TimerResponse { id })).into_response(),
        Err(err) => (StatusCode::BAD_REQUEST, Json(RefusedResponse { error: err.to_string() })).into_response(),
    }
}

// ---------------------------------------------------------------------------
// GET /v1/lease/:resource
// ---------------------------------------------------------------------------

pub(crate) async fn lease_status(State(st): State<Arc<AppState>>, Path(resource): Path<String>) -> Response {
    match st.lease_factory.inspect(&resource).await {
        Ok(Some(snapshot)) => (
            StatusCode::OK,
            Json(LeaseStatusResponse {
                resource_name: snapshot.resource_name,
                held: snapshot.is_held(),
                fencing_token: Some(snapshot.fencing_token),
            }),
        )
            .into_response(),
        Ok(None) => (
            StatusCode::OK,
            Json(LeaseStatusResponse { resource_name: resource, held: false, fencing_token: None }),
        )
            .into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, Json(RefusedResponse { error: err.to_string() })).into_response(),
    }
}

// ---------------------------------------------------------------------------
// GET /v1/stream  (SSE)
// ---------------------------------------------------------------------------

pub(crate) async fn stream(State(st): State<Arc<AppState>>) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert("Cache-Control", HeaderValue::from_static("no-cache"));
    headers.insert("Connection", HeaderValue::from_static("keep-alive"));

    let rx = st.bus.subscribe();
    let events = broadcast_to_sse(rx);

    (headers, Sse::new(events).keep_alive(KeepAlive::new())).into_response()
}

fn broadcast_to_sse(
    rx: broadcast::Receiver<BusMsg>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    BroadcastStream::new(rx).filter_map(|msg| async move {
        match msg {
            Ok(m) => {
                let event_name = match &m {
                    BusMsg::Heartbeat { .. } => "heartbeat",
                    BusMsg::Status(_) => "status",
                    BusMsg::LogLine { .. } => "log",
                };
                let data = serde_json::to_string(&m).ok()?;
                Some(Ok(Event::default().event(event_name).data(data)))
            }
            Err(_) => None, // lagged / closed
        }
    })
}
