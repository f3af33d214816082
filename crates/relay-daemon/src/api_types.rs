//! Request and response types for all relay-daemon HTTP endpoints.
//!
//! These types are `Serialize + Deserialize` so they can be JSON-encoded
//! by Axum and decoded by tests.  No business logic lives here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// /v1/health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: &'static str,
    pub version: &'static str,
}

// ---------------------------------------------------------------------------
// Route refusal (400/404/503)
// ---------------------------------------------------------------------------

/// Response body when a route is refused — unknown store, missing handler,
/// validation failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefusedResponse {
    pub error: String,
}

// ---------------------------------------------------------------------------
// /v1/status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct QueueDepthResponse {
    pub ready: i64,
    pub in_progress: i64,
    pub failed: i64,
}

impl From<relay_db::QueueDepth> for QueueDepthResponse {
    fn from(d: relay_db::QueueDepth) -> Self {
        Self { ready: d.ready, in_progress: d.in_progress, failed: d.failed }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct QueueDepthSummaryResponse {
    pub outbox: QueueDepthResponse,
    pub inbox: QueueDepthResponse,
    pub timers: QueueDepthResponse,
    pub job_runs: QueueDepthResponse,
}

impl From<relay_db::QueueDepthSummary> for QueueDepthSummaryResponse {
    fn from(s: relay_db::QueueDepthSummary) -> Self {
        Self {
            outbox: s.outbox.into(),
            inbox: s.inbox.into(),
            timers: s.timers.into(),
            job_runs: s.job_runs.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub daemon_uptime_secs: u64,
    pub queue_depth: QueueDepthSummaryResponse,
}

// ---------------------------------------------------------------------------
// /v1/outbox/enqueue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueOutboxRequest {
    pub topic: String,
    pub payload: serde_json::Value,
    pub message_id: String,
    pub correlation_id: Option<Uuid>,
    pub due_time_utc: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueOutboxResponse {
    pub id: Option<i64>,
}

// ---------------------------------------------------------------------------
// /v1/inbox/enqueue  /v1/inbox/revive
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueInboxRequest {
    pub source: String,
    pub message_id: String,
    pub topic: String,
    pub payload: serde_json::Value,
    pub hash: Option<String>,
    pub due_time_utc: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueInboxResponse {
    pub enqueued: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviveInboxRequest {
    pub source: String,
    pub message_id: String,
    #[serde(default)]
    pub delay_seconds: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviveInboxResponse {
    pub revived: bool,
}

// ---------------------------------------------------------------------------
// /v1/scheduler/jobs  /v1/scheduler/timers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateJobRequest {
    pub job_name: String,
    pub topic: String,
    pub cron_schedule: String,
    pub payload: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResponse {
    pub id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleTimerRequest {
    pub topic: String,
    pub payload: serde_json::Value,
    pub due_time_utc: DateTime<Utc>,
    pub correlation_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerResponse {
    pub id: i64,
}

// ---------------------------------------------------------------------------
// /v1/lease/:resource
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseStatusResponse {
    pub resource_name: String,
    pub held: bool,
    pub fencing_token: Option<i64>,
}
