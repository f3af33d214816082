//! Shared runtime state for relay-daemon.
//!
//! All types here are `Clone`-able (via `Arc` or copy). Handlers receive
//! `State<Arc<AppState>>` from Axum; this module owns nothing async itself.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::{broadcast, RwLock};

use relay_lease::LeaseFactory;

// ---------------------------------------------------------------------------
// BusMsg — SSE event bus payload
// ---------------------------------------------------------------------------

/// Messages broadcast over the internal event bus and surfaced as SSE events.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMsg {
    Heartbeat { ts_millis: i64 },
    Status(StatusSnapshot),
    LogLine { level: String, msg: String },
}

// ---------------------------------------------------------------------------
// BuildInfo
// ---------------------------------------------------------------------------

/// Static build metadata included in health / status responses.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

// ---------------------------------------------------------------------------
// StatusSnapshot
// ---------------------------------------------------------------------------

/// Point-in-time snapshot of daemon state, returned by GET /v1/status and
/// carried inside SSE `status` events.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub daemon_uptime_secs: u64,
    pub queue_depth: relay_db::QueueDepthSummary,
}

// ---------------------------------------------------------------------------
// AppState
// ---------------------------------------------------------------------------

/// Cloneable (Arc) handle shared across all Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Broadcast bus for SSE.
    pub bus: broadcast::Sender<BusMsg>,
    /// Static build metadata.
    pub build: BuildInfo,
    /// Most recently published status snapshot; refreshed by the heartbeat loop.
    pub status: Arc<RwLock<StatusSnapshot>>,
    /// Database pool backing every operator endpoint (outbox/inbox/scheduler enqueue,
    /// queue-depth queries).
    pub pool: PgPool,
    /// Produces/inspects fenced leases over `distributed_lock`, for `/v1/lease/:resource`.
    pub lease_factory: LeaseFactory,
}

impl AppState {
    pub fn new(pool: PgPool) -> Self {
        let (bus, _rx) = broadcast::channel::<BusMsg>(1024);

        let initial_status = StatusSnapshot {
            daemon_uptime_secs: uptime_secs(),
            queue_depth: relay_db::QueueDepthSummary::default(),
        };

        Self {
            bus,
            build: BuildInfo {
                service: "relay-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
            status: Arc::new(RwLock::new(initial_status)),
            lease_factory: LeaseFactory::new(pool.clone()),
            pool,
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Monotonically increasing uptime since first call (process lifetime).
pub fn uptime_secs() -> u64 {
    static START: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
    START
        .get_or_init(std::time::Instant::now)
        .elapsed()
        .as_secs()
}

/// Spawn a background task that emits a heartbeat SSE, and periodically refreshes
/// `AppState::status` with current queue depths for `/v1/status` and SSE `status`
/// events to read without hitting the database on every request.
pub fn spawn_heartbeat(pool: PgPool, bus: broadcast::Sender<BusMsg>, status: Arc<RwLock<StatusSnapshot>>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let ts = chrono::Utc::now().timestamp_millis();
            let _ = bus.send(BusMsg::Heartbeat { ts_millis: ts });

            match relay_db::queue_depth_summary(&pool).await {
                Ok(queue_depth) => {
                    let snapshot = StatusSnapshot {
                        daemon_uptime_secs: uptime_secs(),
                        queue_depth,
                    };
                    *status.write().await = snapshot.clone();
                    let _ = bus.send(BusMsg::Status(snapshot));
                }
                Err(err) => {
                    tracing::warn!(error = %err, "queue depth refresh failed");
                }
            }
        }
    });
}
