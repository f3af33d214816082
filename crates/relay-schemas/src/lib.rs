//! Contracts (ports) implemented by whatever host embeds the queue/scheduler core.
//!
//! Nothing in this crate talks to Postgres or `tokio`; it only defines the traits and
//! small value types that `relay-db`/`relay-runtime` depend on and that a daemon wires
//! up concrete implementations for.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Generic envelope for events this crate's default collaborators emit (audit log,
/// metrics). Not used on the hot dispatch path — payloads there stay opaque `Value`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope<T> {
    pub event_id: Uuid,
    pub ts_utc: DateTime<Utc>,
    pub correlation_id: Option<Uuid>,
    pub causation_id: Option<Uuid>,
    pub topic: String,
    pub event_type: String,
    pub payload: T,
}

/// One row discovered by an external service-discovery mechanism.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredStore {
    pub identifier: String,
    pub connection_string: String,
    pub schema_name: String,
    pub table_names: TableNames,
    pub enable_schema_deployment: bool,
}

/// Per-store table naming, overridable so multiple tenants can share one database
/// under different schemas/prefixes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNames {
    pub outbox: String,
    pub outbox_join: String,
    pub outbox_join_member: String,
    pub inbox: String,
    pub timers: String,
    pub jobs: String,
    pub job_runs: String,
    pub scheduler_state: String,
    pub distributed_lock: String,
    pub fanout_policy: String,
    pub fanout_cursor: String,
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            outbox: "outbox".into(),
            outbox_join: "outbox_join".into(),
            outbox_join_member: "outbox_join_member".into(),
            inbox: "inbox".into(),
            timers: "timers".into(),
            jobs: "jobs".into(),
            job_runs: "job_runs".into(),
            scheduler_state: "scheduler_state".into(),
            distributed_lock: "distributed_lock".into(),
            fanout_policy: "fanout_policy".into(),
            fanout_cursor: "fanout_cursor".into(),
        }
    }
}

/// Polled periodically by the multi-store provider to learn which logical databases
/// currently exist. A static configuration satisfies this trivially with a fixed Vec.
#[async_trait]
pub trait DatabaseDiscovery: Send + Sync {
    async fn discover_databases(&self) -> anyhow::Result<Vec<DiscoveredStore>>;
}

/// Signal a host can use to delay background loops until its own schema deployment
/// (if any, beyond this crate's own migrations) has completed.
#[async_trait]
pub trait SchemaCompletion: Send + Sync {
    async fn schema_deployment_completed(&self);
}

/// Default implementation that is immediately complete — used when the host has no
/// additional schema step beyond the embedded migrations.
pub struct AlwaysReady;

#[async_trait]
impl SchemaCompletion for AlwaysReady {
    async fn schema_deployment_completed(&self) {}
}

/// A structured log/metric record. Default collaborators bridge this to `tracing`.
#[derive(Debug, Clone)]
pub struct MetricRecord {
    pub name: &'static str,
    pub value: f64,
    pub tags: Vec<(&'static str, String)>,
}

pub trait MetricsSink: Send + Sync {
    fn record(&self, record: MetricRecord);
}

/// No-op sink, useful for tests and for hosts that don't care about metrics.
pub struct NullMetricsSink;

impl MetricsSink for NullMetricsSink {
    fn record(&self, _record: MetricRecord) {}
}

/// Append-only structured event log. `relay-audit` provides the default file-backed,
/// hash-chained implementation.
#[async_trait]
pub trait AuditWriter: Send + Sync {
    async fn append(&self, event_type: &str, tags: Vec<(&'static str, String)>, detail: Value) -> anyhow::Result<()>;
}

/// No-op writer for tests that don't care about the audit trail.
pub struct NullAuditWriter;

#[async_trait]
impl AuditWriter for NullAuditWriter {
    async fn append(&self, _event_type: &str, _tags: Vec<(&'static str, String)>, _detail: Value) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Tracks long-running operations for observability; `start`/`finish` bracket a unit
/// of work identified by an operation id chosen by the caller.
pub trait OperationTracker: Send + Sync {
    fn start(&self, operation_id: &str, kind: &str);
    fn finish(&self, operation_id: &str, outcome: OperationOutcome);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationOutcome {
    Completed,
    Failed,
}

pub struct NullOperationTracker;

impl OperationTracker for NullOperationTracker {
    fn start(&self, _operation_id: &str, _kind: &str) {}
    fn finish(&self, _operation_id: &str, _outcome: OperationOutcome) {}
}

/// Accessor for an ambient correlation id (e.g. from request-scoped context), used to
/// stamp emitted events when no explicit correlation id was supplied by the caller.
pub trait CorrelationContextAccessor: Send + Sync {
    fn current_correlation_id(&self) -> Option<Uuid>;
}

pub struct NoCorrelationContext;

impl CorrelationContextAccessor for NoCorrelationContext {
    fn current_correlation_id(&self) -> Option<Uuid> {
        None
    }
}

/// The outcome of a single handler invocation.
#[derive(Debug)]
pub enum HandlerOutcome {
    /// Handled; the row should transition to its terminal success state.
    Ack,
    /// Transient failure; the row should be abandoned and retried with backoff.
    Retry(anyhow::Error),
    /// The handler has determined this message can never succeed; fail immediately
    /// without consuming further retry attempts.
    Permanent(anyhow::Error),
}

/// Convenience for handlers that want `?` to produce a retryable failure by default,
/// while explicitly opting into `Permanent` for poison messages.
#[derive(Debug, thiserror::Error)]
#[error("permanent failure: {0}")]
pub struct PermanentFailure(pub String);

/// Raised by lease-guarded work when the lease's renewer has observed a failed
/// renewal; callers must stop touching lease-guarded state on receipt of this error.
#[derive(Debug, Clone, thiserror::Error)]
#[error("lease lost for resource {resource_name}")]
pub struct LostLeaseError {
    pub resource_name: String,
}

/// An inbound message ready for dispatch to an application handler.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub message_id: String,
    pub source: String,
    pub topic: String,
    pub payload: Value,
    pub attempts: i32,
}

/// Implemented by application code that wants to process inbox messages for a topic.
#[async_trait]
pub trait InboxHandler: Send + Sync {
    async fn handle(&self, message: InboundMessage) -> HandlerOutcome;
}

/// Resolves a topic to the handler that should process it. A `HashMap`-backed
/// implementation is the expected common case (see `relay-runtime::InboxHandlerRegistry`).
pub trait InboxHandlerResolver: Send + Sync {
    fn get_handler(&self, topic: &str) -> Option<std::sync::Arc<dyn InboxHandler>>;
}

/// An outbound message ready for dispatch to an application handler.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub id: i64,
    pub topic: String,
    pub payload: Value,
    pub correlation_id: Option<Uuid>,
}

/// Implemented by application code that wants to process a specific outbox topic.
#[async_trait]
pub trait OutboxHandler: Send + Sync {
    fn topic(&self) -> &str;
    async fn handle(&self, message: OutboundMessage) -> HandlerOutcome;
}

/// Classifies an error raised from inside a handler or loop body as something that
/// should be caught and converted into a retry/fail decision, vs. something (like a
/// deliberate cancellation) that must propagate.
pub trait ExceptionFilter: Send + Sync {
    fn is_catchable(&self, err: &anyhow::Error) -> bool;
}

/// Default filter: everything is catchable. Hosts that run under structured
/// cancellation can supply a filter that excludes `tokio_util::sync::CancellationToken`
/// markers from being swallowed as ordinary handler failures.
pub struct CatchAll;

impl ExceptionFilter for CatchAll {
    fn is_catchable(&self, _err: &anyhow::Error) -> bool {
        true
    }
}
