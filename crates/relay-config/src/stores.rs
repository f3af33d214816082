//! Per-store and service-level configuration parsed from the layered YAML config
//! (§4.7 "Static list", §3.1 ambient stack). Connection strings themselves are never
//! parsed here — only the env var name that names where to find one; see
//! [`crate::secrets::resolve_store_connections`].

use std::time::Duration as StdDuration;

use anyhow::{bail, Context, Result};
use relay_schemas::TableNames;
use serde::Deserialize;
use serde_json::Value;

/// One entry in a static multi-store list (§4.7).
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub identifier: String,
    pub connection_string_env: String,
    pub schema_name: String,
    pub table_names: TableNames,
    pub enable_schema_deployment: bool,
}

/// Wire shape matching the YAML: `table_names` is optional and falls back to the
/// defaults every queue table ships with.
#[derive(Debug, Deserialize)]
struct StoreConfigWire {
    identifier: String,
    connection_string_env: String,
    #[serde(default = "default_schema_name")]
    schema_name: String,
    #[serde(default)]
    table_names: Option<TableNamesWire>,
    #[serde(default)]
    enable_schema_deployment: bool,
}

fn default_schema_name() -> String {
    "public".to_string()
}

#[derive(Debug, Deserialize, Default)]
struct TableNamesWire {
    outbox: Option<String>,
    outbox_join: Option<String>,
    outbox_join_member: Option<String>,
    inbox: Option<String>,
    timers: Option<String>,
    jobs: Option<String>,
    job_runs: Option<String>,
    scheduler_state: Option<String>,
    distributed_lock: Option<String>,
    fanout_policy: Option<String>,
    fanout_cursor: Option<String>,
}

impl From<TableNamesWire> for TableNames {
    fn from(wire: TableNamesWire) -> Self {
        let defaults = TableNames::default();
        TableNames {
            outbox: wire.outbox.unwrap_or(defaults.outbox),
            outbox_join: wire.outbox_join.unwrap_or(defaults.outbox_join),
            outbox_join_member: wire.outbox_join_member.unwrap_or(defaults.outbox_join_member),
            inbox: wire.inbox.unwrap_or(defaults.inbox),
            timers: wire.timers.unwrap_or(defaults.timers),
            jobs: wire.jobs.unwrap_or(defaults.jobs),
            job_runs: wire.job_runs.unwrap_or(defaults.job_runs),
            scheduler_state: wire.scheduler_state.unwrap_or(defaults.scheduler_state),
            distributed_lock: wire.distributed_lock.unwrap_or(defaults.distributed_lock),
            fanout_policy: wire.fanout_policy.unwrap_or(defaults.fanout_policy),
            fanout_cursor: wire.fanout_cursor.unwrap_or(defaults.fanout_cursor),
        }
    }
}

/// Parse the `/stores` array of the loaded config JSON into `StoreConfig`s.
/// Returns an empty `Vec` if `/stores` is absent (a deployment may run purely off
/// `DatabaseDiscovery` instead).
pub fn parse_stores(config_json: &Value) -> Result<Vec<StoreConfig>> {
    let Some(stores_val) = config_json.pointer("/stores") else {
        return Ok(Vec::new());
    };
    let wires: Vec<StoreConfigWire> =
        serde_json::from_value(stores_val.clone()).context("failed to parse /stores from config")?;

    let mut seen = std::collections::HashSet::new();
    let mut stores = Vec::with_capacity(wires.len());
    for wire in wires {
        if !seen.insert(wire.identifier.clone()) {
            bail!("duplicate store identifier in config: {}", wire.identifier);
        }
        stores.push(StoreConfig {
            identifier: wire.identifier,
            connection_string_env: wire.connection_string_env,
            schema_name: wire.schema_name,
            table_names: wire.table_names.unwrap_or_default().into(),
            enable_schema_deployment: wire.enable_schema_deployment,
        });
    }
    Ok(stores)
}

/// Service-level polling/lease tuning knobs (§5 "Timeouts"), parsed from `/service`.
#[derive(Debug, Clone)]
pub struct ServiceTuning {
    pub outbox_poll_interval: StdDuration,
    pub outbox_lease: StdDuration,
    pub inbox_poll_interval: StdDuration,
    pub inbox_lease: StdDuration,
    pub scheduler_lease: StdDuration,
    pub fanout_lease: StdDuration,
    pub discovery_refresh_interval: StdDuration,
}

impl Default for ServiceTuning {
    fn default() -> Self {
        Self {
            outbox_poll_interval: StdDuration::from_secs(5),
            outbox_lease: StdDuration::from_secs(30),
            inbox_poll_interval: StdDuration::from_millis(250),
            inbox_lease: StdDuration::from_secs(30),
            scheduler_lease: StdDuration::from_secs(30),
            fanout_lease: StdDuration::from_secs(90),
            discovery_refresh_interval: StdDuration::from_secs(300),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct ServiceTuningWire {
    outbox_poll_interval_ms: Option<u64>,
    outbox_lease_seconds: Option<u64>,
    inbox_poll_interval_ms: Option<u64>,
    inbox_lease_seconds: Option<u64>,
    scheduler_lease_seconds: Option<u64>,
    fanout_lease_seconds: Option<u64>,
    discovery_refresh_interval_seconds: Option<u64>,
}

/// Parse `/service` tuning knobs, falling back to spec defaults for anything absent.
/// Rejects a poll interval below 100ms (§5: "minimum 100ms (enforced by a debug
/// assertion in config validation)").
pub fn parse_service_tuning(config_json: &Value) -> Result<ServiceTuning> {
    let defaults = ServiceTuning::default();
    let Some(service_val) = config_json.pointer("/service") else {
        return Ok(defaults);
    };
    let wire: ServiceTuningWire =
        serde_json::from_value(service_val.clone()).context("failed to parse /service from config")?;

    let tuning = ServiceTuning {
        outbox_poll_interval: wire.outbox_poll_interval_ms.map(StdDuration::from_millis).unwrap_or(defaults.outbox_poll_interval),
        outbox_lease: wire.outbox_lease_seconds.map(StdDuration::from_secs).unwrap_or(defaults.outbox_lease),
        inbox_poll_interval: wire.inbox_poll_interval_ms.map(StdDuration::from_millis).unwrap_or(defaults.inbox_poll_interval),
        inbox_lease: wire.inbox_lease_seconds.map(StdDuration::from_secs).unwrap_or(defaults.inbox_lease),
        scheduler_lease: wire.scheduler_lease_seconds.map(StdDuration::from_secs).unwrap_or(defaults.scheduler_lease),
        fanout_lease: wire.fanout_lease_seconds.map(StdDuration::from_secs).unwrap_or(defaults.fanout_lease),
        discovery_refresh_interval: wire
            .discovery_refresh_interval_seconds
            .map(StdDuration::from_secs)
            .unwrap_or(defaults.discovery_refresh_interval),
    };

    let min_poll = StdDuration::from_millis(100);
    debug_assert!(tuning.outbox_poll_interval >= min_poll, "outbox_poll_interval below 100ms minimum");
    debug_assert!(tuning.inbox_poll_interval >= min_poll, "inbox_poll_interval below 100ms minimum");
    if tuning.outbox_poll_interval < min_poll || tuning.inbox_poll_interval < min_poll {
        bail!("poll intervals must be at least 100ms");
    }

    Ok(tuning)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_stores_returns_empty_when_stores_key_is_absent() {
        let config = serde_json::json!({});
        assert!(parse_stores(&config).unwrap().is_empty());
    }

    #[test]
    fn parse_stores_fills_in_default_table_names_when_omitted() {
        let config = serde_json::json!({
            "stores": [
                { "identifier": "control-plane", "connection_string_env": "RELAY_CONTROL_PLANE_DB_URL" }
            ]
        });
        let stores = parse_stores(&config).unwrap();
        assert_eq!(stores.len(), 1);
        assert_eq!(stores[0].table_names.outbox, "outbox");
        assert_eq!(stores[0].schema_name, "public");
    }

    #[test]
    fn parse_stores_rejects_duplicate_identifiers() {
        let config = serde_json::json!({
            "stores": [
                { "identifier": "dup", "connection_string_env": "A" },
                { "identifier": "dup", "connection_string_env": "B" }
            ]
        });
        assert!(parse_stores(&config).is_err());
    }

    #[test]
    fn parse_service_tuning_rejects_sub_100ms_poll_intervals() {
        let config = serde_json::json!({ "service": { "outbox_poll_interval_ms": 10 } });
        assert!(parse_service_tuning(&config).is_err());
    }

    #[test]
    fn parse_service_tuning_falls_back_to_defaults_when_absent() {
        let config = serde_json::json!({});
        let tuning = parse_service_tuning(&config).unwrap();
        assert_eq!(tuning.outbox_poll_interval, StdDuration::from_secs(5));
    }
}
