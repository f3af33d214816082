//! Multi-database routing (§4.7): a `StoreProvider` tracks which logical database
//! stores currently exist, a `Router` maps a routing key to one of them, and a
//! `SelectionStrategy` picks which store a dispatcher should poll next.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use relay_schemas::{DatabaseDiscovery, DiscoveredStore};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::{Mutex, RwLock};

pub const CONTROL_PLANE_IDENTIFIER: &str = "control-plane";

/// One fully materialized store: a live pool plus the identity it was discovered
/// under.
#[derive(Clone)]
pub struct Store {
    pub identifier: String,
    pub pool: PgPool,
    pub schema_name: String,
    pub table_names: relay_schemas::TableNames,
}

#[async_trait]
pub trait StoreProvider: Send + Sync {
    /// A defensive snapshot of the currently active stores. Never a live reference —
    /// callers may hold the returned `Vec` across `.await` points safely.
    async fn snapshot(&self) -> Vec<Arc<Store>>;
}

/// A fixed, pre-configured set of stores. Used when the host has no dynamic discovery
/// mechanism (§4.7 "Static list").
pub struct StaticStoreProvider {
    stores: Vec<Arc<Store>>,
}

impl StaticStoreProvider {
    pub fn new(stores: Vec<Arc<Store>>) -> Self {
        Self { stores }
    }
}

#[async_trait]
impl StoreProvider for StaticStoreProvider {
    async fn snapshot(&self) -> Vec<Arc<Store>> {
        self.stores.clone()
    }
}

/// Polls a `DatabaseDiscovery` on an interval, diffing against the current set:
/// new identifiers are instantiated (and their migrations deployed if requested),
/// removed identifiers are dropped, changed connection/schema recreate the store.
/// Refreshes are serialized with a single-slot gate; readers take a shared lock and
/// always return a defensive snapshot (§5 "Shared resources").
pub struct DynamicStoreProvider {
    discovery: Arc<dyn DatabaseDiscovery>,
    current: RwLock<HashMap<String, Arc<Store>>>,
    refresh_gate: Mutex<()>,
    deploy_schema: bool,
}

impl DynamicStoreProvider {
    pub fn new(discovery: Arc<dyn DatabaseDiscovery>, deploy_schema: bool) -> Self {
        Self {
            discovery,
            current: RwLock::new(HashMap::new()),
            refresh_gate: Mutex::new(()),
            deploy_schema,
        }
    }

    /// Diffs discovered stores against the current set. Holds the refresh gate for
    /// the duration of the diff so two concurrent refreshes can't race each other.
    pub async fn refresh(&self) -> Result<()> {
        let _gate = self.refresh_gate.lock().await;

        let discovered = self.discovery.discover_databases().await?;
        let discovered_ids: std::collections::HashSet<String> =
            discovered.iter().map(|d| d.identifier.clone()).collect();

        let mut instantiated = HashMap::new();
        for d in discovered {
            let needs_recreate = {
                let current = self.current.read().await;
                match current.get(&d.identifier) {
                    Some(existing) => existing.schema_name != d.schema_name,
                    None => true,
                }
            };

            if needs_recreate {
                let store = instantiate_store(&d, self.deploy_schema).await?;
                instantiated.insert(d.identifier.clone(), Arc::new(store));
            } else {
                let current = self.current.read().await;
                if let Some(existing) = current.get(&d.identifier) {
                    instantiated.insert(d.identifier.clone(), existing.clone());
                }
            }
        }

        let mut current = self.current.write().await;
        let removed: Vec<String> = current.keys().filter(|id| !discovered_ids.contains(*id)).cloned().collect();
        for id in &removed {
            tracing::info!(identifier = %id, "store removed by discovery, disposing");
        }
        *current = instantiated;

        Ok(())
    }

    pub async fn run_refresh_loop(self: Arc<Self>, interval: StdDuration, cancel: tokio_util::sync::CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            if let Err(err) = self.refresh().await {
                tracing::error!(error = %err, "store discovery refresh failed");
            }
        }
    }
}

async fn instantiate_store(discovered: &DiscoveredStore, deploy_schema: bool) -> Result<Store> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&discovered.connection_string)
        .await?;
    if discovered.enable_schema_deployment && deploy_schema {
        relay_db::migrate(&pool).await?;
    }
    Ok(Store {
        identifier: discovered.identifier.clone(),
        pool,
        schema_name: discovered.schema_name.clone(),
        table_names: discovered.table_names.clone(),
    })
}

#[async_trait]
impl StoreProvider for DynamicStoreProvider {
    async fn snapshot(&self) -> Vec<Arc<Store>> {
        self.current.read().await.values().cloned().collect()
    }
}

/// Maps a routing key to the store responsible for it.
pub struct Router<P: StoreProvider + ?Sized> {
    provider: Arc<P>,
}

impl<P: StoreProvider + ?Sized> Router<P> {
    pub fn new(provider: Arc<P>) -> Self {
        Self { provider }
    }

    pub async fn get_store(&self, routing_key: &str) -> Result<Arc<Store>> {
        let stores = self.provider.snapshot().await;
        stores
            .into_iter()
            .find(|s| s.identifier == routing_key)
            .ok_or_else(|| anyhow!("no store for key {routing_key}"))
    }

    /// Render a 128-bit id as lowercase hex and route on that, per §4.7.
    pub async fn get_store_by_id(&self, routing_key: uuid::Uuid) -> Result<Arc<Store>> {
        self.get_store(&hex::encode(routing_key.as_bytes())).await
    }
}

/// Per-dispatcher policy for which store to poll next, given the outcome of the last
/// poll (§4.7 "Selection strategy").
pub trait SelectionStrategy: Send + Sync {
    fn next(&mut self, stores: &[Arc<Store>], last_processed: Option<&str>, last_processed_count: usize) -> Option<Arc<Store>>;
}

/// Always advances to the next store in the snapshot, wrapping around.
#[derive(Default)]
pub struct RoundRobin {
    last_index: Option<usize>,
}

impl SelectionStrategy for RoundRobin {
    fn next(&mut self, stores: &[Arc<Store>], _last_processed: Option<&str>, _last_processed_count: usize) -> Option<Arc<Store>> {
        if stores.is_empty() {
            return None;
        }
        let next_index = match self.last_index {
            Some(i) => (i + 1) % stores.len(),
            None => 0,
        };
        self.last_index = Some(next_index);
        Some(stores[next_index].clone())
    }
}

/// Stays on the last-processed store while it keeps producing work; advances only
/// once it returns an empty batch.
#[derive(Default)]
pub struct DrainFirst {
    round_robin: RoundRobin,
}

impl SelectionStrategy for DrainFirst {
    fn next(&mut self, stores: &[Arc<Store>], last_processed: Option<&str>, last_processed_count: usize) -> Option<Arc<Store>> {
        if last_processed_count > 0 {
            if let Some(last_id) = last_processed {
                if let Some(store) = stores.iter().find(|s| s.identifier == last_id) {
                    return Some(store.clone());
                }
            }
        }
        self.round_robin.next(stores, last_processed, last_processed_count)
    }
}

/// Drives a dispatch loop's per-tick store choice (§4.7 "Selection strategy"):
/// snapshots the provider, hands the snapshot plus the outcome of the previous pick
/// to a [`SelectionStrategy`], and remembers that outcome for next time. Shared by
/// `OutboxService`, `InboxDispatcher`, and `SchedulerLoop` so each runs its dispatch
/// loop over every store the provider currently knows about instead of one hardcoded
/// pool.
pub struct StoreCursor {
    provider: Arc<dyn StoreProvider>,
    strategy: Mutex<Box<dyn SelectionStrategy>>,
    last: Mutex<(Option<String>, usize)>,
}

impl StoreCursor {
    pub fn new(provider: Arc<dyn StoreProvider>, strategy: Box<dyn SelectionStrategy>) -> Self {
        Self { provider, strategy: Mutex::new(strategy), last: Mutex::new((None, 0)) }
    }

    /// Picks the next store to poll, or `None` if the provider currently has none.
    pub async fn pick(&self) -> Option<Arc<Store>> {
        let stores = self.provider.snapshot().await;
        let (last_id, last_count) = self.last.lock().await.clone();
        let mut strategy = self.strategy.lock().await;
        strategy.next(&stores, last_id.as_deref(), last_count)
    }

    /// Records how many rows the just-polled store produced so the next `pick` can
    /// apply a strategy like [`DrainFirst`]'s stay-while-productive rule.
    pub async fn record(&self, identifier: &str, count: usize) {
        *self.last.lock().await = (Some(identifier.to_string()), count);
    }

    pub async fn snapshot(&self) -> Vec<Arc<Store>> {
        self.provider.snapshot().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // `Store` carries a live `PgPool`, which can't be constructed without a real
    // connection; selection-strategy tests only need the `identifier` field, so these
    // use a lazy pool that never actually connects.
    fn fake_stores(n: usize) -> Vec<Arc<Store>> {
        (0..n)
            .map(|i| {
                Arc::new(Store {
                    identifier: format!("store-{i}"),
                    pool: PgPool::connect_lazy("postgres://unused/unused").expect("lazy pool never connects"),
                    schema_name: "infra".to_string(),
                    table_names: relay_schemas::TableNames::default(),
                })
            })
            .collect()
    }

    #[test]
    fn round_robin_cycles_through_every_store_before_repeating() {
        let stores = fake_stores(3);
        let mut strategy = RoundRobin::default();
        let picked: Vec<String> = (0..6)
            .map(|_| strategy.next(&stores, None, 0).unwrap().identifier.clone())
            .collect();
        assert_eq!(picked, vec!["store-0", "store-1", "store-2", "store-0", "store-1", "store-2"]);
    }

    #[test]
    fn drain_first_stays_on_the_productive_store() {
        let stores = fake_stores(2);
        let mut strategy = DrainFirst::default();
        let first = strategy.next(&stores, None, 0).unwrap();
        assert_eq!(first.identifier, "store-0");

        let still_first = strategy.next(&stores, Some("store-0"), 5).unwrap();
        assert_eq!(still_first.identifier, "store-0", "must stay while last batch was non-empty");

        let advanced = strategy.next(&stores, Some("store-0"), 0).unwrap();
        assert_eq!(advanced.identifier, "store-1", "must advance once the batch is empty");
    }
}
