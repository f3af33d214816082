//! Explicit builder replacing a DI container (§9 "Cyclic references between services
//! & DI"): produces a typed graph of services and background loops instead of
//! resolving collaborators by reflection or container lookup.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use relay_lease::LeaseFactory;
use relay_schemas::{AlwaysReady, AuditWriter, InboxHandler, NullAuditWriter, OutboxHandler, SchemaCompletion};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use crate::fanout::{FanoutCandidateSource, FanoutCoordinateHandler, FanoutCoordinator, FanoutPlanner};
use crate::inbox_dispatcher::{InboxDispatcher, InboxDispatcherConfig};
use crate::outbox_service::{OutboxHandlerRegistry, OutboxService, OutboxServiceConfig};
use crate::registry::{OnceExecutionRegistry, StartupLatch};
use crate::scheduler::{SchedulerClient, SchedulerLoop, SchedulerLoopConfig};
use crate::store::{
    DrainFirst, Router, RoundRobin, SelectionStrategy, StaticStoreProvider, Store, StoreProvider,
    CONTROL_PLANE_IDENTIFIER,
};

/// Which [`SelectionStrategy`] the dispatch loops get when the host hasn't wired one
/// explicitly. Each loop gets its own fresh instance (they pick independently).
#[derive(Clone, Copy, Default)]
pub enum StoreSelection {
    #[default]
    RoundRobin,
    DrainFirst,
}

impl StoreSelection {
    fn build(self) -> Box<dyn SelectionStrategy> {
        match self {
            StoreSelection::RoundRobin => Box::new(RoundRobin::default()),
            StoreSelection::DrainFirst => Box::new(DrainFirst::default()),
        }
    }
}

struct InboxHandlerRegistry {
    handlers: HashMap<String, Arc<dyn InboxHandler>>,
}

impl relay_schemas::InboxHandlerResolver for InboxHandlerRegistry {
    fn get_handler(&self, topic: &str) -> Option<Arc<dyn InboxHandler>> {
        self.handlers.get(topic).cloned()
    }
}

/// Fully wired runtime: the services themselves, plus the `spawn_loops` entry point
/// that launches every background loop under a shared `CancellationToken`.
pub struct Runtime {
    pub pool: PgPool,
    pub outbox: Arc<OutboxService>,
    pub inbox: Arc<InboxDispatcher>,
    pub scheduler_client: Arc<SchedulerClient>,
    scheduler_loop: Arc<SchedulerLoop>,
    pub lease_factory: LeaseFactory,
    pub audit: Arc<dyn AuditWriter>,
    pub once_registry: Arc<OnceExecutionRegistry>,
    pub startup_latch: Arc<StartupLatch>,
    /// Maps a routing key (or hex-encoded id) to the store responsible for it (§4.7),
    /// over the same provider the dispatch loops poll.
    pub router: Router<dyn StoreProvider>,
    fanout_coordinators: HashMap<String, Arc<FanoutCoordinator>>,
}

impl Runtime {
    /// Spawn the outbox service, inbox dispatcher, and scheduler loops on the given
    /// runtime handle; all honor `cancel` for graceful shutdown.
    pub fn spawn_loops(&self, cancel: CancellationToken) {
        tokio::spawn(self.outbox.clone().run_loop(cancel.clone()));
        tokio::spawn(self.inbox.clone().run_loop(cancel.clone()));
        tokio::spawn(self.scheduler_loop.clone().run(cancel));
    }

    pub fn fanout_coordinator(&self, key: &str) -> Option<Arc<FanoutCoordinator>> {
        self.fanout_coordinators.get(key).cloned()
    }
}

/// Builds a [`Runtime`] from explicit collaborators. Every setter is optional except
/// `pool`; unset collaborators fall back to no-op defaults (`NullAuditWriter`,
/// `AlwaysReady`), mirroring the teacher's pattern of defaulting ambient collaborators
/// rather than requiring every caller to wire them.
pub struct Builder {
    pool: Option<PgPool>,
    store_provider: Option<Arc<dyn StoreProvider>>,
    store_selection: StoreSelection,
    outbox_handlers: OutboxHandlerRegistry,
    inbox_handlers: HashMap<String, Arc<dyn InboxHandler>>,
    fanout_candidate_sources: HashMap<String, Arc<dyn FanoutCandidateSource>>,
    outbox_config: OutboxServiceConfig,
    inbox_config: InboxDispatcherConfig,
    scheduler_config: SchedulerLoopConfig,
    audit: Option<Arc<dyn AuditWriter>>,
    schema_completion: Option<Arc<dyn SchemaCompletion>>,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            pool: None,
            store_provider: None,
            store_selection: StoreSelection::default(),
            outbox_handlers: OutboxHandlerRegistry::new(),
            inbox_handlers: HashMap::new(),
            fanout_candidate_sources: HashMap::new(),
            outbox_config: OutboxServiceConfig::default(),
            inbox_config: InboxDispatcherConfig::default(),
            scheduler_config: SchedulerLoopConfig::default(),
            audit: None,
            schema_completion: None,
        }
    }
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pool(mut self, pool: PgPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Supplies the multi-store provider the dispatch loops poll (§4.7). When unset,
    /// `build()` falls back to a single-store [`StaticStoreProvider`] wrapping `pool`
    /// under [`CONTROL_PLANE_IDENTIFIER`], which is equivalent to a single-pool
    /// deployment.
    pub fn store_provider(mut self, provider: Arc<dyn StoreProvider>) -> Self {
        self.store_provider = Some(provider);
        self
    }

    /// Which [`SelectionStrategy`] the outbox, inbox, and scheduler loops use to pick
    /// their next store; each loop gets its own instance. Defaults to round-robin.
    pub fn store_selection(mut self, selection: StoreSelection) -> Self {
        self.store_selection = selection;
        self
    }

    pub fn outbox_handler(mut self, handler: Arc<dyn OutboxHandler>) -> Self {
        self.outbox_handlers.register(handler);
        self
    }

    pub fn inbox_handler(mut self, topic: impl Into<String>, handler: Arc<dyn InboxHandler>) -> Self {
        self.inbox_handlers.insert(topic.into(), handler);
        self
    }

    /// Registers a fanout candidate source under `key` (`"{topic}[:{workKey}]"`, same
    /// key space used by [`FanoutCoordinateHandler`] to resolve a coordinator).
    pub fn fanout_candidate_source(mut self, key: impl Into<String>, source: Arc<dyn FanoutCandidateSource>) -> Self {
        self.fanout_candidate_sources.insert(key.into(), source);
        self
    }

    pub fn outbox_config(mut self, config: OutboxServiceConfig) -> Self {
        self.outbox_config = config;
        self
    }

    pub fn inbox_config(mut self, config: InboxDispatcherConfig) -> Self {
        self.inbox_config = config;
        self
    }

    pub fn scheduler_config(mut self, config: SchedulerLoopConfig) -> Self {
        self.scheduler_config = config;
        self
    }

    pub fn audit(mut self, audit: Arc<dyn AuditWriter>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn schema_completion(mut self, schema_completion: Arc<dyn SchemaCompletion>) -> Self {
        self.schema_completion = Some(schema_completion);
        self
    }

    pub fn build(self) -> Result<Runtime> {
        let pool = self.pool.context("Builder::pool must be set before build()")?;
        let audit = self.audit.unwrap_or_else(|| Arc::new(NullAuditWriter));
        let schema_completion = self.schema_completion.unwrap_or_else(|| Arc::new(AlwaysReady));

        let once_registry = Arc::new(OnceExecutionRegistry::new());
        let startup_latch = Arc::new(StartupLatch::new());

        let lease_factory = LeaseFactory::new(pool.clone());

        let store_provider: Arc<dyn StoreProvider> = self.store_provider.unwrap_or_else(|| {
            Arc::new(StaticStoreProvider::new(vec![Arc::new(Store {
                identifier: CONTROL_PLANE_IDENTIFIER.to_string(),
                pool: pool.clone(),
                schema_name: "public".to_string(),
                table_names: relay_schemas::TableNames::default(),
            })]))
        });
        let router = Router::new(store_provider.clone());

        let outbox = Arc::new(OutboxService::new(
            store_provider.clone(),
            self.store_selection.build(),
            Arc::new(self.outbox_handlers),
            self.outbox_config,
        ));

        let inbox_resolver = Arc::new(InboxHandlerRegistry { handlers: self.inbox_handlers });
        let inbox = Arc::new(InboxDispatcher::new(
            pool.clone(),
            store_provider.clone(),
            self.store_selection.build(),
            inbox_resolver,
            Some(lease_factory.clone()),
            self.inbox_config,
        ));

        let scheduler_client = Arc::new(SchedulerClient::new(pool.clone()));
        let scheduler_loop = Arc::new(SchedulerLoop::new(
            store_provider.clone(),
            self.store_selection.build(),
            lease_factory.clone(),
            schema_completion,
            startup_latch.clone(),
            self.scheduler_config,
        ));

        let mut fanout_coordinators = HashMap::new();
        for (key, source) in self.fanout_candidate_sources {
            let planner = FanoutPlanner::new(pool.clone(), source);
            let coordinator = Arc::new(FanoutCoordinator::new(pool.clone(), lease_factory.clone(), planner));
            fanout_coordinators.insert(key, coordinator);
        }

        Ok(Runtime {
            pool,
            outbox,
            inbox,
            scheduler_client,
            scheduler_loop,
            lease_factory,
            audit,
            once_registry,
            startup_latch,
            router,
            fanout_coordinators,
        })
    }
}

/// Convenience: wraps a built [`Runtime`]'s fanout coordinators as a ready-to-register
/// [`FanoutCoordinateHandler`] for the `Runtime`'s own outbox handler registry.
pub fn fanout_coordinate_handler(runtime: &Runtime) -> FanoutCoordinateHandler {
    FanoutCoordinateHandler::new(runtime.fanout_coordinators.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_fails_without_a_pool() {
        let builder = Builder::new();
        let err = builder.build().unwrap_err();
        assert!(err.to_string().contains("pool"));
    }

    #[tokio::test]
    async fn startup_latch_from_a_fresh_builder_has_no_pending_steps() {
        let builder = Builder::new();
        let latch = StartupLatch::new();
        latch.register("migrations");
        assert!(!latch.is_ready());
        latch.complete("migrations");
        assert!(latch.is_ready());
        drop(builder);
    }
}
