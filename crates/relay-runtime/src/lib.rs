//! Background services that turn `relay-db`'s queue tables into running loops:
//! outbox dispatch, inbox dispatch, the cron/timer scheduler, fanout coordination,
//! multi-store routing, and the [`Builder`] that wires them together.
//!
//! Nothing in this crate is usable without the `runtime-claim` feature on its
//! `relay-db` dependency (see the note in this crate's `Cargo.toml`) — that
//! feature gate is what restricts who may actually run claim loops in production.

pub mod backoff;
pub mod builder;
pub mod fanout;
pub mod inbox_dispatcher;
pub mod outbox_service;
pub mod owner;
pub mod registry;
pub mod scheduler;
pub mod store;

pub use builder::{fanout_coordinate_handler, Builder, Runtime, StoreSelection};
pub use fanout::{FanoutCandidateSource, FanoutCoordinateHandler, FanoutCoordinator, FanoutPlanner, FanoutSlice, FanoutTopicOptions};
pub use inbox_dispatcher::{InboxDispatcher, InboxDispatcherConfig};
pub use outbox_service::{OutboxHandlerRegistry, OutboxService, OutboxServiceConfig};
pub use owner::{new_owner_token, OwnerToken};
pub use registry::{OnceExecutionRegistry, StartupLatch};
pub use scheduler::{next_occurrence, normalize_cron, SchedulerClient, SchedulerLoop, SchedulerLoopConfig};
pub use store::{
    DynamicStoreProvider, Router, SelectionStrategy, StaticStoreProvider, Store, StoreCursor, StoreProvider,
    CONTROL_PLANE_IDENTIFIER,
};
