//! Test fixtures shared by every crate's integration tests: a live Postgres pool,
//! schema migration, between-test cleanup, and a small concurrency-race helper for
//! the "two workers contend for one row" family of scenarios.

pub mod db;
pub mod race;

pub use db::{connect_test_pool, migrate, truncate_all};
pub use race::run_concurrent;
