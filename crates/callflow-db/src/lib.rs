//! Database layer for the callflow engine.
//!
//! Provides SQLite connection pooling (via `r2d2`), WAL-mode initialization,
//! and embedded SQL migrations. Every table the engine writes (calls, legs,
//! the webhook dedup ledger, transcript segments, translations, call
//! activity, tenant translation settings) is created through versioned
//! migrations managed by this crate.
//!
//! # Design decisions
//!
//! - **SQLite with WAL mode**: concurrent readers (reporting, the status API)
//!   with a single writer at a time, which matches the per-call worker model.
//! - **`r2d2` connection pool**: bounded connection reuse shared by the
//!   ingress handlers and all call workers.
//! - **Embedded migrations**: SQL files are compiled into the binary via
//!   `include_str!`, so the schema ships with the code that depends on it.

mod migrations;
mod pool;

pub use migrations::{run_migrations, MigrationError};
pub use pool::{create_pool, DbPool, DbRuntimeSettings, PoolError};
