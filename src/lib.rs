//! Batch synchronization engine for offline-first point-of-sale stores.
//!
//! Stores accumulate operations (orders, inventory adjustments, payments)
//! while offline and replay them in batches once connectivity returns. The
//! engine deduplicates replays by idempotency key, detects conflicts against
//! current server state, records every submission in a durable ledger, and
//! offers a priority queue for deferred processing.

pub mod api;
pub mod context;
pub mod db_migration;
pub mod domains;
pub mod errors;

pub use context::StoreContext;
pub use domains::sync::{SyncService, SyncServiceImpl};
