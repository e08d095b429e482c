//! Persistence for the storefront order engine.
//!
//! Three stores sit behind traits so the workflow can run against memory or
//! PostgreSQL:
//! - [`InventoryLedger`]: per-variant stock counters with bounded adjustment
//! - [`IdempotencyGuard`]: insert-if-absent deduplication keys
//! - [`OrderStore`]: the durable order aggregate

pub mod error;
pub mod memory;
pub mod postgres;
pub mod store;
pub mod stores;

pub use error::{Result, StoreError};
pub use memory::{InMemoryIdempotencyGuard, InMemoryInventoryLedger, InMemoryOrderStore};
pub use postgres::{
    PostgresIdempotencyGuard, PostgresInventoryLedger, PostgresOrderStore, run_migrations,
};
pub use store::{
    DEFAULT_IDEMPOTENCY_LEASE, IdempotencyGuard, IdempotencyOutcome, IdempotencyScope,
    InventoryLedger, OrderFilter, OrderStore, StockAdjustment,
};
pub use stores::Stores;
