use std::sync::Arc;

use sqlx::PgPool;

use crate::memory::{InMemoryIdempotencyGuard, InMemoryInventoryLedger, InMemoryOrderStore};
use crate::postgres::{PostgresIdempotencyGuard, PostgresInventoryLedger, PostgresOrderStore};
use crate::store::{IdempotencyGuard, InventoryLedger, OrderStore};

/// The three stores behind one handle, with the backend chosen at runtime.
#[derive(Clone)]
pub struct Stores {
    pub ledger: Arc<dyn InventoryLedger>,
    pub idempotency: Arc<dyn IdempotencyGuard>,
    pub orders: Arc<dyn OrderStore>,
}

impl Stores {
    pub fn new(
        ledger: impl InventoryLedger + 'static,
        idempotency: impl IdempotencyGuard + 'static,
        orders: impl OrderStore + 'static,
    ) -> Self {
        Self {
            ledger: Arc::new(ledger),
            idempotency: Arc::new(idempotency),
            orders: Arc::new(orders),
        }
    }

    /// Fresh, empty in-memory stores.
    pub fn in_memory() -> Self {
        Self::new(
            InMemoryInventoryLedger::new(),
            InMemoryIdempotencyGuard::new(),
            InMemoryOrderStore::new(),
        )
    }

    /// PostgreSQL stores sharing one pool. Migrations are not run here.
    pub fn postgres(pool: PgPool) -> Self {
        Self::new(
            PostgresInventoryLedger::new(pool.clone()),
            PostgresIdempotencyGuard::new(pool.clone()),
            PostgresOrderStore::new(pool),
        )
    }
}
