use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{OrderId, ProductId, Sku};
use domain::{
    CatalogProduct, InventoryItem, InventoryVariant, Order, OrderStatus, PaymentApplication,
    SyncAction, SyncMode, SyncReport, plan_sync,
};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use crate::{
    Result, StoreError,
    store::{
        IdempotencyGuard, IdempotencyOutcome, IdempotencyScope, InventoryLedger, OrderFilter,
        OrderStore, StockAdjustment, record_adjustment, rejection_error,
    },
};

/// In-memory inventory ledger.
///
/// A single write lock serializes adjustments, which gives the same
/// per-call atomicity as the conditional update in PostgreSQL.
#[derive(Clone, Default)]
pub struct InMemoryInventoryLedger {
    items: Arc<RwLock<BTreeMap<ProductId, InventoryItem>>>,
}

impl InMemoryInventoryLedger {
    /// Creates a new empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a record as-is, after validating it.
    pub async fn put_item(&self, item: InventoryItem) -> Result<()> {
        item.validate()?;
        self.items
            .write()
            .await
            .insert(item.product_id.clone(), item);
        Ok(())
    }

    /// Returns the number of inventory records.
    pub async fn item_count(&self) -> usize {
        self.items.read().await.len()
    }

    async fn adjust(
        &self,
        product_id: &ProductId,
        sku: &Sku,
        delta: i64,
    ) -> Result<StockAdjustment> {
        let mut items = self.items.write().await;
        let item = items
            .get_mut(product_id)
            .ok_or_else(|| StoreError::ProductNotFound(product_id.clone()))?;
        let variant = item
            .variant_mut(sku)
            .ok_or_else(|| StoreError::VariantNotFound {
                product_id: product_id.clone(),
                sku: sku.clone(),
            })?;
        let previous_stock = variant
            .adjust(delta)
            .map_err(|rejection| rejection_error(rejection, product_id, sku))?;

        Ok(StockAdjustment {
            product_id: product_id.clone(),
            variant: variant.clone(),
            previous_stock,
        })
    }
}

#[async_trait]
impl InventoryLedger for InMemoryInventoryLedger {
    async fn adjust_stock(
        &self,
        product_id: &ProductId,
        sku: &Sku,
        delta: i64,
    ) -> Result<StockAdjustment> {
        let result = self.adjust(product_id, sku, delta).await;
        record_adjustment(&result);
        result
    }

    async fn get_item(&self, product_id: &ProductId) -> Result<Option<InventoryItem>> {
        Ok(self.items.read().await.get(product_id).cloned())
    }

    async fn get_variant(
        &self,
        product_id: &ProductId,
        sku: &Sku,
    ) -> Result<Option<InventoryVariant>> {
        let items = self.items.read().await;
        Ok(items
            .get(product_id)
            .and_then(|item| item.variant(sku))
            .cloned())
    }

    async fn list_items(&self) -> Result<Vec<InventoryItem>> {
        Ok(self.items.read().await.values().cloned().collect())
    }

    async fn sync_catalog(
        &self,
        products: Vec<CatalogProduct>,
        mode: SyncMode,
    ) -> Result<SyncReport> {
        let mut items = self.items.write().await;

        // Plan everything first so one bad product leaves the ledger untouched.
        let mut actions = Vec::with_capacity(products.len());
        for product in &products {
            actions.push(plan_sync(items.get(&product.product_id), product, mode)?);
        }

        let mut report = SyncReport::default();
        for action in actions {
            report.record(&action);
            match action {
                SyncAction::Create(item) | SyncAction::Replace(item) => {
                    items.insert(item.product_id.clone(), item);
                }
                SyncAction::Skip => {}
            }
        }
        Ok(report)
    }
}

#[derive(Debug, Clone)]
enum KeyState {
    InFlight { reserved_at: Instant },
    Completed(serde_json::Value),
}

/// In-memory idempotency guard.
#[derive(Clone, Default)]
pub struct InMemoryIdempotencyGuard {
    keys: Arc<Mutex<HashMap<(IdempotencyScope, String), KeyState>>>,
}

impl InMemoryIdempotencyGuard {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdempotencyGuard for InMemoryIdempotencyGuard {
    async fn check_and_reserve(
        &self,
        scope: IdempotencyScope,
        key: &str,
        lease: Duration,
    ) -> Result<IdempotencyOutcome> {
        let mut keys = self.keys.lock().await;
        let now = Instant::now();
        let entry = (scope, key.to_string());
        match keys.get(&entry) {
            Some(KeyState::Completed(result)) => {
                return Ok(IdempotencyOutcome::Completed(result.clone()));
            }
            Some(KeyState::InFlight { reserved_at }) => {
                if now.duration_since(*reserved_at) < lease {
                    return Ok(IdempotencyOutcome::InFlight);
                }
                tracing::warn!(%scope, key, "taking over abandoned idempotency key");
            }
            None => {}
        }
        keys.insert(entry, KeyState::InFlight { reserved_at: now });
        Ok(IdempotencyOutcome::Fresh)
    }

    async fn complete(
        &self,
        scope: IdempotencyScope,
        key: &str,
        result: serde_json::Value,
    ) -> Result<()> {
        self.keys
            .lock()
            .await
            .insert((scope, key.to_string()), KeyState::Completed(result));
        Ok(())
    }

    async fn release(&self, scope: IdempotencyScope, key: &str) -> Result<()> {
        let mut keys = self.keys.lock().await;
        if let Some(KeyState::InFlight { .. }) = keys.get(&(scope, key.to_string())) {
            keys.remove(&(scope, key.to_string()));
        }
        Ok(())
    }
}

/// In-memory order store for tests and database-less runs.
#[derive(Clone, Default)]
pub struct InMemoryOrderStore {
    orders: Arc<RwLock<HashMap<OrderId, Order>>>,
}

impl InMemoryOrderStore {
    /// Creates a new empty order store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of orders stored.
    pub async fn order_count(&self) -> usize {
        self.orders.read().await.len()
    }
}

fn check_expected(order: &Order, expected: OrderStatus) -> Result<()> {
    if order.status != expected {
        return Err(StoreError::ConcurrencyConflict {
            order_id: order.id,
            expected,
            actual: order.status,
        });
    }
    Ok(())
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn create(&self, order: &Order) -> Result<()> {
        let mut orders = self.orders.write().await;
        if let Some(ref key) = order.idempotency_key
            && orders
                .values()
                .any(|o| o.idempotency_key.as_ref() == Some(key))
        {
            return Err(StoreError::DuplicateIdempotencyKey(key.clone()));
        }
        orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: OrderId) -> Result<Option<Order>> {
        Ok(self.orders.read().await.get(&id).cloned())
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Order>> {
        let orders = self.orders.read().await;
        Ok(orders
            .values()
            .find(|o| o.idempotency_key.as_deref() == Some(key))
            .cloned())
    }

    async fn find_by_provider_session(&self, session_id: &str) -> Result<Option<Order>> {
        let orders = self.orders.read().await;
        Ok(orders
            .values()
            .find(|o| {
                o.payment
                    .as_ref()
                    .and_then(|p| p.provider_checkout_session_id.as_deref())
                    == Some(session_id)
            })
            .cloned())
    }

    async fn list(&self, filter: OrderFilter) -> Result<Vec<Order>> {
        let orders = self.orders.read().await;
        let mut matching: Vec<Order> = orders
            .values()
            .filter(|o| filter.matches(o))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            matching.truncate(limit);
        }
        Ok(matching)
    }

    async fn update_status(
        &self,
        id: OrderId,
        expected: OrderStatus,
        next: OrderStatus,
    ) -> Result<Order> {
        let mut orders = self.orders.write().await;
        let order = orders.get_mut(&id).ok_or(StoreError::OrderNotFound(id))?;
        check_expected(order, expected)?;
        order.transition_to(next, Utc::now())?;
        Ok(order.clone())
    }

    async fn apply_payment(
        &self,
        id: OrderId,
        expected: OrderStatus,
        application: PaymentApplication,
    ) -> Result<Order> {
        let mut orders = self.orders.write().await;
        let order = orders.get_mut(&id).ok_or(StoreError::OrderNotFound(id))?;
        check_expected(order, expected)?;

        // Apply to a copy so a rejected application leaves the stored order intact.
        let mut updated = order.clone();
        updated.apply_payment(application, Utc::now())?;
        *order = updated.clone();
        Ok(updated)
    }

    async fn delete(
        &self,
        id: OrderId,
        expected: OrderStatus,
        created_after: DateTime<Utc>,
    ) -> Result<()> {
        let mut orders = self.orders.write().await;
        let order = orders.get(&id).ok_or(StoreError::OrderNotFound(id))?;
        check_expected(order, expected)?;
        if order.created_at < created_after {
            return Err(StoreError::OutsideModificationWindow(id));
        }
        orders.remove(&id);
        Ok(())
    }
}
