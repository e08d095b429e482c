use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{OrderId, ProductId, Sku, UserId};
use domain::{
    CatalogProduct, InventoryItem, InventoryVariant, Order, OrderStatus, PaymentApplication,
    StockRejection, SyncMode, SyncReport,
};
use serde::{Deserialize, Serialize};

use crate::{Result, StoreError};

/// Outcome of a successful stock adjustment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockAdjustment {
    pub product_id: ProductId,
    /// The variant as written.
    pub variant: InventoryVariant,
    /// Stock level before the adjustment.
    pub previous_stock: i64,
}

impl StockAdjustment {
    /// The delta that actually landed after clamping.
    pub fn applied_delta(&self) -> i64 {
        self.variant.current_stock - self.previous_stock
    }
}

/// Maps a refused adjustment to its store error.
pub(crate) fn rejection_error(
    rejection: StockRejection,
    product_id: &ProductId,
    sku: &Sku,
) -> StoreError {
    match rejection {
        StockRejection::Exhausted => StoreError::StockExhausted {
            product_id: product_id.clone(),
            sku: sku.clone(),
        },
        StockRejection::AtCapacity => StoreError::StockAtCapacity {
            product_id: product_id.clone(),
            sku: sku.clone(),
        },
    }
}

/// Counts ledger outcomes by label.
pub(crate) fn record_adjustment<T>(result: &Result<T>) {
    let outcome = match result {
        Ok(_) => "applied",
        Err(StoreError::StockExhausted { .. }) => "exhausted",
        Err(StoreError::StockAtCapacity { .. }) => "at_capacity",
        Err(StoreError::ProductNotFound(_) | StoreError::VariantNotFound { .. }) => "not_found",
        Err(_) => "error",
    };
    metrics::counter!("stock_adjustments_total", "outcome" => outcome).increment(1);
}

/// Per-variant stock counters.
///
/// `adjust_stock` is the only way live stock changes. Each call is one atomic
/// conditional update, so concurrent callers on the same sku never lose writes.
#[async_trait]
pub trait InventoryLedger: Send + Sync {
    /// Applies `delta` to the variant's current stock.
    ///
    /// Fails with `StockExhausted` when decrementing at the threshold and
    /// `StockAtCapacity` when incrementing at the total. Otherwise the result
    /// is clamped into `[stock_threshold, total_stock]`.
    async fn adjust_stock(
        &self,
        product_id: &ProductId,
        sku: &Sku,
        delta: i64,
    ) -> Result<StockAdjustment>;

    async fn get_item(&self, product_id: &ProductId) -> Result<Option<InventoryItem>>;

    async fn get_variant(
        &self,
        product_id: &ProductId,
        sku: &Sku,
    ) -> Result<Option<InventoryVariant>>;

    /// All inventory records, ordered by product id.
    async fn list_items(&self) -> Result<Vec<InventoryItem>>;

    /// Merges catalog products into the inventory.
    async fn sync_catalog(&self, products: Vec<CatalogProduct>, mode: SyncMode)
    -> Result<SyncReport>;
}

/// Namespace of an idempotency key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdempotencyScope {
    OrderCreation,
    PaymentEvent,
}

impl IdempotencyScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdempotencyScope::OrderCreation => "order_creation",
            IdempotencyScope::PaymentEvent => "payment_event",
        }
    }
}

impl std::fmt::Display for IdempotencyScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How long an unfinished reservation blocks other callers by default.
pub const DEFAULT_IDEMPOTENCY_LEASE: Duration = Duration::from_secs(300);

/// Result of [`IdempotencyGuard::check_and_reserve`].
#[derive(Debug, Clone, PartialEq)]
pub enum IdempotencyOutcome {
    /// The key was not known and is now reserved by the caller.
    Fresh,
    /// Another caller reserved the key and has not finished yet.
    InFlight,
    /// The operation already ran; this is the result it recorded.
    Completed(serde_json::Value),
}

/// Insert-if-absent deduplication of externally keyed operations.
#[async_trait]
pub trait IdempotencyGuard: Send + Sync {
    /// Atomically reserves `key`, or reports what happened to it before.
    ///
    /// An in-flight reservation older than `lease` is treated as abandoned
    /// and handed to this caller as `Fresh`.
    async fn check_and_reserve(
        &self,
        scope: IdempotencyScope,
        key: &str,
        lease: Duration,
    ) -> Result<IdempotencyOutcome>;

    /// Attaches the result to a reserved key.
    async fn complete(
        &self,
        scope: IdempotencyScope,
        key: &str,
        result: serde_json::Value,
    ) -> Result<()>;

    /// Drops an in-flight reservation so a retry can run again.
    async fn release(&self, scope: IdempotencyScope, key: &str) -> Result<()>;
}

/// Selection for order listings.
#[derive(Debug, Clone, Default)]
pub struct OrderFilter {
    pub user_id: Option<UserId>,
    pub status: Option<OrderStatus>,
    pub limit: Option<usize>,
}

impl OrderFilter {
    pub fn for_user(user_id: UserId) -> Self {
        Self {
            user_id: Some(user_id),
            ..Self::default()
        }
    }

    pub(crate) fn matches(&self, order: &Order) -> bool {
        if let Some(ref user_id) = self.user_id
            && !order.is_owned_by(user_id)
        {
            return false;
        }
        if let Some(status) = self.status
            && order.status != status
        {
            return false;
        }
        true
    }
}

/// Durable storage of order aggregates.
///
/// Every write touching status is compare-and-set against the status the
/// caller last observed.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Persists a new order. Fails with `DuplicateIdempotencyKey` when another
    /// order already carries the same key.
    async fn create(&self, order: &Order) -> Result<()>;

    async fn find_by_id(&self, id: OrderId) -> Result<Option<Order>>;

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Order>>;

    /// Finds the order whose payment belongs to this provider checkout session.
    async fn find_by_provider_session(&self, session_id: &str) -> Result<Option<Order>>;

    /// Orders matching `filter`, newest first.
    async fn list(&self, filter: OrderFilter) -> Result<Vec<Order>>;

    /// Moves the order from `expected` to `next`.
    async fn update_status(
        &self,
        id: OrderId,
        expected: OrderStatus,
        next: OrderStatus,
    ) -> Result<Order>;

    /// Writes status, payment, one audit entry, total and currency together.
    async fn apply_payment(
        &self,
        id: OrderId,
        expected: OrderStatus,
        application: PaymentApplication,
    ) -> Result<Order>;

    /// Removes the order if it is still in `expected` status and was created
    /// at or after `created_after`.
    async fn delete(
        &self,
        id: OrderId,
        expected: OrderStatus,
        created_after: DateTime<Utc>,
    ) -> Result<()>;
}
