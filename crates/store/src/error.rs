use common::{OrderId, ProductId, Sku};
use domain::{InventoryError, OrderError, OrderStatus};
use thiserror::Error;

/// Errors that can occur when interacting with the stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No inventory record exists for the product.
    #[error("Product not found: {0}")]
    ProductNotFound(ProductId),

    /// The product exists but has no variant with this sku.
    #[error("Variant not found: {product_id}/{sku}")]
    VariantNotFound { product_id: ProductId, sku: Sku },

    /// A decrement was requested while the variant sits at its threshold.
    #[error("Stock exhausted for {product_id}/{sku}")]
    StockExhausted { product_id: ProductId, sku: Sku },

    /// An increment was requested while the variant sits at its total.
    #[error("Stock at capacity for {product_id}/{sku}")]
    StockAtCapacity { product_id: ProductId, sku: Sku },

    #[error("Order not found: {0}")]
    OrderNotFound(OrderId),

    /// The order changed status since it was read.
    #[error("Concurrency conflict for order {order_id}: expected {expected}, found {actual}")]
    ConcurrencyConflict {
        order_id: OrderId,
        expected: OrderStatus,
        actual: OrderStatus,
    },

    /// Another order already claimed this idempotency key.
    #[error("Duplicate idempotency key: {0}")]
    DuplicateIdempotencyKey(String),

    /// The order is too old to be removed.
    #[error("Order {0} is outside its modification window")]
    OutsideModificationWindow(OrderId),

    /// A domain rule rejected the write.
    #[error("Order error: {0}")]
    Order(#[from] OrderError),

    /// A catalog record failed validation.
    #[error("Inventory error: {0}")]
    Inventory(#[from] InventoryError),

    /// A stored value could not be interpreted.
    #[error("Corrupt record: {0}")]
    Corrupt(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
