//! Domain layer for the storefront order engine.
//!
//! This crate provides the core domain model:
//! - Order aggregate with its status state machine and payment audit trail
//! - Inventory variants and the bounded stock adjustment rule
//! - Catalog resync planning
//! - Money in minor units

pub mod inventory;
pub mod money;
pub mod order;

pub use inventory::{
    CatalogProduct, CatalogVariant, InventoryError, InventoryItem, InventoryVariant,
    StockRejection, SyncAction, SyncMode, SyncReport, plan_sync,
};
pub use money::Money;
pub use order::{
    CustomerInfo, CustomerRef, MODIFICATION_WINDOW_DAYS, NewOrder, Order, OrderError, OrderItem,
    OrderStatus, Payment, PaymentApplication, PaymentHistoryEntry, PaymentMethod, PaymentProof,
    PaymentProvider, PaymentStatus, PersonName, ShippingAddress, generate_guest_id,
    modification_window, order_total,
};
